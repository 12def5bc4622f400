//! Field suffixes below an instance OID

pub const CREATED: &str = ".0.1";
pub const DELETED: &str = ".0.2";

pub mod interface {
    pub const NAME: &str = ".1";
    pub const BIND: &str = ".2";
    pub const BROADCAST: &str = ".3";
    pub const LISTEN: &str = ".4";
}

pub mod controller {
    pub const NAME: &str = ".1";
    pub const DEVICE_ID: &str = ".2";
    pub const ENDPOINT: &str = ".3";
    pub const TIMEZONE: &str = ".4";
    /// Door slots 1..4 live at `.5.1` .. `.5.4`
    pub const DOORS: &str = ".5";

    pub fn door(slot: u8) -> String {
        format!("{}.{}", DOORS, slot)
    }
}

pub mod door {
    pub const NAME: &str = ".1";
    pub const DELAY: &str = ".2";
    pub const MODE: &str = ".3";
}

pub mod card {
    pub const NAME: &str = ".1";
    pub const NUMBER: &str = ".2";
    pub const FROM: &str = ".3";
    pub const TO: &str = ".4";
    /// Group membership: `.5.<group oid>`
    pub const GROUPS: &str = ".5";
}

pub mod group {
    pub const NAME: &str = ".1";
    /// Door membership: `.2.<door oid>`
    pub const DOORS: &str = ".2";
}

pub mod event {
    pub const DEVICE_ID: &str = ".1";
    pub const INDEX: &str = ".2";
}
