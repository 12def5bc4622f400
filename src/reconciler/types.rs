//! Reconciler configuration and state

use crate::acl::CompareReport;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What a cycle is allowed to change on devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Compare only, never write to a device
    #[default]
    Monitor,
    /// Push clock, door and ACL corrections
    Synchronize,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Monitor => f.write_str("monitor"),
            RunMode::Synchronize => f.write_str("synchronize"),
        }
    }
}

impl FromStr for RunMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "monitor" | "compare" => Ok(RunMode::Monitor),
            "synchronize" | "synchronise" | "sync" => Ok(RunMode::Synchronize),
            other => Err(Error::Config(format!("unknown run mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub mode: RunMode,
    /// Tick period
    pub interval: Duration,
    /// How long soft-deleted entities are kept
    pub retention: chrono::Duration,
    /// Interior holes fetched per device (-1 = all)
    pub gap_depth: i32,
    /// Events fetched per device per cycle
    pub event_batch: usize,
    /// Concurrent device tasks per step
    pub concurrency: usize,
    /// Tolerated device clock drift
    pub clock_skew: chrono::Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Monitor,
            interval: Duration::from_secs(30),
            retention: chrono::Duration::hours(24),
            gap_depth: -1,
            event_batch: 64,
            concurrency: 8,
            clock_skew: chrono::Duration::seconds(60),
        }
    }
}

/// Outcome of one cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Devices found by discovery
    pub discovered: usize,
    /// Reachable devices without a controller entity
    pub unconfigured: Vec<u32>,
    pub refreshed: usize,
    pub refresh_failed: usize,
    pub events_recorded: usize,
    pub events_missing: usize,
    pub swept: usize,
    /// Cards whose rule evaluation failed
    pub rule_failures: usize,
    pub acl_out_of_sync: usize,
    pub clocks_set: usize,
    pub doors_set: usize,
    pub cards_pushed: usize,
    /// Step failures (the cycle carries on past them)
    pub errors: Vec<String>,
}

/// Reconciler status as exposed over the API
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcilerState {
    pub mode: RunMode,
    /// Loop started and not stopped
    pub running: bool,
    /// A cycle is executing right now
    pub cycle_running: bool,
    pub cycles: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_report: Option<CycleReport>,
    /// Most recent ACL comparison
    pub last_compare: Option<CompareReport>,
    /// Cycles in a row with at least one step error
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_mode_from_str() {
        assert_eq!("monitor".parse::<RunMode>().unwrap(), RunMode::Monitor);
        assert_eq!("Synchronize".parse::<RunMode>().unwrap(), RunMode::Synchronize);
        assert_eq!(" sync ".parse::<RunMode>().unwrap(), RunMode::Synchronize);
        assert!(matches!("push".parse::<RunMode>(), Err(Error::Config(_))));
    }
}
