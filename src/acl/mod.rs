//! ACL - permission builder, diff and device synchronization
//!
//! ## Flow
//!
//! 1. `builder::build` computes what every controller should hold
//! 2. `sync::compare` reads what controllers do hold and diffs the two
//! 3. `sync::synchronize` pushes corrections and verifies them
//!
//! The builder and diff never touch entity storage; pushes only change
//! device state.

pub mod builder;
pub mod diff;
pub mod sync;
mod types;

pub use builder::{build, BuildResult, RuleFailure};
pub use diff::{CompareReport, DeviceDiff, DiffTotals};
pub use sync::{DevicePush, SyncReport};
pub use types::*;
