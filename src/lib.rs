//! Doorkeeper Library
//!
//! Access-control backend that keeps networked door controllers in step
//! with the cards, groups and doors an operator manages.
//!
//! ## Architecture
//!
//! 1. Catalog - OID-addressed identity and attribute store
//! 2. Entity stores - interfaces, controllers, doors, cards, groups, events, logs
//! 3. System - context object with clone-mutate-validate-commit writes
//! 4. DeviceGateway - controller I/O capability, per-device exclusion
//! 5. ACL - permission builder, diff and synchronization
//! 6. EventGaps - missing event interval detection
//! 7. TaskQ - sequential task runner
//! 8. Reconciler - periodic discovery, refresh, catch-up and resync
//! 9. WebAPI - REST API endpoints

pub mod acl;
pub mod auth;
pub mod cards;
pub mod catalog;
pub mod controllers;
pub mod device_gateway;
pub mod doors;
pub mod error;
pub mod event_gaps;
pub mod events;
pub mod groups;
pub mod interfaces;
pub mod logs;
pub mod models;
pub mod reconciler;
pub mod rules;
pub mod state;
pub mod system;
pub mod task_queue;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
