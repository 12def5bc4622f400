//! Application state
//!
//! Holds all shared components and the environment configuration

use crate::auth::Authorizer;
use crate::device_gateway::{Fleet, DEFAULT_WAIT_TIMEOUT_MS};
use crate::error::{Error, Result};
use crate::reconciler::{Reconciler, ReconcilerConfig, RunMode};
use crate::system::System;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// JSON store directory
    pub data_dir: PathBuf,
    pub run_mode: RunMode,
    pub reconcile_interval_secs: u64,
    /// Soft-delete retention
    pub retention_hours: i64,
    /// Interior event holes fetched per device (-1 = all)
    pub event_gap_depth: i32,
    pub event_batch: usize,
    pub device_concurrency: usize,
    pub device_lock_timeout_ms: u64,
    pub clock_skew_secs: i64,
    /// Catalog compaction bound (-1 = always grow)
    pub compaction_limit: i64,
    pub task_queue_capacity: usize,
    /// Deadline for request-scoped reads
    pub api_timeout_ms: u64,
    /// Simulated fleet description
    pub fleet_file: Option<PathBuf>,
    /// Static rules
    pub rules_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            data_dir: PathBuf::from("/var/lib/doorkeeper"),
            run_mode: RunMode::Monitor,
            reconcile_interval_secs: 30,
            retention_hours: 24,
            event_gap_depth: -1,
            event_batch: 64,
            device_concurrency: 8,
            device_lock_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            clock_skew_secs: 60,
            compaction_limit: -1,
            task_queue_capacity: 16,
            api_timeout_ms: 5000,
            fleet_file: None,
            rules_file: None,
        }
    }
}

impl AppConfig {
    /// Reads the environment on top of the defaults. An unparsable value is
    /// a configuration error rather than a silent fallback.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse(&lookup, "PORT", defaults.port)?,
            data_dir: lookup("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            run_mode: parse(&lookup, "RUN_MODE", defaults.run_mode)?,
            reconcile_interval_secs: parse(&lookup, "RECONCILE_INTERVAL_SECS", defaults.reconcile_interval_secs)?,
            retention_hours: parse(&lookup, "RETENTION_HOURS", defaults.retention_hours)?,
            event_gap_depth: parse(&lookup, "EVENT_GAP_DEPTH", defaults.event_gap_depth)?,
            event_batch: parse(&lookup, "EVENT_BATCH", defaults.event_batch)?,
            device_concurrency: parse(&lookup, "DEVICE_CONCURRENCY", defaults.device_concurrency)?,
            device_lock_timeout_ms: parse(&lookup, "DEVICE_LOCK_TIMEOUT_MS", defaults.device_lock_timeout_ms)?,
            clock_skew_secs: parse(&lookup, "CLOCK_SKEW_SECS", defaults.clock_skew_secs)?,
            compaction_limit: parse(&lookup, "COMPACTION_LIMIT", defaults.compaction_limit)?,
            task_queue_capacity: parse(&lookup, "TASK_QUEUE_CAPACITY", defaults.task_queue_capacity)?,
            api_timeout_ms: parse(&lookup, "API_TIMEOUT_MS", defaults.api_timeout_ms)?,
            fleet_file: lookup("FLEET_FILE").filter(|s| !s.is_empty()).map(PathBuf::from),
            rules_file: lookup("RULES_FILE").filter(|s| !s.is_empty()).map(PathBuf::from),
        })
    }

    /// Catalog compaction bound, `None` when allocation always grows
    pub fn compaction(&self) -> Option<u32> {
        u32::try_from(self.compaction_limit).ok()
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            mode: self.run_mode,
            interval: Duration::from_secs(self.reconcile_interval_secs.max(1)),
            retention: chrono::Duration::hours(self.retention_hours),
            gap_depth: self.event_gap_depth,
            event_batch: self.event_batch,
            concurrency: self.device_concurrency.max(1),
            clock_skew: chrono::Duration::seconds(self.clock_skew_secs),
        }
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid {} '{}'", key, raw))),
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// Catalog, stores and runtime status
    pub system: Arc<System>,
    /// Device links
    pub fleet: Arc<Fleet>,
    pub reconciler: Arc<Reconciler>,
    /// Identity API requests act as
    pub auth: Arc<dyn Authorizer>,
    pub started_at: Instant,
}
