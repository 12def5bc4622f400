//! Reconciler - periodic discovery, refresh, event catch-up and ACL sync
//!
//! ## Responsibilities
//!
//! - Enqueue one reconciliation cycle per tick on the TaskQ
//! - Discover devices, refresh controller status, fetch missing events
//! - Sweep expired soft-deleted entities
//! - Compare the computed ACL with the devices
//! - In synchronize mode, correct clocks, door settings and card tables
//!
//! A tick never waits for the previous cycle. The queue runs cycles one
//! after another, so a slow cycle only delays the next one.

pub mod fanout;
mod steps;
mod types;

pub use types::{CycleReport, ReconcilerConfig, ReconcilerState, RunMode};

use crate::acl::{CompareReport, SyncReport};
use crate::device_gateway::Fleet;
use crate::error::Result;
use crate::rules::Rules;
use crate::system::System;
use crate::task_queue::TaskQueue;
use chrono::Utc;
use std::sync::Arc;
use steps::Context;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};

/// Reconciler instance
pub struct Reconciler {
    ctx: Context,
    queue: TaskQueue,
    state: RwLock<ReconcilerState>,
    running: RwLock<bool>,
}

impl Reconciler {
    pub fn new(
        system: Arc<System>,
        fleet: Arc<Fleet>,
        rules: Arc<dyn Rules>,
        queue: TaskQueue,
        config: ReconcilerConfig,
    ) -> Self {
        let state = ReconcilerState {
            mode: config.mode,
            ..Default::default()
        };

        Self {
            ctx: Context {
                system,
                fleet,
                rules,
                config,
            },
            queue,
            state: RwLock::new(state),
            running: RwLock::new(false),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.ctx.config
    }

    /// Start the tick loop
    pub async fn start(self: &Arc<Self>) {
        {
            let mut running = self.running.write().await;
            if *running {
                tracing::warn!("Reconciler already running");
                return;
            }
            *running = true;
        }
        self.state.write().await.running = true;

        tracing::info!(
            mode = %self.ctx.config.mode,
            interval_secs = self.ctx.config.interval.as_secs(),
            "Starting reconciler"
        );

        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(this.ctx.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                if !*this.running.read().await {
                    break;
                }

                if let Err(e) = this.schedule_cycle() {
                    tracing::warn!(error = %e, "Reconciliation cycle not scheduled");
                }
            }

            tracing::info!("Reconciler stopped");
        });
    }

    /// Stop the tick loop. A cycle already queued still runs.
    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.state.write().await.running = false;
        tracing::info!("Stopping reconciler");
    }

    /// Enqueues one cycle without waiting for it
    pub fn schedule_cycle(self: &Arc<Self>) -> Result<()> {
        let this = self.clone();
        self.queue.submit("reconcile", async move {
            this.run_cycle().await;
        })
    }

    /// Enqueues an ACL push regardless of run mode
    pub fn schedule_sync(self: &Arc<Self>) -> Result<()> {
        let this = self.clone();
        self.queue.submit("acl-sync", async move {
            this.synchronize_acl().await;
        })
    }

    /// Runs one full cycle. Callers outside the queue must not overlap it
    /// with a queued cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let ctx = &self.ctx;
        let mut report = CycleReport {
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        self.state.write().await.cycle_running = true;

        steps::discover(ctx, &mut report).await;

        let view = ctx.system.view().await;
        steps::refresh(ctx, &view, &mut report).await;
        steps::fetch_events(ctx, &view, &mut report).await;
        steps::sweep(ctx, &mut report).await;

        // sweep may have removed entities, build from the latest commit
        let view = ctx.system.view().await;
        let (acl, compared) = steps::compare(ctx, &view, &mut report).await;

        if ctx.config.mode == RunMode::Synchronize {
            report.clocks_set = steps::set_clocks(ctx, &view).await;
            report.doors_set = steps::set_doors(ctx, &view).await;
            steps::push_acl(ctx, &acl, &compared, &mut report).await;
        }

        report.finished_at = Some(Utc::now());
        tracing::info!(
            discovered = report.discovered,
            refreshed = report.refreshed,
            refresh_failed = report.refresh_failed,
            events = report.events_recorded,
            swept = report.swept,
            out_of_sync = report.acl_out_of_sync,
            pushed = report.cards_pushed,
            "Reconciliation cycle finished"
        );

        self.finish(report.clone(), compared).await;
        report
    }

    /// Builds, compares and pushes the ACL
    pub async fn synchronize_acl(&self) -> SyncReport {
        let ctx = &self.ctx;
        let mut report = CycleReport::default();

        let view = ctx.system.view().await;
        let (acl, compared) = steps::compare(ctx, &view, &mut report).await;
        let synced = steps::push_acl(ctx, &acl, &compared, &mut report).await;

        self.state.write().await.last_compare = Some(compared);
        synced
    }

    /// Compare-only run, does not touch any device state
    pub async fn compare(&self) -> CompareReport {
        let view = self.ctx.system.view().await;
        let mut report = CycleReport::default();
        let (_, compared) = steps::compare(&self.ctx, &view, &mut report).await;
        self.state.write().await.last_compare = Some(compared.clone());
        compared
    }

    pub async fn state(&self) -> ReconcilerState {
        self.state.read().await.clone()
    }

    async fn finish(&self, report: CycleReport, compared: CompareReport) {
        let mut state = self.state.write().await;
        state.cycle_running = false;
        state.cycles += 1;
        state.last_run = report.finished_at;

        if report.errors.is_empty() {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
            state.last_error = report.errors.last().cloned();
        }

        state.last_compare = Some(compared);
        state.last_report = Some(report);
    }
}
