//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - Entity listing with runtime status
//! - Object add / update / delete through the system
//! - ACL compare and on-demand synchronization
//!
//! Reads run under the configured deadline. A read that misses it returns
//! `Error::Timeout` and leaves background work alone.

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let view = state.system.view().await;

    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: state.started_at.elapsed().as_secs(),
        controllers: view.state.controllers.list().count(),
        links: state.fleet.link_count().await,
    };

    Json(response)
}

/// Runs a request-scoped read under a deadline
pub async fn with_deadline<T>(deadline: Duration, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(request = what, deadline_ms = deadline.as_millis() as u64, "Request deadline exceeded");
            Err(Error::Timeout(format!("{} exceeded {} ms", what, deadline.as_millis())))
        }
    }
}
