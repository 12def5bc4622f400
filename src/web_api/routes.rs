//! API Routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;

use super::with_deadline;
use crate::auth::EntityKind;
use crate::catalog::Oid;
use crate::controllers::{door_liveness, Liveness};
use crate::error::Result;
use crate::models::{
    ApiResponse, CardView, ControllerList, ControllerView, CreatedResponse, DoorView, ListQuery, UpdateRequest,
};
use crate::state::AppState;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/healthz", get(super::health_check))
        .route("/api/status", get(reconciler_status))
        // Entities
        .route("/api/controllers", get(list_controllers))
        .route("/api/doors", get(list_doors))
        .route("/api/cards", get(list_cards))
        .route("/api/groups", get(list_groups))
        .route("/api/interfaces", get(list_interfaces))
        .route("/api/events", get(list_events))
        .route("/api/logs", get(list_logs))
        // Object edits (`:target` is an entity kind for POST, an OID for DELETE)
        .route("/api/objects/:target", post(add_object).delete(delete_object))
        .route("/api/objects", put(update_object))
        // ACL
        .route("/api/acl/compare", get(compare_acl))
        .route("/api/acl/synchronize", post(synchronize_acl))
        .with_state(state)
}

// ========================================
// Status
// ========================================

async fn reconciler_status(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let status = with_deadline(state.config.api_timeout(), "reconciler status", async {
        Ok(state.reconciler.state().await)
    })
    .await?;
    Ok(Json(ApiResponse::success(status)))
}

// ========================================
// Entity listings
// ========================================

async fn list_controllers(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.system.authorize_view(state.auth.as_ref(), EntityKind::Controller)?;

    let list = with_deadline(state.config.api_timeout(), "list controllers", async {
        let view = state.system.view().await;
        let tracker = &state.system.status;

        let mut controllers = Vec::new();
        for controller in view.state.controllers.list() {
            let (liveness, status) = match controller.device_id {
                0 => (Liveness::Unknown, None),
                id => (tracker.liveness(id, true).await, tracker.get(id).await),
            };
            controllers.push(ControllerView {
                controller: controller.clone(),
                liveness,
                status,
            });
        }

        let unconfigured = tracker
            .device_ids()
            .await
            .into_iter()
            .filter(|id| view.state.controllers.find_by_device(*id).is_none())
            .collect();

        Ok(ControllerList {
            controllers,
            unconfigured,
        })
    })
    .await?;

    Ok(Json(ApiResponse::success(list)))
}

async fn list_doors(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.system.authorize_view(state.auth.as_ref(), EntityKind::Door)?;

    let doors = with_deadline(state.config.api_timeout(), "list doors", async {
        let view = state.system.view().await;
        let tracker = &state.system.status;

        let mut doors = Vec::new();
        for door in view.state.doors.list() {
            let owner = view
                .state
                .controllers
                .find_door(&door.oid)
                .filter(|(controller, _)| controller.device_id != 0)
                .map(|(controller, slot)| (controller.device_id, slot));

            let liveness = match owner {
                None => Liveness::Unknown,
                Some((device_id, slot)) => {
                    let controller = tracker.liveness(device_id, true).await;
                    let record = tracker.get(device_id).await;
                    let current = record.map(|r| r.doors[usize::from(slot - 1)]);
                    door_liveness(controller, current.as_ref(), door)
                }
            };

            doors.push(DoorView {
                door: door.clone(),
                liveness,
                device_id: owner.map(|(id, _)| id),
                slot: owner.map(|(_, slot)| slot),
            });
        }
        Ok(doors)
    })
    .await?;

    Ok(Json(ApiResponse::success(doors)))
}

async fn list_cards(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.system.authorize_view(state.auth.as_ref(), EntityKind::Card)?;

    let cards = with_deadline(state.config.api_timeout(), "list cards", async {
        let view = state.system.view().await;
        let statuses = state.system.sync_statuses().await;

        Ok(view
            .state
            .cards
            .list()
            .map(|card| CardView {
                card: card.clone(),
                sync_status: statuses.get(&card.number).copied(),
            })
            .collect::<Vec<_>>())
    })
    .await?;

    Ok(Json(ApiResponse::success(cards)))
}

async fn list_groups(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.system.authorize_view(state.auth.as_ref(), EntityKind::Group)?;

    let view = with_deadline(state.config.api_timeout(), "list groups", async { Ok(state.system.view().await) }).await?;
    let groups: Vec<_> = view.state.groups.list().cloned().collect();
    Ok(Json(ApiResponse::success(groups)))
}

async fn list_interfaces(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.system.authorize_view(state.auth.as_ref(), EntityKind::Interface)?;

    let view = with_deadline(state.config.api_timeout(), "list interfaces", async {
        Ok(state.system.view().await)
    })
    .await?;
    let interfaces: Vec<_> = view.state.interfaces.list().cloned().collect();
    Ok(Json(ApiResponse::success(interfaces)))
}

async fn list_events(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Result<impl IntoResponse> {
    state.system.authorize_view(state.auth.as_ref(), EntityKind::Event)?;

    let view = with_deadline(state.config.api_timeout(), "list events", async { Ok(state.system.view().await) }).await?;
    let events: Vec<_> = view
        .state
        .events
        .list(query.device, query.limit())
        .into_iter()
        .cloned()
        .collect();
    Ok(Json(ApiResponse::success(events)))
}

async fn list_logs(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Result<impl IntoResponse> {
    state.system.authorize_view(state.auth.as_ref(), EntityKind::Log)?;

    let view = with_deadline(state.config.api_timeout(), "list logs", async { Ok(state.system.view().await) }).await?;
    let logs: Vec<_> = view.state.logs.list(query.limit()).into_iter().cloned().collect();
    Ok(Json(ApiResponse::success(logs)))
}

// ========================================
// Object edits
// ========================================

async fn add_object(State(state): State<AppState>, Path(kind): Path<String>) -> Result<impl IntoResponse> {
    let kind: EntityKind = kind.parse()?;
    let oid = state.system.add(state.auth.as_ref(), kind).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(CreatedResponse { oid }))))
}

async fn update_object(State(state): State<AppState>, Json(req): Json<UpdateRequest>) -> Result<impl IntoResponse> {
    state.system.update(state.auth.as_ref(), &req.oid, &req.value).await?;
    Ok(Json(ApiResponse::success(json!({ "oid": req.oid, "value": req.value }))))
}

async fn delete_object(State(state): State<AppState>, Path(oid): Path<String>) -> Result<impl IntoResponse> {
    let oid: Oid = oid.parse()?;
    state.system.delete(state.auth.as_ref(), &oid).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ========================================
// ACL
// ========================================

async fn compare_acl(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.system.authorize_view(state.auth.as_ref(), EntityKind::Card)?;

    let report = with_deadline(state.config.api_timeout(), "acl compare", async {
        Ok(state.reconciler.compare().await)
    })
    .await?;
    Ok(Json(ApiResponse::success(report)))
}

async fn synchronize_acl(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.reconciler.schedule_sync()?;
    tracing::info!(uid = state.auth.uid(), "ACL synchronization queued");
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(json!({ "queued": true })))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAll, Authorizer, Policy};
    use crate::catalog::fields;
    use crate::device_gateway::{Fleet, MemoryGateway, SimDevice};
    use crate::error::Error;
    use crate::reconciler::{Reconciler, ReconcilerConfig};
    use crate::rules::NoRules;
    use crate::state::AppConfig;
    use crate::system::System;
    use crate::task_queue::TaskQueue;
    use std::sync::Arc;
    use std::time::Instant;

    async fn app(auth: Arc<dyn Authorizer>) -> AppState {
        let system = Arc::new(System::new(None));
        let fleet = Arc::new(Fleet::new(1000));
        let gateway = Arc::new(MemoryGateway::with_devices([SimDevice::new(405419896)]));
        fleet.add_link(Oid::new("0.1.1"), gateway).await;
        let (queue, _worker) = TaskQueue::new(4);
        let reconciler = Arc::new(Reconciler::new(
            system.clone(),
            fleet.clone(),
            Arc::new(NoRules),
            queue,
            ReconcilerConfig::default(),
        ));

        AppState {
            config: AppConfig::default(),
            system,
            fleet,
            reconciler,
            auth,
            started_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_add_update_delete_round() {
        let state = app(Arc::new(AllowAll::new("api"))).await;

        let response = add_object(State(state.clone()), Path("doors".into()))
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);

        let door = state.system.view().await.state.doors.list().next().unwrap().oid.clone();
        update_object(
            State(state.clone()),
            Json(UpdateRequest {
                oid: door.append(fields::door::NAME),
                value: "Great Hall".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(state.system.view().await.state.doors.get(&door).unwrap().name, "Great Hall");

        let response = delete_object(State(state.clone()), Path(door.to_string()))
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(state.system.view().await.state.doors.list().count(), 0);
    }

    #[tokio::test]
    async fn test_read_only_caller_cannot_add() {
        let state = app(Arc::new(Policy::read_only("guest"))).await;
        let err = add_object(State(state.clone()), Path("cards".into())).await.err().unwrap();
        assert!(matches!(err, Error::Unauthorized(_)));
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);

        assert!(list_cards(State(state)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_kind_is_bad_request() {
        let state = app(Arc::new(AllowAll::new("api"))).await;
        let err = add_object(State(state), Path("users".into())).await.err().unwrap();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_synchronize_is_accepted() {
        let state = app(Arc::new(AllowAll::new("api"))).await;
        let response = synchronize_acl(State(state)).await.unwrap().into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_compare_runs_under_deadline() {
        let state = app(Arc::new(AllowAll::new("api"))).await;
        let auth = AllowAll::system();
        let controller = state.system.add(&auth, EntityKind::Controller).await.unwrap();
        state
            .system
            .update(&auth, &controller.append(fields::controller::DEVICE_ID), "405419896")
            .await
            .unwrap();

        let response = compare_acl(State(state.clone())).await.unwrap().into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.reconciler.state().await.last_compare.is_some());
    }
}
