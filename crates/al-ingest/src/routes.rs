//! Axum router and handlers for al-ingest.
//!
//! `build_router` is the single entry point; `main.rs` attaches middleware
//! layers after calling it so tests can exercise the bare router.

use std::sync::Arc;

use al_schemas::RawEvent;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::{error, warn};

use crate::{
    api_types::{EventBody, EventError, HealthResponse, IngestRequest, IngestResponse, ReadyResponse},
    state::AppState,
};

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/events", post(ingest_events))
        .with_state(state)
}

pub(crate) async fn healthz(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

pub(crate) async fn readyz(State(st): State<Arc<AppState>>) -> Response {
    match sqlx::query("select 1").execute(&st.pool).await {
        Ok(_) => (StatusCode::OK, Json(ReadyResponse { ok: true })).into_response(),
        Err(e) => {
            warn!(error = %e, "readyz: database not reachable");
            (StatusCode::SERVICE_UNAVAILABLE, Json(ReadyResponse { ok: false })).into_response()
        }
    }
}

/// `POST /events`: validate the whole batch before any insert, then
/// insert-if-absent each event inside one transaction, capturing per-event
/// driver errors without aborting the others.
pub(crate) async fn ingest_events(State(st): State<Arc<AppState>>, Json(body): Json<IngestRequest>) -> Response {
    if body.events.is_empty() || body.events.len() > al_schemas::MAX_BATCH_EVENTS {
        return (
            StatusCode::BAD_REQUEST,
            Json(IngestResponse::rejected(vec![EventError {
                index: 0,
                event_id: None,
                message: format!(
                    "batch size must be between 1 and {}, got {}",
                    al_schemas::MAX_BATCH_EVENTS,
                    body.events.len()
                ),
            }])),
        )
            .into_response();
    }

    let mut typed = Vec::with_capacity(body.events.len());
    let mut validation_errors = Vec::new();
    for (index, ev) in body.events.into_iter().enumerate() {
        let event_id = ev.event_id.clone();
        match to_raw_event(ev).into_typed() {
            Ok(t) => typed.push(t),
            Err(e) => validation_errors.push(EventError {
                index,
                event_id: Some(event_id).filter(|s| !s.is_empty()),
                message: e.to_string(),
            }),
        }
    }

    if !validation_errors.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(IngestResponse::rejected(validation_errors))).into_response();
    }

    let mut tx = match st.pool.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            error!(error = %e, "ingest: failed to open transaction");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(IngestResponse::rejected(vec![EventError {
                    index: 0,
                    event_id: None,
                    message: "failed to open database transaction".to_string(),
                }])),
            )
                .into_response();
        }
    };

    let mut accepted_ids = Vec::with_capacity(typed.len());
    let mut insert_errors = Vec::new();

    for (index, ev) in typed.iter().enumerate() {
        let mut savepoint = match tx.begin().await {
            Ok(sp) => sp,
            Err(e) => {
                error!(error = %e, event_id = %ev.event_id, "ingest: failed to open savepoint");
                return rollback_and_fail(tx).await;
            }
        };

        match al_db::raw::insert_event(&mut savepoint, ev).await {
            Ok(_) => {
                if let Err(e) = savepoint.commit().await {
                    error!(error = %e, event_id = %ev.event_id, "ingest: failed to release savepoint");
                    insert_errors.push(EventError {
                        index,
                        event_id: Some(ev.event_id.clone()),
                        message: "failed to persist event".to_string(),
                    });
                    continue;
                }
                accepted_ids.push(ev.event_id.clone());
            }
            Err(e) => {
                savepoint.rollback().await.ok();
                warn!(error = %e, event_id = %ev.event_id, "ingest: per-event insert failed");
                insert_errors.push(EventError {
                    index,
                    event_id: Some(ev.event_id.clone()),
                    message: "failed to persist event".to_string(),
                });
            }
        }
    }

    if let Err(e) = tx.commit().await {
        error!(error = %e, "ingest: transaction commit failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(IngestResponse::rejected(vec![EventError {
                index: 0,
                event_id: None,
                message: "transaction commit failed".to_string(),
            }])),
        )
            .into_response();
    }

    let errors = if insert_errors.is_empty() { None } else { Some(insert_errors) };
    (
        StatusCode::OK,
        Json(IngestResponse {
            accepted: accepted_ids.len(),
            event_ids: accepted_ids,
            errors,
        }),
    )
        .into_response()
}

async fn rollback_and_fail(tx: sqlx::Transaction<'_, sqlx::Postgres>) -> Response {
    tx.rollback().await.ok();
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(IngestResponse::rejected(vec![EventError {
            index: 0,
            event_id: None,
            message: "transaction failed".to_string(),
        }])),
    )
        .into_response()
}

fn to_raw_event(ev: EventBody) -> RawEvent {
    RawEvent {
        event_id: ev.event_id,
        org_id: ev.org_id,
        occurred_at: ev.occurred_at,
        event_type: ev.event_type,
        session_id: ev.session_id,
        user_id: ev.user_id,
        run_id: ev.run_id,
        payload: ev.payload,
    }
}
