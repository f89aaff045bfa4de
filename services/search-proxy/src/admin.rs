//! Admin API for key management
//!
//! Runs on a separate listener (default 127.0.0.1:9090) and is never exposed
//! next to the public search endpoint.
//!
//! Endpoints:
//! - GET  /admin/keys  : list keys without secrets
//! - POST /admin/keys  : add a key `{kind, secret, fresh}` at its tier quota
//! - POST /admin/sweep : run the reactivation sweep, return the count
//! - GET  /admin/stats : today's usage, new users and remaining pool quota
//! - PUT  /admin/users/{id}/status : set a user's service level `{status}`

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use key_pool::{KeyPool, Sweeper};
use key_store::{KeyKind, UserStatus};
use serde::Deserialize;
use tracing::{error, info};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<KeyPool>,
    sweeper: Arc<Sweeper>,
}

impl AdminState {
    pub fn new(pool: Arc<KeyPool>, sweeper: Arc<Sweeper>) -> Self {
        Self { pool, sweeper }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/keys", get(list_keys).post(add_key))
        .route("/admin/sweep", post(run_sweep))
        .route("/admin/stats", get(stats))
        .route("/admin/users/{id}/status", put(set_user_status))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    json_response(status, serde_json::json!({ "error": message.to_string() }))
}

/// GET /admin/keys
async fn list_keys(State(state): State<AdminState>) -> Response {
    match state.pool.list().await {
        Ok(keys) => json_response(StatusCode::OK, serde_json::json!({ "keys": keys })),
        Err(e) => {
            error!(error = %e, "failed to list keys");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

#[derive(Deserialize)]
struct AddKeyRequest {
    kind: String,
    secret: String,
    #[serde(default)]
    fresh: bool,
}

/// POST /admin/keys
///
/// 201 with the stored summary, 400 on unknown kind or empty secret, 409 if
/// the same secret is already pooled for that kind.
async fn add_key(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<AddKeyRequest>,
) -> Response {
    let kind: KeyKind = match body.kind.parse() {
        Ok(kind) => kind,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };

    match state.pool.add_key(kind, &body.secret, body.fresh).await {
        Ok(summary) => json_response(
            StatusCode::CREATED,
            serde_json::to_value(&summary).unwrap_or_default(),
        ),
        Err(e @ key_pool::Error::EmptySecret) => error_response(StatusCode::BAD_REQUEST, e),
        Err(e @ key_pool::Error::DuplicateSecret(_)) => error_response(StatusCode::CONFLICT, e),
        Err(e) => {
            error!(error = %e, kind = %kind, "failed to add key");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

/// POST /admin/sweep
async fn run_sweep(State(state): State<AdminState>) -> Response {
    match state.sweeper.sweep().await {
        Ok(reactivated) => {
            info!(reactivated, "sweep triggered via admin API");
            json_response(
                StatusCode::OK,
                serde_json::json!({ "reactivated": reactivated }),
            )
        }
        Err(e) => {
            error!(error = %e, "sweep failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

/// GET /admin/stats
async fn stats(State(state): State<AdminState>) -> Response {
    match state.pool.stats().await {
        Ok(stats) => json_response(
            StatusCode::OK,
            serde_json::to_value(&stats).unwrap_or_default(),
        ),
        Err(e) => {
            error!(error = %e, "failed to compute stats");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

#[derive(Deserialize)]
struct UserStatusRequest {
    status: String,
}

/// PUT /admin/users/{id}/status
///
/// Unknown users are created with the given status. 400 on an unknown status
/// or a blank id.
async fn set_user_status(
    State(state): State<AdminState>,
    Path(user_id): Path<String>,
    axum::Json(body): axum::Json<UserStatusRequest>,
) -> Response {
    let status: UserStatus = match body.status.parse() {
        Ok(status) => status,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };

    match state.pool.set_user_status(&user_id, status).await {
        Ok(summary) => json_response(
            StatusCode::OK,
            serde_json::to_value(&summary).unwrap_or_default(),
        ),
        Err(e @ key_pool::Error::EmptyUserId) => error_response(StatusCode::BAD_REQUEST, e),
        Err(e) => {
            error!(error = %e, user_id, "failed to set user status");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}
