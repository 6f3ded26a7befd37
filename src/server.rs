use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::backend::{ModelManager, OllamaClient, RemoteClient};
use crate::jobs::{Dispatcher, JobOptions};
use crate::models::{Backend, Style};
use crate::store;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub api_token: String,
    pub dispatcher: Dispatcher<RemoteClient, OllamaClient>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/jobs/{id}", get(job_handler))
        .route("/api/topics/{name}/generate", post(generate_handler))
        .route("/api/models", get(models_handler))
        .with_state(state)
}

#[derive(Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateBody {
    style: Option<Style>,
    backend: Option<Backend>,
    priority: Option<i64>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer realm=\"autoscribe\"")],
        Json(json!({ "error": "unauthorized" })),
    )
        .into_response()
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let local_backend = state.dispatcher.engine().local().is_server_healthy().await;
    Json(json!({ "status": "ok", "local_backend": local_backend })).into_response()
}

async fn job_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    if !authenticate(&state.api_token, &query, &headers) {
        return unauthorized();
    }

    match store::get_job(&state.pool, &id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("no job '{id}'")),
        Err(e) => {
            warn!(error = %e, job = %id, "failed to look up job");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

async fn generate_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authenticate(&state.api_token, &query, &headers) {
        return unauthorized();
    }

    let body: GenerateBody = if body.iter().all(u8::is_ascii_whitespace) {
        GenerateBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(b) => b,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("invalid request body: {e}")),
        }
    };

    let topic = match store::get_topic_by_name(&state.pool, &name).await {
        Ok(Some(t)) if t.is_active => t,
        Ok(_) => return error_response(StatusCode::NOT_FOUND, format!("no active topic '{name}'")),
        Err(e) => {
            warn!(error = %e, topic = %name, "failed to look up topic");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    let options = JobOptions {
        style: body.style,
        backend: body.backend,
        priority: body.priority,
    };
    match state.dispatcher.dispatch(&topic, options).await {
        Ok(Some(dispatched)) => (
            StatusCode::ACCEPTED,
            Json(json!({ "job_id": dispatched.job.id, "status": dispatched.job.status })),
        )
            .into_response(),
        Ok(None) => error_response(
            StatusCode::CONFLICT,
            format!("topic '{name}' already has a generation in progress"),
        ),
        Err(e) => {
            warn!(error = %e, topic = %name, "failed to dispatch generation");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

async fn models_handler(State(state): State<AppState>, Query(query): Query<TokenQuery>, headers: HeaderMap) -> Response {
    if !authenticate(&state.api_token, &query, &headers) {
        return unauthorized();
    }

    match store::list_local_models(&state.pool).await {
        Ok(models) => {
            let models: Vec<_> = models
                .iter()
                .map(|m| {
                    json!({
                        "name": m.name,
                        "status": m.status_label(),
                        "last_refreshed": m.last_refreshed,
                        "details": m.details_json(),
                    })
                })
                .collect();
            Json(json!({ "models": models })).into_response()
        }
        Err(e) => {
            warn!(error = %e, "failed to list local models");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn authenticate(api_token: &str, query: &TokenQuery, headers: &HeaderMap) -> bool {
    if let Some(ref token) = query.token
        && constant_time_eq(token, api_token)
    {
        debug!("authenticated via query param");
        return true;
    }

    if let Some(auth_header) = headers.get(header::AUTHORIZATION)
        && let Ok(auth_str) = auth_header.to_str()
        && let Some(token) = auth_str.strip_prefix("Bearer ")
        && constant_time_eq(token.trim(), api_token)
    {
        debug!("authenticated via bearer token");
        return true;
    }

    false
}

/// Constant-time string comparison to prevent timing attacks on token validation.
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
