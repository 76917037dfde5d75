use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use jobmesh_core::{CompletionReport, FailureReport, TaskId};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Task queries plus the lifecycle reports workers send.
pub fn router() -> Router {
    Router::new()
        .route("/:id", get(get_task))
        .route("/:id/running", post(mark_running))
        .route("/:id/complete", post(mark_complete))
        .route("/:id/failed", post(mark_failed))
}

fn parse_task_id(id: &str) -> Result<TaskId, axum::response::Response> {
    id.parse().map_err(errors::invalid_id)
}

pub async fn get_task(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_task_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.run(move |o| o.get_task(&id)).await {
        Ok(task) => Json(dto::TaskResponse::from(task)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn mark_running(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_task_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.run(move |o| o.mark_running(&id)).await {
        Ok(task) => Json(dto::TaskResponse::from(task)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn mark_complete(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Result<Json<CompletionReport>, JsonRejection>,
) -> axum::response::Response {
    let id = match parse_task_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Json(report) = match body {
        Ok(b) => b,
        Err(e) => return errors::json_rejection(e),
    };

    match services.run(move |o| o.mark_complete(&id, &report)).await {
        Ok(task) => Json(dto::TaskResponse::from(task)).into_response(),
        Err(resp) => resp,
    }
}

/// The body is optional; a missing or unreadable one records "Unknown error".
pub async fn mark_failed(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Option<Json<FailureReport>>,
) -> axum::response::Response {
    let id = match parse_task_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let report = body.map(|Json(r)| r).unwrap_or_default();
    let message = report.message_or_default().to_string();

    match services.run(move |o| o.mark_failed(&id, &message)).await {
        Ok(task) => Json(dto::TaskResponse::from(task)).into_response(),
        Err(resp) => resp,
    }
}
