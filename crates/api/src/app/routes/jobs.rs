use std::sync::Arc;

use axum::{
    extract::{
        Extension, Path, Query,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value as JsonValue;

use jobmesh_core::JobId;
use jobmesh_infra::ListJobsQuery;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/:id", get(get_job).delete(delete_job))
        .route("/:id/tasks", get(list_job_tasks))
        .route("/:id/republish", post(republish_job))
}

fn parse_job_id(id: &str) -> Result<JobId, axum::response::Response> {
    id.parse().map_err(errors::invalid_id)
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::CreateJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return errors::json_rejection(e),
    };

    let parameters = match body.parameters.clone() {
        None | Some(JsonValue::Null) => JsonValue::Object(Default::default()),
        Some(p @ JsonValue::Object(_)) => p,
        Some(_) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "parameters must be a JSON object",
            );
        }
    };
    let num_tasks = body.num_tasks();
    let job_type = body.job_type;

    match services
        .run(move |o| o.create_job(&job_type, num_tasks, parameters))
        .await
    {
        Ok(job) => (StatusCode::CREATED, Json(dto::JobResponse::from(job))).into_response(),
        Err(resp) => resp,
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    params: Result<Query<dto::ListJobsParams>, QueryRejection>,
) -> axum::response::Response {
    let query: ListJobsQuery = match params {
        Ok(Query(p)) => p.into(),
        Err(e) => return errors::query_rejection(e),
    };

    match services.run(move |o| o.list_jobs(&query)).await {
        Ok(page) => Json(dto::JobListResponse::from(page)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.run(move |o| o.get_job(id)).await {
        Ok(job) => Json(dto::JobResponse::from(job)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn delete_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.run(move |o| o.delete_job(id)).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(resp) => resp,
    }
}

pub async fn list_job_tasks(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.run(move |o| o.list_job_tasks(id)).await {
        Ok(tasks) => Json(dto::TaskListResponse::from(tasks)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn republish_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.run(move |o| o.republish_job(id)).await {
        Ok(published) => Json(dto::RepublishResponse { published }).into_response(),
        Err(resp) => resp,
    }
}
