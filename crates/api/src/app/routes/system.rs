use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, Json};

use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Which backends this process runs on.
pub async fn info(Extension(services): Extension<Arc<AppServices>>) -> Json<serde_json::Value> {
    let config = services.orchestrator().config();
    Json(serde_json::json!({
        "backend": services.backend(),
        "max_tasks": config.max_tasks,
        "max_task_retries": config.max_task_retries,
    }))
}
