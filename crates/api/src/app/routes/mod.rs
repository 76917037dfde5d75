use axum::{routing::get, Router};

pub mod jobs;
pub mod system;
pub mod tasks;

/// Router for everything under `/api/v1`.
pub fn router() -> Router {
    Router::new()
        .route("/system/info", get(system::info))
        .nest("/jobs", jobs::router())
        .nest("/tasks", tasks::router())
}
