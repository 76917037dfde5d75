use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tracing::{Level, Span};
use uuid::Uuid;

pub static REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Echo (or mint) an `x-request-id`.
///
/// The id is written back into the request headers so the trace span below
/// can pick it up.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(&REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::now_v7().to_string());

    let value = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = &value {
        req.headers_mut().insert(REQUEST_ID.clone(), value.clone());
    }

    let mut response = next.run(req).await;
    if let Some(value) = value {
        response.headers_mut().insert(REQUEST_ID.clone(), value);
    }
    response
}

fn request_span(req: &Request<Body>) -> Span {
    let request_id = req
        .headers()
        .get(&REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    tracing::info_span!(
        "http_request",
        method = %req.method(),
        path = %req.uri().path(),
        request_id = %request_id,
    )
}

pub type RequestTraceLayer =
    TraceLayer<SharedClassifier<ServerErrorsAsFailures>, fn(&Request<Body>) -> Span>;

/// One `info` line per response (status + latency) inside a span carrying
/// method, path and request id; 5xx responses are also logged at `error`.
pub fn trace_layer() -> RequestTraceLayer {
    TraceLayer::new_for_http()
        .make_span_with(request_span as fn(&Request<Body>) -> Span)
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(DefaultOnFailure::new().level(Level::ERROR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, routing::get};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(
                tower::ServiceBuilder::new()
                    .layer(axum::middleware::from_fn(request_id))
                    .layer(trace_layer()),
            )
    }

    #[tokio::test]
    async fn incoming_request_id_is_echoed() {
        let res = app()
            .oneshot(Request::get("/").header("x-request-id", " abc ").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.headers()[&REQUEST_ID], "abc");
    }

    #[tokio::test]
    async fn missing_request_id_is_minted() {
        let res = app()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let id = res.headers()[&REQUEST_ID].to_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }
}
