use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Request},
    http::{
        header::{
            ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN,
        },
        HeaderValue, Method, StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::relay::Relay;

pub mod handlers;

const MAX_ASK_BODY_BYTES: usize = 5 * 1024 * 1024;

/// Build the local ingest gateway in front of `relay`.
pub fn gateway_router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/", get(handlers::probe))
        .route("/ingest", post(handlers::ingest))
        .fallback(handlers::fallback)
        .with_state(relay)
        .layer(DefaultBodyLimit::max(MAX_ASK_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(permissive_cors))
        .layer(middleware::from_fn(request_id_middleware))
}

/// Middleware: any origin may call the loopback gateway. Preflights are
/// answered here with 204 and never reach a handler.
async fn permissive_cors(req: Request, next: Next) -> Response {
    let mut resp = if req.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };

    let headers = resp.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, GET, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    resp
}

/// Middleware: injects a unique X-Request-Id into every response.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}
