//! HTTP surface wiring.
//!
//! # Purpose
//! Builds the axum router, applies the token/unsafe gates, and defines the
//! shared application state injected into handlers.
//!
//! # Notes
//! Authentication and the unsafe-path policy look at the request *path*
//! only; topics are derived from the path plus query string so a
//! `?recursive` suffix stays part of the topic.
use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::{StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use hookbot_broker::Broker;
use tower_http::trace::TraceLayer;

use crate::publish;
use crate::subscribe;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub key: Arc<str>,
    pub allowed_origins: Arc<Vec<String>>,
}

pub fn build_router(state: AppState) -> Router {
    let key_checked = Router::new()
        .route("/pub/", post(publish::handle))
        .route("/pub/{*tail}", post(publish::handle))
        .route("/sub/", get(subscribe::handle))
        .route("/sub/{*tail}", get(subscribe::handle))
        .route_layer(middleware::from_fn_with_state(state.clone(), key_checker));

    // The key checker passes unsafe paths straight through, so the unsafe
    // gate is stacked outermost to be checked first.
    let unsafe_sub = Router::new()
        .route("/unsafe/sub/", get(subscribe::handle))
        .route("/unsafe/sub/{*tail}", get(subscribe::handle))
        .route_layer(middleware::from_fn_with_state(state.clone(), key_checker))
        .route_layer(middleware::from_fn(require_unsafe_header));

    // Unsafe publishes are open to anyone; any validation happens
    // downstream, e.g. the github router checking payload signatures.
    let unsafe_pub = Router::new()
        .route("/unsafe/pub/", post(publish::handle))
        .route("/unsafe/pub/{*tail}", post(publish::handle));

    Router::new()
        .merge(key_checked)
        .merge(unsafe_sub)
        .merge(unsafe_pub)
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn status() -> &'static str {
    "OK\n"
}

// Token gate. Unsafe requests don't check tokens; see require_unsafe_header.
async fn key_checker(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path();
    if hookbot_auth::is_unsafe_path(path) {
        return next.run(request).await;
    }

    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if !hookbot_auth::authorized(&state.key, path, authorization) {
        return unauthorized();
    }
    next.run(request).await
}

// Unsafe URLs can be published to by anyone on the internet without a valid
// token, and it is the consumer's responsibility to validate payloads. The
// header is required so nobody points a component at an unsafe URL by
// mistake, believing it to be private.
async fn require_unsafe_header(request: Request, next: Next) -> Response {
    const ERROR_BODY: &str = "400 Bad Request. X-Hookbot-Unsafe-Is-Ok header required.\n";

    if hookbot_auth::is_unsafe_path(request.uri().path()) {
        let value = request
            .headers()
            .get(hookbot_auth::UNSAFE_HEADER)
            .and_then(|value| value.to_str().ok());
        if value != Some(hookbot_auth::UNSAFE_HEADER_VALUE) {
            return (StatusCode::BAD_REQUEST, ERROR_BODY).into_response();
        }
    }
    next.run(request).await
}

pub(crate) fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"hookbot\"")],
        "401 Unauthorized\n",
    )
        .into_response()
}

pub(crate) fn bad_request(body: &'static str) -> Response {
    (StatusCode::BAD_REQUEST, body).into_response()
}

pub(crate) fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "500 Internal Server Error\n",
    )
        .into_response()
}

// The topic source: path plus query, so "?recursive" subscriptions keep
// their suffix. Tokens never cover the query part.
pub(crate) fn request_uri(uri: &Uri) -> String {
    match uri.query() {
        Some(query) => format!("{}?{}", uri.path(), query),
        None => uri.path().to_string(),
    }
}
