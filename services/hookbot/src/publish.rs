// Publisher endpoint: POST /pub/... and /unsafe/pub/...
use std::collections::HashMap;

use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use hookbot_broker::topic;
use hookbot_github::Envelope;

use crate::http::{AppState, bad_request, internal_error, request_uri};

pub async fn handle(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let is_unsafe = hookbot_auth::is_unsafe_path(parts.uri.path());
    let topic = topic::from_path(&request_uri(&parts.uri), is_unsafe);

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(error) => {
            tracing::warn!(%error, "error reading publish body");
            return internal_error();
        }
    };

    let body = match params.get("extra-metadata").map(String::as_str) {
        None => body,
        Some("github") => {
            let envelope = Envelope {
                signature: header_string(&parts.headers, "X-Hub-Signature"),
                event: header_string(&parts.headers, "X-GitHub-Event"),
                delivery: header_string(&parts.headers, "X-GitHub-Delivery"),
                payload: body.to_vec(),
            };
            match serde_json::to_vec(&envelope) {
                Ok(encoded) => Bytes::from(encoded),
                Err(error) => {
                    tracing::warn!(%error, "error serializing metadata envelope");
                    return internal_error();
                }
            }
        }
        Some(_) => return bad_request("400 Bad Request (bad ?extra-metadata=)\n"),
    };

    tracing::info!(topic = %topic, "publish");
    match state.broker.publish(topic, body).await {
        Ok(()) => (StatusCode::OK, "OK\n").into_response(),
        Err(error) => {
            tracing::warn!(%error, "publish not accepted");
            (StatusCode::SERVICE_UNAVAILABLE, "503 Timeout in send\n").into_response()
        }
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
