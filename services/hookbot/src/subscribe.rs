// Subscriber endpoint: GET /sub/... and /unsafe/sub/... upgraded to a
// WebSocket that relays deliveries as binary frames.
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use hookbot_broker::{Broker, Delivery, Subscriber, topic};

use crate::http::{AppState, request_uri};

// A stuck peer gets this long per frame before we hang up on it.
const WRITE_DEADLINE: Duration = Duration::from_secs(90);

pub async fn handle(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if !state.allowed_origins.is_empty() {
        let origin_allowed = headers
            .get(header::ORIGIN)
            .and_then(|value| value.to_str().ok())
            .map(|origin| state.allowed_origins.iter().any(|allowed| allowed == origin))
            .unwrap_or(false);
        if !origin_allowed {
            return (StatusCode::FORBIDDEN, "403 Forbidden\n").into_response();
        }
    }

    let is_unsafe = hookbot_auth::is_unsafe_path(uri.path());
    let topic = topic::from_path(&request_uri(&uri), is_unsafe);
    let broker = state.broker.clone();
    ws.on_upgrade(move |socket| run(socket, broker, topic))
}

async fn run(socket: WebSocket, broker: Arc<Broker>, topic: String) {
    let mut subscriber = match broker.subscribe(topic).await {
        Ok(subscriber) => subscriber,
        Err(error) => {
            tracing::debug!(%error, "subscription rejected");
            return;
        }
    };
    let (mut sink, mut stream) = socket.split();

    // Reader watchdog: drive the read side purely to observe read errors.
    // Broken pipes and peer resets surface here as a normal end of stream,
    // not as anything worth a warning.
    let mut watchdog = tokio::spawn(async move {
        while let Some(Ok(_frame)) = stream.next().await {}
    });

    loop {
        tokio::select! {
            delivery = subscriber.recv() => {
                // None means the broker shut down; drain and go.
                let Some(delivery) = delivery else { break };
                let frame = frame_for(&subscriber, &delivery);
                match tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Binary(frame))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        tracing::debug!(%error, "subscriber write failed");
                        break;
                    }
                    Err(_elapsed) => {
                        tracing::debug!("subscriber write deadline exceeded");
                        break;
                    }
                }
            }
            _ = &mut watchdog => {
                tracing::debug!("client disconnected");
                break;
            }
        }
    }
    watchdog.abort();
    // Dropping the subscription closes `dead` first and then enqueues
    // removal, so in-flight sends abandon instead of stalling a worker.
}

// Recursive subscribers hear many topics, so each of their frames leads
// with the producing topic and a NUL; plain subscribers get a framing-free
// stream.
fn frame_for(subscriber: &Subscriber, delivery: &Delivery) -> Bytes {
    if !subscriber.recursive() {
        return delivery.body.clone();
    }
    let mut frame = Vec::with_capacity(delivery.topic.len() + 1 + delivery.body.len());
    frame.extend_from_slice(delivery.topic.as_bytes());
    frame.push(0);
    frame.extend_from_slice(&delivery.body);
    Bytes::from(frame)
}
