// Reconnecting subscriber client.
//
// `watch` opens one WebSocket subscription and surfaces payloads and errors
// on channels; `retrying_watch` keeps the payload channel alive across
// reconnects, sleeping with jitter between attempts. Authentication rides in
// the target URL's userinfo and becomes a basic-auth header.
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http::HeaderMap;
use http::header::AUTHORIZATION;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch as watch_signal};
use tokio::time::Instant;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, WebSocketConfig};
use url::Url;

pub type Result<T> = std::result::Result<T, ListenError>;

/// Signal used to end a watch. Flip it to `true` (or drop the sender) to
/// make every task wound up by `watch`/`retrying_watch` unwind.
pub type Finish = watch_signal::Receiver<bool>;

const MAX_MESSAGE_BYTES: usize = 1 << 20;
// Reset on every pong; the server is expected to answer our pings well
// within this.
const READ_DEADLINE: Duration = Duration::from_secs(40);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const PING_BASE: Duration = Duration::from_secs(15);
const RETRY_BASE: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum ListenError {
    #[error("invalid target url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid header value: {0}")]
    Header(#[from] http::header::InvalidHeaderValue),
    #[error("connection failed: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("transport error: {0}")]
    Transport(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("read deadline exceeded")]
    ReadTimeout,
}

// Ping every 15–20 seconds; the spread keeps a fleet of clients from
// thundering in step.
fn ping_interval() -> Duration {
    PING_BASE + Duration::from_millis(rand::thread_rng().gen_range(0..5000))
}

fn retry_delay() -> Duration {
    RETRY_BASE + Duration::from_millis(rand::thread_rng().gen_range(0..1000))
}

// "/xub/..." is the scheme-agnostic spelling of a subscription path: rewrite
// it to "/sub/..." and move http(s) to ws(s).
fn normalize_target(target: &str) -> Result<Url> {
    let mut url = Url::parse(target)?;
    if let Some(rest) = url.path().strip_prefix("/xub/").map(str::to_string) {
        url.set_path(&format!("/sub/{rest}"));
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => other,
        }
        .to_string();
        let _ = url.set_scheme(&scheme);
    }
    Ok(url)
}

/// Subscribe once. Returns a payload channel and an error channel; both
/// close when the connection is done.
pub async fn watch(
    target: &str,
    headers: &HeaderMap,
    finish: Finish,
) -> Result<(mpsc::Receiver<Bytes>, mpsc::Receiver<ListenError>)> {
    let mut url = normalize_target(target)?;

    let mut authorization = None;
    if !url.username().is_empty() {
        let userinfo = BASE64.encode(format!("{}:", url.username()));
        authorization = Some(format!("Basic {userinfo}").parse()?);
        let _ = url.set_username("");
        let _ = url.set_password(None);
    }

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(ListenError::Connect)?;
    for (name, value) in headers {
        request.headers_mut().insert(name.clone(), value.clone());
    }
    if let Some(authorization) = authorization {
        request.headers_mut().insert(AUTHORIZATION, authorization);
    }

    let config = WebSocketConfig::default().max_message_size(Some(MAX_MESSAGE_BYTES));
    let (stream, _response) = connect_async_with_config(request, Some(config), false)
        .await
        .map_err(ListenError::Connect)?;
    let (sink, stream) = stream.split();

    let (messages_tx, messages_rx) = mpsc::channel(1);
    let (errors_tx, errors_rx) = mpsc::channel(1);
    let (reader_done_tx, reader_done_rx) = oneshot::channel();

    tokio::spawn(run_writer(sink, finish.clone(), reader_done_rx));
    tokio::spawn(run_reader(
        stream,
        messages_tx,
        errors_tx,
        finish,
        reader_done_tx,
    ));

    Ok((messages_rx, errors_rx))
}

// Owns the send half: periodic pings until finish fires or the reader ends.
async fn run_writer<S>(mut sink: S, mut finish: Finish, mut reader_done: oneshot::Receiver<()>)
where
    S: Sink<WsMessage> + Unpin,
{
    loop {
        tokio::select! {
            _ = tokio::time::sleep(ping_interval()) => {
                let ping = sink.send(WsMessage::Ping(Bytes::new()));
                match tokio::time::timeout(WRITE_DEADLINE, ping).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => return,
                }
            }
            _ = finish.changed() => {
                let _ = sink.close().await;
                return;
            }
            _ = &mut reader_done => return,
        }
    }
}

// Owns the receive half: forwards payloads, enforces the read deadline.
async fn run_reader<S>(
    mut stream: S,
    messages_tx: mpsc::Sender<Bytes>,
    errors_tx: mpsc::Sender<ListenError>,
    mut finish: Finish,
    _reader_done: oneshot::Sender<()>,
) where
    S: Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut deadline = Instant::now() + READ_DEADLINE;
    loop {
        tokio::select! {
            next = tokio::time::timeout_at(deadline, stream.next()) => {
                match next {
                    Err(_elapsed) => {
                        let _ = errors_tx.send(ListenError::ReadTimeout).await;
                        return;
                    }
                    Ok(None) => return,
                    Ok(Some(Err(error))) => {
                        // Requested finish makes transport errors expected.
                        if !*finish.borrow() {
                            tracing::debug!(%error, "watch read failed");
                            let _ = errors_tx.send(ListenError::Transport(error)).await;
                        }
                        return;
                    }
                    Ok(Some(Ok(message))) => match message {
                        WsMessage::Pong(_) => {
                            deadline = Instant::now() + READ_DEADLINE;
                        }
                        WsMessage::Binary(payload) => {
                            if messages_tx.send(payload).await.is_err() {
                                return;
                            }
                        }
                        WsMessage::Text(payload) => {
                            if messages_tx.send(Bytes::from(payload.as_str().to_owned())).await.is_err() {
                                return;
                            }
                        }
                        WsMessage::Close(_) => return,
                        _ => {}
                    },
                }
            }
            changed = finish.changed() => {
                if changed.is_err() || *finish.borrow() {
                    return;
                }
            }
        }
    }
}

/// Like [`watch`], but reconnects after failures with a jittered backoff.
/// The payload channel stays open across reconnects; per-attempt errors
/// surface on the error channel.
pub fn retrying_watch(
    target: String,
    headers: HeaderMap,
    finish: Finish,
) -> (mpsc::Receiver<Bytes>, mpsc::Receiver<ListenError>) {
    let (out_messages_tx, out_messages_rx) = mpsc::channel(1);
    let (out_errors_tx, out_errors_rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut finish = finish;
        loop {
            if *finish.borrow() {
                return;
            }

            match watch(&target, &headers, finish.clone()).await {
                Ok((mut messages, mut errors)) => {
                    tracing::info!(target = %target, "connected");
                    let mut errors_drained = false;
                    loop {
                        tokio::select! {
                            message = messages.recv() => match message {
                                Some(message) => {
                                    if out_messages_tx.send(message).await.is_err() {
                                        return;
                                    }
                                }
                                None => break,
                            },
                            error = errors.recv(), if !errors_drained => match error {
                                Some(error) => {
                                    if out_errors_tx.send(error).await.is_err() {
                                        return;
                                    }
                                }
                                None => errors_drained = true,
                            },
                            changed = finish.changed() => {
                                if changed.is_err() || *finish.borrow() {
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(error) => {
                    if out_errors_tx.send(error).await.is_err() {
                        return;
                    }
                }
            }

            if *finish.borrow() {
                return;
            }
            let delay = retry_delay();
            tracing::warn!(target = %target, delay = ?delay, "connection ended; retrying");
            tokio::time::sleep(delay).await;
        }
    });

    (out_messages_rx, out_errors_rx)
}
