//! Edge-side HTTP surface: tunnel upgrades and the proxy catch-all.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use backstream_shared::codec::WireFormat;
use backstream_shared::conn::{Conn, EventHandler, Frame, FrameSink, FrameStream};
use backstream_shared::convert::{self, DEFAULT_REQUEST_TIMEOUT};
use backstream_shared::pool::Pool;
use backstream_shared::protocol::{EventHttpResponse, MAX_MESSAGE_SIZE};
use backstream_shared::{Error, HEADER_CLIENT_ID};

/// Edge behavior knobs.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Route serving tunnel upgrades.
    pub ws_path: String,
    /// Reject upgrades that carry no client id.
    pub require_client_id: bool,
    /// Exchange bound when the request has no timeout header.
    pub default_timeout: Duration,
    /// Try every connection matching the client id instead of just one.
    pub retry: bool,
    /// In retry mode, advance past any error rather than only closure.
    pub retry_all_errors: bool,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            ws_path: "/ws".to_owned(),
            require_client_id: true,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: false,
            retry_all_errors: false,
        }
    }
}

/// Shared state behind the axum router.
#[derive(Clone)]
pub struct EdgeState {
    pool: Arc<Pool>,
    format: WireFormat,
    config: Arc<EdgeConfig>,
    cancel: CancellationToken,
}

impl EdgeState {
    pub fn new(format: WireFormat, config: EdgeConfig, cancel: CancellationToken) -> Self {
        Self {
            pool: Arc::new(Pool::new()),
            format,
            config: Arc::new(config),
            cancel,
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }
}

/// Builds the edge router: the upgrade endpoint, a liveness probe and the
/// proxy catch-all.
pub fn router(state: EdgeState) -> Router {
    let ws_path = state.config.ws_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/healthz", get(|| async { "OK" }))
        .fallback(proxy_handler)
        .with_state(state)
}

/// Tunnels never push requests at the edge; inbound envelopes other than
/// responses are rejected.
struct EdgeEventHandler;

#[async_trait]
impl EventHandler for EdgeEventHandler {
    async fn handle_request(&self, _event: Vec<u8>) -> backstream_shared::Result<Vec<u8>> {
        Err(Error::Unsupported("proxy request"))
    }

    async fn handle_notify(&self, _event: Vec<u8>) -> backstream_shared::Result<()> {
        Err(Error::Unsupported("proxy notification"))
    }
}

async fn ws_handler(
    State(state): State<EdgeState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let client_id = headers
        .get(HEADER_CLIENT_ID)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    if state.config.require_client_id && client_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            format!("header {HEADER_CLIENT_ID} is required"),
        )
            .into_response();
    }
    info!(%client_id, "incoming tunnel connection");

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket_frames(socket);
            Conn::spawn(
                &state.cancel,
                state.pool.clone(),
                client_id,
                sink,
                stream,
                Arc::new(EdgeEventHandler),
                state.format,
            );
        })
}

async fn proxy_handler(State(state): State<EdgeState>, req: Request) -> Response {
    let client_id = req
        .headers()
        .get(HEADER_CLIENT_ID)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();

    let conns = if state.config.retry {
        state.pool.get_all_by_id(&client_id)
    } else {
        state.pool.get_by_id(&client_id).into_iter().collect()
    };
    if conns.is_empty() {
        let msg = format!("connection for client id '{client_id}' not found");
        error!("{msg}");
        return (StatusCode::UNPROCESSABLE_ENTITY, msg).into_response();
    }

    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_MESSAGE_SIZE).await {
        Ok(body) => body,
        Err(err) => return (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    };

    let mut last_err = Error::NoRoute(client_id.clone());
    for conn in conns {
        match proxy_exchange(&state, &conn, &parts, &body).await {
            Ok(response) => return response,
            Err(err) => {
                let closed = matches!(err, Error::ConnectionClosed);
                last_err = err;
                if closed || state.config.retry_all_errors {
                    continue;
                }
                break;
            }
        }
    }
    error!(%client_id, error = %last_err, "proxy request failed");
    (StatusCode::BAD_GATEWAY, last_err.to_string()).into_response()
}

/// One request/response exchange over a tunnel: encode, send, decode, write.
async fn proxy_exchange(
    state: &EdgeState,
    conn: &Conn,
    parts: &http::request::Parts,
    body: &[u8],
) -> Result<Response, Error> {
    let event = convert::request_to_event(&parts.method, &parts.uri, &parts.headers, body);
    let input = state.format.encode(&event)?;

    let deadline = convert::request_timeout(&parts.headers, state.config.default_timeout)?;
    let output = if deadline.is_zero() {
        conn.send(input).await?
    } else {
        timeout(deadline, conn.send(input)).await??
    };

    let event: EventHttpResponse = state.format.decode(&output)?;
    let response = convert::response_from_event(&event)?;
    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, Body::from(body)))
}

fn socket_frames(socket: WebSocket) -> (FrameSink, FrameStream) {
    let (sink, stream) = socket.split();
    let sink = sink
        .with(|frame: Frame| futures_util::future::ready(Ok::<_, axum::Error>(frame_to_message(frame))))
        .sink_map_err(|err: axum::Error| Error::transport(err));
    let stream = stream.filter_map(|item| async move {
        match item {
            Ok(message) => message_to_frame(message).map(Ok),
            Err(err) => Some(Err(Error::transport(err))),
        }
    });
    (Box::pin(sink), Box::pin(stream))
}

fn frame_to_message(frame: Frame) -> WsMessage {
    match frame {
        Frame::Binary(data) => WsMessage::Binary(data.into()),
        Frame::Text(text) => WsMessage::Text(text.into()),
        Frame::Ping(data) => WsMessage::Ping(data.into()),
        Frame::Pong(data) => WsMessage::Pong(data.into()),
        Frame::Close => WsMessage::Close(None),
    }
}

fn message_to_frame(message: WsMessage) -> Option<Frame> {
    match message {
        WsMessage::Binary(data) => Some(Frame::Binary(data.to_vec())),
        WsMessage::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        WsMessage::Ping(data) => Some(Frame::Ping(data.to_vec())),
        WsMessage::Pong(data) => Some(Frame::Pong(data.to_vec())),
        WsMessage::Close(_) => Some(Frame::Close),
    }
}
