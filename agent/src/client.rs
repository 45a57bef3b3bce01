//! Outbound tunnel client: dialing, registration and keep-alive.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, WebSocketConfig};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use backstream_shared::codec::WireFormat;
use backstream_shared::conn::{Conn, EventHandler, Frame, FrameSink, FrameStream};
use backstream_shared::pool::Pool;
use backstream_shared::protocol::MAX_MESSAGE_SIZE;
use backstream_shared::{Error, Result, HEADER_CLIENT_ID};

/// How often the keep-alive supervisor checks for a live tunnel.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(1);

/// Agent options.
#[derive(Clone, Default)]
pub struct AgentConfig {
    /// Tenant identifier sent on dial. May be empty if the edge permits it.
    pub client_id: String,
    /// Wire format shared with the edge.
    pub format: WireFormat,
    /// TLS client configuration for wss:// edges.
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

/// Maintains an outbound tunnel to the edge proxy, redialing as needed.
pub struct Agent {
    url: String,
    config: AgentConfig,
    handler: Arc<dyn EventHandler>,
    pool: Arc<Pool>,
    cancel: CancellationToken,
    /// Single-flight latch: at most one dial in progress.
    connect_mu: Mutex<()>,
}

impl Agent {
    pub fn new(
        url: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        config: AgentConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            config,
            handler,
            pool: Arc::new(Pool::new()),
            cancel: CancellationToken::new(),
            connect_mu: Mutex::new(()),
        })
    }

    /// Starts the keep-alive supervisor. Dial failures are logged and
    /// retried on the next tick; they never abort the agent.
    pub fn start(self: &Arc<Self>) {
        let agent = self.clone();
        tokio::spawn(async move {
            info!(url = %agent.url, "keeping tunnel connected");
            if let Err(err) = agent.get_or_dial().await {
                error!(error = %err, "dial failed");
            }
            let mut ticker = tokio::time::interval(KEEPALIVE_PERIOD);
            loop {
                tokio::select! {
                    _ = agent.cancel.cancelled() => {
                        debug!("keep-alive stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = agent.get_or_dial().await {
                            error!(error = %err, "dial failed");
                        }
                    }
                }
            }
        });
    }

    /// Returns a live tunnel, dialing one if none exists. Guarded so only a
    /// single dial runs at any moment.
    pub async fn get_or_dial(&self) -> Result<Arc<Conn>> {
        let _flight = self.connect_mu.lock().await;
        if let Some(conn) = self.pool.get_any() {
            return Ok(conn);
        }
        self.dial().await
    }

    /// Stops the supervisor and tears down every tunnel.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    async fn dial(&self) -> Result<Arc<Conn>> {
        info!(url = %self.url, "connecting tunnel");

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(Error::transport)?;
        let client_id = http::HeaderValue::from_str(&self.config.client_id)
            .map_err(|err| Error::Header(err.to_string()))?;
        request.headers_mut().insert(HEADER_CLIENT_ID, client_id);

        let ws_config = WebSocketConfig::default().max_message_size(Some(MAX_MESSAGE_SIZE));
        let connector = self.config.tls.clone().map(Connector::Rustls);
        let (socket, _response) =
            connect_async_tls_with_config(request, Some(ws_config), false, connector)
                .await
                .map_err(Error::transport)?;

        let (sink, stream) = socket_frames(socket);
        Ok(Conn::spawn(
            &self.cancel,
            self.pool.clone(),
            self.config.client_id.clone(),
            sink,
            stream,
            self.handler.clone(),
            self.config.format,
        ))
    }
}

fn socket_frames(socket: WebSocketStream<MaybeTlsStream<TcpStream>>) -> (FrameSink, FrameStream) {
    let (sink, stream) = socket.split();
    let sink = sink
        .with(|frame: Frame| {
            futures_util::future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(
                frame_to_message(frame),
            ))
        })
        .sink_map_err(|err: tokio_tungstenite::tungstenite::Error| Error::transport(err));
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
        // raw frames never surface from a read
        WsMessage::Frame(_) => None,
    }
}
