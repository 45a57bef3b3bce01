//! One live tunnel connection.
//!
//! A connection owns two long-lived loops over a framed websocket: the read
//! loop decodes inbound envelopes and dispatches them, the write loop drains
//! the bounded outbound queue and emits pings. Request/response correlation
//! is keyed by envelope id in the pending-response table.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::WireFormat;
use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::protocol::{Message, MessageKind};

/// Time allowed to write a frame to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Ping interval. Must be less than [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(10);
/// Time allowed between inbound frames before the peer is considered dead.
pub const PONG_WAIT: Duration = Duration::from_secs(21);

/// Outbound queue capacity per connection.
const IN_FLIGHT_COUNT: usize = 1024;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// One websocket frame as seen by the tunnel loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// Receives the payloads of inbound envelopes.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handles a request payload. The returned bytes are wrapped as a
    /// response envelope and sent back to the peer; an error suppresses the
    /// reply and the peer's deadline does the rest.
    async fn handle_request(&self, event: Vec<u8>) -> Result<Vec<u8>>;

    /// Handles a notification payload; never replied to.
    async fn handle_notify(&self, event: Vec<u8>) -> Result<()>;
}

#[derive(Debug)]
pub struct Conn {
    id: u64,
    client_id: String,
    send_tx: mpsc::Sender<Vec<u8>>,
    pending: DashMap<String, oneshot::Sender<Vec<u8>>>,
    cancel: CancellationToken,
    format: WireFormat,
}

impl Conn {
    /// Spawns the read and write loops over a framed websocket and registers
    /// the connection in `pool`. Teardown happens exactly once, when either
    /// loop fails or the token fires.
    pub fn spawn(
        parent: &CancellationToken,
        pool: Arc<Pool>,
        client_id: impl Into<String>,
        sink: FrameSink,
        stream: FrameStream,
        handler: Arc<dyn EventHandler>,
        format: WireFormat,
    ) -> Arc<Conn> {
        Self::spawn_with_capacity(
            parent,
            pool,
            client_id,
            sink,
            stream,
            handler,
            format,
            IN_FLIGHT_COUNT,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn_with_capacity(
        parent: &CancellationToken,
        pool: Arc<Pool>,
        client_id: impl Into<String>,
        sink: FrameSink,
        stream: FrameStream,
        handler: Arc<dyn EventHandler>,
        format: WireFormat,
        capacity: usize,
    ) -> Arc<Conn> {
        let (send_tx, send_rx) = mpsc::channel(capacity);
        let conn = Arc::new(Conn {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            client_id: client_id.into(),
            send_tx,
            pending: DashMap::new(),
            cancel: parent.child_token(),
            format,
        });
        pool.register(conn.clone());
        tokio::spawn(write_loop(conn.clone(), sink, send_rx));
        tokio::spawn(read_loop(conn.clone(), stream, pool, handler));
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Sends a request envelope and waits for the matching response.
    ///
    /// The pending-table entry is removed on every exit path, including the
    /// caller dropping this future on its own deadline. Closure of the
    /// connection surfaces as [`Error::ConnectionClosed`].
    pub async fn send(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let msg = Message {
            id: Uuid::new_v4().to_string(),
            kind: MessageKind::Request,
            data: payload,
        };
        let data = self.format.encode(&msg)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(msg.id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: &msg.id,
        };

        self.enqueue(data).await?;
        tokio::select! {
            resp = rx => resp.map_err(|_| Error::ConnectionClosed),
            _ = self.cancel.cancelled() => Err(Error::ConnectionClosed),
        }
    }

    /// Sends a notify envelope; never waits for a reply.
    pub async fn notify(&self, payload: Vec<u8>) -> Result<()> {
        let msg = Message {
            id: Uuid::new_v4().to_string(),
            kind: MessageKind::Notify,
            data: payload,
        };
        let data = self.format.encode(&msg)?;
        self.enqueue(data).await
    }

    /// Triggers teardown of both loops. Idempotent.
    pub fn close(&self) {
        debug!(conn = self.id, "closing connection");
        self.cancel.cancel();
    }

    /// Enqueues pre-encoded bytes. A full queue blocks until space frees or
    /// the connection goes away; a closed queue is connection closure, not a
    /// caller failure.
    async fn enqueue(&self, data: Vec<u8>) -> Result<()> {
        tokio::select! {
            res = self.send_tx.send(data) => res.map_err(|_| Error::ConnectionClosed),
            _ = self.cancel.cancelled() => Err(Error::ConnectionClosed),
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Removes a pending-response entry when the exchange ends, whichever way.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, oneshot::Sender<Vec<u8>>>,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

async fn read_loop(
    conn: Arc<Conn>,
    mut stream: FrameStream,
    pool: Arc<Pool>,
    handler: Arc<dyn EventHandler>,
) {
    loop {
        let item = tokio::select! {
            _ = conn.cancel.cancelled() => break,
            item = timeout(PONG_WAIT, stream.next()) => item,
        };
        let frame = match item {
            Err(_) => {
                warn!(conn = conn.id, "read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                warn!(conn = conn.id, error = %err, "read failure");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            Frame::Binary(data) => dispatch(&conn, &handler, data),
            Frame::Text(text) => dispatch(&conn, &handler, text.into_bytes()),
            Frame::Pong(_) => debug!(conn = conn.id, "received pong"),
            // the websocket layer answers pings on its own
            Frame::Ping(_) => {}
            Frame::Close => break,
        }
    }
    pool.unregister(&conn);
    conn.cancel.cancel();
    // fail in-flight waiters with ConnectionClosed
    conn.pending.clear();
    debug!(conn = conn.id, "reader closed");
}

/// Hands an inbound envelope to the handler on a fresh task. A slow handler
/// must never stall the read loop, or pong reception starves and the peer
/// closes the tunnel.
fn dispatch(conn: &Arc<Conn>, handler: &Arc<dyn EventHandler>, input: Vec<u8>) {
    let conn = conn.clone();
    let handler = handler.clone();
    tokio::spawn(async move {
        let msg: Message = match conn.format.decode(&input) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(conn = conn.id, error = %err, "dropping undecodable frame");
                return;
            }
        };
        match msg.kind {
            MessageKind::Notify => {
                if let Err(err) = handler.handle_notify(msg.data).await {
                    warn!(conn = conn.id, error = %err, "notify handler failed");
                }
            }
            MessageKind::Request => {
                let output = match handler.handle_request(msg.data).await {
                    Ok(output) => output,
                    Err(err) => {
                        warn!(conn = conn.id, id = %msg.id, error = %err, "request handler failed");
                        return;
                    }
                };
                let reply = Message {
                    id: msg.id,
                    kind: MessageKind::Response,
                    data: output,
                };
                let data = match conn.format.encode(&reply) {
                    Ok(data) => data,
                    Err(err) => {
                        warn!(conn = conn.id, error = %err, "response encode failed");
                        return;
                    }
                };
                if conn.enqueue(data).await.is_err() {
                    warn!(conn = conn.id, "response dropped, connection closed");
                }
            }
            MessageKind::Response => {
                // no waiter means the sender already gave up
                if let Some((_, tx)) = conn.pending.remove(&msg.id) {
                    let _ = tx.send(msg.data);
                }
            }
        }
    });
}

async fn write_loop(conn: Arc<Conn>, mut sink: FrameSink, mut send_rx: mpsc::Receiver<Vec<u8>>) {
    let start = tokio::time::Instant::now() + PING_PERIOD;
    let mut ticker = tokio::time::interval_at(start, PING_PERIOD);
    loop {
        tokio::select! {
            _ = conn.cancel.cancelled() => {
                let _ = timeout(WRITE_WAIT, sink.send(Frame::Close)).await;
                break;
            }
            item = send_rx.recv() => {
                let Some(data) = item else {
                    let _ = timeout(WRITE_WAIT, sink.send(Frame::Close)).await;
                    break;
                };
                let frame = if conn.format.is_binary() {
                    Frame::Binary(data)
                } else {
                    match String::from_utf8(data) {
                        Ok(text) => Frame::Text(text),
                        Err(_) => {
                            warn!(conn = conn.id, "non-utf8 payload for text frame");
                            continue;
                        }
                    }
                };
                if !write_frame(&conn, &mut sink, frame).await {
                    break;
                }
            }
            _ = ticker.tick() => {
                debug!(conn = conn.id, "sending ping");
                if !write_frame(&conn, &mut sink, Frame::Ping(Vec::new())).await {
                    break;
                }
            }
        }
    }
    conn.cancel.cancel();
    debug!(conn = conn.id, "writer closed");
}

async fn write_frame(conn: &Conn, sink: &mut FrameSink, frame: Frame) -> bool {
    match timeout(WRITE_WAIT, sink.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!(conn = conn.id, error = %err, "write failure");
            false
        }
        Err(_) => {
            warn!(conn = conn.id, "write deadline expired");
            false
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use futures_util::future::poll_fn;
    use std::task::Poll;

    fn decode_envelope(frame: Frame) -> Message {
        match frame {
            Frame::Binary(data) => WireFormat::Binary.decode(&data).unwrap(),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    /// Pulls the next non-ping frame written by the connection.
    async fn next_envelope(remote: &mut Remote) -> Message {
        loop {
            match remote.outbound.next().await.expect("outbound closed") {
                Frame::Ping(_) | Frame::Pong(_) => continue,
                frame => return decode_envelope(frame),
            }
        }
    }

    fn response_frame(id: &str, data: &[u8]) -> Frame {
        let msg = Message {
            id: id.to_string(),
            kind: MessageKind::Response,
            data: data.to_vec(),
        };
        Frame::Binary(WireFormat::Binary.encode(&msg).unwrap())
    }

    #[tokio::test]
    async fn test_send_receives_matching_response() {
        let pool = Arc::new(Pool::new());
        let (conn, mut remote) = spawn_conn(&pool, "c1", Arc::new(EchoHandler));

        let request = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(b"ping".to_vec()).await }
        });

        let msg = next_envelope(&mut remote).await;
        assert_eq!(msg.kind, MessageKind::Request);
        assert_eq!(msg.data, b"ping");
        remote
            .inbound
            .unbounded_send(Ok(response_frame(&msg.id, b"pong")))
            .unwrap();

        assert_eq!(request.await.unwrap().unwrap(), b"pong");
        assert_eq!(conn.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_cleans_table_on_caller_deadline() {
        let pool = Arc::new(Pool::new());
        let (conn, mut remote) = spawn_conn(&pool, "c1", Arc::new(EchoHandler));

        let result = timeout(Duration::from_millis(200), conn.send(b"ping".to_vec())).await;
        assert!(result.is_err());
        assert_eq!(conn.pending_len(), 0);

        // the tunnel itself is still healthy
        let late = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(b"again".to_vec()).await }
        });
        let msg = loop {
            let msg = next_envelope(&mut remote).await;
            if msg.data == b"again" {
                break msg;
            }
        };
        remote
            .inbound
            .unbounded_send(Ok(response_frame(&msg.id, b"ok")))
            .unwrap();
        assert_eq!(late.await.unwrap().unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_unmatched_response_dropped() {
        let pool = Arc::new(Pool::new());
        let (conn, mut remote) = spawn_conn(&pool, "c1", Arc::new(EchoHandler));

        remote
            .inbound
            .unbounded_send(Ok(response_frame("no-such-id", b"stale")))
            .unwrap();

        // connection keeps working afterwards
        let request = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(b"live".to_vec()).await }
        });
        let msg = next_envelope(&mut remote).await;
        remote
            .inbound
            .unbounded_send(Ok(response_frame(&msg.id, b"fresh")))
            .unwrap();
        assert_eq!(request.await.unwrap().unwrap(), b"fresh");
        assert_eq!(conn.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_send_after_close_is_connection_closed() {
        let pool = Arc::new(Pool::new());
        let (conn, _remote) = spawn_conn(&pool, "c1", Arc::new(EchoHandler));

        conn.close();
        let err = conn.send(b"ping".to_vec()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert_eq!(conn.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_teardown_fails_inflight_waiters() {
        let pool = Arc::new(Pool::new());
        let (conn, mut remote) = spawn_conn(&pool, "c1", Arc::new(EchoHandler));

        let request = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(b"ping".to_vec()).await }
        });
        // wait until the request is on the wire, then sever the peer
        let _ = next_envelope(&mut remote).await;
        remote.inbound.close_channel();

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert_eq!(conn.pending_len(), 0);
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn test_request_dispatch_replies_with_same_id() {
        let pool = Arc::new(Pool::new());
        let (_conn, mut remote) = spawn_conn(&pool, "c1", Arc::new(EchoHandler));

        let request = Message {
            id: "req-7".to_string(),
            kind: MessageKind::Request,
            data: b"echo me".to_vec(),
        };
        remote
            .inbound
            .unbounded_send(Ok(Frame::Binary(
                WireFormat::Binary.encode(&request).unwrap(),
            )))
            .unwrap();

        let reply = next_envelope(&mut remote).await;
        assert_eq!(reply.kind, MessageKind::Response);
        assert_eq!(reply.id, "req-7");
        assert_eq!(reply.data, b"echo me");
    }

    #[tokio::test]
    async fn test_notify_fire_and_forget() {
        let pool = Arc::new(Pool::new());
        let (conn, mut remote) = spawn_conn(&pool, "c1", Arc::new(EchoHandler));

        conn.notify(b"event".to_vec()).await.unwrap();
        let msg = next_envelope(&mut remote).await;
        assert_eq!(msg.kind, MessageKind::Notify);
        assert_eq!(msg.data, b"event");
        assert_eq!(conn.pending_len(), 0);
    }

    /// A handler stuck on one request must not stop responses from being
    /// delivered to concurrent senders.
    #[tokio::test]
    async fn test_slow_handler_does_not_block_reads() {
        struct StuckHandler;

        #[async_trait]
        impl EventHandler for StuckHandler {
            async fn handle_request(&self, _event: Vec<u8>) -> Result<Vec<u8>> {
                poll_fn(|_| Poll::<()>::Pending).await;
                unreachable!()
            }

            async fn handle_notify(&self, _event: Vec<u8>) -> Result<()> {
                Ok(())
            }
        }

        let pool = Arc::new(Pool::new());
        let (conn, mut remote) = spawn_conn(&pool, "c1", Arc::new(StuckHandler));

        // occupy the handler
        let stuck = Message {
            id: "stuck".to_string(),
            kind: MessageKind::Request,
            data: vec![],
        };
        remote
            .inbound
            .unbounded_send(Ok(Frame::Binary(WireFormat::Binary.encode(&stuck).unwrap())))
            .unwrap();

        let request = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(b"ping".to_vec()).await }
        });
        let msg = next_envelope(&mut remote).await;
        remote
            .inbound
            .unbounded_send(Ok(response_frame(&msg.id, b"pong")))
            .unwrap();
        assert_eq!(request.await.unwrap().unwrap(), b"pong");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_keep_connection_alive() {
        let pool = Arc::new(Pool::new());
        let (_conn, remote) = spawn_conn(&pool, "c1", Arc::new(EchoHandler));

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            remote
                .inbound
                .unbounded_send(Ok(Frame::Pong(Vec::new())))
                .unwrap();
        }
        assert_eq!(pool.size(), 1);

        // silence past the read deadline tears the connection down
        tokio::time::sleep(PONG_WAIT + Duration::from_secs(2)).await;
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_blocks_producer() {
        struct StuckSink;

        impl Sink<Frame> for StuckSink {
            type Error = Error;

            fn poll_ready(
                self: Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> Poll<Result<()>> {
                Poll::Pending
            }

            fn start_send(self: Pin<&mut Self>, _item: Frame) -> Result<()> {
                unreachable!()
            }

            fn poll_flush(
                self: Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> Poll<Result<()>> {
                Poll::Ready(Ok(()))
            }

            fn poll_close(
                self: Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> Poll<Result<()>> {
                Poll::Ready(Ok(()))
            }
        }

        let (_in_tx, in_rx) = futures_channel::mpsc::unbounded::<Result<Frame>>();
        let pool = Arc::new(Pool::new());
        let conn = Conn::spawn_with_capacity(
            &CancellationToken::new(),
            pool.clone(),
            "c1",
            Box::pin(StuckSink),
            Box::pin(in_rx),
            Arc::new(EchoHandler),
            WireFormat::Binary,
            2,
        );

        // first item is dequeued into the stuck sink, two more fill the queue
        conn.notify(b"1".to_vec()).await.unwrap();
        tokio::task::yield_now().await;
        conn.notify(b"2".to_vec()).await.unwrap();
        conn.notify(b"3".to_vec()).await.unwrap();

        let blocked = timeout(Duration::from_millis(1), conn.notify(b"4".to_vec())).await;
        assert!(blocked.is_err());
    }
}
