//! Binding between tunnel events and an in-process HTTP handler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use tokio::time::timeout;
use tracing::error;

use backstream_shared::codec::WireFormat;
use backstream_shared::conn::EventHandler;
use backstream_shared::convert;
use backstream_shared::protocol::EventHttpRequest;
use backstream_shared::Result;

/// In-process request handler, the final destination of a proxied exchange.
///
/// Implemented for any `async Fn(Request<Bytes>) -> Response<Bytes>`.
#[async_trait]
pub trait HttpHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request<Bytes>) -> Response<Bytes>;
}

#[async_trait]
impl<F, Fut> HttpHandler for F
where
    F: Fn(Request<Bytes>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Response<Bytes>> + Send + 'static,
{
    async fn handle(&self, request: Request<Bytes>) -> Response<Bytes> {
        (self)(request).await
    }
}

/// Serves tunnel events by decoding them into HTTP requests, running the
/// wrapped handler and encoding the outcome.
///
/// The request-timeout header bounds the handler; an expired handler yields
/// an error so no reply goes out and the peer's own deadline reports it.
pub struct HttpEventHandler {
    handler: Arc<dyn HttpHandler>,
    format: WireFormat,
    default_timeout: Duration,
}

impl HttpEventHandler {
    pub fn new(handler: Arc<dyn HttpHandler>, format: WireFormat) -> Self {
        Self {
            handler,
            format,
            default_timeout: Duration::ZERO,
        }
    }

    /// Bounds handlers for requests that carry no timeout header. Zero, the
    /// default, means unbounded.
    pub fn with_default_timeout(mut self, default_timeout: Duration) -> Self {
        self.default_timeout = default_timeout;
        self
    }

    async fn run(&self, event: Vec<u8>) -> Result<Response<Bytes>> {
        let event: EventHttpRequest = self.format.decode(&event)?;
        let deadline = convert::event_request_timeout(&event.headers, self.default_timeout)?;
        let request = convert::request_from_event(&event)?;
        if deadline.is_zero() {
            Ok(self.handler.handle(request).await)
        } else {
            Ok(timeout(deadline, self.handler.handle(request)).await?)
        }
    }
}

#[async_trait]
impl EventHandler for HttpEventHandler {
    async fn handle_request(&self, event: Vec<u8>) -> Result<Vec<u8>> {
        let response = self.run(event).await?;
        let (parts, body) = response.into_parts();
        let event = convert::response_to_event(parts.status, &parts.headers, &body);
        self.format.encode(&event)
    }

    async fn handle_notify(&self, event: Vec<u8>) -> Result<()> {
        let _ = self.run(event).await?;
        Ok(())
    }
}

/// Contains panics from user handler code so one failed request can never
/// tear down the multiplexed tunnel. A contained panic yields an empty
/// reply, observable on the caller side as a decode failure or timeout.
pub struct RecoveryHandler {
    inner: Arc<dyn EventHandler>,
}

impl RecoveryHandler {
    pub fn new(inner: Arc<dyn EventHandler>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl EventHandler for RecoveryHandler {
    async fn handle_request(&self, event: Vec<u8>) -> Result<Vec<u8>> {
        let inner = self.inner.clone();
        match tokio::spawn(async move { inner.handle_request(event).await }).await {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "recovered panic in request handler");
                Ok(Vec::new())
            }
        }
    }

    async fn handle_notify(&self, event: Vec<u8>) -> Result<()> {
        let inner = self.inner.clone();
        match tokio::spawn(async move { inner.handle_notify(event).await }).await {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "recovered panic in notify handler");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backstream_shared::protocol::EventHttpResponse;
    use backstream_shared::Error;

    fn request_event(headers: &[(&str, &str)]) -> Vec<u8> {
        let event = EventHttpRequest {
            method: "GET".into(),
            raw_path: "/test".into(),
            raw_query: String::new(),
            headers: headers
                .iter()
                .map(|(key, value)| (key.to_string(), vec![value.to_string()]))
                .collect(),
            body: Vec::new(),
        };
        WireFormat::Binary.encode(&event).unwrap()
    }

    fn ok_handler() -> Arc<dyn HttpHandler> {
        Arc::new(|_request: Request<Bytes>| async move {
            let mut response = Response::new(Bytes::from_static(b"OK"));
            response
                .headers_mut()
                .append("x-test", http::HeaderValue::from_static("v"));
            response
        })
    }

    #[tokio::test]
    async fn test_request_event_round_trip() {
        let handler = HttpEventHandler::new(ok_handler(), WireFormat::Binary);
        let output = handler.handle_request(request_event(&[])).await.unwrap();
        let event: EventHttpResponse = WireFormat::Binary.decode(&output).unwrap();
        assert_eq!(event.status_code, 200);
        assert_eq!(event.headers["x-test"], vec!["v"]);
        assert_eq!(event.body, b"OK");
    }

    #[tokio::test]
    async fn test_notify_discards_response() {
        let handler = HttpEventHandler::new(ok_handler(), WireFormat::Binary);
        handler.handle_notify(request_event(&[])).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_header_bounds_handler() {
        let slow: Arc<dyn HttpHandler> = Arc::new(|_request: Request<Bytes>| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Response::new(Bytes::from_static(b"late"))
        });
        let handler = HttpEventHandler::new(slow, WireFormat::Binary);
        let event = request_event(&[("x-backstream-request-timeout", "200ms")]);
        let err = handler.handle_request(event).await.unwrap_err();
        assert!(matches!(err, Error::Elapsed));
    }

    #[tokio::test]
    async fn test_invalid_timeout_header_is_an_error() {
        let handler = HttpEventHandler::new(ok_handler(), WireFormat::Binary);
        let event = request_event(&[("x-backstream-request-timeout", "soon")]);
        let err = handler.handle_request(event).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTimeout(_)));
    }

    #[tokio::test]
    async fn test_recovery_contains_panics() {
        let panicking: Arc<dyn HttpHandler> = Arc::new(|_request: Request<Bytes>| async move {
            panic!("handler exploded");
            #[allow(unreachable_code)]
            Response::new(Bytes::new())
        });
        let inner = HttpEventHandler::new(panicking, WireFormat::Binary);
        let recovery = RecoveryHandler::new(Arc::new(inner));

        let output = recovery.handle_request(request_event(&[])).await.unwrap();
        assert!(output.is_empty());

        recovery.handle_notify(request_event(&[])).await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_passes_results_through() {
        let inner = HttpEventHandler::new(ok_handler(), WireFormat::Binary);
        let recovery = RecoveryHandler::new(Arc::new(inner));
        let output = recovery.handle_request(request_event(&[])).await.unwrap();
        let event: EventHttpResponse = WireFormat::Binary.decode(&output).unwrap();
        assert_eq!(event.body, b"OK");
    }
}
