//! HTTP ↔ event translation.
//!
//! Lossless modulo the header-name lowercasing that the `http` crate
//! performs on its own: all keys survive, each key's value order survives,
//! bodies are byte-exact.

use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri};

use crate::error::{Error, Result};
use crate::protocol::{EventHttpRequest, EventHttpResponse, Headers};
use crate::HEADER_REQUEST_TIMEOUT;

/// Bound for one proxy exchange when the request carries no timeout header.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

pub fn headers_to_event(headers: &HeaderMap) -> Headers {
    let mut map = Headers::new();
    for key in headers.keys() {
        let values = headers
            .get_all(key)
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .collect();
        map.insert(key.as_str().to_owned(), values);
    }
    map
}

pub fn headers_from_event(headers: &Headers) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (key, values) in headers {
        let name =
            HeaderName::from_bytes(key.as_bytes()).map_err(|err| Error::Header(err.to_string()))?;
        for value in values {
            let value =
                HeaderValue::from_str(value).map_err(|err| Error::Header(err.to_string()))?;
            map.append(name.clone(), value);
        }
    }
    Ok(map)
}

/// Builds the request event for an inbound proxy request. Path and query are
/// taken verbatim, still percent-encoded.
pub fn request_to_event(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> EventHttpRequest {
    EventHttpRequest {
        method: method.as_str().to_owned(),
        raw_path: uri.path().to_owned(),
        raw_query: uri.query().unwrap_or_default().to_owned(),
        headers: headers_to_event(headers),
        body: body.to_vec(),
    }
}

/// Synthesizes the request served by the agent's in-process handler. The
/// localhost authority is a placeholder; the request never goes on the wire.
pub fn request_from_event(event: &EventHttpRequest) -> Result<Request<Bytes>> {
    let mut uri = format!("http://localhost{}", event.raw_path);
    if !event.raw_query.is_empty() {
        uri.push('?');
        uri.push_str(&event.raw_query);
    }
    let method = Method::from_bytes(event.method.as_bytes())
        .map_err(|err| Error::InvalidEvent(err.to_string()))?;
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Bytes::copy_from_slice(&event.body))
        .map_err(|err| Error::InvalidEvent(err.to_string()))?;
    *request.headers_mut() = headers_from_event(&event.headers)?;
    Ok(request)
}

pub fn response_to_event(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> EventHttpResponse {
    EventHttpResponse {
        status_code: status.as_u16(),
        headers: headers_to_event(headers),
        body: body.to_vec(),
    }
}

pub fn response_from_event(event: &EventHttpResponse) -> Result<Response<Bytes>> {
    let status = StatusCode::from_u16(event.status_code)
        .map_err(|err| Error::InvalidEvent(err.to_string()))?;
    let mut response = Response::builder()
        .status(status)
        .body(Bytes::copy_from_slice(&event.body))
        .map_err(|err| Error::InvalidEvent(err.to_string()))?;
    *response.headers_mut() = headers_from_event(&event.headers)?;
    Ok(response)
}

/// Resolves the exchange deadline from the timeout header, falling back to
/// `default` when the header is absent. A malformed value is an error that
/// surfaces to the caller.
pub fn request_timeout(headers: &HeaderMap, default: Duration) -> Result<Duration> {
    match headers.get(HEADER_REQUEST_TIMEOUT) {
        None => Ok(default),
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|err| Error::Header(err.to_string()))?;
            humantime::parse_duration(value).map_err(|_| Error::InvalidTimeout(value.to_owned()))
        }
    }
}

/// [`request_timeout`] for event headers, which keep the peer's casing.
pub fn event_request_timeout(headers: &Headers, default: Duration) -> Result<Duration> {
    let value = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(HEADER_REQUEST_TIMEOUT))
        .and_then(|(_, values)| values.first());
    match value {
        None => Ok(default),
        Some(value) => {
            humantime::parse_duration(value).map_err(|_| Error::InvalidTimeout(value.clone()))
        }
    }
}
