use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use futures_util::TryStreamExt;
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyDataStream, Full};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tokio::time::timeout;

use crate::error::{BoxError, EngineError, TransportErrorKind};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

/// A request immediately before a transport attempt: headers merged, body
/// fully materialized.
#[derive(Clone, Debug)]
pub struct PreparedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Raw response yielded by a transport attempt. The body is consumed by a
/// response decoder, not by the transport.
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub body: BodyStream,
}

impl TransportResponse {
    /// Response over an already-buffered body. Intended for transports that
    /// do not stream, and for tests.
    pub fn buffered(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let content_length = Some(body.len() as u64);
        let body: BodyStream = Box::pin(futures_util::stream::once(async move { Ok(body) }));
        Self {
            status,
            headers,
            content_length,
            body,
        }
    }
}

/// Transport-level failure. `request_sent` reports whether any request bytes
/// reached the wire; the retry policy uses it for its idempotency heuristic.
#[derive(Debug, Error)]
#[error("{kind}: {source}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub request_sent: bool,
    #[source]
    pub source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, request_sent: bool, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            request_sent,
            source: source.into(),
        }
    }
}

/// Executes one prepared request. Connection pooling, TLS policy, redirects
/// and timeouts all live behind this seam.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn execute(&self, request: &PreparedRequest) -> Result<TransportResponse, TransportError>;
}

type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Default transport: hyper legacy client over rustls (ring provider, webpki
/// roots), HTTP/1.1 and HTTP/2, one timeout per attempt.
pub struct HyperTransport {
    client: HttpsClient,
    request_timeout: Duration,
}

impl HyperTransport {
    pub fn new() -> Result<Self, EngineError> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(request_timeout: Duration) -> Result<Self, EngineError> {
        let https = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|source| EngineError::TransportInit {
                message: source.to_string(),
            })?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(https);
        Ok(Self {
            client,
            request_timeout: request_timeout.max(Duration::from_millis(1)),
        })
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn execute(&self, request: &PreparedRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = http::Request::builder()
            .method(request.method.clone())
            .uri(request.uri.clone());
        if let Some(headers) = builder.headers_mut() {
            *headers = request.headers.clone();
        }
        let http_request = builder.body(Full::new(request.body.clone())).map_err(|source| {
            TransportError::new(TransportErrorKind::OtherIo, false, source)
        })?;

        let response = match timeout(self.request_timeout, self.client.request(http_request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => return Err(classify_hyper_error(error)),
            Err(_) => {
                return Err(TransportError::new(
                    TransportErrorKind::Timeout,
                    true,
                    format!(
                        "transport attempt exceeded {}ms",
                        self.request_timeout.as_millis()
                    ),
                ));
            }
        };

        let (parts, body) = response.into_parts();
        let content_length = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let body: BodyStream = Box::pin(
            BodyDataStream::new(body).map_err(|source| Box::new(source) as BoxError),
        );
        Ok(TransportResponse {
            status: parts.status,
            headers: parts.headers,
            content_length,
            body,
        })
    }
}

fn classify_hyper_error(error: hyper_util::client::legacy::Error) -> TransportError {
    let text = error.to_string().to_ascii_lowercase();
    if error.is_connect() {
        let kind = if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            TransportErrorKind::UnknownHost
        } else if text.contains("tls") || text.contains("certificate") || text.contains("handshake")
        {
            TransportErrorKind::Tls
        } else {
            TransportErrorKind::Socket
        };
        return TransportError::new(kind, false, error);
    }

    let kind = if text.contains("connection closed")
        || text.contains("incomplete message")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
    {
        TransportErrorKind::NoResponse
    } else {
        TransportErrorKind::OtherIo
    };
    TransportError::new(kind, true, error)
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    #[tokio::test]
    async fn buffered_response_streams_its_body_in_one_chunk() {
        let mut response = TransportResponse::buffered(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(b"ok"),
        );
        assert_eq!(response.content_length, Some(2));
        let chunk = response.body.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"ok");
        assert!(response.body.next().await.is_none());
    }
}
