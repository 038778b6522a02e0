use std::path::PathBuf;

use http::Method;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Category attached to every transport-level failure. The retry policy
/// decides on categories, never on concrete error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportErrorKind {
    /// The peer accepted the connection but dropped it without a response.
    NoResponse,
    /// Name resolution failed.
    UnknownHost,
    /// A socket-level failure before the request could be written.
    Socket,
    /// The attempt exceeded the transport's per-attempt timeout.
    Timeout,
    /// TLS handshake or certificate failure.
    Tls,
    /// Any other I/O failure.
    OtherIo,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::NoResponse => "no_response",
            Self::UnknownHost => "unknown_host",
            Self::Socket => "socket",
            Self::Timeout => "timeout",
            Self::Tls => "tls",
            Self::OtherIo => "other_io",
        };
        formatter.write_str(text)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("no valid uri scheme was provided: {uri}")]
    MissingScheme { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http status error {status} for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("request body producer failed: {source}")]
    BodyProducer {
        #[source]
        source: BoxError,
    },
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: BoxError,
    },
    #[error("failed to write response body to {path}: {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode response json: {source}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to initialize transport: {message}")]
    TransportInit { message: String },
    #[error("callback delivery context is closed")]
    DeliveryContextClosed,
    #[error("no tokio runtime is available on the current thread")]
    RuntimeUnavailable,
    #[error("user notification handler panicked: {message}")]
    HandlerPanic { message: String },
}

impl EngineError {
    /// Transport category of this error, if it carries one.
    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// True for failures that must never be retried regardless of policy.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidUri { .. } | Self::MissingScheme { .. } | Self::BodyProducer { .. }
        )
    }
}
