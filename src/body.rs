use std::sync::Arc;

use bytes::Bytes;

use crate::channel::{CallbackChannel, Notification};
use crate::error::{BoxError, EngineError};

/// Produces the request body immediately before the first transport attempt.
///
/// The producer receives a progress callback reporting bytes produced so far
/// against the expected total. A producer failure surfaces as a Failure
/// notification with status 0 before any transport attempt is made.
pub trait BodyProducer: Send + Sync + 'static {
    fn produce(&self, progress: &mut dyn FnMut(u64, u64)) -> Result<Bytes, BoxError>;
}

#[derive(Clone, Default)]
pub(crate) enum RequestBody {
    #[default]
    Empty,
    Buffered(Bytes),
    Producer(Arc<dyn BodyProducer>),
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => formatter.write_str("Empty"),
            Self::Buffered(bytes) => formatter
                .debug_tuple("Buffered")
                .field(&bytes.len())
                .finish(),
            Self::Producer(_) => formatter.write_str("Producer"),
        }
    }
}

impl RequestBody {
    /// Resolves the body to bytes, once per task. Producer progress is
    /// forwarded as Progress notifications.
    pub(crate) fn materialize(&self, channel: &CallbackChannel) -> Result<Bytes, EngineError> {
        match self {
            Self::Empty => Ok(Bytes::new()),
            Self::Buffered(bytes) => Ok(bytes.clone()),
            Self::Producer(producer) => {
                let mut progress = |bytes_done: u64, bytes_total: u64| {
                    channel.send(Notification::Progress {
                        bytes_done,
                        bytes_total,
                    });
                };
                producer
                    .produce(&mut progress)
                    .map_err(|source| EngineError::BodyProducer { source })
            }
        }
    }
}
