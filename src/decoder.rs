use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::channel::{CallbackChannel, Notification};
use crate::error::EngineError;
use crate::task::TaskState;
use crate::transport::BodyStream;

/// Response-body interpretation strategy, selected when the request is built.
///
/// Both variants read the body chunk by chunk, emit one Progress notification
/// per chunk, and observe cancellation between chunks. On cancellation the
/// buffer strategy discards its partial buffer; the file strategy stops
/// writing and leaves the partial file in place.
#[derive(Clone, Debug, Default)]
pub enum ResponseDecoder {
    #[default]
    Buffer,
    File {
        path: PathBuf,
    },
}

impl ResponseDecoder {
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::File {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub(crate) async fn decode(
        &self,
        body: BodyStream,
        bytes_total: Option<u64>,
        channel: &CallbackChannel,
        state: &TaskState,
    ) -> Result<DecodeOutcome, EngineError> {
        match self {
            Self::Buffer => decode_buffered(body, bytes_total, channel, state).await,
            Self::File { path } => decode_to_file(path, body, bytes_total, channel, state).await,
        }
    }
}

/// Decoded application data carried by a Success notification.
#[derive(Clone, Debug)]
pub enum DecodedBody {
    Buffered(Bytes),
    File { path: PathBuf, bytes_written: u64 },
}

impl DecodedBody {
    /// In-memory body bytes; empty for file-decoded responses.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Buffered(bytes) => bytes,
            Self::File { .. } => &[],
        }
    }

    pub fn buffered(&self) -> Option<&Bytes> {
        match self {
            Self::Buffered(bytes) => Some(bytes),
            Self::File { .. } => None,
        }
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(self.bytes()).into_owned()
    }

    pub fn json<T>(&self) -> Result<T, EngineError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(self.bytes()).map_err(|source| EngineError::Deserialize { source })
    }
}

pub(crate) enum DecodeOutcome {
    Complete(DecodedBody),
    Cancelled,
}

async fn decode_buffered(
    mut body: BodyStream,
    bytes_total: Option<u64>,
    channel: &CallbackChannel,
    state: &TaskState,
) -> Result<DecodeOutcome, EngineError> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = body.next().await {
        if state.observe_cancelled() {
            return Ok(DecodeOutcome::Cancelled);
        }
        let chunk = chunk.map_err(|source| EngineError::ReadBody { source })?;
        buffer.extend_from_slice(&chunk);
        channel.send(Notification::Progress {
            bytes_done: buffer.len() as u64,
            bytes_total: bytes_total.unwrap_or(0),
        });
    }
    Ok(DecodeOutcome::Complete(DecodedBody::Buffered(
        buffer.freeze(),
    )))
}

async fn decode_to_file(
    path: &Path,
    mut body: BodyStream,
    bytes_total: Option<u64>,
    channel: &CallbackChannel,
    state: &TaskState,
) -> Result<DecodeOutcome, EngineError> {
    let mut file = File::create(path).await.map_err(|source| EngineError::FileWrite {
        path: path.to_path_buf(),
        source,
    })?;
    let mut bytes_written: u64 = 0;
    while let Some(chunk) = body.next().await {
        if state.observe_cancelled() {
            return Ok(DecodeOutcome::Cancelled);
        }
        let chunk = chunk.map_err(|source| EngineError::ReadBody { source })?;
        file.write_all(&chunk)
            .await
            .map_err(|source| EngineError::FileWrite {
                path: path.to_path_buf(),
                source,
            })?;
        bytes_written += chunk.len() as u64;
        channel.send(Notification::Progress {
            bytes_done: bytes_written,
            bytes_total: bytes_total.unwrap_or(0),
        });
    }
    file.flush().await.map_err(|source| EngineError::FileWrite {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(DecodeOutcome::Complete(DecodedBody::File {
        path: path.to_path_buf(),
        bytes_written,
    }))
}
