//! Line-delimited JSON framing.
//!
//! Both backend stream shapes (plain notification streams and JSON-RPC
//! request/response streams) carry exactly one JSON value per `\n`-terminated
//! line. [`JsonLineCodec`] carries any trailing partial line over to the next
//! read and drops malformed lines with a warning instead of failing the stream.

use std::sync::Arc;

use bytes::BytesMut;
use serde::Serialize;
use serde_json::Value;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tokio_util::codec::Decoder;

/// Maximum accepted line length: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Codec error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Stream closed")]
    Closed,
}

/// Decoder yielding one [`Value`] per complete line.
#[derive(Debug)]
pub struct JsonLineCodec {
    max_line: usize,
    /// Bytes of the buffer already searched for a newline.
    scanned: usize,
    /// Inside an oversized line; skip until the next newline.
    discarding: bool,
}

impl Default for JsonLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonLineCodec {
    /// Codec with the [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }

    /// Codec with a custom line limit.
    #[must_use]
    pub const fn with_max_line(max_line: usize) -> Self {
        Self {
            max_line,
            scanned: 0,
            discarding: false,
        }
    }
}

impl Decoder for JsonLineCodec {
    type Item = Value;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, CodecError> {
        loop {
            let from = self.scanned.min(src.len());
            let Some(offset) = src[from..].iter().position(|b| *b == b'\n') else {
                if src.len() > self.max_line {
                    tracing::warn!(
                        bytes = src.len(),
                        limit = self.max_line,
                        "Discarding oversized line"
                    );
                    src.clear();
                    self.discarding = true;
                    self.scanned = 0;
                } else {
                    self.scanned = src.len();
                }
                return Ok(None);
            };

            let newline = from + offset;
            let line = src.split_to(newline + 1);
            self.scanned = 0;

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if let Some(value) = parse_line(&line[..newline]) {
                return Ok(Some(value));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Value>, CodecError> {
        if let Some(value) = self.decode(src)? {
            return Ok(Some(value));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split();
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) {
            return Ok(None);
        }
        Ok(parse_line(&rest))
    }
}

/// Parse one line, logging and dropping anything that is not JSON.
fn parse_line(raw: &[u8]) -> Option<Value> {
    let trimmed = raw.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_slice(trimmed) {
        Ok(value) => Some(value),
        Err(e) => {
            let snippet: String = String::from_utf8_lossy(trimmed).chars().take(200).collect();
            tracing::warn!(error = %e, line = %snippet, "Dropping malformed line");
            None
        }
    }
}

/// Serialize `message` as one `\n`-terminated line.
///
/// # Errors
/// Returns error if serialization fails.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Shared writer for outbound frames.
///
/// Writes are serialized so concurrent senders never interleave lines.
#[derive(Clone)]
pub struct FrameWriter {
    inner: Arc<Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>>,
}

impl FrameWriter {
    /// Wrap a writable half.
    #[must_use]
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(writer)))),
        }
    }

    /// Write one frame and flush.
    ///
    /// # Errors
    /// Returns error if serialization or the write fails, or the writer was closed.
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<(), CodecError> {
        let bytes = encode_line(message)?;
        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or(CodecError::Closed)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shut the writer down. Later sends fail with [`CodecError::Closed`].
    pub async fn close(&self) {
        if let Some(mut writer) = self.inner.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("Frame writer shutdown: {e}");
            }
        }
    }
}
