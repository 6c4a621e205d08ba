//! Newline-delimited JSON message framing.
//!
//! Every channel in the system (client stdio, downstream tool-server stdio,
//! the worker control channel) carries one JSON object per
//! `\n`-terminated line. [`MessageReader`] deframes and parses; [`write_line`]
//! serializes and frames.
//!
//! Malformed lines are dropped without surfacing an error to the caller: the
//! peers are not adversarial, merely noisy (a subprocess may print a stray
//! diagnostic line to the shared pipe).

use std::io;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Reads newline-delimited JSON messages from an async byte stream.
pub struct MessageReader<R> {
    reader: BufReader<R>,
    buf: String,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Create a new message reader wrapping the given async reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: String::new(),
        }
    }

    /// Read the next parsed JSON message, returning `None` on EOF.
    ///
    /// Blank lines and lines that fail to parse as JSON are skipped.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if reading from the underlying stream fails.
    pub async fn next_value(&mut self) -> io::Result<Option<Value>> {
        loop {
            self.buf.clear();
            let n = self.reader.read_line(&mut self.buf).await?;
            if n == 0 {
                return Ok(None); // EOF
            }

            let trimmed = self.buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<Value>(trimmed) {
                Ok(v) => return Ok(Some(v)),
                Err(e) => {
                    tracing::warn!("dropping malformed wire message: {e}");
                    continue;
                }
            }
        }
    }
}

/// Serialize `msg` and write it as one newline-terminated line.
///
/// Flushes after the write so the peer sees the message immediately. The
/// serialized form never contains embedded newlines (`serde_json` compact
/// encoding).
///
/// # Errors
///
/// Returns an I/O error if writing or flushing fails; the caller treats this
/// as a stream error on the owning channel.
pub async fn write_line<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, msg: &Value) -> io::Result<()> {
    let serialized = serde_json::to_string(msg)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(serialized.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
