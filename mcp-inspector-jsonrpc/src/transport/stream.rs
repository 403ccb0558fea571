//! Newline-delimited JSON framing over a pair of async streams, one for reading and one for
//! writing.
//!
//! This is the framing used by the MCP stdio transport: one complete JSON value per line, no
//! embedded newlines.  It is also handy for tests, which can connect a client to a fake server
//! with [`tokio::io::duplex`].
use super::{MessageReader, MessageWriter};
use crate::error::FramingError;
use std::fmt::{Debug, Formatter};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::*;

/// Reads one JSON value per line from a buffered reader.
pub struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R> Debug for LineReader<R>
where
    R: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineReader")
            .field("reader", &self.reader)
            .finish()
    }
}

impl<R> LineReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl<R> MessageReader for LineReader<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn read_message(&mut self) -> Result<Option<serde_json::Value>, FramingError> {
        loop {
            // Read raw bytes rather than `read_line`, so a line that isn't valid UTF-8 is reported
            // as a malformed frame instead of an I/O error that would end the stream.
            self.buf.clear();
            if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
                trace!("EOF on reader");
                return Ok(None);
            }

            let line = self.buf.trim_ascii();
            if line.is_empty() {
                continue;
            }

            trace!(frame = %String::from_utf8_lossy(line), "Read frame");
            return serde_json::from_slice(line)
                .map(Some)
                .map_err(|source| FramingError::Malformed {
                    line: String::from_utf8_lossy(line).into_owned(),
                    source,
                });
        }
    }
}

/// Writes one JSON value per line to a writer, flushing after each one.
pub struct LineWriter<W> {
    writer: W,
}

impl<W> Debug for LineWriter<W>
where
    W: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineWriter")
            .field("writer", &self.writer)
            .finish()
    }
}

impl<W> LineWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait::async_trait]
impl<W> MessageWriter for LineWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_message(&mut self, message: &[u8]) -> std::io::Result<()> {
        trace!(frame = %String::from_utf8_lossy(message), "Writing frame");
        self.writer.write_all(message).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}
