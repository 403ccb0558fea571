//! Defines the transport layer for the JSON-RPC client.
//!
//! The client only ever talks to one server over one pair of streams, so a transport is nothing
//! more than a way to read whole messages and a way to write them.  The two halves are separate
//! traits because they're owned by different parties: the background read loop owns the reader
//! for the whole life of the connection, while every caller shares the writer.
use crate::error::FramingError;

mod stream;

pub use stream::{LineReader, LineWriter};

/// The read half of a transport.
#[async_trait::async_trait]
pub trait MessageReader: Send {
    /// Read the next complete message from the transport.
    ///
    /// Returns `Ok(None)` once the transport has been closed by the other side.
    async fn read_message(&mut self) -> Result<Option<serde_json::Value>, FramingError>;
}

/// The write half of a transport.
#[async_trait::async_trait]
pub trait MessageWriter: Send {
    /// Write one complete, already-serialized message and flush it.
    async fn write_message(&mut self, message: &[u8]) -> std::io::Result<()>;
}
