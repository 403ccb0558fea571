use crate::shared::{RequestId, RpcErrorObject};
use std::time::Duration;
use thiserror::Error;

/// Errors reading a single frame off the wire.
#[derive(Debug, Error)]
pub enum FramingError {
    /// The line wasn't valid JSON.  The stream itself is still usable; reading resumes at the next
    /// line.
    #[error("Malformed JSON RPC frame: {line}")]
    Malformed {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    /// The underlying stream failed.  There's no recovering from this.
    #[error("I/O error on JSON RPC stream")]
    Io(#[from] std::io::Error),
}

impl FramingError {
    /// Whether the reader can keep going after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FramingError::Malformed { .. })
    }
}

/// Ways a single call made with [`crate::JsonRpcClient`] can fail.
#[derive(Clone, Debug, Error)]
pub enum ClientError {
    /// The server answered, and the answer was an error.  This is local to the one request.
    #[error("Server returned an error: {0}")]
    Rpc(RpcErrorObject),

    /// The server didn't answer within the deadline.  The id is retired; a late answer is dropped.
    ///
    /// The deadline covers waiting for a turn to write as well, so `id` is `None` if the request
    /// never got as far as being given one.
    #[error("No response to '{method}' within {after:?}")]
    Timeout {
        method: String,
        id: Option<RequestId>,
        after: Duration,
    },

    /// The stream to the server is gone, either because the server went away or the stream broke.
    #[error("Connection to server lost: {reason}")]
    ConnectionLost { reason: String },

    /// The client was closed deliberately.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Request params couldn't be serialized.  Wrapped in `Arc` so that this type stays `Clone`.
    #[error("Error serializing request")]
    Serialize(#[source] std::sync::Arc<serde_json::Error>),
}

impl ClientError {
    pub(crate) fn lost(reason: impl Into<String>) -> Self {
        ClientError::ConnectionLost {
            reason: reason.into(),
        }
    }
}
