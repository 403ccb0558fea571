//! A very minimal JSON-RPC client, with just enough functionality to talk to an MCP server over
//! its stdio streams.
//!
//! `jsonrpsee` has a much more complete client, but it does not allow for custom transports, and
//! the whole point here is to speak JSON RPC over the standard streams of a child process.  This
//! crate does borrow a few of the JSON-RPC types from `jsonrpsee-types`.
mod client;
mod error;
mod shared;
mod transport;

pub use client::JsonRpcClient;
pub use error::{ClientError, FramingError};
pub use shared::{ErrorCode, RequestId, RpcErrorObject, ServerMessage};
pub use transport::{LineReader, LineWriter, MessageReader, MessageWriter};

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::sync::OnceLock;
    use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

    static TRACING: OnceLock<()> = OnceLock::new();

    /// Initialize tracing for tests with a stdout subscriber.
    /// Safe to call multiple times - will only initialize once.
    pub fn init_test_logging() {
        TRACING.get_or_init(|| {
            let filter = std::env::var("RUST_LOG")
                .map(EnvFilter::new)
                .unwrap_or_else(|_| EnvFilter::new("debug"));

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_test_writer()
                .try_init()
                .ok();
        });
    }
}
