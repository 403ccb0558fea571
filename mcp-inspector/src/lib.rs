//! Discover and exercise the tools, resources and prompts of any MCP server that speaks JSON-RPC
//! over its standard streams.
//!
//! The entry point is [`Bridge`]: start it with the command that launches the server, and it
//! takes care of the process, the `initialize` handshake, and caching the server's capability
//! listings.
mod bridge;
mod cache;
mod config;
mod error;
mod handshake;
mod process;
mod types;

#[cfg(test)]
mod testing;

pub use bridge::{Bridge, BridgeInfo, BridgeState};
pub use cache::CapabilityCache;
pub use config::BridgeOptions;
pub use error::{BridgeError, BridgeErrorKind, HandshakeError, ProcessError, Result};
pub use handshake::{HandshakeManager, HandshakeState, PROTOCOL_VERSION};
pub use process::{LaunchCommand, ProcessState, ProcessStdio, ServerProcess};
pub use types::*;

/// The JSON RPC layer the bridge is built on, for consumers that bring their own transport
pub use mcp_inspector_jsonrpc as jsonrpc;
