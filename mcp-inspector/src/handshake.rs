//! The one-time `initialize` exchange that has to happen before any other request.
use crate::config::BridgeOptions;
use crate::error::HandshakeError;
use crate::types::{Implementation, InitializeResult};
use mcp_inspector_jsonrpc::JsonRpcClient;
use serde::Serialize;
use std::time::Duration;
use tracing::*;

/// The MCP protocol revision the bridge speaks
pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    NotNegotiated,
    Negotiating,
    Ready,
    /// Terminal.  There are no retries; a new bridge has to be started.
    Failed,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams<'a> {
    protocol_version: &'a str,
    capabilities: serde_json::Map<String, serde_json::Value>,
    client_info: &'a Implementation,
}

/// Drives the handshake for one connection and remembers how it went.
#[derive(Debug)]
pub struct HandshakeManager {
    state: HandshakeState,
    client_info: Implementation,
    protocol_version: String,
    timeout: Duration,
}

impl HandshakeManager {
    pub fn new(options: &BridgeOptions) -> Self {
        Self {
            state: HandshakeState::NotNegotiated,
            client_info: options.client_info.clone(),
            protocol_version: options.protocol_version.clone(),
            timeout: options.handshake_timeout,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Send `initialize`, wait for the answer, then send `notifications/initialized`.
    ///
    /// This can be called exactly once.  Any failure leaves the manager in
    /// [`HandshakeState::Failed`] for good.
    #[instrument(skip_all, fields(protocol_version = %self.protocol_version))]
    pub async fn negotiate(
        &mut self,
        client: &JsonRpcClient,
    ) -> Result<InitializeResult, HandshakeError> {
        if self.state != HandshakeState::NotNegotiated {
            return Err(HandshakeError::AlreadyAttempted(self.state));
        }

        self.state = HandshakeState::Negotiating;
        match self.exchange(client).await {
            Ok(result) => {
                self.state = HandshakeState::Ready;
                Ok(result)
            }
            Err(e) => {
                error!(error = %e, "Handshake failed");
                self.state = HandshakeState::Failed;
                Err(e)
            }
        }
    }

    async fn exchange(&self, client: &JsonRpcClient) -> Result<InitializeResult, HandshakeError> {
        let params = InitializeParams {
            protocol_version: &self.protocol_version,
            capabilities: Default::default(),
            client_info: &self.client_info,
        };
        let params = serde_json::to_value(&params).map_err(HandshakeError::InvalidResult)?;

        let result = client
            .request("initialize", Some(params), Some(self.timeout))
            .await?;
        let result: InitializeResult =
            serde_json::from_value(result).map_err(HandshakeError::InvalidResult)?;

        if result.protocol_version != self.protocol_version {
            warn!(
                server_protocol_version = %result.protocol_version,
                "Server negotiated a different protocol version; carrying on anyway"
            );
        }

        info!(
            server = %result.server_info.name,
            version = %result.server_info.version,
            capabilities = ?result.capabilities,
            "Handshake complete"
        );

        client.notify("notifications/initialized", None).await?;

        Ok(result)
    }
}
