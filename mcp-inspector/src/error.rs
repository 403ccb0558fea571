use crate::bridge::BridgeState;
use crate::handshake::HandshakeState;
use mcp_inspector_jsonrpc::{ClientError, RpcErrorObject};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Failures launching the server process.  Each way a launch can go wrong is its own variant so
/// that callers can tell a typo in the command from a server that crashes on startup.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("The server command is empty")]
    EmptyCommand,

    #[error("Executable '{program}' not found")]
    NotFound {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Permission denied executing '{program}'")]
    PermissionDenied {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("The server process {} before the handshake completed", exit_description(.code))]
    ExitedEarly {
        code: Option<i32>,
        /// The last few lines the server wrote to stderr, which usually say why
        stderr: Vec<String>,
    },
}

pub(crate) fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with status {code}"),
        None => "was killed by a signal".to_string(),
    }
}

/// Failures negotiating the `initialize` handshake.  Any of these makes the bridge unusable.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Server rejected the initialize request: {0}")]
    Rejected(RpcErrorObject),

    #[error("Server did not answer the initialize request within {0:?}")]
    TimedOut(Duration),

    #[error("Connection lost during the handshake: {0}")]
    ConnectionLost(String),

    #[error("Server sent an invalid initialize result")]
    InvalidResult(#[source] serde_json::Error),

    #[error("Transport error during the handshake")]
    Transport(#[source] ClientError),

    #[error("The handshake can only be attempted once (state is {0})")]
    AlreadyAttempted(HandshakeState),
}

impl From<ClientError> for HandshakeError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Rpc(error) => HandshakeError::Rejected(error),
            ClientError::Timeout { after, .. } => HandshakeError::TimedOut(after),
            ClientError::ConnectionLost { reason } => HandshakeError::ConnectionLost(reason),
            other => HandshakeError::Transport(other),
        }
    }
}

/// Every way a bridge operation can fail.
///
/// `Rpc` and `Timeout` concern only the one call that produced them.  `Handshake`,
/// `ConnectionLost` and `ConnectionClosed` mean the bridge as a whole is done for and has to be
/// restarted.
#[derive(Debug, Error, strum::AsRefStr, strum::EnumDiscriminants)]
#[strum_discriminants(derive(Serialize), name(BridgeErrorKind))]
pub enum BridgeError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The server answered the request with an error
    #[error("Server returned an error: {0}")]
    Rpc(RpcErrorObject),

    #[error("No response to '{method}' within {after:?}")]
    Timeout { method: String, after: Duration },

    /// The operation isn't valid in the bridge's current state
    #[error("The bridge is not ready (state is {state})")]
    NotReady { state: BridgeState },

    #[error("Connection to the server lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Connection to the server closed")]
    ConnectionClosed,

    #[error("The bridge is already started")]
    AlreadyStarted,

    /// The server answered with something the protocol doesn't allow
    #[error("Invalid response to '{method}': {reason}")]
    InvalidResponse { method: String, reason: String },

    #[error("Failed to serialize request")]
    InvalidRequest(#[source] Arc<serde_json::Error>),
}

impl BridgeError {
    pub fn kind(&self) -> BridgeErrorKind {
        self.into()
    }

    /// Extra structured information for consumers, beyond the message.
    fn details(&self) -> Option<serde_json::Value> {
        match self {
            BridgeError::Rpc(error) => serde_json::to_value(error).ok(),
            BridgeError::Process(ProcessError::ExitedEarly { code, stderr }) => {
                Some(serde_json::json!({ "code": code, "stderr": stderr }))
            }
            _ => {
                let mut chain = Vec::new();
                let mut source = std::error::Error::source(self);
                while let Some(e) = source {
                    chain.push(e.to_string());
                    source = e.source();
                }
                (!chain.is_empty()).then(|| serde_json::json!(chain))
            }
        }
    }
}

impl From<ClientError> for BridgeError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Rpc(error) => BridgeError::Rpc(error),
            ClientError::Timeout { method, after, .. } => BridgeError::Timeout { method, after },
            ClientError::ConnectionLost { reason } => BridgeError::ConnectionLost { reason },
            ClientError::ConnectionClosed => BridgeError::ConnectionClosed,
            ClientError::Serialize(e) => BridgeError::InvalidRequest(e),
        }
    }
}

/// Serializes to the structured error description consumers get: the kind of error, a human
/// readable message, and whatever details are available.
impl Serialize for BridgeError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("BridgeError", 3)?;
        state.serialize_field("kind", self.as_ref())?;
        state.serialize_field("message", &self.to_string())?;
        state.serialize_field("details", &self.details())?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_error_serialization() {
        let mut error = RpcErrorObject::new(-32002, "not found");
        error.data = Some(serde_json::json!({"uri": "file:///missing"}));
        let e = BridgeError::from(ClientError::Rpc(error));

        expect_test::expect![[r#"
            {
              "kind": "Rpc",
              "message": "Server returned an error: not found (code -32002)",
              "details": {
                "code": -32002,
                "message": "not found",
                "data": {
                  "uri": "file:///missing"
                }
              }
            }"#]]
        .assert_eq(&serde_json::to_string_pretty(&e).unwrap());
    }

    #[test]
    fn process_error_serialization() {
        let e = BridgeError::from(ProcessError::NotFound {
            program: "no-such-server".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });

        expect_test::expect![[r#"
            {
              "kind": "Process",
              "message": "Executable 'no-such-server' not found",
              "details": [
                "entity not found"
              ]
            }"#]]
        .assert_eq(&serde_json::to_string_pretty(&e).unwrap());
    }

    #[test]
    fn early_exit_serialization() {
        let e = BridgeError::from(ProcessError::ExitedEarly {
            code: Some(3),
            stderr: vec!["missing API key".to_string()],
        });

        expect_test::expect![[r#"
            {
              "kind": "Process",
              "message": "The server process exited with status 3 before the handshake completed",
              "details": {
                "code": 3,
                "stderr": [
                  "missing API key"
                ]
              }
            }"#]]
        .assert_eq(&serde_json::to_string_pretty(&e).unwrap());
    }

    #[test]
    fn not_ready_serialization() {
        let e = BridgeError::NotReady {
            state: BridgeState::NotStarted,
        };
        assert_eq!(e.kind(), BridgeErrorKind::NotReady);

        expect_test::expect![[r#"
            {
              "kind": "NotReady",
              "message": "The bridge is not ready (state is not_started)",
              "details": null
            }"#]]
        .assert_eq(&serde_json::to_string_pretty(&e).unwrap());
    }
}
