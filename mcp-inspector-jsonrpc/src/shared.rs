//! JSON RPC message types shared by the framer and the client.
//!
//! Outgoing messages are serialized from small borrowed structs.  Incoming messages are parsed
//! into a [`serde_json::Value`] by the framer first and then classified here, because a message
//! from the server can be a response, a notification, or a request of its own, and the only way
//! to tell them apart is by which fields are present.
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Re-use the bits of jsonrpsee that are handy for the client side, pretending as if these are
/// our own types
pub use jsonrpsee_types::{ErrorCode, TwoPointZero};

/// Request identifiers are allocated by the client, so they are always plain integers.  Servers
/// are free to echo back anything, which is why incoming ids are matched as raw JSON.
pub type RequestId = u64;

/// A method invocation sent to the server
#[derive(Debug, Serialize)]
pub(crate) struct OutgoingRequest<'a> {
    pub jsonrpc: TwoPointZero,
    pub id: RequestId,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

/// A fire-and-forget notification sent to the server
#[derive(Debug, Serialize)]
pub(crate) struct OutgoingNotification<'a> {
    pub jsonrpc: TwoPointZero,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

/// The reply the client sends when the server makes a request of its own.
#[derive(Debug, Serialize)]
pub(crate) struct OutgoingResponse<'a> {
    pub jsonrpc: TwoPointZero,
    pub id: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

/// The `error` member of a JSON RPC response.
///
/// jsonrpsee has `ErrorObjectOwned`, but its borrowed fields make it awkward to deserialize out of
/// an owned `Value`, and the client needs to keep the error around after the frame it came from is
/// long gone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(code: impl Into<i64>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Build an error object from one of the error codes defined by the JSON RPC spec, using the
    /// spec's canonical message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code.code(), code.message())
    }
}

impl std::fmt::Display for RpcErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Possible kinds of message received by a JSON RPC client from the server it's talking to
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    /// The answer to one of our requests.  `id` is whatever the server sent, which is usually but
    /// not necessarily one of our integer ids.
    Response {
        id: Value,
        payload: Result<Value, RpcErrorObject>,
    },

    /// A server-initiated method invocation.  The server expects an answer.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },

    /// A server-initiated notification; no answer is expected or allowed
    Notification {
        method: String,
        params: Option<Value>,
    },

    /// Valid JSON that is not a JSON RPC message we can make sense of
    Invalid(Value),
}

impl ServerMessage {
    /// Classify an already-parsed JSON value.
    ///
    /// Anything with a `method` is a request or notification, regardless of whether it also
    /// carries `result` or `error`.  This matters: a server request whose id happens to equal one
    /// of our pending ids must never be mistaken for the response to it.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut object) = value else {
            return ServerMessage::Invalid(value);
        };

        let id = object.remove("id");
        let params = object.remove("params");

        if let Some(method) = object.get("method").and_then(Value::as_str) {
            let method = method.to_string();
            return match id {
                Some(id) => ServerMessage::Request { id, method, params },
                None => ServerMessage::Notification { method, params },
            };
        }

        let Some(id) = id else {
            return ServerMessage::Invalid(Value::Object(object));
        };

        if let Some(error) = object.remove("error") {
            return match serde_json::from_value::<RpcErrorObject>(error) {
                Ok(error) => ServerMessage::Response {
                    id,
                    payload: Err(error),
                },
                Err(_) => {
                    object.insert("id".to_string(), id);
                    ServerMessage::Invalid(Value::Object(object))
                }
            };
        }

        // `result` may legitimately be `null`, so presence of the key is what counts
        match object.remove("result") {
            Some(result) => ServerMessage::Response {
                id,
                payload: Ok(result),
            },
            None => {
                object.insert("id".to_string(), id);
                ServerMessage::Invalid(Value::Object(object))
            }
        }
    }
}

/// Interpret an incoming `id` as one of the ids this client could have allocated.  Ours are
/// always non-negative integers, so anything else (including `"1"`) belongs to somebody else.
pub(crate) fn as_request_id(id: &Value) -> Option<RequestId> {
    id.as_u64()
}
