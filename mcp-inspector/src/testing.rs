//! An in-process fake MCP server for tests, connected to the code under test through in-memory
//! pipes instead of a child process.
use crate::handshake::PROTOCOL_VERSION;
use crate::test_helpers::init_test_logging;
use mcp_inspector_jsonrpc::{
    JsonRpcClient, LineReader, LineWriter, MessageReader, MessageWriter, RpcErrorObject,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{BufReader, DuplexStream};

/// What the fake server does with a request
#[derive(Debug)]
pub(crate) enum Reply {
    Result(Value),
    Error(RpcErrorObject),
    /// Never answer
    Silent,
    /// Answer, but only after a while
    Delayed(Duration, Box<Reply>),
    /// Close both streams, as if the server had died
    Hangup,
}

impl Reply {
    pub fn result(value: Value) -> Self {
        Reply::Result(value)
    }

    pub fn error(code: i64, message: &str) -> Self {
        Reply::Error(RpcErrorObject::new(code, message))
    }

    async fn deliver(self, id: Value, writer: SharedWriter) {
        let mut reply = self;
        while let Reply::Delayed(after, inner) = reply {
            tokio::time::sleep(after).await;
            reply = *inner;
        }

        let message = match reply {
            Reply::Result(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Reply::Error(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
            Reply::Silent | Reply::Hangup | Reply::Delayed(..) => return,
        };

        if let Some(writer) = writer.lock().await.as_mut() {
            let _ = writer.write_message(message.to_string().as_bytes()).await;
        }
    }
}

type Handler = dyn Fn(&str, Option<&Value>) -> Reply + Send + Sync;
type SharedWriter = Arc<tokio::sync::Mutex<Option<LineWriter<DuplexStream>>>>;

/// The client's ends of the pipes to a fake server
pub(crate) type ClientTransport = (LineReader<BufReader<DuplexStream>>, LineWriter<DuplexStream>);

#[derive(Clone)]
pub(crate) struct FakeServer {
    handler: Arc<Handler>,

    /// Every request and notification received, in order
    log: Arc<Mutex<Vec<(String, Option<Value>)>>>,
}

impl FakeServer {
    pub fn new(handler: impl Fn(&str, Option<&Value>) -> Reply + Send + Sync + 'static) -> Self {
        init_test_logging();
        Self {
            handler: Arc::new(handler),
            log: Default::default(),
        }
    }

    /// A well-behaved server declaring `capabilities`, with one tool (`echo`), one resource and
    /// one prompt (`greet`).
    pub fn standard(capabilities: Value) -> Self {
        Self::new(move |method, params| standard_reply(&capabilities, method, params))
    }

    /// Start serving a new connection and return the client's end of it
    pub fn transport(&self) -> ClientTransport {
        let (client_rx, server_tx) = tokio::io::duplex(64 * 1024);
        let (server_rx, client_tx) = tokio::io::duplex(64 * 1024);

        tokio::spawn(self.clone().serve(
            LineReader::new(BufReader::new(server_rx)),
            LineWriter::new(server_tx),
        ));

        (
            LineReader::new(BufReader::new(client_rx)),
            LineWriter::new(client_tx),
        )
    }

    pub fn connect(&self) -> JsonRpcClient {
        let (reader, writer) = self.transport();
        JsonRpcClient::new(reader, writer)
    }

    async fn serve(
        self,
        mut reader: LineReader<BufReader<DuplexStream>>,
        writer: LineWriter<DuplexStream>,
    ) {
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(Some(writer)));

        while let Ok(Some(message)) = reader.read_message().await {
            let method = message["method"].as_str().unwrap_or_default().to_string();
            let params = message.get("params").cloned();
            self.log.lock().unwrap().push((method.clone(), params.clone()));

            let Some(id) = message.get("id").cloned() else {
                continue;
            };

            match (self.handler)(&method, params.as_ref()) {
                Reply::Hangup => {
                    writer.lock().await.take();
                    return;
                }
                // Answer each request independently so a slow one doesn't hold up the rest
                reply => {
                    tokio::spawn(reply.deliver(id, writer.clone()));
                }
            }
        }
    }

    /// Methods of everything received so far, requests and notifications alike
    pub fn calls(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .map(|(method, _)| method.clone())
            .collect()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls().iter().filter(|m| *m == method).count()
    }

    /// The params of the first message received with this method
    pub fn params_of(&self, method: &str) -> Option<Value> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .find(|(m, _)| m == method)
            .and_then(|(_, params)| params.clone())
    }

    /// Notifications are fire-and-forget, so tests that look for them have to wait a moment
    pub async fn wait_for_calls(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.calls().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("fake server never received the expected messages");
    }
}

pub(crate) fn standard_reply(capabilities: &Value, method: &str, params: Option<&Value>) -> Reply {
    let params = params.cloned().unwrap_or(Value::Null);

    match method {
        "initialize" => Reply::result(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": capabilities,
            "serverInfo": {"name": "fake-server", "version": "0.1.0"}
        })),
        "tools/list" => Reply::result(json!({
            "tools": [{
                "name": "echo",
                "description": "Echoes its arguments back",
                "inputSchema": {
                    "type": "object",
                    "properties": {"text": {"type": "string", "description": "What to echo"}},
                    "required": ["text"]
                }
            }]
        })),
        "resources/list" => Reply::result(json!({
            "resources": [{"uri": "file:///readme.md", "name": "README", "mimeType": "text/markdown"}]
        })),
        "prompts/list" => Reply::result(json!({
            "prompts": [{
                "name": "greet",
                "description": "Say hello",
                "arguments": [{"name": "who", "required": true}]
            }]
        })),
        "tools/call" => match params["name"].as_str() {
            Some("echo") => Reply::result(json!({
                "content": [{"type": "text", "text": params["arguments"].to_string()}],
                "structuredContent": params["arguments"]
            })),
            _ => Reply::error(-32602, "Unknown tool"),
        },
        "resources/read" => match params["uri"].as_str() {
            Some("file:///readme.md") => Reply::result(json!({
                "contents": [{"uri": "file:///readme.md", "mimeType": "text/markdown", "text": "# Hello"}]
            })),
            _ => Reply::error(-32002, "not found"),
        },
        "prompts/get" => match (params["name"].as_str(), params["arguments"]["who"].as_str()) {
            (Some("greet"), Some(who)) => Reply::result(json!({
                "messages": [{"role": "user", "content": {"type": "text", "text": format!("Hello, {who}!")}}]
            })),
            (Some("greet"), None) => Reply::error(-32602, "Missing required argument: who"),
            _ => Reply::error(-32602, "Unknown prompt"),
        },
        _ => Reply::error(-32601, "Method not found"),
    }
}
