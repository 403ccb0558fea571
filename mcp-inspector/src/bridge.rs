//! The public face of the crate: one [`Bridge`] per MCP server.
//!
//! A bridge goes through `NotStarted -> Starting -> Ready`, and back to `NotStarted` on
//! [`Bridge::shutdown`].  Starting can fail (`Failed`), and a ready bridge whose server goes away
//! is `Disconnected`.  From either of those it can be started again; there are no automatic
//! retries.
use crate::cache::CapabilityCache;
use crate::config::BridgeOptions;
use crate::error::{BridgeError, HandshakeError, ProcessError, Result};
use crate::handshake::HandshakeManager;
use crate::process::{LaunchCommand, ProcessState, ServerProcess};
use crate::types::{InitializeResult, Prompt, Resource, Tool};
use mcp_inspector_jsonrpc::{JsonRpcClient, LineReader, LineWriter, MessageReader, MessageWriter};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::BufReader;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::*;

/// How long to wait for the server process to be reaped, when the handshake dies with the
/// connection, before deciding the process isn't the reason
const EXIT_DIAGNOSIS_WAIT: Duration = Duration::from_millis(500);

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display, strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    NotStarted,
    Starting,
    Ready,
    /// The last start attempt failed
    Failed,
    /// Was ready, but the connection to the server is gone
    Disconnected,
}

enum Lifecycle {
    NotStarted,
    Starting {
        cancel: CancellationToken,
        /// Cancelled once the start attempt has finished cleaning up after itself
        stopped: CancellationToken,
    },
    Ready(Arc<Session>),
    Failed {
        error: String,
    },
}

impl Lifecycle {
    fn state(&self) -> BridgeState {
        match self {
            Lifecycle::NotStarted => BridgeState::NotStarted,
            Lifecycle::Starting { .. } => BridgeState::Starting,
            Lifecycle::Ready(session) if session.client.is_closed() => BridgeState::Disconnected,
            Lifecycle::Ready(_) => BridgeState::Ready,
            Lifecycle::Failed { .. } => BridgeState::Failed,
        }
    }
}

/// Everything belonging to one successful connection to a server
#[derive(Debug)]
struct Session {
    client: JsonRpcClient,
    /// `None` when connected to a transport rather than a process we launched, and after shutdown
    process: tokio::sync::Mutex<Option<ServerProcess>>,
    command: Option<LaunchCommand>,
    pid: Option<u32>,
    server: InitializeResult,
    cache: CapabilityCache,
}

impl Session {
    async fn shutdown(&self, grace: Duration) {
        // Releases everyone waiting on a response before the process is taken down
        self.client.close();

        if let Some(mut process) = self.process.lock().await.take() {
            process.shutdown(grace).await;
        }
    }
}

/// Summary of the bridge and the server it's connected to
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeInfo {
    pub state: BridgeState,
    /// The command the server was launched with
    pub command: Option<String>,
    pub pid: Option<u32>,
    /// What the server said about itself in the handshake
    pub server: Option<InitializeResult>,
    /// Why the bridge isn't ready, if it failed or was disconnected
    pub error: Option<String>,
}

/// A connection to one MCP server.
///
/// All operations take `&self`, so a bridge can be shared between tasks (in an `Arc`) and used
/// concurrently; requests are multiplexed over the one connection.
pub struct Bridge {
    options: BridgeOptions,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("options", &self.options)
            .field("state", &self.state())
            .finish()
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(BridgeOptions::default())
    }
}

impl Bridge {
    pub fn new(options: BridgeOptions) -> Self {
        Self {
            options,
            lifecycle: Mutex::new(Lifecycle::NotStarted),
        }
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    pub fn state(&self) -> BridgeState {
        self.lifecycle().state()
    }

    /// Launch the server, perform the handshake and cache its capability listings.
    ///
    /// On success the bridge is `Ready`.  On failure the process (if it got as far as running)
    /// has been shut down again and the bridge is `Failed`.
    #[instrument(skip(self, command), fields(command = %command))]
    pub async fn start(&self, command: LaunchCommand) -> Result<()> {
        let mut guard = self.begin_start().await?;
        let outcome = self.launch(&command, &guard.cancel).await;
        self.finish_start(&mut guard, outcome).await
    }

    /// Like [`Self::start`], but talk to a server over an already-established transport instead
    /// of launching a process.  Shutting down closes the transport but there's no process to
    /// stop.
    #[instrument(skip_all)]
    pub async fn start_with_transport(
        &self,
        reader: impl MessageReader + 'static,
        writer: impl MessageWriter + 'static,
    ) -> Result<()> {
        let mut guard = self.begin_start().await?;
        let client = JsonRpcClient::new(reader, writer);
        let outcome = match self.connect(&client, &guard.cancel).await {
            Ok((server, cache)) => Ok(Session {
                client,
                process: Default::default(),
                command: None,
                pid: None,
                server,
                cache,
            }),
            Err(e) => {
                client.close();
                Err(e)
            }
        };
        self.finish_start(&mut guard, outcome).await
    }

    /// Stop the server and return to `NotStarted`.
    ///
    /// Everyone waiting on a response gets [`BridgeError::ConnectionClosed`].  A start in
    /// progress is abandoned.  Calling this on a bridge that isn't running does nothing.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::NotStarted);

        match previous {
            Lifecycle::Starting { cancel, stopped } => {
                debug!("Abandoning start in progress");
                cancel.cancel();
                stopped.cancelled().await;
            }
            Lifecycle::Ready(session) => {
                session.shutdown(self.options.shutdown_grace).await;
                info!("Bridge shut down");
            }
            Lifecycle::NotStarted | Lifecycle::Failed { .. } => {}
        }
    }

    pub fn info(&self) -> BridgeInfo {
        let lifecycle = self.lifecycle();
        let mut info = BridgeInfo {
            state: lifecycle.state(),
            command: None,
            pid: None,
            server: None,
            error: None,
        };

        match &*lifecycle {
            Lifecycle::Ready(session) => {
                info.command = session.command.as_ref().map(ToString::to_string);
                info.pid = session.pid;
                info.server = Some(session.server.clone());
                info.error = session.client.close_reason().map(|e| e.to_string());
            }
            Lifecycle::Failed { error } => info.error = Some(error.clone()),
            Lifecycle::NotStarted | Lifecycle::Starting { .. } => {}
        }

        info
    }

    /// The tools the server offered when the bridge started
    pub fn list_tools(&self) -> Result<Arc<[Tool]>> {
        Ok(self.session()?.cache.tools())
    }

    pub fn list_resources(&self) -> Result<Arc<[Resource]>> {
        Ok(self.session()?.cache.resources())
    }

    pub fn list_prompts(&self) -> Result<Arc<[Prompt]>> {
        Ok(self.session()?.cache.prompts())
    }

    /// Invoke a tool.  The arguments are passed through as-is (an empty object if there are
    /// none); it's up to the server to reject them if they don't fit the tool's schema.
    #[instrument(skip(self, arguments))]
    pub async fn call_tool(&self, name: &str, arguments: Option<Map<String, Value>>) -> Result<Value> {
        let params = json!({
            "name": name,
            "arguments": arguments.unwrap_or_default(),
        });
        self.request("tools/call", params, self.options.tool_timeout)
            .await
    }

    #[instrument(skip(self))]
    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        self.request("resources/read", json!({ "uri": uri }), self.options.request_timeout)
            .await
    }

    #[instrument(skip(self, arguments))]
    pub async fn get_prompt(&self, name: &str, arguments: Option<Map<String, Value>>) -> Result<Value> {
        let params = json!({
            "name": name,
            "arguments": arguments.unwrap_or_default(),
        });
        self.request("prompts/get", params, self.options.request_timeout)
            .await
    }

    async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let session = self.session()?;
        Ok(session
            .client
            .request(method, Some(params), Some(timeout))
            .await?)
    }

    /// The current session, if the bridge is ready for requests
    fn session(&self) -> Result<Arc<Session>> {
        match &*self.lifecycle() {
            Lifecycle::Ready(session) => match session.client.close_reason() {
                Some(e) => Err(e.into()),
                None => Ok(session.clone()),
            },
            other => Err(BridgeError::NotReady {
                state: other.state(),
            }),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `Starting`, if a start is allowed now, cleaning up the remains of a lost
    /// connection if there is one.
    async fn begin_start(&self) -> Result<StartGuard<'_>> {
        let cancel = CancellationToken::new();
        let stopped = CancellationToken::new();

        let previous = {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state() {
                BridgeState::Starting | BridgeState::Ready => {
                    return Err(BridgeError::AlreadyStarted)
                }
                BridgeState::NotStarted | BridgeState::Failed | BridgeState::Disconnected => {}
            }
            std::mem::replace(
                &mut *lifecycle,
                Lifecycle::Starting {
                    cancel: cancel.clone(),
                    stopped: stopped.clone(),
                },
            )
        };

        let guard = StartGuard {
            bridge: self,
            cancel,
            _stopped: stopped.drop_guard(),
            settled: false,
        };

        if let Lifecycle::Ready(stale) = previous {
            debug!("Cleaning up after the lost connection before restarting");
            stale.shutdown(self.options.shutdown_grace).await;
        }

        Ok(guard)
    }

    async fn finish_start(&self, guard: &mut StartGuard<'_>, outcome: Result<Session>) -> Result<()> {
        match outcome {
            Ok(session) => {
                let session = Arc::new(session);
                if guard.settle(Lifecycle::Ready(session.clone())) {
                    info!(server = %session.server.server_info.name, "Bridge ready");
                    Ok(())
                } else {
                    // Shut down while the start was finishing up
                    session.shutdown(self.options.shutdown_grace).await;
                    Err(BridgeError::NotReady {
                        state: BridgeState::NotStarted,
                    })
                }
            }
            Err(e) => {
                error!(error = %e, "Bridge failed to start");
                guard.settle(Lifecycle::Failed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn launch(&self, command: &LaunchCommand, cancel: &CancellationToken) -> Result<Session> {
        let (mut process, stdio) = ServerProcess::spawn(command)?;
        let client = JsonRpcClient::new(
            LineReader::new(BufReader::new(stdio.stdout)),
            LineWriter::new(stdio.stdin),
        );

        // The process dying has to fail everything waiting on it, even if its stdout is somehow
        // still open
        let exit = process.on_exit();
        tokio::spawn({
            let client = client.clone();
            async move {
                let state = exit.await;
                client.connection_lost(format!("server process {state}"));
            }
        });

        match self.connect(&client, cancel).await {
            Ok((server, cache)) => Ok(Session {
                client,
                pid: process.pid(),
                process: tokio::sync::Mutex::new(Some(process)),
                command: Some(command.clone()),
                server,
                cache,
            }),
            Err(e) => {
                client.close();
                let e = diagnose_early_exit(e, &process).await;
                process.shutdown(self.options.shutdown_grace).await;
                Err(e)
            }
        }
    }

    /// Handshake and populate the cache, unless the start is cancelled first
    async fn connect(
        &self,
        client: &JsonRpcClient,
        cancel: &CancellationToken,
    ) -> Result<(InitializeResult, CapabilityCache)> {
        let work = async {
            let mut handshake = HandshakeManager::new(&self.options);
            let server = handshake.negotiate(client).await?;
            let cache =
                CapabilityCache::populate(client, &server.capabilities, self.options.request_timeout)
                    .await?;
            Ok((server, cache))
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(BridgeError::NotReady { state: BridgeState::NotStarted }),
            outcome = work => outcome,
        }
    }
}

/// If the handshake failed because the connection went away, and that's because the server
/// process exited, report the exit (and what the server had to say about it) instead.
async fn diagnose_early_exit(error: BridgeError, process: &ServerProcess) -> BridgeError {
    if !matches!(
        error,
        BridgeError::Handshake(HandshakeError::ConnectionLost(_) | HandshakeError::Transport(_))
    ) {
        return error;
    }

    match tokio::time::timeout(EXIT_DIAGNOSIS_WAIT, process.exited()).await {
        Ok(ProcessState::Exited(code)) => ProcessError::ExitedEarly {
            code,
            stderr: process.stderr_tail(),
        }
        .into(),
        _ => error,
    }
}

/// Held for the duration of a start attempt.  If the attempt is abandoned (its future dropped)
/// before it settles, the bridge is left `Failed` rather than stuck in `Starting`.
struct StartGuard<'a> {
    bridge: &'a Bridge,
    cancel: CancellationToken,
    /// Signals a concurrent [`Bridge::shutdown`] that the attempt is over, however it ended
    _stopped: DropGuard,
    settled: bool,
}

impl StartGuard<'_> {
    /// Replace `Starting` with the outcome of the attempt.  Returns `false` if the bridge was
    /// shut down in the meantime, in which case the lifecycle is left alone.
    fn settle(&mut self, next: Lifecycle) -> bool {
        self.settled = true;
        let mut lifecycle = self.bridge.lifecycle();
        if matches!(*lifecycle, Lifecycle::Starting { .. }) {
            *lifecycle = next;
            true
        } else {
            false
        }
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Bridge start abandoned before it finished");
            self.settle(Lifecycle::Failed {
                error: "start was abandoned".to_string(),
            });
        }
    }
}
