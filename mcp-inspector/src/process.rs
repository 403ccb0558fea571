//! Owns the server's child process: launching it, watching it, and making sure it's gone when
//! we're done with it.
//!
//! Once spawned, the [`tokio::process::Child`] itself is handed to a monitor task, which is the
//! only thing that ever waits on it.  That task either sees the process exit on its own, or is
//! told to stop it, and either way it reaps the process and publishes the final state on a watch
//! channel.  Dropping the [`ServerProcess`] without calling [`ServerProcess::shutdown`] is the same
//! as asking the monitor to stop the process with the default grace period.
//!
//! On unix the server is started in a process group of its own, and signals go to the whole group,
//! so helpers the server spawned (a `node` under `npx`, a shell pipeline) don't outlive it.
use crate::error::{exit_description, ProcessError};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::*;

/// Grace period used when a [`ServerProcess`] is dropped without an explicit shutdown
const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// How many lines of the server's stderr to hang on to for error reports
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for the stderr pipe to drain once the process has exited.  A grandchild
/// process can keep it open indefinitely.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// The command used to launch an MCP server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LaunchCommand {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl LaunchCommand {
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            current_dir: None,
            env: Vec::new(),
        }
    }

    /// Build a command from a full argv, the first element being the program.
    pub fn from_argv(argv: impl IntoIterator<Item = impl Into<String>>) -> Result<Self, ProcessError> {
        let mut argv = argv.into_iter().map(Into::into);
        let program: String = argv.next().ok_or(ProcessError::EmptyCommand)?;
        if program.is_empty() {
            return Err(ProcessError::EmptyCommand);
        }
        Ok(Self::new(program, argv))
    }

    /// Run the server in `dir` rather than the current directory
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Set an environment variable for the server, on top of the inherited environment
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }
}

impl Display for LaunchCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Where the server process is in its life
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Running,
    /// Exited with this status code, or `None` if killed by a signal
    Exited(Option<i32>),
    /// Waiting on the process failed, so its fate is unknown
    Failed(String),
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Exited(_) | ProcessState::Failed(_))
    }
}

impl Display for ProcessState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::NotStarted => f.write_str("not started"),
            ProcessState::Running => f.write_str("running"),
            ProcessState::Exited(code) => f.write_str(&exit_description(code)),
            ProcessState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// The protocol streams of a freshly spawned server.  Stderr is not here; it's drained into the
/// log by the supervisor.
#[derive(Debug)]
pub struct ProcessStdio {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// A running (or recently running) MCP server process.
#[derive(Debug)]
pub struct ServerProcess {
    command: LaunchCommand,
    pid: Option<u32>,
    state: watch::Receiver<ProcessState>,

    /// Tells the monitor task to stop the process, allowing it this much grace.  Taken on the
    /// first shutdown.
    stop: Option<oneshot::Sender<Duration>>,
    monitor: Option<JoinHandle<()>>,

    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl ServerProcess {
    /// Launch the server.
    ///
    /// Must be called from within a tokio runtime, since the process is monitored by background
    /// tasks.
    #[instrument(skip_all, fields(command = %command))]
    pub fn spawn(command: &LaunchCommand) -> Result<(Self, ProcessStdio), ProcessError> {
        let program = command.program.clone();

        if let Some(dir) = &command.current_dir {
            if !dir.is_dir() {
                return Err(ProcessError::Spawn {
                    program,
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("working directory '{}' does not exist", dir.display()),
                    ),
                });
            }
        }

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => ProcessError::NotFound {
                program: program.clone(),
                source,
            },
            std::io::ErrorKind::PermissionDenied => ProcessError::PermissionDenied {
                program: program.clone(),
                source,
            },
            _ => ProcessError::Spawn {
                program: program.clone(),
                source,
            },
        })?;

        let pid = child.id();
        info!(?pid, "Server process started");

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                // Can't happen with all three piped, but don't leave the process behind if it does
                let _ = child.start_kill();
                return Err(ProcessError::Spawn {
                    program,
                    source: std::io::Error::other("child process standard streams not captured"),
                });
            }
        };

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let drain = tokio::spawn(drain_stderr(stderr, pid, stderr_tail.clone()));

        let (state_sender, state) = watch::channel(ProcessState::Running);
        let (stop, stop_receiver) = oneshot::channel();
        let monitor = tokio::spawn(monitor(child, pid, drain, state_sender, stop_receiver));

        Ok((
            Self {
                command: command.clone(),
                pid,
                state,
                stop: Some(stop),
                monitor: Some(monitor),
                stderr_tail,
            },
            ProcessStdio { stdin, stdout },
        ))
    }

    pub fn command(&self) -> &LaunchCommand {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    /// A future that completes once the process has exited, for whatever reason, with its final
    /// state.  Independent of `self`, so it can be handed to another task.
    pub fn on_exit(&self) -> impl Future<Output = ProcessState> + Send + 'static {
        let mut state = self.state.clone();
        async move {
            // If the monitor is gone without publishing a terminal state, the task panicked or
            // was aborted along with the runtime
            let outcome = state
                .wait_for(ProcessState::is_terminal)
                .await
                .map(|state| state.clone());
            match outcome {
                Ok(state) => state,
                Err(_) => {
                    let state = state.borrow().clone();
                    if state.is_terminal() {
                        state
                    } else {
                        ProcessState::Failed("process monitor stopped unexpectedly".to_string())
                    }
                }
            }
        }
    }

    pub async fn exited(&self) -> ProcessState {
        self.on_exit().await
    }

    /// The most recent lines the server wrote to stderr, oldest first
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Stop the server: ask it to terminate, give it `grace` to comply, then kill it.  Always
    /// reaps the process.
    ///
    /// Safe to call any number of times, and on a process that already exited; returns the final
    /// state either way.
    #[instrument(skip(self), fields(pid = ?self.pid))]
    pub async fn shutdown(&mut self, grace: Duration) -> ProcessState {
        if let Some(stop) = self.stop.take() {
            // Fails if the monitor already finished because the process exited on its own
            let _ = stop.send(grace);
        }

        if let Some(monitor) = self.monitor.take() {
            if let Err(e) = monitor.await {
                error!(error = %e, "Server process monitor task failed");
            }
        }

        let state = self.state();
        info!(%state, "Server process stopped");
        state
    }
}

/// Wait for the process to exit or for the order to stop it, whichever comes first.
async fn monitor(
    mut child: Child,
    pid: Option<u32>,
    drain: JoinHandle<()>,
    state: watch::Sender<ProcessState>,
    stop: oneshot::Receiver<Duration>,
) {
    let status = tokio::select! {
        status = child.wait() => {
            warn!(?pid, ?status, "Server process exited");
            status
        }
        grace = stop => {
            // An error here means the `ServerProcess` was dropped without a shutdown
            let grace = grace.unwrap_or(DEFAULT_GRACE);
            terminate(&mut child, pid, grace).await
        }
    };

    // Whatever the server left running in its group goes with it
    #[cfg(unix)]
    if signal_group(pid, nix::sys::signal::Signal::SIGKILL) {
        debug!(?pid, "Killed processes left behind in the server's process group");
    }

    // Publish the final state only once the last of stderr is in, so anyone reacting to the exit
    // sees the complete tail
    if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, drain).await.is_err() {
        debug!(?pid, "Server stderr still open after exit; not waiting for it");
    }

    let final_state = match status {
        Ok(status) => ProcessState::Exited(status.code()),
        Err(e) => ProcessState::Failed(e.to_string()),
    };
    state.send_replace(final_state);
}

async fn terminate(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
) -> std::io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::Signal;

        if signal_group(pid, Signal::SIGTERM) {
            debug!(?pid, ?grace, "Sent SIGTERM to server process group");
            if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                return status;
            }
            warn!(?pid, ?grace, "Server process ignored SIGTERM; killing its process group");
            signal_group(pid, Signal::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    let _ = (pid, grace);

    // Covers the case where the group couldn't be signalled at all
    child.kill().await?;
    child.wait().await
}

/// Send `signal` to the server's process group.  The server is the group leader, so the group id
/// is its pid.  Returns whether anything was signalled; a group with no members left is not an
/// error.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: nix::sys::signal::Signal) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };

    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pid, %signal, error = %e, "Failed to signal server process group");
            false
        }
    }
}

/// Forward the server's stderr into our log, keeping the last few lines around.
async fn drain_stderr(stderr: ChildStderr, pid: Option<u32>, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                info!(?pid, server_stderr = %line);

                let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Err(e) => {
                debug!(?pid, error = %e, "Error reading server stderr");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_helpers::init_test_logging;
    use assert_matches::assert_matches;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn sh(script: &str) -> LaunchCommand {
        LaunchCommand::new("sh", ["-c", script])
    }

    /// Whether a process with this pid still exists (zombies included)
    fn process_exists(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    /// Wait for a process we aren't the parent of to be gone.  Once orphaned it's reaped by
    /// whoever adopts it, whenever they get to it, so a zombie counts as gone.
    async fn wait_until_gone(pid: u32) -> bool {
        let is_zombie = || {
            std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .ok()
                .and_then(|stat| {
                    stat.rsplit_once(')')
                        .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                })
                .unwrap_or(false)
        };

        for _ in 0..50 {
            if !process_exists(pid) || is_zombie() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[test]
    fn argv_parsing() {
        let command = LaunchCommand::from_argv(["npx", "-y", "server"]).unwrap();
        assert_eq!(command.program(), "npx");
        assert_eq!(command.args(), ["-y", "server"]);
        assert_eq!(command.to_string(), "npx -y server");

        assert_matches!(
            LaunchCommand::from_argv(Vec::<String>::new()),
            Err(ProcessError::EmptyCommand)
        );
        assert_matches!(
            LaunchCommand::from_argv([""]),
            Err(ProcessError::EmptyCommand)
        );
    }

    #[tokio::test]
    async fn stdio_is_wired_up() {
        init_test_logging();
        let (mut process, mut stdio) = ServerProcess::spawn(&sh("read line; echo \"got $line\"")).unwrap();

        stdio.stdin.write_all(b"hello\n").await.unwrap();
        let mut output = String::new();
        stdio.stdout.read_to_string(&mut output).await.unwrap();
        assert_eq!(output, "got hello\n");

        assert_eq!(process.exited().await, ProcessState::Exited(Some(0)));
        assert_eq!(process.shutdown(Duration::from_secs(1)).await, ProcessState::Exited(Some(0)));
    }

    #[tokio::test]
    async fn shutdown_terminates_and_reaps() {
        init_test_logging();
        let (mut process, _stdio) = ServerProcess::spawn(&LaunchCommand::new("sleep", ["30"])).unwrap();
        let pid = process.pid().unwrap();
        assert_eq!(process.state(), ProcessState::Running);

        let state = process.shutdown(Duration::from_secs(5)).await;

        // SIGTERM does it; no exit code because it died of a signal
        assert_eq!(state, ProcessState::Exited(None));
        assert!(!process_exists(pid));

        // Idempotent
        assert_eq!(process.shutdown(Duration::from_secs(5)).await, state);
    }

    #[tokio::test]
    async fn shutdown_takes_down_the_whole_process_group() {
        init_test_logging();
        let (mut process, stdio) = ServerProcess::spawn(&sh("sleep 300 & echo $!; wait")).unwrap();
        let pid = process.pid().unwrap();

        let mut stdout = BufReader::new(stdio.stdout);
        let mut line = String::new();
        stdout.read_line(&mut line).await.unwrap();
        let grandchild: u32 = line.trim().parse().unwrap();
        assert!(process_exists(grandchild));

        let state = process.shutdown(Duration::from_millis(500)).await;

        assert_eq!(state, ProcessState::Exited(None));
        assert!(!process_exists(pid));
        assert!(wait_until_gone(grandchild).await, "grandchild {grandchild} outlived the server");
    }

    #[tokio::test]
    async fn leftovers_are_cleaned_up_after_the_server_exits() {
        init_test_logging();
        let (process, stdio) = ServerProcess::spawn(&sh("sleep 300 & echo $!; exit 4")).unwrap();

        let mut stdout = BufReader::new(stdio.stdout);
        let mut line = String::new();
        stdout.read_line(&mut line).await.unwrap();
        let grandchild: u32 = line.trim().parse().unwrap();

        assert_eq!(process.exited().await, ProcessState::Exited(Some(4)));
        assert!(wait_until_gone(grandchild).await, "grandchild {grandchild} outlived the server");
    }

    #[tokio::test]
    async fn stubborn_process_is_killed_after_grace() {
        init_test_logging();
        let (mut process, mut stdio) =
            ServerProcess::spawn(&sh("trap '' TERM; echo ready; while true; do sleep 1; done")).unwrap();
        let pid = process.pid().unwrap();

        // Don't race the trap being installed
        let mut ready = [0u8; 6];
        stdio.stdout.read_exact(&mut ready).await.unwrap();

        let started = tokio::time::Instant::now();
        let state = process.shutdown(Duration::from_millis(200)).await;

        assert_eq!(state, ProcessState::Exited(None));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn unexpected_exit_is_observed() {
        init_test_logging();
        let (process, _stdio) =
            ServerProcess::spawn(&sh("echo 'something broke' >&2; exit 3")).unwrap();

        let exit = process.on_exit();
        assert_eq!(exit.await, ProcessState::Exited(Some(3)));
        assert_eq!(process.stderr_tail(), vec!["something broke".to_string()]);
    }

    #[tokio::test]
    async fn stderr_tail_is_bounded() {
        init_test_logging();
        let (process, _stdio) =
            ServerProcess::spawn(&sh("i=0; while [ $i -lt 50 ]; do echo line$i >&2; i=$((i+1)); done")).unwrap();

        process.exited().await;
        let tail = process.stderr_tail();
        assert_eq!(tail.len(), STDERR_TAIL_LINES);
        assert_eq!(tail.first().unwrap(), "line30");
        assert_eq!(tail.last().unwrap(), "line49");
    }

    #[tokio::test]
    async fn environment_and_working_dir() {
        init_test_logging();
        let dir = tempfile::tempdir().unwrap();
        let command = sh("echo \"$GREETING from $(pwd)\"")
            .env("GREETING", "hello")
            .current_dir(dir.path());

        let (mut process, mut stdio) = ServerProcess::spawn(&command).unwrap();
        let mut output = String::new();
        stdio.stdout.read_to_string(&mut output).await.unwrap();

        let expected_dir = dir.path().canonicalize().unwrap();
        assert_eq!(output.trim(), format!("hello from {}", expected_dir.display()));
        process.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn launch_failures_are_distinct() {
        init_test_logging();
        assert_matches!(
            ServerProcess::spawn(&LaunchCommand::new("/definitely/not/a/real/server", Vec::<String>::new())),
            Err(ProcessError::NotFound { program, .. }) if program == "/definitely/not/a/real/server"
        );

        // A file that exists but isn't executable
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        assert_matches!(
            ServerProcess::spawn(&LaunchCommand::new(path, Vec::<String>::new())),
            Err(ProcessError::PermissionDenied { .. })
        );

        assert_matches!(
            ServerProcess::spawn(&sh("true").current_dir("/definitely/not/a/real/dir")),
            Err(ProcessError::Spawn { .. })
        );
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_the_process() {
        init_test_logging();
        let (process, _stdio) = ServerProcess::spawn(&LaunchCommand::new("sleep", ["30"])).unwrap();
        let pid = process.pid().unwrap();
        let exit = process.on_exit();

        drop(process);

        assert_eq!(exit.await, ProcessState::Exited(None));
        assert!(!process_exists(pid));
    }
}
