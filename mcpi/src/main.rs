use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use mcp_inspector::{Bridge, BridgeError, BridgeOptions, LaunchCommand, Tool};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;
use tracing::*;
use tracing_subscriber::{filter::LevelFilter, EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    globals: Globals,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Globals {
    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    debug: u8,
}

/// How to launch the server, and how patient to be with it
#[derive(Args, Debug)]
struct ServerArgs {
    /// Run the server in this directory instead of the current one
    #[arg(long, value_name = "DIR", env = "MCPI_CWD")]
    cwd: Option<PathBuf>,

    /// Set an environment variable for the server.  May be repeated.
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_var)]
    env: Vec<(String, String)>,

    /// How long to wait for the server to answer `initialize`
    #[arg(long, value_name = "MS", env = "MCPI_HANDSHAKE_TIMEOUT_MS")]
    handshake_timeout_ms: Option<u64>,

    /// How long to wait for listing, resource and prompt requests
    #[arg(long, value_name = "MS", env = "MCPI_REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,

    /// How long to wait for a tool call
    #[arg(long, value_name = "MS", env = "MCPI_TOOL_TIMEOUT_MS")]
    tool_timeout_ms: Option<u64>,

    /// How long the server gets to exit after being asked to, before it's killed
    #[arg(long, value_name = "MS", env = "MCPI_SHUTDOWN_GRACE_MS")]
    shutdown_grace_ms: Option<u64>,

    /// The command that launches the MCP server, followed by its arguments
    #[arg(last = true, required = true, value_name = "SERVER_COMMAND")]
    command: Vec<String>,
}

impl ServerArgs {
    fn options(&self) -> BridgeOptions {
        let mut options = BridgeOptions::default();
        let millis = |ms: Option<u64>, default: Duration| ms.map(Duration::from_millis).unwrap_or(default);

        options.handshake_timeout = millis(self.handshake_timeout_ms, options.handshake_timeout);
        options.request_timeout = millis(self.request_timeout_ms, options.request_timeout);
        options.tool_timeout = millis(self.tool_timeout_ms, options.tool_timeout);
        options.shutdown_grace = millis(self.shutdown_grace_ms, options.shutdown_grace);
        options
    }

    fn launch_command(&self) -> Result<LaunchCommand, BridgeError> {
        let mut command = LaunchCommand::from_argv(self.command.iter().cloned())?;
        if let Some(dir) = &self.cwd {
            command = command.current_dir(dir);
        }
        for (key, value) in &self.env {
            command = command.env(key, value);
        }
        Ok(command)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show what the server says about itself, along with everything it offers
    Info {
        #[command(flatten)]
        server: ServerArgs,
    },

    /// List the server's tools
    Tools {
        #[command(flatten)]
        server: ServerArgs,
    },

    /// List the server's resources
    Resources {
        #[command(flatten)]
        server: ServerArgs,
    },

    /// List the server's prompts
    Prompts {
        #[command(flatten)]
        server: ServerArgs,
    },

    /// Call a tool and print its result
    CallTool {
        /// Name of the tool
        name: String,

        /// The tool's arguments, as a JSON object.
        ///
        /// If not specified, the tool is called with no arguments.
        #[arg(long, value_name = "JSON", value_parser = parse_json_object)]
        args: Option<Map<String, Value>>,

        #[command(flatten)]
        server: ServerArgs,
    },

    /// Read a resource and print its contents
    ReadResource {
        uri: String,

        #[command(flatten)]
        server: ServerArgs,
    },

    /// Render a prompt and print the result
    GetPrompt {
        /// Name of the prompt
        name: String,

        /// The prompt's arguments, as a JSON object
        #[arg(long, value_name = "JSON", value_parser = parse_json_object)]
        args: Option<Map<String, Value>>,

        #[command(flatten)]
        server: ServerArgs,
    },
}

/// What to do once the bridge is up
#[derive(Debug)]
enum Operation {
    Info,
    Tools,
    Resources,
    Prompts,
    CallTool {
        name: String,
        args: Option<Map<String, Value>>,
    },
    ReadResource {
        uri: String,
    },
    GetPrompt {
        name: String,
        args: Option<Map<String, Value>>,
    },
}

impl Commands {
    fn into_parts(self) -> (ServerArgs, Operation) {
        use Commands::*;
        match self {
            Info { server } => (server, Operation::Info),
            Tools { server } => (server, Operation::Tools),
            Resources { server } => (server, Operation::Resources),
            Prompts { server } => (server, Operation::Prompts),
            CallTool { name, args, server } => (server, Operation::CallTool { name, args }),
            ReadResource { uri, server } => (server, Operation::ReadResource { uri }),
            GetPrompt { name, args, server } => (server, Operation::GetPrompt { name, args }),
        }
    }

    /// Start the server, run the operation, and print the result (or the error) as JSON on stdout.
    async fn execute(self) -> anyhow::Result<()> {
        let (server, operation) = self.into_parts();
        let bridge = Bridge::new(server.options());

        let outcome = match server.launch_command() {
            Ok(command) => match bridge.start(command).await {
                Ok(()) => operation.run(&bridge).await,
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        };

        bridge.shutdown().await;

        match outcome {
            Ok(payload) => {
                println!("{}", serde_json::to_string_pretty(&payload)?);
                Ok(())
            }
            Err(e) => {
                // Bridge errors have a structured description for whoever reads our output
                if let Some(bridge_error) = e.downcast_ref::<BridgeError>() {
                    println!("{}", serde_json::to_string_pretty(bridge_error)?);
                }
                Err(e)
            }
        }
    }
}

impl Operation {
    async fn run(self, bridge: &Bridge) -> anyhow::Result<Value> {
        let payload = match self {
            Operation::Info => json!({
                "info": bridge.info(),
                "tools": describe_tools(&bridge.list_tools()?)?,
                "resources": &*bridge.list_resources()?,
                "prompts": &*bridge.list_prompts()?,
            }),
            Operation::Tools => describe_tools(&bridge.list_tools()?)?,
            Operation::Resources => serde_json::to_value(&*bridge.list_resources()?)?,
            Operation::Prompts => serde_json::to_value(&*bridge.list_prompts()?)?,
            Operation::CallTool { name, args } => bridge.call_tool(&name, args).await?,
            Operation::ReadResource { uri } => bridge.read_resource(&uri).await?,
            Operation::GetPrompt { name, args } => bridge.get_prompt(&name, args).await?,
        };

        Ok(payload)
    }
}

/// Tools as the server described them, plus a flattened view of each one's parameters
fn describe_tools(tools: &[Tool]) -> anyhow::Result<Value> {
    tools
        .iter()
        .map(|tool| {
            let mut entry = serde_json::to_value(tool)?;
            entry["parameters"] = serde_json::to_value(tool.parameters())?;
            Ok(entry)
        })
        .collect::<anyhow::Result<Vec<_>>>()
        .map(Value::Array)
}

fn parse_env_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

fn parse_json_object(s: &str) -> anyhow::Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(s).context("not valid JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("expected a JSON object, got {other}"),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let default_log_directive = match cli.globals.debug {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Logs go to stderr in JSON; stdout is reserved for results
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_log_directive.into())
                .from_env_lossy(),
        )
        .json()
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    if let Err(e) = cli.command.execute().await {
        error!("{:#}", e);
        exit(1);
    } else {
        debug!("command executed successfully");
    }
}
