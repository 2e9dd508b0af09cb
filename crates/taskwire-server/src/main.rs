//! Taskwire server entry point.

use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use taskwire_server::protocol::negotiation::initialize_result;
use taskwire_server::tools::ToolRegistry;
use taskwire_server::{ServerConfig, StdioTransport, TaskServer};

#[derive(Parser)]
#[command(
    name = "taskwire-server",
    about = "JSON-RPC server with task-capable tools over stdio",
    version
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve over stdio (default).
    Serve {
        /// Poll interval advertised on created tasks, in milliseconds.
        /// Also reads TASKWIRE_POLL_INTERVAL_MS.
        #[arg(long)]
        poll_interval_ms: Option<u64>,

        /// Maximum queued messages per task.
        /// Also reads TASKWIRE_MAX_QUEUE_SIZE.
        #[arg(long)]
        max_queue_size: Option<usize>,

        /// Ttl for tasks created without one, in milliseconds.
        /// Also reads TASKWIRE_TASK_TTL_MS.
        #[arg(long)]
        task_ttl_ms: Option<u64>,
    },

    /// Print server capabilities as JSON.
    Info,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   taskwire-server completions bash > ~/.local/share/bash-completion/completions/taskwire-server
    ///   taskwire-server completions zsh > ~/.zfunc/_taskwire-server
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command.unwrap_or(Commands::Serve {
        poll_interval_ms: None,
        max_queue_size: None,
        task_ttl_ms: None,
    }) {
        Commands::Serve {
            poll_interval_ms,
            max_queue_size,
            task_ttl_ms,
        } => {
            let config = ServerConfig::resolve(poll_interval_ms, max_queue_size, task_ttl_ms);
            tracing::info!(
                poll_interval_ms = config.poll_interval_ms,
                max_queue_size = ?config.max_queue_size,
                task_ttl_ms = ?config.task_ttl_ms,
                "Starting taskwire server"
            );
            let server = TaskServer::new(config)?;
            server.serve(Arc::new(StdioTransport::new())).await?;
        }

        Commands::Info => {
            let init = initialize_result();
            let tools = ToolRegistry::list_tools();
            let info = serde_json::json!({
                "server": init.server_info,
                "protocol_version": init.protocol_version,
                "capabilities": init.capabilities,
                "tools": tools.iter().map(|t| &t.name).collect::<Vec<_>>(),
                "tool_count": tools.len(),
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "taskwire-server", &mut std::io::stdout());
        }
    }

    Ok(())
}
