// ABOUTME: Main entry point for the ciab-daemon binary - runs the daemon or talks to a running one

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use ciab_daemon::config::DaemonConfig;
use ciab_daemon::daemon::{self, DaemonClient};
use ciab_daemon::tmux::{FakeBackend, SessionBackend, TmuxBackend};

#[derive(Parser, Debug)]
#[command(name = "ciab-daemon", version, about = "Terminal-session daemon for Claude-in-a-Box")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Daemon socket path
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Config file (default: ~/.claude-in-a-box/daemon.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default)
    Run(RunArgs),
    /// List terminals known to the running daemon
    Status,
    /// Ask the running daemon to shut down
    Stop,
    /// Check that a daemon is answering
    Ping,
    /// Check one terminal against tmux
    Health { id: String },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Log to stderr instead of the log file
    #[arg(long)]
    foreground: bool,

    /// Registry snapshot path
    #[arg(long)]
    state: Option<PathBuf>,

    /// Serve from an in-memory backend instead of tmux
    #[arg(long, hide = true)]
    fake_backend: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }

    match cli.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::Run(args) => run_daemon(config, args).await,
        Command::Status => status(&config).await,
        Command::Stop => {
            connect(&config).await?.shutdown().await?;
            println!("Daemon is shutting down");
            Ok(())
        }
        Command::Ping => {
            connect(&config).await?.ping().await?;
            println!("Daemon is running on {}", config.socket_path.display());
            Ok(())
        }
        Command::Health { id } => {
            let reply = connect(&config).await?.check_health(&id).await?;
            let has_session = reply
                .has_session
                .map_or_else(|| "unknown".to_string(), |b| b.to_string());
            println!("{} {} (has_session: {})", reply.state.indicator(), reply.state, has_session);
            if let Some(message) = reply.message {
                println!("  {}", message);
            }
            Ok(())
        }
    }
}

async fn run_daemon(mut config: DaemonConfig, args: RunArgs) -> Result<()> {
    if let Some(state) = args.state {
        config.state_path = state;
    }
    setup_logging(&config, args.foreground)?;

    let backend: Arc<dyn SessionBackend> = if args.fake_backend {
        warn!("Running with the in-memory backend; no tmux sessions will be created");
        Arc::new(FakeBackend::new())
    } else {
        let tmux = TmuxBackend::from_config(&config);
        if let Err(e) = tmux.check_tmux_installed().await {
            warn!("tmux check failed, health checks will report unknown: {}", e);
        }
        Arc::new(tmux)
    };

    info!(
        "Starting daemon on {} (state: {})",
        config.socket_path.display(),
        config.state_path.display()
    );
    daemon::run(config, backend).await.context("Daemon exited with an error")
}

async fn connect(config: &DaemonConfig) -> Result<DaemonClient> {
    DaemonClient::connect(&config.socket_path)
        .await
        .with_context(|| format!("Is the daemon running? No answer on {}", config.socket_path.display()))
}

async fn status(config: &DaemonConfig) -> Result<()> {
    let terminals = connect(config).await?.list_terminals().await?;
    if terminals.is_empty() {
        println!("No terminals");
        return Ok(());
    }

    for terminal in terminals {
        let health = terminal
            .last_health
            .map_or("?", |h| h.indicator());
        println!(
            "{} {:<24} {:<32} {} (active {})",
            health,
            terminal.id,
            terminal.backing_session_name,
            terminal.working_directory.display(),
            terminal.last_activity.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn setup_logging(config: &DaemonConfig, foreground: bool) -> Result<()> {
    use std::fs::OpenOptions;
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ciab_daemon=info".into());

    if foreground {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
        return Ok(());
    }

    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log directory: {}", config.log_dir.display()))?;

    let log_file = config.log_dir.join(format!(
        "ciab-daemon-{}.log",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .with_context(|| format!("Failed to create log file: {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(file)
                .with_ansi(false), // No ANSI colors in log file
        )
        .with(filter)
        .init();
    Ok(())
}
