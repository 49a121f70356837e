//! hive supervisor
//!
//! Injects the extension module into every running game client, accepts the
//! module channels and coordinates sessions.
//!
//! # Usage
//!
//! ```bash
//! # Supervise in the foreground (default command)
//! hived run
//!
//! # Watch only: adopt already-injected clients, never inject
//! hived run --no-auto-inject
//!
//! # List running clients and whether they carry the module
//! hived scan
//!
//! # Inject one client after a 2s delay
//! hived inject 4242 --delay-ms 2000
//!
//! # Custom config and debug logging
//! RUST_LOG=hived=debug hived run --config ./hive.toml
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT (Ctrl+C on Windows): graceful shutdown. Channels are
//!   closed and their sessions removed before the process exits.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hive_inject::{default_backend, Classification, Injector, ProcessScanner, SysinfoSource};
use hived::config::{SupervisorConfig, CHANNEL_ENV};
use hived::registry::{spawn_registry, RegistryHandle, SessionEvent};
use hived::server::ChannelServer;
use hived::supervisor::Supervisor;

/// hive supervisor - injection and session coordination
#[derive(Parser, Debug)]
#[command(name = "hived", version, about)]
struct Args {
    /// Config file (defaults to $HIVE_CONFIG, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Channel path (overrides the config file)
    #[arg(long, global = true, env = CHANNEL_ENV)]
    channel: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervisor
    Run {
        /// Adopt already-injected clients but never inject
        #[arg(long)]
        no_auto_inject: bool,
    },
    /// List running clients
    Scan,
    /// Inject a single client
    Inject {
        pid: u32,

        /// Wait before injecting
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = SupervisorConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if args.channel.is_some() {
        config.channel_path = args.channel;
    }

    match args.command.unwrap_or(Command::Run {
        no_auto_inject: false,
    }) {
        Command::Run { no_auto_inject } => {
            if no_auto_inject {
                config.auto_inject = false;
            }
            run_supervisor(config)
        }
        Command::Scan => scan(&config),
        Command::Inject { pid, delay_ms } => inject_once(config, pid, Duration::from_millis(delay_ms)),
    }
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("hived=info".parse()?)
                .add_directive("hive_inject=info".parse()?)
                .add_directive("hive_core=info".parse()?)
                .add_directive("hive_protocol=info".parse()?),
        )
        .init();
    Ok(())
}

fn build_scanner(config: &SupervisorConfig) -> Result<ProcessScanner> {
    Ok(ProcessScanner::new(
        Box::new(SysinfoSource::new()),
        default_backend(),
        config.target_executable.clone(),
        config.module_file_name().context("Invalid module path")?,
    ))
}

fn build_supervisor(config: SupervisorConfig, registry: RegistryHandle) -> Result<Supervisor> {
    let scanner = build_scanner(&config)?;
    let injector = Injector::new(
        default_backend(),
        config.injector_config().context("Invalid injector settings")?,
    );
    Supervisor::new(config, registry, scanner, injector).context("Failed to create supervisor")
}

/// Runs the supervisor (async entry point).
#[tokio::main]
async fn run_supervisor(config: SupervisorConfig) -> Result<()> {
    init_logging()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "hive supervisor starting"
    );

    let channel_path = config.channel_path();
    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let registry = spawn_registry(config.pending_timeout());
    info!("Session registry started");

    // Claim the channel before anything is injected; a second supervisor
    // stops here.
    let mut server = ChannelServer::bind(&channel_path, registry.clone(), cancel_token.clone())
        .context("Failed to start channel server")?;

    spawn_event_log(&registry, cancel_token.clone());

    let supervisor = build_supervisor(config, registry)?;
    let supervisor_task = tokio::spawn(supervisor.run(cancel_token.clone()));

    let result = server.run().await;
    // The server only returns early on a setup failure; stop the rest too.
    cancel_token.cancel();
    if let Err(e) = supervisor_task.await {
        warn!(error = %e, "Supervisor task ended abnormally");
    }

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("hive supervisor stopped");
    Ok(())
}

/// Logs lifecycle events; stands in for the status display.
fn spawn_event_log(registry: &RegistryHandle, cancel: CancellationToken) {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(SessionEvent::StateChanged { session, from }) => {
                    info!(from = %from, session = %session.summary(), "Session state changed");
                }
                Ok(SessionEvent::Removed {
                    session_id, reason, ..
                }) => {
                    info!(session_id = %session_id, reason = %reason, "Session ended");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Prints every running client with its injection status.
fn scan(config: &SupervisorConfig) -> Result<()> {
    let mut scanner = build_scanner(config)?;
    let candidates: Vec<_> = scanner.scan().collect();

    if candidates.is_empty() {
        println!("No running {} processes.", config.target_executable);
        return Ok(());
    }

    for candidate in &candidates {
        let status = match scanner.classify(candidate) {
            Classification::NotInjected => "not injected",
            Classification::AlreadyInjected => "injected",
            Classification::Ineligible => "inaccessible",
        };
        println!("{:>8}  {:<14}  {}", candidate.pid, status, candidate.name);
    }
    Ok(())
}

#[tokio::main]
async fn inject_once(config: SupervisorConfig, pid: u32, delay: Duration) -> Result<()> {
    init_logging()?;

    let registry = spawn_registry(config.pending_timeout());
    let supervisor = build_supervisor(config, registry)?;

    let report = supervisor
        .inject_delayed(pid, delay)
        .await
        .with_context(|| format!("Failed to inject process {pid}"))?;

    println!("{pid}: {:?}", report.outcome);
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
