//! Teambridge — a pool of interactive coding agents behind one tool-call
//! server on stdio.
//!
//! Stdout belongs to the Orchestrator Protocol; every log line goes to
//! stderr (and optionally a 0600 log file), redacted of API-key shapes.

use clap::{Parser, ValueEnum};
use std::io::Write;
use std::path::{Path, PathBuf};
use teambridge_bus::LockFile;
use teambridge_core::redact::redact;
use teambridge_core::BridgeConfig;
use teambridge_server::{graceful_shutdown, run_stdio_server, BridgeState, SharedState};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "teambridge",
    about = "Multi-agent orchestration bridge — ACP agents behind one tool-call server"
)]
struct Cli {
    /// Team identifier tagged onto watcher-mode tasks
    #[arg(long)]
    team: Option<String>,

    /// Bridge config file
    #[arg(long, default_value = "./bridge.config.json")]
    config: PathBuf,

    /// Run mode
    #[arg(long, value_enum, default_value_t = Mode::Mcp)]
    mode: Mode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// File-poll task watcher (requires --team)
    Watcher,
    /// Tool-call server on stdio
    Mcp,
    /// Both surfaces (requires --team)
    Both,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if matches!(cli.mode, Mode::Watcher | Mode::Both) && cli.team.is_none() {
        eprintln!("error: --team is required for {:?} mode", cli.mode);
        std::process::exit(1);
    }

    let config = match BridgeConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(&config)?;

    tokio::runtime::Runtime::new()?.block_on(run(cli, config))
}

async fn run(cli: Cli, config: BridgeConfig) -> anyhow::Result<()> {
    let config_path = cli.config.clone();
    let bridge_root = config.bridge_root();
    let state = BridgeState::new(config)?;

    // One bridge per workspace
    let _lock = LockFile::acquire(bridge_root.join("bridge.lock"))?;

    let orphaned = state.store.recover_orphaned()?;
    if !orphaned.is_empty() {
        warn!(count = orphaned.len(), "orphaned tasks recovered as failed");
    }
    write_manifest(&state, &bridge_root).await;

    spawn_reload_handler(state.clone(), config_path, bridge_root.clone());

    if let Some(team) = &cli.team {
        info!(team = %team, "bridge tagged for team");
    }

    match cli.mode {
        Mode::Mcp | Mode::Both => {
            info!("starting tool-call server");
            tokio::select! {
                result = run_stdio_server(state.clone()) => {
                    if let Err(e) = result {
                        warn!("server loop ended with error: {}", e);
                    }
                }
                _ = shutdown_signal() => {}
            }
        }
        Mode::Watcher => {
            // The poll loop itself is the watcher binary's concern; this
            // process only keeps the shared subsystems alive.
            let interval_ms = state.config.read().await.polling.interval_ms;
            info!(interval_ms = interval_ms, "watcher mode: subsystems up, awaiting signals");
            shutdown_signal().await;
        }
    }

    graceful_shutdown(&state).await;
    Ok(())
}

/// SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

/// SIGHUP: reload the config (deep replace) and regenerate the manifest.
fn spawn_reload_handler(state: SharedState, config_path: PathBuf, bridge_root: PathBuf) {
    #[cfg(unix)]
    tokio::spawn(async move {
        let mut hups =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!("cannot install SIGHUP handler: {}", e);
                    return;
                }
            };
        while hups.recv().await.is_some() {
            match BridgeConfig::load(&config_path) {
                Ok(config) => {
                    state.replace_config(config).await;
                    write_manifest(&state, &bridge_root).await;
                    info!("config reloaded");
                }
                Err(e) => warn!("config reload failed, keeping previous config: {}", e),
            }
        }
    });
    #[cfg(not(unix))]
    let _ = (state, config_path, bridge_root);
}

/// Dump the configured agent catalogue next to the registry file.
async fn write_manifest(state: &SharedState, bridge_root: &Path) {
    let config = state.config.read().await;
    let agents: serde_json::Map<String, serde_json::Value> = config
        .agents
        .iter()
        .map(|(name, agent)| {
            (
                name.clone(),
                serde_json::json!({
                    "type": agent.agent_type,
                    "command": agent.command,
                    "defaultModel": agent.default_model,
                    "models": agent.model_names(),
                    "strengths": agent.strengths,
                }),
            )
        })
        .collect();
    let manifest = serde_json::json!({
        "generated_at": chrono::Utc::now(),
        "agents": agents,
    });
    let path = bridge_root.join("manifest.json");
    match serde_json::to_vec_pretty(&manifest) {
        Ok(data) => {
            if let Err(e) = std::fs::write(&path, data) {
                warn!("cannot write manifest: {}", e);
            }
        }
        Err(e) => warn!("cannot serialize manifest: {}", e),
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Writer that redacts API-key shapes line by line before the inner sink.
struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.inner.write_all(redact(&text).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn init_logging(
    config: &BridgeConfig,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(|| RedactingWriter {
            inner: std::io::stderr(),
        })
        .with_ansi(false);

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer);

    if let Some(log_file) = &config.logging.file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        // Owner-only: the log may carry prompts and task output
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(log_file, std::fs::Permissions::from_mode(0o600))?;
        }
        let (writer, guard) = tracing_appender::non_blocking(RedactingWriter { inner: file });
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false);
        registry.with(file_layer).init();
        Ok(Some(guard))
    } else {
        registry.init();
        Ok(None)
    }
}
