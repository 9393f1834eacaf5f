//! CLI entry points: a thin `cli`/bin crate delegates here, where the
//! actual argument handling and boot sequence live.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{error, info};

use crate::config::GlobalConfig;
use crate::registry::{Registry, RegistryPaths};
use crate::state::AppState;

/// `configd` command-line options.
#[derive(Debug, Parser)]
#[command(name = "configd", about = "Hardened config-manager agent", version)]
pub struct Cli {
    /// Directory containing `global.json` and `configs.json`; defaults to
    /// the current directory.
    #[arg(long, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Verbosity level (higher is more verbose): unset is warn, `-v` is
    /// info, `-vv` is debug, `-vvv` or more is trace.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub cmd: Option<Command>,
}

impl Cli {
    /// The `tracing_subscriber::EnvFilter` directive implied by `verbose`.
    pub fn filter_directive(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

/// CLI sub-commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Bind the listener and serve requests (the default when no sub-command is given).
    Serve,
    /// Load the registry and print the bound routes without opening a listener.
    PrintRoutes,
}

/// Parse `argv` into a [`Cli`] without dispatching. Split out from
/// [`run_from_iter`] so the `cli` bin can read `verbose` and install a
/// tracing subscriber before any command runs.
pub fn parse_cli<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::parse_from(args)
}

/// Dispatch an already-parsed [`Cli`] to its sub-command (or `serve` by default).
pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let dir = cli.config_dir.unwrap_or_else(|| PathBuf::from("."));
    match cli.cmd.unwrap_or(Command::Serve) {
        Command::Serve => serve(&dir).await,
        Command::PrintRoutes => print_routes(),
    }
}

/// Parse `argv` and dispatch to the selected sub-command (or `serve` by default).
pub async fn run_from_iter<I, T>(args: I) -> anyhow::Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    dispatch(parse_cli(args)).await
}

fn configs_path(dir: &Path) -> PathBuf {
    dir.join("configs.json")
}

async fn build_state(dir: &Path) -> anyhow::Result<AppState> {
    let cfg = GlobalConfig::load(dir)?;
    let configs_path = configs_path(dir);
    let bytes = std::fs::read(&configs_path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", configs_path.display()))?;
    let table = Registry::parse(&bytes, &cfg.backup_root)?;
    let registry = Registry::new(table);
    let paths = RegistryPaths::from_global(&cfg, camino::Utf8PathBuf::try_from(configs_path)?);
    Ok(AppState::new(cfg, registry, paths))
}

// Safety: umask takes a plain mode value and returns the previous mask;
// no pointers involved.
#[cfg(unix)]
#[allow(unsafe_code)]
fn set_umask() {
    unsafe {
        libc::umask(0o007);
    }
}

/// Load configuration, bind the listener, and serve until signalled.
pub async fn serve(dir: &Path) -> anyhow::Result<()> {
    // Forced at startup, before any file is created.
    #[cfg(unix)]
    set_umask();

    let state = match build_state(dir).await {
        Ok(s) => s,
        Err(e) => {
            error!("failed to load boot-time configuration: {e:#}");
            anyhow::bail!(e);
        }
    };

    let listen = state.cfg.listen.clone();
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address {listen:?}: {e}"))?;

    let app = crate::router::build(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "configd: listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("configd: shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        else {
            return;
        };
        sig.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("configd: shutdown signal received, draining in-flight requests");
}

fn print_routes() -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&root_payload())?);
    Ok(())
}

fn root_payload() -> serde_json::Value {
    serde_json::json!({
        "ok": true,
        "name": "config-manager",
        "version": env!("CARGO_PKG_VERSION"),
        "api_endpoints": crate::router::route_table(),
    })
}

