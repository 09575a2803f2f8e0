//! Server bootstrap: parse CLI flags, load or create on-disk state, build
//! the axum router, and serve until shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use claude_remote::config::PinHash;
use claude_remote::device::DeviceStore;
use claude_remote::http;
use claude_remote::identity::ServerIdentity;
use claude_remote::notifications::push::PushSubscriptionStore;
use claude_remote::notifications::vapid::VapidKeys;
use claude_remote::state::{AppState, ServerConfig};
use clap::Parser;

/// Single-user remote-control server.
#[derive(Parser, Debug)]
#[command(name = "claude-remote-server", version, about)]
struct Cli {
    /// Base directory to scan for projects. Defaults to `~/projects`.
    /// Overridden by `CLAUDE_REMOTE_PROJECTS_BASE`.
    #[arg(long)]
    projects_base: Option<PathBuf>,

    /// Address to bind the HTTP/WS server to.
    /// Overridden by `CLAUDE_REMOTE_BIND`.
    #[arg(long, default_value = "127.0.0.1:8787")]
    bind: String,

    /// Public client URL, used as the pairing redirect target and the push
    /// notification origin. Overridden by `CLAUDE_REMOTE_PUBLIC_URL`.
    #[arg(long, default_value = "http://localhost:8787")]
    public_url: String,

    /// Command used to launch the agent subprocess for each job.
    #[arg(long, default_value = "claude")]
    agent_command: String,

    /// Extra arguments passed to the agent command before `--print`/`--resume`.
    #[arg(long, value_delimiter = ' ')]
    agent_args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let projects_base = cli.projects_base.unwrap_or_else(|| {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join("projects")
    });

    let config = ServerConfig {
        projects_base,
        bind: cli.bind,
        public_url: cli.public_url,
        agent_command: cli.agent_command,
        agent_args: cli.agent_args,
    }
    .apply_env_overrides();

    let identity = ServerIdentity::load_or_create().context("loading server identity")?;
    let devices = DeviceStore::load().context("loading paired devices")?;
    let pin = PinHash::load().context("loading pin hash")?;
    let push_store = PushSubscriptionStore::load().context("loading push subscriptions")?;
    let vapid = VapidKeys::load_or_create().context("loading VAPID keys")?;

    if devices.is_empty() {
        if let Some(token) = &identity.pairing_token {
            log::info!("no device paired yet; pairing URL: {}/pair/{token}", config.public_url);
        }
    }

    log::info!("projects base: {}", config.projects_base.display());
    let bind = config.bind.clone();

    let state = Arc::new(AppState::new(config, identity, devices, pin, push_store, vapid));
    let router = http::router(state);

    let listener = tokio::net::TcpListener::bind(&bind).await.with_context(|| format!("binding {bind}"))?;
    log::info!("listening on {bind}");

    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await.context("server error")?;
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM, whichever comes first, to drive
/// `axum::serve`'s graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => log::warn!("failed to install SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => log::info!("received ctrl-c, shutting down"),
        () = terminate => log::info!("received SIGTERM, shutting down"),
    }
}
