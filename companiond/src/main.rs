use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use companion_core::paths::{set_owner_only_file, CompanionPaths};
use companion_core::PermissionPolicy;
use companion_store::ConfigStore;
use companiond::{api, shutdown, state::AppState, telemetry};

/// Companion daemon — loopback control plane for the browser extension:
/// tool-server supervision, shell exec/sessions under a permission policy,
/// recurring jobs, durable run and approval records.
#[derive(Parser, Debug)]
#[command(name = "companiond", version, about)]
struct Cli {
    /// Config directory (default: $XDG_CONFIG_HOME/companion).
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Override the configured listen port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Increase log verbosity (debug level).
    #[arg(short, long)]
    verbose: bool,

    /// Validate config and exit.
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_telemetry(cli.verbose);

    let paths = match cli.config_dir {
        Some(dir) => {
            let home = std::env::var("HOME")
                .map(PathBuf::from)
                .context("HOME environment variable is not set")?;
            CompanionPaths::with_config_root(home, dir)
        }
        None => CompanionPaths::from_env().context("resolving config directory")?,
    };
    paths
        .ensure_config_root()
        .context("preparing config directory")?;

    let config_store = ConfigStore::new(paths.config_file());
    let config = config_store.load().await;

    if cli.validate {
        PermissionPolicy::normalize(&config.permission_policy, true, paths.home_dir())
            .context("invalid permission policy")?;
        for (name, server) in &config.mcp_servers {
            if server.command.trim().is_empty() {
                warn!(server = %name, "tool server entry has no command and will be ignored");
            }
        }
        println!("config is valid");
        return Ok(());
    }

    let token = config_store
        .ensure_token()
        .await
        .context("persisting bearer token")?;
    let port = cli.port.unwrap_or(config.port);

    let state = AppState::build(paths.clone(), config_store, &config, token).await;

    let pid_file = paths.pid_file();
    std::fs::write(&pid_file, format!("{}\n", std::process::id()))
        .context("writing pid file")?;
    set_owner_only_file(&pid_file).context("restricting pid file")?;

    // Tool servers come up concurrently in the background; a slow or broken
    // server must not hold the listener hostage.
    {
        let supervisor = Arc::clone(&state.supervisor);
        tokio::spawn(async move {
            for (name, outcome) in supervisor.start_all().await {
                if let Err(err) = outcome {
                    warn!(server = %name, error = %err, "tool server failed to start");
                }
            }
        });
    }
    state.scheduler.schedule_all().await;

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, version = state.version, "companiond listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(shutdown::signal_listener(shutdown_tx));

    let router = api::build_router(state.clone());
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.changed().await;
    })
    .await
    .context("http server error")?;

    state.shutdown().await;
    if let Err(err) = std::fs::remove_file(&pid_file) {
        warn!(error = %err, "could not remove pid file");
    }
    info!("companiond stopped");
    Ok(())
}
