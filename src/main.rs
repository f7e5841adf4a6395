use coregate::app;
use coregate::config::{Settings, CONFIG_ENV};
use coregate::fetch::{Artifact, ReleaseFetcher};
use coregate::keepalive::keepalive_loop;
use coregate::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coregate=info".parse().expect("valid log directive")),
        )
        .init();

    // Settings file from the command line, else the CONFIG variable, else defaults
    let settings = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            let settings = Settings::load(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load settings");
                e
            })?;
            info!(path = %path.display(), "Settings loaded");
            settings
        }
        None => {
            let settings = Settings::from_env().map_err(|e| {
                error!(var = CONFIG_ENV, error = %e, "Failed to parse settings");
                e
            })?;
            info!(var = CONFIG_ENV, "Settings loaded from environment");
            settings
        }
    };
    let settings = Arc::new(settings);

    print_startup_banner(&settings);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(host) = settings.keepalive_host() {
        tokio::spawn(keepalive_loop(host, shutdown_rx.clone()));
    }

    let running = app::start(
        Arc::clone(&settings),
        ReleaseFetcher::new(Artifact::Engine)?,
        ReleaseFetcher::new(Artifact::Tunnel)?,
        shutdown_rx,
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to start gateway");
        e
    })?;

    info!(addr = %running.local_addr(), "Startup complete");

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);
    running.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(settings: &Settings) {
    info!(name = PKG_NAME, version = VERSION, "Starting engine gateway");
    info!(
        bind = %settings.bind,
        public_port = settings.public_port,
        internal_port = settings.internal_port,
        path = %settings.path_prefix,
        tls = settings.tls_enabled(),
        "Gateway settings"
    );
    info!(
        engine = %settings.engine_path.display(),
        vpn_outbound = settings.vpn_enabled(),
        readiness_timeout_secs = ?settings.readiness_timeout_secs,
        "Engine settings"
    );
    info!(
        enabled = settings.tunnel_enabled(),
        authenticated = settings.tunnel.as_ref().and_then(|t| t.token()).is_some(),
        "Tunnel settings"
    );
}
