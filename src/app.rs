//! Startup pipeline: tunnel, then engine, then gateway
//!
//! Each phase is awaited before the next begins. Supervision failures are
//! logged and recorded but never stop the pipeline; only a gateway that cannot
//! bind is fatal.

use crate::config::Settings;
use crate::engine::EngineSupervisor;
use crate::fetch::BinaryFetcher;
use crate::proxy::ReverseProxyGateway;
use crate::supervisor::ReadinessOutcome;
use crate::tls::build_acceptor;
use crate::tunnel::TunnelSupervisor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const GATEWAY_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A started service, holding everything needed to stop it again
pub struct Running<E, T> {
    engine: EngineSupervisor<E>,
    tunnel: Option<TunnelSupervisor<T>>,
    engine_outcome: ReadinessOutcome,
    tunnel_outcome: Option<ReadinessOutcome>,
    gateway: JoinHandle<anyhow::Result<()>>,
    local_addr: SocketAddr,
}

impl<E: BinaryFetcher, T: BinaryFetcher> Running<E, T> {
    /// Address the gateway actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn engine_outcome(&self) -> &ReadinessOutcome {
        &self.engine_outcome
    }

    /// `None` when the tunnel is disabled
    pub fn tunnel_outcome(&self) -> Option<&ReadinessOutcome> {
        self.tunnel_outcome.as_ref()
    }

    pub fn engine_pid(&self) -> Option<u32> {
        self.engine.pid()
    }

    /// Stop both processes and wait for the gateway loop to exit.
    ///
    /// The shutdown channel passed to [`start`] must already be signalled.
    pub async fn shutdown(mut self) {
        if let Some(tunnel) = self.tunnel.as_mut() {
            info!(state = ?tunnel.state(), "Stopping tunnel");
            tunnel.stop().await;
        }
        info!(state = ?self.engine.state(), pid = ?self.engine.pid(), "Stopping engine");
        self.engine.stop().await;

        match tokio::time::timeout(GATEWAY_STOP_TIMEOUT, self.gateway).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(error = %e, "Gateway exited with error"),
            Ok(Err(e)) => error!(error = %e, "Gateway task failed"),
            Err(_) => warn!("Gateway did not stop in time"),
        }
    }
}

/// Run the startup sequence and return once the gateway is listening
pub async fn start<E, T>(
    settings: Arc<Settings>,
    engine_fetcher: E,
    tunnel_fetcher: T,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<Running<E, T>>
where
    E: BinaryFetcher,
    T: BinaryFetcher,
{
    let (mut tunnel, tunnel_outcome) = if settings.tunnel_enabled() {
        let mut tunnel = TunnelSupervisor::new(Arc::clone(&settings), tunnel_fetcher);
        let outcome = tunnel.start().await;
        (Some(tunnel), Some(outcome))
    } else {
        (None, None)
    };

    let mut engine = EngineSupervisor::new(Arc::clone(&settings), engine_fetcher);
    let engine_outcome = engine.start().await;
    if !engine_outcome.is_ready() {
        warn!("Engine is not ready, forwarded requests will fail until it listens");
    }

    let bound = async {
        let mut gateway = ReverseProxyGateway::from_settings(&settings, shutdown_rx).await?;
        if let Some(tls) = settings.tls.as_ref().filter(|t| t.enabled) {
            gateway = gateway.with_tls(build_acceptor(tls)?);
        }
        let local_addr = gateway.local_addr()?;
        anyhow::Ok((gateway, local_addr))
    }
    .await;

    let (gateway, local_addr) = match bound {
        Ok(bound) => bound,
        Err(e) => {
            error!(error = %e, "Gateway could not start, stopping supervised processes");
            if let Some(tunnel) = tunnel.as_mut() {
                tunnel.stop().await;
            }
            engine.stop().await;
            return Err(e);
        }
    };
    info!(addr = %local_addr, tls = gateway.tls_enabled(), "Gateway bound");

    let gateway = tokio::spawn(gateway.run());

    Ok(Running {
        engine,
        tunnel,
        engine_outcome,
        tunnel_outcome,
        gateway,
        local_addr,
    })
}
