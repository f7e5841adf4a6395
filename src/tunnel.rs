//! Tunnel client supervision
//!
//! The tunnel client reports its status on standard error. Readiness is the
//! first registered connection, or in quick-tunnel mode the public hostname it
//! was assigned, whichever comes first.

use crate::config::{Settings, TunnelSettings};
use crate::fetch::BinaryFetcher;
use crate::supervisor::{
    OutputStream, ProcessHandle, ProcessState, ProcessSupervisor, ReadinessMatcher, ReadinessOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const CONNECTION_LABEL: &str = "connection";
pub const HOSTNAME_LABEL: &str = "hostname";

const CONNECTION_PATTERN: &str = "Registered tunnel connection";
const CONNECTION_EXTRACTOR: &str = "Registered tunnel connection(.*)";
const HOSTNAME_PATTERN: &str = r"https://.*[a-z]+cloudflare\.com";
const HOSTNAME_EXTRACTOR: &str = r"https://([^\s|]*[a-z]+cloudflare\.com)";

const TUNNEL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Command-line arguments for the tunnel client
pub fn tunnel_args(tunnel: &TunnelSettings, public_port: u16) -> Vec<String> {
    let mut args = vec!["tunnel".to_string(), "--no-autoupdate".to_string()];

    match tunnel.token() {
        Some(token) => {
            args.extend(["run".to_string(), "--token".to_string(), token.to_string()]);
        }
        None => {
            args.extend(["--url".to_string(), format!("http://localhost:{}", public_port)]);
        }
    }

    if let Some(protocol) = tunnel.protocol.as_deref().filter(|p| !p.is_empty()) {
        args.extend(["--protocol".to_string(), protocol.to_string()]);
    }
    if let Some(region) = tunnel.region.as_deref().filter(|r| !r.is_empty()) {
        args.extend(["--region".to_string(), region.to_string()]);
    }

    args
}

pub struct TunnelSupervisor<F> {
    settings: Arc<Settings>,
    fetcher: F,
    supervisor: ProcessSupervisor,
    handle: Option<ProcessHandle>,
}

impl<F: BinaryFetcher> TunnelSupervisor<F> {
    pub fn new(settings: Arc<Settings>, fetcher: F) -> Self {
        Self {
            settings,
            fetcher,
            supervisor: ProcessSupervisor::new("tunnel"),
            handle: None,
        }
    }

    /// Matchers for standard error; the hostname one only in anonymous mode
    pub fn matchers(anonymous: bool) -> Vec<ReadinessMatcher> {
        let mut matchers = vec![ReadinessMatcher::new(CONNECTION_LABEL, OutputStream::Stderr, CONNECTION_PATTERN)
            .and_then(|m| m.with_extractor(CONNECTION_EXTRACTOR))
            .expect("tunnel connection pattern is valid")];

        if anonymous {
            matchers.push(
                ReadinessMatcher::new(HOSTNAME_LABEL, OutputStream::Stderr, HOSTNAME_PATTERN)
                    .and_then(|m| m.with_extractor(HOSTNAME_EXTRACTOR))
                    .expect("tunnel hostname pattern is valid"),
            );
        }

        matchers
    }

    pub fn state(&mut self) -> ProcessState {
        match self.handle.as_mut() {
            Some(handle) => self.supervisor.refresh(handle),
            None => self.supervisor.state(),
        }
    }

    pub async fn start(&mut self) -> ReadinessOutcome {
        let tunnel = self.settings.tunnel.clone().unwrap_or_default();
        let path = tunnel.binary_path.clone();

        self.supervisor.ensure_present(&path, &self.fetcher).await;
        self.supervisor.grant_execute(&path).await;

        let anonymous = tunnel.token().is_none();
        if !anonymous {
            info!("Tunnel using access token");
        }

        let args = tunnel_args(&tunnel, self.settings.public_port);
        let mut handle = match self.supervisor.launch(&path, &args, None) {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "Tunnel failed to start");
                return ReadinessOutcome::Failed(e.to_string());
            }
        };

        let outcome = self
            .supervisor
            .await_readiness(&mut handle, Self::matchers(anonymous), self.settings.readiness_timeout())
            .await;
        self.handle = Some(handle);

        match &outcome {
            ReadinessOutcome::Ready(signal) => {
                let detail = signal.extracted.as_deref().unwrap_or_default();
                if signal.label == HOSTNAME_LABEL {
                    info!(domain = %detail, "Tunnel started");
                } else {
                    info!(connection = %detail, "Tunnel started");
                }
            }
            ReadinessOutcome::TimedOut(limit) => {
                warn!(timeout_secs = limit.as_secs(), "Tunnel did not report readiness in time");
            }
            ReadinessOutcome::Failed(reason) => {
                error!(reason = %reason, "Tunnel failed to start");
            }
        }

        outcome
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.terminate("tunnel", TUNNEL_GRACE_PERIOD).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::ReleaseFetcher;

    #[test]
    fn test_quick_tunnel_args() {
        let tunnel = TunnelSettings::default();
        assert_eq!(
            tunnel_args(&tunnel, 3000),
            vec!["tunnel", "--no-autoupdate", "--url", "http://localhost:3000"]
        );
    }

    #[test]
    fn test_token_args_with_flags() {
        let tunnel = TunnelSettings {
            access_token: Some("eyJhIjoi".to_string()),
            protocol: Some("http2".to_string()),
            region: Some("us".to_string()),
            ..TunnelSettings::default()
        };
        assert_eq!(
            tunnel_args(&tunnel, 3000),
            vec![
                "tunnel",
                "--no-autoupdate",
                "run",
                "--token",
                "eyJhIjoi",
                "--protocol",
                "http2",
                "--region",
                "us"
            ]
        );
    }

    #[test]
    fn test_empty_flags_are_omitted() {
        let tunnel = TunnelSettings {
            protocol: Some(String::new()),
            region: Some(String::new()),
            ..TunnelSettings::default()
        };
        assert_eq!(tunnel_args(&tunnel, 8080).len(), 4);
    }

    #[test]
    fn test_hostname_extraction() {
        let matchers = TunnelSupervisor::<ReleaseFetcher>::matchers(true);
        assert_eq!(matchers.len(), 2);

        let line = "2024-03-01T12:00:00Z INF |  https://quiet-river-tree.trycloudflare.com  |";
        let signal = matchers[1].evaluate(line).unwrap();
        assert_eq!(signal.label, HOSTNAME_LABEL);
        assert_eq!(signal.extracted.as_deref(), Some("quiet-river-tree.trycloudflare.com"));
        assert!(matchers[0].evaluate(line).is_none());
    }

    #[test]
    fn test_connection_extraction() {
        let matchers = TunnelSupervisor::<ReleaseFetcher>::matchers(false);
        assert_eq!(matchers.len(), 1);

        let line = "2024-03-01T12:00:01Z INF Registered tunnel connection connIndex=0 connection=abc event=0 ip=198.41.200.13 location=fra08 protocol=quic";
        let signal = matchers[0].evaluate(line).unwrap();
        assert_eq!(signal.label, CONNECTION_LABEL);
        assert!(signal.extracted.unwrap().starts_with("connIndex=0"));
    }
}
