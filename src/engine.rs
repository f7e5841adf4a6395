//! Engine supervision
//!
//! Downloads the engine if needed, starts it with its configuration on
//! standard input and waits for the "core started" log line.

use crate::config::Settings;
use crate::engine_config::synthesize;
use crate::fetch::BinaryFetcher;
use crate::supervisor::{
    OutputStream, ProcessHandle, ProcessState, ProcessSupervisor, ReadinessMatcher, ReadinessOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Timestamped warning-level line the engine prints once it is listening
pub const ENGINE_READY_PATTERN: &str = r"[0-9/]* [0-9:]* \[Warning\] core: .* started";

/// Arguments telling the engine to read its configuration from standard input
pub const ENGINE_ARGS: [&str; 2] = ["-c", "stdin:"];

const ENGINE_GRACE_PERIOD: Duration = Duration::from_secs(5);

pub struct EngineSupervisor<F> {
    settings: Arc<Settings>,
    fetcher: F,
    supervisor: ProcessSupervisor,
    handle: Option<ProcessHandle>,
}

impl<F: BinaryFetcher> EngineSupervisor<F> {
    pub fn new(settings: Arc<Settings>, fetcher: F) -> Self {
        Self {
            settings,
            fetcher,
            supervisor: ProcessSupervisor::new("engine").with_output_logging(true),
            handle: None,
        }
    }

    pub fn matchers() -> Vec<ReadinessMatcher> {
        vec![ReadinessMatcher::new("core-started", OutputStream::Stdout, ENGINE_READY_PATTERN)
            .expect("engine readiness pattern is valid")]
    }

    pub fn state(&mut self) -> ProcessState {
        match self.handle.as_mut() {
            Some(handle) => self.supervisor.refresh(handle),
            None => self.supervisor.state(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(ProcessHandle::pid)
    }

    /// Run the full presence → permission → launch → readiness sequence.
    ///
    /// Launch failures are returned as [`ReadinessOutcome::Failed`], never as errors.
    pub async fn start(&mut self) -> ReadinessOutcome {
        let path = self.settings.engine_path.clone();

        self.supervisor.ensure_present(&path, &self.fetcher).await;
        self.supervisor.grant_execute(&path).await;

        let payload = match synthesize(&self.settings).to_json() {
            Ok(json) => json.into_bytes(),
            Err(e) => {
                error!(error = %e, "Failed to serialize engine configuration");
                return ReadinessOutcome::Failed(format!("engine configuration: {}", e));
            }
        };

        let mut handle = match self.supervisor.launch(&path, ENGINE_ARGS, Some(payload)) {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "Engine failed to start");
                return ReadinessOutcome::Failed(e.to_string());
            }
        };

        let outcome = self
            .supervisor
            .await_readiness(&mut handle, Self::matchers(), self.settings.readiness_timeout())
            .await;
        self.handle = Some(handle);

        match &outcome {
            ReadinessOutcome::Ready(_) => {
                info!(
                    path = %self.settings.path_prefix,
                    uuid = %self.settings.identity,
                    "Engine started"
                );
            }
            ReadinessOutcome::TimedOut(limit) => {
                error!(timeout_secs = limit.as_secs(), "Engine did not report readiness in time");
            }
            ReadinessOutcome::Failed(reason) => {
                error!(reason = %reason, "Engine failed to start");
            }
        }

        outcome
    }

    /// Terminate the engine if it is running
    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.terminate("engine", ENGINE_GRACE_PERIOD).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_pattern() {
        let matcher = &EngineSupervisor::<crate::fetch::ReleaseFetcher>::matchers()[0];

        assert!(matcher
            .evaluate("2024/03/01 12:30:45 [Warning] core: Xray 1.8.4 started")
            .is_some());
        assert!(matcher
            .evaluate("2024/03/01 12:30:45 [Info] core: Xray 1.8.4 started")
            .is_none());
        assert!(matcher
            .evaluate("2024/03/01 12:30:45 [Warning] core: failed to listen")
            .is_none());
        assert_eq!(matcher.stream(), OutputStream::Stdout);
    }
}
