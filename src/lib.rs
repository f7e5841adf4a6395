//! Coregate - a supervisor and front door for an external proxy engine
//!
//! This library:
//! - Synthesizes the engine's JSON configuration from a few high-level settings
//! - Downloads, launches and watches the engine (and optionally a tunnel client)
//!   until their output reports readiness
//! - Serves a reverse-proxy gateway that forwards one path prefix, WebSocket
//!   upgrades included, to the engine's loopback port

pub mod app;
pub mod config;
pub mod engine;
pub mod engine_config;
pub mod error;
pub mod fetch;
pub mod keepalive;
pub mod pool;
pub mod proxy;
pub mod supervisor;
pub mod tls;
pub mod tunnel;

/// Package name for logs and the startup banner
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
