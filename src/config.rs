use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Environment variable holding the JSON settings document
pub const CONFIG_ENV: &str = "CONFIG";

/// Environment variable consulted for the keepalive host when none is configured
pub const KEEPALIVE_HOST_ENV: &str = "RENDER_EXTERNAL_HOSTNAME";

/// High-level settings, loaded once at startup and never mutated afterwards.
///
/// Every key is optional. Legacy key names are accepted as aliases so that
/// existing `CONFIG` documents keep working.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Path to the engine executable
    #[serde(default = "default_engine_path", alias = "core_path")]
    pub engine_path: PathBuf,

    /// Port the gateway listens on
    #[serde(default = "default_public_port", alias = "port")]
    pub public_port: u16,

    /// Loopback port the engine listens on
    #[serde(default = "default_internal_port", alias = "middle_port")]
    pub internal_port: u16,

    /// Base64-encoded inbound protocol name, passed through opaquely
    #[serde(default = "default_transport_protocol_id", alias = "protocol")]
    pub transport_protocol_id: String,

    /// Client identity accepted by the engine inbound
    #[serde(default = "Uuid::new_v4", alias = "uuid", deserialize_with = "deserialize_identity")]
    pub identity: Uuid,

    /// Path prefix forwarded to the engine (also its WebSocket path)
    #[serde(default = "default_path_prefix", alias = "path")]
    pub path_prefix: String,

    /// Gateway bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Optional bound on every readiness wait, in seconds. Unbounded when absent.
    pub readiness_timeout_secs: Option<u64>,

    /// Host pinged periodically on `/generate_204` to keep the deployment awake
    pub keepalive_host: Option<String>,

    #[serde(default)]
    pub tls: Option<TlsSettings>,

    #[serde(default, alias = "warp")]
    pub vpn_outbound: Option<VpnSettings>,

    #[serde(default, alias = "argo")]
    pub tunnel: Option<TunnelSettings>,

    /// Top-level tunnel binary path, overriding `tunnel.binary_path` when set
    #[serde(default, alias = "argo_path")]
    pub tunnel_path: Option<PathBuf>,
}

/// An empty or null identity means "generate one"
fn deserialize_identity<'de, D>(deserializer: D) -> Result<Uuid, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) if !raw.trim().is_empty() => {
            Uuid::parse_str(raw.trim()).map_err(serde::de::Error::custom)
        }
        _ => Ok(Uuid::new_v4()),
    }
}

/// TLS material for the gateway. Key and certificate are base64-encoded PEM.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TlsSettings {
    #[serde(default, alias = "use")]
    pub enabled: bool,
    pub key: Option<String>,
    pub cert: Option<String>,
}

/// WireGuard relay used as an extra engine outbound
#[derive(Debug, Deserialize, Clone)]
pub struct VpnSettings {
    #[serde(default, alias = "key")]
    pub secret_key: String,

    /// IPv6 address assigned by the relay, without prefix length
    #[serde(default)]
    pub ipv6: String,

    #[serde(default = "default_vpn_endpoint")]
    pub endpoint: String,

    /// Route IPv4 traffic through the relay
    #[serde(default, alias = "add4")]
    pub add_ipv4: bool,

    /// Route IPv6 traffic through the relay
    #[serde(default, alias = "add6")]
    pub add_ipv6: bool,
}

impl Default for VpnSettings {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            ipv6: String::new(),
            endpoint: default_vpn_endpoint(),
            add_ipv4: false,
            add_ipv6: false,
        }
    }
}

impl VpnSettings {
    /// The relay is only wired in when credentials are complete and at least
    /// one address family is routed through it.
    pub fn is_eligible(&self) -> bool {
        !self.secret_key.is_empty() && !self.ipv6.is_empty() && (self.add_ipv4 || self.add_ipv6)
    }
}

/// Tunnel client settings
#[derive(Debug, Deserialize, Clone)]
pub struct TunnelSettings {
    #[serde(default = "default_tunnel_path", alias = "path")]
    pub binary_path: PathBuf,

    #[serde(default, alias = "use")]
    pub enabled: bool,

    pub protocol: Option<String>,

    pub region: Option<String>,

    /// Named-tunnel token. Anonymous quick-tunnel mode when absent.
    #[serde(alias = "token")]
    pub access_token: Option<String>,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            binary_path: default_tunnel_path(),
            enabled: false,
            protocol: None,
            region: None,
            access_token: None,
        }
    }
}

impl TunnelSettings {
    /// Access token, treating an empty string as absent
    pub fn token(&self) -> Option<&str> {
        self.access_token.as_deref().filter(|t| !t.is_empty())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine_path: default_engine_path(),
            public_port: default_public_port(),
            internal_port: default_internal_port(),
            transport_protocol_id: default_transport_protocol_id(),
            identity: Uuid::new_v4(),
            path_prefix: default_path_prefix(),
            bind: default_bind_address(),
            readiness_timeout_secs: None,
            keepalive_host: None,
            tls: None,
            vpn_outbound: None,
            tunnel: None,
            tunnel_path: None,
        }
    }
}

fn default_engine_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("./core.exe")
    } else {
        PathBuf::from("./core")
    }
}

fn default_tunnel_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("./cloudflared.exe")
    } else {
        PathBuf::from("./cloudflared")
    }
}

fn default_public_port() -> u16 {
    3000
}

fn default_internal_port() -> u16 {
    9000
}

fn default_transport_protocol_id() -> String {
    "dmxlc3M=".to_string()
}

fn default_path_prefix() -> String {
    "/api".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_vpn_endpoint() -> String {
    "engage.cloudflareclient.com".to_string()
}

impl Settings {
    /// Load settings from a file. `.json` files are parsed as JSON, anything else as TOML.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        let settings = settings.with_tunnel_path_override();
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a JSON settings document
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let settings: Settings = serde_json::from_str(json)?;
        let settings = settings.with_tunnel_path_override();
        settings.validate()?;
        Ok(settings)
    }

    /// Read settings from the `CONFIG` environment variable, or defaults if it is unset
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(json) if !json.trim().is_empty() => Self::from_json(&json),
            _ => Ok(Self::default()),
        }
    }

    /// Fold the top-level tunnel path into the tunnel section
    fn with_tunnel_path_override(mut self) -> Self {
        if let Some(path) = self.tunnel_path.take().filter(|p| !p.as_os_str().is_empty()) {
            self.tunnel.get_or_insert_with(TunnelSettings::default).binary_path = path;
        }
        self
    }

    /// Validate all settings
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.public_port != 0 && self.public_port == self.internal_port {
            errors.push(format!(
                "public_port and internal_port must differ (both are {})",
                self.public_port
            ));
        }

        if self.readiness_timeout_secs == Some(0) {
            errors.push("readiness_timeout_secs must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Bounded readiness wait, if configured
    pub fn readiness_timeout(&self) -> Option<Duration> {
        self.readiness_timeout_secs.map(Duration::from_secs)
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.as_ref().is_some_and(|t| t.enabled)
    }

    pub fn tunnel_enabled(&self) -> bool {
        self.tunnel.as_ref().is_some_and(|t| t.enabled)
    }

    pub fn vpn_enabled(&self) -> bool {
        self.vpn_outbound.as_ref().is_some_and(VpnSettings::is_eligible)
    }

    /// Keepalive host from settings, falling back to the hosting platform's variable
    pub fn keepalive_host(&self) -> Option<String> {
        self.keepalive_host
            .clone()
            .or_else(|| std::env::var(KEEPALIVE_HOST_ENV).ok())
            .filter(|h| !h.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let settings = Settings::from_json("{}").unwrap();

        assert_eq!(settings.public_port, 3000);
        assert_eq!(settings.internal_port, 9000);
        assert_eq!(settings.path_prefix, "/api");
        assert_eq!(settings.transport_protocol_id, "dmxlc3M=");
        assert_eq!(settings.bind, "0.0.0.0");
        assert_eq!(settings.identity.get_version_num(), 4);
        assert!(settings.readiness_timeout().is_none());
        assert!(!settings.tls_enabled());
        assert!(!settings.tunnel_enabled());
        assert!(!settings.vpn_enabled());
    }

    #[test]
    fn test_legacy_keys() {
        let json = r#"{
            "core_path": "/opt/core",
            "port": 8080,
            "middle_port": 9100,
            "protocol": "dm1lc3M=",
            "uuid": "2b4c3a1e-8a6e-4c2f-9b7d-0e6f1a2b3c4d",
            "path": "/ws",
            "warp": { "key": "c2VjcmV0", "ipv6": "2606:4700::1", "add4": true },
            "argo": { "use": true, "token": "abc", "region": "us" },
            "tls": { "use": true }
        }"#;
        let settings = Settings::from_json(json).unwrap();

        assert_eq!(settings.engine_path, PathBuf::from("/opt/core"));
        assert_eq!(settings.public_port, 8080);
        assert_eq!(settings.internal_port, 9100);
        assert_eq!(settings.transport_protocol_id, "dm1lc3M=");
        assert_eq!(
            settings.identity.to_string(),
            "2b4c3a1e-8a6e-4c2f-9b7d-0e6f1a2b3c4d"
        );
        assert_eq!(settings.path_prefix, "/ws");

        let vpn = settings.vpn_outbound.as_ref().unwrap();
        assert_eq!(vpn.secret_key, "c2VjcmV0");
        assert_eq!(vpn.endpoint, "engage.cloudflareclient.com");
        assert!(vpn.add_ipv4);
        assert!(!vpn.add_ipv6);
        assert!(settings.vpn_enabled());

        let tunnel = settings.tunnel.as_ref().unwrap();
        assert!(tunnel.enabled);
        assert_eq!(tunnel.token(), Some("abc"));
        assert_eq!(tunnel.region.as_deref(), Some("us"));
        assert!(settings.tunnel_enabled());
        assert!(settings.tls_enabled());
    }

    #[test]
    fn test_top_level_tunnel_path_overrides_section() {
        let json = r#"{
            "argo_path": "/opt/bin/cloudflared",
            "argo": { "use": true, "path": "./ignored" }
        }"#;
        let settings = Settings::from_json(json).unwrap();

        let tunnel = settings.tunnel.as_ref().unwrap();
        assert_eq!(tunnel.binary_path, PathBuf::from("/opt/bin/cloudflared"));
        assert!(tunnel.enabled);
        assert!(settings.tunnel_path.is_none());

        let settings = Settings::from_json(r#"{ "tunnel_path": "/usr/bin/cf" }"#).unwrap();
        assert_eq!(
            settings.tunnel.unwrap().binary_path,
            PathBuf::from("/usr/bin/cf")
        );
        assert!(!Settings::from_json(r#"{ "tunnel_path": "/usr/bin/cf" }"#)
            .unwrap()
            .tunnel_enabled());
    }

    #[test]
    fn test_empty_identity_generates_one() {
        let settings = Settings::from_json(r#"{ "uuid": "" }"#).unwrap();
        assert_eq!(settings.identity.get_version_num(), 4);

        let settings = Settings::from_json(r#"{ "uuid": null }"#).unwrap();
        assert_eq!(settings.identity.get_version_num(), 4);

        assert!(Settings::from_json(r#"{ "uuid": "not-a-uuid" }"#).is_err());
    }

    #[test]
    fn test_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            r#"
public_port = 4000
internal_port = 4001
path_prefix = "/tunnel"
readiness_timeout_secs = 30

[vpn_outbound]
secret_key = "k"
ipv6 = "::1"
add_ipv6 = true

[tunnel]
enabled = true
binary_path = "/usr/local/bin/cloudflared"
"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.public_port, 4000);
        assert_eq!(settings.path_prefix, "/tunnel");
        assert_eq!(settings.readiness_timeout(), Some(Duration::from_secs(30)));
        assert!(settings.vpn_enabled());
        assert_eq!(
            settings.tunnel.unwrap().binary_path,
            PathBuf::from("/usr/local/bin/cloudflared")
        );
    }

    #[test]
    fn test_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "port": 3100, "path": "/" }"#).unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.public_port, 3100);
        assert_eq!(settings.path_prefix, "/");
    }

    #[test]
    fn test_vpn_eligibility() {
        let mut vpn = VpnSettings {
            secret_key: "k".to_string(),
            ipv6: "::1".to_string(),
            ..VpnSettings::default()
        };
        assert!(!vpn.is_eligible(), "no address family selected");

        vpn.add_ipv6 = true;
        assert!(vpn.is_eligible());

        vpn.secret_key.clear();
        assert!(!vpn.is_eligible(), "missing secret key");
    }

    #[test]
    fn test_empty_token_means_anonymous() {
        let tunnel = TunnelSettings {
            access_token: Some(String::new()),
            ..TunnelSettings::default()
        };
        assert_eq!(tunnel.token(), None);
    }

    #[test]
    fn test_validate_port_collision() {
        let result = Settings::from_json(r#"{ "port": 9000, "middle_port": 9000 }"#);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("must differ"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let settings = Settings {
            public_port: 5000,
            internal_port: 5000,
            readiness_timeout_secs: Some(0),
            ..Settings::default()
        };
        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("must differ"));
        assert!(err.contains("readiness_timeout_secs"));
    }

    #[test]
    fn test_configured_keepalive_host_wins() {
        let settings = Settings {
            keepalive_host: Some("example.onrender.com".to_string()),
            ..Settings::default()
        };
        assert_eq!(
            settings.keepalive_host().as_deref(),
            Some("example.onrender.com")
        );
    }
}
