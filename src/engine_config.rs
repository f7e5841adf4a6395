//! Engine configuration synthesis
//!
//! Turns [`Settings`] into the engine's inbound/outbound/routing document.
//! The optional WireGuard relay is modelled as a tagged variant
//! ([`VpnRoute`]) from which both the outbound list and the routing rules are
//! derived, so an outbound can never exist without a rule referencing it and
//! vice versa.

use crate::config::{Settings, VpnSettings};
use base64::Engine as _;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use uuid::Uuid;

pub const DIRECT_TAG: &str = "direct";
pub const BLOCKED_TAG: &str = "blocked";
pub const WIREGUARD_TAG: &str = "wireguard";

/// Address the engine inbound listens on
pub const INBOUND_LISTEN: &str = "127.0.0.1";

/// Transfer protocol always routed to the blackhole
const BLOCKED_PROTOCOL: &str = "bittorrent";

const WIREGUARD_LOCAL_V4: &str = "172.16.0.2/32";
const WIREGUARD_PEER_PUBLIC_KEY: &str = "bmXOC+F1FxEMF9dyiK2H5/1SUtzH0JuVo51h2wPfgyo=";
const WIREGUARD_PEER_PORT: u16 = 2408;
const WIREGUARD_RESERVED: [u8; 3] = [0, 0, 0];
const WIREGUARD_MTU: u16 = 1420;

const ANY_IPV4: &str = "0.0.0.0/0";
const ANY_IPV6: &str = "::/0";
const ALL_PORTS: &str = "0-65535";

/// The engine's full configuration document
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub inbound: Inbound,
    pub vpn: VpnRoute,
}

/// Whether traffic is routed through the WireGuard relay
#[derive(Debug, Clone, PartialEq)]
pub enum VpnRoute {
    Disabled,
    Enabled {
        outbound: WireguardSettings,
        split: IpSplit,
    },
}

/// Which address families go through the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpSplit {
    /// Every port of every family, no IP resolution needed
    All,
    /// IPv4 and IPv6 routed independently; at least one is true
    PerFamily { ipv4: bool, ipv6: bool },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    pub port: u16,
    pub listen: &'static str,
    pub protocol: String,
    pub settings: InboundSettings,
    pub stream_settings: StreamSettings,
    pub sniffing: Sniffing,
}

impl Inbound {
    /// WebSocket path the inbound accepts
    pub fn stream_path(&self) -> &str {
        &self.stream_settings.ws_settings.path
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct InboundSettings {
    pub clients: Vec<InboundClient>,
    pub decryption: &'static str,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundClient {
    pub id: Uuid,
    pub alter_id: u16,
    pub security: &'static str,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: &'static str,
    pub security: &'static str,
    pub ws_settings: WsSettings,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct WsSettings {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Sniffing {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum Outbound {
    Freedom {
        settings: FreedomSettings,
        tag: &'static str,
    },
    Blackhole {
        settings: BlackholeSettings,
        tag: &'static str,
    },
    Wireguard {
        settings: WireguardSettings,
        tag: &'static str,
    },
}

impl Outbound {
    pub fn tag(&self) -> &'static str {
        match self {
            Outbound::Freedom { tag, .. }
            | Outbound::Blackhole { tag, .. }
            | Outbound::Wireguard { tag, .. } => tag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FreedomSettings {
    pub domain_strategy: &'static str,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct BlackholeSettings {}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireguardSettings {
    pub secret_key: String,
    pub address: Vec<String>,
    pub peers: Vec<WireguardPeer>,
    pub reserved: [u8; 3],
    pub mtu: u16,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireguardPeer {
    pub public_key: &'static str,
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Vec<&'static str>,
    pub endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum DomainStrategy {
    AsIs,
    IPIfNonMatch,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    pub domain_strategy: DomainStrategy,
    pub rules: Vec<RoutingRule>,
}

/// A single first-match-wins routing rule
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Vec<&'static str>>,
    pub outbound_tag: &'static str,
}

impl RoutingRule {
    fn field(outbound_tag: &'static str) -> Self {
        Self {
            kind: "field",
            ip: None,
            port: None,
            protocol: None,
            outbound_tag,
        }
    }

    pub fn ip(cidr: &'static str, outbound_tag: &'static str) -> Self {
        Self {
            ip: Some(vec![cidr]),
            ..Self::field(outbound_tag)
        }
    }

    pub fn all_ports(outbound_tag: &'static str) -> Self {
        Self {
            port: Some(ALL_PORTS),
            ..Self::field(outbound_tag)
        }
    }

    pub fn protocol(protocol: &'static str, outbound_tag: &'static str) -> Self {
        Self {
            protocol: Some(vec![protocol]),
            ..Self::field(outbound_tag)
        }
    }
}

/// Build the engine configuration for `settings`.
///
/// Total and deterministic: unusable relay settings disable the relay instead
/// of failing.
pub fn synthesize(settings: &Settings) -> EngineConfig {
    let inbound = Inbound {
        port: settings.internal_port,
        listen: INBOUND_LISTEN,
        protocol: decode_protocol(&settings.transport_protocol_id),
        settings: InboundSettings {
            clients: vec![InboundClient {
                id: settings.identity,
                alter_id: 0,
                security: "auto",
            }],
            decryption: "none",
        },
        stream_settings: StreamSettings {
            network: "ws",
            security: "none",
            ws_settings: WsSettings {
                path: settings.path_prefix.clone(),
            },
        },
        sniffing: Sniffing { enabled: false },
    };

    let vpn = match settings.vpn_outbound.as_ref() {
        Some(vpn) if vpn.is_eligible() => VpnRoute::Enabled {
            outbound: wireguard_settings(vpn),
            split: if vpn.add_ipv4 && vpn.add_ipv6 {
                IpSplit::All
            } else {
                IpSplit::PerFamily {
                    ipv4: vpn.add_ipv4,
                    ipv6: vpn.add_ipv6,
                }
            },
        },
        _ => VpnRoute::Disabled,
    };

    EngineConfig { inbound, vpn }
}

/// The protocol id is base64 in settings; fall back to the raw value if it isn't.
fn decode_protocol(id: &str) -> String {
    base64::engine::general_purpose::STANDARD
        .decode(id)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| id.to_string())
}

fn wireguard_settings(vpn: &VpnSettings) -> WireguardSettings {
    WireguardSettings {
        secret_key: vpn.secret_key.clone(),
        address: vec![WIREGUARD_LOCAL_V4.to_string(), format!("{}/128", vpn.ipv6)],
        peers: vec![WireguardPeer {
            public_key: WIREGUARD_PEER_PUBLIC_KEY,
            allowed_ips: vec![ANY_IPV4, ANY_IPV6],
            endpoint: format!("{}:{}", vpn.endpoint, WIREGUARD_PEER_PORT),
        }],
        reserved: WIREGUARD_RESERVED,
        mtu: WIREGUARD_MTU,
    }
}

impl EngineConfig {
    /// Outbounds in order: direct, blocked, then the relay when enabled
    pub fn outbounds(&self) -> Vec<Outbound> {
        let mut outbounds = vec![
            Outbound::Freedom {
                settings: FreedomSettings {
                    domain_strategy: "UseIP",
                },
                tag: DIRECT_TAG,
            },
            Outbound::Blackhole {
                settings: BlackholeSettings {},
                tag: BLOCKED_TAG,
            },
        ];
        if let VpnRoute::Enabled { outbound, .. } = &self.vpn {
            outbounds.push(Outbound::Wireguard {
                settings: outbound.clone(),
                tag: WIREGUARD_TAG,
            });
        }
        outbounds
    }

    pub fn routing(&self) -> Routing {
        let (domain_strategy, mut rules) = match &self.vpn {
            VpnRoute::Disabled => (DomainStrategy::AsIs, Vec::new()),
            VpnRoute::Enabled {
                split: IpSplit::All,
                ..
            } => (
                DomainStrategy::AsIs,
                vec![RoutingRule::all_ports(WIREGUARD_TAG)],
            ),
            VpnRoute::Enabled {
                split: IpSplit::PerFamily { ipv4, ipv6 },
                ..
            } => (
                DomainStrategy::IPIfNonMatch,
                vec![
                    RoutingRule::ip(ANY_IPV4, family_target(*ipv4)),
                    RoutingRule::ip(ANY_IPV6, family_target(*ipv6)),
                ],
            ),
        };
        rules.push(RoutingRule::protocol(BLOCKED_PROTOCOL, BLOCKED_TAG));

        Routing {
            domain_strategy,
            rules,
        }
    }

    /// Compact JSON, as written to the engine's standard input
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn family_target(via_relay: bool) -> &'static str {
    if via_relay {
        WIREGUARD_TAG
    } else {
        DIRECT_TAG
    }
}

#[derive(serde::Serialize)]
struct LogSettings {
    loglevel: &'static str,
}

impl Serialize for EngineConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut doc = serializer.serialize_struct("EngineConfig", 4)?;
        // The readiness line is logged at warning level
        doc.serialize_field("log", &LogSettings { loglevel: "warning" })?;
        doc.serialize_field("inbounds", std::slice::from_ref(&self.inbound))?;
        doc.serialize_field("outbounds", &self.outbounds())?;
        doc.serialize_field("routing", &self.routing())?;
        doc.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings_with_vpn(add_ipv4: bool, add_ipv6: bool) -> Settings {
        Settings {
            vpn_outbound: Some(VpnSettings {
                secret_key: "c2VjcmV0LWtleQ==".to_string(),
                ipv6: "2606:4700:110:8a36::1".to_string(),
                endpoint: "relay.example.net".to_string(),
                add_ipv4,
                add_ipv6,
            }),
            ..Settings::default()
        }
    }

    fn tags(config: &EngineConfig) -> Vec<&'static str> {
        config.outbounds().iter().map(Outbound::tag).collect()
    }

    #[test]
    fn test_default_scenario() {
        let settings = Settings::default();
        let config = synthesize(&settings);

        assert_eq!(config.inbound.port, 9000);
        assert_eq!(config.inbound.listen, "127.0.0.1");
        assert_eq!(config.inbound.stream_path(), "/api");
        assert_eq!(config.inbound.protocol, "vless");
        assert_eq!(config.inbound.settings.clients[0].id, settings.identity);
        assert_eq!(tags(&config), vec![DIRECT_TAG, BLOCKED_TAG]);

        let routing = config.routing();
        assert_eq!(routing.domain_strategy, DomainStrategy::AsIs);
        assert_eq!(routing.rules.len(), 1);
        assert_eq!(routing.rules[0].outbound_tag, BLOCKED_TAG);
        assert_eq!(routing.rules[0].protocol, Some(vec!["bittorrent"]));
    }

    #[test]
    fn test_ineligible_vpn_is_disabled() {
        let cases = [
            settings_with_vpn(false, false),
            Settings {
                vpn_outbound: Some(VpnSettings {
                    ipv6: String::new(),
                    ..settings_with_vpn(true, true).vpn_outbound.unwrap()
                }),
                ..Settings::default()
            },
            Settings {
                vpn_outbound: Some(VpnSettings {
                    secret_key: String::new(),
                    ..settings_with_vpn(true, false).vpn_outbound.unwrap()
                }),
                ..Settings::default()
            },
        ];

        for settings in &cases {
            let config = synthesize(settings);
            assert_eq!(config.vpn, VpnRoute::Disabled);
            assert_eq!(config.outbounds().len(), 2);
            assert_eq!(config.routing().rules.len(), 1);
        }
    }

    #[test]
    fn test_both_families_route_everything() {
        let config = synthesize(&settings_with_vpn(true, true));
        let routing = config.routing();

        assert_eq!(routing.domain_strategy, DomainStrategy::AsIs);
        assert_eq!(routing.rules.len(), 2);
        assert_eq!(routing.rules[0].port, Some("0-65535"));
        assert_eq!(routing.rules[0].outbound_tag, WIREGUARD_TAG);
        assert_eq!(routing.rules[1].outbound_tag, BLOCKED_TAG);
        assert_eq!(tags(&config), vec![DIRECT_TAG, BLOCKED_TAG, WIREGUARD_TAG]);
    }

    #[test]
    fn test_ipv4_only_split() {
        let config = synthesize(&settings_with_vpn(true, false));
        let routing = config.routing();

        assert_eq!(routing.domain_strategy, DomainStrategy::IPIfNonMatch);
        assert_eq!(routing.rules.len(), 3);
        assert_eq!(routing.rules[0].ip, Some(vec!["0.0.0.0/0"]));
        assert_eq!(routing.rules[0].outbound_tag, WIREGUARD_TAG);
        assert_eq!(routing.rules[1].ip, Some(vec!["::/0"]));
        assert_eq!(routing.rules[1].outbound_tag, DIRECT_TAG);
        assert_eq!(routing.rules[2].outbound_tag, BLOCKED_TAG);
    }

    #[test]
    fn test_ipv6_only_split() {
        let routing = synthesize(&settings_with_vpn(false, true)).routing();

        assert_eq!(routing.rules[0].outbound_tag, DIRECT_TAG);
        assert_eq!(routing.rules[1].outbound_tag, WIREGUARD_TAG);
    }

    #[test]
    fn test_relay_outbound_referenced_by_routing() {
        for (v4, v6) in [(true, true), (true, false), (false, true)] {
            let config = synthesize(&settings_with_vpn(v4, v6));
            let outbound_tags = tags(&config);
            for rule in config.routing().rules {
                assert!(outbound_tags.contains(&rule.outbound_tag));
            }
            assert!(config
                .routing()
                .rules
                .iter()
                .any(|r| r.outbound_tag == WIREGUARD_TAG));
        }
    }

    #[test]
    fn test_wireguard_outbound_json() {
        let config = synthesize(&settings_with_vpn(true, true));
        let value = serde_json::to_value(config.outbounds()).unwrap();

        assert_eq!(
            value[2],
            json!({
                "protocol": "wireguard",
                "settings": {
                    "secretKey": "c2VjcmV0LWtleQ==",
                    "address": ["172.16.0.2/32", "2606:4700:110:8a36::1/128"],
                    "peers": [{
                        "publicKey": "bmXOC+F1FxEMF9dyiK2H5/1SUtzH0JuVo51h2wPfgyo=",
                        "allowedIPs": ["0.0.0.0/0", "::/0"],
                        "endpoint": "relay.example.net:2408"
                    }],
                    "reserved": [0, 0, 0],
                    "mtu": 1420
                },
                "tag": "wireguard"
            })
        );
        assert_eq!(value[1], json!({"protocol": "blackhole", "settings": {}, "tag": "blocked"}));
    }

    #[test]
    fn test_document_layout() {
        let settings = Settings {
            path_prefix: "/ws".to_string(),
            internal_port: 9100,
            ..Settings::default()
        };
        let value = serde_json::to_value(synthesize(&settings)).unwrap();

        assert_eq!(value["log"]["loglevel"], "warning");
        assert_eq!(value["inbounds"].as_array().unwrap().len(), 1);
        assert_eq!(value["inbounds"][0]["port"], 9100);
        assert_eq!(value["inbounds"][0]["streamSettings"]["network"], "ws");
        assert_eq!(value["inbounds"][0]["streamSettings"]["wsSettings"]["path"], "/ws");
        assert_eq!(
            value["inbounds"][0]["settings"]["clients"][0]["id"],
            settings.identity.to_string()
        );
        assert_eq!(value["routing"]["domainStrategy"], "AsIs");
        assert_eq!(
            value["routing"]["rules"][0],
            json!({"type": "field", "protocol": ["bittorrent"], "outboundTag": "blocked"})
        );
    }

    #[test]
    fn test_split_domain_strategy_json() {
        let value = serde_json::to_value(synthesize(&settings_with_vpn(false, true))).unwrap();
        assert_eq!(value["routing"]["domainStrategy"], "IPIfNonMatch");
        assert_eq!(
            value["routing"]["rules"][1],
            json!({"type": "field", "ip": ["::/0"], "outboundTag": "wireguard"})
        );
    }

    #[test]
    fn test_synthesis_is_deterministic() {
        let settings = settings_with_vpn(true, false);
        let first = synthesize(&settings);
        let second = synthesize(&settings);

        assert_eq!(first, second);
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    }

    #[test]
    fn test_undecodable_protocol_passes_through() {
        let settings = Settings {
            transport_protocol_id: "trojan!".to_string(),
            ..Settings::default()
        };
        assert_eq!(synthesize(&settings).inbound.protocol, "trojan!");
    }
}
