//! Builds the Xray runtime config from the template and the panel's inbounds.
//!
//! Assembly is a pure function: the same template, inbound rows and ban list
//! always produce the same document. Problems in one inbound are logged and
//! that inbound is left out; they never abort the whole assembly.
//!
//! The per-client `level` field carries the client's speed limit in KB/s.
//! Every distinct limit gets its own entry in `policy.levels` whose
//! `uplinkOnly`/`downlinkOnly` hold that limit.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde_json::{Map, Value, json};

use super::config::{InboundConfig, LevelKey, PolicyLevel, XrayConfig};
use crate::domain::{Client, Inbound, InboundSettings, Protocol};
use crate::error::PanelError;

/// Outbound tag banned source IPs are routed to.
pub const BLOCKED_TAG: &str = "blocked";

/// Speed limits of every enabled client, indexed for level lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpeedLevels {
    by_email: HashMap<String, u32>,
    by_id: HashMap<String, u32>,
    limits: BTreeSet<u32>,
}

impl SpeedLevels {
    /// Collects the limits of all enabled clients of all enabled inbounds.
    /// Inbounds whose settings do not parse contribute nothing.
    #[must_use]
    pub fn collect(inbounds: &[Inbound]) -> Self {
        let mut levels = Self::default();
        for inbound in inbounds.iter().filter(|i| i.enable) {
            let Ok(settings) = inbound.parsed_settings() else {
                continue;
            };
            for client in settings.clients.iter().filter(|c| c.enable) {
                if client.speed_limit == 0 {
                    continue;
                }
                levels.limits.insert(client.speed_limit);
                if !client.email.is_empty() {
                    levels
                        .by_email
                        .entry(client.email.clone())
                        .or_insert(client.speed_limit);
                }
                let credential = client.credential();
                if !credential.is_empty() {
                    levels
                        .by_id
                        .entry(credential.to_string())
                        .or_insert(client.speed_limit);
                }
            }
        }
        levels
    }

    /// Level for a client: its email's limit, else its id's limit, else `0`.
    #[must_use]
    pub fn level_for(&self, client: &Client) -> u32 {
        self.by_email
            .get(&client.email)
            .or_else(|| self.by_id.get(client.credential()))
            .copied()
            .unwrap_or(0)
    }

    /// Distinct non-zero limits in ascending order.
    pub fn limits(&self) -> impl Iterator<Item = u32> + '_ {
        self.limits.iter().copied()
    }
}

/// Assembles the full Xray config.
///
/// `blocked_ips` are source addresses currently banned by the IP-limit
/// enforcement; they are routed to the [`BLOCKED_TAG`] outbound.
#[must_use]
pub fn assemble(
    template: &XrayConfig,
    inbounds: &[Inbound],
    blocked_ips: &BTreeSet<String>,
) -> XrayConfig {
    let mut config = template.clone();

    let level0 = config.policy.levels.entry(LevelKey(0)).or_default();
    let base = PolicyLevel::base();
    level0.handshake = base.handshake;
    level0.conn_idle = base.conn_idle;
    level0.uplink_only = base.uplink_only;
    level0.downlink_only = base.downlink_only;
    level0.stats_user_uplink = true;
    level0.stats_user_downlink = true;
    level0.stats_user_online = true;

    let levels = SpeedLevels::collect(inbounds);
    for limit in levels.limits() {
        config
            .policy
            .levels
            .insert(LevelKey(limit), PolicyLevel::speed_limited(limit));
    }

    config.ensure_api();

    let mut used_ports: HashSet<u16> = config.inbounds.iter().map(|i| i.port).collect();
    for inbound in inbounds.iter().filter(|i| i.enable) {
        if !used_ports.insert(inbound.port) {
            tracing::warn!(
                inbound_id = inbound.id,
                port = inbound.port,
                "port already taken by another enabled inbound; skipping"
            );
            continue;
        }
        match assemble_inbound(inbound, &levels) {
            Ok(entry) => config.inbounds.push(entry),
            Err(e) => {
                used_ports.remove(&inbound.port);
                tracing::warn!(inbound_id = inbound.id, error = %e, "skipping inbound");
            }
        }
    }

    if !blocked_ips.is_empty() {
        apply_ip_bans(&mut config, blocked_ips);
    }

    config
}

/// Converts one enabled inbound into its Xray entry.
///
/// # Errors
///
/// Returns [`PanelError::InvalidInbound`] for unknown protocols and
/// [`PanelError::InvalidSettings`] when any of the JSON blobs is malformed.
pub fn assemble_inbound(
    inbound: &Inbound,
    levels: &SpeedLevels,
) -> Result<InboundConfig, PanelError> {
    let protocol = inbound.protocol()?;
    let settings = inbound.parsed_settings()?;

    let settings = if protocol.has_clients() {
        project_settings(inbound, protocol, settings, levels)
    } else {
        Value::Object(settings.rest)
    };

    let stream_settings = parse_optional(&inbound.stream_settings)?.map(scrub_stream);
    let sniffing = parse_optional(&inbound.sniffing)?;

    Ok(InboundConfig {
        listen: (!inbound.listen.is_empty()).then(|| inbound.listen.clone()),
        port: inbound.port,
        protocol: inbound.protocol.clone(),
        settings,
        stream_settings,
        tag: inbound.effective_tag(),
        sniffing,
        extra: Map::new(),
    })
}

/// Rebuilds `settings` with only the clients Xray should accept.
fn project_settings(
    inbound: &Inbound,
    protocol: Protocol,
    settings: InboundSettings,
    levels: &SpeedLevels,
) -> Value {
    let clients: Vec<Value> = settings
        .clients
        .iter()
        .filter(|c| c.enable)
        .filter(|c| inbound.traffic_for(&c.email).is_none_or(|t| t.enable))
        .map(|c| project_client(protocol, c, levels.level_for(c)))
        .collect();

    let mut out = settings.rest;
    out.insert("clients".to_string(), Value::Array(clients));
    Value::Object(out)
}

/// Whitelists the fields Xray understands for `protocol`.
fn project_client(protocol: Protocol, client: &Client, level: u32) -> Value {
    let mut out = Map::new();
    match protocol {
        Protocol::Vmess => {
            out.insert("id".to_string(), json!(client.id));
        }
        Protocol::Vless => {
            out.insert("id".to_string(), json!(client.id));
            let flow = client.normalized_flow();
            if !flow.is_empty() {
                out.insert("flow".to_string(), json!(flow));
            }
        }
        Protocol::Trojan => {
            out.insert("password".to_string(), json!(client.password));
        }
        Protocol::Shadowsocks => {
            out.insert("password".to_string(), json!(client.password));
            if !client.method.is_empty() {
                out.insert("method".to_string(), json!(client.method));
            }
        }
        Protocol::Socks | Protocol::Http | Protocol::Wireguard | Protocol::Tunnel => {}
    }
    out.insert("email".to_string(), json!(client.email));
    out.insert("level".to_string(), json!(level));
    Value::Object(out)
}

fn parse_optional(blob: &str) -> Result<Option<Value>, PanelError> {
    if blob.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(blob)
        .map(Some)
        .map_err(|e| PanelError::InvalidSettings(e.to_string()))
}

/// Removes panel-only transport data Xray must never see.
fn scrub_stream(mut stream: Value) -> Value {
    if let Some(obj) = stream.as_object_mut() {
        obj.remove("externalProxy");
        for key in ["tlsSettings", "realitySettings"] {
            if let Some(section) = obj.get_mut(key).and_then(Value::as_object_mut) {
                section.remove("settings");
            }
        }
    }
    stream
}

/// Routes banned source IPs to a blackhole ahead of every non-API rule.
fn apply_ip_bans(config: &mut XrayConfig, blocked_ips: &BTreeSet<String>) {
    let has_blocked = config
        .outbounds
        .iter()
        .any(|o| o.get("tag").and_then(Value::as_str) == Some(BLOCKED_TAG));
    if !has_blocked {
        config
            .outbounds
            .push(json!({ "tag": BLOCKED_TAG, "protocol": "blackhole", "settings": {} }));
    }

    let rule = json!({
        "type": "field",
        "source": blocked_ips.iter().collect::<Vec<_>>(),
        "outboundTag": BLOCKED_TAG,
    });
    let Some(rules) = config
        .routing
        .as_mut()
        .and_then(|r| r.get_mut("rules"))
        .and_then(Value::as_array_mut)
    else {
        return;
    };
    let after_api = rules
        .iter()
        .position(|r| r.get("outboundTag").and_then(Value::as_str) == Some(super::config::API_TAG))
        .map_or(0, |i| i + 1);
    rules.insert(after_api.min(rules.len()), rule);
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::ClientTraffic;

    fn template() -> XrayConfig {
        XrayConfig::parse(include_str!("default_config.json"))
            .unwrap_or_else(|e| panic!("template parses: {e}"))
    }

    fn inbound(id: i64, port: u16, protocol: &str, settings: Value) -> Inbound {
        Inbound {
            id,
            user_id: 1,
            up: 0,
            down: 0,
            total: 0,
            remark: format!("in-{id}"),
            enable: true,
            expiry_time: 0,
            listen: String::new(),
            port,
            protocol: protocol.to_string(),
            settings: settings.to_string(),
            stream_settings: String::new(),
            tag: String::new(),
            sniffing: String::new(),
            client_stats: Vec::new(),
        }
    }

    fn traffic(email: &str, enable: bool) -> ClientTraffic {
        ClientTraffic {
            id: 0,
            inbound_id: 1,
            enable,
            email: email.to_string(),
            up: 0,
            down: 0,
            expiry_time: 0,
            total: 0,
            reset: 0,
            last_online: 0,
        }
    }

    fn clients_of(config: &XrayConfig, tag: &str) -> Vec<Value> {
        config
            .inbounds
            .iter()
            .find(|i| i.tag == tag)
            .and_then(|i| i.settings.get("clients"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    #[test]
    fn level_zero_is_forced_even_if_template_disagrees() {
        let Ok(mut tpl) = XrayConfig::parse(
            r#"{"policy":{"levels":{"0":{"handshake":9,"statsUserOnline":false,"bufferSize":4}}}}"#,
        ) else {
            panic!("parses");
        };
        tpl.policy.system = None;
        let config = assemble(&tpl, &[], &BTreeSet::new());
        let Some(level0) = config.policy.levels.get(&LevelKey(0)) else {
            panic!("level 0 exists");
        };
        assert_eq!(level0.handshake, Some(4));
        assert_eq!(level0.conn_idle, Some(300));
        assert!(level0.stats_user_online);
        assert_eq!(level0.buffer_size, Some(4));
    }

    #[test]
    fn vmess_projection_drops_panel_fields() {
        let settings = json!({"clients": [{
            "id": "u1", "email": "a", "security": "auto", "speedLimit": 0,
            "comment": "c", "subId": "s", "tgId": 5, "totalGB": 0
        }]});
        let ib = inbound(1, 1000, "vmess", settings);
        let config = assemble(&template(), &[ib], &BTreeSet::new());
        let clients = clients_of(&config, "inbound-1000");
        let Some(client) = clients.first().and_then(Value::as_object) else {
            panic!("one client");
        };
        let mut keys: Vec<&str> = client.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["email", "id", "level"]);
    }

    #[test]
    fn traffic_row_disable_suppresses_client() {
        let settings = json!({"clients": [
            {"id": "u1", "email": "a"},
            {"id": "u2", "email": "b"}
        ]});
        let mut ib = inbound(1, 1000, "vless", settings);
        ib.client_stats = vec![traffic("a", true), traffic("b", false)];
        let config = assemble(&template(), &[ib], &BTreeSet::new());
        let emails: Vec<Value> = clients_of(&config, "inbound-1000")
            .iter()
            .map(|c| c["email"].clone())
            .collect();
        assert_eq!(emails, vec![json!("a")]);
    }

    #[test]
    fn email_limit_wins_over_id_limit() {
        let a = inbound(
            1,
            1000,
            "vless",
            json!({"clients": [{"id": "shared", "email": "a", "speedLimit": 100}]}),
        );
        let b = inbound(
            2,
            1001,
            "vless",
            json!({"clients": [{"id": "shared", "email": "b", "speedLimit": 200}]}),
        );
        let levels = SpeedLevels::collect(&[a, b]);
        let probe = Client::new("shared", "b");
        assert_eq!(levels.level_for(&probe), 200);
        let unknown_email = Client::new("shared", "zzz");
        assert_eq!(levels.level_for(&unknown_email), 100);
    }

    #[test]
    fn invalid_settings_skip_only_that_inbound() {
        let mut bad = inbound(1, 1000, "vless", json!({}));
        bad.settings = "{not json".to_string();
        let good = inbound(2, 1001, "vless", json!({"clients": [{"id": "u", "email": "g"}]}));
        let config = assemble(&template(), &[bad, good], &BTreeSet::new());
        let tags: Vec<&str> = config.inbounds.iter().map(|i| i.tag.as_str()).collect();
        assert_eq!(tags, vec!["api", "inbound-1001"]);
    }

    #[test]
    fn unknown_protocol_is_rejected_and_skipped() {
        let ib = inbound(1, 1000, "hysteria42", json!({}));
        assert!(matches!(
            assemble_inbound(&ib, &SpeedLevels::default()),
            Err(PanelError::InvalidInbound(_))
        ));
        let config = assemble(&template(), &[ib], &BTreeSet::new());
        assert_eq!(config.inbounds.len(), 1);
    }

    #[test]
    fn duplicate_enabled_port_is_skipped() {
        let a = inbound(1, 1000, "vless", json!({"clients": []}));
        let b = inbound(2, 1000, "vless", json!({"clients": []}));
        let config = assemble(&template(), &[a, b], &BTreeSet::new());
        assert_eq!(config.inbounds.len(), 2);
    }

    #[test]
    fn non_client_protocols_keep_settings() {
        let ib = inbound(
            1,
            1080,
            "socks",
            json!({"auth": "password", "accounts": [{"user": "u", "pass": "p"}], "udp": true}),
        );
        let config = assemble(&template(), &[ib], &BTreeSet::new());
        let Some(entry) = config.inbounds.iter().find(|i| i.tag == "inbound-1080") else {
            panic!("socks inbound emitted");
        };
        assert_eq!(entry.settings["udp"], true);
        assert!(entry.settings.get("clients").is_none());
    }

    #[test]
    fn banned_ips_get_a_routing_rule_after_api() {
        let bans: BTreeSet<String> = ["9.9.9.9".to_string(), "1.1.1.1".to_string()].into();
        let config = assemble(&template(), &[], &bans);
        let Some(rules) = config
            .routing
            .as_ref()
            .and_then(|r| r.get("rules"))
            .and_then(Value::as_array)
        else {
            panic!("rules exist");
        };
        let Some(rule) = rules.get(1) else {
            panic!("ban rule inserted");
        };
        assert_eq!(rule["source"], json!(["1.1.1.1", "9.9.9.9"]));
        assert_eq!(rule["outboundTag"], BLOCKED_TAG);
    }

    #[test]
    fn sniffing_and_listen_are_forwarded() {
        let mut ib = inbound(1, 1000, "vless", json!({"clients": []}));
        ib.listen = "10.0.0.2".to_string();
        ib.sniffing = r#"{"enabled":true,"destOverride":["http","tls"]}"#.to_string();
        let levels = SpeedLevels::default();
        let Ok(entry) = assemble_inbound(&ib, &levels) else {
            panic!("assembles");
        };
        assert_eq!(entry.listen.as_deref(), Some("10.0.0.2"));
        assert_eq!(entry.tag, "inbound-10.0.0.2:1000");
        assert_eq!(entry.sniffing.as_ref().map(|s| s["enabled"].clone()), Some(json!(true)));
    }
}
