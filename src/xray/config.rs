//! Typed Xray configuration document.
//!
//! The sections the panel rewrites (`inbounds`, `policy`) are typed; sections
//! it only forwards (`log`, `dns`, `routing`, outbounds) are kept as raw JSON
//! so templates written for newer Xray releases pass through untouched.
//! Object keys serialize in sorted order, which makes the output stable
//! across runs.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};

use crate::error::PanelError;

/// Tag of the loopback inbound that exposes the Xray API.
pub const API_TAG: &str = "api";

/// Port written into the template's API inbound until the supervisor picks one.
pub const DEFAULT_API_PORT: u16 = 62789;

/// A complete Xray configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XrayConfig {
    /// Logging section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<Value>,
    /// API section (`tag`, `services`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<Value>,
    /// DNS section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Value>,
    /// Listening endpoints, the API inbound included.
    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,
    /// Outbounds, forwarded unchanged.
    #[serde(default)]
    pub outbounds: Vec<Value>,
    /// Routing section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<Value>,
    /// Policy with the level table.
    #[serde(default)]
    pub policy: Policy,
    /// Stats section; its presence enables counters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Value>,
    /// Top-level sections this version does not model (`fakedns`,
    /// `observatory`, `metrics`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `policy` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Level table keyed by the decimal level number.
    #[serde(default)]
    pub levels: BTreeMap<LevelKey, PolicyLevel>,
    /// System-wide counters switches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,
}

/// Key of `policy.levels`: a level number written as a decimal string.
///
/// Deserializes from either a string or an integer so it works behind
/// `#[serde(flatten)]`, where map keys arrive untyped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LevelKey(pub u32);

impl fmt::Display for LevelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for LevelKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LevelKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LevelKeyVisitor;

        impl Visitor<'_> for LevelKeyVisitor {
            type Value = LevelKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative level number")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<LevelKey, E> {
                u32::try_from(v).map(LevelKey).map_err(E::custom)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<LevelKey, E> {
                v.trim().parse().map(LevelKey).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(LevelKeyVisitor)
    }
}

/// One entry of `policy.levels`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyLevel {
    /// Handshake timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<u32>,
    /// Idle timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_idle: Option<u32>,
    /// Uplink-only value; carries the speed limit for non-zero levels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplink_only: Option<u32>,
    /// Downlink-only value; carries the speed limit for non-zero levels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downlink_only: Option<u32>,
    /// Per-user uplink counters.
    #[serde(default)]
    pub stats_user_uplink: bool,
    /// Per-user downlink counters.
    #[serde(default)]
    pub stats_user_downlink: bool,
    /// Per-user online tracking.
    #[serde(default)]
    pub stats_user_online: bool,
    /// Per-connection buffer size in KB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<u32>,
    /// Fields this version does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PolicyLevel {
    /// Level `0` as the panel requires it: accounting and online tracking on.
    #[must_use]
    pub fn base() -> Self {
        Self {
            handshake: Some(4),
            conn_idle: Some(300),
            uplink_only: Some(0),
            downlink_only: Some(0),
            stats_user_uplink: true,
            stats_user_downlink: true,
            stats_user_online: true,
            buffer_size: None,
            extra: Map::new(),
        }
    }

    /// A speed-limit level: `uplinkOnly = downlinkOnly = limit`.
    #[must_use]
    pub fn speed_limited(limit: u32) -> Self {
        Self {
            uplink_only: Some(limit),
            downlink_only: Some(limit),
            ..Self::base()
        }
    }
}

/// One entry of `inbounds`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundConfig {
    /// Bind address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    /// Listening port.
    pub port: u16,
    /// Protocol name.
    pub protocol: String,
    /// Protocol settings.
    #[serde(default)]
    pub settings: Value,
    /// Transport settings.
    #[serde(
        rename = "streamSettings",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stream_settings: Option<Value>,
    /// Inbound tag used in routing and stats.
    pub tag: String,
    /// Sniffing settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Value>,
    /// Fields this version does not model (`allocate`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundConfig {
    /// The loopback API inbound on `port`.
    #[must_use]
    pub fn api(port: u16) -> Self {
        Self {
            listen: Some("127.0.0.1".to_string()),
            port,
            protocol: "tunnel".to_string(),
            settings: json!({ "address": "127.0.0.1" }),
            stream_settings: None,
            tag: API_TAG.to_string(),
            sniffing: None,
            extra: Map::new(),
        }
    }
}

impl XrayConfig {
    /// Parses a template or a previously written config.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::InvalidSettings`] if the document is not a valid
    /// Xray config shape.
    pub fn parse(text: &str) -> Result<Self, PanelError> {
        serde_json::from_str(text)
            .map_err(|e| PanelError::InvalidSettings(format!("xray config: {e}")))
    }

    /// Pretty JSON as written to disk.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::Internal`] if serialization fails.
    pub fn to_pretty_json(&self) -> Result<String, PanelError> {
        serde_json::to_string_pretty(self).map_err(|e| PanelError::Internal(e.to_string()))
    }

    /// Port of the API inbound, if present.
    #[must_use]
    pub fn api_port(&self) -> Option<u16> {
        self.inbounds
            .iter()
            .find(|i| i.tag == API_TAG)
            .map(|i| i.port)
    }

    /// Makes sure the API plumbing exists: the `api` and `stats` sections,
    /// an API inbound, and a routing rule sending it to the API handler.
    pub fn ensure_api(&mut self) {
        if self.api.is_none() {
            self.api = Some(json!({
                "tag": API_TAG,
                "services": ["HandlerService", "LoggerService", "StatsService"],
            }));
        }
        if self.stats.is_none() {
            self.stats = Some(Value::Object(Map::new()));
        }
        if self.api_port().is_none() {
            self.inbounds.insert(0, InboundConfig::api(DEFAULT_API_PORT));
        }

        let routing = self
            .routing
            .get_or_insert_with(|| json!({ "domainStrategy": "AsIs", "rules": [] }));
        let Some(routing) = routing.as_object_mut() else {
            return;
        };
        let rules = routing
            .entry("rules")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(rules) = rules.as_array_mut() {
            let has_api_rule = rules.iter().any(|r| {
                r.get("outboundTag").and_then(Value::as_str) == Some(API_TAG)
            });
            if !has_api_rule {
                rules.insert(
                    0,
                    json!({ "type": "field", "inboundTag": [API_TAG], "outboundTag": API_TAG }),
                );
            }
        }
    }

    /// Points the API inbound at `port`. Called by the supervisor once it
    /// has picked a free loopback port.
    pub fn set_api_port(&mut self, port: u16) {
        match self.inbounds.iter_mut().find(|i| i.tag == API_TAG) {
            Some(api) => api.port = port,
            None => self.inbounds.insert(0, InboundConfig::api(port)),
        }
    }

    /// Access log path from the `log` section, if file logging is on.
    #[must_use]
    pub fn access_log(&self) -> Option<&str> {
        self.log
            .as_ref()
            .and_then(|l| l.get("access"))
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty() && *p != "none")
    }

    /// Turns file access logging on at `path` unless the template already
    /// names a file. Returns the path Xray will write to.
    pub fn ensure_access_log(&mut self, path: &str) -> String {
        if let Some(existing) = self.access_log() {
            return existing.to_string();
        }
        match self.log.as_mut().and_then(Value::as_object_mut) {
            Some(log) => {
                log.insert("access".to_string(), Value::String(path.to_string()));
            }
            None => self.log = Some(json!({ "access": path, "loglevel": "warning" })),
        }
        path.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn level_keys_serialize_as_decimal_strings() {
        let mut config = XrayConfig::parse("{}").unwrap_or_else(|_| panic!("empty config parses"));
        config.policy.levels.insert(LevelKey(0), PolicyLevel::base());
        config.policy.levels.insert(LevelKey(1024), PolicyLevel::speed_limited(1024));
        let Ok(json) = serde_json::to_value(&config) else {
            panic!("serializes");
        };
        let levels = &json["policy"]["levels"];
        assert_eq!(levels["0"]["statsUserOnline"], true);
        assert_eq!(levels["1024"]["uplinkOnly"], 1024);
        assert_eq!(levels["1024"]["downlinkOnly"], 1024);
    }

    #[test]
    fn level_keys_parse_from_template_strings() {
        let text = r#"{"policy":{"levels":{"0":{"handshake":8},"512":{"uplinkOnly":512}}}}"#;
        let Ok(config) = XrayConfig::parse(text) else {
            panic!("parses");
        };
        let keys: Vec<u32> = config.policy.levels.keys().map(|k| k.0).collect();
        assert_eq!(keys, vec![0, 512]);
    }

    #[test]
    fn unknown_sections_survive_round_trip() {
        let text = r#"{"observatory":{"subjectSelector":["x"]},"inbounds":[],"outbounds":[{"protocol":"freedom","tag":"direct"}]}"#;
        let Ok(config) = XrayConfig::parse(text) else {
            panic!("parses");
        };
        assert!(config.extra.contains_key("observatory"));
        let Ok(out) = serde_json::to_string(&config) else {
            panic!("serializes");
        };
        assert!(out.contains("subjectSelector"));
    }

    #[test]
    fn ensure_api_is_idempotent() {
        let Ok(mut config) = XrayConfig::parse("{}") else {
            panic!("parses");
        };
        config.ensure_api();
        config.ensure_api();
        assert_eq!(config.api_port(), Some(DEFAULT_API_PORT));
        assert_eq!(config.inbounds.len(), 1);
        let rules = config
            .routing
            .as_ref()
            .and_then(|r| r.get("rules"))
            .and_then(Value::as_array)
            .map(Vec::len);
        assert_eq!(rules, Some(1));
    }

    #[test]
    fn access_log_is_enabled_when_template_disables_it() {
        let Ok(mut config) = XrayConfig::parse(r#"{"log":{"access":"none","loglevel":"warning"}}"#)
        else {
            panic!("parses");
        };
        assert_eq!(config.access_log(), None);
        assert_eq!(config.ensure_access_log("/var/log/xray/access.log"), "/var/log/xray/access.log");
        assert_eq!(config.access_log(), Some("/var/log/xray/access.log"));
        let level = config.log.as_ref().and_then(|l| l.get("loglevel")).cloned();
        assert_eq!(level, Some(json!("warning")));

        let Ok(mut bare) = XrayConfig::parse("{}") else {
            panic!("parses");
        };
        bare.ensure_access_log("access.log");
        assert_eq!(bare.access_log(), Some("access.log"));
    }

    #[test]
    fn template_access_log_path_is_kept() {
        let Ok(mut config) = XrayConfig::parse(r#"{"log":{"access":"/srv/xray.log"}}"#) else {
            panic!("parses");
        };
        assert_eq!(config.ensure_access_log("access.log"), "/srv/xray.log");
        assert_eq!(config.access_log(), Some("/srv/xray.log"));
    }

    #[test]
    fn set_api_port_rewrites_existing_inbound() {
        let Ok(mut config) = XrayConfig::parse("{}") else {
            panic!("parses");
        };
        config.ensure_api();
        config.set_api_port(40000);
        assert_eq!(config.api_port(), Some(40000));
        assert_eq!(config.inbounds.len(), 1);
    }
}
