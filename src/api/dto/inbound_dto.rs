//! Inbound request/response bodies.
//!
//! The JSON blobs (`settings`, `streamSettings`, `sniffing`) travel as JSON
//! objects on the wire and as text in the repository.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::domain::{ClientTraffic, Inbound};

/// Request body for `POST /inbounds` and `PUT /inbounds/{id}`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InboundRequest {
    /// Display name.
    #[serde(default)]
    pub remark: String,
    /// Administrative switch. Defaults to `true`.
    #[serde(default = "default_enable")]
    pub enable: bool,
    /// Quota in bytes; `0` unlimited.
    #[serde(default)]
    pub total: i64,
    /// Expiry in ms since epoch; `0` never.
    #[serde(default)]
    pub expiry_time: i64,
    /// Bind address; empty for all interfaces.
    #[serde(default)]
    pub listen: String,
    /// Listening port.
    pub port: u16,
    /// `vmess`, `vless`, `trojan`, `shadowsocks`, ...
    pub protocol: String,
    /// Explicit Xray tag; derived when empty.
    #[serde(default)]
    pub tag: String,
    /// Protocol settings (object or JSON text).
    #[serde(default)]
    #[schema(value_type = Object)]
    pub settings: Value,
    /// Transport settings (object or JSON text).
    #[serde(default)]
    #[schema(value_type = Object)]
    pub stream_settings: Value,
    /// Sniffing settings (object or JSON text).
    #[serde(default)]
    #[schema(value_type = Object)]
    pub sniffing: Value,
}

fn default_enable() -> bool {
    true
}

fn blob(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn unblob(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

impl InboundRequest {
    /// Domain inbound with `id` 0; the repository assigns the real one.
    #[must_use]
    pub fn into_inbound(self) -> Inbound {
        Inbound {
            id: 0,
            user_id: 1,
            up: 0,
            down: 0,
            total: self.total,
            remark: self.remark,
            enable: self.enable,
            expiry_time: self.expiry_time,
            listen: self.listen,
            port: self.port,
            protocol: self.protocol,
            settings: blob(&self.settings),
            stream_settings: blob(&self.stream_settings),
            tag: self.tag,
            sniffing: blob(&self.sniffing),
            client_stats: Vec::new(),
        }
    }
}

/// An inbound as returned by the API.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InboundResponse {
    /// Row id.
    pub id: i64,
    /// Display name.
    pub remark: String,
    /// Administrative switch.
    pub enable: bool,
    /// Uploaded bytes.
    pub up: i64,
    /// Downloaded bytes.
    pub down: i64,
    /// Quota in bytes.
    pub total: i64,
    /// Expiry in ms since epoch.
    pub expiry_time: i64,
    /// Bind address.
    pub listen: String,
    /// Listening port.
    pub port: u16,
    /// Protocol name.
    pub protocol: String,
    /// Xray tag.
    pub tag: String,
    /// Protocol settings.
    #[schema(value_type = Object)]
    pub settings: Value,
    /// Transport settings.
    #[schema(value_type = Object)]
    pub stream_settings: Value,
    /// Sniffing settings.
    #[schema(value_type = Object)]
    pub sniffing: Value,
    /// Client counters.
    #[schema(value_type = Vec<Object>)]
    pub client_stats: Vec<ClientTraffic>,
}

impl From<Inbound> for InboundResponse {
    fn from(inbound: Inbound) -> Self {
        Self {
            settings: unblob(&inbound.settings),
            stream_settings: unblob(&inbound.stream_settings),
            sniffing: unblob(&inbound.sniffing),
            id: inbound.id,
            remark: inbound.remark,
            enable: inbound.enable,
            up: inbound.up,
            down: inbound.down,
            total: inbound.total,
            expiry_time: inbound.expiry_time,
            listen: inbound.listen,
            port: inbound.port,
            protocol: inbound.protocol,
            tag: inbound.tag,
            client_stats: inbound.client_stats,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_and_text_blobs_are_both_accepted() {
        let req: Result<InboundRequest, _> = serde_json::from_value(json!({
            "port": 443,
            "protocol": "vless",
            "settings": {"clients": [], "decryption": "none"},
            "streamSettings": "{\"network\":\"tcp\"}"
        }));
        let Ok(req) = req else {
            panic!("request should parse");
        };
        let inbound = req.into_inbound();
        assert!(inbound.enable);
        assert_eq!(inbound.stream_settings, r#"{"network":"tcp"}"#);
        assert!(inbound.settings.contains("\"decryption\":\"none\""));
        assert!(inbound.sniffing.is_empty());
    }

    #[test]
    fn response_parses_blobs_back_into_objects() {
        let req: Result<InboundRequest, _> = serde_json::from_value(json!({
            "port": 8443,
            "protocol": "trojan",
            "settings": {"clients": []}
        }));
        let Ok(req) = req else {
            panic!("request should parse");
        };
        let response = InboundResponse::from(req.into_inbound());
        assert_eq!(response.settings, json!({"clients": []}));
        assert_eq!(response.stream_settings, Value::Null);
    }
}
