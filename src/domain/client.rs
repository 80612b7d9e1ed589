//! Client credentials embedded in an inbound's settings blob.
//!
//! The settings blob is the JSON document Xray expects under
//! `inbounds[].settings`, enriched with panel-only fields (quota, expiry,
//! speed limit, Telegram id). [`InboundSettings`] parses it, preserving every
//! field it does not model so a round trip never loses data written by a
//! newer panel.

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::PanelError;

/// Flow value older panels stored for Vision over UDP/443.
pub const LEGACY_VISION_UDP443: &str = "xtls-rprx-vision-udp443";

/// The flow Xray understands for [`LEGACY_VISION_UDP443`].
pub const VISION_FLOW: &str = "xtls-rprx-vision";

/// One credential attached to an inbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    /// UUID for VMess/VLESS.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Password for Trojan/Shadowsocks.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Panel-unique human key.
    #[serde(default)]
    pub email: String,
    /// XTLS flow (VLESS only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flow: String,
    /// Administrative switch.
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Expiry in ms since epoch; `0` never, negative is relative days.
    #[serde(default)]
    pub expiry_time: i64,
    /// Traffic quota in bytes; `0` unlimited.
    #[serde(default, rename = "totalGB")]
    pub total_gb: i64,
    /// Concurrent source IPs allowed; `0` unlimited.
    #[serde(default)]
    pub limit_ip: u32,
    /// Rate cap in KB/s carried as the Xray level; `0` unlimited.
    #[serde(default)]
    pub speed_limit: u32,
    /// Telegram chat id; `0` none.
    #[serde(default, deserialize_with = "lenient_i64")]
    pub tg_id: i64,
    /// Subscription id.
    #[serde(default)]
    pub sub_id: String,
    /// Free-form note.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    /// Auto-renew period in days.
    #[serde(default)]
    pub reset: i64,
    /// VMess cipher.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub security: String,
    /// Per-user Shadowsocks cipher.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    /// Fields this version does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Client {
    /// Creates an enabled client with the given credential and email and no
    /// limits.
    #[must_use]
    pub fn new(credential: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: credential.into(),
            password: String::new(),
            email: email.into(),
            flow: String::new(),
            enable: true,
            expiry_time: 0,
            total_gb: 0,
            limit_ip: 0,
            speed_limit: 0,
            tg_id: 0,
            sub_id: String::new(),
            comment: String::new(),
            reset: 0,
            security: String::new(),
            method: String::new(),
            extra: Map::new(),
        }
    }

    /// Creates an enabled password-keyed client (Trojan, Shadowsocks).
    #[must_use]
    pub fn with_password(password: impl Into<String>, email: impl Into<String>) -> Self {
        let mut client = Self::new(String::new(), email);
        client.password = password.into();
        client
    }

    /// Flow as Xray understands it.
    #[must_use]
    pub fn normalized_flow(&self) -> &str {
        if self.flow == LEGACY_VISION_UDP443 {
            VISION_FLOW
        } else {
            &self.flow
        }
    }

    /// Credential used in share links and stats: id, else password.
    #[must_use]
    pub fn credential(&self) -> &str {
        if self.id.is_empty() {
            &self.password
        } else {
            &self.id
        }
    }
}

fn default_true() -> bool {
    true
}

/// Telegram ids were stored as strings by some panel versions.
fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => Ok(n.as_i64().unwrap_or_default()),
        Value::String(s) if s.trim().is_empty() => Ok(0),
        Value::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        Value::Null => Ok(0),
        other => Err(serde::de::Error::custom(format!(
            "expected integer tgId, got {other}"
        ))),
    }
}

/// Parsed form of `inbounds.settings`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundSettings {
    /// Embedded clients in insertion order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clients: Vec<Client>,
    /// Protocol specific fields (`decryption`, `method`, `fallbacks`, ...).
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl InboundSettings {
    /// Parses a settings blob. An empty blob is an empty settings object.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::InvalidSettings`] when the blob is not a JSON
    /// object or two clients share an email.
    pub fn parse(blob: &str) -> Result<Self, PanelError> {
        if blob.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Self = serde_json::from_str(blob)
            .map_err(|e| PanelError::InvalidSettings(e.to_string()))?;
        settings.check_unique_emails()?;
        Ok(settings)
    }

    /// Serializes back into the blob stored in the database.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::Internal`] if serialization fails.
    pub fn to_blob(&self) -> Result<String, PanelError> {
        serde_json::to_string(self).map_err(|e| PanelError::Internal(e.to_string()))
    }

    /// Rejects settings in which two clients share a non-empty email.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::InvalidSettings`] naming the duplicate.
    pub fn check_unique_emails(&self) -> Result<(), PanelError> {
        let mut seen = HashSet::with_capacity(self.clients.len());
        for client in &self.clients {
            if client.email.is_empty() {
                continue;
            }
            if !seen.insert(client.email.to_ascii_lowercase()) {
                return Err(PanelError::InvalidSettings(format!(
                    "duplicate email {} in inbound",
                    client.email
                )));
            }
        }
        Ok(())
    }

    /// Finds a client by email, ignoring ASCII case.
    #[must_use]
    pub fn client(&self, email: &str) -> Option<&Client> {
        self.clients
            .iter()
            .find(|c| c.email.eq_ignore_ascii_case(email))
    }

    /// Finds a client by email for mutation, ignoring ASCII case.
    pub fn client_mut(&mut self, email: &str) -> Option<&mut Client> {
        self.clients
            .iter_mut()
            .find(|c| c.email.eq_ignore_ascii_case(email))
    }

    /// String field from the protocol specific part (e.g. `method`).
    #[must_use]
    pub fn rest_str(&self, key: &str) -> Option<&str> {
        self.rest.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn parses_unknown_fields_and_keeps_them() {
        let blob = r#"{"clients":[{"id":"u1","email":"a@x","futureField":7}],"decryption":"none"}"#;
        let Ok(settings) = InboundSettings::parse(blob) else {
            panic!("valid settings");
        };
        let Some(client) = settings.clients.first() else {
            panic!("one client");
        };
        assert_eq!(client.extra.get("futureField"), Some(&Value::from(7)));
        assert!(client.enable);
        assert_eq!(settings.rest_str("decryption"), Some("none"));

        let Ok(blob) = settings.to_blob() else {
            panic!("serializes");
        };
        assert!(blob.contains("futureField"));
    }

    #[test]
    fn rejects_duplicate_emails() {
        let blob = r#"{"clients":[{"id":"u1","email":"a@x"},{"id":"u2","email":"A@x"}]}"#;
        let err = InboundSettings::parse(blob);
        assert!(matches!(err, Err(PanelError::InvalidSettings(_))));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            InboundSettings::parse("{clients:"),
            Err(PanelError::InvalidSettings(_))
        ));
    }

    #[test]
    fn tg_id_accepts_string_or_number() {
        let blob = r#"{"clients":[{"email":"a","tgId":"42"},{"email":"b","tgId":7},{"email":"c","tgId":""}]}"#;
        let Ok(settings) = InboundSettings::parse(blob) else {
            panic!("valid settings");
        };
        let ids: Vec<i64> = settings.clients.iter().map(|c| c.tg_id).collect();
        assert_eq!(ids, vec![42, 7, 0]);
    }

    #[test]
    fn legacy_vision_flow_is_normalized() {
        let mut client = Client::new("u1", "a@x");
        client.flow = LEGACY_VISION_UDP443.to_string();
        assert_eq!(client.normalized_flow(), VISION_FLOW);
    }

    #[test]
    fn credential_prefers_id() {
        let trojan = Client::with_password("secret", "t@x");
        assert_eq!(trojan.credential(), "secret");
        let vless = Client::new("uuid-1", "v@x");
        assert_eq!(vless.credential(), "uuid-1");
    }
}
