//! Inbounds: listening endpoints of Xray as persisted by the panel.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::client::{Client, InboundSettings};
use super::traffic::ClientTraffic;
use crate::error::PanelError;

/// Protocols an inbound may speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// VMess.
    Vmess,
    /// VLESS.
    Vless,
    /// Trojan.
    Trojan,
    /// Shadowsocks (including 2022 ciphers).
    Shadowsocks,
    /// SOCKS5 / mixed.
    Socks,
    /// HTTP proxy.
    Http,
    /// WireGuard.
    Wireguard,
    /// Transparent tunnel (formerly `dokodemo-door`).
    Tunnel,
}

impl Protocol {
    /// Protocol name as written into the Xray config.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Vmess => "vmess",
            Self::Vless => "vless",
            Self::Trojan => "trojan",
            Self::Shadowsocks => "shadowsocks",
            Self::Socks => "socks",
            Self::Http => "http",
            Self::Wireguard => "wireguard",
            Self::Tunnel => "tunnel",
        }
    }

    /// Whether the settings blob carries a `clients` array with emails.
    #[must_use]
    pub const fn has_clients(self) -> bool {
        matches!(
            self,
            Self::Vmess | Self::Vless | Self::Trojan | Self::Shadowsocks
        )
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = PanelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vmess" => Ok(Self::Vmess),
            "vless" => Ok(Self::Vless),
            "trojan" => Ok(Self::Trojan),
            "shadowsocks" => Ok(Self::Shadowsocks),
            "socks" | "mixed" => Ok(Self::Socks),
            "http" => Ok(Self::Http),
            "wireguard" => Ok(Self::Wireguard),
            "tunnel" | "dokodemo-door" => Ok(Self::Tunnel),
            other => Err(PanelError::InvalidInbound(format!(
                "unknown protocol {other:?}"
            ))),
        }
    }
}

/// One listening endpoint of Xray.
///
/// `protocol` stays a raw string so rows written by other panel versions
/// still load; it is validated when the inbound is assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    /// Row id.
    pub id: i64,
    /// Owning panel user.
    #[serde(default = "default_user")]
    pub user_id: i64,
    /// Uploaded bytes.
    #[serde(default)]
    pub up: i64,
    /// Downloaded bytes.
    #[serde(default)]
    pub down: i64,
    /// Quota in bytes; `0` unlimited.
    #[serde(default)]
    pub total: i64,
    /// Display name.
    #[serde(default)]
    pub remark: String,
    /// Administrative switch.
    pub enable: bool,
    /// Expiry in ms since epoch; `0` never.
    #[serde(default)]
    pub expiry_time: i64,
    /// Bind address; empty means all interfaces.
    #[serde(default)]
    pub listen: String,
    /// Listening port.
    pub port: u16,
    /// Protocol name.
    pub protocol: String,
    /// Protocol specific JSON.
    #[serde(default)]
    pub settings: String,
    /// Transport JSON.
    #[serde(default)]
    pub stream_settings: String,
    /// Xray inbound tag; derived from listen/port when empty.
    #[serde(default)]
    pub tag: String,
    /// Sniffing JSON.
    #[serde(default)]
    pub sniffing: String,
    /// Traffic rows of the embedded clients.
    #[serde(default)]
    pub client_stats: Vec<ClientTraffic>,
}

fn default_user() -> i64 {
    1
}

impl Inbound {
    /// Parsed protocol.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::InvalidInbound`] for unknown protocols.
    pub fn protocol(&self) -> Result<Protocol, PanelError> {
        self.protocol.parse()
    }

    /// Parsed settings blob.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::InvalidSettings`] if the blob is malformed.
    pub fn parsed_settings(&self) -> Result<InboundSettings, PanelError> {
        InboundSettings::parse(&self.settings)
    }

    /// Structured clients of this inbound in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::InvalidSettings`] if the blob is malformed.
    pub fn clients(&self) -> Result<Vec<Client>, PanelError> {
        Ok(self.parsed_settings()?.clients)
    }

    /// Tag Xray reports stats under: `inbound-<port>` or
    /// `inbound-<listen>:<port>` for a specific bind address.
    #[must_use]
    pub fn derived_tag(&self) -> String {
        if is_wildcard(&self.listen) {
            format!("inbound-{}", self.port)
        } else {
            format!("inbound-{}:{}", self.listen, self.port)
        }
    }

    /// The stored tag, or the derived one when none was stored.
    #[must_use]
    pub fn effective_tag(&self) -> String {
        if self.tag.is_empty() {
            self.derived_tag()
        } else {
            self.tag.clone()
        }
    }

    /// Whether the tag was generated from listen/port rather than chosen,
    /// including the `-<n>` suffix added when the plain form was taken.
    #[must_use]
    pub fn has_derived_tag(&self) -> bool {
        let derived = self.derived_tag();
        self.tag.is_empty()
            || self.tag == derived
            || self
                .tag
                .strip_prefix(derived.as_str())
                .and_then(|rest| rest.strip_prefix('-'))
                .is_some_and(|n| n.parse::<u32>().is_ok())
    }

    /// Traffic row of a client of this inbound.
    #[must_use]
    pub fn traffic_for(&self, email: &str) -> Option<&ClientTraffic> {
        self.client_stats
            .iter()
            .find(|t| t.email.eq_ignore_ascii_case(email))
    }

    /// Whether the inbound's own quota is used up.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.total > 0 && self.up.saturating_add(self.down) >= self.total
    }

    /// Whether the inbound's own expiry has passed.
    #[must_use]
    pub const fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_time > 0 && self.expiry_time <= now_ms
    }
}

/// `true` for empty, `0.0.0.0` and `::` bind addresses.
#[must_use]
pub fn is_wildcard(listen: &str) -> bool {
    matches!(listen, "" | "0.0.0.0" | "::" | "::0")
}
