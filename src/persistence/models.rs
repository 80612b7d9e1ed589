//! Row types for the SQLite tables.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::{ClientTraffic, Inbound};
use crate::error::PanelError;

/// A row of the `inbounds` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InboundRow {
    /// Row id.
    pub id: i64,
    /// Owning panel user.
    pub user_id: i64,
    /// Uploaded bytes.
    pub up: i64,
    /// Downloaded bytes.
    pub down: i64,
    /// Quota in bytes.
    pub total: i64,
    /// Display name.
    pub remark: String,
    /// Administrative switch.
    pub enable: bool,
    /// Expiry in ms since epoch.
    pub expiry_time: i64,
    /// Bind address.
    pub listen: String,
    /// Listening port.
    pub port: i64,
    /// Protocol name.
    pub protocol: String,
    /// Settings blob.
    pub settings: String,
    /// Stream settings blob.
    pub stream_settings: String,
    /// Xray tag.
    pub tag: String,
    /// Sniffing blob.
    pub sniffing: String,
}

impl InboundRow {
    /// Converts into the domain type, attaching its traffic rows.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] when the stored port is out
    /// of range.
    pub fn into_inbound(self, client_stats: Vec<ClientTraffic>) -> Result<Inbound, PanelError> {
        let port = u16::try_from(self.port).map_err(|_| {
            PanelError::PersistenceError(format!("inbound {} has port {}", self.id, self.port))
        })?;
        Ok(Inbound {
            id: self.id,
            user_id: self.user_id,
            up: self.up,
            down: self.down,
            total: self.total,
            remark: self.remark,
            enable: self.enable,
            expiry_time: self.expiry_time,
            listen: self.listen,
            port,
            protocol: self.protocol,
            settings: self.settings,
            stream_settings: self.stream_settings,
            tag: self.tag,
            sniffing: self.sniffing,
            client_stats,
        })
    }
}

/// A generated share link kept in `link_history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LinkRecord {
    /// Row id.
    pub id: i64,
    /// `vless`, `vmess`, `trojan` or `ss`.
    pub link_type: String,
    /// Full URI.
    pub link: String,
    /// Creation time in ms since epoch.
    pub created_at: i64,
}

/// A `short_links` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ShortLink {
    /// Unique code.
    pub code: String,
    /// Link the code resolves to.
    pub link: String,
    /// Creation time in ms since epoch.
    pub created_at: i64,
}

/// Source IPs last observed for a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientIps {
    /// Client email.
    pub client_email: String,
    /// Distinct IPs, sorted.
    pub ips: Vec<String>,
}

/// An `outbound_traffics` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct OutboundTraffic {
    /// Outbound tag.
    pub tag: String,
    /// Uploaded bytes.
    pub up: i64,
    /// Downloaded bytes.
    pub down: i64,
    /// Sum of both directions.
    pub total: i64,
}

/// A panel login.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    /// Row id.
    pub id: i64,
    /// Login name.
    pub username: String,
    /// Bcrypt hash, or plaintext on databases from before the hashing seeder.
    pub password: String,
}
