//! Client operations. A client lives in two places: its entry in the
//! inbound's settings blob and its `client_traffics` row. Every write here
//! updates both in one transaction.

use std::collections::BTreeSet;

use serde::Serialize;
use sqlx::{Sqlite, Transaction};
use utoipa::ToSchema;

use super::inbounds::{
    TRAFFIC_COLUMNS, delete_client_rows, ensure_email_free, fetch_inbound, insert_client_traffic,
    sync_client_traffic,
};
use super::models::{ClientIps, OutboundTraffic};
use super::sqlite::{SqliteRepository, now_ms};
use crate::domain::traffic::activate_relative_expiry;
use crate::domain::{Client, ClientTraffic, InboundSettings};
use crate::error::PanelError;

/// A client with the inbound it belongs to and its counters.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    /// Owning inbound.
    pub inbound_id: i64,
    /// Settings entry.
    #[schema(value_type = Object)]
    pub client: Client,
    /// Counter row, absent only for rows written by broken imports.
    #[schema(value_type = Option<Object>)]
    pub traffic: Option<ClientTraffic>,
}

impl SqliteRepository {
    /// Structured clients of an inbound in insertion order.
    ///
    /// # Errors
    ///
    /// [`PanelError::NotFound`] for unknown inbounds,
    /// [`PanelError::InvalidSettings`] for malformed blobs.
    pub async fn list_clients(&self, inbound_id: i64) -> Result<Vec<Client>, PanelError> {
        self.get_inbound(inbound_id).await?.clients()
    }

    /// Looks a client up by email, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] if no client has `email`.
    pub async fn get_client_by_email(&self, email: &str) -> Result<ClientRecord, PanelError> {
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        let (inbound_id, settings) = load_owner(&mut tx, email).await?;
        let client = settings
            .client(email)
            .cloned()
            .ok_or_else(|| PanelError::NotFound(format!("client {email}")))?;
        let traffic = fetch_traffic(&mut tx, email).await?;
        tx.commit().await?;
        Ok(ClientRecord {
            inbound_id,
            client,
            traffic,
        })
    }

    /// Clients linked to a Telegram chat.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn clients_by_tg_id(&self, tg_id: i64) -> Result<Vec<ClientRecord>, PanelError> {
        let mut out = Vec::new();
        for inbound in self.list_inbounds().await? {
            let Ok(clients) = inbound.clients() else {
                continue;
            };
            for client in clients.into_iter().filter(|c| c.tg_id == tg_id) {
                let traffic = inbound.traffic_for(&client.email).cloned();
                out.push(ClientRecord {
                    inbound_id: inbound.id,
                    client,
                    traffic,
                });
            }
        }
        Ok(out)
    }

    /// Appends a client to an inbound and creates its traffic row.
    ///
    /// # Errors
    ///
    /// [`PanelError::InvalidInbound`] when the protocol has no clients,
    /// [`PanelError::InvalidSettings`] for a missing email, and
    /// [`PanelError::Conflict`] when the email is taken.
    pub async fn add_client(&self, inbound_id: i64, client: &Client) -> Result<ClientRecord, PanelError> {
        if client.email.trim().is_empty() {
            return Err(PanelError::InvalidSettings("client email is required".to_string()));
        }
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        let inbound = fetch_inbound(&mut tx, inbound_id).await?;
        if !inbound.protocol()?.has_clients() {
            return Err(PanelError::InvalidInbound(format!(
                "{} inbounds have no clients",
                inbound.protocol
            )));
        }
        ensure_email_free(&mut tx, &client.email, None).await?;
        let mut settings = inbound.parsed_settings()?;
        settings.clients.push(client.clone());
        settings.check_unique_emails()?;
        store_settings(&mut tx, inbound_id, &settings).await?;
        insert_client_traffic(&mut tx, inbound_id, client).await?;
        let traffic = fetch_traffic(&mut tx, &client.email).await?;
        tx.commit().await?;
        tracing::info!(inbound_id, email = %client.email, "client added");
        Ok(ClientRecord {
            inbound_id,
            client: client.clone(),
            traffic,
        })
    }

    /// Replaces the client stored under `email`. The email itself may
    /// change; counters follow the client.
    ///
    /// # Errors
    ///
    /// [`PanelError::NotFound`] for unknown emails, [`PanelError::Conflict`]
    /// when the new email is taken.
    pub async fn update_client(&self, email: &str, client: &Client) -> Result<ClientRecord, PanelError> {
        if client.email.trim().is_empty() {
            return Err(PanelError::InvalidSettings("client email is required".to_string()));
        }
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        let (inbound_id, mut settings) = load_owner(&mut tx, email).await?;
        if !client.email.eq_ignore_ascii_case(email) {
            ensure_email_free(&mut tx, &client.email, None).await?;
        }
        let slot = settings
            .client_mut(email)
            .ok_or_else(|| PanelError::NotFound(format!("client {email}")))?;
        *slot = client.clone();
        settings.check_unique_emails()?;
        store_settings(&mut tx, inbound_id, &settings).await?;

        sqlx::query("UPDATE client_traffics SET email = ? WHERE email = ? COLLATE NOCASE")
            .bind(&client.email)
            .bind(email)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE inbound_client_ips SET client_email = ? WHERE client_email = ? COLLATE NOCASE",
        )
        .bind(&client.email)
        .bind(email)
        .execute(&mut *tx)
        .await?;
        sync_client_traffic(&mut tx, client).await?;
        let traffic = fetch_traffic(&mut tx, &client.email).await?;
        tx.commit().await?;
        Ok(ClientRecord {
            inbound_id,
            client: client.clone(),
            traffic,
        })
    }

    /// Removes a client from its inbound together with its rows.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown emails.
    pub async fn delete_client(&self, email: &str) -> Result<Client, PanelError> {
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        let (inbound_id, mut settings) = load_owner(&mut tx, email).await?;
        let pos = settings
            .clients
            .iter()
            .position(|c| c.email.eq_ignore_ascii_case(email))
            .ok_or_else(|| PanelError::NotFound(format!("client {email}")))?;
        let removed = settings.clients.remove(pos);
        store_settings(&mut tx, inbound_id, &settings).await?;
        delete_client_rows(&mut tx, email).await?;
        tx.commit().await?;
        tracing::info!(inbound_id, %email, "client deleted");
        Ok(removed)
    }

    /// Sets a client's enable flag in both places. Returns whether anything
    /// changed.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown emails.
    pub async fn set_client_enable(&self, email: &str, enable: bool) -> Result<bool, PanelError> {
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        let (before, _) = edit_client(&mut tx, email, |c| c.enable = enable).await?;
        let result = sqlx::query(
            "UPDATE client_traffics SET enable = ? WHERE email = ? COLLATE NOCASE AND enable != ?",
        )
        .bind(enable)
        .bind(email)
        .bind(enable)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(before.enable != enable || result.rows_affected() > 0)
    }

    /// Flips a client's enable flag and returns the new value.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown emails.
    pub async fn toggle_client_enable(&self, email: &str) -> Result<bool, PanelError> {
        let current = self.get_client_by_email(email).await?;
        let enabled = current.client.enable && current.traffic.is_none_or(|t| t.enable);
        self.set_client_enable(email, !enabled).await?;
        Ok(!enabled)
    }

    /// Links a client to a Telegram chat; `0` unlinks it.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown emails.
    pub async fn set_client_tg_id(&self, email: &str, tg_id: i64) -> Result<(), PanelError> {
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        edit_client(&mut tx, email, |c| c.tg_id = tg_id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Sets the concurrent-IP limit; `0` removes it.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown emails.
    pub async fn set_client_ip_limit(&self, email: &str, limit: u32) -> Result<(), PanelError> {
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        edit_client(&mut tx, email, |c| c.limit_ip = limit).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Sets the client's expiry in both places.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown emails.
    pub async fn reset_client_expiry(&self, email: &str, expiry_ms: i64) -> Result<(), PanelError> {
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        edit_client(&mut tx, email, |c| c.expiry_time = expiry_ms).await?;
        sqlx::query("UPDATE client_traffics SET expiry_time = ? WHERE email = ? COLLATE NOCASE")
            .bind(expiry_ms)
            .bind(email)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Zeroes a client's counters and re-enables it. Returns whether the
    /// client had been disabled, i.e. whether Xray needs a restart.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown emails.
    pub async fn reset_client_traffic(&self, email: &str) -> Result<bool, PanelError> {
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        let was_enabled = fetch_traffic(&mut tx, email)
            .await?
            .is_none_or(|t| t.enable);
        let (before, _) = edit_client(&mut tx, email, |c| c.enable = true).await?;
        sqlx::query(
            "UPDATE client_traffics SET up = 0, down = 0, enable = 1 WHERE email = ? COLLATE NOCASE",
        )
        .bind(email)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(!was_enabled || !before.enable)
    }

    /// Zeroes the counters of every client of an inbound and re-enables
    /// them in both places. Returns the number of rows reset and whether any
    /// client had been disabled.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown inbounds and
    /// [`PanelError::InvalidSettings`] if its settings blob is malformed.
    pub async fn reset_all_client_traffic(&self, inbound_id: i64) -> Result<(u64, bool), PanelError> {
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        let inbound = fetch_inbound(&mut tx, inbound_id).await?;
        let mut settings = inbound.parsed_settings()?;
        let mut reenabled = inbound.client_stats.iter().any(|t| !t.enable);
        if settings.clients.iter().any(|c| !c.enable) {
            for client in &mut settings.clients {
                client.enable = true;
            }
            store_settings(&mut tx, inbound_id, &settings).await?;
            reenabled = true;
        }
        let result = sqlx::query(
            "UPDATE client_traffics SET up = 0, down = 0, enable = 1 WHERE inbound_id = ?",
        )
        .bind(inbound_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::info!(inbound_id, reenabled, "client traffic of inbound reset");
        Ok((result.rows_affected(), reenabled))
    }

    /// Removes the disabled clients of an inbound whose quota is used up or
    /// whose expiry has passed. Returns their emails.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown inbounds.
    pub async fn delete_depleted_clients(&self, inbound_id: i64) -> Result<Vec<String>, PanelError> {
        let now = now_ms();
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        let inbound = fetch_inbound(&mut tx, inbound_id).await?;
        let depleted: BTreeSet<String> = inbound
            .client_stats
            .iter()
            .filter(|t| !t.enable && (t.is_exhausted() || t.is_expired(now)))
            .map(|t| t.email.to_ascii_lowercase())
            .collect();
        if depleted.is_empty() {
            return Ok(Vec::new());
        }
        let mut settings = inbound.parsed_settings()?;
        settings
            .clients
            .retain(|c| !depleted.contains(&c.email.to_ascii_lowercase()));
        store_settings(&mut tx, inbound_id, &settings).await?;
        for email in &depleted {
            delete_client_rows(&mut tx, email).await?;
        }
        tx.commit().await?;
        tracing::info!(inbound_id, count = depleted.len(), "depleted clients deleted");
        Ok(depleted.into_iter().collect())
    }

    /// Adds a traffic delta to a client's row. When the row is missing and
    /// `inbound_tag` names an inbound, the row is created under it. Returns
    /// whether a row was written.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn upsert_traffic_delta(
        &self,
        inbound_tag: &str,
        email: &str,
        up: i64,
        down: i64,
    ) -> Result<bool, PanelError> {
        let result = sqlx::query(
            "INSERT INTO client_traffics (inbound_id, enable, email, up, down) \
             SELECT id, 1, ?, ?, ? FROM inbounds WHERE tag = ? \
             ON CONFLICT (email) DO UPDATE SET up = up + excluded.up, down = down + excluded.down",
        )
        .bind(email)
        .bind(up.max(0))
        .bind(down.max(0))
        .bind(inbound_tag)
        .execute(&self.pool())
        .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        let result = sqlx::query(
            "UPDATE client_traffics SET up = up + ?, down = down + ? WHERE email = ? COLLATE NOCASE",
        )
        .bind(up.max(0))
        .bind(down.max(0))
        .bind(email)
        .execute(&self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Turns a negative (relative days) expiry into an absolute one counted
    /// from `now_ms`. Returns the new expiry when one was activated.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn activate_client_expiry(&self, email: &str, now_ms: i64) -> Result<Option<i64>, PanelError> {
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        let Some(traffic) = fetch_traffic(&mut tx, email).await? else {
            return Ok(None);
        };
        if traffic.expiry_time >= 0 {
            return Ok(None);
        }
        let expiry = activate_relative_expiry(traffic.expiry_time, now_ms);
        sqlx::query("UPDATE client_traffics SET expiry_time = ? WHERE id = ?")
            .bind(expiry)
            .bind(traffic.id)
            .execute(&mut *tx)
            .await?;
        match edit_client(&mut tx, email, |c| c.expiry_time = expiry).await {
            Ok(_) | Err(PanelError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        tx.commit().await?;
        tracing::debug!(%email, expiry, "relative expiry activated");
        Ok(Some(expiry))
    }

    /// Every client traffic row.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn list_client_traffics(&self) -> Result<Vec<ClientTraffic>, PanelError> {
        Ok(sqlx::query_as(&format!(
            "SELECT {TRAFFIC_COLUMNS} FROM client_traffics ORDER BY id"
        ))
        .fetch_all(&self.pool())
        .await?)
    }

    /// Stamps `last_online` for the given emails.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn set_last_online(&self, emails: &[String], at_ms: i64) -> Result<(), PanelError> {
        if emails.is_empty() {
            return Ok(());
        }
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        for email in emails {
            sqlx::query("UPDATE client_traffics SET last_online = ? WHERE email = ? COLLATE NOCASE")
                .bind(at_ms)
                .bind(email)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Replaces the recorded source IPs of a client.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn record_client_ips(&self, email: &str, ips: &[String]) -> Result<(), PanelError> {
        let json = serde_json::to_string(ips).map_err(|e| PanelError::Internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO inbound_client_ips (client_email, ips) VALUES (?, ?) \
             ON CONFLICT (client_email) DO UPDATE SET ips = excluded.ips",
        )
        .bind(email)
        .bind(json)
        .execute(&self.pool())
        .await?;
        Ok(())
    }

    /// Recorded source IPs of a client; empty when none were seen.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn get_client_ips(&self, email: &str) -> Result<ClientIps, PanelError> {
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT ips FROM inbound_client_ips WHERE client_email = ? COLLATE NOCASE",
        )
        .bind(email)
        .fetch_optional(&self.pool())
        .await?;
        let ips = raw
            .and_then(|r| serde_json::from_str(&r).ok())
            .unwrap_or_default();
        Ok(ClientIps {
            client_email: email.to_string(),
            ips,
        })
    }

    /// Adds a traffic delta to an outbound's counters.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn add_outbound_traffic(&self, tag: &str, up: i64, down: i64) -> Result<(), PanelError> {
        let (up, down) = (up.max(0), down.max(0));
        sqlx::query(
            "INSERT INTO outbound_traffics (tag, up, down, total) VALUES (?, ?, ?, ?) \
             ON CONFLICT (tag) DO UPDATE SET up = up + excluded.up, down = down + excluded.down, \
             total = total + excluded.total",
        )
        .bind(tag)
        .bind(up)
        .bind(down)
        .bind(up.saturating_add(down))
        .execute(&self.pool())
        .await?;
        Ok(())
    }

    /// Counters of every outbound.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn list_outbound_traffics(&self) -> Result<Vec<OutboundTraffic>, PanelError> {
        Ok(
            sqlx::query_as("SELECT tag, up, down, total FROM outbound_traffics ORDER BY tag")
                .fetch_all(&self.pool())
                .await?,
        )
    }
}

/// Finds the inbound holding `email` and parses its settings.
async fn load_owner(
    tx: &mut Transaction<'_, Sqlite>,
    email: &str,
) -> Result<(i64, InboundSettings), PanelError> {
    let inbound_id: Option<i64> = sqlx::query_scalar(
        "SELECT inbound_id FROM client_traffics WHERE email = ? COLLATE NOCASE",
    )
    .bind(email)
    .fetch_optional(&mut **tx)
    .await?;
    let inbound_id = inbound_id.ok_or_else(|| PanelError::NotFound(format!("client {email}")))?;
    let inbound = fetch_inbound(tx, inbound_id).await?;
    Ok((inbound_id, inbound.parsed_settings()?))
}

/// Applies `edit` to the settings entry of `email` and stores the blob.
/// Returns the entry before and after.
async fn edit_client<F>(
    tx: &mut Transaction<'_, Sqlite>,
    email: &str,
    edit: F,
) -> Result<(Client, Client), PanelError>
where
    F: FnOnce(&mut Client) + Send,
{
    let (inbound_id, mut settings) = load_owner(tx, email).await?;
    let client = settings
        .client_mut(email)
        .ok_or_else(|| PanelError::NotFound(format!("client {email}")))?;
    let before = client.clone();
    edit(client);
    let after = client.clone();
    store_settings(tx, inbound_id, &settings).await?;
    Ok((before, after))
}

async fn store_settings(
    tx: &mut Transaction<'_, Sqlite>,
    inbound_id: i64,
    settings: &InboundSettings,
) -> Result<(), PanelError> {
    sqlx::query("UPDATE inbounds SET settings = ? WHERE id = ?")
        .bind(settings.to_blob()?)
        .bind(inbound_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn fetch_traffic(
    tx: &mut Transaction<'_, Sqlite>,
    email: &str,
) -> Result<Option<ClientTraffic>, PanelError> {
    Ok(sqlx::query_as(&format!(
        "SELECT {TRAFFIC_COLUMNS} FROM client_traffics WHERE email = ? COLLATE NOCASE"
    ))
    .bind(email)
    .fetch_optional(&mut **tx)
    .await?)
}
