//! Inbound CRUD and per-inbound counters.

use std::collections::{HashMap, HashSet};

use sqlx::{Sqlite, Transaction};

use super::models::InboundRow;
use super::sqlite::SqliteRepository;
use crate::domain::{Client, ClientTraffic, Inbound, InboundSettings};
use crate::error::PanelError;

pub(crate) const INBOUND_COLUMNS: &str = "id, user_id, up, down, total, remark, enable, expiry_time, \
     listen, port, protocol, settings, stream_settings, tag, sniffing";

pub(crate) const TRAFFIC_COLUMNS: &str =
    "id, inbound_id, enable, email, up, down, expiry_time, total, reset, last_online";

impl SqliteRepository {
    /// All inbounds in id order, each with its client traffic rows.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn list_inbounds(&self) -> Result<Vec<Inbound>, PanelError> {
        let pool = self.pool();
        let rows: Vec<InboundRow> =
            sqlx::query_as(&format!("SELECT {INBOUND_COLUMNS} FROM inbounds ORDER BY id"))
                .fetch_all(&pool)
                .await?;
        let traffics: Vec<ClientTraffic> = sqlx::query_as(&format!(
            "SELECT {TRAFFIC_COLUMNS} FROM client_traffics ORDER BY id"
        ))
        .fetch_all(&pool)
        .await?;

        let mut by_inbound: HashMap<i64, Vec<ClientTraffic>> = HashMap::new();
        for traffic in traffics {
            by_inbound.entry(traffic.inbound_id).or_default().push(traffic);
        }
        rows.into_iter()
            .map(|row| {
                let stats = by_inbound.remove(&row.id).unwrap_or_default();
                row.into_inbound(stats)
            })
            .collect()
    }

    /// One inbound with its traffic rows.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] if no inbound has `id`.
    pub async fn get_inbound(&self, id: i64) -> Result<Inbound, PanelError> {
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        let inbound = fetch_inbound(&mut tx, id).await?;
        tx.commit().await?;
        Ok(inbound)
    }

    /// Inserts an inbound and a traffic row for each of its clients.
    ///
    /// # Errors
    ///
    /// [`PanelError::InvalidInbound`] for unknown protocols or port `0`,
    /// [`PanelError::InvalidSettings`] for malformed blobs, and
    /// [`PanelError::Conflict`] when the port, a client email or a chosen
    /// tag is taken.
    pub async fn add_inbound(&self, inbound: &Inbound) -> Result<Inbound, PanelError> {
        let settings = validate_inbound(inbound)?;

        let pool = self.pool();
        let mut tx = pool.begin().await?;
        if inbound.enable {
            ensure_port_free(&mut tx, inbound.port, None).await?;
        }
        for client in &settings.clients {
            ensure_email_free(&mut tx, &client.email, None).await?;
        }
        let tag = resolve_tag(&mut tx, inbound, None).await?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO inbounds (user_id, up, down, total, remark, enable, expiry_time, listen, \
             port, protocol, settings, stream_settings, tag, sniffing) \
             VALUES (?, 0, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(inbound.user_id)
        .bind(inbound.total)
        .bind(&inbound.remark)
        .bind(inbound.enable)
        .bind(inbound.expiry_time)
        .bind(&inbound.listen)
        .bind(i64::from(inbound.port))
        .bind(&inbound.protocol)
        .bind(&inbound.settings)
        .bind(&inbound.stream_settings)
        .bind(&tag)
        .bind(&inbound.sniffing)
        .fetch_one(&mut *tx)
        .await?;

        for client in &settings.clients {
            insert_client_traffic(&mut tx, id, client).await?;
        }
        let created = fetch_inbound(&mut tx, id).await?;
        tx.commit().await?;
        tracing::info!(inbound_id = id, port = inbound.port, %tag, "inbound added");
        Ok(created)
    }

    /// Rewrites an inbound and synchronises its traffic rows with the
    /// clients in the new settings. Traffic counters are kept. A generated
    /// tag follows the inbound to its new listen/port.
    ///
    /// # Errors
    ///
    /// As [`add_inbound`](Self::add_inbound), plus [`PanelError::NotFound`].
    pub async fn update_inbound(&self, inbound: &Inbound) -> Result<Inbound, PanelError> {
        let settings = validate_inbound(inbound)?;

        let pool = self.pool();
        let mut tx = pool.begin().await?;
        let old = fetch_inbound(&mut tx, inbound.id).await?;
        if inbound.enable {
            ensure_port_free(&mut tx, inbound.port, Some(inbound.id)).await?;
        }
        for client in &settings.clients {
            ensure_email_free(&mut tx, &client.email, Some(inbound.id)).await?;
        }
        let tag = resolve_tag(&mut tx, inbound, Some(&old)).await?;

        sqlx::query(
            "UPDATE inbounds SET total = ?, remark = ?, enable = ?, expiry_time = ?, listen = ?, \
             port = ?, protocol = ?, settings = ?, stream_settings = ?, tag = ?, sniffing = ? \
             WHERE id = ?",
        )
        .bind(inbound.total)
        .bind(&inbound.remark)
        .bind(inbound.enable)
        .bind(inbound.expiry_time)
        .bind(&inbound.listen)
        .bind(i64::from(inbound.port))
        .bind(&inbound.protocol)
        .bind(&inbound.settings)
        .bind(&inbound.stream_settings)
        .bind(&tag)
        .bind(&inbound.sniffing)
        .bind(inbound.id)
        .execute(&mut *tx)
        .await?;

        let new_emails: HashSet<String> = settings
            .clients
            .iter()
            .map(|c| c.email.to_ascii_lowercase())
            .collect();
        for stale in old
            .client_stats
            .iter()
            .filter(|t| !new_emails.contains(&t.email.to_ascii_lowercase()))
        {
            delete_client_rows(&mut tx, &stale.email).await?;
        }
        for client in &settings.clients {
            if old.traffic_for(&client.email).is_some() {
                sync_client_traffic(&mut tx, client).await?;
            } else {
                insert_client_traffic(&mut tx, inbound.id, client).await?;
            }
        }

        let updated = fetch_inbound(&mut tx, inbound.id).await?;
        tx.commit().await?;
        tracing::info!(inbound_id = inbound.id, "inbound updated");
        Ok(updated)
    }

    /// Deletes an inbound, its traffic rows and IP records.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] if no inbound has `id`.
    pub async fn delete_inbound(&self, id: i64) -> Result<Inbound, PanelError> {
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        let inbound = fetch_inbound(&mut tx, id).await?;
        for traffic in &inbound.client_stats {
            delete_client_rows(&mut tx, &traffic.email).await?;
        }
        sqlx::query("DELETE FROM inbounds WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(inbound_id = id, "inbound deleted");
        Ok(inbound)
    }

    /// Adds a traffic delta to the inbound tagged `tag`. Unknown tags are
    /// ignored. Returns whether a row was updated.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn add_inbound_traffic(&self, tag: &str, up: i64, down: i64) -> Result<bool, PanelError> {
        let result = sqlx::query("UPDATE inbounds SET up = up + ?, down = down + ? WHERE tag = ?")
            .bind(up.max(0))
            .bind(down.max(0))
            .bind(tag)
            .execute(&self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Sets the inbound's administrative switch.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] if no inbound has `id`.
    pub async fn set_inbound_enable(&self, id: i64, enable: bool) -> Result<(), PanelError> {
        let result = sqlx::query("UPDATE inbounds SET enable = ? WHERE id = ?")
            .bind(enable)
            .bind(id)
            .execute(&self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(PanelError::NotFound(format!("inbound {id}")));
        }
        Ok(())
    }
}

/// Checks everything about an inbound that does not need the database.
fn validate_inbound(inbound: &Inbound) -> Result<InboundSettings, PanelError> {
    let protocol = inbound.protocol()?;
    if inbound.port == 0 {
        return Err(PanelError::InvalidInbound("port must be 1-65535".to_string()));
    }
    let settings = inbound.parsed_settings()?;
    if protocol.has_clients() {
        if let Some(client) = settings.clients.iter().find(|c| c.email.trim().is_empty()) {
            return Err(PanelError::InvalidSettings(format!(
                "client {} has no email",
                client.credential()
            )));
        }
    }
    for (name, blob) in [
        ("streamSettings", &inbound.stream_settings),
        ("sniffing", &inbound.sniffing),
    ] {
        if !blob.trim().is_empty() {
            serde_json::from_str::<serde_json::Value>(blob)
                .map_err(|e| PanelError::InvalidSettings(format!("{name}: {e}")))?;
        }
    }
    Ok(settings)
}

pub(crate) async fn fetch_inbound(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
) -> Result<Inbound, PanelError> {
    let row: Option<InboundRow> = sqlx::query_as(&format!(
        "SELECT {INBOUND_COLUMNS} FROM inbounds WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;
    let row = row.ok_or_else(|| PanelError::NotFound(format!("inbound {id}")))?;
    let stats: Vec<ClientTraffic> = sqlx::query_as(&format!(
        "SELECT {TRAFFIC_COLUMNS} FROM client_traffics WHERE inbound_id = ? ORDER BY id"
    ))
    .bind(id)
    .fetch_all(&mut **tx)
    .await?;
    row.into_inbound(stats)
}

/// Rejects `port` if another enabled inbound listens on it.
pub(crate) async fn ensure_port_free(
    tx: &mut Transaction<'_, Sqlite>,
    port: u16,
    except: Option<i64>,
) -> Result<(), PanelError> {
    let holder: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM inbounds WHERE port = ? AND enable = 1 AND id != ? LIMIT 1",
    )
    .bind(i64::from(port))
    .bind(except.unwrap_or(-1))
    .fetch_optional(&mut **tx)
    .await?;
    match holder {
        Some(id) => Err(PanelError::Conflict(format!(
            "port {port} is already used by inbound {id}"
        ))),
        None => Ok(()),
    }
}

async fn tag_holder(
    tx: &mut Transaction<'_, Sqlite>,
    tag: &str,
    except: Option<i64>,
) -> Result<Option<i64>, PanelError> {
    Ok(
        sqlx::query_scalar("SELECT id FROM inbounds WHERE tag = ? AND id != ? LIMIT 1")
            .bind(tag)
            .bind(except.unwrap_or(-1))
            .fetch_optional(&mut **tx)
            .await?,
    )
}

/// Tag to store for `inbound`, `previous` being its current row on update.
///
/// Generated tags are regenerated when the inbound moves and get a `-<n>`
/// suffix while the plain form belongs to another inbound (a disabled
/// inbound may share a port). Chosen tags must be free.
async fn resolve_tag(
    tx: &mut Transaction<'_, Sqlite>,
    inbound: &Inbound,
    previous: Option<&Inbound>,
) -> Result<String, PanelError> {
    let moved = previous.is_some_and(|old| {
        (old.port, old.listen.as_str()) != (inbound.port, inbound.listen.as_str())
    });
    let stale = previous
        .is_some_and(|old| moved && inbound.tag == old.tag && old.has_derived_tag());
    let except = previous.map(|old| old.id);

    if !inbound.tag.is_empty() && !stale {
        return match tag_holder(tx, &inbound.tag, except).await? {
            Some(id) => Err(PanelError::Conflict(format!(
                "tag {} is already used by inbound {id}",
                inbound.tag
            ))),
            None => Ok(inbound.tag.clone()),
        };
    }

    let base = inbound.derived_tag();
    let mut candidate = base.clone();
    let mut n: u32 = 1;
    while tag_holder(tx, &candidate, except).await?.is_some() {
        n = n.saturating_add(1);
        candidate = format!("{base}-{n}");
    }
    Ok(candidate)
}

/// Rejects `email` if a client of another inbound already uses it.
pub(crate) async fn ensure_email_free(
    tx: &mut Transaction<'_, Sqlite>,
    email: &str,
    except_inbound: Option<i64>,
) -> Result<(), PanelError> {
    let holder: Option<i64> = sqlx::query_scalar(
        "SELECT inbound_id FROM client_traffics WHERE email = ? COLLATE NOCASE \
         AND inbound_id != ? LIMIT 1",
    )
    .bind(email)
    .bind(except_inbound.unwrap_or(-1))
    .fetch_optional(&mut **tx)
    .await?;
    match holder {
        Some(id) => Err(PanelError::Conflict(format!(
            "email {email} already exists in inbound {id}"
        ))),
        None => Ok(()),
    }
}

pub(crate) async fn insert_client_traffic(
    tx: &mut Transaction<'_, Sqlite>,
    inbound_id: i64,
    client: &Client,
) -> Result<(), PanelError> {
    sqlx::query(
        "INSERT INTO client_traffics (inbound_id, enable, email, up, down, expiry_time, total, reset) \
         VALUES (?, ?, ?, 0, 0, ?, ?, ?)",
    )
    .bind(inbound_id)
    .bind(client.enable)
    .bind(&client.email)
    .bind(client.expiry_time)
    .bind(client.total_gb)
    .bind(client.reset)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Copies the limits of `client` onto its traffic row, leaving counters.
pub(crate) async fn sync_client_traffic(
    tx: &mut Transaction<'_, Sqlite>,
    client: &Client,
) -> Result<(), PanelError> {
    sqlx::query(
        "UPDATE client_traffics SET enable = ?, expiry_time = ?, total = ?, reset = ? \
         WHERE email = ? COLLATE NOCASE",
    )
    .bind(client.enable)
    .bind(client.expiry_time)
    .bind(client.total_gb)
    .bind(client.reset)
    .bind(&client.email)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub(crate) async fn delete_client_rows(
    tx: &mut Transaction<'_, Sqlite>,
    email: &str,
) -> Result<(), PanelError> {
    sqlx::query("DELETE FROM client_traffics WHERE email = ? COLLATE NOCASE")
        .bind(email)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM inbound_client_ips WHERE client_email = ? COLLATE NOCASE")
        .bind(email)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn vless_inbound(port: u16, emails: &[&str]) -> Inbound {
        let clients: Vec<_> = emails
            .iter()
            .enumerate()
            .map(|(i, e)| json!({"id": format!("uuid-{port}-{i}"), "email": e}))
            .collect();
        Inbound {
            id: 0,
            user_id: 1,
            up: 0,
            down: 0,
            total: 0,
            remark: format!("port {port}"),
            enable: true,
            expiry_time: 0,
            listen: String::new(),
            port,
            protocol: "vless".to_string(),
            settings: json!({"clients": clients, "decryption": "none"}).to_string(),
            stream_settings: json!({"network": "tcp", "security": "none"}).to_string(),
            tag: String::new(),
            sniffing: String::new(),
            client_stats: Vec::new(),
        }
    }

    pub(crate) async fn repo() -> SqliteRepository {
        let Ok(repo) = SqliteRepository::in_memory().await else {
            panic!("in-memory repository");
        };
        repo
    }

    #[tokio::test]
    async fn add_creates_traffic_rows_and_tag() {
        let repo = repo().await;
        let Ok(created) = repo.add_inbound(&vless_inbound(443, &["a@x", "b@x"])).await else {
            panic!("add");
        };
        assert!(created.id > 0);
        assert_eq!(created.tag, "inbound-443");
        assert_eq!(created.client_stats.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_enabled_port_conflicts() {
        let repo = repo().await;
        assert!(repo.add_inbound(&vless_inbound(443, &["a@x"])).await.is_ok());
        let mut clash = vless_inbound(443, &["b@x"]);
        assert!(matches!(
            repo.add_inbound(&clash).await,
            Err(PanelError::Conflict(_))
        ));
        clash.enable = false;
        let Ok(parked) = repo.add_inbound(&clash).await else {
            panic!("disabled inbound may share the port");
        };
        assert_eq!(parked.tag, "inbound-443-2");
        assert!(parked.has_derived_tag());
    }

    #[tokio::test]
    async fn chosen_tag_taken_by_another_inbound_conflicts() {
        let repo = repo().await;
        assert!(repo.add_inbound(&vless_inbound(443, &["a@x"])).await.is_ok());
        let mut named = vless_inbound(8443, &["b@x"]);
        named.tag = "inbound-443".to_string();
        let Err(PanelError::Conflict(message)) = repo.add_inbound(&named).await else {
            panic!("tag clash must be a conflict");
        };
        assert!(message.contains("tag inbound-443"));
    }

    #[tokio::test]
    async fn moving_an_inbound_regenerates_its_generated_tag() {
        let repo = repo().await;
        let Ok(mut created) = repo.add_inbound(&vless_inbound(443, &["a@x"])).await else {
            panic!("add");
        };
        // Clients echo the stored tag back unchanged.
        created.port = 8443;
        let Ok(moved) = repo.update_inbound(&created).await else {
            panic!("update");
        };
        assert_eq!(moved.tag, "inbound-8443");

        let mut named = moved;
        named.tag = "edge".to_string();
        let Ok(named) = repo.update_inbound(&named).await else {
            panic!("rename");
        };
        let mut relocated = named;
        relocated.port = 2053;
        let Ok(relocated) = repo.update_inbound(&relocated).await else {
            panic!("relocate");
        };
        assert_eq!(relocated.tag, "edge");
    }

    #[tokio::test]
    async fn duplicate_email_across_inbounds_conflicts_case_insensitively() {
        let repo = repo().await;
        assert!(repo.add_inbound(&vless_inbound(443, &["a@x"])).await.is_ok());
        let result = repo.add_inbound(&vless_inbound(444, &["A@X"])).await;
        assert!(matches!(result, Err(PanelError::Conflict(_))));
        let Ok(all) = repo.list_inbounds().await else {
            panic!("list");
        };
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn invalid_blobs_are_rejected() {
        let repo = repo().await;
        let mut bad = vless_inbound(443, &["a@x"]);
        bad.settings = "{".to_string();
        assert!(matches!(
            repo.add_inbound(&bad).await,
            Err(PanelError::InvalidSettings(_))
        ));
        let mut unknown = vless_inbound(443, &["a@x"]);
        unknown.protocol = "quic-magic".to_string();
        assert!(matches!(
            repo.add_inbound(&unknown).await,
            Err(PanelError::InvalidInbound(_))
        ));
    }

    #[tokio::test]
    async fn update_syncs_traffic_rows_and_keeps_counters() {
        let repo = repo().await;
        let Ok(mut inbound) = repo.add_inbound(&vless_inbound(443, &["a@x", "b@x"])).await else {
            panic!("add");
        };
        assert!(repo.upsert_traffic_delta("inbound-443", "a@x", 10, 20).await.is_ok());

        inbound.settings = vless_inbound(443, &["a@x", "c@x"]).settings;
        let Ok(updated) = repo.update_inbound(&inbound).await else {
            panic!("update");
        };
        let emails: Vec<&str> = updated.client_stats.iter().map(|t| t.email.as_str()).collect();
        assert_eq!(emails, vec!["a@x", "c@x"]);
        assert_eq!(updated.traffic_for("a@x").map(ClientTraffic::used), Some(30));
    }

    #[tokio::test]
    async fn delete_removes_traffic_rows() {
        let repo = repo().await;
        let Ok(inbound) = repo.add_inbound(&vless_inbound(443, &["a@x"])).await else {
            panic!("add");
        };
        assert!(repo.delete_inbound(inbound.id).await.is_ok());
        assert!(matches!(
            repo.get_inbound(inbound.id).await,
            Err(PanelError::NotFound(_))
        ));
        assert!(matches!(
            repo.get_client_by_email("a@x").await,
            Err(PanelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn inbound_traffic_accumulates_by_tag() {
        let repo = repo().await;
        let Ok(inbound) = repo.add_inbound(&vless_inbound(443, &[])).await else {
            panic!("add");
        };
        assert_eq!(repo.add_inbound_traffic("inbound-443", 5, 7).await.ok(), Some(true));
        assert_eq!(repo.add_inbound_traffic("inbound-443", 1, 1).await.ok(), Some(true));
        assert_eq!(repo.add_inbound_traffic("nope", 1, 1).await.ok(), Some(false));
        let Ok(reloaded) = repo.get_inbound(inbound.id).await else {
            panic!("get");
        };
        assert_eq!((reloaded.up, reloaded.down), (6, 8));
    }
}
