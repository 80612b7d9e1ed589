//! Inbound and client operations behind the HTTP surface.
//!
//! Every write goes to the repository first and then raises the restart
//! signal; the reconciler decides whether Xray actually restarts.

use std::sync::Arc;

use crate::domain::{Client, Host, Inbound, RestartSignal, ShareLink, build_links};
use crate::error::PanelError;
use crate::persistence::models::{ClientIps, LinkRecord, ShortLink};
use crate::persistence::{ClientRecord, SqliteRepository};

/// Coordinates repository writes with restart requests and the host.
#[derive(Debug, Clone)]
pub struct InboundService {
    repo: SqliteRepository,
    signal: RestartSignal,
    host: Arc<dyn Host>,
    fallback_address: String,
}

impl InboundService {
    /// Creates the service. `fallback_address` goes into share links when
    /// the host knows no public domain.
    #[must_use]
    pub fn new(
        repo: SqliteRepository,
        signal: RestartSignal,
        host: Arc<dyn Host>,
        fallback_address: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            signal,
            host,
            fallback_address: fallback_address.into(),
        }
    }

    /// The underlying repository.
    #[must_use]
    pub fn repo(&self) -> &SqliteRepository {
        &self.repo
    }

    /// All inbounds with their traffic rows.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn list_inbounds(&self) -> Result<Vec<Inbound>, PanelError> {
        self.repo.list_inbounds().await
    }

    /// One inbound.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown ids.
    pub async fn get_inbound(&self, id: i64) -> Result<Inbound, PanelError> {
        self.repo.get_inbound(id).await
    }

    /// Stores a new inbound and opens its port on the host.
    ///
    /// # Errors
    ///
    /// Validation and conflict errors from the repository.
    pub async fn add_inbound(&self, inbound: &Inbound) -> Result<Inbound, PanelError> {
        let created = self.repo.add_inbound(inbound).await?;
        self.open_port(created.port).await;
        if created.enable {
            self.signal.request(false);
        }
        Ok(created)
    }

    /// Replaces inbound `id`.
    ///
    /// # Errors
    ///
    /// Validation and conflict errors from the repository.
    pub async fn update_inbound(&self, id: i64, inbound: &Inbound) -> Result<Inbound, PanelError> {
        let mut inbound = inbound.clone();
        inbound.id = id;
        let before = self.repo.get_inbound(id).await?;
        let updated = self.repo.update_inbound(&inbound).await?;
        if updated.port != before.port {
            self.open_port(updated.port).await;
        }
        self.signal.request(false);
        Ok(updated)
    }

    /// Deletes inbound `id` and its client rows.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown ids.
    pub async fn delete_inbound(&self, id: i64) -> Result<Inbound, PanelError> {
        let removed = self.repo.delete_inbound(id).await?;
        self.signal.request(false);
        Ok(removed)
    }

    async fn open_port(&self, port: u16) {
        if let Err(e) = self.host.allow_port(port).await {
            tracing::warn!(port, error = %e, "could not open port on host firewall");
        }
    }

    /// Adds a client to inbound `inbound_id`.
    ///
    /// # Errors
    ///
    /// Validation and conflict errors from the repository.
    pub async fn add_client(&self, inbound_id: i64, client: &Client) -> Result<ClientRecord, PanelError> {
        let record = self.repo.add_client(inbound_id, client).await?;
        self.signal.request(false);
        Ok(record)
    }

    /// Client stored under `email`.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown emails.
    pub async fn get_client(&self, email: &str) -> Result<ClientRecord, PanelError> {
        self.repo.get_client_by_email(email).await
    }

    /// Replaces the client stored under `email`.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] or [`PanelError::Conflict`].
    pub async fn update_client(&self, email: &str, client: &Client) -> Result<ClientRecord, PanelError> {
        let record = self.repo.update_client(email, client).await?;
        self.signal.request(false);
        Ok(record)
    }

    /// Removes the client stored under `email`.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown emails.
    pub async fn delete_client(&self, email: &str) -> Result<Client, PanelError> {
        let removed = self.repo.delete_client(email).await?;
        self.signal.request(false);
        Ok(removed)
    }

    /// Clients linked to a Telegram chat.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn clients_by_tg_id(&self, tg_id: i64) -> Result<Vec<ClientRecord>, PanelError> {
        self.repo.clients_by_tg_id(tg_id).await
    }

    /// Flips a client's enable flag and returns the new value.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown emails.
    pub async fn toggle_client(&self, email: &str) -> Result<bool, PanelError> {
        let enabled = self.repo.toggle_client_enable(email).await?;
        self.signal.request(false);
        Ok(enabled)
    }

    /// Zeroes a client's counters, re-enabling it if it was cut off.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown emails.
    pub async fn reset_client_traffic(&self, email: &str) -> Result<(), PanelError> {
        if self.repo.reset_client_traffic(email).await? {
            self.signal.request(false);
        }
        Ok(())
    }

    /// Zeroes every client counter of an inbound, re-enabling clients that
    /// were cut off. Returns the number of rows reset.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown inbounds.
    pub async fn reset_all_client_traffic(&self, inbound_id: i64) -> Result<u64, PanelError> {
        let (reset, reenabled) = self.repo.reset_all_client_traffic(inbound_id).await?;
        if reenabled {
            self.signal.request(false);
        }
        Ok(reset)
    }

    /// Removes exhausted or expired disabled clients of an inbound.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown inbounds.
    pub async fn delete_depleted_clients(&self, inbound_id: i64) -> Result<Vec<String>, PanelError> {
        let removed = self.repo.delete_depleted_clients(inbound_id).await?;
        if !removed.is_empty() {
            self.signal.request(false);
        }
        Ok(removed)
    }

    /// Source IPs last recorded for a client.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn client_ips(&self, email: &str) -> Result<ClientIps, PanelError> {
        self.repo.get_client_ips(email).await
    }

    /// Renders the client's share links and records them in the history.
    ///
    /// # Errors
    ///
    /// [`PanelError::NotFound`] for unknown emails and
    /// [`PanelError::InvalidInbound`] for protocols without links.
    pub async fn client_links(&self, email: &str) -> Result<Vec<ShareLink>, PanelError> {
        let record = self.repo.get_client_by_email(email).await?;
        let inbound = self.repo.get_inbound(record.inbound_id).await?;
        let address = self
            .host
            .panel_domain()
            .await
            .unwrap_or_else(|| self.fallback_address.clone());
        let links = build_links(&inbound, &record.client, &address)?;
        for link in &links {
            self.repo.record_link(&link.link_type, &link.link).await?;
        }
        Ok(links)
    }

    /// Newest generated links.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn recent_links(&self, limit: i64) -> Result<Vec<LinkRecord>, PanelError> {
        self.repo.get_recent_links(limit).await
    }

    /// Short code for `link`.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::Conflict`] if no free code was found.
    pub async fn shorten(&self, link: &str) -> Result<ShortLink, PanelError> {
        if link.trim().is_empty() {
            return Err(PanelError::InvalidRequest("link is empty".to_string()));
        }
        self.repo.create_short_link(link).await
    }

    /// Link behind a short code.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown codes.
    pub async fn resolve(&self, code: &str) -> Result<String, PanelError> {
        self.repo.resolve_short_link(code).await
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::StaticHost;
    use crate::persistence::fixtures::vless_inbound;

    async fn service() -> (InboundService, RestartSignal) {
        let Ok(repo) = SqliteRepository::in_memory().await else {
            panic!("repo");
        };
        let signal = RestartSignal::new();
        let host: Arc<dyn Host> = Arc::new(StaticHost::new(Some("vpn.example.com".to_string())));
        (
            InboundService::new(repo, signal.clone(), host, "127.0.0.1"),
            signal,
        )
    }

    #[tokio::test]
    async fn writes_raise_the_restart_signal() {
        let (service, signal) = service().await;
        let Ok(created) = service.add_inbound(&vless_inbound(443, &["a@x"])).await else {
            panic!("add");
        };
        assert!(signal.take().is_some());

        assert!(service.add_client(created.id, &Client::new("uuid-b", "b@x")).await.is_ok());
        assert!(signal.take().is_some());

        assert_eq!(service.toggle_client("b@x").await.ok(), Some(false));
        assert!(signal.take().is_some());

        // Counters were never cut off, so a reset needs no restart.
        assert!(service.reset_client_traffic("a@x").await.is_ok());
        assert!(signal.take().is_none());

        // b@x is still toggled off; resetting the inbound brings it back.
        assert_eq!(service.reset_all_client_traffic(created.id).await.ok(), Some(2));
        assert!(signal.take().is_some());
        assert_eq!(service.reset_all_client_traffic(created.id).await.ok(), Some(2));
        assert!(signal.take().is_none());

        assert!(service.delete_inbound(created.id).await.is_ok());
        assert!(signal.take().is_some());
    }

    #[tokio::test]
    async fn failed_write_leaves_signal_alone() {
        let (service, signal) = service().await;
        assert!(service.add_inbound(&vless_inbound(443, &["a@x"])).await.is_ok());
        let _ = signal.take();
        assert!(matches!(
            service.add_inbound(&vless_inbound(443, &["b@x"])).await,
            Err(PanelError::Conflict(_))
        ));
        assert_eq!(signal.take(), None);
    }

    #[tokio::test]
    async fn links_use_host_domain_and_are_recorded() {
        let (service, _) = service().await;
        assert!(service.add_inbound(&vless_inbound(443, &["a@x"])).await.is_ok());
        let Ok(links) = service.client_links("a@x").await else {
            panic!("links");
        };
        assert_eq!(links.len(), 1);
        assert!(links.iter().all(|l| l.link.contains("@vpn.example.com:443")));
        let Ok(recent) = service.recent_links(10).await else {
            panic!("recent");
        };
        assert_eq!(recent.len(), 1);

        let Some(first) = links.first() else {
            panic!("link");
        };
        let Ok(short) = service.shorten(&first.link).await else {
            panic!("shorten");
        };
        assert_eq!(service.resolve(&short.code).await.ok(), Some(first.link.clone()));
    }
}
