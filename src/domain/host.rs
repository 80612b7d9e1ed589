//! Narrow view of the host machine.
//!
//! Firewall and domain lookups are shell-outs in a full install. The panel
//! core only needs two answers from the host, so they sit behind a trait that
//! tests and container deployments replace.

use async_trait::async_trait;

use crate::error::PanelError;

/// Host capabilities the panel core may use.
#[async_trait]
pub trait Host: Send + Sync + std::fmt::Debug {
    /// Public domain (or address) clients should connect to, if known.
    async fn panel_domain(&self) -> Option<String>;

    /// Opens `port` in the host firewall.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError`] if the firewall refused the change.
    async fn allow_port(&self, port: u16) -> Result<(), PanelError>;
}

/// Host with a fixed domain and no firewall.
#[derive(Debug, Clone, Default)]
pub struct StaticHost {
    domain: Option<String>,
}

impl StaticHost {
    /// Creates a host answering `domain` for [`Host::panel_domain`].
    #[must_use]
    pub fn new(domain: Option<String>) -> Self {
        Self { domain }
    }

    /// Reads `PANEL_DOMAIN` from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(std::env::var("PANEL_DOMAIN").ok().filter(|d| !d.is_empty()))
    }
}

#[async_trait]
impl Host for StaticHost {
    async fn panel_domain(&self) -> Option<String> {
        self.domain.clone()
    }

    async fn allow_port(&self, port: u16) -> Result<(), PanelError> {
        tracing::debug!(port, "firewall management disabled; port not opened");
        Ok(())
    }
}
