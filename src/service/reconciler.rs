//! Reconciliation controller.
//!
//! Writers only raise the [`RestartSignal`]. The reconciler drains it on its
//! own schedule, assembles the target config and restarts Xray only when the
//! result differs from what is running (or the request was forced). Every
//! stop/start pair runs under one mutex, so transitions never interleave.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::domain::{EventBus, PanelEvent, RestartSignal};
use crate::error::PanelError;
use crate::persistence::SqliteRepository;
use crate::xray::{BanList, XrayConfig, XrayControl, assemble, template};

/// Serializes Xray restarts and surfaces crashes.
#[derive(Debug)]
pub struct Reconciler {
    repo: SqliteRepository,
    xray: Arc<dyn XrayControl>,
    signal: RestartSignal,
    event_bus: EventBus,
    bans: Arc<BanList>,
    access_log: Option<String>,
    lock: Mutex<()>,
}

impl Reconciler {
    /// Creates a reconciler driving `xray` from the repository contents.
    #[must_use]
    pub fn new(
        repo: SqliteRepository,
        xray: Arc<dyn XrayControl>,
        signal: RestartSignal,
        event_bus: EventBus,
        bans: Arc<BanList>,
    ) -> Self {
        Self {
            repo,
            xray,
            signal,
            event_bus,
            bans,
            access_log: None,
            lock: Mutex::new(()),
        }
    }

    /// Makes Xray write its access log to `path` when the template leaves
    /// access logging off. The IP-limit watcher tails that file.
    #[must_use]
    pub fn with_access_log(mut self, path: impl Into<String>) -> Self {
        self.access_log = Some(path.into());
        self
    }

    /// The process handle this reconciler drives.
    #[must_use]
    pub fn xray(&self) -> &Arc<dyn XrayControl> {
        &self.xray
    }

    /// Marks a restart as needed; picked up by the next [`Self::tick`].
    pub fn request_restart(&self, force: bool) {
        self.signal.request(force);
    }

    /// Builds the config the repository currently describes.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] if the repository cannot be
    /// read.
    pub async fn assemble_config(&self) -> Result<XrayConfig, PanelError> {
        let stored = self.repo.xray_template().await?;
        let template = template::load(stored.as_deref())?;
        let inbounds = self.repo.list_inbounds().await?;
        let mut config = assemble(&template, &inbounds, &self.bans.active(Utc::now()));
        if let Some(path) = &self.access_log {
            config.ensure_access_log(path);
        }
        Ok(config)
    }

    /// Assembles and, if the result differs from the running config or
    /// `force` is set, restarts Xray. Returns whether a start happened.
    ///
    /// # Errors
    ///
    /// Returns the assembly, stop or start failure. A failed start is not
    /// retried here.
    pub async fn reconcile(&self, force: bool) -> Result<bool, PanelError> {
        let _guard = self.lock.lock().await;
        let config = self.assemble_config().await?;
        if !force && self.xray.running_config().as_ref() == Some(&config) {
            tracing::debug!("running xray config is current");
            return Ok(false);
        }

        match self.xray.stop().await {
            Ok(()) | Err(PanelError::NotRunning) => {}
            Err(e) => return Err(self.restart_failed(e)),
        }
        if let Err(e) = self.xray.start(config).await {
            return Err(self.restart_failed(e));
        }

        let status = self.xray.status();
        tracing::info!(force, api_port = ?status.api_port, "xray restarted");
        let _ = self.event_bus.publish(PanelEvent::XrayStarted {
            version: status.version.unwrap_or_default(),
            api_port: status.api_port.unwrap_or_default(),
            timestamp: Utc::now(),
        });
        Ok(true)
    }

    fn restart_failed(&self, error: PanelError) -> PanelError {
        tracing::error!(error = %error, "xray restart failed");
        let _ = self.event_bus.publish(PanelEvent::RestartFailed {
            error: error.to_string(),
            timestamp: Utc::now(),
        });
        error
    }

    /// Drains a pending restart request and reconciles if there was one.
    ///
    /// # Errors
    ///
    /// Same as [`Self::reconcile`].
    pub async fn tick(&self) -> Result<bool, PanelError> {
        match self.signal.take() {
            Some(request) => self.reconcile(request.force).await,
            None => Ok(false),
        }
    }

    /// Reports an unexpected exit once and asks for a forced restart while
    /// Xray is down without having been stopped on purpose. Returns whether
    /// a restart was requested.
    pub fn probe_crash(&self) -> bool {
        if self.xray.acknowledge_crash() {
            let status = self.xray.status();
            let error = status.error_msg.unwrap_or_else(|| self.xray.result());
            tracing::warn!(%error, "xray exited unexpectedly");
            let _ = self.event_bus.publish(PanelEvent::XrayCrashed {
                error,
                timestamp: Utc::now(),
            });
        }
        if self.xray.is_crashed() {
            self.signal.request(true);
            return true;
        }
        false
    }

    /// Stops Xray on request. It stays down until the next restart.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotRunning`] if Xray was not running.
    pub async fn stop(&self) -> Result<(), PanelError> {
        let _guard = self.lock.lock().await;
        self.xray.stop().await?;
        tracing::info!("xray stopped");
        let _ = self.event_bus.publish(PanelEvent::XrayStopped {
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Stops Xray for process shutdown, ignoring an already stopped child.
    pub async fn shutdown(&self) {
        match self.stop().await {
            Ok(()) | Err(PanelError::NotRunning) => {}
            Err(e) => tracing::warn!(error = %e, "xray did not stop cleanly"),
        }
    }

    /// Runs `work` with no restart in flight; the lock is held throughout.
    pub(crate) async fn exclusive<T, F>(&self, work: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let _guard = self.lock.lock().await;
        work.await
    }
}
