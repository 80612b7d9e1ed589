//! Database export and import.

use std::sync::Arc;

use super::Reconciler;
use crate::error::PanelError;
use crate::persistence::SqliteRepository;
use crate::persistence::db_file::SQLITE_SIGNATURE;

/// Swaps the database file with Xray stopped.
#[derive(Debug, Clone)]
pub struct DatabaseService {
    repo: SqliteRepository,
    reconciler: Arc<Reconciler>,
}

impl DatabaseService {
    /// Creates the service.
    #[must_use]
    pub fn new(repo: SqliteRepository, reconciler: Arc<Reconciler>) -> Self {
        Self { repo, reconciler }
    }

    /// Current database file contents.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::InvalidRequest`] for in-memory databases and
    /// [`PanelError::Io`] on read failure.
    pub async fn export(&self) -> Result<Vec<u8>, PanelError> {
        self.repo.export_db().await
    }

    /// Replaces the database with `bytes`: stops Xray, swaps the file
    /// (restoring the backup on failure) and restarts Xray from whichever
    /// database ends up live.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::InvalidDb`] for files that are not SQLite
    /// databases, or the failure that made the import roll back.
    pub async fn import(&self, bytes: &[u8]) -> Result<(), PanelError> {
        if !bytes.starts_with(SQLITE_SIGNATURE) {
            return Err(PanelError::InvalidDb("missing SQLite header".to_string()));
        }
        let swapped = self
            .reconciler
            .exclusive(async {
                match self.reconciler.xray().stop().await {
                    Ok(()) | Err(PanelError::NotRunning) => {}
                    Err(e) => return Err(e),
                }
                self.repo.replace_database(bytes).await
            })
            .await;

        if let Err(e) = self.reconciler.reconcile(true).await {
            tracing::warn!(error = %e, "xray did not come back after database import");
        }
        swapped?;
        tracing::info!(bytes = bytes.len(), "database imported");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::domain::{EventBus, RestartSignal};
    use crate::persistence::fixtures::vless_inbound;
    use crate::service::testing::FakeXray;
    use crate::xray::{BanList, XrayControl};

    async fn open(path: &Path) -> SqliteRepository {
        let Ok(repo) = SqliteRepository::open(path).await else {
            panic!("open {}", path.display());
        };
        repo
    }

    fn service(repo: &SqliteRepository, fake: &Arc<FakeXray>, dir: &Path) -> DatabaseService {
        let reconciler = Reconciler::new(
            repo.clone(),
            Arc::clone(fake) as Arc<dyn XrayControl>,
            RestartSignal::new(),
            EventBus::new(8),
            Arc::new(BanList::new(dir.join("banned.log"), Duration::from_secs(60))),
        );
        DatabaseService::new(repo.clone(), Arc::new(reconciler))
    }

    #[tokio::test]
    async fn import_stops_swaps_and_restarts() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir");
        };
        let live = open(&dir.path().join("x-ui.db")).await;
        let fake = Arc::new(FakeXray::default());
        let service = service(&live, &fake, dir.path());
        let Ok(template) = crate::xray::template::load(None) else {
            panic!("template");
        };
        assert!(fake.start(template).await.is_ok());

        let other = open(&dir.path().join("other.db")).await;
        assert!(other.add_inbound(&vless_inbound(8443, &["new@x"])).await.is_ok());
        let Ok(bytes) = other.export_db().await else {
            panic!("export");
        };

        assert!(service.import(&bytes).await.is_ok());
        {
            let state = fake.state();
            assert_eq!(state.stops, 1);
            assert_eq!(state.starts, 2);
            let Some(config) = &state.config else {
                panic!("config");
            };
            assert!(config.inbounds.iter().any(|i| i.port == 8443));
        }
        assert!(dir.path().join("x-ui.db.backup").exists());
    }

    #[tokio::test]
    async fn wrong_file_is_rejected_before_xray_is_touched() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir");
        };
        let live = open(&dir.path().join("x-ui.db")).await;
        let fake = Arc::new(FakeXray::default());
        let service = service(&live, &fake, dir.path());

        let result = service.import(b"PK\x03\x04 zip archive").await;
        assert!(matches!(result, Err(PanelError::InvalidDb(_))));
        let state = fake.state();
        assert_eq!((state.starts, state.stops), (0, 0));
    }
}
