//! Whole-database export and import.

use std::path::{Path, PathBuf};

use super::sqlite::{SqliteRepository, connect_file, migrate};
use crate::error::PanelError;

/// Header every SQLite 3 database file starts with.
pub const SQLITE_SIGNATURE: &[u8; 16] = b"SQLite format 3\0";

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "could not remove file");
        }
    }
}

async fn remove_upload(upload: &Path) {
    remove_if_exists(upload).await;
    remove_if_exists(&sibling(upload, "-wal")).await;
    remove_if_exists(&sibling(upload, "-shm")).await;
}

impl SqliteRepository {
    fn file_path(&self) -> Result<&Path, PanelError> {
        self.path()
            .ok_or_else(|| PanelError::InvalidRequest("database is not file backed".to_string()))
    }

    /// Checkpoints the log and returns the database file contents.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::InvalidRequest`] for in-memory databases and
    /// [`PanelError::Io`] if the file cannot be read.
    pub async fn export_db(&self) -> Result<Vec<u8>, PanelError> {
        let path = self.file_path()?;
        self.checkpoint().await?;
        Ok(tokio::fs::read(path).await?)
    }

    /// Replaces the database file with `bytes`.
    ///
    /// The upload is checked before the live file is touched. The previous
    /// file is kept as `<name>.backup` and restored if the new one cannot
    /// be opened or migrated.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::InvalidDb`] if the upload is not a usable
    /// SQLite database, or the underlying failure after the backup has been
    /// restored.
    pub async fn replace_database(&self, bytes: &[u8]) -> Result<(), PanelError> {
        if !bytes.starts_with(SQLITE_SIGNATURE) {
            return Err(PanelError::InvalidDb("missing SQLite header".to_string()));
        }
        let path = self.file_path()?.to_path_buf();
        let upload = sibling(&path, ".upload");
        let backup = sibling(&path, ".backup");

        tokio::fs::write(&upload, bytes).await?;
        if let Err(e) = check_upload(&upload).await {
            remove_upload(&upload).await;
            return Err(e);
        }

        if let Err(e) = self.checkpoint().await {
            remove_upload(&upload).await;
            return Err(e);
        }
        self.pool().close().await;
        remove_if_exists(&sibling(&path, "-wal")).await;
        remove_if_exists(&sibling(&path, "-shm")).await;
        if let Err(e) = tokio::fs::rename(&path, &backup).await {
            tracing::error!(backup = %backup.display(), error = %e, "could not move live database aside");
            remove_upload(&upload).await;
            self.reopen(&path).await?;
            return Err(e.into());
        }

        match self.install(&upload, &path).await {
            Ok(()) => {
                tracing::info!(path = %path.display(), backup = %backup.display(), "database replaced");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "imported database rejected, restoring backup");
                remove_if_exists(&path).await;
                remove_upload(&upload).await;
                tokio::fs::rename(&backup, &path).await?;
                self.reopen(&path).await?;
                Err(e)
            }
        }
    }

    /// Points the repository at `path` again after its pool was closed.
    async fn reopen(&self, path: &Path) -> Result<(), PanelError> {
        let pool = connect_file(path).await?;
        self.swap_pool(pool);
        tracing::info!(path = %path.display(), "live database reopened");
        Ok(())
    }

    async fn install(&self, upload: &Path, path: &Path) -> Result<(), PanelError> {
        tokio::fs::rename(upload, path).await?;
        let pool = connect_file(path).await?;
        if let Err(e) = migrate(&pool).await {
            pool.close().await;
            return Err(e);
        }
        self.swap_pool(pool);
        self.run_seeders().await
    }
}

async fn check_upload(upload: &Path) -> Result<(), PanelError> {
    let pool = connect_file(upload)
        .await
        .map_err(|e| PanelError::InvalidDb(e.to_string()))?;
    let verdict: Result<String, _> = sqlx::query_scalar("PRAGMA quick_check")
        .fetch_one(&pool)
        .await;
    // Closing folds the upload's log back so the rename moves one file.
    let _ = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(&pool).await;
    pool.close().await;
    match verdict {
        Ok(v) if v == "ok" => Ok(()),
        Ok(v) => Err(PanelError::InvalidDb(v)),
        Err(e) => Err(PanelError::InvalidDb(e.to_string())),
    }
}
