//! SQLite-backed repository handle.
//!
//! [`SqliteRepository`] is cheap to clone. The pool sits behind a lock so a
//! database import can swap the underlying file while handlers keep their
//! clones of the repository.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};

use crate::error::PanelError;

/// Panel repository over a SQLite database in WAL mode.
#[derive(Debug, Clone)]
pub struct SqliteRepository {
    pool: Arc<RwLock<SqlitePool>>,
    path: Option<PathBuf>,
}

impl SqliteRepository {
    /// Opens (creating if needed) the database file at `path`, applies
    /// migrations and runs the one-shot seeders.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] if the database cannot be
    /// opened or migrated.
    pub async fn open(path: &Path) -> Result<Self, PanelError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let pool = connect_file(path).await?;
        migrate(&pool).await?;
        let repo = Self {
            pool: Arc::new(RwLock::new(pool)),
            path: Some(path.to_path_buf()),
        };
        repo.run_seeders().await?;
        tracing::info!(path = %path.display(), "database ready");
        Ok(repo)
    }

    /// Private in-memory database with migrations applied and no seed data.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] if migrations fail.
    pub async fn in_memory() -> Result<Self, PanelError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // One connection that never expires, otherwise the database vanishes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        migrate(&pool).await?;
        Ok(Self {
            pool: Arc::new(RwLock::new(pool)),
            path: None,
        })
    }

    /// Current connection pool.
    #[must_use]
    pub fn pool(&self) -> SqlitePool {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Database file, `None` for in-memory databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Folds the write-ahead log into the main file.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn checkpoint(&self) -> Result<(), PanelError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool())
            .await?;
        Ok(())
    }

    /// Replaces the pool, returning the previous one.
    pub(crate) fn swap_pool(&self, pool: SqlitePool) -> SqlitePool {
        let mut guard = self.pool.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, pool)
    }
}

/// Connects to a database file in WAL mode.
pub(crate) async fn connect_file(path: &Path) -> Result<SqlitePool, PanelError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    Ok(SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?)
}

/// Applies the versioned migrations under `migrations/`.
pub(crate) async fn migrate(pool: &SqlitePool) -> Result<(), PanelError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Current time in ms since epoch.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_database_is_created_and_migrated() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir");
        };
        let path = dir.path().join("nested").join("x-ui.db");
        let Ok(repo) = SqliteRepository::open(&path).await else {
            panic!("open");
        };
        assert!(path.exists());
        let tables: Result<i64, _> = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
             ('users','inbounds','outbound_traffics','settings','inbound_client_ips', \
              'client_traffics','history_of_seeders','link_history','short_links','lottery_wins')",
        )
        .fetch_one(&repo.pool())
        .await;
        assert_eq!(tables.ok(), Some(10));
        assert!(repo.checkpoint().await.is_ok());
    }

    #[tokio::test]
    async fn memory_database_survives_idle() {
        let Ok(repo) = SqliteRepository::in_memory().await else {
            panic!("in-memory");
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let count: Result<i64, _> = sqlx::query_scalar("SELECT COUNT(*) FROM inbounds")
            .fetch_one(&repo.pool())
            .await;
        assert_eq!(count.ok(), Some(0));
    }
}
