//! One-shot data seeders and panel login checks.
//!
//! Each seeder runs at most once per database; completion is recorded in
//! `history_of_seeders`.

use super::models::UserRow;
use super::sqlite::SqliteRepository;
use crate::error::PanelError;

const DEFAULT_USERNAME: &str = "admin";
const DEFAULT_PASSWORD: &str = "admin";
const PASSWORD_HASH_SEEDER: &str = "UserPasswordHash";

async fn hash_password(password: String) -> Result<String, PanelError> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, bcrypt::DEFAULT_COST))
        .await
        .map_err(|e| PanelError::Internal(format!("hashing task failed: {e}")))?
        .map_err(|e| PanelError::Internal(format!("bcrypt: {e}")))
}

fn is_bcrypt_hash(password: &str) -> bool {
    password.starts_with("$2")
}

impl SqliteRepository {
    /// Seeds the default login on an empty database and hashes any
    /// plaintext passwords left by older databases.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure and
    /// [`PanelError::Internal`] if hashing fails.
    pub async fn run_seeders(&self) -> Result<(), PanelError> {
        let pool = self.pool();
        let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&pool)
            .await?;
        if users == 0 {
            let hash = hash_password(DEFAULT_PASSWORD.to_string()).await?;
            let mut tx = pool.begin().await?;
            sqlx::query("INSERT INTO users (username, password) VALUES (?, ?)")
                .bind(DEFAULT_USERNAME)
                .bind(&hash)
                .execute(&mut *tx)
                .await?;
            sqlx::query("INSERT OR IGNORE INTO history_of_seeders (seeder_name) VALUES (?)")
                .bind(PASSWORD_HASH_SEEDER)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            tracing::info!(username = DEFAULT_USERNAME, "seeded default panel user");
            return Ok(());
        }

        let applied: Option<i64> =
            sqlx::query_scalar("SELECT id FROM history_of_seeders WHERE seeder_name = ?")
                .bind(PASSWORD_HASH_SEEDER)
                .fetch_optional(&pool)
                .await?;
        if applied.is_some() {
            return Ok(());
        }

        let rows: Vec<UserRow> = sqlx::query_as("SELECT id, username, password FROM users")
            .fetch_all(&pool)
            .await?;
        let mut hashed = Vec::new();
        for row in rows.into_iter().filter(|r| !is_bcrypt_hash(&r.password)) {
            hashed.push((row.id, hash_password(row.password).await?));
        }

        let mut tx = pool.begin().await?;
        for (id, hash) in &hashed {
            sqlx::query("UPDATE users SET password = ? WHERE id = ?")
                .bind(hash)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("INSERT INTO history_of_seeders (seeder_name) VALUES (?)")
            .bind(PASSWORD_HASH_SEEDER)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(rehashed = hashed.len(), "password hash seeder applied");
        Ok(())
    }

    /// Checks a login against the stored bcrypt hash.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn verify_user(&self, username: &str, password: &str) -> Result<bool, PanelError> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT id, username, password FROM users WHERE username = ?")
                .bind(username)
                .fetch_optional(&self.pool())
                .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let password = password.to_string();
        let valid = tokio::task::spawn_blocking(move || bcrypt::verify(password, &row.password))
            .await
            .map_err(|e| PanelError::Internal(format!("hashing task failed: {e}")))?
            .unwrap_or(false);
        Ok(valid)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::super::inbounds::tests::repo;
    use super::*;

    #[tokio::test]
    async fn empty_database_gets_default_login() {
        let repo = repo().await;
        assert!(repo.run_seeders().await.is_ok());
        assert_eq!(repo.verify_user("admin", "admin").await.ok(), Some(true));
        assert_eq!(repo.verify_user("admin", "wrong").await.ok(), Some(false));
        assert_eq!(repo.verify_user("nobody", "admin").await.ok(), Some(false));
    }

    #[tokio::test]
    async fn plaintext_passwords_are_hashed_once() {
        let repo = repo().await;
        let inserted = sqlx::query("INSERT INTO users (username, password) VALUES ('ops', 'hunter2')")
            .execute(&repo.pool())
            .await;
        assert!(inserted.is_ok());

        assert!(repo.run_seeders().await.is_ok());
        let stored: Result<String, _> =
            sqlx::query_scalar("SELECT password FROM users WHERE username = 'ops'")
                .fetch_one(&repo.pool())
                .await;
        let Ok(stored) = stored else {
            panic!("stored password");
        };
        assert!(is_bcrypt_hash(&stored));
        assert_eq!(repo.verify_user("ops", "hunter2").await.ok(), Some(true));

        // Second run leaves the hash alone.
        assert!(repo.run_seeders().await.is_ok());
        let again: Result<String, _> =
            sqlx::query_scalar("SELECT password FROM users WHERE username = 'ops'")
                .fetch_one(&repo.pool())
                .await;
        assert_eq!(again.ok(), Some(stored));
    }
}
