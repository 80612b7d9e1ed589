//! Share-link history and short links.

use uuid::Uuid;

use super::models::{LinkRecord, ShortLink};
use super::sqlite::{SqliteRepository, now_ms};
use crate::error::PanelError;

/// Records kept in `link_history`.
pub const LINK_HISTORY_LIMIT: i64 = 10;

/// Length of a short-link code.
pub const SHORT_CODE_LEN: usize = 8;

const SHORT_CODE_ATTEMPTS: usize = 5;

impl SqliteRepository {
    /// Appends a generated link, trims the history to the newest
    /// [`LINK_HISTORY_LIMIT`] records and checkpoints the log.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn record_link(&self, link_type: &str, link: &str) -> Result<LinkRecord, PanelError> {
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        let record: LinkRecord = sqlx::query_as(
            "INSERT INTO link_history (link_type, link, created_at) VALUES (?, ?, ?) \
             RETURNING id, link_type, link, created_at",
        )
        .bind(link_type)
        .bind(link)
        .bind(now_ms())
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM link_history WHERE id NOT IN \
             (SELECT id FROM link_history ORDER BY id DESC LIMIT ?)",
        )
        .bind(LINK_HISTORY_LIMIT)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        self.checkpoint().await?;
        Ok(record)
    }

    /// Newest links first, at most `limit` (capped at the history size).
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn get_recent_links(&self, limit: i64) -> Result<Vec<LinkRecord>, PanelError> {
        Ok(sqlx::query_as(
            "SELECT id, link_type, link, created_at FROM link_history ORDER BY id DESC LIMIT ?",
        )
        .bind(limit.clamp(0, LINK_HISTORY_LIMIT))
        .fetch_all(&self.pool())
        .await?)
    }

    /// Issues a short code for `link`, reusing the existing one if the link
    /// was shortened before.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::Conflict`] if no free code was found.
    pub async fn create_short_link(&self, link: &str) -> Result<ShortLink, PanelError> {
        let pool = self.pool();
        let existing: Option<ShortLink> =
            sqlx::query_as("SELECT code, link, created_at FROM short_links WHERE link = ? LIMIT 1")
                .bind(link)
                .fetch_optional(&pool)
                .await?;
        if let Some(existing) = existing {
            return Ok(existing);
        }

        for _ in 0..SHORT_CODE_ATTEMPTS {
            let code: String = Uuid::new_v4()
                .simple()
                .to_string()
                .chars()
                .take(SHORT_CODE_LEN)
                .collect();
            let inserted = sqlx::query_as(
                "INSERT INTO short_links (code, link, created_at) VALUES (?, ?, ?) \
                 RETURNING code, link, created_at",
            )
            .bind(&code)
            .bind(link)
            .bind(now_ms())
            .fetch_one(&pool)
            .await;
            match inserted.map_err(PanelError::from) {
                Ok(short) => return Ok(short),
                Err(PanelError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(PanelError::Conflict("could not allocate a short link code".to_string()))
    }

    /// Link behind a short code.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::NotFound`] for unknown codes.
    pub async fn resolve_short_link(&self, code: &str) -> Result<String, PanelError> {
        let link: Option<String> = sqlx::query_scalar("SELECT link FROM short_links WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool())
            .await?;
        link.ok_or_else(|| PanelError::NotFound(format!("short link {code}")))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::super::inbounds::tests::repo;
    use super::*;

    #[tokio::test]
    async fn history_keeps_the_newest_ten() {
        let repo = repo().await;
        for i in 0..13 {
            assert!(repo.record_link("vless", &format!("vless://{i}")).await.is_ok());
        }
        let Ok(links) = repo.get_recent_links(50).await else {
            panic!("recent");
        };
        assert_eq!(links.len(), 10);
        assert_eq!(links.first().map(|l| l.link.as_str()), Some("vless://12"));
        assert_eq!(links.last().map(|l| l.link.as_str()), Some("vless://3"));
    }

    #[tokio::test]
    async fn short_links_round_trip_and_are_reused() {
        let repo = repo().await;
        let Ok(first) = repo.create_short_link("trojan://secret@h:443").await else {
            panic!("create");
        };
        assert_eq!(first.code.len(), SHORT_CODE_LEN);
        let Ok(again) = repo.create_short_link("trojan://secret@h:443").await else {
            panic!("create again");
        };
        assert_eq!(first.code, again.code);
        assert_eq!(
            repo.resolve_short_link(&first.code).await.ok().as_deref(),
            Some("trojan://secret@h:443")
        );
        assert!(matches!(
            repo.resolve_short_link("zzzzzzzz").await,
            Err(PanelError::NotFound(_))
        ));
    }
}
