//! Key/value settings with typed accessors.

use super::sqlite::SqliteRepository;
use crate::error::PanelError;

/// Operator Xray template.
pub const XRAY_TEMPLATE_KEY: &str = "xrayTemplateConfig";
/// Remaining-bytes threshold for near-limit notifications.
pub const TRAFFIC_DIFF_KEY: &str = "trafficDiff";
/// Remaining-days threshold for near-limit notifications.
pub const EXPIRE_DIFF_KEY: &str = "expireDiff";
/// Whether the Telegram notifier is on.
pub const TG_BOT_ENABLE_KEY: &str = "tgBotEnable";

const BYTES_PER_GB: i64 = 1024 * 1024 * 1024;
const MS_PER_DAY: i64 = 86_400_000;

impl SqliteRepository {
    /// Raw value of a setting.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, PanelError> {
        Ok(sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool())
            .await?)
    }

    /// Inserts or replaces a setting.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), PanelError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool())
        .await?;
        Ok(())
    }

    async fn setting_or<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, PanelError> {
        Ok(self
            .get_setting(key)
            .await?
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default))
    }

    /// The stored Xray template, if any.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn xray_template(&self) -> Result<Option<String>, PanelError> {
        self.get_setting(XRAY_TEMPLATE_KEY).await
    }

    /// Near-limit quota threshold in bytes (stored in GB, default `0`).
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn traffic_diff_bytes(&self) -> Result<i64, PanelError> {
        let gb: i64 = self.setting_or(TRAFFIC_DIFF_KEY, 0).await?;
        Ok(gb.saturating_mul(BYTES_PER_GB))
    }

    /// Near-limit expiry threshold in ms (stored in days, default `0`).
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn expire_diff_ms(&self) -> Result<i64, PanelError> {
        let days: i64 = self.setting_or(EXPIRE_DIFF_KEY, 0).await?;
        Ok(days.saturating_mul(MS_PER_DAY))
    }

    /// Whether the Telegram notifier is enabled (default `false`).
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] on database failure.
    pub async fn tg_bot_enabled(&self) -> Result<bool, PanelError> {
        self.setting_or(TG_BOT_ENABLE_KEY, false).await
    }
}
