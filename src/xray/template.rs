//! The template config assembly starts from.

use super::config::XrayConfig;
use crate::error::PanelError;

/// Template shipped with the panel, used until an operator stores one.
pub const DEFAULT_TEMPLATE: &str = include_str!("default_config.json");

/// Parses the operator template, falling back to [`DEFAULT_TEMPLATE`] when
/// none is stored or the stored one is malformed.
///
/// # Errors
///
/// Returns [`PanelError::Internal`] only if the built-in template is broken.
pub fn load(stored: Option<&str>) -> Result<XrayConfig, PanelError> {
    if let Some(text) = stored.filter(|t| !t.trim().is_empty()) {
        match XrayConfig::parse(text) {
            Ok(config) => return Ok(config),
            Err(e) => tracing::warn!(error = %e, "stored xray template is invalid; using default"),
        }
    }
    XrayConfig::parse(DEFAULT_TEMPLATE)
        .map_err(|e| PanelError::Internal(format!("built-in template: {e}")))
}
