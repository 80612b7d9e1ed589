//! Server, link and database bodies.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::xray::XrayStatus;

/// Response body for `GET /server/status`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ServerStatusResponse {
    /// Xray lifecycle snapshot.
    pub xray: XrayStatus,
    /// Emails online at the last stats tick.
    pub online_clients: Vec<String>,
    /// Last lines Xray wrote to stdout/stderr.
    pub output: String,
}

/// Query for `GET /links/recent`.
#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RecentLinksParams {
    /// How many links to return (max 10). Defaults to 10.
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    10
}

/// Request body for `POST /links/short`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ShortenRequest {
    /// Link to shorten.
    pub link: String,
}

/// Response body for `POST /db`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ImportResponse {
    /// Size of the imported file in bytes.
    pub bytes: usize,
}
