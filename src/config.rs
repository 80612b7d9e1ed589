//! Panel configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). Runtime-editable knobs such as the Xray
//! template or notification thresholds live in the `settings` table instead.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level panel configuration.
///
/// Loaded once at startup via [`PanelConfig::from_env`].
#[derive(Debug, Clone)]
pub struct PanelConfig {
    /// Socket address to bind the HTTP server to (e.g. `0.0.0.0:2053`).
    pub listen_addr: SocketAddr,

    /// Path of the SQLite database file.
    pub database_path: PathBuf,

    /// Folder holding the Xray binary, its generated config and geo files.
    pub xray_bin_folder: PathBuf,

    /// Xray binary file name inside [`Self::xray_bin_folder`].
    pub xray_binary: String,

    /// Xray access log the IP-limit watcher tails.
    pub access_log_path: PathBuf,

    /// Append-only ban list written when a client exceeds its IP limit.
    pub ban_list_path: PathBuf,

    /// Seconds between stats polls / accounting ticks.
    pub stats_interval_secs: u64,

    /// Delay before the first accounting tick.
    pub stats_initial_delay_secs: u64,

    /// Deadline for one stats gRPC round trip.
    pub stats_timeout_secs: u64,

    /// Seconds between reconcile cycles.
    pub reconcile_interval_secs: u64,

    /// Milliseconds between crash probes.
    pub crash_probe_interval_ms: u64,

    /// Seconds Xray has to answer its API after spawn.
    pub xray_start_timeout_secs: u64,

    /// Seconds between SIGTERM and SIGKILL on stop.
    pub xray_stop_grace_secs: u64,

    /// Rolling window for distinct source IPs per email.
    pub ip_window_secs: u64,

    /// How long an IP stays banned after exceeding a limit.
    pub ip_ban_minutes: u64,

    /// Capacity of the EventBus broadcast channel.
    pub event_bus_capacity: usize,

    /// Emit logs as JSON lines instead of human readable text.
    pub log_json: bool,
}

impl PanelConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to sensible defaults when a variable is not set.
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns an error if `LISTEN_ADDR` is set but cannot be parsed as
    /// a [`SocketAddr`].
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let listen_addr: SocketAddr = std::env::var("LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:2053".to_string())
            .parse()?;

        let database_path = parse_path("DATABASE_PATH", "/etc/x-ui/x-ui.db");
        let xray_bin_folder = parse_path("XRAY_BIN_FOLDER", "bin");
        let xray_binary =
            std::env::var("XRAY_BINARY").unwrap_or_else(|_| default_binary_name());
        let access_log_path = parse_path("XRAY_ACCESS_LOG", "access.log");
        let ban_list_path = parse_path("XRAY_BAN_LIST", "3xipl-banned.log");

        Ok(Self {
            listen_addr,
            database_path,
            xray_bin_folder,
            xray_binary,
            access_log_path,
            ban_list_path,
            stats_interval_secs: parse_env("STATS_INTERVAL_SECS", 10),
            stats_initial_delay_secs: parse_env("STATS_INITIAL_DELAY_SECS", 5),
            stats_timeout_secs: parse_env("STATS_TIMEOUT_SECS", 10),
            reconcile_interval_secs: parse_env("RECONCILE_INTERVAL_SECS", 30),
            crash_probe_interval_ms: parse_env("CRASH_PROBE_INTERVAL_MS", 1_000),
            xray_start_timeout_secs: parse_env("XRAY_START_TIMEOUT_SECS", 10),
            xray_stop_grace_secs: parse_env("XRAY_STOP_GRACE_SECS", 5),
            ip_window_secs: parse_env("IP_WINDOW_SECS", 60),
            ip_ban_minutes: parse_env("IP_BAN_MINUTES", 30),
            event_bus_capacity: parse_env("EVENT_BUS_CAPACITY", 1_024),
            log_json: std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")),
        })
    }

    /// Full path of the Xray executable.
    #[must_use]
    pub fn xray_binary_path(&self) -> PathBuf {
        self.xray_bin_folder.join(&self.xray_binary)
    }

    /// Deterministic path the generated Xray config is written to.
    #[must_use]
    pub fn xray_config_path(&self) -> PathBuf {
        self.xray_bin_folder.join("config.json")
    }

    /// Accounting tick interval.
    #[must_use]
    pub const fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    /// Reconcile tick interval.
    #[must_use]
    pub const fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    /// Crash probe interval.
    #[must_use]
    pub const fn crash_probe_interval(&self) -> Duration {
        Duration::from_millis(self.crash_probe_interval_ms)
    }

    /// Delay before the first accounting tick.
    #[must_use]
    pub const fn stats_initial_delay(&self) -> Duration {
        Duration::from_secs(self.stats_initial_delay_secs)
    }

    /// Deadline of one stats gRPC call.
    #[must_use]
    pub const fn stats_timeout(&self) -> Duration {
        Duration::from_secs(self.stats_timeout_secs)
    }

    /// How long a fresh child may take to open its API port.
    #[must_use]
    pub const fn xray_start_timeout(&self) -> Duration {
        Duration::from_secs(self.xray_start_timeout_secs)
    }

    /// Grace period between terminate and kill.
    #[must_use]
    pub const fn xray_stop_grace(&self) -> Duration {
        Duration::from_secs(self.xray_stop_grace_secs)
    }

    /// Rolling window of the IP-limit watcher.
    #[must_use]
    pub const fn ip_window(&self) -> Duration {
        Duration::from_secs(self.ip_window_secs)
    }

    /// How long a banned IP stays blocked.
    #[must_use]
    pub const fn ip_ban_duration(&self) -> Duration {
        Duration::from_secs(self.ip_ban_minutes.saturating_mul(60))
    }
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 2053)),
            database_path: PathBuf::from("/etc/x-ui/x-ui.db"),
            xray_bin_folder: PathBuf::from("bin"),
            xray_binary: default_binary_name(),
            access_log_path: PathBuf::from("access.log"),
            ban_list_path: PathBuf::from("3xipl-banned.log"),
            stats_interval_secs: 10,
            stats_initial_delay_secs: 5,
            stats_timeout_secs: 10,
            reconcile_interval_secs: 30,
            crash_probe_interval_ms: 1_000,
            xray_start_timeout_secs: 10,
            xray_stop_grace_secs: 5,
            ip_window_secs: 60,
            ip_ban_minutes: 30,
            event_bus_capacity: 1_024,
            log_json: false,
        }
    }
}

/// Xray release asset naming: `xray-<os>-<arch>`.
fn default_binary_name() -> String {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    format!("xray-{}-{arch}", std::env::consts::OS)
}

fn parse_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key).map_or_else(|_| PathBuf::from(default), PathBuf::from)
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
