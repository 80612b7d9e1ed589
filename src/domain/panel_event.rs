//! Domain events reflecting Xray lifecycle and client enforcement.
//!
//! Every notable state change emits a [`PanelEvent`] through the
//! [`super::EventBus`]. Notifiers (the Telegram bot, panel toasts) subscribe
//! to the bus instead of polling the repository.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Why a client was disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    /// Quota used up.
    Exhausted,
    /// Expiry passed.
    Expired,
}

/// Domain event emitted after every lifecycle or enforcement decision.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum PanelEvent {
    /// Xray answered its API after a start.
    XrayStarted {
        /// Version string reported by the binary.
        version: String,
        /// Loopback API port chosen for this run.
        api_port: u16,
        /// Start timestamp.
        timestamp: DateTime<Utc>,
    },

    /// Xray was stopped on request.
    XrayStopped {
        /// Stop timestamp.
        timestamp: DateTime<Utc>,
    },

    /// Xray exited without being asked to.
    XrayCrashed {
        /// Last captured stderr line or exit status.
        error: String,
        /// Detection timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A reconcile attempt failed; not retried until the next cycle.
    RestartFailed {
        /// Failure message.
        error: String,
        /// Failure timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A client's traffic row was disabled.
    ClientDisabled {
        /// Client email.
        email: String,
        /// Disablement rule that fired.
        reason: DisableReason,
        /// Decision timestamp.
        timestamp: DateTime<Utc>,
    },

    /// An inbound was disabled by its own quota or expiry.
    InboundDisabled {
        /// Inbound id.
        inbound_id: i64,
        /// Disablement rule that fired.
        reason: DisableReason,
        /// Decision timestamp.
        timestamp: DateTime<Utc>,
    },

    /// Clients close to their quota or expiry.
    ClientsNearLimit {
        /// Affected emails.
        emails: Vec<String>,
        /// Detection timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A client used more source IPs than allowed.
    IpLimitExceeded {
        /// Client email.
        email: String,
        /// IPs appended to the ban list.
        banned: Vec<String>,
        /// Detection timestamp.
        timestamp: DateTime<Utc>,
    },
}

impl PanelEvent {
    /// Returns the event type as a static string slice.
    #[must_use]
    pub const fn event_type_str(&self) -> &'static str {
        match self {
            Self::XrayStarted { .. } => "xray_started",
            Self::XrayStopped { .. } => "xray_stopped",
            Self::XrayCrashed { .. } => "xray_crashed",
            Self::RestartFailed { .. } => "restart_failed",
            Self::ClientDisabled { .. } => "client_disabled",
            Self::InboundDisabled { .. } => "inbound_disabled",
            Self::ClientsNearLimit { .. } => "clients_near_limit",
            Self::IpLimitExceeded { .. } => "ip_limit_exceeded",
        }
    }
}
