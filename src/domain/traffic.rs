//! Traffic counters and the deltas a stats tick produces.

use serde::{Deserialize, Serialize};

/// Milliseconds in one day; negative expiry values count days.
pub const DAY_MS: i64 = 86_400_000;

/// Per-client counter row, keyed by email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ClientTraffic {
    /// Row id.
    pub id: i64,
    /// Inbound the client belongs to.
    pub inbound_id: i64,
    /// Cleared by the disablement rules; the assembler drops such clients.
    pub enable: bool,
    /// Panel-unique client email.
    pub email: String,
    /// Uploaded bytes since the last reset.
    pub up: i64,
    /// Downloaded bytes since the last reset.
    pub down: i64,
    /// Expiry in ms since epoch; `0` never, negative is relative days.
    pub expiry_time: i64,
    /// Quota in bytes; `0` unlimited.
    pub total: i64,
    /// Auto-renew period in days.
    pub reset: i64,
    /// Last time the client was seen online (ms since epoch).
    pub last_online: i64,
}

impl ClientTraffic {
    /// Bytes used in both directions.
    #[must_use]
    pub const fn used(&self) -> i64 {
        self.up.saturating_add(self.down)
    }

    /// `total > 0 ∧ up + down ≥ total`.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.total > 0 && self.used() >= self.total
    }

    /// Positive expiry in the past. Zero never expires and negative values
    /// are not activated yet.
    #[must_use]
    pub const fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_time > 0 && self.expiry_time <= now_ms
    }

    /// Whether the client is within `traffic_diff` bytes of its quota or
    /// `expire_diff` ms of its expiry without having crossed either.
    #[must_use]
    pub const fn is_near_limit(&self, now_ms: i64, traffic_diff: i64, expire_diff: i64) -> bool {
        if self.is_exhausted() || self.is_expired(now_ms) {
            return false;
        }
        let near_quota =
            traffic_diff > 0 && self.total > 0 && self.total - self.used() <= traffic_diff;
        let near_expiry =
            expire_diff > 0 && self.expiry_time > 0 && self.expiry_time - now_ms <= expire_diff;
        near_quota || near_expiry
    }
}

/// Absolute expiry for a relative-days value activated at `now_ms`.
#[must_use]
pub const fn activate_relative_expiry(value: i64, now_ms: i64) -> i64 {
    if value >= 0 {
        value
    } else {
        now_ms.saturating_add(value.saturating_abs().saturating_mul(DAY_MS))
    }
}

/// Traffic moved through one inbound or outbound tag since the last poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagTraffic {
    /// Xray tag.
    pub tag: String,
    /// Uploaded bytes.
    pub up: i64,
    /// Downloaded bytes.
    pub down: i64,
}

/// Traffic moved by one client since the last poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientDelta {
    /// Client email.
    pub email: String,
    /// Uploaded bytes.
    pub up: i64,
    /// Downloaded bytes.
    pub down: i64,
}

impl ClientDelta {
    /// Whether any traffic was observed.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.up > 0 || self.down > 0
    }
}

/// Result of one stats tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrafficSample {
    /// Per-inbound deltas (the `api` inbound excluded).
    pub inbounds: Vec<TagTraffic>,
    /// Per-outbound deltas.
    pub outbounds: Vec<TagTraffic>,
    /// Per-client deltas.
    pub clients: Vec<ClientDelta>,
    /// Emails Xray currently reports online.
    pub online: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(total: i64, up: i64, down: i64, expiry_time: i64) -> ClientTraffic {
        ClientTraffic {
            id: 1,
            inbound_id: 1,
            enable: true,
            email: "a@x".to_string(),
            up,
            down,
            expiry_time,
            total,
            reset: 0,
            last_online: 0,
        }
    }

    #[test]
    fn exhaustion_needs_positive_quota() {
        assert!(!row(0, 10, 10, 0).is_exhausted());
        assert!(row(1 << 30, 1 << 29, 1 << 29, 0).is_exhausted());
        assert!(!row(1 << 30, 1, 1, 0).is_exhausted());
    }

    #[test]
    fn negative_expiry_is_not_expired() {
        assert!(!row(0, 0, 0, -7).is_expired(i64::MAX));
        assert!(row(0, 0, 0, 5).is_expired(5));
    }

    #[test]
    fn relative_expiry_activation() {
        assert_eq!(activate_relative_expiry(-2, 1_000), 1_000 + 2 * DAY_MS);
        assert_eq!(activate_relative_expiry(0, 1_000), 0);
        assert_eq!(activate_relative_expiry(77, 1_000), 77);
    }

    #[test]
    fn near_limit_thresholds() {
        let r = row(1_000, 400, 500, 0);
        assert!(r.is_near_limit(0, 100, 0));
        assert!(!r.is_near_limit(0, 50, 0));
        let e = row(0, 0, 0, 10_000);
        assert!(e.is_near_limit(9_500, 0, 1_000));
        assert!(!e.is_near_limit(10_000, 0, 1_000));
    }
}
