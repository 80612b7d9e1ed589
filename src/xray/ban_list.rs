//! Ban list for IPs that pushed a client over its IP limit.
//!
//! Every ban is appended to a log file external tools (fail2ban and the
//! like) can follow; the active set is kept in memory and routed to the
//! blackhole outbound on the next assembly.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tokio::io::AsyncWriteExt;

use crate::error::PanelError;

/// Banned source IPs with their expiry.
#[derive(Debug)]
pub struct BanList {
    path: PathBuf,
    ttl: Duration,
    bans: Mutex<HashMap<IpAddr, DateTime<Utc>>>,
}

impl BanList {
    /// Creates a ban list logging to `path`; bans last `ttl`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, ttl: std::time::Duration) -> Self {
        Self {
            path: path.into(),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::days(36_500)),
            bans: Mutex::new(HashMap::new()),
        }
    }

    /// Bans `ips` for `email` at `now`. Returns the IPs that were not
    /// already banned.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::Io`] if the log file cannot be appended to;
    /// the in-memory ban is kept regardless.
    pub async fn ban(
        &self,
        email: &str,
        ips: &BTreeSet<IpAddr>,
        now: DateTime<Utc>,
    ) -> Result<Vec<IpAddr>, PanelError> {
        let until = now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let fresh: Vec<IpAddr> = {
            let mut bans = self.bans.lock().unwrap_or_else(PoisonError::into_inner);
            ips.iter()
                .filter(|ip| {
                    let known = bans.get(*ip).is_some_and(|exp| *exp > now);
                    bans.insert(**ip, until);
                    !known
                })
                .copied()
                .collect()
        };
        if fresh.is_empty() {
            return Ok(fresh);
        }

        let mut text = String::new();
        for ip in &fresh {
            text.push_str(&ban_line(now, email, *ip));
            text.push('\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        tracing::info!(%email, count = fresh.len(), "ip limit bans recorded");
        Ok(fresh)
    }

    /// IPs whose ban has not expired at `now`; expired bans are dropped.
    pub fn active(&self, now: DateTime<Utc>) -> BTreeSet<String> {
        let mut bans = self.bans.lock().unwrap_or_else(PoisonError::into_inner);
        bans.retain(|_, until| *until > now);
        bans.keys().map(ToString::to_string).collect()
    }
}

fn ban_line(at: DateTime<Utc>, email: &str, ip: IpAddr) -> String {
    format!(
        "{} [LIMIT_IP] Email = {email} || SRC = {ip}",
        at.format("%Y/%m/%d %H:%M:%S")
    )
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        let Some(t) = Utc.timestamp_opt(1_700_000_000 + secs, 0).single() else {
            panic!("valid timestamp");
        };
        t
    }

    fn ips(list: &[&str]) -> BTreeSet<IpAddr> {
        list.iter().filter_map(|s| s.parse().ok()).collect()
    }

    #[test]
    fn line_format() {
        let Ok(ip) = "203.0.113.9".parse::<IpAddr>() else {
            panic!("ip");
        };
        assert_eq!(
            ban_line(at(0), "alice", ip),
            "2023/11/14 22:13:20 [LIMIT_IP] Email = alice || SRC = 203.0.113.9"
        );
    }

    #[tokio::test]
    async fn bans_expire_and_are_logged_once() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir");
        };
        let path = dir.path().join("banned.log");
        let list = BanList::new(&path, std::time::Duration::from_secs(60));

        let Ok(first) = list.ban("a", &ips(&["198.51.100.1", "198.51.100.2"]), at(0)).await else {
            panic!("ban");
        };
        assert_eq!(first.len(), 2);
        let Ok(again) = list.ban("a", &ips(&["198.51.100.1"]), at(10)).await else {
            panic!("ban");
        };
        assert!(again.is_empty());

        assert_eq!(list.active(at(30)).len(), 2);
        assert!(list.active(at(120)).is_empty());

        let Ok(text) = std::fs::read_to_string(&path) else {
            panic!("log written");
        };
        assert_eq!(text.lines().count(), 2);
    }
}
