//! Traffic accounting and limit enforcement.
//!
//! One [`Accountant::tick`] folds a stats sample into the repository, then
//! disables clients and inbounds that ran out of quota or time and bans
//! source IPs above a client's IP limit. Anything that changes the assembled
//! config raises the restart signal; the reconciler does the restart.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{DisableReason, EventBus, Inbound, PanelEvent, RestartSignal, TrafficSample};
use crate::error::PanelError;
use crate::persistence::SqliteRepository;
use crate::xray::{AccessLogWatcher, BanList, TrafficSource};

/// What one accounting tick decided.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Whether a stats sample was available.
    pub sampled: bool,
    /// Clients disabled by this tick.
    pub disabled_clients: Vec<(String, DisableReason)>,
    /// Inbounds disabled by this tick.
    pub disabled_inbounds: Vec<(i64, DisableReason)>,
    /// Enabled clients close to a limit.
    pub near_limit: Vec<String>,
    /// IPs newly banned, by email.
    pub banned: BTreeMap<String, Vec<IpAddr>>,
    /// Whether the restart signal was raised.
    pub restart_requested: bool,
}

#[derive(Debug, Default)]
struct Memory {
    near_limit: BTreeSet<String>,
    active_bans: BTreeSet<String>,
}

/// Periodic traffic accountant.
#[derive(Debug)]
pub struct Accountant {
    repo: SqliteRepository,
    source: Arc<dyn TrafficSource>,
    signal: RestartSignal,
    event_bus: EventBus,
    bans: Arc<BanList>,
    watcher: Option<AccessLogWatcher>,
    memory: Mutex<Memory>,
}

impl Accountant {
    /// Creates an accountant. Without a `watcher` IP limits are not
    /// enforced.
    #[must_use]
    pub fn new(
        repo: SqliteRepository,
        source: Arc<dyn TrafficSource>,
        signal: RestartSignal,
        event_bus: EventBus,
        bans: Arc<BanList>,
        watcher: Option<AccessLogWatcher>,
    ) -> Self {
        Self {
            repo,
            source,
            signal,
            event_bus,
            bans,
            watcher,
            memory: Mutex::new(Memory::default()),
        }
    }

    /// Runs one accounting pass at `now`. Ticks never overlap.
    ///
    /// An unreachable Xray skips the pass and is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::PersistenceError`] if the repository fails
    /// mid-pass; the deltas written before the failure are kept.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, PanelError> {
        let mut memory = self.memory.lock().await;
        let mut report = TickReport::default();

        let sample = match self.source.get_traffic(true).await {
            Ok(sample) => sample,
            Err(e) if e.is_transient() => {
                tracing::debug!(error = %e, "stats unavailable; accounting skipped");
                return Ok(report);
            }
            Err(e) => return Err(e),
        };
        report.sampled = true;
        let now_ms = now.timestamp_millis();

        let inbounds = self.repo.list_inbounds().await?;
        self.store_sample(&inbounds, &sample, now_ms).await?;
        self.disable_clients(now_ms, &mut report).await?;
        self.disable_inbounds(now_ms, &mut report).await?;
        self.track_near_limit(now, &mut memory, &mut report).await?;
        self.enforce_ip_limits(&inbounds, now, &mut report).await?;

        let active = self.bans.active(now);
        if active != memory.active_bans {
            memory.active_bans = active;
            report.restart_requested = true;
        }
        if report.restart_requested {
            self.signal.request(false);
        }
        Ok(report)
    }

    async fn store_sample(
        &self,
        inbounds: &[Inbound],
        sample: &TrafficSample,
        now_ms: i64,
    ) -> Result<(), PanelError> {
        let tags = email_tags(inbounds);
        for delta in &sample.clients {
            let tag = tags
                .get(&delta.email.to_ascii_lowercase())
                .map_or("", String::as_str);
            let written = self
                .repo
                .upsert_traffic_delta(tag, &delta.email, delta.up, delta.down)
                .await?;
            if !written {
                tracing::debug!(email = %delta.email, "traffic for unknown client dropped");
                continue;
            }
            if delta.is_active() {
                self.repo.activate_client_expiry(&delta.email, now_ms).await?;
            }
        }
        for t in &sample.inbounds {
            self.repo.add_inbound_traffic(&t.tag, t.up, t.down).await?;
        }
        for t in &sample.outbounds {
            self.repo.add_outbound_traffic(&t.tag, t.up, t.down).await?;
        }
        self.repo.set_last_online(&sample.online, now_ms).await?;
        Ok(())
    }

    async fn disable_clients(&self, now_ms: i64, report: &mut TickReport) -> Result<(), PanelError> {
        for traffic in self.repo.list_client_traffics().await? {
            if !traffic.enable {
                continue;
            }
            let reason = if traffic.is_exhausted() {
                DisableReason::Exhausted
            } else if traffic.is_expired(now_ms) {
                DisableReason::Expired
            } else {
                continue;
            };
            match self.repo.set_client_enable(&traffic.email, false).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(PanelError::NotFound(_)) => {
                    tracing::warn!(email = %traffic.email, "traffic row without client entry");
                    continue;
                }
                Err(e) => return Err(e),
            }
            tracing::info!(email = %traffic.email, ?reason, "client disabled");
            let _ = self.event_bus.publish(PanelEvent::ClientDisabled {
                email: traffic.email.clone(),
                reason,
                timestamp: Utc::now(),
            });
            report.disabled_clients.push((traffic.email, reason));
            report.restart_requested = true;
        }
        Ok(())
    }

    async fn disable_inbounds(&self, now_ms: i64, report: &mut TickReport) -> Result<(), PanelError> {
        for inbound in self.repo.list_inbounds().await? {
            if !inbound.enable {
                continue;
            }
            let reason = if inbound.is_exhausted() {
                DisableReason::Exhausted
            } else if inbound.is_expired(now_ms) {
                DisableReason::Expired
            } else {
                continue;
            };
            self.repo.set_inbound_enable(inbound.id, false).await?;
            tracing::info!(inbound_id = inbound.id, ?reason, "inbound disabled");
            let _ = self.event_bus.publish(PanelEvent::InboundDisabled {
                inbound_id: inbound.id,
                reason,
                timestamp: Utc::now(),
            });
            report.disabled_inbounds.push((inbound.id, reason));
            report.restart_requested = true;
        }
        Ok(())
    }

    async fn track_near_limit(
        &self,
        now: DateTime<Utc>,
        memory: &mut Memory,
        report: &mut TickReport,
    ) -> Result<(), PanelError> {
        let traffic_diff = self.repo.traffic_diff_bytes().await?;
        let expire_diff = self.repo.expire_diff_ms().await?;
        let now_ms = now.timestamp_millis();
        let near: BTreeSet<String> = self
            .repo
            .list_client_traffics()
            .await?
            .into_iter()
            .filter(|t| t.enable && t.is_near_limit(now_ms, traffic_diff, expire_diff))
            .map(|t| t.email)
            .collect();
        report.near_limit = near.iter().cloned().collect();
        // Notify only when the set changes.
        if !near.is_empty() && near != memory.near_limit {
            let _ = self.event_bus.publish(PanelEvent::ClientsNearLimit {
                emails: report.near_limit.clone(),
                timestamp: now,
            });
        }
        memory.near_limit = near;
        Ok(())
    }

    async fn enforce_ip_limits(
        &self,
        inbounds: &[Inbound],
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), PanelError> {
        let Some(watcher) = &self.watcher else {
            return Ok(());
        };
        let limits = ip_limits(inbounds);
        for (email, ips) in watcher.snapshot() {
            let listed: Vec<String> = ips.iter().map(ToString::to_string).collect();
            self.repo.record_client_ips(&email, &listed).await?;

            let limit = limits.get(&email.to_ascii_lowercase()).copied().unwrap_or(0);
            let Ok(allowed) = usize::try_from(limit) else {
                continue;
            };
            if allowed == 0 || ips.len() <= allowed {
                continue;
            }
            // The lowest addresses keep access; the rest are banned.
            let excess: BTreeSet<IpAddr> = ips.into_iter().skip(allowed).collect();
            let fresh = match self.bans.ban(&email, &excess, now).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    tracing::warn!(%email, error = %e, "ban list not written");
                    excess.into_iter().collect()
                }
            };
            if fresh.is_empty() {
                continue;
            }
            tracing::info!(%email, limit, banned = fresh.len(), "ip limit exceeded");
            let _ = self.event_bus.publish(PanelEvent::IpLimitExceeded {
                email: email.clone(),
                banned: fresh.iter().map(ToString::to_string).collect(),
                timestamp: now,
            });
            report.banned.insert(email, fresh);
        }
        Ok(())
    }
}

/// Lower-cased email to the tag of the inbound that lists it.
fn email_tags(inbounds: &[Inbound]) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    for inbound in inbounds {
        let Ok(clients) = inbound.clients() else {
            continue;
        };
        let tag = inbound.effective_tag();
        for client in clients {
            tags.insert(client.email.to_ascii_lowercase(), tag.clone());
        }
    }
    tags
}

/// Lower-cased email to its IP limit, for clients with one.
fn ip_limits(inbounds: &[Inbound]) -> HashMap<String, u32> {
    inbounds
        .iter()
        .filter_map(|i| i.clients().ok())
        .flatten()
        .filter(|c| c.limit_ip > 0)
        .map(|c| (c.email.to_ascii_lowercase(), c.limit_ip))
        .collect()
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::{Duration, Instant};

    use serde_json::json;

    use super::*;
    use crate::domain::{ClientDelta, TagTraffic};
    use crate::persistence::fixtures::vless_inbound;
    use crate::service::testing::ScriptedTraffic;

    const GIB: i64 = 1024 * 1024 * 1024;

    struct Harness {
        accountant: Accountant,
        source: Arc<ScriptedTraffic>,
        repo: SqliteRepository,
        signal: RestartSignal,
        bus: EventBus,
        watcher: AccessLogWatcher,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let Ok(repo) = SqliteRepository::in_memory().await else {
            panic!("repo");
        };
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir");
        };
        let source = Arc::new(ScriptedTraffic::default());
        let signal = RestartSignal::new();
        let bus = EventBus::new(64);
        let bans = Arc::new(BanList::new(
            dir.path().join("banned.log"),
            Duration::from_secs(1_800),
        ));
        let watcher = AccessLogWatcher::new(dir.path().join("access.log"), Duration::from_secs(60));
        let accountant = Accountant::new(
            repo.clone(),
            Arc::clone(&source) as Arc<dyn TrafficSource>,
            signal.clone(),
            bus.clone(),
            bans,
            Some(watcher.clone()),
        );
        Harness {
            accountant,
            source,
            repo,
            signal,
            bus,
            watcher,
            _dir: dir,
        }
    }

    fn delta(email: &str, up: i64, down: i64) -> ClientDelta {
        ClientDelta {
            email: email.to_string(),
            up,
            down,
        }
    }

    fn inbound_with(port: u16, clients: serde_json::Value) -> Inbound {
        let mut inbound = vless_inbound(port, &[]);
        inbound.settings = json!({"clients": clients, "decryption": "none"}).to_string();
        inbound
    }

    #[tokio::test]
    async fn unavailable_stats_skip_the_tick() {
        let h = harness().await;
        let Ok(report) = h.accountant.tick(Utc::now()).await else {
            panic!("tick");
        };
        assert!(!report.sampled);
        assert_eq!(h.signal.take(), None);
    }

    #[tokio::test]
    async fn deltas_accumulate_and_counters_only_grow() {
        let h = harness().await;
        let Ok(inbound) = h.repo.add_inbound(&vless_inbound(443, &["a@x"])).await else {
            panic!("add");
        };
        for (up, down) in [(100, 200), (5, 0)] {
            h.source.push(TrafficSample {
                inbounds: vec![TagTraffic {
                    tag: inbound.tag.clone(),
                    up,
                    down,
                }],
                outbounds: vec![TagTraffic {
                    tag: "direct".to_string(),
                    up,
                    down,
                }],
                clients: vec![delta("A@x", up, down)],
                online: vec!["a@x".to_string()],
            });
            assert!(h.accountant.tick(Utc::now()).await.is_ok());
        }
        let Ok(record) = h.repo.get_client_by_email("a@x").await else {
            panic!("client");
        };
        let Some(traffic) = record.traffic else {
            panic!("traffic row");
        };
        assert_eq!((traffic.up, traffic.down), (105, 200));
        assert!(traffic.last_online > 0);

        let Ok(stored) = h.repo.get_inbound(inbound.id).await else {
            panic!("inbound");
        };
        assert_eq!((stored.up, stored.down), (105, 200));
        let Ok(outbounds) = h.repo.list_outbound_traffics().await else {
            panic!("outbounds");
        };
        assert_eq!(outbounds.first().map(|o| o.total), Some(305));
        assert_eq!(h.signal.take(), None);
    }

    #[tokio::test]
    async fn exhausted_client_is_disabled_and_restart_requested() {
        let h = harness().await;
        let mut rx = h.bus.subscribe();
        let inbound = inbound_with(
            443,
            json!([
                {"id": "u1", "email": "quota@x", "totalGB": GIB},
                {"id": "u2", "email": "free@x"}
            ]),
        );
        assert!(h.repo.add_inbound(&inbound).await.is_ok());
        h.source.push(TrafficSample {
            clients: vec![delta("quota@x", GIB / 2, GIB / 2), delta("free@x", GIB, GIB)],
            ..TrafficSample::default()
        });

        let Ok(report) = h.accountant.tick(Utc::now()).await else {
            panic!("tick");
        };
        assert_eq!(
            report.disabled_clients,
            vec![("quota@x".to_string(), DisableReason::Exhausted)]
        );
        assert!(report.restart_requested);
        assert!(h.signal.take().is_some());
        let Ok(event) = rx.try_recv() else {
            panic!("event");
        };
        assert_eq!(event.event_type_str(), "client_disabled");

        let Ok(record) = h.repo.get_client_by_email("quota@x").await else {
            panic!("client");
        };
        assert!(record.traffic.is_some_and(|t| !t.enable));
    }

    #[tokio::test]
    async fn relative_expiry_activates_on_first_traffic() {
        let h = harness().await;
        let inbound = inbound_with(443, json!([{"id": "u1", "email": "trial@x", "expiryTime": -3}]));
        assert!(h.repo.add_inbound(&inbound).await.is_ok());

        // No traffic: stays relative and enabled.
        h.source.push(TrafficSample::default());
        let now = Utc::now();
        assert!(h.accountant.tick(now).await.is_ok());
        let Ok(record) = h.repo.get_client_by_email("trial@x").await else {
            panic!("client");
        };
        assert_eq!(record.client.expiry_time, -3);

        h.source.push(TrafficSample {
            clients: vec![delta("trial@x", 1, 0)],
            ..TrafficSample::default()
        });
        assert!(h.accountant.tick(now).await.is_ok());
        let Ok(record) = h.repo.get_client_by_email("trial@x").await else {
            panic!("client");
        };
        let expected = now.timestamp_millis() + 3 * crate::domain::traffic::DAY_MS;
        assert_eq!(record.client.expiry_time, expected);
        assert!(record.traffic.is_some_and(|t| t.enable && t.expiry_time == expected));
    }

    #[tokio::test]
    async fn expired_inbound_is_disabled() {
        let h = harness().await;
        let mut inbound = vless_inbound(443, &["a@x"]);
        inbound.expiry_time = 1_000;
        let Ok(created) = h.repo.add_inbound(&inbound).await else {
            panic!("add");
        };
        h.source.push(TrafficSample::default());
        let Ok(report) = h.accountant.tick(Utc::now()).await else {
            panic!("tick");
        };
        assert_eq!(
            report.disabled_inbounds,
            vec![(created.id, DisableReason::Expired)]
        );
        assert!(h.repo.get_inbound(created.id).await.is_ok_and(|i| !i.enable));
    }

    #[tokio::test]
    async fn near_limit_is_reported_without_disabling() {
        let h = harness().await;
        let mut rx = h.bus.subscribe();
        assert!(h.repo.set_setting("trafficDiff", "1").await.is_ok());
        let inbound = inbound_with(443, json!([{"id": "u1", "email": "close@x", "totalGB": 2 * GIB}]));
        assert!(h.repo.add_inbound(&inbound).await.is_ok());
        h.source.push(TrafficSample {
            clients: vec![delta("close@x", GIB + 1, 0)],
            ..TrafficSample::default()
        });
        h.source.push(TrafficSample::default());

        let Ok(report) = h.accountant.tick(Utc::now()).await else {
            panic!("tick");
        };
        assert_eq!(report.near_limit, vec!["close@x".to_string()]);
        assert!(report.disabled_clients.is_empty());
        let Ok(event) = rx.try_recv() else {
            panic!("event");
        };
        assert_eq!(event.event_type_str(), "clients_near_limit");

        // Same set on the next tick: no repeat notification.
        assert!(h.accountant.tick(Utc::now()).await.is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ip_limit_bans_excess_addresses_once() {
        let h = harness().await;
        let inbound = inbound_with(443, json!([{"id": "u1", "email": "one@x", "limitIp": 1}]));
        assert!(h.repo.add_inbound(&inbound).await.is_ok());
        let at = Instant::now();
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            h.watcher.ingest(
                &format!("2025/01/01 00:00:00 from {ip}:5000 accepted tcp:example.com:443 [in >> direct] email: one@x"),
                at,
            );
        }

        h.source.push(TrafficSample::default());
        let Ok(report) = h.accountant.tick(Utc::now()).await else {
            panic!("tick");
        };
        let Some(banned) = report.banned.get("one@x") else {
            panic!("bans");
        };
        assert_eq!(banned.len(), 2);
        assert!(report.restart_requested);
        let Ok(ips) = h.repo.get_client_ips("one@x").await else {
            panic!("ips");
        };
        assert_eq!(ips.ips.len(), 3);

        assert!(h.signal.take().is_some());
        h.source.push(TrafficSample::default());
        let Ok(report) = h.accountant.tick(Utc::now()).await else {
            panic!("tick");
        };
        assert!(report.banned.is_empty());
        assert!(!report.restart_requested);
    }
}
