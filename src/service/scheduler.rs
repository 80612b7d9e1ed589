//! Periodic jobs: crash probe, reconcile, accounting and the log tail.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{Accountant, Reconciler};
use crate::config::PanelConfig;
use crate::xray::AccessLogWatcher;

/// Job periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    /// Accounting period.
    pub stats: Duration,
    /// Delay before the first accounting tick.
    pub stats_initial_delay: Duration,
    /// Reconcile period.
    pub reconcile: Duration,
    /// Crash probe period.
    pub crash_probe: Duration,
}

impl Intervals {
    /// Periods from the panel configuration.
    #[must_use]
    pub const fn from_config(config: &PanelConfig) -> Self {
        Self {
            stats: config.stats_interval(),
            stats_initial_delay: config.stats_initial_delay(),
            reconcile: config.reconcile_interval(),
            crash_probe: config.crash_probe_interval(),
        }
    }
}

/// Running background jobs.
#[derive(Debug)]
pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl Scheduler {
    /// Spawns every job. Each job runs to completion before its next tick,
    /// so ticks of the same job never overlap.
    #[must_use]
    pub fn start(
        intervals: Intervals,
        reconciler: Arc<Reconciler>,
        accountant: Arc<Accountant>,
        watcher: Option<AccessLogWatcher>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let probe = Arc::clone(&reconciler);
        tasks.spawn(every(
            "crash-probe",
            intervals.crash_probe,
            intervals.crash_probe,
            cancel.clone(),
            move || {
                let probe = Arc::clone(&probe);
                async move {
                    probe.probe_crash();
                }
            },
        ));

        let reconcile = Arc::clone(&reconciler);
        tasks.spawn(every(
            "reconcile",
            intervals.reconcile,
            intervals.reconcile,
            cancel.clone(),
            move || {
                let reconcile = Arc::clone(&reconcile);
                async move {
                    if let Err(e) = reconcile.tick().await {
                        tracing::warn!(error = %e, "reconcile cycle failed");
                    }
                }
            },
        ));

        tasks.spawn(every(
            "accounting",
            intervals.stats_initial_delay,
            intervals.stats,
            cancel.clone(),
            move || {
                let accountant = Arc::clone(&accountant);
                async move {
                    match accountant.tick(Utc::now()).await {
                        Ok(report) if report.restart_requested => {
                            tracing::debug!(
                                disabled = report.disabled_clients.len(),
                                banned = report.banned.len(),
                                "accounting requested a restart"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "accounting tick failed"),
                    }
                }
            },
        ));

        if let Some(watcher) = watcher {
            tasks.spawn(watcher.run(cancel.clone()));
        }

        tracing::info!(jobs = tasks.len(), "scheduler started");
        Self {
            reconciler,
            cancel,
            tasks,
        }
    }

    /// Stops every job, waits for them and stops Xray.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "scheduler job ended abnormally");
            }
        }
        self.reconciler.shutdown().await;
        tracing::info!("scheduler stopped");
    }
}

async fn every<F, Fut>(
    name: &'static str,
    initial_delay: Duration,
    period: Duration,
    cancel: CancellationToken,
    mut job: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let period = period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + initial_delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => job().await,
        }
    }
    tracing::debug!(job = name, "job stopped");
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{EventBus, RestartSignal};
    use crate::persistence::SqliteRepository;
    use crate::service::testing::{FakeXray, ScriptedTraffic};
    use crate::xray::{BanList, TrafficSource, XrayControl};

    #[tokio::test]
    async fn crashed_xray_is_restarted_and_shutdown_stops_it() {
        let Ok(repo) = SqliteRepository::in_memory().await else {
            panic!("repo");
        };
        let fake = Arc::new(FakeXray::default());
        let signal = RestartSignal::new();
        let bus = EventBus::new(16);
        let bans = Arc::new(BanList::new(
            std::env::temp_dir().join(format!("banned-{}.log", uuid::Uuid::new_v4())),
            Duration::from_secs(60),
        ));
        let reconciler = Arc::new(Reconciler::new(
            repo.clone(),
            Arc::clone(&fake) as Arc<dyn XrayControl>,
            signal.clone(),
            bus.clone(),
            Arc::clone(&bans),
        ));
        let accountant = Arc::new(Accountant::new(
            repo,
            Arc::new(ScriptedTraffic::default()) as Arc<dyn TrafficSource>,
            signal,
            bus,
            bans,
            None,
        ));
        let intervals = Intervals {
            stats: Duration::from_millis(20),
            stats_initial_delay: Duration::from_millis(5),
            reconcile: Duration::from_millis(20),
            crash_probe: Duration::from_millis(10),
        };

        // Never started and never stopped on purpose counts as crashed.
        let scheduler = Scheduler::start(intervals, reconciler, accountant, None);
        let mut waited = Duration::ZERO;
        while !fake.state().running && waited < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        assert!(fake.state().running);

        scheduler.shutdown().await;
        let state = fake.state();
        assert!(!state.running);
        assert!(state.manual);
    }
}
