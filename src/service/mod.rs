//! Service layer: the background jobs and the operations handlers call.
//!
//! [`Reconciler`] owns Xray restarts, [`Accountant`] folds stats ticks into
//! the repository and enforces limits, [`InboundService`] and
//! [`DatabaseService`] back the HTTP surface, and [`Scheduler`] drives the
//! periodic jobs.

pub mod accounting;
pub mod database_service;
pub mod inbound_service;
pub mod reconciler;
pub mod scheduler;

pub use accounting::{Accountant, TickReport};
pub use database_service::DatabaseService;
pub use inbound_service::InboundService;
pub use reconciler::Reconciler;
pub use scheduler::{Intervals, Scheduler};

#[cfg(test)]
pub(crate) mod testing {
    //! In-process stand-ins for Xray and its stats API.

    use std::collections::VecDeque;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    use async_trait::async_trait;

    use crate::domain::TrafficSample;
    use crate::error::PanelError;
    use crate::xray::{TrafficSource, XrayConfig, XrayControl, XrayState, XrayStatus};

    #[derive(Debug, Default)]
    pub(crate) struct FakeState {
        pub running: bool,
        pub manual: bool,
        pub failing: bool,
        pub fail_start: bool,
        pub starts: usize,
        pub stops: usize,
        pub config: Option<XrayConfig>,
        pub error: Option<String>,
        pub online: Vec<String>,
    }

    /// Supervisor that only records what it was asked to do.
    #[derive(Debug, Default)]
    pub(crate) struct FakeXray {
        state: Mutex<FakeState>,
    }

    impl FakeXray {
        pub(crate) fn state(&self) -> MutexGuard<'_, FakeState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub(crate) fn crash(&self, error: &str) {
            let mut state = self.state();
            state.running = false;
            state.failing = true;
            state.config = None;
            state.error = Some(error.to_string());
        }
    }

    #[async_trait]
    impl XrayControl for FakeXray {
        async fn start(&self, config: XrayConfig) -> Result<(), PanelError> {
            let mut state = self.state();
            state.starts += 1;
            state.manual = false;
            if state.fail_start {
                state.error = Some("no such file".to_string());
                return Err(PanelError::SpawnFailed("no such file".to_string()));
            }
            state.running = true;
            state.failing = false;
            state.config = Some(config);
            Ok(())
        }

        async fn stop(&self) -> Result<(), PanelError> {
            let mut state = self.state();
            state.manual = true;
            if !state.running {
                return Err(PanelError::NotRunning);
            }
            state.stops += 1;
            state.running = false;
            state.config = None;
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.state().running
        }

        fn is_crashed(&self) -> bool {
            let state = self.state();
            !state.running && !state.manual
        }

        fn acknowledge_crash(&self) -> bool {
            std::mem::take(&mut self.state().failing)
        }

        fn running_config(&self) -> Option<XrayConfig> {
            self.state().config.clone()
        }

        fn api_port(&self) -> Option<u16> {
            self.state().running.then_some(62_789)
        }

        fn status(&self) -> XrayStatus {
            let state = self.state();
            XrayStatus {
                state: if state.running {
                    XrayState::Running
                } else if state.failing {
                    XrayState::Failing
                } else {
                    XrayState::Stopped
                },
                error_msg: state.error.clone(),
                version: Some("25.1.1".to_string()),
                uptime_secs: 0,
                api_port: state.running.then_some(62_789),
            }
        }

        fn result(&self) -> String {
            self.state().error.clone().unwrap_or_default()
        }

        fn online_clients(&self) -> Vec<String> {
            self.state().online.clone()
        }

        fn set_online_clients(&self, emails: Vec<String>) {
            self.state().online = emails;
        }
    }

    /// Stats source replaying queued samples; empty queue means Xray is down.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedTraffic {
        samples: Mutex<VecDeque<TrafficSample>>,
    }

    impl ScriptedTraffic {
        pub(crate) fn push(&self, sample: TrafficSample) {
            self.samples
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(sample);
        }
    }

    #[async_trait]
    impl TrafficSource for ScriptedTraffic {
        async fn get_traffic(&self, _reset: bool) -> Result<TrafficSample, PanelError> {
            self.samples
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .ok_or_else(|| PanelError::Unavailable("xray is not running".to_string()))
        }
    }
}
