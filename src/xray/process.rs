//! Supervision of the single Xray child process.
//!
//! [`XraySupervisor`] owns the child handle. A monitor task awaits the
//! child's exit and records whether it was requested ([`XraySupervisor::stop`])
//! or unexpected, in which case the supervisor moves to
//! [`XrayState::Failing`] until the reconciler acknowledges the crash.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use utoipa::ToSchema;

use super::config::XrayConfig;
use crate::config::PanelConfig;
use crate::error::PanelError;

/// Lines of child output kept for [`XrayControl::result`].
const OUTPUT_TAIL_LINES: usize = 50;

/// Interval between API port probes while starting.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle state of the Xray child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum XrayState {
    /// No child process.
    Stopped,
    /// Spawned, API not reachable yet.
    Starting,
    /// API reachable.
    Running,
    /// Exited without being asked to.
    Failing,
}

/// Snapshot published by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct XrayStatus {
    /// Lifecycle state.
    pub state: XrayState,
    /// Last start or crash error.
    pub error_msg: Option<String>,
    /// Xray version, once known.
    pub version: Option<String>,
    /// Seconds since the child reached `running`.
    pub uptime_secs: u64,
    /// Loopback port of the stats API.
    pub api_port: Option<u16>,
}

/// Operations the reconciler and stats client need from the supervisor.
#[async_trait]
pub trait XrayControl: Send + Sync + std::fmt::Debug {
    /// Starts Xray with `config`, splicing in a freshly chosen API port.
    ///
    /// # Errors
    ///
    /// [`PanelError::AlreadyRunning`], [`PanelError::SpawnFailed`],
    /// [`PanelError::Timeout`] or [`PanelError::Io`] when writing the config.
    async fn start(&self, config: XrayConfig) -> Result<(), PanelError>;

    /// Stops Xray and marks the stop as requested.
    ///
    /// # Errors
    ///
    /// [`PanelError::NotRunning`] when there is no child.
    async fn stop(&self) -> Result<(), PanelError>;

    /// Whether the child is alive.
    fn is_running(&self) -> bool;

    /// `¬running ∧ ¬manually-stopped`.
    fn is_crashed(&self) -> bool;

    /// Moves `Failing` to `Stopped`. Returns whether a crash was pending.
    fn acknowledge_crash(&self) -> bool;

    /// The config the running child was started with, before the API port
    /// was spliced in.
    fn running_config(&self) -> Option<XrayConfig>;

    /// Loopback port of the stats API while running.
    fn api_port(&self) -> Option<u16>;

    /// Current status snapshot.
    fn status(&self) -> XrayStatus;

    /// Tail of the child's stdout/stderr.
    fn result(&self) -> String;

    /// Emails Xray reported online at the last stats tick.
    fn online_clients(&self) -> Vec<String>;

    /// Records the online set from a stats tick.
    fn set_online_clients(&self, emails: Vec<String>);
}

#[derive(Debug, Default)]
struct Runtime {
    state: Option<XrayState>,
    started_at: Option<Instant>,
    api_port: Option<u16>,
    config: Option<XrayConfig>,
    error: Option<String>,
    version: Option<String>,
    online: Vec<String>,
}

#[derive(Debug, Default)]
struct Shared {
    runtime: Mutex<Runtime>,
    output: Mutex<VecDeque<String>>,
    manually_stopped: AtomicBool,
}

impl Shared {
    fn runtime(&self) -> std::sync::MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_output(&self, line: String) {
        let mut tail = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.len() == OUTPUT_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    fn output_tail(&self) -> String {
        let tail = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    fn on_exit(&self, outcome: std::io::Result<std::process::ExitStatus>) {
        let mut rt = self.runtime();
        rt.started_at = None;
        rt.api_port = None;
        rt.online.clear();
        if self.manually_stopped.load(Ordering::SeqCst) {
            rt.state = Some(XrayState::Stopped);
            tracing::info!("xray stopped");
            return;
        }
        let reason = match outcome {
            Ok(status) => format!("xray exited unexpectedly: {status}"),
            Err(e) => format!("xray wait failed: {e}"),
        };
        tracing::warn!(error = %reason, "xray crashed");
        rt.error = Some(reason);
        rt.state = Some(XrayState::Failing);
    }
}

#[derive(Debug)]
struct ChildHandle {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
}

/// Owns the Xray child process.
#[derive(Debug)]
pub struct XraySupervisor {
    binary: PathBuf,
    config_path: PathBuf,
    start_timeout: Duration,
    stop_grace: Duration,
    shared: Arc<Shared>,
    child: tokio::sync::Mutex<Option<ChildHandle>>,
}

impl XraySupervisor {
    /// Creates a supervisor for the binary and config path in `config`.
    #[must_use]
    pub fn new(config: &PanelConfig) -> Self {
        Self::with_paths(
            config.xray_binary_path(),
            config.xray_config_path(),
            config.xray_start_timeout(),
            config.xray_stop_grace(),
        )
    }

    /// Creates a supervisor with explicit paths and timeouts.
    #[must_use]
    pub fn with_paths(
        binary: PathBuf,
        config_path: PathBuf,
        start_timeout: Duration,
        stop_grace: Duration,
    ) -> Self {
        Self {
            binary,
            config_path,
            start_timeout,
            stop_grace,
            shared: Arc::new(Shared::default()),
            child: tokio::sync::Mutex::new(None),
        }
    }

    /// Path the config is written to before each start.
    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Runs `xray -version` and caches the version string.
    ///
    /// # Errors
    ///
    /// Returns [`PanelError::SpawnFailed`] if the binary cannot be run or
    /// prints nothing recognisable.
    pub async fn get_version(&self) -> Result<String, PanelError> {
        if let Some(version) = self.shared.runtime().version.clone() {
            return Ok(version);
        }
        let output = Command::new(&self.binary)
            .arg("-version")
            .output()
            .await
            .map_err(|e| PanelError::SpawnFailed(format!("{}: {e}", self.binary.display())))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = parse_version(&stdout)
            .ok_or_else(|| PanelError::SpawnFailed("unrecognised -version output".to_string()))?;
        self.shared.runtime().version = Some(version.clone());
        Ok(version)
    }

    async fn write_config(&self, config: &XrayConfig) -> Result<(), PanelError> {
        if let Some(dir) = self.config_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&self.config_path, config.to_pretty_json()?).await?;
        Ok(())
    }

    async fn wait_for_api(&self, port: u16, handle: &ChildHandle) -> Result<(), PanelError> {
        let deadline = Instant::now() + self.start_timeout;
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        loop {
            if handle.monitor.is_finished() {
                return Err(PanelError::SpawnFailed(format!(
                    "xray exited during start: {}",
                    self.shared.output_tail()
                )));
            }
            if tokio::net::TcpStream::connect(addr).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PanelError::Timeout(format!(
                    "xray api not reachable on port {port} after {}s",
                    self.start_timeout.as_secs()
                )));
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }

    async fn terminate(&self, mut handle: ChildHandle) {
        if let Some(pid) = handle.pid {
            send_terminate(pid);
        }
        if tokio::time::timeout(self.stop_grace, &mut handle.monitor)
            .await
            .is_ok()
        {
            return;
        }
        tracing::warn!(grace_secs = self.stop_grace.as_secs(), "xray ignored terminate; killing");
        if let Some(kill) = handle.kill.take() {
            let _ = kill.send(());
        }
        let _ = handle.monitor.await;
    }
}

#[async_trait]
impl XrayControl for XraySupervisor {
    async fn start(&self, config: XrayConfig) -> Result<(), PanelError> {
        let mut slot = self.child.lock().await;
        if slot.as_ref().is_some_and(|h| !h.monitor.is_finished()) {
            return Err(PanelError::AlreadyRunning);
        }
        *slot = None;

        let port = free_loopback_port()?;
        let mut on_disk = config.clone();
        on_disk.set_api_port(port);
        self.write_config(&on_disk).await?;

        self.shared.manually_stopped.store(false, Ordering::SeqCst);
        {
            let mut rt = self.shared.runtime();
            rt.state = Some(XrayState::Starting);
            rt.error = None;
        }

        let spawned = Command::new(&self.binary)
            .arg("-c")
            .arg(&self.config_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let msg = format!("{}: {e}", self.binary.display());
                let mut rt = self.shared.runtime();
                rt.state = Some(XrayState::Stopped);
                rt.error = Some(msg.clone());
                return Err(PanelError::SpawnFailed(msg));
            }
        };
        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            capture_output(stdout, Arc::clone(&self.shared));
        }
        if let Some(stderr) = child.stderr.take() {
            capture_output(stderr, Arc::clone(&self.shared));
        }
        let (kill_tx, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor_child(child, kill_rx, Arc::clone(&self.shared)));
        let handle = ChildHandle {
            pid,
            kill: Some(kill_tx),
            monitor,
        };

        if let Err(e) = self.wait_for_api(port, &handle).await {
            self.shared.manually_stopped.store(true, Ordering::SeqCst);
            self.terminate(handle).await;
            // A failed start is not a manual stop; the crash probe keeps retrying.
            self.shared.manually_stopped.store(false, Ordering::SeqCst);
            let mut rt = self.shared.runtime();
            rt.state = Some(XrayState::Stopped);
            rt.error = Some(e.to_string());
            return Err(e);
        }

        {
            let mut rt = self.shared.runtime();
            rt.state = Some(XrayState::Running);
            rt.started_at = Some(Instant::now());
            rt.api_port = Some(port);
            rt.config = Some(config);
        }
        *slot = Some(handle);
        drop(slot);

        if let Err(e) = self.get_version().await {
            tracing::debug!(error = %e, "could not read xray version");
        }
        tracing::info!(pid, api_port = port, "xray running");
        Ok(())
    }

    async fn stop(&self) -> Result<(), PanelError> {
        self.shared.manually_stopped.store(true, Ordering::SeqCst);
        let handle = self.child.lock().await.take();
        let Some(handle) = handle.filter(|h| !h.monitor.is_finished()) else {
            let mut rt = self.shared.runtime();
            rt.state = Some(XrayState::Stopped);
            rt.config = None;
            return Err(PanelError::NotRunning);
        };
        self.terminate(handle).await;
        let mut rt = self.shared.runtime();
        rt.state = Some(XrayState::Stopped);
        rt.config = None;
        Ok(())
    }

    fn is_running(&self) -> bool {
        matches!(
            self.shared.runtime().state,
            Some(XrayState::Running | XrayState::Starting)
        )
    }

    fn is_crashed(&self) -> bool {
        !self.is_running() && !self.shared.manually_stopped.load(Ordering::SeqCst)
    }

    fn acknowledge_crash(&self) -> bool {
        let mut rt = self.shared.runtime();
        if rt.state == Some(XrayState::Failing) {
            rt.state = Some(XrayState::Stopped);
            rt.config = None;
            true
        } else {
            false
        }
    }

    fn running_config(&self) -> Option<XrayConfig> {
        let rt = self.shared.runtime();
        match rt.state {
            Some(XrayState::Running) => rt.config.clone(),
            _ => None,
        }
    }

    fn api_port(&self) -> Option<u16> {
        self.shared.runtime().api_port
    }

    fn status(&self) -> XrayStatus {
        let rt = self.shared.runtime();
        XrayStatus {
            state: rt.state.unwrap_or(XrayState::Stopped),
            error_msg: rt.error.clone(),
            version: rt.version.clone(),
            uptime_secs: rt.started_at.map_or(0, |t| t.elapsed().as_secs()),
            api_port: rt.api_port,
        }
    }

    fn result(&self) -> String {
        self.shared.output_tail()
    }

    fn online_clients(&self) -> Vec<String> {
        self.shared.runtime().online.clone()
    }

    fn set_online_clients(&self, emails: Vec<String>) {
        self.shared.runtime().online = emails;
    }
}

async fn monitor_child(mut child: Child, kill: oneshot::Receiver<()>, shared: Arc<Shared>) {
    let outcome = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(error = %e, "failed to kill xray");
            }
            child.wait().await
        }
    };
    shared.on_exit(outcome);
}

fn capture_output<R>(stream: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            shared.push_output(line);
        }
    });
}

/// Asks the child to exit cleanly with `SIGTERM`.
#[cfg(unix)]
fn send_terminate(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        tracing::warn!(pid, "pid out of range; skipping SIGTERM");
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "SIGTERM not delivered");
    }
}

/// No graceful signal off unix; the grace period ends in a hard kill.
#[cfg(not(unix))]
fn send_terminate(pid: u32) {
    tracing::debug!(pid, "graceful terminate unsupported on this platform");
}

/// Picks an unused loopback TCP port by binding port 0.
fn free_loopback_port() -> Result<u16, PanelError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Extracts `1.8.24` from `Xray 1.8.24 (Xray, Penetrates Everything.) ...`.
fn parse_version(output: &str) -> Option<String> {
    let first = output.lines().next()?;
    let mut words = first.split_whitespace();
    let name = words.next()?;
    let version = words.next()?;
    (name.eq_ignore_ascii_case("xray") && version.chars().next()?.is_ascii_digit())
        .then(|| version.to_string())
}
