//! Access log tailing for IP-limit enforcement.
//!
//! Xray writes one line per accepted connection:
//!
//! ```text
//! 2024/05/01 10:00:00 from 203.0.113.7:51234 accepted tcp:example.com:443 [inbound-443 >> direct] email: alice
//! ```
//!
//! [`AccessLogWatcher`] follows the file and keeps, per email, the source
//! IPs seen within a rolling window.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::SeekFrom;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Sightings kept per email before the oldest are dropped.
const MAX_SIGHTINGS_PER_EMAIL: usize = 256;

/// Pause between polls once the tail reaches end of file.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One parsed access log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    /// Source address of the connection.
    pub ip: IpAddr,
    /// Client email Xray attributed the connection to.
    pub email: String,
}

/// Parses one access log line. Lines without `email:`, with an unparsable
/// source, or from loopback return `None`.
#[must_use]
pub fn parse_line(line: &str) -> Option<AccessRecord> {
    let (_, after_from) = line.split_once(" from ")?;
    let source = after_from.split_whitespace().next()?;
    let source = source
        .strip_prefix("tcp:")
        .or_else(|| source.strip_prefix("udp:"))
        .unwrap_or(source);
    let host = if let Some(v6) = source.strip_prefix('[') {
        v6.split_once(']')?.0
    } else {
        source.rsplit_once(':').map_or(source, |(h, _)| h)
    };
    let ip: IpAddr = host.parse().ok()?;
    if ip.is_loopback() {
        return None;
    }

    let (_, after_email) = line.split_once("email:")?;
    let email = after_email.split_whitespace().next()?.trim_end_matches(']');
    if email.is_empty() {
        return None;
    }
    Some(AccessRecord {
        ip,
        email: email.to_string(),
    })
}

/// Per-email rolling window of source IPs.
#[derive(Debug)]
pub struct IpWindow {
    window: Duration,
    sightings: HashMap<String, VecDeque<(Instant, IpAddr)>>,
}

impl IpWindow {
    /// Creates an empty window of the given length.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            sightings: HashMap::new(),
        }
    }

    /// Records that `record.email` connected from `record.ip` at `at`.
    pub fn record(&mut self, record: AccessRecord, at: Instant) {
        let ring = self.sightings.entry(record.email).or_default();
        if ring.len() == MAX_SIGHTINGS_PER_EMAIL {
            ring.pop_front();
        }
        ring.push_back((at, record.ip));
    }

    /// Drops sightings older than the window.
    pub fn evict(&mut self, now: Instant) {
        let window = self.window;
        self.sightings.retain(|_, ring| {
            while ring
                .front()
                .is_some_and(|(at, _)| now.saturating_duration_since(*at) > window)
            {
                ring.pop_front();
            }
            !ring.is_empty()
        });
    }

    /// Distinct IPs of `email` within the window.
    #[must_use]
    pub fn observed_ips(&self, email: &str, now: Instant) -> BTreeSet<IpAddr> {
        self.sightings
            .get(email)
            .map(|ring| self.live(ring, now))
            .unwrap_or_default()
    }

    /// Distinct IPs of every email within the window.
    #[must_use]
    pub fn snapshot(&self, now: Instant) -> BTreeMap<String, BTreeSet<IpAddr>> {
        self.sightings
            .iter()
            .map(|(email, ring)| (email.clone(), self.live(ring, now)))
            .filter(|(_, ips)| !ips.is_empty())
            .collect()
    }

    fn live(&self, ring: &VecDeque<(Instant, IpAddr)>, now: Instant) -> BTreeSet<IpAddr> {
        ring.iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= self.window)
            .map(|(_, ip)| *ip)
            .collect()
    }
}

/// Follows a log file across truncation and rotation.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    pos: u64,
    identity: Option<u64>,
    from_start: bool,
}

impl LogTail {
    /// Tail that starts at the current end of `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reader: None,
            pos: 0,
            identity: None,
            from_start: false,
        }
    }

    /// Next complete line, or `None` when no new data is available.
    pub async fn next_line(&mut self) -> Option<String> {
        if self.reader.is_none() {
            self.open().await;
        }
        let reader = self.reader.as_mut()?;
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                self.check_replaced().await;
                None
            }
            Ok(n) if !line.ends_with('\n') => {
                // Partial line; rewind so the rest is read with it next time.
                if reader.seek(SeekFrom::Start(self.pos)).await.is_err() {
                    self.reader = None;
                }
                tracing::trace!(bytes = n, "partial access log line");
                None
            }
            Ok(n) => {
                self.pos = self.pos.saturating_add(n as u64);
                Some(line.trim_end().to_string())
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "access log read failed; reopening");
                self.reader = None;
                self.from_start = false;
                None
            }
        }
    }

    async fn open(&mut self) {
        let Ok(mut file) = File::open(&self.path).await else {
            return;
        };
        let start = if self.from_start {
            SeekFrom::Start(0)
        } else {
            SeekFrom::End(0)
        };
        let Ok(pos) = file.seek(start).await else {
            return;
        };
        self.identity = identity(&file).await;
        self.pos = pos;
        self.reader = Some(BufReader::new(file));
    }

    /// Reopens from the start when the file shrank or was replaced.
    async fn check_replaced(&mut self) {
        let Ok(meta) = tokio::fs::metadata(&self.path).await else {
            return;
        };
        let replaced = file_identity(&meta).is_some_and(|id| Some(id) != self.identity);
        if meta.len() < self.pos || replaced {
            tracing::debug!(path = %self.path.display(), "access log truncated or rotated");
            self.reader = None;
            self.from_start = true;
        }
    }
}

async fn identity(file: &File) -> Option<u64> {
    file.metadata().await.ok().as_ref().and_then(file_identity)
}

#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_identity(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

/// Tails the Xray access log and publishes per-email IP sets.
#[derive(Debug, Clone)]
pub struct AccessLogWatcher {
    path: PathBuf,
    window: Arc<Mutex<IpWindow>>,
}

impl AccessLogWatcher {
    /// Creates a watcher over `path` with a rolling `window`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, window: Duration) -> Self {
        Self {
            path: path.into(),
            window: Arc::new(Mutex::new(IpWindow::new(window))),
        }
    }

    /// File being followed.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IpWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feeds one raw line; unparsable lines are skipped.
    pub fn ingest(&self, line: &str, at: Instant) {
        if let Some(record) = parse_line(line) {
            self.lock().record(record, at);
        }
    }

    /// Distinct IPs of `email` within the window.
    #[must_use]
    pub fn observed_ips(&self, email: &str) -> BTreeSet<IpAddr> {
        self.lock().observed_ips(email, Instant::now())
    }

    /// Distinct IPs of every active email within the window.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, BTreeSet<IpAddr>> {
        let now = Instant::now();
        let mut window = self.lock();
        window.evict(now);
        window.snapshot(now)
    }

    /// Follows the log until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(path = %self.path.display(), "access log watcher started");
        let mut tail = LogTail::new(&self.path);
        loop {
            while let Some(line) = tail.next_line().await {
                self.ingest(&line, Instant::now());
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
        tracing::info!("access log watcher stopped");
    }
}
