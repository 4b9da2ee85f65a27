// Process-wide counters for the integration and anchoring paths, exported as JSON or Prometheus text
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub static METRICS: Lazy<SimpleMetrics> = Lazy::new(SimpleMetrics::new);

// Rolling window of commit timestamps for the anchors-per-minute rate
const COMMIT_WINDOW_SECS: u64 = 60;

pub struct SimpleMetrics {
    pub http_requests: AtomicU64,
    pub http_errors: AtomicU64,
    pub requests_created: AtomicU64,
    pub agreements_drafted: AtomicU64,
    pub commit_attempts: AtomicU64,
    pub commit_failures: AtomicU64,
    pub anchors_committed: AtomicU64,
    pub anchors_failed: AtomicU64,
    commit_timestamps: Mutex<VecDeque<u64>>,
    start_time: Instant,
}

impl Default for SimpleMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleMetrics {
    pub fn new() -> Self {
        Self {
            http_requests: AtomicU64::new(0),
            http_errors: AtomicU64::new(0),
            requests_created: AtomicU64::new(0),
            agreements_drafted: AtomicU64::new(0),
            commit_attempts: AtomicU64::new(0),
            commit_failures: AtomicU64::new(0),
            anchors_committed: AtomicU64::new(0),
            anchors_failed: AtomicU64::new(0),
            commit_timestamps: Mutex::new(VecDeque::with_capacity(1024)),
            start_time: Instant::now(),
        }
    }

    pub fn inc_http_requests(&self) {
        self.http_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_http_errors(&self) {
        self.http_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_created(&self) {
        self.requests_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_agreements_drafted(&self) {
        self.agreements_drafted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commit_attempts(&self) {
        self.commit_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commit_failures(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_anchors_failed(&self) {
        self.anchors_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a successful anchor and remember when it happened.
    pub fn inc_anchors_committed(&self) {
        self.anchors_committed.fetch_add(1, Ordering::Relaxed);

        let now_millis = now_millis();
        let mut timestamps = self.commit_timestamps.lock();
        timestamps.push_back(now_millis);

        let cutoff = now_millis.saturating_sub(COMMIT_WINDOW_SECS * 1000);
        while let Some(&front) = timestamps.front() {
            if front < cutoff {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn anchors_last_minute(&self) -> usize {
        let cutoff = now_millis().saturating_sub(COMMIT_WINDOW_SECS * 1000);
        self.commit_timestamps
            .lock()
            .iter()
            .filter(|&&ts| ts >= cutoff)
            .count()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn export_json(&self) -> serde_json::Value {
        serde_json::json!({
            "http_requests": self.http_requests.load(Ordering::Relaxed),
            "http_errors": self.http_errors.load(Ordering::Relaxed),
            "integration_requests_created": self.requests_created.load(Ordering::Relaxed),
            "agreements_drafted": self.agreements_drafted.load(Ordering::Relaxed),
            "ledger_commit_attempts": self.commit_attempts.load(Ordering::Relaxed),
            "ledger_commit_failures": self.commit_failures.load(Ordering::Relaxed),
            "anchors_committed": self.anchors_committed.load(Ordering::Relaxed),
            "anchors_failed": self.anchors_failed.load(Ordering::Relaxed),
            "anchors_last_minute": self.anchors_last_minute(),
            "uptime_secs": self.uptime_secs(),
        })
    }

    pub fn export_prometheus(&self) -> String {
        format!(
            "# HELP http_requests_total Total HTTP requests\n\
             # TYPE http_requests_total counter\n\
             http_requests_total {}\n\
             \n\
             # HELP ledger_commit_attempts_total Ledger commit attempts\n\
             # TYPE ledger_commit_attempts_total counter\n\
             ledger_commit_attempts_total {}\n\
             \n\
             # HELP ledger_commit_failures_total Failed ledger commit attempts\n\
             # TYPE ledger_commit_failures_total counter\n\
             ledger_commit_failures_total {}\n\
             \n\
             # HELP anchors_committed_total Agreements anchored\n\
             # TYPE anchors_committed_total counter\n\
             anchors_committed_total {}\n\
             \n\
             # HELP anchors_failed_total Agreements that exhausted their retries\n\
             # TYPE anchors_failed_total counter\n\
             anchors_failed_total {}\n",
            self.http_requests.load(Ordering::Relaxed),
            self.commit_attempts.load(Ordering::Relaxed),
            self.commit_failures.load(Ordering::Relaxed),
            self.anchors_committed.load(Ordering::Relaxed),
            self.anchors_failed.load(Ordering::Relaxed),
        )
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
