use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Receives one observation per completed check.
pub trait CounterSink: Send + Sync {
    fn observe(&self, success: bool, elapsed: Duration);
}

/// Process-wide check counters. Updated lock-free by every completed check and
/// periodically drained by the reporter.
#[derive(Debug, Default)]
pub struct ProbeCounters {
    up: AtomicU64,
    down: AtomicU64,
    check_time_ms: AtomicU64,
}

/// Counter values taken by [`ProbeCounters::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub up: u64,
    pub down: u64,
    pub check_time: Duration,
}

impl CounterSnapshot {
    pub fn checks(&self) -> u64 {
        self.up + self.down
    }

    /// Mean check time in whole milliseconds, zero when nothing was checked.
    pub fn average_ms(&self) -> u64 {
        match self.checks() {
            0 => 0,
            n => self.check_time.as_millis() as u64 / n,
        }
    }
}

impl ProbeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read and reset all counters.
    pub fn drain(&self) -> CounterSnapshot {
        CounterSnapshot {
            up: self.up.swap(0, Ordering::Relaxed),
            down: self.down.swap(0, Ordering::Relaxed),
            check_time: Duration::from_millis(self.check_time_ms.swap(0, Ordering::Relaxed)),
        }
    }
}

impl CounterSink for ProbeCounters {
    fn observe(&self, success: bool, elapsed: Duration) {
        if success {
            self.up.fetch_add(1, Ordering::Relaxed);
        } else {
            self.down.fetch_add(1, Ordering::Relaxed);
        }
        self.check_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }
}

/// How often counters are reported for the given `APP_ENV`.
pub fn report_interval(app_env: &str) -> Duration {
    if app_env.eq_ignore_ascii_case("development") {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    }
}

/// Spawn the loop that drains `counters` every `interval` and logs the totals.
pub fn spawn_reporter(counters: Arc<ProbeCounters>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snapshot = counters.drain();
            let tasks = tokio::runtime::Handle::current()
                .metrics()
                .num_alive_tasks();
            log::info!(
                "metrics checks={} up={} down={} avg={}ms tasks={}",
                snapshot.checks(),
                snapshot.up,
                snapshot.down,
                snapshot.average_ms(),
                tasks
            );
        }
    })
}
