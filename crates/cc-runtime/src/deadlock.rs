// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Opt-in watchdog deadlock detector.
//!
//! Enabled with `CC_DEADLOCK_DETECT=1`. Threads blocked inside runtime waits
//! are counted per [`BlockReason`]; completed operations bump a progress
//! counter. A background thread reports once when threads stay blocked with
//! no progress for `CC_DEADLOCK_TIMEOUT` seconds. It only logs.
//!
//! The scheduler's own idle-time heuristic lives in `sched`.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::WatchdogConfig;
use crate::error::lock;

const CHECK_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    ChannelSend,
    ChannelRecv,
    Select,
    TaskWait,
    Sleep,
}

impl BlockReason {
    const ALL: [BlockReason; 5] = [
        BlockReason::ChannelSend,
        BlockReason::ChannelRecv,
        BlockReason::Select,
        BlockReason::TaskWait,
        BlockReason::Sleep,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlockReason::ChannelSend => "channel send",
            BlockReason::ChannelRecv => "channel recv",
            BlockReason::Select => "select",
            BlockReason::TaskWait => "task wait",
            BlockReason::Sleep => "sleep",
        }
    }
}

/// Snapshot logged when a stall is detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallReport {
    pub blocked: usize,
    pub by_reason: Vec<(BlockReason, usize)>,
    pub stalled_for: Duration,
}

/// Blocked-thread bookkeeping. One global instance backs the watchdog.
#[derive(Debug)]
pub struct Monitor {
    timeout: Duration,
    blocked: [AtomicUsize; 5],
    progress: AtomicU64,
    state: Mutex<StallState>,
}

#[derive(Debug)]
struct StallState {
    last_progress: u64,
    since: Instant,
    reported: bool,
}

impl Monitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            blocked: Default::default(),
            progress: AtomicU64::new(0),
            state: Mutex::new(StallState {
                last_progress: 0,
                since: Instant::now(),
                reported: false,
            }),
        }
    }

    pub fn enter(&self, reason: BlockReason) -> Blocked<'_> {
        self.blocked[reason.index()].fetch_add(1, Ordering::Relaxed);
        Blocked { monitor: self, reason }
    }

    pub fn progress(&self) {
        self.progress.fetch_add(1, Ordering::Relaxed);
    }

    pub fn blocked(&self) -> usize {
        self.blocked.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }

    /// Evaluate the stall condition at `now`. Returns a report the first
    /// time a stall crosses the timeout; progress re-arms it.
    pub fn check(&self, now: Instant) -> Option<StallReport> {
        let progress = self.progress.load(Ordering::Relaxed);
        let blocked = self.blocked();
        let mut st = lock(&self.state);
        if progress != st.last_progress || blocked == 0 {
            st.last_progress = progress;
            st.since = now;
            st.reported = false;
            return None;
        }
        let stalled_for = now.saturating_duration_since(st.since);
        if st.reported || stalled_for < self.timeout {
            return None;
        }
        st.reported = true;
        let by_reason = BlockReason::ALL
            .iter()
            .map(|&r| (r, self.blocked[r.index()].load(Ordering::Relaxed)))
            .filter(|&(_, n)| n > 0)
            .collect();
        Some(StallReport {
            blocked,
            by_reason,
            stalled_for,
        })
    }
}

/// Counts the calling thread as blocked until dropped.
pub struct Blocked<'a> {
    monitor: &'a Monitor,
    reason: BlockReason,
}

impl Drop for Blocked<'_> {
    fn drop(&mut self) {
        self.monitor.blocked[self.reason.index()].fetch_sub(1, Ordering::Relaxed);
    }
}

static GLOBAL: OnceLock<Option<Arc<Monitor>>> = OnceLock::new();
static STARTED: AtomicBool = AtomicBool::new(false);

fn global() -> Option<&'static Arc<Monitor>> {
    let monitor = GLOBAL
        .get_or_init(|| {
            let cfg = WatchdogConfig::from_env();
            cfg.enabled.then(|| Arc::new(Monitor::new(cfg.timeout)))
        })
        .as_ref()?;
    start_watchdog(monitor);
    Some(monitor)
}

fn start_watchdog(monitor: &Arc<Monitor>) {
    if STARTED.swap(true, Ordering::AcqRel) {
        return;
    }
    let monitor = monitor.clone();
    let spawned = thread::Builder::new()
        .name("cc-deadlock-watchdog".to_string())
        .spawn(move || loop {
            thread::sleep(CHECK_INTERVAL);
            if let Some(report) = monitor.check(Instant::now()) {
                let reasons: Vec<String> = report
                    .by_reason
                    .iter()
                    .map(|(r, n)| format!("{}={}", r.as_str(), n))
                    .collect();
                warn!(
                    blocked = report.blocked,
                    stalled_ms = report.stalled_for.as_millis() as u64,
                    reasons = %reasons.join(", "),
                    "possible deadlock: blocked threads made no progress"
                );
            }
        });
    if let Err(e) = spawned {
        warn!("failed to start deadlock watchdog: {}", e);
    }
}

/// Mark the calling thread blocked for `reason` when the watchdog is on.
pub(crate) fn enter(reason: BlockReason) -> Option<Blocked<'static>> {
    global().map(|m| m.enter(reason))
}

/// Record that some blocking operation completed.
pub(crate) fn progress() {
    if let Some(m) = global() {
        m.progress();
    }
}
