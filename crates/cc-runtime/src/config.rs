// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! Sizes come from the environment when present:
//!
//! | variable | default |
//! |---|---|
//! | `CC_WORKERS` | online CPUs, at most [`MAX_WORKERS`] |
//! | `CC_TASK_QUEUE_SIZE` | 4096 |
//! | `CC_TASK_POOL_SIZE` | 1024 |
//! | `CC_BLOCKING_WORKERS` | min(4, CPUs) |
//! | `CC_BLOCKING_QUEUE_CAP` | 256 |
//! | `CC_DEADLOCK_DETECT` | off |
//! | `CC_DEADLOCK_TIMEOUT` | 10 (seconds) |
//!
//! A variable that is unset, empty or not a whole decimal number is ignored.

use std::time::Duration;

pub const MAX_WORKERS: usize = 64;
pub const DEFAULT_TASK_QUEUE_SIZE: usize = 4096;
pub const DEFAULT_TASK_POOL_SIZE: usize = 1024;
pub const DEFAULT_BLOCKING_QUEUE_CAP: usize = 256;
pub const DEFAULT_DEADLOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Fiber worker threads.
    pub workers: usize,
    /// Capacity of the global runnable queue.
    pub task_queue_size: usize,
    /// Fiber task records allocated up front.
    pub task_pool_size: usize,
    /// Threads in the blocking pool backing `Task::blocking`.
    pub blocking_workers: usize,
    pub blocking_queue_cap: usize,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        let cpus = online_cpus();
        Self {
            workers: cpus.min(MAX_WORKERS),
            task_queue_size: DEFAULT_TASK_QUEUE_SIZE,
            task_pool_size: DEFAULT_TASK_POOL_SIZE,
            blocking_workers: cpus.min(4),
            blocking_queue_cap: DEFAULT_BLOCKING_QUEUE_CAP,
        }
    }

    /// Defaults overridden by the `CC_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let base = Self::new();
        let get = |name: &str, fallback: usize| parse_size(lookup(name).as_deref()).unwrap_or(fallback);
        Self {
            workers: get("CC_WORKERS", base.workers),
            task_queue_size: get("CC_TASK_QUEUE_SIZE", base.task_queue_size),
            task_pool_size: get("CC_TASK_POOL_SIZE", base.task_pool_size),
            blocking_workers: get("CC_BLOCKING_WORKERS", base.blocking_workers),
            blocking_queue_cap: get("CC_BLOCKING_QUEUE_CAP", base.blocking_queue_cap),
        }
        .normalized()
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self.normalized()
    }

    pub fn task_queue_size(mut self, n: usize) -> Self {
        self.task_queue_size = n;
        self.normalized()
    }

    pub fn task_pool_size(mut self, n: usize) -> Self {
        self.task_pool_size = n;
        self
    }

    pub fn blocking_workers(mut self, n: usize) -> Self {
        self.blocking_workers = n;
        self.normalized()
    }

    pub fn blocking_queue_cap(mut self, n: usize) -> Self {
        self.blocking_queue_cap = n;
        self.normalized()
    }

    /// Clamp every size into its usable range. Zero worker counts mean
    /// "default", zero queue sizes are raised to one.
    fn normalized(mut self) -> Self {
        if self.workers == 0 {
            self.workers = online_cpus();
        }
        self.workers = self.workers.min(MAX_WORKERS);
        if self.blocking_workers == 0 {
            self.blocking_workers = online_cpus().min(4);
        }
        self.task_queue_size = self.task_queue_size.max(1);
        self.blocking_queue_cap = self.blocking_queue_cap.max(1);
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Watchdog settings, read once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub timeout: Duration,
}

impl WatchdogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = matches!(lookup("CC_DEADLOCK_DETECT").as_deref(), Some("1"));
        let timeout = parse_size(lookup("CC_DEADLOCK_TIMEOUT").as_deref())
            .filter(|&s| s > 0)
            .map(|s| Duration::from_secs(s as u64))
            .unwrap_or(DEFAULT_DEADLOCK_TIMEOUT);
        Self { enabled, timeout }
    }
}

pub(crate) fn online_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_size(raw: Option<&str>) -> Option<usize> {
    let raw = raw?.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg, RuntimeConfig::new());
        assert!(cfg.workers >= 1 && cfg.workers <= MAX_WORKERS);
        assert!(cfg.blocking_workers >= 1 && cfg.blocking_workers <= 4);
        assert_eq!(cfg.task_queue_size, 4096);
        assert_eq!(cfg.task_pool_size, 1024);
        assert_eq!(cfg.blocking_queue_cap, 256);
    }

    #[test]
    fn environment_overrides() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            ("CC_WORKERS", "3"),
            ("CC_TASK_QUEUE_SIZE", "128"),
            ("CC_BLOCKING_QUEUE_CAP", " 8 "),
        ]));
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.task_queue_size, 128);
        assert_eq!(cfg.blocking_queue_cap, 8);
    }

    #[test]
    fn malformed_values_fall_back() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            ("CC_WORKERS", "4x"),
            ("CC_TASK_QUEUE_SIZE", "-1"),
            ("CC_TASK_POOL_SIZE", ""),
        ]));
        let base = RuntimeConfig::new();
        assert_eq!(cfg.workers, base.workers);
        assert_eq!(cfg.task_queue_size, base.task_queue_size);
        assert_eq!(cfg.task_pool_size, base.task_pool_size);
    }

    #[test]
    fn workers_are_capped() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[("CC_WORKERS", "1000")]));
        assert_eq!(cfg.workers, MAX_WORKERS);
        assert_eq!(RuntimeConfig::new().workers(0).workers, RuntimeConfig::new().workers);
    }

    #[test]
    fn watchdog_settings() {
        let off = WatchdogConfig::from_lookup(lookup(&[]));
        assert!(!off.enabled);
        assert_eq!(off.timeout, DEFAULT_DEADLOCK_TIMEOUT);

        let on = WatchdogConfig::from_lookup(lookup(&[
            ("CC_DEADLOCK_DETECT", "1"),
            ("CC_DEADLOCK_TIMEOUT", "3"),
        ]));
        assert!(on.enabled);
        assert_eq!(on.timeout, Duration::from_secs(3));
    }
}
