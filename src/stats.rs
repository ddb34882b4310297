//! Run-wide counters and the keyed failure/skip reason tallies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

/// Monotonic run counters, written by the dispatcher, the writer task and
/// the probers, read by the progress reporter.
#[derive(Debug, Default)]
pub struct Counters {
    pub done: AtomicU64,
    pub ok_endpoints: AtomicU64,
    pub ok_lines: AtomicU64,
    pub fail: AtomicU64,
    pub skip: AtomicU64,
    pub requests: AtomicU64,
}

impl Counters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub done: u64,
    pub ok_endpoints: u64,
    pub ok_lines: u64,
    pub fail: u64,
    pub skip: u64,
    pub requests: u64,
}

impl Summary {
    pub fn capture(c: &Counters) -> Self {
        Self {
            done: c.done.load(Ordering::Relaxed),
            ok_endpoints: c.ok_endpoints.load(Ordering::Relaxed),
            ok_lines: c.ok_lines.load(Ordering::Relaxed),
            fail: c.fail.load(Ordering::Relaxed),
            skip: c.skip.load(Ordering::Relaxed),
            requests: c.requests.load(Ordering::Relaxed),
        }
    }
}

/// String-keyed counters for failure/skip reasons. The hot path is a read
/// lock plus an atomic add; the write lock is only taken the first time a
/// key appears.
#[derive(Debug, Default)]
pub struct ReasonCounters {
    map: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl ReasonCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc(&self, key: &str) {
        if key.is_empty() {
            return;
        }
        if let Some(c) = self.map.read().get(key) {
            c.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.map
            .write()
            .entry(key.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, key: &str) -> u64 {
        self.map
            .read()
            .get(key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }

    /// `key:count` pairs, highest count first, ties by key; `-` when empty.
    pub fn top(&self, n: usize) -> String {
        let mut entries: Vec<(String, u64)> = self
            .snapshot()
            .into_iter()
            .filter(|(_, v)| *v > 0)
            .collect();
        if entries.is_empty() || n == 0 {
            return "-".into();
        }
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(n);
        entries
            .into_iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// `1h02m03s` / `4m05s` / `6s`.
pub fn format_eta(d: Duration) -> String {
    let total = d.as_secs();
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}
