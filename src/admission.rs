//! Dynamic admission control. A single background sampler reads RSS and the
//! open-descriptor count every 200 ms and adjusts a concurrency ceiling
//! plus a pause flag; workers only load the atomics and fetch-add the
//! active counter, so the hot path stays lock-free.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::platform;

pub const TICK: Duration = Duration::from_millis(200);

/// Shared snapshot observed by workers before each probe.
#[derive(Debug)]
pub struct AdmissionState {
    pub limit: AtomicI64,
    pub paused: AtomicBool,
    pub active: AtomicU64,
}

impl AdmissionState {
    pub fn new(initial_limit: i64) -> Arc<Self> {
        Arc::new(Self {
            limit: AtomicI64::new(initial_limit),
            paused: AtomicBool::new(false),
            active: AtomicU64::new(0),
        })
    }

    pub fn limit(&self) -> i64 {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Pressure-response policy. Kept free of clocks and atomics so the
/// threshold table can be driven directly in tests.
#[derive(Debug)]
pub struct Controller {
    hard_cap: i64,
    min_limit: i64,
    step_up: i64,
    mem_cap: i64,
    fd_cap: i64,
    fd_warn: i64,
    fd_hard: i64,
    fd_resume: i64,
    cur: i64,
    paused: bool,
}

impl Controller {
    pub fn new(hard_cap: i64, mem_cap: Option<i64>, fd_cap: u64) -> Self {
        let hard_cap = hard_cap.max(1);
        let fd_cap = if fd_cap == 0 { 100_000 } else { fd_cap } as i64;
        let fd_warn = (fd_cap as f64 * 0.35) as i64;
        let fd_hard = (fd_cap as f64 * 0.45) as i64;
        let fd_resume = (fd_warn * 8 / 10).max(4_000);
        Self {
            hard_cap,
            min_limit: (hard_cap / 10).max(64).min(hard_cap),
            step_up: (hard_cap / 80).max(8),
            // Unknown memory cap: treat as effectively infinite so only the
            // descriptor rules fire.
            mem_cap: mem_cap.filter(|v| *v > 0).unwrap_or(i64::MAX),
            fd_cap,
            fd_warn,
            fd_hard,
            fd_resume,
            cur: hard_cap,
            paused: false,
        }
    }

    pub fn limit(&self) -> i64 {
        self.cur
    }

    /// Apply one sample. The most severe matching row wins; recovery below
    /// all thresholds steps the limit back up toward the configured cap.
    pub fn tick(&mut self, rss: i64, fd_count: i64) -> (i64, bool) {
        let mem_ratio = rss.max(0) as f64 / self.mem_cap as f64;
        let fd_ratio = fd_count.max(0) as f64 / self.fd_cap as f64;

        let mut want_pause = false;
        if fd_count > self.fd_hard {
            self.cur = self.min_limit;
            want_pause = true;
        } else if fd_count > self.fd_warn {
            self.cur = (self.cur * 8 / 10).max(self.min_limit);
        } else if mem_ratio > 0.88 || fd_ratio > 0.85 {
            self.cur = (self.cur * 7 / 10).max(self.min_limit);
            want_pause = true;
        } else if mem_ratio > 0.80 || fd_ratio > 0.80 {
            self.cur = (self.cur * 8 / 10).max(self.min_limit);
        } else if mem_ratio > 0.70 || fd_ratio > 0.70 {
            self.cur = (self.cur * 9 / 10).max(self.min_limit);
        } else if mem_ratio > 0.60 || fd_ratio > 0.60 {
            // Hold.
        } else {
            self.cur = (self.cur + self.step_up).min(self.hard_cap);
        }

        if self.paused {
            // Clearing a pause needs a clear drop, not just dipping under
            // the trigger, so the flag does not flap at the boundary.
            if fd_count < self.fd_resume && mem_ratio < 0.65 {
                self.paused = false;
            }
        } else if want_pause {
            self.paused = true;
        }

        (self.cur, self.paused)
    }
}

/// Spawn the 200 ms sampler. It is the only writer of `limit` and `paused`.
pub fn spawn_controller(
    state: Arc<AdmissionState>,
    hard_cap: i64,
    mem_cap: Option<i64>,
    fd_cap: u64,
) -> JoinHandle<()> {
    let mut ctl = Controller::new(hard_cap, mem_cap, fd_cap);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let rss = platform::process_rss_bytes().unwrap_or(0);
            let fd = platform::open_fd_count().unwrap_or(0);
            let (limit, paused) = ctl.tick(rss, fd);
            state.limit.store(limit, Ordering::Relaxed);
            state.paused.store(paused, Ordering::Relaxed);
        }
    })
}
