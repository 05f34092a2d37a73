//! Share counters, rolling hashrate windows and the stats snapshot.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::ShareResult;
use crate::miner::Algorithm;

/// Global share buckets. One atomic increment per classified submission,
/// never a lock on the submission path.
#[derive(Debug, Default)]
pub struct ShareCounters {
    valid: AtomicU64,
    stale: AtomicU64,
    invalid: AtomicU64,
}

/// Point-in-time view of the three buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShareSnapshot {
    pub valid: u64,
    pub stale: u64,
    pub invalid: u64,
}

impl ShareSnapshot {
    pub fn total(&self) -> u64 {
        self.valid + self.stale + self.invalid
    }
}

impl ShareCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: ShareResult) {
        match result {
            ShareResult::Valid => self.valid.fetch_add(1, Ordering::Relaxed),
            ShareResult::Stale => self.stale.fetch_add(1, Ordering::Relaxed),
            ShareResult::Invalid => self.invalid.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> ShareSnapshot {
        ShareSnapshot {
            valid: self.valid.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
        }
    }
}

/// Rolling hashrate window over (instant, hash-delta) samples.
pub struct HashrateWindow {
    samples: VecDeque<(Instant, u64)>,
    window_secs: u64,
}

impl HashrateWindow {
    pub fn new(window_secs: u64) -> Self {
        Self {
            samples: VecDeque::with_capacity(256),
            window_secs,
        }
    }

    pub fn push(&mut self, now: Instant, hashes: u64) {
        self.samples.push_back((now, hashes));
        let cutoff = now.checked_sub(Duration::from_secs(self.window_secs + 2));
        if let Some(cutoff) = cutoff {
            while self.samples.front().map_or(false, |(t, _)| *t < cutoff) {
                self.samples.pop_front();
            }
        }
    }

    pub fn rate(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let first = self.samples.front().expect("window checked non-empty");
        let last = self.samples.back().expect("window checked non-empty");
        let dt = last.0.duration_since(first.0).as_secs_f64();
        if dt < 0.5 {
            return 0.0;
        }
        let total: u64 = self.samples.iter().skip(1).map(|(_, h)| h).sum();
        total as f64 / dt
    }
}

/// Shared, lock-free per-device state. Owned by the engine, read by the
/// search task, the status task and the stats endpoint.
#[derive(Debug)]
pub struct DeviceState {
    pub id: usize,
    pub algorithm: Algorithm,
    valid: AtomicBool,
    active: AtomicBool,
    hashes: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    stale: AtomicU64,
    rate_hs: AtomicU64,
    started: Instant,
}

impl DeviceState {
    pub fn new(id: usize, algorithm: Algorithm) -> Self {
        Self {
            id,
            algorithm,
            valid: AtomicBool::new(true),
            active: AtomicBool::new(false),
            hashes: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            rate_hs: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn add_hashes(&self, n: u64) {
        self.hashes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn hashes(&self) -> u64 {
        self.hashes.load(Ordering::Relaxed)
    }

    pub fn record_share(&self, result: ShareResult) {
        match result {
            ShareResult::Valid => self.accepted.fetch_add(1, Ordering::Relaxed),
            ShareResult::Stale => self.stale.fetch_add(1, Ordering::Relaxed),
            ShareResult::Invalid => self.rejected.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn set_rate(&self, hs: f64) {
        self.rate_hs.store(hs.max(0.0) as u64, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id,
            algorithm: self.algorithm,
            valid: self.is_valid(),
            active: self.is_active(),
            hashes: self.hashes(),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            rate_hs: self.rate_hs.load(Ordering::Relaxed),
            uptime_secs: self.uptime_secs(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub id: usize,
    pub algorithm: Algorithm,
    pub valid: bool,
    pub active: bool,
    pub hashes: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub stale: u64,
    pub rate_hs: u64,
    pub uptime_secs: u64,
}

impl DeviceSnapshot {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "algorithm": self.algorithm.name(),
            "valid": self.valid,
            "active": self.active,
            "hashes": self.hashes,
            "accepted": self.accepted,
            "rejected": self.rejected,
            "stale": self.stale,
            "hashrate": self.rate_hs,
            "uptime_sec": self.uptime_secs,
        })
    }
}

pub fn fmt_hashrate(h: f64) -> String {
    if h >= 1e9 {
        format!("{:.2} GH/s", h / 1e9)
    } else if h >= 1e6 {
        format!("{:.2} MH/s", h / 1e6)
    } else if h >= 1e3 {
        format!("{:.2} kH/s", h / 1e3)
    } else {
        format!("{:.1} H/s", h)
    }
}

/// Best-effort atomic stats-file write (tmp + rename); failures must
/// never disturb mining.
pub fn write_stats_file(path: &Path, payload: &serde_json::Value) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let tmp = path.with_extension("tmp");
    if std::fs::write(&tmp, payload.to_string()).is_ok() {
        let _ = std::fs::rename(&tmp, path);
    }
}
