//! Callback timing and xrun counters, written from the audio thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free backend counters.
#[derive(Debug, Default)]
pub struct BackendStats {
    callbacks: AtomicU64,
    xruns: AtomicU64,
    device_losses: AtomicU64,
    failovers: AtomicU64,
    worst_callback_ns: AtomicU64,
    last_callback_ns: AtomicU64,
}

/// Point-in-time copy of [`BackendStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Callbacks delivered.
    pub callbacks: u64,
    /// Callbacks that overran their period or found input starved.
    pub xruns: u64,
    /// Devices lost.
    pub device_losses: u64,
    /// Switches to the null backend.
    pub failovers: u64,
    /// Longest callback.
    pub worst_callback: Duration,
    /// Most recent callback.
    pub last_callback: Duration,
}

impl StatsSnapshot {
    /// Worst callback time as a fraction of `period`.
    pub fn worst_load(&self, period: Duration) -> f64 {
        if period.is_zero() {
            return 0.0;
        }
        self.worst_callback.as_secs_f64() / period.as_secs_f64()
    }
}

impl BackendStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one callback that took `elapsed` out of a `period` budget.
    ///
    /// Returns true if it counted as an xrun.
    pub fn record_callback(&self, elapsed: Duration, period: Duration) -> bool {
        let ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.callbacks.fetch_add(1, Ordering::Relaxed);
        self.last_callback_ns.store(ns, Ordering::Relaxed);
        self.worst_callback_ns.fetch_max(ns, Ordering::Relaxed);
        let overran = elapsed > period;
        if overran {
            self.xruns.fetch_add(1, Ordering::Relaxed);
        }
        overran
    }

    /// Counts an xrun reported by the backend.
    pub fn record_xrun(&self) {
        self.xruns.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a lost device.
    pub fn record_device_loss(&self) {
        self.device_losses.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a failover.
    pub fn record_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            callbacks: self.callbacks.load(Ordering::Relaxed),
            xruns: self.xruns.load(Ordering::Relaxed),
            device_losses: self.device_losses.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            worst_callback: Duration::from_nanos(self.worst_callback_ns.load(Ordering::Relaxed)),
            last_callback: Duration::from_nanos(self.last_callback_ns.load(Ordering::Relaxed)),
        }
    }
}
