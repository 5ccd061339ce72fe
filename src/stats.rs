//! `stats_t`: the process-wide progress block shared with SUPERVISOR
//! (spec.md §5 — "single-writer (core), single-reader (SUPERVISOR), no
//! lock; small integer writes are tolerated to race") and one of the
//! process-singleton context objects Design Note §9 asks to be made
//! explicit rather than a module-global pointer: `CaptureCore` owns one
//! and hands out `&Stats` to whatever needs to report progress, instead
//! of every component reaching for a global.

use std::sync::atomic::{AtomicU64, Ordering};

/// Plain relaxed-ordering counters: §5 explicitly tolerates a race on
/// these small integer writes, so there is no need for anything
/// stronger than `Relaxed` on either side.
#[derive(Default)]
pub struct Stats {
    pub packets_captured: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub bytes_captured: AtomicU64,
    pub batches_created: AtomicU64,
    pub batches_outstanding: AtomicU64,
    pub modules_active: AtomicU64,
    pub modules_failed: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }

    pub fn record_capture(&self, packets: u64, bytes: u64, drops: u64) {
        self.packets_captured.fetch_add(packets, Ordering::Relaxed);
        self.bytes_captured.fetch_add(bytes, Ordering::Relaxed);
        self.packets_dropped.fetch_add(drops, Ordering::Relaxed);
    }

    pub fn record_batch(&self, outstanding: u64) {
        self.batches_created.fetch_add(1, Ordering::Relaxed);
        self.batches_outstanding.store(outstanding, Ordering::Relaxed);
    }

    pub fn set_modules_active(&self, n: u64) {
        self.modules_active.store(n, Ordering::Relaxed);
    }

    pub fn record_module_failed(&self) {
        self.modules_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A point-in-time snapshot for SUPERVISOR's progress display;
    /// individual fields may be torn relative to each other (never
    /// within a field) since writer and reader share no lock.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_captured: self.packets_captured.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            bytes_captured: self.bytes_captured.load(Ordering::Relaxed),
            batches_created: self.batches_created.load(Ordering::Relaxed),
            batches_outstanding: self.batches_outstanding.load(Ordering::Relaxed),
            modules_active: self.modules_active.load(Ordering::Relaxed),
            modules_failed: self.modules_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_captured: u64,
    pub packets_dropped: u64,
    pub bytes_captured: u64,
    pub batches_created: u64,
    pub batches_outstanding: u64,
    pub modules_active: u64,
    pub modules_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_values() {
        let stats = Stats::new();
        stats.record_capture(10, 1500, 2);
        stats.record_batch(3);
        stats.set_modules_active(4);

        let snap = stats.snapshot();
        assert_eq!(snap.packets_captured, 10);
        assert_eq!(snap.bytes_captured, 1500);
        assert_eq!(snap.packets_dropped, 2);
        assert_eq!(snap.batches_created, 1);
        assert_eq!(snap.batches_outstanding, 3);
        assert_eq!(snap.modules_active, 4);
    }
}
