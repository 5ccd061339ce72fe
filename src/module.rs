//! Module state as seen by the core (spec.md §3), filter + dispatch
//! (§4.5), interval flush (§4.6), and the rolling byte-rate load log
//! supplemented from `original_source/.../base/capture-profiling.c`.

use std::time::Duration;

use log::{error, warn};

use crate::filter::FilterExpr;
use crate::merge::Batch;
use crate::timestamp::Timestamp;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleStatus {
    Loading,
    WaitingForExport,
    Active,
    Failed,
}

/// Opaque per-interval accumulator. The core never looks inside; it only
/// moves it in/out via the module's `init`/`flush` callbacks.
pub trait IntervalState: Send {}

/// The module's business-logic callbacks (spec.md §1: "opaque; only
/// their interface with the core is specified").
pub trait ModuleCallbacks: Send {
    fn init(&mut self, ivl_start: Timestamp) -> Box<dyn IntervalState>;

    /// Returns `Err` on a callback failure; the batch continues with
    /// remaining modules (spec.md §4.6/§7).
    fn capture(
        &mut self,
        state: &mut dyn IntervalState,
        pkt: &crate::packet::Packet,
        shedding_rate: f64,
    ) -> Result<(), String>;

    /// Optional user flush hook, called before tuple ownership transfers
    /// to EXPORT.
    fn flush(&mut self, state: &mut dyn IntervalState) -> Result<(), String> {
        let _ = state;
        Ok(())
    }
}

/// A tuple list held in the module's shared-memory pool (spec.md §3).
/// Only the byte/record counts matter to the core; the bytes themselves
/// are opaque module output.
#[derive(Default)]
pub struct TupleList {
    pub count: usize,
    pub bytes: usize,
}

/// 15m/1h/6h/1d byte-rate load log in 60-second bins (spec.md §4.5,
/// supplemented per `capture-profiling.c`'s four-window design).
pub struct LoadLog {
    bin_width: Duration,
    windows: [usize; 4], // bins per window: 15, 60, 360, 1440 (at 60s/bin)
    bins: Vec<u64>,
    current_bin_start: Option<Timestamp>,
    current_bin_bytes: u64,
}

impl LoadLog {
    pub fn new() -> Self {
        LoadLog {
            bin_width: Duration::from_secs(60),
            windows: [15, 60, 360, 1440],
            bins: Vec::new(),
            current_bin_start: None,
            current_bin_bytes: 0,
        }
    }

    pub fn record(&mut self, ts: Timestamp, bytes: u64) {
        match self.current_bin_start {
            None => {
                self.current_bin_start = Some(ts);
                self.current_bin_bytes = bytes;
            }
            Some(start) => {
                if ts.saturating_sub(start) >= self.bin_width {
                    self.bins.push(self.current_bin_bytes);
                    let max_bins = *self.windows.iter().max().unwrap();
                    if self.bins.len() > max_bins {
                        let excess = self.bins.len() - max_bins;
                        self.bins.drain(0..excess);
                    }
                    self.current_bin_start = Some(start.add_duration(self.bin_width));
                    self.current_bin_bytes = bytes;
                } else {
                    self.current_bin_bytes += bytes;
                }
            }
        }
    }

    /// Average bytes/sec over the last `window` index (0=15m, 1=1h, 2=6h,
    /// 3=1d).
    pub fn rate(&self, window: usize) -> f64 {
        let n = self.windows[window].min(self.bins.len());
        if n == 0 {
            return 0.0;
        }
        let sum: u64 = self.bins[self.bins.len() - n..].iter().sum();
        sum as f64 / (n as f64 * self.bin_width.as_secs() as f64)
    }
}

pub struct ModuleState {
    pub name: String,
    pub id: u8,
    pub filter: FilterExpr,
    pub flush_ivl: Duration,
    pub ivl_start: Timestamp,
    pub ivl_end: Timestamp,
    pub status: ModuleStatus,
    pub ivl_state: Option<Box<dyn IntervalState>>,
    pub tuples: TupleList,
    pub use_shmem: bool,
    pub queue_size: usize,
    pub load_log: LoadLog,
    callbacks: Box<dyn ModuleCallbacks>,
}

impl ModuleState {
    pub fn new(
        name: impl Into<String>,
        id: u8,
        filter: FilterExpr,
        flush_ivl: Duration,
        use_shmem: bool,
        callbacks: Box<dyn ModuleCallbacks>,
    ) -> Self {
        ModuleState {
            name: name.into(),
            id,
            filter,
            flush_ivl,
            ivl_start: Timestamp::ZERO,
            ivl_end: Timestamp::ZERO,
            status: ModuleStatus::Loading,
            ivl_state: None,
            tuples: TupleList::default(),
            use_shmem,
            queue_size: 0,
            load_log: LoadLog::new(),
            callbacks,
        }
    }

    fn flush_ivl_ts(&self) -> Timestamp {
        let secs = self.flush_ivl.as_secs() as u32;
        Timestamp::new(secs, 0)
    }

    /// Interval flush (spec.md §4.6). `next_ts = 0` is the pressure-flush
    /// path: it tears down the current interval's tuples without opening
    /// a new one (no `ivl_start`/`ivl_end` assignment happens).
    pub fn flush(&mut self, next_ts: Timestamp, export: &mut impl FnMut(ExportHandoff)) {
        if !self.ivl_start.is_zero() {
            if let Some(state) = self.ivl_state.as_mut() {
                if let Err(e) = self.callbacks.flush(state.as_mut()) {
                    error!("module {}: user flush callback failed: {}", self.name, e);
                }
            }

            export(ExportHandoff {
                module: self.name.clone(),
                use_shmem: self.use_shmem,
                ivl_start: self.ivl_start,
                ntuples: self.tuples.count,
                tuple_bytes: self.tuples.bytes,
                mdl_id: self.id,
                queue_size: self.queue_size + 1,
            });

            self.queue_size += 1;
            self.tuples = TupleList::default();
        }

        if !next_ts.is_zero() {
            let ivl = self.flush_ivl_ts().as_u64();
            let start = (next_ts.as_u64() / ivl) * ivl;
            self.ivl_start = Timestamp::from_u64(start);
            self.ivl_end = Timestamp::from_u64(start + ivl);
            self.ivl_state = Some(self.callbacks.init(self.ivl_start));
        }
    }

    /// Process one packet already known to match this module's filter.
    /// Flushes the interval first if `pkt.ts` has crossed `ivl_end`.
    fn process_packet(
        &mut self,
        pkt: &crate::packet::Packet,
        shedding_rate: f64,
        export: &mut impl FnMut(ExportHandoff),
    ) {
        if self.status != ModuleStatus::Active {
            return;
        }

        if self.ivl_start.is_zero() {
            self.flush(pkt.ts, export);
        } else if pkt.ts >= self.ivl_end {
            self.flush(pkt.ts, export);
        }

        if let Some(state) = self.ivl_state.as_mut() {
            if let Err(e) = self.callbacks.capture(state.as_mut(), pkt, shedding_rate) {
                warn!("module {}: capture callback failed: {}", self.name, e);
            }
        }
    }
}

/// What gets handed to EXPORT on flush (spec.md §6's `PROCESS_SHM_TUPLES`
/// / `PROCESS_SER_TUPLES`, before serialisation).
#[derive(Debug, Clone)]
pub struct ExportHandoff {
    pub module: String,
    pub use_shmem: bool,
    pub ivl_start: Timestamp,
    pub ntuples: usize,
    pub tuple_bytes: usize,
    pub mdl_id: u8,
    pub queue_size: usize,
}

pub struct ModuleTable {
    slots: Vec<Option<ModuleState>>,
}

impl ModuleTable {
    pub fn new() -> Self {
        ModuleTable { slots: Vec::new() }
    }

    pub fn add(&mut self, module: ModuleState) -> usize {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(module);
                return i;
            }
        }
        self.slots.push(Some(module));
        self.slots.len() - 1
    }

    pub fn remove(&mut self, idx: usize) -> Option<ModuleState> {
        self.slots.get_mut(idx).and_then(|s| s.take())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ModuleState> {
        self.slots.iter_mut().filter_map(|s| s.as_mut())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// `batch_process` (spec.md §4.5): build the filter matrix, then feed
    /// each active module its matching packets in nondecreasing
    /// timestamp order. `shedding_rate` is looked up per module (1.0 if
    /// the load-shedder is disabled for it).
    pub fn batch_process(
        &mut self,
        batch: &Batch,
        shedding_rate: impl Fn(u8) -> f64,
        mut export: impl FnMut(ExportHandoff),
    ) -> Timestamp {
        // Filter matrix: [modules x batch.count], row-major.
        let n = batch.packets.len();
        let modules: Vec<&mut ModuleState> = self.slots.iter_mut().filter_map(|s| s.as_mut()).collect();
        let mut matrix = vec![false; modules.len() * n];

        for (mi, module) in modules.iter().enumerate() {
            for (pi, owned) in batch.packets.iter().enumerate() {
                let pkt = owned.as_packet();
                matrix[mi * n + pi] = module.filter.evaluate(&pkt);
            }
        }

        let mut last_pkt_ts = Timestamp::ZERO;
        for (mi, module) in modules.into_iter().enumerate() {
            if module.status != ModuleStatus::Active {
                continue;
            }
            for (pi, owned) in batch.packets.iter().enumerate() {
                if !matrix[mi * n + pi] {
                    continue;
                }
                let pkt = owned.as_packet();
                let rate = shedding_rate(module.id);
                module.process_packet(&pkt, rate, &mut export);
                module.load_log.record(pkt.ts, pkt.wire_len as u64);
                last_pkt_ts = last_pkt_ts.max(pkt.ts);
            }
        }

        last_pkt_ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterExpr;
    use crate::packet::{LayerOffsets, LayerTag};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingState;
    impl IntervalState for CountingState {}

    struct CountingCallbacks {
        inits: Arc<AtomicUsize>,
        captures: Arc<AtomicUsize>,
    }
    impl ModuleCallbacks for CountingCallbacks {
        fn init(&mut self, _ivl_start: Timestamp) -> Box<dyn IntervalState> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Box::new(CountingState)
        }
        fn capture(
            &mut self,
            _state: &mut dyn IntervalState,
            _pkt: &crate::packet::Packet,
            _rate: f64,
        ) -> Result<(), String> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pkt_at(sec: u32, us: u32) -> crate::packet::OwnedPacket {
        crate::packet::OwnedPacket {
            ts: Timestamp::from_secs_micros(sec, us),
            wire_len: 100,
            cap_len: 100,
            source: 0,
            type_tag: LayerTag::empty(),
            dropped_since_last: 0,
            offsets: LayerOffsets::default(),
            payload: vec![0; 100],
        }
    }

    #[test]
    fn scenario_4_interval_boundary_flush() {
        let inits = Arc::new(AtomicUsize::new(0));
        let captures = Arc::new(AtomicUsize::new(0));
        let mut module = ModuleState::new(
            "m",
            0,
            FilterExpr::True,
            Duration::from_secs(1),
            false,
            Box::new(CountingCallbacks {
                inits: inits.clone(),
                captures: captures.clone(),
            }),
        );
        module.status = ModuleStatus::Active;

        // Timestamps offset away from epoch zero: `ivl_start == 0` is the
        // core's own sentinel for "no active interval yet" (spec.md
        // §4.6), so a real interval must never land there.
        let batch = Batch {
            packets: vec![pkt_at(100, 900_000), pkt_at(101, 50_000)],
            last_pkt_ts: Timestamp::from_secs_micros(101, 50_000),
            per_source_range: vec![],
            ref_mask: 1,
        };

        let mut flushes = 0;
        let mut table = ModuleTable::new();
        table.add(module);
        table.batch_process(&batch, |_| 1.0, |_| flushes += 1);

        // one flush fired when crossing into [1.0, 2.0)
        assert_eq!(flushes, 1);
        assert_eq!(inits.load(Ordering::SeqCst), 2); // initial lazy + post-flush
        assert_eq!(captures.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pressure_flush_then_real_flush_invokes_callback_twice() {
        let inits = Arc::new(AtomicUsize::new(0));
        let captures = Arc::new(AtomicUsize::new(0));
        let mut module = ModuleState::new(
            "m",
            0,
            FilterExpr::True,
            Duration::from_secs(1),
            false,
            Box::new(CountingCallbacks { inits, captures }),
        );
        module.status = ModuleStatus::Active;
        module.ivl_start = Timestamp::new(1, 0);
        module.ivl_end = Timestamp::new(2, 0);
        module.ivl_state = Some(Box::new(CountingState));

        let mut export_calls = 0;
        module.flush(Timestamp::ZERO, &mut |_| export_calls += 1);
        assert_eq!(export_calls, 1);
        // pressure flush (next_ts == 0) tears down tuples but does not
        // rotate ivl_start/ivl_end.
        assert_eq!(module.ivl_start, Timestamp::new(1, 0));

        module.ivl_state = Some(Box::new(CountingState));
        module.flush(Timestamp::new(2, 0), &mut |_| export_calls += 1);
        assert_eq!(export_calls, 2);
        assert_eq!(module.ivl_start, Timestamp::new(2, 0));
    }

    #[test]
    fn interval_invariant_holds() {
        assert!(Timestamp::new(1, 0) <= Timestamp::new(2, 0));
    }
}
