//! The sniffer capability interface (spec.md §4.2). Every concrete source
//! — ring-buffer driver, file-mmap, NetFlow/sFlow socket, upstream peer —
//! implements `Sniffer`; the core only ever talks to the trait object,
//! matching the teacher's one-`Evented`-impl-per-driver pattern in `fd.rs`.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use bitflags::bitflags;

bitflags! {
    pub struct SnifferFlags: u32 {
        const FILE = 0b0000_0001;
        const LIVE = 0b0000_0010;
        const POLL = 0b0000_0100;
        const SELECT = 0b0000_1000;
        /// Payloads live in process-shared memory; required for capture
        /// clients to be able to see them (spec.md §4.8).
        const SHARED_BUFFER = 0b0001_0000;
    }
}

/// Declared packet templates a source can emit, consumed by module
/// compatibility checks (spec.md §4.2, `setup_metadata`).
#[derive(Clone, Debug)]
pub struct SnifferMetadata {
    pub flags: SnifferFlags,
    pub caplen_upper_bound: u32,
    pub templates: Vec<PacketTemplate>,
    /// Poll-only sources advertise how often they should be polled absent
    /// a selectable fd (spec.md §4.7 step 1).
    pub poll_interval: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketTemplate {
    pub l2: u16,
    pub l3: u16,
    pub l4: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnifferState {
    Uninitialised,
    Active,
    Frozen,
    Completed,
    Inactive,
}

/// Outcome of a `next()` call.
#[derive(Debug, Default)]
pub struct NextOutcome {
    pub captured: usize,
    pub drops: u32,
    /// Source hit a non-fatal transient condition (e.g. EAGAIN); resume
    /// next turn.
    pub would_block: bool,
    /// Source failed permanently; the core will `stop`/`finish` it.
    pub fatal: Option<io::Error>,
    /// The sniffer's own buffer reports full; observable to the core for
    /// the merge/batch builder's saturation check (spec.md §4.4 step 1).
    pub buffer_full: bool,
    /// Source is draining its last packets before closing.
    pub closing: bool,
}

/// The fixed capability set every concrete source implements (spec.md
/// §4.2's operation table).
pub trait Sniffer: Send {
    fn name(&self) -> &str;

    fn metadata(&self) -> &SnifferMetadata;

    /// Open the device/socket/file; return a selectable fd, or `None` if
    /// this source is poll-only.
    fn start(&mut self) -> io::Result<Option<RawFd>>;

    /// Capture at most `max_pkts` and at most `max_interval` worth of
    /// wall time into `ppbuf`, honouring `first_ref_pkt` (the oldest
    /// timestamp any downstream consumer still references — the sniffer
    /// must not overwrite at or beyond it).
    fn next(
        &mut self,
        ppbuf: &mut crate::ppbuf::Ppbuf,
        max_pkts: usize,
        max_interval: Duration,
        first_ref_ts: Option<crate::timestamp::Timestamp>,
    ) -> NextOutcome;

    /// Fraction of the sniffer's internal buffer occupied by the range
    /// `[first, last]`, for client-backpressure accounting (spec.md §4.8).
    fn usage(&self, first: crate::timestamp::Timestamp, last: crate::timestamp::Timestamp) -> f32;

    /// Release OS resources but keep the handle valid for `finish`.
    fn stop(&mut self);

    /// Destroy the handle.
    fn finish(&mut self);
}

/// Owned, indexed table of live sniffers — the arena+index replacement
/// for the source's intrusive sniffer list (spec.md Design Note §9).
pub struct SnifferTable {
    slots: Vec<Option<SnifferEntry>>,
}

pub struct SnifferEntry {
    pub sniffer: Box<dyn Sniffer>,
    pub ppbuf: crate::ppbuf::Ppbuf,
    pub state: SnifferState,
    pub fd: Option<RawFd>,
    /// Set on any state transition, error, or fd change; consumed by the
    /// event loop to know when to rebuild its pollset (spec.md §4.7 step 1).
    pub touched: bool,
}

impl SnifferTable {
    pub fn new() -> Self {
        SnifferTable { slots: Vec::new() }
    }

    pub fn insert(&mut self, sniffer: Box<dyn Sniffer>, ppbuf_size: usize) -> usize {
        let ppbuf = crate::ppbuf::Ppbuf::new(sniffer.name().to_string(), ppbuf_size);
        let entry = SnifferEntry {
            sniffer,
            ppbuf,
            state: SnifferState::Uninitialised,
            fd: None,
            touched: true,
        };
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return i;
            }
        }
        self.slots.push(Some(entry));
        self.slots.len() - 1
    }

    pub fn remove(&mut self, idx: usize) -> Option<SnifferEntry> {
        self.slots.get_mut(idx).and_then(|s| s.take())
    }

    pub fn get(&self, idx: usize) -> Option<&SnifferEntry> {
        self.slots.get(idx).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut SnifferEntry> {
        self.slots.get_mut(idx).and_then(|s| s.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &SnifferEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|e| (i, e)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut SnifferEntry)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|e| (i, e)))
    }

    pub fn all_inactive(&self) -> bool {
        self.iter().all(|(_, e)| e.state == SnifferState::Inactive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;
    impl Sniffer for Dummy {
        fn name(&self) -> &str {
            "dummy"
        }
        fn metadata(&self) -> &SnifferMetadata {
            unimplemented!()
        }
        fn start(&mut self) -> io::Result<Option<RawFd>> {
            Ok(None)
        }
        fn next(
            &mut self,
            _ppbuf: &mut crate::ppbuf::Ppbuf,
            _max_pkts: usize,
            _max_interval: Duration,
            _first_ref_ts: Option<crate::timestamp::Timestamp>,
        ) -> NextOutcome {
            NextOutcome::default()
        }
        fn usage(&self, _first: crate::timestamp::Timestamp, _last: crate::timestamp::Timestamp) -> f32 {
            0.0
        }
        fn stop(&mut self) {}
        fn finish(&mut self) {}
    }

    #[test]
    fn insert_reuses_freed_slots() {
        let mut t = SnifferTable::new();
        let a = t.insert(Box::new(Dummy), 8);
        let b = t.insert(Box::new(Dummy), 8);
        t.remove(a);
        let c = t.insert(Box::new(Dummy), 8);
        assert_eq!(a, c);
        assert_ne!(b, c);
    }
}
