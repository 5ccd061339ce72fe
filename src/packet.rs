//! Packet descriptor (spec.md §3). The header is fixed-size and owned by
//! whichever ring (ppbuf pre-merge, cabuf post-merge) currently holds it;
//! the payload bytes are always owned by the originating sniffer's buffer.

use bitflags::bitflags;

use crate::timestamp::Timestamp;

bitflags! {
    /// Composite type tag: which protocol layers this descriptor's
    /// `offsets` actually describe.
    pub struct LayerTag: u16 {
        const L2 = 0b0001;
        const L3 = 0b0010;
        const L4 = 0b0100;
        const L7 = 0b1000;
    }
}

/// Per-layer byte offsets into the captured payload, valid only for the
/// layers set in `LayerTag`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LayerOffsets {
    pub l2: u16,
    pub l3: u16,
    pub l4: u16,
    pub l7: u16,
}

/// A single captured (or replayed) packet. The descriptor is `Copy`-able
/// cheaply; `payload` is a non-owning slice borrowed from the sniffer's
/// buffer for at least the lifetime of the batch that references it.
#[derive(Clone, Debug)]
pub struct Packet<'a> {
    pub ts: Timestamp,
    pub wire_len: u32,
    pub cap_len: u32,
    pub source: u16,
    pub type_tag: LayerTag,
    pub dropped_since_last: u32,
    pub offsets: LayerOffsets,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    pub fn is_malformed(&self, buffer_cap: u32) -> bool {
        self.ts.is_zero() || self.cap_len > buffer_cap
    }
}

/// Owned variant used where a packet must outlive the ppbuf slot it was
/// captured into (e.g. staged in the cabuf, or carried across an IPC
/// boundary for a peer-of-peers sniffer, spec.md §6).
#[derive(Clone, Debug)]
pub struct OwnedPacket {
    pub ts: Timestamp,
    pub wire_len: u32,
    pub cap_len: u32,
    pub source: u16,
    pub type_tag: LayerTag,
    pub dropped_since_last: u32,
    pub offsets: LayerOffsets,
    pub payload: Vec<u8>,
}

impl OwnedPacket {
    pub fn as_packet(&self) -> Packet {
        Packet {
            ts: self.ts,
            wire_len: self.wire_len,
            cap_len: self.cap_len,
            source: self.source,
            type_tag: self.type_tag,
            dropped_since_last: self.dropped_since_last,
            offsets: self.offsets,
            payload: &self.payload,
        }
    }

    pub fn is_malformed(&self, buffer_cap: u32) -> bool {
        self.as_packet().is_malformed(buffer_cap)
    }
}
