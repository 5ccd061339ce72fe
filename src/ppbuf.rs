//! ppbuf: the bounded staging ring between one sniffer's raw capture and
//! the merger (spec.md §4.3). Owns its packets as a circular `Vec` of
//! slots; the merger only ever inspects the head via `get`/`next`.

use log::warn;

use crate::packet::OwnedPacket;
use crate::timestamp::Timestamp;

pub struct Ppbuf {
    /// identity used in log lines ("max skew" watermark etc).
    pub sniffer_name: String,
    slots: Vec<Option<OwnedPacket>>,
    woff: usize,
    roff: usize,
    count: usize,
    pub last_pkt_ts: Timestamp,
    pub first_pkt_ts: Timestamp,
    /// round-scoped count, reset by `begin`, incremented by `capture`.
    captured_this_round: usize,
    max_skew: Timestamp,
    warned_skew: bool,
}

impl Ppbuf {
    pub fn new(sniffer_name: impl Into<String>, size: usize) -> Self {
        Ppbuf {
            sniffer_name: sniffer_name.into(),
            slots: (0..size).map(|_| None).collect(),
            woff: 0,
            roff: 0,
            count: 0,
            last_pkt_ts: Timestamp::ZERO,
            first_pkt_ts: Timestamp::ZERO,
            captured_this_round: 0,
            max_skew: Timestamp::ZERO,
            warned_skew: false,
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    /// Set `roff` to the oldest valid slot, zero the per-round captured
    /// count, and return the number of free slots the sniffer may use
    /// this round.
    pub fn begin(&mut self) -> usize {
        self.roff = if self.count == 0 {
            self.woff
        } else {
            (self.woff + self.slots.len() - self.count) % self.slots.len()
        };
        self.captured_this_round = 0;
        self.slots.len() - self.count
    }

    /// Sniffer enqueues one packet. Per the canonical behaviour spec.md
    /// §4.3 names: a zero or decreasing timestamp is logged once per
    /// source and accepted with a skew watermark update, never dropped.
    pub fn capture(&mut self, pkt: OwnedPacket) {
        assert!(
            self.count < self.slots.len(),
            "ppbuf {}: capture() called on a full buffer (programming error)",
            self.sniffer_name
        );

        if !pkt.ts.is_zero() && pkt.ts < self.last_pkt_ts {
            let skew = self.last_pkt_ts.saturating_sub(pkt.ts);
            let skew_ts = Timestamp::from_secs_micros(
                skew.as_secs() as u32,
                skew.subsec_micros(),
            );
            if skew_ts > self.max_skew {
                self.max_skew = skew_ts;
            }
            if !self.warned_skew {
                warn!(
                    "ppbuf {}: packet timestamp went backwards by {:?}, accepting (max skew so far {:?})",
                    self.sniffer_name, skew, self.max_skew
                );
                self.warned_skew = true;
            }
        }

        if self.count == 0 {
            self.first_pkt_ts = pkt.ts;
        }

        self.slots[self.woff] = Some(pkt);
        self.woff = (self.woff + 1) % self.slots.len();
        self.count += 1;
        self.captured_this_round += 1;
    }

    /// Commit the round: update `last_pkt_ts` to the most recent packet
    /// actually captured.
    pub fn end(&mut self) {
        if self.captured_this_round > 0 {
            let idx = (self.woff + self.slots.len() - 1) % self.slots.len();
            if let Some(p) = &self.slots[idx] {
                self.last_pkt_ts = p.ts;
            }
        }
        debug_assert!(self.count <= self.slots.len());
    }

    /// Peek at the oldest unread packet without consuming it.
    pub fn get(&self) -> Option<&OwnedPacket> {
        if self.count == 0 {
            None
        } else {
            self.slots[self.roff].as_ref()
        }
    }

    /// Consume the oldest unread packet, advancing the read cursor.
    pub fn next(&mut self) -> Option<OwnedPacket> {
        if self.count == 0 {
            return None;
        }
        let pkt = self.slots[self.roff].take();
        self.roff = (self.roff + 1) % self.slots.len();
        self.count -= 1;
        pkt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::LayerOffsets;
    use crate::packet::LayerTag;

    fn pkt(sec: u32, micros: u32) -> OwnedPacket {
        OwnedPacket {
            ts: Timestamp::from_secs_micros(sec, micros),
            wire_len: 100,
            cap_len: 100,
            source: 0,
            type_tag: LayerTag::empty(),
            dropped_since_last: 0,
            offsets: LayerOffsets::default(),
            payload: vec![0u8; 100],
        }
    }

    #[test]
    fn count_never_exceeds_size_and_is_nondecreasing() {
        let mut p = Ppbuf::new("test", 4);
        p.begin();
        p.capture(pkt(0, 0));
        p.capture(pkt(0, 10));
        p.end();
        assert_eq!(p.count(), 2);
        let first = p.next().unwrap();
        let second = p.next().unwrap();
        assert!(first.ts < second.ts);
        assert_eq!(p.count(), 0);
    }

    #[test]
    #[should_panic]
    fn overfull_capture_is_programming_error() {
        let mut p = Ppbuf::new("test", 1);
        p.begin();
        p.capture(pkt(0, 0));
        p.capture(pkt(0, 1));
    }

    #[test]
    fn skew_is_accepted_not_dropped() {
        let mut p = Ppbuf::new("test", 4);
        p.begin();
        p.capture(pkt(5, 0));
        p.end();
        p.begin();
        p.capture(pkt(4, 0)); // goes backwards
        p.end();
        assert_eq!(p.count(), 2);
    }
}
