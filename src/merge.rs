//! Merge / batch builder (spec.md §4.4): time-ordered K-way merge across
//! live ppbufs into one `Batch`. Called at most once per event-loop turn,
//! pure over the set of live sniffer ppbufs — no I/O here.

use std::time::Duration;

use crate::packet::OwnedPacket;
use crate::ppbuf::Ppbuf;
use crate::sniffer::SnifferState;
use crate::timestamp::Timestamp;

/// One reserved-and-populated run of packets, time-ordered, ready for
/// `batch_process` (spec.md §4.5). `per_source_head` records, for each
/// source that contributed, the timestamp of the oldest packet this
/// batch still references — the input to client-backpressure usage
/// accounting (spec.md §4.8).
pub struct Batch {
    pub packets: Vec<OwnedPacket>,
    pub last_pkt_ts: Timestamp,
    /// `(sniffer_index, first_referenced_ts, last_referenced_ts)` for
    /// each contributing source, used to compute `sniffer.usage(first, last)`.
    pub per_source_range: Vec<(usize, Timestamp, Timestamp)>,
    /// Bit `i` set = consumer `i` still references this batch. Bit 0 is
    /// always set initially (the core's own reference); capture clients
    /// occupy bits 1..=63 (spec.md §4.8).
    pub ref_mask: u64,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

/// Per-source status the merger needs, gathered by the caller from its
/// `SnifferTable` before calling `batch_create`.
pub struct SourceStatus<'a> {
    pub index: usize,
    pub ppbuf: &'a mut Ppbuf,
    pub state: SnifferState,
    pub reports_full: bool,
    pub reports_closing: bool,
}

/// Implements spec.md §4.4's eight-step algorithm. `last_bin_end` is the
/// previous call's upper edge (or `Timestamp::ZERO` initially); callers
/// must persist the returned edge across calls.
pub fn batch_create(
    sources: &mut [SourceStatus],
    live_threshold: Duration,
    timebin: Duration,
    force_batch: bool,
    last_bin_end: Timestamp,
) -> (Option<Batch>, Timestamp) {
    // Step 1: gather.
    let non_inactive: Vec<usize> = (0..sources.len())
        .filter(|&i| sources[i].state != SnifferState::Inactive)
        .collect();

    let total: usize = non_inactive.iter().map(|&i| sources[i].ppbuf.count()).sum();
    let t_max = non_inactive
        .iter()
        .map(|&i| sources[i].ppbuf.last_pkt_ts)
        .max()
        .unwrap_or(Timestamp::ZERO);
    let t_min_first = non_inactive
        .iter()
        .filter(|&&i| !sources[i].ppbuf.is_empty())
        .map(|&i| sources[i].ppbuf.first_pkt_ts)
        .min();

    let saturated = non_inactive.iter().any(|&i| {
        sources[i].ppbuf.is_full() || sources[i].reports_full || sources[i].reports_closing
    });

    // Step 2.
    if total == 0 {
        return (None, last_bin_end);
    }

    // Step 3: live-threshold quiescence.
    if !saturated && !force_batch {
        for &i in &non_inactive {
            if sources[i].ppbuf.is_empty() {
                let gap = t_max.saturating_sub(sources[i].ppbuf.last_pkt_ts);
                if gap <= live_threshold {
                    return (None, last_bin_end);
                }
            }
        }
    }

    let t_min_first = match t_min_first {
        Some(t) => t,
        None => return (None, last_bin_end),
    };

    // Step 4: pin the bin's upper edge, never regressing.
    let floor = last_bin_end.add_duration(timebin);
    let b = t_min_first.ceil_to_bin(timebin, floor);

    // Step 5: insufficient coverage.
    if t_max <= b && !force_batch && !saturated {
        return (None, last_bin_end);
    }

    // Step 6: reserve + record heads.
    let mut per_source_range: Vec<(usize, Timestamp, Timestamp)> = Vec::new();
    for &i in &non_inactive {
        if let Some(head) = sources[i].ppbuf.get() {
            per_source_range.push((i, head.ts, head.ts));
        }
    }

    // Step 7: repeatedly pick the smallest head timestamp.
    let mut packets = Vec::with_capacity(total);
    let mut last_pkt_ts = Timestamp::ZERO;
    let mut remaining = total;

    loop {
        if remaining == 0 {
            break;
        }

        let mut best: Option<(usize, Timestamp)> = None;
        // Traversal order == `non_inactive` order, so ties resolve to the
        // first ppbuf, per spec.md §4.4's tie-break rule.
        for &i in &non_inactive {
            if let Some(pkt) = sources[i].ppbuf.get() {
                match best {
                    None => best = Some((i, pkt.ts)),
                    Some((_, best_ts)) if pkt.ts < best_ts => best = Some((i, pkt.ts)),
                    _ => {}
                }
            }
        }

        let (src, ts) = match best {
            Some(v) => v,
            None => break,
        };

        if ts >= b {
            break;
        }

        let pkt = sources[src].ppbuf.next().expect("picked source had a head");
        last_pkt_ts = last_pkt_ts.max(pkt.ts);
        if let Some(entry) = per_source_range.iter_mut().find(|(i, _, _)| *i == src) {
            entry.2 = pkt.ts;
        }
        packets.push(pkt);
        remaining -= 1;

        // If that source just went empty and might still deliver an older
        // packet (it hasn't signalled it's done), prefer to start a new
        // batch next turn rather than risk reordering against it. A
        // source that already reported "closing" has nothing more to
        // deliver, so this doesn't apply to it.
        if sources[src].ppbuf.is_empty() && !sources[src].reports_closing {
            let gap = t_max.saturating_sub(sources[src].ppbuf.last_pkt_ts);
            if gap <= live_threshold {
                break;
            }
        }
    }

    if packets.is_empty() {
        return (None, last_bin_end);
    }

    let batch = Batch {
        packets,
        last_pkt_ts,
        per_source_range,
        ref_mask: 1,
    };

    (Some(batch), b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{LayerOffsets, LayerTag};

    fn mk_ppbuf(name: &str, pkts: &[(u32, u32)]) -> Ppbuf {
        let mut p = Ppbuf::new(name, 16);
        p.begin();
        for &(sec, us) in pkts {
            p.capture(OwnedPacket {
                ts: Timestamp::from_secs_micros(sec, us),
                wire_len: 100,
                cap_len: 100,
                source: 0,
                type_tag: LayerTag::empty(),
                dropped_since_last: 0,
                offsets: LayerOffsets::default(),
                payload: vec![0; 100],
            });
        }
        p.end();
        p
    }

    #[test]
    fn scenario_1_single_source_passthrough() {
        // A fully-drained trace file: all five packets were captured in one
        // round and the source has nothing left to deliver, so it reports
        // "closing" and counts as saturated (spec.md §4.4 step 1) — the
        // same way a `FILE` sniffer that hit EOF would.
        let mut a = mk_ppbuf("a", &[(0, 0), (0, 10_000), (0, 20_000), (0, 30_000), (0, 40_000)]);
        let mut sources = [SourceStatus {
            index: 0,
            ppbuf: &mut a,
            state: SnifferState::Active,
            reports_full: false,
            reports_closing: true,
        }];
        let (batch, _) = batch_create(
            &mut sources,
            Duration::from_millis(50),
            Duration::from_millis(100),
            false,
            Timestamp::ZERO,
        );
        let batch = batch.expect("expected a batch");
        assert_eq!(batch.packets.len(), 5);
        assert_eq!(batch.last_pkt_ts, Timestamp::from_secs_micros(0, 40_000));
    }

    #[test]
    fn scenario_2_two_sources_interleaved() {
        // Both sources are exhausted trace files, as in scenario 1.
        let mut a = mk_ppbuf("a", &[(0, 0), (0, 30_000)]);
        let mut b = mk_ppbuf("b", &[(0, 10_000), (0, 20_000), (0, 40_000)]);
        let mut sources = [
            SourceStatus {
                index: 0,
                ppbuf: &mut a,
                state: SnifferState::Active,
                reports_full: false,
                reports_closing: true,
            },
            SourceStatus {
                index: 1,
                ppbuf: &mut b,
                state: SnifferState::Active,
                reports_full: false,
                reports_closing: true,
            },
        ];
        let (batch, _) = batch_create(
            &mut sources,
            Duration::from_millis(50),
            Duration::from_millis(100),
            false,
            Timestamp::ZERO,
        );
        let batch = batch.expect("expected a batch");
        let ts: Vec<Timestamp> = batch.packets.iter().map(|p| p.ts).collect();
        let expected = vec![
            Timestamp::from_secs_micros(0, 0),
            Timestamp::from_secs_micros(0, 10_000),
            Timestamp::from_secs_micros(0, 20_000),
            Timestamp::from_secs_micros(0, 30_000),
            Timestamp::from_secs_micros(0, 40_000),
        ];
        assert_eq!(ts, expected);
    }

    #[test]
    fn scenario_3_live_threshold_quiescence() {
        let mut a = mk_ppbuf("a", &[(0, 0), (0, 50_000)]);
        let mut b = mk_ppbuf("b", &[]);
        let mut sources = [
            SourceStatus {
                index: 0,
                ppbuf: &mut a,
                state: SnifferState::Active,
                reports_full: false,
                reports_closing: false,
            },
            SourceStatus {
                index: 1,
                ppbuf: &mut b,
                state: SnifferState::Active,
                reports_full: false,
                reports_closing: false,
            },
        ];
        let (batch, _) = batch_create(
            &mut sources,
            Duration::from_millis(100),
            Duration::from_millis(100),
            false,
            Timestamp::ZERO,
        );
        assert!(batch.is_none(), "idle source within live_threshold should suppress the batch");
    }

    #[test]
    fn batch_packet_counts_never_exceed_reserved_and_are_nondecreasing() {
        let mut a = mk_ppbuf("a", &[(0, 0), (0, 5_000), (0, 99_000)]);
        let mut sources = [SourceStatus {
            index: 0,
            ppbuf: &mut a,
            state: SnifferState::Active,
            reports_full: false,
            reports_closing: false,
        }];
        let (batch, _) = batch_create(
            &mut sources,
            Duration::from_millis(10),
            Duration::from_millis(100),
            true,
            Timestamp::ZERO,
        );
        let batch = batch.unwrap();
        assert!(batch.packets.len() <= 3);
        for w in batch.packets.windows(2) {
            assert!(w[0].ts <= w[1].ts);
        }
    }
}
