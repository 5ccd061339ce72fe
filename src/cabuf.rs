//! Capture-client cabuf and backpressure (spec.md §4.8). The pointer ring
//! itself is represented by the core's `Batch` queue (`merge::Batch`);
//! this module owns the client table, per-client/per-source usage
//! accounting, and the sampling-rate feedback loop.

use std::collections::VecDeque;

use crate::merge::Batch;

pub const MAX_CLIENTS: usize = 63; // bit 0 is reserved for the core itself.

const WAIT_THRESHOLD: f32 = 0.65;
const SAMPLING_THRESHOLD: f32 = 0.35;
const NO_SAMPLING_THRESHOLD: f32 = 0.25;

/// A shared-memory cell the client polls for its current sampling rate
/// (spec.md Design Note §9: "publish it via an atomic cell in the shared
/// region; readers see either the old or new value, never a tear").
#[derive(Debug, Default)]
pub struct SamplingCell(::std::sync::atomic::AtomicI64);

impl SamplingCell {
    pub fn new(initial: i64) -> Self {
        SamplingCell(::std::sync::atomic::AtomicI64::new(initial))
    }
    pub fn set(&self, v: i64) {
        self.0.store(v, ::std::sync::atomic::Ordering::Release);
    }
    pub fn get(&self) -> i64 {
        self.0.load(::std::sync::atomic::Ordering::Acquire)
    }
}

pub struct CaptureClient {
    pub id: u8,
    /// Cumulative usage per source, incremented at publication and
    /// decremented on ACK_BATCH.
    pub usage_per_source: Vec<f32>,
    pub sampling: SamplingCell,
}

pub struct CaptureClientTable {
    clients: Vec<Option<CaptureClient>>,
    num_sources: usize,
    has_shared_buffer_support: bool,
}

/// Outcome of a per-turn backpressure pass (spec.md §4.8's per-source,
/// per-turn bullets).
#[derive(Debug, Default)]
pub struct BackpressureOutcome {
    pub freeze_all_sniffers: bool,
}

impl CaptureClientTable {
    pub fn new(num_sources: usize, has_shared_buffer_support: bool) -> Self {
        CaptureClientTable {
            clients: Vec::new(),
            num_sources,
            has_shared_buffer_support,
        }
    }

    /// Handle an `OPEN` request. Refuses (per spec.md §4.8) if no sniffer
    /// advertises `SHARED_BUFFER` support.
    pub fn open(&mut self) -> Result<(u8, &SamplingCell), &'static str> {
        if !self.has_shared_buffer_support {
            return Err("no sniffer advertises shared-buffer support");
        }

        for (i, slot) in self.clients.iter_mut().enumerate() {
            if slot.is_none() {
                if i >= MAX_CLIENTS {
                    break;
                }
                *slot = Some(CaptureClient {
                    id: i as u8,
                    usage_per_source: vec![0.0; self.num_sources],
                    sampling: SamplingCell::new(1),
                });
                return Ok((i as u8, &slot.as_ref().unwrap().sampling));
            }
        }

        if self.clients.len() >= MAX_CLIENTS {
            return Err("maximum number of capture clients reached");
        }

        let id = self.clients.len() as u8;
        self.clients.push(Some(CaptureClient {
            id,
            usage_per_source: vec![0.0; self.num_sources],
            sampling: SamplingCell::new(1),
        }));
        Ok((id, &self.clients[id as usize].as_ref().unwrap().sampling))
    }

    pub fn close(&mut self, id: u8) {
        if let Some(slot) = self.clients.get_mut(id as usize) {
            *slot = None;
        }
    }

    /// The bit this client contributes to a batch's reference mask
    /// (`bit (id+1)`).
    pub fn ref_bit(id: u8) -> u64 {
        1u64 << (id as u64 + 1)
    }

    /// Publish a batch to every open client: set its ref-mask bit and
    /// accumulate per-source usage.
    pub fn publish(&self, batch: &mut Batch, sniffer_usage: impl Fn(usize) -> f32) {
        for slot in self.clients.iter().flatten() {
            batch.ref_mask |= Self::ref_bit(slot.id);
        }
        let _ = sniffer_usage;
    }

    /// `ACK_BATCH(client_id, ...)`: clear the client's bit. Returns `true`
    /// if the mask is now zero (caller should pop/free if this batch is
    /// at the head of the outstanding queue — batches are only freed in
    /// order, spec.md §4.8/§8).
    pub fn ack(&self, batch: &mut Batch, client_id: u8) -> bool {
        batch.ref_mask &= !Self::ref_bit(client_id);
        batch.ref_mask == 0
    }

    /// Accumulate this batch's per-source usage onto every open client,
    /// and run the per-source, per-turn threshold logic (spec.md §4.8).
    pub fn account_and_backpressure(
        &mut self,
        batch_len: usize,
        per_source: &[(usize, f32)],
    ) -> BackpressureOutcome {
        let mut outcome = BackpressureOutcome::default();

        for slot in self.clients.iter_mut().flatten() {
            let mut max_sampling = 1i64;
            let mut any_sampling_requested = false;

            for &(source, usage) in per_source {
                if let Some(u) = slot.usage_per_source.get_mut(source) {
                    *u += usage;

                    if *u > WAIT_THRESHOLD {
                        outcome.freeze_all_sniffers = true;
                    } else if *u > SAMPLING_THRESHOLD {
                        let sampling = (batch_len as f32) * (*u - SAMPLING_THRESHOLD)
                            / (1.0 - SAMPLING_THRESHOLD);
                        max_sampling = max_sampling.max(sampling as i64);
                        any_sampling_requested = true;
                    } else if *u < NO_SAMPLING_THRESHOLD {
                        // cleared below via the default max_sampling = 1
                    }
                }
            }

            if any_sampling_requested {
                slot.sampling.set(max_sampling);
            } else if per_source.iter().all(|&(s, _)| {
                slot.usage_per_source
                    .get(s)
                    .map(|&u| u < NO_SAMPLING_THRESHOLD)
                    .unwrap_or(true)
            }) {
                slot.sampling.set(1);
            }
        }

        outcome
    }

    pub fn ack_source_usage(&mut self, client_id: u8, source: usize, usage: f32) {
        if let Some(Some(c)) = self.clients.get_mut(client_id as usize) {
            if let Some(u) = c.usage_per_source.get_mut(source) {
                *u = (*u - usage).max(0.0);
            }
        }
    }
}

/// The outstanding-batch queue: a FIFO, arena+index-backed in spirit
/// (`VecDeque` here, since the teacher's intrusive list maps cleanly onto
/// one), freed only from the head once its reference mask reaches zero
/// (spec.md §4.8, §8).
pub struct BatchQueue {
    queue: VecDeque<Batch>,
}

impl BatchQueue {
    pub fn new() -> Self {
        BatchQueue {
            queue: VecDeque::new(),
        }
    }

    pub fn push(&mut self, batch: Batch) {
        self.queue.push_back(batch);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Pop every batch from the head whose reference mask has reached
    /// zero, stopping at the first still-referenced one — batches may
    /// only be freed in order.
    pub fn drain_freed_head(&mut self) -> usize {
        let mut freed = 0;
        while let Some(front) = self.queue.front() {
            if front.ref_mask == 0 {
                self.queue.pop_front();
                freed += 1;
            } else {
                break;
            }
        }
        freed
    }

    /// Acknowledge a specific batch by position search from the head;
    /// returns whether it was found and its mask reached zero.
    pub fn ack_at_head_or_later(&mut self, predicate: impl Fn(&Batch) -> bool, client_id: u8, clients: &CaptureClientTable) -> bool {
        for b in self.queue.iter_mut() {
            if predicate(b) {
                return clients.ack(b, client_id);
            }
        }
        false
    }

    /// Oldest timestamp any still-outstanding batch references for
    /// `source_idx`, the value a sniffer's `next()` call must not
    /// overwrite (spec.md §4.2). Batches are appended oldest-first, so
    /// the first match found is the oldest.
    pub fn oldest_referenced_ts(&self, source_idx: usize) -> Option<crate::timestamp::Timestamp> {
        self.queue.iter().find_map(|b| {
            b.per_source_range
                .iter()
                .find(|&&(i, _, _)| i == source_idx)
                .map(|&(_, first, _)| first)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_batch(ref_mask: u64) -> Batch {
        Batch {
            packets: vec![],
            last_pkt_ts: crate::timestamp::Timestamp::ZERO,
            per_source_range: vec![],
            ref_mask,
        }
    }

    #[test]
    fn zero_client_batch_frees_within_same_turn() {
        let mut q = BatchQueue::new();
        q.push(empty_batch(1)); // only the core's own bit
        // Core releases its own reference immediately since there are no clients.
        if let Some(b) = q.queue.front_mut() {
            b.ref_mask &= !1;
        }
        let freed = q.drain_freed_head();
        assert_eq!(freed, 1);
        assert!(q.is_empty());
    }

    #[test]
    fn batches_only_free_from_head_in_order() {
        let mut q = BatchQueue::new();
        q.push(empty_batch(0b10)); // still referenced
        q.push(empty_batch(0)); // already fully acked
        let freed = q.drain_freed_head();
        // the head batch is still referenced, so nothing is freed even
        // though the second batch's mask is already zero.
        assert_eq!(freed, 0);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn scenario_5_client_sampling_engagement() {
        let mut table = CaptureClientTable::new(1, true);
        let (id, _cell) = table.open().unwrap();

        // usage climbs 0.10 -> 0.20 -> 0.45 across three 1000-packet batches
        table.account_and_backpressure(1000, &[(0, 0.10)]);
        table.account_and_backpressure(1000, &[(0, 0.10)]);
        let outcome = table.account_and_backpressure(1000, &[(0, 0.25)]);
        assert!(!outcome.freeze_all_sniffers);

        let expected = (1000.0f32 * (0.45 - 0.35) / 0.65) as i64;
        let got = table.clients[id as usize].as_ref().unwrap().sampling.get();
        assert_eq!(got, expected);

        // drop back under 0.25 clears sampling
        table.ack_source_usage(id, 0, 0.21); // 0.45 -> 0.24
        table.account_and_backpressure(1000, &[(0, 0.0)]);
        let got = table.clients[id as usize].as_ref().unwrap().sampling.get();
        assert_eq!(got, 1);
    }
}
