//! Traffic feature extraction for the load-shedding predictor (spec.md
//! §4.9): an H3 universal hash over a handful of packet fields feeding a
//! set of linear-counting cardinality bitmaps, one per aggregation key.
//! Grounded on `original_source/.../loadshed/feats.c` and `lib/uhash.c`.

use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::merge::Batch;
use crate::packet::LayerTag;

/// `NUM_KEYS` in the original is sized so the bitmap behaves like a
/// linear-counting estimator over the expected key space; we keep the
/// same power-of-two bit count (`2^15`) rather than its odd non-power
/// literal, which was itself a rounding artifact of the C bitmap layout.
const BITMAP_BITS: usize = 1 << 15;
const BITMAP_WORDS: usize = BITMAP_BITS / 64;

/// One of the 5 fields hashed per packet: source IP, destination IP,
/// IP protocol, source port, destination port.
const NUM_HASH: usize = 5;

/// The 13 aggregation keys `feats.c` tracks a bitmap for, in the same
/// order as its `aggr_names` table (skipping the 3 non-bitmap features).
pub const BITMAP_NAMES: [&str; 13] = [
    "sip",
    "dip",
    "sip_dip",
    "proto_sport",
    "proto_dport",
    "proto_sport_sip",
    "proto_dport_dip",
    "proto_sport_dport",
    "5tuple",
    "snet",
    "dnet",
    "snet_dnet",
    "proto",
];
const NUM_BITMAPS: usize = BITMAP_NAMES.len();

/// 3 features with no bitmap (packet count, byte count, new-interval
/// flag) plus 4 derived features (unique / new / batch-repeat /
/// aggregate-repeat) per bitmap.
pub const NUM_FEATS: usize = 3 + NUM_BITMAPS * 4;

/// An H3 universal hash matrix: one random `u16` per possible input bit,
/// up to a 32-byte (256-bit) key. Hashing XORs together the rows selected
/// by the key's set bits, the same construction as `uhash.c`'s `h->m`
/// table (scaled down from its 32-bit words since we only need a 15-bit
/// bitmap index).
pub struct H3Hash {
    rows: [u16; 256],
}

impl H3Hash {
    pub fn new(rng: &mut impl Rng) -> Self {
        let mut rows = [0u16; 256];
        for r in rows.iter_mut() {
            *r = rng.gen();
        }
        H3Hash { rows }
    }

    /// Hash up to 32 bytes of key material into a 15-bit bitmap index.
    pub fn hash(&self, key: &[u8]) -> u16 {
        let mut value: u16 = 0;
        let mut bit_pos = 0usize;
        for &byte in key {
            for b in 0..8 {
                if byte & (1 << b) != 0 {
                    value ^= self.rows[bit_pos % 256];
                }
                bit_pos += 1;
            }
        }
        value & ((BITMAP_BITS - 1) as u16)
    }
}

/// A linear-counting cardinality bitmap: `BITMAP_BITS` bits, tracking
/// which hash buckets have been touched.
#[derive(Clone)]
pub struct LinearCountingBitmap {
    words: Vec<u64>,
    set_count: usize,
}

impl LinearCountingBitmap {
    pub fn new() -> Self {
        LinearCountingBitmap {
            words: vec![0u64; BITMAP_WORDS],
            set_count: 0,
        }
    }

    pub fn reset(&mut self) {
        for w in self.words.iter_mut() {
            *w = 0;
        }
        self.set_count = 0;
    }

    /// Sets bit `idx`; returns whether it was already set.
    pub fn set_bit(&mut self, idx: u16) -> bool {
        let idx = idx as usize;
        let word = idx / 64;
        let bit = idx % 64;
        let mask = 1u64 << bit;
        let was_set = self.words[word] & mask != 0;
        if !was_set {
            self.words[word] |= mask;
            self.set_count += 1;
        }
        was_set
    }

    pub fn or_with(&mut self, other: &LinearCountingBitmap) {
        self.set_count = 0;
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a |= *b;
            self.set_count += a.count_ones() as usize;
        }
    }

    /// Linear-counting estimate of the number of distinct keys observed:
    /// `-m * ln(empty / m)`.
    pub fn estimate_unique_keys(&self) -> f64 {
        let m = BITMAP_BITS as f64;
        let empty = (BITMAP_BITS - self.set_count) as f64;
        if empty <= 0.0 {
            return m * (m.ln()); // saturated: every bucket touched.
        }
        -m * (empty / m).ln()
    }
}

/// A single named feature value, mirroring `feat_t` (`name` + `value`).
#[derive(Debug, Clone)]
pub struct Feature {
    pub name: &'static str,
    pub value: f64,
}

/// Best-effort 5-tuple extraction from a packet's opaque payload using
/// its layer offsets. The core's packet descriptor never parses headers
/// itself (spec.md §3); this reads the handful of bytes load-shedding
/// needs directly, assuming an IPv4 layout at `offsets.l3` and a
/// TCP/UDP port pair at `offsets.l4` when present.
pub struct FiveTuple {
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    pub proto: u8,
    pub src_port: Option<[u8; 2]>,
    pub dst_port: Option<[u8; 2]>,
}

pub fn extract_five_tuple(pkt: &crate::packet::OwnedPacket) -> Option<FiveTuple> {
    if !pkt.type_tag.contains(LayerTag::L3) {
        return None;
    }
    let l3 = pkt.offsets.l3 as usize;
    if pkt.payload.len() < l3 + 20 {
        return None;
    }
    let ihl = &pkt.payload[l3..];
    let proto = ihl[9];
    let mut src_ip = [0u8; 4];
    let mut dst_ip = [0u8; 4];
    src_ip.copy_from_slice(&ihl[12..16]);
    dst_ip.copy_from_slice(&ihl[16..20]);

    let (src_port, dst_port) = if pkt.type_tag.contains(LayerTag::L4) {
        let l4 = pkt.offsets.l4 as usize;
        if pkt.payload.len() >= l4 + 4 && (proto == 6 || proto == 17) {
            let mut sp = [0u8; 2];
            let mut dp = [0u8; 2];
            sp.copy_from_slice(&pkt.payload[l4..l4 + 2]);
            dp.copy_from_slice(&pkt.payload[l4 + 2..l4 + 4]);
            (Some(sp), Some(dp))
        } else {
            (None, None)
        }
    } else {
        (None, None)
    };

    Some(FiveTuple {
        src_ip,
        dst_ip,
        proto,
        src_port,
        dst_port,
    })
}

/// Per-module feature extraction state: the running per-interval
/// bitmaps and hash functions, re-seeded at every flush interval
/// boundary (`feats.c`'s `fextr_t`).
pub struct FeatureExtractor {
    hashes: Vec<H3Hash>,
    aggregate_bitmaps: Vec<LinearCountingBitmap>,
    last_ivl: crate::timestamp::Timestamp,
    rng: SmallRng,
}

impl FeatureExtractor {
    pub fn new(seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let hashes = (0..NUM_HASH).map(|_| H3Hash::new(&mut rng)).collect();
        FeatureExtractor {
            hashes,
            aggregate_bitmaps: (0..NUM_BITMAPS).map(|_| LinearCountingBitmap::new()).collect(),
            last_ivl: crate::timestamp::Timestamp::ZERO,
            rng,
        }
    }

    /// Extract the `NUM_FEATS`-long feature vector for one batch, against
    /// this module's running flush interval. `flush_ivl` is the module's
    /// interval width, used only to detect an interval rollover.
    pub fn extract(&mut self, batch: &Batch, flush_ivl: ::std::time::Duration) -> Vec<Feature> {
        let mut feats: Vec<Feature> = Vec::with_capacity(NUM_FEATS);
        feats.push(Feature { name: "pkts", value: 0.0 });
        feats.push(Feature { name: "bytes", value: 0.0 });
        feats.push(Feature { name: "newivl", value: 0.0 });
        for name in BITMAP_NAMES.iter() {
            feats.push(Feature { name, value: 0.0 }); // unique
        }
        for name in BITMAP_NAMES.iter() {
            feats.push(Feature { name, value: 0.0 }); // new
        }
        for name in BITMAP_NAMES.iter() {
            feats.push(Feature { name, value: 0.0 }); // batch-repeated
        }
        for name in BITMAP_NAMES.iter() {
            feats.push(Feature { name, value: 0.0 }); // aggregate-repeated
        }

        if batch.is_empty() {
            return feats;
        }

        let curr_ivl = batch
            .packets
            .first()
            .map(|p| p.ts.ceil_to_bin(flush_ivl, crate::timestamp::Timestamp::ZERO))
            .unwrap_or(crate::timestamp::Timestamp::ZERO);

        if curr_ivl != self.last_ivl {
            feats[2].value = 1.0;
            self.last_ivl = curr_ivl;
            let mut rng = SmallRng::seed_from_u64(self.rng.gen());
            for h in self.hashes.iter_mut() {
                *h = H3Hash::new(&mut rng);
            }
            for bm in self.aggregate_bitmaps.iter_mut() {
                bm.reset();
            }
        }

        // Seed the "new" slots with the negative of the pre-batch
        // aggregate estimate, so after OR-ing in this batch's bitmap the
        // feature reads as "how many keys are new to this interval".
        for (j, bm) in self.aggregate_bitmaps.iter().enumerate() {
            feats[3 + NUM_BITMAPS + j].value = -bm.estimate_unique_keys();
        }

        let mut batch_bitmaps: Vec<LinearCountingBitmap> =
            (0..NUM_BITMAPS).map(|_| LinearCountingBitmap::new()).collect();

        let mut count = 0u64;
        let mut bytes = 0u64;

        for pkt in &batch.packets {
            count += 1;
            bytes += pkt.cap_len as u64;

            let tuple = match extract_five_tuple(pkt) {
                Some(t) => t,
                None => continue,
            };

            let h0 = self.hashes[0].hash(&tuple.src_ip);
            let h1 = self.hashes[1].hash(&tuple.dst_ip);
            let h2 = self.hashes[2].hash(&[tuple.proto]);

            batch_bitmaps[0].set_bit(h0); // sip
            batch_bitmaps[1].set_bit(h1); // dip
            batch_bitmaps[2].set_bit(h0 ^ h1); // sip_dip

            let h3_net = self.hashes[0].hash(&tuple.src_ip[..3]);
            let h4_net = self.hashes[1].hash(&tuple.dst_ip[..3]);
            batch_bitmaps[9].set_bit(h3_net); // snet
            batch_bitmaps[10].set_bit(h4_net); // dnet
            batch_bitmaps[11].set_bit(h3_net ^ h4_net); // snet_dnet
            batch_bitmaps[12].set_bit(tuple.proto as u16); // proto

            let (sport, dport) = match (tuple.src_port, tuple.dst_port) {
                (Some(sp), Some(dp)) => (sp, dp),
                _ => continue,
            };
            let h3 = self.hashes[3].hash(&sport);
            let h4 = self.hashes[4].hash(&dport);

            batch_bitmaps[3].set_bit(h2 ^ h3); // proto_sport
            batch_bitmaps[4].set_bit(h2 ^ h4); // proto_dport
            batch_bitmaps[5].set_bit(h2 ^ h3 ^ h0); // proto_sport_sip
            batch_bitmaps[6].set_bit(h2 ^ h4 ^ h1); // proto_dport_dip
            batch_bitmaps[7].set_bit(h2 ^ h3 ^ h4); // proto_sport_dport
            batch_bitmaps[8].set_bit(h0 ^ h1 ^ h2 ^ h3 ^ h4); // 5tuple
        }

        feats[0].value = count as f64;
        feats[1].value = bytes as f64;

        for (j, bm) in self.aggregate_bitmaps.iter_mut().enumerate() {
            bm.or_with(&batch_bitmaps[j]);
        }

        for j in 0..NUM_BITMAPS {
            let unique = batch_bitmaps[j].estimate_unique_keys();
            feats[3 + j].value = unique;
            feats[3 + NUM_BITMAPS + j].value += self.aggregate_bitmaps[j].estimate_unique_keys();
            feats[3 + 2 * NUM_BITMAPS + j].value = count as f64 - unique;
            feats[3 + 3 * NUM_BITMAPS + j].value = count as f64 - feats[3 + NUM_BITMAPS + j].value;
        }

        feats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_cardinality_grows_with_distinct_bits() {
        let mut bm = LinearCountingBitmap::new();
        let empty_estimate = bm.estimate_unique_keys();
        assert!(empty_estimate.abs() < 1e-9);

        for i in 0..100u16 {
            bm.set_bit(i);
        }
        let estimate = bm.estimate_unique_keys();
        assert!(estimate > 90.0 && estimate < 110.0);
    }

    #[test]
    fn repeated_bit_does_not_inflate_set_count() {
        let mut bm = LinearCountingBitmap::new();
        assert!(!bm.set_bit(42));
        assert!(bm.set_bit(42));
        assert_eq!(bm.set_count, 1);
    }

    #[test]
    fn h3_hash_is_deterministic_for_a_fixed_seed() {
        let mut rng = SmallRng::seed_from_u64(7);
        let h = H3Hash::new(&mut rng);
        let a = h.hash(&[1, 2, 3, 4]);
        let b = h.hash(&[1, 2, 3, 4]);
        assert_eq!(a, b);
    }
}
