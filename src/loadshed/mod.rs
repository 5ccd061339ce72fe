//! Load-shedding controller (spec.md §4.9): per-module feature
//! extraction, FCBF predictor selection, SVD-based cycle prediction, and
//! the resulting packet/flow sampling rate. Grounded on
//! `original_source/.../loadshed/loadshed.c`.

pub mod fcbf;
pub mod features;
pub mod svd;

use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::merge::Batch;
use crate::packet::OwnedPacket;
use crate::timestamp::Timestamp;

const NUM_HASH_FLOW: usize = 5; // src_ip, dst_ip, src_port, dst_port, proto

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShedMethod {
    Packet,
    Flow,
}

/// Exponentially-weighted moving average update, used for both the
/// prediction-error and shedding-overhead running estimates
/// (`ewma()` in the original).
fn ewma(factor: f64, last_value: &mut f64, curr_value: f64) {
    if *last_value == 0.0 {
        *last_value = curr_value;
    } else {
        *last_value = (1.0 - factor) * *last_value + factor * curr_value;
    }
}

fn feature_names() -> Vec<&'static str> {
    let mut v = vec!["pkts", "bytes", "newivl"];
    for _ in 0..4 {
        v.extend(features::BITMAP_NAMES.iter());
    }
    v
}

/// Per-module load-shedding state: its configured method, current rate,
/// flow-sampling hash functions, and feature/prediction history.
pub struct ModuleLoadShed {
    pub method: ShedMethod,
    pub enabled: bool,
    pub srate: f64,
    tmp_srate: f64,
    max_srate: f64,
    last_seen_ivl_end: Timestamp,
    flow_hash: Vec<features::H3Hash>,
    extractor: features::FeatureExtractor,
    prediction: fcbf::Prediction,
    last_feats: Vec<f64>,
}

impl ModuleLoadShed {
    pub fn new(method: ShedMethod, enabled: bool, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let flow_hash = (0..NUM_HASH_FLOW).map(|_| features::H3Hash::new(&mut rng)).collect();
        ModuleLoadShed {
            method,
            enabled,
            srate: 1.0,
            tmp_srate: 1.0,
            max_srate: 0.0,
            last_seen_ivl_end: Timestamp::ZERO,
            flow_hash,
            extractor: features::FeatureExtractor::new(seed),
            prediction: fcbf::Prediction::new(&feature_names()),
            last_feats: vec![0.0; features::NUM_FEATS],
        }
    }
}

/// `shed_load`'s per-packet decision, pulled out as a pure function.
/// Returns `true` if the packet should be kept, `false` if it should be
/// shed. Crossing into a new measurement interval re-seeds the flow hash
/// functions and, for flow sampling, releases the cap that otherwise
/// prevents the sampling rate from climbing mid-interval.
pub fn shed_packet(m: &mut ModuleLoadShed, pkt: &OwnedPacket, ivl_end: Timestamp, rng: &mut impl Rng) -> bool {
    if m.srate >= 1.0 {
        return true;
    }

    if pkt.ts >= ivl_end && ivl_end != m.last_seen_ivl_end {
        m.last_seen_ivl_end = ivl_end;
        let mut seed_rng = SmallRng::seed_from_u64(rng.gen());
        for h in m.flow_hash.iter_mut() {
            *h = features::H3Hash::new(&mut seed_rng);
        }
        if m.method == ShedMethod::Flow {
            m.max_srate = 0.0;
            m.srate = m.tmp_srate;
        }
    }

    if m.method == ShedMethod::Flow {
        m.tmp_srate = m.srate;
        if m.max_srate == 0.0 {
            m.max_srate = m.srate;
        } else if m.srate >= m.max_srate {
            m.srate = m.max_srate;
        } else {
            m.max_srate = m.srate;
        }
    }

    match m.method {
        ShedMethod::Packet => {
            let r: f64 = rng.gen();
            m.srate >= r
        }
        ShedMethod::Flow => {
            let tuple = match features::extract_five_tuple(pkt) {
                Some(t) => t,
                None => return true,
            };
            let (sport, dport) = match (tuple.src_port, tuple.dst_port) {
                (Some(s), Some(d)) => (s, d),
                _ => ([0u8; 2], [0u8; 2]),
            };
            let hash = m.flow_hash[0].hash(&tuple.src_ip) as u32
                ^ m.flow_hash[1].hash(&tuple.dst_ip) as u32
                ^ m.flow_hash[2].hash(&sport) as u32
                ^ m.flow_hash[3].hash(&dport) as u32
                ^ m.flow_hash[4].hash(&[tuple.proto]) as u32;
            let threshold = (m.srate * u32::max_value() as f64) as u32;
            hash <= threshold
        }
    }
}

/// Coordinates load shedding across every module: feature extraction,
/// FCBF predictor selection, SVD-based cycle prediction, and the
/// resulting per-turn shedding rate (spec.md §4.9).
pub struct LoadShedController {
    /// Nominal cycle rate used to translate wall-clock time into a
    /// "cycles" budget — the original reads this from `cpuid`; we take
    /// it from config instead (Design Note §9: no idiomatic, portable
    /// Rust equivalent to brand-string frequency parsing).
    cpu_freq_hz: f64,
    perror_ewma: f64,
    shed_ewma: f64,
    ewma_factor: f64,
    per_module: HashMap<u8, ModuleLoadShed>,
    rng: SmallRng,
}

impl LoadShedController {
    pub fn new(cpu_freq_hz: f64, seed: u64) -> Self {
        LoadShedController {
            cpu_freq_hz,
            perror_ewma: 0.0,
            shed_ewma: 0.0,
            ewma_factor: 0.1,
            per_module: HashMap::new(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn register_module(&mut self, id: u8, method: ShedMethod, enabled: bool) {
        self.per_module
            .entry(id)
            .or_insert_with(|| ModuleLoadShed::new(method, enabled, id as u64 ^ 0xA5A5_A5A5_A5A5_A5A5));
    }

    pub fn unregister_module(&mut self, id: u8) {
        self.per_module.remove(&id);
    }

    pub fn srate(&self, id: u8) -> f64 {
        self.per_module.get(&id).map(|m| m.srate).unwrap_or(1.0)
    }

    pub fn module_mut(&mut self, id: u8) -> Option<&mut ModuleLoadShed> {
        self.per_module.get_mut(&id)
    }

    /// `get_avail_cycles`: the cycle budget this turn's `timebin` allows,
    /// net of the core's own measured overhead.
    pub fn avail_cycles(&self, timebin: Duration, ca_overhead: Duration) -> f64 {
        let budget = timebin.as_secs_f64() * self.cpu_freq_hz;
        (budget - ca_overhead.as_secs_f64() * self.cpu_freq_hz).max(0.0)
    }

    /// `compute_srate`: the fraction of predicted load this turn's cycle
    /// budget can afford, clipped to `[0, 1]`.
    pub fn compute_srate(&self, avail_cycles: f64, pred_cycles: f64) -> f64 {
        let srate = if pred_cycles == 0.0 {
            1.0
        } else {
            (avail_cycles - self.shed_ewma).max(0.0) / (pred_cycles * (1.0 + self.perror_ewma))
        };
        srate.min(1.0)
    }

    /// Runs one turn's feature extraction and FCBF/SVD prediction for
    /// every enabled module, then assigns the resulting rate uniformly
    /// (the original's `assign_srates` is itself a placeholder note:
    /// "XXX for now, just assign the same shedding rate to all modules").
    pub fn update(&mut self, batch: &Batch, flush_ivl: Duration, timebin: Duration, ca_overhead: Duration) {
        let mut total_pred = 0.0;

        for m in self.per_module.values_mut().filter(|m| m.enabled) {
            let feats = m.extractor.extract(batch, flush_ivl);
            let values: Vec<f64> = feats.iter().map(|f| f.value).collect();
            m.last_feats = values.clone();

            if m.prediction.has_enough_history() {
                m.prediction.select();
                if !m.prediction.selected.is_empty() {
                    let selected_hist: Vec<&[f64]> = m
                        .prediction
                        .selected
                        .iter()
                        .map(|&i| &m.prediction.hist[i].values[..])
                        .collect();
                    let next_obs: Vec<f64> = m.prediction.selected.iter().map(|&i| values[i]).collect();
                    let pred = svd::predict(&selected_hist, &next_obs, &m.prediction.resp, fcbf::NUM_OBS);
                    total_pred += pred;
                }
            }
        }

        let avail = self.avail_cycles(timebin, ca_overhead);
        let srate = self.compute_srate(avail, total_pred);

        for m in self.per_module.values_mut().filter(|m| m.enabled) {
            m.srate = srate;
        }

        log::debug!("load-shedding: avail_cycles={:.0} pred_cycles={:.0} srate={:.3}", avail, total_pred, srate);
    }

    /// Feeds this turn's measured response (actual cycles consumed by a
    /// module) back into its predictor history and updates the running
    /// prediction-error estimate used by [`compute_srate`].
    pub fn record_response(&mut self, id: u8, measured_cycles: f64, predicted_cycles: f64) {
        if predicted_cycles > 0.0 {
            let error = ((1.0 - measured_cycles / predicted_cycles) as f64).abs();
            ewma(self.ewma_factor, &mut self.perror_ewma, error);
        }
        if let Some(m) = self.per_module.get_mut(&id) {
            let feats = m.last_feats.clone();
            m.prediction.record(&feats, measured_cycles);
        }
    }

    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{LayerOffsets, LayerTag};

    #[test]
    fn compute_srate_returns_one_when_no_load_is_predicted() {
        let ctl = LoadShedController::new(1e9, 1);
        assert_eq!(ctl.compute_srate(1_000_000.0, 0.0), 1.0);
    }

    #[test]
    fn compute_srate_never_exceeds_one() {
        let ctl = LoadShedController::new(1e9, 1);
        let srate = ctl.compute_srate(10_000_000.0, 1_000.0);
        assert!(srate <= 1.0);
    }

    #[test]
    fn packet_sampling_rejects_with_probability_near_one_minus_srate() {
        let mut m = ModuleLoadShed::new(ShedMethod::Packet, true, 42);
        m.srate = 0.5;
        let mut rng = SmallRng::seed_from_u64(7);
        let pkt = OwnedPacket {
            ts: Timestamp::ZERO,
            wire_len: 64,
            cap_len: 64,
            source: 0,
            type_tag: LayerTag::empty(),
            dropped_since_last: 0,
            offsets: LayerOffsets::default(),
            payload: vec![0; 64],
        };
        let mut kept = 0;
        for _ in 0..2000 {
            if shed_packet(&mut m, &pkt, Timestamp::ZERO, &mut rng) {
                kept += 1;
            }
        }
        let ratio = kept as f64 / 2000.0;
        assert!(ratio > 0.4 && ratio < 0.6, "ratio was {}", ratio);
    }

    #[test]
    fn full_srate_never_sheds() {
        let mut m = ModuleLoadShed::new(ShedMethod::Packet, true, 1);
        m.srate = 1.0;
        let mut rng = SmallRng::seed_from_u64(3);
        let pkt = OwnedPacket {
            ts: Timestamp::ZERO,
            wire_len: 64,
            cap_len: 64,
            source: 0,
            type_tag: LayerTag::empty(),
            dropped_since_last: 0,
            offsets: LayerOffsets::default(),
            payload: vec![0; 64],
        };
        for _ in 0..100 {
            assert!(shed_packet(&mut m, &pkt, Timestamp::ZERO, &mut rng));
        }
    }
}
