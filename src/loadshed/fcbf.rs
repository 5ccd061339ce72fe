//! Fast Correlation-Based Filter predictor selection (spec.md §4.9),
//! grounded on `original_source/.../loadshed/prediction.c`'s `corrcoef`
//! and `pred_sel`.

use super::features::NUM_FEATS;

/// Rolling window of observations kept per predictor/response pair.
pub const NUM_OBS: usize = 60;

/// `|r| > CORR_THRESH` is the FCBF relevance cutoff.
const CORR_THRESH: f64 = 0.6;

/// Welford's single-pass correlation coefficient, translated line for
/// line from `corrcoef()` (the sweep/delta formulation avoids a second
/// pass over the data, matching the original's numerical behaviour).
pub fn corrcoef(x: &[f64], y: &[f64]) -> f64 {
    let nobs = x.len();
    debug_assert_eq!(nobs, y.len());
    if nobs < 2 {
        return 0.0;
    }

    let mut mean_x = x[0];
    let mut mean_y = y[0];
    let mut sum_sq_x = 0.0;
    let mut sum_sq_y = 0.0;
    let mut sum_coproduct = 0.0;

    for i in 2..=nobs {
        let sweep = (i - 1) as f64 / i as f64;
        let delta_x = x[i - 1] - mean_x;
        let delta_y = y[i - 1] - mean_y;
        sum_sq_x += delta_x * delta_x * sweep;
        sum_sq_y += delta_y * delta_y * sweep;
        sum_coproduct += delta_x * delta_y * sweep;
        mean_x += delta_x / i as f64;
        mean_y += delta_y / i as f64;
    }

    let pop_sd_x = (sum_sq_x / nobs as f64).sqrt();
    let pop_sd_y = (sum_sq_y / nobs as f64).sqrt();
    if pop_sd_x == 0.0 || pop_sd_y == 0.0 {
        return 0.0;
    }
    let cov_x_y = sum_coproduct / nobs as f64;
    cov_x_y / (pop_sd_x * pop_sd_y)
}

/// A single predictor's rolling history plus its latest correlation
/// against the response variable.
#[derive(Clone)]
pub struct PredictorHistory {
    pub name: &'static str,
    pub values: [f64; NUM_OBS],
    pub corrcoef: f64,
}

impl PredictorHistory {
    fn new(name: &'static str) -> Self {
        PredictorHistory {
            name,
            values: [0.0; NUM_OBS],
            corrcoef: 0.0,
        }
    }
}

/// The full predictor/response history and FCBF selection state for one
/// module, mirroring `prediction_t`.
pub struct Prediction {
    pub hist: Vec<PredictorHistory>,
    pub resp: [f64; NUM_OBS],
    pub selected: Vec<usize>,
    obs: usize,
    filled: bool,
}

impl Prediction {
    pub fn new(names: &[&'static str]) -> Self {
        assert_eq!(names.len(), NUM_FEATS);
        Prediction {
            hist: names.iter().map(|&n| PredictorHistory::new(n)).collect(),
            resp: [0.0; NUM_OBS],
            selected: Vec::new(),
            obs: 0,
            filled: false,
        }
    }

    /// Record one observation: the feature vector plus the measured
    /// response (e.g. processing cycles for that batch).
    pub fn record(&mut self, feats: &[f64], response: f64) {
        debug_assert_eq!(feats.len(), self.hist.len());
        for (h, &v) in self.hist.iter_mut().zip(feats.iter()) {
            h.values[self.obs] = v;
        }
        self.resp[self.obs] = response;
        self.obs = (self.obs + 1) % NUM_OBS;
        if self.obs == 0 {
            self.filled = true;
        }
    }

    pub fn has_enough_history(&self) -> bool {
        self.filled
    }

    /// `pred_sel`: rank predictors by `|corrcoef|` against the response,
    /// keep those above `CORR_THRESH`, then drop any whose correlation
    /// with an already-selected, more-relevant predictor exceeds its own
    /// relevance to the response (the redundancy pass).
    pub fn select(&mut self) {
        for h in self.hist.iter_mut() {
            h.corrcoef = corrcoef(&h.values, &self.resp);
        }

        let mut ranked: Vec<usize> = (0..self.hist.len())
            .filter(|&i| self.hist[i].corrcoef.abs() > CORR_THRESH)
            .collect();
        ranked.sort_by(|&a, &b| {
            self.hist[b]
                .corrcoef
                .abs()
                .partial_cmp(&self.hist[a].corrcoef.abs())
                .unwrap()
        });

        let mut kept: Vec<usize> = Vec::new();
        'outer: for &cand in &ranked {
            for &k in &kept {
                let redund = corrcoef(&self.hist[k].values, &self.hist[cand].values);
                if redund.abs() > self.hist[cand].corrcoef.abs() {
                    continue 'outer;
                }
            }
            kept.push(cand);
        }

        self.selected = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfectly_correlated_series_gives_correlation_one() {
        let x: Vec<f64> = (0..NUM_OBS).map(|i| i as f64).collect();
        let y: Vec<f64> = (0..NUM_OBS).map(|i| 2.0 * i as f64 + 1.0).collect();
        let r = corrcoef(&x, &y);
        assert!((r - 1.0).abs() < 1e-9);
    }

    #[test]
    fn uncorrelated_constant_series_is_excluded_by_threshold() {
        let names: Vec<&'static str> = (0..NUM_FEATS).map(|_| "f").collect();
        let mut pred = Prediction::new(&names);
        for obs in 0..NUM_OBS {
            let feats: Vec<f64> = (0..NUM_FEATS).map(|_| 1.0).collect();
            pred.record(&feats, obs as f64);
        }
        pred.select();
        // a constant predictor has zero variance, so its correlation
        // coefficient is defined as 0 and never clears the threshold.
        assert!(pred.selected.is_empty());
    }

    #[test]
    fn redundant_predictor_is_pruned_in_favour_of_the_more_relevant_one() {
        let names: Vec<&'static str> = (0..NUM_FEATS).map(|_| "f").collect();
        let mut pred = Prediction::new(&names);
        for obs in 0..NUM_OBS {
            let mut feats = vec![0.0; NUM_FEATS];
            feats[0] = obs as f64; // strongly correlated with response
            feats[1] = obs as f64 * 1.0001; // near-duplicate of feats[0]
            pred.record(&feats, obs as f64);
        }
        pred.select();
        assert_eq!(pred.selected.len(), 1);
        assert_eq!(pred.selected[0], 0);
    }

    #[test]
    fn scenario_6_cold_start_needs_sixty_observations() {
        let names: Vec<&'static str> = (0..NUM_FEATS).map(|_| "f").collect();
        let mut pred = Prediction::new(&names);
        for obs in 0..NUM_OBS - 1 {
            let feats: Vec<f64> = (0..NUM_FEATS).map(|_| obs as f64).collect();
            pred.record(&feats, obs as f64);
            assert!(!pred.has_enough_history(), "should stay cold before {} observations", NUM_OBS);
        }
        let feats: Vec<f64> = (0..NUM_FEATS).map(|_| (NUM_OBS - 1) as f64).collect();
        pred.record(&feats, (NUM_OBS - 1) as f64);
        assert!(pred.has_enough_history(), "batch 60 should complete the rolling window");
        pred.select();
        assert!(!pred.selected.is_empty(), "a perfectly-correlated predictor should be selected at warm-up");
    }
}
