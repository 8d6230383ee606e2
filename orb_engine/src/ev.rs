/// ev.rs — Pooled Beta-Binomial EV estimator with LCB gating (C3)
///
/// Generalizes the teacher's single Φ(|Z|−z_exit) win-probability model
/// (`risk.rs::evaluate_ev`) into a full Bayesian Beta-Binomial posterior
/// per bucket with exponential decay, and replaces its direct `cdf` call
/// with the inverse direction of the same `statrs::distribution::Normal`
/// — `inverse_cdf` — to get the Wilson-style lower confidence bound.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::features::BucketKey;

/// Clamp epsilon for numerical stability per the source's explicit
/// guidance: compute `sqrt(p(1-p)/n)` only after clamping `p` away from
/// the boundary.
const EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PooledEVState {
    pub alpha: f64,
    pub beta: f64,
}

impl PooledEVState {
    pub fn new(alpha0: f64, beta0: f64) -> Self {
        Self { alpha: alpha0, beta: beta0 }
    }

    pub fn p_hat(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    pub fn n_eff(&self) -> f64 {
        self.alpha + self.beta
    }
}

/// Result of querying a bucket (or its global fallback) for an LCB.
#[derive(Debug, Clone, Copy)]
pub struct EvQuery {
    pub p_hat: f64,
    pub n_eff: f64,
    pub p_lcb: f64,
    /// `true` if the bucket itself was seeded (n_eff ≥ n_min); `false`
    /// if this query fell back to the global estimate or prior mean.
    pub bucket_seeded: bool,
}

/// Per-bucket + global Beta-Binomial estimator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PooledEvEstimator {
    #[serde(with = "bucket_map_as_vec")]
    buckets: HashMap<BucketKey, PooledEVState, ahash::RandomState>,
    global: PooledEVState,
    alpha0: f64,
    beta0: f64,
    decay: f64,
    n_min: f64,
    confidence: f64,
}

impl PooledEvEstimator {
    pub fn new(alpha0: f64, beta0: f64, decay: f64, n_min: f64, confidence: f64) -> Self {
        Self {
            buckets: HashMap::default(),
            global: PooledEVState::new(alpha0, beta0),
            alpha0,
            beta0,
            decay,
            n_min,
            confidence,
        }
    }

    pub fn global(&self) -> PooledEVState {
        self.global
    }

    pub fn bucket(&self, key: &BucketKey) -> Option<PooledEVState> {
        self.buckets.get(key).copied()
    }

    pub fn buckets(&self) -> &HashMap<BucketKey, PooledEVState, ahash::RandomState> {
        &self.buckets
    }

    /// Replace the current bucket/global state wholesale — used when
    /// restoring from a snapshot or seeding from an EV profile.
    pub fn set_bucket(&mut self, key: BucketKey, state: PooledEVState) {
        self.buckets.insert(key, state);
    }

    pub fn set_global(&mut self, state: PooledEVState) {
        self.global = state;
    }

    /// Update rule: `alpha ← alpha·(1−d) + alpha0·d + y`, `beta ← beta·(1−d) + beta0·d + (1−y)`.
    /// `y` is a binary outcome for Conservative fills, or a TP-probability
    /// `p_tp ∈ [0,1]` for Bridge fills (a partial update).
    pub fn update(&mut self, key: BucketKey, y: f64) {
        let d = self.decay;
        let entry = self
            .buckets
            .entry(key)
            .or_insert_with(|| PooledEVState::new(self.alpha0, self.beta0));
        entry.alpha = entry.alpha * (1.0 - d) + self.alpha0 * d + y;
        entry.beta = entry.beta * (1.0 - d) + self.beta0 * d + (1.0 - y);

        self.global.alpha = self.global.alpha * (1.0 - d) + self.alpha0 * d + y;
        self.global.beta = self.global.beta * (1.0 - d) + self.beta0 * d + (1.0 - y);
    }

    /// Query a bucket for its LCB, falling back to global then prior
    /// mean per §4.3: "When n_eff < n_min or bucket unseeded, fall back
    /// to global estimate; if global unseeded, to prior mean."
    pub fn query(&self, key: &BucketKey) -> EvQuery {
        if let Some(state) = self.buckets.get(key) {
            if state.n_eff() >= self.n_min {
                return self.lcb_from_state(*state, true);
            }
        }
        if self.global.n_eff() >= self.n_min {
            return self.lcb_from_state(self.global, false);
        }
        // Global itself unseeded: fall back to the prior mean with no
        // confidence adjustment (n_eff effectively at the prior).
        let prior = PooledEVState::new(self.alpha0, self.beta0);
        self.lcb_from_state(prior, false)
    }

    fn lcb_from_state(&self, state: PooledEVState, bucket_seeded: bool) -> EvQuery {
        let p_hat = state.p_hat().clamp(EPS, 1.0 - EPS);
        let n_eff = state.n_eff();
        if n_eff < 1.0 {
            return EvQuery {
                p_hat: state.p_hat(),
                n_eff,
                p_lcb: p_hat,
                bucket_seeded,
            };
        }
        let normal = Normal::new(0.0, 1.0).expect("standard normal");
        let z = normal.inverse_cdf(self.confidence);
        let p_lcb = (p_hat - z * (p_hat * (1.0 - p_hat) / n_eff).sqrt()).clamp(0.0, 1.0);
        EvQuery {
            p_hat: state.p_hat(),
            n_eff,
            p_lcb,
            bucket_seeded,
        }
    }
}

/// `ev_lcb = p_lcb·tp − (1−p_lcb)·sl − cost`, all in pips.
pub fn ev_lcb_pips(p_lcb: f64, tp_pips: f64, sl_pips: f64, cost_pips: f64) -> f64 {
    p_lcb * tp_pips - (1.0 - p_lcb) * sl_pips - cost_pips
}

/// Tracks the warmup-bypass window and the registry of calibration
/// positions admitted during it, so their outcome still feeds the
/// estimator once they settle — even after `warmup_left` reaches zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupTracker {
    pub warmup_left: u32,
    pub warmup_total: u32,
    /// order/signal id -> bucket key, for trades admitted under bypass
    /// whose outcome hasn't resolved yet.
    pending_calibrations: HashMap<u64, BucketKey>,
}

impl WarmupTracker {
    pub fn new(warmup_trades: u32) -> Self {
        Self {
            warmup_left: warmup_trades,
            warmup_total: warmup_trades,
            pending_calibrations: HashMap::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.warmup_left > 0
    }

    /// Register a warmup-admitted trade and decrement the counter.
    pub fn admit(&mut self, order_id: u64, key: BucketKey) {
        if self.warmup_left > 0 {
            self.warmup_left -= 1;
        }
        self.pending_calibrations.insert(order_id, key);
    }

    /// Drain a settled calibration position, returning its bucket key if
    /// it was indeed a warmup admission (so the caller can still feed
    /// the outcome into `PooledEvEstimator::update`).
    pub fn resolve(&mut self, order_id: u64) -> Option<BucketKey> {
        self.pending_calibrations.remove(&order_id)
    }
}

mod bucket_map_as_vec {
    use super::*;
    use serde::de::Deserializer;
    use serde::ser::Serializer;

    pub fn serialize<S>(
        map: &HashMap<BucketKey, PooledEVState, ahash::RandomState>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let v: Vec<(BucketKey, PooledEVState)> = map.iter().map(|(k, v)| (*k, *v)).collect();
        v.serialize(serializer)
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<HashMap<BucketKey, PooledEVState, ahash::RandomState>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v: Vec<(BucketKey, PooledEVState)> = Vec::deserialize(deserializer)?;
        Ok(v.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{RvBand, Session, SpreadBand, TrendFlag};

    fn key() -> BucketKey {
        BucketKey {
            session: Session::Ldn,
            spread_band: SpreadBand::Normal,
            rv_band: RvBand::Mid,
            trend_flag: TrendFlag::Ranging,
        }
    }

    /// EV update closure: alpha, beta stay non-negative and their sum
    /// stays strictly positive after any finite sequence of updates.
    #[test]
    fn ev_update_closure_holds() {
        let mut est = PooledEvEstimator::new(2.0, 2.0, 0.05, 30.0, 0.8);
        for i in 0..500 {
            est.update(key(), if i % 3 == 0 { 1.0 } else { 0.0 });
        }
        let state = est.bucket(&key()).unwrap();
        assert!(state.alpha >= 0.0);
        assert!(state.beta >= 0.0);
        assert!(state.alpha + state.beta > 0.0);
        assert!(!state.alpha.is_nan() && !state.beta.is_nan());
    }

    /// LCB bounds: 0 ≤ p_lcb ≤ p_hat ≤ 1.
    #[test]
    fn lcb_is_bounded_by_phat() {
        let mut est = PooledEvEstimator::new(2.0, 2.0, 0.02, 5.0, 0.8);
        for _ in 0..50 {
            est.update(key(), 1.0);
        }
        let q = est.query(&key());
        assert!(q.p_lcb >= 0.0 && q.p_lcb <= q.p_hat + 1e-9 && q.p_hat <= 1.0);
    }

    #[test]
    fn unseeded_bucket_falls_back_to_prior_mean() {
        let est = PooledEvEstimator::new(1.0, 3.0, 0.02, 30.0, 0.8);
        let q = est.query(&key());
        assert!((q.p_hat - 0.25).abs() < 1e-9);
        assert!(!q.bucket_seeded);
    }

    #[test]
    fn warmup_tracker_counts_down_and_resolves_late() {
        let mut wt = WarmupTracker::new(2);
        assert!(wt.is_active());
        wt.admit(1, key());
        assert_eq!(wt.warmup_left, 1);
        wt.admit(2, key());
        assert_eq!(wt.warmup_left, 0);
        assert!(!wt.is_active());
        // A third admission attempted after warmup ends doesn't
        // underflow the counter.
        wt.admit(3, key());
        assert_eq!(wt.warmup_left, 0);
        assert_eq!(wt.resolve(1), Some(key()));
        assert_eq!(wt.resolve(999), None);
    }

    #[test]
    fn ev_lcb_pips_matches_formula() {
        let v = ev_lcb_pips(0.6, 10.0, 5.0, 0.2);
        assert!((v - (0.6 * 10.0 - 0.4 * 5.0 - 0.2)).abs() < 1e-9);
    }
}
