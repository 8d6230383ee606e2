/// features.rs — Feature pipeline (C2)
///
/// Maintains ATR14/ADX14 via Wilder smoothing, a bounded realized-
/// volatility history with daily-recomputed quantile cutpoints, spread
/// and session banding, and produces the per-bar `Context` strategy
/// hooks read from. Mirrors the incremental-update-struct shape the
/// GARCH/OFI rolling-window engines in this codebase use (push one
/// observation, return the latest derived value), generalized from a
/// volatility-regime classifier to the ATR/ADX/RV/spread pipeline this
/// strategy needs.
use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::bar::Bar;
use crate::pips::PipTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum Session {
    Tok,
    Ldn,
    Ny,
}

impl Session {
    /// TOK [00:00,08:00), LDN [08:00,13:00), NY [13:00,22:00), else TOK.
    pub fn from_utc_hour(hour: u32) -> Self {
        if (8..13).contains(&hour) {
            Session::Ldn
        } else if (13..22).contains(&hour) {
            Session::Ny
        } else {
            Session::Tok
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum SpreadBand {
    Narrow,
    Normal,
    Wide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum RvBand {
    Low,
    Mid,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum TrendFlag {
    Trending,
    Ranging,
}

/// The `(session, spread_band, rv_band, trend_flag)` discriminated sum,
/// packed as a single hashable/equatable key so the EV estimator's
/// per-bucket map never allocates a string on the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub session: Session,
    pub spread_band: SpreadBand,
    pub rv_band: RvBand,
    pub trend_flag: TrendFlag,
}

impl BucketKey {
    /// Stable string form used only for archive/report serialization
    /// (EV profile files, CSV columns) — never for hot-path map lookups.
    pub fn as_key_string(&self) -> String {
        format!(
            "{:?}/{:?}/{:?}/{:?}",
            self.session, self.spread_band, self.rv_band, self.trend_flag
        )
    }
}

/// EV-profile / strategy-facing statistics summary for a bucket.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EvProfileStats {
    pub long_term: Option<f64>,
    pub recent: Option<f64>,
}

/// Immutable-per-bar context handed to strategy hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub session: Session,
    pub spread_band: SpreadBand,
    pub rv_band: RvBand,
    pub trend_flag: TrendFlag,
    pub atr_pips: f64,
    pub or_atr_ratio: f64,
    pub cost_pips: f64,
    pub ev_profile_stats: EvProfileStats,
    pub loss_streak: u32,
    pub daily_trade_count: u32,
    pub daily_loss_pips: f64,
}

impl Context {
    pub fn bucket_key(&self) -> BucketKey {
        BucketKey {
            session: self.session,
            spread_band: self.spread_band,
            rv_band: self.rv_band,
            trend_flag: self.trend_flag,
        }
    }

    /// Coerce any non-finite numeric field to a sane default and
    /// validate that every required field is populated. The context is
    /// already fully typed in Rust (unlike a duck-typed map), so
    /// "sanitization" here means clamping NaN/Inf, not filling in
    /// missing keys.
    pub fn sanitize(mut self) -> Self {
        if !self.atr_pips.is_finite() {
            self.atr_pips = 0.0;
        }
        if !self.or_atr_ratio.is_finite() {
            self.or_atr_ratio = 0.0;
        }
        if !self.cost_pips.is_finite() {
            self.cost_pips = 0.0;
        }
        if !self.daily_loss_pips.is_finite() {
            self.daily_loss_pips = 0.0;
        }
        self
    }
}

/// Wilder-smoothed running average (used for both ATR and the
/// directional-movement terms inside ADX).
#[derive(Debug, Clone)]
struct Wilder {
    period: usize,
    seed_buf: Vec<f64>,
    value: Option<f64>,
}

impl Wilder {
    fn new(period: usize) -> Self {
        Self {
            period,
            seed_buf: Vec::with_capacity(period),
            value: None,
        }
    }

    /// Push one observation, return the smoothed value (NaN until seeded).
    fn push(&mut self, x: f64) -> f64 {
        match self.value {
            None => {
                self.seed_buf.push(x);
                if self.seed_buf.len() >= self.period {
                    let seed = self.seed_buf.iter().sum::<f64>() / self.period as f64;
                    self.value = Some(seed);
                    seed
                } else {
                    f64::NAN
                }
            }
            Some(v) => {
                let next = (v * (self.period as f64 - 1.0) + x) / self.period as f64;
                self.value = Some(next);
                next
            }
        }
    }

    fn is_seeded(&self) -> bool {
        self.value.is_some()
    }
}

/// The full per-symbol feature pipeline: ATR14, ADX14, RV history and
/// banding, spread banding. One instance per symbol, owned by the
/// Runner.
pub struct FeaturePipeline {
    pip_table: PipTable,
    atr: Wilder,
    // ADX support series
    plus_dm: Wilder,
    minus_dm: Wilder,
    tr_for_adx: Wilder,
    dx_avg: Wilder,
    prev_bar: Option<Bar>,
    log_returns: VecDeque<f64>,
    rv_lookback_bars: usize,
    rv_history: VecDeque<f64>,
    rv_history_cap: usize,
    rv_cutpoints: (f64, f64),
    last_quantile_day: Option<chrono::NaiveDate>,
    or_high: Option<f64>,
    or_low: Option<f64>,
    or_bar_count: usize,
    or_n: usize,
    spread_narrow_pip: f64,
    spread_wide_pip: f64,
    missing_cols: u64,
}

impl FeaturePipeline {
    pub fn new(pip_table: PipTable, atr_period: usize, adx_period: usize, rv_lookback_bars: usize, rv_history_cap: usize, or_n: usize) -> Self {
        Self {
            pip_table,
            atr: Wilder::new(atr_period),
            plus_dm: Wilder::new(adx_period),
            minus_dm: Wilder::new(adx_period),
            tr_for_adx: Wilder::new(adx_period),
            dx_avg: Wilder::new(adx_period),
            prev_bar: None,
            log_returns: VecDeque::with_capacity(rv_lookback_bars),
            rv_lookback_bars,
            rv_history: VecDeque::new(),
            rv_history_cap,
            rv_cutpoints: (0.0003, 0.0007),
            last_quantile_day: None,
            or_high: None,
            or_low: None,
            or_bar_count: 0,
            or_n,
            spread_narrow_pip: 0.8,
            spread_wide_pip: 2.0,
            missing_cols: 0,
        }
    }

    pub fn missing_cols(&self) -> u64 {
        self.missing_cols
    }

    /// Reset the opening-range window. Called by the runner at the
    /// first bar of a new session/day per its own policy.
    pub fn reset_opening_range(&mut self) {
        self.or_high = None;
        self.or_low = None;
        self.or_bar_count = 0;
    }

    /// Current opening-range high/low, if the window has at least one bar.
    pub fn opening_range(&self) -> Option<(f64, f64)> {
        match (self.or_high, self.or_low) {
            (Some(h), Some(l)) => Some((h, l)),
            _ => None,
        }
    }

    pub fn or_window_complete(&self) -> bool {
        self.or_bar_count >= self.or_n
    }

    /// Process one validated bar, returning the derived context. `None`
    /// is never returned for a validated bar — a bar that fails schema
    /// validation is the caller's responsibility to skip before calling
    /// this (see §4.1's failure mode: `missing_cols` is tracked by the
    /// caller at the CSV layer, not recomputed here).
    pub fn on_bar(&mut self, bar: &Bar) -> Context {
        // ── Opening range bookkeeping ───────────────────────────────
        self.or_high = Some(self.or_high.map_or(bar.high, |h| h.max(bar.high)));
        self.or_low = Some(self.or_low.map_or(bar.low, |l| l.min(bar.low)));
        self.or_bar_count += 1;

        // ── True range / ATR ────────────────────────────────────────
        let tr = match &self.prev_bar {
            Some(p) => {
                let a = bar.high - bar.low;
                let b = (bar.high - p.close).abs();
                let c = (bar.low - p.close).abs();
                a.max(b).max(c)
            }
            None => bar.high - bar.low,
        };
        let atr_price = self.atr.push(tr);
        let atr_pips = self.pip_table.price_to_pips(&bar.symbol, atr_price);

        // ── Directional movement / ADX ──────────────────────────────
        let (plus_dm_raw, minus_dm_raw) = match &self.prev_bar {
            Some(p) => {
                let up_move = bar.high - p.high;
                let down_move = p.low - bar.low;
                let plus = if up_move > down_move && up_move > 0.0 { up_move } else { 0.0 };
                let minus = if down_move > up_move && down_move > 0.0 { down_move } else { 0.0 };
                (plus, minus)
            }
            None => (0.0, 0.0),
        };
        let plus_dm_s = self.plus_dm.push(plus_dm_raw);
        let minus_dm_s = self.minus_dm.push(minus_dm_raw);
        let tr_s = self.tr_for_adx.push(tr);
        let adx = if tr_s.is_finite() && tr_s > 1e-12 && plus_dm_s.is_finite() && minus_dm_s.is_finite() {
            let plus_di = 100.0 * plus_dm_s / tr_s;
            let minus_di = 100.0 * minus_dm_s / tr_s;
            let di_sum = plus_di + minus_di;
            let dx = if di_sum > 1e-12 { 100.0 * (plus_di - minus_di).abs() / di_sum } else { 0.0 };
            self.dx_avg.push(dx)
        } else {
            f64::NAN
        };
        let trend_flag = if adx.is_finite() && adx >= 25.0 {
            TrendFlag::Trending
        } else {
            TrendFlag::Ranging
        };

        // ── Realized volatility ─────────────────────────────────────
        let log_ret = match &self.prev_bar {
            Some(p) => bar.log_return(p.close),
            None => 0.0,
        };
        self.log_returns.push_back(log_ret);
        if self.log_returns.len() > self.rv_lookback_bars {
            self.log_returns.pop_front();
        }
        let rv = stdev(self.log_returns.iter().copied());
        if rv.is_finite() {
            self.rv_history.push_back(rv);
            if self.rv_history.len() > self.rv_history_cap {
                self.rv_history.pop_front();
            }
        }

        // Recompute quantile cutpoints once at the first bar of a new UTC day.
        let today = bar.timestamp.date_naive();
        if self.last_quantile_day != Some(today) {
            self.last_quantile_day = Some(today);
            if self.rv_history.len() >= 20 {
                let mut sorted: Vec<f64> = self.rv_history.iter().copied().collect();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
                self.rv_cutpoints = (quantile(&sorted, 0.33), quantile(&sorted, 0.67));
            }
        }
        let rv_band = if !rv.is_finite() {
            RvBand::Mid
        } else if rv <= self.rv_cutpoints.0 {
            RvBand::Low
        } else if rv <= self.rv_cutpoints.1 {
            RvBand::Mid
        } else {
            RvBand::High
        };

        // ── Spread band ──────────────────────────────────────────────
        let spread_pips = if bar.spread > 0.0 {
            self.pip_table.price_to_pips(&bar.symbol, bar.spread)
        } else {
            // Fall back to a proxy when spread is missing: k × (high-low).
            self.pip_table.price_to_pips(&bar.symbol, 0.1 * (bar.high - bar.low))
        };
        let spread_band = if spread_pips <= self.spread_narrow_pip {
            SpreadBand::Narrow
        } else if spread_pips <= self.spread_wide_pip {
            SpreadBand::Normal
        } else {
            SpreadBand::Wide
        };

        // ── Opening range ratio ───────────────────────────────────────
        let or_atr_ratio = match (self.or_high, self.or_low) {
            (Some(h), Some(l)) if atr_pips.is_finite() && atr_pips > 1e-9 => {
                self.pip_table.price_to_pips(&bar.symbol, h - l) / atr_pips
            }
            _ => f64::NAN,
        };

        let session = Session::from_utc_hour(bar.timestamp.hour());

        self.prev_bar = Some(bar.clone());

        Context {
            session,
            spread_band,
            rv_band,
            trend_flag,
            atr_pips,
            or_atr_ratio,
            cost_pips: spread_pips,
            ev_profile_stats: EvProfileStats::default(),
            loss_streak: 0,
            daily_trade_count: 0,
            daily_loss_pips: 0.0,
        }
        .sanitize()
    }

    /// `true` once ATR is seeded; Runner treats an unarmed pipeline as
    /// "no signals" regardless of what the strategy emits.
    pub fn is_armed(&self) -> bool {
        self.atr.is_seeded()
    }

    /// Current RV quantile cutpoints, for snapshot export.
    pub fn rv_cutpoints(&self) -> (f64, f64) {
        self.rv_cutpoints
    }

    /// Restore RV quantile cutpoints from a loaded snapshot, so a resumed
    /// run doesn't re-cold-start its RV banding at the config defaults.
    pub fn set_rv_cutpoints(&mut self, cutpoints: (f64, f64)) {
        self.rv_cutpoints = cutpoints;
    }
}

fn stdev(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let data: Vec<f64> = values.collect();
    if data.len() < 2 {
        return f64::NAN;
    }
    let mean = data.iter().sum::<f64>() / data.len() as f64;
    let var = data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    var.sqrt()
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn bar_at(hour: u32, minute: u32, o: f64, h: f64, l: f64, c: f64) -> Bar {
        let ts: DateTime<Utc> = Utc.with_ymd_and_hms(2024, 1, 2, hour, minute, 0).unwrap();
        Bar::validate(ts, "EURUSD".into(), crate::bar::Timeframe::M5, o, h, l, c, 100.0, 0.0001).unwrap()
    }

    #[test]
    fn session_buckets_match_utc_hours() {
        assert_eq!(Session::from_utc_hour(3), Session::Tok);
        assert_eq!(Session::from_utc_hour(9), Session::Ldn);
        assert_eq!(Session::from_utc_hour(15), Session::Ny);
        assert_eq!(Session::from_utc_hour(23), Session::Tok);
    }

    #[test]
    fn atr_unarmed_until_seeded() {
        let mut fp = FeaturePipeline::new(PipTable::new(), 14, 14, 12, 2000, 3);
        for h in 0..13 {
            let bar = bar_at(0, h, 1.10, 1.102, 1.098, 1.101);
            fp.on_bar(&bar);
            assert!(!fp.is_armed());
        }
        let bar = bar_at(0, 13, 1.10, 1.102, 1.098, 1.101);
        fp.on_bar(&bar);
        assert!(fp.is_armed());
    }

    #[test]
    fn opening_range_accumulates_high_low() {
        let mut fp = FeaturePipeline::new(PipTable::new(), 14, 14, 12, 2000, 3);
        fp.on_bar(&bar_at(0, 0, 1.10, 1.105, 1.095, 1.102));
        fp.on_bar(&bar_at(0, 5, 1.102, 1.108, 1.100, 1.103));
        let (h, l) = fp.opening_range().unwrap();
        assert!((h - 1.108).abs() < 1e-9);
        assert!((l - 1.095).abs() < 1e-9);
        assert!(!fp.or_window_complete());
        fp.on_bar(&bar_at(0, 10, 1.103, 1.104, 1.099, 1.101));
        assert!(fp.or_window_complete());
    }

    #[test]
    fn bucket_key_round_trips_through_context() {
        let mut fp = FeaturePipeline::new(PipTable::new(), 14, 14, 12, 2000, 3);
        let ctx = fp.on_bar(&bar_at(9, 0, 1.10, 1.102, 1.098, 1.101));
        assert_eq!(ctx.bucket_key().session, Session::Ldn);
    }
}
