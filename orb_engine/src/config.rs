/// config.rs — Centralised runner configuration
///
/// The core never reads argv, environment variables, or a YAML manifest
/// itself — that parsing is an external collaborator (§1, §6). What the
/// core owns is this normalized struct: every parameter consumed by the
/// runner, grouped by concern, with documented defaults and a small
/// overrides-merge surface for the manifest layer to push
/// `runner.runner_config` values into.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Default round-trip cost estimate, in pips, before a spread-band-specific
/// slip model is warm.
pub const DEFAULT_COST_PIPS: f64 = 0.2;
pub const DEFAULT_SLIP_CAP_PIP: f64 = 1.0;

/// OCO/fill-policy defaults.
pub const DEFAULT_SAME_BAR_POLICY: SameBarPolicy = SameBarPolicy::ProtectivePriority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SameBarPolicy {
    TickPriority,
    ProtectivePriority,
    StopPriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillModel {
    Conservative,
    BrownianBridge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvMode {
    On,
    Off,
}

/// A single normalized runner configuration. Grouped the way the
/// teacher's `AppConfig` groups fee/risk/model/gate parameters, but with
/// no environment-loading method of its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    // ── Identity ──────────────────────────────────────────────────────
    pub strategy_id: String,
    pub symbol: String,
    pub mode: String,

    // ── Feature / OR window ──────────────────────────────────────────
    /// Number of bars forming the opening range.
    pub or_n: usize,
    pub atr_period: usize,
    pub adx_period: usize,
    pub rv_lookback_bars: usize,
    pub rv_history_cap: usize,
    pub rv_quantile_sessions: usize,

    // ── OCO sizing in pips ────────────────────────────────────────────
    pub k_tp: f64,
    pub k_sl: f64,
    pub k_tr: f64,

    // ── EV gate ───────────────────────────────────────────────────────
    pub ev_mode: EvMode,
    pub alpha0: f64,
    pub beta0: f64,
    pub decay: f64,
    pub n_min: f64,
    pub confidence: f64,
    pub threshold_lcb_pip: f64,
    pub warmup_trades: u32,
    pub ev_profile_obs_norm: f64,

    // ── Sizing ────────────────────────────────────────────────────────
    pub risk_per_trade_pct: f64,
    pub kelly_fraction: f64,
    pub units_cap: f64,
    pub size_floor_mult: f64,
    pub fallback_win_rate: f64,
    pub max_trade_loss_pct: f64,
    pub max_daily_dd_pct: f64,
    pub cooldown_bars: u32,

    // ── Fill engine ───────────────────────────────────────────────────
    pub fill_model: FillModel,
    pub same_bar_policy: SameBarPolicy,
    pub bridge_lambda: f64,
    pub bridge_mu_scale: f64,
    pub slip_cap_pip: f64,
    pub cost_pips: f64,

    // ── Capital ───────────────────────────────────────────────────────
    pub initial_equity: f64,
    pub pip_value: f64,

    // ── State / archive ───────────────────────────────────────────────
    pub archive_root: String,
    pub archive_retention: usize,

    // ── Guardrails (adaptive update worker) ──────────────────────────
    pub max_delta: f64,
    pub var_cap: f64,
    pub liquidity_cap: f64,

    // ── Debug buffer ──────────────────────────────────────────────────
    pub debug_record_sample_limit: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            strategy_id: "orb_v1".into(),
            symbol: "EURUSD".into(),
            mode: "backtest".into(),

            or_n: 3,
            atr_period: 14,
            adx_period: 14,
            rv_lookback_bars: 12,
            rv_history_cap: 2000,
            rv_quantile_sessions: 20,

            k_tp: 2.0,
            k_sl: 1.0,
            k_tr: 0.0,

            ev_mode: EvMode::On,
            alpha0: 2.0,
            beta0: 2.0,
            decay: 0.02,
            n_min: 30.0,
            confidence: 0.80,
            threshold_lcb_pip: 0.0,
            warmup_trades: 10,
            ev_profile_obs_norm: 15.0,

            risk_per_trade_pct: 0.01,
            kelly_fraction: 0.25,
            units_cap: 5.0,
            size_floor_mult: 0.0,
            fallback_win_rate: 0.5,
            max_trade_loss_pct: 0.02,
            max_daily_dd_pct: 0.05,
            cooldown_bars: 1,

            fill_model: FillModel::Conservative,
            same_bar_policy: DEFAULT_SAME_BAR_POLICY,
            bridge_lambda: 0.5,
            bridge_mu_scale: 1.0,
            slip_cap_pip: DEFAULT_SLIP_CAP_PIP,
            cost_pips: DEFAULT_COST_PIPS,

            initial_equity: 10_000.0,
            pip_value: 10.0,

            archive_root: "./archive".into(),
            archive_retention: 5,

            max_delta: 0.2,
            var_cap: 0.25,
            liquidity_cap: 0.5,

            debug_record_sample_limit: 10_000,
        }
    }
}

/// A scalar override value pushed in from the manifest's normalized
/// `runner.runner_config` section. Kept as an enum rather than a raw
/// string so the merge step does the parsing once, at the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    F64(f64),
    U32(u32),
    USize(usize),
    Str(String),
    Bool(bool),
}

impl RunnerConfig {
    /// Builder-style helper for tests and embedding callers.
    pub fn with_symbol(mut self, symbol: &str) -> Self {
        self.symbol = symbol.to_owned();
        self
    }

    pub fn with_warmup_trades(mut self, n: u32) -> Self {
        self.warmup_trades = n;
        self
    }

    pub fn with_threshold_lcb_pip(mut self, t: f64) -> Self {
        self.threshold_lcb_pip = t;
        self
    }

    /// Apply a normalized overrides map onto a default-initialized
    /// config. Unknown keys are ignored rather than erroring — the
    /// manifest layer may carry keys this core version doesn't
    /// recognize yet.
    pub fn merge_overrides(&mut self, overrides: &HashMap<String, ConfigValue>) {
        macro_rules! apply_f64 {
            ($key:literal, $field:ident) => {
                if let Some(ConfigValue::F64(v)) = overrides.get($key) {
                    self.$field = *v;
                }
            };
        }
        macro_rules! apply_usize {
            ($key:literal, $field:ident) => {
                if let Some(ConfigValue::USize(v)) = overrides.get($key) {
                    self.$field = *v;
                }
            };
        }
        macro_rules! apply_u32 {
            ($key:literal, $field:ident) => {
                if let Some(ConfigValue::U32(v)) = overrides.get($key) {
                    self.$field = *v;
                }
            };
        }
        macro_rules! apply_str {
            ($key:literal, $field:ident) => {
                if let Some(ConfigValue::Str(v)) = overrides.get($key) {
                    self.$field = v.clone();
                }
            };
        }

        apply_str!("strategy_id", strategy_id);
        apply_str!("symbol", symbol);
        apply_str!("mode", mode);
        apply_usize!("or_n", or_n);
        apply_f64!("k_tp", k_tp);
        apply_f64!("k_sl", k_sl);
        apply_f64!("k_tr", k_tr);
        apply_f64!("alpha0", alpha0);
        apply_f64!("beta0", beta0);
        apply_f64!("decay", decay);
        apply_f64!("n_min", n_min);
        apply_f64!("confidence", confidence);
        apply_f64!("threshold_lcb_pip", threshold_lcb_pip);
        apply_u32!("warmup_trades", warmup_trades);
        apply_f64!("ev_profile_obs_norm", ev_profile_obs_norm);
        apply_f64!("risk_per_trade_pct", risk_per_trade_pct);
        apply_f64!("kelly_fraction", kelly_fraction);
        apply_f64!("units_cap", units_cap);
        apply_f64!("size_floor_mult", size_floor_mult);
        apply_f64!("fallback_win_rate", fallback_win_rate);
        apply_f64!("max_trade_loss_pct", max_trade_loss_pct);
        apply_f64!("max_daily_dd_pct", max_daily_dd_pct);
        apply_u32!("cooldown_bars", cooldown_bars);
        apply_f64!("bridge_lambda", bridge_lambda);
        apply_f64!("bridge_mu_scale", bridge_mu_scale);
        apply_f64!("slip_cap_pip", slip_cap_pip);
        apply_f64!("cost_pips", cost_pips);
        apply_f64!("initial_equity", initial_equity);
        apply_f64!("pip_value", pip_value);
        apply_str!("archive_root", archive_root);
        apply_usize!("archive_retention", archive_retention);
        apply_f64!("max_delta", max_delta);
        apply_f64!("var_cap", var_cap);
        apply_f64!("liquidity_cap", liquidity_cap);
        apply_usize!("debug_record_sample_limit", debug_record_sample_limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_internally_consistent() {
        let cfg = RunnerConfig::default();
        assert!(cfg.decay > 0.0 && cfg.decay < 1.0);
        assert!(cfg.confidence > 0.0 && cfg.confidence < 1.0);
    }

    #[test]
    fn merge_overrides_applies_known_keys_only() {
        let mut cfg = RunnerConfig::default();
        let mut overrides = HashMap::new();
        overrides.insert("warmup_trades".to_string(), ConfigValue::U32(3));
        overrides.insert("threshold_lcb_pip".to_string(), ConfigValue::F64(0.3));
        overrides.insert("unknown_key".to_string(), ConfigValue::Bool(true));
        cfg.merge_overrides(&overrides);
        assert_eq!(cfg.warmup_trades, 3);
        assert!((cfg.threshold_lcb_pip - 0.3).abs() < 1e-12);
    }
}
