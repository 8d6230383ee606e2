/// sizing.rs — Fractional Kelly sizing with caps, floor, cooldown (C4)
///
/// Generalizes the teacher's `risk.rs::kelly_fraction`/`position_size`
/// pair — same `f* = p·b − (1−p)` odds-ratio Kelly formula, same
/// clamp-then-scale shape — into the two-stage cap/floor design §4.4
/// describes: a hard `units_cap` ceiling, a `size_floor_mult` minimum,
/// and cooldown/day-loss guards layered on top.
use std::collections::HashMap;

use crate::config::RunnerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CooldownKey {
    pub side_is_buy: bool,
}

/// Tracks per-side cooldown bars remaining and cumulative daily loss,
/// the stateful part of the sizing gate.
#[derive(Debug, Clone, Default)]
pub struct SizingGuards {
    cooldown_bars_left: HashMap<CooldownKey, u32>,
    daily_loss_pips: f64,
    stopped_for_day: bool,
    last_signal_minute: Option<i64>,
}

impl SizingGuards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance cooldown counters by one bar. Call once per processed bar.
    pub fn tick(&mut self) {
        for v in self.cooldown_bars_left.values_mut() {
            if *v > 0 {
                *v -= 1;
            }
        }
    }

    pub fn reset_day(&mut self) {
        self.daily_loss_pips = 0.0;
        self.stopped_for_day = false;
    }

    pub fn on_trade_closed(&mut self, side_is_buy: bool, pnl_pips: f64, cooldown_bars: u32, max_daily_dd_pct: f64, equity: f64, pip_value: f64) {
        self.cooldown_bars_left.insert(CooldownKey { side_is_buy }, cooldown_bars);
        if pnl_pips < 0.0 {
            self.daily_loss_pips += -pnl_pips;
        }
        let max_daily_loss_pips = max_daily_dd_pct * equity / pip_value.max(1e-9);
        if self.daily_loss_pips >= max_daily_loss_pips {
            self.stopped_for_day = true;
        }
    }

    pub fn is_in_cooldown(&self, side_is_buy: bool) -> bool {
        self.cooldown_bars_left
            .get(&CooldownKey { side_is_buy })
            .copied()
            .unwrap_or(0)
            > 0
    }

    pub fn is_stopped_for_day(&self) -> bool {
        self.stopped_for_day
    }

    /// Suppress identical-minute duplicate signals on the same side.
    pub fn is_duplicate_minute(&self, minute_bucket: i64) -> bool {
        self.last_signal_minute == Some(minute_bucket)
    }

    pub fn record_signal_minute(&mut self, minute_bucket: i64) {
        self.last_signal_minute = Some(minute_bucket);
    }
}

/// Outcome of a sizing computation.
#[derive(Debug, Clone, Copy)]
pub struct SizingResult {
    pub units: f64,
    pub zero_qty: bool,
}

/// Compute the final order size in units.
///
/// `units_base = (risk_per_trade_pct·equity) / (pip_value·sl_pips)`
/// `b = tp/sl`; `f* = max(0, p − (1−p)/b)`
/// `units = clamp(units_base · min(units_cap, kelly_fraction·f*), 0, units_cap·units_base)`
/// with `size_floor_mult·units_base` applied as a minimum when the floor is active.
pub fn compute_size(
    p_lcb: f64,
    ev_seeded: bool,
    tp_pips: f64,
    sl_pips: f64,
    equity: f64,
    cfg: &RunnerConfig,
) -> SizingResult {
    if sl_pips <= 0.0 || tp_pips <= 0.0 {
        return SizingResult { units: 0.0, zero_qty: true };
    }

    let units_base = (cfg.risk_per_trade_pct * equity) / (cfg.pip_value * sl_pips);

    let p = if cfg.ev_mode == crate::config::EvMode::Off || !ev_seeded {
        if cfg.size_floor_mult > 0.0 {
            cfg.fallback_win_rate
        } else {
            p_lcb
        }
    } else {
        p_lcb
    };

    let b = tp_pips / sl_pips;
    let f_star = (p - (1.0 - p) / b).max(0.0);

    let scaled = cfg.kelly_fraction * f_star;
    let capped_fraction = scaled.min(cfg.units_cap);
    let mut units = (units_base * capped_fraction).clamp(0.0, cfg.units_cap * units_base);

    if cfg.size_floor_mult > 0.0 {
        let floor = cfg.size_floor_mult * units_base;
        if units < floor {
            units = floor;
        }
    }

    let zero_qty = units <= 1e-12;
    SizingResult { units, zero_qty }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;

    #[test]
    fn kelly_bounded_by_units_cap() {
        let mut cfg = RunnerConfig::default();
        cfg.units_cap = 2.0;
        cfg.kelly_fraction = 1.0;
        let r = compute_size(0.9, true, 10.0, 5.0, 10_000.0, &cfg);
        let units_base = (cfg.risk_per_trade_pct * 10_000.0) / (cfg.pip_value * 5.0);
        assert!(r.units <= cfg.units_cap * units_base + 1e-9);
    }

    #[test]
    fn zero_qty_when_sl_non_positive() {
        let cfg = RunnerConfig::default();
        let r = compute_size(0.6, true, 10.0, 0.0, 10_000.0, &cfg);
        assert!(r.zero_qty);
        assert_eq!(r.units, 0.0);
    }

    #[test]
    fn size_floor_applies_when_active() {
        let mut cfg = RunnerConfig::default();
        cfg.size_floor_mult = 0.5;
        cfg.kelly_fraction = 0.01;
        let r = compute_size(0.05, true, 10.0, 5.0, 10_000.0, &cfg);
        let units_base = (cfg.risk_per_trade_pct * 10_000.0) / (cfg.pip_value * 5.0);
        assert!(r.units >= cfg.size_floor_mult * units_base - 1e-9);
    }

    #[test]
    fn cooldown_blocks_same_side_after_fill() {
        let mut guards = SizingGuards::new();
        guards.on_trade_closed(true, -5.0, 3, 0.05, 10_000.0, 10.0);
        assert!(guards.is_in_cooldown(true));
        assert!(!guards.is_in_cooldown(false));
        guards.tick();
        guards.tick();
        assert!(guards.is_in_cooldown(true));
        guards.tick();
        assert!(!guards.is_in_cooldown(true));
    }

    #[test]
    fn daily_loss_cap_stops_trading_for_day() {
        let mut guards = SizingGuards::new();
        guards.on_trade_closed(true, -600.0, 0, 0.05, 10_000.0, 10.0);
        assert!(guards.is_stopped_for_day());
        guards.reset_day();
        assert!(!guards.is_stopped_for_day());
    }
}
