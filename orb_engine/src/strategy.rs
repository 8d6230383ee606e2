/// strategy.rs — Capability-trait strategy adapter + the ORB strategy (C6)
///
/// Generalizes the `SignalSink`/pluggable-strategy-list pattern from the
/// corpus's event-loop engine: strategies are a trait object behind a
/// thin adapter, not a hard-coded `if` chain. Every hook is optional
/// (default no-op) and fallible; the adapter is the one place a hook's
/// `Err` gets caught, counted, and downgraded to the corresponding
/// permissive default rather than aborting the run.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bar::Bar;
use crate::error::StrategyHookError;
use crate::features::Context;
use crate::fill::{ExitReason, FillOutcome, Side};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SignalIntent {
    pub side: Side,
    pub tp_pips: f64,
    pub sl_pips: f64,
    pub trail_pips: f64,
}

/// Capability trait: a strategy implements only the hooks it needs.
/// All have permissive default bodies so `Strategy for X { fn signals }`
/// alone is a valid, fully-functional strategy.
pub trait Strategy {
    fn on_start(&mut self) -> Result<(), StrategyHookError> {
        Ok(())
    }

    fn on_bar(&mut self, _bar: &Bar, _ctx: &Context) -> Result<(), StrategyHookError> {
        Ok(())
    }

    fn signals(&mut self, bar: &Bar, ctx: &Context) -> Result<Vec<SignalIntent>, StrategyHookError>;

    /// Strategy-level admission gate, evaluated before the EV gate.
    /// Default: always admit.
    fn strategy_gate(&self, _bar: &Bar, _ctx: &Context, _intent: &SignalIntent) -> Result<bool, StrategyHookError> {
        Ok(true)
    }

    /// Optional per-bucket LCB threshold override; `None` defers to the
    /// runner's configured `threshold_lcb_pip`.
    fn ev_threshold(&self, _ctx: &Context) -> Result<Option<f64>, StrategyHookError> {
        Ok(None)
    }

    fn on_fill(&mut self, _outcome: &FillOutcome) -> Result<(), StrategyHookError> {
        Ok(())
    }

    fn export_state(&self) -> Result<Value, StrategyHookError> {
        Ok(Value::Null)
    }

    fn load_state(&mut self, _state: &Value) -> Result<(), StrategyHookError> {
        Ok(())
    }
}

/// Wraps a `Strategy` and catches every hook's `Err`, turning it into a
/// counter bump plus a bounded debug record, then falling back to the
/// permissive default for that hook's return type — a breakout signal,
/// an admission gate, or an EV threshold override never aborts a run
/// because one hook call misbehaved.
pub struct StrategyAdapter<S: Strategy> {
    inner: S,
    pub hook_failures: u64,
    debug_records: Vec<String>,
    debug_limit: usize,
}

impl<S: Strategy> StrategyAdapter<S> {
    pub fn new(inner: S, debug_limit: usize) -> Self {
        Self {
            inner,
            hook_failures: 0,
            debug_records: Vec::new(),
            debug_limit,
        }
    }

    pub fn debug_records(&self) -> &[String] {
        &self.debug_records
    }

    /// Access to the wrapped strategy for runner-side concrete hooks
    /// (e.g. `OrbBreakoutStrategy::set_opening_range`) that aren't part
    /// of the capability trait itself.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    fn record_failure(&mut self, hook: &str, err: &StrategyHookError) {
        self.hook_failures += 1;
        if self.debug_records.len() < self.debug_limit {
            self.debug_records.push(format!("{hook}: {err}"));
        }
    }

    pub fn on_start(&mut self) {
        if let Err(e) = self.inner.on_start() {
            self.record_failure("on_start", &e);
        }
    }

    pub fn on_bar(&mut self, bar: &Bar, ctx: &Context) {
        if let Err(e) = self.inner.on_bar(bar, ctx) {
            self.record_failure("on_bar", &e);
        }
    }

    pub fn signals(&mut self, bar: &Bar, ctx: &Context) -> Vec<SignalIntent> {
        match self.inner.signals(bar, ctx) {
            Ok(v) => v,
            Err(e) => {
                self.record_failure("signals", &e);
                Vec::new()
            }
        }
    }

    /// Returns `(admit, hook_errored)`. On `Err`, falls back to the
    /// permissive `true` but flags `hook_errored` so the caller can
    /// surface the failure in its own counters/records.
    pub fn strategy_gate(&mut self, bar: &Bar, ctx: &Context, intent: &SignalIntent) -> (bool, bool) {
        match self.inner.strategy_gate(bar, ctx, intent) {
            Ok(v) => (v, false),
            Err(e) => {
                self.record_failure("strategy_gate", &e);
                (true, true)
            }
        }
    }

    /// Returns `(override, hook_errored)`. On `Err`, falls back to `None`
    /// (defer to the runner's configured threshold) but flags
    /// `hook_errored` so the caller can surface the failure.
    pub fn ev_threshold(&mut self, ctx: &Context) -> (Option<f64>, bool) {
        match self.inner.ev_threshold(ctx) {
            Ok(v) => (v, false),
            Err(e) => {
                self.record_failure("ev_threshold", &e);
                (None, true)
            }
        }
    }

    pub fn on_fill(&mut self, outcome: &FillOutcome) {
        if let Err(e) = self.inner.on_fill(outcome) {
            self.record_failure("on_fill", &e);
        }
    }

    pub fn export_state(&mut self) -> Value {
        match self.inner.export_state() {
            Ok(v) => v,
            Err(e) => {
                self.record_failure("export_state", &e);
                Value::Null
            }
        }
    }

    pub fn load_state(&mut self, state: &Value) {
        if let Err(e) = self.inner.load_state(state) {
            self.record_failure("load_state", &e);
        }
    }
}

/// The reference ORB strategy: one breakout signal per opening-range
/// window, TP/SL/trail sized in ATR-scaled pips via `k_tp`/`k_sl`/`k_tr`.
#[derive(Debug, Clone)]
pub struct OrbBreakoutStrategy {
    k_tp: f64,
    k_sl: f64,
    k_tr: f64,
    or_high: Option<f64>,
    or_low: Option<f64>,
    fired_this_window: bool,
}

impl OrbBreakoutStrategy {
    pub fn new(k_tp: f64, k_sl: f64, k_tr: f64) -> Self {
        Self {
            k_tp,
            k_sl,
            k_tr,
            or_high: None,
            or_low: None,
            fired_this_window: false,
        }
    }

    /// Called by the runner once the opening range for a new window is
    /// known, resetting the one-shot breakout latch.
    pub fn set_opening_range(&mut self, or_high: f64, or_low: f64) {
        self.or_high = Some(or_high);
        self.or_low = Some(or_low);
        self.fired_this_window = false;
    }
}

impl Strategy for OrbBreakoutStrategy {
    fn signals(&mut self, bar: &Bar, ctx: &Context) -> Result<Vec<SignalIntent>, StrategyHookError> {
        if self.fired_this_window {
            return Ok(Vec::new());
        }
        let (Some(or_high), Some(or_low)) = (self.or_high, self.or_low) else {
            return Ok(Vec::new());
        };
        let atr = ctx.atr_pips;
        if !atr.is_finite() || atr <= 0.0 {
            return Ok(Vec::new());
        }

        let side = if bar.close > or_high {
            Side::Buy
        } else if bar.close < or_low {
            Side::Sell
        } else {
            return Ok(Vec::new());
        };

        self.fired_this_window = true;
        Ok(vec![SignalIntent {
            side,
            tp_pips: self.k_tp * atr,
            sl_pips: self.k_sl * atr,
            trail_pips: self.k_tr * atr,
        }])
    }
}

/// A strategy whose `signals` hook always errors — used to exercise the
/// adapter's exception-capture-and-fallback path.
#[cfg(test)]
struct FailingStrategy;

#[cfg(test)]
impl Strategy for FailingStrategy {
    fn signals(&mut self, _bar: &Bar, _ctx: &Context) -> Result<Vec<SignalIntent>, StrategyHookError> {
        Err(StrategyHookError::GateFailed("boom".into()))
    }

    fn strategy_gate(&self, _bar: &Bar, _ctx: &Context, _intent: &SignalIntent) -> Result<bool, StrategyHookError> {
        Err(StrategyHookError::GateFailed("gate boom".into()))
    }
}
