/// runner.rs — BacktestRunner: the per-bar gate sequence (C7)
///
/// Generalizes the teacher's `backtest.rs::run_backtest` skeleton —
/// iterate bars in order, derive per-bar values, call into one
/// decision-making owner, record equity after each bar, hand the trade
/// list + equity curve to a metrics function — replacing its single
/// `engine.on_bar` call with the twelve-step gate sequence this spec
/// describes, and its single `StrategyEngine` owner with the
/// capability-trait strategy + router + EV estimator + fill engine
/// collaborators C2-C6/C9 own independently.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, NaiveDate, Utc};

use crate::bar::Bar;
use crate::config::{EvMode, FillModel, RunnerConfig};
use crate::ev::{ev_lcb_pips, PooledEvEstimator, WarmupTracker};
use crate::features::{BucketKey, Context, FeaturePipeline, RvBand, SpreadBand};
use crate::fill::{bridge_resolve_bar, ConservativeOrder, ExitReason, FillOutcome, OrderSpec, Side, SlipState};
use crate::metrics::{RunMetrics, TradeRecord};
use crate::pips::PipTable;
use crate::sizing::{compute_size, SizingGuards};
use crate::state::{SlipStateMap, StateSnapshot};
use crate::strategy::{OrbBreakoutStrategy, StrategyAdapter};

/// EWMA learning rate for the per-spread-band slip model. Not a tunable
/// exposed in `RunnerConfig` — the source treats it as an internal
/// constant of the slip estimator, not a strategy-facing knob.
const SLIP_EWMA_ALPHA: f64 = 0.1;

fn spread_band_key(band: SpreadBand) -> String {
    format!("{band:?}")
}

/// Which fill-engine state machine an open position is riding.
enum OpenOrderState {
    Conservative(ConservativeOrder),
    Bridge(OrderSpec),
}

/// Everything about an open order the runner needs once it resolves,
/// beyond what `fill.rs`'s `FillOutcome` itself carries.
struct PendingMeta {
    order_id: u64,
    bucket_key: BucketKey,
    side: Side,
    tp_pips: f64,
    sl_pips: f64,
    cost_pips: f64,
    or_atr_ratio: f64,
    rv_band: RvBand,
    spread_band: SpreadBand,
    ev_lcb: f64,
    threshold_lcb: f64,
    warmup_left: u32,
    warmup_total: u32,
    slip_est: f64,
    qty: f64,
    is_calibration: bool,
}

/// The bar-by-bar event loop: feature pipeline → strategy → gate
/// sequence → fill engine → metrics, wired concretely around the
/// reference `OrbBreakoutStrategy` (the one strategy this spec's OR
/// window bookkeeping is built for — `set_opening_range` isn't part of
/// the `Strategy` capability trait, since not every strategy has an
/// opening range concept).
pub struct BacktestRunner {
    config: RunnerConfig,
    pip_table: PipTable,
    features: FeaturePipeline,
    strategy: StrategyAdapter<OrbBreakoutStrategy>,
    ev: PooledEvEstimator,
    warmup: WarmupTracker,
    sizing_guards: SizingGuards,
    slip_state: SlipStateMap,
    metrics: RunMetrics,
    equity: f64,
    open_order: Option<(OpenOrderState, PendingMeta)>,
    next_order_id: u64,
    last_bar_ts: Option<DateTime<Utc>>,
    current_day: Option<NaiveDate>,
    or_committed: bool,
}

impl BacktestRunner {
    pub fn new(config: RunnerConfig, strategy: OrbBreakoutStrategy) -> Self {
        let pip_table = PipTable::new();
        let features = FeaturePipeline::new(
            pip_table.clone(),
            config.atr_period,
            config.adx_period,
            config.rv_lookback_bars,
            config.rv_history_cap,
            config.or_n,
        );
        let ev = PooledEvEstimator::new(config.alpha0, config.beta0, config.decay, config.n_min, config.confidence);
        let warmup = WarmupTracker::new(config.warmup_trades);
        let equity = config.initial_equity;
        let debug_limit = config.debug_record_sample_limit;
        Self {
            pip_table,
            features,
            strategy: StrategyAdapter::new(strategy, debug_limit),
            ev,
            warmup,
            sizing_guards: SizingGuards::new(),
            slip_state: SlipStateMap::new(),
            metrics: RunMetrics::new(debug_limit),
            equity,
            open_order: None,
            next_order_id: 0,
            last_bar_ts: None,
            current_day: None,
            or_committed: false,
            config,
        }
    }

    /// Rebuild a runner resumed from a prior snapshot: EV posteriors,
    /// warmup registry, slip coefficients, RV cutpoints, and strategy
    /// state are all restored; the bar stream passed to `run`/`run_partial`
    /// afterward is expected to start strictly after `snapshot.last_bar_ts`.
    pub fn from_snapshot(config: RunnerConfig, strategy: OrbBreakoutStrategy, snapshot: &StateSnapshot) -> Self {
        let mut runner = Self::new(config, strategy);
        for (key, state) in &snapshot.pooled_ev.buckets {
            runner.ev.set_bucket(*key, *state);
        }
        runner.ev.set_global(snapshot.pooled_ev.global);
        runner.warmup = snapshot.warmup.clone();
        runner.slip_state = snapshot.slip_state.clone();
        runner.features.set_rv_cutpoints(snapshot.rv_thresholds);
        runner.strategy.load_state(&snapshot.strategy_state);
        runner.last_bar_ts = Some(snapshot.last_bar_ts);
        runner
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn last_bar_ts(&self) -> Option<DateTime<Utc>> {
        self.last_bar_ts
    }

    /// Export a `StateSnapshot` of the runner's current mutable state.
    pub fn export_snapshot(&mut self) -> StateSnapshot {
        let last_ts = self.last_bar_ts.unwrap_or_else(Utc::now);
        StateSnapshot::from_estimator(
            &self.config,
            &self.ev,
            self.slip_state.clone(),
            self.features.rv_cutpoints(),
            self.warmup.clone(),
            self.strategy.export_state(),
            last_ts,
        )
    }

    /// Process a finite bar stream to completion. Equivalent to
    /// `run_cancelable` with a `should_stop` flag that never fires.
    pub fn run(&mut self, bars: impl Iterator<Item = Bar>) -> &RunMetrics {
        let flag = AtomicBool::new(false);
        self.run_cancelable(bars, &flag)
    }

    /// Process bars until exhausted or `should_stop` is observed between
    /// bars (§5: "flushes metrics for processed bars and exits cleanly
    /// without writing a snapshot").
    pub fn run_cancelable(&mut self, bars: impl Iterator<Item = Bar>, should_stop: &AtomicBool) -> &RunMetrics {
        for bar in bars {
            if should_stop.load(Ordering::Relaxed) {
                break;
            }
            self.process_bar(&bar);
        }
        &self.metrics
    }

    /// Process a bar range atop a restored snapshot and return the
    /// resulting `StateSnapshot`. Per §4.6/§5, the caller is responsible
    /// for ensuring `bars[0].ts > snapshot.last_bar_ts`; a violation
    /// surfaces as a skipped/duplicate bar via the ordinary monotonic-
    /// time guard rather than a panic.
    pub fn run_partial(&mut self, bars: impl Iterator<Item = Bar>) -> anyhow::Result<StateSnapshot> {
        self.run(bars);
        Ok(self.export_snapshot())
    }

    fn push_debug(&mut self, stage: &str, reason: Option<String>, ts: DateTime<Utc>) {
        self.metrics.push_debug(stage, reason, ts, Some(self.warmup.warmup_left), Some(self.warmup.warmup_total));
    }

    /// Shared router rule (§4.6 step 6). The reference configuration has
    /// no session whitelist/news calendar wired in (those are external,
    /// out-of-scope inputs per §1); the one invariant enforced here is
    /// that the feature pipeline must actually be armed and producing a
    /// finite OR/ATR ratio before a signal is allowed through.
    fn pass_gates(&self, ctx: &Context) -> bool {
        ctx.or_atr_ratio.is_finite() && ctx.atr_pips.is_finite() && ctx.atr_pips > 0.0
    }

    fn maybe_roll_day(&mut self, bar: &Bar) {
        let today = bar.timestamp.date_naive();
        if self.current_day != Some(today) {
            self.current_day = Some(today);
            self.features.reset_opening_range();
            self.sizing_guards.reset_day();
            self.or_committed = false;
        }
    }

    fn maybe_commit_opening_range(&mut self) {
        if !self.or_committed && self.features.or_window_complete() {
            if let Some((hi, lo)) = self.features.opening_range() {
                self.strategy.inner_mut().set_opening_range(hi, lo);
                self.or_committed = true;
            }
        }
    }

    /// Feed one bar through the full gate sequence (§4.6).
    pub fn process_bar(&mut self, bar: &Bar) {
        if let Some(last) = self.last_bar_ts {
            if bar.timestamp <= last {
                // Non-monotonic or duplicate timestamp: skip, per §6/§7.
                return;
            }
        }
        self.maybe_roll_day(bar);
        self.sizing_guards.tick();

        // Step 1: feature pipeline update.
        let ctx = self.features.on_bar(bar);
        self.maybe_commit_opening_range();

        // Step 2: strategy.on_bar.
        self.strategy.on_bar(bar, &ctx);

        // An already-open order is resolved before any new signal can be
        // considered — this engine holds at most one position at a time.
        if let Some((mut state, meta)) = self.open_order.take() {
            let outcome = match &mut state {
                OpenOrderState::Conservative(order) => order.on_bar(bar, self.pip_table.pip_size(&bar.symbol), meta.cost_pips),
                OpenOrderState::Bridge(spec) => bridge_resolve_bar(spec, bar, self.pip_table.pip_size(&bar.symbol), meta.cost_pips, &self.config),
            };
            match outcome {
                Some(fill) => self.settle_fill(bar, fill, meta),
                None => self.open_order = Some((state, meta)),
            }
        }

        if self.open_order.is_some() || !self.features.is_armed() {
            self.last_bar_ts = Some(bar.timestamp);
            return;
        }

        // Step 3-4: pending signal.
        let signals = self.strategy.signals(bar, &ctx);
        let Some(intent) = signals.into_iter().next() else {
            self.metrics.debug_counts.no_breakout += 1;
            self.last_bar_ts = Some(bar.timestamp);
            return;
        };

        if self.sizing_guards.is_stopped_for_day() || self.sizing_guards.is_in_cooldown(intent.side == Side::Buy) {
            self.metrics.debug_counts.gate_block += 1;
            self.push_debug("gate_block", Some("sizing_guard".into()), bar.timestamp);
            self.last_bar_ts = Some(bar.timestamp);
            return;
        }

        // Step 5: strategy_gate hook.
        let (gate_admit, gate_errored) = self.strategy.strategy_gate(bar, &ctx, &intent);
        if gate_errored {
            self.metrics.debug_counts.strategy_gate_error += 1;
            self.push_debug("strategy_gate_error", Some("strategy_gate hook raised an error".into()), bar.timestamp);
        }
        if !gate_admit {
            self.metrics.debug_counts.gate_block += 1;
            self.push_debug("gate_block", Some("strategy_gate".into()), bar.timestamp);
            self.last_bar_ts = Some(bar.timestamp);
            return;
        }

        // Step 6: shared router rule.
        if !self.pass_gates(&ctx) {
            self.metrics.debug_counts.gate_block += 1;
            self.push_debug("gate_block", Some("router_gate".into()), bar.timestamp);
            self.last_bar_ts = Some(bar.timestamp);
            return;
        }

        // Step 7: ev_threshold hook.
        let mut threshold = self.config.threshold_lcb_pip;
        let (ev_threshold_override, ev_threshold_errored) = self.strategy.ev_threshold(&ctx);
        if ev_threshold_errored {
            self.metrics.debug_counts.ev_threshold_error += 1;
            self.push_debug("ev_threshold_error", Some("ev_threshold hook raised an error".into()), bar.timestamp);
        }
        if let Some(t) = ev_threshold_override {
            if t.is_finite() {
                threshold = t;
            } else {
                self.metrics.debug_counts.ev_threshold_error += 1;
                self.push_debug("ev_threshold_error", Some(format!("non-finite override {t}")), bar.timestamp);
            }
        }

        // Step 8: EV LCB check / warmup bypass.
        let bucket_key = ctx.bucket_key();
        let q = self.ev.query(&bucket_key);
        let ev_lcb = ev_lcb_pips(q.p_lcb, intent.tp_pips, intent.sl_pips, ctx.cost_pips);

        let mut warmup_bypass = false;
        if self.config.ev_mode != EvMode::Off && ev_lcb < threshold {
            if self.warmup.is_active() {
                warmup_bypass = true;
            } else {
                self.metrics.debug_counts.ev_reject += 1;
                self.push_debug("ev_reject", Some(format!("ev_lcb={ev_lcb:.4} threshold={threshold:.4}")), bar.timestamp);
                self.last_bar_ts = Some(bar.timestamp);
                return;
            }
        }

        // Step 9: expected slip vs cap.
        let band_key = spread_band_key(ctx.spread_band);
        let slip_est = self
            .slip_state
            .entry(band_key)
            .or_insert_with(|| SlipState::new(0.0, 0.0))
            .expected(1.0);
        if slip_est > self.config.slip_cap_pip {
            self.metrics.debug_counts.gate_block += 1;
            self.push_debug("gate_block", Some("slip_cap".into()), bar.timestamp);
            self.last_bar_ts = Some(bar.timestamp);
            return;
        }

        // Step 10: sizing preview.
        let sizing = compute_size(q.p_lcb, q.bucket_seeded, intent.tp_pips, intent.sl_pips, self.equity, &self.config);
        let mut qty = sizing.units;
        if self.config.max_trade_loss_pct > 0.0 {
            let max_loss_units = (self.config.max_trade_loss_pct * self.equity) / (self.config.pip_value * intent.sl_pips);
            qty = qty.min(max_loss_units);
        }
        if sizing.zero_qty || qty <= 1e-12 {
            self.metrics.debug_counts.zero_qty += 1;
            self.push_debug("zero_qty", None, bar.timestamp);
            self.last_bar_ts = Some(bar.timestamp);
            return;
        }

        if warmup_bypass {
            self.metrics.debug_counts.ev_bypass += 1;
            self.push_debug("ev_bypass", Some(format!("ev_lcb={ev_lcb:.4}")), bar.timestamp);
        }

        let spec = OrderSpec {
            side: intent.side,
            entry: bar.close,
            tp_pips: intent.tp_pips,
            sl_pips: intent.sl_pips,
            trail_pips: intent.trail_pips,
            same_bar_policy: self.config.same_bar_policy,
            qty,
        };
        if spec.validate().is_err() {
            self.push_debug("fill_reject", Some("invalid order spec".into()), bar.timestamp);
            self.last_bar_ts = Some(bar.timestamp);
            return;
        }

        let order_id = self.next_order_id;
        self.next_order_id += 1;
        self.sizing_guards.record_signal_minute(bar.timestamp.timestamp());
        if warmup_bypass {
            self.warmup.admit(order_id, bucket_key);
        }

        let meta = PendingMeta {
            order_id,
            bucket_key,
            side: intent.side,
            tp_pips: intent.tp_pips,
            sl_pips: intent.sl_pips,
            cost_pips: ctx.cost_pips,
            or_atr_ratio: ctx.or_atr_ratio,
            rv_band: ctx.rv_band,
            spread_band: ctx.spread_band,
            ev_lcb,
            threshold_lcb: threshold,
            warmup_left: self.warmup.warmup_left,
            warmup_total: self.warmup.warmup_total,
            slip_est,
            qty,
            is_calibration: warmup_bypass,
        };

        let pip_size = self.pip_table.pip_size(&bar.symbol);
        let (state, immediate) = match self.config.fill_model {
            FillModel::Conservative => {
                let mut order = ConservativeOrder::new(spec, spec.entry);
                let outcome = order.on_bar(bar, pip_size, ctx.cost_pips);
                (OpenOrderState::Conservative(order), outcome)
            }
            FillModel::BrownianBridge => {
                let outcome = bridge_resolve_bar(&spec, bar, pip_size, ctx.cost_pips, &self.config);
                (OpenOrderState::Bridge(spec), outcome)
            }
        };

        match immediate {
            Some(fill) => self.settle_fill(bar, fill, meta),
            None => self.open_order = Some((state, meta)),
        }

        self.last_bar_ts = Some(bar.timestamp);
    }

    /// Step 11-12: a fill terminal event — trade record, equity, EV
    /// update, per-bucket resolution, and the bounded debug buffer.
    fn settle_fill(&mut self, bar: &Bar, outcome: FillOutcome, meta: PendingMeta) {
        // No live tick stream to observe slippage from in a 5m-bar
        // backtest; the realized value is approximated as equal to the
        // pre-trade expectation (documented approximation, same spirit
        // as the fill engine's own Brownian-bridge caveat).
        let slip_real = meta.slip_est;
        let pnl_pips = outcome.pnl_pips - slip_real;

        self.equity += pnl_pips * self.config.pip_value * meta.qty;

        let y = match self.config.fill_model {
            FillModel::Conservative => {
                if matches!(outcome.exit_reason, ExitReason::Tp) {
                    1.0
                } else {
                    0.0
                }
            }
            FillModel::BrownianBridge => outcome.p_tp,
        };
        self.ev.update(meta.bucket_key, y);
        if meta.is_calibration {
            self.warmup.resolve(meta.order_id);
        }

        if let Some(band_slip) = self.slip_state.get_mut(&spread_band_key(meta.spread_band)) {
            band_slip.update(slip_real, meta.qty, SLIP_EWMA_ALPHA);
        }

        self.sizing_guards.on_trade_closed(
            meta.side == Side::Buy,
            pnl_pips,
            self.config.cooldown_bars,
            self.config.max_daily_dd_pct,
            self.equity,
            self.config.pip_value,
        );

        let record = TradeRecord {
            ts: bar.timestamp,
            side: meta.side,
            tp_pips: meta.tp_pips,
            sl_pips: meta.sl_pips,
            cost_pips: meta.cost_pips,
            slip_est: meta.slip_est,
            slip_real,
            exit: outcome.exit_reason,
            pnl_pips,
            or_atr_ratio: meta.or_atr_ratio,
            rv_band: meta.rv_band,
            spread_band: meta.spread_band,
            ev_lcb: meta.ev_lcb,
            threshold_lcb: meta.threshold_lcb,
            warmup_left: meta.warmup_left,
            warmup_total: meta.warmup_total,
        };
        self.metrics.record_trade(record);
        self.strategy.on_fill(&outcome);
        self.open_order = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SameBarPolicy;
    use chrono::TimeZone;

    fn bar(ts: DateTime<Utc>, o: f64, h: f64, l: f64, c: f64) -> Bar {
        Bar::validate(ts, "EURUSD".into(), crate::bar::Timeframe::M5, o, h, l, c, 100.0, 0.0001).unwrap()
    }

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, h, m, 0).unwrap()
    }

    /// Warm the feature pipeline's ATR and seed an opening range by
    /// feeding `or_n` quiet bars, returning the runner ready to fire on
    /// the next breakout bar.
    fn warmed_runner(mut config: RunnerConfig) -> BacktestRunner {
        config.or_n = 1;
        config.atr_period = 2;
        config.adx_period = 2;
        config.rv_lookback_bars = 2;
        let strategy = OrbBreakoutStrategy::new(config.k_tp, config.k_sl, config.k_tr);
        let mut runner = BacktestRunner::new(config, strategy);
        // Two quiet bars to seed ATR (period=2) plus the 1-bar OR window.
        runner.process_bar(&bar(ts(9, 0), 1.1000, 1.1005, 1.0995, 1.1000));
        runner.process_bar(&bar(ts(9, 5), 1.1000, 1.1005, 1.0995, 1.1000));
        runner
    }

    /// Scenario 1: single breakout, TP hit same bar.
    /// Expected: 1 trade, exit=tp, pnl_pips = tp_pips - cost_pips - slip_real, fills=1.
    ///
    /// `k_tp`/`k_sl` are scaled off ATR, and the breakout bar's own true
    /// range feeds that same-bar ATR update before its target is priced
    /// — so the breakout bar must have enough spread between its close
    /// (the entry) and its high to still clear a target computed from
    /// its own enlarged range. Open=high, close=low maximizes that
    /// margin; `k_tp=1.0` keeps the target inside it.
    #[test]
    fn scenario_single_breakout_tp_hit_same_bar() {
        let mut cfg = RunnerConfig::default();
        cfg.k_tp = 1.0;
        cfg.k_sl = 0.5;
        cfg.k_tr = 0.0;
        cfg.ev_mode = EvMode::Off;
        let mut runner = warmed_runner(cfg);
        // Breakout above OR high (1.1005); entry=close=1.1010, high=1.1035
        // clears the same-bar-recomputed TP target with margin to spare.
        let breakout = bar(ts(9, 10), 1.1030, 1.1035, 1.1010, 1.1010);
        runner.process_bar(&breakout);
        assert_eq!(runner.metrics().trades, 1);
        assert_eq!(runner.metrics().debug_counts.fills, 1);
        let rec = &runner.metrics().trade_records[0];
        assert_eq!(rec.exit, ExitReason::Tp);
        assert!(rec.pnl_pips > 0.0);
        assert!((rec.pnl_pips - (rec.tp_pips - rec.cost_pips - rec.slip_real)).abs() < 1e-9);
    }

    /// Scenario 2: both TP and SL in same bar, protective_priority policy.
    /// Expected: exit=sl, pnl_pips = -sl_pips - cost.
    ///
    /// Same same-bar-ATR constraint as scenario 1 applies, now for both
    /// targets at once: `k_tp=1.0, k_sl=0.5` keeps `k_tp+k_sl < 2.0` so a
    /// wide-enough bar range can clear both distances simultaneously
    /// (the boundary proof: both reachable requires
    /// `range·(2−k_tp−k_sl) ≥ (k_tp+k_sl)·atr_prev`).
    #[test]
    fn scenario_same_bar_protective_priority_exits_sl() {
        let mut cfg = RunnerConfig::default();
        cfg.k_tp = 1.0;
        cfg.k_sl = 0.5;
        cfg.k_tr = 0.0;
        cfg.ev_mode = EvMode::Off;
        cfg.same_bar_policy = SameBarPolicy::ProtectivePriority;
        let mut runner = warmed_runner(cfg);
        // Breakout bar wide enough that both TP (above) and SL (below) fall
        // within [low, high] once the same-bar ATR update sizes them.
        let breakout = bar(ts(9, 10), 1.1000, 1.1050, 1.0990, 1.1010);
        runner.process_bar(&breakout);
        assert_eq!(runner.metrics().trades, 1);
        assert_eq!(runner.metrics().trade_records[0].exit, ExitReason::Sl);
    }

    /// Scenario 3: EV reject then warmup bypass.
    /// Expected: while warmup_left>0, rejected-by-threshold trades are
    /// admitted instead with an ev_bypass record.
    #[test]
    fn scenario_warmup_bypass_then_reject_after_warmup_exhausted() {
        let mut cfg = RunnerConfig::default();
        cfg.warmup_trades = 1;
        cfg.alpha0 = 1.0;
        cfg.beta0 = 3.0; // bearish prior
        cfg.n_min = 1.0;
        cfg.threshold_lcb_pip = 0.3;
        cfg.k_tp = 2.0;
        cfg.k_sl = 1.0;
        let mut runner = warmed_runner(cfg);

        // First breakout: EV below threshold, warmup active -> bypass, then
        // resolves with a loss so the posterior stays bearish.
        let b1 = bar(ts(9, 10), 1.1000, 1.1010, 1.0960, 1.0965);
        runner.process_bar(&b1);
        assert_eq!(runner.metrics().debug_counts.ev_bypass, 1);
        assert_eq!(runner.warmup.warmup_left, 0);

        // Reset the opening range/strategy latch by crossing into a new day.
        let b2 = bar(ts(23, 55), 1.0965, 1.0970, 1.0960, 1.0965);
        runner.process_bar(&b2);
        let b3 = bar(Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap(), 1.0965, 1.0970, 1.0960, 1.0965);
        runner.process_bar(&b3);
        let b4 = bar(Utc.with_ymd_and_hms(2024, 1, 3, 0, 5, 0).unwrap(), 1.0965, 1.0970, 1.0960, 1.0965);
        runner.process_bar(&b4);

        // A second breakout after warmup is exhausted should be ev_reject,
        // since the posterior is still bearish and threshold is unmet.
        let b5 = bar(Utc.with_ymd_and_hms(2024, 1, 3, 0, 10, 0).unwrap(), 1.0965, 1.0975, 1.0963, 1.0972);
        runner.process_bar(&b5);
        assert!(runner.metrics().debug_counts.ev_reject >= 1);
    }

    /// Scenario 4: slip cap block.
    /// Expected: gate_block record with reason=slip_cap, no fill.
    #[test]
    fn scenario_slip_cap_blocks_order() {
        let mut cfg = RunnerConfig::default();
        cfg.ev_mode = EvMode::Off;
        cfg.slip_cap_pip = 0.2;
        let mut runner = warmed_runner(cfg);
        // Force a high expected slip for the Wide band by seeding it directly.
        runner.slip_state.insert("Wide".into(), SlipState::new(0.0, 0.5));
        // Build a breakout bar with a wide spread so it lands in the Wide band.
        let mut wide_bar = bar(ts(9, 10), 1.1000, 1.1030, 1.0998, 1.1020);
        wide_bar.spread = 0.0005; // 5 pips, above the default wide cutoff
        runner.process_bar(&wide_bar);
        assert_eq!(runner.metrics().trades, 0);
        assert!(runner
            .metrics()
            .debug_records
            .iter()
            .any(|r| r.stage == "gate_block" && r.reason.as_deref() == Some("slip_cap")));
    }

    /// Scenario 5: strategy hook exception.
    /// Expected: the adapter reports the hook error back to the caller
    /// (the signal `BacktestRunner` uses to bump
    /// `debug_counts.strategy_gate_error` and push a debug record), with
    /// the gate itself still falling back permissively so trades keep
    /// executing on bars the hook doesn't fail on.
    #[test]
    fn scenario_strategy_gate_exception_falls_back_permissively() {
        struct FlakyGate {
            inner: OrbBreakoutStrategy,
            calls: std::cell::Cell<u32>,
        }
        impl crate::strategy::Strategy for FlakyGate {
            fn signals(&mut self, bar: &Bar, ctx: &Context) -> Result<Vec<crate::strategy::SignalIntent>, crate::error::StrategyHookError> {
                self.inner.signals(bar, ctx)
            }
            fn strategy_gate(&self, _bar: &Bar, _ctx: &Context, _intent: &crate::strategy::SignalIntent) -> Result<bool, crate::error::StrategyHookError> {
                let n = self.calls.get();
                self.calls.set(n + 1);
                if n % 2 == 0 {
                    Err(crate::error::StrategyHookError::GateFailed("boom".into()))
                } else {
                    Ok(true)
                }
            }
        }
        // Exercised directly against the adapter (not the full runner,
        // since FlakyGate isn't OrbBreakoutStrategy) to isolate the
        // exception-isolation contract itself.
        let mut adapter = StrategyAdapter::new(
            FlakyGate {
                inner: OrbBreakoutStrategy::new(2.0, 1.0, 0.0),
                calls: std::cell::Cell::new(0),
            },
            100,
        );
        let b = bar(ts(9, 10), 1.1000, 1.1030, 1.0998, 1.1020);
        let c = Context {
            session: crate::features::Session::Ldn,
            spread_band: SpreadBand::Normal,
            rv_band: RvBand::Mid,
            trend_flag: crate::features::TrendFlag::Ranging,
            atr_pips: 5.0,
            or_atr_ratio: 1.0,
            cost_pips: 0.2,
            ev_profile_stats: Default::default(),
            loss_streak: 0,
            daily_trade_count: 0,
            daily_loss_pips: 0.0,
        };
        let intent = crate::strategy::SignalIntent {
            side: Side::Buy,
            tp_pips: 10.0,
            sl_pips: 5.0,
            trail_pips: 0.0,
        };
        let (r0, err0) = adapter.strategy_gate(&b, &c, &intent); // even call -> error -> permissive true
        let (r1, err1) = adapter.strategy_gate(&b, &c, &intent); // odd call -> Ok(true)
        assert!(r0);
        assert!(err0);
        assert!(r1);
        assert!(!err1);
        assert_eq!(adapter.hook_failures, 1);
    }

    /// EV-off override: with ev_mode="off", no debug record has
    /// stage="ev_reject".
    #[test]
    fn ev_off_never_produces_ev_reject() {
        let mut cfg = RunnerConfig::default();
        cfg.ev_mode = EvMode::Off;
        cfg.alpha0 = 1.0;
        cfg.beta0 = 50.0; // deeply bearish prior, would reject if EV were on
        cfg.threshold_lcb_pip = 5.0;
        let mut runner = warmed_runner(cfg);
        let breakout = bar(ts(9, 10), 1.1000, 1.1030, 1.0998, 1.1020);
        runner.process_bar(&breakout);
        assert!(!runner.metrics().debug_records.iter().any(|r| r.stage == "ev_reject"));
    }

    /// Monotonic time: a duplicate/out-of-order timestamp is skipped,
    /// not processed twice.
    #[test]
    fn duplicate_timestamp_is_skipped() {
        let cfg = RunnerConfig::default();
        let mut runner = warmed_runner(cfg);
        let repeat = bar(ts(9, 5), 1.1000, 1.1005, 1.0995, 1.1000);
        let trades_before = runner.metrics().trades;
        runner.process_bar(&repeat);
        assert_eq!(runner.metrics().trades, trades_before);
    }

    /// Partial-run idempotence sketch: replaying the same single bar
    /// against a runner already past that timestamp produces no new
    /// trades or EV updates (the monotonic guard makes it a no-op).
    #[test]
    fn replaying_already_processed_bar_is_a_no_op() {
        let mut cfg = RunnerConfig::default();
        cfg.ev_mode = EvMode::Off;
        let mut runner = warmed_runner(cfg);
        let breakout = bar(ts(9, 10), 1.1000, 1.1030, 1.0998, 1.1020);
        runner.process_bar(&breakout);
        let trades_after_first = runner.metrics().trades;
        let total_pips_after_first = runner.metrics().total_pips;
        runner.process_bar(&breakout);
        assert_eq!(runner.metrics().trades, trades_after_first);
        assert!((runner.metrics().total_pips - total_pips_after_first).abs() < 1e-9);
    }
}
