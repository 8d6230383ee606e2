/// metrics.rs — Run metrics: debug counters, equity curve, Sharpe, max drawdown (C7 support)
///
/// Generalizes the teacher's `compute_metrics`/`max_drawdown` pair from a
/// crypto-annualized Sharpe over an equity-curve to the trades-indexed,
/// no-calendar-scaling version this spec calls for (§4.6, §9 Open
/// Questions): `K` is a trade-count annualization factor supplied by
/// config, not `bars_per_year`, and Sharpe is `None` below two trades
/// rather than `0.0`.
use serde::{Deserialize, Serialize};

use crate::fill::ExitReason;

/// One row of the bounded debug-event sample buffer (`records.csv`'s
/// non-trade rows).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugRecord {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub stage: String,
    pub reason: Option<String>,
    pub warmup_left: Option<u32>,
    pub warmup_total: Option<u32>,
}

/// One closed trade (`records.csv`'s trade rows).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub side: crate::fill::Side,
    pub tp_pips: f64,
    pub sl_pips: f64,
    pub cost_pips: f64,
    pub slip_est: f64,
    pub slip_real: f64,
    pub exit: ExitReason,
    pub pnl_pips: f64,
    pub or_atr_ratio: f64,
    pub rv_band: crate::features::RvBand,
    pub spread_band: crate::features::SpreadBand,
    pub ev_lcb: f64,
    pub threshold_lcb: f64,
    pub warmup_left: u32,
    pub warmup_total: u32,
}

/// Debug-event counters, one per §4.6 gate-sequence outcome.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DebugCounts {
    pub no_breakout: u64,
    pub gate_block: u64,
    pub ev_reject: u64,
    pub ev_bypass: u64,
    pub zero_qty: u64,
    pub strategy_gate_error: u64,
    pub ev_threshold_error: u64,
    pub missing_cols: u64,
    pub fills: u64,
}

/// All metrics accumulated across a run: counters, the bounded debug
/// sample buffer, trade records, and the derived equity curve / Sharpe /
/// max drawdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    pub trades: u64,
    pub wins: u64,
    pub total_pips: f64,
    pub debug_counts: DebugCounts,
    pub debug_records: Vec<DebugRecord>,
    pub trade_records: Vec<TradeRecord>,
    /// Cumulative pnl, one entry per closed trade (not per bar).
    pub equity_curve: Vec<f64>,
    debug_sample_limit: usize,
}

impl RunMetrics {
    pub fn new(debug_sample_limit: usize) -> Self {
        Self {
            debug_sample_limit,
            ..Default::default()
        }
    }

    pub fn push_debug(&mut self, stage: &str, reason: Option<String>, ts: chrono::DateTime<chrono::Utc>, warmup_left: Option<u32>, warmup_total: Option<u32>) {
        if self.debug_records.len() < self.debug_sample_limit {
            self.debug_records.push(DebugRecord {
                ts,
                stage: stage.to_owned(),
                reason,
                warmup_left,
                warmup_total,
            });
        }
    }

    pub fn record_trade(&mut self, rec: TradeRecord) {
        self.trades += 1;
        if rec.pnl_pips > 0.0 {
            self.wins += 1;
        }
        self.total_pips += rec.pnl_pips;
        self.debug_counts.fills += 1;
        let cum = self.equity_curve.last().copied().unwrap_or(0.0) + rec.pnl_pips;
        self.equity_curve.push(cum);
        if self.trade_records.len() < self.debug_sample_limit {
            self.trade_records.push(rec);
        }
    }

    /// Sharpe = mean(trade_pnl)/stdev(trade_pnl)·√K, K from config,
    /// no calendar scaling. `None` when fewer than 2 trades, per §4.6 and
    /// the source's explicit Open Question resolution (see DESIGN.md).
    pub fn sharpe(&self, annualization_k: f64) -> Option<f64> {
        let pnls: Vec<f64> = self
            .trade_records
            .iter()
            .map(|t| t.pnl_pips)
            .collect();
        if pnls.len() < 2 {
            return None;
        }
        let mean = pnls.iter().sum::<f64>() / pnls.len() as f64;
        let var = pnls.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (pnls.len() - 1) as f64;
        let sd = var.sqrt();
        if sd < 1e-12 {
            return None;
        }
        Some((mean / sd) * annualization_k.sqrt())
    }

    /// Max drawdown over the trade-indexed cumulative-pnl curve:
    /// `max_t(peak_t - current_t)`, in pips (not a fraction).
    pub fn max_drawdown(&self) -> f64 {
        max_drawdown(&self.equity_curve)
    }
}

/// Max over a trade-indexed cumulative-pnl curve of `(peak - current)`.
pub fn max_drawdown(equity_curve: &[f64]) -> f64 {
    if equity_curve.is_empty() {
        return 0.0;
    }
    let mut peak = equity_curve[0];
    let mut worst = 0.0f64;
    for &e in equity_curve {
        if e > peak {
            peak = e;
        }
        let dd = peak - e;
        if dd > worst {
            worst = dd;
        }
    }
    worst
}
