/// artifacts.rs — Per-run artifact writers (§6)
///
/// `metrics.json`/`params.json`/`state.json` go through
/// `serde_json::to_writer_pretty`; `records.csv`/`daily.csv` go through
/// `csv::Writer` over row structs whose field declaration order *is*
/// the column schema — the corpus's usual `csv` + `serde` tabular I/O
/// pairing (`bar.rs::BarReader` reads the same way in reverse).
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::config::RunnerConfig;
use crate::fill::{ExitReason, Side};
use crate::features::{RvBand, SpreadBand};
use crate::metrics::RunMetrics;
use crate::state::StateSnapshot;

/// One `records.csv` row: a trade fill or a debug gate event, unioned
/// into a single schema (columns fixed by §6's stage table) so both
/// kinds interleave in one time-ordered file.
#[derive(Debug, Clone, Serialize)]
pub struct RecordRow {
    pub ts: DateTime<Utc>,
    pub side: Option<Side>,
    pub stage: String,
    pub reason: Option<String>,
    pub tp_pips: Option<f64>,
    pub sl_pips: Option<f64>,
    pub cost_pips: Option<f64>,
    pub slip_est: Option<f64>,
    pub slip_real: Option<f64>,
    pub exit: Option<ExitReason>,
    pub pnl_pips: Option<f64>,
    pub or_atr_ratio: Option<f64>,
    pub rv_band: Option<RvBand>,
    pub spread_band: Option<SpreadBand>,
    pub ev_lcb: Option<f64>,
    pub threshold_lcb: Option<f64>,
    pub warmup_left: Option<u32>,
    pub warmup_total: Option<u32>,
}

impl From<&crate::metrics::TradeRecord> for RecordRow {
    fn from(r: &crate::metrics::TradeRecord) -> Self {
        Self {
            ts: r.ts,
            side: Some(r.side),
            stage: "fill".to_string(),
            reason: None,
            tp_pips: Some(r.tp_pips),
            sl_pips: Some(r.sl_pips),
            cost_pips: Some(r.cost_pips),
            slip_est: Some(r.slip_est),
            slip_real: Some(r.slip_real),
            exit: Some(r.exit),
            pnl_pips: Some(r.pnl_pips),
            or_atr_ratio: Some(r.or_atr_ratio),
            rv_band: Some(r.rv_band),
            spread_band: Some(r.spread_band),
            ev_lcb: Some(r.ev_lcb),
            threshold_lcb: Some(r.threshold_lcb),
            warmup_left: Some(r.warmup_left),
            warmup_total: Some(r.warmup_total),
        }
    }
}

impl From<&crate::metrics::DebugRecord> for RecordRow {
    fn from(r: &crate::metrics::DebugRecord) -> Self {
        Self {
            ts: r.ts,
            side: None,
            stage: r.stage.clone(),
            reason: r.reason.clone(),
            tp_pips: None,
            sl_pips: None,
            cost_pips: None,
            slip_est: None,
            slip_real: None,
            exit: None,
            pnl_pips: None,
            or_atr_ratio: None,
            rv_band: None,
            spread_band: None,
            ev_lcb: None,
            threshold_lcb: None,
            warmup_left: r.warmup_left,
            warmup_total: r.warmup_total,
        }
    }
}

/// Merge trade fills and debug events into one time-ordered row stream.
/// Stable sort preserves each source's relative order (trade-before-debug
/// or vice versa) for events sharing an exact timestamp.
fn build_record_rows(metrics: &RunMetrics) -> Vec<RecordRow> {
    let mut rows: Vec<RecordRow> = metrics.trade_records.iter().map(RecordRow::from).collect();
    rows.extend(metrics.debug_records.iter().map(RecordRow::from));
    rows.sort_by_key(|r| r.ts);
    rows
}

/// One `daily.csv` row, per UTC calendar date.
#[derive(Debug, Clone, Serialize)]
pub struct DailyRecord {
    pub date: NaiveDate,
    pub breakouts: u64,
    pub gate_pass: u64,
    pub gate_block: u64,
    pub ev_pass: u64,
    pub ev_reject: u64,
    pub fills: u64,
    pub wins: u64,
    pub pnl_pips: f64,
}

#[derive(Debug, Clone, Default)]
struct DayAccum {
    gate_block: u64,
    ev_reject: u64,
    zero_qty: u64,
    fill_reject: u64,
    trades: u64,
    wins: u64,
    pnl_pips: f64,
}

/// Per-day rollup. A breakout signal either dies at `gate_block`/
/// `ev_reject`/`zero_qty`/`fill_reject` (exactly one debug record, no
/// trade) or survives to a fill (exactly one trade record, no blocking
/// debug record — `ev_bypass` is informational and isn't itself a block)
/// — so `breakouts` sums all four block counters plus trades without
/// double-counting either path.
pub fn compute_daily(metrics: &RunMetrics) -> Vec<DailyRecord> {
    let mut by_day: BTreeMap<NaiveDate, DayAccum> = BTreeMap::new();

    for rec in &metrics.debug_records {
        let entry = by_day.entry(rec.ts.date_naive()).or_default();
        match rec.stage.as_str() {
            "gate_block" => entry.gate_block += 1,
            "ev_reject" => entry.ev_reject += 1,
            "zero_qty" => entry.zero_qty += 1,
            "fill_reject" => entry.fill_reject += 1,
            _ => {}
        }
    }
    for rec in &metrics.trade_records {
        let entry = by_day.entry(rec.ts.date_naive()).or_default();
        entry.trades += 1;
        if rec.pnl_pips > 0.0 {
            entry.wins += 1;
        }
        entry.pnl_pips += rec.pnl_pips;
    }

    by_day
        .into_iter()
        .map(|(date, a)| {
            let breakouts = a.gate_block + a.ev_reject + a.zero_qty + a.fill_reject + a.trades;
            DailyRecord {
                date,
                breakouts,
                gate_pass: breakouts - a.gate_block,
                gate_block: a.gate_block,
                ev_pass: a.zero_qty + a.fill_reject + a.trades,
                ev_reject: a.ev_reject,
                fills: a.trades,
                wins: a.wins,
                pnl_pips: a.pnl_pips,
            }
        })
        .collect()
}

fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .with_context(|| format!("failed to write {}", path.display()))
}

fn write_csv_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(BufWriter::new(file));
    for row in rows {
        writer.serialize(row).with_context(|| format!("failed to write row to {}", path.display()))?;
    }
    writer.flush().with_context(|| format!("failed to flush {}", path.display()))
}

/// Write the full per-run artifact set into `dir` (created if absent):
/// `metrics.json`, `records.csv`, `daily.csv`, `params.json`, and
/// `state.json` when a snapshot is supplied.
pub fn write_run_artifacts(
    dir: &Path,
    metrics: &RunMetrics,
    config: &RunnerConfig,
    snapshot: Option<&StateSnapshot>,
) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create artifact dir {}", dir.display()))?;

    write_json_pretty(&dir.join("metrics.json"), metrics)?;
    write_json_pretty(&dir.join("params.json"), config)?;
    write_csv_rows(&dir.join("records.csv"), &build_record_rows(metrics))?;
    write_csv_rows(&dir.join("daily.csv"), &compute_daily(metrics))?;

    if let Some(snap) = snapshot {
        write_json_pretty(&dir.join("state.json"), snap)?;
    }
    Ok(())
}
