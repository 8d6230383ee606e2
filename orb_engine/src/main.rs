/// main.rs — Backtesting entry point
///
/// Thin binary: read a bar CSV path and an output directory from argv,
/// run one backtest with the default `RunnerConfig`, and write the
/// per-run artifact set. The manifest/CLI-flag layer described in §6 is
/// an external collaborator and out of scope here — this binary exists
/// to exercise the core end to end, the way the teacher's own
/// `backtest.rs` binary entry point did before config/data-fetch grew
/// into its own layer.
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use orb_engine::artifacts::write_run_artifacts;
use orb_engine::bar::{Bar, BarParseOutcome, BarReader};
use orb_engine::config::RunnerConfig;
use orb_engine::runner::BacktestRunner;
use orb_engine::strategy::OrbBreakoutStrategy;

fn read_bars(path: &PathBuf) -> Result<Vec<Bar>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = BarReader::new(BufReader::new(file));
    let mut bars = Vec::new();
    let mut rejected = 0u64;
    while let Some(outcome) = reader.next_row() {
        match outcome {
            BarParseOutcome::Ok(bar) => bars.push(bar),
            BarParseOutcome::Rejected(e) => {
                rejected += 1;
                warn!("rejected bar row: {e}");
            }
        }
    }
    if rejected > 0 {
        warn!("{rejected} bar rows rejected during ingestion");
    }
    Ok(bars)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(bars_path) = args.next() else {
        bail!("usage: orb-backtest <bars.csv> <output_dir>");
    };
    let Some(out_dir) = args.next() else {
        bail!("usage: orb-backtest <bars.csv> <output_dir>");
    };

    let config = RunnerConfig::default();
    info!(strategy_id = %config.strategy_id, symbol = %config.symbol, mode = %config.mode, "starting run");

    let bars = read_bars(&PathBuf::from(bars_path))?;
    if bars.is_empty() {
        bail!("no valid bars parsed from input");
    }
    info!("loaded {} bars ({} .. {})", bars.len(), bars.first().unwrap().timestamp, bars.last().unwrap().timestamp);

    let strategy = OrbBreakoutStrategy::new(config.k_tp, config.k_sl, config.k_tr);
    let mut runner = BacktestRunner::new(config.clone(), strategy);
    runner.run(bars.into_iter());

    let metrics = runner.metrics();
    info!(
        trades = metrics.trades,
        wins = metrics.wins,
        total_pips = metrics.total_pips,
        fills = metrics.debug_counts.fills,
        "run complete"
    );

    write_run_artifacts(&PathBuf::from(out_dir), metrics, &config, None)?;
    Ok(())
}
