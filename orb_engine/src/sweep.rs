/// sweep.rs — Parameter sweep coordinator (§5)
///
/// A thin `rayon` `par_iter().map(...)` over a batch of `RunnerConfig`s,
/// the same data-parallel shape the teacher reaches for with its own
/// `rayon` dependency ("parallel iteration (parameter sweeps in
/// backtesting)" in `mft_engine/Cargo.toml`) rather than a hand-rolled
/// thread pool. Each worker owns its config, bar slice, and output
/// directory by value — there is no shared mutable state to synchronize,
/// so the coordinator itself needs no locking beyond what `artifacts.rs`
/// and `state.rs` already do per worker.
use std::path::PathBuf;

use rayon::prelude::*;
use serde::Serialize;

use crate::artifacts::write_run_artifacts;
use crate::bar::Bar;
use crate::config::RunnerConfig;
use crate::runner::BacktestRunner;
use crate::strategy::OrbBreakoutStrategy;

/// One unit of sweep work: a config variant, the bar stream it replays
/// against, and where its artifacts land.
pub struct SweepJob {
    pub config: RunnerConfig,
    pub bars: Vec<Bar>,
    pub out_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepResult {
    pub strategy_id: String,
    pub symbol: String,
    pub trades: u64,
    pub wins: u64,
    pub total_pips: f64,
    pub max_drawdown_pips: f64,
    pub sharpe: f64,
    pub out_dir: String,
}

/// Run every job in `jobs` across the Rayon global pool and write each
/// worker's artifact set as it finishes. Returns one `SweepResult` per
/// job, in the same order `jobs` was given (`par_iter().map` preserves
/// input order regardless of completion order).
pub fn run_sweep(jobs: Vec<SweepJob>) -> anyhow::Result<Vec<SweepResult>> {
    jobs.into_par_iter()
        .map(|job| {
            let strategy = OrbBreakoutStrategy::new(job.config.k_tp, job.config.k_sl, job.config.k_tr);
            let mut runner = BacktestRunner::new(job.config.clone(), strategy);
            runner.run(job.bars.into_iter());
            let metrics = runner.metrics();

            write_run_artifacts(&job.out_dir, metrics, &job.config, None)?;

            Ok(SweepResult {
                strategy_id: job.config.strategy_id.clone(),
                symbol: job.config.symbol.clone(),
                trades: metrics.trades,
                wins: metrics.wins,
                total_pips: metrics.total_pips,
                max_drawdown_pips: metrics.max_drawdown(),
                sharpe: metrics.sharpe(metrics.trades as f64).unwrap_or(0.0),
                out_dir: job.out_dir.display().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar(minute: u32, o: f64, h: f64, l: f64, c: f64) -> Bar {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 9, minute, 0).unwrap();
        Bar::validate(ts, "EURUSD".into(), crate::bar::Timeframe::M5, o, h, l, c, 100.0, 0.0001).unwrap()
    }

    fn sample_bars() -> Vec<Bar> {
        vec![
            bar(0, 1.1000, 1.1005, 1.0995, 1.1000),
            bar(5, 1.1000, 1.1005, 1.0995, 1.1000),
            bar(10, 1.1030, 1.1035, 1.1010, 1.1010),
        ]
    }

    #[test]
    fn sweep_runs_each_job_independently_and_preserves_order() {
        let dir = std::env::temp_dir().join(format!("orb_sweep_test_{}", std::process::id()));
        let mut cfg_a = RunnerConfig::default();
        cfg_a.strategy_id = "variant_a".into();
        cfg_a.ev_mode = crate::config::EvMode::Off;
        let mut cfg_b = RunnerConfig::default();
        cfg_b.strategy_id = "variant_b".into();
        cfg_b.ev_mode = crate::config::EvMode::Off;
        cfg_b.k_tp = 1.0;

        let jobs = vec![
            SweepJob { config: cfg_a, bars: sample_bars(), out_dir: dir.join("a") },
            SweepJob { config: cfg_b, bars: sample_bars(), out_dir: dir.join("b") },
        ];

        let results = run_sweep(jobs).expect("sweep should succeed");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].strategy_id, "variant_a");
        assert_eq!(results[1].strategy_id, "variant_b");
        assert!(dir.join("a").join("metrics.json").exists());
        assert!(dir.join("b").join("metrics.json").exists());

        std::fs::remove_dir_all(&dir).ok();
    }
}
