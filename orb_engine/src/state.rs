/// state.rs — Snapshot codec, fingerprinting, and archive management (C8)
///
/// No teacher analog: the corpus crypto engine never restarts mid-session.
/// Crate choices are grounded on `denniswon-crypto-strategy-rust`'s
/// manifest, which pairs `fs2` (cross-platform file locking) with
/// `tempfile` (atomic temp file pattern) for exactly this write-to-temp-
/// and-rename-with-fsync shape.
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::config::{FillModel, RunnerConfig, SameBarPolicy};
use crate::error::SnapshotError;
use crate::ev::{PooledEVState, PooledEvEstimator, WarmupTracker};
use crate::fill::SlipState;

pub const SCHEMA_VERSION: u32 = 1;

/// Stable hash over the subset of `RunnerConfig` fields that determine
/// whether a snapshot is safe to resume into: strategy id, mode, OR/OCO
/// shape, EV priors/decay/warmup, threshold, and fill policy parameters.
/// Deliberately excludes archive paths and guardrail tunables, which can
/// change between runs without invalidating prior state.
pub fn fingerprint(cfg: &RunnerConfig) -> u64 {
    #[derive(Hash)]
    struct FingerprintFields<'a> {
        strategy_id: &'a str,
        mode: &'a str,
        or_n: usize,
        k_tp: u64,
        k_sl: u64,
        k_tr: u64,
        alpha0: u64,
        beta0: u64,
        decay: u64,
        warmup_trades: u32,
        threshold_lcb_pip: u64,
        fill_model: FillModel,
        same_bar_policy: SameBarPolicy,
        bridge_lambda: u64,
        bridge_mu_scale: u64,
    }
    // f64 doesn't implement Hash; bit-cast to u64 for a stable, exact hash
    // (two runs with the same literal config always produce the same bits).
    let bits = |x: f64| x.to_bits();
    let fields = FingerprintFields {
        strategy_id: &cfg.strategy_id,
        mode: &cfg.mode,
        or_n: cfg.or_n,
        k_tp: bits(cfg.k_tp),
        k_sl: bits(cfg.k_sl),
        k_tr: bits(cfg.k_tr),
        alpha0: bits(cfg.alpha0),
        beta0: bits(cfg.beta0),
        decay: bits(cfg.decay),
        warmup_trades: cfg.warmup_trades,
        threshold_lcb_pip: bits(cfg.threshold_lcb_pip),
        fill_model: cfg.fill_model,
        same_bar_policy: cfg.same_bar_policy,
        bridge_lambda: bits(cfg.bridge_lambda),
        bridge_mu_scale: bits(cfg.bridge_mu_scale),
    };
    let mut hasher = DefaultHasher::new();
    fields.hash(&mut hasher);
    hasher.finish()
}

/// Per-spread-band slip coefficients, keyed by the band's debug name
/// (`narrow`/`normal`/`wide`) rather than the enum directly, so the
/// snapshot format doesn't depend on `SpreadBand`'s derive order.
pub type SlipStateMap = std::collections::BTreeMap<String, SlipState>;

/// Full serialized runner state: everything the adaptive update worker
/// needs to resume a run without replaying it from bar zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub schema_version: u32,
    pub runner_config_fingerprint: u64,
    pub pooled_ev: PooledEvSnapshot,
    pub slip_state: SlipStateMap,
    pub rv_thresholds: (f64, f64),
    pub warmup: WarmupTracker,
    pub strategy_state: serde_json::Value,
    pub last_bar_ts: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PooledEvSnapshot {
    pub buckets: Vec<(crate::features::BucketKey, PooledEVState)>,
    pub global: PooledEVState,
}

impl StateSnapshot {
    pub fn from_estimator(
        cfg: &RunnerConfig,
        estimator: &PooledEvEstimator,
        slip_state: SlipStateMap,
        rv_thresholds: (f64, f64),
        warmup: WarmupTracker,
        strategy_state: serde_json::Value,
        last_bar_ts: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            runner_config_fingerprint: fingerprint(cfg),
            pooled_ev: PooledEvSnapshot {
                buckets: estimator.buckets().iter().map(|(k, v)| (*k, *v)).collect(),
                global: estimator.global(),
            },
            slip_state,
            rv_thresholds,
            warmup,
            strategy_state,
            last_bar_ts,
        }
    }

    /// Outcome of comparing this snapshot's fingerprint to a live config:
    /// `Ok(())` on exact match, `Err` carries the degraded-compatibility
    /// warning text the caller should log before deciding whether to
    /// proceed (§4.7: "the codec accepts but marks compatibility=degraded").
    pub fn check_fingerprint(&self, cfg: &RunnerConfig) -> Result<(), String> {
        let live = fingerprint(cfg);
        if self.runner_config_fingerprint == live {
            Ok(())
        } else {
            Err(format!(
                "snapshot fingerprint {} does not match current config fingerprint {}",
                self.runner_config_fingerprint, live
            ))
        }
    }

    pub fn to_json_string(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self, SnapshotError> {
        let snap: Self = serde_json::from_str(s)?;
        if snap.schema_version != SCHEMA_VERSION {
            return Err(SnapshotError::UnknownSchemaVersion {
                found: snap.schema_version,
                expected: SCHEMA_VERSION,
            });
        }
        Ok(snap)
    }
}

/// `<archive_root>/<strategy_id>/<symbol>/<mode>/`
fn archive_dir(archive_root: &str, strategy_id: &str, symbol: &str, mode: &str) -> PathBuf {
    Path::new(archive_root).join(strategy_id).join(symbol).join(mode)
}

/// `<YYYYMMDD_HHMMSS>_<runid>.json`
fn snapshot_filename(run_at: chrono::DateTime<chrono::Utc>, run_id: &str) -> String {
    format!("{}_{}.json", run_at.format("%Y%m%d_%H%M%S"), run_id)
}

/// Write a snapshot atomically (temp file + fsync + rename) into the
/// archive directory, then prune older snapshots beyond `retention`.
/// Returns the path written.
pub fn write_snapshot(
    archive_root: &str,
    strategy_id: &str,
    symbol: &str,
    mode: &str,
    run_id: &str,
    run_at: chrono::DateTime<chrono::Utc>,
    retention: usize,
    snapshot: &StateSnapshot,
) -> Result<PathBuf, SnapshotError> {
    let dir = archive_dir(archive_root, strategy_id, symbol, mode);
    fs::create_dir_all(&dir)?;

    let final_path = dir.join(snapshot_filename(run_at, run_id));
    let json = snapshot.to_json_string()?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(json.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(&final_path).map_err(|e| SnapshotError::Io(e.error))?;

    prune_retention(&dir, retention)?;
    Ok(final_path)
}

/// Keep the most recent `retention` snapshots in `dir` (lexicographic
/// order matches chronological order since filenames are timestamp-
/// prefixed), deleting the rest.
fn prune_retention(dir: &Path, retention: usize) -> Result<(), SnapshotError> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    entries.sort();
    if entries.len() > retention {
        for stale in &entries[..entries.len() - retention] {
            let _ = fs::remove_file(stale);
        }
    }
    Ok(())
}

/// Load the most recent snapshot file in the archive directory for a
/// given (strategy, symbol, mode), if one exists.
pub fn load_latest_snapshot(
    archive_root: &str,
    strategy_id: &str,
    symbol: &str,
    mode: &str,
) -> Result<Option<StateSnapshot>, SnapshotError> {
    let dir = archive_dir(archive_root, strategy_id, symbol, mode);
    if !dir.exists() {
        return Ok(None);
    }
    let mut entries: Vec<PathBuf> = fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    entries.sort();
    match entries.last() {
        Some(path) => {
            let text = fs::read_to_string(path)?;
            Ok(Some(StateSnapshot::from_json_str(&text)?))
        }
        None => Ok(None),
    }
}

/// Nonblocking advisory lock over `<archive_root>/.lock`. `try_acquire`
/// returns `None` immediately if another process holds the lock — the
/// caller (adaptive update worker) treats that as a `"skipped"` job, not
/// an error (§5).
pub struct ArchiveLock {
    file: fs::File,
}

impl ArchiveLock {
    pub fn try_acquire(archive_root: &str) -> std::io::Result<Option<Self>> {
        fs::create_dir_all(archive_root)?;
        let path = Path::new(archive_root).join(".lock");
        let file = fs::OpenOptions::new().create(true).write(true).open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for ArchiveLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{BucketKey, RvBand, Session, SpreadBand, TrendFlag};

    fn key() -> BucketKey {
        BucketKey {
            session: Session::Ldn,
            spread_band: SpreadBand::Normal,
            rv_band: RvBand::Mid,
            trend_flag: TrendFlag::Ranging,
        }
    }

    /// Fingerprint round-trip: the same config always produces the same
    /// fingerprint, and export→load→export is byte-identical.
    #[test]
    fn fingerprint_is_deterministic_for_same_config() {
        let cfg = RunnerConfig::default();
        assert_eq!(fingerprint(&cfg), fingerprint(&cfg));
    }

    #[test]
    fn fingerprint_changes_with_warmup_trades() {
        let cfg_a = RunnerConfig::default();
        let mut cfg_b = RunnerConfig::default();
        cfg_b.warmup_trades = cfg_a.warmup_trades + 1;
        assert_ne!(fingerprint(&cfg_a), fingerprint(&cfg_b));
    }

    #[test]
    fn snapshot_json_round_trip_is_byte_identical() {
        let cfg = RunnerConfig::default();
        let mut est = PooledEvEstimator::new(cfg.alpha0, cfg.beta0, cfg.decay, cfg.n_min, cfg.confidence);
        est.update(key(), 1.0);
        let snap = StateSnapshot::from_estimator(
            &cfg,
            &est,
            SlipStateMap::new(),
            (0.0003, 0.0007),
            WarmupTracker::new(cfg.warmup_trades),
            serde_json::Value::Null,
            chrono::Utc::now(),
        );
        let json1 = snap.to_json_string().unwrap();
        let restored = StateSnapshot::from_json_str(&json1).unwrap();
        let json2 = restored.to_json_string().unwrap();
        assert_eq!(json1, json2);
    }

    #[test]
    fn fingerprint_mismatch_is_reported_not_panicked() {
        let cfg = RunnerConfig::default();
        let est = PooledEvEstimator::new(cfg.alpha0, cfg.beta0, cfg.decay, cfg.n_min, cfg.confidence);
        let snap = StateSnapshot::from_estimator(
            &cfg,
            &est,
            SlipStateMap::new(),
            (0.0003, 0.0007),
            WarmupTracker::new(cfg.warmup_trades),
            serde_json::Value::Null,
            chrono::Utc::now(),
        );
        let mut other = cfg.clone();
        other.warmup_trades += 1;
        assert!(snap.check_fingerprint(&other).is_err());
        assert!(snap.check_fingerprint(&cfg).is_ok());
    }

    #[test]
    fn write_and_load_latest_snapshot_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_str().unwrap();
        let cfg = RunnerConfig::default();
        let est = PooledEvEstimator::new(cfg.alpha0, cfg.beta0, cfg.decay, cfg.n_min, cfg.confidence);
        let snap = StateSnapshot::from_estimator(
            &cfg,
            &est,
            SlipStateMap::new(),
            (0.0003, 0.0007),
            WarmupTracker::new(cfg.warmup_trades),
            serde_json::Value::Null,
            chrono::Utc::now(),
        );
        write_snapshot(root, "orb_v1", "EURUSD", "backtest", "run1", chrono::Utc::now(), 5, &snap).unwrap();
        let loaded = load_latest_snapshot(root, "orb_v1", "EURUSD", "backtest").unwrap();
        assert!(loaded.is_some());
        assert_eq!(loaded.unwrap().runner_config_fingerprint, snap.runner_config_fingerprint);
    }

    #[test]
    fn retention_prunes_older_snapshots() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_str().unwrap();
        let cfg = RunnerConfig::default();
        let est = PooledEvEstimator::new(cfg.alpha0, cfg.beta0, cfg.decay, cfg.n_min, cfg.confidence);
        for i in 0..7 {
            let snap = StateSnapshot::from_estimator(
                &cfg,
                &est,
                SlipStateMap::new(),
                (0.0003, 0.0007),
                WarmupTracker::new(cfg.warmup_trades),
                serde_json::Value::Null,
                chrono::Utc::now(),
            );
            let ts = chrono::Utc::now() + chrono::Duration::seconds(i);
            write_snapshot(root, "orb_v1", "EURUSD", "backtest", &format!("run{i}"), ts, 3, &snap).unwrap();
        }
        let dir = archive_dir(root, "orb_v1", "EURUSD", "backtest");
        let count = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("json"))
            .count();
        assert_eq!(count, 3);
    }

    #[test]
    fn archive_lock_is_nonblocking() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_str().unwrap();
        let first = ArchiveLock::try_acquire(root).unwrap();
        assert!(first.is_some());
        let second = ArchiveLock::try_acquire(root).unwrap();
        assert!(second.is_none(), "second acquisition should not block, just fail");
        drop(first);
        let third = ArchiveLock::try_acquire(root).unwrap();
        assert!(third.is_some());
    }
}
