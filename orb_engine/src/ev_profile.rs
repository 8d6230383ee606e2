/// ev_profile.rs — EV profile aggregator (C10)
///
/// Scans the state archive (C8's snapshot layout) and produces long-term
/// + recent Beta priors per bucket, which `RunnerConfig`/`PooledEvEstimator`
/// seeding consumes at runner start (§6's "EV profile file" format, §9's
/// `ev_profile_obs_norm` open question). No teacher analog; grounded on
/// C8's archive directory layout and C3's `(alpha, beta)` shape — this
/// module produces exactly the triples C3 consumes as seeds.
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;
use crate::ev::PooledEVState;
use crate::features::{BucketKey, RvBand, Session, SpreadBand, TrendFlag};
use crate::state::StateSnapshot;

/// One bucket's posterior triple, as it appears in the EV profile file
/// format (§6): `bucket_key -> {alpha, beta, n}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BucketStat {
    pub alpha: f64,
    pub beta: f64,
    pub n: f64,
}

impl From<PooledEVState> for BucketStat {
    fn from(s: PooledEVState) -> Self {
        Self {
            alpha: s.alpha,
            beta: s.beta,
            n: s.n_eff(),
        }
    }
}

/// The two-section EV profile: `long_term` spans the full archive
/// history, `recent` is built from only the most recent snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvProfile {
    pub long_term: BTreeMap<String, BucketStat>,
    pub recent: BTreeMap<String, BucketStat>,
}

impl EvProfile {
    pub fn to_json_string(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Seed prior `(alpha0, beta0)` for one bucket, blending `long_term`
    /// and `recent` by observation-count normalization against
    /// `obs_norm` (§9: "treat as a tunable, not a fixed law"). Buckets
    /// absent from both sections fall back to the caller's existing
    /// prior (returns `None`).
    pub fn seed_for_bucket(&self, key: &BucketKey, obs_norm: f64) -> Option<(f64, f64)> {
        let key_str = key.as_key_string();
        let lt = self.long_term.get(&key_str);
        let rc = self.recent.get(&key_str);
        match (lt, rc) {
            (None, None) => None,
            (Some(l), None) => Some((l.alpha, l.beta)),
            (None, Some(r)) => Some((r.alpha, r.beta)),
            (Some(l), Some(r)) => {
                let w_recent = r.n / (r.n + obs_norm.max(1e-9));
                let alpha = w_recent * r.alpha + (1.0 - w_recent) * l.alpha;
                let beta = w_recent * r.beta + (1.0 - w_recent) * l.beta;
                Some((alpha, beta))
            }
        }
    }
}

/// Scan every snapshot under `<archive_root>/<strategy_id>/<symbol>/<mode>/`,
/// aggregating per-bucket statistics. `long_term` merges every snapshot
/// (later ones overwrite earlier ones per bucket, since Beta-Binomial
/// state already accumulates decayed history — no further averaging is
/// meaningful). `recent` reflects only the single most recent snapshot.
pub fn aggregate(
    archive_root: &str,
    strategy_id: &str,
    symbol: &str,
    mode: &str,
) -> Result<EvProfile, SnapshotError> {
    let dir = Path::new(archive_root).join(strategy_id).join(symbol).join(mode);
    if !dir.exists() {
        return Ok(EvProfile::default());
    }

    let mut paths: Vec<_> = fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .filter(|p| p.file_name().and_then(|n| n.to_str()) != Some(".lock"))
        .collect();
    paths.sort();

    let mut long_term: BTreeMap<String, BucketStat> = BTreeMap::new();
    for path in &paths {
        let text = fs::read_to_string(path)?;
        let snap = match StateSnapshot::from_json_str(&text) {
            Ok(s) => s,
            Err(_) => continue, // tolerate stray non-snapshot files in the archive dir
        };
        for (key, state) in &snap.pooled_ev.buckets {
            long_term.insert(key.as_key_string(), BucketStat::from(*state));
        }
    }

    let recent = match paths.last() {
        Some(path) => {
            let text = fs::read_to_string(path)?;
            match StateSnapshot::from_json_str(&text) {
                Ok(snap) => snap
                    .pooled_ev
                    .buckets
                    .iter()
                    .map(|(k, v)| (k.as_key_string(), BucketStat::from(*v)))
                    .collect(),
                Err(_) => BTreeMap::new(),
            }
        }
        None => BTreeMap::new(),
    };

    Ok(EvProfile { long_term, recent })
}

/// Parse a bucket key's `as_key_string()` form (`"Ldn/Normal/Mid/Ranging"`)
/// back into a `BucketKey`. Only used when loading an externally-authored
/// EV profile file whose keys must be validated against the live enum
/// space; the archive-scan path above never needs this since it always
/// has the typed `BucketKey` already in hand.
pub fn parse_bucket_key(s: &str) -> Option<BucketKey> {
    let mut parts = s.split('/');
    let session = match parts.next()? {
        "Tok" => Session::Tok,
        "Ldn" => Session::Ldn,
        "Ny" => Session::Ny,
        _ => return None,
    };
    let spread_band = match parts.next()? {
        "Narrow" => SpreadBand::Narrow,
        "Normal" => SpreadBand::Normal,
        "Wide" => SpreadBand::Wide,
        _ => return None,
    };
    let rv_band = match parts.next()? {
        "Low" => RvBand::Low,
        "Mid" => RvBand::Mid,
        "High" => RvBand::High,
        _ => return None,
    };
    let trend_flag = match parts.next()? {
        "Trending" => TrendFlag::Trending,
        "Ranging" => TrendFlag::Ranging,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(BucketKey {
        session,
        spread_band,
        rv_band,
        trend_flag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::ev::PooledEvEstimator;
    use crate::state::{write_snapshot, SlipStateMap};

    fn key() -> BucketKey {
        BucketKey {
            session: Session::Ldn,
            spread_band: SpreadBand::Normal,
            rv_band: RvBand::Mid,
            trend_flag: TrendFlag::Ranging,
        }
    }

    #[test]
    fn bucket_key_string_round_trips() {
        let k = key();
        let s = k.as_key_string();
        assert_eq!(parse_bucket_key(&s), Some(k));
    }

    #[test]
    fn seed_blends_long_term_and_recent_by_obs_norm() {
        let mut profile = EvProfile::default();
        let k = key().as_key_string();
        profile.long_term.insert(k.clone(), BucketStat { alpha: 10.0, beta: 10.0, n: 100.0 });
        profile.recent.insert(k.clone(), BucketStat { alpha: 2.0, beta: 2.0, n: 5.0 });
        let (alpha, beta) = profile.seed_for_bucket(&key(), 15.0).unwrap();
        // recent has low n relative to obs_norm, so long_term should dominate
        assert!(alpha > 8.0 && alpha < 10.0);
        assert!(beta > 8.0 && beta < 10.0);
    }

    #[test]
    fn missing_bucket_returns_none() {
        let profile = EvProfile::default();
        assert!(profile.seed_for_bucket(&key(), 15.0).is_none());
    }

    #[test]
    fn aggregate_scans_archive_and_builds_recent_from_latest() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_str().unwrap();
        let cfg = RunnerConfig::default();

        let mut est1 = PooledEvEstimator::new(cfg.alpha0, cfg.beta0, cfg.decay, cfg.n_min, cfg.confidence);
        est1.update(key(), 1.0);
        let snap1 = StateSnapshot::from_estimator(
            &cfg, &est1, SlipStateMap::new(), (0.0003, 0.0007),
            crate::ev::WarmupTracker::new(cfg.warmup_trades), serde_json::Value::Null, chrono::Utc::now(),
        );
        write_snapshot(root, "orb_v1", "EURUSD", "backtest", "run1", chrono::Utc::now(), 5, &snap1).unwrap();

        let mut est2 = PooledEvEstimator::new(cfg.alpha0, cfg.beta0, cfg.decay, cfg.n_min, cfg.confidence);
        est2.update(key(), 1.0);
        est2.update(key(), 1.0);
        let snap2 = StateSnapshot::from_estimator(
            &cfg, &est2, SlipStateMap::new(), (0.0003, 0.0007),
            crate::ev::WarmupTracker::new(cfg.warmup_trades), serde_json::Value::Null, chrono::Utc::now(),
        );
        let ts2 = chrono::Utc::now() + chrono::Duration::seconds(5);
        write_snapshot(root, "orb_v1", "EURUSD", "backtest", "run2", ts2, 5, &snap2).unwrap();

        let profile = aggregate(root, "orb_v1", "EURUSD", "backtest").unwrap();
        assert!(profile.long_term.contains_key(&key().as_key_string()));
        assert!(profile.recent.contains_key(&key().as_key_string()));
    }

    #[test]
    fn aggregate_on_empty_archive_returns_empty_profile() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_str().unwrap();
        let profile = aggregate(root, "orb_v1", "EURUSD", "backtest").unwrap();
        assert!(profile.long_term.is_empty());
        assert!(profile.recent.is_empty());
    }
}
