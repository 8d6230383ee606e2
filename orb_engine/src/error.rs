/// error.rs — Typed errors at module boundaries
///
/// Follows the error taxonomy: conditions the inner bar loop can recover
/// from locally (schema errors, strategy hook exceptions, EV underflow)
/// never produce an `Err` here — they are folded into debug counters by
/// the caller. These types exist for the boundaries that must fail hard
/// or that a caller needs to branch on (snapshot I/O, fingerprint checks,
/// fill-engine invariant violations, guardrail decisions).
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BarError {
    #[error("missing required column: {0}")]
    MissingColumn(&'static str),
    #[error("non-finite OHLC value in column {0}")]
    NonFinite(&'static str),
    #[error("invalid OHLC ordering: low={low} high={high} open={open} close={close}")]
    BadOrdering {
        low: f64,
        high: f64,
        open: f64,
        close: f64,
    },
    #[error("negative volume or spread")]
    Negative,
    #[error("csv row error: {0}")]
    Csv(String),
}

#[derive(Debug, Error)]
pub enum FillError {
    #[error("take-profit distance must be positive, got {0}")]
    NonPositiveTp(f64),
    #[error("stop-loss distance must be positive, got {0}")]
    NonPositiveSl(f64),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to read snapshot file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse snapshot JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown snapshot schema version {found}, expected {expected}")]
    UnknownSchemaVersion { found: u32, expected: u32 },
}

#[derive(Debug, Error)]
pub enum StrategyHookError {
    #[error("strategy_gate hook failed: {0}")]
    GateFailed(String),
    #[error("ev_threshold hook failed: {0}")]
    EvThresholdFailed(String),
}

#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("guardrail breach: {field} moved from {previous} to {current} (delta {abs_delta}, cap {cap})")]
    Breach {
        field: String,
        previous: f64,
        current: f64,
        abs_delta: f64,
        cap: f64,
    },
}
