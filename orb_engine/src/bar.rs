/// bar.rs — Bar schema, validation, and CSV ingestion
///
/// A 5-minute OHLCV record. Parsing is the only place raw external input
/// (CSV rows) meets the engine's typed model; everything downstream of
/// `Bar::validate` assumes the invariants below already hold.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BarError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "5m")]
    M5,
}

/// One validated OHLCV bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub tf: Timeframe,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Price-unit spread, not pips.
    pub spread: f64,
}

/// Raw row shape as read off the CSV: `timestamp,symbol,tf,o,h,l,c,v,spread`.
/// Kept separate from `Bar` so invalid rows can be rejected before any
/// domain invariant is assumed.
#[derive(Debug, Clone, Deserialize)]
struct RawBarRow {
    timestamp: String,
    symbol: String,
    tf: String,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
    spread: f64,
}

impl Bar {
    /// Validate OHLC ordering, finiteness, and non-negativity.
    ///
    /// `low ≤ min(open,close) ≤ max(open,close) ≤ high`; volume and
    /// spread must be finite and `≥ 0`.
    pub fn validate(
        timestamp: DateTime<Utc>,
        symbol: String,
        tf: Timeframe,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        spread: f64,
    ) -> Result<Self, BarError> {
        for (name, v) in [
            ("open", open),
            ("high", high),
            ("low", low),
            ("close", close),
            ("volume", volume),
            ("spread", spread),
        ] {
            if !v.is_finite() {
                return Err(BarError::NonFinite(name_to_static(name)));
            }
        }
        if volume < 0.0 || spread < 0.0 {
            return Err(BarError::Negative);
        }
        let lo = low;
        let hi = high;
        let body_lo = open.min(close);
        let body_hi = open.max(close);
        if !(lo <= body_lo && body_hi <= hi) {
            return Err(BarError::BadOrdering {
                low,
                high,
                open,
                close,
            });
        }
        Ok(Self {
            timestamp,
            symbol,
            tf,
            open,
            high,
            low,
            close,
            volume,
            spread,
        })
    }

    /// Natural-log return against the previous bar's close. `0.0` if the
    /// previous close is non-positive (first bar, or malformed upstream data
    /// that already failed validation and was skipped).
    pub fn log_return(&self, prev_close: f64) -> f64 {
        if prev_close > 0.0 {
            (self.close / prev_close).ln()
        } else {
            0.0
        }
    }
}

fn name_to_static(name: &str) -> &'static str {
    match name {
        "open" => "open",
        "high" => "high",
        "low" => "low",
        "close" => "close",
        "volume" => "volume",
        "spread" => "spread",
        _ => "unknown",
    }
}

/// Outcome of parsing one input row: either a validated bar, or a
/// rejection reason the caller folds into `missing_cols`/skip counters.
pub enum BarParseOutcome {
    Ok(Bar),
    Rejected(BarError),
}

/// Parse and validate a stream of bar rows from anything implementing
/// `std::io::Read`, using the fixed header
/// `timestamp,symbol,tf,o,h,l,c,v,spread`.
///
/// This does not own the file handle (CLI/manifest layer is out of
/// scope) — callers pass an already-open reader.
pub struct BarReader<R: std::io::Read> {
    inner: csv::Reader<R>,
}

impl<R: std::io::Read> BarReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: csv::ReaderBuilder::new().has_headers(true).from_reader(reader),
        }
    }

    /// Parse the next row, if any. Returns `None` at end of stream.
    /// Malformed rows are surfaced as `BarParseOutcome::Rejected` rather
    /// than terminating the stream, per §4.1's failure mode.
    pub fn next_row(&mut self) -> Option<BarParseOutcome> {
        let mut iter = self.inner.deserialize::<RawBarRow>();
        let raw = match iter.next()? {
            Ok(r) => r,
            Err(e) => return Some(BarParseOutcome::Rejected(BarError::Csv(e.to_string()))),
        };
        Some(parse_raw_row(raw))
    }
}

fn parse_raw_row(raw: RawBarRow) -> BarParseOutcome {
    let ts = match DateTime::parse_from_rfc3339(&raw.timestamp) {
        Ok(t) => t.with_timezone(&Utc),
        Err(e) => return BarParseOutcome::Rejected(BarError::Csv(e.to_string())),
    };
    let tf = if raw.tf == "5m" {
        Timeframe::M5
    } else {
        return BarParseOutcome::Rejected(BarError::Csv(format!("unknown timeframe {}", raw.tf)));
    };
    match Bar::validate(ts, raw.symbol, tf, raw.o, raw.h, raw.l, raw.c, raw.v, raw.spread) {
        Ok(bar) => BarParseOutcome::Ok(bar),
        Err(e) => BarParseOutcome::Rejected(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-02T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn valid_bar_passes() {
        let bar = Bar::validate(ts(), "EURUSD".into(), Timeframe::M5, 1.10, 1.102, 1.099, 1.101, 1000.0, 0.0001);
        assert!(bar.is_ok());
    }

    #[test]
    fn rejects_bad_ordering() {
        let bar = Bar::validate(ts(), "EURUSD".into(), Timeframe::M5, 1.10, 1.05, 1.099, 1.101, 1000.0, 0.0001);
        assert!(matches!(bar, Err(BarError::BadOrdering { .. })));
    }

    #[test]
    fn rejects_non_finite() {
        let bar = Bar::validate(ts(), "EURUSD".into(), Timeframe::M5, f64::NAN, 1.102, 1.099, 1.101, 1000.0, 0.0001);
        assert!(matches!(bar, Err(BarError::NonFinite(_))));
    }

    #[test]
    fn rejects_negative_volume() {
        let bar = Bar::validate(ts(), "EURUSD".into(), Timeframe::M5, 1.10, 1.102, 1.099, 1.101, -1.0, 0.0001);
        assert!(matches!(bar, Err(BarError::Negative)));
    }

    #[test]
    fn csv_row_round_trip() {
        let csv_data = "timestamp,symbol,tf,o,h,l,c,v,spread\n2024-01-02T09:00:00Z,EURUSD,5m,1.10,1.102,1.099,1.101,1000,0.0001\n";
        let mut reader = BarReader::new(csv_data.as_bytes());
        match reader.next_row() {
            Some(BarParseOutcome::Ok(bar)) => {
                assert_eq!(bar.symbol, "EURUSD");
                assert!((bar.close - 1.101).abs() < 1e-12);
            }
            _ => panic!("expected a valid bar"),
        }
        assert!(reader.next_row().is_none());
    }
}
