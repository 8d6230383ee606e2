/// pips.rs — Symbol-indexed pip size and pip/price conversion
///
/// A pip is the quote-unit FX traders reason in: 0.01 for JPY crosses,
/// 0.0001 for everything else in this engine's symbol universe. Every
/// other component (EV, sizing, fill engine) works in pips; this module
/// is the only place price units and pip units meet.
use std::collections::HashMap;

/// Default pip size for non-JPY FX pairs.
pub const DEFAULT_PIP_SIZE: f64 = 0.0001;
/// Pip size for any pair quoted in JPY.
pub const JPY_PIP_SIZE: f64 = 0.01;

/// Symbol-indexed pip size table with a JPY-suffix fallback rule.
#[derive(Debug, Clone)]
pub struct PipTable {
    overrides: HashMap<String, f64>,
}

impl Default for PipTable {
    fn default() -> Self {
        Self {
            overrides: HashMap::new(),
        }
    }
}

impl PipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an explicit pip size for a symbol, overriding the JPY heuristic.
    pub fn with_override(mut self, symbol: &str, pip_size: f64) -> Self {
        self.overrides.insert(symbol.to_owned(), pip_size);
        self
    }

    /// Pip size for a symbol: explicit override, else JPY-suffix heuristic, else default.
    pub fn pip_size(&self, symbol: &str) -> f64 {
        if let Some(&p) = self.overrides.get(symbol) {
            return p;
        }
        if symbol.ends_with("JPY") {
            JPY_PIP_SIZE
        } else {
            DEFAULT_PIP_SIZE
        }
    }

    /// Convert a price delta to pips for a symbol.
    pub fn price_to_pips(&self, symbol: &str, price_delta: f64) -> f64 {
        price_delta / self.pip_size(symbol)
    }

    /// Convert a pip count to a price delta for a symbol.
    pub fn pips_to_price(&self, symbol: &str, pips: f64) -> f64 {
        pips * self.pip_size(symbol)
    }
}
