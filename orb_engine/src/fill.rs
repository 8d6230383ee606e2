/// fill.rs — OCO/trailing-stop fill engine (C5)
///
/// Two resolution models share one `OrderSpec`/state-machine shape:
/// Conservative (deterministic bar-range touch detection with a
/// same-bar tie-break policy) and Brownian Bridge (a probabilistic
/// partial-fill expectation when both boundaries are touched in the
/// same bar). The bridge formula below is an explicit approximation —
/// documented as such, not as ground truth, per the source's own
/// caveat about tick data being unavailable at 5-minute-bar resolution.
use serde::{Deserialize, Serialize};

use crate::bar::Bar;
use crate::config::{RunnerConfig, SameBarPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Tp,
    Sl,
    Trail,
    Expired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderSpec {
    pub side: Side,
    pub entry: f64,
    /// Take-profit distance in pips from entry.
    pub tp_pips: f64,
    /// Stop-loss distance in pips from entry.
    pub sl_pips: f64,
    /// Trailing distance in pips; `0.0` disables trailing.
    pub trail_pips: f64,
    pub same_bar_policy: SameBarPolicy,
    pub qty: f64,
}

impl OrderSpec {
    pub fn validate(&self) -> Result<(), crate::error::FillError> {
        if self.tp_pips <= 0.0 {
            return Err(crate::error::FillError::NonPositiveTp(self.tp_pips));
        }
        if self.sl_pips <= 0.0 {
            return Err(crate::error::FillError::NonPositiveSl(self.sl_pips));
        }
        Ok(())
    }

    fn tp_price(&self, pip_size: f64) -> f64 {
        match self.side {
            Side::Buy => self.entry + self.tp_pips * pip_size,
            Side::Sell => self.entry - self.tp_pips * pip_size,
        }
    }

    fn sl_price(&self, current_sl_pips: f64, pip_size: f64) -> f64 {
        match self.side {
            Side::Buy => self.entry - current_sl_pips * pip_size,
            Side::Sell => self.entry + current_sl_pips * pip_size,
        }
    }
}

/// Terminal outcome of an order's lifecycle.
#[derive(Debug, Clone, Copy)]
pub struct FillOutcome {
    pub exit_reason: ExitReason,
    pub fill_price: f64,
    pub pnl_pips: f64,
    /// TP-hit probability for Bridge fills; `1.0`/`0.0` for a
    /// deterministic Conservative exit.
    pub p_tp: f64,
}

/// A live OCO order being walked forward bar by bar.
#[derive(Debug, Clone)]
pub struct ConservativeOrder {
    spec: OrderSpec,
    extreme_high: f64,
    extreme_low: f64,
}

impl ConservativeOrder {
    pub fn new(spec: OrderSpec, entry_price: f64) -> Self {
        Self {
            spec,
            extreme_high: entry_price,
            extreme_low: entry_price,
        }
    }

    /// Feed one bar (the entry bar or any subsequent bar). Returns
    /// `Some(outcome)` once the order reaches a terminal state.
    pub fn on_bar(&mut self, bar: &Bar, pip_size: f64, cost_pips: f64) -> Option<FillOutcome> {
        self.extreme_high = self.extreme_high.max(bar.high);
        self.extreme_low = self.extreme_low.min(bar.low);

        // Trailing stop ratchet, evaluated before the touch check so a
        // ratcheted SL can be breached within the same bar.
        let trail_sl_price = if self.spec.trail_pips > 0.0 {
            match self.spec.side {
                Side::Buy => Some(self.extreme_high - self.spec.trail_pips * pip_size),
                Side::Sell => Some(self.extreme_low + self.spec.trail_pips * pip_size),
            }
        } else {
            None
        };

        let tp_price = self.spec.tp_price(pip_size);
        let base_sl_price = self.spec.sl_price(self.spec.sl_pips, pip_size);
        let effective_sl_price = match (self.spec.side, trail_sl_price) {
            (Side::Buy, Some(t)) => base_sl_price.max(t),
            (Side::Sell, Some(t)) => base_sl_price.min(t),
            _ => base_sl_price,
        };
        let used_trail = match self.spec.side {
            Side::Buy => trail_sl_price.map_or(false, |t| t > base_sl_price),
            Side::Sell => trail_sl_price.map_or(false, |t| t < base_sl_price),
        };

        let tp_hit = match self.spec.side {
            Side::Buy => bar.high >= tp_price,
            Side::Sell => bar.low <= tp_price,
        };
        let sl_hit = match self.spec.side {
            Side::Buy => bar.low <= effective_sl_price,
            Side::Sell => bar.high >= effective_sl_price,
        };

        if !tp_hit && !sl_hit {
            return None;
        }

        let (exit_reason, fill_price) = if tp_hit && sl_hit {
            match resolve_same_bar(self.spec.side, bar.open, tp_price, effective_sl_price, self.spec.same_bar_policy) {
                SameBarWinner::Tp => (ExitReason::Tp, tp_price),
                SameBarWinner::Sl => {
                    if used_trail {
                        (ExitReason::Trail, effective_sl_price)
                    } else {
                        (ExitReason::Sl, effective_sl_price)
                    }
                }
            }
        } else if tp_hit {
            (ExitReason::Tp, tp_price)
        } else {
            if used_trail {
                (ExitReason::Trail, effective_sl_price)
            } else {
                (ExitReason::Sl, effective_sl_price)
            }
        };

        let pnl_pips = match exit_reason {
            ExitReason::Tp => self.spec.tp_pips - cost_pips,
            ExitReason::Sl | ExitReason::Trail => {
                let signed_pips = match self.spec.side {
                    Side::Buy => (fill_price - self.spec.entry) / pip_size,
                    Side::Sell => (self.spec.entry - fill_price) / pip_size,
                };
                signed_pips - cost_pips
            }
            ExitReason::Expired => -cost_pips,
        };
        let p_tp = if matches!(exit_reason, ExitReason::Tp) { 1.0 } else { 0.0 };

        Some(FillOutcome {
            exit_reason,
            fill_price,
            pnl_pips,
            p_tp,
        })
    }
}

enum SameBarWinner {
    Tp,
    Sl,
}

/// Resolve a same-bar TP+SL collision per the configured broker policy.
fn resolve_same_bar(side: Side, open: f64, tp_price: f64, sl_price: f64, policy: SameBarPolicy) -> SameBarWinner {
    match policy {
        // OANDA-like: no tick data at 5m resolution, so approximate
        // first-touch by whichever level is closer to the bar's open.
        // Documented as an approximation, not ground truth.
        SameBarPolicy::TickPriority => {
            let tp_dist = (tp_price - open).abs();
            let sl_dist = (sl_price - open).abs();
            if tp_dist <= sl_dist {
                SameBarWinner::Tp
            } else {
                SameBarWinner::Sl
            }
        }
        // IG-like and SBI-like: the protective/stop side wins outright.
        SameBarPolicy::ProtectivePriority | SameBarPolicy::StopPriority => {
            let _ = side;
            SameBarWinner::Sl
        }
    }
}

/// Brownian-bridge single-barrier hit probability via the reflection
/// principle: for a driftless bridge from `0` to `m` over `[0,1]`,
/// `P(max ≥ u) = exp(-2u(u-m)/σ²)` for `u > max(0,m)`, `1.0` otherwise.
/// `σ` is a bar-range volatility proxy, not a fitted diffusion
/// coefficient — an approximation appropriate to OHLC bar data.
fn reflection_hit_prob(u: f64, m: f64, sigma: f64) -> f64 {
    if u <= 0.0 || m >= u {
        return 1.0;
    }
    if sigma < 1e-12 {
        return 0.0;
    }
    (-2.0 * u * (u - m) / (sigma * sigma)).exp().clamp(0.0, 1.0)
}

/// Compute `p_tp = P(path hits TP before SL | open, high, low, close)`
/// for one bar, using the Brownian-bridge approximation with mixing
/// coefficient `λ` and drift scale `μ_scale`.
pub fn bridge_p_tp(
    side: Side,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    tp_price: f64,
    sl_price: f64,
    lambda: f64,
    mu_scale: f64,
) -> f64 {
    let sigma = ((high - low) / 4.0).max(1e-9);
    let drift = mu_scale * (close - open);

    let (u_tp, d_sl) = match side {
        Side::Buy => (tp_price - open, open - sl_price),
        Side::Sell => (open - tp_price, sl_price - open),
    };
    let m_tp = match side {
        Side::Buy => drift,
        Side::Sell => -drift,
    };
    let p_hit_tp = reflection_hit_prob(u_tp, m_tp, sigma);
    let p_hit_sl = reflection_hit_prob(d_sl, -m_tp, sigma);

    let denom = p_hit_tp + p_hit_sl;
    let ratio = if denom > 1e-12 { p_hit_tp / denom } else { 0.5 };
    (lambda * ratio + (1.0 - lambda) * p_hit_tp).clamp(0.0, 1.0)
}

/// Resolve one bar under the Brownian Bridge model. `None` means the
/// order stays open (neither boundary's price range was touched this
/// bar); `Some` is always terminal — the bridge model does not carry
/// partial orders across bars.
pub fn bridge_resolve_bar(
    spec: &OrderSpec,
    bar: &Bar,
    pip_size: f64,
    cost_pips: f64,
    cfg: &RunnerConfig,
) -> Option<FillOutcome> {
    let tp_price = spec.tp_price(pip_size);
    let sl_price = spec.sl_price(spec.sl_pips, pip_size);

    let tp_in_range = match spec.side {
        Side::Buy => bar.high >= tp_price,
        Side::Sell => bar.low <= tp_price,
    };
    let sl_in_range = match spec.side {
        Side::Buy => bar.low <= sl_price,
        Side::Sell => bar.high >= sl_price,
    };

    if !tp_in_range && !sl_in_range {
        return None;
    }

    let p_tp = if tp_in_range && sl_in_range {
        bridge_p_tp(spec.side, bar.open, bar.high, bar.low, bar.close, tp_price, sl_price, cfg.bridge_lambda, cfg.bridge_mu_scale)
    } else if tp_in_range {
        1.0
    } else {
        0.0
    };

    let pnl_pips = p_tp * spec.tp_pips - (1.0 - p_tp) * spec.sl_pips - cost_pips;
    let exit_reason = if p_tp >= 0.5 { ExitReason::Tp } else { ExitReason::Sl };
    let fill_price = if matches!(exit_reason, ExitReason::Tp) { tp_price } else { sl_price };

    Some(FillOutcome {
        exit_reason,
        fill_price,
        pnl_pips,
        p_tp,
    })
}

/// Per-spread-band EWMA slip model: `expected = a·size + b`, with `a`
/// fixed per band (a rough liquidity-depth proxy) and `b` the part that
/// adapts from realized-vs-expected residuals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SlipState {
    pub a: f64,
    pub b: f64,
}

impl SlipState {
    pub fn new(a: f64, b: f64) -> Self {
        Self { a, b }
    }

    pub fn expected(&self, size: f64) -> f64 {
        self.a * size + self.b
    }

    /// EWMA-update the intercept from one realized observation.
    pub fn update(&mut self, realized_slip_pips: f64, size: f64, ewma_alpha: f64) {
        let implied_b = realized_slip_pips - self.a * size;
        self.b = self.b * (1.0 - ewma_alpha) + implied_b * ewma_alpha;
    }
}
