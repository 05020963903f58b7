//! Stake sizing for a single n-way-win-one market.
//!
//! Given our win probabilities `p` and market-implied probabilities
//! `q = 1 / odds`, we pick the stake vector `w` (positive = back,
//! negative = lay) that maximises
//!
//!   Σ wᵢ·(pᵢ/qᵢ − 1)  −  λ·‖w‖²
//!
//! i.e. expected return per unit staked against the market, minus an L2
//! penalty that discourages large or concentrated books.  The objective is
//! separable and strictly concave, so the optimum is closed-form:
//!
//!   wᵢ = (pᵢ/qᵢ − 1) / (2λ)
//!
//! Before solving, `p` is clamped into `q·(1 ± t)` so a small-sample model
//! cannot talk us into an unbounded position.  After solving, the book is
//! checked against every possible winner; if the worst case loses more than
//! `max_exposure` the whole book is rejected.
use thiserror::Error;

pub const DEFAULT_RISK_AVERSION: f64 = 0.1;
pub const DEFAULT_MAX_EXPOSURE: f64 = 50.0;
pub const DEFAULT_DIVERGENCE_TOLERANCE: f64 = 0.1;

#[derive(Debug, Error, PartialEq)]
pub enum RiskError {
    #[error("probability vectors differ in length ({p} vs {q})")]
    LengthMismatch { p: usize, q: usize },
    #[error("empty market")]
    EmptyMarket,
    #[error("market probability {0} at index {1} is outside (0, 1]")]
    InvalidMarketProbability(f64, usize),
    #[error("model probability {0} at index {1} is not a finite non-negative number")]
    InvalidModelProbability(f64, usize),
}

/// Outcome of sizing one market.
#[derive(Debug, Clone, PartialEq)]
pub enum Sizing {
    Accepted {
        stakes: Vec<f64>,
        /// `p` after blending towards the market
        probabilities: Vec<f64>,
        collateral: f64,
    },
    /// Worst-case return breached `-max_exposure`; nothing may be placed.
    Rejected { collateral: f64 },
}

/// Calculate the edge of a bet relative to the market.
///
/// Edge = win_prob / market_prob − 1
///
/// Positive edge means the market is underpricing the true probability.
pub fn edge(win_prob: f64, market_prob: f64) -> f64 {
    if market_prob <= 0.0 {
        return 0.0;
    }
    win_prob / market_prob - 1.0
}

/// Cap model probabilities whose relative divergence from the market exceeds
/// `tolerance` at `q·(1 ± tolerance)`.
pub fn blend(p: &[f64], q: &[f64], tolerance: f64) -> Vec<f64> {
    p.iter()
        .zip(q)
        .map(|(&pi, &qi)| {
            let rel = edge(pi, qi);
            if rel > tolerance {
                qi * (1.0 + tolerance)
            } else if rel < -tolerance {
                qi * (1.0 - tolerance)
            } else {
                pi
            }
        })
        .collect()
}

/// Maximiser of `Σ wᵢ(pᵢ/qᵢ − 1) − λ‖w‖²`.
pub fn l2_stakes(p: &[f64], q: &[f64], risk_aversion: f64) -> Vec<f64> {
    p.iter()
        .zip(q)
        .map(|(&pi, &qi)| edge(pi, qi) / (2.0 * risk_aversion))
        .collect()
}

/// Net return of the book for each possible single winner `k`:
/// `wₖ·(oddsₖ − 1) − Σⱼ≠ₖ wⱼ`.
pub fn outcome_returns(stakes: &[f64], odds: &[f64]) -> Vec<f64> {
    let total: f64 = stakes.iter().sum();
    stakes
        .iter()
        .zip(odds)
        .map(|(&wk, &ok)| wk * (ok - 1.0) - (total - wk))
        .collect()
}

/// Worst-case return across all single-winner outcomes.
pub fn collateral(stakes: &[f64], odds: &[f64]) -> f64 {
    outcome_returns(stakes, odds)
        .into_iter()
        .fold(f64::INFINITY, f64::min)
}

/// Risk-constrained stake sizer.  Holds configuration only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StakeOptimizer {
    /// L2 penalty strength λ (> 0)
    pub risk_aversion: f64,
    /// Largest tolerable worst-case loss for one market
    pub max_exposure: f64,
    /// Relative divergence `t` beyond which `p` is capped
    pub divergence_tolerance: f64,
}

impl Default for StakeOptimizer {
    fn default() -> Self {
        Self {
            risk_aversion: DEFAULT_RISK_AVERSION,
            max_exposure: DEFAULT_MAX_EXPOSURE,
            divergence_tolerance: DEFAULT_DIVERGENCE_TOLERANCE,
        }
    }
}

impl StakeOptimizer {
    pub fn new(risk_aversion: f64, max_exposure: f64, divergence_tolerance: f64) -> Self {
        Self {
            risk_aversion,
            max_exposure,
            divergence_tolerance,
        }
    }

    /// Size a book for one market.
    ///
    /// # Arguments
    /// * `p` – Model win probabilities, one per selection.
    /// * `q` – Market-implied probabilities (`1 / odds`), same order.
    pub fn size(&self, p: &[f64], q: &[f64]) -> Result<Sizing, RiskError> {
        validate(p, q)?;

        let probabilities = blend(p, q, self.divergence_tolerance);
        let stakes = l2_stakes(&probabilities, q, self.risk_aversion);
        let odds: Vec<f64> = q.iter().map(|qi| 1.0 / qi).collect();
        let collateral = collateral(&stakes, &odds);

        if collateral < -self.max_exposure {
            return Ok(Sizing::Rejected { collateral });
        }
        Ok(Sizing::Accepted {
            stakes,
            probabilities,
            collateral,
        })
    }
}

fn validate(p: &[f64], q: &[f64]) -> Result<(), RiskError> {
    if p.len() != q.len() {
        return Err(RiskError::LengthMismatch {
            p: p.len(),
            q: q.len(),
        });
    }
    if p.is_empty() {
        return Err(RiskError::EmptyMarket);
    }
    for (i, &qi) in q.iter().enumerate() {
        if !(qi > 0.0 && qi <= 1.0) {
            return Err(RiskError::InvalidMarketProbability(qi, i));
        }
    }
    for (i, &pi) in p.iter().enumerate() {
        if !pi.is_finite() || pi < 0.0 {
            return Err(RiskError::InvalidModelProbability(pi, i));
        }
    }
    Ok(())
}
