//! Incremental Bayesian skill ratings for racing competitors.
//!
//! Each competitor carries a Gaussian belief N(mu, sigma²) over latent skill.
//! A run in a race is modelled as `skill + N(0, beta²)` performance noise, so
//! a skill gap of `beta` is worth roughly an 80% head-to-head win chance.
//!
//! The update is the full-pair Thurstone–Mosteller approximation: every
//! participant is compared with every opponent whose relative finishing order
//! is known, the truncated-Gaussian corrections are summed over opponents, and
//! the variance is shrunk multiplicatively (never below `KAPPA` of its prior
//! value).  A per-race drift `tau²` is then added back so long histories do
//! not freeze the ratings.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::gaussian::{draw_margin, field_win_probabilities, v_draw, v_win, w_draw, w_win};
use crate::db::models::Race;

pub const DEFAULT_MU: f64 = 25.0;
pub const DEFAULT_SIGMA: f64 = DEFAULT_MU / 3.0;
pub const DEFAULT_BETA: f64 = DEFAULT_SIGMA / 2.0;
pub const DEFAULT_TAU: f64 = DEFAULT_SIGMA / 100.0;
pub const DEFAULT_DRAW: f64 = 0.10;
pub const DEFAULT_QUADRATURE_POINTS: usize = 512;

/// Lower bound on the per-race variance multiplier.
const KAPPA: f64 = 1e-4;

/// Skill model hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkillParams {
    /// Prior mean for an unseen competitor.
    pub mu: f64,
    /// Prior standard deviation for an unseen competitor.
    pub sigma: f64,
    /// Performance noise scale.
    pub beta: f64,
    /// Skill drift added after every race.
    pub tau: f64,
    pub draw_probability: f64,
    /// Trapezoid nodes used by [`SkillModel::win_probabilities`].
    pub quadrature_points: usize,
}

impl Default for SkillParams {
    fn default() -> Self {
        Self {
            mu: DEFAULT_MU,
            sigma: DEFAULT_SIGMA,
            beta: DEFAULT_BETA,
            tau: DEFAULT_TAU,
            draw_probability: DEFAULT_DRAW,
            quadrature_points: DEFAULT_QUADRATURE_POINTS,
        }
    }
}

/// Current belief about one competitor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkillBelief {
    pub mu: f64,
    pub sigma: f64,
    /// Races observed so far.
    pub runs: u32,
}

/// What a single [`SkillModel::update`] did to one competitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatingChange {
    pub competitor_id: i64,
    pub mu_before: f64,
    pub mu_after: f64,
    pub sigma_before: f64,
    /// Posterior sigma before the drift term is added back.
    pub sigma_posterior: f64,
    pub sigma_after: f64,
}

/// Relative result of one competitor against another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Duel {
    Beat,
    LostTo,
    Drew,
}

pub struct SkillModel {
    params: SkillParams,
    beliefs: HashMap<i64, SkillBelief>,
}

impl SkillModel {
    pub fn new(params: SkillParams) -> Self {
        SkillModel {
            params,
            beliefs: HashMap::new(),
        }
    }

    /// Number of competitors with at least one observed race.
    pub fn len(&self) -> usize {
        self.beliefs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beliefs.is_empty()
    }

    /// Current belief, or the prior for a competitor never seen before.
    pub fn belief(&self, competitor_id: i64) -> SkillBelief {
        self.beliefs
            .get(&competitor_id)
            .copied()
            .unwrap_or(SkillBelief {
                mu: self.params.mu,
                sigma: self.params.sigma,
                runs: 0,
            })
    }

    pub fn runs(&self, competitor_id: i64) -> u32 {
        self.beliefs.get(&competitor_id).map_or(0, |b| b.runs)
    }

    /// True when every competitor has at least `min_races` prior runs.
    pub fn has_history(&self, competitors: &[i64], min_races: u32) -> bool {
        competitors.iter().all(|c| self.runs(*c) >= min_races)
    }

    /// Probability that each competitor wins against the rest of the field.
    pub fn win_probabilities(&self, competitors: &[i64]) -> Vec<f64> {
        let beta_sq = self.params.beta * self.params.beta;
        let (means, spreads): (Vec<f64>, Vec<f64>) = competitors
            .iter()
            .map(|c| {
                let b = self.belief(*c);
                (b.mu, (b.sigma * b.sigma + beta_sq).sqrt())
            })
            .unzip();
        field_win_probabilities(&means, &spreads, self.params.quadrature_points)
    }

    /// Fold a settled race into the ratings.
    ///
    /// Returns one [`RatingChange`] per distinct participant, or an empty
    /// vector when fewer than two competitors ran or nobody was placed.
    pub fn update(&mut self, race: &Race) -> Vec<RatingChange> {
        let mut seen = HashSet::new();
        let field: Vec<(i64, Option<u32>)> = race
            .selections
            .iter()
            .filter(|s| seen.insert(s.competitor_id))
            .map(|s| (s.competitor_id, race.rank_of(s.selection_id)))
            .collect();
        // Without a single placed runner no pair can be ordered.
        if field.len() < 2 || field.iter().all(|(_, rank)| rank.is_none()) {
            return Vec::new();
        }

        let priors: Vec<SkillBelief> = field.iter().map(|(c, _)| self.belief(*c)).collect();
        let beta_sq = self.params.beta * self.params.beta;
        let margin = draw_margin(self.params.draw_probability, self.params.beta);
        let tau_sq = self.params.tau * self.params.tau;

        let mut changes = Vec::with_capacity(field.len());
        for (i, (competitor_id, rank_i)) in field.iter().enumerate() {
            let me = priors[i];
            let var_i = me.sigma * me.sigma;
            let mut mean_shift = 0.0;
            let mut var_shrink = 0.0;

            for (j, (_, rank_j)) in field.iter().enumerate() {
                if i == j {
                    continue;
                }
                let Some(duel) = compare(*rank_i, *rank_j) else {
                    continue;
                };
                let them = priors[j];
                let c = (2.0 * beta_sq + var_i + them.sigma * them.sigma).sqrt();
                let t = (me.mu - them.mu) / c;
                let eps = margin / c;
                let (v, w) = match duel {
                    Duel::Beat => (v_win(t, eps), w_win(t, eps)),
                    Duel::LostTo => (-v_win(-t, eps), w_win(-t, eps)),
                    Duel::Drew => match (v_draw(t, eps), w_draw(t, eps)) {
                        (Some(v), Some(w)) => (v, w),
                        _ => continue,
                    },
                };
                mean_shift += var_i / c * v;
                var_shrink += var_i / (c * c) * w;
            }

            let posterior_var = var_i * (1.0 - var_shrink).max(KAPPA);
            let change = RatingChange {
                competitor_id: *competitor_id,
                mu_before: me.mu,
                mu_after: me.mu + mean_shift,
                sigma_before: me.sigma,
                sigma_posterior: posterior_var.sqrt(),
                sigma_after: (posterior_var + tau_sq).sqrt(),
            };
            self.beliefs.insert(
                *competitor_id,
                SkillBelief {
                    mu: change.mu_after,
                    sigma: change.sigma_after,
                    runs: me.runs + 1,
                },
            );
            changes.push(change);
        }

        debug!(
            event_id = race.event_id,
            participants = changes.len(),
            "Skill ratings updated"
        );
        changes
    }
}

/// Result of `a` against `b` given finishing ranks (lower is better).
/// Two unplaced runners carry no information about each other.
fn compare(a: Option<u32>, b: Option<u32>) -> Option<Duel> {
    match (a, b) {
        (None, None) => None,
        (Some(_), None) => Some(Duel::Beat),
        (None, Some(_)) => Some(Duel::LostTo),
        (Some(x), Some(y)) => Some(match x.cmp(&y) {
            Ordering::Less => Duel::Beat,
            Ordering::Greater => Duel::LostTo,
            Ordering::Equal => Duel::Drew,
        }),
    }
}
