use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::handler::{BettingDesk, RaceHandler, RaceVerdict, SkipReason};
use crate::analytics::skill::RatingChange;
use crate::analytics::SkillModel;
use crate::db::models::{Race, RaceKind};
use crate::risk::{Sizing, StakeOptimizer};

/// Stakes smaller than this are not worth a ledger row.
const DUST_STAKE: f64 = 1e-6;

pub const DEFAULT_MIN_RUNNERS: u32 = 3;
pub const DEFAULT_FAVOURITE_STAKE: f64 = 2.0;

/// Bets the skill model's view of a win market against VWAO prices, then
/// folds the result into the ratings.
pub struct SkillStrategy {
    model: SkillModel,
    optimizer: StakeOptimizer,
    /// Observations every runner needs before the race is bet
    min_races: u32,
    min_runners: u32,
}

impl SkillStrategy {
    pub fn new(model: SkillModel, optimizer: StakeOptimizer, min_races: u32, min_runners: u32) -> Self {
        SkillStrategy {
            model,
            optimizer,
            min_races,
            min_runners,
        }
    }

    #[cfg(test)]
    pub fn model(&self) -> &SkillModel {
        &self.model
    }

    /// Bets for `race` using only beliefs formed before its result.
    fn decide(&self, race: &Race, desk: &mut BettingDesk<'_>) -> RaceVerdict {
        if race.n_runners < self.min_runners {
            return RaceVerdict::Skipped(SkipReason::TooFewRunners);
        }
        let competitors = race.competitor_ids();
        if !self.model.has_history(&competitors, self.min_races) {
            debug!(
                "Event {}: field lacks history ({} competitors rated so far)",
                race.event_id,
                self.model.len()
            );
            return RaceVerdict::Skipped(SkipReason::InsufficientHistory);
        }
        let odds = match desk.market_odds(race) {
            Ok(odds) => odds,
            Err(SkipReason::MissingQuote) => {
                warn!("No VWAO for some selections of event {}, skipping", race.event_id);
                return RaceVerdict::Skipped(SkipReason::MissingQuote);
            }
            Err(reason) => {
                info!("Event {}: {} in market, skipping", race.event_id, reason);
                return RaceVerdict::Skipped(reason);
            }
        };

        let q: Vec<f64> = odds.iter().map(|o| 1.0 / o).collect();
        let p_model = self.model.win_probabilities(&competitors);

        let (stakes, probabilities, collateral) = match self.optimizer.size(&p_model, &q) {
            Ok(Sizing::Accepted {
                stakes,
                probabilities,
                collateral,
            }) => (stakes, probabilities, collateral),
            Ok(Sizing::Rejected { collateral }) => {
                info!(
                    "Skipping placing bets as coll={:.2} on event {}",
                    collateral, race.event_id
                );
                return RaceVerdict::Skipped(SkipReason::CollateralBreach);
            }
            Err(e) => {
                warn!("Event {}: optimizer refused market: {}", race.event_id, e);
                return RaceVerdict::Skipped(SkipReason::InvalidMarket);
            }
        };

        info!(
            "Placing some bets on event {} (coll={:.2})",
            race.event_id, collateral
        );
        let mut placed = 0;
        for (i, selection) in race.selections.iter().enumerate() {
            let amount = stakes[i];
            if amount.abs() <= DUST_STAKE {
                continue;
            }
            let user_fields = BTreeMap::from([
                ("p".to_string(), probabilities[i]),
                ("p_model".to_string(), p_model[i]),
            ]);
            match desk.place(race, selection.selection_id, amount, user_fields) {
                Ok(bet) => {
                    debug!(
                        "  {} {:.3} @ {:.2} on {} (p={:.3}, pnl={:.3})",
                        if bet.is_back() { "back" } else { "lay" },
                        bet.amount.abs(),
                        bet.odds,
                        bet.selection_id,
                        probabilities[i],
                        bet.pnl
                    );
                    placed += 1;
                }
                Err(reason) => warn!(
                    "Event {}: could not place on {}: {}",
                    race.event_id, selection.selection_id, reason
                ),
            }
        }
        RaceVerdict::Placed { bets: placed }
    }
}

impl RaceHandler for SkillStrategy {
    fn name(&self) -> &'static str {
        "skill"
    }

    fn handle(&mut self, race: &Race, desk: &mut BettingDesk<'_>) -> RaceVerdict {
        // A place market's winners are not a finishing order.
        if race.kind != RaceKind::Win {
            return RaceVerdict::Skipped(SkipReason::MarketKind);
        }
        if self.model.is_empty() {
            info!("Event {} is the first rated race", race.event_id);
        }
        let verdict = self.decide(race, desk);
        let changes = self.model.update(race);
        let gain = |c: &RatingChange| c.mu_after - c.mu_before;
        if let Some(top) = changes.iter().max_by(|a, b| gain(*a).total_cmp(&gain(*b))) {
            debug!(
                "Event {}: competitor {} mu {:.2} -> {:.2}, sigma {:.2} -> {:.2} ({:.2} before drift)",
                race.event_id,
                top.competitor_id,
                top.mu_before,
                top.mu_after,
                top.sigma_before,
                top.sigma_after,
                top.sigma_posterior
            );
        }
        verdict
    }
}

/// Baseline: back the market favourite with a fixed stake.
pub struct FavouriteBacker {
    stake: f64,
    kind: RaceKind,
}

impl FavouriteBacker {
    pub fn new(stake: f64, kind: RaceKind) -> Self {
        FavouriteBacker { stake, kind }
    }
}

impl Default for FavouriteBacker {
    fn default() -> Self {
        FavouriteBacker::new(DEFAULT_FAVOURITE_STAKE, RaceKind::ToBePlaced)
    }
}

impl RaceHandler for FavouriteBacker {
    fn name(&self) -> &'static str {
        "favourite"
    }

    fn handle(&mut self, race: &Race, desk: &mut BettingDesk<'_>) -> RaceVerdict {
        if race.kind != self.kind {
            return RaceVerdict::Skipped(SkipReason::MarketKind);
        }
        let odds = match desk.market_odds(race) {
            Ok(odds) => odds,
            Err(reason) => return RaceVerdict::Skipped(reason),
        };
        let favourite = race
            .selections
            .iter()
            .zip(&odds)
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(s, _)| s.selection_id);
        let Some(selection_id) = favourite else {
            return RaceVerdict::Skipped(SkipReason::TooFewRunners);
        };
        match desk.place(race, selection_id, self.stake, BTreeMap::new()) {
            Ok(_) => RaceVerdict::Placed { bets: 1 },
            Err(reason) => RaceVerdict::Skipped(reason),
        }
    }
}
