use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::ledger::Ledger;
use crate::db::models::{settle, Bet, QuoteBook, Race};

/// Why a race produced no bets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Result not recorded; the race is ignored entirely
    NoWinner,
    /// Market kind the handler does not trade
    MarketKind,
    TooFewRunners,
    /// Some competitor has fewer than `min_races` observations
    InsufficientHistory,
    MissingQuote,
    /// Quote present but unusable (odds ≤ 1 or not finite)
    InvalidMarket,
    /// Optimizer rejected the book on worst-case return
    CollateralBreach,
}

impl SkipReason {
    pub const ALL: [SkipReason; 7] = [
        SkipReason::NoWinner,
        SkipReason::MarketKind,
        SkipReason::TooFewRunners,
        SkipReason::InsufficientHistory,
        SkipReason::MissingQuote,
        SkipReason::InvalidMarket,
        SkipReason::CollateralBreach,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoWinner => "no_winner",
            SkipReason::MarketKind => "market_kind",
            SkipReason::TooFewRunners => "too_few_runners",
            SkipReason::InsufficientHistory => "insufficient_history",
            SkipReason::MissingQuote => "missing_quote",
            SkipReason::InvalidMarket => "invalid_market",
            SkipReason::CollateralBreach => "collateral_breach",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Skipped-race counters, one per [`SkipReason`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipTally {
    pub no_winner: u64,
    pub market_kind: u64,
    pub too_few_runners: u64,
    pub insufficient_history: u64,
    pub missing_quote: u64,
    pub invalid_market: u64,
    pub collateral_breach: u64,
}

impl SkipTally {
    fn slot(&mut self, reason: SkipReason) -> &mut u64 {
        match reason {
            SkipReason::NoWinner => &mut self.no_winner,
            SkipReason::MarketKind => &mut self.market_kind,
            SkipReason::TooFewRunners => &mut self.too_few_runners,
            SkipReason::InsufficientHistory => &mut self.insufficient_history,
            SkipReason::MissingQuote => &mut self.missing_quote,
            SkipReason::InvalidMarket => &mut self.invalid_market,
            SkipReason::CollateralBreach => &mut self.collateral_breach,
        }
    }

    pub fn record(&mut self, reason: SkipReason) {
        *self.slot(reason) += 1;
    }

    pub fn get(&self, reason: SkipReason) -> u64 {
        match reason {
            SkipReason::NoWinner => self.no_winner,
            SkipReason::MarketKind => self.market_kind,
            SkipReason::TooFewRunners => self.too_few_runners,
            SkipReason::InsufficientHistory => self.insufficient_history,
            SkipReason::MissingQuote => self.missing_quote,
            SkipReason::InvalidMarket => self.invalid_market,
            SkipReason::CollateralBreach => self.collateral_breach,
        }
    }

    pub fn total(&self) -> u64 {
        self.no_winner
            + self.market_kind
            + self.too_few_runners
            + self.insufficient_history
            + self.missing_quote
            + self.invalid_market
            + self.collateral_breach
    }
}

/// What a handler did with one race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceVerdict {
    Placed { bets: usize },
    Skipped(SkipReason),
}

/// The handler's view of the market while a race is replayed: quote lookups
/// and bet placement, settled immediately against the known result.
pub struct BettingDesk<'a> {
    quotes: &'a QuoteBook,
    ledger: &'a mut Ledger,
}

impl<'a> BettingDesk<'a> {
    pub fn new(quotes: &'a QuoteBook, ledger: &'a mut Ledger) -> Self {
        BettingDesk { quotes, ledger }
    }

    pub fn odds(&self, race: &Race, selection_id: i64) -> Option<f64> {
        self.quotes.odds(race.event_id, selection_id)
    }

    /// Odds for every selection in race order.
    pub fn market_odds(&self, race: &Race) -> Result<Vec<f64>, SkipReason> {
        race.selections
            .iter()
            .map(|s| match self.odds(race, s.selection_id) {
                None => Err(SkipReason::MissingQuote),
                Some(o) if !o.is_finite() || o <= 1.0 => Err(SkipReason::InvalidMarket),
                Some(o) => Ok(o),
            })
            .collect()
    }

    /// Place a stake (positive = back, negative = lay) at the quoted odds.
    pub fn place(
        &mut self,
        race: &Race,
        selection_id: i64,
        amount: f64,
        user_fields: BTreeMap<String, f64>,
    ) -> Result<&Bet, SkipReason> {
        let odds = self
            .odds(race, selection_id)
            .ok_or(SkipReason::MissingQuote)?;
        let win = race.is_winner(selection_id);
        Ok(self.ledger.record(Bet {
            event_id: race.event_id,
            selection_id,
            scheduled_off: race.scheduled_off,
            n_runners: race.n_runners,
            amount,
            odds,
            win,
            pnl: settle(amount, odds, win),
            user_fields,
        }))
    }
}

/// A betting strategy driven by the engine, one race at a time.
pub trait RaceHandler {
    fn name(&self) -> &'static str;

    /// Decide and place bets for `race`, then fold its result into any
    /// internal state.  Called only for races with a recorded winner.
    fn handle(&mut self, race: &Race, desk: &mut BettingDesk<'_>) -> RaceVerdict;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{MarketQuote, RaceKind, Selection};
    use approx::assert_relative_eq;
    use chrono::{TimeZone, Utc};

    fn race() -> Race {
        Race {
            event_id: 7,
            scheduled_off: Utc.with_ymd_and_hms(2013, 6, 1, 15, 0, 0).unwrap(),
            country: "GB".into(),
            kind: RaceKind::Win,
            n_runners: 2,
            selections: vec![
                Selection { selection_id: 1, competitor_id: 10, finish_position: None },
                Selection { selection_id: 2, competitor_id: 20, finish_position: None },
            ],
            winners: vec![2],
        }
    }

    fn book(odds: &[(i64, f64)]) -> QuoteBook {
        QuoteBook::new(
            odds.iter()
                .map(|&(selection_id, vwao)| MarketQuote {
                    event_id: 7,
                    selection_id,
                    scheduled_off: Utc.with_ymd_and_hms(2013, 6, 1, 15, 0, 0).unwrap(),
                    vwao,
                    volume_matched: 100.0,
                })
                .collect(),
        )
    }

    #[test]
    fn place_settles_against_the_result() {
        let quotes = book(&[(1, 1.5), (2, 3.0)]);
        let mut ledger = Ledger::default();
        let mut desk = BettingDesk::new(&quotes, &mut ledger);
        let r = race();

        let lay = desk.place(&r, 1, -2.0, BTreeMap::new()).unwrap().clone();
        assert!(!lay.win);
        assert_relative_eq!(lay.pnl, 2.0);

        let back = desk.place(&r, 2, 1.0, BTreeMap::new()).unwrap().clone();
        assert!(back.win);
        assert_relative_eq!(back.pnl, 2.0);
        assert_eq!(back.n_runners, 2);

        assert_eq!(ledger.len(), 2);
        assert_relative_eq!(ledger.total_pnl(), 4.0);
    }

    #[test]
    fn market_odds_reports_gaps() {
        let r = race();
        let mut ledger = Ledger::default();

        let quotes = book(&[(1, 1.5)]);
        let desk = BettingDesk::new(&quotes, &mut ledger);
        assert_eq!(desk.market_odds(&r), Err(SkipReason::MissingQuote));

        let quotes = book(&[(1, 1.5), (2, 1.0)]);
        let desk = BettingDesk::new(&quotes, &mut ledger);
        assert_eq!(desk.market_odds(&r), Err(SkipReason::InvalidMarket));

        let quotes = book(&[(1, 1.5), (2, 3.0)]);
        let mut desk = BettingDesk::new(&quotes, &mut ledger);
        assert_eq!(desk.market_odds(&r), Ok(vec![1.5, 3.0]));
        assert_eq!(
            desk.place(&r, 99, 1.0, BTreeMap::new()).unwrap_err(),
            SkipReason::MissingQuote
        );
    }

    #[test]
    fn tally_counts_by_reason() {
        let mut tally = SkipTally::default();
        tally.record(SkipReason::MissingQuote);
        tally.record(SkipReason::MissingQuote);
        tally.record(SkipReason::NoWinner);
        assert_eq!(tally.get(SkipReason::MissingQuote), 2);
        assert_eq!(tally.get(SkipReason::CollateralBreach), 0);
        assert_eq!(tally.total(), 3);
        assert_eq!(SkipReason::TooFewRunners.to_string(), "too_few_runners");
    }

    #[test]
    fn every_reason_has_its_own_counter() {
        let mut tally = SkipTally::default();
        for reason in SkipReason::ALL {
            tally.record(reason);
        }
        assert!(SkipReason::ALL.iter().all(|r| tally.get(*r) == 1));
        assert_eq!(tally.total(), SkipReason::ALL.len() as u64);
    }
}
