use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

/// Which market a race record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceKind {
    /// Standard win market: exactly one winner (barring dead heats).
    Win,
    /// "To Be Placed" market on the same race: several runners pay out.
    ToBePlaced,
}

impl RaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaceKind::Win => "win",
            RaceKind::ToBePlaced => "to_be_placed",
        }
    }
}

impl FromStr for RaceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "win" => Ok(RaceKind::Win),
            "to_be_placed" | "to be placed" | "place" => Ok(RaceKind::ToBePlaced),
            other => Err(format!("unknown race kind '{}'", other)),
        }
    }
}

/// One runner in a race market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    /// Market-scoped selection ID (what quotes and bets refer to)
    pub selection_id: i64,
    /// Global competitor identity (what the skill model rates)
    pub competitor_id: i64,
    /// Official finishing position, when the result feed provides one
    pub finish_position: Option<u32>,
}

/// A historical race market, immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Race {
    pub event_id: i64,
    pub scheduled_off: DateTime<Utc>,
    pub country: String,
    pub kind: RaceKind,
    /// Declared runners
    pub n_runners: u32,
    pub selections: Vec<Selection>,
    /// Selection IDs that paid out. Empty = result not recorded.
    pub winners: Vec<i64>,
}

impl Race {
    pub fn is_winner(&self, selection_id: i64) -> bool {
        self.winners.contains(&selection_id)
    }

    /// True when at least one recorded winner actually ran in this race.
    pub fn has_result(&self) -> bool {
        self.selections.iter().any(|s| self.is_winner(s.selection_id))
    }

    /// Finishing rank used for rating updates (lower is better).  Winners
    /// share rank 1; unplaced runners without a recorded position get `None`.
    pub fn rank_of(&self, selection_id: i64) -> Option<u32> {
        if self.is_winner(selection_id) {
            return Some(1);
        }
        self.selections
            .iter()
            .find(|s| s.selection_id == selection_id)
            .and_then(|s| s.finish_position)
            .map(|p| p.max(2))
    }

    pub fn competitor_ids(&self) -> Vec<i64> {
        self.selections.iter().map(|s| s.competitor_id).collect()
    }
}

/// Volume-weighted average odds for one selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketQuote {
    pub event_id: i64,
    pub selection_id: i64,
    pub scheduled_off: DateTime<Utc>,
    /// Decimal odds
    pub vwao: f64,
    pub volume_matched: f64,
}

/// Snapshot of all quotes for a run, indexed for O(1) lookup.
#[derive(Debug, Clone, Default)]
pub struct QuoteBook {
    quotes: HashMap<(i64, i64), MarketQuote>,
    total_matched: HashMap<i64, f64>,
}

impl QuoteBook {
    pub fn new(quotes: Vec<MarketQuote>) -> Self {
        let mut book = QuoteBook::default();
        for q in quotes {
            *book.total_matched.entry(q.event_id).or_default() += q.volume_matched;
            book.quotes.insert((q.event_id, q.selection_id), q);
        }
        book
    }

    pub fn get(&self, event_id: i64, selection_id: i64) -> Option<&MarketQuote> {
        self.quotes.get(&(event_id, selection_id))
    }

    pub fn odds(&self, event_id: i64, selection_id: i64) -> Option<f64> {
        self.get(event_id, selection_id).map(|q| q.vwao)
    }

    /// Total matched volume across all selections of an event
    pub fn total_matched(&self, event_id: i64) -> Option<f64> {
        self.total_matched.get(&event_id).copied()
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}

/// A settled bet in a backtest ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bet {
    pub event_id: i64,
    pub selection_id: i64,
    pub scheduled_off: DateTime<Utc>,
    /// Field size of the race, so collateral can account for unbet runners
    pub n_runners: u32,
    /// Positive = back, negative = lay
    pub amount: f64,
    /// Decimal odds taken
    pub odds: f64,
    pub win: bool,
    pub pnl: f64,
    /// Strategy-specific annotations, e.g. `p` = model probability
    #[serde(default)]
    pub user_fields: BTreeMap<String, f64>,
}

impl Bet {
    pub fn is_back(&self) -> bool {
        self.amount > 0.0
    }

    pub fn is_lay(&self) -> bool {
        self.amount < 0.0
    }
}

/// Profit of a stake at decimal odds given whether the selection won.
pub fn settle(amount: f64, odds: f64, win: bool) -> f64 {
    if win {
        amount * (odds - 1.0)
    } else {
        -amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn quote(event_id: i64, selection_id: i64, vwao: f64, volume: f64) -> MarketQuote {
        MarketQuote {
            event_id,
            selection_id,
            scheduled_off: Utc.with_ymd_and_hms(2013, 1, 1, 12, 0, 0).unwrap(),
            vwao,
            volume_matched: volume,
        }
    }

    #[test]
    fn settle_back_and_lay() {
        assert_relative_eq!(settle(2.0, 4.0, true), 6.0);
        assert_relative_eq!(settle(2.0, 4.0, false), -2.0);
        // A lay that loses pays the backer's winnings.
        assert_relative_eq!(settle(-2.0, 4.0, true), -6.0);
        assert_relative_eq!(settle(-2.0, 4.0, false), 2.0);
    }

    #[test]
    fn quote_book_lookup_and_volume() {
        let book = QuoteBook::new(vec![
            quote(1, 10, 2.5, 100.0),
            quote(1, 11, 4.0, 50.0),
            quote(2, 10, 3.0, 10.0),
        ]);
        assert_eq!(book.len(), 3);
        assert_eq!(book.odds(1, 11), Some(4.0));
        assert_eq!(book.odds(2, 11), None);
        assert_eq!(book.total_matched(1), Some(150.0));
    }

    #[test]
    fn rank_of_prefers_winner_flag() {
        let race = Race {
            event_id: 1,
            scheduled_off: Utc.with_ymd_and_hms(2013, 1, 1, 12, 0, 0).unwrap(),
            country: "GB".into(),
            kind: RaceKind::Win,
            n_runners: 3,
            selections: vec![
                Selection { selection_id: 1, competitor_id: 100, finish_position: Some(1) },
                Selection { selection_id: 2, competitor_id: 200, finish_position: Some(3) },
                Selection { selection_id: 3, competitor_id: 300, finish_position: None },
            ],
            winners: vec![1],
        };
        assert_eq!(race.rank_of(1), Some(1));
        assert_eq!(race.rank_of(2), Some(3));
        assert_eq!(race.rank_of(3), None);
        assert_eq!(race.competitor_ids(), vec![100, 200, 300]);
    }

    #[test]
    fn race_kind_parses_loosely() {
        assert_eq!("WIN".parse::<RaceKind>(), Ok(RaceKind::Win));
        assert_eq!("To Be Placed".parse::<RaceKind>(), Ok(RaceKind::ToBePlaced));
        assert!("each way".parse::<RaceKind>().is_err());
    }
}
