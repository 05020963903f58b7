use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::{Bet, QuoteBook, Race};
use crate::backtest::scorecard::{EventBreakdown, Scorecard};
use crate::backtest::sweep::Hyperparameters;

/// Which slice of history a run replays.  Built once per run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RaceFilter {
    pub country: Option<String>,
    /// Inclusive lower bound on `scheduled_off`
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `scheduled_off`
    pub end: Option<DateTime<Utc>>,
}

impl RaceFilter {
    pub fn contains(&self, race: &Race) -> bool {
        self.start.map_or(true, |s| race.scheduled_off >= s)
            && self.end.map_or(true, |e| race.scheduled_off <= e)
            && self.country.as_deref().map_or(true, |c| race.country == c)
    }
}

/// Source of settled races.
pub trait RaceStream {
    /// Races matching `filter`, ascending by `scheduled_off` (ties by event ID).
    fn races(&self, filter: &RaceFilter) -> Result<Vec<Race>>;
}

/// Source of the per-selection VWAO snapshot.
pub trait QuoteStore {
    /// Quotes inside the filter's date window.  The country is not applied:
    /// quotes are keyed by event and only looked up for replayed races.
    fn quotes(&self, filter: &RaceFilter) -> Result<QuoteBook>;
}

/// Destination for a finished run.  Each collection is keyed by run.
pub trait ResultSink {
    fn save_run_config(&self, params: &Hyperparameters, strategy: &str) -> Result<i64>;

    fn save_scorecard(
        &self,
        config_id: i64,
        run_index: usize,
        scorecard: &Scorecard,
        run_seconds: f64,
    ) -> Result<i64>;

    fn save_bets(&self, scorecard_id: i64, bets: &[Bet]) -> Result<()>;

    fn save_events(&self, scorecard_id: i64, events: &[EventBreakdown]) -> Result<()>;
}
