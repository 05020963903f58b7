//! Chronological replay of one backtest run.
//!
//! The engine owns everything that changes during a run (quote snapshot,
//! ledger, skip tally, progress checkpoints) and drives a [`RaceHandler`]
//! one race at a time.  [`BacktestEngine::finalize`] consumes it, so a
//! finished run can no longer be mutated.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::handler::{BettingDesk, RaceHandler, RaceVerdict, SkipReason, SkipTally};
use super::ledger::Ledger;
use crate::db::models::{Bet, QuoteBook, Race};
use crate::db::{QuoteStore, RaceFilter};

pub const DEFAULT_PROGRESS_INTERVAL: usize = 100;

#[derive(Debug, Error, PartialEq)]
pub enum EngineError {
    #[error("race {event_id} at {scheduled_off} arrived after {previous}")]
    OutOfOrder {
        event_id: i64,
        scheduled_off: DateTime<Utc>,
        previous: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    Replaying,
    Finalized,
}

/// Running totals logged every `progress_interval` races.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressCheckpoint {
    /// Races processed so far (1-based)
    pub races: usize,
    /// Bets in the ledger so far
    pub bets: usize,
    /// Bets placed since the previous checkpoint
    pub window_bets: usize,
    pub window_pnl: f64,
    pub cumulative_pnl: f64,
}

/// Everything a run leaves behind once the replay is over.
pub struct FinishedRun<H> {
    pub handler: H,
    pub bets: Vec<Bet>,
    pub skips: SkipTally,
    pub checkpoints: Vec<ProgressCheckpoint>,
    pub races_processed: usize,
}

pub struct BacktestEngine<H: RaceHandler> {
    handler: H,
    quotes: QuoteBook,
    ledger: Ledger,
    skips: SkipTally,
    checkpoints: Vec<ProgressCheckpoint>,
    progress_interval: usize,
    races_processed: usize,
    last_off: Option<DateTime<Utc>>,
    window_start: usize,
    phase: RunPhase,
}

impl<H: RaceHandler> BacktestEngine<H> {
    pub fn new(handler: H, quotes: QuoteBook, progress_interval: usize) -> Self {
        BacktestEngine {
            handler,
            quotes,
            ledger: Ledger::default(),
            skips: SkipTally::default(),
            checkpoints: Vec::new(),
            progress_interval: progress_interval.max(1),
            races_processed: 0,
            last_off: None,
            window_start: 0,
            phase: RunPhase::Init,
        }
    }

    /// Load the quote snapshot for `filter` and return an engine ready to
    /// replay.
    pub fn load(
        handler: H,
        store: &impl QuoteStore,
        filter: &RaceFilter,
        progress_interval: usize,
    ) -> Result<Self> {
        let quotes = store.quotes(filter)?;
        if quotes.is_empty() {
            warn!("No quotes in the replay window, every {} bet will be skipped", handler.name());
        } else {
            info!("Loaded {} quotes for {} handler", quotes.len(), handler.name());
        }
        Ok(Self::new(handler, quotes, progress_interval))
    }

    #[cfg(test)]
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    #[cfg(test)]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Replay a single race.
    pub fn process(&mut self, race: &Race) -> Result<RaceVerdict, EngineError> {
        if let Some(previous) = self.last_off {
            if race.scheduled_off < previous {
                return Err(EngineError::OutOfOrder {
                    event_id: race.event_id,
                    scheduled_off: race.scheduled_off,
                    previous,
                });
            }
        }
        if self.phase == RunPhase::Init {
            info!("Replay started with event {} at {}", race.event_id, race.scheduled_off);
            self.phase = RunPhase::Replaying;
        }
        self.last_off = Some(race.scheduled_off);

        let verdict = if !race.has_result() {
            RaceVerdict::Skipped(SkipReason::NoWinner)
        } else {
            let mut desk = BettingDesk::new(&self.quotes, &mut self.ledger);
            self.handler.handle(race, &mut desk)
        };
        match verdict {
            RaceVerdict::Placed { bets } => debug!(
                "Event {}: {} bets placed ({:.0} matched)",
                race.event_id,
                bets,
                self.quotes.total_matched(race.event_id).unwrap_or(0.0)
            ),
            RaceVerdict::Skipped(reason) => {
                info!("Skipping event {}: {}", race.event_id, reason);
                self.skips.record(reason);
            }
        }

        self.races_processed += 1;
        if self.races_processed % self.progress_interval == 0 {
            self.checkpoint();
        }
        Ok(verdict)
    }

    /// Replay a whole stream, stopping at the first ordering violation.
    pub fn replay<'r>(&mut self, races: impl IntoIterator<Item = &'r Race>) -> Result<(), EngineError> {
        for race in races {
            self.process(race)?;
        }
        Ok(())
    }

    fn checkpoint(&mut self) {
        let cp = ProgressCheckpoint {
            races: self.races_processed,
            bets: self.ledger.len(),
            window_bets: self.ledger.len() - self.window_start,
            window_pnl: self.ledger.pnl_since(self.window_start),
            cumulative_pnl: self.ledger.total_pnl(),
        };
        info!(
            "Processed {} races: {} bets ({} in window), window pnl={:.2}, cumulative pnl={:.2}",
            cp.races, cp.bets, cp.window_bets, cp.window_pnl, cp.cumulative_pnl
        );
        self.window_start = self.ledger.len();
        self.checkpoints.push(cp);
    }

    pub fn finalize(mut self) -> FinishedRun<H> {
        self.phase = RunPhase::Finalized;
        info!(
            "Replay finished: {} races, {} bets, {} skipped, pnl={:.2}",
            self.races_processed,
            self.ledger.len(),
            self.skips.total(),
            self.ledger.total_pnl()
        );
        if self.ledger.is_empty() {
            warn!("No bets were placed by the {} handler", self.handler.name());
        }
        for reason in SkipReason::ALL {
            let n = self.skips.get(reason);
            if n > 0 {
                info!("  skipped {} races: {}", n, reason);
            }
        }
        FinishedRun {
            handler: self.handler,
            bets: self.ledger.into_bets(),
            skips: self.skips,
            checkpoints: self.checkpoints,
            races_processed: self.races_processed,
        }
    }
}
