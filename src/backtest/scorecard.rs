//! End-of-run performance summary built from a finished ledger.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::handler::SkipTally;
use crate::db::models::Bet;

pub const DEFAULT_COMMISSION: f64 = 0.95;
pub const DEFAULT_PERCENTILE_WIDTH: f64 = 60.0;

/// Probabilities are clamped this far from 0 and 1 before taking logs.
const PROB_EPS: f64 = 1e-6;

/// Descriptive statistics over one column of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation (0 for a single value)
    pub std: f64,
    pub min: f64,
    pub lower: f64,
    pub median: f64,
    pub upper: f64,
    pub max: f64,
}

impl Summary {
    /// `None` for an empty column.  `width` is the central percentile band,
    /// e.g. 60 gives the 20th and 80th percentiles.
    pub fn describe(values: &[f64], width: f64) -> Option<Summary> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;
        let std = if n < 2 {
            0.0
        } else {
            let ss: f64 = sorted.iter().map(|v| (v - mean).powi(2)).sum();
            (ss / (n - 1) as f64).sqrt()
        };
        let lower_pct = (100.0 - width.clamp(0.0, 100.0)) / 2.0;
        Some(Summary {
            count: n,
            mean,
            std,
            min: sorted[0],
            lower: percentile(&sorted, lower_pct),
            median: percentile(&sorted, 50.0),
            upper: percentile(&sorted, 100.0 - lower_pct),
            max: sorted[n - 1],
        })
    }
}

/// Linear-interpolated percentile of an ascending slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetStats {
    pub amount: Option<Summary>,
    pub odds: Option<Summary>,
    pub pnl: Option<Summary>,
}

impl BetStats {
    fn describe<'a>(bets: impl Iterator<Item = &'a Bet> + Clone, width: f64) -> Self {
        let column = |f: fn(&Bet) -> f64| bets.clone().map(f).collect::<Vec<_>>();
        BetStats {
            amount: Summary::describe(&column(|b| b.amount), width),
            odds: Summary::describe(&column(|b| b.odds), width),
            pnl: Summary::describe(&column(|b| b.pnl), width),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStats {
    pub pnl_gross: Option<Summary>,
    pub pnl_net: Option<Summary>,
    pub collateral: Option<Summary>,
}

/// Result of one event in the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBreakdown {
    pub event_id: i64,
    pub scheduled_off: DateTime<Utc>,
    pub n_runners: u32,
    pub n_bets: usize,
    pub pnl_gross: f64,
    pub pnl_net: f64,
    /// Worst-case return of the event's bets over every possible winner
    pub collateral: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPnl {
    pub day: NaiveDate,
    pub gross: f64,
    pub net: f64,
    pub gross_cumulative: f64,
    pub net_cumulative: f64,
}

/// How well the `p` annotations predicted the realised results.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastQuality {
    pub samples: usize,
    pub brier: f64,
    pub logloss: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scorecard {
    pub n_bets: usize,
    pub n_events: usize,
    pub pnl_gross: f64,
    pub pnl_net: f64,
    /// Largest peak-to-trough fall of the cumulative daily net P&L
    pub max_drawdown: f64,
    pub commission: f64,
    pub percentile_width: f64,
    pub all: BetStats,
    pub back: BetStats,
    pub lay: BetStats,
    pub events: EventStats,
    pub daily: Vec<DailyPnl>,
    pub forecast: Option<ForecastQuality>,
    pub skips: SkipTally,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScorecardBuilder {
    /// Fraction of positive gross P&L kept after commission
    pub commission: f64,
    pub percentile_width: f64,
}

impl Default for ScorecardBuilder {
    fn default() -> Self {
        ScorecardBuilder {
            commission: DEFAULT_COMMISSION,
            percentile_width: DEFAULT_PERCENTILE_WIDTH,
        }
    }
}

impl ScorecardBuilder {
    pub fn new(commission: f64, percentile_width: f64) -> Self {
        ScorecardBuilder {
            commission,
            percentile_width,
        }
    }

    /// Net P&L after the flat commission; losses are not commissioned.
    pub fn net(&self, gross: f64) -> f64 {
        if gross > 0.0 {
            gross * self.commission
        } else {
            gross
        }
    }

    pub fn build(&self, bets: &[Bet], skips: &SkipTally) -> (Scorecard, Vec<EventBreakdown>) {
        let width = self.percentile_width;
        let events = self.events(bets);
        let daily = daily_series(&events);

        let event_column = |f: fn(&EventBreakdown) -> f64| events.iter().map(f).collect::<Vec<_>>();
        let scorecard = Scorecard {
            n_bets: bets.len(),
            n_events: events.len(),
            pnl_gross: bets.iter().map(|b| b.pnl).sum(),
            pnl_net: events.iter().map(|e| e.pnl_net).sum(),
            max_drawdown: max_drawdown(&daily),
            commission: self.commission,
            percentile_width: width,
            all: BetStats::describe(bets.iter(), width),
            back: BetStats::describe(bets.iter().filter(|b| b.is_back()), width),
            lay: BetStats::describe(bets.iter().filter(|b| b.is_lay()), width),
            events: EventStats {
                pnl_gross: Summary::describe(&event_column(|e| e.pnl_gross), width),
                pnl_net: Summary::describe(&event_column(|e| e.pnl_net), width),
                collateral: Summary::describe(&event_column(|e| e.collateral), width),
            },
            daily,
            forecast: forecast_quality(bets),
            skips: *skips,
        };
        (scorecard, events)
    }

    /// Per-event breakdown in order of first appearance in the ledger.
    fn events(&self, bets: &[Bet]) -> Vec<EventBreakdown> {
        let mut order: Vec<i64> = Vec::new();
        let mut grouped: HashMap<i64, Vec<&Bet>> = HashMap::new();
        for bet in bets {
            grouped
                .entry(bet.event_id)
                .or_insert_with(|| {
                    order.push(bet.event_id);
                    Vec::new()
                })
                .push(bet);
        }
        order
            .into_iter()
            .filter_map(|event_id| grouped.remove(&event_id))
            .map(|group| {
                let gross: f64 = group.iter().map(|b| b.pnl).sum();
                EventBreakdown {
                    event_id: group[0].event_id,
                    scheduled_off: group[0].scheduled_off,
                    n_runners: group[0].n_runners,
                    n_bets: group.len(),
                    pnl_gross: gross,
                    pnl_net: self.net(gross),
                    collateral: event_collateral(&group),
                }
            })
            .collect()
    }
}

/// Worst-case return of one event's bets.  Each distinct selection is tried
/// as the winner; if some runners were not bet, their win (every stake
/// settles as a loss) is a scenario too.
fn event_collateral(bets: &[&Bet]) -> f64 {
    let mut selections: Vec<i64> = bets.iter().map(|b| b.selection_id).collect();
    selections.sort_unstable();
    selections.dedup();

    let mut worst = selections
        .iter()
        .map(|&winner| {
            bets.iter()
                .map(|b| {
                    if b.selection_id == winner {
                        b.amount * (b.odds - 1.0)
                    } else {
                        -b.amount
                    }
                })
                .sum::<f64>()
        })
        .fold(f64::INFINITY, f64::min);
    let n_runners = bets.first().map_or(0, |b| b.n_runners as usize);
    if selections.len() < n_runners {
        worst = worst.min(-bets.iter().map(|b| b.amount).sum::<f64>());
    }
    worst
}

fn daily_series(events: &[EventBreakdown]) -> Vec<DailyPnl> {
    let mut by_day: BTreeMap<NaiveDate, (f64, f64)> = BTreeMap::new();
    for e in events {
        let slot = by_day.entry(e.scheduled_off.date_naive()).or_default();
        slot.0 += e.pnl_gross;
        slot.1 += e.pnl_net;
    }
    let mut gross_cumulative = 0.0;
    let mut net_cumulative = 0.0;
    by_day
        .into_iter()
        .map(|(day, (gross, net))| {
            gross_cumulative += gross;
            net_cumulative += net;
            DailyPnl {
                day,
                gross,
                net,
                gross_cumulative,
                net_cumulative,
            }
        })
        .collect()
}

fn max_drawdown(daily: &[DailyPnl]) -> f64 {
    let mut peak = 0.0_f64;
    let mut worst = 0.0_f64;
    for d in daily {
        peak = peak.max(d.net_cumulative);
        worst = worst.max(peak - d.net_cumulative);
    }
    worst
}

/// Brier score and log-loss of back bets' `p` annotation.  Lays are left
/// out so each prediction is counted once per selection it backs.
fn forecast_quality(bets: &[Bet]) -> Option<ForecastQuality> {
    let samples: Vec<(f64, f64)> = bets
        .iter()
        .filter(|b| b.is_back())
        .filter_map(|b| {
            let p = *b.user_fields.get("p")?;
            p.is_finite().then_some((p, if b.win { 1.0 } else { 0.0 }))
        })
        .collect();
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let mut brier = 0.0;
    let mut logloss = 0.0;
    for (p, y) in &samples {
        let pc = p.clamp(PROB_EPS, 1.0 - PROB_EPS);
        brier += (p - y).powi(2);
        logloss -= y * pc.ln() + (1.0 - y) * (1.0 - pc).ln();
    }
    Some(ForecastQuality {
        samples: samples.len(),
        brier: brier / n,
        logloss: logloss / n,
    })
}
