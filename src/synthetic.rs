//! Synthetic race history
//!
//! Generates a deterministic stream of win markets from hidden competitor
//! skills, plus VWAO quotes priced off the true win chances with noise and a
//! bookmaker-style overround.  Used to seed demo databases and in tests.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};

use crate::analytics::gaussian::field_win_probabilities;
use crate::analytics::skill::{DEFAULT_BETA, DEFAULT_MU};
use crate::db::models::{MarketQuote, Race, RaceKind, Selection};

/// Lowest odds a synthetic market will quote.
const MIN_ODDS: f64 = 1.01;

/// Finishing positions beyond this are left unrecorded.
const RECORDED_PLACES: u32 = 4;

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub races: usize,
    /// Size of the competitor pool races draw from
    pub competitors: usize,
    pub min_field: usize,
    pub max_field: usize,
    pub seed: u64,
    /// Spread of hidden skills around the prior mean
    pub skill_spread: f64,
    /// Sum of implied probabilities in each market (> 1 = bookmaker margin)
    pub overround: f64,
    /// Log-normal noise on the market's view of each runner
    pub price_noise: f64,
    pub country: String,
    pub first_off: DateTime<Utc>,
    pub spacing: Duration,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        SyntheticConfig {
            races: 500,
            competitors: 40,
            min_field: 5,
            max_field: 9,
            seed: 7,
            skill_spread: 5.0,
            overround: 1.05,
            price_noise: 0.2,
            country: "GB".to_string(),
            first_off: Utc
                .with_ymd_and_hms(2013, 1, 1, 12, 0, 0)
                .single()
                .unwrap_or_default(),
            spacing: Duration::minutes(45),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyntheticHistory {
    pub races: Vec<Race>,
    pub quotes: Vec<MarketQuote>,
}

/// Standard normal draw (Box-Muller).
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

pub fn generate(config: &SyntheticConfig) -> SyntheticHistory {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let pool = config.competitors.max(2);
    let skills: Vec<f64> = (0..pool)
        .map(|_| DEFAULT_MU + config.skill_spread * standard_normal(&mut rng))
        .collect();

    let min_field = config.min_field.clamp(2, pool);
    let max_field = config.max_field.clamp(min_field, pool);

    let mut history = SyntheticHistory::default();
    for n in 0..config.races {
        let event_id = n as i64 + 1;
        let scheduled_off = config.first_off + config.spacing * n as i32;
        let field_size = rng.gen_range(min_field..=max_field);
        let field: Vec<usize> = sample(&mut rng, pool, field_size).into_vec();

        // Rank by realised performance, best first.
        let performance: Vec<f64> = field
            .iter()
            .map(|&c| skills[c] + DEFAULT_BETA * standard_normal(&mut rng))
            .collect();
        let mut order: Vec<usize> = (0..field_size).collect();
        order.sort_by(|&a, &b| performance[b].total_cmp(&performance[a]));
        let mut position = vec![0u32; field_size];
        for (rank, &slot) in order.iter().enumerate() {
            position[slot] = rank as u32 + 1;
        }

        let selections: Vec<Selection> = field
            .iter()
            .enumerate()
            .map(|(slot, &c)| Selection {
                selection_id: event_id * 100 + slot as i64,
                competitor_id: c as i64 + 1,
                finish_position: (position[slot] <= RECORDED_PLACES).then_some(position[slot]),
            })
            .collect();
        let winner = selections[order[0]].selection_id;

        let means: Vec<f64> = field.iter().map(|&c| skills[c]).collect();
        let spreads = vec![DEFAULT_BETA; field_size];
        let fair = field_win_probabilities(&means, &spreads, 256);
        let noisy: Vec<f64> = fair
            .iter()
            .map(|p| p.max(1e-4) * (config.price_noise * standard_normal(&mut rng)).exp())
            .collect();
        let total: f64 = noisy.iter().sum();
        for (s, p) in selections.iter().zip(&noisy) {
            let implied = p / total * config.overround;
            history.quotes.push(MarketQuote {
                event_id,
                selection_id: s.selection_id,
                scheduled_off,
                vwao: (1.0 / implied).max(MIN_ODDS),
                volume_matched: rng.gen_range(100.0..5000.0),
            });
        }

        history.races.push(Race {
            event_id,
            scheduled_off,
            country: config.country.clone(),
            kind: RaceKind::Win,
            n_runners: field_size as u32,
            selections,
            winners: vec![winner],
        });
    }
    history
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_history() {
        let cfg = SyntheticConfig {
            races: 30,
            ..SyntheticConfig::default()
        };
        let a = generate(&cfg);
        let b = generate(&cfg);
        assert_eq!(a.races, b.races);
        assert_eq!(a.quotes, b.quotes);

        let c = generate(&SyntheticConfig { seed: 8, ..cfg });
        assert_ne!(a.races, c.races);
    }

    #[test]
    fn races_are_well_formed() {
        let history = generate(&SyntheticConfig {
            races: 100,
            ..SyntheticConfig::default()
        });
        assert_eq!(history.races.len(), 100);
        for pair in history.races.windows(2) {
            assert!(pair[0].scheduled_off < pair[1].scheduled_off);
        }
        for race in &history.races {
            assert!((5..=9).contains(&(race.n_runners as usize)));
            assert_eq!(race.selections.len(), race.n_runners as usize);
            assert_eq!(race.winners.len(), 1);
            assert_eq!(race.rank_of(race.winners[0]), Some(1));

            let mut competitors = race.competitor_ids();
            competitors.sort_unstable();
            competitors.dedup();
            assert_eq!(competitors.len(), race.selections.len());
        }
    }

    #[test]
    fn every_runner_is_quoted_with_a_margin() {
        let history = generate(&SyntheticConfig {
            races: 50,
            ..SyntheticConfig::default()
        });
        let total_runners: usize = history.races.iter().map(|r| r.selections.len()).sum();
        assert_eq!(history.quotes.len(), total_runners);
        assert!(history.quotes.iter().all(|q| q.vwao >= MIN_ODDS));

        let first = &history.races[0];
        let book: f64 = history
            .quotes
            .iter()
            .filter(|q| q.event_id == first.event_id)
            .map(|q| 1.0 / q.vwao)
            .sum();
        assert!(book > 1.0 && book < 1.1, "overround was {}", book);
    }
}
