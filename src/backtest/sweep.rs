//! Hyperparameter sweep: one isolated backtest per grid point, dispatched
//! onto a bounded pool of blocking workers.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, info_span};

use super::engine::BacktestEngine;
use super::handler::RaceHandler;
use super::scorecard::ScorecardBuilder;
use super::strategy::{FavouriteBacker, SkillStrategy};
use crate::analytics::{SkillModel, SkillParams};
use crate::config::StrategyKind;
use crate::db::models::RaceKind;
use crate::db::{Database, QuoteStore, RaceFilter, RaceStream, ResultSink};
use crate::risk::StakeOptimizer;

pub const DEFAULT_MIN_RACES: u32 = 3;

/// One point of the sweep, persisted as the run's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub run_index: usize,
    pub mu: f64,
    pub sigma: f64,
    pub beta: f64,
    pub tau: f64,
    pub draw_prob: f64,
    pub risk_aversion: f64,
    pub min_races: u32,
    pub max_exposure: f64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        let skill = SkillParams::default();
        let risk = StakeOptimizer::default();
        Hyperparameters {
            run_index: 0,
            mu: skill.mu,
            sigma: skill.sigma,
            beta: skill.beta,
            tau: skill.tau,
            draw_prob: skill.draw_probability,
            risk_aversion: risk.risk_aversion,
            min_races: DEFAULT_MIN_RACES,
            max_exposure: risk.max_exposure,
        }
    }
}

impl Hyperparameters {
    pub fn skill_params(&self) -> SkillParams {
        SkillParams {
            mu: self.mu,
            sigma: self.sigma,
            beta: self.beta,
            tau: self.tau,
            draw_probability: self.draw_prob,
            ..SkillParams::default()
        }
    }

    pub fn optimizer(&self, divergence_tolerance: f64) -> StakeOptimizer {
        StakeOptimizer::new(self.risk_aversion, self.max_exposure, divergence_tolerance)
    }
}

/// Candidate values per hyperparameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGrid {
    pub mu: Vec<f64>,
    pub sigma: Vec<f64>,
    pub beta: Vec<f64>,
    pub tau: Vec<f64>,
    pub draw_prob: Vec<f64>,
    pub risk_aversion: Vec<f64>,
    pub min_races: Vec<f64>,
    pub max_exposure: Vec<f64>,
}

impl ParamGrid {
    fn axes(&self) -> [&[f64]; 8] {
        [
            &self.mu,
            &self.sigma,
            &self.beta,
            &self.tau,
            &self.draw_prob,
            &self.risk_aversion,
            &self.min_races,
            &self.max_exposure,
        ]
    }

    /// Number of runs in the Cartesian product.
    pub fn len(&self) -> usize {
        self.axes().iter().map(|a| a.len()).product()
    }

    /// Cartesian product, first axis varying slowest.  `run_index` is the
    /// position in this order.
    pub fn expand(&self) -> Vec<Hyperparameters> {
        let axes = self.axes();
        (0..self.len())
            .map(|run_index| {
                let mut rem = run_index;
                let mut pick = [0.0; 8];
                for (slot, axis) in pick.iter_mut().zip(axes.iter()).rev() {
                    *slot = axis[rem % axis.len()];
                    rem /= axis.len();
                }
                Hyperparameters {
                    run_index,
                    mu: pick[0],
                    sigma: pick[1],
                    beta: pick[2],
                    tau: pick[3],
                    draw_prob: pick[4],
                    risk_aversion: pick[5],
                    min_races: pick[6].round().max(0.0) as u32,
                    max_exposure: pick[7],
                }
            })
            .collect()
    }
}

/// Settings shared by every run of a sweep.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub database_path: String,
    pub filter: RaceFilter,
    pub strategy: StrategyKind,
    pub commission: f64,
    pub percentile_width: f64,
    pub progress_interval: usize,
    pub divergence_tolerance: f64,
    pub min_runners: u32,
    pub favourite_stake: f64,
    pub favourite_market: RaceKind,
}

/// Headline numbers of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_index: usize,
    pub scorecard_id: i64,
    pub races: usize,
    pub n_bets: usize,
    pub pnl_gross: f64,
    pub pnl_net: f64,
    pub run_seconds: f64,
}

/// Outcome of one run as reported back to the sweep.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_index: usize,
    pub result: Result<RunSummary, String>,
}

#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    /// Sorted by run index
    pub reports: Vec<RunReport>,
}

impl SweepOutcome {
    pub fn failed(&self) -> usize {
        self.reports.iter().filter(|r| r.result.is_err()).count()
    }

    pub fn succeeded(&self) -> usize {
        self.reports.len() - self.failed()
    }

    /// Successful run with the highest net P&L.
    pub fn best(&self) -> Option<&RunSummary> {
        self.reports
            .iter()
            .filter_map(|r| r.result.as_ref().ok())
            .max_by(|a, b| a.pnl_net.total_cmp(&b.pnl_net))
    }
}

/// Run one backtest against its own database connection.
pub fn run_backtest(params: &Hyperparameters, settings: &RunSettings) -> Result<RunSummary> {
    let span = info_span!("backtest", n_bkt = params.run_index);
    let _guard = span.enter();

    let db = Database::open(&settings.database_path)?;
    match settings.strategy {
        StrategyKind::Skill => {
            let strategy = SkillStrategy::new(
                SkillModel::new(params.skill_params()),
                params.optimizer(settings.divergence_tolerance),
                params.min_races,
                settings.min_runners,
            );
            run_on(&db, strategy, params, settings)
        }
        StrategyKind::Favourite => {
            let backer = FavouriteBacker::new(settings.favourite_stake, settings.favourite_market);
            run_on(&db, backer, params, settings)
        }
    }
}

/// Replay, score and persist one run against any store.
pub fn run_on<S, H>(
    store: &S,
    handler: H,
    params: &Hyperparameters,
    settings: &RunSettings,
) -> Result<RunSummary>
where
    S: RaceStream + QuoteStore + ResultSink,
    H: RaceHandler,
{
    let started = Instant::now();
    let races = store.races(&settings.filter)?;
    info!("Replaying {} races with {} handler", races.len(), handler.name());

    let mut engine = BacktestEngine::load(handler, store, &settings.filter, settings.progress_interval)?;
    engine.replay(&races)?;
    let run = engine.finalize();
    let run_seconds = started.elapsed().as_secs_f64();
    info!(
        "Backtest finished in {:.2} seconds ({} progress checkpoints)",
        run_seconds,
        run.checkpoints.len()
    );

    let (scorecard, events) =
        ScorecardBuilder::new(settings.commission, settings.percentile_width).build(&run.bets, &run.skips);

    let config_id = store.save_run_config(params, run.handler.name())?;
    info!("Strategy serialised with id={}", config_id);
    let scorecard_id = store.save_scorecard(config_id, params.run_index, &scorecard, run_seconds)?;
    info!("Scorecard inserted with id={}", scorecard_id);
    store.save_bets(scorecard_id, &run.bets)?;
    store.save_events(scorecard_id, &events)?;
    info!(
        "Stored {} bets over {} events: gross={:.2}, net={:.2}",
        scorecard.n_bets, scorecard.n_events, scorecard.pnl_gross, scorecard.pnl_net
    );

    Ok(RunSummary {
        run_index: params.run_index,
        scorecard_id,
        races: run.races_processed,
        n_bets: scorecard.n_bets,
        pnl_gross: scorecard.pnl_gross,
        pnl_net: scorecard.pnl_net,
        run_seconds,
    })
}

/// Run every grid point with at most `jobs` backtests in flight.
pub async fn run_sweep(plan: Vec<Hyperparameters>, settings: RunSettings, jobs: usize) -> SweepOutcome {
    run_sweep_with(plan, jobs, move |params| run_backtest(params, &settings)).await
}

/// Worker pool behind [`run_sweep`].  Each run executes on a blocking
/// thread; an error or panic in one run is reported and the rest carry on.
pub async fn run_sweep_with<F>(plan: Vec<Hyperparameters>, jobs: usize, runner: F) -> SweepOutcome
where
    F: Fn(&Hyperparameters) -> Result<RunSummary> + Send + Sync + 'static,
{
    let total = plan.len();
    let runner = Arc::new(runner);
    let semaphore = Arc::new(Semaphore::new(jobs.max(1)));
    let (tx, mut rx) = mpsc::channel::<RunReport>(total.max(1));

    info!("Creating a pool with {} workers for {} backtests", jobs.max(1), total);

    for params in plan {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let tx = tx.clone();
        let runner = Arc::clone(&runner);
        tokio::spawn(async move {
            let run_index = params.run_index;
            let result = match tokio::task::spawn_blocking(move || (*runner)(&params)).await {
                Ok(Ok(summary)) => Ok(summary),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Err(e) => Err(format!("worker panicked: {}", e)),
            };
            drop(permit);
            let _ = tx.send(RunReport { run_index, result }).await;
        });
    }
    drop(tx);

    let mut reports = Vec::with_capacity(total);
    while let Some(report) = rx.recv().await {
        match &report.result {
            Ok(s) => info!(
                "Run {} done: {} bets, net pnl={:.2} ({:.1}s)",
                s.run_index, s.n_bets, s.pnl_net, s.run_seconds
            ),
            Err(e) => error!("Run {} failed: {}", report.run_index, e),
        }
        reports.push(report);
    }
    reports.sort_by_key(|r| r.run_index);
    SweepOutcome { reports }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{generate, SyntheticConfig};
    use approx::assert_relative_eq;

    fn grid() -> ParamGrid {
        ParamGrid {
            mu: vec![20.0, 25.0],
            sigma: vec![8.0],
            beta: vec![4.0],
            tau: vec![0.1],
            draw_prob: vec![0.1],
            risk_aversion: vec![0.05, 0.1, 0.2],
            min_races: vec![1.6],
            max_exposure: vec![50.0],
        }
    }

    #[test]
    fn expand_is_cartesian_and_indexed() {
        let plan = grid().expand();
        assert_eq!(plan.len(), 6);
        assert_eq!(grid().len(), 6);
        for (i, p) in plan.iter().enumerate() {
            assert_eq!(p.run_index, i);
            assert_eq!(p.min_races, 2);
        }
        assert_relative_eq!(plan[0].mu, 20.0);
        assert_relative_eq!(plan[0].risk_aversion, 0.05);
        assert_relative_eq!(plan[2].risk_aversion, 0.2);
        assert_relative_eq!(plan[3].mu, 25.0);
        assert_relative_eq!(plan[3].risk_aversion, 0.05);
    }

    #[test]
    fn hyperparameters_map_onto_components() {
        let p = Hyperparameters {
            draw_prob: 0.2,
            risk_aversion: 0.3,
            ..Hyperparameters::default()
        };
        assert_relative_eq!(p.skill_params().draw_probability, 0.2);
        assert_eq!(p.skill_params().quadrature_points, SkillParams::default().quadrature_points);
        assert_relative_eq!(p.optimizer(0.05).risk_aversion, 0.3);
        assert_relative_eq!(p.optimizer(0.05).divergence_tolerance, 0.05);
    }

    fn settings(path: &str) -> RunSettings {
        RunSettings {
            database_path: path.to_string(),
            filter: RaceFilter::default(),
            strategy: StrategyKind::Skill,
            commission: 0.95,
            percentile_width: 60.0,
            progress_interval: 50,
            divergence_tolerance: 0.1,
            min_runners: 3,
            favourite_stake: 2.0,
            favourite_market: RaceKind::Win,
        }
    }

    #[test]
    fn run_on_persists_everything() {
        let db = Database::open_in_memory().unwrap();
        let history = generate(&SyntheticConfig {
            races: 120,
            ..SyntheticConfig::default()
        });
        db.insert_history(&history.races, &history.quotes).unwrap();

        let params = Hyperparameters {
            min_races: 1,
            ..Hyperparameters::default()
        };
        let strategy = SkillStrategy::new(
            SkillModel::new(params.skill_params()),
            params.optimizer(0.1),
            params.min_races,
            3,
        );
        let summary = run_on(&db, strategy, &params, &settings(":memory:")).unwrap();
        assert_eq!(summary.races, 120);
        assert!(summary.n_bets > 0);
        assert_eq!(db.count_bets(summary.scorecard_id).unwrap(), summary.n_bets as i64);
        let card = db.load_scorecard(summary.scorecard_id).unwrap();
        assert_eq!(card.n_bets, summary.n_bets);
    }

    #[tokio::test]
    async fn failing_runs_do_not_stop_the_sweep() {
        let plan = grid().expand();
        let outcome = run_sweep_with(plan, 2, |p| {
            if p.run_index == 1 {
                anyhow::bail!("store unavailable");
            }
            if p.run_index == 4 {
                panic!("boom");
            }
            Ok(RunSummary {
                run_index: p.run_index,
                scorecard_id: p.run_index as i64,
                races: 10,
                n_bets: 1,
                pnl_gross: p.run_index as f64,
                pnl_net: p.run_index as f64,
                run_seconds: 0.0,
            })
        })
        .await;

        assert_eq!(outcome.reports.len(), 6);
        assert_eq!(outcome.failed(), 2);
        assert_eq!(outcome.succeeded(), 4);
        let indices: Vec<usize> = outcome.reports.iter().map(|r| r.run_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
        assert!(outcome.reports[1]
            .result
            .as_ref()
            .unwrap_err()
            .contains("store unavailable"));
        assert!(outcome.reports[4].result.is_err());
        assert_eq!(outcome.best().map(|s| s.run_index), Some(5));
    }

    #[tokio::test]
    async fn sweep_against_a_database_file() {
        let path = std::env::temp_dir().join(format!(
            "racing-backtest-sweep-{}.db",
            std::process::id()
        ));
        let path_str = path.to_string_lossy().to_string();
        let cleanup = || {
            for suffix in ["", "-wal", "-shm"] {
                let _ = std::fs::remove_file(format!("{}{}", path_str, suffix));
            }
        };
        cleanup();
        {
            let db = Database::open(&path).unwrap();
            let history = generate(&SyntheticConfig {
                races: 60,
                ..SyntheticConfig::default()
            });
            db.insert_history(&history.races, &history.quotes).unwrap();
        }

        let plan = ParamGrid {
            risk_aversion: vec![0.1, 0.2],
            min_races: vec![1.0],
            ..grid()
        }
        .expand();
        let outcome = run_sweep(plan, settings(&path_str), 2).await;
        assert_eq!(outcome.failed(), 0, "{:?}", outcome.reports);
        assert_eq!(outcome.succeeded(), 4);

        let db = Database::open(&path).unwrap();
        assert_eq!(db.list_scorecards().unwrap().len(), 4);
        drop(db);
        cleanup();
    }
}
