use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

mod analytics;
mod backtest;
mod config;
mod db;
mod risk;
mod synthetic;

use backtest::run_sweep;
use config::Config;
use db::Database;
use synthetic::SyntheticConfig;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialise tracing / logging: stderr by default, or a log file (optionally
/// mirrored to the terminal).
fn init_tracing(config: &Config) -> Result<()> {
    let Some(path) = &config.log_file else {
        tracing_subscriber::fmt().with_env_filter(env_filter()).init();
        return Ok(());
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path))?;
    let file = Mutex::new(file);
    if config.log_tty {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_ansi(false)
            .with_writer(file.and(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_ansi(false)
            .with_writer(file)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_tracing(&config)?;
    config.validate()?;

    // Opened up front so the schema exists before workers connect.
    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    if let Some(races) = config.synthetic_races {
        let history = synthetic::generate(&SyntheticConfig {
            races,
            seed: config.synthetic_seed,
            country: config.filter().country.unwrap_or_else(|| "GB".to_string()),
            ..SyntheticConfig::default()
        });
        db.insert_history(&history.races, &history.quotes)?;
        let filter = config.filter();
        info!(
            "Seeded {} synthetic races ({} inside the replay window, {} quotes, seed={})",
            history.races.len(),
            history.races.iter().filter(|r| filter.contains(r)).count(),
            history.quotes.len(),
            config.synthetic_seed
        );
    }

    let plan = config.grid().expand();
    info!(
        "The specified ranges of parameters yield {} different backtests",
        plan.len()
    );
    let jobs = config.jobs.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(plan.len())
            .max(1)
    });

    let total = plan.len();
    let outcome = run_sweep(plan, config.run_settings(), jobs).await;
    if let Some(best) = outcome.best() {
        info!(
            "Best run {}: net pnl={:.2}, gross pnl={:.2} over {} bets (scorecard id={})",
            best.run_index, best.pnl_net, best.pnl_gross, best.n_bets, best.scorecard_id
        );
        let card = db.load_scorecard(best.scorecard_id)?;
        info!(
            "Best run max drawdown={:.2}, {} stored bets, {} skipped races",
            card.max_drawdown,
            db.count_bets(best.scorecard_id)?,
            card.skips.total()
        );
        if let Some(forecast) = card.forecast {
            info!(
                "Best run forecast: brier={:.4}, logloss={:.4} over {} bets",
                forecast.brier, forecast.logloss, forecast.samples
            );
        }
    }
    info!("Database holds {} scorecards", db.list_scorecards()?.len());
    if outcome.failed() > 0 {
        bail!("{} of {} backtests failed", outcome.failed(), total);
    }
    info!("All {} backtests finished", outcome.succeeded());
    Ok(())
}
