use anyhow::{bail, Context};
use chrono::{NaiveDate, NaiveDateTime};
use clap::{Parser, ValueEnum};

use crate::analytics::skill::{DEFAULT_BETA, DEFAULT_DRAW, DEFAULT_MU, DEFAULT_SIGMA, DEFAULT_TAU};
use crate::backtest::engine::DEFAULT_PROGRESS_INTERVAL;
use crate::backtest::scorecard::{DEFAULT_COMMISSION, DEFAULT_PERCENTILE_WIDTH};
use crate::backtest::strategy::{DEFAULT_FAVOURITE_STAKE, DEFAULT_MIN_RUNNERS};
use crate::backtest::sweep::{ParamGrid, RunSettings, DEFAULT_MIN_RACES};
use crate::db::models::RaceKind;
use crate::db::RaceFilter;
use crate::risk::optimizer::{
    DEFAULT_DIVERGENCE_TOLERANCE, DEFAULT_MAX_EXPOSURE, DEFAULT_RISK_AVERSION,
};

/// Points in an `a:b` range without an explicit count.
const DEFAULT_RANGE_POINTS: usize = 10;

/// Which race handler each run drives.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Skill ratings sized by the L2 stake optimizer
    Skill,
    /// Fixed stake on the market favourite
    Favourite,
}

/// One swept hyperparameter: a single value or an evenly spaced range.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamRange(pub Vec<f64>);

/// Parse `v`, `a:b` (10 points) or `a:b:n` into a list of values.
pub fn parse_range(s: &str) -> anyhow::Result<ParamRange> {
    let parts: Vec<&str> = s.split(':').map(str::trim).collect();
    let num = |p: &str| {
        p.parse::<f64>()
            .with_context(|| format!("'{}' is not a number", p))
    };
    let values = match parts.as_slice() {
        &[v] => vec![num(v)?],
        &[a, b] => linspace(num(a)?, num(b)?, DEFAULT_RANGE_POINTS),
        &[a, b, n] => {
            // Counts such as `5.0` are accepted and rounded.
            let n = num(n)?.round();
            if !(n >= 1.0) {
                bail!("range '{}' needs at least one point", s);
            }
            linspace(num(a)?, num(b)?, n as usize)
        }
        _ => bail!("'{}' is not a valid parameter or range", s),
    };
    if values.iter().any(|v| !v.is_finite()) {
        bail!("range '{}' contains a non-finite value", s);
    }
    Ok(ParamRange(values))
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n)
        .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
        .collect()
}

/// Parse a day-first date (`31/12/2013`, `31-12-2013`, `31.12.2013`) or an
/// ISO date / date-time.  A bare date means midnight.
pub fn parse_date(s: &str) -> anyhow::Result<NaiveDateTime> {
    let s = s.trim();
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%d/%m/%Y %H:%M", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt);
        }
    }
    for fmt in ["%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y-%m-%d", "%d/%m/%y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d.and_hms_opt(0, 0, 0).unwrap_or_default());
        }
    }
    bail!("unrecognised date '{}'", s)
}

/// Horse-racing strategy backtester
#[derive(Parser, Debug, Clone)]
#[command(name = "racing-backtest", version, about)]
pub struct Config {
    /// SQLite database with races, runners and VWAO quotes
    #[arg(long, env = "DATABASE_PATH", default_value = "racing.db")]
    pub database_path: String,

    /// Only replay races in this country ("any" disables the filter)
    #[arg(long, env = "COUNTRY", default_value = "GB")]
    pub country: String,

    /// First scheduled-off date (day-first or ISO), inclusive
    #[arg(long, env = "START", value_parser = parse_date)]
    pub start: Option<NaiveDateTime>,

    /// Last scheduled-off date (day-first or ISO), inclusive
    #[arg(long, env = "END", value_parser = parse_date)]
    pub end: Option<NaiveDateTime>,

    /// Concurrent backtests (default: CPUs, capped at the number of runs)
    #[arg(long, env = "JOBS")]
    pub jobs: Option<usize>,

    /// Prior skill mean
    #[arg(long, env = "MU", value_parser = parse_range, allow_hyphen_values = true)]
    pub mu: Option<ParamRange>,

    /// Prior skill uncertainty
    #[arg(long, env = "SIGMA", value_parser = parse_range, allow_hyphen_values = true)]
    pub sigma: Option<ParamRange>,

    /// Skill gap worth an ~80% head-to-head win chance
    #[arg(long, env = "BETA", value_parser = parse_range, allow_hyphen_values = true)]
    pub beta: Option<ParamRange>,

    /// Skill drift per race
    #[arg(long, env = "TAU", value_parser = parse_range, allow_hyphen_values = true)]
    pub tau: Option<ParamRange>,

    /// Draw probability
    #[arg(long, env = "DRAW_PROB", value_parser = parse_range, allow_hyphen_values = true)]
    pub draw_prob: Option<ParamRange>,

    /// L2 penalty on the stake vector
    #[arg(long, env = "RISK_AVERSION", value_parser = parse_range, allow_hyphen_values = true)]
    pub risk_aversion: Option<ParamRange>,

    /// Observations every runner needs before a race is bet
    #[arg(long, env = "MIN_RACES", value_parser = parse_range, allow_hyphen_values = true)]
    pub min_races: Option<ParamRange>,

    /// Largest tolerated worst-case loss per race
    #[arg(long, env = "MAX_EXPOSURE", value_parser = parse_range, allow_hyphen_values = true)]
    pub max_exposure: Option<ParamRange>,

    /// Fraction of positive event P&L kept after commission
    #[arg(long, env = "COMMISSION", default_value_t = DEFAULT_COMMISSION)]
    pub commission: f64,

    /// Central percentile band reported in scorecards
    #[arg(long, env = "PERCENTILE_WIDTH", default_value_t = DEFAULT_PERCENTILE_WIDTH)]
    pub percentile_width: f64,

    /// Relative model/market divergence before probabilities are capped
    #[arg(long, env = "DIVERGENCE_TOLERANCE", default_value_t = DEFAULT_DIVERGENCE_TOLERANCE)]
    pub divergence_tolerance: f64,

    /// Smallest field that is bet
    #[arg(long, env = "MIN_RUNNERS", default_value_t = DEFAULT_MIN_RUNNERS)]
    pub min_runners: u32,

    /// Races between progress log lines
    #[arg(long, env = "PROGRESS_INTERVAL", default_value_t = DEFAULT_PROGRESS_INTERVAL)]
    pub progress_interval: usize,

    #[arg(long, env = "STRATEGY", value_enum, default_value = "skill")]
    pub strategy: StrategyKind,

    /// Stake for the favourite-backing baseline
    #[arg(long, env = "FAVOURITE_STAKE", default_value_t = DEFAULT_FAVOURITE_STAKE)]
    pub favourite_stake: f64,

    /// Market the favourite-backing baseline trades (win / to_be_placed)
    #[arg(long, env = "FAVOURITE_MARKET", default_value = "to_be_placed")]
    pub favourite_market: RaceKind,

    /// Append log lines to this file
    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<String>,

    /// Also log to the terminal when --log-file is set
    #[arg(long, env = "LOG_TTY", default_value = "false")]
    pub log_tty: bool,

    /// Seed the database with this many synthetic races before sweeping
    #[arg(long, env = "SYNTHETIC_RACES")]
    pub synthetic_races: Option<usize>,

    #[arg(long, env = "SYNTHETIC_SEED", default_value = "7")]
    pub synthetic_seed: u64,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.commission > 0.0 && self.commission <= 1.0) {
            bail!("commission must be in (0, 1]");
        }
        if !(0.0..=100.0).contains(&self.percentile_width) {
            bail!("percentile_width must be between 0 and 100");
        }
        if !(self.divergence_tolerance >= 0.0) {
            bail!("divergence_tolerance must be non-negative");
        }
        if self.progress_interval == 0 {
            bail!("progress_interval must be positive");
        }
        if self.jobs == Some(0) {
            bail!("jobs must be positive");
        }
        if !(self.favourite_stake > 0.0) {
            bail!("favourite_stake must be positive");
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                bail!("start date {} is after end date {}", start, end);
            }
        }

        let grid = self.grid();
        check(&grid.sigma, "sigma", |v| v > 0.0)?;
        check(&grid.beta, "beta", |v| v > 0.0)?;
        check(&grid.tau, "tau", |v| v >= 0.0)?;
        check(&grid.draw_prob, "draw_prob", |v| (0.0..1.0).contains(&v))?;
        check(&grid.risk_aversion, "risk_aversion", |v| v > 0.0)?;
        check(&grid.min_races, "min_races", |v| v >= 0.0)?;
        check(&grid.max_exposure, "max_exposure", |v| v > 0.0)?;
        Ok(())
    }

    /// Hyperparameter grid, defaults filled in for unswept axes.
    pub fn grid(&self) -> ParamGrid {
        let axis = |r: &Option<ParamRange>, default: f64| {
            r.as_ref().map_or_else(|| vec![default], |r| r.0.clone())
        };
        ParamGrid {
            mu: axis(&self.mu, DEFAULT_MU),
            sigma: axis(&self.sigma, DEFAULT_SIGMA),
            beta: axis(&self.beta, DEFAULT_BETA),
            tau: axis(&self.tau, DEFAULT_TAU),
            draw_prob: axis(&self.draw_prob, DEFAULT_DRAW),
            risk_aversion: axis(&self.risk_aversion, DEFAULT_RISK_AVERSION),
            min_races: axis(&self.min_races, DEFAULT_MIN_RACES as f64),
            max_exposure: axis(&self.max_exposure, DEFAULT_MAX_EXPOSURE),
        }
    }

    pub fn filter(&self) -> RaceFilter {
        let country = match self.country.trim() {
            "" => None,
            c if c.eq_ignore_ascii_case("any") => None,
            c => Some(c.to_string()),
        };
        RaceFilter {
            country,
            start: self.start.map(|d| d.and_utc()),
            end: self.end.map(|d| d.and_utc()),
        }
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            database_path: self.database_path.clone(),
            filter: self.filter(),
            strategy: self.strategy,
            commission: self.commission,
            percentile_width: self.percentile_width,
            progress_interval: self.progress_interval,
            divergence_tolerance: self.divergence_tolerance,
            min_runners: self.min_runners,
            favourite_stake: self.favourite_stake,
            favourite_market: self.favourite_market,
        }
    }
}

fn check(values: &[f64], name: &str, ok: impl Fn(f64) -> bool) -> anyhow::Result<()> {
    match values.iter().find(|v| !ok(**v)) {
        Some(v) => bail!("{} value {} is out of range", name, v),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn config(args: &[&str]) -> Config {
        let mut argv = vec!["racing-backtest"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn ranges_parse_all_forms() {
        assert_eq!(parse_range("0.5").unwrap(), ParamRange(vec![0.5]));

        let ten = parse_range("0:9").unwrap().0;
        assert_eq!(ten.len(), 10);
        assert_relative_eq!(ten[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(ten[9], 9.0);

        let three = parse_range("1:2:3").unwrap().0;
        assert_eq!(three, vec![1.0, 1.5, 2.0]);

        assert_eq!(parse_range("1:2:5.0").unwrap().0.len(), 5);
        assert!(parse_range("1:2:0").is_err());
        assert!(parse_range("1:2:-3").is_err());
        assert!(parse_range("1:2:3:4").is_err());
        assert!(parse_range("abc").is_err());
    }

    #[test]
    fn dates_are_day_first() {
        let d = parse_date("02/03/2013").unwrap();
        assert_eq!(d.date(), NaiveDate::from_ymd_opt(2013, 3, 2).unwrap());
        assert_eq!(parse_date("2013-03-02").unwrap(), d);
        let dt = parse_date("2013-03-02T14:30:00").unwrap();
        assert_eq!(dt.format("%H:%M").to_string(), "14:30");
        assert!(parse_date("yesterday").is_err());
    }

    #[test]
    fn defaults_validate_and_yield_one_run() {
        let cfg = config(&[]);
        cfg.validate().unwrap();
        assert_eq!(cfg.grid().len(), 1);
        assert_eq!(cfg.filter().country.as_deref(), Some("GB"));
        assert_eq!(cfg.strategy, StrategyKind::Skill);
        assert_eq!(cfg.favourite_market, RaceKind::ToBePlaced);
    }

    #[test]
    fn swept_axes_multiply() {
        let cfg = config(&["--mu", "20:30:3", "--risk-aversion", "0.05:0.2:4", "--country", "any"]);
        cfg.validate().unwrap();
        assert_eq!(cfg.grid().len(), 12);
        assert!(cfg.filter().country.is_none());
    }

    #[test]
    fn ranges_accept_negative_values() {
        let cfg = config(&["--mu", "-5:5:3", "--tau", "-1"]);
        assert_eq!(cfg.mu, Some(ParamRange(vec![-5.0, 0.0, 5.0])));
        assert_eq!(cfg.tau, Some(ParamRange(vec![-1.0])));
        // Parsed, then rejected on its own merits.
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(config(&["--commission", "1.5"]).validate().is_err());
        assert!(config(&["--risk-aversion", "0"]).validate().is_err());
        assert!(config(&["--draw-prob", "1.0"]).validate().is_err());
        assert!(config(&["--start", "10/01/2014", "--end", "01/01/2014"])
            .validate()
            .is_err());
        assert!(config(&["--jobs", "0"]).validate().is_err());
    }
}
