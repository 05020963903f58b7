use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub mod models;
pub mod store;

use models::*;
pub use store::{QuoteStore, RaceFilter, RaceStream, ResultSink};

use crate::backtest::scorecard::{EventBreakdown, Scorecard};
use crate::backtest::sweep::Hyperparameters;

/// How long a writer waits for a sibling worker's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLite handle.  Every backtest worker opens its own.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Historical inputs ────────────────────────────────────────────────────

    /// Insert a race and its runners, replacing any previous copy.
    #[cfg(test)]
    pub fn insert_race(&self, race: &Race) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        write_race(&tx, race)?;
        tx.commit()?;
        Ok(())
    }

    /// Upsert a VWAO quote
    #[cfg(test)]
    pub fn insert_quote(&self, quote: &MarketQuote) -> Result<()> {
        let conn = self.conn()?;
        write_quote(&conn, quote)?;
        Ok(())
    }

    /// Bulk-load races and quotes in a single transaction.
    pub fn insert_history(&self, races: &[Race], quotes: &[MarketQuote]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for race in races {
            write_race(&tx, race)?;
        }
        for quote in quotes {
            write_quote(&tx, quote)?;
        }
        tx.commit()?;
        Ok(())
    }

    // ── Results ──────────────────────────────────────────────────────────────

    /// Number of bets stored for a scorecard
    pub fn count_bets(&self, scorecard_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        let n = conn.query_row(
            "SELECT COUNT(*) FROM bkt_bets WHERE scorecard_id = ?1",
            params![scorecard_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Load a stored scorecard document
    pub fn load_scorecard(&self, scorecard_id: i64) -> Result<Scorecard> {
        let conn = self.conn()?;
        let json: String = conn.query_row(
            "SELECT scorecard FROM bkt_scorecards WHERE id = ?1",
            params![scorecard_id],
            |r| r.get(0),
        )?;
        Ok(serde_json::from_str(&json)?)
    }

    /// List (scorecard id, run index) for every stored run
    pub fn list_scorecards(&self) -> Result<Vec<(i64, i64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, run_index FROM bkt_scorecards ORDER BY run_index")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl RaceStream for Database {
    fn races(&self, filter: &RaceFilter) -> Result<Vec<Race>> {
        let conn = self.conn()?;

        // Runners for every matching race in one pass, grouped by event.
        let mut stmt = conn.prepare(
            "SELECT ru.event_id, ru.selection_id, ru.competitor_id,
                    ru.finish_position, ru.is_winner
             FROM runners ru JOIN races ra ON ra.event_id = ru.event_id
             WHERE (?1 IS NULL OR ra.scheduled_off >= ?1)
               AND (?2 IS NULL OR ra.scheduled_off <= ?2)
               AND (?3 IS NULL OR ra.country = ?3)
             ORDER BY ru.rowid",
        )?;
        let mut runners: HashMap<i64, Vec<(Selection, bool)>> = HashMap::new();
        let rows = stmt.query_map(
            params![filter.start, filter.end, filter.country],
            map_runner,
        )?;
        for row in rows {
            let (event_id, selection, is_winner) = row?;
            runners
                .entry(event_id)
                .or_default()
                .push((selection, is_winner));
        }

        let mut stmt = conn.prepare(
            "SELECT event_id, scheduled_off, country, kind, n_runners
             FROM races
             WHERE (?1 IS NULL OR scheduled_off >= ?1)
               AND (?2 IS NULL OR scheduled_off <= ?2)
               AND (?3 IS NULL OR country = ?3)
             ORDER BY scheduled_off ASC, event_id ASC",
        )?;
        let headers = stmt
            .query_map(params![filter.start, filter.end, filter.country], map_race)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let races = headers
            .into_iter()
            .map(|mut race| {
                for (selection, is_winner) in runners.remove(&race.event_id).unwrap_or_default() {
                    if is_winner {
                        race.winners.push(selection.selection_id);
                    }
                    race.selections.push(selection);
                }
                race
            })
            .collect();
        Ok(races)
    }
}

impl QuoteStore for Database {
    fn quotes(&self, filter: &RaceFilter) -> Result<QuoteBook> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, selection_id, scheduled_off, vwao, volume_matched
             FROM vwao
             WHERE (?1 IS NULL OR scheduled_off >= ?1)
               AND (?2 IS NULL OR scheduled_off <= ?2)
             ORDER BY scheduled_off ASC",
        )?;
        let quotes = stmt
            .query_map(params![filter.start, filter.end], map_quote)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(QuoteBook::new(quotes))
    }
}

impl ResultSink for Database {
    fn save_run_config(&self, params: &Hyperparameters, strategy: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO bkt_strategies (run_index, strategy, params, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                params.run_index as i64,
                strategy,
                serde_json::to_string(params)?,
                Utc::now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn save_scorecard(
        &self,
        config_id: i64,
        run_index: usize,
        scorecard: &Scorecard,
        run_seconds: f64,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO bkt_scorecards (strategy_id, run_index, scorecard, run_seconds, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                config_id,
                run_index as i64,
                serde_json::to_string(scorecard)?,
                run_seconds,
                Utc::now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn save_bets(&self, scorecard_id: i64, bets: &[Bet]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO bkt_bets (
                    scorecard_id, event_id, selection_id, scheduled_off, n_runners,
                    amount, odds, win, pnl, user_fields
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            )?;
            for bet in bets {
                stmt.execute(params![
                    scorecard_id,
                    bet.event_id,
                    bet.selection_id,
                    bet.scheduled_off,
                    bet.n_runners,
                    bet.amount,
                    bet.odds,
                    bet.win,
                    bet.pnl,
                    serde_json::to_string(&bet.user_fields)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn save_events(&self, scorecard_id: i64, events: &[EventBreakdown]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO bkt_events (
                    scorecard_id, event_id, scheduled_off, n_runners, n_bets,
                    pnl_gross, pnl_net, collateral
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            )?;
            for ev in events {
                stmt.execute(params![
                    scorecard_id,
                    ev.event_id,
                    ev.scheduled_off,
                    ev.n_runners,
                    ev.n_bets as i64,
                    ev.pnl_gross,
                    ev.pnl_net,
                    ev.collateral,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn write_race(conn: &Connection, race: &Race) -> Result<()> {
    conn.execute("DELETE FROM runners WHERE event_id = ?1", params![race.event_id])?;
    conn.execute(
        "INSERT OR REPLACE INTO races (event_id, scheduled_off, country, kind, n_runners)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            race.event_id,
            race.scheduled_off,
            race.country,
            race.kind.as_str(),
            race.n_runners,
        ],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO runners (event_id, selection_id, competitor_id, finish_position, is_winner)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for s in &race.selections {
        stmt.execute(params![
            race.event_id,
            s.selection_id,
            s.competitor_id,
            s.finish_position,
            race.is_winner(s.selection_id),
        ])?;
    }
    Ok(())
}

fn write_quote(conn: &Connection, quote: &MarketQuote) -> Result<()> {
    conn.execute(
        "INSERT INTO vwao (event_id, selection_id, scheduled_off, vwao, volume_matched)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(event_id, selection_id) DO UPDATE SET
            scheduled_off=excluded.scheduled_off,
            vwao=excluded.vwao,
            volume_matched=excluded.volume_matched",
        params![
            quote.event_id,
            quote.selection_id,
            quote.scheduled_off,
            quote.vwao,
            quote.volume_matched,
        ],
    )?;
    Ok(())
}

fn map_race(row: &rusqlite::Row) -> rusqlite::Result<Race> {
    let kind: String = row.get(3)?;
    let kind = kind.parse::<RaceKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(Race {
        event_id: row.get(0)?,
        scheduled_off: row.get(1)?,
        country: row.get(2)?,
        kind,
        n_runners: row.get(4)?,
        selections: Vec::new(),
        winners: Vec::new(),
    })
}

fn map_runner(row: &rusqlite::Row) -> rusqlite::Result<(i64, Selection, bool)> {
    Ok((
        row.get(0)?,
        Selection {
            selection_id: row.get(1)?,
            competitor_id: row.get(2)?,
            finish_position: row.get(3)?,
        },
        row.get(4)?,
    ))
}

fn map_quote(row: &rusqlite::Row) -> rusqlite::Result<MarketQuote> {
    Ok(MarketQuote {
        event_id: row.get(0)?,
        selection_id: row.get(1)?,
        scheduled_off: row.get(2)?,
        vwao: row.get(3)?,
        volume_matched: row.get(4)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS races (
    event_id      INTEGER PRIMARY KEY,
    scheduled_off TEXT    NOT NULL,
    country       TEXT    NOT NULL,
    kind          TEXT    NOT NULL DEFAULT 'win',
    n_runners     INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS runners (
    event_id        INTEGER NOT NULL,
    selection_id    INTEGER NOT NULL,
    competitor_id   INTEGER NOT NULL,
    finish_position INTEGER,
    is_winner       INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (event_id, selection_id),
    FOREIGN KEY (event_id) REFERENCES races(event_id)
);

CREATE TABLE IF NOT EXISTS vwao (
    event_id       INTEGER NOT NULL,
    selection_id   INTEGER NOT NULL,
    scheduled_off  TEXT    NOT NULL,
    vwao           REAL    NOT NULL,
    volume_matched REAL    NOT NULL DEFAULT 0,
    PRIMARY KEY (event_id, selection_id)
);

CREATE TABLE IF NOT EXISTS bkt_strategies (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    run_index  INTEGER NOT NULL,
    strategy   TEXT    NOT NULL,
    params     TEXT    NOT NULL,
    created_at TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS bkt_scorecards (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    strategy_id INTEGER NOT NULL,
    run_index   INTEGER NOT NULL,
    scorecard   TEXT    NOT NULL,
    run_seconds REAL    NOT NULL,
    created_at  TEXT    NOT NULL,
    FOREIGN KEY (strategy_id) REFERENCES bkt_strategies(id)
);

CREATE TABLE IF NOT EXISTS bkt_bets (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    scorecard_id  INTEGER NOT NULL,
    event_id      INTEGER NOT NULL,
    selection_id  INTEGER NOT NULL,
    scheduled_off TEXT    NOT NULL,
    n_runners     INTEGER NOT NULL,
    amount        REAL    NOT NULL,
    odds          REAL    NOT NULL,
    win           INTEGER NOT NULL,
    pnl           REAL    NOT NULL,
    user_fields   TEXT    NOT NULL DEFAULT '{}',
    FOREIGN KEY (scorecard_id) REFERENCES bkt_scorecards(id)
);

CREATE TABLE IF NOT EXISTS bkt_events (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    scorecard_id  INTEGER NOT NULL,
    event_id      INTEGER NOT NULL,
    scheduled_off TEXT    NOT NULL,
    n_runners     INTEGER NOT NULL,
    n_bets        INTEGER NOT NULL,
    pnl_gross     REAL    NOT NULL,
    pnl_net       REAL    NOT NULL,
    collateral    REAL    NOT NULL,
    FOREIGN KEY (scorecard_id) REFERENCES bkt_scorecards(id)
);

CREATE INDEX IF NOT EXISTS idx_races_off ON races(scheduled_off);
CREATE INDEX IF NOT EXISTS idx_vwao_off ON vwao(scheduled_off);
CREATE INDEX IF NOT EXISTS idx_bets_scorecard ON bkt_bets(scorecard_id);
CREATE INDEX IF NOT EXISTS idx_events_scorecard ON bkt_events(scorecard_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::scorecard::ScorecardBuilder;
    use crate::backtest::handler::SkipTally;
    use chrono::{DateTime, TimeZone};
    use std::collections::BTreeMap;

    fn parse_user_fields(json: &str) -> Result<BTreeMap<String, f64>> {
        Ok(serde_json::from_str(json)?)
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2013, 5, day, hour, 0, 0).unwrap()
    }

    fn race(event_id: i64, off: DateTime<Utc>, country: &str) -> Race {
        Race {
            event_id,
            scheduled_off: off,
            country: country.into(),
            kind: RaceKind::Win,
            n_runners: 3,
            selections: (0..3)
                .map(|i| Selection {
                    selection_id: event_id * 10 + i,
                    competitor_id: 100 + i,
                    finish_position: Some(i as u32 + 1),
                })
                .collect(),
            winners: vec![event_id * 10],
        }
    }

    fn quote(event_id: i64, selection_id: i64, off: DateTime<Utc>) -> MarketQuote {
        MarketQuote {
            event_id,
            selection_id,
            scheduled_off: off,
            vwao: 3.0,
            volume_matched: 500.0,
        }
    }

    #[test]
    fn races_come_back_sorted_and_filtered() {
        let db = Database::open_in_memory().unwrap();
        db.insert_race(&race(3, at(3, 14), "GB")).unwrap();
        db.insert_race(&race(1, at(1, 14), "GB")).unwrap();
        db.insert_race(&race(2, at(2, 14), "IE")).unwrap();
        db.insert_race(&race(4, at(9, 14), "GB")).unwrap();

        let filter = RaceFilter {
            country: Some("GB".into()),
            start: Some(at(1, 0)),
            end: Some(at(5, 0)),
        };
        let races = db.races(&filter).unwrap();
        let ids: Vec<i64> = races.iter().map(|r| r.event_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(races[0], race(1, at(1, 14), "GB"));
        assert!(races.iter().all(|r| filter.contains(r)));

        let all = db.races(&RaceFilter::default()).unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn reinserting_a_race_replaces_runners() {
        let db = Database::open_in_memory().unwrap();
        let mut r = race(1, at(1, 14), "GB");
        db.insert_race(&r).unwrap();
        r.selections.pop();
        r.n_runners = 2;
        db.insert_race(&r).unwrap();
        let races = db.races(&RaceFilter::default()).unwrap();
        assert_eq!(races[0].selections.len(), 2);
    }

    #[test]
    fn quotes_ignore_country_but_respect_dates() {
        let db = Database::open_in_memory().unwrap();
        db.insert_history(
            &[race(1, at(1, 14), "GB"), race(2, at(8, 14), "GB")],
            &[quote(1, 10, at(1, 14)), quote(1, 11, at(1, 14)), quote(2, 20, at(8, 14))],
        )
        .unwrap();
        let filter = RaceFilter {
            country: Some("IE".into()),
            start: None,
            end: Some(at(5, 0)),
        };
        let book = db.quotes(&filter).unwrap();
        assert_eq!(book.len(), 2);
        assert_eq!(book.odds(1, 11), Some(3.0));
        assert_eq!(book.total_matched(1), Some(1000.0));
    }

    #[test]
    fn results_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let params = Hyperparameters::default();
        let config_id = db.save_run_config(&params, "skill").unwrap();

        let bets = vec![Bet {
            event_id: 1,
            selection_id: 10,
            scheduled_off: at(1, 14),
            n_runners: 3,
            amount: 2.0,
            odds: 3.0,
            win: true,
            pnl: 4.0,
            user_fields: BTreeMap::from([("p".to_string(), 0.4)]),
        }];
        let (scorecard, events) = ScorecardBuilder::default().build(&bets, &SkipTally::default());
        let scorecard_id = db.save_scorecard(config_id, 0, &scorecard, 1.5).unwrap();
        db.save_bets(scorecard_id, &bets).unwrap();
        db.save_events(scorecard_id, &events).unwrap();

        assert_eq!(db.count_bets(scorecard_id).unwrap(), 1);
        let loaded = db.load_scorecard(scorecard_id).unwrap();
        assert_eq!(loaded.n_bets, scorecard.n_bets);
        assert_eq!(loaded.daily.len(), scorecard.daily.len());
        approx::assert_relative_eq!(loaded.pnl_gross, scorecard.pnl_gross, epsilon = 1e-9);
        assert_eq!(db.list_scorecards().unwrap(), vec![(scorecard_id, 0)]);
        assert_eq!(parse_user_fields(r#"{"p":0.4}"#).unwrap()["p"], 0.4);
    }
}
