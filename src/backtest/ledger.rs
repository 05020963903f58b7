use crate::db::models::Bet;

/// Append-only record of the bets placed during one run.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    bets: Vec<Bet>,
}

impl Ledger {
    pub fn record(&mut self, bet: Bet) -> &Bet {
        self.bets.push(bet);
        &self.bets[self.bets.len() - 1]
    }

    #[cfg(test)]
    pub fn bets(&self) -> &[Bet] {
        &self.bets
    }

    pub fn len(&self) -> usize {
        self.bets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bets.is_empty()
    }

    pub fn total_pnl(&self) -> f64 {
        self.pnl_since(0)
    }

    /// P&L of bets recorded at or after `index`.  Non-finite values count as 0.
    pub fn pnl_since(&self, index: usize) -> f64 {
        self.bets
            .get(index..)
            .unwrap_or_default()
            .iter()
            .map(|b| if b.pnl.is_finite() { b.pnl } else { 0.0 })
            .sum()
    }

    pub fn into_bets(self) -> Vec<Bet> {
        self.bets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn bet(pnl: f64) -> Bet {
        Bet {
            event_id: 1,
            selection_id: 1,
            scheduled_off: Utc.with_ymd_and_hms(2013, 1, 1, 12, 0, 0).unwrap(),
            n_runners: 5,
            amount: 1.0,
            odds: 2.0,
            win: pnl > 0.0,
            pnl,
            user_fields: BTreeMap::new(),
        }
    }

    #[test]
    fn window_sums_skip_non_finite() {
        let mut ledger = Ledger::default();
        for pnl in [1.0, -0.5, f64::NAN, 2.0] {
            ledger.record(bet(pnl));
        }
        assert_relative_eq!(ledger.total_pnl(), 2.5);
        assert_relative_eq!(ledger.pnl_since(2), 2.0);
        assert_relative_eq!(ledger.pnl_since(10), 0.0);
        assert_eq!(ledger.into_bets().len(), 4);
    }
}
