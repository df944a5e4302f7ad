//! Per-party trust scores.
//!
//! A score in `[0, 1]` is derived from a party's settlement history:
//! - fewer than `min_history` outcomes: plain success ratio
//! - afterwards: `recent_weight * recent_ratio + (1 - recent_weight) * previous`
//!   where `recent_ratio` covers the last `recent_window` outcomes
//! - every `bonus_every`-th cumulative success adds `bonus`
//!
//! Penalties subtract fixed amounts. The score is clamped after every change.
//! Records are only ever written through [`TrustLedger`].

use crate::config::TrustConfig;
use crate::error::Result;
use crate::store::{Store, TRUST_PREFIX, trust_key};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct TrustScore {
    #[n(0)]
    pub party_id: String,
    #[n(1)]
    pub successful_transactions: u64,
    #[n(2)]
    pub total_transactions: u64,
    #[n(3)]
    pub score: f64,
    #[n(4)]
    pub recent: Vec<bool>, // oldest first
    #[n(5)]
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenaltyKind {
    DisputeFault,
    Return,
    LateDelivery,
    Timeout,
}

impl PenaltyKind {
    pub fn amount(&self, params: &TrustConfig) -> f64 {
        match self {
            Self::DisputeFault => params.penalties.dispute_fault,
            Self::Return => params.penalties.return_goods,
            Self::LateDelivery => params.penalties.late_delivery,
            Self::Timeout => params.penalties.timeout,
        }
    }
}

impl TrustScore {
    pub fn new(party_id: &str, initial_score: f64) -> Self {
        Self {
            party_id: party_id.to_string(),
            successful_transactions: 0,
            total_transactions: 0,
            score: initial_score.clamp(0.0, 1.0),
            recent: vec![],
            version: 0,
        }
    }

    pub fn success_ratio(&self) -> f64 {
        if self.total_transactions == 0 {
            return 0.0;
        }
        self.successful_transactions as f64 / self.total_transactions as f64
    }

    fn record(&mut self, success: bool, params: &TrustConfig) {
        self.total_transactions += 1;
        if success {
            self.successful_transactions += 1;
        }

        self.recent.push(success);
        if self.recent.len() > params.recent_window.max(1) {
            let excess = self.recent.len() - params.recent_window.max(1);
            self.recent.drain(..excess);
        }

        self.score = if self.total_transactions < params.min_history {
            self.success_ratio()
        } else {
            let hits = self.recent.iter().filter(|s| **s).count() as f64;
            let recent_ratio = hits / self.recent.len() as f64;
            params.recent_weight * recent_ratio + (1.0 - params.recent_weight) * self.score
        };

        if success
            && params.bonus_every > 0
            && self.successful_transactions % params.bonus_every == 0
        {
            self.score += params.bonus;
        }

        self.score = self.score.clamp(0.0, 1.0);
        self.version += 1;
    }

    fn penalize(&mut self, amount: f64) {
        self.score = (self.score - amount).clamp(0.0, 1.0);
        self.version += 1;
    }
}

#[derive(Clone)]
pub struct TrustLedger {
    store: Store,
    params: TrustConfig,
}

impl TrustLedger {
    pub fn new(store: Store, params: TrustConfig) -> Self {
        Self { store, params }
    }

    /// Current score, created at the initial score on first reference.
    pub fn get_trust_score(&self, party_id: &str) -> Result<TrustScore> {
        let key = trust_key(party_id);
        if let Some(existing) = self.store.get(&key)? {
            return Ok(existing);
        }
        let (score, _) = self.store.upsert(&key, || self.fresh(party_id), |_| Ok(()))?;
        Ok(score)
    }

    pub fn record_outcome(&self, party_id: &str, success: bool) -> Result<TrustScore> {
        let (score, _) = self.store.upsert(
            &trust_key(party_id),
            || self.fresh(party_id),
            |s: &mut TrustScore| {
                s.record(success, &self.params);
                Ok(())
            },
        )?;

        tracing::debug!(
            party = party_id,
            success,
            score = score.score,
            total = score.total_transactions,
            "recorded settlement outcome"
        );
        Ok(score)
    }

    pub fn apply_penalty(&self, party_id: &str, kind: PenaltyKind) -> Result<TrustScore> {
        let amount = kind.amount(&self.params);
        let (score, _) = self.store.upsert(
            &trust_key(party_id),
            || self.fresh(party_id),
            |s: &mut TrustScore| {
                s.penalize(amount);
                Ok(())
            },
        )?;

        tracing::info!(party = party_id, ?kind, amount, score = score.score, "trust penalty applied");
        Ok(score)
    }

    pub fn all_scores(&self) -> Result<Vec<TrustScore>> {
        self.store.scan(TRUST_PREFIX)
    }

    fn fresh(&self, party_id: &str) -> TrustScore {
        TrustScore::new(party_id, self.params.initial_score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn ledger() -> (tempfile::TempDir, TrustLedger) {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join("trust.db")).unwrap();
        let store = Store::new(Arc::new(db));
        (dir, TrustLedger::new(store, TrustConfig::default()))
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn unknown_party_starts_neutral() {
        let (_dir, ledger) = ledger();
        let score = ledger.get_trust_score("acme").unwrap();

        assert!(close(score.score, 0.5));
        assert_eq!(score.total_transactions, 0);
        assert_eq!(ledger.all_scores().unwrap().len(), 1);
    }

    #[test]
    fn short_history_uses_plain_ratio() {
        let (_dir, ledger) = ledger();
        ledger.record_outcome("acme", true).unwrap();
        ledger.record_outcome("acme", false).unwrap();
        let score = ledger.record_outcome("acme", true).unwrap();

        assert_eq!(score.total_transactions, 3);
        assert_eq!(score.successful_transactions, 2);
        assert!(close(score.score, 2.0 / 3.0));
    }

    #[test]
    fn long_history_blends_recent_and_previous() {
        let (_dir, ledger) = ledger();
        for _ in 0..4 {
            ledger.record_outcome("acme", true).unwrap();
        }
        // 5th outcome is the first blended one: previous 1.0, recent 4/5
        let score = ledger.record_outcome("acme", false).unwrap();
        assert!(close(score.score, 0.7 * 0.8 + 0.3 * 1.0));
    }

    #[test]
    fn tenth_success_earns_bonus() {
        let (_dir, ledger) = ledger();
        for _ in 0..5 {
            ledger.record_outcome("acme", false).unwrap();
        }
        let mut last = ledger.get_trust_score("acme").unwrap();
        for _ in 0..9 {
            last = ledger.record_outcome("acme", true).unwrap();
        }
        let before_bonus_formula = 0.7 * 1.0 + 0.3 * last.score;
        let tenth = ledger.record_outcome("acme", true).unwrap();

        assert_eq!(tenth.successful_transactions, 10);
        assert!(close(tenth.score, (before_bonus_formula + 0.01).min(1.0)));
    }

    #[test]
    fn penalties_clamp_at_zero() {
        let (_dir, ledger) = ledger();
        ledger.record_outcome("acme", false).unwrap();
        let score = ledger.apply_penalty("acme", PenaltyKind::DisputeFault).unwrap();
        assert!(close(score.score, 0.0));

        let fresh = ledger.apply_penalty("other", PenaltyKind::Timeout).unwrap();
        assert!(close(fresh.score, 0.49));
        let fresh = ledger.apply_penalty("other", PenaltyKind::Return).unwrap();
        assert!(close(fresh.score, 0.475));
    }

    #[test]
    fn concurrent_outcomes_are_not_lost() {
        let (_dir, ledger) = ledger();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        ledger.record_outcome("hub", i % 2 == 0).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let score = ledger.get_trust_score("hub").unwrap();
        assert_eq!(score.total_transactions, 80);
        assert_eq!(score.successful_transactions, 40);
        assert!((0.0..=1.0).contains(&score.score));
    }
}
