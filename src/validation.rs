//! Auto-approval gate: confirmation completeness, business rules and
//! confidence-scored anomaly checks, plus dispute and batch pre-checks.
//!
//! The engine keeps no state of its own. Historical facts (average prices,
//! recent activity, last known item locations, eligibility flags) come from a
//! [`HistoryLookup`].
use crate::config::{DisputeTypeConfig, SettlementConfig, window_hours};
use crate::dispute::EvidenceFields;
use crate::error::{Result, SettlementError};
use crate::store::{FLAG_PREFIX, Store, TRANSACTION_PREFIX, flag_key};
use crate::timestamp::TimeStamp;
use crate::transaction::{GeoPoint, NewTransaction, Transaction, TransactionState};
use crate::trust::TrustLedger;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReviewAction {
    #[n(0)]
    ManualReview,
    #[n(1)]
    AiAnalysis,
    #[n(2)]
    SenderConfirmation,
    #[n(3)]
    ReceiverConfirmation,
}

impl ReviewAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualReview => "manual_review",
            Self::AiAnalysis => "ai_analysis",
            Self::SenderConfirmation => "sender_confirmation",
            Self::ReceiverConfirmation => "receiver_confirmation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    Geographic,
    Price,
    NewRelationship,
    RepeatedItem,
    Velocity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub confidence: f64,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub reason: String,
    pub required_actions: Vec<ReviewAction>,
    /// Confidence in the verdict itself.
    pub confidence: f64,
    /// Every anomaly found, blocking or advisory.
    pub anomalies: Vec<Anomaly>,
}

impl ValidationResult {
    fn pass(reason: impl Into<String>, confidence: f64, anomalies: Vec<Anomaly>) -> Self {
        Self {
            is_valid: true,
            reason: reason.into(),
            required_actions: vec![],
            confidence,
            anomalies,
        }
    }

    fn reject(reason: impl Into<String>, required_actions: Vec<ReviewAction>, confidence: f64) -> Self {
        Self {
            is_valid: false,
            reason: reason.into(),
            required_actions,
            confidence,
            anomalies: vec![],
        }
    }
}

/// Read-only historical queries consulted by the anomaly checks.
///
/// `exclude` is the id of the transaction being judged so it never counts
/// against itself.
pub trait HistoryLookup: Send + Sync {
    /// Average value of earlier settled transactions of the item.
    fn average_price(&self, item_id: &str, exclude: &str) -> Result<Option<f64>>;
    /// Where and when the item was last handed over.
    fn last_known_location(
        &self,
        item_id: &str,
        exclude: &str,
    ) -> Result<Option<(GeoPoint, TimeStamp<Utc>)>>;
    /// Whether the two parties have settled with each other before.
    fn has_relationship(&self, a: &str, b: &str, exclude: &str) -> Result<bool>;
    fn item_transactions_since(
        &self,
        item_id: &str,
        since: &TimeStamp<Utc>,
        exclude: &str,
    ) -> Result<usize>;
    fn sender_transactions_since(
        &self,
        sender: &str,
        since: &TimeStamp<Utc>,
        exclude: &str,
    ) -> Result<usize>;
    /// Reason the party or item is barred (stolen, sanctioned, ...), if it is.
    fn flag(&self, id: &str) -> Result<Option<String>>;
    /// History to judge `tx` against. The engine asks once per validation;
    /// implementations that answer queries by scanning load what `tx` needs
    /// here.
    fn snapshot(&self, tx: &Transaction) -> Result<Arc<dyn HistoryLookup>>;
}

/// History read from the same store the transactions live in.
#[derive(Clone)]
pub struct LedgerHistory {
    store: Store,
}

impl LedgerHistory {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn load(&self, keep: impl Fn(&Transaction) -> bool) -> Result<LedgerSnapshot> {
        let all: Vec<Transaction> = self.store.scan(TRANSACTION_PREFIX)?;
        Ok(LedgerSnapshot {
            store: self.store.clone(),
            transactions: Arc::new(all.into_iter().filter(keep).collect()),
        })
    }

    pub fn flagged(&self) -> Result<Vec<String>> {
        self.store.scan(FLAG_PREFIX)
    }
}

impl HistoryLookup for LedgerHistory {
    fn average_price(&self, item_id: &str, exclude: &str) -> Result<Option<f64>> {
        self.load(|tx| tx.item_id == item_id)?
            .average_price(item_id, exclude)
    }

    fn last_known_location(
        &self,
        item_id: &str,
        exclude: &str,
    ) -> Result<Option<(GeoPoint, TimeStamp<Utc>)>> {
        self.load(|tx| tx.item_id == item_id)?
            .last_known_location(item_id, exclude)
    }

    fn has_relationship(&self, a: &str, b: &str, exclude: &str) -> Result<bool> {
        self.load(|tx| tx.is_party(a) && tx.is_party(b))?
            .has_relationship(a, b, exclude)
    }

    fn item_transactions_since(
        &self,
        item_id: &str,
        since: &TimeStamp<Utc>,
        exclude: &str,
    ) -> Result<usize> {
        self.load(|tx| tx.item_id == item_id)?
            .item_transactions_since(item_id, since, exclude)
    }

    fn sender_transactions_since(
        &self,
        sender: &str,
        since: &TimeStamp<Utc>,
        exclude: &str,
    ) -> Result<usize> {
        self.load(|tx| tx.sender == sender)?
            .sender_transactions_since(sender, since, exclude)
    }

    fn flag(&self, id: &str) -> Result<Option<String>> {
        self.store.get(&flag_key(id))
    }

    /// One scan, keeping the records that share the item, the sender or
    /// both parties with `tx`.
    fn snapshot(&self, tx: &Transaction) -> Result<Arc<dyn HistoryLookup>> {
        let snapshot = self.load(|other| {
            other.id != tx.id
                && (other.item_id == tx.item_id
                    || other.sender == tx.sender
                    || (other.is_party(&tx.sender) && other.is_party(&tx.receiver)))
        })?;
        Ok(Arc::new(snapshot))
    }
}

/// Transactions loaded by a single scan of the ledger. Flags are still read
/// through the store.
#[derive(Clone)]
pub struct LedgerSnapshot {
    store: Store,
    transactions: Arc<Vec<Transaction>>,
}

impl LedgerSnapshot {
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    fn others<'a>(&'a self, exclude: &'a str) -> impl Iterator<Item = &'a Transaction> + 'a {
        self.transactions.iter().filter(move |tx| tx.id != exclude)
    }
}

impl HistoryLookup for LedgerSnapshot {
    fn average_price(&self, item_id: &str, exclude: &str) -> Result<Option<f64>> {
        let values: Vec<f64> = self
            .others(exclude)
            .filter(|tx| tx.item_id == item_id && tx.state == TransactionState::Validated)
            .map(|tx| tx.value as f64)
            .collect();

        if values.is_empty() {
            return Ok(None);
        }
        Ok(Some(values.iter().sum::<f64>() / values.len() as f64))
    }

    fn last_known_location(
        &self,
        item_id: &str,
        exclude: &str,
    ) -> Result<Option<(GeoPoint, TimeStamp<Utc>)>> {
        Ok(self
            .others(exclude)
            .filter(|tx| tx.item_id == item_id && tx.state == TransactionState::Validated)
            .filter_map(|tx| {
                let at = tx
                    .receiver_confirmed_at
                    .clone()
                    .unwrap_or_else(|| tx.created_at.clone());
                tx.metadata.location().map(|loc| (*loc, at))
            })
            .max_by(|a, b| a.1.cmp(&b.1)))
    }

    fn has_relationship(&self, a: &str, b: &str, exclude: &str) -> Result<bool> {
        Ok(self.others(exclude).any(|tx| {
            tx.state == TransactionState::Validated && tx.is_party(a) && tx.is_party(b)
        }))
    }

    fn item_transactions_since(
        &self,
        item_id: &str,
        since: &TimeStamp<Utc>,
        exclude: &str,
    ) -> Result<usize> {
        Ok(self
            .others(exclude)
            .filter(|tx| tx.item_id == item_id && tx.created_at >= *since)
            .count())
    }

    fn sender_transactions_since(
        &self,
        sender: &str,
        since: &TimeStamp<Utc>,
        exclude: &str,
    ) -> Result<usize> {
        Ok(self
            .others(exclude)
            .filter(|tx| tx.sender == sender && tx.created_at >= *since)
            .count())
    }

    fn flag(&self, id: &str) -> Result<Option<String>> {
        self.store.get(&flag_key(id))
    }

    fn snapshot(&self, _: &Transaction) -> Result<Arc<dyn HistoryLookup>> {
        Ok(Arc::new(self.clone()))
    }
}

/// Fixed history, for wiring in an external read model or for drills.
#[derive(Debug, Default, Clone)]
pub struct StaticHistory {
    prices: HashMap<String, f64>,
    locations: HashMap<String, (GeoPoint, TimeStamp<Utc>)>,
    relationships: HashSet<(String, String)>,
    item_counts: HashMap<String, usize>,
    sender_counts: HashMap<String, usize>,
    flags: HashMap<String, String>,
}

impl StaticHistory {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_average_price(mut self, item_id: &str, price: f64) -> Self {
        self.prices.insert(item_id.to_string(), price);
        self
    }
    pub fn with_location(mut self, item_id: &str, at: GeoPoint, when: TimeStamp<Utc>) -> Self {
        self.locations.insert(item_id.to_string(), (at, when));
        self
    }
    pub fn with_relationship(mut self, a: &str, b: &str) -> Self {
        self.relationships.insert((a.to_string(), b.to_string()));
        self.relationships.insert((b.to_string(), a.to_string()));
        self
    }
    pub fn with_recent_item_count(mut self, item_id: &str, count: usize) -> Self {
        self.item_counts.insert(item_id.to_string(), count);
        self
    }
    pub fn with_recent_sender_count(mut self, sender: &str, count: usize) -> Self {
        self.sender_counts.insert(sender.to_string(), count);
        self
    }
    pub fn with_flag(mut self, id: &str, reason: &str) -> Self {
        self.flags.insert(id.to_string(), reason.to_string());
        self
    }
}

impl HistoryLookup for StaticHistory {
    fn average_price(&self, item_id: &str, _: &str) -> Result<Option<f64>> {
        Ok(self.prices.get(item_id).copied())
    }
    fn last_known_location(
        &self,
        item_id: &str,
        _: &str,
    ) -> Result<Option<(GeoPoint, TimeStamp<Utc>)>> {
        Ok(self.locations.get(item_id).cloned())
    }
    fn has_relationship(&self, a: &str, b: &str, _: &str) -> Result<bool> {
        Ok(self.relationships.contains(&(a.to_string(), b.to_string())))
    }
    fn item_transactions_since(&self, item_id: &str, _: &TimeStamp<Utc>, _: &str) -> Result<usize> {
        Ok(self.item_counts.get(item_id).copied().unwrap_or(0))
    }
    fn sender_transactions_since(&self, sender: &str, _: &TimeStamp<Utc>, _: &str) -> Result<usize> {
        Ok(self.sender_counts.get(sender).copied().unwrap_or(0))
    }
    fn flag(&self, id: &str) -> Result<Option<String>> {
        Ok(self.flags.get(id).cloned())
    }
    fn snapshot(&self, _: &Transaction) -> Result<Arc<dyn HistoryLookup>> {
        Ok(Arc::new(self.clone()))
    }
}

/// Start of a look-back window of `hours` ending at `when`.
fn window_start(when: &TimeStamp<Utc>, name: &str, hours: i64) -> Result<TimeStamp<Utc>> {
    when.checked_minus(window_hours(name, hours)?).ok_or_else(|| {
        SettlementError::InvalidInput(format!("{name} reaches before the supported calendar"))
    })
}

/// Required evidence fields that are absent or blank.
pub fn missing_evidence(dispute_type: &DisputeTypeConfig, evidence: &EvidenceFields) -> Vec<String> {
    dispute_type
        .required_evidence
        .iter()
        .filter(|field| evidence.get(*field).is_none_or(|v| v.trim().is_empty()))
        .cloned()
        .collect()
}

/// State, taxonomy and evidence checks shared by `raise_dispute` and
/// [`ValidationEngine::validate_dispute`].
pub fn check_dispute_admissible<'c>(
    config: &'c SettlementConfig,
    tx: &Transaction,
    dispute_type: &str,
    evidence: &EvidenceFields,
) -> Result<&'c DisputeTypeConfig> {
    let open_for_dispute = tx.state == TransactionState::Sent
        || (tx.state == TransactionState::TimedOut && tx.under_review);
    if !open_for_dispute {
        return Err(SettlementError::invalid_state(&tx.id, tx.state, "raise a dispute"));
    }

    let kind = config
        .dispute_type(dispute_type)
        .ok_or_else(|| SettlementError::InvalidDisputeType(dispute_type.to_string()))?;

    let missing = missing_evidence(kind, evidence);
    if !missing.is_empty() {
        return Err(SettlementError::MissingEvidence {
            dispute_type: dispute_type.to_string(),
            missing,
        });
    }
    Ok(kind)
}

#[derive(Clone)]
pub struct ValidationEngine {
    config: Arc<SettlementConfig>,
    history: Arc<dyn HistoryLookup>,
    trust: TrustLedger,
}

impl ValidationEngine {
    pub fn new(
        config: Arc<SettlementConfig>,
        history: Arc<dyn HistoryLookup>,
        trust: TrustLedger,
    ) -> Self {
        Self {
            config,
            history,
            trust,
        }
    }

    /// Decide whether `tx` may settle without a human looking at it.
    ///
    /// `now` stands in for the receipt time when the receiver has not
    /// confirmed yet.
    pub fn validate_for_auto_approval(
        &self,
        tx: &Transaction,
        now: &TimeStamp<Utc>,
    ) -> Result<ValidationResult> {
        let mut missing = vec![];
        let mut actions = vec![];
        if !tx.sender_confirmed {
            missing.push("sender");
            actions.push(ReviewAction::SenderConfirmation);
        }
        if !tx.receiver_confirmed {
            missing.push("receiver");
            actions.push(ReviewAction::ReceiverConfirmation);
        }
        if !missing.is_empty() {
            return Ok(ValidationResult::reject(
                format!("missing confirmation from {}", missing.join(" and ")),
                actions,
                1.0,
            ));
        }

        let history = self.history.snapshot(tx)?;
        if let Some(reason) = self.business_rule_violation(history.as_ref(), tx)? {
            return Ok(ValidationResult::reject(
                reason,
                vec![ReviewAction::ManualReview],
                1.0,
            ));
        }

        let when = tx.receiver_confirmed_at.clone().unwrap_or_else(|| now.clone());
        let anomalies = self.detect_anomalies(history.as_ref(), tx, &when)?;
        let threshold = self.config.anomaly.block_confidence;

        let (blocking, advisory): (Vec<&Anomaly>, Vec<&Anomaly>) =
            anomalies.iter().partition(|a| a.confidence > threshold);

        for a in &advisory {
            tracing::warn!(
                transaction = %tx.id,
                kind = ?a.kind,
                confidence = a.confidence,
                detail = %a.detail,
                "advisory anomaly"
            );
        }

        if !blocking.is_empty() {
            let confidence = blocking.iter().map(|a| a.confidence).fold(0.0, f64::max);
            let reason = blocking
                .iter()
                .map(|a| a.detail.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            tracing::info!(transaction = %tx.id, confidence, %reason, "auto-approval blocked");

            let mut result = ValidationResult::reject(
                reason,
                vec![ReviewAction::ManualReview, ReviewAction::AiAnalysis],
                confidence,
            );
            result.anomalies = anomalies;
            return Ok(result);
        }

        let strongest = advisory.iter().map(|a| a.confidence).fold(0.0, f64::max);
        let reason = if advisory.is_empty() {
            "auto-approval granted".to_string()
        } else {
            format!("auto-approval granted with {} advisory warning(s)", advisory.len())
        };
        Ok(ValidationResult::pass(reason, 1.0 - strongest, anomalies))
    }

    /// Pre-check for callers about to raise a dispute.
    pub fn validate_dispute(
        &self,
        tx: &Transaction,
        dispute_type: &str,
        evidence: &EvidenceFields,
    ) -> ValidationResult {
        match check_dispute_admissible(&self.config, tx, dispute_type, evidence) {
            Ok(_) => ValidationResult::pass("dispute admissible", 1.0, vec![]),
            Err(e) => ValidationResult::reject(e.to_string(), vec![], 1.0),
        }
    }

    /// Gate for bulk submissions. Size is judged before trust, so an oversized
    /// batch is refused whoever sends it.
    pub fn validate_batch_operation(
        &self,
        transactions: &[NewTransaction],
        submitter_id: &str,
    ) -> Result<ValidationResult> {
        let max = self.config.batch.max_batch_size;
        if transactions.len() > max {
            return Err(SettlementError::BatchTooLarge {
                size: transactions.len(),
                max,
            });
        }
        if transactions.is_empty() {
            return Err(SettlementError::InvalidInput("batch is empty".into()));
        }

        let trust = self.trust.get_trust_score(submitter_id)?;
        let required = self.config.batch.min_trust_score;
        if trust.score < required {
            return Err(SettlementError::InsufficientTrust {
                party: submitter_id.to_string(),
                score: trust.score,
                required,
            });
        }

        for (i, member) in transactions.iter().enumerate() {
            let blank = |v: &Option<String>| v.as_deref().is_none_or(|s| s.trim().is_empty());
            let problem = if blank(&member.sender) {
                Some("sender is missing")
            } else if blank(&member.receiver) {
                Some("receiver is missing")
            } else if member.item_type.is_none() || blank(&member.item_id) {
                Some("item is missing")
            } else if member.value < 0 {
                Some("value is negative")
            } else {
                None
            };
            if let Some(problem) = problem {
                return Err(SettlementError::InvalidInput(format!(
                    "batch member {i}: {problem}"
                )));
            }
        }

        Ok(ValidationResult::pass(
            format!("batch of {} accepted", transactions.len()),
            1.0,
            vec![],
        ))
    }

    fn business_rule_violation(
        &self,
        history: &dyn HistoryLookup,
        tx: &Transaction,
    ) -> Result<Option<String>> {
        if tx.value < 0 {
            return Ok(Some("value must not be negative".into()));
        }
        for (role, id) in [
            ("sender", &tx.sender),
            ("receiver", &tx.receiver),
            ("item", &tx.item_id),
        ] {
            if let Some(reason) = history.flag(id)? {
                return Ok(Some(format!("{role} {id} is ineligible: {reason}")));
            }
        }
        Ok(None)
    }

    fn detect_anomalies(
        &self,
        history: &dyn HistoryLookup,
        tx: &Transaction,
        when: &TimeStamp<Utc>,
    ) -> Result<Vec<Anomaly>> {
        let cfg = &self.config.anomaly;
        let mut found = vec![];

        // geographic
        if let (Some(here), Some((there, then))) = (
            tx.metadata.location(),
            history.last_known_location(&tx.item_id, &tx.id)?,
        ) {
            let km = here.distance_km(&there);
            let hours = when.since(&then).num_milliseconds() as f64 / 3_600_000.0;
            let speed = if hours > 0.0 { km / hours } else if km > 1.0 { f64::INFINITY } else { 0.0 };
            if speed > cfg.max_speed_kmh {
                found.push(Anomaly {
                    kind: AnomalyKind::Geographic,
                    confidence: cfg.geographic_confidence,
                    detail: format!("item moved {km:.0} km at an implied {speed:.0} km/h"),
                });
            }
        }

        // price
        if let Some(avg) = history.average_price(&tx.item_id, &tx.id)?
            && avg > 0.0
        {
            let deviation = (tx.value as f64 - avg).abs() / avg;
            if deviation > cfg.price_deviation {
                let confidence =
                    (cfg.price_base_confidence + cfg.price_confidence_slope * deviation).min(0.99);
                found.push(Anomaly {
                    kind: AnomalyKind::Price,
                    confidence,
                    detail: format!(
                        "value {} deviates {:.0}% from historical average {avg:.0}",
                        tx.value,
                        deviation * 100.0
                    ),
                });
            }
        }

        // pattern: unknown counterparties moving a lot of value
        if tx.value > cfg.high_value_threshold
            && !history.has_relationship(&tx.sender, &tx.receiver, &tx.id)?
        {
            found.push(Anomaly {
                kind: AnomalyKind::NewRelationship,
                confidence: cfg.new_relationship_confidence,
                detail: format!(
                    "first transaction between {} and {} is worth {}",
                    tx.sender, tx.receiver, tx.value
                ),
            });
        }

        // pattern: same item churned
        let item_window_start = window_start(when, "repeat item window", cfg.repeat_item_window_hours)?;
        let repeats = history
            .item_transactions_since(&tx.item_id, &item_window_start, &tx.id)?
            + 1;
        if repeats > cfg.repeat_item_limit {
            found.push(Anomaly {
                kind: AnomalyKind::RepeatedItem,
                confidence: cfg.repeat_item_confidence,
                detail: format!(
                    "item {} transacted {repeats} times within {}h",
                    tx.item_id, cfg.repeat_item_window_hours
                ),
            });
        }

        // velocity
        let velocity_start = window_start(when, "velocity window", cfg.velocity_window_hours)?;
        let sent = history
            .sender_transactions_since(&tx.sender, &velocity_start, &tx.id)?
            + 1;
        if sent > cfg.velocity_limit {
            found.push(Anomaly {
                kind: AnomalyKind::Velocity,
                confidence: cfg.velocity_confidence,
                detail: format!(
                    "sender {} submitted {sent} transactions within {}h",
                    tx.sender, cfg.velocity_window_hours
                ),
            });
        }

        Ok(found)
    }
}
