//! Service layer API for the handoff lifecycle
use crate::config::{SettlementConfig, TimeoutPolicy};
use crate::error::{Result, SettlementError};
use crate::events::{EventBus, SettlementEvent, SettlementListener};
use crate::arbitration::stage_dispute;
use crate::store::{RecordBatch, Store, TRANSACTION_PREFIX, abort, flag_key, transaction_key};
use crate::timestamp::{Clock, SystemClock, TimeStamp};
use crate::transaction::{
    ItemType, Metadata, NewTransaction, ReviewOutcome, Transaction, TransactionFilter,
    TransactionState, Witness, WitnessType,
};
use crate::trust::{PenaltyKind, TrustLedger, TrustScore};
use crate::utils::new_uuid_to_bech32;
use crate::validation::{HistoryLookup, LedgerHistory, ValidationEngine, ValidationResult};
use chrono::Utc;
use std::sync::Arc;

/// Party recorded on witnesses and disputes the engine creates by itself.
pub const SYSTEM_PARTY: &str = "system";

/// What a timeout check did to a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutOutcome {
    /// The confirmation window is still open.
    NotDue,
    /// Nothing left to time out (terminal or already in dispute).
    Settled(TransactionState),
    TimedOut {
        defaulting_party: String,
        escalated: bool,
    },
}

pub struct SettlementService {
    pub(crate) store: Store,
    pub(crate) config: Arc<SettlementConfig>,
    pub(crate) trust: TrustLedger,
    pub(crate) validator: ValidationEngine,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: EventBus,
}

impl SettlementService {
    pub fn new(instance: Arc<sled::Db>, config: SettlementConfig) -> Self {
        let store = Store::new(instance);
        let config = Arc::new(config);
        let trust = TrustLedger::new(store.clone(), config.trust.clone());
        let history: Arc<dyn HistoryLookup> = Arc::new(LedgerHistory::new(store.clone()));
        let validator = ValidationEngine::new(config.clone(), history, trust.clone());

        Self {
            store,
            config,
            trust,
            validator,
            clock: Arc::new(SystemClock),
            events: EventBus::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the ledger-backed history with an external read model.
    pub fn with_history(mut self, history: Arc<dyn HistoryLookup>) -> Self {
        self.validator = ValidationEngine::new(self.config.clone(), history, self.trust.clone());
        self
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    pub fn trust_ledger(&self) -> &TrustLedger {
        &self.trust
    }

    pub fn validator(&self) -> &ValidationEngine {
        &self.validator
    }

    pub fn subscribe(&self, listener: Arc<dyn SettlementListener>) {
        self.events.subscribe(listener);
    }

    pub(crate) fn now(&self) -> TimeStamp<Utc> {
        self.clock.now()
    }

    pub(crate) fn new_id(hrp: &str) -> Result<String> {
        new_uuid_to_bech32(hrp).map_err(|e| SettlementError::Encode(e.to_string()))
    }

    /// Open a handoff under a freshly generated id.
    pub fn create_transaction(&self, draft: NewTransaction) -> Result<Transaction> {
        let id = Self::new_id("tx_")?;
        self.insert_draft(id, draft)
    }

    /// Open a handoff under a caller supplied id, with metadata as JSON.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_transaction(
        &self,
        transaction_id: &str,
        sender: &str,
        receiver: &str,
        item_type: ItemType,
        item_id: &str,
        quantity: u64,
        value: i64,
        metadata_json: &str,
    ) -> Result<Transaction> {
        if transaction_id.trim().is_empty() {
            return Err(SettlementError::InvalidInput("transaction id is empty".into()));
        }
        let draft = NewTransaction::new()
            .item(item_type, item_id)
            .quantity(quantity)
            .value(value)
            .sender(sender)
            .receiver(receiver)
            .metadata(Metadata::from_json(metadata_json)?);
        self.insert_draft(transaction_id.to_string(), draft)
    }

    fn finalise(&self, id: String, draft: NewTransaction) -> Result<Transaction> {
        let window = match (&draft.sender, &draft.receiver) {
            (Some(sender), Some(receiver)) => self.config.timeout_for(sender, receiver)?,
            _ => self.config.timeout_for("", "")?,
        };
        draft.validate_and_finalise(id, self.now(), window)
    }

    fn insert_draft(&self, id: String, draft: NewTransaction) -> Result<Transaction> {
        let tx = self.finalise(id, draft)?;
        self.store.insert_new(&transaction_key(&tx.id), &tx)?;

        tracing::info!(
            transaction = %tx.id,
            sender = %tx.sender,
            receiver = %tx.receiver,
            item = %tx.item_id,
            timeout_at = %tx.timeout_at,
            "transaction initiated"
        );
        Ok(tx)
    }

    /// Open several handoffs at once. Nothing is written unless the whole
    /// batch passes the batch gate and every member finalises.
    pub fn submit_batch(
        &self,
        drafts: Vec<NewTransaction>,
        submitter_id: &str,
    ) -> Result<Vec<Transaction>> {
        self.validator.validate_batch_operation(&drafts, submitter_id)?;

        let records = drafts
            .into_iter()
            .map(|draft| self.finalise(Self::new_id("tx_")?, draft))
            .collect::<Result<Vec<_>>>()?;

        let mut batch = RecordBatch::default();
        for tx in &records {
            batch.put(&transaction_key(&tx.id), tx)?;
        }
        self.store.apply(batch)?;

        tracing::info!(submitter = submitter_id, count = records.len(), "batch initiated");
        Ok(records)
    }

    /// Sender attests dispatch.
    pub fn confirm_sent(&self, transaction_id: &str, caller: &str) -> Result<Transaction> {
        let now = self.now();
        let (tx, _) = self
            .store
            .update(&transaction_key(transaction_id), |tx: &mut Transaction| {
                if tx.sender != caller {
                    return Err(SettlementError::unauthorized(caller, "confirm dispatch", &tx.id));
                }
                if tx.state != TransactionState::Initiated {
                    return Err(SettlementError::invalid_state(&tx.id, tx.state, "confirm dispatch"));
                }
                tx.transition(TransactionState::Sent, "confirm dispatch")?;
                tx.sender_confirmed = true;
                tx.sender_confirmed_at = Some(now.clone());
                tx.insert_witness(Witness::new(
                    tx.id.clone(),
                    caller.to_string(),
                    now.clone(),
                    WitnessType::Dispatch,
                ));
                Ok(())
            })?;

        tracing::info!(transaction = %tx.id, sender = caller, "dispatch confirmed");
        Ok(tx)
    }

    /// Receiver attests receipt; the handoff settles.
    ///
    /// The auto-approval verdict is recorded on the transaction and in the
    /// event. A blocked verdict does not stop settlement; it tells observers
    /// to hold the goods for review.
    pub fn confirm_received(&self, transaction_id: &str, caller: &str) -> Result<Transaction> {
        let key = transaction_key(transaction_id);
        let now = self.now();

        // Judge the record as it will look once settled. Only confirmation
        // flags and timestamps change on this path, so the verdict holds for
        // whichever version the swap lands on.
        let current: Transaction = self
            .store
            .get(&key)?
            .ok_or_else(|| SettlementError::NotFound(key.clone()))?;
        let verdict = if current.receiver == caller && !current.state.is_terminal() {
            let mut preview = current.clone();
            preview.sender_confirmed = true;
            preview.receiver_confirmed = true;
            preview.receiver_confirmed_at = Some(now.clone());
            Some(self.validator.validate_for_auto_approval(&preview, &now)?)
        } else {
            None
        };

        let (tx, _) = self.store.update(&key, |tx: &mut Transaction| {
            if tx.receiver != caller {
                return Err(SettlementError::unauthorized(caller, "confirm receipt", &tx.id));
            }
            if !tx.sender_confirmed {
                return Err(SettlementError::PreconditionFailed(format!(
                    "sender has not confirmed dispatch of {}",
                    tx.id
                )));
            }
            if tx.state != TransactionState::Sent {
                return Err(SettlementError::invalid_state(&tx.id, tx.state, "confirm receipt"));
            }
            tx.transition(TransactionState::Validated, "confirm receipt")?;
            tx.receiver_confirmed = true;
            tx.receiver_confirmed_at = Some(now.clone());
            tx.review = verdict.as_ref().map(|v| ReviewOutcome {
                auto_approved: v.is_valid,
                reason: v.reason.clone(),
                required_actions: v.required_actions.clone(),
                confidence: v.confidence,
            });
            tx.insert_witness(Witness::new(
                tx.id.clone(),
                caller.to_string(),
                now.clone(),
                WitnessType::Receipt,
            ));
            Ok(())
        })?;

        self.trust.record_outcome(&tx.sender, true)?;
        self.trust.record_outcome(&tx.receiver, true)?;

        let auto_approved = tx.review.as_ref().is_some_and(|r| r.auto_approved);
        tracing::info!(transaction = %tx.id, receiver = caller, auto_approved, "transaction validated");
        self.events.publish(SettlementEvent::TransactionValidated {
            transaction_id: tx.id.clone(),
            sender: tx.sender.clone(),
            receiver: tx.receiver.clone(),
            item_id: tx.item_id.clone(),
            quantity: tx.quantity,
            auto_approved,
            via_arbitration: false,
        });
        Ok(tx)
    }

    /// Apply the configured timeout policy if the confirmation window has
    /// elapsed. Safe to call any number of times from any number of threads;
    /// only the caller whose commit lands applies the penalty.
    pub fn check_timeout(&self, transaction_id: &str) -> Result<TimeoutOutcome> {
        let key = transaction_key(transaction_id);
        let now = self.now();

        let current: Transaction = self
            .store
            .get(&key)?
            .ok_or_else(|| SettlementError::NotFound(key.clone()))?;
        if let Some(outcome) = Self::timeout_noop(&current, &now) {
            return Ok(outcome);
        }

        let policy = self.config.timeouts.policy;
        let escalated = policy == TimeoutPolicy::Escalate;
        let escalation = if escalated {
            Some((Self::new_id("dispute_")?, self.escalation_category()?))
        } else {
            None
        };

        let (tx, outcome, dispute) = self.store.transact(|records| {
            let mut tx: Transaction = records.fetch(&key)?;
            if let Some(outcome) = Self::timeout_noop(&tx, &now) {
                return Ok((tx, outcome, None));
            }
            let defaulting_party = tx.awaiting().unwrap_or(tx.sender.as_str()).to_string();

            if escalated {
                tx.transition(TransactionState::Disputed, "escalate a timeout")
                    .map_err(abort)?;
            } else {
                tx.transition(TransactionState::TimedOut, "time out")
                    .map_err(abort)?;
                tx.under_review = policy == TimeoutPolicy::Review;
            }
            tx.insert_witness(Witness::new(
                tx.id.clone(),
                SYSTEM_PARTY.to_string(),
                now.clone(),
                WitnessType::Timeout { escalated },
            ));

            let dispute = match &escalation {
                Some((dispute_id, category)) => {
                    let dispute =
                        self.escalation_dispute(&tx, dispute_id, *category, &defaulting_party, &now);
                    stage_dispute(records, &dispute)?;
                    Some(dispute)
                }
                None => None,
            };
            records.put(&key, &tx)?;
            Ok((
                tx,
                TimeoutOutcome::TimedOut {
                    defaulting_party,
                    escalated,
                },
                dispute,
            ))
        })?;

        if let TimeoutOutcome::TimedOut {
            defaulting_party, ..
        } = &outcome
        {
            self.trust.apply_penalty(defaulting_party, PenaltyKind::Timeout)?;
            tracing::warn!(
                transaction = %tx.id,
                defaulting_party = %defaulting_party,
                policy = ?policy,
                "confirmation window elapsed"
            );
            self.events.publish(SettlementEvent::TransactionTimedOut {
                transaction_id: tx.id.clone(),
                defaulting_party: defaulting_party.clone(),
                escalated,
            });
        }
        if let Some(dispute) = dispute {
            tracing::info!(transaction = %tx.id, dispute = %dispute.id, "timeout escalated to dispute");
            self.events.publish(SettlementEvent::DisputeRaised {
                transaction_id: tx.id.clone(),
                dispute_id: dispute.id,
                initiator: SYSTEM_PARTY.to_string(),
                dispute_type: dispute.dispute_type,
            });
        }
        Ok(outcome)
    }

    fn timeout_noop(tx: &Transaction, now: &TimeStamp<Utc>) -> Option<TimeoutOutcome> {
        if tx.state.is_terminal() || tx.state == TransactionState::Disputed {
            return Some(TimeoutOutcome::Settled(tx.state));
        }
        if !tx.is_overdue(now) {
            return Some(TimeoutOutcome::NotDue);
        }
        None
    }

    /// Run [`Self::check_timeout`] over every open transaction. Returns the
    /// ones this call timed out.
    pub fn sweep_timeouts(&self) -> Result<Vec<(String, TimeoutOutcome)>> {
        let now = self.now();
        let mut expired = vec![];
        for tx in self.get_all_transactions()? {
            if Self::timeout_noop(&tx, &now).is_some() {
                continue;
            }
            let outcome = self.check_timeout(&tx.id)?;
            if matches!(outcome, TimeoutOutcome::TimedOut { .. }) {
                expired.push((tx.id, outcome));
            }
        }
        Ok(expired)
    }

    pub fn get_transaction(&self, transaction_id: &str) -> Result<Transaction> {
        let key = transaction_key(transaction_id);
        self.store
            .get(&key)?
            .ok_or(SettlementError::NotFound(key))
    }

    pub fn get_all_transactions(&self) -> Result<Vec<Transaction>> {
        self.store.scan(TRANSACTION_PREFIX)
    }

    pub fn query_transactions(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>> {
        Ok(self
            .get_all_transactions()?
            .into_iter()
            .filter(|tx| filter.matches(tx))
            .collect())
    }

    /// Every transaction the party sends or receives.
    pub fn query_by_party(&self, party_id: &str) -> Result<Vec<Transaction>> {
        self.query_transactions(&TransactionFilter {
            party: Some(party_id.to_string()),
            ..Default::default()
        })
    }

    /// Transactions waiting on the party's confirmation.
    pub fn query_pending(&self, party_id: &str) -> Result<Vec<Transaction>> {
        Ok(self
            .get_all_transactions()?
            .into_iter()
            .filter(|tx| tx.awaiting() == Some(party_id))
            .collect())
    }

    /// Run the auto-approval gate against a stored transaction without
    /// changing it.
    pub fn validate_transaction(&self, transaction_id: &str) -> Result<ValidationResult> {
        let tx = self.get_transaction(transaction_id)?;
        self.validator.validate_for_auto_approval(&tx, &self.now())
    }

    pub fn get_trust_score(&self, party_id: &str) -> Result<TrustScore> {
        self.trust.get_trust_score(party_id)
    }

    /// Bar a party or item (stolen goods, sanctions) from auto-approval.
    pub fn flag_ineligible(&self, id: &str, reason: &str) -> Result<()> {
        if id.trim().is_empty() || reason.trim().is_empty() {
            return Err(SettlementError::InvalidInput("flag needs an id and a reason".into()));
        }
        self.store.put(&flag_key(id), &reason.to_string())?;
        tracing::info!(id, reason, "flagged ineligible");
        Ok(())
    }

    /// Returns whether a flag was present.
    pub fn clear_flag(&self, id: &str) -> Result<bool> {
        let cleared = self.store.remove(&flag_key(id))?;
        if cleared {
            tracing::info!(id, "flag cleared");
        }
        Ok(cleared)
    }
}
