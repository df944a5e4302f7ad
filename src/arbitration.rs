//! Dispute operations: raising, evidence, arbitration.
//!
//! A transaction and its dispute always change in one store transaction, so
//! a DISPUTED record never exists without its dispute and a resolution never
//! lands without the transaction leaving DISPUTED.
use crate::config::DisputeCategory;
use crate::dispute::{
    self, Decision, Dispute, DisputeResolution, DisputeStatus, Evidence, EvidenceFields,
};
use crate::error::{Result, SettlementError};
use crate::events::SettlementEvent;
use crate::service::{SYSTEM_PARTY, SettlementService};
use crate::store::{TxRecords, TxResult, abort, dispute_index_key, dispute_key, transaction_key};
use crate::timestamp::TimeStamp;
use crate::transaction::{Transaction, TransactionState, Witness, WitnessType};
use crate::trust::PenaltyKind;
use crate::utils::{content_hash, is_sha256_hex};
use crate::validation::{ValidationResult, check_dispute_admissible};
use chrono::Utc;

/// Evidence type of the record derived from the claim fields.
const CLAIM_EVIDENCE: &str = "claim";

impl SettlementService {
    /// Contest a handoff. Both parties take a counted, unsuccessful outcome.
    pub fn raise_dispute(
        &self,
        transaction_id: &str,
        initiator: &str,
        dispute_type: &str,
        reason: &str,
        evidence: EvidenceFields,
    ) -> Result<Dispute> {
        let now = self.now();
        let dispute_id = Self::new_id("dispute_")?;
        let claim_record = Evidence {
            submitter: initiator.to_string(),
            evidence_type: CLAIM_EVIDENCE.to_string(),
            content_hash: encode_claim(&evidence)?,
            description: evidence
                .get("description")
                .cloned()
                .unwrap_or_else(|| reason.to_string()),
            timestamp: now.clone(),
        };

        let (tx, dispute) = self.store.transact(|records| {
            let mut tx: Transaction = records.fetch(&transaction_key(transaction_id))?;
            if !tx.is_party(initiator) {
                return Err(abort(SettlementError::unauthorized(
                    initiator,
                    "raise a dispute",
                    &tx.id,
                )));
            }
            let kind = check_dispute_admissible(&self.config, &tx, dispute_type, &evidence)
                .map_err(abort)?;

            tx.transition(TransactionState::Disputed, "raise a dispute")
                .map_err(abort)?;
            tx.under_review = false;
            tx.insert_witness(Witness::new(
                tx.id.clone(),
                initiator.to_string(),
                now.clone(),
                WitnessType::Dispute {
                    dispute_id: dispute_id.clone(),
                },
            ));

            let dispute = Dispute {
                id: dispute_id.clone(),
                transaction_id: tx.id.clone(),
                initiator: initiator.to_string(),
                dispute_type: dispute_type.to_string(),
                category: kind.category,
                reason: reason.to_string(),
                claim: evidence.clone(),
                evidence: vec![claim_record.clone()],
                status: DisputeStatus::Open,
                resolution: None,
                raised_at: now.clone(),
            };
            records.put(&transaction_key(&tx.id), &tx)?;
            stage_dispute(records, &dispute)?;
            Ok((tx, dispute))
        })?;

        self.trust.record_outcome(&tx.sender, false)?;
        self.trust.record_outcome(&tx.receiver, false)?;

        tracing::info!(
            transaction = %tx.id,
            dispute = %dispute.id,
            initiator,
            dispute_type,
            "dispute raised"
        );
        self.events.publish(SettlementEvent::DisputeRaised {
            transaction_id: tx.id.clone(),
            dispute_id: dispute.id.clone(),
            initiator: initiator.to_string(),
            dispute_type: dispute_type.to_string(),
        });
        Ok(dispute)
    }

    /// Dispute opened by the escalate timeout policy on behalf of the
    /// parties. No evidence is required.
    pub(crate) fn escalation_dispute(
        &self,
        tx: &Transaction,
        dispute_id: &str,
        category: DisputeCategory,
        defaulting_party: &str,
        now: &TimeStamp<Utc>,
    ) -> Dispute {
        Dispute {
            id: dispute_id.to_string(),
            transaction_id: tx.id.clone(),
            initiator: SYSTEM_PARTY.to_string(),
            dispute_type: self.config.timeouts.escalation_dispute_type.clone(),
            category,
            reason: format!("confirmation window elapsed waiting on {defaulting_party}"),
            claim: EvidenceFields::new(),
            evidence: vec![],
            status: DisputeStatus::Open,
            resolution: None,
            raised_at: now.clone(),
        }
    }

    /// Category of the configured escalation dispute type.
    pub(crate) fn escalation_category(&self) -> Result<DisputeCategory> {
        let name = &self.config.timeouts.escalation_dispute_type;
        self.config
            .dispute_type(name)
            .map(|kind| kind.category)
            .ok_or_else(|| SettlementError::InvalidDisputeType(name.clone()))
    }

    /// Attach a piece of evidence to an open dispute.
    pub fn submit_evidence(
        &self,
        transaction_id: &str,
        submitter: &str,
        evidence_type: &str,
        content_hash: &str,
        description: &str,
    ) -> Result<Dispute> {
        if !is_sha256_hex(content_hash) {
            return Err(SettlementError::InvalidInput(format!(
                "evidence hash {content_hash} is not a hex sha256 digest"
            )));
        }
        if evidence_type.trim().is_empty() {
            return Err(SettlementError::InvalidInput("evidence type is empty".into()));
        }

        let tx = self.get_transaction(transaction_id)?;
        if !tx.is_party(submitter) && !self.is_arbitrator(submitter) {
            return Err(SettlementError::unauthorized(submitter, "submit evidence", &tx.id));
        }

        let now = self.now();
        let (dispute, _) = self
            .store
            .update(&dispute_key(transaction_id), |d: &mut Dispute| {
                d.add_evidence(Evidence {
                    submitter: submitter.to_string(),
                    evidence_type: evidence_type.to_string(),
                    content_hash: content_hash.to_ascii_lowercase(),
                    description: description.to_string(),
                    timestamp: now.clone(),
                })
            })?;

        tracing::info!(
            transaction = transaction_id,
            dispute = %dispute.id,
            submitter,
            evidence_type,
            "evidence submitted"
        );
        Ok(dispute)
    }

    /// Arbitrate an open dispute.
    ///
    /// `action_quantity` is the quantity the remedy covers; 0 means the full
    /// transferred quantity for full-quantity actions.
    pub fn resolve_dispute(
        &self,
        transaction_id: &str,
        resolver: &str,
        decision: Decision,
        notes: &str,
        action_quantity: u64,
    ) -> Result<Dispute> {
        let tx = self.get_transaction(transaction_id)?;
        let listed = self.config.disputes.arbitrators.is_empty() || self.is_arbitrator(resolver);
        if tx.is_party(resolver) || !listed {
            return Err(SettlementError::unauthorized(resolver, "resolve a dispute", &tx.id));
        }

        let current = self.get_dispute(transaction_id)?;
        if !current.is_open() {
            return Err(SettlementError::DisputeNotOpen(transaction_id.to_string()));
        }
        let (required_action, quantity) =
            dispute::route_decision(decision, current.category, action_quantity, tx.quantity)?;
        let cancelled = dispute::cancels_transfer(decision, current.category);
        let (winner, loser) = dispute::parties(decision, &tx);

        let now = self.now();
        let deadline = if required_action == dispute::RequiredAction::None {
            None
        } else {
            Some(
                now.checked_plus(self.config.remedial_deadline()?)
                    .ok_or_else(|| {
                        SettlementError::InvalidInput(
                            "remedial deadline runs past the supported calendar".into(),
                        )
                    })?,
            )
        };
        let resolution = DisputeResolution {
            decision,
            winner,
            loser,
            required_action,
            action_quantity: quantity,
            action_deadline: deadline,
            action_completed: false,
            resulting_transfer_id: None,
            completed_at: None,
            notes: notes.to_string(),
            compensation_amount: dispute::compensation(decision, required_action, quantity, &tx),
            resolver: resolver.to_string(),
            resolved_at: now.clone(),
        };

        let outcome = if cancelled {
            TransactionState::Cancelled
        } else {
            TransactionState::Validated
        };
        // Closing the dispute is the exactly-once guard; the transaction moves
        // in the same commit.
        let (resolved, tx) = self.store.transact(|records| {
            let mut d: Dispute = records.fetch(&dispute_key(transaction_id))?;
            if !d.is_open() {
                return Err(abort(SettlementError::DisputeNotOpen(
                    transaction_id.to_string(),
                )));
            }
            d.status = DisputeStatus::Resolved;
            d.resolution = Some(resolution.clone());

            let mut tx: Transaction = records.fetch(&transaction_key(transaction_id))?;
            tx.transition(outcome, "resolve a dispute").map_err(abort)?;
            tx.insert_witness(Witness::new(
                tx.id.clone(),
                resolver.to_string(),
                now.clone(),
                WitnessType::Resolution {
                    dispute_id: d.id.clone(),
                    cancelled,
                },
            ));

            records.put(&dispute_key(transaction_id), &d)?;
            records.put(&transaction_key(transaction_id), &tx)?;
            Ok((d, tx))
        })?;

        if let Some(loser) = &resolution.loser {
            self.trust.apply_penalty(loser, PenaltyKind::DisputeFault)?;
            if required_action.moves_goods_back() {
                self.trust.apply_penalty(loser, PenaltyKind::Return)?;
            }
        }

        tracing::info!(
            transaction = %tx.id,
            dispute = %resolved.id,
            decision = decision.as_str(),
            action = required_action.as_str(),
            quantity,
            state = %tx.state,
            "dispute resolved"
        );
        self.events.publish(SettlementEvent::DisputeResolved {
            transaction_id: tx.id.clone(),
            dispute_id: resolved.id.clone(),
            decision,
            required_action,
            action_quantity: quantity,
            cancelled,
        });
        if !cancelled {
            self.events.publish(SettlementEvent::TransactionValidated {
                transaction_id: tx.id.clone(),
                sender: tx.sender.clone(),
                receiver: tx.receiver.clone(),
                item_id: tx.item_id.clone(),
                quantity: tx.quantity,
                auto_approved: false,
                via_arbitration: true,
            });
        }
        Ok(resolved)
    }

    pub fn get_dispute(&self, transaction_id: &str) -> Result<Dispute> {
        let key = dispute_key(transaction_id);
        self.store.get(&key)?.ok_or(SettlementError::NotFound(key))
    }

    /// `None` while the dispute is still open.
    pub fn get_dispute_resolution(&self, transaction_id: &str) -> Result<Option<DisputeResolution>> {
        Ok(self.get_dispute(transaction_id)?.resolution)
    }

    /// Look a dispute up by its own id.
    pub fn get_dispute_by_id(&self, dispute_id: &str) -> Result<Dispute> {
        let index = dispute_index_key(dispute_id);
        let transaction_id: String = self
            .store
            .get(&index)?
            .ok_or(SettlementError::NotFound(index))?;
        self.get_dispute(&transaction_id)
    }

    /// Dry run of [`Self::raise_dispute`]'s admission checks.
    pub fn validate_dispute(
        &self,
        transaction_id: &str,
        dispute_type: &str,
        evidence: &EvidenceFields,
    ) -> Result<ValidationResult> {
        let tx = self.get_transaction(transaction_id)?;
        Ok(self.validator.validate_dispute(&tx, dispute_type, evidence))
    }

    pub(crate) fn is_arbitrator(&self, party: &str) -> bool {
        self.config.disputes.arbitrators.iter().any(|a| a == party)
    }
}

/// Write a dispute and its id index inside a transaction.
pub(crate) fn stage_dispute(records: &TxRecords<'_>, dispute: &Dispute) -> TxResult<()> {
    records.put(&dispute_key(&dispute.transaction_id), dispute)?;
    records.put(&dispute_index_key(&dispute.id), &dispute.transaction_id)
}

fn encode_claim(claim: &EvidenceFields) -> Result<String> {
    let cbor = minicbor::to_vec(claim).map_err(|e| SettlementError::Encode(e.to_string()))?;
    Ok(content_hash(&cbor))
}
