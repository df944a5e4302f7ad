//! Outstanding work per party: confirmations owed and remedial actions
//! ordered by arbitration.
use crate::dispute::{Dispute, DisputeResolution, RequiredAction};
use crate::error::{Result, SettlementError};
use crate::service::SettlementService;
use crate::store::{DISPUTE_PREFIX, dispute_key};
use crate::timestamp::TimeStamp;
use crate::trust::PenaltyKind;
use chrono::Utc;

#[derive(Debug, Clone, PartialEq)]
pub enum PendingAction {
    ConfirmDispatch {
        transaction_id: String,
        counterparty: String,
        deadline: TimeStamp<Utc>,
    },
    ConfirmReceipt {
        transaction_id: String,
        counterparty: String,
        deadline: TimeStamp<Utc>,
    },
    Remedial {
        dispute_id: String,
        transaction_id: String,
        action: RequiredAction,
        quantity: u64,
        counterparty: String,
        deadline: Option<TimeStamp<Utc>>,
    },
}

impl PendingAction {
    pub fn transaction_id(&self) -> &str {
        match self {
            Self::ConfirmDispatch { transaction_id, .. }
            | Self::ConfirmReceipt { transaction_id, .. }
            | Self::Remedial { transaction_id, .. } => transaction_id,
        }
    }
}

impl SettlementService {
    /// Confirmations the party owes, then remedial actions it has to carry
    /// out.
    pub fn get_pending_actions(&self, party_id: &str) -> Result<Vec<PendingAction>> {
        let mut actions: Vec<PendingAction> = self
            .query_pending(party_id)?
            .into_iter()
            .map(|tx| {
                if tx.sender == party_id {
                    PendingAction::ConfirmDispatch {
                        transaction_id: tx.id,
                        counterparty: tx.receiver,
                        deadline: tx.timeout_at,
                    }
                } else {
                    PendingAction::ConfirmReceipt {
                        transaction_id: tx.id,
                        counterparty: tx.sender,
                        deadline: tx.timeout_at,
                    }
                }
            })
            .collect();

        let disputes: Vec<Dispute> = self.store.scan(DISPUTE_PREFIX)?;
        for dispute in disputes {
            let Some(resolution) = dispute.resolution.as_ref().filter(|r| r.has_pending_action())
            else {
                continue;
            };
            let tx = self.get_transaction(&dispute.transaction_id)?;
            if resolution.responsible_party(&tx) != Some(party_id) {
                continue;
            }
            let counterparty = if tx.sender == party_id {
                tx.receiver.clone()
            } else {
                tx.sender.clone()
            };
            actions.push(PendingAction::Remedial {
                dispute_id: dispute.id.clone(),
                transaction_id: tx.id.clone(),
                action: resolution.required_action,
                quantity: resolution.action_quantity,
                counterparty,
                deadline: resolution.action_deadline.clone(),
            });
        }
        Ok(actions)
    }

    /// Record that the remedy ordered by a dispute was carried out, linking
    /// the transfer that did it. Completes at most once.
    pub fn mark_action_completed(
        &self,
        dispute_id: &str,
        resulting_transfer_id: &str,
    ) -> Result<DisputeResolution> {
        if resulting_transfer_id.trim().is_empty() {
            return Err(SettlementError::InvalidInput(
                "resulting transfer id is empty".into(),
            ));
        }

        let dispute = self.get_dispute_by_id(dispute_id)?;
        let tx = self.get_transaction(&dispute.transaction_id)?;
        let now = self.now();

        let (dispute, resolution) =
            self.store
                .update(&dispute_key(&tx.id), |d: &mut Dispute| {
                    let Some(resolution) = d.resolution.as_mut() else {
                        return Err(SettlementError::invalid_state(
                            &tx.id,
                            tx.state,
                            "complete a remedial action",
                        ));
                    };
                    if resolution.required_action == RequiredAction::None {
                        return Err(SettlementError::invalid_state(
                            &tx.id,
                            tx.state,
                            "complete a remedial action",
                        ));
                    }
                    if resolution.action_completed {
                        return Err(SettlementError::AlreadyCompleted(d.id.clone()));
                    }
                    resolution.action_completed = true;
                    resolution.resulting_transfer_id = Some(resulting_transfer_id.to_string());
                    resolution.completed_at = Some(now.clone());
                    Ok(resolution.clone())
                })?;

        let late = resolution.is_overdue(&now);
        if late && let Some(responsible) = resolution.responsible_party(&tx) {
            self.trust.apply_penalty(responsible, PenaltyKind::LateDelivery)?;
        }

        tracing::info!(
            dispute = %dispute.id,
            transaction = %tx.id,
            action = resolution.required_action.as_str(),
            resulting_transfer = resulting_transfer_id,
            late,
            "remedial action completed"
        );
        Ok(resolution)
    }
}
