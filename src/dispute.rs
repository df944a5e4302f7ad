//! Dispute records, arbitration decisions and the remedial actions they imply.
//!
//! A transaction carries at most one dispute, stored under
//! `dispute:<transaction id>`. Routing a decision to a remedial action is a
//! pure table lookup on the dispute's [`DisputeCategory`], kept here so it can
//! be tested without a store.
use crate::config::DisputeCategory;
use crate::error::{Result, SettlementError};
use crate::timestamp::TimeStamp;
use crate::transaction::Transaction;
use chrono::Utc;
use std::collections::BTreeMap;

/// Structured claim fields handed in when raising a dispute
/// (`description`, `photo_hash`, `received_quantity`, ...).
pub type EvidenceFields = BTreeMap<String, String>;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeStatus {
    #[n(0)]
    Open,
    #[n(1)]
    Resolved,
}

impl DisputeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Resolved => "RESOLVED",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    #[n(0)]
    InFavorSender,
    #[n(1)]
    InFavorReceiver,
    #[n(2)]
    Split,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InFavorSender => "IN_FAVOR_SENDER",
            Self::InFavorReceiver => "IN_FAVOR_RECEIVER",
            Self::Split => "SPLIT",
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "IN_FAVOR_SENDER" => Ok(Self::InFavorSender),
            "IN_FAVOR_RECEIVER" => Ok(Self::InFavorReceiver),
            "SPLIT" => Ok(Self::Split),
            other => Err(SettlementError::InvalidInput(format!("unknown decision {other}"))),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAction {
    #[n(0)]
    None,
    #[n(1)]
    Return,
    #[n(2)]
    Resend,
    #[n(3)]
    Replace,
    #[n(4)]
    ResendPartial,
}

impl RequiredAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Return => "RETURN",
            Self::Resend => "RESEND",
            Self::Replace => "REPLACE",
            Self::ResendPartial => "RESEND_PARTIAL",
        }
    }

    /// Actions whose loser also carries the return-goods penalty.
    pub fn moves_goods_back(&self) -> bool {
        matches!(self, Self::Return | Self::Replace)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Evidence {
    #[n(0)]
    pub submitter: String,
    #[n(1)]
    pub evidence_type: String,
    #[n(2)]
    pub content_hash: String, // sha256 hex of the off-ledger artefact
    #[n(3)]
    pub description: String,
    #[n(4)]
    pub timestamp: TimeStamp<Utc>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct DisputeResolution {
    #[n(0)]
    pub decision: Decision,
    #[n(1)]
    pub winner: Option<String>,
    #[n(2)]
    pub loser: Option<String>,
    #[n(3)]
    pub required_action: RequiredAction,
    #[n(4)]
    pub action_quantity: u64,
    #[n(5)]
    pub action_deadline: Option<TimeStamp<Utc>>,
    #[n(6)]
    pub action_completed: bool,
    #[n(7)]
    pub resulting_transfer_id: Option<String>,
    #[n(8)]
    pub completed_at: Option<TimeStamp<Utc>>,
    #[n(9)]
    pub notes: String,
    #[n(10)]
    pub compensation_amount: i64,
    #[n(11)]
    pub resolver: String,
    #[n(12)]
    pub resolved_at: TimeStamp<Utc>,
}

impl DisputeResolution {
    pub fn has_pending_action(&self) -> bool {
        self.required_action != RequiredAction::None && !self.action_completed
    }

    /// Party expected to carry out the remedial action. Goods go back from
    /// the winner on RETURN; every other action falls on the loser, or on the
    /// sender when a split has no loser.
    pub fn responsible_party<'a>(&'a self, tx: &'a Transaction) -> Option<&'a str> {
        match self.required_action {
            RequiredAction::None => None,
            RequiredAction::Return => self.winner.as_deref(),
            _ => Some(self.loser.as_deref().unwrap_or(&tx.sender)),
        }
    }

    pub fn is_overdue(&self, at: &TimeStamp<Utc>) -> bool {
        self.action_deadline.as_ref().is_some_and(|deadline| at > deadline)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Dispute {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub transaction_id: String,
    #[n(2)]
    pub initiator: String,
    #[n(3)]
    pub dispute_type: String,
    #[n(4)]
    pub category: DisputeCategory, // snapshot of the taxonomy at raise time
    #[n(5)]
    pub reason: String,
    #[n(6)]
    pub claim: EvidenceFields,
    #[n(7)]
    pub evidence: Vec<Evidence>,
    #[n(8)]
    pub status: DisputeStatus,
    #[n(9)]
    pub resolution: Option<DisputeResolution>,
    #[n(10)]
    pub raised_at: TimeStamp<Utc>,
}

impl Dispute {
    pub fn is_open(&self) -> bool {
        self.status == DisputeStatus::Open
    }

    pub fn add_evidence(&mut self, evidence: Evidence) -> Result<()> {
        if !self.is_open() {
            return Err(SettlementError::DisputeNotOpen(self.transaction_id.clone()));
        }
        self.evidence.push(evidence);
        Ok(())
    }
}

/// Map an arbitration decision to the remedial action it requires and the
/// quantity that action covers.
///
/// Full-quantity actions take the transaction quantity when `quantity` is 0.
pub fn route_decision(
    decision: Decision,
    category: DisputeCategory,
    quantity: u64,
    tx_quantity: u64,
) -> Result<(RequiredAction, u64)> {
    let full = if quantity == 0 { tx_quantity } else { quantity };

    let routed = match (decision, category) {
        (Decision::InFavorSender, DisputeCategory::NotReceived) => (RequiredAction::Return, full),
        (Decision::InFavorSender, _) => (RequiredAction::None, 0),
        (Decision::InFavorReceiver, DisputeCategory::Defective) => (RequiredAction::Replace, full),
        (Decision::InFavorReceiver, DisputeCategory::NotReceived) => (RequiredAction::Resend, full),
        (Decision::InFavorReceiver, DisputeCategory::QuantityMismatch) => {
            if quantity == 0 {
                return Err(SettlementError::InvalidInput(
                    "a quantity mismatch resolved for the receiver needs a shortfall quantity".into(),
                ));
            }
            (RequiredAction::ResendPartial, quantity)
        }
        (Decision::InFavorReceiver, DisputeCategory::Other) => (RequiredAction::None, 0),
        (Decision::Split, _) if quantity > 0 => (RequiredAction::ResendPartial, quantity),
        (Decision::Split, _) => (RequiredAction::None, 0),
    };

    if routed.1 > tx_quantity {
        return Err(SettlementError::InvalidInput(format!(
            "action quantity {} exceeds transferred quantity {tx_quantity}",
            routed.1
        )));
    }
    Ok(routed)
}

/// Whether the resolution undoes the handoff instead of settling it.
pub fn cancels_transfer(decision: Decision, category: DisputeCategory) -> bool {
    decision == Decision::InFavorReceiver && category == DisputeCategory::NotReceived
}

/// Value owed for the part of the handoff that is made good by the remedy.
pub fn compensation(
    decision: Decision,
    action: RequiredAction,
    action_quantity: u64,
    tx: &Transaction,
) -> i64 {
    match (decision, action) {
        (_, RequiredAction::ResendPartial) if tx.quantity > 0 => {
            let owed = tx.value as i128 * action_quantity as i128 / tx.quantity as i128;
            owed as i64
        }
        (Decision::Split, RequiredAction::None) => tx.value / 2,
        _ => 0,
    }
}

/// Winner and loser of a decision; a split has neither.
pub fn parties(decision: Decision, tx: &Transaction) -> (Option<String>, Option<String>) {
    match decision {
        Decision::InFavorSender => (Some(tx.sender.clone()), Some(tx.receiver.clone())),
        Decision::InFavorReceiver => (Some(tx.receiver.clone()), Some(tx.sender.clone())),
        Decision::Split => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{ItemType, NewTransaction};
    use chrono::Duration;

    fn tx(quantity: u64, value: i64) -> Transaction {
        NewTransaction::new()
            .item(ItemType::Material, "STEEL-COIL-9")
            .quantity(quantity)
            .value(value)
            .sender("mill")
            .receiver("press-shop")
            .validate_and_finalise("tx_1".into(), TimeStamp::new(), Duration::hours(24))
            .unwrap()
    }

    #[test]
    fn decision_table() {
        use DisputeCategory::*;
        use RequiredAction as A;

        let cases = [
            (Decision::InFavorSender, NotReceived, 0, A::Return, 10),
            (Decision::InFavorSender, Defective, 0, A::None, 0),
            (Decision::InFavorSender, QuantityMismatch, 3, A::None, 0),
            (Decision::InFavorReceiver, Defective, 0, A::Replace, 10),
            (Decision::InFavorReceiver, Defective, 4, A::Replace, 4),
            (Decision::InFavorReceiver, NotReceived, 0, A::Resend, 10),
            (Decision::InFavorReceiver, QuantityMismatch, 3, A::ResendPartial, 3),
            (Decision::InFavorReceiver, Other, 0, A::None, 0),
            (Decision::Split, Defective, 2, A::ResendPartial, 2),
            (Decision::Split, NotReceived, 0, A::None, 0),
        ];
        for (decision, category, qty, action, expected_qty) in cases {
            assert_eq!(
                route_decision(decision, category, qty, 10).unwrap(),
                (action, expected_qty),
                "{decision:?} / {category:?}"
            );
        }
    }

    #[test]
    fn partial_resend_needs_a_quantity() {
        let err = route_decision(Decision::InFavorReceiver, DisputeCategory::QuantityMismatch, 0, 10)
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidInput(_)));

        let err = route_decision(Decision::Split, DisputeCategory::Defective, 11, 10).unwrap_err();
        assert!(matches!(err, SettlementError::InvalidInput(_)));
    }

    #[test]
    fn compensation_is_proportional() {
        let tx = tx(10, 5_000);
        assert_eq!(compensation(Decision::InFavorReceiver, RequiredAction::ResendPartial, 3, &tx), 1_500);
        assert_eq!(compensation(Decision::Split, RequiredAction::None, 0, &tx), 2_500);
        assert_eq!(compensation(Decision::InFavorReceiver, RequiredAction::Resend, 10, &tx), 0);
    }

    #[test]
    fn only_receiver_wins_on_missing_goods_cancel() {
        assert!(cancels_transfer(Decision::InFavorReceiver, DisputeCategory::NotReceived));
        assert!(!cancels_transfer(Decision::InFavorSender, DisputeCategory::NotReceived));
        assert!(!cancels_transfer(Decision::InFavorReceiver, DisputeCategory::Defective));
    }

    #[test]
    fn responsibility_follows_the_action() {
        let tx = tx(10, 5_000);
        let (winner, loser) = parties(Decision::InFavorSender, &tx);
        let mut resolution = DisputeResolution {
            decision: Decision::InFavorSender,
            winner,
            loser,
            required_action: RequiredAction::Return,
            action_quantity: 10,
            action_deadline: None,
            action_completed: false,
            resulting_transfer_id: None,
            completed_at: None,
            notes: String::new(),
            compensation_amount: 0,
            resolver: "arb".into(),
            resolved_at: TimeStamp::new(),
        };
        assert_eq!(resolution.responsible_party(&tx), Some("mill"));

        resolution.required_action = RequiredAction::Replace;
        assert_eq!(resolution.responsible_party(&tx), Some("press-shop"));

        resolution.winner = None;
        resolution.loser = None;
        resolution.required_action = RequiredAction::ResendPartial;
        assert_eq!(resolution.responsible_party(&tx), Some("mill"));
        assert!(resolution.has_pending_action());
    }
}
