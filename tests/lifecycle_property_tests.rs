//! Property-based tests for the settlement lifecycle
//!
//! These exercise invariants that must hold for any sequence of calls, not
//! just the scripted scenarios:
//!
//! 1. Trust scores stay within [0, 1] whatever outcomes and penalties land
//! 2. Missing evidence is reported iff a required field is absent or blank
//! 3. Oversized batches are refused regardless of the submitter's trust
//! 4. Terminal transactions never change again
//! 5. Receipt before dispatch always fails with PreconditionFailed
//! 6. Routed remedial quantities never exceed what was handed over
//!
//! Each case that touches storage opens its own sled database in a temp dir,
//! so case counts are kept modest.

use chrono::Duration;
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::tempdir;
use two_check::{
    SettlementConfig, SettlementError, SettlementService,
    config::{DisputeCategory, DisputeTypeConfig, TrustConfig},
    dispute::{Decision, EvidenceFields, route_decision},
    store::Store,
    timestamp::{ManualClock, TimeStamp},
    transaction::{ItemType, NewTransaction, TransactionState},
    trust::{PenaltyKind, TrustLedger},
    validation::missing_evidence,
};

#[derive(Debug, Clone)]
enum TrustOp {
    Outcome(bool),
    Penalty(PenaltyKind),
}

fn trust_op_strategy() -> impl Strategy<Value = TrustOp> {
    prop_oneof![
        any::<bool>().prop_map(TrustOp::Outcome),
        prop_oneof![
            Just(PenaltyKind::DisputeFault),
            Just(PenaltyKind::Return),
            Just(PenaltyKind::LateDelivery),
            Just(PenaltyKind::Timeout),
        ]
        .prop_map(TrustOp::Penalty),
    ]
}

/// Operations a caller may attempt on a single transaction between A and B.
#[derive(Debug, Clone)]
enum LifecycleOp {
    ConfirmSent(&'static str),
    ConfirmReceived(&'static str),
    RaiseDispute(&'static str),
    Resolve(Decision),
    Expire,
}

fn party_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("A"), Just("B")]
}

fn lifecycle_op_strategy() -> impl Strategy<Value = LifecycleOp> {
    prop_oneof![
        party_strategy().prop_map(LifecycleOp::ConfirmSent),
        party_strategy().prop_map(LifecycleOp::ConfirmReceived),
        party_strategy().prop_map(LifecycleOp::RaiseDispute),
        prop_oneof![
            Just(Decision::InFavorSender),
            Just(Decision::InFavorReceiver),
            Just(Decision::Split),
        ]
        .prop_map(LifecycleOp::Resolve),
        Just(LifecycleOp::Expire),
    ]
}

fn category_strategy() -> impl Strategy<Value = DisputeCategory> {
    prop_oneof![
        Just(DisputeCategory::NotReceived),
        Just(DisputeCategory::Defective),
        Just(DisputeCategory::QuantityMismatch),
        Just(DisputeCategory::Other),
    ]
}

fn draft(item: &str) -> NewTransaction {
    NewTransaction::new()
        .item(ItemType::Batch, item)
        .quantity(12)
        .value(2_400)
        .sender("A")
        .receiver("B")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: a trust score never leaves [0, 1] and counters stay consistent.
    #[test]
    fn prop_trust_score_is_bounded(ops in prop::collection::vec(trust_op_strategy(), 1..40)) {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join("trust.db")).unwrap();
        let ledger = TrustLedger::new(Store::new(Arc::new(db)), TrustConfig::default());

        for op in ops {
            let score = match op {
                TrustOp::Outcome(success) => ledger.record_outcome("party", success).unwrap(),
                TrustOp::Penalty(kind) => ledger.apply_penalty("party", kind).unwrap(),
            };
            prop_assert!((0.0..=1.0).contains(&score.score), "score {} out of range", score.score);
            prop_assert!(score.successful_transactions <= score.total_transactions);
        }
    }

    /// Property: a batch longer than the configured maximum is always refused,
    /// even from a submitter with a perfect score.
    #[test]
    fn prop_oversized_batches_are_refused(max in 1usize..12, extra in 1usize..6) {
        let dir = tempdir().unwrap();
        let db = Arc::new(sled::open(dir.path().join("batch.db")).unwrap());
        let mut config = SettlementConfig::default();
        config.batch.max_batch_size = max;
        let service = SettlementService::new(db, config);
        for _ in 0..4 {
            service.trust_ledger().record_outcome("hub", true).unwrap();
        }

        let drafts: Vec<_> = (0..max + extra).map(|i| draft(&format!("LOT-{i}"))).collect();
        let err = service.submit_batch(drafts, "hub").unwrap_err();
        let is_too_large = matches!(err, SettlementError::BatchTooLarge { .. });
        prop_assert!(is_too_large, "got {}", err);
        prop_assert!(service.get_all_transactions().unwrap().is_empty());
    }

    /// Property: once terminal, nothing changes the record; and receipt is
    /// refused with PreconditionFailed while dispatch is unconfirmed.
    #[test]
    fn prop_lifecycle_invariants(ops in prop::collection::vec(lifecycle_op_strategy(), 1..12)) {
        let dir = tempdir().unwrap();
        let db = Arc::new(sled::open(dir.path().join("lifecycle.db")).unwrap());
        let clock = Arc::new(ManualClock::new(TimeStamp::new_with(2025, 1, 1, 0, 0, 0).unwrap()));
        let service = SettlementService::new(db, SettlementConfig::default()).with_clock(clock.clone());
        let id = service.create_transaction(draft("LOT-1")).unwrap().id;

        let mut description = EvidenceFields::new();
        description.insert("description".into(), "short delivery".into());

        for op in ops {
            let before = service.get_transaction(&id).unwrap();

            let result = match &op {
                LifecycleOp::ConfirmSent(p) => service.confirm_sent(&id, p).map(|_| ()),
                LifecycleOp::ConfirmReceived(p) => service.confirm_received(&id, p).map(|_| ()),
                LifecycleOp::RaiseDispute(p) => service
                    .raise_dispute(&id, p, "NOT_RECEIVED", "missing", description.clone())
                    .map(|_| ()),
                LifecycleOp::Resolve(decision) => service
                    .resolve_dispute(&id, "arbiter", *decision, "", 0)
                    .map(|_| ()),
                LifecycleOp::Expire => {
                    clock.advance(Duration::hours(25));
                    service.check_timeout(&id).map(|_| ())
                }
            };

            let after = service.get_transaction(&id).unwrap();
            if before.state.is_terminal() {
                prop_assert_eq!(&before, &after, "terminal record changed by {:?}", op);
                if !matches!(op, LifecycleOp::Expire) {
                    prop_assert!(result.is_err(), "{:?} succeeded on a terminal record", op);
                }
            }

            if let LifecycleOp::ConfirmReceived("B") = op
                && !before.sender_confirmed
            {
                let precondition = matches!(result, Err(SettlementError::PreconditionFailed(_)));
                prop_assert!(precondition, "receipt before dispatch gave {:?}", result);
            }

            prop_assert!(!after.receiver_confirmed || after.sender_confirmed);
            prop_assert!(after.version >= before.version);
            if after.state == TransactionState::Validated && after.receiver_confirmed {
                prop_assert!(after.review.is_some());
            }
        }
    }
}

proptest! {
    /// Property: missing evidence is reported iff some required field is
    /// absent or blank, and every reported field is one of those.
    #[test]
    fn prop_missing_evidence_iff_field_unmet(
        required in prop::collection::btree_set("[a-z_]{3,10}", 0..5),
        supplied in prop::collection::btree_map("[a-z_]{3,10}", prop_oneof!["[a-z ]{1,12}", Just("  ".to_string())], 0..6),
    ) {
        let kind = DisputeTypeConfig {
            name: "CUSTOM".into(),
            category: DisputeCategory::Other,
            required_evidence: required.iter().cloned().collect(),
        };
        let missing = missing_evidence(&kind, &supplied);

        let unmet: Vec<String> = required
            .iter()
            .filter(|field| supplied.get(*field).is_none_or(|v| v.trim().is_empty()))
            .cloned()
            .collect();
        prop_assert_eq!(&missing, &unmet);
        prop_assert_eq!(missing.is_empty(), unmet.is_empty());
    }

    /// Property: routed action quantities never exceed the transferred quantity.
    #[test]
    fn prop_routed_quantity_is_bounded(
        decision in prop_oneof![
            Just(Decision::InFavorSender),
            Just(Decision::InFavorReceiver),
            Just(Decision::Split),
        ],
        category in category_strategy(),
        requested in 0u64..40,
        transferred in 1u64..30,
    ) {
        if let Ok((_, quantity)) = route_decision(decision, category, requested, transferred) {
            prop_assert!(quantity <= transferred);
        }
    }
}
