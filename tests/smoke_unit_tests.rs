//! Smoke screen unit tests for the settlement building blocks
//!
//! These exercise the public pieces (ids, timestamps, witnesses, metadata,
//! dispute routing) in isolation from the service scenarios and
//! mostly walk the happy path.

use chrono::{Datelike, Duration, Timelike};
use two_check::{
    config::DisputeCategory,
    dispute::{Decision, RequiredAction, route_decision},
    timestamp::TimeStamp,
    transaction::{ItemType, Metadata, NewTransaction, Witness, WitnessType},
    utils::new_uuid_to_bech32,
};

// UTILS
mod utils_tests {
    use super::*;

    #[test]
    fn empty_prefix_is_rejected() {
        assert!(new_uuid_to_bech32("").is_err());
    }
}

// TIMESTAMPS
mod timestamp_tests {
    use super::*;

    #[test]
    fn new_with_builds_the_requested_instant() {
        let ts = TimeStamp::new_with(2025, 6, 30, 17, 45, 5).unwrap();
        let dt = ts.to_datetime_utc();
        assert_eq!((dt.year(), dt.month(), dt.day()), (2025, 6, 30));
        assert_eq!((dt.hour(), dt.minute(), dt.second()), (17, 45, 5));
        assert!(TimeStamp::new_with(2025, 2, 30, 0, 0, 0).is_none());
    }
}

// WITNESSES
mod witness_tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_content_bound() {
        let at = TimeStamp::new_with(2025, 1, 1, 12, 0, 0).unwrap();
        let dispatch = Witness::new("tx_1".into(), "mill".into(), at.clone(), WitnessType::Dispatch);
        let receipt = Witness::new("tx_1".into(), "foundry".into(), at, WitnessType::Receipt);

        assert_eq!(dispatch.digest().unwrap(), dispatch.clone().digest().unwrap());
        assert_ne!(dispatch.digest().unwrap(), receipt.digest().unwrap());
    }
}

// TRANSACTIONS
mod transaction_tests {
    use super::*;

    #[test]
    fn item_types_parse_case_insensitively() {
        assert_eq!("batch".parse::<ItemType>().unwrap(), ItemType::Batch);
        assert_eq!("MATERIAL".parse::<ItemType>().unwrap(), ItemType::Material);
        assert!("pallet".parse::<ItemType>().is_err());
    }

    #[test]
    fn draft_without_item_is_rejected() {
        let res = NewTransaction::new()
            .quantity(1)
            .value(10)
            .sender("mill")
            .receiver("foundry")
            .validate_and_finalise("tx_1".into(), TimeStamp::new(), Duration::hours(1));
        assert!(res.is_err());
    }

    #[test]
    fn untagged_metadata_is_opaque() {
        let meta = Metadata::from_json(r#"{"dock":"7","temperature_c":4}"#).unwrap();
        assert!(matches!(meta, Metadata::Opaque(ref bag) if bag.len() == 2));
        assert!(meta.location().is_none());
    }
}

// DISPUTE ROUTING
mod routing_tests {
    use super::*;

    #[test]
    fn shortfall_is_resent() {
        let routed = route_decision(
            Decision::InFavorReceiver,
            DisputeCategory::QuantityMismatch,
            2,
            10,
        )
        .unwrap();
        assert_eq!(routed, (RequiredAction::ResendPartial, 2));
    }

    #[test]
    fn decisions_parse_from_wire_names() {
        assert_eq!("IN_FAVOR_SENDER".parse::<Decision>().unwrap(), Decision::InFavorSender);
        assert_eq!("split".parse::<Decision>().unwrap(), Decision::Split);
        assert!("COIN_FLIP".parse::<Decision>().is_err());
    }
}
