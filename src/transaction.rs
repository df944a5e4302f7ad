//! Core transaction record, its lifecycle states and attestation witnesses
use crate::error::{Result, SettlementError};
use crate::timestamp::TimeStamp;
use crate::validation::ReviewAction;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(
    minicbor::Encode,
    minicbor::Decode,
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemType {
    #[n(0)]
    Product,
    #[n(1)]
    Batch,
    #[n(2)]
    Material,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Product => "PRODUCT",
            Self::Batch => "BATCH",
            Self::Material => "MATERIAL",
        }
    }
}

impl std::str::FromStr for ItemType {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PRODUCT" => Ok(Self::Product),
            "BATCH" => Ok(Self::Batch),
            "MATERIAL" => Ok(Self::Material),
            other => Err(SettlementError::InvalidInput(format!(
                "unknown item type {other}"
            ))),
        }
    }
}

/// Lifecycle of a handoff.
///
/// ```text
/// INITIATED --confirm_sent--> SENT --confirm_received--> VALIDATED
///     |                        |
///     +------ timeout ---------+--> TIMED_OUT (or DISPUTED when escalating)
///                              |
///                              +--raise_dispute--> DISPUTED --resolve--> VALIDATED | CANCELLED
/// ```
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    #[n(0)]
    Initiated,
    #[n(1)]
    Sent,
    #[n(2)]
    Validated,
    #[n(3)]
    Disputed,
    #[n(4)]
    TimedOut,
    #[n(5)]
    Cancelled,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "INITIATED",
            Self::Sent => "SENT",
            Self::Validated => "VALIDATED",
            Self::Disputed => "DISPUTED",
            Self::TimedOut => "TIMED_OUT",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Validated | Self::TimedOut | Self::Cancelled)
    }

    /// Edges of the lifecycle graph. `TimedOut -> Disputed` is only taken for
    /// records held open for review; callers check that flag.
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Initiated, Sent)
                | (Initiated, TimedOut)
                | (Initiated, Disputed)
                | (Sent, Validated)
                | (Sent, Disputed)
                | (Sent, TimedOut)
                | (TimedOut, Disputed)
                | (Disputed, Validated)
                | (Disputed, Cancelled)
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    #[n(0)]
    pub lat: f64,
    #[n(1)]
    pub lon: f64,
}

const EARTH_RADIUS_KM: f64 = 6371.0;

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Great-circle distance (haversine).
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.lon - self.lon).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct MaterialMetadata {
    #[n(0)]
    pub lot_number: Option<String>,
    #[n(1)]
    pub grade: Option<String>,
    #[n(2)]
    pub location: Option<GeoPoint>,
    #[n(3)]
    pub extra: BTreeMap<String, String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct BatchMetadata {
    #[n(0)]
    pub batch_number: Option<String>,
    #[n(1)]
    pub expiry: Option<String>,
    #[n(2)]
    pub location: Option<GeoPoint>,
    #[n(3)]
    pub extra: BTreeMap<String, String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ProductMetadata {
    #[n(0)]
    pub serial_number: Option<String>,
    #[n(1)]
    pub model: Option<String>,
    #[n(2)]
    pub location: Option<GeoPoint>,
    #[n(3)]
    pub extra: BTreeMap<String, String>,
}

/// Item specific details attached to a transaction. Known schemas are typed;
/// anything else lands in the opaque bag.
#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Metadata {
    #[n(0)]
    Material(#[n(0)] MaterialMetadata),
    #[n(1)]
    Batch(#[n(0)] BatchMetadata),
    #[n(2)]
    Product(#[n(0)] ProductMetadata),
    #[n(3)]
    Opaque(#[n(0)] BTreeMap<String, String>),
}

impl Default for Metadata {
    fn default() -> Self {
        Self::Opaque(BTreeMap::new())
    }
}

impl Metadata {
    /// Parse the JSON blob handed in at submission. Objects carrying a `kind`
    /// tag decode into the typed variants, untagged objects become opaque.
    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| SettlementError::InvalidInput(format!("metadata is not JSON: {e}")))?;

        let serde_json::Value::Object(fields) = value else {
            return Err(SettlementError::InvalidInput(
                "metadata must be a JSON object".into(),
            ));
        };

        if fields.contains_key("kind") {
            return serde_json::from_value(serde_json::Value::Object(fields))
                .map_err(|e| SettlementError::InvalidInput(format!("malformed metadata: {e}")));
        }

        let bag = fields
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect();
        Ok(Self::Opaque(bag))
    }

    pub fn location(&self) -> Option<&GeoPoint> {
        match self {
            Self::Material(m) => m.location.as_ref(),
            Self::Batch(b) => b.location.as_ref(),
            Self::Product(p) => p.location.as_ref(),
            Self::Opaque(_) => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct Witness {
    #[n(0)]
    pub transaction_id: String,
    #[n(1)]
    pub party: String,
    #[n(2)]
    pub timestamp: TimeStamp<Utc>,
    #[n(3)]
    pub witness_type: WitnessType,
}

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub enum WitnessType {
    #[n(0)]
    Dispatch,
    #[n(1)]
    Receipt,
    #[n(2)]
    Dispute {
        #[n(0)]
        dispute_id: String,
    },
    #[n(3)]
    Resolution {
        #[n(0)]
        dispute_id: String,
        #[n(1)]
        cancelled: bool,
    },
    #[n(4)]
    Timeout {
        #[n(0)]
        escalated: bool,
    },
}

impl Witness {
    pub fn new(
        transaction_id: String,
        party: String,
        timestamp: TimeStamp<Utc>,
        witness_type: WitnessType,
    ) -> Self {
        Self {
            transaction_id,
            party,
            timestamp,
            witness_type,
        }
    }
    /// sha256 of the CBOR encoded witness
    pub fn digest(&self) -> Result<String> {
        let cbor = minicbor::to_vec(self).map_err(|e| SettlementError::Encode(e.to_string()))?;
        Ok(crate::utils::content_hash(&cbor))
    }
}

/// Outcome of the auto-approval gate, recorded at settlement.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct ReviewOutcome {
    #[n(0)]
    pub auto_approved: bool,
    #[n(1)]
    pub reason: String,
    #[n(2)]
    pub required_actions: Vec<ReviewAction>,
    #[n(3)]
    pub confidence: f64,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Transaction {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub item_type: ItemType,
    #[n(2)]
    pub item_id: String,
    #[n(3)]
    pub quantity: u64,
    #[n(4)]
    pub value: i64, // minor currency units
    #[n(5)]
    pub sender: String,
    #[n(6)]
    pub receiver: String,
    #[n(7)]
    pub metadata: Metadata,
    #[n(8)]
    pub state: TransactionState,
    #[n(9)]
    pub sender_confirmed: bool,
    #[n(10)]
    pub sender_confirmed_at: Option<TimeStamp<Utc>>,
    #[n(11)]
    pub receiver_confirmed: bool,
    #[n(12)]
    pub receiver_confirmed_at: Option<TimeStamp<Utc>>,
    #[n(13)]
    pub created_at: TimeStamp<Utc>,
    #[n(14)]
    pub timeout_at: TimeStamp<Utc>,
    #[n(15)]
    pub under_review: bool, // timed out but still open to a dispute
    #[n(16)]
    pub review: Option<ReviewOutcome>,
    #[n(17)]
    pub witness_set: Vec<Witness>,
    #[n(18)]
    pub version: u64,
}

impl Transaction {
    pub fn is_party(&self, party: &str) -> bool {
        self.sender == party || self.receiver == party
    }

    /// The party whose confirmation is outstanding, if any.
    pub fn awaiting(&self) -> Option<&str> {
        match self.state {
            TransactionState::Initiated => Some(&self.sender),
            TransactionState::Sent => Some(&self.receiver),
            _ => None,
        }
    }

    pub fn is_overdue(&self, now: &TimeStamp<Utc>) -> bool {
        *now > self.timeout_at
    }

    pub fn insert_witness(&mut self, witness: Witness) {
        self.witness_set.push(witness);
    }

    /// Move along a lifecycle edge, rejecting anything the graph forbids.
    pub(crate) fn transition(
        &mut self,
        next: TransactionState,
        action: &'static str,
    ) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SettlementError::invalid_state(&self.id, self.state, action));
        }
        self.state = next;
        self.version += 1;
        Ok(())
    }
}

/// Draft of a transaction prior to submission.
#[derive(Debug, Default, Clone)]
pub struct NewTransaction {
    pub(crate) item_type: Option<ItemType>,
    pub(crate) item_id: Option<String>,
    pub(crate) quantity: u64,
    pub(crate) value: i64,
    pub(crate) sender: Option<String>,
    pub(crate) receiver: Option<String>,
    pub(crate) metadata: Metadata,
    pub(crate) timeout: Option<Duration>,
}

impl NewTransaction {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn item(mut self, item_type: ItemType, item_id: &str) -> Self {
        self.item_type = Some(item_type);
        self.item_id = Some(item_id.to_string());
        self
    }
    pub fn quantity(mut self, quantity: u64) -> Self {
        self.quantity = quantity;
        self
    }
    pub fn value(mut self, value: i64) -> Self {
        self.value = value;
        self
    }
    pub fn sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }
    pub fn receiver(mut self, receiver: &str) -> Self {
        self.receiver = Some(receiver.to_string());
        self
    }
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
    /// Overrides the relationship's confirmation window.
    pub fn timeout(mut self, window: Duration) -> Self {
        self.timeout = Some(window);
        self
    }

    /// Checks fields, then returns the INITIATED record.
    pub fn validate_and_finalise(
        self,
        id: String,
        created_at: TimeStamp<Utc>,
        default_window: Duration,
    ) -> Result<Transaction> {
        let invalid = |msg: &str| SettlementError::InvalidInput(msg.to_string());

        let sender = self
            .sender
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| invalid("sender is not set"))?;
        let receiver = self
            .receiver
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| invalid("receiver is not set"))?;
        if sender == receiver {
            return Err(invalid("sender and receiver must differ"));
        }
        let item_type = self.item_type.ok_or_else(|| invalid("item type is not set"))?;
        let item_id = self
            .item_id
            .filter(|i| !i.trim().is_empty())
            .ok_or_else(|| invalid("item id is not set"))?;
        if self.value < 0 {
            return Err(invalid("value must not be negative"));
        }
        if self.quantity == 0 {
            return Err(invalid("quantity is set to zero"));
        }
        let window = self.timeout.unwrap_or(default_window);
        if window <= Duration::zero() {
            return Err(invalid("confirmation window must be positive"));
        }
        let timeout_at = created_at
            .checked_plus(window)
            .ok_or_else(|| invalid("confirmation window runs past the supported calendar"))?;

        Ok(Transaction {
            id,
            item_type,
            item_id,
            quantity: self.quantity,
            value: self.value,
            sender,
            receiver,
            metadata: self.metadata,
            state: TransactionState::Initiated,
            sender_confirmed: false,
            sender_confirmed_at: None,
            receiver_confirmed: false,
            receiver_confirmed_at: None,
            timeout_at,
            created_at,
            under_review: false,
            review: None,
            witness_set: vec![],
            version: 0,
        })
    }
}

/// Read-side filter for transaction queries. Unset fields match everything.
#[derive(Debug, Default, Clone)]
pub struct TransactionFilter {
    pub state: Option<TransactionState>,
    pub item_type: Option<ItemType>,
    pub item_id: Option<String>,
    pub party: Option<String>,
    pub created_after: Option<TimeStamp<Utc>>,
}

impl TransactionFilter {
    pub fn matches(&self, tx: &Transaction) -> bool {
        self.state.is_none_or(|s| tx.state == s)
            && self.item_type.is_none_or(|t| tx.item_type == t)
            && self.item_id.as_ref().is_none_or(|i| &tx.item_id == i)
            && self.party.as_ref().is_none_or(|p| tx.is_party(p))
            && self.created_after.as_ref().is_none_or(|t| tx.created_at > *t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> NewTransaction {
        NewTransaction::new()
            .item(ItemType::Batch, "BATCH-7")
            .quantity(40)
            .value(12_500)
            .sender("mill")
            .receiver("foundry")
    }

    #[test]
    fn finalise_sets_window_and_initial_state() {
        let now = TimeStamp::new();
        let tx = draft()
            .validate_and_finalise("tx_1".into(), now.clone(), Duration::hours(24))
            .unwrap();

        assert_eq!(tx.state, TransactionState::Initiated);
        assert_eq!(tx.timeout_at.since(&now), Duration::hours(24));
        assert!(!tx.sender_confirmed && !tx.receiver_confirmed);
    }

    #[test]
    fn finalise_rejects_negative_value_and_self_dealing() {
        let now = TimeStamp::new();
        let negative = draft()
            .value(-1)
            .validate_and_finalise("tx_1".into(), now.clone(), Duration::hours(24));
        assert!(matches!(negative, Err(SettlementError::InvalidInput(_))));

        let same = draft()
            .receiver("mill")
            .validate_and_finalise("tx_2".into(), now, Duration::hours(24));
        assert!(matches!(same, Err(SettlementError::InvalidInput(_))));
    }

    #[test]
    fn finalise_rejects_window_past_the_calendar() {
        let res = draft()
            .timeout(Duration::days(365 * 300_000))
            .validate_and_finalise("tx_1".into(), TimeStamp::new(), Duration::hours(24));
        assert!(matches!(res, Err(SettlementError::InvalidInput(_))));
    }

    #[test]
    fn overdue_only_after_the_window() {
        let now = TimeStamp::new_with(2025, 4, 1, 8, 0, 0).unwrap();
        let tx = draft()
            .validate_and_finalise("tx_1".into(), now.clone(), Duration::hours(24))
            .unwrap();

        assert!(!tx.is_overdue(&now));
        assert!(!tx.is_overdue(&tx.timeout_at));
        assert!(tx.is_overdue(&now.checked_plus(Duration::hours(25)).unwrap()));
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        use TransactionState::*;
        let all = [Initiated, Sent, Validated, Disputed, TimedOut, Cancelled];
        for from in [Validated, Cancelled] {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
        for to in [Initiated, Sent] {
            for from in all {
                assert!(!from.can_transition_to(to) || (from == Initiated && to == Sent));
            }
        }
    }

    #[test]
    fn metadata_json_typed_and_opaque() {
        let typed = Metadata::from_json(
            r#"{"kind":"batch","batch_number":"B-19","location":{"lat":52.5,"lon":13.4}}"#,
        )
        .unwrap();
        assert!(matches!(typed, Metadata::Batch(ref b) if b.batch_number.as_deref() == Some("B-19")));
        assert_eq!(typed.location(), Some(&GeoPoint::new(52.5, 13.4)));

        let opaque = Metadata::from_json(r#"{"pallets":4,"note":"fragile"}"#).unwrap();
        match opaque {
            Metadata::Opaque(bag) => {
                assert_eq!(bag.get("pallets").map(String::as_str), Some("4"));
                assert_eq!(bag.get("note").map(String::as_str), Some("fragile"));
            }
            other => panic!("expected opaque metadata, got {other:?}"),
        }

        assert!(Metadata::from_json("[1,2]").is_err());
        assert_eq!(Metadata::from_json("").unwrap(), Metadata::default());
    }

    #[test]
    fn haversine_distance_is_plausible() {
        let berlin = GeoPoint::new(52.52, 13.405);
        let paris = GeoPoint::new(48.8566, 2.3522);
        let km = berlin.distance_km(&paris);
        assert!((870.0..890.0).contains(&km), "got {km}");
    }

    #[test]
    fn transaction_cbor_roundtrip() {
        let tx = draft()
            .validate_and_finalise("tx_1".into(), TimeStamp::new(), Duration::hours(24))
            .unwrap();
        let bytes = minicbor::to_vec(&tx).unwrap();
        let back: Transaction = minicbor::decode(&bytes).unwrap();
        assert_eq!(tx, back);
    }
}
