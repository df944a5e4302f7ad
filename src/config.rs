//! Engine configuration: confirmation windows, dispute taxonomy, trust and
//! anomaly parameters, batch limits.
//!
//! Every section has defaults, so a partial TOML file (or none at all) is a
//! valid configuration.

use crate::error::{Result, SettlementError};
use anyhow::{Context, ensure};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Longest window (confirmation, remedial, anomaly) a config may declare: a century.
pub const MAX_WINDOW_HOURS: i64 = 24 * 365 * 100;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SettlementConfig {
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub disputes: DisputeConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

/// What happens to a transaction whose confirmation window elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Move to TIMED_OUT and stay there.
    #[default]
    Expire,
    /// Move to TIMED_OUT but keep the record open for a dispute.
    Review,
    /// Open a dispute on behalf of the parties straight away.
    Escalate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Confirmation window applied when no relationship override matches.
    #[serde(default = "default_window_hours")]
    pub default_hours: i64,
    /// Per sender/receiver windows.
    #[serde(default)]
    pub relationships: Vec<RelationshipWindow>,
    #[serde(default)]
    pub policy: TimeoutPolicy,
    /// Dispute type opened by the `escalate` policy.
    #[serde(default = "default_escalation_type")]
    pub escalation_dispute_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipWindow {
    pub sender: String,
    pub receiver: String,
    pub hours: i64,
}

/// How a dispute type is routed through the resolution table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
#[serde(rename_all = "snake_case")]
pub enum DisputeCategory {
    #[n(0)]
    NotReceived,
    #[n(1)]
    Defective,
    #[n(2)]
    QuantityMismatch,
    #[n(3)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeTypeConfig {
    pub name: String,
    pub category: DisputeCategory,
    /// Evidence fields that must be present and non-blank when raising.
    #[serde(default)]
    pub required_evidence: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeConfig {
    #[serde(default = "default_dispute_types")]
    pub types: Vec<DisputeTypeConfig>,
    #[serde(default = "default_remedial_hours")]
    pub remedial_deadline_hours: i64,
    /// When non-empty, only these parties may resolve disputes.
    #[serde(default)]
    pub arbitrators: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PenaltyConfig {
    #[serde(default = "default_dispute_fault")]
    pub dispute_fault: f64,
    #[serde(default = "default_return_penalty")]
    pub return_goods: f64,
    #[serde(default = "default_minor_penalty")]
    pub late_delivery: f64,
    #[serde(default = "default_minor_penalty")]
    pub timeout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    #[serde(default = "default_initial_score")]
    pub initial_score: f64,
    /// Below this many outcomes the score is the plain success ratio.
    #[serde(default = "default_min_history")]
    pub min_history: u64,
    /// Weight of the recent ratio in the rolling average.
    #[serde(default = "default_recent_weight")]
    pub recent_weight: f64,
    /// Number of latest outcomes that make up the recent ratio.
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,
    #[serde(default = "default_bonus_every")]
    pub bonus_every: u64,
    #[serde(default = "default_bonus")]
    pub bonus: f64,
    #[serde(default)]
    pub penalties: PenaltyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// Anomalies strictly above this confidence block auto-approval.
    #[serde(default = "default_block_confidence")]
    pub block_confidence: f64,
    #[serde(default = "default_max_speed")]
    pub max_speed_kmh: f64,
    #[serde(default = "default_geographic_confidence")]
    pub geographic_confidence: f64,
    /// Relative deviation from the historical average price that counts as an anomaly.
    #[serde(default = "default_price_deviation")]
    pub price_deviation: f64,
    #[serde(default = "default_price_base_confidence")]
    pub price_base_confidence: f64,
    #[serde(default = "default_price_confidence_slope")]
    pub price_confidence_slope: f64,
    #[serde(default = "default_high_value")]
    pub high_value_threshold: i64,
    #[serde(default = "default_new_relationship_confidence")]
    pub new_relationship_confidence: f64,
    #[serde(default = "default_repeat_item_limit")]
    pub repeat_item_limit: usize,
    #[serde(default = "default_day_hours")]
    pub repeat_item_window_hours: i64,
    #[serde(default = "default_repeat_item_confidence")]
    pub repeat_item_confidence: f64,
    #[serde(default = "default_velocity_limit")]
    pub velocity_limit: usize,
    #[serde(default = "default_day_hours")]
    pub velocity_window_hours: i64,
    #[serde(default = "default_velocity_confidence")]
    pub velocity_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_batch")]
    pub max_batch_size: usize,
    #[serde(default = "default_min_batch_trust")]
    pub min_trust_score: f64,
}

// Default value functions
fn default_window_hours() -> i64 {
    24
}
fn default_escalation_type() -> String {
    "NOT_RECEIVED".into()
}
fn default_dispute_types() -> Vec<DisputeTypeConfig> {
    vec![
        DisputeTypeConfig {
            name: "NOT_RECEIVED".into(),
            category: DisputeCategory::NotReceived,
            required_evidence: vec!["description".into()],
        },
        DisputeTypeConfig {
            name: "DEFECTIVE".into(),
            category: DisputeCategory::Defective,
            required_evidence: vec!["description".into(), "photo_hash".into()],
        },
        DisputeTypeConfig {
            name: "QUANTITY_MISMATCH".into(),
            category: DisputeCategory::QuantityMismatch,
            required_evidence: vec!["description".into(), "received_quantity".into()],
        },
    ]
}
fn default_remedial_hours() -> i64 {
    72
}
fn default_dispute_fault() -> f64 {
    0.05
}
fn default_return_penalty() -> f64 {
    0.015
}
fn default_minor_penalty() -> f64 {
    0.01
}
fn default_initial_score() -> f64 {
    0.5
}
fn default_min_history() -> u64 {
    5
}
fn default_recent_weight() -> f64 {
    0.7
}
fn default_recent_window() -> usize {
    10
}
fn default_bonus_every() -> u64 {
    10
}
fn default_bonus() -> f64 {
    0.01
}
fn default_block_confidence() -> f64 {
    0.8
}
fn default_max_speed() -> f64 {
    1000.0
}
fn default_geographic_confidence() -> f64 {
    0.9
}
fn default_price_deviation() -> f64 {
    0.5
}
fn default_price_base_confidence() -> f64 {
    0.55
}
fn default_price_confidence_slope() -> f64 {
    0.5
}
fn default_high_value() -> i64 {
    10_000
}
fn default_new_relationship_confidence() -> f64 {
    0.7
}
fn default_repeat_item_limit() -> usize {
    2
}
fn default_day_hours() -> i64 {
    24
}
fn default_repeat_item_confidence() -> f64 {
    0.75
}
fn default_velocity_limit() -> usize {
    50
}
fn default_velocity_confidence() -> f64 {
    0.85
}
fn default_max_batch() -> usize {
    100
}
fn default_min_batch_trust() -> f64 {
    0.7
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_hours: default_window_hours(),
            relationships: Vec::new(),
            policy: TimeoutPolicy::default(),
            escalation_dispute_type: default_escalation_type(),
        }
    }
}

impl Default for DisputeConfig {
    fn default() -> Self {
        Self {
            types: default_dispute_types(),
            remedial_deadline_hours: default_remedial_hours(),
            arbitrators: Vec::new(),
        }
    }
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            dispute_fault: default_dispute_fault(),
            return_goods: default_return_penalty(),
            late_delivery: default_minor_penalty(),
            timeout: default_minor_penalty(),
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            initial_score: default_initial_score(),
            min_history: default_min_history(),
            recent_weight: default_recent_weight(),
            recent_window: default_recent_window(),
            bonus_every: default_bonus_every(),
            bonus: default_bonus(),
            penalties: PenaltyConfig::default(),
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            block_confidence: default_block_confidence(),
            max_speed_kmh: default_max_speed(),
            geographic_confidence: default_geographic_confidence(),
            price_deviation: default_price_deviation(),
            price_base_confidence: default_price_base_confidence(),
            price_confidence_slope: default_price_confidence_slope(),
            high_value_threshold: default_high_value(),
            new_relationship_confidence: default_new_relationship_confidence(),
            repeat_item_limit: default_repeat_item_limit(),
            repeat_item_window_hours: default_day_hours(),
            repeat_item_confidence: default_repeat_item_confidence(),
            velocity_limit: default_velocity_limit(),
            velocity_window_hours: default_day_hours(),
            velocity_confidence: default_velocity_confidence(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch(),
            min_trust_score: default_min_batch_trust(),
        }
    }
}

impl SettlementConfig {
    /// Load config from a TOML file, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Self::from_toml_str(&contents).with_context(|| format!("loading {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: SettlementConfig =
            toml::from_str(contents).context("parsing settlement config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with: windows outside
    /// `1..=MAX_WINDOW_HOURS`, scores, weights and confidences outside
    /// `[0, 1]`, and an escalation type missing from the taxonomy.
    pub fn validate(&self) -> anyhow::Result<()> {
        let window = |name: &str, hours: i64| -> anyhow::Result<()> {
            ensure!(
                (1..=MAX_WINDOW_HOURS).contains(&hours),
                "{name} must be between 1 and {MAX_WINDOW_HOURS} hours, got {hours}"
            );
            Ok(())
        };
        let unit = |name: &str, value: f64| -> anyhow::Result<()> {
            ensure!(
                value.is_finite() && (0.0..=1.0).contains(&value),
                "{name} must lie in [0, 1], got {value}"
            );
            Ok(())
        };

        window("timeouts.default_hours", self.timeouts.default_hours)?;
        for rel in &self.timeouts.relationships {
            window(
                &format!("timeout window {} -> {}", rel.sender, rel.receiver),
                rel.hours,
            )?;
        }
        window("disputes.remedial_deadline_hours", self.disputes.remedial_deadline_hours)?;
        window("anomaly.repeat_item_window_hours", self.anomaly.repeat_item_window_hours)?;
        window("anomaly.velocity_window_hours", self.anomaly.velocity_window_hours)?;

        ensure!(
            self.dispute_type(&self.timeouts.escalation_dispute_type).is_some(),
            "escalation dispute type {} is not in the dispute taxonomy",
            self.timeouts.escalation_dispute_type
        );

        let trust = &self.trust;
        unit("trust.initial_score", trust.initial_score)?;
        unit("trust.recent_weight", trust.recent_weight)?;
        unit("trust.bonus", trust.bonus)?;
        unit("trust.penalties.dispute_fault", trust.penalties.dispute_fault)?;
        unit("trust.penalties.return_goods", trust.penalties.return_goods)?;
        unit("trust.penalties.late_delivery", trust.penalties.late_delivery)?;
        unit("trust.penalties.timeout", trust.penalties.timeout)?;

        let anomaly = &self.anomaly;
        unit("anomaly.block_confidence", anomaly.block_confidence)?;
        unit("anomaly.geographic_confidence", anomaly.geographic_confidence)?;
        unit("anomaly.price_base_confidence", anomaly.price_base_confidence)?;
        unit("anomaly.new_relationship_confidence", anomaly.new_relationship_confidence)?;
        unit("anomaly.repeat_item_confidence", anomaly.repeat_item_confidence)?;
        unit("anomaly.velocity_confidence", anomaly.velocity_confidence)?;
        ensure!(
            anomaly.max_speed_kmh.is_finite() && anomaly.max_speed_kmh > 0.0,
            "anomaly.max_speed_kmh must be positive"
        );
        ensure!(
            anomaly.price_deviation.is_finite() && anomaly.price_deviation >= 0.0,
            "anomaly.price_deviation must not be negative"
        );
        ensure!(
            anomaly.price_confidence_slope.is_finite(),
            "anomaly.price_confidence_slope must be finite"
        );

        unit("batch.min_trust_score", self.batch.min_trust_score)?;
        Ok(())
    }

    /// Confirmation window for a sender/receiver pair.
    pub fn timeout_for(&self, sender: &str, receiver: &str) -> Result<Duration> {
        let hours = self
            .timeouts
            .relationships
            .iter()
            .find(|w| w.sender == sender && w.receiver == receiver)
            .map(|w| w.hours)
            .unwrap_or(self.timeouts.default_hours);

        window_hours("confirmation window", hours)
    }

    pub fn dispute_type(&self, name: &str) -> Option<&DisputeTypeConfig> {
        self.disputes.types.iter().find(|t| t.name == name)
    }

    pub fn remedial_deadline(&self) -> Result<Duration> {
        window_hours("remedial deadline", self.disputes.remedial_deadline_hours)
    }
}

/// `hours` as a duration, refusing values outside `1..=MAX_WINDOW_HOURS`.
pub(crate) fn window_hours(name: &str, hours: i64) -> Result<Duration> {
    (1..=MAX_WINDOW_HOURS)
        .contains(&hours)
        .then(|| Duration::try_hours(hours))
        .flatten()
        .ok_or_else(|| {
            SettlementError::InvalidInput(format!("{name} of {hours}h is out of range"))
        })
}
