//! Dual-confirmation settlement of B2B handoffs.
//!
//! A sender attests dispatch, the receiver attests receipt, and the handoff
//! settles once both attestations exist. Stalled handoffs time out, contested
//! ones go through arbitration, and every outcome feeds a per-party trust
//! score. All records live in a single sled tree.

pub mod arbitration;
pub mod config;
pub mod dispute;
pub mod error;
pub mod events;
pub mod remedial;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod timestamp;
pub mod transaction;
pub mod trust;
pub mod utils;
pub mod validation;

pub use config::SettlementConfig;
pub use error::{Result, SettlementError};
pub use service::{SettlementService, TimeoutOutcome};
