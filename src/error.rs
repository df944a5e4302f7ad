use crate::transaction::TransactionState;

pub type Result<T> = std::result::Result<T, SettlementError>;

#[derive(thiserror::Error, Debug)]
pub enum SettlementError {
    #[error("{caller} is not allowed to {action} on {record}")]
    Unauthorized {
        caller: String,
        action: &'static str,
        record: String,
    },
    #[error("cannot {action} transaction {transaction_id} while it is {state}")]
    InvalidState {
        transaction_id: String,
        state: TransactionState,
        action: &'static str,
    },
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("record already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("dispute type {0} is not part of the configured taxonomy")]
    InvalidDisputeType(String),
    #[error("dispute type {dispute_type} is missing required evidence: {}", .missing.join(", "))]
    MissingEvidence {
        dispute_type: String,
        missing: Vec<String>,
    },
    #[error("dispute on transaction {0} is not open")]
    DisputeNotOpen(String),
    #[error("remedial action for dispute {0} was already completed")]
    AlreadyCompleted(String),
    #[error("batch of {size} exceeds the maximum of {max}")]
    BatchTooLarge { size: usize, max: usize },
    #[error("trust score {score:.3} of {party} is below the required {required:.3}")]
    InsufficientTrust {
        party: String,
        score: f64,
        required: f64,
    },
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("record decoding failed: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("record encoding failed: {0}")]
    Encode(String),
}

impl SettlementError {
    pub(crate) fn invalid_state(
        transaction_id: &str,
        state: TransactionState,
        action: &'static str,
    ) -> Self {
        Self::InvalidState {
            transaction_id: transaction_id.to_string(),
            state,
            action,
        }
    }
    pub(crate) fn unauthorized(caller: &str, action: &'static str, record: &str) -> Self {
        Self::Unauthorized {
            caller: caller.to_string(),
            action,
            record: record.to_string(),
        }
    }
}
