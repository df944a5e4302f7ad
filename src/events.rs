//! Settlement notifications for the domain layer (inventory moves, reorders,
//! reporting). Listeners are called synchronously after the state change has
//! been committed, in subscription order.
use crate::dispute::{Decision, RequiredAction};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Clone, PartialEq)]
pub enum SettlementEvent {
    /// The handoff settled, either by dual confirmation or by arbitration.
    TransactionValidated {
        transaction_id: String,
        sender: String,
        receiver: String,
        item_id: String,
        quantity: u64,
        auto_approved: bool,
        via_arbitration: bool,
    },
    TransactionTimedOut {
        transaction_id: String,
        defaulting_party: String,
        escalated: bool,
    },
    DisputeRaised {
        transaction_id: String,
        dispute_id: String,
        initiator: String,
        dispute_type: String,
    },
    DisputeResolved {
        transaction_id: String,
        dispute_id: String,
        decision: Decision,
        required_action: RequiredAction,
        action_quantity: u64,
        cancelled: bool,
    },
}

impl SettlementEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TransactionValidated { .. } => "TransactionValidated",
            Self::TransactionTimedOut { .. } => "TransactionTimedOut",
            Self::DisputeRaised { .. } => "DisputeRaised",
            Self::DisputeResolved { .. } => "DisputeResolved",
        }
    }

    pub fn transaction_id(&self) -> &str {
        match self {
            Self::TransactionValidated { transaction_id, .. }
            | Self::TransactionTimedOut { transaction_id, .. }
            | Self::DisputeRaised { transaction_id, .. }
            | Self::DisputeResolved { transaction_id, .. } => transaction_id,
        }
    }
}

pub trait SettlementListener: Send + Sync {
    fn on_event(&self, event: &SettlementEvent);
}

/// Listener that keeps every event it sees. Handy for audits and tests.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<SettlementEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SettlementEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(SettlementEvent::name).collect()
    }
}

impl SettlementListener for EventLog {
    fn on_event(&self, event: &SettlementEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[derive(Default)]
pub(crate) struct EventBus {
    listeners: RwLock<Vec<Arc<dyn SettlementListener>>>,
}

impl EventBus {
    pub(crate) fn subscribe(&self, listener: Arc<dyn SettlementListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    pub(crate) fn publish(&self, event: SettlementEvent) {
        tracing::debug!(event = event.name(), transaction = event.transaction_id(), "publishing");
        let Ok(listeners) = self.listeners.read() else {
            tracing::warn!(event = event.name(), "listener registry poisoned, event dropped");
            return;
        };
        for listener in listeners.iter() {
            listener.on_event(&event);
        }
    }
}
