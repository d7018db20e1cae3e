use serde::{Deserialize, Serialize};

use crate::config::ReplyDelivery;

/// Lifecycle of one inbound message through the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationState {
    Idle,
    AwaitingDecision,
    Conversing,
    Fulfilling,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationEvent {
    MessageAccepted,
    ReplyDecided,
    OrderDecided,
    OutcomeApplied,
}

/// Side effects the executor performs, in plan order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationAction {
    ReconcileHistory,
    RequestDecision,
    WriteReply,
    ReenterQualifying,
    DeliverDirect,
    PersistOrderFields,
    LinkCatalogItem,
    WriteConfirmation,
    MigrateToFulfillment,
}

impl ConversationAction {
    /// Terminal stage transitions: the qualifying re-entry that fires CRM
    /// automation, or the move into the fulfillment pipeline. One message may
    /// plan at most one of these.
    pub fn is_terminal_transition(&self) -> bool {
        matches!(self, Self::ReenterQualifying | Self::MigrateToFulfillment)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlowContext {
    pub delivery: ReplyDelivery,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: ConversationState,
    pub to: ConversationState,
    pub event: ConversationEvent,
    pub actions: Vec<ConversationAction>,
}

impl TransitionOutcome {
    pub fn terminal_transition_count(&self) -> usize {
        self.actions.iter().filter(|action| action.is_terminal_transition()).count()
    }
}
