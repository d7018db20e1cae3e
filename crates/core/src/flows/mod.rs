pub mod engine;
pub mod states;

pub use engine::{FlowDefinition, FlowEngine, LeadConversationFlow, TransitionError};
pub use states::{
    ConversationAction, ConversationEvent, ConversationState, FlowContext, TransitionOutcome,
};
