use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::config::ReplyDelivery;
use crate::flows::states::{
    ConversationAction, ConversationEvent, ConversationState, FlowContext, TransitionOutcome,
};

pub trait FlowDefinition {
    fn initial_state(&self) -> ConversationState;
    fn transition(
        &self,
        current: &ConversationState,
        event: &ConversationEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, TransitionError>;
}

/// The single production flow: one inbound message, one decision, one outcome.
#[derive(Clone, Debug, Default)]
pub struct LeadConversationFlow;

impl FlowDefinition for LeadConversationFlow {
    fn initial_state(&self) -> ConversationState {
        ConversationState::Idle
    }

    fn transition(
        &self,
        current: &ConversationState,
        event: &ConversationEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, TransitionError> {
        transition_lead_conversation(current, event, context)
    }
}

pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn initial_state(&self) -> ConversationState {
        self.flow.initial_state()
    }

    pub fn apply(
        &self,
        current: &ConversationState,
        event: &ConversationEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, TransitionError> {
        self.flow.transition(current, event, context)
    }

    pub fn apply_with_audit<S>(
        &self,
        current: &ConversationState,
        event: &ConversationEvent,
        context: &FlowContext,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, TransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(current, event, context);
        match &result {
            Ok(outcome) => {
                sink.emit(
                    AuditEvent::new(
                        audit.lead_id,
                        audit.chat_id.clone(),
                        audit.correlation_id.clone(),
                        "conversation.transition_applied",
                        AuditCategory::Stage,
                        audit.actor.clone(),
                        AuditOutcome::Success,
                    )
                    .with_metadata("from", format!("{:?}", outcome.from))
                    .with_metadata("to", format!("{:?}", outcome.to))
                    .with_metadata("event", format!("{:?}", outcome.event)),
                );
            }
            Err(error) => {
                sink.emit(
                    AuditEvent::new(
                        audit.lead_id,
                        audit.chat_id.clone(),
                        audit.correlation_id.clone(),
                        "conversation.transition_rejected",
                        AuditCategory::Stage,
                        audit.actor.clone(),
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

impl Default for FlowEngine<LeadConversationFlow> {
    fn default() -> Self {
        Self::new(LeadConversationFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition from {state:?} using event {event:?}")]
    InvalidTransition { state: ConversationState, event: ConversationEvent },
}

fn transition_lead_conversation(
    current: &ConversationState,
    event: &ConversationEvent,
    context: &FlowContext,
) -> Result<TransitionOutcome, TransitionError> {
    use ConversationAction::{
        DeliverDirect, LinkCatalogItem, MigrateToFulfillment, PersistOrderFields,
        ReconcileHistory, ReenterQualifying, RequestDecision, WriteConfirmation, WriteReply,
    };
    use ConversationEvent::{MessageAccepted, OrderDecided, OutcomeApplied, ReplyDecided};
    use ConversationState::{AwaitingDecision, Conversing, Fulfilling, Idle};

    let (to, actions) = match (current, event) {
        (Idle, MessageAccepted) => {
            (AwaitingDecision, vec![ReconcileHistory, RequestDecision])
        }
        (AwaitingDecision, ReplyDecided) => {
            let deliver = match context.delivery {
                ReplyDelivery::StageAutomation => ReenterQualifying,
                ReplyDelivery::DirectChat => DeliverDirect,
            };
            (Conversing, vec![WriteReply, deliver])
        }
        (AwaitingDecision, OrderDecided) => (
            Fulfilling,
            vec![PersistOrderFields, LinkCatalogItem, WriteConfirmation, MigrateToFulfillment],
        ),
        (Conversing, OutcomeApplied) | (Fulfilling, OutcomeApplied) => (Idle, Vec::new()),
        _ => {
            return Err(TransitionError::InvalidTransition {
                state: current.clone(),
                event: event.clone(),
            });
        }
    };

    Ok(TransitionOutcome { from: current.clone(), to, event: event.clone(), actions })
}

#[cfg(test)]
mod tests {
    use crate::audit::{AuditContext, InMemoryAuditSink};
    use crate::config::ReplyDelivery;
    use crate::domain::lead::LeadId;
    use crate::flows::engine::{FlowDefinition, FlowEngine, LeadConversationFlow, TransitionError};
    use crate::flows::states::{
        ConversationAction, ConversationEvent, ConversationState, FlowContext,
    };

    #[test]
    fn reply_path_plans_exactly_one_qualifying_reentry() {
        let engine = FlowEngine::default();
        let context = FlowContext::default();

        let awaiting = engine
            .apply(&ConversationState::Idle, &ConversationEvent::MessageAccepted, &context)
            .expect("idle -> awaiting");
        assert_eq!(awaiting.to, ConversationState::AwaitingDecision);
        assert_eq!(awaiting.actions[0], ConversationAction::ReconcileHistory);
        assert_eq!(awaiting.terminal_transition_count(), 0);

        let conversing = engine
            .apply(&awaiting.to, &ConversationEvent::ReplyDecided, &context)
            .expect("awaiting -> conversing");
        assert_eq!(conversing.to, ConversationState::Conversing);
        assert!(conversing.actions.contains(&ConversationAction::ReenterQualifying));
        assert!(!conversing.actions.contains(&ConversationAction::MigrateToFulfillment));
        assert_eq!(conversing.terminal_transition_count(), 1);

        let idle = engine
            .apply(&conversing.to, &ConversationEvent::OutcomeApplied, &context)
            .expect("conversing -> idle");
        assert_eq!(idle.to, ConversationState::Idle);
        assert!(idle.actions.is_empty());
    }

    #[test]
    fn order_path_plans_exactly_one_migration_and_no_bounce() {
        let engine = FlowEngine::default();
        let context = FlowContext::default();

        let fulfilling = engine
            .apply(
                &ConversationState::AwaitingDecision,
                &ConversationEvent::OrderDecided,
                &context,
            )
            .expect("awaiting -> fulfilling");

        assert_eq!(fulfilling.to, ConversationState::Fulfilling);
        assert!(fulfilling.actions.contains(&ConversationAction::MigrateToFulfillment));
        assert!(!fulfilling.actions.contains(&ConversationAction::ReenterQualifying));
        assert_eq!(fulfilling.terminal_transition_count(), 1);

        let order: Vec<_> = fulfilling.actions.clone();
        assert_eq!(
            order,
            vec![
                ConversationAction::PersistOrderFields,
                ConversationAction::LinkCatalogItem,
                ConversationAction::WriteConfirmation,
                ConversationAction::MigrateToFulfillment,
            ],
        );
    }

    #[test]
    fn direct_chat_delivery_replaces_the_stage_reentry() {
        let engine = FlowEngine::default();
        let context = FlowContext { delivery: ReplyDelivery::DirectChat };

        let conversing = engine
            .apply(&ConversationState::AwaitingDecision, &ConversationEvent::ReplyDecided, &context)
            .expect("awaiting -> conversing");

        assert!(conversing.actions.contains(&ConversationAction::DeliverDirect));
        assert!(!conversing.actions.contains(&ConversationAction::ReenterQualifying));
        assert_eq!(conversing.terminal_transition_count(), 0);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let engine = FlowEngine::default();
        let error = engine
            .apply(
                &ConversationState::Idle,
                &ConversationEvent::ReplyDecided,
                &FlowContext::default(),
            )
            .expect_err("idle cannot take a decision event");

        assert!(matches!(
            error,
            TransitionError::InvalidTransition {
                state: ConversationState::Idle,
                event: ConversationEvent::ReplyDecided,
            }
        ));
    }

    #[test]
    fn replay_is_deterministic_for_same_event_sequence() {
        let engine = FlowEngine::new(LeadConversationFlow);
        let events = [
            ConversationEvent::MessageAccepted,
            ConversationEvent::ReplyDecided,
            ConversationEvent::OutcomeApplied,
        ];

        let run = |engine: &FlowEngine<LeadConversationFlow>| {
            let mut state = engine.initial_state();
            let mut actions = Vec::new();
            for event in &events {
                let outcome = engine
                    .apply(&state, event, &FlowContext::default())
                    .expect("deterministic run");
                actions.push(outcome.actions);
                state = outcome.to;
            }
            (state, actions)
        };

        assert_eq!(run(&engine), run(&engine));
        assert_eq!(LeadConversationFlow.initial_state(), ConversationState::Idle);
    }

    #[test]
    fn transition_emits_audit_event() {
        let engine = FlowEngine::default();
        let sink = InMemoryAuditSink::default();

        let _ = engine
            .apply_with_audit(
                &ConversationState::Idle,
                &ConversationEvent::MessageAccepted,
                &FlowContext::default(),
                &sink,
                &AuditContext::new(
                    Some(LeadId(128_553_042)),
                    Some("c2a9".to_owned()),
                    "req-42",
                    "orchestrator",
                ),
            )
            .expect("transition should succeed");

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].correlation_id, "req-42");
        assert_eq!(events[0].lead_id, Some(LeadId(128_553_042)));
        assert_eq!(events[0].event_type, "conversation.transition_applied");
    }

    #[test]
    fn rejected_transition_emits_rejection_audit_event() {
        let engine = FlowEngine::default();
        let sink = InMemoryAuditSink::default();

        let _ = engine.apply_with_audit(
            &ConversationState::Fulfilling,
            &ConversationEvent::MessageAccepted,
            &FlowContext::default(),
            &sink,
            &AuditContext::new(None, None, "req-43", "orchestrator"),
        );

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "conversation.transition_rejected");
    }
}
