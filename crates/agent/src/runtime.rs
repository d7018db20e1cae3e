//! Message orchestration: gate, lock, reconcile, decide, execute.
//!
//! One inbound message runs the whole lifecycle under a per-lead lock. All
//! CRM writes after the decision are best-effort: each one logs its own
//! failure and the run continues, because a half-applied outcome is more
//! useful than none and the CRM offers no transactions to roll back.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use leadflow_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use leadflow_core::config::{
    AppConfig, CatalogConfig, FieldsConfig, HistoryConfig, PipelineConfig, ReplyDelivery,
};
use leadflow_core::domain::lead::{CatalogLink, LeadId, LeadPatch};
use leadflow_core::domain::order::OrderDraft;
use leadflow_core::flows::{
    ConversationAction, ConversationEvent, ConversationState, FlowContext, FlowEngine,
    LeadConversationFlow, TransitionError,
};
use leadflow_crm::chat::resolve_chat_id;
use leadflow_crm::client::{CrmApi, CrmError};
use leadflow_crm::wire::Lead;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::conversation::HistoryReconciler;
use crate::llm::{AgentDecision, ReasoningService};

const ACTOR: &str = "orchestrator";

/// Snapshot of the configuration slices the orchestrator needs per run.
#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub pipeline: PipelineConfig,
    pub fields: FieldsConfig,
    pub catalog: CatalogConfig,
    pub history: HistoryConfig,
    pub delivery: ReplyDelivery,
    pub fallback_reply: String,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            pipeline: config.pipeline.clone(),
            fields: config.fields.clone(),
            catalog: config.catalog.clone(),
            history: config.history.clone(),
            delivery: config.delivery.mode,
            fallback_reply: config.reasoning.fallback_reply.clone(),
        }
    }
}

/// An inbound chat message, already classified and parsed at the ingress
/// edge. `chat_id` is kept when the webhook carried one; the resolver chain
/// fills the gap otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub lead_id: LeadId,
    pub chat_id: Option<String>,
    pub text: String,
}

/// How one message run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Conversation continued: a reply was written and delivered.
    Replied,
    /// The order was executed and the lead migrated.
    OrderCompleted,
    /// Dropped by the pipeline gate or empty input; zero CRM writes.
    Skipped,
    /// A fatal step failed; the run was abandoned after logging.
    Failed,
}

pub struct Orchestrator {
    crm: Arc<dyn CrmApi>,
    reasoning: Arc<dyn ReasoningService>,
    audit: Arc<dyn AuditSink>,
    engine: FlowEngine<LeadConversationFlow>,
    reconciler: HistoryReconciler,
    settings: OrchestratorSettings,
    lead_locks: DashMap<u64, Arc<Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        crm: Arc<dyn CrmApi>,
        reasoning: Arc<dyn ReasoningService>,
        audit: Arc<dyn AuditSink>,
        settings: OrchestratorSettings,
    ) -> Self {
        let reconciler = HistoryReconciler::new(&settings.history);
        Self {
            crm,
            reasoning,
            audit,
            engine: FlowEngine::default(),
            reconciler,
            settings,
            lead_locks: DashMap::new(),
        }
    }

    /// Runs one inbound message end to end. Never returns an error: every
    /// failure mode is logged and mapped onto a [`MessageOutcome`].
    pub async fn handle_message(
        &self,
        correlation_id: &str,
        message: InboundMessage,
    ) -> MessageOutcome {
        let inbound_text = message.text.trim().to_string();
        if inbound_text.is_empty() {
            debug!(
                event_name = "orchestrator.message_empty",
                lead_id = message.lead_id.0,
                "empty message body dropped",
            );
            return MessageOutcome::Skipped;
        }

        let lock = self.lead_lock(message.lead_id);
        let _guard = lock.lock().await;

        let lead = match self.crm.fetch_lead(message.lead_id).await {
            Ok(lead) => lead,
            Err(error) => {
                log_fatal("orchestrator.lead_fetch_failed", message.lead_id, correlation_id, &error);
                return MessageOutcome::Failed;
            }
        };

        if lead.pipeline_id != Some(self.settings.pipeline.sales_id) {
            info!(
                event_name = "orchestrator.outside_pipeline",
                lead_id = message.lead_id.0,
                pipeline_id = lead.pipeline_id,
                correlation_id,
                "lead outside the sales pipeline; no action",
            );
            self.audit.emit(AuditEvent::new(
                Some(message.lead_id),
                message.chat_id.clone(),
                correlation_id,
                "message.outside_pipeline",
                AuditCategory::Ingress,
                ACTOR,
                AuditOutcome::Rejected,
            ));
            return MessageOutcome::Skipped;
        }

        let audit_context = AuditContext::new(
            Some(message.lead_id),
            message.chat_id.clone(),
            correlation_id,
            ACTOR,
        );
        let flow_context = FlowContext { delivery: self.settings.delivery };

        let accepted = match self.engine.apply_with_audit(
            &ConversationState::Idle,
            &ConversationEvent::MessageAccepted,
            &flow_context,
            self.audit.as_ref(),
            &audit_context,
        ) {
            Ok(outcome) => outcome,
            Err(error) => {
                log_rejected_transition(message.lead_id, correlation_id, &error);
                return MessageOutcome::Failed;
            }
        };

        // AwaitingDecision plan: reconcile history, then request a decision.
        let transcript =
            self.reconciler.transcript(self.crm.as_ref(), message.lead_id, &inbound_text).await;
        let decision = match self.reasoning.decide(&transcript, &inbound_text).await {
            Ok(decision) => decision,
            Err(error) => {
                warn!(
                    event_name = "orchestrator.reasoning_fallback",
                    lead_id = message.lead_id.0,
                    correlation_id,
                    error = %error,
                    "reasoning unavailable; using the fallback reply",
                );
                self.audit.emit(AuditEvent::new(
                    Some(message.lead_id),
                    message.chat_id.clone(),
                    correlation_id,
                    "reasoning.fallback_reply",
                    AuditCategory::Conversation,
                    ACTOR,
                    AuditOutcome::Failed,
                ));
                AgentDecision::Reply(self.settings.fallback_reply.clone())
            }
        };

        let outcome = match decision {
            AgentDecision::Reply(reply) => {
                let decided = match self.engine.apply_with_audit(
                    &accepted.to,
                    &ConversationEvent::ReplyDecided,
                    &flow_context,
                    self.audit.as_ref(),
                    &audit_context,
                ) {
                    Ok(outcome) => outcome,
                    Err(error) => {
                        log_rejected_transition(message.lead_id, correlation_id, &error);
                        return MessageOutcome::Failed;
                    }
                };
                self.run_reply_actions(&decided.actions, &message, &lead, &reply).await;
                self.close_flow(&decided.to, &flow_context, &audit_context);
                MessageOutcome::Replied
            }
            AgentDecision::CompleteOrder(draft) => {
                let decided = match self.engine.apply_with_audit(
                    &accepted.to,
                    &ConversationEvent::OrderDecided,
                    &flow_context,
                    self.audit.as_ref(),
                    &audit_context,
                ) {
                    Ok(outcome) => outcome,
                    Err(error) => {
                        log_rejected_transition(message.lead_id, correlation_id, &error);
                        return MessageOutcome::Failed;
                    }
                };
                self.run_order_actions(&decided.actions, message.lead_id, &draft).await;
                self.close_flow(&decided.to, &flow_context, &audit_context);
                MessageOutcome::OrderCompleted
            }
        };

        info!(
            event_name = "orchestrator.message_handled",
            lead_id = message.lead_id.0,
            correlation_id,
            outcome = ?outcome,
            "run complete",
        );
        outcome
    }

    /// A new lead appeared. Only observed; the first inbound message starts
    /// the conversation.
    pub fn handle_lead_created(&self, correlation_id: &str, lead_id: LeadId, pipeline_id: u64) {
        if pipeline_id != self.settings.pipeline.sales_id {
            debug!(
                event_name = "orchestrator.lead_created_outside",
                lead_id = lead_id.0,
                pipeline_id,
                "lead created outside the sales pipeline",
            );
            return;
        }
        info!(
            event_name = "orchestrator.lead_created",
            lead_id = lead_id.0,
            correlation_id,
            "lead entered the sales pipeline",
        );
        self.audit.emit(AuditEvent::new(
            Some(lead_id),
            None,
            correlation_id,
            "lead.created",
            AuditCategory::Ingress,
            ACTOR,
            AuditOutcome::Success,
        ));
    }

    /// Stage moves are recorded for the audit trail, including the ones this
    /// service caused itself via the bounce.
    pub fn handle_stage_changed(
        &self,
        correlation_id: &str,
        lead_id: LeadId,
        status_id: u64,
        pipeline_id: u64,
    ) {
        if pipeline_id != self.settings.pipeline.sales_id {
            debug!(
                event_name = "orchestrator.stage_changed_outside",
                lead_id = lead_id.0,
                pipeline_id,
                "stage change outside the sales pipeline",
            );
            return;
        }
        info!(
            event_name = "orchestrator.stage_observed",
            lead_id = lead_id.0,
            status_id,
            correlation_id,
            "stage change recorded",
        );
        self.audit.emit(
            AuditEvent::new(
                Some(lead_id),
                None,
                correlation_id,
                "lead.stage_observed",
                AuditCategory::Stage,
                ACTOR,
                AuditOutcome::Success,
            )
            .with_metadata("status_id", status_id.to_string()),
        );
    }

    fn lead_lock(&self, lead_id: LeadId) -> Arc<Mutex<()>> {
        self.lead_locks.entry(lead_id.0).or_default().clone()
    }

    async fn run_reply_actions(
        &self,
        actions: &[ConversationAction],
        message: &InboundMessage,
        lead: &Lead,
        reply: &str,
    ) {
        let mut written: Option<String> = None;
        for action in actions {
            match action {
                ConversationAction::WriteReply => {
                    written = self.write_reply_field(message.lead_id, reply).await;
                }
                ConversationAction::ReenterQualifying => {
                    self.settle_reply_field(message.lead_id, written.as_deref()).await;
                    self.reenter_qualifying(message.lead_id, lead).await;
                }
                ConversationAction::DeliverDirect => {
                    self.deliver_direct(message, reply).await;
                }
                _ => {}
            }
        }
    }

    async fn run_order_actions(
        &self,
        actions: &[ConversationAction],
        lead_id: LeadId,
        draft: &OrderDraft,
    ) {
        let mut confirmation: Option<String> = None;
        for action in actions {
            match action {
                ConversationAction::PersistOrderFields => {
                    self.persist_order_fields(lead_id, draft).await;
                }
                ConversationAction::LinkCatalogItem => {
                    self.link_catalog_item(lead_id, draft).await;
                }
                ConversationAction::WriteConfirmation => {
                    let text = self.confirmation_text(draft);
                    confirmation = self.write_reply_field(lead_id, &text).await;
                }
                ConversationAction::MigrateToFulfillment => {
                    self.settle_reply_field(lead_id, confirmation.as_deref()).await;
                    self.migrate_to_fulfillment(lead_id).await;
                }
                _ => {}
            }
        }
    }

    /// Writes text into the reply field and returns what actually landed, so
    /// callers can verify it later.
    async fn write_reply_field(&self, lead_id: LeadId, text: &str) -> Option<String> {
        let clipped = clip_reply(text, self.settings.fields.reply_max_len);
        let patch = LeadPatch::default().with_field(self.settings.fields.reply_id, clipped.clone());
        match self.crm.update_lead(lead_id, &patch).await {
            Ok(()) => {
                info!(
                    event_name = "orchestrator.reply_written",
                    lead_id = lead_id.0,
                    chars = clipped.chars().count(),
                    "reply stored on the lead field",
                );
                Some(clipped)
            }
            Err(error) => {
                warn!(
                    event_name = "orchestrator.reply_write_failed",
                    lead_id = lead_id.0,
                    error = %error,
                    "reply field write failed",
                );
                None
            }
        }
    }

    /// Re-fires the stage automation. The backward move is skipped when the
    /// lead already sits in the entry stage; entering the qualifying stage is
    /// what launches the automation either way.
    async fn reenter_qualifying(&self, lead_id: LeadId, lead: &Lead) {
        let pipeline = &self.settings.pipeline;
        if lead.status_id != Some(pipeline.entry_stage_id) {
            self.write_stage(lead_id, pipeline.entry_stage_id).await;
            self.settle_stage(lead_id, pipeline.entry_stage_id).await;
        }
        self.write_stage(lead_id, pipeline.qualifying_stage_id).await;
    }

    async fn write_stage(&self, lead_id: LeadId, status_id: u64) {
        let patch = LeadPatch::stage_move(status_id);
        match self.crm.update_lead(lead_id, &patch).await {
            Ok(()) => info!(
                event_name = "orchestrator.stage_moved",
                lead_id = lead_id.0,
                status_id,
                "stage write applied",
            ),
            Err(error) => warn!(
                event_name = "orchestrator.stage_move_failed",
                lead_id = lead_id.0,
                status_id,
                error = %error,
                "stage write failed",
            ),
        }
    }

    /// Poll-and-verify: re-read the lead until the stage write is visible.
    /// Falls back to the fixed settle delay when attempts run out.
    async fn settle_stage(&self, lead_id: LeadId, expected_status: u64) {
        let pipeline = &self.settings.pipeline;
        for _ in 0..pipeline.verify_attempts {
            match self.crm.fetch_lead(lead_id).await {
                Ok(lead) if lead.status_id == Some(expected_status) => return,
                Ok(_) => {}
                Err(error) => debug!(
                    event_name = "orchestrator.verify_read_failed",
                    lead_id = lead_id.0,
                    error = %error,
                    "verification read failed",
                ),
            }
            sleep(Duration::from_millis(pipeline.verify_interval_ms)).await;
        }
        debug!(
            event_name = "orchestrator.verify_exhausted",
            lead_id = lead_id.0,
            expected_status,
            "stage not confirmed; applying the settle delay",
        );
        sleep(Duration::from_millis(pipeline.bounce_delay_ms)).await;
    }

    /// Poll-and-verify for the reply field. With nothing to verify (the write
    /// failed) only the fixed delay applies.
    async fn settle_reply_field(&self, lead_id: LeadId, expected: Option<&str>) {
        let pipeline = &self.settings.pipeline;
        let Some(expected) = expected else {
            sleep(Duration::from_millis(pipeline.bounce_delay_ms)).await;
            return;
        };
        let field_id = self.settings.fields.reply_id;
        for _ in 0..pipeline.verify_attempts {
            match self.crm.fetch_lead(lead_id).await {
                Ok(lead) if lead.field_text(field_id).as_deref() == Some(expected) => return,
                Ok(_) => {}
                Err(error) => debug!(
                    event_name = "orchestrator.verify_read_failed",
                    lead_id = lead_id.0,
                    error = %error,
                    "verification read failed",
                ),
            }
            sleep(Duration::from_millis(pipeline.verify_interval_ms)).await;
        }
        debug!(
            event_name = "orchestrator.verify_exhausted",
            lead_id = lead_id.0,
            "reply field not confirmed; applying the settle delay",
        );
        sleep(Duration::from_millis(pipeline.bounce_delay_ms)).await;
    }

    async fn persist_order_fields(&self, lead_id: LeadId, draft: &OrderDraft) {
        let patch = order_patch(&self.settings.fields, &self.settings.catalog, draft);
        match self.crm.update_lead(lead_id, &patch).await {
            Ok(()) => info!(
                event_name = "orchestrator.order_fields_written",
                lead_id = lead_id.0,
                fields = patch.fields.len(),
                "order data stored on the lead",
            ),
            Err(error) => warn!(
                event_name = "orchestrator.order_fields_failed",
                lead_id = lead_id.0,
                error = %error,
                "order field write failed",
            ),
        }
    }

    async fn link_catalog_item(&self, lead_id: LeadId, draft: &OrderDraft) {
        let catalog = &self.settings.catalog;
        if catalog.id == 0 || catalog.product_id == 0 {
            debug!(
                event_name = "orchestrator.catalog_link_disabled",
                lead_id = lead_id.0,
                "catalog link not configured",
            );
            return;
        }
        let link = CatalogLink {
            catalog_id: catalog.id,
            element_id: catalog.product_id,
            quantity: draft.quantity(),
        };
        match self.crm.link_catalog_element(lead_id, &link).await {
            Ok(()) => info!(
                event_name = "orchestrator.catalog_linked",
                lead_id = lead_id.0,
                element_id = link.element_id,
                quantity = link.quantity,
                "catalog element attached",
            ),
            Err(error) => warn!(
                event_name = "orchestrator.catalog_link_failed",
                lead_id = lead_id.0,
                error = %error,
                "catalog link failed; order continues",
            ),
        }
    }

    fn confirmation_text(&self, draft: &OrderDraft) -> String {
        let catalog = &self.settings.catalog;
        format!(
            "¡Pedido confirmado! {} x {} por ${}. Pronto nos comunicamos contigo para coordinar la entrega.",
            draft.quantity(),
            catalog.product_name,
            draft.total(catalog.unit_price),
        )
    }

    async fn migrate_to_fulfillment(&self, lead_id: LeadId) {
        let pipeline = &self.settings.pipeline;
        let patch =
            LeadPatch::pipeline_migration(pipeline.fulfillment_id, pipeline.fulfillment_stage_id);
        match self.crm.update_lead(lead_id, &patch).await {
            Ok(()) => info!(
                event_name = "orchestrator.lead_migrated",
                lead_id = lead_id.0,
                pipeline_id = pipeline.fulfillment_id,
                "lead moved to the fulfillment pipeline",
            ),
            Err(error) => warn!(
                event_name = "orchestrator.migration_failed",
                lead_id = lead_id.0,
                error = %error,
                "pipeline migration failed",
            ),
        }
    }

    async fn deliver_direct(&self, message: &InboundMessage, reply: &str) {
        let resolved =
            resolve_chat_id(self.crm.as_ref(), message.lead_id, message.chat_id.as_deref()).await;
        let Some(chat_id) = resolved else {
            warn!(
                event_name = "orchestrator.chat_unresolved",
                lead_id = message.lead_id.0,
                "no chat id resolved; direct reply dropped",
            );
            return;
        };
        match self.crm.post_chat_message(&chat_id, reply).await {
            Ok(()) => info!(
                event_name = "orchestrator.reply_delivered",
                lead_id = message.lead_id.0,
                chat_id = %chat_id,
                "reply posted to the chat",
            ),
            Err(error) => warn!(
                event_name = "orchestrator.chat_post_failed",
                lead_id = message.lead_id.0,
                error = %error,
                "chat delivery failed",
            ),
        }
    }

    fn close_flow(
        &self,
        state: &ConversationState,
        flow_context: &FlowContext,
        audit_context: &AuditContext,
    ) {
        if let Err(error) = self.engine.apply_with_audit(
            state,
            &ConversationEvent::OutcomeApplied,
            flow_context,
            self.audit.as_ref(),
            audit_context,
        ) {
            warn!(
                event_name = "orchestrator.flow_close_failed",
                error = %error,
                "flow did not return to idle",
            );
        }
    }
}

/// One patch carrying every captured order field plus the computed total.
fn order_patch(fields: &FieldsConfig, catalog: &CatalogConfig, draft: &OrderDraft) -> LeadPatch {
    let mut patch = LeadPatch::default().with_price(draft.total(catalog.unit_price));
    if let Some(name) = draft.full_name() {
        patch = patch.with_field(fields.name_id, name);
    }
    if let Some(document) = draft.document_id.as_deref() {
        patch = patch.with_field(fields.document_id, document);
    }
    if let Some(phone) = draft.phone.as_deref() {
        patch = patch.with_field(fields.phone_id, phone);
    }
    if let Some(email) = draft.email.as_deref() {
        patch = patch.with_field(fields.email_id, email);
    }
    if let Some(department) = draft.department.as_deref() {
        patch = patch.with_field(fields.department_id, department);
    }
    if let Some(city) = draft.city.as_deref() {
        patch = patch.with_field(fields.city_id, city);
    }
    if let Some(address) = draft.address.as_deref() {
        patch = patch.with_field(fields.address_id, address);
    }
    patch.with_field(fields.quantity_id, draft.quantity().to_string())
}

/// Truncates to the CRM field limit on a character boundary, marking the cut
/// with a trailing ellipsis.
fn clip_reply(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut clipped: String = trimmed.chars().take(max_chars.saturating_sub(1)).collect();
    clipped.push('…');
    clipped
}

fn log_fatal(event: &'static str, lead_id: LeadId, correlation_id: &str, error: &CrmError) {
    if matches!(error, CrmError::Auth(_)) {
        error!(
            event_name = event,
            lead_id = lead_id.0,
            correlation_id,
            error = %error,
            "credential refresh failed; abandoning this run",
        );
    } else {
        error!(
            event_name = event,
            lead_id = lead_id.0,
            correlation_id,
            error = %error,
            "abandoning this run",
        );
    }
}

fn log_rejected_transition(lead_id: LeadId, correlation_id: &str, error: &TransitionError) {
    error!(
        event_name = "orchestrator.transition_rejected",
        lead_id = lead_id.0,
        correlation_id,
        error = %error,
        "flow rejected the planned transition",
    );
}

#[cfg(test)]
mod tests {
    use leadflow_core::config::{CatalogConfig, FieldsConfig};
    use leadflow_core::domain::order::OrderDraft;
    use rust_decimal::Decimal;

    use super::{clip_reply, order_patch};

    fn fields_fixture() -> FieldsConfig {
        FieldsConfig {
            reply_id: 7,
            reply_max_len: 1000,
            name_id: 11,
            document_id: 12,
            phone_id: 13,
            email_id: 14,
            department_id: 15,
            city_id: 16,
            address_id: 17,
            quantity_id: 18,
        }
    }

    fn catalog_fixture() -> CatalogConfig {
        CatalogConfig {
            id: 5001,
            product_id: 6001,
            product_name: "Suero Capilar".to_string(),
            unit_price: Decimal::new(89_900, 0),
        }
    }

    #[test]
    fn clip_reply_preserves_short_text_and_marks_cuts() {
        assert_eq!(clip_reply("hola", 10), "hola");
        assert_eq!(clip_reply("  hola  ", 4), "hola");

        let clipped = clip_reply("abcdefgh", 5);
        assert_eq!(clipped, "abcd…");
        assert_eq!(clipped.chars().count(), 5);

        // Multi-byte text clips on character boundaries.
        let clipped = clip_reply("ñandú y más texto", 6);
        assert_eq!(clipped.chars().count(), 6);
        assert!(clipped.ends_with('…'));
    }

    #[test]
    fn order_patch_carries_fields_and_computed_total() {
        let draft = OrderDraft {
            first_name: Some("Ana".into()),
            last_name: Some("Ruiz".into()),
            document_id: Some("123".into()),
            phone: Some("3000000000".into()),
            department: Some("Valle".into()),
            city: Some("Cali".into()),
            address: Some("Calle 1".into()),
            ..OrderDraft::default()
        };

        let patch = order_patch(&fields_fixture(), &catalog_fixture(), &draft);

        assert_eq!(patch.price, Some(Decimal::new(89_900, 0)));
        let name = patch.fields.iter().find(|write| write.field_id == 11).expect("name write");
        assert_eq!(name.value, "Ana Ruiz");
        let quantity =
            patch.fields.iter().find(|write| write.field_id == 18).expect("quantity write");
        assert_eq!(quantity.value, "1");
        // No email captured, no email write.
        assert!(patch.fields.iter().all(|write| write.field_id != 14));
        assert!(!patch.moves_stage());
    }

    #[test]
    fn order_patch_multiplies_total_by_quantity() {
        let draft = OrderDraft { quantity: Some(3), ..OrderDraft::default() };
        let patch = order_patch(&fields_fixture(), &catalog_fixture(), &draft);
        assert_eq!(patch.price, Some(Decimal::new(269_700, 0)));
    }
}
