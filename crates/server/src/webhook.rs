//! Webhook ingress: classify CRM callbacks and hand them to the orchestrator.
//!
//! The CRM retries aggressively on anything but a fast 2xx, so the handler
//! acknowledges first and processes in a detached task. Malformed bodies are
//! logged and dropped; the caller always sees success.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use leadflow_agent::{InboundMessage, Orchestrator};
use leadflow_core::domain::lead::LeadId;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

/// One recognized entry from a webhook body. A single delivery can carry
/// several entries; each becomes its own event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WebhookEvent {
    IncomingMessage { lead_id: LeadId, chat_id: Option<String>, text: String },
    LeadCreated { lead_id: LeadId, pipeline_id: u64 },
    StageChanged { lead_id: LeadId, status_id: u64, pipeline_id: u64 },
}

#[derive(Clone)]
pub struct WebhookState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: WebhookState) -> Router {
    Router::new().route("/webhook", post(receive)).with_state(state)
}

/// `POST /webhook`. Replies `200 OK` unconditionally; the body is examined in
/// a spawned task so slow CRM or reasoning calls never delay the ack.
pub async fn receive(
    State(state): State<WebhookState>,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let correlation_id = Uuid::new_v4().to_string();
    info!(
        event_name = "ingress.webhook.received",
        correlation_id,
        bytes = body.len(),
        "webhook received"
    );

    tokio::spawn(async move {
        process_body(state, correlation_id, body).await;
    });

    (StatusCode::OK, "OK")
}

async fn process_body(state: WebhookState, correlation_id: String, body: Bytes) {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(error) => {
            info!(
                event_name = "ingress.webhook.malformed",
                correlation_id,
                error = %error,
                "discarding unparseable webhook body"
            );
            return;
        }
    };

    process_payload(&state, &correlation_id, &payload).await;
}

/// Dispatches every recognized event in payload order. Split from the
/// transport layer so it can be exercised without an HTTP round trip.
pub async fn process_payload(state: &WebhookState, correlation_id: &str, payload: &Value) {
    let events = classify(payload);
    if events.is_empty() {
        debug!(
            event_name = "ingress.webhook.unrecognized",
            correlation_id, "no recognized events in webhook payload"
        );
        return;
    }

    for event in events {
        match event {
            WebhookEvent::IncomingMessage { lead_id, chat_id, text } => {
                let outcome = state
                    .orchestrator
                    .handle_message(correlation_id, InboundMessage { lead_id, chat_id, text })
                    .await;
                debug!(
                    event_name = "ingress.webhook.message_dispatched",
                    correlation_id,
                    lead_id = lead_id.0,
                    outcome = ?outcome,
                    "inbound message processed"
                );
            }
            WebhookEvent::LeadCreated { lead_id, pipeline_id } => {
                state.orchestrator.handle_lead_created(correlation_id, lead_id, pipeline_id);
            }
            WebhookEvent::StageChanged { lead_id, status_id, pipeline_id } => {
                state
                    .orchestrator
                    .handle_stage_changed(correlation_id, lead_id, status_id, pipeline_id);
            }
        }
    }
}

/// Recognizes the three supported payload shapes. Anything else yields an
/// empty vector, which callers treat as silence, not failure.
pub fn classify(payload: &Value) -> Vec<WebhookEvent> {
    let mut events = Vec::new();

    if let Some(entries) = payload.pointer("/message/add").and_then(Value::as_array) {
        for entry in entries {
            // Outgoing echoes of our own replies arrive through the same hook.
            if entry.get("type").and_then(Value::as_str) != Some("incoming") {
                continue;
            }
            let Some(lead_id) = entry.get("entity_id").and_then(numeric_id) else { continue };
            let Some(text) = entry.get("text").and_then(Value::as_str) else { continue };
            events.push(WebhookEvent::IncomingMessage {
                lead_id: LeadId(lead_id),
                chat_id: entry.get("chat_id").and_then(text_id),
                text: text.to_string(),
            });
        }
    }

    if let Some(entries) = payload.pointer("/leads/add").and_then(Value::as_array) {
        for entry in entries {
            let Some(lead_id) = entry.get("id").and_then(numeric_id) else { continue };
            let Some(pipeline_id) = entry.get("pipeline_id").and_then(numeric_id) else {
                continue;
            };
            events.push(WebhookEvent::LeadCreated { lead_id: LeadId(lead_id), pipeline_id });
        }
    }

    if let Some(entries) = payload.pointer("/leads/status").and_then(Value::as_array) {
        for entry in entries {
            let Some(lead_id) = entry.get("id").and_then(numeric_id) else { continue };
            let Some(status_id) = entry.get("status_id").and_then(numeric_id) else { continue };
            let Some(pipeline_id) = entry.get("pipeline_id").and_then(numeric_id) else {
                continue;
            };
            events.push(WebhookEvent::StageChanged {
                lead_id: LeadId(lead_id),
                status_id,
                pipeline_id,
            });
        }
    }

    events
}

/// Ids arrive as JSON numbers or numeric strings depending on the account's
/// hook version; both forms must parse.
fn numeric_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn text_id(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
