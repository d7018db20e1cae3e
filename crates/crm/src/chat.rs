//! Chat identifier resolution.
//!
//! A reply posted straight into a conversation needs the chat id, but inbound
//! webhooks do not always carry one. Every known source is a [`ChatSource`]
//! strategy; [`RESOLUTION_CHAIN`] fixes the priority order and resolution
//! walks it until one source yields an id. A failing source logs a warning
//! and hands over to the next.

use leadflow_core::domain::lead::{ContactId, LeadId};
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::{CrmApi, CrmError};

/// One place a chat id can come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatSource {
    /// The id carried by the webhook payload itself.
    Webhook,
    /// The lead's talk list.
    LeadTalks,
    /// Chats registered against the lead's primary contact.
    ContactChats,
    /// Chat ids scraped out of recent timeline event payloads.
    TimelineEvents,
    /// Chat ids scraped out of recent note payloads.
    LeadNotes,
}

impl ChatSource {
    fn name(self) -> &'static str {
        match self {
            ChatSource::Webhook => "webhook",
            ChatSource::LeadTalks => "talks",
            ChatSource::ContactChats => "contact_chats",
            ChatSource::TimelineEvents => "timeline_events",
            ChatSource::LeadNotes => "notes",
        }
    }
}

/// Priority order: the webhook value is authoritative, talks are one cheap
/// call, the contact lookup costs two, and payload scraping is the least
/// reliable so it goes last.
pub const RESOLUTION_CHAIN: &[ChatSource] = &[
    ChatSource::Webhook,
    ChatSource::LeadTalks,
    ChatSource::ContactChats,
    ChatSource::TimelineEvents,
    ChatSource::LeadNotes,
];

const SCRAPE_LIMIT: u32 = 20;
const EVENT_CHAT_PATHS: &[&str] = &["/0/message/chat_id", "/0/chat_id"];
const NOTE_CHAT_PATHS: &[&str] = &["/chat_id", "/message/chat_id"];

pub async fn resolve_chat_id(
    api: &dyn CrmApi,
    lead_id: LeadId,
    webhook_chat_id: Option<&str>,
) -> Option<String> {
    for source in RESOLUTION_CHAIN {
        match probe_source(*source, api, lead_id, webhook_chat_id).await {
            Ok(Some(chat_id)) => {
                debug!(
                    event_name = "crm.chat.resolved",
                    source = source.name(),
                    %lead_id,
                    "chat id resolved"
                );
                return Some(chat_id);
            }
            Ok(None) => {}
            Err(error) => {
                warn!(
                    source = source.name(),
                    %lead_id,
                    error = %error,
                    "chat source failed; trying the next"
                );
            }
        }
    }
    debug!(event_name = "crm.chat.unresolved", %lead_id, "no source produced a chat id");
    None
}

async fn probe_source(
    source: ChatSource,
    api: &dyn CrmApi,
    lead_id: LeadId,
    webhook_chat_id: Option<&str>,
) -> Result<Option<String>, CrmError> {
    match source {
        ChatSource::Webhook => Ok(webhook_chat_id
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)),
        ChatSource::LeadTalks => {
            let talks = api.lead_talks(lead_id).await?;
            Ok(talks
                .into_iter()
                .find_map(|talk| talk.chat_id.filter(|value| !value.trim().is_empty())))
        }
        ChatSource::ContactChats => {
            let lead = api.fetch_lead(lead_id).await?;
            let Some(contact_id) = lead.primary_contact_id().map(ContactId) else {
                return Ok(None);
            };
            let chats = api.contact_chats(contact_id).await?;
            Ok(chats
                .into_iter()
                .map(|chat| chat.chat_id)
                .find(|value| !value.trim().is_empty()))
        }
        ChatSource::TimelineEvents => {
            let events = api.lead_events(lead_id, SCRAPE_LIMIT).await?;
            Ok(events
                .iter()
                .find_map(|event| scrape_chat_id(&event.value_after, EVENT_CHAT_PATHS)))
        }
        ChatSource::LeadNotes => {
            let notes = api.lead_notes(lead_id, SCRAPE_LIMIT).await?;
            Ok(notes.iter().find_map(|note| scrape_chat_id(&note.params, NOTE_CHAT_PATHS)))
        }
    }
}

fn scrape_chat_id(payload: &Value, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|path| {
        payload
            .pointer(path)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}
