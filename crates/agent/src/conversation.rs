//! Rebuilds a chat transcript from CRM history records.
//!
//! The CRM does not expose the conversation directly; it has to be
//! reconstructed from timeline events (primary source) or lead notes
//! (fallback). Both sources mix real chat turns with service records, embed
//! the text at channel-dependent paths, and return records newest-first.

use std::sync::OnceLock;

use leadflow_core::config::HistoryConfig;
use leadflow_core::domain::lead::LeadId;
use leadflow_core::domain::message::{ChatRole, TranscriptEntry};
use leadflow_crm::client::CrmApi;
use leadflow_crm::wire::{LeadNote, TimelineEvent};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

/// Text paths probed on each event's `value_after` payload, in priority
/// order. The first path that yields a non-empty string wins.
const CONTENT_PATHS: &[&str] =
    &["/0/message/text", "/0/note/text", "/0/text", "/0/note/params/text"];

/// Entries shorter than this after sanitizing carry no conversational value.
const MIN_CONTENT_CHARS: usize = 2;

/// Lowercased substrings that mark CRM service records rather than chat
/// turns. Stage audits and bot lifecycle markers share the event types of
/// real messages on some channels, so they are filtered by content.
const NOISE_MARKERS: &[&str] = &[
    "bot iniciado",
    "bot detenido",
    "cambio de etapa",
    "se movió a la etapa",
    "conversación cerrada",
];

fn html_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<[^>]*>").expect("static pattern compiles"))
}

/// Reconstructs the transcript for a lead.
///
/// History failures degrade instead of propagating: a failed or empty events
/// read falls back to notes, and a failed notes read yields an empty
/// transcript. An empty transcript is a valid result for a brand-new lead.
pub struct HistoryReconciler {
    events_limit: u32,
    notes_limit: u32,
}

impl HistoryReconciler {
    pub fn new(history: &HistoryConfig) -> Self {
        Self { events_limit: history.events_limit, notes_limit: history.notes_limit }
    }

    pub async fn transcript(
        &self,
        crm: &dyn CrmApi,
        lead_id: LeadId,
        inbound_text: &str,
    ) -> Vec<TranscriptEntry> {
        let mut entries = match crm.lead_events(lead_id, self.events_limit).await {
            Ok(events) => entries_from_events(&events),
            Err(error) => {
                warn!(
                    event_name = "history.events_unavailable",
                    lead_id = lead_id.0,
                    error = %error,
                    "timeline read failed; trying notes",
                );
                Vec::new()
            }
        };

        if entries.is_empty() {
            entries = match crm.lead_notes(lead_id, self.notes_limit).await {
                Ok(notes) => entries_from_notes(&notes),
                Err(error) => {
                    warn!(
                        event_name = "history.notes_unavailable",
                        lead_id = lead_id.0,
                        error = %error,
                        "notes read failed; continuing with empty transcript",
                    );
                    Vec::new()
                }
            };
        }

        drop_stale_duplicate(&mut entries, inbound_text);
        debug!(
            event_name = "history.reconciled",
            lead_id = lead_id.0,
            entries = entries.len(),
            "transcript rebuilt",
        );
        entries
    }
}

/// Converts timeline events into chronological transcript entries.
///
/// Events arrive newest-first and are reversed after filtering.
pub fn entries_from_events(events: &[TimelineEvent]) -> Vec<TranscriptEntry> {
    let mut entries: Vec<TranscriptEntry> = events.iter().filter_map(entry_from_event).collect();
    entries.reverse();
    entries
}

fn entry_from_event(event: &TimelineEvent) -> Option<TranscriptEntry> {
    let role = match event.event_type.as_str() {
        "incoming_chat_message" => ChatRole::User,
        "outgoing_chat_message" => ChatRole::Assistant,
        _ => return None,
    };
    let raw = probe_content(&event.value_after)?;
    let text = sanitize_text(&raw)?;
    if is_noise(&text) {
        return None;
    }
    Some(TranscriptEntry { role, text })
}

/// Converts notes into chronological user-side entries. Notes carry no
/// author tag that maps onto chat roles, so everything readable is treated
/// as customer context.
pub fn entries_from_notes(notes: &[LeadNote]) -> Vec<TranscriptEntry> {
    let mut entries: Vec<TranscriptEntry> = notes.iter().filter_map(entry_from_note).collect();
    entries.reverse();
    entries
}

fn entry_from_note(note: &LeadNote) -> Option<TranscriptEntry> {
    let raw = note.params.pointer("/text").and_then(Value::as_str)?;
    let text = sanitize_text(raw)?;
    if is_noise(&text) {
        return None;
    }
    Some(TranscriptEntry::user(text))
}

fn probe_content(value_after: &Value) -> Option<String> {
    CONTENT_PATHS.iter().find_map(|path| {
        value_after
            .pointer(path)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    })
}

/// Strips markup and control characters, collapses whitespace, and drops
/// remnants below [`MIN_CONTENT_CHARS`].
fn sanitize_text(raw: &str) -> Option<String> {
    let without_tags = html_tag_pattern().replace_all(raw, " ");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"");
    let flattened: String =
        decoded.chars().map(|ch| if ch.is_control() { ' ' } else { ch }).collect();
    let cleaned = flattened.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.chars().count() < MIN_CONTENT_CHARS {
        None
    } else {
        Some(cleaned)
    }
}

fn is_noise(text: &str) -> bool {
    let lowered = text.to_lowercase();
    NOISE_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// The webhook often races the timeline: the message that triggered this
/// orchestration may already appear as the last history record. Exact-match
/// policy; the inbound text is compared trimmed against the trailing user
/// entry only.
fn drop_stale_duplicate(entries: &mut Vec<TranscriptEntry>, inbound_text: &str) {
    let inbound = inbound_text.trim();
    let stale = entries
        .last()
        .is_some_and(|entry| entry.role == ChatRole::User && entry.text == inbound);
    if stale {
        entries.pop();
        debug!(event_name = "history.duplicate_dropped", "trailing user entry matched inbound");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use leadflow_core::config::HistoryConfig;
    use leadflow_core::domain::lead::{CatalogLink, ContactId, LeadId, LeadPatch};
    use leadflow_core::domain::message::{ChatRole, TranscriptEntry};
    use leadflow_crm::client::{CrmApi, CrmError};
    use leadflow_crm::wire::{ChatHandle, Lead, LeadNote, Talk, TimelineEvent};
    use serde_json::{json, Value};

    use super::{
        drop_stale_duplicate, entries_from_events, entries_from_notes, sanitize_text,
        HistoryReconciler,
    };

    fn incoming(text: &str) -> TimelineEvent {
        event("incoming_chat_message", json!([{ "message": { "text": text } }]))
    }

    fn outgoing(text: &str) -> TimelineEvent {
        event("outgoing_chat_message", json!([{ "message": { "text": text } }]))
    }

    fn event(event_type: &str, value_after: Value) -> TimelineEvent {
        TimelineEvent {
            id: Some("ev-1".to_string()),
            event_type: event_type.to_string(),
            value_after,
            created_at: Some(1_700_000_000),
        }
    }

    fn note(text: &str) -> LeadNote {
        LeadNote {
            id: Some(9),
            note_type: Some("common".to_string()),
            params: json!({ "text": text }),
            created_at: Some(1_700_000_000),
        }
    }

    #[test]
    fn events_reverse_into_chronological_order_with_roles() {
        let events = vec![outgoing("Con gusto, ¿cuál es tu ciudad?"), incoming("Hola")];

        let entries = entries_from_events(&events);

        assert_eq!(
            entries,
            vec![
                TranscriptEntry::user("Hola"),
                TranscriptEntry::assistant("Con gusto, ¿cuál es tu ciudad?"),
            ]
        );
    }

    #[test]
    fn content_paths_probe_in_priority_order() {
        struct Case {
            value_after: Value,
            expect: &'static str,
        }

        let cases = vec![
            Case {
                value_after: json!([{ "message": { "text": "primario" }, "text": "plano" }]),
                expect: "primario",
            },
            Case {
                value_after: json!([{ "note": { "text": "de nota" } }]),
                expect: "de nota",
            },
            Case { value_after: json!([{ "text": "plano" }]), expect: "plano" },
            Case {
                value_after: json!([{ "note": { "params": { "text": "anidado" } } }]),
                expect: "anidado",
            },
            Case {
                value_after: json!([{ "message": { "text": "" }, "text": "respaldo" }]),
                expect: "respaldo",
            },
        ];

        for (index, case) in cases.into_iter().enumerate() {
            let entries =
                entries_from_events(&[event("incoming_chat_message", case.value_after)]);
            assert_eq!(entries.len(), 1, "case {index} should yield one entry");
            assert_eq!(entries[0].text, case.expect, "case {index}");
        }
    }

    #[test]
    fn unknown_event_types_are_excluded() {
        let events = vec![
            event("lead_status_changed", json!([{ "text": "Etapa nueva" }])),
            incoming("Hola"),
        ];

        let entries = entries_from_events(&events);
        assert_eq!(entries, vec![TranscriptEntry::user("Hola")]);
    }

    #[test]
    fn html_is_stripped_and_short_remnants_dropped() {
        assert_eq!(sanitize_text("<p>Hola</p>").as_deref(), Some("Hola"));
        assert_eq!(sanitize_text("linea<br>rota").as_deref(), Some("linea rota"));
        assert_eq!(sanitize_text("&nbsp;&nbsp;ok").as_deref(), Some("ok"));
        assert_eq!(sanitize_text("5 &gt; 3").as_deref(), Some("5 > 3"));
        assert_eq!(sanitize_text("<br>"), None);
        assert_eq!(sanitize_text("a"), None);
        assert_eq!(sanitize_text("  \u{0} \t "), None);
    }

    #[test]
    fn service_markers_are_filtered_as_noise() {
        let events = vec![
            incoming("Quiero dos unidades"),
            event(
                "outgoing_chat_message",
                json!([{ "message": { "text": "Bot iniciado por el sistema" } }]),
            ),
            event(
                "incoming_chat_message",
                json!([{ "message": { "text": "El lead se movió a la etapa Calificación" } }]),
            ),
        ];

        let entries = entries_from_events(&events);
        assert_eq!(entries, vec![TranscriptEntry::user("Quiero dos unidades")]);
    }

    #[test]
    fn trailing_duplicate_user_entry_is_dropped_on_exact_match() {
        let mut entries =
            vec![TranscriptEntry::assistant("¿En qué te ayudo?"), TranscriptEntry::user("Hola")];
        drop_stale_duplicate(&mut entries, "  Hola ");
        assert_eq!(entries, vec![TranscriptEntry::assistant("¿En qué te ayudo?")]);

        // Substrings and differing texts are not duplicates.
        let mut entries = vec![TranscriptEntry::user("Hola, quiero comprar")];
        drop_stale_duplicate(&mut entries, "Hola");
        assert_eq!(entries.len(), 1);

        // A trailing assistant entry is never the inbound message.
        let mut entries = vec![TranscriptEntry::assistant("Hola")];
        drop_stale_duplicate(&mut entries, "Hola");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn notes_fallback_yields_user_entries() {
        let notes = vec![note("¿Tienen envío a Cali?"), note("Buenas tardes")];

        let entries = entries_from_notes(&notes);
        assert_eq!(
            entries,
            vec![
                TranscriptEntry::user("Buenas tardes"),
                TranscriptEntry::user("¿Tienen envío a Cali?"),
            ]
        );
    }

    struct ScriptedHistory {
        events: Result<Vec<TimelineEvent>, ()>,
        notes: Result<Vec<LeadNote>, ()>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl ScriptedHistory {
        fn new(events: Result<Vec<TimelineEvent>, ()>, notes: Result<Vec<LeadNote>, ()>) -> Self {
            Self { events, notes, calls: Mutex::new(Vec::new()) }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().expect("calls lock").clone()
        }

        fn unavailable(operation: &'static str) -> CrmError {
            CrmError::Api { operation, status: 502, detail: "unavailable".to_string() }
        }
    }

    #[async_trait]
    impl CrmApi for ScriptedHistory {
        async fn fetch_lead(&self, _lead_id: LeadId) -> Result<Lead, CrmError> {
            Ok(Lead::default())
        }

        async fn update_lead(&self, _lead_id: LeadId, _patch: &LeadPatch) -> Result<(), CrmError> {
            Ok(())
        }

        async fn lead_events(
            &self,
            _lead_id: LeadId,
            _limit: u32,
        ) -> Result<Vec<TimelineEvent>, CrmError> {
            self.calls.lock().expect("calls lock").push("events");
            self.events.clone().map_err(|()| Self::unavailable("events.list"))
        }

        async fn lead_notes(&self, _lead_id: LeadId, _limit: u32) -> Result<Vec<LeadNote>, CrmError> {
            self.calls.lock().expect("calls lock").push("notes");
            self.notes.clone().map_err(|()| Self::unavailable("notes.list"))
        }

        async fn link_catalog_element(
            &self,
            _lead_id: LeadId,
            _link: &CatalogLink,
        ) -> Result<(), CrmError> {
            Ok(())
        }

        async fn lead_talks(&self, _lead_id: LeadId) -> Result<Vec<Talk>, CrmError> {
            Ok(Vec::new())
        }

        async fn contact_chats(&self, _contact_id: ContactId) -> Result<Vec<ChatHandle>, CrmError> {
            Ok(Vec::new())
        }

        async fn post_chat_message(&self, _chat_id: &str, _text: &str) -> Result<(), CrmError> {
            Ok(())
        }
    }

    fn reconciler() -> HistoryReconciler {
        HistoryReconciler::new(&HistoryConfig { events_limit: 50, notes_limit: 50 })
    }

    #[tokio::test]
    async fn events_source_wins_when_it_has_content() {
        let crm = ScriptedHistory::new(Ok(vec![incoming("Hola")]), Ok(vec![note("nota vieja")]));

        let transcript = reconciler().transcript(&crm, LeadId(7), "Otra cosa").await;

        assert_eq!(transcript, vec![TranscriptEntry::user("Hola")]);
        assert_eq!(crm.calls(), vec!["events"]);
    }

    #[tokio::test]
    async fn empty_events_fall_back_to_notes() {
        let crm = ScriptedHistory::new(Ok(Vec::new()), Ok(vec![note("Buenas")]));

        let transcript = reconciler().transcript(&crm, LeadId(7), "Otra cosa").await;

        assert_eq!(transcript, vec![TranscriptEntry::user("Buenas")]);
        assert_eq!(crm.calls(), vec!["events", "notes"]);
    }

    #[tokio::test]
    async fn failing_sources_degrade_to_empty_transcript() {
        let crm = ScriptedHistory::new(Err(()), Err(()));

        let transcript = reconciler().transcript(&crm, LeadId(7), "Hola").await;

        assert!(transcript.is_empty());
        assert_eq!(crm.calls(), vec!["events", "notes"]);
    }

    #[tokio::test]
    async fn inbound_echo_is_deduplicated_end_to_end() {
        let crm = ScriptedHistory::new(
            Ok(vec![incoming("Hola"), outgoing("¿En qué te ayudo?"), incoming("Buenas")]),
            Ok(Vec::new()),
        );

        let transcript = reconciler().transcript(&crm, LeadId(7), "Hola").await;

        assert_eq!(
            transcript,
            vec![
                TranscriptEntry::user("Buenas"),
                TranscriptEntry::assistant("¿En qué te ayudo?"),
            ]
        );
    }
}
