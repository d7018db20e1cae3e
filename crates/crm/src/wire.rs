//! Serde shapes for the Kommo v4 REST surface.
//!
//! Read types keep loosely-typed payload parts (`serde_json::Value`) where the
//! API shape varies by channel; the interesting probing happens above this
//! layer.

use leadflow_core::domain::lead::{CatalogLink, LeadPatch};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Lead {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default)]
    pub status_id: Option<u64>,
    #[serde(default)]
    pub pipeline_id: Option<u64>,
    #[serde(default)]
    pub custom_fields_values: Option<Vec<CustomFieldValues>>,
    #[serde(default, rename = "_embedded")]
    pub embedded: Option<LeadEmbedded>,
}

impl Lead {
    /// Current text of a custom field, if the lead carries one.
    pub fn field_text(&self, field_id: u64) -> Option<String> {
        self.custom_fields_values
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|field| field.field_id == field_id)
            .and_then(|field| field.values.first())
            .and_then(|entry| value_text(&entry.value))
    }

    /// Main linked contact when marked, otherwise the first one.
    pub fn primary_contact_id(&self) -> Option<u64> {
        let contacts = &self.embedded.as_ref()?.contacts;
        contacts
            .iter()
            .find(|contact| contact.is_main)
            .or_else(|| contacts.first())
            .map(|contact| contact.id)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LeadEmbedded {
    #[serde(default)]
    pub contacts: Vec<EmbeddedContact>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EmbeddedContact {
    pub id: u64,
    #[serde(default)]
    pub is_main: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CustomFieldValues {
    pub field_id: u64,
    #[serde(default)]
    pub values: Vec<CustomFieldValue>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CustomFieldValue {
    pub value: Value,
}

/// PATCH body for a single lead.
#[derive(Clone, Debug, Serialize)]
pub struct LeadUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub custom_fields_values: Vec<CustomFieldValues>,
}

impl LeadUpdate {
    pub fn from_patch(patch: &LeadPatch) -> Self {
        Self {
            pipeline_id: patch.pipeline_id,
            status_id: patch.status_id,
            // Lead prices are integral on the wire.
            price: patch.price.and_then(|price| price.round().to_i64()),
            custom_fields_values: patch
                .fields
                .iter()
                .map(|write| CustomFieldValues {
                    field_id: write.field_id,
                    values: vec![CustomFieldValue { value: Value::String(write.value.clone()) }],
                })
                .collect(),
        }
    }
}

/// One entry from the lead timeline. `value_after` stays untyped because its
/// layout differs per channel and event type.
#[derive(Clone, Debug, Deserialize)]
pub struct TimelineEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub value_after: Value,
    #[serde(default)]
    pub created_at: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LeadNote {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub note_type: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub created_at: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Talk {
    pub talk_id: u64,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub entity_id: Option<u64>,
    #[serde(default)]
    pub entity_type: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChatHandle {
    pub chat_id: String,
    #[serde(default)]
    pub contact_id: Option<u64>,
}

/// Link request attaching a catalog element to a lead.
#[derive(Clone, Debug, Serialize)]
pub struct EntityLink {
    pub to_entity_id: u64,
    pub to_entity_type: &'static str,
    pub metadata: LinkMetadata,
}

#[derive(Clone, Debug, Serialize)]
pub struct LinkMetadata {
    pub quantity: u32,
    pub catalog_id: u64,
}

impl EntityLink {
    pub fn catalog_element(link: &CatalogLink) -> Self {
        Self {
            to_entity_id: link.element_id,
            to_entity_type: "catalog_elements",
            metadata: LinkMetadata { quantity: link.quantity, catalog_id: link.catalog_id },
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventsPage {
    #[serde(rename = "_embedded")]
    pub(crate) embedded: EventsEmbedded,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct EventsEmbedded {
    #[serde(default)]
    pub(crate) events: Vec<TimelineEvent>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NotesPage {
    #[serde(rename = "_embedded")]
    pub(crate) embedded: NotesEmbedded,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct NotesEmbedded {
    #[serde(default)]
    pub(crate) notes: Vec<LeadNote>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TalksPage {
    #[serde(rename = "_embedded")]
    pub(crate) embedded: TalksEmbedded,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct TalksEmbedded {
    #[serde(default)]
    pub(crate) talks: Vec<Talk>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatsPage {
    #[serde(rename = "_embedded")]
    pub(crate) embedded: ChatsEmbedded,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ChatsEmbedded {
    #[serde(default)]
    pub(crate) chats: Vec<ChatHandle>,
}

/// Scalar payload values arrive as strings or numbers depending on channel.
pub(crate) fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use leadflow_core::domain::lead::{CatalogLink, LeadPatch};
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::{EntityLink, EventsPage, Lead, LeadUpdate, NotesPage};

    #[test]
    fn lead_parses_custom_fields_and_contacts() {
        let lead: Lead = serde_json::from_value(json!({
            "id": 128_553_042_u64,
            "name": "Ana Ruiz",
            "price": 0,
            "status_id": 201,
            "pipeline_id": 100,
            "custom_fields_values": [
                { "field_id": 7, "values": [{ "value": "Hola!" }] },
                { "field_id": 18, "values": [{ "value": 2 }] }
            ],
            "_embedded": {
                "contacts": [
                    { "id": 900 },
                    { "id": 555, "is_main": true }
                ]
            }
        }))
        .expect("lead should parse");

        assert_eq!(lead.field_text(7).as_deref(), Some("Hola!"));
        assert_eq!(lead.field_text(18).as_deref(), Some("2"));
        assert_eq!(lead.field_text(99), None);
        assert_eq!(lead.primary_contact_id(), Some(555));
    }

    #[test]
    fn lead_without_embedded_sections_still_parses() {
        let lead: Lead =
            serde_json::from_value(json!({ "id": 1 })).expect("minimal lead should parse");
        assert_eq!(lead.field_text(7), None);
        assert_eq!(lead.primary_contact_id(), None);
    }

    #[test]
    fn update_body_skips_unset_parts() {
        let update = LeadUpdate::from_patch(&LeadPatch::pipeline_migration(900, 901));
        let body = serde_json::to_value(&update).expect("serialize");

        assert_eq!(body, json!({ "pipeline_id": 900, "status_id": 901 }));
    }

    #[test]
    fn update_body_rounds_price_and_wraps_field_values() {
        let patch = LeadPatch::default()
            .with_field(7, "Con gusto te ayudo")
            .with_price(Decimal::new(89_900, 0));
        let body = serde_json::to_value(LeadUpdate::from_patch(&patch)).expect("serialize");

        assert_eq!(
            body,
            json!({
                "price": 89_900,
                "custom_fields_values": [
                    { "field_id": 7, "values": [{ "value": "Con gusto te ayudo" }] }
                ]
            })
        );
    }

    #[test]
    fn catalog_link_body_matches_the_link_endpoint_shape() {
        let link = CatalogLink { catalog_id: 5_001, element_id: 6_001, quantity: 2 };
        let body = serde_json::to_value(EntityLink::catalog_element(&link)).expect("serialize");

        assert_eq!(
            body,
            json!({
                "to_entity_id": 6_001,
                "to_entity_type": "catalog_elements",
                "metadata": { "quantity": 2, "catalog_id": 5_001 }
            })
        );
    }

    #[test]
    fn timeline_page_parses_with_loose_value_after() {
        let page: EventsPage = serde_json::from_value(json!({
            "_embedded": {
                "events": [
                    {
                        "id": "ev-1",
                        "type": "incoming_chat_message",
                        "value_after": [{ "message": { "text": "Hola" } }],
                        "created_at": 1_700_000_000
                    },
                    { "type": "lead_status_changed" }
                ]
            }
        }))
        .expect("events page should parse");

        assert_eq!(page.embedded.events.len(), 2);
        assert_eq!(page.embedded.events[0].event_type, "incoming_chat_message");
        assert!(page.embedded.events[1].value_after.is_null());
    }

    #[test]
    fn notes_page_parses_with_loose_params() {
        let page: NotesPage = serde_json::from_value(json!({
            "_embedded": {
                "notes": [
                    {
                        "id": 101,
                        "note_type": "common",
                        "params": { "text": "Cliente pide info" },
                        "created_at": 1_700_000_100
                    }
                ]
            }
        }))
        .expect("notes page should parse");

        assert_eq!(page.embedded.notes.len(), 1);
        assert_eq!(page.embedded.notes[0].params["text"], "Cliente pide info");
    }
}
