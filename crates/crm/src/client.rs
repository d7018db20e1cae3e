use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use leadflow_core::config::CrmConfig;
use leadflow_core::domain::lead::{CatalogLink, ContactId, LeadId, LeadPatch};
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;

use crate::auth::{AuthError, TokenManager};
use crate::wire::{
    ChatHandle, ChatsPage, EntityLink, EventsPage, Lead, LeadNote, LeadUpdate, NotesPage, Talk,
    TalksPage, TimelineEvent,
};

const DETAIL_LIMIT: usize = 240;

#[derive(Debug, Error)]
pub enum CrmError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("crm request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("crm returned status {status} for {operation}: {detail}")]
    Api { operation: &'static str, status: u16, detail: String },
    #[error("crm response for {operation} could not be decoded: {detail}")]
    Decode { operation: &'static str, detail: String },
    #[error("crm returned no content for {operation}")]
    Empty { operation: &'static str },
}

/// The CRM surface the orchestrator runs against. Production uses
/// [`KommoClient`]; tests substitute scripted fakes.
#[async_trait]
pub trait CrmApi: Send + Sync {
    async fn fetch_lead(&self, lead_id: LeadId) -> Result<Lead, CrmError>;
    async fn update_lead(&self, lead_id: LeadId, patch: &LeadPatch) -> Result<(), CrmError>;
    async fn lead_events(
        &self,
        lead_id: LeadId,
        limit: u32,
    ) -> Result<Vec<TimelineEvent>, CrmError>;
    async fn lead_notes(&self, lead_id: LeadId, limit: u32) -> Result<Vec<LeadNote>, CrmError>;
    async fn link_catalog_element(
        &self,
        lead_id: LeadId,
        link: &CatalogLink,
    ) -> Result<(), CrmError>;
    async fn lead_talks(&self, lead_id: LeadId) -> Result<Vec<Talk>, CrmError>;
    async fn contact_chats(&self, contact_id: ContactId) -> Result<Vec<ChatHandle>, CrmError>;
    async fn post_chat_message(&self, chat_id: &str, text: &str) -> Result<(), CrmError>;
}

pub struct KommoClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenManager>,
}

impl KommoClient {
    pub fn new(config: &CrmConfig, tokens: Arc<TokenManager>) -> Result<Self, CrmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self { http, base_url: format!("https://{}.kommo.com", config.subdomain), tokens })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// GET that maps the API's empty-collection responses (204, no body) to
    /// `None` instead of a decode failure.
    async fn get_optional<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<T>, CrmError> {
        let token = self.tokens.access_token().await?;
        let response = request.bearer_auth(token).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(api_error(operation, status, response).await);
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|error| CrmError::Decode { operation, detail: error.to_string() })
    }

    async fn send_write(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<(), CrmError> {
        let token = self.tokens.access_token().await?;
        let response = request.bearer_auth(token).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(api_error(operation, status, response).await);
        }
        Ok(())
    }
}

#[async_trait]
impl CrmApi for KommoClient {
    async fn fetch_lead(&self, lead_id: LeadId) -> Result<Lead, CrmError> {
        let operation = "leads.fetch";
        let request = self
            .http
            .get(self.url(&format!("/api/v4/leads/{lead_id}")))
            .query(&[("with", "contacts")]);

        self.get_optional(operation, request).await?.ok_or(CrmError::Empty { operation })
    }

    async fn update_lead(&self, lead_id: LeadId, patch: &LeadPatch) -> Result<(), CrmError> {
        let request = self
            .http
            .patch(self.url(&format!("/api/v4/leads/{lead_id}")))
            .json(&LeadUpdate::from_patch(patch));

        self.send_write("leads.update", request).await
    }

    async fn lead_events(
        &self,
        lead_id: LeadId,
        limit: u32,
    ) -> Result<Vec<TimelineEvent>, CrmError> {
        let request = self.http.get(self.url("/api/v4/events")).query(&[
            ("filter[entity]", "lead".to_string()),
            ("filter[entity_id]", lead_id.to_string()),
            ("limit", limit.to_string()),
        ]);

        let page: Option<EventsPage> = self.get_optional("events.list", request).await?;
        Ok(page.map(|page| page.embedded.events).unwrap_or_default())
    }

    async fn lead_notes(&self, lead_id: LeadId, limit: u32) -> Result<Vec<LeadNote>, CrmError> {
        let request = self
            .http
            .get(self.url(&format!("/api/v4/leads/{lead_id}/notes")))
            .query(&[("limit", limit.to_string())]);

        let page: Option<NotesPage> = self.get_optional("notes.list", request).await?;
        Ok(page.map(|page| page.embedded.notes).unwrap_or_default())
    }

    async fn link_catalog_element(
        &self,
        lead_id: LeadId,
        link: &CatalogLink,
    ) -> Result<(), CrmError> {
        let request = self
            .http
            .post(self.url(&format!("/api/v4/leads/{lead_id}/link")))
            .json(&vec![EntityLink::catalog_element(link)]);

        self.send_write("leads.link_catalog", request).await
    }

    async fn lead_talks(&self, lead_id: LeadId) -> Result<Vec<Talk>, CrmError> {
        let request = self.http.get(self.url("/api/v4/talks")).query(&[
            ("filter[entity_id]", lead_id.to_string()),
            ("filter[entity_type]", "lead".to_string()),
        ]);

        let page: Option<TalksPage> = self.get_optional("talks.list", request).await?;
        Ok(page.map(|page| page.embedded.talks).unwrap_or_default())
    }

    async fn contact_chats(&self, contact_id: ContactId) -> Result<Vec<ChatHandle>, CrmError> {
        let request = self
            .http
            .get(self.url("/api/v4/contacts/chats"))
            .query(&[("contact_id", contact_id.to_string())]);

        let page: Option<ChatsPage> = self.get_optional("contacts.chats", request).await?;
        Ok(page.map(|page| page.embedded.chats).unwrap_or_default())
    }

    async fn post_chat_message(&self, chat_id: &str, text: &str) -> Result<(), CrmError> {
        let request = self
            .http
            .post(self.url(&format!("/api/v4/chats/{chat_id}/messages")))
            .json(&json!({ "text": text }));

        self.send_write("chats.post_message", request).await
    }
}

async fn api_error(
    operation: &'static str,
    status: reqwest::StatusCode,
    response: reqwest::Response,
) -> CrmError {
    let detail = response.text().await.unwrap_or_default();
    CrmError::Api { operation, status: status.as_u16(), detail: clip_detail(&detail) }
}

/// Error bodies can be multi-kilobyte HTML pages; keep only a readable prefix.
pub(crate) fn clip_detail(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= DETAIL_LIMIT {
        return trimmed.to_string();
    }

    let mut clipped: String = trimmed.chars().take(DETAIL_LIMIT).collect();
    clipped.push('…');
    clipped
}

#[cfg(test)]
mod tests {
    use super::clip_detail;

    #[test]
    fn clip_detail_passes_short_bodies_through() {
        assert_eq!(clip_detail("  invalid_grant  "), "invalid_grant");
    }

    #[test]
    fn clip_detail_truncates_long_bodies_on_char_boundaries() {
        let body = "ñ".repeat(500);
        let clipped = clip_detail(&body);

        assert_eq!(clipped.chars().count(), 241);
        assert!(clipped.ends_with('…'));
    }
}
