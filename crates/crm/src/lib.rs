//! Kommo CRM integration.
//!
//! Everything that touches the CRM over HTTP lives here:
//! - **Credentials** (`store`, `auth`) - persisted OAuth tokens with a
//!   single-flight refresh ahead of expiry
//! - **Client** (`client`, `wire`) - typed v4 API calls behind the [`CrmApi`]
//!   trait so the orchestrator can run against fakes
//! - **Chat resolution** (`chat`) - the ordered fallback chain that finds a
//!   conversation's chat id

pub mod auth;
pub mod chat;
pub mod client;
pub mod store;
pub mod wire;

pub use auth::{AuthError, HttpTokenExchanger, TokenExchanger, TokenGrant, TokenManager, TokenReply};
pub use chat::{resolve_chat_id, ChatSource, RESOLUTION_CHAIN};
pub use client::{CrmApi, CrmError, KommoClient};
pub use store::{FileCredentialStore, StoreError, StoredCredentials};
pub use wire::{
    ChatHandle, CustomFieldValue, CustomFieldValues, EmbeddedContact, EntityLink, Lead,
    LeadEmbedded, LeadNote, LeadUpdate, LinkMetadata, Talk, TimelineEvent,
};
