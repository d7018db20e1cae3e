pub mod audit;
pub mod config;
pub mod domain;
pub mod flows;

pub use audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink,
    TracingAuditSink,
};
pub use config::{
    AppConfig, CatalogConfig, ConfigError, ConfigOverrides, CrmConfig, DeliveryConfig,
    FieldsConfig, HistoryConfig, LoadOptions, LogFormat, LoggingConfig, PipelineConfig,
    ReasoningConfig, ReplyDelivery, ServerConfig,
};
pub use domain::lead::{CatalogLink, ContactId, FieldWrite, LeadId, LeadPatch};
pub use domain::message::{ChatRole, TranscriptEntry};
pub use domain::order::OrderDraft;
pub use flows::{
    ConversationAction, ConversationEvent, ConversationState, FlowContext, FlowDefinition,
    FlowEngine, LeadConversationFlow, TransitionError, TransitionOutcome,
};
