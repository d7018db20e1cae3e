//! Reasoning service boundary.
//!
//! The orchestrator hands the reconstructed transcript plus the new inbound
//! message to a [`ReasoningService`] and gets back one of two decisions: a
//! free-text reply to deliver, or a completed order to execute. The service
//! never touches the CRM itself.

use std::time::Duration;

use async_trait::async_trait;
use leadflow_core::config::ReasoningConfig;
use leadflow_core::domain::message::TranscriptEntry;
use leadflow_core::domain::order::OrderDraft;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::tools::{order_tool_definition, parse_order_arguments, ORDER_TOOL_NAME};

const DETAIL_LIMIT: usize = 240;

/// What the model decided to do with the conversation.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentDecision {
    /// Keep the conversation going with this text.
    Reply(String),
    /// The customer confirmed; execute the captured order.
    CompleteOrder(OrderDraft),
}

#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("reasoning api key is not configured")]
    MissingApiKey,
    #[error("reasoning transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("reasoning service returned status {status}: {detail}")]
    Rejected { status: u16, detail: String },
    #[error("reasoning reply was unusable: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn decide(
        &self,
        transcript: &[TranscriptEntry],
        inbound_text: &str,
    ) -> Result<AgentDecision, ReasoningError>;
}

/// Chat-completions client with the order tool attached to every request.
pub struct OpenAiReasoning {
    http: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    system_prompt: String,
    api_key: SecretString,
}

impl OpenAiReasoning {
    pub fn new(config: &ReasoningConfig) -> Result<Self, ReasoningError> {
        let api_key = config.api_key.clone().ok_or(ReasoningError::MissingApiKey)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            system_prompt: config.system_prompt.clone(),
            api_key,
        })
    }

    fn request_body(&self, transcript: &[TranscriptEntry], inbound_text: &str) -> Value {
        let mut messages = Vec::with_capacity(transcript.len() + 2);
        messages.push(json!({ "role": "system", "content": self.system_prompt }));
        for entry in transcript {
            messages.push(json!({ "role": entry.role.as_str(), "content": entry.text }));
        }
        messages.push(json!({ "role": "user", "content": inbound_text }));

        json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": messages,
            "tools": [order_tool_definition()],
        })
    }
}

#[async_trait]
impl ReasoningService for OpenAiReasoning {
    async fn decide(
        &self,
        transcript: &[TranscriptEntry],
        inbound_text: &str,
    ) -> Result<AgentDecision, ReasoningError> {
        let body = self.request_body(transcript, inbound_text);
        debug!(
            event_name = "reasoning.request_sent",
            model = %self.model,
            transcript_entries = transcript.len(),
            "requesting decision",
        );

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ReasoningError::Rejected {
                status: status.as_u16(),
                detail: clip_detail(&detail),
            });
        }

        let completion: ChatCompletion =
            response.json().await.map_err(|error| ReasoningError::Malformed(error.to_string()))?;
        interpret_completion(completion)
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: ToolFunction,
}

#[derive(Debug, Deserialize)]
struct ToolFunction {
    name: String,
    arguments: String,
}

/// A tool call outranks free text when the model emits both.
fn interpret_completion(completion: ChatCompletion) -> Result<AgentDecision, ReasoningError> {
    let Some(choice) = completion.choices.into_iter().next() else {
        return Err(ReasoningError::Malformed("completion carried no choices".to_string()));
    };
    let ChoiceMessage { content, tool_calls } = choice.message;

    if let Some(call) = tool_calls.into_iter().next() {
        if call.function.name != ORDER_TOOL_NAME {
            return Err(ReasoningError::Malformed(format!(
                "unsupported tool call: {}",
                call.function.name
            )));
        }
        let draft = parse_order_arguments(&call.function.arguments)
            .map_err(|error| ReasoningError::Malformed(format!("order arguments: {error}")))?;
        return Ok(AgentDecision::CompleteOrder(draft));
    }

    match content {
        Some(text) if !text.trim().is_empty() => Ok(AgentDecision::Reply(text.trim().to_string())),
        _ => Err(ReasoningError::Malformed("completion carried neither text nor tool call".to_string())),
    }
}

fn clip_detail(body: &str) -> String {
    let trimmed = body.trim();
    let mut detail: String = trimmed.chars().take(DETAIL_LIMIT).collect();
    if trimmed.chars().count() > DETAIL_LIMIT {
        detail.push('…');
    }
    detail
}
