//! Agent runtime - conversation reconstruction and outcome execution
//!
//! This crate is the "brain" of the leadflow service - the orchestrator that:
//! - Rebuilds the chat transcript from CRM history records
//! - Asks the reasoning service for a decision (reply or completed order)
//! - Executes the decided outcome as a sequence of CRM writes
//!
//! # Architecture
//!
//! One inbound message runs a constrained loop:
//! 1. **Gate** (`runtime`) - Only leads in the configured sales pipeline proceed
//! 2. **Reconciliation** (`conversation`) - Timeline events → chronological transcript
//! 3. **Decision** (`llm`) - Transcript + new message → reply text or order tool call
//! 4. **Execution** (`runtime`) - Field writes, stage bounce, catalog link, migration
//!
//! # Key Types
//!
//! - `Orchestrator` - Main entry point, one instance per process (see `runtime`)
//! - `ReasoningService` - Pluggable decision boundary; `OpenAiReasoning` in production
//! - `HistoryReconciler` - Transcript reconstruction with the notes fallback
//!
//! # Safety Principle
//!
//! The reasoning service only talks and extracts. Every CRM mutation is
//! planned by the conversation flow in `leadflow-core` and performed here,
//! so a confused model can never move a lead or write a field on its own.

pub mod conversation;
pub mod llm;
pub mod runtime;
pub mod tools;

pub use conversation::HistoryReconciler;
pub use llm::{AgentDecision, OpenAiReasoning, ReasoningError, ReasoningService};
pub use runtime::{InboundMessage, MessageOutcome, Orchestrator, OrchestratorSettings};
pub use tools::{order_tool_definition, parse_order_arguments, ORDER_TOOL_NAME};
