//! The LLM capability boundary shared by the intent classifier (C4) and
//! the slot extractor's structured-extraction fallback (C5), and reused
//! by the fallback/RAG engine (C8). Modeled as a narrow async capability
//! rather than a base class so test code can supply fixtures without a
//! network.

use crate::error::LlmError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One chat-style message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `"system"`, `"user"`, or `"assistant"`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Build a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }

    /// Build a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }
}

/// A completion request. `response_schema`, when set, asks the provider
/// to constrain output to that JSON schema (used by the slot extractor
/// and the classifier's structured-candidates call).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Conversation so far, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature.
    pub temperature: f64,
    /// Hard deadline for the call.
    pub timeout: Duration,
    /// Optional JSON schema the response must conform to.
    pub response_schema: Option<serde_json::Value>,
}

impl CompletionRequest {
    /// A request with temperature 0 (deterministic classification/
    /// extraction) and no schema constraint.
    pub fn deterministic(messages: Vec<ChatMessage>, timeout: Duration) -> Self {
        Self { messages, temperature: 0.0, timeout, response_schema: None }
    }
}

/// A completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// The model's reply text (or serialized JSON, when a schema was
    /// requested).
    pub content: String,
    /// Model identifier that served the request, for logging.
    pub model: String,
}

/// An LLM capability: complete a request, nothing more. Bound to
/// `reqwest` in production, to fixtures in tests.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one completion call.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}
