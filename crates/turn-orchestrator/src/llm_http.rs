//! A minimal HTTP `LlmClient` for wiring the binary to a real model
//! endpoint (spec §1: the LLM endpoint is an external collaborator; this
//! is the thin adapter binding the capability trait to one).
//!
//! Deliberately small: one chat-completions-shaped request, one plain
//! text response. A deployment needing provider-specific quirks (tool
//! calls, streaming, multiple backends) would replace this with a
//! dedicated provider crate, same as the classifier and fallback engine
//! only ever see the `LlmClient` trait object.

use async_trait::async_trait;
use std::time::Duration;
use turnflow_core::error::LlmError;
use turnflow_core::llm::{ChatMessage, CompletionRequest, CompletionResponse, LlmClient};

#[derive(serde::Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f64,
}

#[derive(serde::Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(serde::Deserialize)]
struct ChatResponseBody {
    choices: Vec<Choice>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(serde::Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(serde::Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// Calls a single OpenAI-chat-completions-shaped HTTP endpoint.
pub struct HttpLlmClient {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpLlmClient {
    /// Build a client targeting `url` (the full completions endpoint),
    /// using `model` for every request.
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), url: url.into(), api_key: None, model: model.into() }
    }

    /// Attach a bearer token sent as `Authorization: Bearer <token>`.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = ChatRequestBody {
            model: &self.model,
            messages: request
                .messages
                .iter()
                .map(|m: &ChatMessage| WireMessage { role: &m.role, content: &m.content })
                .collect(),
            temperature: request.temperature,
        };

        let mut req = self.http.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let timeout = request.timeout;
        let response = tokio::time::timeout(timeout, req.send())
            .await
            .map_err(|_| LlmError::Timeout(timeout))?
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| LlmError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::Rejected(format!("http {status}: {text}")));
        }

        let parsed: ChatResponseBody =
            serde_json::from_str(&text).map_err(|e| LlmError::SchemaMismatch(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::SchemaMismatch("response has no choices".to_string()))?;

        Ok(CompletionResponse { content, model: parsed.model.unwrap_or_else(|| self.model.clone()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnflow_core::llm::ChatMessage;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn complete_parses_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "hello"}}],
                "model": "test-model"
            })))
            .mount(&server)
            .await;

        let client = HttpLlmClient::new(server.uri(), "test-model");
        let response = client
            .complete(CompletionRequest::deterministic(
                vec![ChatMessage::user("hi".to_string())],
                Duration::from_secs(5),
            ))
            .await
            .unwrap();
        assert_eq!(response.content, "hello");
    }

    #[tokio::test]
    async fn complete_rejects_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

        let client = HttpLlmClient::new(server.uri(), "test-model");
        let err = client
            .complete(CompletionRequest::deterministic(
                vec![ChatMessage::user("hi".to_string())],
                Duration::from_secs(5),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Rejected(_)));
    }
}
