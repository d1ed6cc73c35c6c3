#![deny(missing_docs)]
//! Fallback Engine (C8): chooses and executes the degradation strategy
//! when no configured intent matches with sufficient confidence, or
//! when a matched intent's dispatch exhausts retries. Tries a RAG
//! answer first, falls back to a canned reply if RAG is unavailable —
//! either way the turn still completes (spec §7 "FallbackFailed").

use config_registry::ConfigRegistry;
use std::sync::Arc;
use turnflow_core::id::IntentName;
use turnflow_core::llm::{ChatMessage, CompletionRequest, LlmClient};
use turnflow_core::session::{ResponseType, TurnStatus};

/// Default canned reply used when no `fallback_canned` template is
/// configured and RAG is unavailable.
pub const DEFAULT_CANNED_REPLY: &str = "抱歉，我暂时无法回答这个问题。";

/// Where the returned text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackSource {
    /// Answered by the RAG/knowledge-base call.
    Rag,
    /// RAG was unavailable or failed; a canned reply was used.
    Canned,
}

/// Result of running the fallback path for one turn.
#[derive(Debug, Clone)]
pub struct FallbackOutcome {
    /// User-facing reply text.
    pub response: String,
    /// Always `RagflowHandled` (spec §7 "FallbackFailed", §8 scenario 6):
    /// the fallback path always produces a valid business response.
    pub status: TurnStatus,
    /// `SmallTalkWithContextReturn` if a prior intent was active and not
    /// cancelled, else `QaResponse` (spec §8 scenario 6).
    pub response_type: ResponseType,
    /// Whether the reply came from RAG or the canned fallback.
    pub source: FallbackSource,
}

/// Executes the fallback/degradation strategy.
pub struct FallbackEngine {
    config: Arc<ConfigRegistry>,
    rag: Arc<dyn LlmClient>,
}

impl FallbackEngine {
    /// Build a fallback engine over a RAG capability bound the same way
    /// the classifier binds its LLM capability (spec §9 "LLM as a
    /// capability, not a base class").
    pub fn new(config: Arc<ConfigRegistry>, rag: Arc<dyn LlmClient>) -> Self {
        Self { config, rag }
    }

    /// Handle one turn's fallback. `active_intent` is the session's
    /// current intent before this turn, if any and not already
    /// cancelled — it decides the response type, not whether fallback
    /// runs.
    pub async fn handle(&self, input: &str, active_intent: Option<&IntentName>) -> FallbackOutcome {
        let response_type =
            if active_intent.is_some() { ResponseType::SmallTalkWithContextReturn } else { ResponseType::QaResponse };

        match self.try_rag(input).await {
            Some(response) => {
                FallbackOutcome { response, status: TurnStatus::RagflowHandled, response_type, source: FallbackSource::Rag }
            }
            None => {
                tracing::warn!("rag unavailable or failed, using canned fallback reply");
                FallbackOutcome {
                    response: self.canned_reply(),
                    status: TurnStatus::RagflowHandled,
                    response_type,
                    source: FallbackSource::Canned,
                }
            }
        }
    }

    async fn try_rag(&self, input: &str) -> Option<String> {
        let prompt = self
            .config
            .template("rag_prompt", None)
            .map(|t| t.body)
            .unwrap_or_else(|| "Answer the user's question concisely in the same language they used.".to_string());
        let request = CompletionRequest::deterministic(
            vec![ChatMessage::system(prompt), ChatMessage::user(input.to_string())],
            std::time::Duration::from_secs(10),
        );
        match self.rag.complete(request).await {
            Ok(response) if !response.content.trim().is_empty() => Some(response.content),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(error = %err, "rag call failed");
                None
            }
        }
    }

    fn canned_reply(&self) -> String {
        self.config.template("fallback_canned", None).map(|t| t.body).unwrap_or_else(|| DEFAULT_CANNED_REPLY.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use config_registry::{ConfigSource, RawConfig};
    use turnflow_core::config::Template;
    use turnflow_core::error::{ConfigError, LlmError};
    use turnflow_core::llm::CompletionResponse;

    struct FixedRagResponse(Result<String, ()>);

    #[async_trait]
    impl LlmClient for FixedRagResponse {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            match &self.0 {
                Ok(text) => Ok(CompletionResponse { content: text.clone(), model: "fixture".to_string() }),
                Err(()) => Err(LlmError::Timeout(std::time::Duration::from_secs(10))),
            }
        }
    }

    struct EmptySource;

    #[async_trait]
    impl ConfigSource for EmptySource {
        async fn load(&self) -> Result<RawConfig, ConfigError> {
            Ok(RawConfig::default())
        }
    }

    struct CannedTemplateSource;

    #[async_trait]
    impl ConfigSource for CannedTemplateSource {
        async fn load(&self) -> Result<RawConfig, ConfigError> {
            let mut raw = RawConfig::default();
            raw.templates.push(Template {
                template_type: "fallback_canned".to_string(),
                intent: None,
                body: "我不太明白，可以换个说法吗？".to_string(),
            });
            Ok(raw)
        }
    }

    async fn engine_with(source: impl ConfigSource + 'static, rag: Arc<dyn LlmClient>) -> FallbackEngine {
        let (registry, _report) = ConfigRegistry::load(Arc::new(source)).await.unwrap();
        FallbackEngine::new(Arc::new(registry), rag)
    }

    #[tokio::test]
    async fn successful_rag_call_is_preferred() {
        let engine = engine_with(EmptySource, Arc::new(FixedRagResponse(Ok("天气晴朗".to_string())))).await;
        let outcome = engine.handle("今天天气真好", None).await;
        assert_eq!(outcome.source, FallbackSource::Rag);
        assert_eq!(outcome.response, "天气晴朗");
        assert_eq!(outcome.status, TurnStatus::RagflowHandled);
        assert_eq!(outcome.response_type, ResponseType::QaResponse);
    }

    #[tokio::test]
    async fn rag_failure_falls_back_to_default_canned_reply() {
        let engine = engine_with(EmptySource, Arc::new(FixedRagResponse(Err(())))).await;
        let outcome = engine.handle("今天天气真好", None).await;
        assert_eq!(outcome.source, FallbackSource::Canned);
        assert_eq!(outcome.response, DEFAULT_CANNED_REPLY);
    }

    #[tokio::test]
    async fn rag_failure_prefers_configured_canned_template() {
        let engine = engine_with(CannedTemplateSource, Arc::new(FixedRagResponse(Err(())))).await;
        let outcome = engine.handle("今天天气真好", None).await;
        assert_eq!(outcome.response, "我不太明白，可以换个说法吗？");
    }

    #[tokio::test]
    async fn active_intent_uses_small_talk_response_type() {
        let engine = engine_with(EmptySource, Arc::new(FixedRagResponse(Ok("好的".to_string())))).await;
        let intent = IntentName::new("book_flight");
        let outcome = engine.handle("今天天气真好", Some(&intent)).await;
        assert_eq!(outcome.response_type, ResponseType::SmallTalkWithContextReturn);
    }
}
