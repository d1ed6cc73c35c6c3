use async_trait::async_trait;
use cache_memory::MemoryCache;
use config_registry::{ConfigRegistry, ConfigSource, RawConfig};
use function_dispatcher::FunctionDispatcher;
use session_store::MemorySessionStore;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use turn_orchestrator::llm_http::HttpLlmClient;
use turn_orchestrator::{OrchestratorSettings, TurnOrchestrator};
use turnflow_core::error::{ConfigError, OrchestratorError};
use turnflow_core::llm::LlmClient;
use turnflow_core::turn::TurnRequest;

#[tokio::main]
async fn main() {
    if let Err(err) = run_cli().await {
        eprintln!("turn-orchestrator error: {err}");
        std::process::exit(1);
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

async fn run_cli() -> Result<(), CliError> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(|a| a == "--help" || a == "-h").unwrap_or(false) {
        print_usage();
        return Ok(());
    }

    let mut config_path: Option<PathBuf> = None;
    let mut prompt: Option<String> = None;
    let mut user_id = "cli-user".to_string();
    let mut session_id: Option<String> = None;
    let mut llm_url: Option<String> = None;
    let mut llm_model = "gpt-4o-mini".to_string();
    let mut llm_api_key: Option<String> = None;
    let mut rag_url: Option<String> = None;
    let mut rag_model: Option<String> = None;

    let mut remaining: Vec<String> = std::mem::take(&mut args);
    while let Some(flag) = remaining.first().cloned() {
        remaining.remove(0);
        match flag.as_str() {
            "--config" => config_path = Some(PathBuf::from(take_arg("--config", &mut remaining)?)),
            "--prompt" => prompt = Some(take_arg("--prompt", &mut remaining)?),
            "--user" => user_id = take_arg("--user", &mut remaining)?,
            "--session" => session_id = Some(take_arg("--session", &mut remaining)?),
            "--llm-url" => llm_url = Some(take_arg("--llm-url", &mut remaining)?),
            "--llm-model" => llm_model = take_arg("--llm-model", &mut remaining)?,
            "--llm-api-key" => llm_api_key = Some(take_arg("--llm-api-key", &mut remaining)?),
            "--rag-url" => rag_url = Some(take_arg("--rag-url", &mut remaining)?),
            "--rag-model" => rag_model = Some(take_arg("--rag-model", &mut remaining)?),
            other => return Err(CliError::Usage(format!("unknown flag: {other}"))),
        }
    }

    let config_path = config_path.unwrap_or_else(|| PathBuf::from("turnflow.json"));
    let source: Arc<dyn ConfigSource> = Arc::new(JsonFileConfigSource { path: config_path });
    let (config, report) = ConfigRegistry::load(source).await?;
    for err in &report {
        eprintln!("warning: {err}");
    }
    let config = Arc::new(config);

    let user_message = match prompt {
        Some(text) => text,
        None => {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer).map_err(|source| CliError::Io { path: PathBuf::from("<stdin>"), source })?;
            let trimmed = buffer.trim().to_string();
            if trimmed.is_empty() {
                return Err(CliError::Usage("missing input: pass --prompt or pipe stdin".to_string()));
            }
            trimmed
        }
    };

    let llm: Arc<dyn LlmClient> = match &llm_url {
        Some(url) => {
            let mut client = HttpLlmClient::new(url.clone(), llm_model.clone());
            if let Some(key) = &llm_api_key {
                client = client.with_api_key(key.clone());
            }
            Arc::new(client)
        }
        None => return Err(CliError::Usage("missing flag: --llm-url".to_string())),
    };
    let rag: Arc<dyn LlmClient> = match &rag_url {
        Some(url) => Arc::new(HttpLlmClient::new(url.clone(), rag_model.unwrap_or(llm_model))),
        None => llm.clone(),
    };

    let store = Arc::new(MemorySessionStore::new());
    let cache = Arc::new(MemoryCache::new());
    let dispatcher = Arc::new(FunctionDispatcher::new());
    let orchestrator =
        TurnOrchestrator::new(config, store, cache, llm, rag, dispatcher, OrchestratorSettings::default());

    let request = TurnRequest {
        user_id,
        input: user_message,
        session_id: session_id.map(turnflow_core::id::SessionId::new),
        context: None,
    };

    let envelope = orchestrator.process_turn(request).await?;
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

fn take_arg(flag: &str, remaining: &mut Vec<String>) -> Result<String, CliError> {
    if remaining.is_empty() {
        return Err(CliError::Usage(format!("missing value for {flag}")));
    }
    Ok(remaining.remove(0))
}

fn print_usage() {
    println!(
        "turn-orchestrator --llm-url URL [--config turnflow.json] [--prompt TEXT] [--user ID] [--session ID]\n\
                           [--llm-model NAME] [--llm-api-key KEY] [--rag-url URL] [--rag-model NAME]\n\
Reads the prompt from --prompt, or stdin if omitted. Prints the turn response envelope as JSON."
    );
}

struct JsonFileConfigSource {
    path: PathBuf,
}

#[async_trait]
impl ConfigSource for JsonFileConfigSource {
    async fn load(&self) -> Result<RawConfig, ConfigError> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| ConfigError::SourceUnavailable(format!("{}: {e}", self.path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| ConfigError::SourceUnavailable(format!("{}: malformed config: {e}", self.path.display())))
    }
}
