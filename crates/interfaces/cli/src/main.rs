use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use aigent_agent::{AgentExecutor, AgentExecutorConfig, NdjsonAuditSink, Task};
use aigent_config::AppConfig;
use aigent_exec::{ExecutionPolicy, ToolExecutor};
use aigent_llm::{Candidate, CooldownTracker, FallbackChain, LlmClient, OpenAiCompatibleClient, SystemClock};
use aigent_memory::{Compactor, CompactorConfig, SessionStore};
use aigent_tools::ToolRegistry;
use aigent_tools::builtins::{ReadFileTool, RunShellTool, WebSearchTool, WriteFileTool};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful agent. Use the available tools when they help you complete the task.";

#[derive(Debug, Parser)]
#[command(name = "aigent", version, about = "Agentic LLM orchestrator runtime")]
struct Cli {
    /// Path to a TOML config file. Missing is not an error (defaults + env apply).
    #[arg(long, default_value = "aigent.toml")]
    config: PathBuf,

    /// Identifies the conversation whose session file is loaded/saved.
    #[arg(long, default_value = "default")]
    task_id: String,

    /// The user message to send. Reads stdin when omitted.
    message: Option<String>,

    /// Directory session files and the audit log are written under.
    #[arg(long, default_value = ".aigent")]
    state_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    let message = match cli.message {
        Some(m) => m,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).context("reading message from stdin")?;
            buf.trim().to_string()
        }
    };
    if message.is_empty() {
        bail!("no message given: pass one as an argument or pipe it on stdin");
    }

    let llm = build_llm_client(&config)?;

    let workspace_root = std::env::current_dir().context("resolving workspace root")?;
    let policy = ExecutionPolicy { workspace_root: workspace_root.clone(), ..ExecutionPolicy::default() };
    let tool_registry = Arc::new(build_tool_registry(workspace_root.clone()));
    let tool_executor = Arc::new(ToolExecutor::new(policy));

    let session_store = Arc::new(SessionStore::new(cli.state_dir.join("sessions")));
    let compactor = Arc::new(Compactor::new(CompactorConfig {
        llm: Some(llm.clone()),
        store: Some(session_store.clone()),
        budget_chars: config.compaction.budget_chars,
        trigger_ratio: config.compaction.trigger_ratio,
        flusher: None,
    }));

    let audit = config
        .telemetry
        .audit_log_path
        .as_ref()
        .map(|path| Arc::new(NdjsonAuditSink::new(path.clone())) as Arc<dyn aigent_agent::AuditSink>)
        .or_else(|| Some(Arc::new(NdjsonAuditSink::new(cli.state_dir.join("audit.ndjson")))));

    let model_name = llm.model_id().to_string();
    let executor = AgentExecutor::new(AgentExecutorConfig {
        llm,
        tool_executor,
        tool_registry,
        compactor,
        session_store,
        audit,
        system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        model_name,
        max_iterations: config.agent.max_iterations,
    });

    let task = Task { id: cli.task_id, history: Vec::new() };
    let reply = executor.execute(&task, aigent_llm::ChatMessage::user(message), CancellationToken::new()).await;
    println!("{reply}");
    Ok(())
}

/// Builds the provider chain from `[primary]`/`[fallbacks]`. A single
/// configured provider still goes through `FallbackChain` so the cooldown
/// bookkeeping is uniform regardless of candidate count; the chain itself
/// stands in directly as the `LlmClient` handed to the agent loop, since
/// confidence-gated routing (`Router`) is only meaningful once a local brain
/// model is actually configured.
fn build_llm_client(config: &AppConfig) -> Result<Arc<dyn LlmClient>> {
    let providers: Vec<_> = config.primary.iter().chain(config.fallbacks.iter()).collect();
    if providers.is_empty() {
        bail!("no LLM provider configured: set [primary] in the config file or an API key env var");
    }

    let http = reqwest::Client::new();
    let cooldown = Arc::new(CooldownTracker::new(Box::new(SystemClock)));
    let candidates = providers
        .into_iter()
        .map(|p| {
            let api_key = std::env::var(&p.api_key_env).unwrap_or_default();
            Candidate {
                provider_id: p.id.clone(),
                model_id: p.model.clone(),
                client: Arc::new(OpenAiCompatibleClient::new(http.clone(), p.base_url.clone(), api_key, p.model.clone())) as Arc<dyn LlmClient>,
            }
        })
        .collect();
    let chain = Arc::new(FallbackChain::new(candidates, cooldown)) as Arc<dyn LlmClient>;

    match &config.brain {
        Some(brain) if !brain.model_id.is_empty() => {
            bail!(
                "local brain model '{}' configured under [brain] but no on-device client is wired into this build",
                brain.model_id
            );
        }
        _ => Ok(chain),
    }
}

fn build_tool_registry(workspace_root: PathBuf) -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    registry.register(Box::new(ReadFileTool { workspace_root: workspace_root.clone() }));
    registry.register(Box::new(WriteFileTool { workspace_root: workspace_root.clone() }));
    registry.register(Box::new(RunShellTool { workspace_root }));
    registry.register(Box::new(WebSearchTool { brave_api_key: std::env::var("BRAVE_API_KEY").ok() }));
    registry
}
