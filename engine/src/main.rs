use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use forge_core::{ConfigStore, EventBus, VirtualProject};
use forge_observability::{default_state_root, init_logging, logs_dir};
use forge_orchestrator::{
    parse_response, ChatSession, PhaseCount, PipelineOrchestrator, RateWindows, SubmitOutcome,
};
use forge_providers::{estimate_request_tokens, estimate_text_tokens, CallGateway, ProviderRegistry};
use forge_types::{ModelCallRequest, ModelSpec, PipelineEvent};

const LOG_FILES_KEPT: usize = 14;

const SUPPORTED_PROVIDER_IDS: [&str; 8] = [
    "openai",
    "openrouter",
    "anthropic",
    "ollama",
    "groq",
    "mistral",
    "gemini",
    "local",
];

#[derive(Parser, Debug)]
#[command(name = "forge-engine")]
#[command(about = "Headless Forge code-generation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full pipeline for one request against a workspace.
    Run {
        prompt: String,
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
        #[arg(long, env = "FORGE_PHASE_COUNT")]
        phases: Option<u32>,
        #[arg(long)]
        config: Option<String>,
        /// Write the resulting tree back to the workspace.
        #[arg(long, default_value_t = false)]
        apply: bool,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        /// Default model reference, `provider/model`.
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Parse a model response and print the operations as JSON. `-` reads stdin.
    Parse { file: String },
    /// Estimate the token cost of a text file or a JSON model request. `-` reads stdin.
    Estimate { file: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            prompt,
            workspace,
            phases,
            config,
            apply,
            api_key,
            provider,
            model,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let log_guard = init_logging(&logs_dir(&state_dir), LOG_FILES_KEPT)?;
            info!(
                logs_dir = %log_guard.logs_dir.display(),
                kept_files = log_guard.kept_files,
                "engine logging initialized"
            );

            let overrides = build_cli_overrides(api_key, provider, model, phases)?;
            let config_path = config
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace.join(".forge").join("config.json"));
            run_pipeline(&prompt, &workspace, config_path, overrides, apply).await?;
        }
        Command::Parse { file } => {
            let text = read_input(&file)?;
            let parsed = parse_response(&text);
            println!("{}", serde_json::to_string_pretty(&parsed)?);
        }
        Command::Estimate { file } => {
            let text = read_input(&file)?;
            println!("{}", serde_json::to_string_pretty(&estimate(&text))?);
        }
    }

    Ok(())
}

async fn run_pipeline(
    prompt: &str,
    workspace: &Path,
    config_path: PathBuf,
    overrides: Option<serde_json::Value>,
    apply: bool,
) -> anyhow::Result<()> {
    let store = ConfigStore::new(&config_path, overrides)
        .await
        .with_context(|| format!("loading config {}", config_path.display()))?;
    let config = store.get().await;

    let registry = ProviderRegistry::new(config.clone().into());
    let gateway = CallGateway::new(registry, config.retry.clone());
    let bus = EventBus::new();
    let orchestrator =
        PipelineOrchestrator::from_app_config(Arc::new(gateway), &config, RateWindows::new(), bus.clone())?;
    info!(
        phases = orchestrator.config().phase_count.get(),
        finalizer = %orchestrator.config().finalizer,
        "pipeline configured"
    );

    let project = Arc::new(
        VirtualProject::load_dir(workspace)
            .await
            .with_context(|| format!("reading workspace {}", workspace.display()))?,
    );
    let mut session = ChatSession::new(Arc::new(orchestrator), project.clone());

    let mut events = bus.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PipelineEvent::Status { text, .. } => eprintln!("» {text}"),
                PipelineEvent::PhaseUpdated { record, .. } if record.status.is_terminal() => {
                    eprintln!("  [{}] {:?}", record.id, record.status)
                }
                PipelineEvent::Finished { .. } => break,
                _ => {}
            }
        }
    });

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let outcome = session.submit(prompt, &cancel).await;
    let _ = printer.await;

    match outcome {
        SubmitOutcome::Completed { summary, results } => {
            println!("{summary}");
            for result in &results {
                match &result.error {
                    Some(error) => println!("  ✗ {} ({error})", result.operation.describe()),
                    None => println!("  ✓ {}", result.operation.describe()),
                }
            }
            if apply && !results.is_empty() {
                project
                    .write_dir(workspace)
                    .await
                    .with_context(|| format!("writing workspace {}", workspace.display()))?;
                info!(workspace = %workspace.display(), "changes written");
            }
            Ok(())
        }
        SubmitOutcome::Failed { message } => anyhow::bail!(message),
        SubmitOutcome::Cancelled => {
            eprintln!("cancelled");
            Ok(())
        }
    }
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
    phases: Option<u32>,
) -> anyhow::Result<Option<serde_json::Value>> {
    let provider = normalize_and_validate_provider(provider)?;
    if let Some(count) = phases {
        PhaseCount::new(count)?;
    }
    if let Some(model) = &model {
        if ModelSpec::parse(model).is_none() {
            anyhow::bail!("model must look like `provider/model`, got `{model}`");
        }
    }

    if api_key.is_none() && provider.is_none() && model.is_none() && phases.is_none() {
        return Ok(None);
    }
    let mut root = serde_json::Map::new();

    if let Some(p) = &provider {
        root.insert(
            "default_provider".to_string(),
            serde_json::Value::String(p.clone()),
        );
    }

    if let Some(k) = api_key {
        // the key belongs to the selected provider, or to the model's provider
        let target = provider
            .clone()
            .or_else(|| model.as_deref().and_then(ModelSpec::parse).map(|m| m.provider_id))
            .unwrap_or_else(|| "openai".to_string());
        let mut provider_config = serde_json::Map::new();
        provider_config.insert("api_key".to_string(), serde_json::Value::String(k));
        let mut providers = serde_json::Map::new();
        providers.insert(target, serde_json::Value::Object(provider_config));
        root.insert(
            "providers".to_string(),
            serde_json::Value::Object(providers),
        );
    }

    let mut pipeline = serde_json::Map::new();
    if let Some(m) = model {
        pipeline.insert("default_model".to_string(), serde_json::Value::String(m));
    }
    if let Some(count) = phases {
        pipeline.insert("phase_count".to_string(), serde_json::Value::from(count));
    }
    if !pipeline.is_empty() {
        root.insert("pipeline".to_string(), serde_json::Value::Object(pipeline));
    }

    Ok(Some(serde_json::Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    match flag {
        Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => default_state_root(),
    }
}

fn read_input(input: &str) -> anyhow::Result<String> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    std::fs::read_to_string(input).with_context(|| format!("reading {input}"))
}

/// A JSON model request is estimated as a request; anything else as plain text.
fn estimate(text: &str) -> serde_json::Value {
    match serde_json::from_str::<ModelCallRequest>(text) {
        Ok(request) => serde_json::json!({
            "kind": "request",
            "model": request.model.key(),
            "turns": request.turns.len(),
            "tokens": estimate_request_tokens(&request),
        }),
        Err(_) => serde_json::json!({
            "kind": "text",
            "chars": text.chars().count(),
            "tokens": estimate_text_tokens(text),
        }),
    }
}
