use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use forge_providers::RetryConfig;
use forge_types::ModelSpec;

pub const DEFAULT_MODEL: &str = "local/echo-1";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

/// Which step of the pipeline a model serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelRole {
    Planner,
    Consolidator,
    Drafter,
    Debugger,
    Reviewer,
    Finalizer,
}

impl ModelRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelRole::Planner => "planner",
            ModelRole::Consolidator => "consolidator",
            ModelRole::Drafter => "drafter",
            ModelRole::Debugger => "debugger",
            ModelRole::Reviewer => "reviewer",
            ModelRole::Finalizer => "finalizer",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RoleModels {
    pub planner: Option<String>,
    pub consolidator: Option<String>,
    pub drafter: Option<String>,
    pub debugger: Option<String>,
    pub reviewer: Option<String>,
    pub finalizer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineSettings {
    pub phase_count: u32,
    pub replicas: usize,
    pub default_model: String,
    pub models: RoleModels,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            phase_count: 3,
            replicas: 3,
            default_model: DEFAULT_MODEL.to_string(),
            models: RoleModels::default(),
        }
    }
}

impl PipelineSettings {
    /// Model for `role`, falling back to `default_model`. Unparseable references fall
    /// back as well.
    pub fn model_for(&self, role: ModelRole) -> ModelSpec {
        let configured = match role {
            ModelRole::Planner => &self.models.planner,
            ModelRole::Consolidator => &self.models.consolidator,
            ModelRole::Drafter => &self.models.drafter,
            ModelRole::Debugger => &self.models.debugger,
            ModelRole::Reviewer => &self.models.reviewer,
            ModelRole::Finalizer => &self.models.finalizer,
        };
        configured
            .as_deref()
            .and_then(ModelSpec::parse)
            .or_else(|| ModelSpec::parse(&self.default_model))
            .unwrap_or_else(|| ModelSpec::new("local", "echo-1"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerSettings {
    pub window_secs: u64,
    pub safety_margin_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            window_secs: 60,
            safety_margin_ms: 1_000,
        }
    }
}

impl SchedulerSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_millis(self.safety_margin_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    /// Tokens-per-minute budget keyed by `provider/model`.
    #[serde(default)]
    pub rate_limits: HashMap<String, u64>,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path().await?;
        Self::with_paths(path, global_path, env_layer(), cli_overrides).await
    }

    /// Store over explicit layer sources. `new` resolves the global path and reads
    /// the environment; tests pass both in.
    pub async fn with_paths(
        project_path: impl AsRef<Path>,
        global_path: impl AsRef<Path>,
        env: Value,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path = project_path.as_ref().to_path_buf();
        let global_path = global_path.as_ref().to_path_buf();

        let mut global = read_json_file(&global_path)
            .await
            .unwrap_or_else(|_| empty_object());
        let mut project = read_json_file(&project_path)
            .await
            .unwrap_or_else(|_| empty_object());

        scrub_persisted_secrets(&mut global, &global_path).await?;
        scrub_persisted_secrets(&mut project, &project_path).await?;

        let layers = ConfigLayers {
            global,
            project,
            env,
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        tracing::debug!(
            project = %project_path.display(),
            global = %global_path.display(),
            "config layers loaded"
        );

        Ok(Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "effective config is malformed; using defaults");
                AppConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "runtime": layers.runtime,
            "cli": layers.cli
        })
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_global(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.global, &patch);
        }
        self.save_global().await?;
        Ok(self.get_effective_value().await)
    }

    /// In-memory only; never written to disk.
    pub async fn patch_runtime(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        Ok(self.get_effective_value().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }

    async fn save_global(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.global.clone();
        write_json_file(&self.global_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut to_write = value.clone();
    strip_persisted_secrets(&mut to_write);
    let raw = serde_json::to_string_pretty(&to_write)?;
    fs::write(path, raw).await?;
    Ok(())
}

/// Drops persisted API keys for providers whose key the environment already supplies.
fn strip_persisted_secrets(value: &mut Value) {
    let Some(providers) = value
        .as_object_mut()
        .and_then(|root| root.get_mut("providers"))
        .and_then(|v| v.as_object_mut())
    else {
        return;
    };
    for (provider_id, provider_cfg) in providers.iter_mut() {
        let Value::Object(cfg) = provider_cfg else {
            continue;
        };
        if !cfg.contains_key("api_key") && !cfg.contains_key("apiKey") {
            continue;
        }
        if provider_has_runtime_secret(provider_id) {
            cfg.remove("api_key");
            cfg.remove("apiKey");
        }
    }
}

async fn scrub_persisted_secrets(value: &mut Value, path: &Path) -> anyhow::Result<()> {
    let before = value.clone();
    strip_persisted_secrets(value);
    if *value != before {
        write_json_file(path, value).await?;
    }
    Ok(())
}

fn provider_has_runtime_secret(provider_id: &str) -> bool {
    provider_env_candidates(provider_id).into_iter().any(|key| {
        std::env::var(&key)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    })
}

fn provider_env_candidates(provider_id: &str) -> Vec<String> {
    let normalized = provider_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .to_ascii_uppercase();

    let mut out = vec![format!("{}_API_KEY", normalized)];
    if let Some(known) = forge_providers::provider_api_key_env(&provider_id.to_ascii_lowercase()) {
        out.push(known.to_string());
    }
    out.sort();
    out.dedup();
    out
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("FORGE_GLOBAL_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    if let Some(config_dir) = dirs::config_dir() {
        return Ok(config_dir.join("forge").join("config.json"));
    }
    Ok(PathBuf::from(".forge/global_config.json"))
}

/// Configuration contributed by process environment variables.
pub fn env_layer() -> Value {
    let mut root = empty_object();

    if let Some(count) = std::env::var("FORGE_PHASE_COUNT")
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
    {
        deep_merge(&mut root, &json!({ "pipeline": { "phase_count": count } }));
    }
    if let Some(replicas) = std::env::var("FORGE_REPLICAS")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        deep_merge(&mut root, &json!({ "pipeline": { "replicas": replicas } }));
    }
    if let Ok(model) = std::env::var("FORGE_DEFAULT_MODEL") {
        if !model.trim().is_empty() {
            deep_merge(&mut root, &json!({ "pipeline": { "default_model": model.trim() } }));
        }
    }

    add_provider_env(
        &mut root,
        "openai",
        "OPENAI_API_KEY",
        "https://api.openai.com/v1",
        "gpt-4o-mini",
    );
    add_provider_env(
        &mut root,
        "openrouter",
        "OPENROUTER_API_KEY",
        "https://openrouter.ai/api/v1",
        "openai/gpt-4o-mini",
    );
    add_provider_env(
        &mut root,
        "groq",
        "GROQ_API_KEY",
        "https://api.groq.com/openai/v1",
        "llama-3.1-8b-instant",
    );
    add_provider_env(
        &mut root,
        "mistral",
        "MISTRAL_API_KEY",
        "https://api.mistral.ai/v1",
        "mistral-small-latest",
    );
    add_provider_env(
        &mut root,
        "gemini",
        "GEMINI_API_KEY",
        "https://generativelanguage.googleapis.com/v1beta/openai",
        "gemini-1.5-flash",
    );
    add_provider_env(
        &mut root,
        "anthropic",
        "ANTHROPIC_API_KEY",
        "https://api.anthropic.com/v1",
        "claude-3-5-sonnet-latest",
    );
    if let Ok(ollama_url) = std::env::var("OLLAMA_URL") {
        deep_merge(
            &mut root,
            &json!({
                "providers": {
                    "ollama": {
                        "url": ollama_url,
                        "default_model": "llama3.1:8b"
                    }
                }
            }),
        );
    }

    root
}

fn add_provider_env(root: &mut Value, provider: &str, key_env: &str, default_url: &str, model: &str) {
    if let Ok(api_key) = std::env::var(key_env) {
        if api_key.trim().is_empty() {
            return;
        }
        deep_merge(
            root,
            &json!({
                "providers": {
                    provider: {
                        "api_key": api_key,
                        "url": default_url,
                        "default_model": model
                    }
                }
            }),
        );
    }
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

impl From<ProviderConfig> for forge_providers::ProviderConfig {
    fn from(value: ProviderConfig) -> Self {
        Self {
            api_key: value.api_key,
            url: value.url,
            default_model: value.default_model,
        }
    }
}

impl From<AppConfig> for forge_providers::AppConfig {
    fn from(value: AppConfig) -> Self {
        Self {
            providers: value
                .providers
                .into_iter()
                .map(|(k, v)| (k, v.into()))
                .collect(),
            default_provider: value.default_provider,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with(
        dir: &Path,
        global: Value,
        project: Value,
        env: Value,
        cli: Option<Value>,
    ) -> ConfigStore {
        let global_path = dir.join("global.json");
        let project_path = dir.join("project").join("config.json");
        write_json_file(&global_path, &global).await.expect("global");
        write_json_file(&project_path, &project).await.expect("project");
        ConfigStore::with_paths(&project_path, &global_path, env, cli)
            .await
            .expect("store")
    }

    #[tokio::test]
    async fn layers_merge_in_precedence_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_with(
            dir.path(),
            json!({"pipeline": {"phase_count": 6, "replicas": 2, "default_model": "openai/gpt-4o"}}),
            json!({"pipeline": {"phase_count": 9}}),
            json!({"pipeline": {"replicas": 4}}),
            Some(json!({"pipeline": {"phase_count": 12}})),
        )
        .await;

        let config = store.get().await;
        assert_eq!(config.pipeline.phase_count, 12);
        assert_eq!(config.pipeline.replicas, 4);
        assert_eq!(config.pipeline.default_model, "openai/gpt-4o");

        store
            .patch_runtime(json!({"pipeline": {"replicas": 5}}))
            .await
            .expect("patch");
        assert_eq!(store.get().await.pipeline.replicas, 5);
    }

    #[tokio::test]
    async fn missing_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::with_paths(
            dir.path().join("nope.json"),
            dir.path().join("also-nope.json"),
            empty_object(),
            None,
        )
        .await
        .expect("store");
        let config = store.get().await;
        assert_eq!(config.pipeline, PipelineSettings::default());
        assert_eq!(config.scheduler.window(), Duration::from_secs(60));
        assert_eq!(config.scheduler.safety_margin(), Duration::from_secs(1));
        assert!(config.rate_limits.is_empty());
    }

    #[tokio::test]
    async fn project_patch_is_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_with(dir.path(), json!({}), json!({}), json!({}), None).await;
        store
            .patch_project(json!({"rate_limits": {"openai/gpt-4o": 30000}}))
            .await
            .expect("patch");

        let raw = fs::read_to_string(dir.path().join("project").join("config.json"))
            .await
            .expect("read");
        let persisted: Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(persisted["rate_limits"]["openai/gpt-4o"], 30000);
        assert_eq!(store.get().await.rate_limits["openai/gpt-4o"], 30000);
    }

    #[test]
    fn role_models_fall_back_to_default_model() {
        let mut settings = PipelineSettings {
            default_model: "openai/gpt-4o-mini".to_string(),
            ..PipelineSettings::default()
        };
        settings.models.consolidator = Some("anthropic/claude-3-5-sonnet-latest".to_string());
        settings.models.drafter = Some("not a model".to_string());

        assert_eq!(
            settings.model_for(ModelRole::Consolidator).key(),
            "anthropic/claude-3-5-sonnet-latest"
        );
        assert_eq!(settings.model_for(ModelRole::Planner).key(), "openai/gpt-4o-mini");
        assert_eq!(settings.model_for(ModelRole::Drafter).key(), "openai/gpt-4o-mini");
    }

    #[test]
    fn deep_merge_skips_nulls_and_replaces_scalars() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "d": "x"});
        deep_merge(&mut base, &json!({"a": {"b": null, "c": 3}, "d": "y"}));
        assert_eq!(base, json!({"a": {"b": 1, "c": 3}, "d": "y"}));
    }

    #[test]
    fn converts_into_provider_registry_config() {
        let mut config = AppConfig::default();
        config.providers.insert(
            "openai".to_string(),
            ProviderConfig {
                api_key: Some("sk-test".to_string()),
                url: None,
                default_model: Some("gpt-4o".to_string()),
            },
        );
        config.default_provider = Some("openai".to_string());
        let converted: forge_providers::AppConfig = config.into();
        assert_eq!(converted.default_provider.as_deref(), Some("openai"));
        assert_eq!(
            converted.providers["openai"].default_model.as_deref(),
            Some("gpt-4o")
        );
    }
}
