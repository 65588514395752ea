use std::fmt;

use serde::{Deserialize, Serialize};

/// A `provider/model` reference. The rendered key identifies the model's rate window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(alias = "providerID", alias = "providerId")]
    pub provider_id: String,
    #[serde(alias = "modelID", alias = "modelId")]
    pub model_id: String,
}

impl ModelSpec {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }

    /// Parses `provider/model`. The model part may itself contain slashes
    /// (`openrouter/openai/gpt-4o-mini`).
    pub fn parse(raw: &str) -> Option<Self> {
        let (provider, model) = raw.trim().split_once('/')?;
        let provider = provider.trim();
        let model = model.trim();
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider, model))
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.provider_id, self.model_id)
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider_id: String,
    pub display_name: String,
    pub context_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keeps_nested_model_path() {
        let spec = ModelSpec::parse("openrouter/openai/gpt-4o-mini").expect("spec");
        assert_eq!(spec.provider_id, "openrouter");
        assert_eq!(spec.model_id, "openai/gpt-4o-mini");
        assert_eq!(spec.key(), "openrouter/openai/gpt-4o-mini");
    }

    #[test]
    fn parse_rejects_missing_parts() {
        assert!(ModelSpec::parse("openai").is_none());
        assert!(ModelSpec::parse("/gpt-4o").is_none());
        assert!(ModelSpec::parse("openai/ ").is_none());
    }
}
