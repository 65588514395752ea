//! Scripted in-memory model invoker for tests and offline demos.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use forge_providers::{estimate_text_tokens, ModelInvoker, StatusSink};
use forge_types::{
    CallErrorKind, ModelCallError, ModelCallOutput, ModelCallRequest, ModelCallResult, TokenUsage,
};

pub type Script = Arc<dyn Fn(&ModelCallRequest) -> ModelCallResult + Send + Sync>;

/// A successful reply whose usage is estimated from the text.
pub fn reply(text: impl Into<String>) -> ModelCallResult {
    let text = text.into();
    let completion = estimate_text_tokens(&text);
    Ok(ModelCallOutput::text(text, TokenUsage::new(0, completion)))
}

pub fn failure(message: impl Into<String>) -> ModelCallResult {
    Err(ModelCallError::new(CallErrorKind::Transport, message))
}

struct Route {
    script: Script,
    latency: Option<Duration>,
}

/// Answers requests by model key. Every call is logged in order.
#[derive(Default)]
pub struct ScriptedInvoker {
    routes: HashMap<String, Route>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<F>(self, model_key: &str, script: F) -> Self
    where
        F: Fn(&ModelCallRequest) -> ModelCallResult + Send + Sync + 'static,
    {
        self.route_with_latency(model_key, None, script)
    }

    /// Like [`route`](Self::route), but each call takes `latency` (tokio time) first.
    pub fn route_with_latency<F>(mut self, model_key: &str, latency: Option<Duration>, script: F) -> Self
    where
        F: Fn(&ModelCallRequest) -> ModelCallResult + Send + Sync + 'static,
    {
        self.routes.insert(
            model_key.to_string(),
            Route {
                script: Arc::new(script),
                latency,
            },
        );
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self, model_key: &str) -> usize {
        self.calls().iter().filter(|key| *key == model_key).count()
    }
}

#[async_trait]
impl ModelInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        request: &ModelCallRequest,
        cancel: CancellationToken,
        _status: Arc<dyn StatusSink>,
    ) -> ModelCallResult {
        let key = request.model.key();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(key.clone());
        }
        let Some(route) = self.routes.get(&key) else {
            return Err(ModelCallError::new(
                CallErrorKind::Unknown,
                format!("no script for model {key}"),
            ));
        };
        if let Some(latency) = route.latency {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ModelCallError::cancelled()),
                _ = tokio::time::sleep(latency) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(ModelCallError::cancelled());
        }
        (route.script)(request)
    }
}
