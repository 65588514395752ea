use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use forge_types::{
    CallErrorKind, ModelCallError, ModelCallOutput, ModelCallRequest, ModelCallResult, ToolCall,
    TokenUsage,
};
use tokio_util::sync::CancellationToken;

use crate::retry::{classify_error_message, execute_with_retry, RetryConfig};
use crate::tokens::estimate_text_tokens;
use crate::{ProviderRegistry, StreamChunk};

/// Receives free-text progress lines ("retrying in 2s", "waiting for rate window").
pub trait StatusSink: Send + Sync {
    fn status(&self, text: String);
}

/// Sink that drops every update.
pub struct NoopStatus;

impl StatusSink for NoopStatus {
    fn status(&self, _text: String) {}
}

/// Sink that records updates in memory.
#[derive(Default, Clone)]
pub struct RecordingStatus {
    lines: Arc<Mutex<Vec<String>>>,
}

impl RecordingStatus {
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }
}

impl StatusSink for RecordingStatus {
    fn status(&self, text: String) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(text);
        }
    }
}

/// Receives incremental text while a streamed call is in flight.
pub type DeltaSink = Arc<dyn Fn(&str) + Send + Sync>;

/// The boundary every model call crosses. Failures come back as error values; a
/// cancelled call yields a `Cancelled` error kind.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(
        &self,
        request: &ModelCallRequest,
        cancel: CancellationToken,
        status: Arc<dyn StatusSink>,
    ) -> ModelCallResult;

    /// Streamed variant. The default implementation emits the whole text as one delta.
    async fn invoke_streaming(
        &self,
        request: &ModelCallRequest,
        cancel: CancellationToken,
        status: Arc<dyn StatusSink>,
        on_delta: DeltaSink,
    ) -> ModelCallResult {
        let output = self.invoke(request, cancel, status).await?;
        if !output.text.is_empty() {
            on_delta(&output.text);
        }
        Ok(output)
    }
}

/// Provider-backed invoker with retry/backoff.
#[derive(Clone)]
pub struct CallGateway {
    registry: ProviderRegistry,
    retry: RetryConfig,
}

impl CallGateway {
    pub fn new(registry: ProviderRegistry, retry: RetryConfig) -> Self {
        Self { registry, retry }
    }

    fn to_call_error(err: anyhow::Error) -> ModelCallError {
        let message = format!("{err:#}");
        ModelCallError::new(classify_error_message(&message), message)
    }

    fn retry_notice(
        status: &Arc<dyn StatusSink>,
        request: &ModelCallRequest,
    ) -> impl FnMut(u32, std::time::Duration, &ModelCallError) {
        let status = status.clone();
        let model = request.model.key();
        move |attempt: u32, delay: std::time::Duration, error: &ModelCallError| {
            status.status(format!(
                "{model}: {} error, retrying in {:.1}s (attempt {attempt})",
                error.kind.as_str(),
                delay.as_secs_f64()
            ));
        }
    }
}

#[async_trait]
impl ModelInvoker for CallGateway {
    async fn invoke(
        &self,
        request: &ModelCallRequest,
        cancel: CancellationToken,
        status: Arc<dyn StatusSink>,
    ) -> ModelCallResult {
        let provider = self
            .registry
            .select_provider(Some(&request.model.provider_id))
            .await
            .map_err(|e| ModelCallError::new(CallErrorKind::Unknown, format!("{e:#}")))?;

        tracing::debug!(
            model = %request.model,
            estimated_input_tokens = request.estimated_input_tokens,
            "invoking model"
        );

        let mut output = execute_with_retry(
            &self.retry,
            &cancel,
            Self::retry_notice(&status, request),
            || {
                let provider = provider.clone();
                async move { provider.complete(request).await.map_err(Self::to_call_error) }
            },
        )
        .await?;

        fill_missing_usage(&mut output, request);
        Ok(output)
    }

    async fn invoke_streaming(
        &self,
        request: &ModelCallRequest,
        cancel: CancellationToken,
        status: Arc<dyn StatusSink>,
        on_delta: DeltaSink,
    ) -> ModelCallResult {
        let provider = self
            .registry
            .select_provider(Some(&request.model.provider_id))
            .await
            .map_err(|e| ModelCallError::new(CallErrorKind::Unknown, format!("{e:#}")))?;

        // Retries only cover opening the stream; once deltas have been forwarded a
        // failure is terminal.
        let stream = execute_with_retry(
            &self.retry,
            &cancel,
            Self::retry_notice(&status, request),
            || {
                let provider = provider.clone();
                let cancel = cancel.clone();
                async move {
                    provider
                        .stream(request, cancel)
                        .await
                        .map_err(Self::to_call_error)
                }
            },
        )
        .await?;

        let mut output = collect_stream(stream, &cancel, on_delta).await?;
        fill_missing_usage(&mut output, request);
        Ok(output)
    }
}

fn fill_missing_usage(output: &mut ModelCallOutput, request: &ModelCallRequest) {
    if output.usage.total_tokens == 0 {
        output.usage = TokenUsage::new(
            request.estimated_input_tokens,
            estimate_text_tokens(&output.text),
        );
    }
}

async fn collect_stream(
    mut stream: crate::ChunkStream,
    cancel: &CancellationToken,
    on_delta: DeltaSink,
) -> ModelCallResult {
    let mut text = String::new();
    let mut usage = TokenUsage::default();
    let mut calls: BTreeMap<String, (String, String)> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ModelCallError::cancelled()),
            next = stream.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk.map_err(CallGateway::to_call_error)?;
        match chunk {
            StreamChunk::TextDelta(delta) => {
                on_delta(&delta);
                text.push_str(&delta);
            }
            StreamChunk::ReasoningDelta(_) => {}
            StreamChunk::ToolCallStart { id, name } => {
                if !calls.contains_key(&id) {
                    order.push(id.clone());
                }
                calls.entry(id).or_default().0 = name;
            }
            StreamChunk::ToolCallDelta { id, args_delta } => {
                if !calls.contains_key(&id) {
                    order.push(id.clone());
                }
                calls.entry(id).or_default().1.push_str(&args_delta);
            }
            StreamChunk::ToolCallEnd { .. } => {}
            StreamChunk::Done {
                finish_reason,
                usage: reported,
            } => {
                if finish_reason == "cancelled" {
                    return Err(ModelCallError::cancelled());
                }
                if let Some(reported) = reported {
                    usage = reported;
                }
            }
        }
    }

    let tool_calls = order
        .into_iter()
        .filter_map(|id| {
            let (name, args) = calls.remove(&id)?;
            let arguments = if args.trim().is_empty() {
                serde_json::Value::Object(Default::default())
            } else {
                serde_json::from_str(&args).unwrap_or(serde_json::Value::String(args))
            };
            Some(ToolCall {
                id,
                name,
                arguments,
            })
        })
        .collect::<Vec<_>>();

    Ok(ModelCallOutput {
        text,
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        usage,
    })
}
