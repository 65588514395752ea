use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use forge_core::ChangeApplier;
use forge_types::{ChatMessage, OperationResult, Role};

use crate::error::OrchestratorError;
use crate::pipeline::{PipelineOrchestrator, PipelineOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Completed {
        summary: String,
        results: Vec<OperationResult>,
    },
    Failed {
        message: String,
    },
    Cancelled,
}

/// Owns the conversation and turns pipeline outcomes into turns and applied changes.
pub struct ChatSession {
    orchestrator: Arc<PipelineOrchestrator>,
    applier: Arc<dyn ChangeApplier>,
    turns: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>, applier: Arc<dyn ChangeApplier>) -> Self {
        Self {
            orchestrator,
            applier,
            turns: Vec::new(),
        }
    }

    pub fn turns(&self) -> &[ChatMessage] {
        &self.turns
    }

    pub fn orchestrator(&self) -> &Arc<PipelineOrchestrator> {
        &self.orchestrator
    }

    pub async fn submit(&mut self, text: &str, cancel: &CancellationToken) -> SubmitOutcome {
        let history = self.turns.clone();
        self.turns.push(ChatMessage::user(text));
        let placeholder = self.push_placeholder();
        let project_context = self.applier.snapshot();
        let result = self
            .orchestrator
            .run(text, &history, &project_context, cancel)
            .await;
        self.settle(placeholder, result).await
    }

    /// Replays only the final phase of the last run.
    pub async fn retry_final(&mut self, cancel: &CancellationToken) -> SubmitOutcome {
        let Some(context) = self.orchestrator.last_final_context() else {
            return SubmitOutcome::Failed {
                message: OrchestratorError::NothingToRetry.to_string(),
            };
        };
        let placeholder = self.push_placeholder();
        let result = self.orchestrator.retry_final(context, cancel).await;
        self.settle(placeholder, result).await
    }

    fn push_placeholder(&mut self) -> usize {
        self.turns.push(ChatMessage::assistant(""));
        self.turns.len() - 1
    }

    async fn settle(
        &mut self,
        placeholder: usize,
        result: Result<PipelineOutcome, OrchestratorError>,
    ) -> SubmitOutcome {
        match result {
            Ok(outcome) => {
                let summary = outcome.parsed.summary;
                self.turns[placeholder] = ChatMessage::assistant(summary.clone());
                let results = if outcome.parsed.operations.is_empty() {
                    Vec::new()
                } else {
                    let results = self.applier.apply(&outcome.parsed.operations).await;
                    self.turns
                        .push(ChatMessage::text(Role::Tool, describe_results(&results)));
                    results
                };
                tracing::info!(
                    run_id = %outcome.run_id,
                    applied = results.iter().filter(|r| r.is_ok()).count(),
                    failed = results.iter().filter(|r| !r.is_ok()).count(),
                    "submission completed"
                );
                SubmitOutcome::Completed { summary, results }
            }
            Err(OrchestratorError::Cancelled) => {
                self.turns.remove(placeholder);
                SubmitOutcome::Cancelled
            }
            Err(err) => {
                let message = err.to_string();
                self.turns[placeholder] = ChatMessage::assistant(format!("Error: {message}"));
                SubmitOutcome::Failed { message }
            }
        }
    }
}

fn describe_results(results: &[OperationResult]) -> String {
    results
        .iter()
        .map(|result| match (&result.error, &result.resolved_path) {
            (Some(error), _) => format!("failed: {} ({error})", result.operation.describe()),
            (None, Some(resolved)) => format!("ok: {} [{resolved}]", result.operation.describe()),
            (None, None) => format!("ok: {}", result.operation.describe()),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
