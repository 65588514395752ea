//! The multi-phase generation pipeline:
//! `plan -> consolidate -> (draft -> debug -> review)* -> final`.
//!
//! Every model call goes through the [`Scheduler`] so fan-out phases respect per-model
//! token budgets. Progress is published as [`PipelineState`] snapshots on a watch
//! channel and as [`forge_types::PipelineEvent`]s on the event bus.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use forge_core::{AppConfig, EventBus, ModelRole, PipelineSettings};
use forge_observability::{record_run, redact_text, RunKind, RunRecord, RunStatus};
use forge_providers::{DeltaSink, ModelInvoker, StatusSink};
use forge_types::{
    ChatMessage, ModelCallRequest, ModelCallResult, ModelSpec, ParsedResponse, PhaseKind,
    PhaseRecord, PhaseStatus, PipelineEvent, PipelineState, RunOutcome, SubResult,
};

use crate::error::{OrchestratorError, PhaseCountError};
use crate::interpreter;
use crate::progress::ProgressReporter;
use crate::prompts::{self, Revision};
use crate::scheduler::{CallThunk, RateWindows, Scheduler, SchedulerConfig};

/// Validated phase count: 3, 6, 9 or 12.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct PhaseCount(u32);

impl PhaseCount {
    pub const ALLOWED: [u32; 4] = [3, 6, 9, 12];

    pub fn new(count: u32) -> Result<Self, PhaseCountError> {
        if Self::ALLOWED.contains(&count) {
            Ok(Self(count))
        } else {
            Err(PhaseCountError(count))
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Number of draft/debug/review cycles.
    pub fn cycles(self) -> u32 {
        (self.0 - 2) / 3
    }

    pub fn kinds(self) -> Vec<PhaseKind> {
        let mut kinds = vec![PhaseKind::Planning, PhaseKind::Consolidation];
        for cycle in 1..=self.cycles() {
            kinds.push(PhaseKind::Drafting(cycle));
            kinds.push(PhaseKind::Debugging(cycle));
            kinds.push(PhaseKind::Reviewing(cycle));
        }
        kinds.push(PhaseKind::FinalImplementation);
        kinds
    }
}

impl Default for PhaseCount {
    fn default() -> Self {
        Self(3)
    }
}

impl TryFrom<u32> for PhaseCount {
    type Error = PhaseCountError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PhaseCount> for u32 {
    fn from(value: PhaseCount) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub phase_count: PhaseCount,
    /// Fan-out width of the planning and debugging phases.
    pub replicas: usize,
    pub planner: ModelSpec,
    pub consolidator: ModelSpec,
    pub drafter: ModelSpec,
    pub debugger: ModelSpec,
    pub reviewer: ModelSpec,
    pub finalizer: ModelSpec,
}

impl PipelineConfig {
    /// Every role served by `model`.
    pub fn uniform(model: ModelSpec) -> Self {
        Self {
            phase_count: PhaseCount::default(),
            replicas: 3,
            planner: model.clone(),
            consolidator: model.clone(),
            drafter: model.clone(),
            debugger: model.clone(),
            reviewer: model.clone(),
            finalizer: model,
        }
    }

    pub fn from_settings(settings: &PipelineSettings) -> Result<Self, PhaseCountError> {
        Ok(Self {
            phase_count: PhaseCount::new(settings.phase_count)?,
            replicas: settings.replicas.max(1),
            planner: settings.model_for(ModelRole::Planner),
            consolidator: settings.model_for(ModelRole::Consolidator),
            drafter: settings.model_for(ModelRole::Drafter),
            debugger: settings.model_for(ModelRole::Debugger),
            reviewer: settings.model_for(ModelRole::Reviewer),
            finalizer: settings.model_for(ModelRole::Finalizer),
        })
    }

    pub fn with_phase_count(mut self, phase_count: PhaseCount) -> Self {
        self.phase_count = phase_count;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas.max(1);
        self
    }
}

/// Everything the final phase needs. Retained after a run so the final phase can be
/// replayed without repeating the earlier phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalPhaseContext {
    pub user_request: String,
    /// Conversation turns the run was submitted with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ChatMessage>,
    pub master_plan: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_draft: Option<String>,
    /// Consolidated review of the final draft. `None` after an early exit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_review: Option<String>,
    #[serde(default)]
    pub project_context: String,
    /// Records of every phase before the final one, as the run left them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub earlier_phases: Vec<PhaseRecord>,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub run_id: String,
    pub parsed: ParsedResponse,
    pub final_text: String,
    pub context: FinalPhaseContext,
    pub state: PipelineState,
}

pub struct PipelineOrchestrator {
    invoker: Arc<dyn ModelInvoker>,
    scheduler: Scheduler,
    config: PipelineConfig,
    bus: EventBus,
    state: Arc<watch::Sender<PipelineState>>,
    last_final: StdMutex<Option<FinalPhaseContext>>,
}

impl PipelineOrchestrator {
    pub fn new(
        invoker: Arc<dyn ModelInvoker>,
        scheduler: Scheduler,
        config: PipelineConfig,
        bus: EventBus,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::default());
        Self {
            invoker,
            scheduler,
            config,
            bus,
            state: Arc::new(state),
            last_final: StdMutex::new(None),
        }
    }

    pub fn from_app_config(
        invoker: Arc<dyn ModelInvoker>,
        config: &AppConfig,
        windows: RateWindows,
        bus: EventBus,
    ) -> Result<Self, PhaseCountError> {
        let pipeline = PipelineConfig::from_settings(&config.pipeline)?;
        let scheduler = Scheduler::new(windows, SchedulerConfig::from_app_config(config));
        Ok(Self::new(invoker, scheduler, pipeline, bus))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.bus.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    pub fn last_final_context(&self) -> Option<FinalPhaseContext> {
        self.last_final
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn retain_final_context(&self, context: &FinalPhaseContext) {
        *self
            .last_final
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(context.clone());
    }

    /// Runs the whole pipeline for `request`. `history` holds prior conversation turns.
    pub async fn run(
        &self,
        request: &str,
        history: &[ChatMessage],
        project_context: &str,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, OrchestratorError> {
        let run_id = Uuid::new_v4().to_string();
        let progress = ProgressReporter::begin(
            self.state.clone(),
            self.bus.clone(),
            PipelineState::new(run_id.clone(), self.config.phase_count.kinds()),
        );
        tracing::info!(
            run_id = %run_id,
            phases = self.config.phase_count.get(),
            replicas = self.config.replicas,
            request = %redact_text(request),
            "pipeline run started"
        );
        let run = Run {
            orchestrator: self,
            progress,
            cancel,
            kind: RunKind::Full,
            started: Instant::now(),
            request,
            history,
            project_context,
        };
        let result = run.execute().await;
        run.finish(&result);
        result
    }

    /// Re-runs only the final phase from a retained context.
    pub async fn retry_final(
        &self,
        context: FinalPhaseContext,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, OrchestratorError> {
        let run_id = Uuid::new_v4().to_string();
        let mut initial = PipelineState::new(run_id.clone(), self.config.phase_count.kinds());
        restore_earlier_phases(&mut initial, &context);
        let progress = ProgressReporter::begin(self.state.clone(), self.bus.clone(), initial);
        tracing::info!(run_id = %run_id, "retrying final phase");
        let run = Run {
            orchestrator: self,
            progress,
            cancel,
            kind: RunKind::RetryFinal,
            started: Instant::now(),
            request: &context.user_request,
            history: &context.history,
            project_context: &context.project_context,
        };
        let result = match run.ensure_active() {
            Ok(()) => run.final_phase(context.clone()).await,
            Err(err) => Err(err),
        };
        run.finish(&result);
        result
    }
}

/// Puts back the records `context` kept for the phases before the final one. Without
/// kept records, those phases are marked completed and filled from the artifacts.
fn restore_earlier_phases(state: &mut PipelineState, context: &FinalPhaseContext) {
    if !context.earlier_phases.is_empty() {
        for phase in state.phases.iter_mut() {
            if phase.kind == PhaseKind::FinalImplementation {
                continue;
            }
            if let Some(kept) = context.earlier_phases.iter().find(|p| p.id == phase.id) {
                *phase = kept.clone();
            }
        }
        return;
    }

    let last_draft = state
        .phases
        .iter()
        .rev()
        .find(|p| matches!(p.kind, PhaseKind::Drafting(_)))
        .map(|p| p.id.clone());
    let last_review = state
        .phases
        .iter()
        .rev()
        .find(|p| matches!(p.kind, PhaseKind::Reviewing(_)))
        .map(|p| p.id.clone());
    for phase in state.phases.iter_mut() {
        if phase.kind == PhaseKind::FinalImplementation {
            continue;
        }
        phase.status = PhaseStatus::Completed;
        if phase.kind == PhaseKind::Consolidation {
            phase.output = Some(context.master_plan.clone());
        } else if Some(&phase.id) == last_draft.as_ref() {
            phase.output = context.final_draft.clone();
        } else if Some(&phase.id) == last_review.as_ref() {
            phase.output = context.final_review.clone();
        }
    }
}

/// Splits fan-out results into successful texts and per-replica records.
fn collect_replicas(results: Vec<ModelCallResult>) -> (Vec<String>, Vec<SubResult>, Option<String>) {
    let mut texts = Vec::new();
    let mut sub_results = Vec::with_capacity(results.len());
    let mut first_error = None;
    for (replica, result) in results.into_iter().enumerate() {
        match result {
            Ok(output) => {
                texts.push(output.text.clone());
                sub_results.push(SubResult {
                    replica,
                    output: Some(output.text),
                    error: None,
                });
            }
            Err(err) => {
                let message = err.to_string();
                first_error.get_or_insert_with(|| message.clone());
                sub_results.push(SubResult {
                    replica,
                    output: None,
                    error: Some(message),
                });
            }
        }
    }
    (texts, sub_results, first_error)
}

/// One submission's worth of borrowed inputs plus its progress reporter.
struct Run<'a> {
    orchestrator: &'a PipelineOrchestrator,
    progress: ProgressReporter,
    cancel: &'a CancellationToken,
    kind: RunKind,
    started: Instant,
    request: &'a str,
    history: &'a [ChatMessage],
    project_context: &'a str,
}

impl Run<'_> {
    fn config(&self) -> &PipelineConfig {
        &self.orchestrator.config
    }

    fn ensure_active(&self) -> Result<(), OrchestratorError> {
        if self.cancel.is_cancelled() {
            Err(OrchestratorError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn finish(&self, result: &Result<PipelineOutcome, OrchestratorError>) {
        let (outcome, status) = match result {
            Ok(_) => (RunOutcome::Completed, RunStatus::Completed),
            Err(OrchestratorError::Cancelled) => (RunOutcome::Cancelled, RunStatus::Cancelled),
            Err(err) => (
                RunOutcome::Failed {
                    message: err.to_string(),
                },
                RunStatus::Failed,
            ),
        };
        let detail = match &outcome {
            RunOutcome::Failed { message } => Some(message.as_str()),
            _ => None,
        };
        let finalizer = self.config().finalizer.key();
        record_run(&RunRecord {
            run_id: self.progress.run_id(),
            kind: self.kind,
            status,
            phase_count: self.config().phase_count.get(),
            finalizer: &finalizer,
            failed_phase: match result {
                Err(OrchestratorError::PhaseFailed { phase, .. }) => Some(phase.as_str()),
                _ => None,
            },
            operations: result.as_ref().ok().map(|o| o.parsed.operations.len()),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            detail,
        });
        self.progress.status(
            match status {
                RunStatus::Completed => "Done.",
                RunStatus::Cancelled => "Cancelled.",
                RunStatus::Failed => "Failed.",
            }
            .to_string(),
        );
        self.progress.finish(outcome);
    }

    fn status_sink(&self) -> Arc<dyn StatusSink> {
        Arc::new(self.progress.clone())
    }

    /// Sends `requests` through the scheduler as one fan-out against `model`.
    async fn schedule(
        &self,
        model: &ModelSpec,
        requests: Vec<ModelCallRequest>,
    ) -> Result<Vec<ModelCallResult>, OrchestratorError> {
        let per_call = requests
            .iter()
            .map(|r| r.estimated_input_tokens)
            .max()
            .unwrap_or_default();
        let calls = requests
            .into_iter()
            .map(|request| {
                let invoker = self.orchestrator.invoker.clone();
                let cancel = self.cancel.clone();
                let status = self.status_sink();
                async move { invoker.invoke(&request, cancel, status).await }.boxed()
            })
            .collect::<Vec<CallThunk<'static>>>();
        let results = self
            .orchestrator
            .scheduler
            .run(model, per_call, calls, self.cancel, &self.progress)
            .await?;
        self.ensure_active()?;
        Ok(results)
    }

    /// Marks `kind` failed and returns the matching error.
    fn fail(&self, kind: PhaseKind, message: String, sub_results: Vec<SubResult>) -> OrchestratorError {
        self.progress.fail(kind, &message, sub_results);
        OrchestratorError::phase_failed(kind.id(), message)
    }

    /// Fan-out phase: `replicas` calls, succeeding while at least one call does.
    async fn fan_out(
        &self,
        kind: PhaseKind,
        model: &ModelSpec,
        request: ModelCallRequest,
    ) -> Result<(Vec<String>, Vec<SubResult>), OrchestratorError> {
        let replicas = self.config().replicas.max(1);
        let requests = vec![request; replicas];
        let results = self.schedule(model, requests).await?;
        let (texts, sub_results, first_error) = collect_replicas(results);
        if texts.is_empty() {
            let message = format!(
                "all {replicas} {} calls failed: {}",
                model.key(),
                first_error.unwrap_or_default()
            );
            return Err(self.fail(kind, message, sub_results));
        }
        Ok((texts, sub_results))
    }

    /// Single-call phase; completes the phase with the call's text.
    async fn single(
        &self,
        kind: PhaseKind,
        model: &ModelSpec,
        request: ModelCallRequest,
    ) -> Result<String, OrchestratorError> {
        let result = self
            .schedule(model, vec![request])
            .await?
            .into_iter()
            .next();
        match result {
            Some(Ok(output)) => {
                self.progress
                    .complete(kind, Some(output.text.clone()), Vec::new());
                Ok(output.text)
            }
            Some(Err(err)) => Err(self.fail(kind, err.to_string(), Vec::new())),
            None => Err(self.fail(kind, "no result returned".to_string(), Vec::new())),
        }
    }

    async fn execute(&self) -> Result<PipelineOutcome, OrchestratorError> {
        let config = self.config();

        self.ensure_active()?;
        self.progress.start(PhaseKind::Planning);
        let plan_request = prompts::planner(self.request, self.project_context)
            .into_request(&config.planner, self.history);
        let (plans, sub_results) = self
            .fan_out(PhaseKind::Planning, &config.planner, plan_request)
            .await?;
        tracing::debug!(plans = plans.len(), "planning produced candidate plans");
        self.progress
            .complete(PhaseKind::Planning, None, sub_results);

        self.ensure_active()?;
        self.progress.start(PhaseKind::Consolidation);
        let consolidate_request = prompts::consolidation(self.request, &plans)
            .into_request(&config.consolidator, self.history);
        let master_plan = self
            .single(PhaseKind::Consolidation, &config.consolidator, consolidate_request)
            .await?;

        let mut final_draft: Option<String> = None;
        let mut final_review: Option<String> = None;
        let cycles = config.phase_count.cycles();

        for cycle in 1..=cycles {
            self.ensure_active()?;
            let draft_kind = PhaseKind::Drafting(cycle);
            self.progress.start(draft_kind);
            let revision = match (&final_draft, &final_review) {
                (Some(draft), Some(review)) => Some(Revision { draft, review }),
                _ => None,
            };
            let draft_request = prompts::draft(self.request, &master_plan, revision, self.project_context)
                .into_request(&config.drafter, self.history);
            let draft = self.single(draft_kind, &config.drafter, draft_request).await?;
            final_draft = Some(draft.clone());
            final_review = None;

            self.ensure_active()?;
            let debug_kind = PhaseKind::Debugging(cycle);
            self.progress.start(debug_kind);
            let debug_request = prompts::debug(self.request, &master_plan, &draft)
                .into_request(&config.debugger, self.history);
            let (reports, sub_results) = self
                .fan_out(debug_kind, &config.debugger, debug_request)
                .await?;
            let feedback = reports
                .into_iter()
                .filter(|report| !prompts::signals_no_issues(report))
                .collect::<Vec<_>>();
            self.progress.complete(
                debug_kind,
                Some(format!("{} replica(s) reported issues", feedback.len())),
                sub_results,
            );

            if feedback.is_empty() {
                tracing::info!(cycle, "no issues reported; skipping remaining cycles");
                self.progress.skip(PhaseKind::Reviewing(cycle));
                for later in cycle + 1..=cycles {
                    self.progress.skip(PhaseKind::Drafting(later));
                    self.progress.skip(PhaseKind::Debugging(later));
                    self.progress.skip(PhaseKind::Reviewing(later));
                }
                break;
            }

            self.ensure_active()?;
            let review_kind = PhaseKind::Reviewing(cycle);
            self.progress.start(review_kind);
            let review_request = prompts::review(self.request, &draft, &feedback)
                .into_request(&config.reviewer, self.history);
            let review = self.single(review_kind, &config.reviewer, review_request).await?;
            final_review = Some(review);
        }

        self.ensure_active()?;
        let earlier_phases = self
            .progress
            .snapshot()
            .phases
            .into_iter()
            .filter(|p| p.kind != PhaseKind::FinalImplementation)
            .collect();
        let context = FinalPhaseContext {
            user_request: self.request.to_string(),
            history: self.history.to_vec(),
            master_plan,
            final_draft,
            final_review,
            project_context: self.project_context.to_string(),
            earlier_phases,
        };
        self.orchestrator.retain_final_context(&context);
        self.final_phase(context).await
    }

    async fn final_phase(&self, context: FinalPhaseContext) -> Result<PipelineOutcome, OrchestratorError> {
        let kind = PhaseKind::FinalImplementation;
        let model = &self.config().finalizer;
        self.progress.start(kind);

        let request = prompts::final_implementation(&context).into_request(model, self.history);
        let per_call = request.estimated_input_tokens;
        let invoker = self.orchestrator.invoker.clone();
        let cancel = self.cancel.clone();
        let status = self.status_sink();
        let reporter = self.progress.clone();
        let on_delta: DeltaSink = Arc::new(move |delta: &str| reporter.delta(kind, delta));
        let call: CallThunk<'static> =
            async move { invoker.invoke_streaming(&request, cancel, status, on_delta).await }.boxed();

        let result = self
            .orchestrator
            .scheduler
            .run(model, per_call, vec![call], self.cancel, &self.progress)
            .await?
            .into_iter()
            .next();
        self.ensure_active()?;

        let output = match result {
            Some(Ok(output)) => output,
            Some(Err(err)) => return Err(self.fail(kind, err.to_string(), Vec::new())),
            None => return Err(self.fail(kind, "no result returned".to_string(), Vec::new())),
        };
        let parsed = interpreter::parse(&output.text);
        tracing::info!(
            operations = parsed.operations.len(),
            response = %redact_text(&output.text),
            "final phase parsed"
        );
        self.progress.complete(kind, Some(output.text.clone()), Vec::new());

        Ok(PipelineOutcome {
            run_id: self.progress.run_id().to_string(),
            parsed,
            final_text: output.text,
            context,
            state: self.progress.snapshot(),
        })
    }
}
