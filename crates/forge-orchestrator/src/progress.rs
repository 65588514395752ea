use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use forge_core::EventBus;
use forge_providers::StatusSink;
use forge_types::{
    PhaseKind, PhaseRecord, PhaseStatus, PipelineEvent, PipelineState, RunOutcome, SubResult,
};

/// Writes phase transitions into the shared state snapshot and mirrors each one on the
/// event bus. Cloned into every place a run reports from.
#[derive(Clone)]
pub struct ProgressReporter {
    run_id: String,
    state: Arc<watch::Sender<PipelineState>>,
    bus: EventBus,
}

impl ProgressReporter {
    /// Replaces the published snapshot with `initial` and starts reporting for its run.
    pub fn begin(
        state: Arc<watch::Sender<PipelineState>>,
        bus: EventBus,
        initial: PipelineState,
    ) -> Self {
        let run_id = initial.run_id.clone();
        state.send_replace(initial);
        Self { run_id, state, bus }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn snapshot(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    fn update(&self, kind: PhaseKind, apply: impl FnOnce(&mut PhaseRecord)) {
        let id = kind.id();
        let mut record = None;
        self.state.send_modify(|state| {
            if let Some(phase) = state.phase_mut(&id) {
                apply(phase);
                record = Some(phase.clone());
            }
        });
        match record {
            Some(record) => self.bus.publish(PipelineEvent::PhaseUpdated {
                run_id: self.run_id.clone(),
                record,
            }),
            None => tracing::warn!(run_id = %self.run_id, phase = %id, "update for a phase that is not part of this run"),
        }
    }

    pub fn start(&self, kind: PhaseKind) {
        tracing::info!(run_id = %self.run_id, phase = %kind.id(), "phase started");
        self.update(kind, |phase| {
            phase.status = PhaseStatus::Running;
            phase.started_at = Some(Utc::now());
        });
        self.status(format!("{}...", kind.title()));
    }

    pub fn complete(&self, kind: PhaseKind, output: Option<String>, sub_results: Vec<SubResult>) {
        tracing::info!(run_id = %self.run_id, phase = %kind.id(), "phase completed");
        self.update(kind, |phase| {
            phase.status = PhaseStatus::Completed;
            phase.output = output;
            phase.sub_results = sub_results;
            phase.finished_at = Some(Utc::now());
        });
    }

    pub fn skip(&self, kind: PhaseKind) {
        tracing::debug!(run_id = %self.run_id, phase = %kind.id(), "phase skipped");
        self.update(kind, |phase| {
            phase.status = PhaseStatus::Skipped;
            phase.finished_at = Some(Utc::now());
        });
    }

    pub fn fail(&self, kind: PhaseKind, message: &str, sub_results: Vec<SubResult>) {
        tracing::warn!(run_id = %self.run_id, phase = %kind.id(), error = %message, "phase failed");
        self.update(kind, |phase| {
            phase.status = PhaseStatus::Error;
            phase.error = Some(message.to_string());
            phase.sub_results = sub_results;
            phase.finished_at = Some(Utc::now());
        });
    }

    pub fn delta(&self, kind: PhaseKind, delta: &str) {
        self.bus.publish(PipelineEvent::OutputDelta {
            run_id: self.run_id.clone(),
            phase_id: kind.id(),
            delta: delta.to_string(),
        });
    }

    pub fn finish(&self, outcome: RunOutcome) {
        self.bus.publish(PipelineEvent::Finished {
            run_id: self.run_id.clone(),
            outcome,
        });
    }
}

impl StatusSink for ProgressReporter {
    fn status(&self, text: String) {
        self.state.send_modify(|state| state.status_line = text.clone());
        self.bus.publish(PipelineEvent::Status {
            run_id: self.run_id.clone(),
            text,
        });
    }
}
