use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Error,
}

impl PhaseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PhaseStatus::Completed | PhaseStatus::Skipped | PhaseStatus::Error
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "cycle", rename_all = "snake_case")]
pub enum PhaseKind {
    Planning,
    Consolidation,
    Drafting(u32),
    Debugging(u32),
    Reviewing(u32),
    FinalImplementation,
}

impl PhaseKind {
    pub fn id(self) -> String {
        match self {
            PhaseKind::Planning => "planning".to_string(),
            PhaseKind::Consolidation => "consolidation".to_string(),
            PhaseKind::Drafting(cycle) => format!("draft-{cycle}"),
            PhaseKind::Debugging(cycle) => format!("debug-{cycle}"),
            PhaseKind::Reviewing(cycle) => format!("review-{cycle}"),
            PhaseKind::FinalImplementation => "final".to_string(),
        }
    }

    pub fn title(self) -> String {
        match self {
            PhaseKind::Planning => "Planning".to_string(),
            PhaseKind::Consolidation => "Consolidating plan".to_string(),
            PhaseKind::Drafting(cycle) => format!("Drafting code (cycle {cycle})"),
            PhaseKind::Debugging(cycle) => format!("Debugging draft (cycle {cycle})"),
            PhaseKind::Reviewing(cycle) => format!("Reviewing feedback (cycle {cycle})"),
            PhaseKind::FinalImplementation => "Final implementation".to_string(),
        }
    }

    pub fn cycle(self) -> Option<u32> {
        match self {
            PhaseKind::Drafting(cycle) | PhaseKind::Debugging(cycle) | PhaseKind::Reviewing(cycle) => {
                Some(cycle)
            }
            _ => None,
        }
    }
}

/// Output of one replica inside a fan-out phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubResult {
    pub replica: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub id: String,
    pub title: String,
    pub kind: PhaseKind,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_results: Vec<SubResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PhaseRecord {
    pub fn pending(kind: PhaseKind) -> Self {
        Self {
            id: kind.id(),
            title: kind.title(),
            kind,
            status: PhaseStatus::Pending,
            sub_results: Vec::new(),
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Ordered phase list plus a free-text status line. Lives for one submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub run_id: String,
    pub phases: Vec<PhaseRecord>,
    pub status_line: String,
}

impl PipelineState {
    pub fn new(run_id: impl Into<String>, kinds: impl IntoIterator<Item = PhaseKind>) -> Self {
        Self {
            run_id: run_id.into(),
            phases: kinds.into_iter().map(PhaseRecord::pending).collect(),
            status_line: String::new(),
        }
    }

    pub fn phase(&self, id: &str) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn phase_mut(&mut self, id: &str) -> Option<&mut PhaseRecord> {
        self.phases.iter_mut().find(|p| p.id == id)
    }

    /// The phase currently running, if any.
    pub fn active_phase(&self) -> Option<&PhaseRecord> {
        self.phases
            .iter()
            .find(|p| p.status == PhaseStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed { message: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    PhaseUpdated {
        run_id: String,
        record: PhaseRecord,
    },
    Status {
        run_id: String,
        text: String,
    },
    OutputDelta {
        run_id: String,
        phase_id: String,
        delta: String,
    },
    Finished {
        run_id: String,
        outcome: RunOutcome,
    },
}

impl PipelineEvent {
    pub fn run_id(&self) -> &str {
        match self {
            PipelineEvent::PhaseUpdated { run_id, .. }
            | PipelineEvent::Status { run_id, .. }
            | PipelineEvent::OutputDelta { run_id, .. }
            | PipelineEvent::Finished { run_id, .. } => run_id,
        }
    }
}
