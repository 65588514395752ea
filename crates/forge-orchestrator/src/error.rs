use thiserror::Error;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("phase count must be one of 3, 6, 9 or 12 (got {0})")]
pub struct PhaseCountError(pub u32);

/// Raised by the scheduler when a run is cancelled between or during batches.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("scheduling cancelled")]
pub struct Cancelled;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    /// User-initiated stop. Not a failure; callers should not render it as one.
    #[error("run cancelled")]
    Cancelled,
    #[error("phase `{phase}` failed: {message}")]
    PhaseFailed { phase: String, message: String },
    #[error(transparent)]
    PhaseCount(#[from] PhaseCountError),
    #[error("no final-phase context is available to retry")]
    NothingToRetry,
}

impl OrchestratorError {
    pub fn phase_failed(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PhaseFailed {
            phase: phase.into(),
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, OrchestratorError::Cancelled)
    }
}

impl From<Cancelled> for OrchestratorError {
    fn from(_: Cancelled) -> Self {
        OrchestratorError::Cancelled
    }
}
