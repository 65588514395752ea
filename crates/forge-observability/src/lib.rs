//! Process logging for the engine and the structured record written when a pipeline
//! run ends.
//!
//! Console output goes to stderr in compact form; the same events are written as JSON
//! lines to a daily file under the state directory. Run records use the
//! [`OBS_TARGET`] target so they can be filtered out of the general log.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder as RollingBuilder, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const OBS_TARGET: &str = "forge.obs";
const LOG_FILE_PREFIX: &str = "forge.engine";
const LOG_FILTER_ENV: &str = "FORGE_LOG";

/// Keeps the background file writer alive. Dropping it flushes and stops file logging.
pub struct LogGuard {
    _writer: WorkerGuard,
    pub logs_dir: PathBuf,
    pub kept_files: usize,
}

impl std::fmt::Debug for LogGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogGuard")
            .field("logs_dir", &self.logs_dir)
            .field("kept_files", &self.kept_files)
            .finish()
    }
}

/// Installs the global subscriber. `FORGE_LOG` (then `RUST_LOG`) picks the filter;
/// the default is `info`. At most `kept_files` daily files stay on disk.
pub fn init_logging(logs_dir: &Path, kept_files: usize) -> anyhow::Result<LogGuard> {
    std::fs::create_dir_all(logs_dir)?;
    let kept_files = kept_files.max(1);
    let appender = RollingBuilder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("jsonl")
        .max_log_files(kept_files)
        .build(logs_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        // stderr keeps stdout clean for `parse`/`estimate` JSON output
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_current_span(false)
                .with_span_list(false),
        )
        .try_init()
        .ok();

    Ok(LogGuard {
        _writer: guard,
        logs_dir: logs_dir.to_path_buf(),
        kept_files,
    })
}

/// `<state root>/logs`.
pub fn logs_dir(state_root: &Path) -> PathBuf {
    state_root.join("logs")
}

/// `FORGE_STATE_DIR`, or `.forge` under the working directory.
pub fn default_state_root() -> PathBuf {
    std::env::var_os("FORGE_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".forge"))
}

/// Prompts and responses are never logged verbatim; only their shape is.
pub fn redact_text(input: &str) -> String {
    if input.trim().is_empty() {
        return String::new();
    }
    format!(
        "<redacted {} chars, {} lines>",
        input.chars().count(),
        input.lines().count()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Full,
    RetryFinal,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::Full => "full",
            RunKind::RetryFinal => "retry_final",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        }
    }
}

/// How one pipeline run ended.
#[derive(Debug, Clone)]
pub struct RunRecord<'a> {
    pub run_id: &'a str,
    pub kind: RunKind,
    pub status: RunStatus,
    pub phase_count: u32,
    /// Model that served (or would have served) the final phase.
    pub finalizer: &'a str,
    /// Phase that failed the run.
    pub failed_phase: Option<&'a str>,
    pub operations: Option<usize>,
    pub elapsed_ms: u64,
    pub detail: Option<&'a str>,
}

macro_rules! run_record_event {
    ($level:ident, $record:expr) => {
        tracing::$level!(
            target: OBS_TARGET,
            run_id = $record.run_id,
            kind = $record.kind.as_str(),
            status = $record.status.as_str(),
            phase_count = $record.phase_count,
            finalizer = $record.finalizer,
            failed_phase = $record.failed_phase,
            operations = $record.operations,
            elapsed_ms = $record.elapsed_ms,
            detail = $record.detail,
            "pipeline run finished"
        )
    };
}

/// Failed runs are logged at `warn`, everything else at `info`.
pub fn record_run(record: &RunRecord<'_>) {
    match record.status {
        RunStatus::Failed => run_record_event!(warn, record),
        RunStatus::Completed | RunStatus::Cancelled => run_record_event!(info, record),
    }
}
