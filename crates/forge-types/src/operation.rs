use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single file-system change requested by the model. Position in the list is the
/// only identity an operation has; lists execute strictly in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileOperation {
    WriteFile {
        path: String,
        content: String,
        /// Write to `path` literally, ignoring redirects left by earlier moves.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        exact_path: bool,
    },
    CreateFolder {
        path: String,
    },
    Move {
        source: String,
        destination: String,
    },
    Delete {
        path: String,
    },
}

impl FileOperation {
    pub fn write(path: impl Into<String>, content: impl Into<String>) -> Self {
        FileOperation::WriteFile {
            path: path.into(),
            content: content.into(),
            exact_path: false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FileOperation::WriteFile { .. } => "write",
            FileOperation::CreateFolder { .. } => "createFolder",
            FileOperation::Move { .. } => "move",
            FileOperation::Delete { .. } => "delete",
        }
    }

    /// Short human-readable description used in tool-response turns.
    pub fn describe(&self) -> String {
        match self {
            FileOperation::WriteFile { path, .. } => format!("write {path}"),
            FileOperation::CreateFolder { path } => format!("createFolder {path}"),
            FileOperation::Move {
                source,
                destination,
            } => format!("move {source} -> {destination}"),
            FileOperation::Delete { path } => format!("delete {path}"),
        }
    }
}

/// Interpreter output. Either both fields are empty or at least one is populated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedResponse {
    pub summary: String,
    pub operations: Vec<FileOperation>,
}

impl ParsedResponse {
    pub fn summary_only(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            operations: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_empty() && self.operations.is_empty()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "path", rename_all = "snake_case")]
pub enum ApplyError {
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("destination already exists: {0}")]
    DestinationExists(String),
    #[error("not a folder: {0}")]
    NotAFolder(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub operation: FileOperation,
    /// Where the operation actually landed after move redirects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApplyError>,
}

impl OperationResult {
    pub fn ok(operation: FileOperation, resolved_path: Option<String>) -> Self {
        Self {
            operation,
            resolved_path,
            error: None,
        }
    }

    pub fn failed(operation: FileOperation, error: ApplyError) -> Self {
        Self {
            operation,
            resolved_path: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
