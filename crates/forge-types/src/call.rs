use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ChatMessage, ModelSpec, ToolCall, ToolSchema};

/// An immutable model request. Built once by the phase that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCallRequest {
    pub model: ModelSpec,
    pub turns: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSchema>>,
    /// Estimated input-token cost, filled by the token estimator.
    #[serde(default)]
    pub estimated_input_tokens: u64,
}

impl ModelCallRequest {
    pub fn new(model: ModelSpec, turns: Vec<ChatMessage>) -> Self {
        Self {
            model,
            turns,
            system_instruction: None,
            tools: None,
            estimated_input_tokens: 0,
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_estimated_input_tokens(mut self, tokens: u64) -> Self {
        self.estimated_input_tokens = tokens;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelCallOutput {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl ModelCallOutput {
    pub fn text(text: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            text: text.into(),
            tool_calls: None,
            usage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    RateLimited,
    Auth,
    Timeout,
    Transport,
    InvalidResponse,
    Cancelled,
    Unknown,
}

impl CallErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CallErrorKind::RateLimited => "rate_limited",
            CallErrorKind::Auth => "auth",
            CallErrorKind::Timeout => "timeout",
            CallErrorKind::Transport => "transport",
            CallErrorKind::InvalidResponse => "invalid_response",
            CallErrorKind::Cancelled => "cancelled",
            CallErrorKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("{} model call failed: {message}", kind.as_str())]
pub struct ModelCallError {
    pub kind: CallErrorKind,
    pub message: String,
}

impl ModelCallError {
    pub fn new(kind: CallErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(CallErrorKind::Cancelled, "call cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == CallErrorKind::Cancelled
    }
}

pub type ModelCallResult = Result<ModelCallOutput, ModelCallError>;
