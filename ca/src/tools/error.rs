//! Tool error types

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during tool resolution and execution
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {name}")]
    Unknown { name: String },

    #[error("Tool '{tool}' timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    #[error("Invalid arguments for '{tool}': {reason}")]
    Usage { tool: String, reason: String },

    #[error("Tool '{tool}' IO failure: {reason}")]
    Io { tool: String, reason: String },

    #[error("Tool '{tool}' failed: {reason}")]
    Failed { tool: String, reason: String },

    #[error("Sub-cascade depth ceiling {limit} exceeded")]
    DepthExceeded { limit: u32 },
}

impl ToolError {
    pub fn usage(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        ToolError::Usage {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    pub fn io(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        ToolError::Io {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    pub fn failed(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        ToolError::Failed {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Whether the phase retry policy may re-attempt after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            ToolError::Timeout { .. } | ToolError::Io { .. } | ToolError::Failed { .. } => true,
            ToolError::Unknown { .. } | ToolError::Usage { .. } | ToolError::DepthExceeded { .. } => false,
        }
    }
}
