//! Top-level error taxonomy
//!
//! Subsystems carry their own typed errors (`ToolError`, `ModelError`,
//! `TemplateError`); `CascadeError` wraps them at the orchestration boundary
//! and classifies what is fatal to the cascade versus retryable per phase
//! configuration. Validators never signal failure through this type - they
//! return a `Verdict` value - so an error here is always an actual fault.

use thiserror::Error;

use crate::model::ModelError;
use crate::template::TemplateError;
use crate::tools::ToolError;
use echolog::SinkError;

/// Errors surfaced by cascade execution
#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Validation failed in phase '{phase}': {reason}")]
    Validation { phase: String, reason: String },

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Signal error: {0}")]
    Signal(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
}

impl CascadeError {
    /// Stable kind string, recorded on cascade_error events
    pub fn kind(&self) -> &'static str {
        match self {
            CascadeError::Config(_) => "config",
            CascadeError::Template(_) => "template",
            CascadeError::Tool(_) => "tool",
            CascadeError::Model(_) => "model",
            CascadeError::Validation { .. } => "validation",
            CascadeError::Routing(_) => "routing",
            CascadeError::Signal(_) => "signal",
            CascadeError::Cancelled => "cancelled",
            CascadeError::Sink(_) => "sink",
        }
    }

    /// Fatal errors abort the cascade outright; the rest retry or route per
    /// phase configuration
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CascadeError::Config(_)
                | CascadeError::Template(_)
                | CascadeError::Routing(_)
                | CascadeError::Cancelled
        )
    }

    /// Whether the phase retry policy may re-attempt after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            CascadeError::Tool(e) => e.is_retryable(),
            CascadeError::Model(e) => e.is_retryable(),
            CascadeError::Validation { .. } => true,
            _ => false,
        }
    }

    pub fn validation(phase: impl Into<String>, reason: impl Into<String>) -> Self {
        CascadeError::Validation {
            phase: phase.into(),
            reason: reason.into(),
        }
    }
}
