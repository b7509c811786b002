//! Model client abstraction
//!
//! The engine consumes chat-completion providers through the [`ModelClient`]
//! trait; nothing in this crate knows about a concrete provider.

mod client;
mod error;
mod types;

pub use client::{FnClient, ModelClient, ScriptedClient};
pub use error::ModelError;
pub use types::{ChatMessage, ChatRole, ModelRequest, ModelResponse, TokenUsage, ToolCallRequest, ToolSchema};
