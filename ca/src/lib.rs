//! Cascata - declarative orchestration runtime for multi-step LLM workflows
//!
//! A cascade is a directed graph of phases; each phase is an LLM turn loop,
//! a deterministic code/SQL/shell invocation, or a blocking signal wait.
//! The runtime executes cascades correctly and observably: phase dispatch
//! and routing, per-phase turn loops with tool invocation, parallel
//! exploratory soundings with evaluator selection and reforge refinement,
//! ward validation barriers, durable signals, and a complete trace/event
//! log (the `echolog` crate) that makes every decision replayable.
//!
//! External collaborators stay behind traits: the chat-completion provider
//! ([`model::ModelClient`]), the log backend (`echolog::EventSink`), the
//! embedding model ([`context::Embedder`]), sensor polls
//! ([`signals::Sensor`]), and concrete tool implementations.
//!
//! # Modules
//!
//! - [`config`] - cascade file model, validation, run targets
//! - [`runner`] - top-level driver, routing, sub-cascades
//! - [`phase`] - phase executor: turn loop, deterministic, signal
//! - [`soundings`] - parallel candidates, evaluator, reforge
//! - [`wards`] - validators and blocking/retry/advisory semantics
//! - [`context`] - inter-phase selection and intra-phase compression
//! - [`signals`] - durable awaits, composites, webhook auth
//! - [`scheduler`] - bounded parallelism and cancellation
//! - [`replay`] - re-execution from a frozen event log

pub mod config;
pub mod context;
pub mod cost;
pub mod echo;
pub mod error;
pub mod images;
pub mod model;
pub mod phase;
pub mod replay;
pub mod runner;
pub mod runtime;
pub mod scheduler;
pub mod signals;
pub mod soundings;
pub mod template;
pub mod tools;
pub mod wards;

// Re-export commonly used types
pub use config::{
    Cascade, ContextConfig, EvaluatorConfig, EvaluatorMode, MutationMode, Phase, PhaseKind, ReforgeConfig,
    RulesConfig, RunTarget, SelectionStrategy, SignalDef, SignalKind, SoundingsConfig, WardMode, WardSpec,
    WardsConfig, parse_timeout,
};
pub use context::{Embedder, InterPhaseRequest, select_interphase};
pub use cost::record_cost_update;
pub use echo::{Echo, EchoMessage};
pub use error::CascadeError;
pub use model::{
    ChatMessage, ChatRole, FnClient, ModelClient, ModelError, ModelRequest, ModelResponse, ScriptedClient,
    TokenUsage, ToolCallRequest, ToolSchema,
};
pub use phase::{PhaseOutcome, execute_phase};
pub use replay::{MarkingSink, replay_session};
pub use runner::{CascadeRunner, RunOptions, RunResult, SubCascadeTool, SubCascadeValidator, register_sub_cascade};
pub use runtime::RunContext;
pub use scheduler::{CancelToken, Scheduler, SchedulerStats};
pub use signals::{DecisionBlock, Sensor, SignalManager, SignalOutcome, detect_decision_block, verify_webhook};
pub use soundings::{Candidate, RoundOutcome, SoundingSeat};
pub use template::{TemplateEngine, TemplateError};
pub use tools::{DeclarativeTool, FnTool, Tool, ToolError, ToolInvocation, ToolOutput, ToolRegistry};
pub use wards::{FnValidator, SchemaCheck, ShellValidator, Validator, ValidatorRegistry, Verdict, WardCheck};
