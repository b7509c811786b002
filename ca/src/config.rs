//! Cascade configuration model
//!
//! A cascade file (YAML or JSON) loads into these types. Unknown fields are
//! rejected at load, and [`Cascade::validate`] checks the cross-references a
//! serde pass cannot: handoff targets, routing tables, signal names, and the
//! exactly-one-kind rule for phases.
//!
//! A phase is one struct whose kind is determined by which body field is
//! present (`instructions` / `run` / `await`); [`Phase::kind`] gives the
//! typed view. This keeps serde simple while validation enforces the
//! exclusivity a tagged enum would.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CascadeError;

/// Immutable cascade configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Cascade {
    pub cascade_id: String,
    pub phases: Vec<Phase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signals: BTreeMap<String, SignalDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_context: Option<ContextConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soundings: Option<SoundingsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<u64>,

    // Accepted config surface consumed by outer layers (dashboards,
    // trigger daemons), not interpreted by the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narrator: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Vec<String>>,
}

/// Phase kind, derived from which body field is present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    Llm,
    Deterministic,
    Signal,
}

/// One phase of a cascade
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Phase {
    pub name: String,

    /// Declared successor phase names, in priority order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handoffs: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intra_context: Option<IntraContextConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wards: Option<WardsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soundings: Option<SoundingsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_input: Option<HumanInputConfig>,
    /// Enable post-hoc detection of embedded decision blocks
    #[serde(default)]
    pub decision_points: bool,

    // LLM phase body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolSelection>,
    #[serde(default)]
    pub rules: RulesConfig,

    // Deterministic phase body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    /// status-key -> successor
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routing: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    // Signal phase body
    #[serde(rename = "await", default, skip_serializing_if = "Option::is_none")]
    pub await_signal: Option<String>,
    /// response-value -> successor
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub on_signal: BTreeMap<String, String>,
    /// "abort", "skip", or an escalate phase name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
}

impl Phase {
    /// Typed view; assumes [`Cascade::validate`] has passed
    pub fn kind(&self) -> PhaseKind {
        if self.instructions.is_some() {
            PhaseKind::Llm
        } else if self.run.is_some() {
            PhaseKind::Deterministic
        } else {
            PhaseKind::Signal
        }
    }
}

/// Tool set for an LLM phase: explicit names or the `"manifest"` keyword
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolSelection {
    Keyword(String),
    Names(Vec<String>),
}

impl ToolSelection {
    pub fn is_manifest(&self) -> bool {
        matches!(self, ToolSelection::Keyword(k) if k == "manifest")
    }
}

/// Turn-loop rules for an LLM phase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Validator name evaluated after each turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_until: Option<String>,
    /// Suppress the acceptance-criterion footer in instructions
    #[serde(default)]
    pub silent: bool,
    /// Rendered as a user message on turns >= 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_prompt: Option<String>,
    /// Use the provider's structured tool-call channel
    #[serde(default = "default_true")]
    pub native_tools: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_turns() -> u32 {
    10
}

fn default_max_attempts() -> u32 {
    1
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_true() -> bool {
    true
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_attempts: default_max_attempts(),
            loop_until: None,
            silent: false,
            turn_prompt: None,
            native_tools: true,
            max_tokens: default_max_tokens(),
        }
    }
}

/// Ward lists per placement
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WardsConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre: Vec<WardSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post: Vec<WardSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub turn: Vec<WardSpec>,
}

/// A named validator with failure semantics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WardSpec {
    pub validator: String,
    #[serde(default)]
    pub mode: WardMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WardMode {
    #[default]
    Blocking,
    Retry,
    Advisory,
}

/// Parallel exploration config for a phase or a whole cascade
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SoundingsConfig {
    pub factor: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation: Option<MutationConfig>,
    /// Candidate model pool; empty means the phase's own model
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    #[serde(default)]
    pub assignment: ModelAssignment,
    /// model -> candidate count; overrides `factor` distribution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_factors: Option<BTreeMap<String, usize>>,
    /// Seed for the `random` assignment strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Validator applied to candidates before evaluation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_validator: Option<String>,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reforge: Option<ReforgeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MutationConfig {
    pub mode: MutationMode,
    /// Custom mutation templates; empty uses the built-in catalog
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationMode {
    /// A model call rephrases the instruction under a rewrite directive
    Rewrite,
    /// Prepend a selected snippet
    Augment,
    /// Append a reasoning-style hint
    Approach,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelAssignment {
    #[default]
    RoundRobin,
    Random,
}

/// Winner selection config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluatorConfig {
    #[serde(default)]
    pub mode: EvaluatorMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_quality_weight")]
    pub quality_weight: f64,
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,
    #[serde(default)]
    pub normalization: CostNormalization,
    #[serde(default)]
    pub policy: ParetoPolicy,
}

fn default_quality_weight() -> f64 {
    0.7
}

fn default_cost_weight() -> f64 {
    0.3
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            mode: EvaluatorMode::default(),
            instructions: None,
            model: None,
            quality_weight: default_quality_weight(),
            cost_weight: default_cost_weight(),
            normalization: CostNormalization::default(),
            policy: ParetoPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorMode {
    #[default]
    Llm,
    CostAware,
    Pareto,
    Aggregate,
    Human,
    Hybrid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostNormalization {
    #[default]
    MinMax,
    ZScore,
    LogScale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParetoPolicy {
    PreferCheap,
    PreferQuality,
    #[default]
    Balanced,
}

/// Iterative refinement rounds after winner selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReforgeConfig {
    pub steps: u32,
    #[serde(default = "default_factor_per_step")]
    pub factor_per_step: usize,
    pub honing_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator_override: Option<EvaluatorConfig>,
    /// Validator for early stop once quality is reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_threshold: Option<String>,
}

fn default_factor_per_step() -> usize {
    2
}

/// Inter-phase context selection config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextConfig {
    /// Source phases: names or the keywords "previous" / "first" / "all",
    /// or fully explicit per-phase specs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from: Vec<ContextSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub strategy: SelectionStrategy,
    /// Cheap model used by the llm/hybrid strategies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    /// Anchor window: last K turns of the previous phase
    #[serde(default = "default_anchor_turns")]
    pub anchor_turns: usize,
}

fn default_token_budget() -> usize {
    2000
}

fn default_anchor_turns() -> usize {
    3
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            from: Vec::new(),
            exclude: Vec::new(),
            strategy: SelectionStrategy::default(),
            model: None,
            token_budget: default_token_budget(),
            anchor_turns: default_anchor_turns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextSource {
    Name(String),
    Explicit(ExplicitSource),
}

/// Fully specified context pull from one phase; disables auto-selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExplicitSource {
    pub phase: String,
    #[serde(default)]
    pub messages: bool,
    #[serde(default = "default_true")]
    pub outputs: bool,
    #[serde(default)]
    pub images: bool,
    #[serde(default)]
    pub state: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    Heuristic,
    Semantic,
    Llm,
    Hybrid,
}

/// Intra-phase compression config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntraContextConfig {
    /// Sliding window: last W turns kept at full fidelity
    #[serde(default = "default_window")]
    pub window: usize,
    /// Truncation threshold for older assistant reasoning
    #[serde(default = "default_truncate_chars")]
    pub truncate_chars: usize,
    /// Prior attempts shown when rebuilding context for loop retries
    #[serde(default = "default_retry_attempts_shown")]
    pub retry_attempts_shown: usize,
}

fn default_window() -> usize {
    5
}

fn default_truncate_chars() -> usize {
    1500
}

fn default_retry_attempts_shown() -> usize {
    2
}

impl Default for IntraContextConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            truncate_chars: default_truncate_chars(),
            retry_attempts_shown: default_retry_attempts_shown(),
        }
    }
}

/// Human-input checkpoint config attached to a phase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HumanInputConfig {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
}

/// Retry policy for deterministic phases
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            backoff: BackoffKind::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay before the given attempt (attempt 1 is the first retry)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = match self.backoff {
            BackoffKind::Exponential => self.base_delay_ms.saturating_mul(1u64 << attempt.min(16)),
            BackoffKind::Linear => self.base_delay_ms.saturating_mul(attempt as u64 + 1),
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Linear,
}

/// Named durable condition at cascade scope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalDef {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<SignalAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
    /// Sensor poll cadence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<f64>,
    /// Timer duration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    /// Composite constituents
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(default)]
    pub combine: CompositeMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Human,
    Sensor,
    Webhook,
    Time,
    Composite,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeMode {
    All,
    #[default]
    Any,
}

/// Webhook authentication per signal definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalAuth {
    #[serde(rename = "type")]
    pub kind: SignalAuthKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAuthKind {
    Hmac,
    ApiKey,
    None,
}

/// How a deterministic `run` reference resolves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTarget {
    /// Registered tool name
    Tool(String),
    /// `python:module.path.func` - a registered native function
    Native(String),
    /// `sql:path/to/query.sql` - template-rendered query
    Sql(String),
    /// `shell:path/to/script.sh` - template-rendered script
    Shell(String),
}

impl RunTarget {
    pub fn parse(run: &str) -> RunTarget {
        if let Some(path) = run.strip_prefix("python:") {
            RunTarget::Native(path.to_string())
        } else if let Some(path) = run.strip_prefix("sql:") {
            RunTarget::Sql(path.to_string())
        } else if let Some(path) = run.strip_prefix("shell:") {
            RunTarget::Shell(path.to_string())
        } else {
            RunTarget::Tool(run.to_string())
        }
    }
}

/// Parse a timeout spec: integer seconds or `(Nh)?(Nm)?(Ns)?`
pub fn parse_timeout(spec: &str) -> Result<Duration, CascadeError> {
    let spec = spec.trim();
    if let Ok(seconds) = spec.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let re = regex::Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").unwrap();
    let captures = re
        .captures(spec)
        .filter(|c| c.get(1).is_some() || c.get(2).is_some() || c.get(3).is_some())
        .ok_or_else(|| CascadeError::Config(format!("Invalid timeout format: '{}'", spec)))?;

    let part = |i: usize| {
        captures
            .get(i)
            .map(|m| m.as_str().parse::<u64>().unwrap_or(0))
            .unwrap_or(0)
    };
    Ok(Duration::from_secs(part(1) * 3600 + part(2) * 60 + part(3)))
}

impl Cascade {
    /// Load from YAML text and validate
    pub fn from_yaml(text: &str) -> Result<Cascade, CascadeError> {
        let cascade: Cascade =
            serde_yaml::from_str(text).map_err(|e| CascadeError::Config(format!("Cascade file: {}", e)))?;
        cascade.validate()?;
        Ok(cascade)
    }

    /// Load from a JSON value and validate
    pub fn from_value(value: Value) -> Result<Cascade, CascadeError> {
        let cascade: Cascade =
            serde_json::from_value(value).map_err(|e| CascadeError::Config(format!("Cascade file: {}", e)))?;
        cascade.validate()?;
        Ok(cascade)
    }

    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Entry phase: first in the list
    pub fn entry_phase(&self) -> Result<&Phase, CascadeError> {
        self.phases
            .first()
            .ok_or_else(|| CascadeError::Config(format!("Cascade '{}' has no phases", self.cascade_id)))
    }

    /// Structural validation beyond what serde enforces
    pub fn validate(&self) -> Result<(), CascadeError> {
        if self.phases.is_empty() {
            return Err(CascadeError::Config(format!("Cascade '{}' has no phases", self.cascade_id)));
        }

        let mut seen = std::collections::HashSet::new();
        for phase in &self.phases {
            if !seen.insert(phase.name.as_str()) {
                return Err(CascadeError::Config(format!("Duplicate phase name '{}'", phase.name)));
            }
        }

        for phase in &self.phases {
            self.validate_phase(phase)?;
        }

        for def in self.signals.values() {
            if def.kind == SignalKind::Composite {
                for child in &def.children {
                    if !self.signals.contains_key(child) {
                        return Err(CascadeError::Config(format!(
                            "Composite signal references unknown signal '{}'",
                            child
                        )));
                    }
                }
            }
        }

        if let Some(soundings) = &self.soundings {
            validate_soundings(soundings, "cascade")?;
        }

        Ok(())
    }

    fn validate_phase(&self, phase: &Phase) -> Result<(), CascadeError> {
        let bodies =
            [phase.instructions.is_some(), phase.run.is_some(), phase.await_signal.is_some()].iter().filter(|b| **b).count();
        if bodies != 1 {
            return Err(CascadeError::Config(format!(
                "Phase '{}' must have exactly one of instructions/run/await, found {}",
                phase.name, bodies
            )));
        }

        for handoff in &phase.handoffs {
            if self.phase(handoff).is_none() {
                return Err(CascadeError::Config(format!(
                    "Phase '{}' hands off to unknown phase '{}'",
                    phase.name, handoff
                )));
            }
        }

        for successor in phase.routing.values().chain(phase.on_signal.values()) {
            if self.phase(successor).is_none() {
                return Err(CascadeError::Config(format!(
                    "Phase '{}' routes to unknown phase '{}'",
                    phase.name, successor
                )));
            }
        }

        if let Some(on_error) = &phase.on_error
            && self.phase(on_error).is_none()
        {
            return Err(CascadeError::Config(format!(
                "Phase '{}' on_error references unknown phase '{}'",
                phase.name, on_error
            )));
        }

        if let Some(on_timeout) = &phase.on_timeout
            && on_timeout != "abort"
            && on_timeout != "skip"
            && self.phase(on_timeout).is_none()
        {
            return Err(CascadeError::Config(format!(
                "Phase '{}' on_timeout escalates to unknown phase '{}'",
                phase.name, on_timeout
            )));
        }

        if let Some(signal) = &phase.await_signal
            && !self.signals.contains_key(signal)
        {
            return Err(CascadeError::Config(format!(
                "Phase '{}' awaits undefined signal '{}'",
                phase.name, signal
            )));
        }

        if let Some(timeout) = &phase.timeout {
            parse_timeout(timeout)?;
        }

        if let Some(tools) = &phase.tools
            && let ToolSelection::Keyword(k) = tools
            && k != "manifest"
        {
            return Err(CascadeError::Config(format!(
                "Phase '{}' tools must be a list or the keyword \"manifest\", got '{}'",
                phase.name, k
            )));
        }

        if let Some(soundings) = &phase.soundings {
            validate_soundings(soundings, &phase.name)?;
        }

        Ok(())
    }
}

fn validate_soundings(config: &SoundingsConfig, scope: &str) -> Result<(), CascadeError> {
    if config.factor == 0 {
        return Err(CascadeError::Config(format!("Soundings factor must be >= 1 in {}", scope)));
    }
    if let Some(max_parallel) = config.max_parallel
        && (max_parallel == 0 || max_parallel > config.factor)
    {
        return Err(CascadeError::Config(format!(
            "Soundings max_parallel must be in 1..=factor in {}",
            scope
        )));
    }
    if let Some(reforge) = &config.reforge
        && reforge.factor_per_step == 0
    {
        return Err(CascadeError::Config(format!(
            "Reforge factor_per_step must be >= 1 in {}",
            scope
        )));
    }
    Ok(())
}
