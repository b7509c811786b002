//! Wards - validation barriers around and inside phases
//!
//! A validator returns a [`Verdict`] value; failure is data, not an error.
//! Real errors (a validator script crashing, a missing registration) still
//! surface as `CascadeError` and escalate. The ward runner applies
//! blocking/retry/advisory semantics and writes one `ward` event per check.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::{WardMode, WardSpec};
use crate::error::CascadeError;
use echolog::{EventRecord, EventSink, NodeType, TraceNode};

/// Outcome of one validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub valid: bool,
    pub reason: String,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            valid: true,
            reason: String::new(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: reason.into(),
        }
    }
}

/// A named validation function
#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    /// Purpose line, used for the loop_until acceptance-criterion footer
    fn purpose(&self) -> &str {
        ""
    }

    async fn validate(&self, target: &Value) -> Result<Verdict, CascadeError>;
}

/// Validator backed by a synchronous closure
pub struct FnValidator<F> {
    name: String,
    purpose: String,
    f: F,
}

impl<F> FnValidator<F>
where
    F: Fn(&Value) -> Verdict + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            purpose: String::new(),
            f,
        }
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = purpose.into();
        self
    }
}

#[async_trait]
impl<F> Validator for FnValidator<F>
where
    F: Fn(&Value) -> Verdict + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn purpose(&self) -> &str {
        &self.purpose
    }

    async fn validate(&self, target: &Value) -> Result<Verdict, CascadeError> {
        Ok((self.f)(target))
    }
}

/// Inline polyglot snippet validator
///
/// Runs a shell command with the target as JSON on stdin; the command must
/// print a `{"valid": bool, "reason": string}` object. Anything else is an
/// actual error, not a failed verdict.
pub struct ShellValidator {
    name: String,
    command: String,
}

impl ShellValidator {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

#[async_trait]
impl Validator for ShellValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, target: &Value) -> Result<Verdict, CascadeError> {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| CascadeError::Config(format!("Validator '{}' failed to spawn: {}", self.name, e)))?;

        let payload = serde_json::to_vec(target).unwrap_or_default();
        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| CascadeError::Config(format!("Validator '{}' stdin: {}", self.name, e)))?;
        }
        drop(child.stdin.take());

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CascadeError::Config(format!("Validator '{}': {}", self.name, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str::<Verdict>(stdout.trim()).map_err(|_| {
            CascadeError::Config(format!(
                "Validator '{}' produced no verdict (stdout: {:?})",
                self.name,
                stdout.trim()
            ))
        })
    }
}

/// Named validator lookup
#[derive(Default)]
pub struct ValidatorRegistry {
    validators: RwLock<HashMap<String, Arc<dyn Validator>>>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, validator: Arc<dyn Validator>) {
        self.validators
            .write()
            .unwrap()
            .insert(validator.name().to_string(), validator);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Validator>, CascadeError> {
        self.validators
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| CascadeError::Config(format!("Unknown validator '{}'", name)))
    }

    pub fn has(&self, name: &str) -> bool {
        self.validators.read().unwrap().contains_key(name)
    }
}

/// Result of running a ward list
#[derive(Debug, Clone)]
pub enum WardCheck {
    Passed,
    Failed {
        validator: String,
        mode: WardMode,
        reason: String,
        max_attempts: u32,
    },
}

impl WardCheck {
    pub fn passed(&self) -> bool {
        matches!(self, WardCheck::Passed)
    }
}

/// Run a ward list in order, emitting one `ward` event per check
///
/// Advisory failures are logged and skipped; the first blocking or retry
/// failure short-circuits. Actual validator errors propagate immediately.
#[allow(clippy::too_many_arguments)]
pub async fn run_ward_list(
    validators: &ValidatorRegistry,
    sink: &dyn EventSink,
    session_id: &str,
    phase_name: &str,
    parent: &TraceNode,
    specs: &[WardSpec],
    target: &Value,
    attempt: u32,
) -> Result<WardCheck, CascadeError> {
    for spec in specs {
        let validator = validators.get(&spec.validator)?;
        let verdict = validator.validate(target).await?;

        let node = parent.child(NodeType::Ward);
        sink.append(
            EventRecord::new(session_id, &node)
                .with_phase(phase_name)
                .with_attempt(attempt)
                .with_content(json!({
                    "validator": spec.validator,
                    "mode": spec.mode,
                    "valid": verdict.valid,
                    "reason": verdict.reason,
                }))
                .with_semantic_actor("ward_runner"),
        )
        .await?;

        if verdict.valid {
            continue;
        }

        match spec.mode {
            WardMode::Advisory => {
                warn!(phase = phase_name, validator = %spec.validator, reason = %verdict.reason, "advisory ward failed");
            }
            mode => {
                debug!(phase = phase_name, validator = %spec.validator, ?mode, "ward failed");
                return Ok(WardCheck::Failed {
                    validator: spec.validator.clone(),
                    mode,
                    reason: verdict.reason,
                    max_attempts: spec.max_attempts.unwrap_or(1),
                });
            }
        }
    }
    Ok(WardCheck::Passed)
}

/// Deterministic JSON-Schema check of a phase's final output
pub struct SchemaCheck {
    validator: jsonschema::Validator,
}

impl SchemaCheck {
    pub fn compile(schema: &Value) -> Result<Self, CascadeError> {
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| CascadeError::Config(format!("Invalid output_schema: {}", e)))?;
        Ok(Self { validator })
    }

    pub fn check(&self, output: &Value) -> Verdict {
        let errors: Vec<String> = self.validator.iter_errors(output).map(|e| e.to_string()).collect();
        if errors.is_empty() {
            Verdict::pass()
        } else {
            Verdict::fail(errors.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echolog::MemorySink;

    fn length_ward(min: usize) -> Arc<dyn Validator> {
        Arc::new(FnValidator::new("min_length", move |v: &Value| {
            let len = v.as_str().map(str::len).unwrap_or(0);
            if len >= min {
                Verdict::pass()
            } else {
                Verdict::fail(format!("output length {} below minimum {}", len, min))
            }
        }))
    }

    fn spec(validator: &str, mode: WardMode) -> WardSpec {
        WardSpec {
            validator: validator.to_string(),
            mode,
            max_attempts: Some(2),
        }
    }

    #[tokio::test]
    async fn test_ward_pass_and_fail() {
        let registry = ValidatorRegistry::new();
        registry.register(length_ward(100));
        let sink = MemorySink::new();
        let parent = TraceNode::root(NodeType::PhaseStart);

        let short = json!("too short");
        let result = run_ward_list(
            &registry,
            &sink,
            "s",
            "p",
            &parent,
            &[spec("min_length", WardMode::Retry)],
            &short,
            1,
        )
        .await
        .unwrap();

        match result {
            WardCheck::Failed { mode, reason, .. } => {
                assert_eq!(mode, WardMode::Retry);
                assert!(reason.contains("length"));
            }
            WardCheck::Passed => panic!("expected failure"),
        }

        let long = json!("x".repeat(150));
        let result = run_ward_list(
            &registry,
            &sink,
            "s",
            "p",
            &parent,
            &[spec("min_length", WardMode::Retry)],
            &long,
            2,
        )
        .await
        .unwrap();
        assert!(result.passed());

        // One ward event per check
        let wards = sink.events_by_type("s", NodeType::Ward).await.unwrap();
        assert_eq!(wards.len(), 2);
        assert_eq!(wards[0].content.as_ref().unwrap()["valid"], false);
        assert_eq!(wards[1].content.as_ref().unwrap()["valid"], true);
    }

    #[tokio::test]
    async fn test_advisory_failure_continues() {
        let registry = ValidatorRegistry::new();
        registry.register(length_ward(100));
        let sink = MemorySink::new();
        let parent = TraceNode::root(NodeType::PhaseStart);

        let result = run_ward_list(
            &registry,
            &sink,
            "s",
            "p",
            &parent,
            &[spec("min_length", WardMode::Advisory)],
            &json!("short"),
            1,
        )
        .await
        .unwrap();
        assert!(result.passed());
    }

    #[tokio::test]
    async fn test_unknown_validator_is_config_error() {
        let registry = ValidatorRegistry::new();
        let sink = MemorySink::new();
        let parent = TraceNode::root(NodeType::PhaseStart);

        let result = run_ward_list(
            &registry,
            &sink,
            "s",
            "p",
            &parent,
            &[spec("ghost", WardMode::Blocking)],
            &json!(null),
            1,
        )
        .await;
        assert!(matches!(result, Err(CascadeError::Config(_))));
    }

    #[tokio::test]
    async fn test_shell_validator_verdict() {
        let validator = ShellValidator::new("always_no", "echo '{\"valid\": false, \"reason\": \"nope\"}'");
        let verdict = validator.validate(&json!("anything")).await.unwrap();
        assert!(!verdict.valid);
        assert_eq!(verdict.reason, "nope");
    }

    #[tokio::test]
    async fn test_shell_validator_garbage_is_error() {
        let validator = ShellValidator::new("broken", "echo not-a-verdict");
        assert!(validator.validate(&json!(null)).await.is_err());
    }

    #[test]
    fn test_schema_check() {
        let check = SchemaCheck::compile(&json!({
            "type": "object",
            "properties": {"title": {"type": "string"}},
            "required": ["title"]
        }))
        .unwrap();

        assert!(check.check(&json!({"title": "ok"})).valid);
        let verdict = check.check(&json!({"count": 2}));
        assert!(!verdict.valid);
        assert!(verdict.reason.contains("title"));
    }

    #[test]
    fn test_invalid_schema_is_config_error() {
        assert!(SchemaCheck::compile(&json!({"type": "not_a_type"})).is_err());
    }
}
