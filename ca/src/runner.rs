//! CascadeRunner - top-level driver
//!
//! Owns the session and the Echo, walks phases strictly sequentially, and
//! resolves routing after each completion: explicit hints first, then the
//! single declared handoff, and an empty handoff list terminates cleanly.
//! Multiple handoffs with no explicit choice are an error, never a guess.
//!
//! Sub-cascades are message-passing calls into a fresh runner with an
//! incremented depth and a parent trace pointer; the child owns its Echo
//! outright.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info};

use crate::config::Cascade;
use crate::echo::Echo;
use crate::error::CascadeError;
use crate::phase::execute_phase;
use crate::runtime::RunContext;
use crate::soundings::{Candidate, CandidateFactory, RoundOutcome, build_seats, run_round};
use crate::tools::{Tool, ToolError, ToolInvocation, ToolOutput};
use crate::wards::{Validator, Verdict};
use echolog::{EventRecord, EventSink, NodeType, TraceNode, new_session_id};

/// Options for one runner invocation
#[derive(Default, Clone)]
pub struct RunOptions {
    pub session_id: Option<String>,
    pub parent_session_id: Option<String>,
    /// Trace node the cascade_start hangs under (sub-cascades)
    pub parent_trace: Option<TraceNode>,
    pub depth: u32,
    /// Stamped into the cascade_start metadata (replay markers etc.)
    pub metadata: Map<String, Value>,
}

/// Final result of a cascade execution
#[derive(Debug, Clone)]
pub struct RunResult {
    pub output: Value,
    pub session_id: String,
    pub lineage: Vec<String>,
    pub error: Option<String>,
}

pub struct CascadeRunner {
    ctx: RunContext,
}

impl CascadeRunner {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Execute a cascade to completion
    pub async fn run(&self, cascade: &Cascade, input: Value, options: RunOptions) -> Result<RunResult, CascadeError> {
        cascade.validate()?;

        if let Some(schema) = &cascade.inputs_schema {
            jsonschema::validate(schema, &input)
                .map_err(|e| CascadeError::Config(format!("Cascade input rejected: {}", e)))?;
        }

        let session_id = options.session_id.clone().unwrap_or_else(new_session_id);

        match &cascade.soundings {
            Some(config) if config.factor > 1 => {
                self.run_cascade_soundings(cascade, input, session_id, options, config.factor).await
            }
            _ => self.run_single(cascade, input, session_id, options).await,
        }
    }

    async fn run_single(
        &self,
        cascade: &Cascade,
        input: Value,
        session_id: String,
        options: RunOptions,
    ) -> Result<RunResult, CascadeError> {
        let ctx = &self.ctx;
        let root = match &options.parent_trace {
            Some(parent) => TraceNode::root_under(parent, NodeType::CascadeStart),
            None => TraceNode::root(NodeType::CascadeStart),
        };

        info!(cascade_id = %cascade.cascade_id, %session_id, depth = options.depth, "cascade starting");
        let mut start = EventRecord::new(&session_id, &root)
            .with_cascade(&cascade.cascade_id)
            .with_content(json!({"input": input}))
            .with_semantic_actor("cascade_runner");
        if let Some(parent_session) = &options.parent_session_id {
            start = start.with_parent_session(parent_session.clone());
        }
        for (key, value) in &options.metadata {
            start = start.with_metadata(key.clone(), value.clone());
        }
        ctx.sink.append(start).await?;

        let mut echo = Echo::new(&session_id);
        if let Some(parent_session) = &options.parent_session_id {
            echo = echo.with_parent(parent_session.clone(), options.depth);
        }
        echo.depth = options.depth;

        for (name, def) in &cascade.signals {
            ctx.signals.ensure_defined(ctx.sink.as_ref(), &session_id, name, def).await?;
        }

        let mut current = cascade.entry_phase()?;
        let mut last_output = Value::Null;

        loop {
            if ctx.cancel.is_cancelled() {
                return self.finish_cancelled(cascade, &session_id, &root, &echo, last_output).await;
            }

            debug!(phase = %current.name, "dispatching phase");
            let outcome = match execute_phase(ctx, cascade, current, &mut echo, &input, &root).await {
                Ok(outcome) => outcome,
                Err(CascadeError::Cancelled) => {
                    return self.finish_cancelled(cascade, &session_id, &root, &echo, last_output).await;
                }
                Err(e) => {
                    error!(phase = %current.name, error = %e, "cascade aborting");
                    let error_node = root.child(NodeType::CascadeError);
                    ctx.sink
                        .append(
                            EventRecord::new(&session_id, &error_node)
                                .with_cascade(&cascade.cascade_id)
                                .with_phase(&current.name)
                                .with_content(json!({
                                    "kind": e.kind(),
                                    "message": e.to_string(),
                                    "last_completed": echo.last_completed_phase(),
                                    "partial_output": last_output,
                                }))
                                .with_semantic_actor("cascade_runner"),
                        )
                        .await?;
                    return Err(e);
                }
            };

            echo.complete_phase(&current.name);
            last_output = outcome.output;

            match resolve_next(cascade, current, outcome.route)? {
                Some(next_name) => {
                    current = cascade
                        .phase(&next_name)
                        .ok_or_else(|| CascadeError::Routing(format!("Unknown phase '{}'", next_name)))?;
                }
                None => break,
            }
        }

        let complete_node = root.child(NodeType::CascadeComplete);
        ctx.sink
            .append(
                EventRecord::new(&session_id, &complete_node)
                    .with_cascade(&cascade.cascade_id)
                    .with_content(json!({"output": last_output, "lineage": echo.lineage}))
                    .with_semantic_actor("cascade_runner"),
            )
            .await?;
        ctx.sink.flush().await?;

        info!(cascade_id = %cascade.cascade_id, %session_id, "cascade complete");
        Ok(RunResult {
            output: last_output,
            session_id,
            lineage: echo.lineage,
            error: None,
        })
    }

    async fn finish_cancelled(
        &self,
        cascade: &Cascade,
        session_id: &str,
        root: &TraceNode,
        echo: &Echo,
        last_output: Value,
    ) -> Result<RunResult, CascadeError> {
        let node = root.child(NodeType::CascadeCancelled);
        self.ctx
            .sink
            .append(
                EventRecord::new(session_id, &node)
                    .with_cascade(&cascade.cascade_id)
                    .with_content(json!({"lineage": echo.lineage}))
                    .with_semantic_actor("cascade_runner"),
            )
            .await?;
        self.ctx.sink.flush().await?;
        Ok(RunResult {
            output: last_output,
            session_id: session_id.to_string(),
            lineage: echo.lineage.clone(),
            error: Some("cancelled".to_string()),
        })
    }

    /// Cascade-level soundings: N whole executions, evaluator picks one
    async fn run_cascade_soundings(
        &self,
        cascade: &Cascade,
        input: Value,
        session_id: String,
        options: RunOptions,
        factor: usize,
    ) -> Result<RunResult, CascadeError> {
        let ctx = &self.ctx;
        let config = cascade.soundings.as_ref().expect("soundings config checked by caller");
        info!(cascade_id = %cascade.cascade_id, factor, "cascade-level soundings");

        let root = TraceNode::root(NodeType::CascadeStart);
        ctx.sink
            .append(
                EventRecord::new(&session_id, &root)
                    .with_cascade(&cascade.cascade_id)
                    .with_content(json!({"input": input, "soundings_factor": factor}))
                    .with_semantic_actor("cascade_runner"),
            )
            .await?;

        let seats = build_seats(ctx, config, None, &ctx.default_model, &|i| format!("sounding{}", i)).await?;

        let results: std::sync::Mutex<std::collections::HashMap<usize, RunResult>> = Default::default();
        let factory = |seat: crate::soundings::SoundingSeat| {
            let input = input.clone();
            let session_id = session_id.clone();
            let options = options.clone();
            let results = &results;
            let fut: futures::future::BoxFuture<'_, Result<Candidate, CascadeError>> = Box::pin(async move {
                let candidate_session = format!("{}_{}", session_id, seat.session_suffix);
                let run = self
                    .run_single(
                        cascade,
                        input,
                        candidate_session.clone(),
                        RunOptions {
                            session_id: Some(candidate_session.clone()),
                            parent_session_id: Some(session_id.clone()),
                            parent_trace: None,
                            depth: options.depth,
                            metadata: options.metadata.clone(),
                        },
                    )
                    .await?;

                let candidate = Candidate {
                    index: seat.index,
                    output: run.output.clone(),
                    echo: Echo::new(&candidate_session),
                    route: None,
                    usage: Default::default(),
                    cost: 0.0,
                };
                results.lock().unwrap().insert(seat.index, run);
                Ok(candidate)
            });
            fut
        };
        let factory_ref: &CandidateFactory<'_> = &factory;

        let outcome = run_round(ctx, config, seats, &session_id, "<cascade>", &root, None, vec![], factory_ref).await?;

        let (output, lineage) = match outcome {
            RoundOutcome::Winner(winner) => {
                let winning_run = results.lock().unwrap().remove(&winner.index);
                let lineage = winning_run.map(|r| r.lineage).unwrap_or_default();
                (winner.output, lineage)
            }
            RoundOutcome::Aggregate(output) => (output, Vec::new()),
        };

        let complete_node = root.child(NodeType::CascadeComplete);
        ctx.sink
            .append(
                EventRecord::new(&session_id, &complete_node)
                    .with_cascade(&cascade.cascade_id)
                    .with_content(json!({"output": output, "lineage": lineage}))
                    .with_semantic_actor("cascade_runner"),
            )
            .await?;
        ctx.sink.flush().await?;

        Ok(RunResult {
            output,
            session_id,
            lineage,
            error: None,
        })
    }
}

/// Routing resolution per completion
///
/// Explicit hints (route_to, `_route`, status routing, on_signal, timeout
/// escalation) were validated where they arose; here they only need to name
/// a real phase. Without a hint: one handoff follows it, none terminates,
/// several is ambiguous.
fn resolve_next(cascade: &Cascade, phase: &crate::config::Phase, hint: Option<String>) -> Result<Option<String>, CascadeError> {
    if let Some(hint) = hint {
        if cascade.phase(&hint).is_none() {
            return Err(CascadeError::Routing(format!(
                "Routing hint '{}' from phase '{}' names no phase",
                hint, phase.name
            )));
        }
        return Ok(Some(hint));
    }

    match phase.handoffs.as_slice() {
        [] => Ok(None),
        [only] => Ok(Some(only.clone())),
        _ => Err(CascadeError::Routing(format!(
            "Ambiguous routing: phase '{}' has {} handoffs and produced no routing choice",
            phase.name,
            phase.handoffs.len()
        ))),
    }
}

/// A registered tool that spawns a sub-cascade
///
/// Synchronous by default: the parent phase suspends until the child
/// completes. `detached` spawns the child and returns its session id
/// immediately.
pub struct SubCascadeTool {
    name: String,
    description: String,
    cascade: Cascade,
    ctx: RunContext,
    detached: bool,
}

impl SubCascadeTool {
    pub fn new(name: impl Into<String>, cascade: Cascade, ctx: RunContext) -> Self {
        let name = name.into();
        Self {
            description: format!("Run the '{}' cascade as a sub-workflow", cascade.cascade_id),
            name,
            cascade,
            ctx,
            detached: false,
        }
    }

    /// Spawn asynchronously; the result surfaces only through the log
    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }
}

#[async_trait]
impl Tool for SubCascadeTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.cascade
            .inputs_schema
            .clone()
            .unwrap_or_else(|| json!({"type": "object"}))
    }

    async fn invoke(&self, args: Value, inv: &ToolInvocation) -> Result<ToolOutput, ToolError> {
        if inv.depth + 1 > self.ctx.max_depth {
            return Err(ToolError::DepthExceeded {
                limit: self.ctx.max_depth,
            });
        }

        let parent_trace = TraceNode {
            trace_id: inv.trace_id.clone(),
            parent_id: None,
            depth: inv.depth,
            node_type: NodeType::ToolCall,
        };
        let options = RunOptions {
            session_id: None,
            parent_session_id: Some(inv.session_id.clone()),
            parent_trace: Some(parent_trace),
            depth: inv.depth + 1,
            metadata: Map::new(),
        };

        if self.detached {
            let runner = CascadeRunner::new(self.ctx.clone());
            let cascade = self.cascade.clone();
            let session_hint = new_session_id();
            let detached_options = RunOptions {
                session_id: Some(session_hint.clone()),
                ..options
            };
            tokio::spawn(async move {
                if let Err(e) = runner.run(&cascade, args, detached_options).await {
                    error!(error = %e, "detached sub-cascade failed");
                }
            });
            return Ok(ToolOutput::from_value(json!({
                "status": "spawned",
                "session_id": session_hint,
            })));
        }

        let runner = CascadeRunner::new(self.ctx.clone());
        let result = runner
            .run(&self.cascade, args, options)
            .await
            .map_err(|e| ToolError::failed(&self.name, e.to_string()))?;

        Ok(ToolOutput::from_value(json!({
            "output": result.output,
            "session_id": result.session_id,
            "lineage": result.lineage,
        })))
    }
}

/// Validator backed by a sub-cascade whose output is a verdict object
pub struct SubCascadeValidator {
    name: String,
    cascade: Cascade,
    ctx: RunContext,
}

impl SubCascadeValidator {
    pub fn new(name: impl Into<String>, cascade: Cascade, ctx: RunContext) -> Self {
        Self {
            name: name.into(),
            cascade,
            ctx,
        }
    }
}

#[async_trait]
impl Validator for SubCascadeValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, target: &Value) -> Result<Verdict, CascadeError> {
        let runner = CascadeRunner::new(self.ctx.clone());
        let result = runner
            .run(&self.cascade, json!({"target": target}), RunOptions::default())
            .await?;

        serde_json::from_value(result.output.clone()).map_err(|_| {
            CascadeError::Config(format!(
                "Validator cascade '{}' produced no verdict: {}",
                self.cascade.cascade_id, result.output
            ))
        })
    }
}

/// Convenience: registry-backed sub-cascade registration
pub fn register_sub_cascade(ctx: &RunContext, name: &str, cascade: Cascade) {
    ctx.tools
        .register(Arc::new(SubCascadeTool::new(name, cascade, ctx.clone())));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Phase;

    fn phase(name: &str, handoffs: &[&str]) -> Phase {
        serde_json::from_value(json!({
            "name": name,
            "instructions": "x",
            "handoffs": handoffs,
        }))
        .unwrap()
    }

    fn cascade(phases: Vec<Phase>) -> Cascade {
        serde_json::from_value(json!({"cascade_id": "t", "phases": []}))
            .map(|mut c: Cascade| {
                c.phases = phases;
                c
            })
            .unwrap()
    }

    #[test]
    fn test_resolve_next_single_handoff() {
        let c = cascade(vec![phase("a", &["b"]), phase("b", &[])]);
        assert_eq!(resolve_next(&c, c.phase("a").unwrap(), None).unwrap(), Some("b".to_string()));
        assert_eq!(resolve_next(&c, c.phase("b").unwrap(), None).unwrap(), None);
    }

    #[test]
    fn test_resolve_next_ambiguous() {
        let c = cascade(vec![phase("a", &["b", "c"]), phase("b", &[]), phase("c", &[])]);
        let err = resolve_next(&c, c.phase("a").unwrap(), None).unwrap_err();
        assert!(matches!(err, CascadeError::Routing(_)));
        assert!(err.to_string().contains("Ambiguous"));
    }

    #[test]
    fn test_resolve_next_hint_wins() {
        let c = cascade(vec![phase("a", &["b", "c"]), phase("b", &[]), phase("c", &[])]);
        assert_eq!(
            resolve_next(&c, c.phase("a").unwrap(), Some("c".to_string())).unwrap(),
            Some("c".to_string())
        );
        assert!(resolve_next(&c, c.phase("a").unwrap(), Some("ghost".to_string())).is_err());
    }
}
