//! Phase executor
//!
//! Dispatches one phase of any kind, wrapping the body with pre/post wards,
//! soundings and reforge when configured, output-schema checks, and the
//! attempt loop. Each attempt gets its own phase_start/phase_complete pair
//! in the log, so retry history stays first-class.

pub mod deterministic;
pub mod signal;
pub mod turn;

use std::sync::Mutex;

use futures::future::BoxFuture;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::{Cascade, Phase, PhaseKind, SignalDef, SignalKind, WardMode};
use crate::context::{InterPhaseRequest, select_interphase};
use crate::echo::Echo;
use crate::error::CascadeError;
use crate::model::{ChatMessage, TokenUsage};
use crate::runtime::RunContext;
use crate::signals::{SignalOutcome, detect_decision_block};
use crate::soundings::reforge::{ReforgeFactory, run_reforge};
use crate::soundings::{Candidate, CandidateFactory, RoundOutcome, SoundingSeat, build_seats, run_round};
use crate::template::TemplateEngine;
use crate::wards::{SchemaCheck, WardCheck, run_ward_list};
use echolog::{EventRecord, EventSink, NodeType, TraceNode};

use deterministic::run_deterministic;
use signal::run_signal_phase;
use turn::{TurnLoopParams, run_turn_loop};

/// Result of executing one phase
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub output: Value,
    /// Routing hint from route_to, `_route`, status routing, or on_signal
    pub route: Option<String>,
    pub usage: TokenUsage,
    pub cost: f64,
}

struct BodyResult {
    output: Value,
    route: Option<String>,
    usage: TokenUsage,
    cost: f64,
}

/// Execute a phase to completion, honoring wards and the attempt budget
pub async fn execute_phase(
    ctx: &RunContext,
    cascade: &Cascade,
    phase: &Phase,
    echo: &mut Echo,
    input: &Value,
    cascade_node: &TraceNode,
) -> Result<PhaseOutcome, CascadeError> {
    let schema_check = phase.output_schema.as_ref().map(SchemaCheck::compile).transpose()?;

    let ward_attempts = phase
        .wards
        .as_ref()
        .map(|w| w.post.iter().filter_map(|s| s.max_attempts).max().unwrap_or(1))
        .unwrap_or(1);
    let max_attempts = phase.rules.max_attempts.max(ward_attempts).max(1);

    let mut feedback: Option<String> = None;
    let mut total_usage = TokenUsage::default();
    let mut total_cost = 0.0f64;

    for attempt in 1..=max_attempts {
        ctx.cancel.check()?;
        let phase_node = cascade_node.child(NodeType::PhaseStart);
        ctx.sink
            .append(
                EventRecord::new(&echo.session_id, &phase_node)
                    .with_cascade(&cascade.cascade_id)
                    .with_phase(&phase.name)
                    .with_attempt(attempt)
                    .with_content(json!({"input": input}))
                    .with_semantic_actor("phase_executor"),
            )
            .await?;

        // Pre-wards gate execution outright
        if let Some(wards) = &phase.wards
            && let WardCheck::Failed { reason, .. } = run_ward_list(
                &ctx.validators,
                ctx.sink.as_ref(),
                &echo.session_id,
                &phase.name,
                &phase_node,
                &wards.pre,
                input,
                attempt,
            )
            .await?
        {
            return Err(CascadeError::validation(&phase.name, reason));
        }

        let body = match run_phase_body(ctx, cascade, phase, echo, input, &phase_node, feedback.as_deref()).await {
            Ok(body) => body,
            // After the retry budget, a deterministic failure routes to
            // on_error instead of aborting
            Err(e) if !e.is_fatal() && phase.on_error.is_some() => {
                let target = phase.on_error.clone().unwrap_or_default();
                info!(phase = %phase.name, %target, error = %e, "phase failed, routing to on_error");
                BodyResult {
                    output: json!({"error": e.to_string()}),
                    route: Some(target),
                    usage: TokenUsage::default(),
                    cost: 0.0,
                }
            }
            Err(e) => return Err(e),
        };
        total_usage.add(body.usage);
        total_cost += body.cost;

        let output = body.output;
        let mut route = body.route;

        // Post-hoc decision block detection
        if phase.decision_points
            && let Some(text) = output.as_str()
            && let Some(decided) = convert_decision_block(ctx, phase, echo, text, &phase_node).await?
        {
            route = decided.or(route);
        }

        // Post-wards gate acceptance of the output
        let mut retry_reason: Option<String> = None;
        if let Some(wards) = &phase.wards {
            match run_ward_list(
                &ctx.validators,
                ctx.sink.as_ref(),
                &echo.session_id,
                &phase.name,
                &phase_node,
                &wards.post,
                &output,
                attempt,
            )
            .await?
            {
                WardCheck::Passed => {}
                WardCheck::Failed {
                    mode: WardMode::Retry,
                    reason,
                    max_attempts: ward_limit,
                    ..
                } if attempt < ward_limit.max(1) => {
                    retry_reason = Some(reason);
                }
                WardCheck::Failed { reason, .. } => {
                    emit_phase_complete(ctx, cascade, phase, echo, &phase_node, attempt, &output, &total_usage, total_cost, false)
                        .await?;
                    return Err(CascadeError::validation(&phase.name, reason));
                }
            }
        }

        // Output schema behaves like a retry ward bounded by max_attempts
        if retry_reason.is_none()
            && let Some(check) = &schema_check
        {
            let verdict = check.check(&output);
            let check_node = phase_node.child(NodeType::OutputSchemaCheck);
            ctx.sink
                .append(
                    EventRecord::new(&echo.session_id, &check_node)
                        .with_phase(&phase.name)
                        .with_attempt(attempt)
                        .with_content(json!({"valid": verdict.valid, "reason": verdict.reason}))
                        .with_semantic_actor("phase_executor"),
                )
                .await?;
            if !verdict.valid {
                if attempt < max_attempts {
                    retry_reason = Some(format!("output schema mismatch: {}", verdict.reason));
                } else {
                    return Err(CascadeError::validation(
                        &phase.name,
                        format!("output schema mismatch: {}", verdict.reason),
                    ));
                }
            }
        }

        let accepted = retry_reason.is_none();
        emit_phase_complete(ctx, cascade, phase, echo, &phase_node, attempt, &output, &total_usage, total_cost, accepted)
            .await?;

        match retry_reason {
            Some(reason) => {
                info!(phase = %phase.name, attempt, %reason, "phase output rejected, retrying");
                feedback = Some(reason);
            }
            None => {
                // Optional human checkpoint attached to a non-signal phase
                if phase.kind() != PhaseKind::Signal
                    && let Some(human) = &phase.human_input
                {
                    run_attached_checkpoint(ctx, phase, echo, human, &phase_node).await?;
                }

                echo.record_output(&phase.name, output.clone());
                return Ok(PhaseOutcome {
                    output,
                    route,
                    usage: total_usage,
                    cost: total_cost,
                });
            }
        }
    }

    Err(CascadeError::validation(
        &phase.name,
        format!("phase failed after {} attempts: {}", max_attempts, feedback.unwrap_or_default()),
    ))
}

#[allow(clippy::too_many_arguments)]
async fn emit_phase_complete(
    ctx: &RunContext,
    cascade: &Cascade,
    phase: &Phase,
    echo: &Echo,
    phase_node: &TraceNode,
    attempt: u32,
    output: &Value,
    usage: &TokenUsage,
    cost: f64,
    accepted: bool,
) -> Result<(), CascadeError> {
    let node = phase_node.child(NodeType::PhaseComplete);
    ctx.sink
        .append(
            EventRecord::new(&echo.session_id, &node)
                .with_cascade(&cascade.cascade_id)
                .with_phase(&phase.name)
                .with_attempt(attempt)
                .with_content(json!({"output": output, "accepted": accepted}))
                .with_usage(usage.input_tokens, usage.output_tokens, cost)
                .with_semantic_actor("phase_executor"),
        )
        .await?;
    Ok(())
}

/// Dispatch the body: soundings wrapper or a single execution
async fn run_phase_body(
    ctx: &RunContext,
    cascade: &Cascade,
    phase: &Phase,
    echo: &mut Echo,
    input: &Value,
    phase_node: &TraceNode,
    feedback: Option<&str>,
) -> Result<BodyResult, CascadeError> {
    match &phase.soundings {
        Some(_) => run_soundings_body(ctx, cascade, phase, echo, input, phase_node, feedback).await,
        None => run_body_once(ctx, cascade, phase, echo, input, phase_node, None, feedback, None).await,
    }
}

/// Reforge context threaded into candidate bodies
struct HoningContext<'a> {
    winner_output: &'a Value,
    honing_prompt: &'a str,
    winner_images: Vec<std::path::PathBuf>,
}

/// One execution of the phase body on the given Echo
#[allow(clippy::too_many_arguments)]
fn run_body_once<'a>(
    ctx: &'a RunContext,
    cascade: &'a Cascade,
    phase: &'a Phase,
    echo: &'a mut Echo,
    input: &'a Value,
    phase_node: &'a TraceNode,
    seat: Option<&'a SoundingSeat>,
    feedback: Option<&'a str>,
    honing: Option<HoningContext<'a>>,
) -> BoxFuture<'a, Result<BodyResult, CascadeError>> {
    Box::pin(async move {
        match phase.kind() {
            PhaseKind::Deterministic => {
                let result = match run_deterministic(ctx, phase, echo, input, phase_node).await {
                    Ok(result) => result,
                    Err(e) => return Err(e),
                };
                Ok(BodyResult {
                    output: result.output,
                    route: result.route,
                    usage: result.usage,
                    cost: result.cost,
                })
            }
            PhaseKind::Signal => {
                let result = run_signal_phase(ctx, cascade, phase, echo, phase_node).await?;
                Ok(BodyResult {
                    output: result.output,
                    route: result.route,
                    usage: TokenUsage::default(),
                    cost: 0.0,
                })
            }
            PhaseKind::Llm => {
                let engine = TemplateEngine::new();
                let model = seat
                    .map(|s| s.model.clone())
                    .or_else(|| phase.model.clone())
                    .unwrap_or_else(|| ctx.default_model.clone());

                // Seat instructions are already rendered (and mutated)
                let instructions = match seat.and_then(|s| s.instructions.clone()) {
                    Some(mutated) => mutated,
                    None => {
                        let scope = instruction_scope(echo, input, phase, seat);
                        engine.render(phase.instructions.as_deref().unwrap_or_default(), &scope)?
                    }
                };

                let context_config = phase.context.as_ref().or(cascade.auto_context.as_ref());
                let context_messages = match context_config {
                    Some(config) => {
                        select_interphase(
                            ctx.sink.as_ref(),
                            Some(ctx.model.as_ref()),
                            ctx.embedder.as_deref(),
                            InterPhaseRequest {
                                echo,
                                config,
                                phase_name: &phase.name,
                                task_text: &instructions,
                                cascade_input: input,
                                parent: phase_node,
                            },
                        )
                        .await?
                    }
                    None => Vec::new(),
                };

                let mut extra_messages = Vec::new();
                if let Some(reason) = feedback {
                    extra_messages.push(ChatMessage::user(format!(
                        "Your previous attempt was rejected: {}. Address this and try again.",
                        reason
                    )));
                }
                if let Some(honing) = &honing {
                    extra_messages.push(
                        ChatMessage::user(format!("Current best output:\n{}", honing.winner_output))
                            .with_images(honing.winner_images.clone()),
                    );
                    extra_messages.push(ChatMessage::user(honing.honing_prompt.to_string()));
                }

                let result = run_turn_loop(
                    ctx,
                    TurnLoopParams {
                        phase,
                        cascade_id: &cascade.cascade_id,
                        instructions,
                        model,
                        context_messages,
                        extra_messages,
                        input,
                        phase_node,
                    },
                    echo,
                )
                .await?;

                Ok(BodyResult {
                    output: result.output,
                    route: result.route,
                    usage: result.usage,
                    cost: result.cost,
                })
            }
        }
    })
}

fn instruction_scope(echo: &Echo, input: &Value, phase: &Phase, seat: Option<&SoundingSeat>) -> Value {
    let mut scope = echo.template_scope(input);
    scope["history"] = serde_json::to_value(&echo.history).unwrap_or_else(|_| json!([]));
    scope["turn"] = json!(0);
    scope["max_turns"] = json!(phase.rules.max_turns);
    if let Some(seat) = seat {
        scope["sounding_index"] = json!(seat.index);
        scope["sounding_session"] = json!(seat.session_suffix);
    }
    scope
}

/// Soundings wrapper: branch per candidate, evaluate, adopt the winner
async fn run_soundings_body(
    ctx: &RunContext,
    cascade: &Cascade,
    phase: &Phase,
    echo: &mut Echo,
    input: &Value,
    phase_node: &TraceNode,
    feedback: Option<&str>,
) -> Result<BodyResult, CascadeError> {
    let config = phase.soundings.as_ref().expect("soundings config checked by caller");
    let phase_model = phase.model.clone().unwrap_or_else(|| ctx.default_model.clone());

    // Mutation operates on the rendered base instructions
    let base_instructions = match phase.kind() {
        PhaseKind::Llm => {
            let engine = TemplateEngine::new();
            let scope = instruction_scope(echo, input, phase, None);
            Some(engine.render(phase.instructions.as_deref().unwrap_or_default(), &scope)?)
        }
        _ => None,
    };

    let seats = build_seats(ctx, config, base_instructions.as_deref(), &phase_model, &|i| {
        format!("sounding{}", i)
    })
    .await?;

    let parent_echo = echo.clone();
    let spent = Mutex::new((TokenUsage::default(), 0.0f64));

    let factory = |seat: SoundingSeat| {
        let parent_echo = &parent_echo;
        let spent = &spent;
        let fut: BoxFuture<'_, Result<Candidate, CascadeError>> = Box::pin(async move {
            let mut branch = parent_echo.branch(&seat.session_suffix);
            let index = seat.index;
            let body = run_body_once(ctx, cascade, phase, &mut branch, input, phase_node, Some(&seat), feedback, None)
                .await?;
            {
                let mut spent = spent.lock().unwrap();
                spent.0.add(body.usage);
                spent.1 += body.cost;
            }
            Ok(Candidate {
                index,
                output: body.output,
                echo: branch,
                route: body.route,
                usage: body.usage,
                cost: body.cost,
            })
        });
        fut
    };
    let factory_ref: &CandidateFactory<'_> = &factory;

    let outcome = run_round(
        ctx,
        config,
        seats,
        &echo.session_id,
        &phase.name,
        phase_node,
        None,
        vec![],
        factory_ref,
    )
    .await?;

    let result = match outcome {
        RoundOutcome::Aggregate(output) => {
            let (usage, cost) = *spent.lock().unwrap();
            BodyResult {
                output,
                route: None,
                usage,
                cost,
            }
        }
        RoundOutcome::Winner(winner) => {
            let winner = match &config.reforge {
                None => winner,
                Some(reforge_config) => {
                    let reforge_factory = |_step: u32, current: &Candidate, seat: SoundingSeat, honing_prompt: String| {
                        let parent_echo = &parent_echo;
                        let spent = &spent;
                        let winner_output = current.output.clone();
                        let winner_images = current
                            .echo
                            .image_store
                            .get(&phase.name)
                            .cloned()
                            .unwrap_or_default();
                        let fut: BoxFuture<'_, Result<Candidate, CascadeError>> = Box::pin(async move {
                            let mut branch = parent_echo.branch(&seat.session_suffix);
                            let index = seat.index;
                            let honing = HoningContext {
                                winner_output: &winner_output,
                                honing_prompt: &honing_prompt,
                                winner_images,
                            };
                            let body = run_body_once(
                                ctx,
                                cascade,
                                phase,
                                &mut branch,
                                input,
                                phase_node,
                                Some(&seat),
                                feedback,
                                Some(honing),
                            )
                            .await?;
                            {
                                let mut spent = spent.lock().unwrap();
                                spent.0.add(body.usage);
                                spent.1 += body.cost;
                            }
                            Ok(Candidate {
                                index,
                                output: body.output,
                                echo: branch,
                                route: body.route,
                                usage: body.usage,
                                cost: body.cost,
                            })
                        });
                        fut
                    };
                    let reforge_ref: &ReforgeFactory<'_> = &reforge_factory;

                    run_reforge(
                        ctx,
                        reforge_config,
                        config,
                        winner,
                        base_instructions.as_deref(),
                        &phase_model,
                        &echo.session_id,
                        &phase.name,
                        phase_node,
                        reforge_ref,
                    )
                    .await?
                }
            };

            let (usage, cost) = *spent.lock().unwrap();
            let output = winner.output.clone();
            let route = winner.route.clone();
            // Only the winner's branch merges back into the parent Echo
            echo.adopt(winner.echo);
            BodyResult {
                output,
                route,
                usage,
                cost,
            }
        }
    };

    debug!(phase = %phase.name, "soundings body complete");
    Ok(result)
}

/// Convert an embedded decision block into a human checkpoint
async fn convert_decision_block(
    ctx: &RunContext,
    phase: &Phase,
    echo: &Echo,
    text: &str,
    phase_node: &TraceNode,
) -> Result<Option<Option<String>>, CascadeError> {
    let Some(block) = detect_decision_block(text) else {
        return Ok(None);
    };
    info!(phase = %phase.name, question = %block.question, "decision block detected");

    let signal_name = format!("{}_decision", phase.name);
    let node = phase_node.child(NodeType::Checkpoint);
    ctx.sink
        .append(
            EventRecord::new(&echo.session_id, &node)
                .with_phase(&phase.name)
                .with_content(json!({
                    "ui": {
                        "question": block.question,
                        "options": block.options.iter().map(|o| o.value.clone()).collect::<Vec<_>>(),
                    },
                    "signal": signal_name,
                }))
                .with_semantic_actor("phase_executor"),
        )
        .await?;

    let defs = std::iter::once((signal_name.clone(), human_signal_def(None))).collect();
    let outcome = ctx
        .signals
        .wait(ctx.sink.as_ref(), &echo.session_id, &signal_name, &defs, None, &node, &ctx.cancel)
        .await?;

    match outcome {
        SignalOutcome::Fired(payload) => {
            let picked = payload.as_str().unwrap_or_default();
            let route = block
                .options
                .iter()
                .find(|o| o.value == picked)
                .and_then(|o| o.route.clone());
            Ok(Some(route))
        }
        SignalOutcome::Cancelled => Err(CascadeError::Cancelled),
        SignalOutcome::TimedOut => Ok(Some(None)),
    }
}

/// Human-input checkpoint attached to a non-signal phase
async fn run_attached_checkpoint(
    ctx: &RunContext,
    phase: &Phase,
    echo: &mut Echo,
    human: &crate::config::HumanInputConfig,
    phase_node: &TraceNode,
) -> Result<(), CascadeError> {
    let signal_name = format!("{}_human", phase.name);
    let node = phase_node.child(NodeType::Checkpoint);
    ctx.sink
        .append(
            EventRecord::new(&echo.session_id, &node)
                .with_phase(&phase.name)
                .with_content(json!({"ui": human, "signal": signal_name}))
                .with_semantic_actor("phase_executor"),
        )
        .await?;

    let defs = std::iter::once((signal_name.clone(), human_signal_def(human.timeout_seconds))).collect();
    let timeout = human.timeout_seconds.map(std::time::Duration::from_secs_f64);
    let outcome = ctx
        .signals
        .wait(ctx.sink.as_ref(), &echo.session_id, &signal_name, &defs, timeout, &node, &ctx.cancel)
        .await?;

    if let SignalOutcome::Fired(payload) = outcome {
        echo.set_state(format!("{}_response", phase.name), payload);
    }
    Ok(())
}

fn human_signal_def(timeout_seconds: Option<f64>) -> SignalDef {
    SignalDef {
        kind: SignalKind::Human,
        schema: None,
        auth: None,
        timeout_seconds,
        interval_seconds: None,
        duration_seconds: None,
        children: Vec::new(),
        combine: Default::default(),
    }
}
