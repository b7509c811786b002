//! LLM turn loop
//!
//! One phase body is a sequence of turns: build context, call the model,
//! dispatch tool calls in order, check turn wards and loop_until, decide
//! whether to continue. The loop is strictly sequential; parallelism lives
//! a level up in soundings. Every model call and tool call writes its event
//! before the next suspension point.

use std::time::Instant;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::{Phase, ToolSelection, WardMode};
use crate::context::intra::{RetryAttempt, TurnEntry, build_retry_context, compress};
use crate::echo::{Echo, EchoMessage};
use crate::error::CascadeError;
use crate::images::persist_images;
use crate::model::{ChatMessage, ChatRole, ModelRequest, TokenUsage, ToolCallRequest, ToolSchema};
use crate::runtime::RunContext;
use crate::template::TemplateEngine;
use crate::tools::{
    ROUTE_TO, SET_STATE, ToolInvocation, parse_tool_call_fence, render_tool_schemas_prompt, route_to_schema,
    set_state_schema,
};
use crate::wards::{WardCheck, run_ward_list};
use echolog::{ContextCard, EventRecord, EventSink, NodeType, TraceNode, content_hash};

/// Result of one turn-loop body execution
#[derive(Debug, Clone)]
pub struct TurnLoopResult {
    pub output: Value,
    pub route: Option<String>,
    pub usage: TokenUsage,
    pub cost: f64,
}

/// Inputs for one turn-loop run
pub struct TurnLoopParams<'a> {
    pub phase: &'a Phase,
    pub cascade_id: &'a str,
    /// Rendered (and possibly mutated) instructions
    pub instructions: String,
    pub model: String,
    /// Inter-phase context preamble
    pub context_messages: Vec<ChatMessage>,
    /// Extra user messages: ward feedback, reforge honing context
    pub extra_messages: Vec<ChatMessage>,
    pub input: &'a Value,
    pub phase_node: &'a TraceNode,
}

pub async fn run_turn_loop(
    ctx: &RunContext,
    params: TurnLoopParams<'_>,
    echo: &mut Echo,
) -> Result<TurnLoopResult, CascadeError> {
    let phase = params.phase;
    let rules = &phase.rules;
    let phase_name = phase.name.as_str();
    let engine = TemplateEngine::new();

    let mut instructions = params.instructions.clone();
    if let Some(loop_until) = &rules.loop_until
        && !rules.silent
    {
        let validator = ctx.validators.get(loop_until)?;
        let purpose = if validator.purpose().is_empty() {
            loop_until.clone()
        } else {
            validator.purpose().to_string()
        };
        instructions.push_str(&format!("\n\nAcceptance criterion: {}", purpose));
    }

    let tool_schemas = resolve_tool_schemas(ctx, phase)?;
    let system = build_system_prompt(params.cascade_id, phase_name, &tool_schemas, rules.native_tools);

    let mut usage = TokenUsage::default();
    let mut cost = 0.0f64;
    let mut entries: Vec<TurnEntry> = Vec::new();
    let mut retry_attempts: Vec<RetryAttempt> = Vec::new();
    let mut pending_images: Vec<std::path::PathBuf> = Vec::new();
    let mut route: Option<String> = None;
    let mut last_content = String::new();

    if rules.max_turns == 0 {
        if rules.loop_until.is_some() {
            return Err(CascadeError::validation(phase_name, "loop_until not satisfied: no turns executed"));
        }
        return Ok(TurnLoopResult {
            output: Value::String(String::new()),
            route: None,
            usage,
            cost,
        });
    }

    let mut turn: u32 = 0;
    loop {
        ctx.cancel.check()?;

        let turn_node = params.phase_node.child(NodeType::Turn);
        ctx.sink
            .append(
                EventRecord::new(&echo.session_id, &turn_node)
                    .with_phase(phase_name)
                    .with_turn(turn)
                    .with_semantic_actor("turn_loop"),
            )
            .await?;

        let messages = if retry_attempts.is_empty() {
            let mut messages = params.context_messages.clone();
            messages.push(ChatMessage::user(instructions.clone()));
            messages.extend(params.extra_messages.iter().cloned());
            messages.extend(compress(&entries, &phase.intra_context.clone().unwrap_or_default()));
            if !pending_images.is_empty() {
                messages
                    .push(ChatMessage::user("Images from the previous tool results are attached.")
                        .with_images(std::mem::take(&mut pending_images)));
            }
            if turn >= 1
                && let Some(turn_prompt) = &rules.turn_prompt
            {
                let scope = turn_scope(echo, params.input, turn, rules.max_turns);
                messages.push(ChatMessage::user(engine.render(turn_prompt, &scope)?));
            }
            messages
        } else {
            // loop_until retry: context rebuilt from scratch
            let mut messages = params.context_messages.clone();
            messages.extend(build_retry_context(
                &instructions,
                &retry_attempts,
                &phase.intra_context.clone().unwrap_or_default(),
            ));
            messages
        };

        let started = Instant::now();
        let response = ctx
            .model
            .complete(ModelRequest {
                model: params.model.clone(),
                system: system.clone(),
                messages,
                tools: if rules.native_tools { tool_schemas.clone() } else { vec![] },
                max_tokens: rules.max_tokens,
                native_tools: rules.native_tools,
            })
            .await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        usage.add(response.usage);
        let turn_cost = response.usage.cost_usd(&params.model);
        cost += turn_cost;

        let content = response.content.clone().unwrap_or_default();
        let tool_calls = if rules.native_tools {
            response.tool_calls.clone()
        } else {
            parse_tool_call_fence(&content).into_iter().collect()
        };

        // Agent event, with a context card on the emit path (best effort)
        let agent_node = turn_node.child(NodeType::Agent);
        ctx.sink
            .append(
                EventRecord::new(&echo.session_id, &agent_node)
                    .with_phase(phase_name)
                    .with_turn(turn)
                    .with_model(&params.model)
                    .with_role_content("assistant", content.clone())
                    .with_content(json!({
                        "text": content,
                        "tool_calls": tool_calls.iter().map(|c| json!({"id": c.id, "name": c.name, "arguments": c.arguments})).collect::<Vec<_>>(),
                    }))
                    .with_usage(response.usage.input_tokens, response.usage.output_tokens, turn_cost)
                    .with_duration_ms(duration_ms)
                    .with_provider_request_id(response.provider_request_id.clone().unwrap_or_default())
                    .with_semantic_actor("turn_loop"),
            )
            .await?;
        if !content.is_empty() {
            let card = ContextCard::from_text(&echo.session_id, content_hash("assistant", &content), &content);
            if let Err(e) = ctx.sink.put_card(card).await {
                warn!(error = %e, "context card write failed");
            }
        }

        echo.push_message(EchoMessage::new(
            ChatRole::Assistant,
            content.clone(),
            phase_name,
            turn,
            agent_node.trace_id.clone(),
        ));
        entries.push(
            TurnEntry::new(ChatMessage::assistant(content.clone()), turn)
                .with_tool_calls(tool_calls.iter().map(|c| c.name.clone()).collect()),
        );
        if !content.is_empty() {
            last_content = content.clone();
        }

        // Tool dispatch, strictly in call order
        let mut routed_via_tool = false;
        for call in &tool_calls {
            if call.name == ROUTE_TO {
                let target = dispatch_route_to(ctx, phase, echo, call, &turn_node, turn).await?;
                route = Some(target);
                routed_via_tool = true;
                break;
            }
            let result_images =
                dispatch_tool(ctx, phase, echo, call, &turn_node, turn, &mut route, &mut entries).await?;
            pending_images.extend(result_images);
        }
        if routed_via_tool {
            info!(phase = phase_name, target = route.as_deref().unwrap_or(""), "phase routed via route_to");
            break;
        }

        // Turn wards gate individual assistant turns
        if let Some(wards) = &phase.wards
            && !wards.turn.is_empty()
        {
            let check = run_ward_list(
                &ctx.validators,
                ctx.sink.as_ref(),
                &echo.session_id,
                phase_name,
                &turn_node,
                &wards.turn,
                &Value::String(content.clone()),
                turn + 1,
            )
            .await?;
            if let WardCheck::Failed { mode, reason, .. } = check {
                match mode {
                    WardMode::Blocking => {
                        return Err(CascadeError::validation(phase_name, reason));
                    }
                    _ => {
                        entries.push(TurnEntry::new(
                            ChatMessage::user(format!("Revise your last answer: {}", reason)),
                            turn,
                        ));
                    }
                }
            }
        }

        // loop_until runs after every turn and may exit early
        if let Some(loop_until) = &rules.loop_until {
            let validator = ctx.validators.get(loop_until)?;
            let verdict = validator.validate(&Value::String(content.clone())).await?;

            let check_node = turn_node.child(NodeType::LoopUntilCheck);
            ctx.sink
                .append(
                    EventRecord::new(&echo.session_id, &check_node)
                        .with_phase(phase_name)
                        .with_turn(turn)
                        .with_content(json!({
                            "validator": loop_until,
                            "valid": verdict.valid,
                            "reason": verdict.reason,
                        }))
                        .with_semantic_actor("turn_loop"),
                )
                .await?;

            if verdict.valid {
                debug!(phase = phase_name, turn, "loop_until satisfied, exiting early");
                break;
            }
            if turn + 1 >= rules.max_turns {
                return Err(CascadeError::validation(
                    phase_name,
                    format!("loop_until not satisfied after {} turns: {}", turn + 1, verdict.reason),
                ));
            }
            retry_attempts.push(RetryAttempt {
                content: content.clone(),
                reason: verdict.reason,
            });
            turn += 1;
            continue;
        }

        // No tool calls and no loop_until: the model is done
        if tool_calls.is_empty() {
            break;
        }
        if turn + 1 >= rules.max_turns {
            warn!(phase = phase_name, max_turns = rules.max_turns, "max turns reached");
            break;
        }
        turn += 1;
    }

    Ok(TurnLoopResult {
        output: Value::String(last_content),
        route,
        usage,
        cost,
    })
}

fn turn_scope(echo: &Echo, input: &Value, turn: u32, max_turns: u32) -> Value {
    let mut scope = echo.template_scope(input);
    scope["turn"] = json!(turn);
    scope["max_turns"] = json!(max_turns);
    scope
}

/// Resolve the phase's tool set plus the synthetic tools
fn resolve_tool_schemas(ctx: &RunContext, phase: &Phase) -> Result<Vec<ToolSchema>, CascadeError> {
    let mut schemas = match &phase.tools {
        None => Vec::new(),
        Some(selection) if selection.is_manifest() => ctx.tools.schemas(),
        Some(ToolSelection::Names(names)) => ctx
            .tools
            .schemas_for(names)
            .map_err(|e| CascadeError::Config(e.to_string()))?,
        Some(ToolSelection::Keyword(k)) => {
            return Err(CascadeError::Config(format!("Unknown tools keyword '{}'", k)));
        }
    };

    schemas.push(set_state_schema());
    if phase.handoffs.len() >= 2 {
        schemas.push(route_to_schema(&phase.handoffs));
    }
    Ok(schemas)
}

fn build_system_prompt(cascade_id: &str, phase_name: &str, schemas: &[ToolSchema], native: bool) -> String {
    let mut system = format!(
        "You are executing phase '{}' of workflow '{}'. Complete the phase task using the available tools.",
        phase_name, cascade_id
    );
    if !native && !schemas.is_empty() {
        system.push_str("\n\n");
        system.push_str(&render_tool_schemas_prompt(schemas));
    }
    system
}

/// Handle the synthetic `route_to` call; returns the validated target
async fn dispatch_route_to(
    ctx: &RunContext,
    phase: &Phase,
    echo: &Echo,
    call: &ToolCallRequest,
    turn_node: &TraceNode,
    turn: u32,
) -> Result<String, CascadeError> {
    let target = call
        .arguments
        .get("target")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();

    let call_node = turn_node.child(NodeType::ToolCall);
    ctx.sink
        .append(
            EventRecord::new(&echo.session_id, &call_node)
                .with_phase(&phase.name)
                .with_turn(turn)
                .with_content(json!({"tool": ROUTE_TO, "target": target}))
                .with_semantic_actor("turn_loop"),
        )
        .await?;

    if !phase.handoffs.contains(&target) {
        return Err(CascadeError::Routing(format!(
            "route_to target '{}' is not a handoff of phase '{}'",
            target, phase.name
        )));
    }
    Ok(target)
}

/// Execute one ordinary tool call; returns any images the result carried
#[allow(clippy::too_many_arguments)]
async fn dispatch_tool(
    ctx: &RunContext,
    phase: &Phase,
    echo: &mut Echo,
    call: &ToolCallRequest,
    turn_node: &TraceNode,
    turn: u32,
    route: &mut Option<String>,
    entries: &mut Vec<TurnEntry>,
) -> Result<Vec<std::path::PathBuf>, CascadeError> {
    let call_node = turn_node.child(NodeType::ToolCall);
    ctx.sink
        .append(
            EventRecord::new(&echo.session_id, &call_node)
                .with_phase(&phase.name)
                .with_turn(turn)
                .with_content(json!({"tool": call.name, "arguments": call.arguments}))
                .with_semantic_actor("turn_loop"),
        )
        .await?;

    // set_state is the only channel that mutates Echo state
    let (result_content, is_error, images) = if call.name == SET_STATE {
        let key = call.arguments.get("key").and_then(|k| k.as_str());
        match key {
            Some(key) => {
                let value = call.arguments.get("value").cloned().unwrap_or(Value::Null);
                echo.set_state(key, value);
                (format!("state['{}'] set", key), false, Vec::new())
            }
            None => ("set_state requires a 'key' argument".to_string(), true, Vec::new()),
        }
    } else {
        let invocation = ToolInvocation::new(&echo.session_id, &phase.name, call_node.trace_id.clone(), ctx.tools.clone())
            .with_snapshots(echo.state.clone(), echo.outputs.clone())
            .with_cancel(ctx.cancel.clone())
            .with_depth(echo.depth);

        match ctx.tools.invoke(&call.name, call.arguments.clone(), &invocation).await {
            Ok(output) => {
                if let Some(hint) = &output.route {
                    if !phase.handoffs.contains(hint) {
                        return Err(CascadeError::Routing(format!(
                            "_route '{}' from tool '{}' is not a handoff of phase '{}'",
                            hint, call.name, phase.name
                        )));
                    }
                    *route = Some(hint.clone());
                }
                let persisted = persist_images(&ctx.images_root, echo, &phase.name, &output.images)?;
                (output.content_string(), false, persisted)
            }
            Err(e) if matches!(e, crate::tools::ToolError::DepthExceeded { .. }) => {
                return Err(CascadeError::Tool(e));
            }
            Err(e) => {
                // Handler failures go back to the model as error results;
                // the phase retry policy governs anything beyond that
                warn!(tool = %call.name, error = %e, "tool call failed");
                (format!("[error] {}", e), true, Vec::new())
            }
        }
    };

    let result_node = call_node.child(NodeType::ToolResult);
    ctx.sink
        .append(
            EventRecord::new(&echo.session_id, &result_node)
                .with_phase(&phase.name)
                .with_turn(turn)
                .with_role_content("tool", result_content.clone())
                .with_metadata("tool", call.name.clone())
                .with_metadata("is_error", is_error)
                .with_semantic_actor("turn_loop"),
        )
        .await?;

    echo.push_message(EchoMessage::new(
        ChatRole::Tool,
        result_content.clone(),
        &phase.name,
        turn,
        result_node.trace_id.clone(),
    ));
    entries.push(TurnEntry::new(ChatMessage::tool(result_content), turn).with_tool_use_id(call.id.clone()));

    Ok(images)
}
