//! Evaluator - winner selection over surviving candidates
//!
//! The default is a second model call over all candidate outputs. Cost-aware
//! and Pareto modes fold per-candidate cost into the decision; aggregate
//! mode skips winner selection entirely; human and hybrid modes delegate to
//! a checkpoint. Score ties always break toward the lowest sounding index.

use std::collections::BTreeMap;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::{CostNormalization, EvaluatorConfig, EvaluatorMode, ParetoPolicy, SignalDef, SignalKind};
use crate::error::CascadeError;
use crate::model::{ChatMessage, ModelRequest};
use crate::runtime::RunContext;
use crate::signals::SignalOutcome;
use echolog::{EventRecord, NodeType, TraceNode, EventSink};

use super::Candidate;

/// Evaluator decision
#[derive(Debug, Clone)]
pub enum Selection {
    Winner { index: usize, rationale: String },
    Aggregate { output: Value, rationale: String },
}

/// Select a winner (or aggregate) among surviving candidates
pub async fn evaluate(
    ctx: &RunContext,
    config: &EvaluatorConfig,
    candidates: &[&Candidate],
    session_id: &str,
    phase_name: &str,
    parent: &TraceNode,
) -> Result<Selection, CascadeError> {
    match config.mode {
        EvaluatorMode::Llm => llm_pick(ctx, config, candidates).await,
        EvaluatorMode::CostAware => cost_aware_pick(ctx, config, candidates).await,
        EvaluatorMode::Pareto => pareto_pick(ctx, config, candidates).await,
        EvaluatorMode::Aggregate => aggregate(ctx, config, candidates).await,
        EvaluatorMode::Human => human_pick(ctx, candidates, session_id, phase_name, parent, None).await,
        EvaluatorMode::Hybrid => {
            let recommendation = match llm_pick(ctx, config, candidates).await? {
                Selection::Winner { index, .. } => Some(index),
                Selection::Aggregate { .. } => None,
            };
            human_pick(ctx, candidates, session_id, phase_name, parent, recommendation).await
        }
    }
}

fn evaluator_model(ctx: &RunContext, config: &EvaluatorConfig) -> String {
    config.model.clone().unwrap_or_else(|| ctx.default_model.clone())
}

fn candidate_menu(candidates: &[&Candidate], with_cost: bool) -> String {
    candidates
        .iter()
        .map(|c| {
            if with_cost {
                format!("### Candidate {} (cost ${:.6})\n{}\n", c.index, c.cost, c.output)
            } else {
                format!("### Candidate {}\n{}\n", c.index, c.output)
            }
        })
        .collect()
}

/// Default LLM evaluation: one call sees every candidate
async fn llm_pick(
    ctx: &RunContext,
    config: &EvaluatorConfig,
    candidates: &[&Candidate],
) -> Result<Selection, CascadeError> {
    let instructions = config
        .instructions
        .as_deref()
        .unwrap_or("Pick the strongest candidate output.");
    let prompt = format!(
        "{}\n\n{}\nReply with JSON: {{\"winner\": <candidate number>, \"rationale\": \"<one sentence>\"}}",
        instructions,
        candidate_menu(candidates, false)
    );

    let response = ctx
        .model
        .complete(ModelRequest {
            model: evaluator_model(ctx, config),
            system: "You are an impartial evaluator of candidate outputs.".to_string(),
            messages: vec![ChatMessage::user(prompt)],
            tools: vec![],
            max_tokens: 512,
            native_tools: false,
        })
        .await?;

    let text = response.content.unwrap_or_default();
    let (winner, rationale) = parse_winner(&text, candidates);
    Ok(Selection::Winner { index: winner, rationale })
}

/// Parse `{"winner": i, "rationale": ...}`, tolerating loose output;
/// anything unusable falls back to the lowest candidate index
fn parse_winner(text: &str, candidates: &[&Candidate]) -> (usize, String) {
    let lowest = candidates.iter().map(|c| c.index).min().unwrap_or(0);

    if let Some(parsed) = extract_json_object(text) {
        let rationale = parsed
            .get("rationale")
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .to_string();
        if let Some(winner) = parsed.get("winner").and_then(|w| w.as_u64()) {
            let winner = winner as usize;
            if candidates.iter().any(|c| c.index == winner) {
                return (winner, rationale);
            }
        }
    }

    // Loose fallback: first integer that names a candidate
    let re = regex::Regex::new(r"\d+").unwrap();
    for m in re.find_iter(text) {
        if let Ok(n) = m.as_str().parse::<usize>()
            && candidates.iter().any(|c| c.index == n)
        {
            return (n, String::new());
        }
    }

    warn!("evaluator output unusable, defaulting to lowest index");
    (lowest, String::new())
}

/// First top-level JSON object embedded in free text
fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&text[start..start + offset + 1]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Ask the evaluator model for per-candidate quality scores in [0, 1]
async fn llm_scores(
    ctx: &RunContext,
    config: &EvaluatorConfig,
    candidates: &[&Candidate],
) -> Result<(Vec<f64>, String), CascadeError> {
    let instructions = config
        .instructions
        .as_deref()
        .unwrap_or("Judge the quality of each candidate output.");
    let prompt = format!(
        "{}\n\n{}\nReply with JSON: {{\"scores\": {{\"<candidate number>\": <0..1>, ...}}, \"rationale\": \"...\"}}",
        instructions,
        candidate_menu(candidates, true)
    );

    let response = ctx
        .model
        .complete(ModelRequest {
            model: evaluator_model(ctx, config),
            system: "You score candidate outputs for quality.".to_string(),
            messages: vec![ChatMessage::user(prompt)],
            tools: vec![],
            max_tokens: 512,
            native_tools: false,
        })
        .await?;

    let text = response.content.unwrap_or_default();
    let parsed = extract_json_object(&text);
    let rationale = parsed
        .as_ref()
        .and_then(|p| p.get("rationale"))
        .and_then(|r| r.as_str())
        .unwrap_or_default()
        .to_string();

    let scores = candidates
        .iter()
        .map(|c| {
            parsed
                .as_ref()
                .and_then(|p| p.get("scores"))
                .and_then(|s| s.get(c.index.to_string()))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5)
                .clamp(0.0, 1.0)
        })
        .collect();
    Ok((scores, rationale))
}

/// Normalize candidate costs into [0, 1]
fn normalize_costs(costs: &[f64], normalization: CostNormalization) -> Vec<f64> {
    let min_max = |values: &[f64]| -> Vec<f64> {
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if (max - min).abs() < f64::EPSILON {
            return vec![0.0; values.len()];
        }
        values.iter().map(|c| (c - min) / (max - min)).collect()
    };

    match normalization {
        CostNormalization::MinMax => min_max(costs),
        CostNormalization::LogScale => {
            let logs: Vec<f64> = costs.iter().map(|c| (1.0 + c.max(0.0)).ln()).collect();
            min_max(&logs)
        }
        CostNormalization::ZScore => {
            let n = costs.len() as f64;
            let mean = costs.iter().sum::<f64>() / n;
            let variance = costs.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
            let std = variance.sqrt();
            if std < f64::EPSILON {
                return vec![0.0; costs.len()];
            }
            // Squash z-scores through a logistic so the combined score
            // formula still sees [0, 1]
            costs.iter().map(|c| 1.0 / (1.0 + (-(c - mean) / std).exp())).collect()
        }
    }
}

/// Combined score: quality_weight * q + cost_weight * (1 - normalized_cost)
async fn cost_aware_pick(
    ctx: &RunContext,
    config: &EvaluatorConfig,
    candidates: &[&Candidate],
) -> Result<Selection, CascadeError> {
    let (qualities, rationale) = llm_scores(ctx, config, candidates).await?;
    let costs: Vec<f64> = candidates.iter().map(|c| c.cost).collect();
    let normalized = normalize_costs(&costs, config.normalization);

    let combined: Vec<f64> = qualities
        .iter()
        .zip(&normalized)
        .map(|(q, c)| config.quality_weight * q + config.cost_weight * (1.0 - c))
        .collect();
    debug!(?combined, "cost-aware combined scores");

    let winner = pick_max(candidates, &combined);
    Ok(Selection::Winner {
        index: winner,
        rationale: format!("cost-aware: {}", rationale),
    })
}

/// Highest score wins; ties break toward the lowest sounding index
fn pick_max(candidates: &[&Candidate], scores: &[f64]) -> usize {
    let mut best: Option<(usize, f64)> = None;
    for (candidate, score) in candidates.iter().zip(scores) {
        let replace = match best {
            None => true,
            Some((best_index, best_score)) => {
                *score > best_score || (*score == best_score && candidate.index < best_index)
            }
        };
        if replace {
            best = Some((candidate.index, *score));
        }
    }
    best.map(|(i, _)| i).unwrap_or(0)
}

/// Non-dominated set over (quality up, cost down), then policy selection
async fn pareto_pick(
    ctx: &RunContext,
    config: &EvaluatorConfig,
    candidates: &[&Candidate],
) -> Result<Selection, CascadeError> {
    let (qualities, rationale) = llm_scores(ctx, config, candidates).await?;

    let dominated = |i: usize| -> bool {
        (0..candidates.len()).any(|j| {
            j != i
                && qualities[j] >= qualities[i]
                && candidates[j].cost <= candidates[i].cost
                && (qualities[j] > qualities[i] || candidates[j].cost < candidates[i].cost)
        })
    };
    let front: Vec<usize> = (0..candidates.len()).filter(|i| !dominated(*i)).collect();
    debug!(front_size = front.len(), "pareto front computed");

    let scores: Vec<f64> = front
        .iter()
        .map(|&i| match config.policy {
            ParetoPolicy::PreferCheap => -candidates[i].cost,
            ParetoPolicy::PreferQuality => qualities[i],
            ParetoPolicy::Balanced => qualities[i] / candidates[i].cost.max(1e-9),
        })
        .collect();

    let front_candidates: Vec<&Candidate> = front.iter().map(|&i| candidates[i]).collect();
    let winner = pick_max(&front_candidates, &scores);
    Ok(Selection::Winner {
        index: winner,
        rationale: format!("pareto/{:?}: {}", config.policy, rationale),
    })
}

/// Aggregate mode: combine instead of selecting; no winner flag exists
async fn aggregate(
    ctx: &RunContext,
    config: &EvaluatorConfig,
    candidates: &[&Candidate],
) -> Result<Selection, CascadeError> {
    let instructions = config
        .instructions
        .as_deref()
        .unwrap_or("Synthesize the candidates into one combined result.");
    let prompt = format!(
        "{}\n\n{}\nReply with only the combined result.",
        instructions,
        candidate_menu(candidates, false)
    );

    let response = ctx
        .model
        .complete(ModelRequest {
            model: evaluator_model(ctx, config),
            system: "You merge candidate outputs into a single best result.".to_string(),
            messages: vec![ChatMessage::user(prompt)],
            tools: vec![],
            max_tokens: 4096,
            native_tools: false,
        })
        .await?;

    let text = response.content.unwrap_or_default();
    let output = serde_json::from_str(&text).unwrap_or(Value::String(text));
    Ok(Selection::Aggregate {
        output,
        rationale: "aggregated".to_string(),
    })
}

/// Delegate selection to a human checkpoint
async fn human_pick(
    ctx: &RunContext,
    candidates: &[&Candidate],
    session_id: &str,
    phase_name: &str,
    parent: &TraceNode,
    recommended: Option<usize>,
) -> Result<Selection, CascadeError> {
    let signal_name = format!("{}_evaluator", phase_name);
    let node = parent.child(NodeType::Checkpoint);
    ctx.sink
        .append(
            EventRecord::new(session_id, &node)
                .with_phase(phase_name)
                .with_content(json!({
                    "ui": {
                        "question": "Select the winning candidate",
                        "options": candidates.iter().map(|c| c.index).collect::<Vec<_>>(),
                        "recommended": recommended,
                    },
                    "signal": signal_name,
                }))
                .with_semantic_actor("evaluator"),
        )
        .await?;

    let mut defs = BTreeMap::new();
    defs.insert(
        signal_name.clone(),
        SignalDef {
            kind: SignalKind::Human,
            schema: None,
            auth: None,
            timeout_seconds: None,
            interval_seconds: None,
            duration_seconds: None,
            children: Vec::new(),
            combine: Default::default(),
        },
    );

    let outcome = ctx
        .signals
        .wait(ctx.sink.as_ref(), session_id, &signal_name, &defs, None, &node, &ctx.cancel)
        .await?;

    match outcome {
        SignalOutcome::Fired(payload) => {
            let picked = payload
                .as_u64()
                .or_else(|| payload.get("winner").and_then(|w| w.as_u64()))
                .map(|w| w as usize)
                .filter(|w| candidates.iter().any(|c| c.index == *w))
                .or(recommended)
                .unwrap_or_else(|| candidates.iter().map(|c| c.index).min().unwrap_or(0));
            Ok(Selection::Winner {
                index: picked,
                rationale: "human selection".to_string(),
            })
        }
        SignalOutcome::Cancelled => Err(CascadeError::Cancelled),
        SignalOutcome::TimedOut => match recommended {
            Some(index) => Ok(Selection::Winner {
                index,
                rationale: "human selection timed out, using recommendation".to_string(),
            }),
            None => Err(CascadeError::Signal("human evaluator checkpoint timed out".to_string())),
        },
    }
}
