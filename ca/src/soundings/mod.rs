//! Soundings - parallel exploratory candidates with evaluator selection
//!
//! A round produces N candidates of the phase body, each on an isolated
//! Echo branch with a derived session id. Seats (index, session suffix,
//! model, mutated prompt) are fixed before dispatch so event records stay
//! deterministically attributable however execution interleaves. The winner
//! is chosen only after every candidate resolves, and is tagged through a
//! separate winner event - attempt records are never mutated.

pub mod evaluator;
pub mod reforge;

use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::{ModelAssignment, MutationConfig, MutationMode, SoundingsConfig};
use crate::echo::Echo;
use crate::error::CascadeError;
use crate::model::{ChatMessage, ModelRequest, TokenUsage};
use crate::runtime::RunContext;
use echolog::{EventRecord, EventSink, NodeType, TraceNode};

use evaluator::{Selection, evaluate};

/// Built-in rewrite directives for `rewrite` mutation
const REWRITE_DIRECTIVES: &[&str] = &[
    "Rephrase the instruction to be maximally concrete and specific.",
    "Rephrase the instruction emphasizing edge cases and failure modes.",
    "Rephrase the instruction as a terse checklist of requirements.",
    "Rephrase the instruction stressing brevity of the final answer.",
];

/// Built-in snippets prepended by `augment` mutation
const AUGMENT_SNIPPETS: &[&str] = &[
    "Before answering, list the assumptions you are making.\n\n",
    "Work step by step and double-check each intermediate result.\n\n",
    "Consider at least two alternative approaches before committing.\n\n",
    "Prefer the simplest solution that fully satisfies the request.\n\n",
];

/// Built-in hints appended by `approach` mutation
const APPROACH_HINTS: &[&str] = &[
    "\n\nApproach this analytically, decomposing the problem first.",
    "\n\nApproach this by analogy to similar solved problems.",
    "\n\nApproach this bottom-up from concrete examples.",
    "\n\nApproach this top-down from the desired end state.",
];

/// Fixed per-candidate assignment, decided before dispatch
#[derive(Debug, Clone)]
pub struct SoundingSeat {
    pub index: usize,
    /// Appended to the parent session id (`sounding2`, `reforge1_0`)
    pub session_suffix: String,
    pub model: String,
    /// Mutated instructions, when a mutation mode is configured
    pub instructions: Option<String>,
}

/// One completed candidate
#[derive(Debug, Clone)]
pub struct Candidate {
    pub index: usize,
    pub output: Value,
    pub echo: Echo,
    pub route: Option<String>,
    pub usage: TokenUsage,
    pub cost: f64,
}

/// Result of one soundings round
#[derive(Debug)]
pub enum RoundOutcome {
    Winner(Candidate),
    /// Aggregate mode: combined output, no winner flag anywhere
    Aggregate(Value),
}

/// Factory executing one candidate body on its seat
pub type CandidateFactory<'a> =
    dyn Fn(SoundingSeat) -> BoxFuture<'a, Result<Candidate, CascadeError>> + Send + Sync + 'a;

/// Assign seats: model per candidate plus optional prompt mutation
pub async fn build_seats(
    ctx: &RunContext,
    config: &SoundingsConfig,
    base_instructions: Option<&str>,
    phase_model: &str,
    suffix: &(dyn Fn(usize) -> String + Send + Sync),
) -> Result<Vec<SoundingSeat>, CascadeError> {
    let assignments = assign_models(config, phase_model);
    let mut seats = Vec::with_capacity(assignments.len());

    for (index, model) in assignments.into_iter().enumerate() {
        let instructions = match (&config.mutation, base_instructions) {
            (Some(mutation), Some(base)) => Some(mutate_instructions(ctx, mutation, base, index).await?),
            _ => None,
        };
        seats.push(SoundingSeat {
            index,
            session_suffix: suffix(index),
            model,
            instructions,
        });
    }
    Ok(seats)
}

/// Model per sounding index; `model_factors` overrides the round-robin /
/// seeded-random distribution over `models`
fn assign_models(config: &SoundingsConfig, phase_model: &str) -> Vec<String> {
    if let Some(factors) = &config.model_factors {
        let mut out = Vec::new();
        for (model, count) in factors {
            out.extend(std::iter::repeat_n(model.clone(), *count));
        }
        return out;
    }

    if config.models.is_empty() {
        return vec![phase_model.to_string(); config.factor];
    }

    match config.assignment {
        ModelAssignment::RoundRobin => (0..config.factor)
            .map(|i| config.models[i % config.models.len()].clone())
            .collect(),
        ModelAssignment::Random => {
            let mut rng = StdRng::seed_from_u64(config.seed.unwrap_or(0));
            (0..config.factor)
                .map(|_| config.models[rng.random_range(0..config.models.len())].clone())
                .collect()
        }
    }
}

/// Produce the mutated instruction for one seat
async fn mutate_instructions(
    ctx: &RunContext,
    config: &MutationConfig,
    base: &str,
    index: usize,
) -> Result<String, CascadeError> {
    let catalog: Vec<&str> = if config.templates.is_empty() {
        match config.mode {
            MutationMode::Rewrite => REWRITE_DIRECTIVES.to_vec(),
            MutationMode::Augment => AUGMENT_SNIPPETS.to_vec(),
            MutationMode::Approach => APPROACH_HINTS.to_vec(),
        }
    } else {
        config.templates.iter().map(String::as_str).collect()
    };
    let entry = catalog[index % catalog.len()];

    match config.mode {
        MutationMode::Augment => Ok(format!("{}{}", entry, base)),
        MutationMode::Approach => Ok(format!("{}{}", base, entry)),
        MutationMode::Rewrite => {
            let request = ModelRequest {
                model: ctx.default_model.clone(),
                system: format!("{} Output only the rewritten instruction.", entry),
                messages: vec![ChatMessage::user(base)],
                tools: vec![],
                max_tokens: 1024,
                native_tools: false,
            };
            match ctx.model.complete(request).await {
                Ok(response) => Ok(response.content.unwrap_or_else(|| base.to_string())),
                Err(e) => {
                    warn!(error = %e, "rewrite mutation failed, using base instructions");
                    Ok(base.to_string())
                }
            }
        }
    }
}

/// Run one full soundings round: dispatch, pre-filter, evaluate, tag winner
#[allow(clippy::too_many_arguments)]
pub async fn run_round(
    ctx: &RunContext,
    config: &SoundingsConfig,
    seats: Vec<SoundingSeat>,
    session_id: &str,
    phase_name: &str,
    parent: &TraceNode,
    reforge_step: Option<u32>,
    extra_candidates: Vec<Candidate>,
    factory: &CandidateFactory<'_>,
) -> Result<RoundOutcome, CascadeError> {
    let factor = seats.len();
    info!(phase = phase_name, factor, ?reforge_step, "soundings round starting");

    // Per-round concurrency on top of the cascade-wide scheduler
    let local = Semaphore::new(config.max_parallel.unwrap_or(factor).max(1));

    let mut dispatched = Vec::with_capacity(factor);
    for seat in seats {
        let attempt_node = parent.child(NodeType::SoundingAttempt);
        let mut record = EventRecord::new(session_id, &attempt_node)
            .with_phase(phase_name)
            .with_sounding_index(seat.index)
            .with_winner(false)
            .with_model(&seat.model)
            .with_content(json!({
                "session_suffix": seat.session_suffix,
                "mutated": seat.instructions.is_some(),
            }))
            .with_semantic_actor("soundings");
        if let Some(step) = reforge_step {
            record = record.with_reforge_step(step);
        }
        ctx.sink.append(record).await?;

        dispatched.push(async {
            let _local = local.acquire().await.map_err(|_| CascadeError::Cancelled)?;
            let _slot = ctx.scheduler.acquire(&ctx.cancel).await?;
            factory(seat).await
        });
    }

    let results = futures::future::join_all(dispatched).await;

    // Candidates may complete out of order; re-establish seat order
    let mut candidates: Vec<Candidate> = Vec::with_capacity(factor);
    let mut first_error: Option<CascadeError> = None;
    for result in results {
        match result {
            Ok(candidate) => candidates.push(candidate),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(phase = phase_name, error = %e, "sounding candidate failed");
                first_error.get_or_insert(e);
            }
        }
    }
    candidates.extend(extra_candidates);
    candidates.sort_by_key(|c| c.index);

    if candidates.is_empty() {
        return Err(first_error.unwrap_or_else(|| {
            CascadeError::validation(phase_name, "all sounding candidates failed")
        }));
    }

    // Pre-filter before evaluation; if everything fails, fall back to all
    let (survivors, prefilter_fallback) = prefilter(ctx, config, &candidates, session_id, phase_name, parent).await?;

    // Single survivor (or factor 1): evaluator is skipped
    if survivors.len() == 1 {
        let winner = candidates[survivors[0]].clone();
        emit_winner(ctx, session_id, phase_name, parent, &winner, "single candidate", reforge_step, prefilter_fallback)
            .await?;
        return Ok(RoundOutcome::Winner(winner));
    }

    let surviving: Vec<&Candidate> = survivors.iter().map(|i| &candidates[*i]).collect();
    let selection = evaluate(ctx, &config.evaluator, &surviving, session_id, phase_name, parent).await?;

    match selection {
        Selection::Aggregate { output, rationale } => {
            debug!(phase = phase_name, %rationale, "aggregate output produced");
            Ok(RoundOutcome::Aggregate(output))
        }
        Selection::Winner { index, rationale } => {
            let winner = surviving
                .iter()
                .find(|c| c.index == index)
                .map(|c| (*c).clone())
                .ok_or_else(|| {
                    CascadeError::validation(phase_name, format!("evaluator chose unknown candidate {}", index))
                })?;
            emit_winner(ctx, session_id, phase_name, parent, &winner, &rationale, reforge_step, prefilter_fallback)
                .await?;
            Ok(RoundOutcome::Winner(winner))
        }
    }
}

/// Apply the pre-evaluation validator; returns surviving candidate
/// positions and whether the all-failed fallback engaged
async fn prefilter(
    ctx: &RunContext,
    config: &SoundingsConfig,
    candidates: &[Candidate],
    session_id: &str,
    phase_name: &str,
    parent: &TraceNode,
) -> Result<(Vec<usize>, bool), CascadeError> {
    let Some(validator_name) = &config.pre_validator else {
        return Ok(((0..candidates.len()).collect(), false));
    };
    let validator = ctx.validators.get(validator_name)?;

    let mut survivors = Vec::new();
    for (position, candidate) in candidates.iter().enumerate() {
        let verdict = validator.validate(&candidate.output).await?;
        let node = parent.child(NodeType::Ward);
        ctx.sink
            .append(
                EventRecord::new(session_id, &node)
                    .with_phase(phase_name)
                    .with_sounding_index(candidate.index)
                    .with_content(json!({
                        "validator": validator_name,
                        "valid": verdict.valid,
                        "reason": verdict.reason,
                        "placement": "pre_evaluator",
                    }))
                    .with_semantic_actor("soundings"),
            )
            .await?;
        if verdict.valid {
            survivors.push(position);
        }
    }

    if survivors.is_empty() {
        warn!(phase = phase_name, "all candidates failed pre-validation, re-including all");
        return Ok(((0..candidates.len()).collect(), true));
    }
    Ok((survivors, false))
}

#[allow(clippy::too_many_arguments)]
async fn emit_winner(
    ctx: &RunContext,
    session_id: &str,
    phase_name: &str,
    parent: &TraceNode,
    winner: &Candidate,
    rationale: &str,
    reforge_step: Option<u32>,
    prefilter_fallback: bool,
) -> Result<(), CascadeError> {
    info!(phase = phase_name, winner = winner.index, "sounding winner selected");
    let node = parent.child(NodeType::SoundingWinner);
    let mut record = EventRecord::new(session_id, &node)
        .with_phase(phase_name)
        .with_sounding_index(winner.index)
        .with_winner(true)
        .with_content(json!({"rationale": rationale}))
        .with_semantic_actor("soundings");
    if let Some(step) = reforge_step {
        record = record.with_reforge_step(step);
    }
    if prefilter_fallback {
        record = record.with_metadata("prefilter_fallback", true);
    }
    ctx.sink.append(record).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvaluatorConfig;
    use crate::model::{ModelResponse, ScriptedClient};
    use crate::wards::{FnValidator, Verdict};
    use echolog::MemorySink;
    use std::sync::Arc;

    fn test_ctx(responses: Vec<ModelResponse>) -> (RunContext, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let ctx = RunContext::new(Arc::new(ScriptedClient::new(responses)), sink.clone());
        (ctx, sink)
    }

    fn soundings(factor: usize) -> SoundingsConfig {
        SoundingsConfig {
            factor,
            max_parallel: None,
            mutation: None,
            models: vec![],
            assignment: ModelAssignment::RoundRobin,
            model_factors: None,
            seed: None,
            pre_validator: None,
            evaluator: EvaluatorConfig::default(),
            reforge: None,
        }
    }

    fn make_candidate(index: usize, output: Value) -> Candidate {
        Candidate {
            index,
            output,
            echo: Echo::new(format!("s_sounding{}", index)),
            route: None,
            usage: TokenUsage::default(),
            cost: 0.001,
        }
    }

    fn simple_factory(outputs: Vec<Value>) -> impl Fn(SoundingSeat) -> BoxFuture<'static, Result<Candidate, CascadeError>> {
        move |seat: SoundingSeat| {
            let output = outputs[seat.index].clone();
            Box::pin(async move { Ok(make_candidate(seat.index, output)) })
        }
    }

    #[test]
    fn test_round_robin_assignment() {
        let mut config = soundings(5);
        config.models = vec!["a".to_string(), "b".to_string()];
        assert_eq!(assign_models(&config, "base"), vec!["a", "b", "a", "b", "a"]);
    }

    #[test]
    fn test_random_assignment_is_seed_deterministic() {
        let mut config = soundings(6);
        config.models = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        config.assignment = ModelAssignment::Random;
        config.seed = Some(42);

        let first = assign_models(&config, "base");
        let second = assign_models(&config, "base");
        assert_eq!(first, second);
        assert!(first.iter().all(|m| ["a", "b", "c"].contains(&m.as_str())));
    }

    #[test]
    fn test_model_factors_override() {
        let mut config = soundings(2);
        config.model_factors = Some([("fast".to_string(), 2), ("slow".to_string(), 1)].into_iter().collect());
        let models = assign_models(&config, "base");
        assert_eq!(models.len(), 3);
        assert_eq!(models.iter().filter(|m| *m == "fast").count(), 2);
    }

    #[test]
    fn test_no_models_uses_phase_model() {
        let config = soundings(3);
        assert_eq!(assign_models(&config, "phase-model"), vec!["phase-model"; 3]);
    }

    #[tokio::test]
    async fn test_augment_and_approach_mutation() {
        let (ctx, _) = test_ctx(vec![]);
        let augment = MutationConfig {
            mode: MutationMode::Augment,
            templates: vec![],
        };
        let mutated = mutate_instructions(&ctx, &augment, "Solve the puzzle", 0).await.unwrap();
        assert!(mutated.ends_with("Solve the puzzle"));
        assert!(mutated.len() > "Solve the puzzle".len());

        let approach = MutationConfig {
            mode: MutationMode::Approach,
            templates: vec!["\n\nTry it sideways.".to_string()],
        };
        let mutated = mutate_instructions(&ctx, &approach, "Solve the puzzle", 5).await.unwrap();
        assert_eq!(mutated, "Solve the puzzle\n\nTry it sideways.");
    }

    #[tokio::test]
    async fn test_factor_one_skips_evaluator() {
        let (ctx, sink) = test_ctx(vec![]);
        let config = soundings(1);
        let parent = TraceNode::root(NodeType::PhaseStart);
        let seats = build_seats(&ctx, &config, None, "m", &|i| format!("sounding{}", i))
            .await
            .unwrap();

        let factory = simple_factory(vec![json!("only")]);
        let outcome = run_round(&ctx, &config, seats, "s", "p", &parent, None, vec![], &factory)
            .await
            .unwrap();

        match outcome {
            RoundOutcome::Winner(w) => assert_eq!(w.output, json!("only")),
            RoundOutcome::Aggregate(_) => panic!("expected winner"),
        }
        // No evaluator call happened (scripted client had no responses)
        let winners = sink.events_by_type("s", NodeType::SoundingWinner).await.unwrap();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].is_winner, Some(true));
    }

    #[tokio::test]
    async fn test_round_with_prefilter_and_evaluation() {
        // Evaluator picks index 2 among survivors {0, 2}
        let (ctx, sink) = test_ctx(vec![ModelResponse::text("{\"winner\": 2, \"rationale\": \"shortest\"}")]);
        ctx.validators.register(Arc::new(FnValidator::new("is_json", |v: &Value| {
            let text = v.as_str().unwrap_or_default();
            if serde_json::from_str::<Value>(text).is_ok() {
                Verdict::pass()
            } else {
                Verdict::fail("not JSON")
            }
        })));

        let mut config = soundings(4);
        config.pre_validator = Some("is_json".to_string());
        let parent = TraceNode::root(NodeType::PhaseStart);
        let seats = build_seats(&ctx, &config, None, "m", &|i| format!("sounding{}", i))
            .await
            .unwrap();

        let factory = simple_factory(vec![
            json!("{\"a\": 1}"),
            json!("free text"),
            json!("{}"),
            json!("more free text"),
        ]);
        let outcome = run_round(&ctx, &config, seats, "s", "p", &parent, None, vec![], &factory)
            .await
            .unwrap();

        match outcome {
            RoundOutcome::Winner(w) => assert_eq!(w.index, 2),
            RoundOutcome::Aggregate(_) => panic!("expected winner"),
        }

        // Four attempts, all initially is_winner=false
        let attempts = sink.events_by_type("s", NodeType::SoundingAttempt).await.unwrap();
        assert_eq!(attempts.len(), 4);
        assert!(attempts.iter().all(|a| a.is_winner == Some(false)));

        // One winner event referencing index 2
        let winners = sink.events_by_type("s", NodeType::SoundingWinner).await.unwrap();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].sounding_index, Some(2));
    }

    #[tokio::test]
    async fn test_all_prefilter_failures_reinclude() {
        let (ctx, sink) = test_ctx(vec![ModelResponse::text("{\"winner\": 0, \"rationale\": \"first\"}")]);
        ctx.validators
            .register(Arc::new(FnValidator::new("nothing_passes", |_: &Value| Verdict::fail("no"))));

        let mut config = soundings(2);
        config.pre_validator = Some("nothing_passes".to_string());
        let parent = TraceNode::root(NodeType::PhaseStart);
        let seats = build_seats(&ctx, &config, None, "m", &|i| format!("sounding{}", i))
            .await
            .unwrap();

        let factory = simple_factory(vec![json!("a"), json!("b")]);
        let outcome = run_round(&ctx, &config, seats, "s", "p", &parent, None, vec![], &factory)
            .await
            .unwrap();
        assert!(matches!(outcome, RoundOutcome::Winner(_)));

        let winners = sink.events_by_type("s", NodeType::SoundingWinner).await.unwrap();
        assert_eq!(winners[0].metadata["prefilter_fallback"], true);
    }
}
