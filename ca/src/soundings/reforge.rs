//! Reforge - iterative refinement of a sounding winner
//!
//! After breadth comes depth: each reforge step runs a smaller soundings
//! round whose candidates see the current winner and a rendered honing
//! prompt, then selection produces the next winner. The current winner
//! always competes in its own defense, so quality cannot regress. An
//! optional threshold validator stops early.

use futures::future::BoxFuture;
use serde_json::json;
use tracing::{debug, info};

use crate::config::{ReforgeConfig, SoundingsConfig};
use crate::error::CascadeError;
use crate::runtime::RunContext;
use crate::template::TemplateEngine;
use echolog::{EventRecord, EventSink, NodeType, TraceNode};

use super::{Candidate, CandidateFactory, RoundOutcome, SoundingSeat, build_seats, run_round};

/// Factory for one reforge candidate: (step, current winner, seat, honing prompt)
pub type ReforgeFactory<'a> =
    dyn Fn(u32, &Candidate, SoundingSeat, String) -> BoxFuture<'a, Result<Candidate, CascadeError>> + Send + Sync + 'a;

/// Refine the winner through `steps` rounds
#[allow(clippy::too_many_arguments)]
pub async fn run_reforge(
    ctx: &RunContext,
    config: &ReforgeConfig,
    soundings: &SoundingsConfig,
    mut winner: Candidate,
    base_instructions: Option<&str>,
    phase_model: &str,
    session_id: &str,
    phase_name: &str,
    parent: &TraceNode,
    factory: &ReforgeFactory<'_>,
) -> Result<Candidate, CascadeError> {
    let engine = TemplateEngine::new();
    let evaluator = config.evaluator_override.as_ref().unwrap_or(&soundings.evaluator);

    for step in 1..=config.steps {
        ctx.cancel.check()?;

        let honing_prompt = engine.render(
            &config.honing_prompt,
            &json!({
                "winner": winner.output,
                "step": step,
                "metadata": {
                    "sounding_index": winner.index,
                    "cost": winner.cost,
                    "route": winner.route,
                },
            }),
        )?;

        let step_node = parent.child(NodeType::ReforgeStep);
        ctx.sink
            .append(
                EventRecord::new(session_id, &step_node)
                    .with_phase(phase_name)
                    .with_reforge_step(step)
                    .with_content(json!({"honing_prompt": honing_prompt, "current_winner": winner.index}))
                    .with_semantic_actor("reforge"),
            )
            .await?;

        let mut round_config = soundings.clone();
        round_config.factor = config.factor_per_step;
        round_config.evaluator = evaluator.clone();
        // Mutation applies to the breadth round only
        round_config.mutation = None;

        let seats = build_seats(ctx, &round_config, base_instructions, phase_model, &|i| {
            format!("reforge{}_{}", step, i)
        })
        .await?;

        // The incumbent defends its seat with an index past the new round's
        let mut incumbent = winner.clone();
        incumbent.index = config.factor_per_step;

        let current = winner.clone();
        let prompt = honing_prompt.clone();
        let step_factory = move |seat: SoundingSeat| factory(step, &current, seat, prompt.clone());
        let boxed: &CandidateFactory<'_> = &step_factory;

        let outcome = run_round(
            ctx,
            &round_config,
            seats,
            session_id,
            phase_name,
            &step_node,
            Some(step),
            vec![incumbent],
            boxed,
        )
        .await?;

        winner = match outcome {
            RoundOutcome::Winner(w) => w,
            RoundOutcome::Aggregate(output) => {
                // Aggregate during reforge folds into the winner slot
                let mut merged = winner.clone();
                merged.output = output;
                merged
            }
        };
        info!(phase = phase_name, step, winner = winner.index, "reforge step complete");

        if let Some(threshold) = &config.quality_threshold {
            let validator = ctx.validators.get(threshold)?;
            let verdict = validator.validate(&winner.output).await?;
            if verdict.valid {
                debug!(phase = phase_name, step, "quality threshold met, stopping reforge early");
                break;
            }
        }
    }

    Ok(winner)
}
