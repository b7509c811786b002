//! Context builder
//!
//! Inter-phase: before a phase starts, anchors (the previous phase's last
//! turns and the original cascade input) are always included; the rest of
//! the candidate pool is scored through the configured strategy - heuristic,
//! semantic, llm-assisted, or hybrid - under a token budget, then hydrated
//! from the sink by content hash. Every selection emits one
//! `context_selection` event.
//!
//! Intra-phase compression lives in [`intra`].

pub mod intra;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::{ContextConfig, ContextSource, SelectionStrategy};
use crate::echo::Echo;
use crate::error::CascadeError;
use crate::model::{ChatMessage, ChatRole, ModelClient, ModelRequest};
use echolog::{ContextCard, EventRecord, EventSink, NodeType, TraceNode, content_hash, extract_keywords};

/// Heuristic scoring weights: keyword overlap, recency, callout bonus
const ALPHA: f64 = 2.0;
const BETA: f64 = 1.0;
const GAMMA: f64 = 1.5;

/// Minimum cosine similarity for the semantic strategy
const SEMANTIC_THRESHOLD: f64 = 0.3;

/// Embedding model abstraction (external collaborator)
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CascadeError>;
}

/// Inputs to one inter-phase selection
pub struct InterPhaseRequest<'a> {
    pub echo: &'a Echo,
    pub config: &'a ContextConfig,
    /// The phase about to start
    pub phase_name: &'a str,
    /// Rendered task text, used for keyword and embedding relevance
    pub task_text: &'a str,
    pub cascade_input: &'a Value,
    pub parent: &'a TraceNode,
}

#[derive(Clone)]
struct Candidate {
    hash: String,
    role: ChatRole,
    content: String,
    tokens: usize,
    card: ContextCard,
    /// Position in history; higher is more recent
    position: usize,
}

/// Build the context messages injected before a phase starts
pub async fn select_interphase(
    sink: &dyn EventSink,
    model: Option<&dyn ModelClient>,
    embedder: Option<&dyn Embedder>,
    req: InterPhaseRequest<'_>,
) -> Result<Vec<ChatMessage>, CascadeError> {
    let explicit: Vec<&crate::config::ExplicitSource> = req
        .config
        .from
        .iter()
        .filter_map(|s| match s {
            ContextSource::Explicit(e) => Some(e),
            ContextSource::Name(_) => None,
        })
        .collect();

    if !explicit.is_empty() {
        return build_explicit(sink, &explicit, &req).await;
    }

    let mut messages = anchors(&req);
    let anchor_hashes: HashSet<String> = messages
        .iter()
        .map(|m| content_hash(m.role.as_str(), &m.content))
        .collect();

    let candidates = candidate_pool(sink, &req, &anchor_hashes).await?;
    let candidate_count = candidates.len();
    let total_tokens: usize = candidates.iter().map(|c| c.tokens).sum();

    let selected = match req.config.strategy {
        SelectionStrategy::Heuristic => select_heuristic(&candidates, &req),
        SelectionStrategy::Semantic => select_semantic(&candidates, embedder, &req).await,
        SelectionStrategy::Llm => select_llm(&candidates, model, &req).await,
        SelectionStrategy::Hybrid => {
            let prefiltered = select_heuristic_budgeted(&candidates, &req, req.config.token_budget * 2);
            select_llm(&prefiltered_refs(&candidates, &prefiltered), model, &req).await
        }
    };

    let selected_tokens: usize = candidates
        .iter()
        .filter(|c| selected.contains(&c.hash))
        .map(|c| c.tokens)
        .sum();

    emit_selection_event(
        sink,
        &req,
        strategy_name(req.config.strategy),
        candidate_count,
        &selected,
        total_tokens.saturating_sub(selected_tokens),
    )
    .await?;

    // Hydrate in history order
    for candidate in &candidates {
        if !selected.contains(&candidate.hash) {
            continue;
        }
        let hydrated = sink.find_by_hash(&req.echo.session_id, &candidate.hash).await?;
        let content = hydrated
            .and_then(|r| r.content)
            .and_then(|c| c.as_str().map(str::to_string))
            .unwrap_or_else(|| candidate.content.clone());
        messages.push(ChatMessage {
            role: candidate.role,
            content,
            images: Vec::new(),
        });
    }

    Ok(messages)
}

fn strategy_name(strategy: SelectionStrategy) -> &'static str {
    match strategy {
        SelectionStrategy::Heuristic => "heuristic",
        SelectionStrategy::Semantic => "semantic",
        SelectionStrategy::Llm => "llm",
        SelectionStrategy::Hybrid => "hybrid",
    }
}

/// Anchors: original cascade input plus the previous phase's last K turns
fn anchors(req: &InterPhaseRequest<'_>) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::user(format!("Cascade input: {}", req.cascade_input))];

    if let Some(previous) = req.echo.last_completed_phase() {
        let phase_messages: Vec<_> = req.echo.messages_for_phase(previous).collect();
        let max_turn = phase_messages.iter().map(|m| m.turn_number).max().unwrap_or(0);
        let window_start = (max_turn + 1).saturating_sub(req.config.anchor_turns as u32);

        for message in phase_messages {
            if message.turn_number >= window_start {
                messages.push(ChatMessage {
                    role: message.role,
                    content: message.content.clone(),
                    images: message.images.clone(),
                });
            }
        }
    }
    messages
}

/// Resolve `from` keywords to concrete phase names
fn resolve_source_phases(req: &InterPhaseRequest<'_>) -> Vec<String> {
    let lineage = &req.echo.lineage;
    let mut phases: Vec<String> = Vec::new();
    for source in &req.config.from {
        let ContextSource::Name(name) = source else { continue };
        match name.as_str() {
            "previous" => {
                if let Some(previous) = lineage.last() {
                    phases.push(previous.clone());
                }
            }
            "first" => {
                if let Some(first) = lineage.first() {
                    phases.push(first.clone());
                }
            }
            "all" => phases.extend(lineage.iter().cloned()),
            concrete => phases.push(concrete.to_string()),
        }
    }
    phases.retain(|p| !req.config.exclude.contains(p));
    phases.dedup();
    phases
}

async fn candidate_pool(
    sink: &dyn EventSink,
    req: &InterPhaseRequest<'_>,
    anchor_hashes: &HashSet<String>,
) -> Result<Vec<Candidate>, CascadeError> {
    let source_phases = resolve_source_phases(req);
    if source_phases.is_empty() {
        return Ok(Vec::new());
    }

    // Cards may be sparse right after startup; synthesize on the fly then
    let cards: HashMap<String, ContextCard> = sink
        .session_cards(&req.echo.session_id)
        .await?
        .into_iter()
        .map(|c| (c.content_hash.clone(), c))
        .collect();

    let mut candidates = Vec::new();
    for (position, message) in req.echo.history.iter().enumerate() {
        if !source_phases.iter().any(|p| *p == message.phase_name) {
            continue;
        }
        let hash = content_hash(message.role.as_str(), &message.content);
        if anchor_hashes.contains(&hash) {
            continue;
        }
        let card = cards
            .get(&hash)
            .cloned()
            .unwrap_or_else(|| ContextCard::from_text(&req.echo.session_id, &hash, &message.content));
        candidates.push(Candidate {
            hash,
            role: message.role,
            content: message.content.clone(),
            tokens: card.estimated_tokens.max(1),
            card,
            position,
        });
    }
    Ok(candidates)
}

fn heuristic_score(candidate: &Candidate, task_keywords: &[String], total: usize) -> f64 {
    let overlap = candidate
        .card
        .keywords
        .iter()
        .filter(|k| task_keywords.contains(k))
        .count() as f64
        / task_keywords.len().max(1) as f64;
    let recency = (candidate.position + 1) as f64 / total.max(1) as f64;
    let callout = if candidate.card.is_callout { 1.0 } else { 0.0 };

    ALPHA * overlap + BETA * recency + GAMMA * callout
}

fn select_heuristic(candidates: &[Candidate], req: &InterPhaseRequest<'_>) -> HashSet<String> {
    select_heuristic_budgeted(candidates, req, req.config.token_budget)
}

fn select_heuristic_budgeted(candidates: &[Candidate], req: &InterPhaseRequest<'_>, budget: usize) -> HashSet<String> {
    let task_keywords = extract_keywords(req.task_text, 16);
    let mut scored: Vec<(&Candidate, f64)> = candidates
        .iter()
        .map(|c| (c, heuristic_score(c, &task_keywords, candidates.len())))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(b.0.position.cmp(&a.0.position)));

    greedy_take(scored.into_iter().map(|(c, _)| c), budget)
}

fn greedy_take<'a>(candidates: impl Iterator<Item = &'a Candidate>, budget: usize) -> HashSet<String> {
    let mut selected = HashSet::new();
    let mut spent = 0usize;
    for candidate in candidates {
        if spent + candidate.tokens > budget {
            continue;
        }
        spent += candidate.tokens;
        selected.insert(candidate.hash.clone());
    }
    selected
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 { 0.0 } else { dot / (norm_a * norm_b) }
}

async fn select_semantic(
    candidates: &[Candidate],
    embedder: Option<&dyn Embedder>,
    req: &InterPhaseRequest<'_>,
) -> HashSet<String> {
    let Some(embedder) = embedder else {
        warn!("semantic strategy configured without an embedder, falling back to heuristic");
        return select_heuristic(candidates, req);
    };

    let task_embedding = match embedder.embed(req.task_text).await {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "task embedding failed, falling back to heuristic");
            return select_heuristic(candidates, req);
        }
    };

    let mut scored: Vec<(&Candidate, f64)> = Vec::new();
    for candidate in candidates {
        let embedding = match &candidate.card.embedding {
            Some(e) => e.clone(),
            None => match embedder.embed(&candidate.card.summary).await {
                Ok(e) => e,
                Err(_) => continue,
            },
        };
        let similarity = cosine(&task_embedding, &embedding);
        if similarity >= SEMANTIC_THRESHOLD {
            scored.push((candidate, similarity));
        }
    }
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    greedy_take(scored.into_iter().map(|(c, _)| c), req.config.token_budget)
}

async fn select_llm(
    candidates: &[Candidate],
    model: Option<&dyn ModelClient>,
    req: &InterPhaseRequest<'_>,
) -> HashSet<String> {
    let Some(model) = model else {
        warn!("llm strategy configured without a selector model, falling back to heuristic");
        return select_heuristic(candidates, req);
    };
    if candidates.is_empty() {
        return HashSet::new();
    }

    let menu: String = candidates
        .iter()
        .map(|c| format!("{}  {}\n", c.hash, c.card.summary))
        .collect();
    let prompt = format!(
        "Task for the next phase:\n{}\n\nPrior messages, one per line as `<hash>  <summary>`:\n{}\n\
         Reply with the hashes of the messages worth carrying forward, one per line. Nothing else.",
        req.task_text, menu
    );

    let request = ModelRequest {
        model: req.config.model.clone().unwrap_or_else(|| "selector".to_string()),
        system: "You select relevant context for an agent. Reply only with hashes.".to_string(),
        messages: vec![ChatMessage::user(prompt)],
        tools: vec![],
        max_tokens: 512,
        native_tools: false,
    };

    let response = match model.complete(request).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "llm context selection failed, falling back to heuristic");
            return select_heuristic(candidates, req);
        }
    };

    let text = response.content.unwrap_or_default();
    let known: HashSet<&str> = candidates.iter().map(|c| c.hash.as_str()).collect();
    let re = regex::Regex::new(r"[0-9a-f]{16}").unwrap();
    let picked_hashes: HashSet<String> = re
        .find_iter(&text)
        .map(|m| m.as_str().to_string())
        .filter(|h| known.contains(h.as_str()))
        .collect();
    let picked = candidates.iter().filter(|c| picked_hashes.contains(&c.hash));

    greedy_take(picked, req.config.token_budget)
}

fn prefiltered_refs(candidates: &[Candidate], hashes: &HashSet<String>) -> Vec<Candidate> {
    candidates.iter().filter(|c| hashes.contains(&c.hash)).cloned().collect()
}

async fn build_explicit(
    sink: &dyn EventSink,
    sources: &[&crate::config::ExplicitSource],
    req: &InterPhaseRequest<'_>,
) -> Result<Vec<ChatMessage>, CascadeError> {
    let mut messages = vec![ChatMessage::user(format!("Cascade input: {}", req.cascade_input))];

    for source in sources {
        if source.messages {
            for message in req.echo.messages_for_phase(&source.phase) {
                messages.push(ChatMessage {
                    role: message.role,
                    content: message.content.clone(),
                    images: message.images.clone(),
                });
            }
        }
        if source.outputs
            && let Some(output) = req.echo.outputs.get(&source.phase)
        {
            messages.push(ChatMessage::user(format!("Output of phase '{}': {}", source.phase, output)));
        }
        if source.state {
            messages.push(ChatMessage::user(format!(
                "Session state: {}",
                Value::Object(req.echo.state.clone())
            )));
        }
        if source.images
            && let Some(images) = req.echo.image_store.get(&source.phase)
        {
            messages.push(
                ChatMessage::user(format!("Images from phase '{}'", source.phase)).with_images(images.clone()),
            );
        }
    }

    emit_selection_event(sink, req, "explicit", 0, &HashSet::new(), 0).await?;
    Ok(messages)
}

async fn emit_selection_event(
    sink: &dyn EventSink,
    req: &InterPhaseRequest<'_>,
    strategy: &str,
    candidate_count: usize,
    selected: &HashSet<String>,
    tokens_saved: usize,
) -> Result<(), CascadeError> {
    let mut hashes: Vec<&String> = selected.iter().collect();
    hashes.sort();
    debug!(phase = req.phase_name, strategy, candidate_count, selected = hashes.len(), "context selected");

    let node = req.parent.child(NodeType::ContextSelection);
    sink.append(
        EventRecord::new(&req.echo.session_id, &node)
            .with_phase(req.phase_name)
            .with_content(json!({
                "strategy": strategy,
                "candidates": candidate_count,
                "selected": hashes,
                "token_budget": req.config.token_budget,
                "tokens_saved": tokens_saved,
            }))
            .with_semantic_actor("context_builder"),
    )
    .await?;
    Ok(())
}
