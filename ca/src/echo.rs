//! Echo - the per-session mutable aggregate
//!
//! One cascade execution owns one Echo: the key-value state, per-phase
//! outputs, the full message history, the lineage of completed phases, and
//! the image store. Soundings never touch the parent Echo directly; each
//! candidate works on a branch, and only the winner's branch is adopted
//! back after selection.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::ChatRole;
use echolog::TraceId;

/// One message in the session history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<PathBuf>,
    pub phase_name: String,
    pub turn_number: u32,
    pub trace_id: TraceId,
}

impl EchoMessage {
    pub fn new(
        role: ChatRole,
        content: impl Into<String>,
        phase_name: impl Into<String>,
        turn_number: u32,
        trace_id: impl Into<TraceId>,
    ) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
            phase_name: phase_name.into(),
            turn_number,
            trace_id: trace_id.into(),
        }
    }

    pub fn with_images(mut self, images: Vec<PathBuf>) -> Self {
        self.images = images;
        self
    }
}

/// Per-session mutable runtime state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Echo {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    pub depth: u32,

    /// Key-value store mutated by `set_state` and deterministic outputs
    #[serde(default)]
    pub state: Map<String, Value>,

    /// phase name -> last output of that phase
    #[serde(default)]
    pub outputs: Map<String, Value>,

    /// Ordered message history across all phases
    #[serde(default)]
    pub history: Vec<EchoMessage>,

    /// Completed phase names, in completion order
    #[serde(default)]
    pub lineage: Vec<String>,

    /// phase name -> persisted image paths, in persist order
    #[serde(default)]
    pub image_store: BTreeMap<String, Vec<PathBuf>>,
}

impl Echo {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            parent_session_id: None,
            depth: 0,
            state: Map::new(),
            outputs: Map::new(),
            history: Vec::new(),
            lineage: Vec::new(),
            image_store: BTreeMap::new(),
        }
    }

    pub fn with_parent(mut self, parent_session_id: impl Into<String>, depth: u32) -> Self {
        self.parent_session_id = Some(parent_session_id.into());
        self.depth = depth;
        self
    }

    pub fn set_state(&mut self, key: impl Into<String>, value: Value) {
        self.state.insert(key.into(), value);
    }

    pub fn get_state(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn record_output(&mut self, phase_name: impl Into<String>, output: Value) {
        self.outputs.insert(phase_name.into(), output);
    }

    pub fn push_message(&mut self, message: EchoMessage) {
        self.history.push(message);
    }

    /// Mark a phase complete, appending it to the lineage
    pub fn complete_phase(&mut self, phase_name: impl Into<String>) {
        self.lineage.push(phase_name.into());
    }

    pub fn last_completed_phase(&self) -> Option<&str> {
        self.lineage.last().map(|s| s.as_str())
    }

    /// Messages belonging to one phase, in history order
    pub fn messages_for_phase<'a>(&'a self, phase_name: &'a str) -> impl Iterator<Item = &'a EchoMessage> {
        self.history.iter().filter(move |m| m.phase_name == phase_name)
    }

    /// Record a persisted image for a phase; returns its index
    pub fn record_image(&mut self, phase_name: &str, path: PathBuf) -> usize {
        let entry = self.image_store.entry(phase_name.to_string()).or_default();
        entry.push(path);
        entry.len() - 1
    }

    pub fn image_count(&self, phase_name: &str) -> usize {
        self.image_store.get(phase_name).map(|v| v.len()).unwrap_or(0)
    }

    /// Derive an isolated branch for one sounding candidate
    ///
    /// The branch copies all current state and gets a suffixed session id;
    /// parent pointers establish hierarchy in the log.
    pub fn branch(&self, suffix: &str) -> Echo {
        let mut branched = self.clone();
        branched.session_id = format!("{}_{}", self.session_id, suffix);
        branched.parent_session_id = Some(self.session_id.clone());
        branched
    }

    /// Adopt a winning branch's state wholesale
    ///
    /// The branch started as a copy of this Echo, so adopting it applies
    /// exactly the winner's delta. Session identity stays the parent's.
    pub fn adopt(&mut self, winner: Echo) {
        self.state = winner.state;
        self.outputs = winner.outputs;
        self.history = winner.history;
        self.lineage = winner.lineage;
        self.image_store = winner.image_store;
    }

    /// Template scope for instruction rendering: input/state/outputs/lineage
    pub fn template_scope(&self, input: &Value) -> Value {
        serde_json::json!({
            "input": input,
            "state": Value::Object(self.state.clone()),
            "outputs": Value::Object(self.outputs.clone()),
            "lineage": self.lineage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_and_outputs() {
        let mut echo = Echo::new("s1");
        echo.set_state("count", json!(3));
        echo.record_output("draft", json!("text"));

        assert_eq!(echo.get_state("count"), Some(&json!(3)));
        assert_eq!(echo.outputs["draft"], json!("text"));
    }

    #[test]
    fn test_lineage_order() {
        let mut echo = Echo::new("s1");
        echo.complete_phase("a");
        echo.complete_phase("b");
        assert_eq!(echo.lineage, vec!["a", "b"]);
        assert_eq!(echo.last_completed_phase(), Some("b"));
    }

    #[test]
    fn test_branch_derives_session_id() {
        let mut echo = Echo::new("s1");
        echo.set_state("k", json!("v"));

        let branch = echo.branch("sounding2");
        assert_eq!(branch.session_id, "s1_sounding2");
        assert_eq!(branch.parent_session_id.as_deref(), Some("s1"));
        assert_eq!(branch.get_state("k"), Some(&json!("v")));
    }

    #[test]
    fn test_adopt_takes_winner_delta_only() {
        let mut parent = Echo::new("s1");
        parent.set_state("base", json!(1));

        let mut winner = parent.branch("sounding0");
        winner.set_state("added", json!(2));
        winner.record_output("phase", json!("winner output"));

        let mut loser = parent.branch("sounding1");
        loser.set_state("junk", json!(true));

        parent.adopt(winner);
        assert_eq!(parent.session_id, "s1");
        assert_eq!(parent.get_state("base"), Some(&json!(1)));
        assert_eq!(parent.get_state("added"), Some(&json!(2)));
        assert_eq!(parent.get_state("junk"), None);
        assert_eq!(parent.outputs["phase"], json!("winner output"));
    }

    #[test]
    fn test_image_indices_increment() {
        let mut echo = Echo::new("s");
        assert_eq!(echo.record_image("p", PathBuf::from("a.png")), 0);
        assert_eq!(echo.record_image("p", PathBuf::from("b.png")), 1);
        assert_eq!(echo.image_count("p"), 2);
        assert_eq!(echo.image_count("other"), 0);
    }

    #[test]
    fn test_template_scope_shape() {
        let mut echo = Echo::new("s");
        echo.set_state("city", json!("Oslo"));
        echo.complete_phase("first");

        let scope = echo.template_scope(&json!({"topic": "x"}));
        assert_eq!(scope["input"]["topic"], "x");
        assert_eq!(scope["state"]["city"], "Oslo");
        assert_eq!(scope["lineage"][0], "first");
    }
}
