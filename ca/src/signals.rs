//! Signals - durable blocking conditions
//!
//! A signal phase parks the cascade until a named condition resolves: a
//! human responds, a webhook posts, a sensor poll turns true, a timer
//! elapses, or a composite of those. Waits are durable through the sink:
//! `signal_wait` records the park, `signal_fired` records the resolution,
//! and a wait re-entered after a process restart reads the resolved record
//! instead of blocking again.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::{CompositeMode, SignalAuth, SignalAuthKind, SignalDef, SignalKind};
use crate::error::CascadeError;
use crate::scheduler::CancelToken;
use echolog::{EventRecord, EventSink, NodeType, TraceNode};

/// How a wait resolved
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Fired(Value),
    TimedOut,
    Cancelled,
}

/// External condition poller (registered per sensor signal name)
#[async_trait]
pub trait Sensor: Send + Sync {
    /// Some(payload) when the condition holds
    async fn poll(&self) -> Result<Option<Value>, CascadeError>;
}

type WaitKey = (String, String);

/// Durable registry of pending awaits
#[derive(Default)]
pub struct SignalManager {
    waiters: Mutex<HashMap<WaitKey, oneshot::Sender<Value>>>,
    /// Payloads that arrived before (or without) a waiter
    early: Mutex<HashMap<WaitKey, Value>>,
    sensors: RwLock<HashMap<String, Arc<dyn Sensor>>>,
    defined: Mutex<HashSet<WaitKey>>,
}

impl SignalManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_sensor(&self, signal_name: impl Into<String>, sensor: Arc<dyn Sensor>) {
        self.sensors.write().unwrap().insert(signal_name.into(), sensor);
    }

    /// Record a signal definition once per session
    pub async fn ensure_defined(
        &self,
        sink: &dyn EventSink,
        session_id: &str,
        name: &str,
        def: &SignalDef,
    ) -> Result<(), CascadeError> {
        let key = (session_id.to_string(), name.to_string());
        if !self.defined.lock().unwrap().insert(key) {
            return Ok(());
        }
        let node = TraceNode::root(NodeType::SignalDefinition);
        sink.append(
            EventRecord::new(session_id, &node)
                .with_content(json!({"signal": name, "definition": def}))
                .with_semantic_actor("signal_manager"),
        )
        .await?;
        Ok(())
    }

    /// Fire a signal: persist the resolution and wake any in-process waiter
    ///
    /// This is the entry point a webhook handler or human-response UI calls.
    pub async fn fire(
        &self,
        sink: &dyn EventSink,
        session_id: &str,
        name: &str,
        payload: Value,
    ) -> Result<(), CascadeError> {
        info!(session_id, signal = name, "signal fired");
        let node = TraceNode::root(NodeType::SignalFired);
        sink.append(
            EventRecord::new(session_id, &node)
                .with_content(json!({"signal": name, "payload": payload}))
                .with_semantic_actor("signal_manager"),
        )
        .await?;

        let key = (session_id.to_string(), name.to_string());
        let waiter = self.waiters.lock().unwrap().remove(&key);
        match waiter {
            Some(tx) => {
                // Receiver may have been dropped by cancellation
                let _ = tx.send(payload);
            }
            None => {
                self.early.lock().unwrap().insert(key, payload);
            }
        }
        Ok(())
    }

    /// Check the sink for an already-resolved fire (restart recovery)
    async fn resolved_in_sink(
        &self,
        sink: &dyn EventSink,
        session_id: &str,
        name: &str,
    ) -> Result<Option<Value>, CascadeError> {
        let fired = sink.events_by_type(session_id, NodeType::SignalFired).await?;
        Ok(fired
            .into_iter()
            .rev()
            .find(|e| {
                e.content
                    .as_ref()
                    .and_then(|c| c.get("signal"))
                    .and_then(|s| s.as_str())
                    == Some(name)
            })
            .and_then(|e| e.content)
            .map(|c| c.get("payload").cloned().unwrap_or(Value::Null)))
    }

    /// Block until the signal resolves, times out, or is cancelled
    #[allow(clippy::too_many_arguments)]
    pub async fn wait(
        &self,
        sink: &dyn EventSink,
        session_id: &str,
        name: &str,
        defs: &BTreeMap<String, SignalDef>,
        timeout_override: Option<Duration>,
        parent: &TraceNode,
        cancel: &CancelToken,
    ) -> Result<SignalOutcome, CascadeError> {
        let def = defs
            .get(name)
            .ok_or_else(|| CascadeError::Signal(format!("Undefined signal '{}'", name)))?;
        self.ensure_defined(sink, session_id, name, def).await?;

        let node = parent.child(NodeType::SignalWait);
        sink.append(
            EventRecord::new(session_id, &node)
                .with_content(json!({
                    "signal": name,
                    "kind": def.kind,
                    "timeout_seconds": timeout_override.map(|d| d.as_secs_f64()).or(def.timeout_seconds),
                }))
                .with_semantic_actor("signal_manager"),
        )
        .await?;

        let timeout = timeout_override.or(def.timeout_seconds.map(Duration::from_secs_f64));
        let outcome = self
            .wait_inner(sink, session_id, name, def, defs, timeout, cancel)
            .await?;

        if outcome == SignalOutcome::TimedOut {
            let timeout_node = node.child(NodeType::SignalTimeout);
            sink.append(
                EventRecord::new(session_id, &timeout_node)
                    .with_content(json!({"signal": name}))
                    .with_semantic_actor("signal_manager"),
            )
            .await?;
        }
        Ok(outcome)
    }

    /// Dispatch per kind; boxed for composite recursion
    #[allow(clippy::too_many_arguments)]
    fn wait_inner<'a>(
        &'a self,
        sink: &'a dyn EventSink,
        session_id: &'a str,
        name: &'a str,
        def: &'a SignalDef,
        defs: &'a BTreeMap<String, SignalDef>,
        timeout: Option<Duration>,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Result<SignalOutcome, CascadeError>> {
        Box::pin(async move {
            match def.kind {
                SignalKind::Human | SignalKind::Webhook => self.wait_external(sink, session_id, name, timeout, cancel).await,
                SignalKind::Time => {
                    let duration = def
                        .duration_seconds
                        .map(Duration::from_secs_f64)
                        .or(timeout)
                        .unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = cancel.cancelled() => Ok(SignalOutcome::Cancelled),
                        _ = tokio::time::sleep(duration) => {
                            self.fire(sink, session_id, name, Value::Null).await?;
                            // Consume the early record this fire produced
                            self.early.lock().unwrap().remove(&(session_id.to_string(), name.to_string()));
                            Ok(SignalOutcome::Fired(Value::Null))
                        }
                    }
                }
                SignalKind::Sensor => self.wait_sensor(sink, session_id, name, def, timeout, cancel).await,
                SignalKind::Composite => self.wait_composite(sink, session_id, name, def, defs, timeout, cancel).await,
            }
        })
    }

    async fn wait_external(
        &self,
        sink: &dyn EventSink,
        session_id: &str,
        name: &str,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<SignalOutcome, CascadeError> {
        let key = (session_id.to_string(), name.to_string());

        // Early fire in this process
        if let Some(payload) = self.early.lock().unwrap().remove(&key) {
            return Ok(SignalOutcome::Fired(payload));
        }
        // Resolved in a previous process
        if let Some(payload) = self.resolved_in_sink(sink, session_id, name).await? {
            debug!(session_id, signal = name, "wait resolved from sink");
            return Ok(SignalOutcome::Fired(payload));
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(key.clone(), tx);

        let result = match timeout {
            Some(timeout) if timeout.is_zero() => SignalOutcome::TimedOut,
            Some(timeout) => {
                tokio::select! {
                    _ = cancel.cancelled() => SignalOutcome::Cancelled,
                    fired = rx => fired.map(SignalOutcome::Fired).unwrap_or(SignalOutcome::Cancelled),
                    _ = tokio::time::sleep(timeout) => SignalOutcome::TimedOut,
                }
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => SignalOutcome::Cancelled,
                    fired = rx => fired.map(SignalOutcome::Fired).unwrap_or(SignalOutcome::Cancelled),
                }
            }
        };

        self.waiters.lock().unwrap().remove(&key);
        Ok(result)
    }

    async fn wait_sensor(
        &self,
        sink: &dyn EventSink,
        session_id: &str,
        name: &str,
        def: &SignalDef,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<SignalOutcome, CascadeError> {
        let sensor = self
            .sensors
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| CascadeError::Signal(format!("No sensor registered for signal '{}'", name)))?;
        let interval = def.interval_seconds.map(Duration::from_secs_f64).unwrap_or(Duration::from_secs(5));
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            if cancel.is_cancelled() {
                return Ok(SignalOutcome::Cancelled);
            }
            if let Some(deadline) = deadline
                && tokio::time::Instant::now() >= deadline
            {
                return Ok(SignalOutcome::TimedOut);
            }

            if let Some(payload) = sensor.poll().await? {
                self.fire(sink, session_id, name, payload.clone()).await?;
                self.early.lock().unwrap().remove(&(session_id.to_string(), name.to_string()));
                return Ok(SignalOutcome::Fired(payload));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(SignalOutcome::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Composite: `all` waits for every child (failure propagates, cancel
    /// short-circuits); `any` resolves on the first fire and cancels the
    /// rest. All children timing out times the composite out.
    #[allow(clippy::too_many_arguments)]
    async fn wait_composite(
        &self,
        sink: &dyn EventSink,
        session_id: &str,
        name: &str,
        def: &SignalDef,
        defs: &BTreeMap<String, SignalDef>,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<SignalOutcome, CascadeError> {
        let children: Vec<&String> = def.children.iter().collect();
        if children.is_empty() {
            return Err(CascadeError::Signal(format!("Composite signal '{}' has no children", name)));
        }

        match def.combine {
            CompositeMode::All => {
                let mut values = serde_json::Map::new();
                for child in children {
                    let child_def = defs
                        .get(child)
                        .ok_or_else(|| CascadeError::Signal(format!("Unknown child signal '{}'", child)))?;
                    match self.wait_inner(sink, session_id, child, child_def, defs, timeout, cancel).await? {
                        SignalOutcome::Fired(value) => {
                            values.insert(child.clone(), value);
                        }
                        other => return Ok(other),
                    }
                }
                Ok(SignalOutcome::Fired(Value::Object(values)))
            }
            CompositeMode::Any => {
                let child_cancel = cancel.child();
                let mut futures = Vec::new();
                for child in &children {
                    let child_def = defs
                        .get(*child)
                        .ok_or_else(|| CascadeError::Signal(format!("Unknown child signal '{}'", child)))?;
                    let child_name = child.as_str();
                    let token = child_cancel.clone();
                    futures.push(async move {
                        let outcome = self
                            .wait_inner(sink, session_id, child_name, child_def, defs, timeout, &token)
                            .await;
                        (child_name.to_string(), outcome)
                    });
                }

                let mut remaining: Vec<_> = futures.into_iter().map(Box::pin).collect();
                let mut timed_out = 0usize;
                let total = remaining.len();
                while !remaining.is_empty() {
                    let ((child, outcome), _index, rest) = futures::future::select_all(remaining).await;
                    remaining = rest;
                    match outcome? {
                        SignalOutcome::Fired(value) => {
                            // First fire wins; siblings are cancelled
                            child_cancel.cancel();
                            return Ok(SignalOutcome::Fired(json!({"signal": child, "value": value})));
                        }
                        SignalOutcome::Cancelled => {
                            if cancel.is_cancelled() {
                                return Ok(SignalOutcome::Cancelled);
                            }
                        }
                        SignalOutcome::TimedOut => {
                            timed_out += 1;
                            if timed_out == total {
                                return Ok(SignalOutcome::TimedOut);
                            }
                        }
                    }
                }
                warn!(signal = name, "composite any: all children resolved without firing");
                Ok(SignalOutcome::TimedOut)
            }
        }
    }
}

/// Verify an incoming webhook body against a signal's auth config
///
/// HMAC signatures are hex-encoded SHA-256 MACs over the raw body.
pub fn verify_webhook(auth: Option<&SignalAuth>, body: &[u8], credential: Option<&str>) -> Result<(), CascadeError> {
    let Some(auth) = auth else { return Ok(()) };
    match auth.kind {
        SignalAuthKind::None => Ok(()),
        SignalAuthKind::ApiKey => {
            let expected = auth
                .secret
                .as_deref()
                .ok_or_else(|| CascadeError::Signal("api_key auth configured without a secret".to_string()))?;
            if credential == Some(expected) {
                Ok(())
            } else {
                Err(CascadeError::Signal("webhook auth failure: bad api key".to_string()))
            }
        }
        SignalAuthKind::Hmac => {
            let secret = auth
                .secret
                .as_deref()
                .ok_or_else(|| CascadeError::Signal("hmac auth configured without a secret".to_string()))?;
            let signature = credential
                .ok_or_else(|| CascadeError::Signal("webhook auth failure: missing signature".to_string()))?;
            let decoded = hex::decode(signature)
                .map_err(|_| CascadeError::Signal("webhook auth failure: malformed signature".to_string()))?;

            let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
                .map_err(|_| CascadeError::Signal("hmac key setup failed".to_string()))?;
            mac.update(body);
            mac.verify_slice(&decoded)
                .map_err(|_| CascadeError::Signal("webhook auth failure: bad signature".to_string()))
        }
    }
}

/// A decision block embedded in assistant output
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionBlock {
    pub question: String,
    pub options: Vec<DecisionOption>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionOption {
    pub value: String,
    pub route: Option<String>,
}

/// Detect a tagged decision region in assistant output
///
/// The canonical shape is a fenced block:
///
/// ````text
/// ```decision
/// {"question": "...", "options": [{"value": "ship", "route": "publish"}]}
/// ```
/// ````
pub fn detect_decision_block(text: &str) -> Option<DecisionBlock> {
    let start = text.find("```decision")?;
    let after = &text[start + "```decision".len()..];
    let end = after.find("```")?;
    let parsed: Value = serde_json::from_str(after[..end].trim()).ok()?;

    let question = parsed.get("question")?.as_str()?.to_string();
    let options = parsed
        .get("options")?
        .as_array()?
        .iter()
        .filter_map(|o| {
            Some(DecisionOption {
                value: o.get("value")?.as_str()?.to_string(),
                route: o.get("route").and_then(|r| r.as_str()).map(str::to_string),
            })
        })
        .collect::<Vec<_>>();

    if options.is_empty() {
        return None;
    }
    Some(DecisionBlock { question, options })
}

#[cfg(test)]
mod tests {
    use super::*;
    use echolog::MemorySink;

    fn defs(entries: &[(&str, SignalDef)]) -> BTreeMap<String, SignalDef> {
        entries.iter().map(|(n, d)| (n.to_string(), d.clone())).collect()
    }

    fn human_signal(timeout_seconds: Option<f64>) -> SignalDef {
        SignalDef {
            kind: SignalKind::Human,
            schema: None,
            auth: None,
            timeout_seconds,
            interval_seconds: None,
            duration_seconds: None,
            children: Vec::new(),
            combine: CompositeMode::default(),
        }
    }

    #[tokio::test]
    async fn test_fire_then_wait_resolves_immediately() {
        let manager = SignalManager::new();
        let sink = MemorySink::new();
        let parent = TraceNode::root(NodeType::PhaseStart);
        let all = defs(&[("approval", human_signal(None))]);

        manager.fire(&sink, "s", "approval", json!("approve")).await.unwrap();

        let outcome = manager
            .wait(&sink, "s", "approval", &all, None, &parent, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, SignalOutcome::Fired(json!("approve")));
    }

    #[tokio::test]
    async fn test_wait_then_fire() {
        let manager = Arc::new(SignalManager::new());
        let sink = Arc::new(MemorySink::new());
        let parent = TraceNode::root(NodeType::PhaseStart);
        let all = defs(&[("go", human_signal(Some(10.0)))]);

        let waiter = {
            let manager = manager.clone();
            let sink = sink.clone();
            let all = all.clone();
            tokio::spawn(async move {
                manager
                    .wait(sink.as_ref(), "s", "go", &all, None, &parent, &CancelToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.fire(sink.as_ref(), "s", "go", json!({"ok": true})).await.unwrap();

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome, SignalOutcome::Fired(json!({"ok": true})));

        // signal_wait and signal_fired both durable
        assert_eq!(sink.events_by_type("s", NodeType::SignalWait).await.unwrap().len(), 1);
        assert_eq!(sink.events_by_type("s", NodeType::SignalFired).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_timeout_times_out_immediately() {
        let manager = SignalManager::new();
        let sink = MemorySink::new();
        let parent = TraceNode::root(NodeType::PhaseStart);
        let all = defs(&[("never", human_signal(Some(0.0)))]);

        let outcome = manager
            .wait(&sink, "s", "never", &all, None, &parent, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, SignalOutcome::TimedOut);
        assert_eq!(sink.events_by_type("s", NodeType::SignalTimeout).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wait_survives_process_restart_via_sink() {
        let sink = MemorySink::new();
        let parent = TraceNode::root(NodeType::PhaseStart);
        let all = defs(&[("resume", human_signal(None))]);

        // First "process" records the fire
        {
            let manager = SignalManager::new();
            manager.fire(&sink, "s", "resume", json!("payload")).await.unwrap();
        }

        // Fresh manager (new process) reads the resolution from the sink
        let manager = SignalManager::new();
        let outcome = manager
            .wait(&sink, "s", "resume", &all, None, &parent, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, SignalOutcome::Fired(json!("payload")));
    }

    #[tokio::test]
    async fn test_time_signal_fires_after_duration() {
        let manager = SignalManager::new();
        let sink = MemorySink::new();
        let parent = TraceNode::root(NodeType::PhaseStart);
        let timer = SignalDef {
            kind: SignalKind::Time,
            duration_seconds: Some(0.01),
            ..human_signal(None)
        };
        let all = defs(&[("tick", timer)]);

        let outcome = manager
            .wait(&sink, "s", "tick", &all, None, &parent, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, SignalOutcome::Fired(Value::Null));
    }

    struct CountdownSensor {
        remaining: Mutex<u32>,
    }

    #[async_trait]
    impl Sensor for CountdownSensor {
        async fn poll(&self) -> Result<Option<Value>, CascadeError> {
            let mut remaining = self.remaining.lock().unwrap();
            if *remaining == 0 {
                Ok(Some(json!("ready")))
            } else {
                *remaining -= 1;
                Ok(None)
            }
        }
    }

    #[tokio::test]
    async fn test_sensor_polls_until_true() {
        let manager = SignalManager::new();
        manager.register_sensor("disk_ready", Arc::new(CountdownSensor { remaining: Mutex::new(2) }));
        let sink = MemorySink::new();
        let parent = TraceNode::root(NodeType::PhaseStart);
        let sensor = SignalDef {
            kind: SignalKind::Sensor,
            interval_seconds: Some(0.005),
            ..human_signal(Some(5.0))
        };
        let all = defs(&[("disk_ready", sensor)]);

        let outcome = manager
            .wait(&sink, "s", "disk_ready", &all, None, &parent, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, SignalOutcome::Fired(json!("ready")));
    }

    #[tokio::test]
    async fn test_composite_any_first_fire_wins() {
        let manager = Arc::new(SignalManager::new());
        let sink = Arc::new(MemorySink::new());
        let parent = TraceNode::root(NodeType::PhaseStart);

        let composite = SignalDef {
            kind: SignalKind::Composite,
            children: vec!["a".to_string(), "b".to_string()],
            combine: CompositeMode::Any,
            ..human_signal(None)
        };
        let all = defs(&[
            ("a", human_signal(Some(10.0))),
            ("b", human_signal(Some(10.0))),
            ("either", composite),
        ]);

        let waiter = {
            let manager = manager.clone();
            let sink = sink.clone();
            let all = all.clone();
            tokio::spawn(async move {
                manager
                    .wait(sink.as_ref(), "s", "either", &all, None, &parent, &CancelToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.fire(sink.as_ref(), "s", "b", json!(7)).await.unwrap();

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome, SignalOutcome::Fired(json!({"signal": "b", "value": 7})));
    }

    #[tokio::test]
    async fn test_composite_any_all_children_timeout() {
        let manager = SignalManager::new();
        let sink = MemorySink::new();
        let parent = TraceNode::root(NodeType::PhaseStart);

        let composite = SignalDef {
            kind: SignalKind::Composite,
            children: vec!["a".to_string(), "b".to_string()],
            combine: CompositeMode::Any,
            ..human_signal(None)
        };
        let all = defs(&[
            ("a", human_signal(Some(0.01))),
            ("b", human_signal(Some(0.01))),
            ("either", composite),
        ]);

        let outcome = manager
            .wait(&sink, "s", "either", &all, None, &parent, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, SignalOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_composite_all_collects_values() {
        let manager = SignalManager::new();
        let sink = MemorySink::new();
        let parent = TraceNode::root(NodeType::PhaseStart);

        manager.fire(&sink, "s", "a", json!(1)).await.unwrap();
        manager.fire(&sink, "s", "b", json!(2)).await.unwrap();

        let composite = SignalDef {
            kind: SignalKind::Composite,
            children: vec!["a".to_string(), "b".to_string()],
            combine: CompositeMode::All,
            ..human_signal(None)
        };
        let all = defs(&[("a", human_signal(None)), ("b", human_signal(None)), ("both", composite)]);

        let outcome = manager
            .wait(&sink, "s", "both", &all, None, &parent, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, SignalOutcome::Fired(json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_verify_webhook_hmac() {
        let auth = SignalAuth {
            kind: SignalAuthKind::Hmac,
            secret: Some("topsecret".to_string()),
        };
        let body = b"{\"approve\": true}";

        let mut mac = Hmac::<Sha256>::new_from_slice(b"topsecret").unwrap();
        mac.update(body);
        let signature = hex::encode(mac.finalize().into_bytes());

        assert!(verify_webhook(Some(&auth), body, Some(&signature)).is_ok());
        assert!(verify_webhook(Some(&auth), body, Some("deadbeef")).is_err());
        assert!(verify_webhook(Some(&auth), body, None).is_err());
        // No auth config accepts anything
        assert!(verify_webhook(None, body, None).is_ok());
    }

    #[test]
    fn test_verify_webhook_api_key() {
        let auth = SignalAuth {
            kind: SignalAuthKind::ApiKey,
            secret: Some("key-123".to_string()),
        };
        assert!(verify_webhook(Some(&auth), b"", Some("key-123")).is_ok());
        assert!(verify_webhook(Some(&auth), b"", Some("wrong")).is_err());
    }

    #[test]
    fn test_detect_decision_block() {
        let text = "I need a human call here.\n```decision\n{\"question\": \"Ship it?\", \"options\": \
                    [{\"value\": \"yes\", \"route\": \"publish\"}, {\"value\": \"no\"}]}\n```";
        let block = detect_decision_block(text).unwrap();
        assert_eq!(block.question, "Ship it?");
        assert_eq!(block.options.len(), 2);
        assert_eq!(block.options[0].route.as_deref(), Some("publish"));
        assert!(block.options[1].route.is_none());

        assert!(detect_decision_block("no block here").is_none());
        assert!(detect_decision_block("```decision\nnot json\n```").is_none());
    }
}
