//! ModelClient trait and the scripted implementation
//!
//! `ScriptedClient` is a first-class library type rather than test-only
//! plumbing: the replayer answers model calls from a prior session's logged
//! responses through exactly this client.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::{ModelError, ModelRequest, ModelResponse};

/// Stateless chat-completion abstraction
///
/// Each call is independent; conversation state lives in the Echo, not the
/// client. Implementations must be safe to share across sounding workers.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;
}

/// Client that replays a fixed sequence of responses
pub struct ScriptedClient {
    responses: Mutex<VecDeque<ModelResponse>>,
    requests: Mutex<Vec<ModelRequest>>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of completed calls so far
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests captured in call order
    pub fn captured_requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        self.responses.lock().unwrap().pop_front().ok_or_else(|| {
            debug!("ScriptedClient: script exhausted");
            ModelError::InvalidResponse("scripted responses exhausted".to_string())
        })
    }
}

/// Client answering from a closure, for tests that inspect the request
pub struct FnClient<F> {
    f: F,
}

impl<F> FnClient<F>
where
    F: Fn(&ModelRequest) -> Result<ModelResponse, ModelError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ModelClient for FnClient<F>
where
    F: Fn(&ModelRequest) -> Result<ModelResponse, ModelError> + Send + Sync,
{
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        (self.f)(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ModelRequest {
        ModelRequest {
            model: "test-model".to_string(),
            system: "You are a test".to_string(),
            messages: vec![],
            tools: vec![],
            max_tokens: 1024,
            native_tools: true,
        }
    }

    #[tokio::test]
    async fn test_scripted_returns_in_order() {
        let client = ScriptedClient::new(vec![ModelResponse::text("one"), ModelResponse::text("two")]);

        assert_eq!(client.complete(request()).await.unwrap().content.as_deref(), Some("one"));
        assert_eq!(client.complete(request()).await.unwrap().content.as_deref(), Some("two"));
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_scripted_errors_when_exhausted() {
        let client = ScriptedClient::new(vec![]);
        let result = client.complete(request()).await;
        assert!(matches!(result, Err(ModelError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_scripted_captures_requests() {
        let client = ScriptedClient::new(vec![ModelResponse::text("ok")]);
        client.complete(request()).await.unwrap();

        let captured = client.captured_requests();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].model, "test-model");
    }

    #[tokio::test]
    async fn test_fn_client_sees_request() {
        let client = FnClient::new(|req: &ModelRequest| Ok(ModelResponse::text(format!("model={}", req.model))));
        let response = client.complete(request()).await.unwrap();
        assert_eq!(response.content.as_deref(), Some("model=test-model"));
    }
}
