//! RunContext - the value threaded through the whole execution path
//!
//! There are no process-wide registries or singletons. Everything a deeply
//! nested call site needs - the sink, the tool and validator registries,
//! the model client, the scheduler, the signal manager, the cancellation
//! token - rides in one cloneable context constructed once per runner.

use std::path::PathBuf;
use std::sync::Arc;

use crate::context::Embedder;
use crate::model::ModelClient;
use crate::scheduler::{CancelToken, Scheduler};
use crate::signals::SignalManager;
use crate::tools::ToolRegistry;
use crate::wards::ValidatorRegistry;
use echolog::EventSink;

#[derive(Clone)]
pub struct RunContext {
    pub sink: Arc<dyn EventSink>,
    pub model: Arc<dyn ModelClient>,
    pub tools: Arc<ToolRegistry>,
    pub validators: Arc<ValidatorRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub signals: Arc<SignalManager>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub cancel: CancelToken,

    /// Root of the session-scoped image tree
    pub images_root: PathBuf,

    /// Model used when a phase does not name one
    pub default_model: String,

    /// Ceiling for sub-cascade nesting
    pub max_depth: u32,
}

impl RunContext {
    pub fn new(model: Arc<dyn ModelClient>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            model,
            tools: Arc::new(ToolRegistry::new()),
            validators: Arc::new(ValidatorRegistry::new()),
            scheduler: Arc::new(Scheduler::new(4)),
            signals: Arc::new(SignalManager::new()),
            embedder: None,
            cancel: CancelToken::new(),
            images_root: PathBuf::from("images"),
            default_model: "default".to_string(),
            max_depth: 3,
        }
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_validators(mut self, validators: Arc<ValidatorRegistry>) -> Self {
        self.validators = validators;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_signals(mut self, signals: Arc<SignalManager>) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_images_root(mut self, images_root: impl Into<PathBuf>) -> Self {
        self.images_root = images_root.into();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }
}
