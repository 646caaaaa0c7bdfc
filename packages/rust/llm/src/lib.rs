//! LLM backend abstraction for novelkb.
//!
//! The extractor and the doc builder only see [`LlmBackend`]: an opaque
//! service that may be slow, fail, or rate-limit. This crate provides:
//! - [`OpenAiBackend`]: any OpenAI-compatible `/chat/completions` endpoint
//! - [`ScriptedBackend`]: an in-memory backend driven by a closure
//! - [`RetryPolicy`]: bounded exponential backoff
//! - [`PromptTemplate`]: `{{name}}` prompt files

pub mod error;
pub mod openai;
pub mod prompt;
pub mod retry;

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

pub use error::BackendError;
pub use openai::OpenAiBackend;
pub use prompt::PromptTemplate;
pub use retry::{Attempted, RetryPolicy, Retryable};

/// One system + user prompt pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Send one request and return the completion text.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError>;

    /// Model identifier, recorded in build manifests.
    fn model(&self) -> &str;
}

/// Run one backend call with a deadline.
pub async fn complete_with_timeout(
    backend: &dyn LlmBackend,
    request: &CompletionRequest,
    timeout: Duration,
) -> Result<String, BackendError> {
    match tokio::time::timeout(timeout, backend.complete(request)).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(timeout)),
    }
}

type Script = dyn Fn(&CompletionRequest, usize) -> Result<String, BackendError> + Send + Sync;

/// Backend whose replies come from a closure `(request, call_index)`.
///
/// Used for offline runs and tests. Every request is recorded.
pub struct ScriptedBackend {
    script: Box<Script>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&CompletionRequest, usize) -> Result<String, BackendError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always reply with `text`.
    pub fn fixed(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_, _| Ok(text.clone()))
    }

    /// Sleep before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        match self.requests.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.requests.lock() {
            Ok(mut guard) => guard.push(request.clone()),
            Err(poisoned) => poisoned.into_inner().push(request.clone()),
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.script)(request, call)
    }

    fn model(&self) -> &str {
        "scripted"
    }
}
