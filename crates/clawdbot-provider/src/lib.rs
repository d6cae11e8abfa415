//! Named interface to the external Model Backend.
//!
//! The gateway never speaks a vendor SDK directly; it talks to a
//! [`ModelBackend`] resolved from a [`BackendRegistry`] by provider id.
//! Backends stream [`BackendEvent`]s; cancellation is signalled through a
//! typed [`Cancelled`] marker so the fallback chain can tell a cooperative
//! abort apart from a transient failure.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// A named context file injected into the model's context window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextFile {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub model: String,
    pub system_prompt: String,
    pub context_files: Vec<ContextFile>,
    pub skills_prompt: String,
    pub thinking: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Streaming events emitted by a backend during one turn.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    TextDelta { text: String },
    ToolStart { name: String, args: serde_json::Value },
    ToolEnd { name: String, result: String },
    End { usage: Option<Usage> },
}

pub type BackendStream = Pin<Box<dyn Stream<Item = Result<BackendEvent>> + Send>>;

#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn stream(
        &self,
        request: BackendRequest,
        cancel: CancellationToken,
    ) -> Result<BackendStream>;
}

/// Cooperative-abort marker. Propagates unchanged through the fallback
/// chain; never triggers a fallback attempt.
#[derive(Debug, thiserror::Error)]
#[error("cancelled")]
pub struct Cancelled;

pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<Cancelled>().is_some())
}

#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn ModelBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider_id: &str, backend: Arc<dyn ModelBackend>) {
        self.backends.insert(provider_id.to_string(), backend);
    }

    pub fn get(&self, provider_id: &str) -> Result<Arc<dyn ModelBackend>> {
        self.backends
            .get(provider_id)
            .cloned()
            .ok_or_else(|| anyhow!("no backend registered for provider: {provider_id}"))
    }

    pub fn providers(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.backends.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Echo backend used by tests and by surfaces running without a real
/// model connection. Emits `stub:<provider>:<model>` plus the message.
pub struct StubBackend {
    provider_id: String,
}

impl StubBackend {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
        }
    }
}

#[async_trait]
impl ModelBackend for StubBackend {
    async fn stream(
        &self,
        request: BackendRequest,
        cancel: CancellationToken,
    ) -> Result<BackendStream> {
        if cancel.is_cancelled() {
            return Err(anyhow::Error::new(Cancelled));
        }
        let events = vec![
            Ok(BackendEvent::TextDelta {
                text: format!("stub:{}:{}", self.provider_id, request.model),
            }),
            Ok(BackendEvent::End {
                usage: Some(Usage {
                    input_tokens: request.message.len() as u64,
                    output_tokens: 8,
                }),
            }),
        ];
        Ok(Box::pin(tokio_stream::iter(events)))
    }
}

/// A backend whose responses are scripted up front; used across the
/// workspace's test suites.
pub struct ScriptedBackend {
    responses: std::sync::Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses),
        }
    }

    pub fn always(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn stream(
        &self,
        _request: BackendRequest,
        cancel: CancellationToken,
    ) -> Result<BackendStream> {
        if cancel.is_cancelled() {
            return Err(anyhow::Error::new(Cancelled));
        }
        let text = {
            let mut responses = self.responses.lock().expect("scripted responses");
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                responses
                    .first()
                    .cloned()
                    .ok_or_else(|| anyhow!("scripted backend exhausted"))?
            }
        };
        let events = vec![
            Ok(BackendEvent::TextDelta { text }),
            Ok(BackendEvent::End { usage: None }),
        ];
        Ok(Box::pin(tokio_stream::iter(events)))
    }
}

/// Register stub backends for the providers the default model chain names.
pub fn register_builtin_backends(registry: &mut BackendRegistry) {
    registry.register("anthropic", Arc::new(StubBackend::new("anthropic")));
    registry.register("openai", Arc::new(StubBackend::new("openai")));
    registry.register("google", Arc::new(StubBackend::new("google")));
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;

    #[tokio::test]
    async fn stub_backend_emits_text_then_end() {
        let backend = StubBackend::new("anthropic");
        let request = BackendRequest {
            model: "claude-sonnet-4-20250514".into(),
            system_prompt: String::new(),
            context_files: vec![],
            skills_prompt: String::new(),
            thinking: None,
            message: "hi".into(),
        };
        let mut stream = backend
            .stream(request, CancellationToken::new())
            .await
            .unwrap();

        let mut text = String::new();
        let mut usage = None;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                BackendEvent::TextDelta { text: t } => text.push_str(&t),
                BackendEvent::End { usage: u } => usage = u,
                _ => {}
            }
        }
        assert_eq!(text, "stub:anthropic:claude-sonnet-4-20250514");
        assert_eq!(usage.unwrap().input_tokens, 2);
    }

    #[tokio::test]
    async fn stub_backend_respects_pre_cancelled_token() {
        let backend = StubBackend::new("anthropic");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = BackendRequest {
            model: "m".into(),
            system_prompt: String::new(),
            context_files: vec![],
            skills_prompt: String::new(),
            thinking: None,
            message: "hi".into(),
        };
        let err = match backend.stream(request, cancel).await {
            Ok(_) => panic!("expected stream to fail"),
            Err(e) => e,
        };
        assert!(is_cancellation(&err));
    }

    #[test]
    fn cancellation_marker_survives_context() {
        let err = anyhow::Error::new(Cancelled).context("model call aborted");
        assert!(is_cancellation(&err));

        let plain = anyhow!("connection reset");
        assert!(!is_cancellation(&plain));
    }

    #[test]
    fn registry_lookup() {
        let mut registry = BackendRegistry::new();
        register_builtin_backends(&mut registry);
        assert!(registry.get("anthropic").is_ok());
        assert!(registry.get("nonexistent").is_err());
        assert_eq!(registry.providers(), vec!["anthropic", "google", "openai"]);
    }

    #[tokio::test]
    async fn scripted_backend_steps_through_responses() {
        let backend = ScriptedBackend::new(vec!["one".into(), "two".into()]);
        for expected in ["one", "two", "two"] {
            let request = BackendRequest {
                model: "m".into(),
                system_prompt: String::new(),
                context_files: vec![],
                skills_prompt: String::new(),
                thinking: None,
                message: "hi".into(),
            };
            let mut stream = backend
                .stream(request, CancellationToken::new())
                .await
                .unwrap();
            let mut text = String::new();
            while let Some(event) = stream.next().await {
                if let BackendEvent::TextDelta { text: t } = event.unwrap() {
                    text.push_str(&t);
                }
            }
            assert_eq!(text, expected);
        }
    }
}
