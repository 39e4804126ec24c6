//! Shared fixtures for unit tests: a scripted driver and catalog builders.

use crate::catalog::{CanonicalModel, Capabilities, Provider, ProviderKind};
use crate::error::ProviderError;
use crate::models::{
    ChatRequest, ChatResponse, Choice, Delta, Message, StreamChoice, StreamChunk, Usage,
};
use crate::providers::{ChatStream, ProviderDriver};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub(crate) fn provider(id: &str, free: bool, tier: u8, rpm: Option<u32>) -> Provider {
    Provider {
        id: id.to_string(),
        display_name: id.to_string(),
        kind: ProviderKind::OpenaiCompatible,
        enabled: true,
        endpoint: Some("http://localhost".to_string()),
        credential_ref: None,
        tier,
        free,
        rpm_limit: rpm,
        tpm_limit: None,
        models: vec![],
        extra: HashMap::new(),
    }
}

pub(crate) fn model(id: &str, provider_id: &str) -> CanonicalModel {
    CanonicalModel {
        id: id.to_string(),
        provider_id: provider_id.to_string(),
        model_path: "native".to_string(),
        capabilities: Capabilities {
            streaming: true,
            ..Default::default()
        },
    }
}

pub(crate) fn response(usage: Usage) -> ChatResponse {
    ChatResponse {
        id: "cmpl-test".to_string(),
        object: "chat.completion".to_string(),
        created: 0,
        model: "native".to_string(),
        choices: vec![Choice {
            index: 0,
            message: Message::assistant("ok"),
            finish_reason: Some("stop".to_string()),
        }],
        usage: Some(usage),
    }
}

pub(crate) fn chunk(text: &str) -> StreamChunk {
    StreamChunk {
        id: "chunk-test".to_string(),
        object: "chat.completion.chunk".to_string(),
        created: 0,
        model: "native".to_string(),
        choices: vec![StreamChoice {
            index: 0,
            delta: Delta {
                role: None,
                content: Some(text.to_string()),
            },
            finish_reason: None,
        }],
        usage: None,
    }
}

pub(crate) fn terminal_chunk(usage: Usage) -> StreamChunk {
    StreamChunk {
        id: "chunk-test".to_string(),
        object: "chat.completion.chunk".to_string(),
        created: 0,
        model: "native".to_string(),
        choices: vec![StreamChoice {
            index: 0,
            delta: Delta::default(),
            finish_reason: Some("stop".to_string()),
        }],
        usage: Some(usage),
    }
}

pub(crate) fn request(selector: &str) -> ChatRequest {
    ChatRequest {
        model: selector.to_string(),
        messages: vec![Message::user("hi")],
        ..Default::default()
    }
}

/// One scripted reaction of the driver, consumed per call.
pub(crate) enum Scripted {
    Reply(ChatResponse),
    ReplyStream(Vec<Result<StreamChunk, ProviderError>>),
    Fail(ProviderError),
    /// Sleep, then reply. Lets tests trip the pipeline's deadline.
    Stall(Duration, ChatResponse),
}

/// Driver that plays back a fixed script and counts its invocations.
pub(crate) struct ScriptedDriver {
    name: String,
    script: Mutex<VecDeque<Scripted>>,
    pub calls: AtomicU32,
}

impl ScriptedDriver {
    pub(crate) fn new(name: &str, script: Vec<Scripted>) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self) -> Scripted {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Scripted::Fail(ProviderError::Configuration {
                message: "scripted driver ran out of lines".to_string(),
            }))
    }
}

#[async_trait::async_trait]
impl ProviderDriver for ScriptedDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        _request: &ChatRequest,
        _model: &CanonicalModel,
    ) -> Result<ChatResponse, ProviderError> {
        match self.next() {
            Scripted::Reply(response) => Ok(response),
            Scripted::Fail(error) => Err(error),
            Scripted::Stall(delay, response) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            Scripted::ReplyStream(_) => Err(ProviderError::Configuration {
                message: "stream scripted for a non-streaming call".to_string(),
            }),
        }
    }

    async fn stream(
        &self,
        _request: &ChatRequest,
        _model: &CanonicalModel,
    ) -> Result<ChatStream, ProviderError> {
        match self.next() {
            Scripted::ReplyStream(items) => Ok(Box::pin(futures::stream::iter(items))),
            Scripted::Fail(error) => Err(error),
            Scripted::Stall(delay, _) => {
                tokio::time::sleep(delay).await;
                Err(ProviderError::Timeout)
            }
            Scripted::Reply(_) => Err(ProviderError::Configuration {
                message: "non-streaming reply scripted for a stream call".to_string(),
            }),
        }
    }
}
