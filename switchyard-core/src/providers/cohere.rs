//! Driver translating the canonical chat shape to Cohere's native chat API.

use crate::catalog::{CanonicalModel, Provider};
use crate::error::ProviderError;
use crate::models::{
    ChatRequest, ChatResponse, Choice, Delta, Message, Role, StreamChoice, StreamChunk, Usage,
};
use crate::providers::http_client::{map_error_response, AuthStrategy, HttpProviderClient};
use crate::providers::{ChatStream, ProviderDriver};
use async_stream::stream;
use serde_json::json;
use std::time::Duration;

const DEFAULT_ENDPOINT: &str = "https://api.cohere.ai/v1";

pub struct CohereDriver {
    http: HttpProviderClient,
    provider_id: String,
}

impl CohereDriver {
    pub fn new(
        provider: &Provider,
        credential: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let base_url = provider
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let token = credential.ok_or_else(|| ProviderError::Configuration {
            message: format!("provider {} has no credential", provider.id),
        })?;

        Ok(Self {
            http: HttpProviderClient::new(timeout, base_url, AuthStrategy::Bearer { token })?,
            provider_id: provider.id.clone(),
        })
    }

    /// Cohere's chat endpoint wants the newest message split out from the
    /// running history, with its own role vocabulary.
    fn wire_body(request: &ChatRequest, model: &CanonicalModel, stream: bool) -> serde_json::Value {
        let (history, last) = match request.messages.split_last() {
            Some((last, history)) => (history, last.content.clone()),
            None => (&[][..], String::new()),
        };

        let chat_history: Vec<serde_json::Value> = history
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::Assistant => "CHATBOT",
                        Role::System => "SYSTEM",
                        Role::User | Role::Tool => "USER",
                    },
                    "message": m.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": model.model_path,
            "message": last,
            "chat_history": chat_history,
            "stream": stream,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(p) = request.top_p {
            body["p"] = json!(p);
        }
        if let Some(stop) = &request.stop {
            body["stop_sequences"] = json!(stop);
        }
        body
    }

    fn usage_from_meta(meta: &serde_json::Value) -> Usage {
        let prompt = meta["billed_units"]["input_tokens"].as_u64().unwrap_or(0) as u32;
        let completion = meta["billed_units"]["output_tokens"].as_u64().unwrap_or(0) as u32;
        Usage::new(prompt, completion)
    }
}

#[async_trait::async_trait]
impl ProviderDriver for CohereDriver {
    fn name(&self) -> &str {
        &self.provider_id
    }

    async fn call(
        &self,
        request: &ChatRequest,
        model: &CanonicalModel,
    ) -> Result<ChatResponse, ProviderError> {
        let body = Self::wire_body(request, model, false);
        let native: serde_json::Value = self.http.post_json("/chat", &body).await?;

        let text = native["text"]
            .as_str()
            .ok_or_else(|| ProviderError::InvalidResponse {
                message: "cohere response carries no text".to_string(),
            })?;

        Ok(ChatResponse {
            id: native["response_id"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp() as u64,
            model: model.id.clone(),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(text),
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(Self::usage_from_meta(&native["meta"])),
        })
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        model: &CanonicalModel,
    ) -> Result<ChatStream, ProviderError> {
        let body = Self::wire_body(request, model, true);
        let response = self.http.post_json_raw("/chat", &body).await?;

        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }

        let model_id = model.id.clone();
        let stream = Box::pin(stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();
            let stream_id = uuid::Uuid::new_v4().to_string();

            while let Some(chunk_result) = futures::StreamExt::next(&mut bytes_stream).await {
                match chunk_result {
                    Ok(chunk) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));

                        // Cohere streams newline-delimited JSON events.
                        while let Some(line_end) = buffer.find('\n') {
                            let line = buffer[..line_end].trim().to_string();
                            buffer = buffer[line_end + 1..].to_string();
                            if line.is_empty() {
                                continue;
                            }

                            let event: serde_json::Value = match serde_json::from_str(&line) {
                                Ok(event) => event,
                                Err(e) => {
                                    yield Err(ProviderError::Serialization(e));
                                    return;
                                }
                            };

                            match event["event_type"].as_str() {
                                Some("text-generation") => {
                                    let text = event["text"].as_str().unwrap_or_default().to_string();
                                    yield Ok(StreamChunk {
                                        id: stream_id.clone(),
                                        object: "chat.completion.chunk".to_string(),
                                        created: chrono::Utc::now().timestamp() as u64,
                                        model: model_id.clone(),
                                        choices: vec![StreamChoice {
                                            index: 0,
                                            delta: Delta {
                                                role: None,
                                                content: Some(text),
                                            },
                                            finish_reason: None,
                                        }],
                                        usage: None,
                                    });
                                }
                                Some("stream-end") => {
                                    let usage = Self::usage_from_meta(&event["response"]["meta"]);
                                    yield Ok(StreamChunk {
                                        id: stream_id.clone(),
                                        object: "chat.completion.chunk".to_string(),
                                        created: chrono::Utc::now().timestamp() as u64,
                                        model: model_id.clone(),
                                        choices: vec![StreamChoice {
                                            index: 0,
                                            delta: Delta::default(),
                                            finish_reason: Some("stop".to_string()),
                                        }],
                                        usage: Some(usage),
                                    });
                                    return;
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => yield Err(ProviderError::Http(e)),
                }
            }
        });

        Ok(stream)
    }
}
