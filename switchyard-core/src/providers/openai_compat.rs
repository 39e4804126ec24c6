//! Driver for providers speaking the OpenAI chat-completions dialect.
//!
//! One implementation covers most of the fleet: Groq, OpenRouter, NVIDIA NIM,
//! HuggingFace's router, Cloudflare Workers AI and Pollinations all accept
//! this wire format, differing only in base URL and auth header.

use crate::catalog::{CanonicalModel, Provider, ProviderKind};
use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, StreamChunk};
use crate::providers::http_client::{map_error_response, AuthStrategy, HttpProviderClient};
use crate::providers::{ChatStream, ProviderDriver};
use async_stream::stream;
use std::time::Duration;

pub struct OpenAiCompatDriver {
    http: HttpProviderClient,
    provider_id: String,
}

impl OpenAiCompatDriver {
    pub fn new(
        provider: &Provider,
        credential: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let base_url = provider
            .endpoint
            .clone()
            .or_else(|| default_endpoint(provider.kind))
            .ok_or_else(|| ProviderError::Configuration {
                message: format!("provider {} declares no endpoint", provider.id),
            })?;

        let auth = match provider.kind {
            ProviderKind::CustomAuth => {
                let name = provider
                    .extra
                    .get("auth_header")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ProviderError::Configuration {
                        message: format!("provider {} is custom-auth but sets no auth_header", provider.id),
                    })?;
                let prefix = provider
                    .extra
                    .get("auth_prefix")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let credential = credential.ok_or_else(|| ProviderError::Configuration {
                    message: format!("provider {} has no credential", provider.id),
                })?;
                AuthStrategy::Header {
                    name: name.to_string(),
                    value: format!("{prefix}{credential}"),
                }
            }
            _ => match credential {
                Some(token) => AuthStrategy::Bearer { token },
                None => AuthStrategy::None,
            },
        };

        Ok(Self {
            http: HttpProviderClient::new(timeout, base_url, auth)?,
            provider_id: provider.id.clone(),
        })
    }

    /// Build the upstream request body: the canonical request with the
    /// provider-native model path substituted, gateway-only fields stripped,
    /// and the stream flag pinned.
    fn wire_body(request: &ChatRequest, model: &CanonicalModel, stream: bool) -> serde_json::Value {
        let mut body = serde_json::to_value(request).unwrap_or_default();
        if let Some(map) = body.as_object_mut() {
            map.remove("provider");
            map.insert("model".to_string(), model.model_path.clone().into());
            if stream {
                map.insert("stream".to_string(), true.into());
                // Ask for the terminal usage frame so token accounting works.
                map.insert(
                    "stream_options".to_string(),
                    serde_json::json!({ "include_usage": true }),
                );
            } else {
                map.remove("stream");
            }
        }
        body
    }
}

fn default_endpoint(kind: ProviderKind) -> Option<String> {
    match kind {
        ProviderKind::Pollinations => Some("https://text.pollinations.ai/openai".to_string()),
        _ => None,
    }
}

#[async_trait::async_trait]
impl ProviderDriver for OpenAiCompatDriver {
    fn name(&self) -> &str {
        &self.provider_id
    }

    async fn call(
        &self,
        request: &ChatRequest,
        model: &CanonicalModel,
    ) -> Result<ChatResponse, ProviderError> {
        let body = Self::wire_body(request, model, false);
        self.http.post_json("/chat/completions", &body).await
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        model: &CanonicalModel,
    ) -> Result<ChatStream, ProviderError> {
        let body = Self::wire_body(request, model, true);
        let response = self.http.post_json_raw("/chat/completions", &body).await?;

        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }

        let stream = Box::pin(stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = futures::StreamExt::next(&mut bytes_stream).await {
                match chunk_result {
                    Ok(chunk) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));

                        while let Some(line_end) = buffer.find('\n') {
                            let line = buffer[..line_end].trim().to_string();
                            buffer = buffer[line_end + 1..].to_string();

                            if let Some(json_str) = line.strip_prefix("data: ") {
                                if json_str == "[DONE]" {
                                    return;
                                }

                                match serde_json::from_str::<StreamChunk>(json_str) {
                                    Ok(stream_chunk) => yield Ok(stream_chunk),
                                    Err(e) => yield Err(ProviderError::Serialization(e)),
                                }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Capabilities;
    use crate::error::ErrorClass;
    use crate::models::Message;
    use futures::StreamExt;
    use std::collections::HashMap;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(endpoint: &str) -> Provider {
        Provider {
            id: "groq".to_string(),
            display_name: "Groq".to_string(),
            kind: ProviderKind::OpenaiCompatible,
            enabled: true,
            endpoint: Some(endpoint.to_string()),
            credential_ref: None,
            tier: 0,
            free: true,
            rpm_limit: None,
            tpm_limit: None,
            models: vec![],
            extra: HashMap::new(),
        }
    }

    fn model() -> CanonicalModel {
        CanonicalModel {
            id: "groq/llama".to_string(),
            provider_id: "groq".to_string(),
            model_path: "llama-3.3-70b-versatile".to_string(),
            capabilities: Capabilities {
                streaming: true,
                ..Default::default()
            },
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "fast".to_string(),
            messages: vec![Message::user("hi")],
            provider: Some("groq".to_string()),
            ..Default::default()
        }
    }

    fn completion_json() -> serde_json::Value {
        serde_json::json!({
            "id": "cmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "llama-3.3-70b-versatile",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        })
    }

    #[tokio::test]
    async fn call_substitutes_native_model_and_strips_gateway_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(
                serde_json::json!({"model": "llama-3.3-70b-versatile"}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_json()))
            .expect(1)
            .mount(&server)
            .await;

        let driver = OpenAiCompatDriver::new(
            &provider(&server.uri()),
            Some("sk-test".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();

        let response = driver.call(&request(), &model()).await.unwrap();
        assert_eq!(response.choices[0].message.content, "hello");
        assert_eq!(response.usage.unwrap().total_tokens, 5);

        // The gateway-only preference field must not leak upstream.
        let received = &server.received_requests().await.unwrap()[0];
        let body: serde_json::Value = serde_json::from_slice(&received.body).unwrap();
        assert!(body.get("provider").is_none());
    }

    #[tokio::test]
    async fn bearer_credential_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_json()))
            .expect(1)
            .mount(&server)
            .await;

        let driver = OpenAiCompatDriver::new(
            &provider(&server.uri()),
            Some("sk-test".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        driver.call(&request(), &model()).await.unwrap();
    }

    #[tokio::test]
    async fn custom_auth_header_from_opaque_config() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-api-key", "key-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_json()))
            .expect(1)
            .mount(&server)
            .await;

        let mut provider = provider(&server.uri());
        provider.kind = ProviderKind::CustomAuth;
        provider
            .extra
            .insert("auth_header".to_string(), serde_json::json!("x-api-key"));

        let driver = OpenAiCompatDriver::new(
            &provider,
            Some("key-123".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        driver.call(&request(), &model()).await.unwrap();
    }

    #[tokio::test]
    async fn rate_limit_maps_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "30")
                    .set_body_json(serde_json::json!({"error": {"message": "slow down"}})),
            )
            .mount(&server)
            .await;

        let driver = OpenAiCompatDriver::new(
            &provider(&server.uri()),
            None,
            Duration::from_secs(5),
        )
        .unwrap();

        let err = driver.call(&request(), &model()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn auth_and_client_errors_classify() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad request"))
            .mount(&server)
            .await;

        let driver = OpenAiCompatDriver::new(
            &provider(&server.uri()),
            None,
            Duration::from_secs(5),
        )
        .unwrap();

        let err = driver.call(&request(), &model()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::AuthError);
        let err = driver.call(&request(), &model()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::ClientError);
    }

    #[tokio::test]
    async fn stream_parses_frames_until_done() {
        let sse = concat!(
            "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"he\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        );

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let driver = OpenAiCompatDriver::new(
            &provider(&server.uri()),
            None,
            Duration::from_secs(5),
        )
        .unwrap();

        let mut stream = driver.stream(&request(), &model()).await.unwrap();
        let mut chunks = Vec::new();
        while let Some(item) = stream.next().await {
            chunks.push(item.unwrap());
        }

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("he"));
        assert!(chunks[2].is_terminal());
        assert_eq!(chunks[2].usage.unwrap().total_tokens, 5);
    }
}
