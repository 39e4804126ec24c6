//! # Canonical Chat Types
//!
//! Wire-level data model shared by the HTTP adapter, the routing engine and
//! the provider drivers. The shapes follow the OpenAI chat-completions API so
//! the adapter can parse and emit them without translation; drivers for
//! non-compatible upstreams translate at their own edge.
//!
//! ## Requests
//!
//! ```rust
//! use switchyard_core::models::{ChatRequest, Message};
//!
//! let request = ChatRequest {
//!     model: "llama-3.3-70b".to_string(),
//!     messages: vec![Message::user("Hello!")],
//!     stream: Some(false),
//!     ..Default::default()
//! };
//! ```
//!
//! Two fields extend the OpenAI shape:
//!
//! - `provider`: an explicit provider preference that the router honors as
//!   its first tier;
//! - `extra`: a flattened map of passthrough fields forwarded verbatim to
//!   the selected driver (providers accept all sorts of vendor knobs).
//!
//! ## Streaming
//!
//! A streaming response is a finite sequence of [`StreamChunk`] values. The
//! terminal chunk carries the final [`Usage`] so token accounting can happen
//! exactly once per request; the SSE `[DONE]` sentinel is the adapter's
//! concern, not part of the canonical model.
//!
//! Every completion also carries a [`RouteReceipt`] describing which provider
//! and model actually served it and how many attempts that took.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Chat completion request in canonical (OpenAI-compatible) form.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatRequest {
    /// Model selector: an alias or a canonical model id.
    pub model: String,
    /// Ordered conversation messages.
    pub messages: Vec<Message>,
    /// Controls randomness (0.0 to 2.0).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Maximum number of tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Whether to stream the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Nucleus sampling cutoff (0.0 to 1.0).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Sequences that stop generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Tool definitions offered to the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    /// End-user identifier for upstream abuse tracking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Explicit provider preference; tried first when eligible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Opaque passthrough fields forwarded to the driver untouched.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ChatRequest {
    /// Rough token estimate used for routing and quota decisions before the
    /// upstream reports real usage. One token per ~4 characters plus a fixed
    /// overhead for roles and formatting.
    pub fn estimate_tokens(&self) -> u32 {
        let content: usize = self.messages.iter().map(|m| m.content.len()).sum();
        (content as u32 / 4) + 50
    }

    /// Whether the caller asked for a streamed response.
    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender.
    pub role: Role,
    /// Content of the message.
    pub content: String,
    /// Optional name for the message sender.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            name: None,
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name: None,
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            name: None,
        }
    }
}

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Hash, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions and context.
    System,
    /// User input and questions.
    User,
    /// AI assistant responses.
    Assistant,
    /// Tool function results.
    Tool,
}

/// Chat completion response in canonical form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Unique identifier for the completion.
    pub id: String,
    /// Object type (always "chat.completion").
    pub object: String,
    /// Unix timestamp of creation.
    pub created: u64,
    /// Model that produced the completion.
    pub model: String,
    /// Generated completions.
    pub choices: Vec<Choice>,
    /// Token usage statistics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// One frame of a streamed completion.
///
/// The final frame of a well-behaved stream carries `usage`; everything
/// before it carries deltas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamChunk {
    /// Whether this is the terminal frame carrying final usage.
    pub fn is_terminal(&self) -> bool {
        self.usage.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Routing metadata attached to every completion.
///
/// Carried as `x-switchyard-*` response headers for plain responses and as a
/// final metadata frame before `[DONE]` for streamed ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteReceipt {
    /// Provider that served the request.
    pub provider: String,
    /// Canonical model id that served the request.
    pub model: String,
    /// Tier index the winning candidate came from (1 = preferred).
    pub tier: u8,
    /// Total provider attempts made, including the winning one.
    pub attempts: u32,
    /// True when a streaming request was served non-streaming because no
    /// candidate model supports streaming.
    pub downgraded: bool,
}
