//! # Dispatch Module
//!
//! The single entry point the HTTP adapter calls: validate the request,
//! settle the streaming question, run the failover engine, stamp the route
//! receipt. One call per request, whether it ends as a JSON body or a chunk
//! stream.
//!
//! Streaming is settled here, not in the adapter: a streaming request whose
//! candidate models cannot stream is downgraded to a plain response with
//! `downgraded` flagged in the receipt, so the adapter can tell the caller
//! what happened instead of failing a servable request.

use crate::attempt::AttemptOutput;
use crate::catalog::Catalog;
use crate::error::RouteError;
use crate::failover::FailoverEngine;
use crate::models::{ChatRequest, ChatResponse, RouteReceipt};
use crate::providers::ChatStream;
use std::sync::Arc;

/// A completed request, in whichever shape the upstream produced.
pub enum Completion {
    Full {
        response: ChatResponse,
        receipt: RouteReceipt,
    },
    Streaming {
        stream: ChatStream,
        receipt: RouteReceipt,
    },
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Full { response, receipt } => f
                .debug_struct("Full")
                .field("response", response)
                .field("receipt", receipt)
                .finish(),
            Completion::Streaming { receipt, .. } => f
                .debug_struct("Streaming")
                .field("stream", &"<stream>")
                .field("receipt", receipt)
                .finish(),
        }
    }
}

impl Completion {
    pub fn receipt(&self) -> &RouteReceipt {
        match self {
            Completion::Full { receipt, .. } => receipt,
            Completion::Streaming { receipt, .. } => receipt,
        }
    }
}

/// Front door of the engine.
pub struct Dispatcher {
    catalog: Arc<Catalog>,
    engine: FailoverEngine,
}

impl Dispatcher {
    pub fn new(catalog: Arc<Catalog>, engine: FailoverEngine) -> Self {
        Self { catalog, engine }
    }

    /// Serve one canonical request.
    pub async fn run(&self, mut request: ChatRequest) -> Result<Completion, RouteError> {
        if request.model.trim().is_empty() {
            return Err(RouteError::InvalidRequest {
                message: "model selector is empty".to_string(),
            });
        }
        if request.messages.is_empty() {
            return Err(RouteError::InvalidRequest {
                message: "messages are empty".to_string(),
            });
        }

        // Resolve once up front: unknown selectors fail before any routing,
        // and the capability questions are answered against this slice.
        let resolved = self.catalog.resolve(&request.model)?;

        if request.tools.is_some() && !resolved.is_empty() {
            let any_tools = resolved.iter().any(|m| m.capabilities.tools);
            if !any_tools {
                return Err(RouteError::CapabilityUnsupported {
                    capability: "tools".to_string(),
                });
            }
        }

        let wants_stream = request.wants_stream();
        let can_stream = resolved.iter().any(|m| m.capabilities.streaming);
        let downgraded = wants_stream && !resolved.is_empty() && !can_stream;
        if downgraded {
            tracing::debug!(
                model = %request.model,
                "no candidate model streams, downgrading to a plain response"
            );
            request.stream = Some(false);
        }

        let result = self.engine.execute(&request).await?;
        let mut receipt = result.receipt;
        receipt.downgraded = downgraded;

        Ok(match result.output {
            AttemptOutput::Response(response) => Completion::Full { response, receipt },
            AttemptOutput::Stream(stream) => Completion::Streaming { stream, receipt },
        })
    }
}
