//! # HTTP Request Handlers Module
//!
//! The OpenAI-compatible surface of the gateway plus a couple of operational
//! endpoints:
//!
//! - `POST /v1/chat/completions`: chat completions, streaming and not
//! - `GET /v1/models`: every alias and canonical model the catalog accepts
//! - `GET /health`: liveness probe
//! - `GET /admin/providers`: per-provider health and quota snapshots
//!
//! ## Streaming
//!
//! Streamed responses are `text/event-stream` frames in the OpenAI shape:
//! one `data: {chunk}` frame per chunk, a mid-stream failure delivered
//! in-band as a `data: {"error": ...}` frame, then one routing-receipt frame
//! and exactly one `data: [DONE]` terminator. Routing metadata additionally
//! rides on `x-switchyard-*` response headers for both response shapes.

use crate::gateway_error::GatewayError;
use crate::server::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Response, StatusCode};
use axum::response::Json;
use futures::StreamExt;
use serde_json::{json, Value};
use switchyard_core::dispatch::Completion;
use switchyard_core::models::{ChatRequest, RouteReceipt};
use switchyard_core::providers::ChatStream;
use tokio_stream::wrappers::ReceiverStream;

/// Handle chat completion requests, streaming or not.
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response<Body>, GatewayError> {
    match state.dispatcher.run(request).await? {
        Completion::Full { response, receipt } => {
            let body = serde_json::to_string(&response)?;
            let response = receipt_headers(
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "application/json"),
                &receipt,
            )
            .body(Body::from(body))
            .expect("static response parts are valid");
            Ok(response)
        }
        Completion::Streaming { stream, receipt } => Ok(stream_response(stream, receipt)),
    }
}

/// Pump a chunk stream into an SSE body.
///
/// The pump task stops when the client goes away (the channel closes), which
/// drops the upstream stream and cancels the provider call.
fn stream_response(mut stream: ChatStream, receipt: RouteReceipt) -> Response<Body> {
    let (tx, rx) = tokio::sync::mpsc::channel::<String>(64);

    let pump_receipt = receipt.clone();
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    let frame = match serde_json::to_string(&chunk) {
                        Ok(json) => format!("data: {json}\n\n"),
                        Err(_) => continue,
                    };
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        provider = %pump_receipt.provider,
                        error = %error,
                        "stream truncated by upstream failure"
                    );
                    let frame = json!({
                        "error": {
                            "type": error.class().as_str(),
                            "provider": pump_receipt.provider,
                            "message": error.to_string(),
                        }
                    });
                    let _ = tx.send(format!("data: {frame}\n\n")).await;
                    break;
                }
            }
        }

        let meta = json!({
            "object": "chat.completion.receipt",
            "provider": pump_receipt.provider,
            "model": pump_receipt.model,
            "tier": pump_receipt.tier,
            "attempts": pump_receipt.attempts,
            "downgraded": pump_receipt.downgraded,
        });
        let _ = tx.send(format!("data: {meta}\n\n")).await;
        let _ = tx.send("data: [DONE]\n\n".to_string()).await;
    });

    let body = Body::from_stream(
        ReceiverStream::new(rx)
            .map(|event| Ok::<axum::body::Bytes, std::io::Error>(event.into())),
    );

    receipt_headers(
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .header("cache-control", "no-cache")
            .header("connection", "keep-alive"),
        &receipt,
    )
    .body(body)
    .expect("static response parts are valid")
}

fn receipt_headers(
    builder: axum::http::response::Builder,
    receipt: &RouteReceipt,
) -> axum::http::response::Builder {
    builder
        .header("x-switchyard-provider", &receipt.provider)
        .header("x-switchyard-model", &receipt.model)
        .header("x-switchyard-tier", receipt.tier.to_string())
        .header("x-switchyard-attempts", receipt.attempts.to_string())
        .header("x-switchyard-downgraded", receipt.downgraded.to_string())
}

/// List every model selector the gateway accepts.
pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let mut data = Vec::new();
    for alias in state.catalog.alias_names() {
        data.push(json!({
            "id": alias,
            "object": "model",
            "owned_by": "switchyard",
        }));
    }
    for model_id in state.catalog.model_ids() {
        let owned_by = model_id.split('/').next().unwrap_or("switchyard");
        data.push(json!({
            "id": model_id,
            "object": "model",
            "owned_by": owned_by,
        }));
    }

    Json(json!({ "object": "list", "data": data }))
}

/// Liveness probe.
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "providers": state.catalog.providers().count(),
        "models": state.catalog.model_ids().count(),
    }))
}

/// Per-provider health and quota view for operators.
pub async fn provider_status(State(state): State<AppState>) -> Json<Value> {
    let mut providers = Vec::new();
    for provider in state.catalog.providers() {
        let health = state.health.get(&provider.id).await;
        let quota = state.quota.snapshot(&provider.id).await;
        providers.push(json!({
            "id": provider.id,
            "kind": provider.kind,
            "enabled": provider.enabled,
            "free": provider.free,
            "tier": provider.tier,
            "health": health,
            "quota": quota,
        }));
    }

    Json(json!({ "providers": providers }))
}
