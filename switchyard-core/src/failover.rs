//! # Failover Module
//!
//! Walks the tiers in order (preferred, free, paid, emergency),
//! trying one candidate at a time until something answers. Strictly
//! sequential on purpose: the gateway fires no more upstream calls than
//! necessary, and tier k+1 is never touched before tier k is exhausted.
//!
//! Candidates are recomputed at each tier boundary, so a cooldown recorded
//! two attempts ago already shapes the next tier's list within the same
//! request.
//!
//! Every outcome is recorded: successes reset the provider's health and feed
//! the latency stats, failures apply the per-class cooldown and are collected
//! into the exhaustion report the adapter turns into an outward status.

use crate::attempt::{AttemptOutput, AttemptPipeline, Outcome};
use crate::error::{AttemptRecord, RouteError};
use crate::health::HealthStore;
use crate::models::{ChatRequest, RouteReceipt};
use crate::routing::{Router, StatsRegistry, Tier};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

/// A served request: the payload plus the receipt describing who served it.
#[derive(Debug)]
pub struct ExecutionResult {
    pub output: AttemptOutput,
    pub receipt: RouteReceipt,
}

/// Walks tiers and candidates until one attempt succeeds.
pub struct FailoverEngine {
    router: Router,
    pipeline: AttemptPipeline,
    health: Arc<dyn HealthStore>,
    stats: Arc<StatsRegistry>,
}

impl FailoverEngine {
    pub fn new(
        router: Router,
        pipeline: AttemptPipeline,
        health: Arc<dyn HealthStore>,
        stats: Arc<StatsRegistry>,
    ) -> Self {
        Self {
            router,
            pipeline,
            health,
            stats,
        }
    }

    /// Serve one request, or report exhaustion with every attempt's class.
    ///
    /// Once a streaming attempt has produced its first chunk the stream is
    /// handed up as-is; no further fallback happens for this request.
    pub async fn execute(&self, request: &ChatRequest) -> Result<ExecutionResult, RouteError> {
        let streaming = request.wants_stream();
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        for tier in Tier::WALK {
            let tiers = self.router.candidates(request, Utc::now()).await?;
            let candidates = tiers.tier(tier);
            if candidates.is_empty() {
                continue;
            }

            for candidate in candidates {
                let provider_id = candidate.provider.id.as_str();
                let model_id = candidate.model.id.as_str();
                tracing::debug!(
                    provider = provider_id,
                    model = model_id,
                    tier = tier.index(),
                    "trying candidate"
                );

                let started = Instant::now();
                match self.pipeline.run(candidate, request, streaming).await {
                    Outcome::Success(output) => {
                        self.health.record_success(provider_id).await;
                        self.stats.record(provider_id, true, started.elapsed());

                        let receipt = RouteReceipt {
                            provider: provider_id.to_string(),
                            model: model_id.to_string(),
                            tier: tier.index(),
                            attempts: attempts.len() as u32 + 1,
                            downgraded: false,
                        };
                        tracing::info!(
                            provider = provider_id,
                            model = model_id,
                            tier = tier.index(),
                            attempts = receipt.attempts,
                            "request served"
                        );
                        return Ok(ExecutionResult { output, receipt });
                    }
                    Outcome::Failure {
                        class,
                        retry_after,
                        message,
                    } => {
                        self.health
                            .record_failure(provider_id, class, retry_after)
                            .await;
                        self.stats.record(provider_id, false, started.elapsed());
                        tracing::warn!(
                            provider = provider_id,
                            model = model_id,
                            tier = tier.index(),
                            class = %class,
                            "attempt failed, falling back"
                        );
                        attempts.push(AttemptRecord {
                            provider: provider_id.to_string(),
                            model: model_id.to_string(),
                            error: class,
                            message,
                        });
                    }
                }
            }
        }

        tracing::warn!(attempts = attempts.len(), "all tiers exhausted");
        Err(RouteError::Exhausted { attempts })
    }
}
