//! # Attempt Pipeline Module
//!
//! Wraps a single provider attempt with the safety rails that make fallback
//! cheap to reason about: an atomic quota reservation before any bytes go
//! out, a per-attempt deadline, exactly one retry for transient server
//! trouble, and token accounting on success.
//!
//! The state machine per attempt is small:
//!
//! ```text
//! start → reserved → in_flight → done(success | failure)
//!                  ↘ in_flight → retry_backoff → in_flight → done
//! start → denied
//! ```
//!
//! Rate limits, auth failures and client errors are never retried here;
//! retrying them either wastes budget or repeats a hopeless request; the
//! failover engine moves on to the next candidate instead.
//!
//! Cancellation is dropping the returned future: nothing is recorded for an
//! abandoned attempt, because cancellation is not the provider's fault.

use crate::common::duration_serde;
use crate::error::{ErrorClass, ProviderError};
use crate::health::HealthStore;
use crate::models::{ChatRequest, ChatResponse};
use crate::providers::{ChatStream, DriverRegistry};
use crate::quota::{QuotaTracker, Reservation, TokenCommit};
use crate::routing::Candidate;
use async_stream::stream;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Deadlines and retry policy for one provider attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttemptConfig {
    /// Overall deadline for a non-streaming call.
    #[serde(with = "duration_serde")]
    pub attempt_timeout: Duration,
    /// Deadline for a streaming call to produce its first chunk.
    #[serde(with = "duration_serde")]
    pub first_byte_timeout: Duration,
    /// Pause before the single transient retry.
    #[serde(with = "duration_serde")]
    pub retry_backoff: Duration,
    /// Retries after the initial try; only server errors qualify.
    pub max_retries: u32,
}

impl Default for AttemptConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            first_byte_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(200),
            max_retries: 1,
        }
    }
}

/// Successful payload of an attempt.
pub enum AttemptOutput {
    Response(ChatResponse),
    /// Stream handle; the first chunk has already been received and is
    /// re-yielded at the front.
    Stream(ChatStream),
}

impl std::fmt::Debug for AttemptOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptOutput::Response(response) => f.debug_tuple("Response").field(response).finish(),
            AttemptOutput::Stream(_) => f.debug_tuple("Stream").field(&"<stream>").finish(),
        }
    }
}

/// Terminal result of one attempt.
#[derive(Debug)]
pub enum Outcome {
    Success(AttemptOutput),
    Failure {
        class: ErrorClass,
        retry_after: Option<Duration>,
        message: String,
    },
}

impl Outcome {
    fn from_error(error: ProviderError) -> Self {
        Outcome::Failure {
            class: error.class(),
            retry_after: error.retry_after(),
            message: error.to_string(),
        }
    }
}

/// Executes one candidate attempt under quota, deadline and retry policy.
pub struct AttemptPipeline {
    drivers: Arc<DriverRegistry>,
    quota: Arc<dyn QuotaTracker>,
    health: Arc<dyn HealthStore>,
    config: AttemptConfig,
}

impl AttemptPipeline {
    pub fn new(
        drivers: Arc<DriverRegistry>,
        quota: Arc<dyn QuotaTracker>,
        health: Arc<dyn HealthStore>,
        config: AttemptConfig,
    ) -> Self {
        Self {
            drivers,
            quota,
            health,
            config,
        }
    }

    /// Run one attempt against a candidate.
    ///
    /// The reservation is the authoritative admission check and is never
    /// refunded: a denied reservation fails as `rate_limited` without an
    /// upstream call, and a reservation spent on a failed call simply loses
    /// its slot.
    pub async fn run(
        &self,
        candidate: &Candidate,
        request: &ChatRequest,
        streaming: bool,
    ) -> Outcome {
        let provider_id = candidate.provider.id.as_str();

        if self.quota.reserve(provider_id, Utc::now()).await == Reservation::Denied {
            return Outcome::Failure {
                class: ErrorClass::RateLimited,
                retry_after: None,
                message: format!("request budget for {provider_id} is exhausted"),
            };
        }

        let Some(driver) = self.drivers.driver(provider_id) else {
            return Outcome::from_error(ProviderError::NoDriver {
                provider: provider_id.to_string(),
            });
        };

        let mut tries = 0;
        loop {
            let result = if streaming {
                self.try_stream(driver.as_ref(), candidate, request).await
            } else {
                self.try_call(driver.as_ref(), candidate, request).await
            };

            match result {
                Ok(output) => return Outcome::Success(output),
                Err(error) => {
                    tries += 1;
                    if error.class().retriable() && tries <= self.config.max_retries {
                        tracing::debug!(
                            provider = provider_id,
                            error = %error,
                            "transient failure, retrying once"
                        );
                        tokio::time::sleep(self.config.retry_backoff).await;
                        continue;
                    }
                    return Outcome::from_error(error);
                }
            }
        }
    }

    async fn try_call(
        &self,
        driver: &dyn crate::providers::ProviderDriver,
        candidate: &Candidate,
        request: &ChatRequest,
    ) -> Result<AttemptOutput, ProviderError> {
        let response = tokio::time::timeout(
            self.config.attempt_timeout,
            driver.call(request, &candidate.model),
        )
        .await
        .map_err(|_| ProviderError::Timeout)??;

        if let Some(usage) = response.usage {
            settle_tokens(
                self.quota.as_ref(),
                self.health.as_ref(),
                &candidate.provider.id,
                usage.total_tokens as u64,
            )
            .await;
        }

        Ok(AttemptOutput::Response(response))
    }

    /// Streaming success means the first chunk arrived inside the
    /// time-to-first-byte deadline. After that the stream belongs to the
    /// caller: later failures surface in-band, are never retried, and leave
    /// health untouched.
    async fn try_stream(
        &self,
        driver: &dyn crate::providers::ProviderDriver,
        candidate: &Candidate,
        request: &ChatRequest,
    ) -> Result<AttemptOutput, ProviderError> {
        let (mut inner, first) = tokio::time::timeout(self.config.first_byte_timeout, async {
            let mut inner = driver.stream(request, &candidate.model).await?;
            let first = inner.next().await;
            Ok::<_, ProviderError>((inner, first))
        })
        .await
        .map_err(|_| ProviderError::Timeout)??;

        let first = match first {
            Some(Ok(chunk)) => chunk,
            Some(Err(error)) => return Err(error),
            None => return Err(ProviderError::EmptyStream),
        };

        let quota = self.quota.clone();
        let health = self.health.clone();
        let provider_id = candidate.provider.id.clone();

        let wrapped = Box::pin(stream! {
            let mut committed = false;
            if let Some(usage) = first.usage {
                settle_tokens(quota.as_ref(), health.as_ref(), &provider_id, usage.total_tokens as u64).await;
                committed = true;
            }
            yield Ok(first);

            while let Some(item) = inner.next().await {
                match item {
                    Ok(chunk) => {
                        if let Some(usage) = chunk.usage {
                            if !committed {
                                settle_tokens(quota.as_ref(), health.as_ref(), &provider_id, usage.total_tokens as u64).await;
                                committed = true;
                            }
                        }
                        yield Ok(chunk);
                    }
                    Err(error) => {
                        tracing::warn!(
                            provider = %provider_id,
                            error = %error,
                            "stream failed after first byte; truncating"
                        );
                        yield Err(error);
                        return;
                    }
                }
            }
        });

        Ok(AttemptOutput::Stream(wrapped))
    }
}

/// Bill tokens for a successful call. Overflowing the token budget flags the
/// provider rate-limited so routing backs off for the rest of the window.
async fn settle_tokens(
    quota: &dyn QuotaTracker,
    health: &dyn HealthStore,
    provider_id: &str,
    tokens: u64,
) {
    if quota.commit_tokens(provider_id, tokens).await == TokenCommit::TpmExceeded {
        tracing::warn!(
            provider = provider_id,
            tokens,
            "token budget exceeded, cooling provider down"
        );
        health
            .record_failure(provider_id, ErrorClass::RateLimited, None)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{HealthState, MemoryHealthStore};
    use crate::models::Usage;
    use crate::quota::{MemoryQuotaTracker, ProviderLimits};
    use crate::testing::{self, Scripted, ScriptedDriver};
    use std::collections::HashMap;

    struct Fixture {
        pipeline: AttemptPipeline,
        driver: Arc<ScriptedDriver>,
        quota: Arc<MemoryQuotaTracker>,
        health: Arc<MemoryHealthStore>,
        candidate: Candidate,
    }

    fn fixture(script: Vec<Scripted>, limits: ProviderLimits, config: AttemptConfig) -> Fixture {
        let driver = Arc::new(ScriptedDriver::new("alpha", script));
        let mut registry = DriverRegistry::new();
        registry.register("alpha", driver.clone());

        let mut all_limits = HashMap::new();
        all_limits.insert("alpha".to_string(), limits);
        let quota = Arc::new(MemoryQuotaTracker::new(all_limits));
        let health = Arc::new(MemoryHealthStore::new());

        let candidate = Candidate {
            provider: Arc::new(testing::provider("alpha", true, 0, limits.rpm)),
            model: Arc::new(testing::model("alpha/m", "alpha")),
            score: 0.0,
        };

        Fixture {
            pipeline: AttemptPipeline::new(
                Arc::new(registry),
                quota.clone(),
                health.clone(),
                config,
            ),
            driver,
            quota,
            health,
            candidate,
        }
    }

    fn fast_config() -> AttemptConfig {
        AttemptConfig {
            attempt_timeout: Duration::from_millis(100),
            first_byte_timeout: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(1),
            max_retries: 1,
        }
    }

    #[tokio::test]
    async fn success_commits_usage_exactly_once() {
        let f = fixture(
            vec![Scripted::Reply(testing::response(Usage::new(10, 5)))],
            ProviderLimits::default(),
            fast_config(),
        );

        let outcome = f
            .pipeline
            .run(&f.candidate, &testing::request("fast"), false)
            .await;
        assert!(matches!(outcome, Outcome::Success(_)));

        let snap = f.quota.snapshot("alpha").await.unwrap();
        assert_eq!(snap.tokens_in_window, 15);
        assert_eq!(snap.requests_in_window, 1);
    }

    #[tokio::test]
    async fn denied_reservation_never_calls_the_driver() {
        let f = fixture(
            vec![Scripted::Reply(testing::response(Usage::new(1, 1)))],
            ProviderLimits {
                rpm: Some(0),
                tpm: None,
            },
            fast_config(),
        );

        let outcome = f
            .pipeline
            .run(&f.candidate, &testing::request("fast"), false)
            .await;
        match outcome {
            Outcome::Failure { class, .. } => assert_eq!(class, ErrorClass::RateLimited),
            Outcome::Success(_) => panic!("expected denial"),
        }
        assert_eq!(f.driver.call_count(), 0);
    }

    #[tokio::test]
    async fn transient_server_error_is_retried_once() {
        let f = fixture(
            vec![
                Scripted::Fail(ProviderError::Api {
                    code: 500,
                    message: "boom".into(),
                }),
                Scripted::Reply(testing::response(Usage::new(1, 1))),
            ],
            ProviderLimits::default(),
            fast_config(),
        );

        let outcome = f
            .pipeline
            .run(&f.candidate, &testing::request("fast"), false)
            .await;
        assert!(matches!(outcome, Outcome::Success(_)));
        assert_eq!(f.driver.call_count(), 2);
    }

    #[tokio::test]
    async fn rate_limit_and_auth_failures_are_not_retried() {
        for error in [
            ProviderError::RateLimited { retry_after: None },
            ProviderError::Auth { code: 401 },
            ProviderError::Rejected {
                code: 422,
                message: "bad".into(),
            },
        ] {
            let f = fixture(
                vec![
                    Scripted::Fail(error),
                    Scripted::Reply(testing::response(Usage::new(1, 1))),
                ],
                ProviderLimits::default(),
                fast_config(),
            );

            let outcome = f
                .pipeline
                .run(&f.candidate, &testing::request("fast"), false)
                .await;
            assert!(matches!(outcome, Outcome::Failure { .. }));
            assert_eq!(f.driver.call_count(), 1);
        }
    }

    #[tokio::test]
    async fn deadline_overrun_counts_as_server_error_and_retries() {
        let f = fixture(
            vec![
                Scripted::Stall(
                    Duration::from_millis(500),
                    testing::response(Usage::new(1, 1)),
                ),
                Scripted::Reply(testing::response(Usage::new(1, 1))),
            ],
            ProviderLimits::default(),
            fast_config(),
        );

        let outcome = f
            .pipeline
            .run(&f.candidate, &testing::request("fast"), false)
            .await;
        assert!(matches!(outcome, Outcome::Success(_)));
        assert_eq!(f.driver.call_count(), 2);
    }

    #[tokio::test]
    async fn retry_after_hint_propagates_into_the_outcome() {
        let f = fixture(
            vec![Scripted::Fail(ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
            })],
            ProviderLimits::default(),
            fast_config(),
        );

        let outcome = f
            .pipeline
            .run(&f.candidate, &testing::request("fast"), false)
            .await;
        match outcome {
            Outcome::Failure {
                class, retry_after, ..
            } => {
                assert_eq!(class, ErrorClass::RateLimited);
                assert_eq!(retry_after, Some(Duration::from_secs(30)));
            }
            Outcome::Success(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn token_overflow_flags_the_provider_rate_limited() {
        let mut limits = HashMap::new();
        limits.insert(
            "alpha".to_string(),
            ProviderLimits {
                rpm: None,
                tpm: Some(10),
            },
        );
        let driver = Arc::new(ScriptedDriver::new(
            "alpha",
            vec![Scripted::Reply(testing::response(Usage::new(20, 20)))],
        ));
        let mut registry = DriverRegistry::new();
        registry.register("alpha", driver);
        let quota = Arc::new(MemoryQuotaTracker::new(limits));
        let health = Arc::new(MemoryHealthStore::new());
        let pipeline = AttemptPipeline::new(
            Arc::new(registry),
            quota,
            health.clone(),
            fast_config(),
        );
        let candidate = Candidate {
            provider: Arc::new(testing::provider("alpha", true, 0, None)),
            model: Arc::new(testing::model("alpha/m", "alpha")),
            score: 0.0,
        };

        let outcome = pipeline
            .run(&candidate, &testing::request("fast"), false)
            .await;
        // The call itself still succeeded; only future routing cools down.
        assert!(matches!(outcome, Outcome::Success(_)));
        let entry = health.get("alpha").await;
        assert_eq!(entry.state, HealthState::Unhealthy);
        assert_eq!(entry.last_error_class, ErrorClass::RateLimited);
    }

    #[tokio::test]
    async fn streaming_commits_tokens_at_the_terminal_chunk() {
        let f = fixture(
            vec![Scripted::ReplyStream(vec![
                Ok(testing::chunk("he")),
                Ok(testing::chunk("llo")),
                Ok(testing::terminal_chunk(Usage::new(4, 2))),
            ])],
            ProviderLimits::default(),
            fast_config(),
        );

        let outcome = f
            .pipeline
            .run(&f.candidate, &testing::request("fast"), true)
            .await;
        let stream = match outcome {
            Outcome::Success(AttemptOutput::Stream(stream)) => stream,
            _ => panic!("expected stream"),
        };

        // Tokens settle only once the terminal chunk is consumed.
        assert_eq!(f.quota.snapshot("alpha").await.unwrap().tokens_in_window, 0);

        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.is_ok()));
        assert_eq!(f.quota.snapshot("alpha").await.unwrap().tokens_in_window, 6);
    }

    #[tokio::test]
    async fn pre_first_chunk_failure_is_an_attempt_failure() {
        let f = fixture(
            vec![
                Scripted::ReplyStream(vec![Err(ProviderError::Api {
                    code: 500,
                    message: "half open".into(),
                })]),
                Scripted::Fail(ProviderError::Api {
                    code: 500,
                    message: "still down".into(),
                }),
            ],
            ProviderLimits::default(),
            fast_config(),
        );

        let outcome = f
            .pipeline
            .run(&f.candidate, &testing::request("fast"), true)
            .await;
        match outcome {
            Outcome::Failure { class, .. } => assert_eq!(class, ErrorClass::ServerError),
            Outcome::Success(_) => panic!("expected failure"),
        }
        // Initial try plus the one transient retry.
        assert_eq!(f.driver.call_count(), 2);
    }

    #[tokio::test]
    async fn post_first_chunk_failure_surfaces_in_band_without_health_damage() {
        let f = fixture(
            vec![Scripted::ReplyStream(vec![
                Ok(testing::chunk("a")),
                Ok(testing::chunk("b")),
                Ok(testing::chunk("c")),
                Err(ProviderError::Api {
                    code: 500,
                    message: "connection dropped".into(),
                }),
            ])],
            ProviderLimits::default(),
            fast_config(),
        );

        let outcome = f
            .pipeline
            .run(&f.candidate, &testing::request("fast"), true)
            .await;
        let stream = match outcome {
            Outcome::Success(AttemptOutput::Stream(stream)) => stream,
            _ => panic!("expected stream"),
        };

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 4);
        assert!(items[..3].iter().all(|c| c.is_ok()));
        assert!(items[3].is_err());

        // Post-first-byte trouble is not the candidate selection's problem.
        assert_eq!(f.health.get("alpha").await.state, HealthState::Healthy);
        assert_eq!(f.driver.call_count(), 1);
    }

    #[tokio::test]
    async fn empty_stream_fails_the_attempt() {
        let f = fixture(
            vec![
                Scripted::ReplyStream(vec![]),
                Scripted::ReplyStream(vec![]),
            ],
            ProviderLimits::default(),
            fast_config(),
        );

        let outcome = f
            .pipeline
            .run(&f.candidate, &testing::request("fast"), true)
            .await;
        assert!(matches!(
            outcome,
            Outcome::Failure {
                class: ErrorClass::ServerError,
                ..
            }
        ));
    }
}
