//! # Routing Module
//!
//! Turns a model selector into tiered, ordered lists of provider candidates.
//! The failover engine walks the tiers strictly in order:
//!
//! 1. **Preferred**: the request's explicit provider preference, when
//!    eligible.
//! 2. **Free**: free-tier providers, healthiest and cheapest first.
//! 3. **Paid**: everyone else.
//! 4. **Emergency**: every candidate again, health and quota pre-filters
//!    ignored, for the last-ditch pass when the polite tiers came up empty.
//!
//! Within a tier candidates sort by a weighted score of declared cost rank,
//! observed latency and observed failure rate, lower is better, with
//! canonical model id as the tie-break, so identical snapshots always produce
//! identical orderings.

use crate::catalog::{CanonicalModel, Catalog, Provider};
use crate::error::RouteError;
use crate::health::HealthStore;
use crate::models::ChatRequest;
use crate::quota::{QuotaTracker, WINDOW};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Weights for the candidate score. Configurable; the defaults prefer cheap
/// providers first and break near-ties on reliability before raw speed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterWeights {
    pub cost: f64,
    pub latency: f64,
    pub reliability: f64,
}

impl Default for RouterWeights {
    fn default() -> Self {
        Self {
            cost: 1.0,
            latency: 0.25,
            reliability: 0.5,
        }
    }
}

/// Observed performance of one provider.
///
/// Latency and failure rate are exponential moving averages so the router
/// reacts to recent behavior instead of lifetime history.
#[derive(Debug, Clone, Default)]
pub struct ProviderStats {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub ema_latency_ms: f64,
    pub ema_failure_rate: f64,
    pub last_used: Option<DateTime<Utc>>,
}

const EMA_ALPHA: f64 = 0.1;

impl ProviderStats {
    fn record(&mut self, success: bool, latency: Duration) {
        self.total_requests += 1;
        if !success {
            self.failed_requests += 1;
        }
        self.last_used = Some(Utc::now());

        let latency_ms = latency.as_millis() as f64;
        self.ema_latency_ms = EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * self.ema_latency_ms;
        let failure = if success { 0.0 } else { 1.0 };
        self.ema_failure_rate = EMA_ALPHA * failure + (1.0 - EMA_ALPHA) * self.ema_failure_rate;
    }
}

/// Concurrent registry of per-provider performance stats.
#[derive(Default)]
pub struct StatsRegistry {
    stats: DashMap<String, ProviderStats>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, provider_id: &str, success: bool, latency: Duration) {
        self.stats
            .entry(provider_id.to_string())
            .or_default()
            .record(success, latency);
    }

    pub fn get(&self, provider_id: &str) -> ProviderStats {
        self.stats
            .get(provider_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

/// Priority band a candidate is tried in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Preferred,
    Free,
    Paid,
    Emergency,
}

impl Tier {
    /// Walk order for the failover engine.
    pub const WALK: [Tier; 4] = [Tier::Preferred, Tier::Free, Tier::Paid, Tier::Emergency];

    /// Tier index surfaced in route receipts (1 = preferred).
    pub fn index(self) -> u8 {
        match self {
            Tier::Preferred => 1,
            Tier::Free => 2,
            Tier::Paid => 3,
            Tier::Emergency => 4,
        }
    }
}

/// A resolved (provider, canonical model) pair eligible for one attempt.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: Arc<Provider>,
    pub model: Arc<CanonicalModel>,
    /// Intra-tier ordering key; not comparable across tiers.
    pub score: f64,
}

/// The router's output: one ordered candidate list per tier.
#[derive(Debug, Default)]
pub struct TieredCandidates {
    preferred: Vec<Candidate>,
    free: Vec<Candidate>,
    paid: Vec<Candidate>,
    emergency: Vec<Candidate>,
}

impl TieredCandidates {
    pub fn tier(&self, tier: Tier) -> &[Candidate] {
        match tier {
            Tier::Preferred => &self.preferred,
            Tier::Free => &self.free,
            Tier::Paid => &self.paid,
            Tier::Emergency => &self.emergency,
        }
    }

}

/// Produces tiered candidate lists from the catalog and the shared health,
/// quota and performance state.
pub struct Router {
    catalog: Arc<Catalog>,
    health: Arc<dyn HealthStore>,
    quota: Arc<dyn QuotaTracker>,
    stats: Arc<StatsRegistry>,
    weights: RouterWeights,
}

impl Router {
    pub fn new(
        catalog: Arc<Catalog>,
        health: Arc<dyn HealthStore>,
        quota: Arc<dyn QuotaTracker>,
        stats: Arc<StatsRegistry>,
        weights: RouterWeights,
    ) -> Self {
        Self {
            catalog,
            health,
            quota,
            stats,
            weights,
        }
    }

    /// Resolve and partition candidates for one request.
    ///
    /// Tiers 1–3 drop candidates that are health-ineligible or whose declared
    /// request budget is already spent (a best-effort pre-filter; the
    /// authoritative admission check happens at reservation time). The
    /// emergency tier keeps everyone and orders by failure streak first.
    pub async fn candidates(
        &self,
        request: &ChatRequest,
        now: DateTime<Utc>,
    ) -> Result<TieredCandidates, RouteError> {
        let models = self.catalog.resolve(&request.model)?;
        let streaming = request.wants_stream();

        let mut scored: Vec<Candidate> = Vec::with_capacity(models.len());
        for model in models {
            if streaming && !model.capabilities.streaming {
                continue;
            }
            let provider = self.catalog.provider(&model.provider_id)?;
            let score = self.score(&provider);
            scored.push(Candidate {
                provider,
                model,
                score,
            });
        }

        // One health/quota read per distinct provider, so scoring and
        // filtering see a single consistent snapshot.
        let mut eligibility: HashMap<String, bool> = HashMap::new();
        let mut failure_streaks: HashMap<String, u32> = HashMap::new();
        for candidate in &scored {
            let id = candidate.provider.id.clone();
            if eligibility.contains_key(&id) {
                continue;
            }
            let entry = self.health.get(&id).await;
            let eligible = entry.is_eligible(now) && !self.rpm_spent(&candidate.provider, now).await;
            eligibility.insert(id.clone(), eligible);
            failure_streaks.insert(id, entry.consecutive_failures);
        }

        let preference = request.provider.as_deref();
        let mut tiers = TieredCandidates::default();

        for candidate in &scored {
            let id = candidate.provider.id.as_str();
            let eligible = eligibility.get(id).copied().unwrap_or(true);
            let is_preferred = preference == Some(id);

            if is_preferred && eligible {
                tiers.preferred.push(candidate.clone());
            } else if eligible && !is_preferred {
                if candidate.provider.free {
                    tiers.free.push(candidate.clone());
                } else {
                    tiers.paid.push(candidate.clone());
                }
            }
            tiers.emergency.push(candidate.clone());
        }

        sort_by_score(&mut tiers.preferred);
        sort_by_score(&mut tiers.free);
        sort_by_score(&mut tiers.paid);
        tiers.emergency.sort_by(|a, b| {
            let a_streak = failure_streaks.get(&a.provider.id).copied().unwrap_or(0);
            let b_streak = failure_streaks.get(&b.provider.id).copied().unwrap_or(0);
            a_streak
                .cmp(&b_streak)
                .then_with(|| a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal))
                .then_with(|| a.model.id.cmp(&b.model.id))
        });

        Ok(tiers)
    }

    /// Weighted score, lower is better: declared cost rank, recent latency,
    /// recent failure rate.
    fn score(&self, provider: &Provider) -> f64 {
        let stats = self.stats.get(&provider.id);
        self.weights.cost * provider.tier as f64
            + self.weights.latency * (stats.ema_latency_ms / 1000.0)
            + self.weights.reliability * stats.ema_failure_rate
    }

    /// Best-effort check of the declared request budget against the current
    /// window snapshot.
    async fn rpm_spent(&self, provider: &Provider, now: DateTime<Utc>) -> bool {
        let Some(rpm) = provider.rpm_limit else {
            return false;
        };
        match self.quota.snapshot(&provider.id).await {
            Some(entry) => {
                let window_fresh =
                    now < entry.window_start + chrono::Duration::from_std(WINDOW).unwrap_or_else(|_| chrono::Duration::zero());
                window_fresh && entry.requests_in_window >= rpm
            }
            None => false,
        }
    }
}

fn sort_by_score(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        a.score
            .partial_cmp(&b.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.model.id.cmp(&b.model.id))
    });
}
