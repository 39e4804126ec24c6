//! # Quota Tracking Module
//!
//! Enforces each provider's declared requests-per-minute budget before a call
//! is dispatched and bills token usage against the tokens-per-minute budget
//! after it succeeds. Counters live in fixed 60-second windows advanced by
//! absolute time, either in-process or in Redis when several gateway replicas
//! share one quota pool.
//!
//! Reserving a slot and checking it against the limit is one atomic step:
//! two concurrent requests can never both take the last slot. Reservations
//! are deliberately not refunded when the upstream call fails afterwards;
//! quotas stay conservative and the accounting stays simple.
//!
//! The tracker fails open: if Redis is unreachable it grants the reservation
//! and lets the upstream's own limiter have the final word.

use crate::catalog::Catalog;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Length of one accounting window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Counters for one provider's current window.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaEntry {
    pub requests_in_window: u32,
    pub tokens_in_window: u64,
    pub window_start: DateTime<Utc>,
}

impl QuotaEntry {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            requests_in_window: 0,
            tokens_in_window: 0,
            window_start: now,
        }
    }

    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_start + chrono::Duration::from_std(WINDOW).unwrap_or_else(|_| chrono::Duration::zero())
    }

    fn rotate_if_stale(&mut self, now: DateTime<Utc>) {
        if self.is_stale(now) {
            *self = Self::fresh(now);
        }
    }
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Granted,
    Denied,
}

impl Reservation {
    pub fn is_granted(self) -> bool {
        self == Reservation::Granted
    }
}

/// Outcome of billing tokens against the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCommit {
    Ok,
    /// The window's token budget is now exceeded; the caller flags the
    /// provider rate-limited so routing backs off for the rest of the window.
    TpmExceeded,
}

/// Declared per-provider budgets; `None` means unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderLimits {
    pub rpm: Option<u32>,
    pub tpm: Option<u64>,
}

/// Extract the declared budgets of every configured provider.
pub fn limits_from_catalog(catalog: &Catalog) -> HashMap<String, ProviderLimits> {
    catalog
        .providers()
        .map(|p| {
            (
                p.id.clone(),
                ProviderLimits {
                    rpm: p.rpm_limit,
                    tpm: p.tpm_limit,
                },
            )
        })
        .collect()
}

/// Shared request/token accounting, keyed by provider id.
#[async_trait]
pub trait QuotaTracker: Send + Sync {
    /// Atomically rotate the window if stale, check the request budget, and
    /// claim a slot. At most `rpm` reservations are granted per window no
    /// matter how many callers race.
    async fn reserve(&self, provider_id: &str, now: DateTime<Utc>) -> Reservation;

    /// Bill tokens against the current window. Never blocks and never denies;
    /// overflow is reported so the caller can cool the provider down.
    async fn commit_tokens(&self, provider_id: &str, tokens: u64) -> TokenCommit;

    /// Current window counters, for observability and best-effort pre-filters.
    async fn snapshot(&self, provider_id: &str) -> Option<QuotaEntry>;
}

/// In-process tracker backed by a concurrent map.
pub struct MemoryQuotaTracker {
    limits: HashMap<String, ProviderLimits>,
    windows: DashMap<String, QuotaEntry>,
}

impl MemoryQuotaTracker {
    pub fn new(limits: HashMap<String, ProviderLimits>) -> Self {
        Self {
            limits,
            windows: DashMap::new(),
        }
    }

    fn limits_for(&self, provider_id: &str) -> ProviderLimits {
        self.limits.get(provider_id).copied().unwrap_or_default()
    }
}

#[async_trait]
impl QuotaTracker for MemoryQuotaTracker {
    async fn reserve(&self, provider_id: &str, now: DateTime<Utc>) -> Reservation {
        let limits = self.limits_for(provider_id);
        // The entry guard serializes all access to this provider's window;
        // the whole rotate-check-increment runs under it.
        let mut entry = self
            .windows
            .entry(provider_id.to_string())
            .or_insert_with(|| QuotaEntry::fresh(now));
        entry.rotate_if_stale(now);

        match limits.rpm {
            Some(rpm) if entry.requests_in_window + 1 > rpm => {
                tracing::debug!(provider = provider_id, rpm, "request budget exhausted");
                Reservation::Denied
            }
            _ => {
                entry.requests_in_window += 1;
                Reservation::Granted
            }
        }
    }

    async fn commit_tokens(&self, provider_id: &str, tokens: u64) -> TokenCommit {
        let limits = self.limits_for(provider_id);
        let now = Utc::now();
        let mut entry = self
            .windows
            .entry(provider_id.to_string())
            .or_insert_with(|| QuotaEntry::fresh(now));
        entry.rotate_if_stale(now);
        entry.tokens_in_window = entry.tokens_in_window.saturating_add(tokens);

        match limits.tpm {
            Some(tpm) if entry.tokens_in_window > tpm => {
                tracing::debug!(provider = provider_id, tpm, "token budget exhausted");
                TokenCommit::TpmExceeded
            }
            _ => TokenCommit::Ok,
        }
    }

    async fn snapshot(&self, provider_id: &str) -> Option<QuotaEntry> {
        self.windows.get(provider_id).map(|e| e.clone())
    }
}

/// Redis-backed tracker for quota pools shared across replicas.
///
/// Keys are `quota:{provider_id}:{epoch_minute}` hashes with `requests` and
/// `tokens` fields and a two-minute TTL, so stale windows expire on their
/// own. Admission runs as server-side Lua: the increment-check-decrement is
/// one atomic step per key.
pub struct RedisQuotaTracker {
    limits: HashMap<String, ProviderLimits>,
    conn: ConnectionManager,
}

const QUOTA_TTL_SECS: u64 = 120;

const RESERVE_SCRIPT: &str = r#"
local r = redis.call('HINCRBY', KEYS[1], 'requests', 1)
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[2]))
if tonumber(ARGV[1]) > 0 and r > tonumber(ARGV[1]) then
  redis.call('HINCRBY', KEYS[1], 'requests', -1)
  return 0
end
return 1
"#;

const COMMIT_SCRIPT: &str = r#"
local t = redis.call('HINCRBY', KEYS[1], 'tokens', tonumber(ARGV[1]))
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[3]))
if tonumber(ARGV[2]) > 0 and t > tonumber(ARGV[2]) then
  return 0
end
return 1
"#;

impl RedisQuotaTracker {
    pub async fn connect(
        url: &str,
        limits: HashMap<String, ProviderLimits>,
    ) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { limits, conn })
    }

    fn key(provider_id: &str, now: DateTime<Utc>) -> String {
        format!("quota:{provider_id}:{}", now.timestamp() / 60)
    }

    fn limits_for(&self, provider_id: &str) -> ProviderLimits {
        self.limits.get(provider_id).copied().unwrap_or_default()
    }
}

#[async_trait]
impl QuotaTracker for RedisQuotaTracker {
    async fn reserve(&self, provider_id: &str, now: DateTime<Utc>) -> Reservation {
        let limits = self.limits_for(provider_id);
        let mut conn = self.conn.clone();
        let admitted: Result<i64, _> = redis::Script::new(RESERVE_SCRIPT)
            .key(Self::key(provider_id, now))
            .arg(limits.rpm.unwrap_or(0))
            .arg(QUOTA_TTL_SECS)
            .invoke_async(&mut conn)
            .await;

        match admitted {
            Ok(1) => Reservation::Granted,
            Ok(_) => Reservation::Denied,
            Err(e) => {
                tracing::warn!(provider = provider_id, error = %e, "quota reserve failed, failing open");
                Reservation::Granted
            }
        }
    }

    async fn commit_tokens(&self, provider_id: &str, tokens: u64) -> TokenCommit {
        let limits = self.limits_for(provider_id);
        let mut conn = self.conn.clone();
        let within: Result<i64, _> = redis::Script::new(COMMIT_SCRIPT)
            .key(Self::key(provider_id, Utc::now()))
            .arg(tokens)
            .arg(limits.tpm.unwrap_or(0))
            .arg(QUOTA_TTL_SECS)
            .invoke_async(&mut conn)
            .await;

        match within {
            Ok(1) => TokenCommit::Ok,
            Ok(_) => TokenCommit::TpmExceeded,
            Err(e) => {
                tracing::warn!(provider = provider_id, error = %e, "token commit failed, failing open");
                TokenCommit::Ok
            }
        }
    }

    async fn snapshot(&self, provider_id: &str) -> Option<QuotaEntry> {
        let now = Utc::now();
        let minute = now.timestamp() / 60;
        let mut conn = self.conn.clone();
        let fields: Result<HashMap<String, u64>, _> = redis::cmd("HGETALL")
            .arg(Self::key(provider_id, now))
            .query_async(&mut conn)
            .await;

        match fields {
            Ok(fields) if !fields.is_empty() => Some(QuotaEntry {
                requests_in_window: fields.get("requests").copied().unwrap_or(0) as u32,
                tokens_in_window: fields.get("tokens").copied().unwrap_or(0),
                window_start: Utc.timestamp_opt(minute * 60, 0).single().unwrap_or(now),
            }),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(provider = provider_id, error = %e, "quota snapshot failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tracker(rpm: Option<u32>, tpm: Option<u64>) -> MemoryQuotaTracker {
        let mut limits = HashMap::new();
        limits.insert("groq".to_string(), ProviderLimits { rpm, tpm });
        MemoryQuotaTracker::new(limits)
    }

    #[tokio::test]
    async fn grants_up_to_the_declared_limit() {
        let tracker = tracker(Some(2), None);
        let now = Utc::now();
        assert!(tracker.reserve("groq", now).await.is_granted());
        assert!(tracker.reserve("groq", now).await.is_granted());
        assert!(!tracker.reserve("groq", now).await.is_granted());
    }

    #[tokio::test]
    async fn unlimited_provider_always_admits() {
        let tracker = tracker(None, None);
        let now = Utc::now();
        for _ in 0..500 {
            assert!(tracker.reserve("groq", now).await.is_granted());
        }
    }

    #[tokio::test]
    async fn unknown_provider_is_unlimited() {
        let tracker = tracker(Some(1), None);
        let now = Utc::now();
        assert!(tracker.reserve("mystery", now).await.is_granted());
        assert!(tracker.reserve("mystery", now).await.is_granted());
    }

    #[tokio::test]
    async fn window_rotation_frees_the_budget() {
        let tracker = tracker(Some(1), None);
        let now = Utc::now();
        assert!(tracker.reserve("groq", now).await.is_granted());
        assert!(!tracker.reserve("groq", now).await.is_granted());

        let later = now + chrono::Duration::seconds(61);
        assert!(tracker.reserve("groq", later).await.is_granted());
        let snap = tracker.snapshot("groq").await.unwrap();
        assert_eq!(snap.requests_in_window, 1);
        assert_eq!(snap.window_start, later);
    }

    // Contention property: with limit L and N racing callers, exactly
    // L reservations are granted in a window.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_respect_the_limit() {
        let tracker = Arc::new(tracker(Some(5), None));
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker.reserve("groq", now).await
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().is_granted() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
    }

    #[tokio::test]
    async fn token_commit_reports_overflow() {
        let tracker = tracker(None, Some(1000));
        assert_eq!(tracker.commit_tokens("groq", 600).await, TokenCommit::Ok);
        assert_eq!(
            tracker.commit_tokens("groq", 600).await,
            TokenCommit::TpmExceeded
        );
        let snap = tracker.snapshot("groq").await.unwrap();
        assert_eq!(snap.tokens_in_window, 1200);
    }

    #[tokio::test]
    async fn denied_reservations_do_not_consume_slots() {
        let tracker = tracker(Some(1), None);
        let now = Utc::now();
        assert!(tracker.reserve("groq", now).await.is_granted());
        for _ in 0..10 {
            assert!(!tracker.reserve("groq", now).await.is_granted());
        }
        assert_eq!(
            tracker.snapshot("groq").await.unwrap().requests_in_window,
            1
        );
    }
}
