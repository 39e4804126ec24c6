//! # Provider Health Module
//!
//! Shares per-provider health across concurrent requests, and optionally
//! across gateway replicas through Redis. Each provider has one
//! [`HealthEntry`]: healthy or unhealthy, the class of the last hard failure,
//! and a cooldown timestamp after which the provider becomes eligible again
//! no matter what.
//!
//! ## Cooldown policy
//!
//! Failures map to cooldowns by [`ErrorClass`]: 60 s for rate limits, 1 h for
//! rejected credentials, 30 s for server/network trouble, nothing for client
//! errors. A retry-after hint from the upstream can only lengthen the
//! cooldown, never shorten it below the table value.
//!
//! ## Concurrency and failure discipline
//!
//! Updates are serializable per provider id (the in-memory store leans on
//! DashMap's shard entry locks, the Redis store on server-side Lua) and two
//! different providers never contend on a common lock. The backing store is
//! never allowed to take a request down: reads fail open to a healthy entry
//! and writes are best-effort.

use crate::error::ErrorClass;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Health state of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

/// Per-provider health record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEntry {
    pub state: HealthState,
    pub last_error_class: ErrorClass,
    /// When this passes, the provider is eligible again regardless of state.
    pub cooldown_until: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub updated_at: DateTime<Utc>,
}

impl HealthEntry {
    /// The fail-open default: healthy, no cooldown, no history.
    pub fn healthy(now: DateTime<Utc>) -> Self {
        Self {
            state: HealthState::Healthy,
            last_error_class: ErrorClass::None,
            cooldown_until: DateTime::<Utc>::UNIX_EPOCH,
            consecutive_failures: 0,
            updated_at: now,
        }
    }

    /// Eligible means healthy, or unhealthy with an expired cooldown.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == HealthState::Healthy || self.cooldown_until <= now
    }

    fn apply_success(&mut self, now: DateTime<Utc>) {
        self.state = HealthState::Healthy;
        self.last_error_class = ErrorClass::None;
        self.cooldown_until = DateTime::<Utc>::UNIX_EPOCH;
        self.consecutive_failures = 0;
        self.updated_at = now;
    }

    fn apply_failure(
        &mut self,
        class: ErrorClass,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) {
        if !class.marks_unhealthy() {
            // Client errors are the request's fault: note them, but leave
            // state and cooldown untouched.
            self.last_error_class = class;
            self.updated_at = now;
            return;
        }

        let cooldown = retry_after
            .map(|hint| hint.max(class.cooldown()))
            .unwrap_or_else(|| class.cooldown());

        self.state = HealthState::Unhealthy;
        self.last_error_class = class;
        self.cooldown_until = now + chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::zero());
        self.consecutive_failures += 1;
        self.updated_at = now;
    }
}

/// Shared health state, keyed by provider id.
///
/// All operations are idempotent from the caller's view and must never
/// propagate a backing-store error into the request path.
#[async_trait]
pub trait HealthStore: Send + Sync {
    /// Current entry for a provider; missing entries read as healthy.
    async fn get(&self, provider_id: &str) -> HealthEntry;

    /// Record a successful call: healthy, zero failures, no cooldown.
    async fn record_success(&self, provider_id: &str);

    /// Record a classified failure, applying the cooldown table and keeping
    /// the larger of the table value and any upstream retry-after hint.
    async fn record_failure(
        &self,
        provider_id: &str,
        class: ErrorClass,
        retry_after: Option<Duration>,
    );

    /// Drop the entry entirely (operator reset).
    async fn reset(&self, provider_id: &str);

    /// All known entries, for observability.
    async fn entries(&self) -> Vec<(String, HealthEntry)>;

    /// Whether the provider may be tried at `now`.
    async fn is_eligible(&self, provider_id: &str, now: DateTime<Utc>) -> bool {
        self.get(provider_id).await.is_eligible(now)
    }
}

/// In-process store backed by a concurrent map.
#[derive(Default)]
pub struct MemoryHealthStore {
    entries: DashMap<String, HealthEntry>,
}

impl MemoryHealthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HealthStore for MemoryHealthStore {
    async fn get(&self, provider_id: &str) -> HealthEntry {
        self.entries
            .get(provider_id)
            .map(|e| e.clone())
            .unwrap_or_else(|| HealthEntry::healthy(Utc::now()))
    }

    async fn record_success(&self, provider_id: &str) {
        let now = Utc::now();
        self.entries
            .entry(provider_id.to_string())
            .or_insert_with(|| HealthEntry::healthy(now))
            .apply_success(now);
    }

    async fn record_failure(
        &self,
        provider_id: &str,
        class: ErrorClass,
        retry_after: Option<Duration>,
    ) {
        let now = Utc::now();
        let mut entry = self
            .entries
            .entry(provider_id.to_string())
            .or_insert_with(|| HealthEntry::healthy(now));
        entry.apply_failure(class, retry_after, now);
        if entry.state == HealthState::Unhealthy {
            tracing::warn!(
                provider = provider_id,
                class = %class,
                cooldown_until = %entry.cooldown_until,
                failures = entry.consecutive_failures,
                "provider marked unhealthy"
            );
        }
    }

    async fn reset(&self, provider_id: &str) {
        self.entries.remove(provider_id);
    }

    async fn entries(&self) -> Vec<(String, HealthEntry)> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

/// Redis-backed store for sharing health across replicas.
///
/// Keys are `health:{provider_id}` with a 1 h TTL; values are the JSON
/// serialization of [`HealthEntry`]. Read-modify-write updates run as
/// server-side Lua so they stay serializable per key without any client-side
/// locking.
pub struct RedisHealthStore {
    conn: ConnectionManager,
    ttl: Duration,
}

const HEALTH_TTL: Duration = Duration::from_secs(3600);

// Failure update: carries the consecutive-failure counter forward atomically.
const FAILURE_SCRIPT: &str = r#"
local failures = 0
local raw = redis.call('GET', KEYS[1])
if raw then
  local ok, entry = pcall(cjson.decode, raw)
  if ok and entry and entry.consecutive_failures then
    failures = entry.consecutive_failures
  end
end
local entry = {
  state = ARGV[1],
  last_error_class = ARGV[2],
  cooldown_until = ARGV[3],
  consecutive_failures = failures + 1,
  updated_at = ARGV[4],
}
redis.call('SET', KEYS[1], cjson.encode(entry), 'EX', tonumber(ARGV[5]))
return failures + 1
"#;

// Soft update for client errors: annotate without touching state or cooldown.
const ANNOTATE_SCRIPT: &str = r#"
local entry
local raw = redis.call('GET', KEYS[1])
if raw then
  local ok, parsed = pcall(cjson.decode, raw)
  if ok then entry = parsed end
end
if not entry then
  entry = {
    state = 'healthy',
    last_error_class = ARGV[1],
    cooldown_until = ARGV[2],
    consecutive_failures = 0,
    updated_at = ARGV[3],
  }
else
  entry.last_error_class = ARGV[1]
  entry.updated_at = ARGV[3]
end
redis.call('SET', KEYS[1], cjson.encode(entry), 'EX', tonumber(ARGV[4]))
return 0
"#;

impl RedisHealthStore {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            ttl: HEALTH_TTL,
        })
    }

    fn key(provider_id: &str) -> String {
        format!("health:{provider_id}")
    }

    fn rfc3339(ts: DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
    }
}

#[async_trait]
impl HealthStore for RedisHealthStore {
    async fn get(&self, provider_id: &str) -> HealthEntry {
        let mut conn = self.conn.clone();
        let raw: Result<Option<String>, _> = redis::cmd("GET")
            .arg(Self::key(provider_id))
            .query_async(&mut conn)
            .await;

        match raw {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!(provider = provider_id, error = %e, "corrupt health entry, failing open");
                HealthEntry::healthy(Utc::now())
            }),
            Ok(None) => HealthEntry::healthy(Utc::now()),
            Err(e) => {
                tracing::warn!(provider = provider_id, error = %e, "health read failed, failing open");
                HealthEntry::healthy(Utc::now())
            }
        }
    }

    async fn record_success(&self, provider_id: &str) {
        let entry = HealthEntry::healthy(Utc::now());
        let json = match serde_json::to_string(&entry) {
            Ok(json) => json,
            Err(_) => return,
        };
        let mut conn = self.conn.clone();
        let result: Result<(), _> = redis::cmd("SET")
            .arg(Self::key(provider_id))
            .arg(json)
            .arg("EX")
            .arg(self.ttl.as_secs())
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            tracing::warn!(provider = provider_id, error = %e, "health write failed");
        }
    }

    async fn record_failure(
        &self,
        provider_id: &str,
        class: ErrorClass,
        retry_after: Option<Duration>,
    ) {
        let now = Utc::now();
        let mut conn = self.conn.clone();

        let result: Result<i64, _> = if class.marks_unhealthy() {
            let cooldown = retry_after
                .map(|hint| hint.max(class.cooldown()))
                .unwrap_or_else(|| class.cooldown());
            let until = now + chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::zero());
            redis::Script::new(FAILURE_SCRIPT)
                .key(Self::key(provider_id))
                .arg("unhealthy")
                .arg(class.as_str())
                .arg(Self::rfc3339(until))
                .arg(Self::rfc3339(now))
                .arg(self.ttl.as_secs())
                .invoke_async(&mut conn)
                .await
        } else {
            redis::Script::new(ANNOTATE_SCRIPT)
                .key(Self::key(provider_id))
                .arg(class.as_str())
                .arg(Self::rfc3339(DateTime::<Utc>::UNIX_EPOCH))
                .arg(Self::rfc3339(now))
                .arg(self.ttl.as_secs())
                .invoke_async(&mut conn)
                .await
        };

        if let Err(e) = result {
            tracing::warn!(provider = provider_id, error = %e, "health write failed");
        }
    }

    async fn reset(&self, provider_id: &str) {
        let mut conn = self.conn.clone();
        let result: Result<(), _> = redis::cmd("DEL")
            .arg(Self::key(provider_id))
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            tracing::warn!(provider = provider_id, error = %e, "health reset failed");
        }
    }

    async fn entries(&self) -> Vec<(String, HealthEntry)> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = match redis::cmd("KEYS")
            .arg("health:*")
            .query_async(&mut conn)
            .await
        {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "health scan failed");
                return Vec::new();
            }
        };

        let mut all = Vec::with_capacity(keys.len());
        for key in keys {
            let provider = key.trim_start_matches("health:").to_string();
            all.push((provider.clone(), self.get(&provider).await));
        }
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
