//! # Error Handling Module
//!
//! Every upstream failure in the gateway is carried as a classified value
//! rather than an exception: drivers return [`ProviderError`], the attempt
//! pipeline reduces each error to an [`ErrorClass`] that drives health
//! cooldowns and retry decisions, and the engine's public surface reports
//! [`RouteError`] with a stable machine-readable code.
//!
//! ## Error Classes
//!
//! The class set is closed and carried end-to-end:
//!
//! | class | typical origin | cooldown |
//! |---|---|---|
//! | `rate_limited` | HTTP 429, token budget overflow | 60 s |
//! | `auth_error` | HTTP 401/403 | 1 h |
//! | `server_error` | HTTP 5xx, network, timeout | 30 s |
//! | `client_error` | HTTP 400/404/422 | none (not the provider's fault) |
//!
//! A `client_error` never changes a provider's health state: the request was
//! bad, not the provider.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classified upstream failure categories.
///
/// The class determines both the health cooldown applied to the provider and
/// whether the attempt pipeline retries the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// No failure recorded.
    None,
    /// HTTP 429 or a token-per-minute budget overflow.
    RateLimited,
    /// HTTP 401/403, credentials rejected.
    AuthError,
    /// HTTP 5xx, network failure, or timeout.
    ServerError,
    /// HTTP 4xx other than 401/403/429; the request was at fault.
    ClientError,
}

impl ErrorClass {
    /// Cooldown applied to the provider when a failure of this class is
    /// recorded. Ceilings are chosen to stay friendly to free tiers.
    pub fn cooldown(self) -> Duration {
        match self {
            ErrorClass::RateLimited => Duration::from_secs(60),
            ErrorClass::AuthError => Duration::from_secs(3600),
            ErrorClass::ServerError => Duration::from_secs(30),
            ErrorClass::ClientError | ErrorClass::None => Duration::ZERO,
        }
    }

    /// Whether a failure of this class flips the provider to unhealthy.
    pub fn marks_unhealthy(self) -> bool {
        matches!(
            self,
            ErrorClass::RateLimited | ErrorClass::AuthError | ErrorClass::ServerError
        )
    }

    /// Whether the attempt pipeline may retry a failure of this class.
    /// Only transient server-side failures qualify.
    pub fn retriable(self) -> bool {
        matches!(self, ErrorClass::ServerError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::None => "none",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::AuthError => "auth_error",
            ErrorClass::ServerError => "server_error",
            ErrorClass::ClientError => "client_error",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single provider call.
///
/// Produced by driver implementations; every variant classifies into an
/// [`ErrorClass`]. Anything a driver cannot classify is treated as a
/// `server_error`.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP transport failure (connect, TLS, body read).
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream returned a non-success status that no dedicated variant
    /// covers.
    #[error("upstream returned {code}: {message}")]
    Api { code: u16, message: String },

    /// Upstream rate limit, optionally with a retry-after hint.
    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    /// Credentials rejected (HTTP 401/403).
    #[error("upstream rejected credentials (http {code})")]
    Auth { code: u16 },

    /// Upstream rejected the request itself (HTTP 400/404/422).
    #[error("upstream rejected the request (http {code}): {message}")]
    Rejected { code: u16, message: String },

    /// The attempt exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// Response body could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Upstream replied with a body we could not make sense of.
    #[error("malformed upstream response: {message}")]
    InvalidResponse { message: String },

    /// Driver misconfiguration detected at call time.
    #[error("driver configuration error: {message}")]
    Configuration { message: String },

    /// The provider has no registered driver.
    #[error("no driver registered for provider {provider}")]
    NoDriver { provider: String },

    /// A streaming call ended before producing a single chunk.
    #[error("stream ended before the first chunk")]
    EmptyStream,
}

impl ProviderError {
    /// Reduce this error to its health/retry class.
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::RateLimited { .. } => ErrorClass::RateLimited,
            ProviderError::Auth { .. } => ErrorClass::AuthError,
            ProviderError::Rejected { .. } => ErrorClass::ClientError,
            ProviderError::Api { code, .. } => match code {
                401 | 403 => ErrorClass::AuthError,
                429 => ErrorClass::RateLimited,
                400..=499 => ErrorClass::ClientError,
                _ => ErrorClass::ServerError,
            },
            // Transport, timeout, decode and configuration failures all count
            // against the provider.
            ProviderError::Http(_)
            | ProviderError::Timeout
            | ProviderError::Serialization(_)
            | ProviderError::InvalidResponse { .. }
            | ProviderError::Configuration { .. }
            | ProviderError::NoDriver { .. }
            | ProviderError::EmptyStream => ErrorClass::ServerError,
        }
    }

    /// Retry-after hint, when the upstream supplied one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// One failed provider attempt, kept for the exhaustion report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Provider that was tried.
    pub provider: String,
    /// Canonical model id that was tried.
    pub model: String,
    /// Classified failure.
    pub error: ErrorClass,
    /// Human-readable detail.
    pub message: String,
}

/// Errors surfaced by the engine's public entry point.
///
/// The engine never panics on upstream trouble: a request either succeeds or
/// comes back as one of these, each with a stable `code()` the HTTP adapter
/// maps to an outward status.
#[derive(Error, Debug)]
pub enum RouteError {
    #[error("unknown model: {model}")]
    UnknownModel { model: String },

    #[error("unknown provider: {provider}")]
    UnknownProvider { provider: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("no candidate model supports {capability}")]
    CapabilityUnsupported { capability: String },

    /// Every tier was walked and no candidate produced a response.
    #[error("all providers exhausted after {} attempt(s)", attempts.len())]
    Exhausted { attempts: Vec<AttemptRecord> },

    /// The caller abandoned the request.
    #[error("request cancelled by the caller")]
    Cancelled,
}

impl RouteError {
    /// Stable machine-readable error code carried on outward responses.
    pub fn code(&self) -> &'static str {
        match self {
            RouteError::UnknownModel { .. } => "unknown_model",
            RouteError::UnknownProvider { .. } => "unknown_provider",
            RouteError::InvalidRequest { .. } => "invalid_request",
            RouteError::CapabilityUnsupported { .. } => "capability_unsupported",
            RouteError::Exhausted { .. } => "exhausted",
            RouteError::Cancelled => "cancelled",
        }
    }
}
