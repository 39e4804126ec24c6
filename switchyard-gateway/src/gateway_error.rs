//! # Gateway Error Types Module
//!
//! Maps the engine's classified errors to outward HTTP responses. The body
//! always carries a stable machine-readable code next to the human-readable
//! message, and an exhaustion response enumerates every attempt so the caller
//! can see which providers failed and how.
//!
//! Status mapping:
//!
//! | engine error | outward status |
//! |---|---|
//! | `invalid_request`, `unknown_model`, `capability_unsupported` | 400 |
//! | `exhausted`, every attempt rate-limited | 429 |
//! | `exhausted`, every attempt an auth failure | 502 |
//! | `exhausted`, every attempt a client error | 400 |
//! | `exhausted`, anything else | 503 |

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use switchyard_core::error::{AttemptRecord, ErrorClass, RouteError};
use thiserror::Error;

/// Errors a gateway handler can surface.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Engine-level routing or execution failure.
    #[error(transparent)]
    Route(#[from] RouteError),

    /// JSON serialization failure while building a response.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn exhaustion_status(attempts: &[AttemptRecord]) -> StatusCode {
    let uniform = |class: ErrorClass| !attempts.is_empty() && attempts.iter().all(|a| a.error == class);

    if uniform(ErrorClass::RateLimited) {
        StatusCode::TOO_MANY_REQUESTS
    } else if uniform(ErrorClass::AuthError) {
        StatusCode::BAD_GATEWAY
    } else if uniform(ErrorClass::ClientError) {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, code, attempts) = match &self {
            GatewayError::Route(e) => {
                let status = match e {
                    RouteError::InvalidRequest { .. }
                    | RouteError::UnknownModel { .. }
                    | RouteError::UnknownProvider { .. }
                    | RouteError::CapabilityUnsupported { .. } => StatusCode::BAD_REQUEST,
                    RouteError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
                    RouteError::Exhausted { attempts } => exhaustion_status(attempts),
                };
                let attempts = match e {
                    RouteError::Exhausted { attempts } => Some(attempts.clone()),
                    _ => None,
                };
                (status, e.code(), attempts)
            }
            GatewayError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
            }
        };

        let mut error = json!({
            "message": self.to_string(),
            "type": code,
            "code": status.as_u16(),
        });
        if let Some(attempts) = attempts {
            error["attempts"] = serde_json::to_value(attempts).unwrap_or_default();
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(class: ErrorClass) -> AttemptRecord {
        AttemptRecord {
            provider: "alpha".to_string(),
            model: "alpha/m".to_string(),
            error: class,
            message: "failed".to_string(),
        }
    }

    #[test]
    fn uniform_rate_limits_surface_as_429() {
        let attempts = vec![record(ErrorClass::RateLimited), record(ErrorClass::RateLimited)];
        assert_eq!(exhaustion_status(&attempts), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn uniform_auth_failures_surface_as_502() {
        let attempts = vec![record(ErrorClass::AuthError)];
        assert_eq!(exhaustion_status(&attempts), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn server_errors_and_mixes_surface_as_503() {
        let attempts = vec![record(ErrorClass::ServerError), record(ErrorClass::ServerError)];
        assert_eq!(exhaustion_status(&attempts), StatusCode::SERVICE_UNAVAILABLE);

        let attempts = vec![record(ErrorClass::RateLimited), record(ErrorClass::ServerError)];
        assert_eq!(exhaustion_status(&attempts), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn empty_attempt_list_is_unavailability() {
        assert_eq!(exhaustion_status(&[]), StatusCode::SERVICE_UNAVAILABLE);
    }
}
