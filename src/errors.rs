use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Forbidden")]
    Unauthorized,

    #[error("Token deployment period has ended")]
    TokenExpired {
        deadline: u64,
        expired_ago_secs: u64,
        /// Repeated hits against an expired token get the minimal body.
        minimal: bool,
    },

    #[error("Payment invalid: {reason}")]
    PaymentInvalid { reason: String },

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("Mint capacity exceeded")]
    CapacityExceeded { available: u64 },

    #[error("Capacity check failed: {0}")]
    CapacityCheckFailed(String),

    #[error("Settlement rejected: {reason}")]
    SettlementRejected { reason: String },

    #[error("Settlement timed out")]
    CoalescerTimeout,

    #[error("Chain query failed: {0}")]
    ChainRead(String),

    #[error("Facilitator error: {0}")]
    FacilitatorTransport(String),

    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("Key-value store acquire timed out")]
    PoolTimeout,

    #[error("Key-value store error: {0}")]
    Kv(#[from] redis::RedisError),

    #[error("Service shutting down")]
    ShuttingDown,

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl ResponseError for GatewayError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();
        let mut body = json!({
            "error": {
                "code": status_code.as_u16(),
                "message": self.to_string(),
                "type": self.error_type()
            }
        });

        // Per-kind extra fields the clients key off.
        match self {
            GatewayError::TokenExpired {
                deadline,
                expired_ago_secs,
                minimal,
            } => {
                if *minimal {
                    body = json!({ "error": "Token deployment period has ended" });
                } else {
                    body = json!({
                        "error": "Token deployment period has ended",
                        "deadline": deadline,
                        "expiredAgoSeconds": expired_ago_secs
                    });
                }
            }
            GatewayError::PaymentInvalid { reason } => {
                body["error"]["reason"] = json!(reason);
            }
            GatewayError::SettlementRejected { reason } => {
                body["error"]["reason"] = json!(reason);
            }
            GatewayError::RateLimited { retry_after_secs } => {
                body["error"]["retryAfterSeconds"] = json!(retry_after_secs);
            }
            GatewayError::CapacityExceeded { available } => {
                body["error"]["available"] = json!(available);
            }
            _ => {}
        }

        HttpResponse::build(status_code).json(body)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized => StatusCode::FORBIDDEN,
            GatewayError::TokenExpired { .. } => StatusCode::GONE,
            GatewayError::PaymentInvalid { .. } => StatusCode::PAYMENT_REQUIRED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CapacityCheckFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::SettlementRejected { .. } => StatusCode::BAD_REQUEST,
            GatewayError::CoalescerTimeout => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ChainRead(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::FacilitatorTransport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::PoolTimeout => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Kv(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl GatewayError {
    fn error_type(&self) -> &str {
        match self {
            GatewayError::MalformedRequest(_) => "malformed_request",
            GatewayError::Unauthorized => "unauthorized",
            GatewayError::TokenExpired { .. } => "token_expired",
            GatewayError::PaymentInvalid { .. } => "payment_invalid",
            GatewayError::RateLimited { .. } => "rate_limit",
            GatewayError::CapacityExceeded { .. } => "capacity_exceeded",
            GatewayError::CapacityCheckFailed(_) => "capacity_check_failed",
            GatewayError::SettlementRejected { .. } => "settlement_rejected",
            GatewayError::CoalescerTimeout => "settlement_timeout",
            GatewayError::ChainRead(_) => "chain_query_failed",
            GatewayError::FacilitatorTransport(_) => "facilitator_error",
            GatewayError::DependencyUnavailable(_) => "service_unavailable",
            GatewayError::PoolTimeout => "kv_pool_timeout",
            GatewayError::Kv(_) => "kv_error",
            GatewayError::ShuttingDown => "shutting_down",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Map a facilitator-reported settle failure reason onto the error kind
    /// its HTTP status requires.
    pub fn from_settle_reason(reason: &str) -> Self {
        match reason {
            "mempool_capacity_exceeded" => GatewayError::SettlementRejected {
                reason: reason.to_string(),
            },
            "chain_query_failed" => GatewayError::DependencyUnavailable(reason.to_string()),
            other => GatewayError::Internal(format!("settlement failed: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::MalformedRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(GatewayError::Unauthorized.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            GatewayError::TokenExpired {
                deadline: 0,
                expired_ago_secs: 1,
                minimal: false
            }
            .status_code(),
            StatusCode::GONE
        );
        assert_eq!(
            GatewayError::PaymentInvalid { reason: "nonce_used".into() }.status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            GatewayError::RateLimited { retry_after_secs: 60 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::CapacityExceeded { available: 2 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::CapacityCheckFailed("rpc down".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_settle_reason_mapping() {
        assert_eq!(
            GatewayError::from_settle_reason("mempool_capacity_exceeded").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::from_settle_reason("chain_query_failed").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::from_settle_reason("something_else").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_expired_bodies() {
        let full = GatewayError::TokenExpired {
            deadline: 1_700_000_000,
            expired_ago_secs: 42,
            minimal: false,
        };
        let resp = full.error_response();
        assert_eq!(resp.status(), StatusCode::GONE);

        let minimal = GatewayError::TokenExpired {
            deadline: 1_700_000_000,
            expired_ago_secs: 42,
            minimal: true,
        };
        assert_eq!(minimal.error_response().status(), StatusCode::GONE);
    }
}
