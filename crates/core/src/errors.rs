use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flows::{FlashSaleError, LoginTransitionError};

/// Stable machine-readable codes surfaced in traces and error bodies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RateLimitExceeded,
    ValidationError,
    UnsupportedRoleTransition,
    ToolExecutionError,
    ToolTimeout,
    DependencyUnavailable,
    UpstreamUnavailable,
    AlreadyResolved,
    ProposalExpired,
    ProposalNotFound,
    TurnTimeout,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::ValidationError => "validation_error",
            Self::UnsupportedRoleTransition => "unsupported_role_transition",
            Self::ToolExecutionError => "tool_execution_error",
            Self::ToolTimeout => "tool_timeout",
            Self::DependencyUnavailable => "dependency_unavailable",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::AlreadyResolved => "already_resolved",
            Self::ProposalExpired => "proposal_expired",
            Self::ProposalNotFound => "proposal_not_found",
            Self::TurnTimeout => "turn_timeout",
            Self::InternalError => "internal_error",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("session id must not be empty")]
    EmptySessionId,
    #[error("session id exceeds {max} characters")]
    SessionIdTooLong { max: usize },
    #[error("session id contains unsupported character `{0}`")]
    SessionIdCharacter(char),
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("message exceeds {max} characters")]
    MessageTooLong { max: usize },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    LoginTransition(#[from] LoginTransitionError),
    #[error(transparent)]
    FlashSale(#[from] FlashSaleError),
}

impl DomainError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::LoginTransition(LoginTransitionError::UnsupportedRoleTransition { .. }) => {
                ErrorCode::UnsupportedRoleTransition
            }
            Self::LoginTransition(_) => ErrorCode::ValidationError,
            Self::FlashSale(error) => error.code(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("rate limit exceeded; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("turn exceeded its deadline of {deadline:?}")]
    DeadlineExceeded { deadline: Duration },
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl From<ValidationError> for ApplicationError {
    fn from(value: ValidationError) -> Self {
        Self::Domain(DomainError::Validation(value))
    }
}

impl ApplicationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Domain(error) => error.code(),
            Self::RateLimited { .. } => ErrorCode::RateLimitExceeded,
            Self::UpstreamUnavailable(_) => ErrorCode::UpstreamUnavailable,
            Self::DeadlineExceeded { .. } => ErrorCode::TurnTimeout,
            Self::Configuration(_) => ErrorCode::InternalError,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("too many requests: retry after {retry_after_secs}s")]
    TooManyRequests { retry_after_secs: u64, correlation_id: String },
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("gateway timeout: {message}")]
    GatewayTimeout { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::TooManyRequests { .. } => {
                "You're sending messages a little too quickly. Please wait a moment and try again."
            }
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "I'm having trouble understanding messages right now. Please try again shortly."
            }
            Self::GatewayTimeout { .. } => {
                "That took longer than expected. Please try again."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::TooManyRequests { correlation_id, .. }
            | Self::BadRequest { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::GatewayTimeout { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        match self {
            Self::RateLimited { retry_after } => InterfaceError::TooManyRequests {
                retry_after_secs: retry_after_secs(retry_after),
                correlation_id,
            },
            Self::Domain(error) => {
                InterfaceError::BadRequest { message: error.to_string(), correlation_id }
            }
            Self::UpstreamUnavailable(message) => {
                InterfaceError::ServiceUnavailable { message, correlation_id }
            }
            Self::DeadlineExceeded { deadline } => InterfaceError::GatewayTimeout {
                message: format!("turn exceeded {}ms", deadline.as_millis()),
                correlation_id,
            },
            Self::Configuration(message) => InterfaceError::Internal { message, correlation_id },
        }
    }
}

/// Whole seconds a client should wait; partial seconds round up so a retry
/// never lands inside the window that denied it.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::errors::{ApplicationError, ErrorCode, InterfaceError, ValidationError};
    use crate::flows::FlashSaleError;
    use crate::domain::flash_sale::{ProposalId, ProposalStatus};

    #[test]
    fn validation_error_maps_to_bad_request_interface_error() {
        let interface =
            ApplicationError::from(ValidationError::EmptySessionId).into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn rate_limit_rounds_retry_hint_up() {
        let interface = ApplicationError::RateLimited { retry_after: Duration::from_millis(59_001) }
            .into_interface("req-2");

        assert_eq!(
            interface,
            InterfaceError::TooManyRequests {
                retry_after_secs: 60,
                correlation_id: "req-2".to_string()
            }
        );
    }

    #[test]
    fn upstream_outage_maps_to_service_unavailable() {
        let error = ApplicationError::UpstreamUnavailable("classifier timeout".to_owned());
        assert_eq!(error.code(), ErrorCode::UpstreamUnavailable);

        let interface = error.into_interface("req-3");
        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert!(interface.user_message().contains("try again"));
    }

    #[test]
    fn deadline_maps_to_gateway_timeout() {
        let error = ApplicationError::DeadlineExceeded { deadline: Duration::from_secs(30) };
        assert_eq!(error.code().as_str(), "turn_timeout");
        assert!(matches!(error.into_interface("req-4"), InterfaceError::GatewayTimeout { .. }));
    }

    #[test]
    fn flash_sale_errors_carry_distinct_codes() {
        let resolved = ApplicationError::Domain(
            FlashSaleError::AlreadyResolved {
                id: ProposalId("fs-1".to_string()),
                status: ProposalStatus::Accepted,
            }
            .into(),
        );
        assert_eq!(resolved.code(), ErrorCode::AlreadyResolved);
    }
}
