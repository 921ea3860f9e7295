//! Judge capability: a remote LLM that renders per-query verdicts.

pub mod chat;
pub mod parse;
pub mod prompt;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// How the comparison engine reacts to a judge failure.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FailureClass {
    /// Retry with backoff (rate limits, transport faults, timeouts).
    Transient,
    /// Give up on this query only.
    Permanent,
    /// No later call can succeed either; abort the comparison.
    Fatal,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("judge request timed out after {0:?}")]
    Timeout(Duration),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("provider error ({status}): {message}")]
    Provider {
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("judge returned an empty response")]
    EmptyResponse,

    #[error("judge adapter panicked: {0}")]
    Panicked(String),

    #[error("judge configuration error: {0}")]
    Config(String),
}

impl JudgeError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::RateLimited { .. } | Self::Transport(_) | Self::Timeout(_) => {
                FailureClass::Transient
            }
            Self::Provider { retryable, .. } => {
                if *retryable {
                    FailureClass::Transient
                } else {
                    FailureClass::Permanent
                }
            }
            Self::InvalidRequest(_) | Self::EmptyResponse | Self::Panicked(_) => {
                FailureClass::Permanent
            }
            Self::Auth(_) | Self::Config(_) => FailureClass::Fatal,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Transport(_) => "transport_error",
            Self::Timeout(_) => "timeout",
            Self::Auth(_) => "auth_error",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Provider { .. } => "provider_error",
            Self::EmptyResponse => "empty_response",
            Self::Panicked(_) => "judge_panic",
            Self::Config(_) => "config_error",
        }
    }
}

#[async_trait]
pub trait Judge: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, JudgeError>;

    /// Adapters with provider-specific knowledge can refine the default mapping.
    fn classify(&self, error: &JudgeError) -> FailureClass {
        error.class()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classes_separate_retry_from_abort() {
        assert_eq!(
            JudgeError::RateLimited { retry_after: None }.class(),
            FailureClass::Transient
        );
        assert_eq!(
            JudgeError::Transport("connection reset".to_string()).class(),
            FailureClass::Transient
        );
        assert_eq!(
            JudgeError::Provider {
                status: 502,
                message: "bad gateway".to_string(),
                retryable: true
            }
            .class(),
            FailureClass::Transient
        );
        assert_eq!(
            JudgeError::InvalidRequest("context too long".to_string()).class(),
            FailureClass::Permanent
        );
        assert_eq!(
            JudgeError::Panicked("index out of bounds".to_string()).class(),
            FailureClass::Permanent
        );
        assert_eq!(
            JudgeError::Auth("invalid api key".to_string()).class(),
            FailureClass::Fatal
        );
    }
}
