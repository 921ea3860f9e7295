use thiserror::Error;

/// Failures that stop an engine operation before it can produce a Run or Comparison.
///
/// Per-query retrieval failures and per-evaluation judge failures are not
/// represented here; they are recorded inside the produced entity instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("run could not start: {0}")]
    Run(String),

    #[error("comparison aborted: {0}")]
    Comparison(String),
}

impl EngineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn run(message: impl Into<String>) -> Self {
        Self::Run(message.into())
    }

    pub fn comparison(message: impl Into<String>) -> Self {
        Self::Comparison(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Validation(_) => "validation_error",
            Self::Run(_) => "run_error",
            Self::Comparison(_) => "comparison_error",
        }
    }
}
