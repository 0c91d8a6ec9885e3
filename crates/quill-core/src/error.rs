use thiserror::Error;

/// Core error type for Quill operations.
#[derive(Error, Debug)]
pub enum QuillError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Bad event payload or job input. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A step's work failed.
    #[error("Step '{step}' failed: {message}")]
    Step {
        step: String,
        message: String,
        retryable: bool,
    },

    /// The job body gave up. The run fails without further attempts.
    #[error("Fatal job error: {0}")]
    Fatal(String),

    #[error("Duplicate function id: {0}")]
    DuplicateFunctionId(String),

    #[error("Event delivery failed: {0}")]
    Delivery(String),

    #[error("Unsupported content type: {0}")]
    UnsupportedType(String),

    #[error("Capability error: {0}")]
    Capability(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// A step completed during this invocation and the body reached the next one.
    #[error("Run interrupted after step '{0}'")]
    StepInterrupt(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl QuillError {
    /// Create a retryable step error.
    pub fn retryable(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable step error.
    pub fn permanent(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the enclosing run should be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Step { retryable, .. } => *retryable,
            Self::Database(_)
            | Self::Sql(_)
            | Self::Io(_)
            | Self::Delivery(_)
            | Self::Capability(_)
            | Self::Timeout(_)
            | Self::Internal(_) => true,
            _ => false,
        }
    }

    /// Wrap this error as a step failure, keeping its retry classification.
    pub fn into_step(self, step: &str) -> Self {
        match self {
            e @ (Self::Step { .. } | Self::StepInterrupt(_) | Self::Cancelled | Self::Fatal(_)) => {
                e
            }
            other => {
                let retryable = other.is_retryable();
                Self::Step {
                    step: step.to_string(),
                    message: other.to_string(),
                    retryable,
                }
            }
        }
    }
}

impl From<serde_json::Error> for QuillError {
    fn from(e: serde_json::Error) -> Self {
        QuillError::Serialization(e.to_string())
    }
}

/// Result type alias using QuillError.
pub type Result<T> = std::result::Result<T, QuillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(QuillError::retryable("fetch", "503").is_retryable());
        assert!(!QuillError::permanent("fetch", "400").is_retryable());
        assert!(QuillError::Capability("upstream reset".into()).is_retryable());
        assert!(!QuillError::Validation("missing name".into()).is_retryable());
        assert!(!QuillError::Fatal("gave up".into()).is_retryable());
        assert!(!QuillError::UnsupportedType("image/png".into()).is_retryable());
    }

    #[test]
    fn test_into_step_keeps_classification() {
        let err = QuillError::Timeout("slow".into()).into_step("generate");
        match err {
            QuillError::Step {
                step, retryable, ..
            } => {
                assert_eq!(step, "generate");
                assert!(retryable);
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = QuillError::UnsupportedType("image/png".into()).into_step("extract");
        assert!(!err.is_retryable());

        let fatal = QuillError::Fatal("no".into()).into_step("x");
        assert!(matches!(fatal, QuillError::Fatal(_)));
    }
}
