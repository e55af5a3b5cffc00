use thiserror::Error;

use crate::backend::spec::BackendError;
use crate::context::ErrorType;

/// Why an operator's inputs or attributes were rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Builds a [`ValidationError`] from a format string and returns it.
macro_rules! invalid {
    ($($arg:tt)*) => {
        return Err($crate::error::ValidationError::new(format!($($arg)*)))
    };
}
pub(crate) use invalid;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("graph builder is an error object: {0}")]
    BuilderError(String),
    #[error("named operands are empty")]
    EmptyGraph,
    #[error("output `{name}` is not an operand of this graph builder")]
    UnknownOperand { name: String },
    #[error("graph output depends on an error operand: {0}")]
    ErrorObject(String),
    #[error("operator graph contains a cycle")]
    CyclicGraph,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl BuildError {
    /// Error category reported to the owning context's error scopes.
    pub fn error_type(&self) -> ErrorType {
        match self {
            BuildError::Backend(BackendError::Unavailable { .. }) => ErrorType::ContextLost,
            BuildError::Backend(BackendError::Execution { .. }) => ErrorType::Unknown,
            _ => ErrorType::Validation,
        }
    }
}

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("missing input `{0}`")]
    MissingInput(String),
    #[error("input `{name}` expects {expected} but got {found}")]
    InputMismatch {
        name: String,
        expected: String,
        found: String,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ComputeError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            ComputeError::Backend(_) => ErrorType::Unknown,
            _ => ErrorType::Validation,
        }
    }
}
