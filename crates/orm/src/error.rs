//! Error types for the mapping engine
//!
//! Every surfaced failure maps onto a stable numeric [`ErrorCode`] so callers
//! can branch on the kind of failure without matching the full enum.

use std::fmt;

use thiserror::Error;

use crate::hook_error::HookError;
use crate::hooks::Hook;
use crate::instance::Instance;
use crate::validation::ValidationErrors;

/// Result type alias for model operations
pub type ModelResult<T> = Result<T, ModelError>;

/// ORM error type alias
pub type OrmError = ModelError;

/// ORM result type alias
pub type OrmResult<T> = ModelResult<T>;

/// Numeric error codes shared with drivers and callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    QueryError = 1,
    NotFound = 2,
    NotDefined = 3,
    NoSupport = 4,
    ParamMismatch = 6,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::QueryError => "QUERY_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::NotDefined => "NOT_DEFINED",
            ErrorCode::NoSupport => "NO_SUPPORT",
            ErrorCode::ParamMismatch => "PARAM_MISMATCH",
        };
        f.write_str(name)
    }
}

/// Failure reported by a storage driver.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DriverError {
    /// The driver ran the operation and it failed
    #[error("{message}")]
    Failed {
        message: String,
        code: Option<String>,
    },
    /// The driver does not implement an optional capability
    #[error("operation '{operation}' is not supported by this driver")]
    Unsupported { operation: &'static str },
}

impl DriverError {
    pub fn failed(message: impl Into<String>) -> Self {
        DriverError::Failed {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        DriverError::Failed {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    pub fn unsupported(operation: &'static str) -> Self {
        DriverError::Unsupported { operation }
    }
}

/// Error types for model and instance operations
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// The driver reported a failure
    #[error("Query error: {message}")]
    Query {
        message: String,
        original_code: Option<String>,
    },

    /// A keyed lookup matched no row
    #[error("Record not found in table '{model}'")]
    NotFound { model: String },

    /// A property, association or model name is unknown
    #[error("'{name}' is not defined on model '{model}'")]
    NotDefined { model: String, name: String },

    /// The driver lacks an optional capability
    #[error("Driver does not support Model.{operation}() (model '{model}')")]
    NoSupport { model: String, operation: String },

    /// Wrong number of key values
    #[error("Model '{model}' requires {expected} keys, {given} were provided")]
    ParamMismatch {
        model: String,
        expected: usize,
        given: usize,
    },

    /// One or more validators rejected the instance
    #[error("Validation error: {0}")]
    Validation(ValidationErrors),

    /// A lifecycle hook rejected the operation
    #[error("Hook {hook} failed: {source}")]
    Hook {
        hook: Hook,
        #[source]
        source: HookError,
    },

    /// Bulk create stopped at `index`; earlier rows stay committed
    #[error("Create failed at index {index}: {source}")]
    Create {
        index: usize,
        instance: Option<Instance>,
        #[source]
        source: Box<ModelError>,
    },

    /// Schema definition or property normalization failed
    #[error("Schema error: {0}")]
    Schema(String),

    /// Settings could not be loaded
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The owning connection has been closed
    #[error("Connection has been closed")]
    Disconnected,
}

impl ModelError {
    /// Map a driver failure for `model` onto the public error kinds.
    pub fn from_driver(err: DriverError, model: &str) -> Self {
        match err {
            DriverError::Failed { message, code } => ModelError::Query {
                message,
                original_code: code,
            },
            DriverError::Unsupported { operation } => ModelError::NoSupport {
                model: model.to_string(),
                operation: operation.to_string(),
            },
        }
    }

    pub fn not_found(model: &str) -> Self {
        ModelError::NotFound {
            model: model.to_string(),
        }
    }

    pub fn not_defined(model: &str, name: &str) -> Self {
        ModelError::NotDefined {
            model: model.to_string(),
            name: name.to_string(),
        }
    }

    /// Stable numeric code, when the kind has one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ModelError::Query { .. } => Some(ErrorCode::QueryError),
            ModelError::NotFound { .. } => Some(ErrorCode::NotFound),
            ModelError::NotDefined { .. } => Some(ErrorCode::NotDefined),
            ModelError::NoSupport { .. } => Some(ErrorCode::NoSupport),
            ModelError::ParamMismatch { .. } => Some(ErrorCode::ParamMismatch),
            ModelError::Create { source, .. } => source.code(),
            _ => None,
        }
    }

    /// Index of the failing row for bulk-create errors.
    pub fn index(&self) -> Option<usize> {
        match self {
            ModelError::Create { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ModelError::NotFound { .. })
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::Configuration(err.to_string())
    }
}
