use std::fmt;

use crate::error::ModelError;

/// Failure returned by a lifecycle hook.
#[derive(Debug, Clone)]
pub enum HookError {
    Validation {
        message: String,
        hint: Option<String>,
    },
    Failed {
        message: String,
    },
    Aborted {
        reason: String,
    },
}

impl HookError {
    pub fn validation(message: &str) -> Self {
        Self::Validation {
            message: message.to_string(),
            hint: None,
        }
    }

    pub fn validation_with_hint(message: &str, hint: &str) -> Self {
        Self::Validation {
            message: message.to_string(),
            hint: Some(hint.to_string()),
        }
    }

    pub fn failed(message: &str) -> Self {
        Self::Failed {
            message: message.to_string(),
        }
    }

    pub fn aborted(reason: &str) -> Self {
        Self::Aborted {
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Validation { message, hint } => {
                write!(f, "Validation error: {}", message)?;
                if let Some(hint) = hint {
                    write!(f, " (hint: {})", hint)?;
                }
                Ok(())
            }
            HookError::Failed { message } => write!(f, "Hook failed: {}", message),
            HookError::Aborted { reason } => write!(f, "Operation aborted: {}", reason),
        }
    }
}

impl std::error::Error for HookError {}

// Hooks commonly run model operations of their own.
impl From<ModelError> for HookError {
    fn from(err: ModelError) -> Self {
        Self::failed(&err.to_string())
    }
}
