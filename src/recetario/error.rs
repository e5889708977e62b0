use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendError;

pub type Result<T> = core::result::Result<T, RecetarioError>;

#[derive(Error, Debug)]
pub enum RecetarioError {
    #[error("El mensaje está vacío")]
    EmptyContent,

    #[error("Usuario no autenticado")]
    Unauthenticated,

    #[error("{0}")]
    Backend(#[from] BackendError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Uniform result shape handed to the presentation layer.
///
/// Operations at the presentation boundary never return `Err`; failures are reported
/// here with a user-displayable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

impl<T> From<Result<T>> for OperationOutcome {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(e) => Self::failure(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthenticated_message_is_user_facing() {
        let outcome = OperationOutcome::from(Err::<(), _>(RecetarioError::Unauthenticated));
        assert_eq!(
            outcome,
            OperationOutcome {
                success: false,
                error: Some("Usuario no autenticado".to_string()),
            }
        );
    }

    #[test]
    fn backend_errors_keep_platform_message() {
        let err = RecetarioError::from(BackendError::Status {
            status: 400,
            message: "Invalid login credentials".to_string(),
        });
        assert_eq!(err.to_string(), "Invalid login credentials");
    }

    #[test]
    fn ok_outcome_omits_error_when_serialized() {
        let encoded = serde_json::to_string(&OperationOutcome::ok()).unwrap();
        assert_eq!(encoded, r#"{"success":true}"#);
    }
}
