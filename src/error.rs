use thiserror::Error;

use crate::models::ActionStatus;

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("storage error: {0}")]
  Storage(String),

  #[error("ads platform error: {0}")]
  Platform(#[from] PlatformError),

  #[error("invalid request: {0}")]
  InvalidRequest(String),

  #[error("invalid config: {0}")]
  InvalidConfig(String),

  #[error("action {id} cannot move from {from} to {to}")]
  InvalidTransition {
    id: i64,
    from: ActionStatus,
    to: ActionStatus,
  },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for EngineError {
  fn from(e: sqlx::Error) -> Self {
    EngineError::Storage(e.to_string())
  }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Failure reported by the ads platform for a single query or mutate call.
#[derive(Debug, Clone)]
pub struct PlatformError {
  pub status: Option<u16>,
  pub message: String,
}

impl PlatformError {
  pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
    Self {
      status,
      message: message.into(),
    }
  }
}

impl std::fmt::Display for PlatformError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if let Some(status) = self.status {
      write!(f, "Google Ads error (status {status}): {}", self.message)
    } else {
      write!(f, "Google Ads error: {}", self.message)
    }
  }
}

impl std::error::Error for PlatformError {}

impl EngineError {
  /// HTTP status an api handler should answer with.
  pub fn http_status(&self) -> u16 {
    match self {
      EngineError::InvalidRequest(_) | EngineError::InvalidConfig(_) => 400,
      EngineError::InvalidTransition { .. } => 409,
      EngineError::Platform(_) => 502,
      EngineError::Storage(_) | EngineError::Serialization(_) => 500,
    }
  }

  pub fn code(&self) -> &'static str {
    match self {
      EngineError::InvalidRequest(_) | EngineError::InvalidConfig(_) => "bad_request",
      EngineError::InvalidTransition { .. } => "conflict",
      EngineError::Platform(_) => "platform_error",
      EngineError::Storage(_) | EngineError::Serialization(_) => "internal_error",
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn platform_error_display_includes_status() {
    let err = PlatformError::new(Some(400), "bid too low");
    assert_eq!(err.to_string(), "Google Ads error (status 400): bid too low");
    assert_eq!(PlatformError::new(None, "timeout").to_string(), "Google Ads error: timeout");
  }

  #[test]
  fn maps_errors_to_http_status() {
    assert_eq!(EngineError::InvalidRequest("x".into()).http_status(), 400);
    assert_eq!(EngineError::from(PlatformError::new(Some(401), "auth")).http_status(), 502);
    let transition = EngineError::InvalidTransition {
      id: 1,
      from: ActionStatus::Failed,
      to: ActionStatus::RolledBack,
    };
    assert_eq!(transition.http_status(), 409);
    assert_eq!(transition.code(), "conflict");
  }
}
