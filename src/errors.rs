use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AppError {
    #[error("PLANNING_REJECTED: {0}")]
    Planning(String),
    #[error("PERSISTENCE_FAILURE: {0}")]
    Persistence(String),
    #[error("RECONCILIATION_ANOMALY: {0}")]
    Reconciliation(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// Only persistence failures are surfaced to the user; everything else self-heals.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        Self::Internal(format!("{what} mutex poisoned"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Persistence(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn only_persistence_failures_reach_the_user() {
        assert!(AppError::Persistence("timeout".to_string()).is_user_visible());
        assert!(!AppError::Planning("missing".to_string()).is_user_visible());
        assert!(!AppError::Reconciliation("unknown id".to_string()).is_user_visible());
    }

    #[test]
    fn messages_carry_error_code() {
        let err = AppError::Planning("activity a-1 not in store".to_string());
        assert_eq!(err.to_string(), "PLANNING_REJECTED: activity a-1 not in store");
    }
}
