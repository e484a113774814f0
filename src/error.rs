use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Error taxonomy of the warning engine.
///
/// Only `Fatal` ever escapes `ExecutionCoordinator::execute_all`; the other
/// two are recorded on the failing rule's result and audit row.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Malformed or unknown rule conditions. The rule is skipped.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A query or write against the data layer failed.
    #[error("data access error: {0}")]
    DataAccess(String),

    /// Bootstrap failure that aborts the whole run.
    #[error("engine fatal error: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Whether a rule-level retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::DataAccess(_))
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::DataAccess(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::DataAccess(format!("malformed stored payload: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_data_access_errors_are_retried() {
        assert!(EngineError::DataAccess("timeout".into()).is_retryable());
        assert!(!EngineError::Configuration("bad type".into()).is_retryable());
        assert!(!EngineError::Fatal("no catalog".into()).is_retryable());
    }
}
