use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("REQUEST_INVALID: {0}")]
    Request(String),
    #[error("POLICY_DENIED: {0}")]
    Policy(String),
    #[error("BACKEND_NOT_FOUND: {0}")]
    BackendNotFound(String),
    #[error("BACKEND_UNAVAILABLE: {0}")]
    BackendUnavailable(String),
    #[error("INVALID_EVENT_TYPE: invalid event type for content (expected {expected}, found {found})")]
    InvalidEventType {
        expected: &'static str,
        found: &'static str,
    },
    #[error("PARSE_FAILURE: {0}")]
    Parse(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// True for failures that reject a request before any subprocess starts.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Request(_) | Self::Policy(_) | Self::BackendNotFound(_) | Self::BackendUnavailable(_)
        )
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(format!("{:#}", value))
    }
}

pub type AppResult<T> = Result<T, AppError>;
