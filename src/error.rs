use thiserror::Error;

#[derive(Error, Debug)]
pub enum CiWaitError {
    #[error("API request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("git {context} failed:\n{output}")]
    Git { context: String, output: String },

    #[error("no recent builds for {branch}; are you sure this branch runs tests?")]
    NoBuilds { branch: String },

    #[error("build record is missing required timestamps:\n{0}")]
    DataInconsistency(String),

    /// Internal signal: the local branch was rebased and force-pushed, so the
    /// wait loop must restart with a fresh tip. Consumed by the outer retry
    /// wrapper and never surfaced to the user.
    #[error("remote branch changed")]
    RemoteChanged,

    #[error("cancelled")]
    Cancelled,

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CiWaitError {
    /// True for transport-level failures worth retrying: connection refused
    /// or reset, DNS resolution problems, and request timeouts. API error
    /// bodies (4xx/5xx) are fatal and never retried here.
    pub fn is_retryable(&self) -> bool {
        match self {
            CiWaitError::Network(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            _ => false,
        }
    }

    /// A deliberate cancellation; exits the wait silently, never reported as
    /// a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CiWaitError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, CiWaitError>;
