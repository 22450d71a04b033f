use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrawlError>;

#[derive(Error, Debug)]
pub enum TrawlError {
    #[error("Invalid url: {0}")]
    InvalidUrl(String),

    #[error("Misconfigured component: {0}")]
    Misconfigured(String),

    #[error("Fetch timed out")]
    FetchTimeout,

    #[error("Fetch transport error: {0}")]
    FetchTransport(String),

    #[error("Decode failure: {0}")]
    Decode(String),

    #[error("Middleware fault: {0}")]
    Middleware(String),

    #[error("Pipeline fault: {0}")]
    Pipeline(String),

    #[error("Callback fault: {0}")]
    Callback(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Backend unavailable: {0}")]
    Backend(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl TrawlError {
    /// Whether this error re-schedules the request instead of dropping it.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TrawlError::FetchTimeout)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TrawlError::Cancelled)
    }
}
