use thiserror::Error;

/// Main error type for the watcher
#[derive(Error, Debug)]
pub enum CartwatchError {
    // Configuration errors
    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("Unknown store kind '{kind}' (registered: {registered})")]
    UnknownStore { kind: String, registered: String },

    // Notification errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook rejected message: HTTP {status}: {body}")]
    Webhook { status: u16, body: String },
}

/// Result type alias for CartwatchError
pub type Result<T> = std::result::Result<T, CartwatchError>;

/// Errors raised by a page driver.
///
/// A missing selector is not an error: drivers return `None` for it.
#[derive(Error, Debug, Clone)]
pub enum PageError {
    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("Timed out after {elapsed_ms}ms during {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Invalid selector '{0}'")]
    Selector(String),

    #[error("Element '{0}' not found")]
    ElementNotFound(String),

    #[error("Nothing loaded yet")]
    NoDocument,

    #[error("Driver error: {0}")]
    Driver(String),
}

impl PageError {
    /// Whether polling again later may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, PageError::Selector(_))
    }
}

/// Errors from the human-assist exchange, shared by the owner and every joiner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArbitrationError {
    #[error("human channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("no reply within {secs}s")]
    Timeout { secs: u64 },

    #[error("challenge still unsolved after {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },

    #[error("challenge page could not be driven: {0}")]
    Page(String),

    #[error("session {0} was abandoned by its owner")]
    OwnerGone(String),

    #[error("session driver panicked: {0}")]
    Panicked(String),

    #[error("stopped waiting for the challenge")]
    Cancelled,
}

impl From<PageError> for ArbitrationError {
    fn from(err: PageError) -> Self {
        ArbitrationError::Page(err.to_string())
    }
}
