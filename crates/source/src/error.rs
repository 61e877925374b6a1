use thiserror::Error;

/// Errors that can occur while consuming an event stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The handshake returned something other than 200
    #[error("Unexpected status code: {0}")]
    UnexpectedStatus(u16),

    /// The handshake returned a body that is not an event stream
    #[error("Unexpected content type: {0}")]
    UnexpectedContentType(String),

    /// The handshake response carries no body
    #[error("No response body")]
    MissingBody,

    /// Network or body read failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server ended the stream
    #[error("Event stream ended")]
    StreamEnded,

    /// The request was aborted through the source's signal
    #[error("Connection aborted")]
    Aborted,

    /// No protocol traffic arrived within the keep-alive window
    #[error("Keep-alive timeout")]
    KeepAliveTimeout,

    /// `next()` was called while another `next()` was still pending
    #[error("Already waiting for next event")]
    AlreadyWaiting,

    /// The request target could not be turned into a request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl SourceError {
    /// True for failures that indicate a server or routing problem rather
    /// than a transient network blip
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            SourceError::UnexpectedStatus(_)
                | SourceError::UnexpectedContentType(_)
                | SourceError::MissingBody
        )
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(error: reqwest::Error) -> Self {
        SourceError::Transport(error.to_string())
    }
}

/// Result type alias for source operations
pub type Result<T> = std::result::Result<T, SourceError>;
