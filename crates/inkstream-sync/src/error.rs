use inkstream_core::{NormalizeError, NotificationId};
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("credential rejected: {0}")]
    Auth(String),
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("{operation} failed after local update: {message}")]
    MutationConflict {
        operation: &'static str,
        message: String,
    },
    #[error("notification {0} not found")]
    NotFound(NotificationId),
    #[error("no principal signed in")]
    NoPrincipal,
    #[error("session ended before the request resolved")]
    SessionEnded,
    #[error("sync engine stopped")]
    EngineStopped,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }
}

impl From<NormalizeError> for SyncError {
    fn from(err: NormalizeError) -> Self {
        SyncError::MalformedEvent(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::Config(err.to_string())
    }
}
