use thiserror::Error;

#[derive(Error, Debug)]
pub enum RtmpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Connection timeout")]
    TimedOut,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Stream not found: {0}")]
    NotFound(String),

    #[error("Stream already exists: {0}")]
    AlreadyExists(String),

    #[error("Connection closed remotely")]
    ConnectionClosed,

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Short read: wanted {wanted} bytes, got {got}")]
    PartialInput { wanted: usize, got: usize },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("{0} is not set")]
    NotInitialized(&'static str),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Internal error: {0}")]
    Internal(&'static str),
}

impl RtmpError {
    pub(crate) fn is_retryable_io(err: &std::io::Error) -> bool {
        matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
        )
    }
}
