use thiserror::Error;

/// Errors produced by the supervisor, the lifecycle manager and the binder.
#[derive(Debug, Error)]
pub enum KeepError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("expired: {0}")]
    Expired(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`KeepError`], for callers that branch on
/// the kind rather than the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    PermissionDenied,
    Expired,
    Conflict,
    Internal,
}

impl KeepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeepError::NotFound(_) => ErrorKind::NotFound,
            KeepError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            KeepError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            KeepError::Expired(_) => ErrorKind::Expired,
            KeepError::Conflict(_) => ErrorKind::Conflict,
            KeepError::Io(_) | KeepError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn not_found(what: &str, id: &str) -> Self {
        KeepError::NotFound(format!("{what} {id}"))
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        KeepError::InvalidArgument(msg.into())
    }
}

impl From<serde_json::Error> for KeepError {
    fn from(e: serde_json::Error) -> Self {
        KeepError::Internal(format!("json: {e}"))
    }
}

pub type KeepResult<T> = Result<T, KeepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_classify_as_internal() {
        let err: KeepError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn not_found_message_names_the_subject() {
        let err = KeepError::not_found("session", "abc");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "not found: session abc");
    }
}
