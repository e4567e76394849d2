use ulid::Ulid;

use crate::model::WindowStatus;

/// Coarse error categories surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Policy,
    Authorization,
    TransientStore,
}

#[derive(Debug)]
pub enum EngineError {
    Validation(String),
    NotFound(Ulid),
    /// Window exists but is not in a state the operation accepts.
    InvalidState {
        id: Ulid,
        status: WindowStatus,
    },
    TokenNotFound,
    TokenUsed,
    TokenExpired,
    Policy(String),
    Unauthorized(String),
    Store(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::NotFound(_)
            | EngineError::InvalidState { .. }
            | EngineError::TokenNotFound
            | EngineError::TokenUsed => ErrorKind::NotFound,
            EngineError::TokenExpired | EngineError::Policy(_) => ErrorKind::Policy,
            EngineError::Unauthorized(_) => ErrorKind::Authorization,
            EngineError::Store(_) => ErrorKind::TransientStore,
        }
    }

    /// Safe to retry the whole operation.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientStore
    }

    /// Message fit for an end user; store internals are never leaked.
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::TransientStore => {
                "the booking service is temporarily unavailable, please try again".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::InvalidState { id, status } => {
                write!(f, "window {id} is {status} and cannot be changed this way")
            }
            EngineError::TokenNotFound => write!(f, "token not found"),
            EngineError::TokenUsed => write!(f, "token has already been used"),
            EngineError::TokenExpired => write!(f, "token has expired"),
            EngineError::Policy(msg) => write!(f, "not allowed: {msg}"),
            EngineError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            EngineError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_mapping() {
        assert_eq!(EngineError::TokenUsed.kind(), ErrorKind::NotFound);
        assert_eq!(EngineError::TokenExpired.kind(), ErrorKind::Policy);
        assert_eq!(
            EngineError::InvalidState {
                id: Ulid::new(),
                status: WindowStatus::Rejected
            }
            .kind(),
            ErrorKind::NotFound
        );
        assert!(EngineError::Store("disk full".into()).is_transient());
        assert!(!EngineError::Policy("x".into()).is_transient());
    }

    #[test]
    fn store_errors_are_not_leaked() {
        let msg = EngineError::Store("fsync failed on /var/lib/slotbook".into()).user_message();
        assert!(!msg.contains("fsync"));
        assert!(msg.contains("try again"));

        let msg = EngineError::Policy("cancellation closes 24 hours before start".into())
            .user_message();
        assert!(msg.contains("24 hours"));
    }
}
