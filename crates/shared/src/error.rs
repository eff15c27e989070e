use thiserror::Error;

use crate::domain::MessageId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("session expired")]
    Expired,
    #[error("not logged in")]
    MissingSession,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CsrfError {
    #[error("failed to fetch CSRF token: {0}")]
    FetchFailed(String),
    #[error("server rejected the CSRF token")]
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("server unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("request rejected ({status}): {message}")]
    ServerRejected { status: u16, message: String },
    #[error("message content must not be empty")]
    EmptyMessage,
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("message {0} is not waiting for a retry")]
    NotRetryable(MessageId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    #[error("user already exists: {0}")]
    DuplicateUser(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed token: {0}")]
    MalformedToken(String),
    #[error("unexpected response payload: {0}")]
    UnexpectedPayload(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Csrf(#[from] CsrfError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("local storage failure: {0}")]
    Storage(String),
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),
}

impl ClientError {
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Network(NetworkError::Unreachable(message.into()))
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(format!("{err:#}"))
    }

    /// Auth and CSRF failures cannot be repaired locally; the caller has to
    /// drop the session and send the user back to the login screen.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Csrf(_))
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::Auth(AuthError::Expired))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Validation(ValidationError::ServerRejected { status, .. })
            | Self::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
