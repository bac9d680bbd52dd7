//! Error taxonomy shared by the control plane and the protocol interceptors.
//!
//! Every fallible operation in the core eventually resolves to one of the
//! [`ErrorKind`] variants, which in turn drives how the error is surfaced:
//! an HTTP status on the control plane, or a protocol-native error frame
//! inside an already-hijacked tunnel.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthFailure,
    Forbidden,
    NotFound,
    Expired,
    BackendUnavailable,
    ProtocolError,
    ApprovalDenied,
    ConfigError,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("handle expired")]
    Expired,

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("approval denied: {0}")]
    ApprovalDenied(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::AuthFailure(_) => ErrorKind::AuthFailure,
            BrokerError::Forbidden(_) => ErrorKind::Forbidden,
            BrokerError::NotFound(_) => ErrorKind::NotFound,
            BrokerError::Expired => ErrorKind::Expired,
            BrokerError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            BrokerError::ProtocolError(_) => ErrorKind::ProtocolError,
            BrokerError::ApprovalDenied(_) => ErrorKind::ApprovalDenied,
            BrokerError::ConfigError(_) => ErrorKind::ConfigError,
            BrokerError::Io(_) => ErrorKind::BackendUnavailable,
        }
    }

    /// HTTP status code this error maps to on the control-plane surface.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::AuthFailure => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Expired => 404,
            ErrorKind::BackendUnavailable => 502,
            ErrorKind::ProtocolError => 400,
            ErrorKind::ApprovalDenied => 403,
            ErrorKind::ConfigError => 500,
        }
    }

    /// Whether this error is fatal to the session it was raised in
    /// (desync, backend gone) vs. recoverable for the next command/request
    /// on the same tunnel (denied, rejected, timed out).
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ProtocolError | ErrorKind::BackendUnavailable | ErrorKind::Expired
        )
    }
}
