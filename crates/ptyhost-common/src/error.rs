use std::io;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("{field} must be a {expected} (not a {found})")]
    InvalidType {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Channel error: {0}")]
    Channel(#[source] io::Error),

    #[error("Terminal has been destroyed")]
    Destroyed,

    #[error("Unhandled terminal error: {0}")]
    Unhandled(Arc<PtyError>),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse grouping used to decide how an error is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected at the call site, never reaches the agent.
    Validation,
    /// Rejected at the call site because the platform lacks the capability.
    Unsupported,
    /// Native agent failure, delivered asynchronously.
    Agent,
    /// I/O channel fault, delivered asynchronously.
    Channel,
    Other,
}

impl PtyError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PtyError::InvalidType { .. } | PtyError::InvalidArgument(_) | PtyError::Config(_) => {
                ErrorClass::Validation
            }
            PtyError::Unsupported(_) => ErrorClass::Unsupported,
            PtyError::Agent(_) => ErrorClass::Agent,
            PtyError::Channel(_) | PtyError::Io(_) => ErrorClass::Channel,
            PtyError::Unhandled(inner) => inner.class(),
            PtyError::Destroyed => ErrorClass::Other,
        }
    }
}

/// Whether an I/O error on the agent channel only means the child exited.
///
/// Reading the pty master after the last slave descriptor closes fails with
/// `EIO` on Linux; Windows pipes report a broken pipe instead.
pub fn is_benign_disconnect(err: &io::Error) -> bool {
    const EIO: i32 = 5;
    if cfg!(unix) && err.raw_os_error() == Some(EIO) {
        return true;
    }
    matches!(err.kind(), io::ErrorKind::BrokenPipe)
}

pub type Result<T> = std::result::Result<T, PtyError>;
