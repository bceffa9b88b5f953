use thiserror::Error;

use crate::condition::TerminalBindingCondition;

/// Errors surfaced by the session engine.
///
/// Not a "god error": each variant corresponds to one failure class with a
/// distinct recovery story.  Transport failures mark the session as
/// recoverably lost; terminal binding conditions and protocol violations
/// dispose it; usage errors surface to the caller without touching session
/// state.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BoshError {
    /// Connect/read/write failure or I/O timeout.  Recoverable via
    /// [`Session::attempt_reconnect`](crate::Session::attempt_reconnect).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The connection manager reported an unrecoverable session error.
    #[error("terminal binding condition encountered: {0}")]
    TerminalBinding(TerminalBindingCondition),

    /// The connection manager sent something the protocol does not allow,
    /// e.g. a report referencing a request we never made.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The caller misused the API (send on a closed session, reconnect with
    /// nothing to resend).
    #[error("{0}")]
    Usage(String),

    /// The session has been disposed; no further operations are permitted.
    #[error("session has been disposed")]
    Disposed,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl BoshError {
    /// Whether [`Session::attempt_reconnect`](crate::Session::attempt_reconnect)
    /// may succeed after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BoshError::Transport(_) | BoshError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, BoshError>;
