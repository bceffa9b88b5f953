//! Terminal binding conditions (XEP-0124 §17).
//!
//! A response with `type="terminate"` and a `condition` attribute ends the
//! session unrecoverably.  Connection managers predating protocol version
//! 1.6 signal the same conditions through non-2xx HTTP status codes.

use std::fmt;

/// A connection-manager-reported unrecoverable session error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalBindingCondition {
    BadRequest,
    HostGone,
    HostUnknown,
    ImproperAddressing,
    InternalServerError,
    ItemNotFound,
    OtherRequest,
    PolicyViolation,
    RemoteConnectionFailed,
    RemoteStreamError,
    SeeOtherUri,
    SystemShutdown,
    UndefinedCondition,
    /// A condition string outside the closed XEP-0124 table.
    Unknown(String),
}

impl TerminalBindingCondition {
    /// Map a `condition` attribute value to a condition.
    pub fn from_condition(value: &str) -> Self {
        use TerminalBindingCondition::*;
        match value {
            "bad-request" => BadRequest,
            "host-gone" => HostGone,
            "host-unknown" => HostUnknown,
            "improper-addressing" => ImproperAddressing,
            "internal-server-error" => InternalServerError,
            "item-not-found" => ItemNotFound,
            "other-request" => OtherRequest,
            "policy-violation" => PolicyViolation,
            "remote-connection-failed" => RemoteConnectionFailed,
            "remote-stream-error" => RemoteStreamError,
            "see-other-uri" => SeeOtherUri,
            "system-shutdown" => SystemShutdown,
            "undefined-condition" => UndefinedCondition,
            other => Unknown(other.to_string()),
        }
    }

    /// Map a deprecated pre-1.6 HTTP status code to a condition.  Returns
    /// `None` for success codes.
    pub fn from_http_status(status: u16) -> Option<Self> {
        use TerminalBindingCondition::*;
        match status {
            200..=299 => None,
            400 => Some(BadRequest),
            403 => Some(PolicyViolation),
            404 => Some(ItemNotFound),
            _ => Some(UndefinedCondition),
        }
    }

    /// The wire-form condition string.
    pub fn as_str(&self) -> &str {
        use TerminalBindingCondition::*;
        match self {
            BadRequest => "bad-request",
            HostGone => "host-gone",
            HostUnknown => "host-unknown",
            ImproperAddressing => "improper-addressing",
            InternalServerError => "internal-server-error",
            ItemNotFound => "item-not-found",
            OtherRequest => "other-request",
            PolicyViolation => "policy-violation",
            RemoteConnectionFailed => "remote-connection-failed",
            RemoteStreamError => "remote-stream-error",
            SeeOtherUri => "see-other-uri",
            SystemShutdown => "system-shutdown",
            UndefinedCondition => "undefined-condition",
            Unknown(s) => s,
        }
    }

    /// Human-readable explanation of the condition.
    pub fn message(&self) -> &str {
        use TerminalBindingCondition::*;
        match self {
            BadRequest => "the format of the HTTP request was not understood",
            HostGone => "the target domain is no longer serviced by the connection manager",
            HostUnknown => "the target domain is unknown to the connection manager",
            ImproperAddressing => "the request did not specify a target domain",
            InternalServerError => "the connection manager suffered an internal error",
            ItemNotFound => "the session is unknown (expired or never existed)",
            OtherRequest => "another request with a competing RID invalidated this session",
            PolicyViolation => "the request violated local service policy",
            RemoteConnectionFailed => "the connection manager could not reach the server",
            RemoteStreamError => "the server signalled a stream error",
            SeeOtherUri => "the session has been relocated to another URI",
            SystemShutdown => "the connection manager is being shut down",
            UndefinedCondition => "an undefined terminal condition occurred",
            Unknown(_) => "an unrecognized terminal condition occurred",
        }
    }
}

impl fmt::Display for TerminalBindingCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.message())
    }
}
