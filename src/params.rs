//! Connection-manager session parameters.
//!
//! The response to the session-creation request carries the attributes that
//! govern the rest of the session: the session id, the long-poll window,
//! the number of requests the CM will hold open, and the optional pause and
//! polling parameters.  Once materialized the parameters never change for
//! the lifetime of the session.

use std::time::Duration;

use crate::body::{Body, attr};
use crate::error::{BoshError, Result};

/// Parsed attributes of the session-creation response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmSessionParams {
    sid: String,
    wait: Duration,
    hold: u32,
    requests: Option<u32>,
    polling: Option<Duration>,
    maxpause: Option<Duration>,
    ver: Option<String>,
    ack_support: bool,
}

impl CmSessionParams {
    /// Materialize session parameters from the session-creation exchange.
    ///
    /// `sid`, `wait` and `hold` are required; a response missing any of them
    /// is a protocol violation and disposes the session.
    pub fn from_session_init(_req: &Body, resp: &Body) -> Result<Self> {
        let sid = required(resp, attr::SID)?.to_string();
        let wait = Duration::from_secs(parse_u64(required(resp, attr::WAIT)?, attr::WAIT)?);
        let hold = parse_u32(required(resp, attr::HOLD)?, attr::HOLD)?;

        let requests = optional_u32(resp, attr::REQUESTS)?;
        let polling = optional_secs(resp, attr::POLLING)?;
        let maxpause = optional_secs(resp, attr::MAXPAUSE)?;
        let ver = resp.attribute(attr::VER).map(str::to_string);
        let ack_support = resp.attribute(attr::ACK).is_some();

        Ok(CmSessionParams {
            sid,
            wait,
            hold,
            requests,
            polling,
            maxpause,
            ver,
            ack_support,
        })
    }

    /// The opaque session identifier.
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Longest time the CM may hold a request before responding.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Maximum number of requests the CM will keep open simultaneously.
    pub fn hold(&self) -> u32 {
        self.hold
    }

    /// Maximum concurrent requests the client may have in flight, when the
    /// CM advertises a limit.
    pub fn requests(&self) -> Option<u32> {
        self.requests
    }

    /// Minimum interval between empty polls for polling sessions.
    pub fn polling(&self) -> Option<Duration> {
        self.polling
    }

    /// Maximum pause the CM accepts; `None` means pausing is unsupported.
    pub fn maxpause(&self) -> Option<Duration> {
        self.maxpause
    }

    /// Protocol version advertised by the CM.  Absent for pre-1.6 managers,
    /// which signal terminal conditions through HTTP status codes instead.
    pub fn ver(&self) -> Option<&str> {
        self.ver.as_deref()
    }

    /// Whether the CM participates in the `ack` acknowledgment scheme.
    pub fn ack_support(&self) -> bool {
        self.ack_support
    }

    /// True when the session must poll rather than long-poll.
    pub fn is_polling_session(&self) -> bool {
        self.wait.is_zero() || self.hold == 0
    }
}

fn required<'a>(resp: &'a Body, name: &str) -> Result<&'a str> {
    resp.attribute(name).ok_or_else(|| {
        BoshError::Protocol(format!(
            "session creation response did not include required '{name}' attribute"
        ))
    })
}

fn parse_u64(value: &str, name: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| BoshError::Protocol(format!("could not parse '{name}' attribute: {value:?}")))
}

fn parse_u32(value: &str, name: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| BoshError::Protocol(format!("could not parse '{name}' attribute: {value:?}")))
}

fn optional_u32(resp: &Body, name: &str) -> Result<Option<u32>> {
    resp.attribute(name).map(|v| parse_u32(v, name)).transpose()
}

fn optional_secs(resp: &Body, name: &str) -> Result<Option<Duration>> {
    Ok(resp
        .attribute(name)
        .map(|v| parse_u64(v, name))
        .transpose()?
        .map(Duration::from_secs))
}
