//! BOSH `<body/>` message values.
//!
//! A [`Body`] is an immutable map of BOSH attribute name to value plus an
//! opaque payload XML fragment.  Sessions never mutate a body in place;
//! derivation goes through [`BodyBuilder`], which is how the coordinator
//! decorates application messages with `rid`, `sid`, `ack` and friends.

use std::collections::BTreeMap;

/// Well-known BOSH attribute names (XEP-0124 §table 1).
pub mod attr {
    pub const ACK: &str = "ack";
    pub const CONDITION: &str = "condition";
    pub const FROM: &str = "from";
    pub const HOLD: &str = "hold";
    pub const MAXPAUSE: &str = "maxpause";
    pub const PAUSE: &str = "pause";
    pub const POLLING: &str = "polling";
    pub const REPORT: &str = "report";
    pub const REQUESTS: &str = "requests";
    pub const RID: &str = "rid";
    pub const ROUTE: &str = "route";
    pub const SID: &str = "sid";
    pub const TIME: &str = "time";
    pub const TO: &str = "to";
    pub const TYPE: &str = "type";
    pub const VER: &str = "ver";
    pub const WAIT: &str = "wait";
    pub const XML_LANG: &str = "xml:lang";
}

/// `type` attribute value signalling session termination.
pub(crate) const TYPE_TERMINATE: &str = "terminate";

/// `type` attribute value signalling a recoverable binding condition.
pub(crate) const TYPE_ERROR: &str = "error";

/// An immutable BOSH message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Body {
    attrs: BTreeMap<String, String>,
    payload: String,
}

impl Body {
    /// A body with no attributes and no payload.
    pub fn empty() -> Self {
        Body::default()
    }

    pub fn builder() -> BodyBuilder {
        BodyBuilder::default()
    }

    /// Derive a builder pre-populated with this body's attributes and
    /// payload.
    pub fn rebuild(&self) -> BodyBuilder {
        BodyBuilder {
            attrs: self.attrs.clone(),
            payload: self.payload.clone(),
        }
    }

    /// Look up an attribute value by name.  Names are case-sensitive.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attrs
    }

    /// The opaque inner XML fragment.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// The `rid` attribute parsed as an integer, if present and well formed.
    pub fn rid(&self) -> Option<i64> {
        self.attrs.get(attr::RID).and_then(|v| v.parse().ok())
    }

    /// True when this body carries no payload and no attributes beyond the
    /// session bookkeeping set (`rid`, `sid`, `ack`).  Such bodies exist only
    /// to satisfy the keep-alive requirements of the protocol.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
            && self
                .attrs
                .keys()
                .all(|k| matches!(k.as_str(), attr::RID | attr::SID | attr::ACK))
    }

    pub(crate) fn is_pause_request(&self) -> bool {
        self.attrs.contains_key(attr::PAUSE)
    }

    pub(crate) fn is_terminate(&self) -> bool {
        self.attribute(attr::TYPE) == Some(TYPE_TERMINATE)
    }

    pub(crate) fn is_recoverable_error(&self) -> bool {
        self.attribute(attr::TYPE) == Some(TYPE_ERROR)
    }
}

/// Builder producing a new [`Body`].
#[derive(Debug, Clone, Default)]
pub struct BodyBuilder {
    attrs: BTreeMap<String, String>,
    payload: String,
}

impl BodyBuilder {
    /// Set an attribute, replacing any previous value.
    pub fn attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attrs.insert(name.to_string(), value.into());
        self
    }

    /// Remove an attribute if present.  Used when rebuilding a request that
    /// must not carry stale session state (e.g. `sid` on a session-creation
    /// retry).
    pub fn remove_attribute(mut self, name: &str) -> Self {
        self.attrs.remove(name);
        self
    }

    /// Set the payload XML fragment, replacing any previous payload.
    pub fn payload(mut self, xml: impl Into<String>) -> Self {
        self.payload = xml.into();
        self
    }

    pub fn build(self) -> Body {
        Body {
            attrs: self.attrs,
            payload: self.payload,
        }
    }
}
