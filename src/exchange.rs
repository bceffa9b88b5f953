//! Pairing of one outbound request with its pending response.

use crate::body::Body;
use crate::http::ResponseHandle;

/// One in-flight request/response pair.
///
/// Inserted into the outstanding queue when the request is transmitted and
/// removed when its response has been consumed or the exchange is aborted.
pub struct Exchange {
    request: Body,
    response: Box<dyn ResponseHandle>,
}

impl Exchange {
    pub fn new(request: Body, response: Box<dyn ResponseHandle>) -> Self {
        Exchange { request, response }
    }

    /// The decorated request body as it went over the wire.
    pub fn request(&self) -> &Body {
        &self.request
    }

    /// Handle to the pending response.
    pub fn response(&self) -> &dyn ResponseHandle {
        self.response.as_ref()
    }

    /// Best-effort cancel of the pending response.
    pub fn abort(&self) {
        self.response.abort();
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("rid", &self.request.rid())
            .finish_non_exhaustive()
    }
}
