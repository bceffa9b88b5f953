//! Scripted HTTP sender for driving a session without a network.
//!
//! Tests create a [`ScriptedSender`], hand it to
//! [`Session::create`](crate::Session::create), and then play the
//! connection manager's side: pop each transmitted request with
//! [`next_request`](ScriptedSender::next_request) and answer (or fail) it
//! explicitly.  Unanswered requests fail automatically when the sender is
//! destroyed, which is how disposal unblocks the receive worker.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::body::{Body, BodyBuilder, attr};
use crate::config::SessionConfig;
use crate::error::BoshError;
use crate::http::{HttpResponse, HttpSender, ResponseHandle, ResponseSender, response_channel};
use crate::params::CmSessionParams;

/// One request captured by the scripted sender, with the means to answer it.
pub struct SentRequest {
    /// The decorated request body as transmitted.
    pub body: Body,
    /// Session parameters in effect at transmission time (`None` for the
    /// session-creation request).
    pub params: Option<CmSessionParams>,
    responder: ResponseSender,
}

impl SentRequest {
    pub fn rid(&self) -> Option<i64> {
        self.body.rid()
    }

    /// Answer with `body` and HTTP status 200.
    pub fn respond(self, body: Body) {
        self.respond_with_status(body, 200);
    }

    pub fn respond_with_status(self, body: Body, status: u16) {
        self.responder.fulfill(Ok(HttpResponse { body, status }));
    }

    /// Fail the request, as a broken transport would.
    pub fn fail(self, err: BoshError) {
        self.responder.fulfill(Err(err));
    }
}

struct Inner {
    requests: VecDeque<SentRequest>,
    sent_count: usize,
    init_count: usize,
    destroyed: bool,
}

/// An in-memory [`HttpSender`] driven by the test.
pub struct ScriptedSender {
    inner: Mutex<Inner>,
    arrived: Condvar,
}

impl ScriptedSender {
    pub fn new() -> Arc<Self> {
        Arc::new(ScriptedSender {
            inner: Mutex::new(Inner {
                requests: VecDeque::new(),
                sent_count: 0,
                init_count: 0,
                destroyed: false,
            }),
            arrived: Condvar::new(),
        })
    }

    /// Pop the oldest unanswered request, waiting up to `timeout` for one
    /// to arrive.
    pub fn next_request(&self, timeout: Duration) -> Option<SentRequest> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(request) = inner.requests.pop_front() {
                return Some(request);
            }
            if inner.destroyed {
                return None;
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, _timed_out) = self
                .arrived
                .wait_timeout(inner, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
    }

    /// Pop the oldest unanswered request if one is already waiting.
    pub fn try_next_request(&self) -> Option<SentRequest> {
        self.lock().requests.pop_front()
    }

    /// Total number of requests transmitted so far.
    pub fn sent_count(&self) -> usize {
        self.lock().sent_count
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    pub fn init_count(&self) -> usize {
        self.lock().init_count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HttpSender for ScriptedSender {
    fn init(&self, _config: &SessionConfig) {
        self.lock().init_count += 1;
    }

    fn destroy(&self) {
        let mut inner = self.lock();
        inner.destroyed = true;
        // Dropping the queued responders fails their pending waits.
        inner.requests.clear();
        self.arrived.notify_all();
    }

    fn send(&self, params: Option<&CmSessionParams>, body: &Body) -> Box<dyn ResponseHandle> {
        let (responder, handle) = response_channel();
        let mut inner = self.lock();
        if inner.destroyed {
            // Responder dropped here; the handle fails immediately.
            return Box::new(handle);
        }
        inner.sent_count += 1;
        inner.requests.push_back(SentRequest {
            body: body.clone(),
            params: params.cloned(),
            responder,
        });
        self.arrived.notify_all();
        Box::new(handle)
    }
}

/// Builder for a plausible session-creation response, preloaded with the
/// required attributes.  Append `requests`, `maxpause`, `ack` and friends
/// as the scenario demands.
pub fn creation_response(sid: &str, wait: u32, hold: u32) -> BodyBuilder {
    Body::builder()
        .attribute(attr::SID, sid)
        .attribute(attr::WAIT, wait.to_string())
        .attribute(attr::HOLD, hold.to_string())
        .attribute(attr::VER, "1.11")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_sent_requests_in_order() {
        let sender = ScriptedSender::new();
        let first = Body::builder().attribute(attr::RID, "1").build();
        let second = Body::builder().attribute(attr::RID, "2").build();
        let _h1 = sender.send(None, &first);
        let _h2 = sender.send(None, &second);

        assert_eq!(sender.sent_count(), 2);
        assert_eq!(sender.try_next_request().unwrap().rid(), Some(1));
        assert_eq!(sender.try_next_request().unwrap().rid(), Some(2));
        assert!(sender.try_next_request().is_none());
    }

    #[test]
    fn respond_completes_the_handle() {
        let sender = ScriptedSender::new();
        let handle = sender.send(None, &Body::empty());
        let request = sender.try_next_request().unwrap();
        request.respond(Body::builder().attribute(attr::SID, "s").build());

        let response = handle.wait().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.attribute(attr::SID), Some("s"));
    }

    #[test]
    fn destroy_fails_unanswered_requests() {
        let sender = ScriptedSender::new();
        let handle = sender.send(None, &Body::empty());
        sender.destroy();
        assert!(handle.wait().is_err());

        // Requests sent after destruction fail immediately.
        let late = sender.send(None, &Body::empty());
        assert!(late.wait().is_err());
    }

    #[test]
    fn next_request_times_out_when_nothing_arrives() {
        let sender = ScriptedSender::new();
        assert!(sender.next_request(Duration::from_millis(50)).is_none());
    }
}
