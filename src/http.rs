//! HTTP sender contract.
//!
//! The session engine never performs network I/O itself; it hands each
//! decorated body to an [`HttpSender`] and later consumes the result via
//! the returned [`ResponseHandle`].  A production sender wraps a real HTTP
//! client; tests plug in a scripted sender (see [`crate::test_support`]).

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::{Receiver, Sender, bounded};

use crate::body::Body;
use crate::config::SessionConfig;
use crate::error::{BoshError, Result};
use crate::params::CmSessionParams;

/// A decoded HTTP response: the parsed `<body/>` and the HTTP status code.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub body: Body,
    pub status: u16,
}

/// Transmits request bodies to the connection manager.
///
/// Implementations must be thread-safe: the coordinator calls `send` from
/// application threads and timer threads concurrently.
pub trait HttpSender: Send + Sync {
    /// Prepare the sender for a new session.
    fn init(&self, config: &SessionConfig);

    /// Tear down the sender, aborting any in-flight requests.  Pending
    /// [`ResponseHandle::wait`] calls must return an error afterwards.
    fn destroy(&self);

    /// Transmit `body` asynchronously and return a handle to the eventual
    /// response.  `params` is `None` for the session-creation request.
    fn send(&self, params: Option<&CmSessionParams>, body: &Body) -> Box<dyn ResponseHandle>;
}

/// Handle to one pending HTTP response.
pub trait ResponseHandle: Send + Sync {
    /// Block until the response arrives, the request is aborted, or the
    /// sender is destroyed.
    fn wait(&self) -> Result<HttpResponse>;

    /// Best-effort cancel.  Idempotent; any `wait` call entered after
    /// `abort` returns must produce an error.
    fn abort(&self);
}

/// Create a connected fulfillment/handle pair.
///
/// The sender side is held by the transport (or a test script) and fulfilled
/// exactly once; the handle side is stored in the session's exchange queue.
/// Dropping the sender without fulfilling it fails the handle, which is how
/// sender teardown propagates to waiting consumers.
pub fn response_channel() -> (ResponseSender, ChannelResponse) {
    let (result_tx, result_rx) = bounded(1);
    let (abort_tx, abort_rx) = bounded(1);
    let sender = ResponseSender { tx: result_tx };
    let handle = ChannelResponse {
        result_rx,
        abort_tx,
        abort_rx,
        aborted: AtomicBool::new(false),
    };
    (sender, handle)
}

/// Fulfillment side of a [`response_channel`].
pub struct ResponseSender {
    tx: Sender<Result<HttpResponse>>,
}

impl ResponseSender {
    /// Deliver the response.  Returns quietly if the handle is gone.
    pub fn fulfill(self, result: Result<HttpResponse>) {
        let _ = self.tx.send(result);
    }
}

/// Channel-backed [`ResponseHandle`].
pub struct ChannelResponse {
    result_rx: Receiver<Result<HttpResponse>>,
    abort_tx: Sender<()>,
    abort_rx: Receiver<()>,
    aborted: AtomicBool,
}

impl ResponseHandle for ChannelResponse {
    fn wait(&self) -> Result<HttpResponse> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(aborted_error());
        }
        crossbeam::select! {
            recv(self.result_rx) -> msg => match msg {
                Ok(result) => result,
                Err(_) => Err(BoshError::Transport("http sender destroyed".into())),
            },
            recv(self.abort_rx) -> _ => Err(aborted_error()),
        }
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        let _ = self.abort_tx.try_send(());
    }
}

fn aborted_error() -> BoshError {
    BoshError::Transport("request aborted".into())
}
