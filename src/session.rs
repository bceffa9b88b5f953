//! The session coordinator.
//!
//! One [`Session`] owns the complete state of a BOSH session: the
//! outstanding exchange queue, acknowledgment bookkeeping, connection
//! manager parameters, and the pause/lost flags.  All of it lives behind a
//! single mutex with two conditions:
//!
//! - `not_full` — a send slot opened (or the session ended)
//! - `not_empty` — an exchange is waiting for its response
//!
//! A dedicated receive thread consumes exchanges in send order.  Timer
//! callbacks (empty-request keep-alive, I/O timeout) run on the scheduler
//! and re-enter through the same mutex.  Listener callbacks always run
//! outside the mutex.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::acks::AckTracker;
use crate::body::{Body, TYPE_TERMINATE, attr};
use crate::condition::TerminalBindingCondition;
use crate::config::SessionConfig;
use crate::error::{BoshError, Result};
use crate::exchange::Exchange;
use crate::http::{HttpResponse, HttpSender};
use crate::listener::{
    ConnectionEvent, ConnectionListener, Registry, RequestListener, ResponseListener, dispatch,
};
use crate::params::CmSessionParams;
use crate::rid::RequestIdSequence;
use crate::scheduler::{TaskHandle, TaskScheduler, ThreadScheduler};

/// Highest protocol version this implementation speaks.
const SUPPORTED_VERSION: &str = "1.11";

/// `hold` value requested at session creation.
const CREATION_HOLD: &str = "3";

/// Payload of the dummy requests sent during reconnection.  A request with
/// a payload does not count as an empty request, which forces the CM to
/// produce at least one response and thereby proves end-to-end
/// connectivity.
const RECONNECT_STANZA: &str = "<message xmlns='jabber:client' />";

/// How sending is gated.
#[derive(Clone, Copy, PartialEq, Eq)]
enum SendMode {
    /// Block until the session state allows the body out.
    Normal,
    /// Send only if it would not exceed the keep-alive target; otherwise
    /// give up quietly.  Used by the empty-request task.
    EmptyGated,
}

/// A client-side BOSH session.
///
/// Created from a [`SessionConfig`] and an [`HttpSender`].  No network
/// traffic happens until the first [`send`](Session::send); the first sent
/// body becomes the session-creation request.  Dropping the session closes
/// it as if [`close`](Session::close) had been called.
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SessionConfig,
    sender: Arc<dyn HttpSender>,
    scheduler: Arc<dyn TaskScheduler>,
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
    conn_listeners: Registry<dyn ConnectionListener>,
    request_listeners: Registry<dyn RequestListener>,
    response_listeners: Registry<dyn ResponseListener>,
}

/// Everything guarded by the session mutex.
struct State {
    rids: RequestIdSequence,
    outstanding: VecDeque<Arc<Exchange>>,
    acks: AckTracker,
    cm_params: Option<CmSessionParams>,
    /// A pause request has been sent; empty requests are suspended until
    /// the wake fires or the application sends again.
    paused: bool,
    /// Recoverably disconnected: no outstanding exchanges, sends block.
    lost: bool,
    empty_request_task: Option<TaskHandle>,
    timeout_task: Option<TaskHandle>,
    /// The receive worker.  `None` once disposal has begun.
    receive_thread: Option<JoinHandle<()>>,
    /// Set when disposal ran on the receive thread itself, which cannot
    /// join itself; the next external call performs the join.
    receive_thread_unjoined: Option<JoinHandle<()>>,
}

impl State {
    fn new() -> Self {
        State {
            rids: RequestIdSequence::new(),
            outstanding: VecDeque::new(),
            acks: AckTracker::new(),
            cm_params: None,
            paused: false,
            lost: false,
            empty_request_task: None,
            timeout_task: None,
            receive_thread: None,
            receive_thread_unjoined: None,
        }
    }

    fn working(&self) -> bool {
        self.receive_thread.is_some()
    }

    fn is_current_receive_thread(&self) -> bool {
        self.receive_thread
            .as_ref()
            .is_some_and(|handle| handle.thread().id() == thread::current().id())
    }

    /// Whether `body` can go out right now without violating the in-flight
    /// bound.  One extra slot beyond `requests` is reserved for a terminate
    /// or pause body.
    fn immediately_sendable(&self, body: &Body) -> bool {
        let Some(params) = self.cm_params.as_ref() else {
            // Waiting for the session-creation response: only the creation
            // request itself may be in flight.
            return self.outstanding.is_empty();
        };
        if self.lost {
            return false;
        }
        let Some(max) = params.requests() else {
            return true;
        };
        let max = max as usize;
        if self.outstanding.len() < max {
            return true;
        }
        self.outstanding.len() == max && (body.is_terminate() || body.is_pause_request())
    }

    fn clear_empty_request(&mut self) {
        if let Some(task) = self.empty_request_task.take() {
            task.cancel();
        }
    }

    fn clear_timeout(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.cancel();
        }
    }
}

impl Session {
    /// Create a new session.
    ///
    /// The sender is initialized immediately and the receive worker starts,
    /// but no request is transmitted until the first [`send`](Session::send).
    pub fn create(config: SessionConfig, sender: Arc<dyn HttpSender>) -> Result<Session> {
        let scheduler = config
            .scheduler()
            .cloned()
            .unwrap_or_else(|| Arc::new(ThreadScheduler));
        let inner = Arc::new(SessionInner {
            config,
            sender,
            scheduler,
            state: Mutex::new(State::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            conn_listeners: Registry::new(),
            request_listeners: Registry::new(),
            response_listeners: Registry::new(),
        });

        inner.sender.init(&inner.config);

        // Hold the state lock across the spawn: the worker's first step is
        // to take the same lock, so it cannot observe `receive_thread`
        // before it is recorded here.
        {
            let mut st = inner.state();
            let worker = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name("bosh-receive".to_string())
                .spawn(move || worker.process_messages())?;
            st.receive_thread = Some(handle);
        }

        Ok(Session { inner })
    }

    /// The configuration this session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Send a message body to the connection manager.
    ///
    /// The body needs no BOSH bookkeeping attributes; `rid`, `sid` and
    /// `ack` are applied here.  The first call establishes the session.
    /// Blocks while the in-flight window is full or the connection is
    /// recoverably lost; fails once the session is disposed.
    pub fn send(&self, body: Body) -> Result<()> {
        let st = self.inner.state();
        let (st, result) = self.inner.send_internal(st, body, SendMode::Normal);
        drop(st);
        if let Some(exchange) = result? {
            self.inner.fire_request_sent(exchange.request());
        }
        Ok(())
    }

    /// Ask the connection manager to pause the session for its advertised
    /// `maxpause`.  Returns `false` when the session is not yet established
    /// or the CM does not support pausing.
    pub fn pause(&self) -> Result<bool> {
        self.pause_with(Body::empty())
    }

    /// Like [`pause`](Session::pause), sending `msg` as the pause request's
    /// content.
    pub fn pause_with(&self, msg: Body) -> Result<bool> {
        let maxpause = {
            let st = self.inner.state();
            match st.cm_params.as_ref().and_then(|p| p.maxpause()) {
                Some(mp) => mp,
                None => return Ok(false),
            }
        };
        let body = msg
            .rebuild()
            .attribute(attr::PAUSE, maxpause.as_secs().to_string())
            .build();
        self.send(body)?;
        Ok(true)
    }

    /// End the session by sending a termination request.  Disposal happens
    /// when the CM's final response is processed.
    pub fn disconnect(&self) -> Result<()> {
        self.disconnect_with(Body::empty())
    }

    /// Like [`disconnect`](Session::disconnect), sending `msg` as the final
    /// message content.
    pub fn disconnect_with(&self, msg: Body) -> Result<()> {
        let body = msg.rebuild().attribute(attr::TYPE, TYPE_TERMINATE).build();
        self.send(body)
    }

    /// Forcibly dispose the session without notifying the connection
    /// manager.
    pub fn close(&self) {
        self.inner
            .dispose(Some(BoshError::Usage("session explicitly closed by caller".into())));
    }

    /// Whether the connection was lost in a way [`attempt_reconnect`]
    /// (Session::attempt_reconnect) can recover from.
    pub fn is_recoverable_connection_loss(&self) -> bool {
        self.inner.state().lost
    }

    /// Re-establish connectivity on the same session: abort anything in
    /// flight, replay every unacknowledged request with its original RID,
    /// and top up with dummy requests until `hold + 1` are in the air so
    /// the CM is forced to respond.
    ///
    /// Callable whenever the session is working, whether or not it is
    /// currently marked lost.  Fails once the session is disposed.
    pub fn attempt_reconnect(&self) -> Result<bool> {
        self.inner.attempt_reconnect()
    }

    /// Session parameters from the connection manager, once established.
    pub fn cm_params(&self) -> Option<CmSessionParams> {
        self.inner.state().cm_params.clone()
    }

    /// Block until no exchanges are outstanding or the session is disposed.
    /// Observation hook for tests.
    pub fn drain(&self) {
        tracing::trace!("waiting while draining");
        let mut st = self.inner.state();
        while st.working() && !st.outstanding.is_empty() {
            st = self.inner.wait_not_full(st);
        }
        tracing::trace!("drained");
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner.conn_listeners.add(listener);
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.inner.conn_listeners.remove(listener);
    }

    pub fn add_request_listener(&self, listener: Arc<dyn RequestListener>) {
        self.inner.request_listeners.add(listener);
    }

    pub fn remove_request_listener(&self, listener: &Arc<dyn RequestListener>) {
        self.inner.request_listeners.remove(listener);
    }

    pub fn add_response_listener(&self, listener: Arc<dyn ResponseListener>) {
        self.inner.response_listeners.add(listener);
    }

    pub fn remove_response_listener(&self, listener: &Arc<dyn ResponseListener>) {
        self.inner.response_listeners.remove(listener);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner
            .dispose(Some(BoshError::Usage("session dropped without close".into())));
    }
}

impl SessionInner {
    /// Take the session mutex.  No user code ever runs under this lock, so
    /// a poisoned mutex means a bug in this module; recover the guard
    /// rather than propagating the poison.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_not_full<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.not_full
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_not_empty<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.not_empty
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Gate, decorate, and transmit one body.  The caller owns listener
    /// notification for the returned exchange.
    ///
    /// In [`SendMode::EmptyGated`] the body is sent only if the session is
    /// established, unpaused, not lost, and below the keep-alive target;
    /// otherwise `Ok(None)` is returned and nothing happens.
    fn send_internal<'a>(
        self: &'a Arc<Self>,
        mut st: MutexGuard<'a, State>,
        body: Body,
        mode: SendMode,
    ) -> (MutexGuard<'a, State>, Result<Option<Arc<Exchange>>>) {
        if mode == SendMode::EmptyGated {
            if st.paused || st.lost {
                return (st, Ok(None));
            }
            let Some(params) = st.cm_params.as_ref() else {
                return (st, Ok(None));
            };
            let target = if params.is_polling_session() {
                1
            } else {
                params.hold() as usize
            };
            if st.outstanding.len() >= target {
                return (st, Ok(None));
            }
        } else {
            while st.working() && !st.immediately_sendable(&body) {
                st = self.wait_not_full(st);
            }
        }

        if !st.working() {
            return (st, Err(BoshError::Disposed));
        }

        // Any send resumes a paused session; a pause request (re)starts
        // one, with the wake scheduled against the pause duration.
        st.paused = body.is_pause_request();
        if st.paused
            && let Some(delay) = self.pause_wake_delay(&st, &body)
        {
            st.clear_empty_request();
            self.schedule_empty_requests(&mut st, delay);
        }

        let rid = st.rids.next_rid();
        let request = match st.cm_params.as_ref() {
            // The gate guarantees nothing is in flight before the creation
            // response, so a missing `cm_params` means this is the
            // session-creation request.
            None => self.apply_session_creation(rid, body),
            Some(params) => Self::apply_session_data(params, &st.acks, rid, body),
        };

        let exchange = self.create_exchange_and_send(&mut st, request.clone());
        st.acks.record_send(request);
        (st, Ok(Some(exchange)))
    }

    /// Decorate the first request of the session (XEP-0124 §7.1).
    fn apply_session_creation(&self, rid: i64, orig: Body) -> Body {
        let mut builder = orig
            .rebuild()
            .attribute(attr::TO, self.config.to())
            .attribute(attr::XML_LANG, self.config.lang())
            .attribute(attr::VER, SUPPORTED_VERSION)
            .attribute(attr::WAIT, self.config.wait_seconds().to_string())
            .attribute(attr::HOLD, CREATION_HOLD)
            .attribute(attr::RID, rid.to_string());
        if let Some(route) = self.config.route() {
            builder = builder.attribute(attr::ROUTE, route);
        }
        if let Some(from) = self.config.from() {
            builder = builder.attribute(attr::FROM, from);
        }
        builder
            .attribute(attr::ACK, "1")
            // Must not carry a stale session id, e.g. on retries.
            .remove_attribute(attr::SID)
            .build()
    }

    /// Decorate a request within an established session.
    fn apply_session_data(params: &CmSessionParams, acks: &AckTracker, rid: i64, orig: Body) -> Body {
        let mut builder = orig
            .rebuild()
            .attribute(attr::SID, params.sid())
            .attribute(attr::RID, rid.to_string());
        if let Some(ack) = acks.ack_attribute_for(rid) {
            builder = builder.attribute(attr::ACK, ack.to_string());
        }
        builder.build()
    }

    /// Hand the request to the HTTP sender and queue the exchange.  The
    /// sender contract requires `send` to return without blocking.
    fn create_exchange_and_send(
        self: &Arc<Self>,
        st: &mut MutexGuard<'_, State>,
        request: Body,
    ) -> Arc<Exchange> {
        let handle = self.sender.send(st.cm_params.as_ref(), &request);
        let exchange = Arc::new(Exchange::new(request, handle));
        st.outstanding.push_back(Arc::clone(&exchange));
        self.not_empty.notify_all();

        if self.config.tunables().assertions
            && let Some(max) = st.cm_params.as_ref().and_then(|p| p.requests())
        {
            assert!(
                st.outstanding.len() <= max as usize + 1,
                "outstanding exchange count {} exceeds requests bound {} + 1",
                st.outstanding.len(),
                max
            );
        }

        if st.timeout_task.is_none() {
            self.reset_timeout(st);
        }
        exchange
    }

    /// Wake delay for a pause request, or `None` if the session does not
    /// support pausing.
    fn pause_wake_delay(&self, st: &State, req: &Body) -> Option<Duration> {
        st.cm_params.as_ref()?.maxpause()?;
        let pause_secs: u64 = req.attribute(attr::PAUSE)?.parse().ok()?;
        let tunables = self.config.tunables();
        let delay = Duration::from_secs(pause_secs)
            .checked_sub(tunables.pause_margin)
            .unwrap_or(tunables.empty_request_delay);
        Some(delay)
    }

    /// Interval before the next empty keep-alive request, or `None` when
    /// none should be scheduled.
    fn default_empty_request_delay(&self, st: &State) -> Option<Duration> {
        let params = st.cm_params.as_ref()?;
        if self.config.tunables().empty_requests_disabled {
            return None;
        }
        // With hold > 0 the CM expects hold+1 requests in flight; refill as
        // soon as a slot opens.  Polling sessions honor the CM's minimum
        // interval instead.
        if params.hold() > 0 {
            return Some(Duration::ZERO);
        }
        Some(
            params
                .polling()
                .unwrap_or(self.config.tunables().empty_request_delay),
        )
    }

    /// Schedule the empty-request task.  A task already pending makes this
    /// a no-op; exactly one may exist at a time.
    fn schedule_empty_requests(self: &Arc<Self>, st: &mut MutexGuard<'_, State>, delay: Duration) {
        if !st.working() || st.empty_request_task.is_some() {
            return;
        }
        tracing::debug!(delay_ms = delay.as_millis() as u64, "scheduling empty request");

        // Scheduling while paused means scheduling the request that wakes
        // the session from the pause; that one fire may ignore the paused
        // gate.
        let wake_from_pause = st.paused;
        let weak = Arc::downgrade(self);
        st.empty_request_task = Some(self.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.send_empty_requests(wake_from_pause);
                }
            }),
        ));
    }

    /// Empty-request task body: send empty requests until the gate refuses
    /// one, then release the task slot.
    fn send_empty_requests(self: &Arc<Self>, mut wake_from_pause: bool) {
        loop {
            let sent_request;
            {
                let mut st = self.state();
                if !st.working() {
                    return;
                }
                // If the session is no longer paused (the application sent
                // something, or an earlier loop iteration already woke it),
                // fall back to ordinary gated behavior.
                if !st.paused {
                    wake_from_pause = false;
                }
                let mode = if wake_from_pause {
                    SendMode::Normal
                } else {
                    SendMode::EmptyGated
                };
                let (mut st, result) = self.send_internal(st, Body::empty(), mode);
                match result {
                    Ok(Some(exchange)) => sent_request = exchange.request().clone(),
                    Ok(None) => {
                        // Gate refused: allow a new task to be scheduled.
                        st.empty_request_task = None;
                        return;
                    }
                    Err(_) => return,
                }
            }
            self.fire_request_sent(&sent_request);
        }
    }

    /// Clear and, if exchanges remain outstanding, reschedule the I/O
    /// timeout.
    fn reset_timeout(self: &Arc<Self>, st: &mut MutexGuard<'_, State>) {
        st.clear_timeout();
        if st.outstanding.is_empty() {
            return;
        }

        // A response must arrive within the negotiated wait period; pad it
        // for transport latency.
        let wait = st
            .cm_params
            .as_ref()
            .map(|p| p.wait())
            .unwrap_or_else(|| self.config.wait());
        let mut timeout = wait * 3 / 2;
        if timeout.is_zero() {
            // Polling mode: the CM answers as fast as it can.
            timeout = Duration::from_secs(60);
        }

        let weak = Arc::downgrade(self);
        st.timeout_task = Some(self.scheduler.schedule(
            timeout,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.connection_lost(
                        BoshError::Transport("connection timed out".into()),
                        None,
                    );
                }
            }),
        ));
    }

    /// Abort every outstanding exchange and cancel the empty-request task.
    fn close_all_exchanges(&self, st: &mut MutexGuard<'_, State>) {
        st.clear_empty_request();
        for exchange in st.outstanding.drain(..) {
            exchange.abort();
        }
        self.not_full.notify_all();
    }

    /// Transition to the recoverably-lost state.
    ///
    /// `failed` identifies the exchange whose response produced the error,
    /// when there is one; a failure for an exchange that has already been
    /// aborted and replaced (resend, reconnect) is stale and ignored.
    fn connection_lost(self: &Arc<Self>, cause: BoshError, failed: Option<&Arc<Exchange>>) {
        let pending;
        {
            let mut st = self.state();
            if !st.working() {
                return;
            }
            if let Some(exchange) = failed
                && !st.outstanding.iter().any(|e| Arc::ptr_eq(e, exchange))
            {
                tracing::trace!("ignoring stale transport failure");
                return;
            }
            st.clear_timeout();
            if st.lost {
                return;
            }
            st.lost = true;
            tracing::debug!(%cause, "connection recoverably lost");
            pending = st.acks.pending_requests().to_vec();
            self.close_all_exchanges(&mut st);
        }
        self.fire_connection_closed_on_error(cause, pending);
    }

    fn attempt_reconnect(self: &Arc<Self>) -> Result<bool> {
        let mut to_notify;
        {
            let mut st = self.state();
            if !st.working() {
                return Err(BoshError::Disposed);
            }

            // Anything still in the air is stopped and resent below.
            self.close_all_exchanges(&mut st);

            // From here the connection is no longer considered lost; a
            // failing resend will re-enter the lost state on its own.
            st.lost = false;

            // Disconnection implies at least one request went unanswered,
            // so there must be something to replay.
            if !st.acks.has_pending_requests() {
                return Err(BoshError::Usage(
                    "no requests pending while disconnected".into(),
                ));
            }

            if self.config.tunables().assertions {
                let max_requests = match st.cm_params.as_ref() {
                    None => Some(1),
                    Some(params) => params.requests().map(|r| r as usize),
                };
                if let Some(max) = max_requests {
                    assert!(
                        st.acks.pending_request_count() <= max,
                        "more requests pending than can be sent at once ({} > {})",
                        st.acks.pending_request_count(),
                        max
                    );
                }
            }

            // Replay every unacknowledged request with its original RID.
            to_notify = st.acks.pending_requests().to_vec();
            for body in &to_notify {
                self.create_exchange_and_send(&mut st, body.clone());
            }

            // Force at least one response: keep hold+1 requests in the air,
            // each carrying a stanza so it does not count as empty.
            let hold = st.cm_params.as_ref().map(|p| p.hold() as usize).unwrap_or(0);
            while st.outstanding.len() < hold + 1 {
                let dummy = Body::builder().payload(RECONNECT_STANZA).build();
                let (returned, result) = self.send_internal(st, dummy, SendMode::Normal);
                st = returned;
                match result {
                    Ok(Some(exchange)) => to_notify.push(exchange.request().clone()),
                    Ok(None) => break,
                    Err(err) => return Err(err),
                }
            }
        }

        for body in &to_notify {
            self.fire_request_sent(body);
        }
        Ok(true)
    }

    // ── Receive worker ──────────────────────────────────────────────────

    fn process_messages(self: Arc<Self>) {
        tracing::trace!("receive thread starting");
        while let Some(exchange) = self.next_exchange() {
            self.process_exchange(exchange);
        }
        tracing::trace!("receive thread exiting");
    }

    /// Head of the outstanding queue, blocking until one exists.  Returns
    /// `None` once this thread is no longer the session's receive worker.
    fn next_exchange(&self) -> Option<Arc<Exchange>> {
        let mut st = self.state();
        loop {
            if !st.is_current_receive_thread() {
                return None;
            }
            if let Some(head) = st.outstanding.front() {
                return Some(Arc::clone(head));
            }
            st = self.wait_not_empty(st);
        }
    }

    fn process_exchange(self: &Arc<Self>, exchange: Arc<Exchange>) {
        let response = match exchange.response().wait() {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(%err, "could not obtain response");
                self.connection_lost(err, Some(&exchange));
                return;
            }
        };

        self.fire_response_received(&response.body);

        let mut to_resend: Vec<Body> = Vec::new();
        let mut st = self.state();
        if !st.working() {
            return;
        }

        // The session-creation response materializes the CM parameters.
        if st.cm_params.is_none() {
            match CmSessionParams::from_session_init(exchange.request(), &response.body) {
                Ok(params) => st.cm_params = Some(params),
                Err(err) => {
                    drop(st);
                    self.dispose(Some(err));
                    return;
                }
            }

            // The established event fires with the lock released; we might
            // have been disposed while listeners ran.
            drop(st);
            self.fire_connection_established();
            st = self.state();
            if !st.working() {
                return;
            }
        }

        if let Some(condition) = Self::terminal_condition(&st, &response) {
            drop(st);
            self.dispose(Some(BoshError::TerminalBinding(condition)));
            return;
        }
        if response.body.is_terminate() {
            drop(st);
            self.dispose(None);
            return;
        }

        if response.body.is_recoverable_error() {
            // The CM discarded our requests; every outstanding body is
            // retransmitted with its original RID and the response itself
            // carries no acknowledgment state.
            to_resend = self.abort_for_resend(&mut st);
        } else {
            st.acks.apply_response_ack(exchange.request(), &response.body);
            st.acks.record_response_rid(exchange.request());
            match st.acks.lookup_report(&response.body) {
                Ok(Some(body)) => to_resend.push(body),
                Ok(None) => {}
                Err(err) => {
                    drop(st);
                    self.dispose(Some(err));
                    return;
                }
            }
        }

        for body in &to_resend {
            self.create_exchange_and_send(&mut st, body.clone());
        }

        if let Some(position) = st
            .outstanding
            .iter()
            .position(|e| Arc::ptr_eq(e, &exchange))
        {
            let _ = st.outstanding.remove(position);
            self.not_full.notify_all();
        }

        self.reset_timeout(&mut st);

        if !st.paused
            && let Some(delay) = self.default_empty_request_delay(&st)
        {
            self.schedule_empty_requests(&mut st, delay);
        }
        drop(st);

        for body in &to_resend {
            self.fire_request_sent(body);
        }
    }

    /// Terminal binding condition carried by this response, if any
    /// (XEP-0124 §17, plus the deprecated pre-1.6 HTTP status scheme).
    fn terminal_condition(st: &State, response: &HttpResponse) -> Option<TerminalBindingCondition> {
        if response.body.is_terminate()
            && let Some(condition) = response.body.attribute(attr::CONDITION)
        {
            return Some(TerminalBindingCondition::from_condition(condition));
        }
        if let Some(params) = st.cm_params.as_ref()
            && params.ver().is_none()
        {
            return TerminalBindingCondition::from_http_status(response.status);
        }
        None
    }

    /// Abort all outstanding exchanges (including the one being processed)
    /// and return their request bodies in send order for retransmission.
    fn abort_for_resend(&self, st: &mut MutexGuard<'_, State>) -> Vec<Body> {
        let mut to_resend = Vec::with_capacity(st.outstanding.len());
        for exchange in st.outstanding.drain(..) {
            to_resend.push(exchange.request().clone());
            exchange.abort();
        }
        self.not_full.notify_all();
        to_resend
    }

    // ── Disposal ────────────────────────────────────────────────────────

    /// Destroy the session.  `cause` is `None` for organic termination.
    fn dispose(self: &Arc<Self>, cause: Option<BoshError>) {
        let pending;
        let join_target;
        {
            let mut st = self.state();

            if st.receive_thread.is_none() {
                // Disposal already ran.  If it ran on the receive thread,
                // that thread could not join itself; do it now.
                let Some(handle) = st.receive_thread_unjoined.take() else {
                    return;
                };
                if handle.thread().id() == thread::current().id() {
                    st.receive_thread_unjoined = Some(handle);
                    return;
                }
                drop(st);
                let _ = handle.join();
                return;
            }

            let handle = match st.receive_thread.take() {
                Some(handle) => handle,
                None => return,
            };
            if handle.thread().id() == thread::current().id() {
                st.receive_thread_unjoined = Some(handle);
                join_target = None;
            } else {
                join_target = Some(handle);
            }
            pending = st.acks.pending_requests().to_vec();
        }

        match cause {
            None => self.fire_connection_closed(),
            Some(cause) => self.fire_connection_closed_on_error(cause, pending),
        }

        {
            let mut st = self.state();
            st.clear_empty_request();
            st.clear_timeout();
            for exchange in st.outstanding.drain(..) {
                exchange.abort();
            }
            st.acks.clear();
            st.cm_params = None;
            st.lost = false;
            st.paused = false;
            self.not_empty.notify_all();
            self.not_full.notify_all();
        }

        self.sender.destroy();

        if let Some(handle) = join_target {
            let _ = handle.join();
        }
    }

    // ── Listener notification (always outside the lock) ─────────────────

    fn fire_request_sent(&self, request: &Body) {
        for listener in self.request_listeners.snapshot() {
            dispatch(&listener, |l| l.request_sent(request));
        }
    }

    fn fire_response_received(&self, response: &Body) {
        for listener in self.response_listeners.snapshot() {
            dispatch(&listener, |l| l.response_received(response));
        }
    }

    fn fire_connection_established(&self) {
        let event = ConnectionEvent::Established;
        for listener in self.conn_listeners.snapshot() {
            dispatch(&listener, |l| l.connection_event(&event));
        }
    }

    fn fire_connection_closed(&self) {
        let event = ConnectionEvent::Closed;
        for listener in self.conn_listeners.snapshot() {
            dispatch(&listener, |l| l.connection_event(&event));
        }
    }

    fn fire_connection_closed_on_error(&self, cause: BoshError, outstanding: Vec<Body>) {
        let event = ConnectionEvent::ClosedOnError {
            cause,
            outstanding_requests: outstanding,
        };
        for listener in self.conn_listeners.snapshot() {
            dispatch(&listener, |l| l.connection_event(&event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(attrs: &[(&str, &str)]) -> CmSessionParams {
        let mut builder = Body::builder();
        for (name, value) in attrs {
            builder = builder.attribute(name, *value);
        }
        CmSessionParams::from_session_init(&Body::empty(), &builder.build()).unwrap()
    }

    fn established_state(extra: &[(&str, &str)]) -> State {
        let mut base = vec![("sid", "s1"), ("wait", "60"), ("hold", "1")];
        base.extend_from_slice(extra);
        let mut st = State::new();
        st.cm_params = Some(params(&base));
        st
    }

    fn dummy_exchange(rid: i64) -> Arc<Exchange> {
        let (_tx, handle) = crate::http::response_channel();
        Arc::new(Exchange::new(
            Body::builder().attribute(attr::RID, rid.to_string()).build(),
            Box::new(handle),
        ))
    }

    #[test]
    fn creation_gate_allows_only_one_in_flight() {
        let mut st = State::new();
        assert!(st.immediately_sendable(&Body::empty()));
        st.outstanding.push_back(dummy_exchange(1));
        assert!(!st.immediately_sendable(&Body::empty()));
    }

    #[test]
    fn gate_blocks_while_lost() {
        let mut st = established_state(&[]);
        st.lost = true;
        assert!(!st.immediately_sendable(&Body::empty()));
    }

    #[test]
    fn gate_is_unbounded_without_requests_limit() {
        let mut st = established_state(&[]);
        for rid in 0..16 {
            st.outstanding.push_back(dummy_exchange(rid));
        }
        assert!(st.immediately_sendable(&Body::empty()));
    }

    #[test]
    fn gate_reserves_extra_slot_for_terminate_and_pause() {
        let mut st = established_state(&[("requests", "2")]);
        st.outstanding.push_back(dummy_exchange(1));
        assert!(st.immediately_sendable(&Body::empty()));

        st.outstanding.push_back(dummy_exchange(2));
        assert!(!st.immediately_sendable(&Body::empty()));

        let terminate = Body::builder().attribute(attr::TYPE, "terminate").build();
        let pause = Body::builder().attribute(attr::PAUSE, "60").build();
        assert!(st.immediately_sendable(&terminate));
        assert!(st.immediately_sendable(&pause));

        // The extra slot exists only at exactly the limit.
        st.outstanding.push_back(dummy_exchange(3));
        assert!(!st.immediately_sendable(&terminate));
        assert!(!st.immediately_sendable(&pause));
    }
}
