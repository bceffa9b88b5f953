//! Shared fixture for session scenario tests.
//!
//! Each test drives a real `Session` against the scripted in-memory sender,
//! playing the connection manager's half of the conversation by hand.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use bosh_client::test_support::{ScriptedSender, SentRequest, creation_response};
use bosh_client::{
    Body, ConnectionEvent, ConnectionListener, Session, SessionConfig, Tunables, attr,
};

/// Generous bound for anything that should happen promptly.
pub const SOON: Duration = Duration::from_secs(5);

/// Bound for asserting that something does *not* happen.
pub const QUIET: Duration = Duration::from_millis(200);

/// A recorded connection lifecycle event, reduced to what tests assert on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    Established,
    Closed,
    ClosedOnError {
        recoverable: bool,
        outstanding_rids: Vec<i64>,
    },
}

#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ConnEvent>>>,
}

impl EventLog {
    pub fn snapshot(&self) -> Vec<ConnEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn established_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|e| **e == ConnEvent::Established)
            .count()
    }

    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(&ConnEvent) -> bool) -> bool {
        wait_until(timeout, || self.snapshot().iter().any(|e| pred(e)))
    }

    fn listener(&self) -> Arc<dyn ConnectionListener> {
        let events = Arc::clone(&self.events);
        Arc::new(move |event: &ConnectionEvent| {
            let recorded = match event {
                ConnectionEvent::Established => ConnEvent::Established,
                ConnectionEvent::Closed => ConnEvent::Closed,
                ConnectionEvent::ClosedOnError {
                    cause,
                    outstanding_requests,
                } => ConnEvent::ClosedOnError {
                    recoverable: cause.is_recoverable(),
                    outstanding_rids: outstanding_requests
                        .iter()
                        .filter_map(Body::rid)
                        .collect(),
                },
            };
            events.lock().unwrap().push(recorded);
        })
    }
}

pub struct Harness {
    pub session: Session,
    pub sender: Arc<ScriptedSender>,
    pub events: EventLog,
}

impl Harness {
    /// Session with empty keep-alive requests suppressed, which keeps the
    /// request sequence fully deterministic.  Scenarios about the
    /// keep-alive itself use [`Harness::with_config`] and enable them.
    pub fn quiet() -> Harness {
        Harness::with_config(quiet_config(Tunables::default()))
    }

    pub fn with_config(config: SessionConfig) -> Harness {
        init_tracing();
        let sender = ScriptedSender::new();
        let events = EventLog::default();
        let session = Session::create(config, sender.clone()).expect("create session");
        session.add_connection_listener(events.listener());
        Harness {
            session,
            sender,
            events,
        }
    }

    /// Send the session-creation request (an empty body) and answer it with
    /// `response`.  Returns the creation request's RID.
    pub fn establish(&self, response: Body) -> i64 {
        self.session.send(Body::empty()).expect("send creation request");
        let request = self.expect_request();
        let rid = request.rid().expect("creation request carries a rid");
        request.respond(response);
        assert!(
            wait_until(SOON, || self.session.cm_params().is_some()),
            "session never established"
        );
        rid
    }

    /// Establish with a plain `wait=60, hold=1` response.
    pub fn establish_default(&self) -> i64 {
        self.establish(creation_response("s1", 60, 1).build())
    }

    /// Next transmitted request, failing the test if none arrives in time.
    pub fn expect_request(&self) -> SentRequest {
        self.sender
            .next_request(SOON)
            .expect("expected a request to be transmitted")
    }

    /// Assert that nothing is transmitted for a while.
    pub fn expect_no_request(&self) {
        assert!(
            self.sender.next_request(QUIET).is_none(),
            "unexpected request transmitted"
        );
    }
}

pub fn quiet_config(mut tunables: Tunables) -> SessionConfig {
    tunables.empty_requests_disabled = true;
    config_with(tunables)
}

pub fn config_with(tunables: Tunables) -> SessionConfig {
    SessionConfig::builder("http://cm.example.com/http-bind", "example.com")
        .tunables(tunables)
        .build()
        .expect("valid config")
}

/// Capture engine traces in test output (`RUST_LOG=bosh_client=trace`).
fn init_tracing() {
    static TRACING: Once = Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Response body bound to an established session: echoes `sid`.
pub fn sid_response(sid: &str) -> Body {
    Body::builder().attribute(attr::SID, sid).build()
}
