//! Acknowledgment decoration and report-driven retransmission scenarios.

mod common;

use bosh_client::test_support::creation_response;
use bosh_client::{Body, attr};
use common::{ConnEvent, Harness, SOON, sid_response};

/// Establish a window wide enough to keep several requests in flight.
fn establish_wide(harness: &Harness) -> i64 {
    harness.establish(
        creation_response("s1", 60, 3)
            .attribute(attr::REQUESTS, "5")
            .build(),
    )
}

#[test]
fn first_post_creation_request_omits_ack_implicitly() {
    let harness = Harness::quiet();
    let rid0 = harness.establish_default();

    harness.session.send(Body::empty()).unwrap();
    let body = harness.expect_request().body;
    assert_eq!(body.rid(), Some(rid0 + 1));
    // response_ack == rid - 1: the implicit ack rule says omit.
    assert_eq!(body.attribute(attr::ACK), None);
}

#[test]
fn request_after_a_response_gap_carries_explicit_ack() {
    let harness = Harness::quiet();
    // requests=3 makes the window an exact synchronization point: the
    // fourth send below can only proceed once the first response has been
    // fully processed, ack bookkeeping included.
    let rid0 = harness.establish(
        creation_response("s1", 60, 3)
            .attribute(attr::REQUESTS, "3")
            .build(),
    );

    // Fill the window; only the first request gets answered.
    for i in 1..=3 {
        harness
            .session
            .send(Body::builder().payload(format!("<m{i}/>")).build())
            .unwrap();
    }
    let first = harness.expect_request();
    let _second = harness.expect_request();
    let _third = harness.expect_request();
    assert_eq!(first.rid(), Some(rid0 + 1));
    first.respond(sid_response("s1"));

    // The responses to rid0+2 and rid0+3 are still missing, so the next
    // request must advertise rid0+1 as the explicit high-water mark.
    harness.session.send(Body::empty()).unwrap();
    let body = harness.expect_request().body;
    assert_eq!(body.rid(), Some(rid0 + 4));
    assert_eq!(
        body.attribute(attr::ACK),
        Some((rid0 + 1).to_string().as_str())
    );
}

#[test]
fn report_resends_the_named_request_only() {
    let harness = Harness::quiet();
    let rid0 = establish_wide(&harness);

    for i in 1..=3 {
        harness
            .session
            .send(Body::builder().payload(format!("<m{i}/>")).build())
            .unwrap();
    }
    let first = harness.expect_request();
    let second = harness.expect_request();
    let _third = harness.expect_request();

    // The CM answers the first request but reports the second as missing.
    first.respond(
        sid_response("s1")
            .rebuild()
            .attribute(attr::REPORT, (rid0 + 2).to_string())
            .attribute(attr::TIME, "1500")
            .build(),
    );

    // The reported request is retransmitted with its original RID and
    // payload.
    let resent = harness.expect_request();
    assert_eq!(resent.rid(), Some(rid0 + 2));
    assert_eq!(resent.body.payload(), "<m2/>");
    assert_eq!(resent.body.payload(), second.body.payload());

    // Exactly one retransmission.
    harness.expect_no_request();
}

#[test]
fn report_of_unknown_rid_disposes_the_session() {
    let harness = Harness::quiet();
    harness.establish_default();

    harness.session.send(Body::empty()).unwrap();
    harness.expect_request().respond(
        sid_response("s1")
            .rebuild()
            .attribute(attr::REPORT, "1")
            .attribute(attr::TIME, "10")
            .build(),
    );

    assert!(harness.events.wait_for(SOON, |e| matches!(
        e,
        ConnEvent::ClosedOnError { recoverable: false, .. }
    )));
}

#[test]
fn acknowledged_requests_are_not_replayed_on_reconnect() {
    let harness = Harness::quiet();
    let rid0 = establish_wide(&harness);

    // One answered request, one unanswered.
    harness
        .session
        .send(Body::builder().payload("<acked/>").build())
        .unwrap();
    harness.expect_request().respond(sid_response("s1"));
    harness
        .session
        .send(Body::builder().payload("<unacked/>").build())
        .unwrap();
    let unanswered = harness.expect_request();
    assert_eq!(unanswered.rid(), Some(rid0 + 2));

    // Losing the connection fails the unanswered exchange.
    unanswered.fail(bosh_client::BoshError::Transport("connection reset".into()));
    assert!(common::wait_until(SOON, || harness
        .session
        .is_recoverable_connection_loss()));

    // Only the unacknowledged body is replayed; the acked one is gone.
    let replayed: Vec<i64> = match harness
        .events
        .snapshot()
        .into_iter()
        .rev()
        .find(|e| matches!(e, ConnEvent::ClosedOnError { .. }))
    {
        Some(ConnEvent::ClosedOnError {
            outstanding_rids, ..
        }) => outstanding_rids,
        _ => panic!("expected a closed-on-error event"),
    };
    assert_eq!(replayed, vec![rid0 + 2]);
}
