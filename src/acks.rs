//! Acknowledgment bookkeeping (XEP-0124 §8 and §14).
//!
//! Two independent concerns share this tracker:
//!
//! - **Outbound**: every sent request stays in `pending_request_acks` until
//!   the connection manager acknowledges its RID, so it can be replayed
//!   after a recoverable failure or a `report`.
//! - **Inbound**: received response RIDs feed a contiguous high-water mark
//!   (`response_ack`) that decorates outgoing requests as the `ack`
//!   attribute.

use std::collections::BTreeSet;

use crate::body::{Body, attr};
use crate::error::{BoshError, Result};

/// Sentinel for "no response received yet".
const NO_RESPONSE_ACK: i64 = -1;

#[derive(Debug, Default)]
pub struct AckTracker {
    /// Sent requests whose RIDs the CM has not yet acknowledged, in send
    /// order.
    pending_request_acks: Vec<Body>,
    /// Highest RID for which this response and all lower-RID responses have
    /// been received.
    response_ack: i64,
    /// Received response RIDs above the contiguous high-water mark.
    pending_response_acks: BTreeSet<i64>,
}

impl AckTracker {
    pub fn new() -> Self {
        AckTracker {
            pending_request_acks: Vec::new(),
            response_ack: NO_RESPONSE_ACK,
            pending_response_acks: BTreeSet::new(),
        }
    }

    /// Record a transmitted request for potential replay.
    pub fn record_send(&mut self, request: Body) {
        self.pending_request_acks.push(request);
    }

    /// Drop pending requests covered by the response's acknowledgment.
    ///
    /// A response carrying a `report` acknowledges nothing.  Otherwise the
    /// response's `ack` attribute (or, implicitly, the RID of the request it
    /// answers) acknowledges every request up to
    /// `min(ack, request RID)`.
    pub fn apply_response_ack(&mut self, req: &Body, resp: &Body) {
        if resp.attribute(attr::REPORT).is_some() {
            return;
        }

        let Some(req_rid) = req.rid() else {
            return;
        };
        let ack_up_to = match resp.attribute(attr::ACK).and_then(|v| v.parse::<i64>().ok()) {
            Some(acked) => acked.min(req_rid),
            None => req_rid,
        };

        tracing::trace!(ack_up_to, "removing pending request acks");
        self.pending_request_acks
            .retain(|pending| pending.rid().is_none_or(|rid| rid > ack_up_to));
    }

    /// Fold the RID of a freshly answered request into the inbound
    /// acknowledgment state.
    pub fn record_response_rid(&mut self, req: &Body) {
        let Some(rid) = req.rid() else {
            return;
        };
        if self.response_ack == NO_RESPONSE_ACK {
            self.response_ack = rid;
            return;
        }
        self.pending_response_acks.insert(rid);
        while self.pending_response_acks.remove(&(self.response_ack + 1)) {
            self.response_ack += 1;
        }
    }

    /// The `ack` attribute value for an outgoing request with `rid`, or
    /// `None` when the attribute must be omitted (nothing received yet, or
    /// the implicit-ack rule applies).
    pub fn ack_attribute_for(&self, rid: i64) -> Option<i64> {
        if self.response_ack == NO_RESPONSE_ACK || self.response_ack == rid - 1 {
            return None;
        }
        Some(self.response_ack)
    }

    /// Locate the pending request a `report` attribute refers to.
    ///
    /// Returns the request body to retransmit, or a protocol violation if
    /// the CM reported a RID we have no record of.
    pub fn lookup_report(&self, resp: &Body) -> Result<Option<Body>> {
        let Some(report) = resp.attribute(attr::REPORT) else {
            return Ok(None);
        };
        let reported: i64 = report.parse().map_err(|_| {
            BoshError::Protocol(format!("could not parse 'report' attribute: {report:?}"))
        })?;
        let time = resp.attribute(attr::TIME).unwrap_or("?");
        tracing::debug!(rid = reported, time, "received report of missing request");

        match self
            .pending_request_acks
            .iter()
            .find(|pending| pending.rid() == Some(reported))
        {
            Some(request) => Ok(Some(request.clone())),
            None => Err(BoshError::Protocol(format!(
                "report of missing request with RID '{reported}' but no local copy of that request"
            ))),
        }
    }

    pub fn response_ack(&self) -> i64 {
        self.response_ack
    }

    /// Requests sent but not yet acknowledged, in send order.
    pub fn pending_requests(&self) -> &[Body] {
        &self.pending_request_acks
    }

    pub fn has_pending_requests(&self) -> bool {
        !self.pending_request_acks.is_empty()
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending_request_acks.len()
    }

    /// Discard all state.  Only disposal calls this.
    pub fn clear(&mut self) {
        self.pending_request_acks.clear();
        self.pending_response_acks.clear();
        self.response_ack = NO_RESPONSE_ACK;
    }

    #[cfg(test)]
    fn pending_response_rids(&self) -> Vec<i64> {
        self.pending_response_acks.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(rid: i64) -> Body {
        Body::builder().attribute(attr::RID, rid.to_string()).build()
    }

    fn response() -> Body {
        Body::empty()
    }

    fn response_with_ack(ack: i64) -> Body {
        Body::builder().attribute(attr::ACK, ack.to_string()).build()
    }

    #[test]
    fn explicit_ack_removes_covered_requests() {
        let mut acks = AckTracker::new();
        for rid in 100..103 {
            acks.record_send(request(rid));
        }

        acks.apply_response_ack(&request(102), &response_with_ack(101));
        let remaining: Vec<_> = acks.pending_requests().iter().map(|b| b.rid()).collect();
        assert_eq!(remaining, vec![Some(102)]);
    }

    #[test]
    fn implicit_ack_covers_up_to_request_rid() {
        let mut acks = AckTracker::new();
        acks.record_send(request(100));
        acks.record_send(request(101));

        acks.apply_response_ack(&request(100), &response());
        let remaining: Vec<_> = acks.pending_requests().iter().map(|b| b.rid()).collect();
        assert_eq!(remaining, vec![Some(101)]);
    }

    #[test]
    fn ack_beyond_request_rid_is_clamped() {
        let mut acks = AckTracker::new();
        acks.record_send(request(100));
        acks.record_send(request(101));

        // ack=101 on the response to request 100 only covers RID <= 100
        acks.apply_response_ack(&request(100), &response_with_ack(101));
        let remaining: Vec<_> = acks.pending_requests().iter().map(|b| b.rid()).collect();
        assert_eq!(remaining, vec![Some(101)]);
    }

    #[test]
    fn report_blocks_ack_processing() {
        let mut acks = AckTracker::new();
        acks.record_send(request(100));

        let resp = Body::builder()
            .attribute(attr::REPORT, "100")
            .attribute(attr::TIME, "1500")
            .build();
        acks.apply_response_ack(&request(100), &resp);
        assert_eq!(acks.pending_request_count(), 1);
    }

    #[test]
    fn first_response_seeds_high_water_mark() {
        let mut acks = AckTracker::new();
        assert_eq!(acks.response_ack(), -1);
        acks.record_response_rid(&request(5));
        assert_eq!(acks.response_ack(), 5);
    }

    #[test]
    fn gap_is_held_until_filled() {
        let mut acks = AckTracker::new();
        acks.record_response_rid(&request(5));
        acks.record_response_rid(&request(7));
        assert_eq!(acks.response_ack(), 5);
        assert_eq!(acks.pending_response_rids(), vec![7]);

        acks.record_response_rid(&request(6));
        assert_eq!(acks.response_ack(), 7);
        assert!(acks.pending_response_rids().is_empty());
    }

    #[test]
    fn ack_attribute_rules() {
        let mut acks = AckTracker::new();
        // Nothing received yet: omit.
        assert_eq!(acks.ack_attribute_for(10), None);

        acks.record_response_rid(&request(9));
        // Implicit ack: the previous RID is fully acknowledged.
        assert_eq!(acks.ack_attribute_for(10), None);
        // Out-of-step RID must carry the explicit ack.
        assert_eq!(acks.ack_attribute_for(12), Some(9));
    }

    #[test]
    fn report_lookup_returns_pending_copy() {
        let mut acks = AckTracker::new();
        for rid in [10, 11, 12] {
            acks.record_send(request(rid));
        }

        let resp = Body::builder()
            .attribute(attr::REPORT, "11")
            .attribute(attr::TIME, "1500")
            .build();
        let found = acks.lookup_report(&resp).unwrap().unwrap();
        assert_eq!(found.rid(), Some(11));
        // Lookup does not remove the copy; only an ack does.
        assert_eq!(acks.pending_request_count(), 3);
    }

    #[test]
    fn report_of_unknown_rid_is_protocol_violation() {
        let acks = AckTracker::new();
        let resp = Body::builder()
            .attribute(attr::REPORT, "99")
            .attribute(attr::TIME, "1500")
            .build();
        assert!(matches!(
            acks.lookup_report(&resp),
            Err(BoshError::Protocol(_))
        ));
    }

    #[test]
    fn no_report_attribute_is_no_report() {
        let acks = AckTracker::new();
        assert!(acks.lookup_report(&response()).unwrap().is_none());
    }
}
