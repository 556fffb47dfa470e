//! Correlation of requests with their acks.
//!
//! The tracker owns the map of in-flight requests for one connection. Each
//! entry holds the encoded frame (for retransmission under the same id), a
//! deadline, and a one-shot slot that receives exactly one outcome: the ack,
//! a timeout, connection loss, or cancellation. Whoever takes the slot out of
//! the entry delivers the outcome, and the map lock serializes them.
//!
//! A delivered ack leaves its issue stamp leased until the caller calls
//! [`CorrelationTracker::release`], so [`CorrelationTracker::stamp_horizon`]
//! stays at or below every stamp a cache write may still carry.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{Stamp, StampClock};
use crate::codec::{Body, Message};
use crate::error::{LookupError, Result};
use crate::protocol::{registry, OpCode, PUSH_REQUEST_ID};
use crate::writer::OutboundFrame;

/// Receives the single outcome of a request.
pub type ResponseReceiver = oneshot::Receiver<Result<Message>>;

/// Timeout and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Time to wait for an ack before retrying or timing out.
    pub request_timeout: Duration,
    /// Retransmissions before the request fails with a timeout.
    pub max_retries: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            max_retries: 2,
        }
    }
}

/// A request accepted by the tracker.
#[derive(Debug)]
pub struct Submitted {
    pub request_id: u64,
    /// Stamp under which the answer may be cached.
    pub issued: Stamp,
    /// Frame to hand to the writer.
    pub frame: OutboundFrame,
    pub response: ResponseReceiver,
}

/// What [`CorrelationTracker::complete`] did with an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The waiting caller received the ack.
    Delivered,
    /// The request had been cancelled; the ack was dropped.
    Discarded,
    /// No request with this id is in flight.
    Unknown,
}

/// Result of one timeout sweep.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Requests to retransmit, with their unchanged ids.
    pub retried: Vec<(u64, OutboundFrame)>,
    /// Requests that failed with a timeout.
    pub timed_out: Vec<u64>,
}

struct PendingRequest {
    op: OpCode,
    frame: OutboundFrame,
    issued: Stamp,
    deadline: Instant,
    retries: u32,
    /// Taken when the outcome is delivered; `None` once cancelled.
    slot: Option<oneshot::Sender<Result<Message>>>,
}

struct TrackerState {
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
    /// Issue stamps of delivered acks whose cache write has not finished.
    leased: BTreeSet<Stamp>,
}

/// Pending-request map for one connection.
pub struct CorrelationTracker {
    config: TrackerConfig,
    clock: Arc<StampClock>,
    state: Mutex<TrackerState>,
}

impl CorrelationTracker {
    /// Create a tracker stamping requests from `clock`.
    pub fn new(config: TrackerConfig, clock: Arc<StampClock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(TrackerState {
                next_id: 1,
                pending: HashMap::new(),
                leased: BTreeSet::new(),
            }),
        }
    }

    /// Register a request under a freshly allocated id.
    ///
    /// Ids come from a wrapping counter that skips 0 and every id still in
    /// flight. The issue stamp is taken under the map lock.
    pub fn submit(&self, body: Body) -> Result<Submitted> {
        let op = request_op(&body)?;
        let mut state = self.state.lock();

        let mut candidate = None;
        for _ in 0..=state.pending.len() {
            let id = state.next_id;
            state.next_id = match state.next_id.wrapping_add(1) {
                PUSH_REQUEST_ID => 1,
                next => next,
            };
            if !state.pending.contains_key(&id) {
                candidate = Some(id);
                break;
            }
        }
        let id = candidate.ok_or(LookupError::RequestIdsExhausted)?;

        self.insert(&mut state, id, op, body)
    }

    /// Register a request under a caller-chosen id.
    ///
    /// # Errors
    ///
    /// [`LookupError::DuplicateRequestId`] if the id is still in flight,
    /// including a cancelled request whose ack has not arrived yet.
    pub fn submit_with_id(&self, request_id: u64, body: Body) -> Result<Submitted> {
        let op = request_op(&body)?;
        if request_id == PUSH_REQUEST_ID {
            return Err(LookupError::DuplicateRequestId(request_id));
        }

        let mut state = self.state.lock();
        if state.pending.contains_key(&request_id) {
            return Err(LookupError::DuplicateRequestId(request_id));
        }

        self.insert(&mut state, request_id, op, body)
    }

    fn insert(
        &self,
        state: &mut TrackerState,
        request_id: u64,
        op: OpCode,
        body: Body,
    ) -> Result<Submitted> {
        let frame = OutboundFrame::from_message(&Message::request(request_id, body))?;
        let (tx, rx) = oneshot::channel();
        let issued = self.clock.next();

        state.pending.insert(
            request_id,
            PendingRequest {
                op,
                frame: frame.clone(),
                issued,
                deadline: Instant::now() + self.config.request_timeout,
                retries: 0,
                slot: Some(tx),
            },
        );

        Ok(Submitted {
            request_id,
            issued,
            frame,
            response: rx,
        })
    }

    /// Route an ack to its request.
    ///
    /// # Errors
    ///
    /// A malformed-input error if the ack's operation does not answer the
    /// request registered under its id. The entry stays in flight so the
    /// connection teardown can fail it.
    pub fn complete(&self, ack: Message) -> Result<Completion> {
        let mut state = self.state.lock();
        let request_id = ack.request_id;

        let request_op = match state.pending.get(&request_id) {
            Some(entry) => entry.op,
            None => {
                warn!(request_id, op = ?ack.op(), "ack for unknown request id, discarding");
                return Ok(Completion::Unknown);
            }
        };

        if !registry::answers(ack.op(), request_op) {
            return Err(LookupError::malformed(format!(
                "request {} ({:?}) answered with {:?}",
                request_id,
                request_op,
                ack.op()
            )));
        }

        let mut entry = match state.pending.remove(&request_id) {
            Some(entry) => entry,
            None => return Ok(Completion::Unknown),
        };
        if entry.slot.is_some() {
            state.leased.insert(entry.issued);
        }
        drop(state);

        match entry.slot.take() {
            Some(slot) => {
                if slot.send(Ok(ack)).is_err() {
                    // The caller went away without cancelling.
                    self.release(entry.issued);
                }
                Ok(Completion::Delivered)
            }
            None => {
                debug!(request_id, "late ack for cancelled request discarded");
                Ok(Completion::Discarded)
            }
        }
    }

    /// Abandon a request.
    ///
    /// The caller's slot receives [`LookupError::Cancelled`] if it is still
    /// waiting. The id stays reserved until the ack arrives or the deadline
    /// passes, so a late ack is discarded instead of reaching a new request.
    /// Returns `false` if no undelivered request has this id.
    pub fn cancel(&self, request_id: u64) -> bool {
        let slot = {
            let mut state = self.state.lock();
            match state.pending.get_mut(&request_id) {
                Some(entry) => entry.slot.take(),
                None => None,
            }
        };

        match slot {
            Some(slot) => {
                let _ = slot.send(Err(LookupError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Forget a request without notifying its caller.
    ///
    /// Used when the request never reached the wire.
    pub fn discard(&self, request_id: u64) -> bool {
        self.state.lock().pending.remove(&request_id).is_some()
    }

    /// Sweep expired deadlines.
    ///
    /// Expired requests with retries left are rearmed and returned for
    /// retransmission under the same id. The rest receive
    /// [`LookupError::Timeout`]. Expired cancelled requests are forgotten.
    pub fn tick(&self, now: Instant) -> TickReport {
        let mut report = TickReport::default();
        let mut expired = Vec::new();

        {
            let mut state = self.state.lock();
            let timeout = self.config.request_timeout;
            let max_retries = self.config.max_retries;

            state.pending.retain(|&id, entry| {
                if entry.deadline > now {
                    return true;
                }
                match entry.slot.take() {
                    None => false,
                    Some(slot) if entry.retries < max_retries => {
                        entry.retries += 1;
                        entry.deadline = now + timeout;
                        entry.slot = Some(slot);
                        report.retried.push((id, entry.frame.clone()));
                        true
                    }
                    Some(slot) => {
                        expired.push((id, slot));
                        false
                    }
                }
            });
        }

        for (request_id, slot) in expired {
            let _ = slot.send(Err(LookupError::Timeout { request_id }));
            report.timed_out.push(request_id);
        }

        report
    }

    /// Fail every in-flight request and clear the map.
    ///
    /// Returns the number of callers that were notified.
    pub fn fail_all(&self, error: impl Fn() -> LookupError) -> usize {
        let drained: Vec<_> = self.state.lock().pending.drain().collect();

        let mut notified = 0;
        for (_, mut entry) in drained {
            if let Some(slot) = entry.slot.take() {
                let _ = slot.send(Err(error()));
                notified += 1;
            }
        }
        notified
    }

    /// Oldest stamp an in-flight or future request can carry.
    ///
    /// Cache bookkeeping older than this can no longer affect a write made on
    /// behalf of this tracker.
    pub fn stamp_horizon(&self) -> Stamp {
        let state = self.state.lock();
        let pending = state.pending.values().map(|e| e.issued).min();
        let leased = state.leased.first().copied();
        match (pending, leased) {
            (Some(a), Some(b)) => a.min(b),
            (Some(s), None) | (None, Some(s)) => s,
            (None, None) => self.clock.current(),
        }
    }

    /// The caller is done writing the answer issued under `issued`.
    ///
    /// Releasing a stamp that holds no lease does nothing.
    pub fn release(&self, issued: Stamp) {
        self.state.lock().leased.remove(&issued);
    }

    /// Number of ids currently reserved, cancelled ones included.
    pub fn in_flight(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether `request_id` is reserved.
    pub fn is_pending(&self, request_id: u64) -> bool {
        self.state.lock().pending.contains_key(&request_id)
    }
}

impl Default for CorrelationTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default(), Arc::new(StampClock::new()))
    }
}

fn request_op(body: &Body) -> Result<OpCode> {
    let op = body.op();
    match (registry::ack_for(op), body) {
        (Some(_), Body::Nack(_)) | (None, _) => Err(LookupError::NotARequest(op)),
        (Some(_), _) => Ok(op),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{LogRequest, Vl2Request};
    use crate::protocol::{Header, Status};
    use crate::types::{MacAddr, VnetId};

    fn vl2_request() -> Body {
        Body::Vl2Request(Vl2Request {
            vnet: VnetId(7),
            mac: MacAddr::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
        })
    }

    fn vl2_ack(id: u64) -> Message {
        Message::ack(id, Body::Vl2Ack("203.0.113.5:4789".parse().unwrap()))
    }

    fn tracker(timeout_ms: u64, max_retries: u32) -> CorrelationTracker {
        CorrelationTracker::new(
            TrackerConfig {
                request_timeout: Duration::from_millis(timeout_ms),
                max_retries,
            },
            Arc::new(StampClock::new()),
        )
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let tracker = CorrelationTracker::default();
        let submitted = tracker.submit(vl2_request()).unwrap();

        assert_eq!(submitted.request_id, 1);
        let header = Header::decode(&submitted.frame.header).unwrap();
        assert_eq!(header.request_id, 1);
        assert_eq!(header.op, OpCode::Vl2Request.as_u8());

        let outcome = tracker.complete(vl2_ack(1)).unwrap();
        assert_eq!(outcome, Completion::Delivered);
        assert_eq!(submitted.response.await.unwrap().unwrap(), vl2_ack(1));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_acks_matched_by_id_not_order() {
        let tracker = CorrelationTracker::default();
        let first = tracker.submit(vl2_request()).unwrap();
        let second = tracker.submit(vl2_request()).unwrap();

        tracker.complete(vl2_ack(second.request_id)).unwrap();
        tracker.complete(vl2_ack(first.request_id)).unwrap();

        assert_eq!(first.response.await.unwrap().unwrap().request_id, 1);
        assert_eq!(second.response.await.unwrap().unwrap().request_id, 2);
    }

    #[test]
    fn test_duplicate_in_flight_id_rejected() {
        let tracker = CorrelationTracker::default();
        let _first = tracker.submit_with_id(1, vl2_request()).unwrap();

        let err = tracker.submit_with_id(1, vl2_request()).unwrap_err();
        assert!(matches!(err, LookupError::DuplicateRequestId(1)));
    }

    #[test]
    fn test_id_reusable_after_completion() {
        let tracker = CorrelationTracker::default();
        let _first = tracker.submit_with_id(1, vl2_request()).unwrap();
        tracker.complete(vl2_ack(1)).unwrap();

        assert!(tracker.submit_with_id(1, vl2_request()).is_ok());
    }

    #[test]
    fn test_allocation_skips_in_flight_ids_and_zero() {
        let tracker = CorrelationTracker::default();
        let _held = tracker.submit_with_id(2, vl2_request()).unwrap();

        let a = tracker.submit(vl2_request()).unwrap();
        let b = tracker.submit(vl2_request()).unwrap();
        assert_eq!(a.request_id, 1);
        assert_eq!(b.request_id, 3);

        tracker.state.lock().next_id = u64::MAX;
        let c = tracker.submit(vl2_request()).unwrap();
        let d = tracker.submit(vl2_request()).unwrap();
        assert_eq!(c.request_id, u64::MAX);
        // Wraps past 0, 1, 2 and 3 which are reserved or invalid.
        assert_eq!(d.request_id, 4);
    }

    #[test]
    fn test_push_bodies_cannot_be_submitted() {
        let tracker = CorrelationTracker::default();
        let err = tracker.submit(Body::Pong).unwrap_err();
        assert!(matches!(err, LookupError::NotARequest(OpCode::Pong)));

        let err = tracker
            .submit(Body::Nack(OpCode::Vl2Request))
            .unwrap_err();
        assert!(matches!(err, LookupError::NotARequest(_)));
    }

    #[test]
    fn test_mismatched_ack_is_malformed() {
        let tracker = CorrelationTracker::default();
        let submitted = tracker
            .submit(Body::LogRequest(LogRequest {
                vnet: VnetId(7),
                from_seq: 1,
            }))
            .unwrap();

        let err = tracker.complete(vl2_ack(submitted.request_id)).unwrap_err();
        assert!(err.is_malformed());
        assert!(tracker.is_pending(submitted.request_id));
    }

    #[test]
    fn test_unknown_ack_discarded() {
        let tracker = CorrelationTracker::default();
        assert_eq!(tracker.complete(vl2_ack(99)).unwrap(), Completion::Unknown);
    }

    #[tokio::test]
    async fn test_nack_is_delivered() {
        let tracker = CorrelationTracker::default();
        let submitted = tracker.submit(vl2_request()).unwrap();

        let nack = Message::nack(1, OpCode::Vl2Ack, Status::NotFound);
        tracker.complete(nack.clone()).unwrap();

        assert_eq!(submitted.response.await.unwrap().unwrap(), nack);
    }

    #[tokio::test]
    async fn test_retry_then_timeout() {
        let tracker = tracker(100, 2);
        let submitted = tracker.submit(vl2_request()).unwrap();
        let start = Instant::now();

        let report = tracker.tick(start + Duration::from_millis(50));
        assert!(report.retried.is_empty());

        let report = tracker.tick(start + Duration::from_millis(150));
        assert_eq!(report.retried.len(), 1);
        assert_eq!(report.retried[0].0, submitted.request_id);
        assert_eq!(report.retried[0].1, submitted.frame);

        let report = tracker.tick(start + Duration::from_millis(300));
        assert_eq!(report.retried.len(), 1);

        let report = tracker.tick(start + Duration::from_millis(450));
        assert!(report.retried.is_empty());
        assert_eq!(report.timed_out, vec![submitted.request_id]);

        let err = submitted.response.await.unwrap().unwrap_err();
        assert!(matches!(err, LookupError::Timeout { request_id: 1 }));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_ack_after_timeout_is_unknown() {
        let tracker = tracker(10, 0);
        let submitted = tracker.submit(vl2_request()).unwrap();

        let report = tracker.tick(Instant::now() + Duration::from_millis(20));
        assert_eq!(report.timed_out, vec![1]);

        assert_eq!(tracker.complete(vl2_ack(1)).unwrap(), Completion::Unknown);
        assert!(matches!(
            submitted.response.await.unwrap(),
            Err(LookupError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_discards_late_ack() {
        let tracker = CorrelationTracker::default();
        let submitted = tracker.submit(vl2_request()).unwrap();

        assert!(tracker.cancel(1));
        assert!(!tracker.cancel(1));
        assert!(tracker.is_pending(1));

        assert_eq!(tracker.complete(vl2_ack(1)).unwrap(), Completion::Discarded);
        assert!(matches!(
            submitted.response.await.unwrap(),
            Err(LookupError::Cancelled)
        ));
        assert!(!tracker.is_pending(1));
    }

    #[test]
    fn test_cancelled_request_expires_silently() {
        let tracker = tracker(10, 3);
        let _submitted = tracker.submit(vl2_request()).unwrap();
        tracker.cancel(1);

        let report = tracker.tick(Instant::now() + Duration::from_millis(20));
        assert!(report.retried.is_empty());
        assert!(report.timed_out.is_empty());
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let tracker = CorrelationTracker::default();
        let a = tracker.submit(vl2_request()).unwrap();
        let b = tracker.submit(vl2_request()).unwrap();
        tracker.cancel(b.request_id);

        assert_eq!(tracker.fail_all(|| LookupError::ConnectionLost), 1);
        assert_eq!(tracker.in_flight(), 0);
        assert!(matches!(
            a.response.await.unwrap(),
            Err(LookupError::ConnectionLost)
        ));
    }

    #[test]
    fn test_issue_stamps_increase() {
        let tracker = CorrelationTracker::default();
        let a = tracker.submit(vl2_request()).unwrap();
        let b = tracker.submit(vl2_request()).unwrap();
        assert!(b.issued > a.issued);
    }

    #[test]
    fn test_stamp_horizon() {
        let clock = Arc::new(StampClock::new());
        let tracker = CorrelationTracker::new(TrackerConfig::default(), clock.clone());
        assert_eq!(tracker.stamp_horizon(), Stamp(0));

        let a = tracker.submit(vl2_request()).unwrap();
        let _b = tracker.submit(vl2_request()).unwrap();
        clock.next();
        assert_eq!(tracker.stamp_horizon(), a.issued);

        tracker.discard(a.request_id);
        tracker.discard(_b.request_id);
        assert_eq!(tracker.stamp_horizon(), clock.current());
    }

    #[tokio::test]
    async fn test_delivered_answer_keeps_tombstone_until_released() {
        use crate::cache::{MappingCache, MemoryCache};
        use crate::types::{MappingKey, MappingRecord, Vl2Mapping};

        let vnet = VnetId(7);
        let mac = MacAddr::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let underlay = "203.0.113.5:4789".parse().unwrap();
        let clock = Arc::new(StampClock::new());
        let tracker = CorrelationTracker::new(TrackerConfig::default(), clock.clone());
        let cache = MemoryCache::new();

        let sub = tracker.submit(vl2_request()).unwrap();
        assert_eq!(tracker.complete(vl2_ack(sub.request_id)).unwrap(), Completion::Delivered);

        // Shootdown lands between delivery and the caller's cache write.
        cache.invalidate(vnet, MappingKey::Vl2(mac), clock.next());
        let _later = tracker.submit(vl2_request()).unwrap();
        cache.prune(tracker.stamp_horizon());

        let record = MappingRecord::Vl2(Vl2Mapping { mac, underlay });
        assert!(!cache.store(vnet, &record, sub.issued));
        assert_eq!(cache.get_vl2(vnet, mac), None);

        tracker.release(sub.issued);
        assert!(tracker.stamp_horizon() > sub.issued);
    }

    #[test]
    fn test_ack_to_departed_caller_leaves_no_lease() {
        let clock = Arc::new(StampClock::new());
        let tracker = CorrelationTracker::new(TrackerConfig::default(), clock.clone());

        let sub = tracker.submit(vl2_request()).unwrap();
        drop(sub.response);
        tracker.complete(vl2_ack(sub.request_id)).unwrap();

        assert_eq!(tracker.stamp_horizon(), clock.current());
    }

    #[test]
    fn test_oversize_body_not_registered() {
        use crate::codec::BulkRequest;
        use crate::types::Cursor;

        let tracker = CorrelationTracker::default();
        let body = Body::BulkRequest(BulkRequest {
            vnet: VnetId(7),
            cursor: Cursor(bytes::Bytes::from(vec![0u8; 70_000])),
        });

        assert!(matches!(
            tracker.submit(body),
            Err(LookupError::TooLong { what: "cursor", .. })
        ));
        assert_eq!(tracker.in_flight(), 0);
    }
}
