//! The framed request/response channel to a single remote device.
//!
//! Contract (`spec.md` §4.1): at most one outstanding request; replies are
//! delivered in send order (trivially true with a single outstanding
//! request); failures are `LinkBroken` (permanent until reconnect),
//! `Timeout` (cancels the outstanding request) or `RemoteError(code)`.
//!
//! `Transport` is intentionally synchronous and non-blocking: `send` enqueues
//! a frame, `poll` reports whatever became ready since the last call. No
//! async runtime is introduced here — `Session::poll()` drives this the same
//! cooperative way it drives everything else (see §9 / SPEC_FULL.md §0).

use crate::error::Error;

/// One event the transport can report back to the session driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A reply frame for the outstanding request.
    Reply(Vec<u8>),
    Timeout,
    LinkBroken,
    RemoteError(u16),
}

pub trait Transport {
    /// True when there is no outstanding request and the link has not
    /// failed permanently.
    fn is_idle(&self) -> bool;

    /// Sends `frame` as the single outstanding request.
    ///
    /// # Errors
    /// `Error::LinkBroken` if the link has already failed permanently, or
    /// if a request is already outstanding (a queue-driver bug, not a
    /// remote failure — it should never observe this given §5's single
    /// in-flight-RPC discipline).
    fn send(&mut self, frame: Vec<u8>) -> Result<(), Error>;

    /// Reports the next transport event, if any has become available since
    /// the last call. Returns `None` while the outstanding request (if any)
    /// is still pending.
    fn poll(&mut self) -> Option<TransportEvent>;

    /// Resets the transport to a freshly connected state, clearing
    /// `LinkBroken`. Used by `Session::start()`.
    fn reconnect(&mut self);
}

/// In-process fake transport for tests: replies are supplied ahead of time
/// (one per expected `send`), and `poll` only reports them once `advance`
/// has been called, to exercise the driver's suspend/resume path explicitly.
///
/// This is the test-tooling equivalent of the teacher's
/// `server/tests/endpoints.rs`, which stands in for a real remote peer.
#[derive(Default)]
pub struct MockTransport {
    outstanding: Option<Vec<u8>>,
    broken: bool,
    queued_events: std::collections::VecDeque<TransportEvent>,
    pending_event: Option<TransportEvent>,
    pub sent: Vec<Vec<u8>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the event that will be returned for the next outstanding
    /// request once `advance()` releases it.
    pub fn queue_reply(&mut self, payload: Vec<u8>) {
        self.queued_events.push_back(TransportEvent::Reply(payload));
    }

    pub fn queue_event(&mut self, event: TransportEvent) {
        self.queued_events.push_back(event);
    }

    /// Releases the queued event for the current outstanding request, if
    /// any is pending and one has been queued.
    pub fn advance(&mut self) {
        if self.outstanding.is_some() {
            if let Some(event) = self.queued_events.pop_front() {
                self.outstanding = None;
                if matches!(event, TransportEvent::LinkBroken) {
                    self.broken = true;
                }
                self.pending_event = Some(event);
            }
        }
    }

    pub fn break_link(&mut self) {
        self.broken = true;
        self.outstanding = None;
        self.pending_event = Some(TransportEvent::LinkBroken);
    }
}

impl Transport for MockTransport {
    fn is_idle(&self) -> bool {
        !self.broken && self.outstanding.is_none()
    }

    fn send(&mut self, frame: Vec<u8>) -> Result<(), Error> {
        if self.broken {
            return Err(Error::LinkBroken);
        }
        if self.outstanding.is_some() {
            return Err(Error::LinkBroken);
        }
        self.sent.push(frame.clone());
        self.outstanding = Some(frame);
        Ok(())
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        self.pending_event.take()
    }

    fn reconnect(&mut self) {
        self.broken = false;
        self.outstanding = None;
        self.queued_events.clear();
        self.pending_event = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_outstanding_request_at_a_time() {
        let mut t = MockTransport::new();
        t.queue_reply(b"r1".to_vec());
        assert!(t.send(b"req1".to_vec()).is_ok());
        assert!(!t.is_idle());
        assert!(t.send(b"req2".to_vec()).is_err());
        t.advance();
        assert_eq!(t.poll(), Some(TransportEvent::Reply(b"r1".to_vec())));
        assert!(t.is_idle());
    }

    #[test]
    fn link_broken_is_permanent_until_reconnect() {
        let mut t = MockTransport::new();
        t.send(b"req".to_vec()).unwrap();
        t.break_link();
        assert_eq!(t.poll(), Some(TransportEvent::LinkBroken));
        assert!(t.send(b"req2".to_vec()).is_err());
        t.reconnect();
        assert!(t.send(b"req2".to_vec()).is_ok());
    }
}
