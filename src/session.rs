//! `Session` (`spec.md` §5, §6): the single cooperative driver that owns
//! every piece of mutable state and is the one entry point
//! (`poll()`) through which the transport, cache, pending-op queue and
//! refresher are ever advanced.
//!
//! No two `step()` calls on the pending-op queue are ever concurrent;
//! `poll()` enforces this with a re-entrance guard rather than relying
//! on callers to behave, since a callback fired from `poll()` is client
//! code and may try to enqueue or poll again on the same stack frame.

use crate::arena::Arena;
use crate::cache::{CacheTree, Tick};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::machine::MachineFacts;
use crate::pending_op::{OpKind, OpenFile, PendingOutput, Queue, StepContext};
use crate::refresher::Refresher;
use crate::rpc::{DeviceGeneration, UnifiedCommand, UnifiedReply};
use crate::transport::{Transport, TransportEvent};

/// Diagnostic snapshot returned by `status()`: not part of the wire
/// protocol, just a dump for the embedding application's own UI.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub generation: Option<DeviceGeneration>,
    pub queue_len: usize,
    pub link_broken: bool,
}

pub struct Session<T: Transport> {
    transport: T,
    cache: CacheTree,
    files: Arena<OpenFile>,
    queue: Queue,
    refresher: Refresher,
    machine_facts: MachineFacts,
    config: Config,
    generation: Option<DeviceGeneration>,
    outstanding: Option<UnifiedCommand>,
    link_broken: bool,
    polling: bool,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, config: Config) -> Self {
        Session {
            transport,
            cache: CacheTree::new(),
            files: Arena::new(),
            queue: Queue::new(),
            refresher: Refresher::new(),
            machine_facts: MachineFacts::new(),
            config,
            generation: None,
            outstanding: None,
            link_broken: false,
            polling: false,
        }
    }

    /// Negotiates the device generation and clears any prior
    /// `LinkBroken` state (`spec.md` §6).
    pub fn start(&mut self, generation: DeviceGeneration) {
        self.generation = Some(generation);
        self.link_broken = false;
        self.outstanding = None;
        self.transport.reconnect();
    }

    /// Ends the session. `now=true` aborts every in-flight and queued
    /// op immediately with `Error::LinkClosed`; `now=false` lets the
    /// queue drain naturally on subsequent `poll()` calls before the
    /// caller drops the session.
    pub fn end(&mut self, now: bool) {
        if now {
            self.queue.abort_all();
            self.outstanding = None;
        }
        self.generation = None;
    }

    pub fn enqueue(&mut self, kind: OpKind, callback: Box<dyn FnOnce(Result<PendingOutput>) + Send>) -> u64 {
        self.queue.enqueue(kind, callback)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus { generation: self.generation, queue_len: self.queue.len(), link_broken: self.link_broken }
    }

    pub fn machine_facts(&self) -> &MachineFacts {
        &self.machine_facts
    }

    pub fn request_time_sync(&mut self) {
        self.machine_facts.request_sync();
    }

    /// The single driving entry point. `now` is the caller's monotonic
    /// clock reading; `idle_hint` reports whether the host considers
    /// itself idle (feeds the refresher's step throttle).
    ///
    /// Re-entrant calls (from a callback fired by this same call) are a
    /// no-op: the outer call's loop will pick up any newly enqueued work
    /// on its own next iteration.
    pub fn poll(&mut self, now: Tick, idle_hint: bool) {
        if self.polling {
            return;
        }
        self.polling = true;
        let result = self.poll_inner(now, idle_hint);
        self.polling = false;
        if let Err(_e) = result {
            tracing::debug!("poll: transport link broken");
        }
    }

    fn poll_inner(&mut self, now: Tick, idle_hint: bool) -> Result<()> {
        if self.link_broken {
            // `spec.md` §7: once the transport has reported `LinkBroken`,
            // the link stays down until `start()` is called again. Any op
            // enqueued in the meantime is failed rather than left to rot
            // at the head of an unserviced queue.
            self.queue.abort_all_with(Error::LinkBroken);
            return Err(Error::LinkBroken);
        }

        let reply = self.collect_transport_reply()?;

        if self.link_broken {
            // The reply just collected was the break itself: the cache
            // layer never swallows it, it marks every node invalid and
            // fails every pending op, not just the one in flight
            // (`spec.md` §7).
            self.cache.invalidate_all();
            self.queue.abort_all_with(Error::LinkBroken);
            return Err(Error::LinkBroken);
        }

        self.drive_queue(reply)?;

        if self.outstanding.is_none() && self.transport.is_idle() {
            self.refresher.note_queue_state(now, !self.queue.is_empty());
            let generation = self.generation.unwrap_or(DeviceGeneration::Series5);
            if let Some((_source, cmd)) =
                self.refresher.select(&self.cache, &self.machine_facts, now, idle_hint, &self.config)
            {
                if generation.supports(cmd.op_code()) {
                    self.issue(cmd)?;
                    self.refresher.note_rpc_issued(now);
                }
            }
        }
        Ok(())
    }

    fn collect_transport_reply(&mut self) -> Result<Option<Result<UnifiedReply>>> {
        let Some(event) = self.transport.poll() else { return Ok(None) };
        let Some(cmd) = self.outstanding.take() else { return Ok(None) };
        Ok(Some(match event {
            TransportEvent::Reply(payload) => cmd.decode_reply(&payload),
            TransportEvent::Timeout => Err(Error::Timeout),
            TransportEvent::LinkBroken => {
                self.link_broken = true;
                Err(Error::LinkBroken)
            }
            TransportEvent::RemoteError(code) => Err(crate::rpc::translate_remote_error(code)),
        }))
    }

    fn drive_queue(&mut self, reply: Option<Result<UnifiedReply>>) -> Result<()> {
        if self.outstanding.is_some() {
            // A reply is still pending; nothing new can be issued until
            // `collect_transport_reply` resolves it on a later poll.
            return Ok(());
        }
        let mut ctx = StepContext { cache: &mut self.cache, files: &mut self.files, config: &self.config };
        let Some(cmd) = self.queue.drive(&mut ctx, reply) else { return Ok(()) };
        self.issue(cmd)
    }

    fn issue(&mut self, cmd: UnifiedCommand) -> Result<()> {
        let generation = self.generation.unwrap_or(DeviceGeneration::Series5);
        let frame = cmd.encode(generation)?;
        self.transport.send(frame)?;
        self.outstanding = Some(cmd);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use crate::wire::{write_counted_string, write_u32, write_u64, write_u8};
    use std::sync::mpsc;

    #[test]
    fn drive_info_round_trips_through_poll() {
        let mut session = Session::new(MockTransport::new(), Config::default());
        session.start(DeviceGeneration::Series5);

        let (tx, rx) = mpsc::channel();
        session.enqueue(OpKind::DriveInfo { drive: b'C' }, Box::new(move |r| {
            let _ = tx.send(r);
        }));

        session.poll(0, false);
        assert!(session.outstanding.is_some());

        let mut payload = Vec::new();
        write_u8(&mut payload, 1).unwrap();
        write_u8(&mut payload, 0).unwrap();
        write_counted_string(&mut payload, "Internal").unwrap();
        write_u64(&mut payload, 1000).unwrap();
        write_u64(&mut payload, 500).unwrap();
        write_u32(&mut payload, 7).unwrap();
        session.transport.queue_reply(payload);
        session.transport.advance();

        session.poll(1, false);
        let result = rx.try_recv().unwrap();
        assert!(matches!(result, Ok(PendingOutput::DriveInfo(info)) if info.unique_id == 7));
        assert!(session.outstanding.is_none());
    }

    #[test]
    fn end_now_aborts_queued_ops_with_link_closed() {
        let mut session = Session::new(MockTransport::new(), Config::default());
        session.start(DeviceGeneration::Series5);

        let (tx, rx) = mpsc::channel();
        session.enqueue(OpKind::DriveInfo { drive: b'C' }, Box::new(move |r| {
            let _ = tx.send(r);
        }));
        session.end(true);
        assert_eq!(rx.try_recv().unwrap(), Err(Error::LinkClosed));
    }

    /// Literal scenario: during a `Write` (well, here a `DriveInfo`, which
    /// exercises the same suspend-on-outstanding-RPC path), the transport
    /// reports `LinkBroken`; the in-flight and queued ops both get the
    /// error, every drive invalidates, and subsequent ops keep failing
    /// until `start()` runs again.
    #[test]
    fn link_broken_invalidates_cache_and_fails_all_pending_ops() {
        let mut session = Session::new(MockTransport::new(), Config::default());
        session.start(DeviceGeneration::Series5);
        session.cache.ensure_drive(b'C');
        let root = session.cache.drive(b'C').unwrap().root;
        session.cache.apply_enumerate(root, vec![]);
        assert!(session.cache.node(root).unwrap().valid);

        let (tx1, rx1) = mpsc::channel();
        session.enqueue(OpKind::DriveInfo { drive: b'C' }, Box::new(move |r| {
            let _ = tx1.send(r);
        }));
        session.poll(0, false);
        assert!(session.outstanding.is_some());

        let (tx2, rx2) = mpsc::channel();
        session.enqueue(OpKind::DriveInfo { drive: b'D' }, Box::new(move |r| {
            let _ = tx2.send(r);
        }));

        session.transport.break_link();
        session.poll(1, false);

        assert_eq!(rx1.try_recv().unwrap(), Err(Error::LinkBroken));
        assert_eq!(rx2.try_recv().unwrap(), Err(Error::LinkBroken));
        assert!(!session.cache.node(root).unwrap().valid);
        assert!(session.status().link_broken);

        // Subsequent ops keep failing until `start()` is called again.
        let (tx3, rx3) = mpsc::channel();
        session.enqueue(OpKind::DriveInfo { drive: b'C' }, Box::new(move |r| {
            let _ = tx3.send(r);
        }));
        session.poll(2, false);
        assert_eq!(rx3.try_recv().unwrap(), Err(Error::LinkBroken));

        session.start(DeviceGeneration::Series5);
        assert!(!session.status().link_broken);
    }

    #[test]
    fn reentrant_poll_from_callback_is_a_no_op() {
        let mut session = Session::new(MockTransport::new(), Config::default());
        session.start(DeviceGeneration::Series5);
        // A callback cannot actually re-borrow `session` in this test
        // harness (it would not compile), so this only exercises the
        // guard flag directly: a second `poll()` while one is logically
        // in flight must return immediately without touching state.
        session.polling = true;
        let before = session.queue.len();
        session.poll(0, false);
        assert_eq!(session.queue.len(), before);
        session.polling = false;
    }
}
