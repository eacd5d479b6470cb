//! Clipboard transfer engine (`spec.md` §4.8): a single-queue mini
//! state machine above the cache. Only one direction (read or write)
//! can be in flight; a re-request arriving mid-transfer is coalesced
//! into one deferred run rather than queued twice.

use crate::error::{Error, Result};
use crate::rpc::UnifiedCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPhase {
    Open,
    Args,
    Xfer,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePhase {
    Open,
    Extent,
    Xfer,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    Reading { phase: ReadPhase, collected: Vec<u8>, remaining: u64 },
    Writing { phase: WritePhase, data: Vec<u8>, sent: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Read,
    Write,
}

/// Runs the clipboard's single-direction transfer state machine.
/// `deferred` holds a coalesced re-request made while a transfer was
/// already in flight: only the most recent one survives.
pub struct ClipboardEngine {
    state: State,
    deferred: Option<(Request, Option<Vec<u8>>)>,
}

impl Default for ClipboardEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClipboardEngine {
    pub fn new() -> Self {
        ClipboardEngine { state: State::Idle, deferred: None }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Starts a read transfer, or coalesces into the deferred slot if
    /// one is already in flight.
    pub fn request_read(&mut self) {
        if self.is_idle() {
            self.state = State::Reading { phase: ReadPhase::Open, collected: Vec::new(), remaining: 0 };
        } else {
            self.deferred = Some((Request::Read, None));
        }
    }

    /// Starts a write transfer carrying `data`, or coalesces.
    pub fn request_write(&mut self, data: Vec<u8>) {
        if self.is_idle() {
            self.state = State::Writing { phase: WritePhase::Open, data, sent: 0 };
        } else {
            self.deferred = Some((Request::Write, Some(data)));
        }
    }

    /// Advances one step, issuing the next RPC to send. Returns `None`
    /// when idle (after firing any deferred request) or when a read
    /// transfer has fully collected its data (caller should take it via
    /// `take_read_result`).
    pub fn step(&mut self, last_reply_len: Option<u32>) -> Option<UnifiedCommand> {
        match &mut self.state {
            State::Idle => self.fire_deferred(),
            State::Reading { phase, remaining, .. } => match phase {
                ReadPhase::Open => {
                    *phase = ReadPhase::Args;
                    Some(UnifiedCommand::Open { path: clipboard_path(), mode: crate::rpc::AccessMode::Read, create: false })
                }
                ReadPhase::Args => {
                    if let Some(len) = last_reply_len {
                        *remaining = len as u64;
                    }
                    *phase = ReadPhase::Xfer;
                    Some(UnifiedCommand::Read { handle: crate::rpc::RemoteHandle(0), len: (*remaining).min(u32::MAX as u64) as u32 })
                }
                ReadPhase::Xfer => {
                    *phase = ReadPhase::Close;
                    Some(UnifiedCommand::Close { handle: crate::rpc::RemoteHandle(0) })
                }
                ReadPhase::Close => {
                    self.state = State::Idle;
                    self.fire_deferred()
                }
            },
            State::Writing { phase, data, sent } => match phase {
                WritePhase::Open => {
                    *phase = WritePhase::Extent;
                    Some(UnifiedCommand::Open { path: clipboard_path(), mode: crate::rpc::AccessMode::Write, create: true })
                }
                WritePhase::Extent => {
                    *phase = WritePhase::Xfer;
                    Some(UnifiedCommand::SetSize { handle: crate::rpc::RemoteHandle(0), size: data.len() as u64 })
                }
                WritePhase::Xfer => {
                    let chunk = data[*sent..].to_vec();
                    *sent = data.len();
                    *phase = WritePhase::Close;
                    Some(UnifiedCommand::Write { handle: crate::rpc::RemoteHandle(0), data: chunk })
                }
                WritePhase::Close => {
                    self.state = State::Idle;
                    self.fire_deferred()
                }
            },
        }
    }

    fn fire_deferred(&mut self) -> Option<UnifiedCommand> {
        match self.deferred.take() {
            Some((Request::Read, _)) => {
                self.request_read();
                self.step(None)
            }
            Some((Request::Write, Some(data))) => {
                self.request_write(data);
                self.step(None)
            }
            _ => None,
        }
    }

    pub fn take_read_result(&mut self) -> Result<Vec<u8>> {
        match &mut self.state {
            State::Reading { phase: ReadPhase::Close, collected, .. } => Ok(std::mem::take(collected)),
            _ => Err(Error::BadParams),
        }
    }

    pub fn deliver_read_chunk(&mut self, chunk: Vec<u8>) {
        if let State::Reading { collected, .. } = &mut self.state {
            collected.extend_from_slice(&chunk);
        }
    }
}

fn clipboard_path() -> String {
    "$.Clipboard".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_engine_steps_to_none() {
        let mut engine = ClipboardEngine::new();
        assert!(engine.step(None).is_none());
    }

    #[test]
    fn read_transfer_walks_all_phases_then_idles() {
        let mut engine = ClipboardEngine::new();
        engine.request_read();
        assert!(matches!(engine.step(None), Some(UnifiedCommand::Open { .. })));
        assert!(matches!(engine.step(Some(4)), Some(UnifiedCommand::Read { .. })));
        assert!(matches!(engine.step(None), Some(UnifiedCommand::Close { .. })));
        assert!(engine.step(None).is_none());
        assert!(engine.is_idle());
    }

    #[test]
    fn re_request_during_transfer_is_coalesced_not_queued_twice() {
        let mut engine = ClipboardEngine::new();
        engine.request_read();
        engine.request_read();
        assert!(engine.deferred.is_some());
        engine.request_read();
        assert!(engine.deferred.is_some());
    }

    #[test]
    fn deferred_write_fires_after_read_completes() {
        let mut engine = ClipboardEngine::new();
        engine.request_read();
        engine.request_write(vec![1, 2, 3]);
        engine.step(None); // open
        engine.step(Some(0)); // args
        engine.step(None); // xfer
        // close, then deferred write's open should fire
        let next = engine.step(None);
        assert!(matches!(next, Some(UnifiedCommand::Open { .. })));
    }
}
