//! Single-instance facts (`spec.md` §3): machine type/name/unique-id/
//! language/version, owner string, power status, and the one-shot
//! time-sync flag pair. Each gets its own validity/required state so
//! the refresher (`refresher.rs`) can prioritize it like any cache node,
//! without needing a tree of its own.

use crate::cache::Tick;
use crate::rpc::{MachineInfoReply, PowerReply};

#[derive(Debug, Clone, Default)]
pub struct MachineFacts {
    pub machine: Option<MachineInfoReply>,
    pub machine_valid: bool,
    pub machine_required: bool,
    pub machine_refresh_deadline: Tick,

    pub owner: Option<String>,
    pub owner_valid: bool,
    pub owner_required: bool,
    pub owner_refresh_deadline: Tick,

    pub power: Option<PowerReply>,
    pub power_valid: bool,
    pub power_required: bool,
    pub power_refresh_deadline: Tick,

    /// One-shot: set by a caller that wants the clocks synchronised,
    /// cleared only by constructing a fresh request.
    pub sync_requested: bool,
    pub sync_done: bool,
}

impl MachineFacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_sync(&mut self) {
        self.sync_requested = true;
        self.sync_done = false;
    }

    pub fn apply_machine_info(&mut self, info: MachineInfoReply, now: Tick, timeout_ms: Tick) {
        self.machine = Some(info);
        self.machine_valid = true;
        self.machine_required = false;
        self.machine_refresh_deadline = now + timeout_ms;
    }

    pub fn apply_owner(&mut self, owner: String, now: Tick, timeout_ms: Tick) {
        self.owner = Some(owner);
        self.owner_valid = true;
        self.owner_required = false;
        self.owner_refresh_deadline = now + timeout_ms;
    }

    pub fn apply_power(&mut self, power: PowerReply, now: Tick, timeout_ms: Tick) {
        self.power = Some(power);
        self.power_valid = true;
        self.power_required = false;
        self.power_refresh_deadline = now + timeout_ms;
    }

    pub fn apply_time_sync_done(&mut self) {
        self.sync_done = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_sync_resets_done_flag() {
        let mut facts = MachineFacts::new();
        facts.apply_time_sync_done();
        facts.request_sync();
        assert!(facts.sync_requested);
        assert!(!facts.sync_done);
    }
}
