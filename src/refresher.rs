//! Background refresher (`spec.md` §4.5): when the pending-op queue is
//! idle, scans every priority source and proposes the single best
//! refresher RPC to issue, if any, subject to busy/step throttles.

use crate::cache::{CacheTree, NodeKey, Priority, Tick};
use crate::config::Config;
use crate::rpc::UnifiedCommand;

/// One thing the refresher can choose to refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    MachineFacts,
    Owner,
    Power,
    TimeSync,
    Drive(u8),
    DirectoryListing(NodeKey),
}

struct Candidate {
    source: Source,
    priority: Priority,
    deadline: Tick,
}

/// Tracks the timing state the throttles in §4.5 need: when the queue
/// was last seen non-empty, and when the previous refresher RPC
/// completed.
#[derive(Default)]
pub struct Refresher {
    queue_last_nonempty: Option<Tick>,
    last_refresher_rpc: Option<Tick>,
}

impl Refresher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_queue_state(&mut self, now: Tick, queue_nonempty: bool) {
        if queue_nonempty {
            self.queue_last_nonempty = Some(now);
        }
    }

    pub fn note_rpc_issued(&mut self, now: Tick) {
        self.last_refresher_rpc = Some(now);
    }

    fn busy_throttle_suppresses(&self, now: Tick, priority: Priority, config: &Config) -> bool {
        let Some(last) = self.queue_last_nonempty else { return false };
        let cooldown = match priority {
            Priority::Refresh => config.refresh_cooldown_ms,
            Priority::Invalid => config.invalid_cooldown_ms,
            _ => return false,
        };
        now.saturating_sub(last) < cooldown
    }

    fn step_throttle_suppresses(&self, now: Tick, priority: Priority, idle_hint: bool, config: &Config) -> bool {
        if !idle_hint {
            return false;
        }
        let Some(last) = self.last_refresher_rpc else { return false };
        let cooldown = match priority {
            Priority::Required => config.fore_cooldown_ms,
            Priority::Refresh | Priority::Invalid => config.back_cooldown_ms,
            Priority::None => return false,
        };
        now.saturating_sub(last) < cooldown
    }

    /// Scans machine facts, owner, power, time-sync, every drive and
    /// every directory node, and proposes the RPC for the
    /// highest-priority, earliest-deadline candidate not suppressed by
    /// a throttle. Returns `None` if nothing needs refreshing right now.
    #[allow(clippy::too_many_arguments)]
    pub fn select(
        &self,
        cache: &CacheTree,
        machine_facts: &crate::machine::MachineFacts,
        now: Tick,
        idle_hint: bool,
        config: &Config,
    ) -> Option<(Source, UnifiedCommand)> {
        let mut candidates = Vec::new();

        candidates.push(Candidate {
            source: Source::MachineFacts,
            priority: Priority::classify(
                machine_facts.machine_required,
                machine_facts.machine_valid,
                false,
            ),
            deadline: machine_facts.machine_refresh_deadline,
        });
        candidates.push(Candidate {
            source: Source::Owner,
            priority: Priority::classify(machine_facts.owner_required, machine_facts.owner_valid, false),
            deadline: machine_facts.owner_refresh_deadline,
        });
        candidates.push(Candidate {
            source: Source::Power,
            priority: Priority::classify(
                machine_facts.power_required,
                machine_facts.power_valid,
                now >= machine_facts.power_refresh_deadline,
            ),
            deadline: machine_facts.power_refresh_deadline,
        });
        if machine_facts.sync_requested && !machine_facts.sync_done {
            candidates.push(Candidate { source: Source::TimeSync, priority: Priority::Required, deadline: now });
        }

        for letter in b'A'..=b'Z' {
            if let Some(drive) = cache.drive(letter) {
                let past_deadline = now >= drive.refresh_deadline;
                let required = cache.node(drive.root).map(|n| n.required).unwrap_or(false);
                candidates.push(Candidate {
                    source: Source::Drive(letter),
                    priority: Priority::classify(required, drive.last_valid, past_deadline),
                    deadline: drive.refresh_deadline,
                });
            }
        }

        for key in cache.iter_node_keys() {
            let Some(node) = cache.node(key) else { continue };
            if !node.is_directory() {
                continue;
            }
            let past_deadline = now >= node.listing_refresh_deadline;
            candidates.push(Candidate {
                source: Source::DirectoryListing(key),
                priority: Priority::classify(node.listing_required, node.listing_valid, past_deadline),
                deadline: node.listing_refresh_deadline,
            });
        }

        candidates.retain(|c| c.priority != Priority::None);
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.deadline.cmp(&b.deadline)));

        for candidate in candidates {
            if self.busy_throttle_suppresses(now, candidate.priority, config) {
                continue;
            }
            if self.step_throttle_suppresses(now, candidate.priority, idle_hint, config) {
                continue;
            }
            if let Some(cmd) = command_for(cache, candidate.source) {
                return Some((candidate.source, cmd));
            }
        }
        None
    }
}

fn command_for(cache: &CacheTree, source: Source) -> Option<UnifiedCommand> {
    match source {
        Source::MachineFacts => Some(UnifiedCommand::MachineInfo),
        Source::Owner => Some(UnifiedCommand::OwnerInfo),
        Source::Power => Some(UnifiedCommand::Power),
        Source::TimeSync => Some(UnifiedCommand::ReadTime),
        Source::Drive(letter) => Some(UnifiedCommand::DriveInfo { drive: letter }),
        Source::DirectoryListing(key) => {
            let path = cache.internal_path(key);
            Some(UnifiedCommand::Enumerate { path, offset: 0 })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineFacts;

    #[test]
    fn required_directory_outranks_refresh_drive() {
        let mut cache = CacheTree::new();
        cache.ensure_drive(b'C').last_valid = true;
        let root = cache.drive(b'C').unwrap().root;
        cache.node_mut(root).unwrap().listing_required = true;

        let refresher = Refresher::new();
        let facts = MachineFacts::default();
        let config = Config::default();
        let (source, _) = refresher.select(&cache, &facts, 0, false, &config).unwrap();
        assert_eq!(source, Source::DirectoryListing(root));
    }

    /// After 10s of idleness with a valid listing, the refresher selects
    /// that listing for re-enumeration and no other source competes for
    /// it (the listing's deadline has already passed, since nothing
    /// observed so far has advanced it).
    #[test]
    fn scenario_stale_refresh_reselects_valid_listing() {
        let mut cache = CacheTree::new();
        cache.ensure_drive(b'C').last_valid = true;
        let root = cache.drive(b'C').unwrap().root;
        cache.apply_enumerate(root, vec![]);
        assert!(cache.node(root).unwrap().listing_valid);

        let refresher = Refresher::new();
        let facts = MachineFacts::default();
        let config = Config::default();
        let (source, cmd) = refresher.select(&cache, &facts, 10_000, true, &config).unwrap();
        assert_eq!(source, Source::DirectoryListing(root));
        assert_eq!(cmd, UnifiedCommand::Enumerate { path: "C:".into(), offset: 0 });
    }

    #[test]
    fn busy_throttle_suppresses_refresh_class() {
        let mut cache = CacheTree::new();
        let slot = cache.ensure_drive(b'C');
        slot.last_valid = true;
        slot.refresh_deadline = 0;

        let mut refresher = Refresher::new();
        refresher.note_queue_state(100, true);
        let facts = MachineFacts::default();
        let config = Config::default();
        assert!(refresher.select(&cache, &facts, 100, false, &config).is_none());
    }
}
