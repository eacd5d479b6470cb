//! The directory cache tree (`spec.md` §4.3): a forest of 26 fixed drive
//! slots plus a virtual "all" aggregator, each owning an arena-backed
//! tree of directory nodes.
//!
//! All cross-references are arena keys rather than owning pointers or
//! raw back-pointers — see `arena.rs` and SPEC_FULL.md §9's discussion of
//! replacing the source's intrusive, cyclic cache graph.

mod node;
pub mod priority;

pub use node::{DirectoryNode, DriveSlot, NodeKey, Tick};
pub use priority::Priority;

use crate::arena::Arena;
use crate::error::Error;
use crate::pending_op::OpenFile;
use crate::rpc::{EntryInfo, ObjectType};

/// The virtual drive letter aggregating every present drive under a
/// single root, used by callers that browse without naming a drive.
pub const ALL_DRIVE: u8 = b'*';

/// An observable change the tree applies as a result of reconciling a
/// remote reply against the cache. Carries both the canonical internal
/// path and the disc-name-qualified external path per invariant 5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Added { internal_path: String, external_path: String },
    Removed { internal_path: String, external_path: String },
    Changed { internal_path: String, external_path: String },
}

pub struct CacheTree {
    nodes: Arena<DirectoryNode>,
    drives: [Option<DriveSlot>; 26],
    pub all_root: NodeKey,
}

fn drive_index(letter: u8) -> Option<usize> {
    if letter.is_ascii_uppercase() {
        Some((letter - b'A') as usize)
    } else {
        None
    }
}

/// Splits `"C:dir.leaf"` into the drive letter and the dot-separated
/// path components below it. `"C:"` (no components) addresses the root.
fn parse_path(path: &str) -> Result<(u8, Vec<&str>), Error> {
    let (drive_part, rest) = path.split_once(':').ok_or(Error::BadDrive)?;
    let letter = match drive_part.as_bytes() {
        [b] if b.is_ascii_uppercase() => *b,
        b"*" => ALL_DRIVE,
        _ => return Err(Error::BadDrive),
    };
    let segments = if rest.is_empty() { Vec::new() } else { rest.split('.').collect() };
    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::BadName);
    }
    Ok((letter, segments))
}

impl CacheTree {
    pub fn new() -> Self {
        let mut nodes = Arena::new();
        let all_root = nodes.insert(DirectoryNode::new_root(ALL_DRIVE));
        CacheTree { nodes, drives: Default::default(), all_root }
    }

    pub fn node(&self, key: NodeKey) -> Option<&DirectoryNode> {
        self.nodes.get(key)
    }

    pub fn node_mut(&mut self, key: NodeKey) -> Option<&mut DirectoryNode> {
        self.nodes.get_mut(key)
    }

    pub fn drive(&self, letter: u8) -> Option<&DriveSlot> {
        drive_index(letter).and_then(|i| self.drives[i].as_ref())
    }

    pub fn drive_mut(&mut self, letter: u8) -> Option<&mut DriveSlot> {
        drive_index(letter).and_then(|i| self.drives[i].as_mut())
    }

    /// Creates (or returns the existing) drive slot for `letter`.
    pub fn ensure_drive(&mut self, letter: u8) -> &mut DriveSlot {
        let i = drive_index(letter).expect("caller validates the drive letter");
        if self.drives[i].is_none() {
            let root = self.nodes.insert(DirectoryNode::new_root(letter));
            self.drives[i] = Some(DriveSlot::new(letter, root));
        }
        self.drives[i].as_mut().unwrap()
    }

    fn root_for(&self, letter: u8) -> Option<NodeKey> {
        if letter == ALL_DRIVE {
            Some(self.all_root)
        } else {
            self.drive(letter).map(|d| d.root)
        }
    }

    fn child_named(&self, dir: NodeKey, name: &str) -> Option<NodeKey> {
        self.nodes.get(dir)?.children.iter().copied().find(|&c| {
            self.nodes.get(c).map(|n| n.name.as_str()) == Some(name)
        })
    }

    /// Walks `path`, returning the deepest node reached, whether that
    /// node is itself valid, and any authoritative error the cache
    /// already knows about (e.g. `NotFound` when a listing is valid and
    /// lacks the requested leaf).
    ///
    /// When `required` is set and the walk stalls on an invalid listing
    /// or an invalid leaf, the stalling node is marked `required` so the
    /// refresher prioritizes it.
    pub fn find(&mut self, path: &str, required: bool) -> (Option<NodeKey>, bool, Option<Error>) {
        let (letter, segments) = match parse_path(path) {
            Ok(v) => v,
            Err(e) => return (None, false, Some(e)),
        };
        let Some(root) = self.root_for(letter) else {
            return (None, false, Some(Error::BadDrive));
        };
        let mut current = root;
        for (i, seg) in segments.iter().enumerate() {
            let is_last = i + 1 == segments.len();
            let listing_valid = self.nodes.get(current).map(|n| n.listing_valid).unwrap_or(false);
            if !listing_valid {
                if required {
                    if let Some(n) = self.nodes.get_mut(current) {
                        n.listing_required = true;
                    }
                }
                return (Some(current), false, None);
            }
            match self.child_named(current, seg) {
                Some(child) => current = child,
                None => return (None, true, Some(Error::NotFound)),
            }
            let _ = is_last;
        }
        let node = self.nodes.get_mut(current).expect("walked key stays live within this call");
        if required && !node.valid {
            node.required = true;
        }
        (Some(current), node.valid, node.last_error)
    }

    /// Builds the canonical `"C:a.b.c"` path for `key` by walking parent
    /// links to the root.
    pub fn internal_path(&self, key: NodeKey) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(key);
        let mut drive = ALL_DRIVE;
        while let Some(k) = cur {
            let Some(n) = self.nodes.get(k) else { break };
            drive = n.drive;
            if n.parent.is_some() {
                parts.push(n.name.clone());
            }
            cur = n.parent;
        }
        parts.reverse();
        format!("{}:{}", drive as char, parts.join("."))
    }

    /// Like `internal_path`, but substitutes the drive's disc name for
    /// the drive letter when one is known (invariant 5's "external,
    /// disc-name-qualified path").
    pub fn external_path(&self, key: NodeKey) -> String {
        let internal = self.internal_path(key);
        let Some((letter_part, rest)) = internal.split_once(':') else { return internal };
        let letter = letter_part.as_bytes().first().copied().unwrap_or(ALL_DRIVE);
        match self.drive(letter) {
            Some(slot) if !slot.name.is_empty() => format!("{}:{}", slot.name, rest),
            _ => internal,
        }
    }

    /// Applies an Info reply to `key` (invariant 1, 4). If the reported
    /// object type differs from the cached one, the node is deleted and
    /// recreated in place (its children, if any, are dropped along with
    /// it — a stale listing is the caller's problem on next refresh). A
    /// type change away from `File` breaks invariant 1 for any live
    /// `open_handle`, so it is cleared here and the orphaned `OpenFile`
    /// is marked dead (invariant (d)) by dropping its remote handle.
    pub fn apply_info(&mut self, key: NodeKey, info: EntryInfo, files: &mut Arena<OpenFile>) -> Vec<CacheEvent> {
        let mut events = Vec::new();
        let type_changed = self
            .nodes
            .get(key)
            .map(|n| n.object_type != info.object_type)
            .unwrap_or(false);
        if type_changed {
            if let Some(n) = self.nodes.get_mut(key) {
                n.children.clear();
                n.listing_valid = false;
                n.object_type = info.object_type;
                if info.object_type != ObjectType::File {
                    if let Some(handle) = n.open_handle.take() {
                        if let Some(file) = files.get_mut(handle) {
                            file.remote_handle = None;
                        }
                    }
                }
            }
            events.push(CacheEvent::Changed {
                internal_path: self.internal_path(key),
                external_path: self.external_path(key),
            });
        }
        if let Some(n) = self.nodes.get_mut(key) {
            let changed = n.entry_info.as_ref() != Some(&info) && !type_changed;
            n.entry_info = Some(info);
            n.valid = true;
            n.required = false;
            n.last_error = None;
            if changed {
                events.push(CacheEvent::Changed {
                    internal_path: self.internal_path(key),
                    external_path: self.external_path(key),
                });
            }
        }
        events
    }

    /// Merge-reconciles `dir`'s children against a fresh Enumerate
    /// reply (invariant 3). Both sides are compared by name in sorted
    /// order; entries are considered equal when `(load_addr, exec_addr,
    /// size, attr, name)` all match.
    pub fn apply_enumerate(&mut self, dir: NodeKey, mut entries: Vec<EntryInfo>) -> Vec<CacheEvent> {
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let drive = self.nodes.get(dir).map(|n| n.drive).unwrap_or(ALL_DRIVE);
        let existing: Vec<NodeKey> = self.nodes.get(dir).map(|n| n.children.clone()).unwrap_or_default();

        let mut events = Vec::new();
        let mut new_children = Vec::with_capacity(entries.len());
        let mut ei = existing.iter().peekable();
        let mut ri = entries.into_iter().peekable();

        loop {
            match (ei.peek(), ri.peek()) {
                (Some(&&ek), Some(rv)) => {
                    let ename = self.nodes.get(ek).map(|n| n.name.clone()).unwrap_or_default();
                    match ename.as_str().cmp(rv.name.as_str()) {
                        std::cmp::Ordering::Equal => {
                            let rv = ri.next().unwrap();
                            ei.next();
                            let same = self
                                .nodes
                                .get(ek)
                                .and_then(|n| n.entry_info.as_ref())
                                .map(|cur| entry_key(cur) == entry_key(&rv))
                                .unwrap_or(false);
                            if let Some(n) = self.nodes.get_mut(ek) {
                                n.object_type = rv.object_type;
                                n.entry_info = Some(rv);
                                n.valid = true;
                                n.required = false;
                                n.last_error = None;
                            }
                            if !same {
                                events.push(CacheEvent::Changed {
                                    internal_path: self.internal_path(ek),
                                    external_path: self.external_path(ek),
                                });
                            }
                            new_children.push(ek);
                        }
                        std::cmp::Ordering::Less => {
                            let ek = *ei.next().unwrap();
                            self.remove_subtree(ek, &mut events);
                        }
                        std::cmp::Ordering::Greater => {
                            let rv = ri.next().unwrap();
                            new_children.push(self.insert_child(dir, drive, rv, &mut events));
                        }
                    }
                }
                (Some(_), None) => {
                    let ek = *ei.next().unwrap();
                    self.remove_subtree(ek, &mut events);
                }
                (None, Some(_)) => {
                    let rv = ri.next().unwrap();
                    new_children.push(self.insert_child(dir, drive, rv, &mut events));
                }
                (None, None) => break,
            }
        }

        if let Some(n) = self.nodes.get_mut(dir) {
            n.children = new_children;
            n.listing_valid = true;
            n.listing_required = false;
            n.listing_error = None;
        }
        events
    }

    /// Inserts a node as a child of `parent` in lexicographic order,
    /// without an accompanying Enumerate/Info observation. Used when a
    /// pending op (Open with `create=true`, Rename) synthesizes a node
    /// the cache hadn't observed yet.
    pub fn insert_detached_child(&mut self, parent: NodeKey, node: DirectoryNode) -> NodeKey {
        let name = node.name.clone();
        let key = self.nodes.insert(node);
        let siblings = self.nodes.get(parent).map(|p| p.children.clone()).unwrap_or_default();
        let pos = siblings.partition_point(|&c| {
            self.nodes.get(c).map(|n| n.name.as_str() < name.as_str()).unwrap_or(false)
        });
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.insert(pos, key);
        }
        key
    }

    fn insert_child(&mut self, dir: NodeKey, drive: u8, info: EntryInfo, events: &mut Vec<CacheEvent>) -> NodeKey {
        let mut node = DirectoryNode::new_child(info.name.clone(), drive, dir, info.object_type);
        node.entry_info = Some(info);
        node.valid = true;
        let key = self.nodes.insert(node);
        events.push(CacheEvent::Added {
            internal_path: self.internal_path(key),
            external_path: self.external_path(key),
        });
        key
    }

    /// Deletes `key` and every descendant (invariant d), orphaning any
    /// attached Open File by clearing its back-reference; the queue
    /// driver is responsible for noticing the dead handle on next use.
    pub fn remove_subtree(&mut self, key: NodeKey, events: &mut Vec<CacheEvent>) {
        let children = self.nodes.get(key).map(|n| n.children.clone()).unwrap_or_default();
        for child in children {
            self.remove_subtree(child, events);
        }
        events.push(CacheEvent::Removed {
            internal_path: self.internal_path(key),
            external_path: self.external_path(key),
        });
        self.nodes.remove(key);
    }

    pub fn iter_node_keys(&self) -> impl Iterator<Item = NodeKey> + '_ {
        self.nodes.iter().map(|(k, _)| k)
    }

    /// Marks every node and drive invalid (`spec.md` §7's propagation
    /// policy: "the cache layer never swallows `LinkBroken`; it marks
    /// every `valid=true` node `valid=false`"). Listings are left alone;
    /// a node's own validity is what every read path checks first.
    pub fn invalidate_all(&mut self) {
        for (_, node) in self.nodes.iter_mut() {
            node.valid = false;
        }
        for slot in self.drives.iter_mut().flatten() {
            slot.last_valid = false;
        }
    }
}

impl Default for CacheTree {
    fn default() -> Self {
        Self::new()
    }
}

fn entry_key(info: &EntryInfo) -> (u32, u32, u64, u32, &str) {
    (info.load_addr, info.exec_addr, info.size, info.attr, info.name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::ObjectType;

    fn entry(name: &str, object_type: ObjectType) -> EntryInfo {
        EntryInfo { name: name.to_string(), object_type, size: 0, load_addr: 0, exec_addr: 0, attr: 0 }
    }

    #[test]
    fn find_on_unknown_drive_is_bad_drive() {
        let mut tree = CacheTree::new();
        let (node, valid, err) = tree.find("Z:foo", false);
        assert!(node.is_none());
        assert!(!valid);
        assert_eq!(err, Some(Error::BadDrive));
    }

    #[test]
    fn find_marks_required_when_listing_unknown() {
        let mut tree = CacheTree::new();
        tree.ensure_drive(b'C');
        let (node, valid, err) = tree.find("C:foo", true);
        assert!(node.is_some());
        assert!(!valid);
        assert!(err.is_none());
        let root = tree.drive(b'C').unwrap().root;
        assert!(tree.node(root).unwrap().listing_required);
    }

    #[test]
    fn enumerate_reconciles_added_removed_changed() {
        let mut tree = CacheTree::new();
        tree.ensure_drive(b'C');
        let root = tree.drive(b'C').unwrap().root;

        let events = tree.apply_enumerate(root, vec![
            entry("alpha", ObjectType::File),
            entry("beta", ObjectType::File),
        ]);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(e, CacheEvent::Added { .. })));

        let mut changed_beta = entry("beta", ObjectType::File);
        changed_beta.size = 10;
        let events = tree.apply_enumerate(root, vec![changed_beta, entry("gamma", ObjectType::File)]);

        assert!(events.iter().any(|e| matches!(e, CacheEvent::Removed { internal_path, .. } if internal_path == "C:alpha")));
        assert!(events.iter().any(|e| matches!(e, CacheEvent::Changed { internal_path, .. } if internal_path == "C:beta")));
        assert!(events.iter().any(|e| matches!(e, CacheEvent::Added { internal_path, .. } if internal_path == "C:gamma")));
    }

    #[test]
    fn info_reply_with_changed_type_recreates_node() {
        let mut tree = CacheTree::new();
        let mut files: Arena<OpenFile> = Arena::new();
        tree.ensure_drive(b'C');
        let root = tree.drive(b'C').unwrap().root;
        tree.apply_enumerate(root, vec![entry("thing", ObjectType::File)]);
        let (node, ..) = tree.find("C:thing", false);
        let key = node.unwrap();

        let mut as_dir = entry("thing", ObjectType::Directory);
        as_dir.size = 0;
        let events = tree.apply_info(key, as_dir, &mut files);
        assert!(!events.is_empty());
        assert!(tree.node(key).unwrap().is_directory());
    }

    #[test]
    fn info_reply_with_changed_type_orphans_open_handle() {
        let mut tree = CacheTree::new();
        let mut files: Arena<OpenFile> = Arena::new();
        tree.ensure_drive(b'C');
        let root = tree.drive(b'C').unwrap().root;
        tree.apply_enumerate(root, vec![entry("thing", ObjectType::File)]);
        let (node, ..) = tree.find("C:thing", false);
        let key = node.unwrap();

        let handle = files.insert(OpenFile::new(key, crate::rpc::AccessMode::Read));
        files.get_mut(handle).unwrap().remote_handle = Some(crate::rpc::RemoteHandle(3u32));
        tree.node_mut(key).unwrap().open_handle = Some(handle);

        let mut as_dir = entry("thing", ObjectType::Directory);
        as_dir.size = 0;
        tree.apply_info(key, as_dir, &mut files);

        assert!(tree.node(key).unwrap().open_handle.is_none());
        assert!(files.get(handle).unwrap().remote_handle.is_none());
    }

    /// Enumerate an empty root: starting from drive C present with an
    /// empty root directory, reconciling an empty entry list against it
    /// leaves no events and a valid, childless listing.
    #[test]
    fn scenario_enumerate_empty_root() {
        let mut tree = CacheTree::new();
        tree.ensure_drive(b'C');
        let root = tree.drive(b'C').unwrap().root;

        let events = tree.apply_enumerate(root, vec![]);
        assert!(events.is_empty());
        let node = tree.node(root).unwrap();
        assert!(node.listing_valid);
        assert!(node.children.is_empty());
    }

    #[test]
    fn external_path_prefers_disc_name() {
        let mut tree = CacheTree::new();
        tree.ensure_drive(b'C').name = "MyDisc".to_string();
        let root = tree.drive(b'C').unwrap().root;
        tree.apply_enumerate(root, vec![entry("file", ObjectType::File)]);
        let (node, ..) = tree.find("C:file", false);
        assert_eq!(tree.external_path(node.unwrap()), "MyDisc:file");
    }
}
