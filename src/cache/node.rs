//! The two node shapes in the cache tree: a drive slot (`spec.md` §3's
//! "Drive slot") and a directory-tree node owned underneath it.

use crate::arena::Key;
use crate::error::Error;
use crate::rpc::{EntryInfo, ObjectType};

pub type NodeKey = Key<DirectoryNode>;

/// Monotonic clock reading, in whatever unit the host driver uses
/// (milliseconds in tests). Never wall-clock: refresh deadlines and
/// cooldowns only ever compare two readings of this same clock.
pub type Tick = u64;

pub struct DriveSlot {
    pub letter: u8,
    pub present: bool,
    pub read_only: bool,
    pub name: String,
    pub size: u64,
    pub free: u64,
    pub unique_id: u32,
    pub refresh_deadline: Tick,
    pub last_valid: bool,
    pub root: NodeKey,
}

impl DriveSlot {
    pub fn new(letter: u8, root: NodeKey) -> Self {
        DriveSlot {
            letter,
            present: false,
            read_only: false,
            name: String::new(),
            size: 0,
            free: 0,
            unique_id: 0,
            refresh_deadline: 0,
            last_valid: false,
            root,
        }
    }
}

/// A node in the directory cache tree. The root of each drive's tree is
/// itself one of these (a directory node with no parent).
pub struct DirectoryNode {
    pub name: String,
    pub drive: u8,
    pub parent: Option<NodeKey>,
    pub object_type: ObjectType,

    pub entry_info: Option<EntryInfo>,
    pub valid: bool,
    pub required: bool,
    pub last_error: Option<Error>,
    pub refresh_deadline: Tick,

    /// Children in insertion+lexicographic order. Only meaningful when
    /// `object_type` is `Directory`.
    pub children: Vec<NodeKey>,
    pub listing_valid: bool,
    pub listing_required: bool,
    pub listing_error: Option<Error>,
    pub listing_refresh_deadline: Tick,

    /// Weak back-reference to an Open File keyed by the pending-op
    /// queue's own arena; at most one per node (invariant b).
    pub open_handle: Option<crate::arena::Key<crate::pending_op::OpenFile>>,
}

impl DirectoryNode {
    pub fn new_root(letter: u8) -> Self {
        DirectoryNode {
            name: String::new(),
            drive: letter,
            parent: None,
            object_type: ObjectType::Directory,
            entry_info: None,
            valid: true,
            required: false,
            last_error: None,
            refresh_deadline: 0,
            children: Vec::new(),
            listing_valid: false,
            listing_required: false,
            listing_error: None,
            listing_refresh_deadline: 0,
            open_handle: None,
        }
    }

    pub fn new_child(name: String, drive: u8, parent: NodeKey, object_type: ObjectType) -> Self {
        DirectoryNode {
            name,
            drive,
            parent: Some(parent),
            object_type,
            entry_info: None,
            valid: false,
            required: false,
            last_error: None,
            refresh_deadline: 0,
            children: Vec::new(),
            listing_valid: false,
            listing_required: false,
            listing_error: None,
            listing_refresh_deadline: 0,
            open_handle: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.object_type, ObjectType::Directory)
    }
}
