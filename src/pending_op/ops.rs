//! Per-kind `step()` logic (`spec.md` §4.4's "only the non-obvious"
//! semantics). Each function advances one `PendingOp` by at most one RPC
//! round trip per call; `mod.rs`'s `Queue::drive` loops this until the
//! op suspends or completes.

use super::{OpKind, OpenFile, Phase, PendingOp, PendingOutput, Step};
use crate::arena::Arena;
use crate::cache::CacheTree;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::rpc::{AccessMode, EntryInfo, ObjectType, RemoteHandle, UnifiedCommand, UnifiedReply};

pub struct StepContext<'a> {
    pub cache: &'a mut CacheTree,
    pub files: &'a mut Arena<OpenFile>,
    pub config: &'a Config,
}

pub fn step(op: &mut PendingOp, ctx: &mut StepContext, reply: Option<Result<UnifiedReply>>) -> Step {
    match op.kind.clone() {
        OpKind::DriveInfo { drive } => step_simple(op, ctx, reply, UnifiedCommand::DriveInfo { drive }, |r| match r {
            UnifiedReply::DriveInfo(info) => Ok(PendingOutput::DriveInfo(info)),
            _ => Err(Error::BadHeader),
        }),
        OpKind::DiscName { drive, name } => {
            step_simple(op, ctx, reply, UnifiedCommand::DiscName { drive, name }, |_| Ok(PendingOutput::Unit))
        }
        OpKind::Info { path } => step_info(op, ctx, reply, path),
        OpKind::Mkdir { path } => step_mkdir(op, ctx, reply, path),
        OpKind::Remove { path } => step_remove(op, ctx, reply, path),
        OpKind::Rename { src, dest } => step_rename(op, ctx, reply, src, dest),
        OpKind::SetAttr { path, attr } => step_set_attr(op, ctx, reply, path, attr),
        OpKind::SetStamp { path, load_addr, exec_addr } => step_set_stamp(op, ctx, reply, path, load_addr, exec_addr),
        OpKind::Enumerate { path, offset } => step_enumerate(op, ctx, reply, path, offset),
        OpKind::Open { path, mode, create } => step_open(op, ctx, reply, path, mode, create),
        OpKind::Close { handle } => step_close(op, ctx, reply, handle),
        OpKind::Args { handle } => step_args(ctx, handle),
        OpKind::Read { handle, offset, len } => step_read(op, ctx, reply, handle, offset, len),
        OpKind::Write { handle, offset, data } => step_write(op, ctx, reply, handle, offset, data),
        OpKind::WriteZeros { handle, offset, len } => step_write_zeros(op, ctx, reply, handle, offset, len),
        OpKind::SetAllocated { handle, size } => step_set_allocated(op, ctx, reply, handle, size),
        OpKind::SetExtent { handle, size } => step_set_extent(op, ctx, reply, handle, size),
        OpKind::Flush { handle } => step_flush(op, ctx, reply, handle),
        OpKind::SetSequential { handle, target } => step_set_sequential(ctx, handle, target),
    }
}

/// Shared shape for every op that is exactly one RPC round trip with no
/// branching: issue on `Phase::Start`, decode on resume.
fn step_simple(
    op: &mut PendingOp,
    _ctx: &mut StepContext,
    reply: Option<Result<UnifiedReply>>,
    cmd: UnifiedCommand,
    on_reply: impl FnOnce(UnifiedReply) -> Result<PendingOutput>,
) -> Step {
    match op.phase {
        Phase::Start => {
            op.phase = Phase::AwaitingReply;
            Step::IssueRpc(cmd)
        }
        Phase::AwaitingReply => {
            let reply = reply.expect("resumed simple op without a carried reply");
            Step::Done(reply.and_then(on_reply))
        }
        other => panic!("simple op in unexpected phase {other:?}"),
    }
}

fn step_info(op: &mut PendingOp, ctx: &mut StepContext, reply: Option<Result<UnifiedReply>>, path: String) -> Step {
    match op.phase {
        Phase::Start => {
            let (node, valid, err) = ctx.cache.find(&path, true);
            if let Some(e) = err {
                return Step::Done(Err(e));
            }
            if !valid {
                return Step::NeedCache;
            }
            let Some(node) = node else { return Step::Done(Err(Error::NotFound)) };
            if let Some(info) = ctx.cache.node(node).and_then(|n| n.entry_info.clone()) {
                return Step::Done(Ok(PendingOutput::Info(info)));
            }
            op.phase = Phase::AwaitingReply;
            Step::IssueRpc(UnifiedCommand::Info { path })
        }
        Phase::AwaitingReply => {
            let reply = reply.expect("resumed Info without a carried reply");
            Step::Done(reply.and_then(|r| match r {
                UnifiedReply::Info(info) => {
                    if let (Some(node), ..) = ctx.cache.find(&path, false) {
                        ctx.cache.apply_info(node, info.clone(), ctx.files);
                    }
                    Ok(PendingOutput::Info(info))
                }
                _ => Err(Error::BadHeader),
            }))
        }
        other => panic!("Info op in unexpected phase {other:?}"),
    }
}

fn step_mkdir(op: &mut PendingOp, ctx: &mut StepContext, reply: Option<Result<UnifiedReply>>, path: String) -> Step {
    match op.phase {
        Phase::Start => {
            op.phase = Phase::AwaitingReply;
            Step::IssueRpc(UnifiedCommand::Mkdir { path })
        }
        Phase::AwaitingReply => {
            let reply = reply.expect("resumed Mkdir without a carried reply");
            // Idempotent only when the existing object is itself a
            // directory; an existing file at this path is a real conflict.
            Step::Done(match reply {
                Ok(_) => Ok(PendingOutput::Unit),
                Err(Error::AlreadyExists) => {
                    let (node, ..) = ctx.cache.find(&path, false);
                    match node.and_then(|n| ctx.cache.node(n)) {
                        Some(n) if n.is_directory() => Ok(PendingOutput::Unit),
                        _ => Err(Error::AlreadyExists),
                    }
                }
                Err(e) => Err(e),
            })
        }
        other => panic!("Mkdir op in unexpected phase {other:?}"),
    }
}

fn step_remove(op: &mut PendingOp, _ctx: &mut StepContext, reply: Option<Result<UnifiedReply>>, path: String) -> Step {
    match op.phase {
        Phase::Start => {
            op.phase = Phase::AwaitingReply;
            Step::IssueRpc(UnifiedCommand::Remove { path })
        }
        Phase::AwaitingReply => {
            let reply = reply.expect("resumed Remove without a carried reply");
            // Idempotent on NotFound per the abstract command table.
            Step::Done(match reply {
                Ok(_) => Ok(PendingOutput::Unit),
                Err(Error::NotFound) => Ok(PendingOutput::Unit),
                Err(e) => Err(e),
            })
        }
        other => panic!("Remove op in unexpected phase {other:?}"),
    }
}

fn step_rename(
    op: &mut PendingOp,
    ctx: &mut StepContext,
    reply: Option<Result<UnifiedReply>>,
    src: String,
    dest: String,
) -> Step {
    match op.phase {
        Phase::Start => {
            if src == dest {
                return Step::Done(Ok(PendingOutput::Unit));
            }
            let src_drive = src.split(':').next();
            let dest_drive = dest.split(':').next();
            if src_drive != dest_drive {
                return Step::Done(Err(Error::BadDrive));
            }
            let (src_node, src_valid, src_err) = ctx.cache.find(&src, true);
            if let Some(e) = src_err {
                return Step::Done(Err(e));
            }
            if !src_valid || src_node.is_none() {
                return Step::NeedCache;
            }
            let (dest_node, dest_valid, dest_err) = ctx.cache.find(&dest, true);
            match dest_err {
                Some(Error::NotFound) => {}
                Some(e) => return Step::Done(Err(e)),
                None => {
                    if !dest_valid {
                        return Step::NeedCache;
                    }
                    if dest_node.is_some() && dest_node != src_node {
                        return Step::Done(Err(Error::AlreadyExists));
                    }
                }
            }
            op.phase = Phase::AwaitingReply;
            Step::IssueRpc(UnifiedCommand::Rename { src, dest })
        }
        Phase::AwaitingReply => {
            let reply = reply.expect("resumed Rename without a carried reply");
            Step::Done(reply.map(|_| PendingOutput::Unit))
        }
        other => panic!("Rename op in unexpected phase {other:?}"),
    }
}

fn step_set_attr(
    op: &mut PendingOp,
    ctx: &mut StepContext,
    reply: Option<Result<UnifiedReply>>,
    path: String,
    attr: u32,
) -> Step {
    if op.phase == Phase::Start {
        // Deferred if the target is currently open: flushed at Close.
        let (node, ..) = ctx.cache.find(&path, false);
        if let Some(node) = node {
            if let Some(handle) = ctx.cache.node(node).and_then(|n| n.open_handle) {
                if let Some(file) = ctx.files.get_mut(handle) {
                    file.deferred_attr = Some(attr);
                    return Step::Done(Ok(PendingOutput::Unit));
                }
            }
        }
    }
    step_simple(op, ctx, reply, UnifiedCommand::SetAttr { path, attr }, |_| Ok(PendingOutput::Unit))
}

fn step_set_stamp(
    op: &mut PendingOp,
    ctx: &mut StepContext,
    reply: Option<Result<UnifiedReply>>,
    path: String,
    load_addr: u32,
    exec_addr: u32,
) -> Step {
    if op.phase == Phase::Start {
        let (node, ..) = ctx.cache.find(&path, false);
        if let Some(node) = node {
            if let Some(handle) = ctx.cache.node(node).and_then(|n| n.open_handle) {
                if let Some(file) = ctx.files.get_mut(handle) {
                    file.deferred_stamp = Some((load_addr, exec_addr));
                    return Step::Done(Ok(PendingOutput::Unit));
                }
            }
        }
    }
    step_simple(op, ctx, reply, UnifiedCommand::SetStamp { path, load_addr, exec_addr }, |_| Ok(PendingOutput::Unit))
}

fn step_enumerate(
    op: &mut PendingOp,
    ctx: &mut StepContext,
    reply: Option<Result<UnifiedReply>>,
    path: String,
    offset: i32,
) -> Step {
    match op.phase {
        Phase::Start => {
            let (node, valid, err) = ctx.cache.find(&path, true);
            if let Some(e) = err {
                return Step::Done(Err(e));
            }
            let Some(node) = node else { return Step::Done(Err(Error::NotFound)) };
            if !valid {
                return Step::NeedCache;
            }
            if !ctx.cache.node(node).map(|n| n.is_directory()).unwrap_or(false) {
                return Step::Done(Err(Error::BadParams));
            }
            let buffer_cap = ctx.config.enumerate_buffer_initial;
            op.phase = Phase::EnumerateIssue { buffer_cap };
            Step::IssueRpc(UnifiedCommand::Enumerate { path, offset })
        }
        Phase::EnumerateIssue { buffer_cap } => {
            let reply = reply.expect("resumed Enumerate without a carried reply");
            match reply {
                Ok(UnifiedReply::Enumerate { entries, next_offset }) => {
                    let (node, ..) = ctx.cache.find(&path, false);
                    if let Some(node) = node {
                        ctx.cache.apply_enumerate(node, entries.clone());
                    }
                    Step::Done(Ok(PendingOutput::Entries(entries, next_offset)))
                }
                Err(Error::BufferTooSmall) => {
                    let grown = (buffer_cap.saturating_mul(2)).min(ctx.config.enumerate_buffer_cap);
                    if grown <= buffer_cap {
                        return Step::Done(Err(Error::BufferTooSmall));
                    }
                    op.phase = Phase::EnumerateIssue { buffer_cap: grown };
                    Step::IssueRpc(UnifiedCommand::Enumerate { path, offset })
                }
                Ok(_) => Step::Done(Err(Error::BadHeader)),
                Err(e) => Step::Done(Err(e)),
            }
        }
        other => panic!("Enumerate op in unexpected phase {other:?}"),
    }
}

fn step_open(
    op: &mut PendingOp,
    ctx: &mut StepContext,
    reply: Option<Result<UnifiedReply>>,
    path: String,
    mode: AccessMode,
    create: bool,
) -> Step {
    match op.phase {
        Phase::Start => {
            let (node, valid, err) = ctx.cache.find(&path, true);
            match err {
                Some(Error::NotFound) => {
                    if !create {
                        return Step::Done(Err(Error::NotFound));
                    }
                }
                Some(e) => return Step::Done(Err(e)),
                None => {
                    if !valid {
                        return Step::NeedCache;
                    }
                    if let Some(node) = node {
                        let n = ctx.cache.node(node).expect("resolved node stays live");
                        if n.is_directory() {
                            if matches!(mode, AccessMode::Read) {
                                return Step::Done(Ok(PendingOutput::Handle(open_directory_handle(ctx, node))));
                            }
                            return Step::Done(Err(Error::AccessDenied));
                        }
                        if n.open_handle.is_some() {
                            return Step::Done(Err(Error::ObjectOpen));
                        }
                        if create {
                            op.phase = Phase::OpenMaybeDelete;
                            return Step::IssueRpc(UnifiedCommand::Remove { path });
                        }
                    }
                }
            }
            op.phase = Phase::OpenIssueOpen;
            Step::IssueRpc(UnifiedCommand::Open { path, mode, create })
        }
        Phase::OpenMaybeDelete => {
            let reply = reply.expect("resumed Open(delete) without a carried reply");
            match reply {
                Ok(_) | Err(Error::NotFound) => {
                    op.phase = Phase::OpenIssueOpen;
                    Step::IssueRpc(UnifiedCommand::Open { path, mode, create })
                }
                Err(e) => Step::Done(Err(e)),
            }
        }
        Phase::OpenIssueOpen => {
            let reply = reply.expect("resumed Open without a carried reply");
            match reply {
                Ok(UnifiedReply::Open(handle)) => {
                    op.phase = Phase::OpenMaybeResize;
                    finish_open(ctx, path.clone(), mode, create, handle)
                }
                Ok(_) => Step::Done(Err(Error::BadHeader)),
                Err(e) => Step::Done(Err(e)),
            }
        }
        Phase::OpenMaybeResize => {
            let reply = reply.expect("resumed Open(resize) without a carried reply");
            if let Err(e) = reply {
                return Step::Done(Err(e));
            }
            let (node, ..) = ctx.cache.find(&path, false);
            let key = node.and_then(|n| ctx.cache.node(n)).and_then(|n| n.open_handle);
            match key {
                Some(k) => Step::Done(Ok(PendingOutput::Handle(k))),
                None => Step::Done(Err(Error::BadHandle)),
            }
        }
        other => panic!("Open op in unexpected phase {other:?}"),
    }
}

/// After a successful remote Open: attach a new `OpenFile` to the cache
/// node (creating the node if the create path had no prior entry),
/// invalidating it so the next observation refreshes metadata. If
/// `create` and the create path overwrote a file with a previously known
/// allocated size, re-issues `SetAllocated` to match it before reporting
/// done; an ordinary non-create open never reissues a resize.
fn finish_open(ctx: &mut StepContext, path: String, mode: AccessMode, create: bool, handle: RemoteHandle) -> Step {
    let (existing, ..) = ctx.cache.find(&path, false);
    let prior_allocated = existing.and_then(|n| ctx.cache.node(n)).and_then(|n| n.entry_info.as_ref()).map(|i| i.size);

    let node = match existing {
        Some(n) => n,
        None => create_placeholder_node(ctx.cache, &path),
    };
    if let Some(n) = ctx.cache.node_mut(node) {
        n.valid = false;
        n.required = false;
    }

    let mut file = OpenFile::new(node, mode);
    file.remote_handle = Some(handle);
    let key = ctx.files.insert(file);
    if let Some(n) = ctx.cache.node_mut(node) {
        n.open_handle = Some(key);
    }

    if create {
        if let Some(size) = prior_allocated {
            if let Some(f) = ctx.files.get_mut(key) {
                f.allocated = size;
            }
            return Step::IssueRpc(UnifiedCommand::SetSize { handle, size });
        }
    }
    Step::Done(Ok(PendingOutput::Handle(key)))
}

fn create_placeholder_node(cache: &mut CacheTree, path: &str) -> crate::cache::NodeKey {
    // `validate()` already ran when the path reached this layer via
    // `rpc::UnifiedCommand::encode`; splitting here is purely mechanical.
    let (parent_path, leaf) = path.rsplit_once('.').map(|(p, l)| (p.to_string(), l.to_string())).unwrap_or_else(|| {
        let (drive, _) = path.split_once(':').unwrap_or((path, ""));
        (format!("{drive}:"), path.rsplit(':').next().unwrap_or(path).to_string())
    });
    let (parent, ..) = cache.find(&parent_path, false);
    let parent = parent.expect("parent directory was already resolved before Open issued the remote call");
    let drive = cache.node(parent).map(|n| n.drive).unwrap_or(b'A');
    let node = crate::cache::DirectoryNode::new_child(leaf, drive, parent, ObjectType::File);
    cache.insert_detached_child(parent, node)
}

fn open_directory_handle(ctx: &mut StepContext, node: crate::cache::NodeKey) -> super::OpenFileKey {
    let mut file = OpenFile::new(node, AccessMode::Read);
    file.is_directory_handle = true;
    let key = ctx.files.insert(file);
    if let Some(n) = ctx.cache.node_mut(node) {
        n.open_handle = Some(key);
    }
    key
}

fn step_close(op: &mut PendingOp, ctx: &mut StepContext, reply: Option<Result<UnifiedReply>>, handle: super::OpenFileKey) -> Step {
    match op.phase {
        Phase::Start => {
            let Some(file) = ctx.files.get(handle) else { return Step::Done(Err(Error::BadHandle)) };
            if file.is_directory_handle {
                detach_and_remove(ctx, handle);
                return Step::Done(Ok(PendingOutput::Unit));
            }
            let Some(remote) = file.remote_handle else { return Step::Done(Err(Error::BadHandle)) };
            if file.writable() {
                op.phase = Phase::CloseMaybeSetExtent;
                return Step::IssueRpc(UnifiedCommand::SetSize { handle: remote, size: file.extent });
            }
            op.phase = Phase::CloseIssueClose;
            Step::IssueRpc(UnifiedCommand::Close { handle: remote })
        }
        Phase::CloseMaybeSetExtent => {
            let reply = reply.expect("resumed Close(extent) without a carried reply");
            if let Err(e) = reply {
                return Step::Done(Err(e));
            }
            let remote = ctx.files.get(handle).and_then(|f| f.remote_handle);
            let Some(remote) = remote else { return Step::Done(Err(Error::BadHandle)) };
            op.phase = Phase::CloseIssueClose;
            Step::IssueRpc(UnifiedCommand::Close { handle: remote })
        }
        Phase::CloseIssueClose => {
            let reply = reply.expect("resumed Close without a carried reply");
            if let Err(e) = reply {
                return Step::Done(Err(e));
            }
            let stamp = ctx.files.get(handle).and_then(|f| f.deferred_stamp);
            let node = ctx.files.get(handle).map(|f| f.node);
            let path = node.map(|n| ctx.cache.internal_path(n)).unwrap_or_default();
            if let Some((load_addr, exec_addr)) = stamp {
                op.phase = Phase::CloseMaybeSetStamp;
                return Step::IssueRpc(UnifiedCommand::SetStamp { path, load_addr, exec_addr });
            }
            finish_close_attr(op, ctx, handle)
        }
        Phase::CloseMaybeSetStamp => {
            let reply = reply.expect("resumed Close(stamp) without a carried reply");
            if let Err(e) = reply {
                return Step::Done(Err(e));
            }
            finish_close_attr(op, ctx, handle)
        }
        Phase::CloseMaybeSetAttr => {
            let reply = reply.expect("resumed Close(attr) without a carried reply");
            if let Err(e) = reply {
                return Step::Done(Err(e));
            }
            finish_close(ctx, handle, true)
        }
        other => panic!("Close op in unexpected phase {other:?}"),
    }
}

fn finish_close_attr(op: &mut PendingOp, ctx: &mut StepContext, handle: super::OpenFileKey) -> Step {
    let attr = ctx.files.get(handle).and_then(|f| f.deferred_attr);
    if let Some(attr) = attr {
        let node = ctx.files.get(handle).map(|f| f.node);
        let path = node.map(|n| ctx.cache.internal_path(n)).unwrap_or_default();
        op.phase = Phase::CloseMaybeSetAttr;
        return Step::IssueRpc(UnifiedCommand::SetAttr { path, attr });
    }
    let wrote = ctx.files.get(handle).map(|f| f.dirty || f.deferred_stamp.is_some()).unwrap_or(false);
    finish_close(ctx, handle, wrote)
}

fn finish_close(ctx: &mut StepContext, handle: super::OpenFileKey, invalidate: bool) -> Step {
    let node = ctx.files.get(handle).map(|f| f.node);
    if invalidate {
        if let Some(node) = node {
            if let Some(n) = ctx.cache.node_mut(node) {
                n.valid = false;
            }
        }
    }
    detach_and_remove(ctx, handle);
    Step::Done(Ok(PendingOutput::Unit))
}

fn detach_and_remove(ctx: &mut StepContext, handle: super::OpenFileKey) {
    if let Some(file) = ctx.files.get(handle) {
        let node = file.node;
        if let Some(n) = ctx.cache.node_mut(node) {
            if n.open_handle == Some(handle) {
                n.open_handle = None;
            }
        }
    }
    ctx.files.remove(handle);
}

fn step_args(ctx: &mut StepContext, handle: super::OpenFileKey) -> Step {
    match ctx.files.get(handle) {
        Some(f) => Step::Done(Ok(PendingOutput::Args {
            extent: f.extent,
            allocated: f.allocated,
            logical_seq_pos: f.logical_seq_pos,
        })),
        None => Step::Done(Err(Error::BadHandle)),
    }
}

fn step_read(
    op: &mut PendingOp,
    ctx: &mut StepContext,
    reply: Option<Result<UnifiedReply>>,
    handle: super::OpenFileKey,
    offset: u64,
    len: u32,
) -> Step {
    match op.phase {
        Phase::Start => {
            let Some(file) = ctx.files.get(handle) else { return Step::Done(Err(Error::BadHandle)) };
            let Some(remote) = file.remote_handle else { return Step::Done(Err(Error::BadHandle)) };
            if offset >= file.extent {
                return Step::Done(Ok(PendingOutput::Data(vec![0u8; len as usize])));
            }
            let readable = (file.extent - offset).min(len as u64) as u32;
            if file.logical_seq_pos != offset {
                op.phase = Phase::ReadMaybeSeek;
                return Step::IssueRpc(UnifiedCommand::Seek { handle: remote, offset });
            }
            op.phase = Phase::ReadIssueData;
            Step::IssueRpc(UnifiedCommand::Read { handle: remote, len: readable })
        }
        Phase::ReadMaybeSeek => {
            let reply = reply.expect("resumed Read(seek) without a carried reply");
            if let Err(e) = reply {
                return Step::Done(Err(e));
            }
            let Some(file) = ctx.files.get_mut(handle) else { return Step::Done(Err(Error::BadHandle)) };
            file.remote_seq_pos = offset;
            file.logical_seq_pos = offset;
            let remote = file.remote_handle.expect("checked on Start");
            let readable = (file.extent - offset).min(len as u64) as u32;
            op.phase = Phase::ReadIssueData;
            Step::IssueRpc(UnifiedCommand::Read { handle: remote, len: readable })
        }
        Phase::ReadIssueData => {
            let reply = reply.expect("resumed Read without a carried reply");
            Step::Done(reply.and_then(|r| match r {
                UnifiedReply::Read(mut data) => {
                    if let Some(file) = ctx.files.get_mut(handle) {
                        file.logical_seq_pos = offset + data.len() as u64;
                        file.remote_seq_pos = file.logical_seq_pos;
                    }
                    if (data.len() as u32) < len {
                        data.resize(len as usize, 0);
                    }
                    Ok(PendingOutput::Data(data))
                }
                _ => Err(Error::BadHeader),
            }))
        }
        other => panic!("Read op in unexpected phase {other:?}"),
    }
}

fn step_write(
    op: &mut PendingOp,
    ctx: &mut StepContext,
    reply: Option<Result<UnifiedReply>>,
    handle: super::OpenFileKey,
    offset: u64,
    data: Vec<u8>,
) -> Step {
    step_write_like(op, ctx, reply, handle, offset, data.len() as u64, move |remote| UnifiedCommand::Write {
        handle: remote,
        data: data.clone(),
    })
}

fn step_write_zeros(
    op: &mut PendingOp,
    ctx: &mut StepContext,
    reply: Option<Result<UnifiedReply>>,
    handle: super::OpenFileKey,
    offset: u64,
    len: u32,
) -> Step {
    step_write_like(op, ctx, reply, handle, offset, len as u64, move |remote| UnifiedCommand::WriteZeros {
        handle: remote,
        len,
    })
}

fn step_write_like(
    op: &mut PendingOp,
    ctx: &mut StepContext,
    reply: Option<Result<UnifiedReply>>,
    handle: super::OpenFileKey,
    offset: u64,
    len: u64,
    make_data_cmd: impl FnOnce(RemoteHandle) -> UnifiedCommand,
) -> Step {
    match op.phase {
        Phase::Start => {
            let Some(file) = ctx.files.get(handle) else { return Step::Done(Err(Error::BadHandle)) };
            if !file.writable() {
                return Step::Done(Err(Error::ReadOnly));
            }
            let Some(remote) = file.remote_handle else { return Step::Done(Err(Error::BadHandle)) };
            let needed = offset + len;
            if needed > file.allocated {
                let multiple = ctx.config.write_buffer_multiple.max(256);
                let rounded = needed.div_ceil(multiple) * multiple;
                op.phase = Phase::WriteMaybeAllocate;
                return Step::IssueRpc(UnifiedCommand::SetSize { handle: remote, size: rounded });
            }
            if file.logical_seq_pos != offset {
                op.phase = Phase::WriteMaybeSeek;
                return Step::IssueRpc(UnifiedCommand::Seek { handle: remote, offset });
            }
            op.phase = Phase::WriteIssueData;
            Step::IssueRpc(make_data_cmd(remote))
        }
        Phase::WriteMaybeAllocate => {
            let reply = reply.expect("resumed Write(allocate) without a carried reply");
            if let Err(e) = reply {
                return Step::Done(Err(e));
            }
            let Some(file) = ctx.files.get_mut(handle) else { return Step::Done(Err(Error::BadHandle)) };
            let multiple = ctx.config.write_buffer_multiple.max(256);
            file.allocated = (offset + len).div_ceil(multiple) * multiple;
            let remote = file.remote_handle.expect("checked on Start");
            if file.logical_seq_pos != offset {
                op.phase = Phase::WriteMaybeSeek;
                return Step::IssueRpc(UnifiedCommand::Seek { handle: remote, offset });
            }
            op.phase = Phase::WriteIssueData;
            Step::IssueRpc(make_data_cmd(remote))
        }
        Phase::WriteMaybeSeek => {
            let reply = reply.expect("resumed Write(seek) without a carried reply");
            if let Err(e) = reply {
                return Step::Done(Err(e));
            }
            let Some(file) = ctx.files.get_mut(handle) else { return Step::Done(Err(Error::BadHandle)) };
            file.remote_seq_pos = offset;
            file.logical_seq_pos = offset;
            let remote = file.remote_handle.expect("checked on Start");
            op.phase = Phase::WriteIssueData;
            Step::IssueRpc(make_data_cmd(remote))
        }
        Phase::WriteIssueData => {
            let reply = reply.expect("resumed Write without a carried reply");
            Step::Done(reply.map(|_| {
                if let Some(file) = ctx.files.get_mut(handle) {
                    file.logical_seq_pos = offset + len;
                    file.remote_seq_pos = file.logical_seq_pos;
                    file.extent = file.extent.max(offset + len);
                    file.dirty = true;
                }
                PendingOutput::Unit
            }))
        }
        other => panic!("Write op in unexpected phase {other:?}"),
    }
}

fn step_set_allocated(
    op: &mut PendingOp,
    ctx: &mut StepContext,
    reply: Option<Result<UnifiedReply>>,
    handle: super::OpenFileKey,
    size: u64,
) -> Step {
    let Some(file) = ctx.files.get(handle) else { return Step::Done(Err(Error::BadHandle)) };
    let Some(remote) = file.remote_handle else { return Step::Done(Err(Error::BadHandle)) };
    match op.phase {
        Phase::Start => {
            op.phase = Phase::AwaitingReply;
            Step::IssueRpc(UnifiedCommand::SetSize { handle: remote, size })
        }
        Phase::AwaitingReply => {
            let reply = reply.expect("resumed SetAllocated without a carried reply");
            Step::Done(reply.map(|_| {
                if let Some(file) = ctx.files.get_mut(handle) {
                    file.allocated = size;
                }
                PendingOutput::Unit
            }))
        }
        other => panic!("SetAllocated op in unexpected phase {other:?}"),
    }
}

fn step_set_extent(
    op: &mut PendingOp,
    ctx: &mut StepContext,
    reply: Option<Result<UnifiedReply>>,
    handle: super::OpenFileKey,
    size: u64,
) -> Step {
    let Some(file) = ctx.files.get(handle) else { return Step::Done(Err(Error::BadHandle)) };
    let Some(remote) = file.remote_handle else { return Step::Done(Err(Error::BadHandle)) };
    match op.phase {
        Phase::Start => {
            op.phase = Phase::AwaitingReply;
            Step::IssueRpc(UnifiedCommand::SetSize { handle: remote, size })
        }
        Phase::AwaitingReply => {
            let reply = reply.expect("resumed SetExtent without a carried reply");
            Step::Done(reply.map(|_| {
                if let Some(file) = ctx.files.get_mut(handle) {
                    file.extent = size;
                }
                PendingOutput::Unit
            }))
        }
        other => panic!("SetExtent op in unexpected phase {other:?}"),
    }
}

fn step_flush(op: &mut PendingOp, ctx: &mut StepContext, reply: Option<Result<UnifiedReply>>, handle: super::OpenFileKey) -> Step {
    let Some(file) = ctx.files.get(handle) else { return Step::Done(Err(Error::BadHandle)) };
    let Some(remote) = file.remote_handle else { return Step::Done(Err(Error::BadHandle)) };
    match op.phase {
        Phase::Start => {
            op.phase = Phase::AwaitingReply;
            Step::IssueRpc(UnifiedCommand::Flush { handle: remote })
        }
        Phase::AwaitingReply => {
            let reply = reply.expect("resumed Flush without a carried reply");
            Step::Done(reply.map(|_| PendingOutput::Unit))
        }
        other => panic!("Flush op in unexpected phase {other:?}"),
    }
}

/// Local-only unless the target grows past the current extent while
/// writable, in which case it is a resize (handled as a `Write`-style
/// allocate+extent bump with no data transfer).
fn step_set_sequential(ctx: &mut StepContext, handle: super::OpenFileKey, target: u64) -> Step {
    let Some(file) = ctx.files.get_mut(handle) else { return Step::Done(Err(Error::BadHandle)) };
    if target <= file.extent {
        file.logical_seq_pos = target;
        return Step::Done(Ok(PendingOutput::Unit));
    }
    if !file.writable() {
        return Step::Done(Err(Error::SeekOutsideExtent));
    }
    file.extent = target;
    file.allocated = file.allocated.max(target);
    file.logical_seq_pos = target;
    Step::Done(Ok(PendingOutput::Unit))
}
