//! The unified RPC layer: translates the 27 abstract commands (`spec.md`
//! §6) to and from wire frames for either of the two device dialects.
//!
//! Op codes below mirror `original_source/src/unified.h`'s `UNIFIED_*`
//! table (`UNIFIED_DRIVE` 0x00 through `UNIFIED_OWNER` 0x1a) so the ordinal
//! on the wire matches the source this was distilled from; the Rust names
//! follow `spec.md` §6's own command names instead of the source's
//! abbreviations (`UNIFIED_NAME` -> `DiscName`, `UNIFIED_ACCESS` ->
//! `SetAttr`, `UNIFIED_SIZE` -> `SetSize`, and so on).

use crate::error::{Error, Result};
use crate::wire::{
    read_counted_string, read_u16, read_u32, read_u64, read_u8, write_counted_string, write_u16,
    write_u32, write_u64, write_u8,
};
use std::io::Cursor;

/// Which of the two remote dialects a session has negotiated at
/// `start()`. A handful of later commands (process management) only
/// exist on the newer generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceGeneration {
    Series3,
    Series5,
}

impl DeviceGeneration {
    /// Whether this generation implements `op`. Callers get
    /// `Error::Unsupported` up front instead of a wire round trip that
    /// would only fail on the remote side.
    pub fn supports(&self, op: OpCode) -> bool {
        match self {
            DeviceGeneration::Series5 => true,
            DeviceGeneration::Series3 => !matches!(
                op,
                OpCode::TaskList
                    | OpCode::TaskDetail
                    | OpCode::Stop
                    | OpCode::Start
                    | OpCode::OwnerInfo
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    DriveInfo = 0x00,
    DiscName = 0x01,
    Enumerate = 0x02,
    Info = 0x03,
    Mkdir = 0x04,
    Remove = 0x05,
    Rmdir = 0x06,
    Rename = 0x07,
    SetAttr = 0x08,
    SetStamp = 0x09,
    Open = 0x0a,
    Close = 0x0b,
    Seek = 0x0c,
    Read = 0x0d,
    Write = 0x0e,
    WriteZeros = 0x0f,
    SetSize = 0x10,
    Flush = 0x11,
    MachineInfo = 0x12,
    TaskList = 0x13,
    TaskDetail = 0x14,
    Stop = 0x15,
    Start = 0x16,
    Power = 0x17,
    ReadTime = 0x18,
    WriteTime = 0x19,
    OwnerInfo = 0x1a,
}

impl OpCode {
    fn from_wire(v: u8) -> Result<Self> {
        use OpCode::*;
        Ok(match v {
            0x00 => DriveInfo,
            0x01 => DiscName,
            0x02 => Enumerate,
            0x03 => Info,
            0x04 => Mkdir,
            0x05 => Remove,
            0x06 => Rmdir,
            0x07 => Rename,
            0x08 => SetAttr,
            0x09 => SetStamp,
            0x0a => Open,
            0x0b => Close,
            0x0c => Seek,
            0x0d => Read,
            0x0e => Write,
            0x0f => WriteZeros,
            0x10 => SetSize,
            0x11 => Flush,
            0x12 => MachineInfo,
            0x13 => TaskList,
            0x14 => TaskDetail,
            0x15 => Stop,
            0x16 => Start,
            0x17 => Power,
            0x18 => ReadTime,
            0x19 => WriteTime,
            0x1a => OwnerInfo,
            _ => return Err(Error::BadHeader),
        })
    }
}

/// A handle the remote device assigned to a successful `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    File,
    Directory,
}

/// The size/attrs/timestamp/type fields the source calls `fs_info`.
/// Change detection in the directory cache (`cache.rs`) hashes
/// `(load_addr, exec_addr, size, attr, name)` from this struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub object_type: ObjectType,
    pub size: u64,
    pub load_addr: u32,
    pub exec_addr: u32,
    pub attr: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveInfoReply {
    pub present: bool,
    pub read_only: bool,
    pub name: String,
    pub size: u64,
    pub free: u64,
    pub unique_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineInfoReply {
    pub machine_type: String,
    pub machine_name: String,
    pub unique_id: u32,
    pub language: u32,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerReply {
    pub main_battery_ok: bool,
    pub backup_battery_ok: bool,
    pub external_power: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAction {
    Default,
    Create,
    Open,
    Run,
}

impl StartAction {
    fn to_byte(self) -> u8 {
        match self {
            StartAction::Default => b'\0',
            StartAction::Create => b'C',
            StartAction::Open => b'O',
            StartAction::Run => b'R',
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            b'\0' => StartAction::Default,
            b'C' => StartAction::Create,
            b'O' => StartAction::Open,
            b'R' => StartAction::Run,
            _ => return Err(Error::BadParams),
        })
    }
}

/// A RISC OS five-byte date: centiseconds since the epoch, split across a
/// 32-bit low word and a one-byte high extension on the wire. The source
/// leaves overflow of the high byte undefined; this rejects it instead of
/// truncating (an explicit decision, not a silent fix — see SPEC_FULL.md
/// §15).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiscosTime {
    pub centiseconds: u64,
}

impl RiscosTime {
    pub fn to_wire(self) -> Result<(u32, u8)> {
        let high = self.centiseconds >> 32;
        if high > 0xff {
            return Err(Error::BadParams);
        }
        Ok(((self.centiseconds & 0xffff_ffff) as u32, high as u8))
    }

    pub fn from_wire(low: u32, high: u8) -> Self {
        RiscosTime { centiseconds: ((high as u64) << 32) | low as u64 }
    }
}

const MAX_LEAF_LEN: usize = 255;
const RESERVED_CHARS: &[char] = &['/', '?', '*', ':', '<', '>', '|', '"'];

/// Pre-flight validation of a path's leaf name. The only check done
/// before transmission; the remote is the authority for everything else
/// (existence, permissions, wildcards within a directory component).
pub fn validate(path: &str) -> Result<()> {
    let leaf = path.rsplit(['.', '/']).next().unwrap_or(path);
    if leaf.is_empty() {
        return Err(Error::BadName);
    }
    if leaf.len() > MAX_LEAF_LEN {
        return Err(Error::BadName);
    }
    if leaf.chars().any(|c| RESERVED_CHARS.contains(&c)) {
        return Err(Error::BadName);
    }
    if leaf.contains('*') || leaf.contains('#') {
        return Err(Error::WildcardsForbidden);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnifiedCommand {
    DriveInfo { drive: u8 },
    DiscName { drive: u8, name: String },
    Enumerate { path: String, offset: i32 },
    Info { path: String },
    Mkdir { path: String },
    Remove { path: String },
    Rmdir { path: String },
    Rename { src: String, dest: String },
    SetAttr { path: String, attr: u32 },
    SetStamp { path: String, load_addr: u32, exec_addr: u32 },
    Open { path: String, mode: AccessMode, create: bool },
    Close { handle: RemoteHandle },
    Seek { handle: RemoteHandle, offset: u64 },
    Read { handle: RemoteHandle, len: u32 },
    Write { handle: RemoteHandle, data: Vec<u8> },
    WriteZeros { handle: RemoteHandle, len: u32 },
    SetSize { handle: RemoteHandle, size: u64 },
    Flush { handle: RemoteHandle },
    MachineInfo,
    TaskList,
    TaskDetail { name: String },
    Stop { name: String },
    Start { program: String, args: String, action: StartAction },
    Power,
    ReadTime,
    WriteTime { time: RiscosTime },
    OwnerInfo,
}

impl UnifiedCommand {
    pub fn op_code(&self) -> OpCode {
        match self {
            UnifiedCommand::DriveInfo { .. } => OpCode::DriveInfo,
            UnifiedCommand::DiscName { .. } => OpCode::DiscName,
            UnifiedCommand::Enumerate { .. } => OpCode::Enumerate,
            UnifiedCommand::Info { .. } => OpCode::Info,
            UnifiedCommand::Mkdir { .. } => OpCode::Mkdir,
            UnifiedCommand::Remove { .. } => OpCode::Remove,
            UnifiedCommand::Rmdir { .. } => OpCode::Rmdir,
            UnifiedCommand::Rename { .. } => OpCode::Rename,
            UnifiedCommand::SetAttr { .. } => OpCode::SetAttr,
            UnifiedCommand::SetStamp { .. } => OpCode::SetStamp,
            UnifiedCommand::Open { .. } => OpCode::Open,
            UnifiedCommand::Close { .. } => OpCode::Close,
            UnifiedCommand::Seek { .. } => OpCode::Seek,
            UnifiedCommand::Read { .. } => OpCode::Read,
            UnifiedCommand::Write { .. } => OpCode::Write,
            UnifiedCommand::WriteZeros { .. } => OpCode::WriteZeros,
            UnifiedCommand::SetSize { .. } => OpCode::SetSize,
            UnifiedCommand::Flush { .. } => OpCode::Flush,
            UnifiedCommand::MachineInfo => OpCode::MachineInfo,
            UnifiedCommand::TaskList => OpCode::TaskList,
            UnifiedCommand::TaskDetail { .. } => OpCode::TaskDetail,
            UnifiedCommand::Stop { .. } => OpCode::Stop,
            UnifiedCommand::Start { .. } => OpCode::Start,
            UnifiedCommand::Power => OpCode::Power,
            UnifiedCommand::ReadTime => OpCode::ReadTime,
            UnifiedCommand::WriteTime { .. } => OpCode::WriteTime,
            UnifiedCommand::OwnerInfo => OpCode::OwnerInfo,
        }
    }

    /// Validates any path-shaped fields, then encodes the command as a
    /// wire frame payload (op byte followed by fields, all little-endian).
    pub fn encode(&self, generation: DeviceGeneration) -> Result<Vec<u8>> {
        let op = self.op_code();
        if !generation.supports(op) {
            return Err(Error::Unsupported);
        }
        for path in self.paths() {
            validate(path)?;
        }
        let mut out = Vec::new();
        write_u8(&mut out, op as u8)?;
        match self {
            UnifiedCommand::DriveInfo { drive } => write_u8(&mut out, *drive)?,
            UnifiedCommand::DiscName { drive, name } => {
                write_u8(&mut out, *drive)?;
                write_counted_string(&mut out, name)?;
            }
            UnifiedCommand::Enumerate { path, offset } => {
                write_counted_string(&mut out, path)?;
                write_u32(&mut out, *offset as u32)?;
            }
            UnifiedCommand::Info { path }
            | UnifiedCommand::Mkdir { path }
            | UnifiedCommand::Remove { path }
            | UnifiedCommand::Rmdir { path } => {
                write_counted_string(&mut out, path)?;
            }
            UnifiedCommand::Rename { src, dest } => {
                write_counted_string(&mut out, src)?;
                write_counted_string(&mut out, dest)?;
            }
            UnifiedCommand::SetAttr { path, attr } => {
                write_counted_string(&mut out, path)?;
                write_u32(&mut out, *attr)?;
            }
            UnifiedCommand::SetStamp { path, load_addr, exec_addr } => {
                write_counted_string(&mut out, path)?;
                write_u32(&mut out, *load_addr)?;
                write_u32(&mut out, *exec_addr)?;
            }
            UnifiedCommand::Open { path, mode, create } => {
                write_counted_string(&mut out, path)?;
                write_u8(&mut out, mode_to_byte(*mode))?;
                write_u8(&mut out, *create as u8)?;
            }
            UnifiedCommand::Close { handle } => write_u32(&mut out, handle.0)?,
            UnifiedCommand::Seek { handle, offset } => {
                write_u32(&mut out, handle.0)?;
                write_u64(&mut out, *offset)?;
            }
            UnifiedCommand::Read { handle, len } => {
                write_u32(&mut out, handle.0)?;
                write_u32(&mut out, *len)?;
            }
            UnifiedCommand::Write { handle, data } => {
                write_u32(&mut out, handle.0)?;
                write_u32(&mut out, data.len() as u32)?;
                out.extend_from_slice(data);
            }
            UnifiedCommand::WriteZeros { handle, len } => {
                write_u32(&mut out, handle.0)?;
                write_u32(&mut out, *len)?;
            }
            UnifiedCommand::SetSize { handle, size } => {
                write_u32(&mut out, handle.0)?;
                write_u64(&mut out, *size)?;
            }
            UnifiedCommand::Flush { handle } => write_u32(&mut out, handle.0)?,
            UnifiedCommand::MachineInfo
            | UnifiedCommand::TaskList
            | UnifiedCommand::Power
            | UnifiedCommand::ReadTime
            | UnifiedCommand::OwnerInfo => {}
            UnifiedCommand::TaskDetail { name } | UnifiedCommand::Stop { name } => {
                write_counted_string(&mut out, name)?;
            }
            UnifiedCommand::Start { program, args, action } => {
                write_counted_string(&mut out, program)?;
                write_counted_string(&mut out, args)?;
                write_u8(&mut out, action.to_byte())?;
            }
            UnifiedCommand::WriteTime { time } => {
                let (low, high) = time.to_wire()?;
                write_u32(&mut out, low)?;
                write_u8(&mut out, high)?;
            }
        }
        Ok(out)
    }

    fn paths(&self) -> Vec<&str> {
        match self {
            UnifiedCommand::Info { path }
            | UnifiedCommand::Mkdir { path }
            | UnifiedCommand::Remove { path }
            | UnifiedCommand::Rmdir { path }
            | UnifiedCommand::SetAttr { path, .. }
            | UnifiedCommand::SetStamp { path, .. }
            | UnifiedCommand::Open { path, .. }
            | UnifiedCommand::Enumerate { path, .. } => vec![path],
            UnifiedCommand::Rename { src, dest } => vec![src, dest],
            _ => Vec::new(),
        }
    }

    /// Decodes the reply payload this command expects.
    pub fn decode_reply(&self, payload: &[u8]) -> Result<UnifiedReply> {
        let mut cur = Cursor::new(payload);
        Ok(match self {
            UnifiedCommand::DriveInfo { .. } => {
                let present = read_u8(&mut cur)? != 0;
                let read_only = read_u8(&mut cur)? != 0;
                let name = read_counted_string(&mut cur)?;
                let size = read_u64(&mut cur)?;
                let free = read_u64(&mut cur)?;
                let unique_id = read_u32(&mut cur)?;
                UnifiedReply::DriveInfo(DriveInfoReply { present, read_only, name, size, free, unique_id })
            }
            UnifiedCommand::DiscName { .. }
            | UnifiedCommand::Mkdir { .. }
            | UnifiedCommand::Remove { .. }
            | UnifiedCommand::Rmdir { .. }
            | UnifiedCommand::Rename { .. }
            | UnifiedCommand::SetAttr { .. }
            | UnifiedCommand::SetStamp { .. }
            | UnifiedCommand::Close { .. }
            | UnifiedCommand::Seek { .. }
            | UnifiedCommand::Write { .. }
            | UnifiedCommand::WriteZeros { .. }
            | UnifiedCommand::SetSize { .. }
            | UnifiedCommand::Flush { .. }
            | UnifiedCommand::Stop { .. }
            | UnifiedCommand::Start { .. }
            | UnifiedCommand::WriteTime { .. } => UnifiedReply::Ack,
            UnifiedCommand::Enumerate { .. } => {
                let count = read_u32(&mut cur)? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(read_entry_info(&mut cur)?);
                }
                let next_offset = read_u32(&mut cur)? as i32;
                UnifiedReply::Enumerate { entries, next_offset }
            }
            UnifiedCommand::Info { .. } => UnifiedReply::Info(read_entry_info(&mut cur)?),
            UnifiedCommand::Open { .. } => UnifiedReply::Open(RemoteHandle(read_u32(&mut cur)?)),
            UnifiedCommand::Read { .. } => {
                let actual_len = read_u32(&mut cur)? as usize;
                let mut buf = vec![0u8; actual_len];
                std::io::Read::read_exact(&mut cur, &mut buf).map_err(|_| Error::BadHeader)?;
                UnifiedReply::Read(buf)
            }
            UnifiedCommand::MachineInfo => {
                let machine_type = read_counted_string(&mut cur)?;
                let machine_name = read_counted_string(&mut cur)?;
                let unique_id = read_u32(&mut cur)?;
                let language = read_u32(&mut cur)?;
                let version = read_u32(&mut cur)?;
                UnifiedReply::MachineInfo(MachineInfoReply {
                    machine_type,
                    machine_name,
                    unique_id,
                    language,
                    version,
                })
            }
            UnifiedCommand::TaskList => {
                let count = read_u32(&mut cur)? as usize;
                let mut tasks = Vec::with_capacity(count);
                for _ in 0..count {
                    tasks.push(Task { name: read_counted_string(&mut cur)? });
                }
                UnifiedReply::TaskList(tasks)
            }
            UnifiedCommand::TaskDetail { .. } => {
                let program = read_counted_string(&mut cur)?;
                let args = read_counted_string(&mut cur)?;
                UnifiedReply::TaskDetail { program, args }
            }
            UnifiedCommand::Power => {
                let main_battery_ok = read_u8(&mut cur)? != 0;
                let backup_battery_ok = read_u8(&mut cur)? != 0;
                let external_power = read_u8(&mut cur)? != 0;
                UnifiedReply::Power(PowerReply { main_battery_ok, backup_battery_ok, external_power })
            }
            UnifiedCommand::ReadTime => {
                let low = read_u32(&mut cur)?;
                let high = read_u8(&mut cur)?;
                UnifiedReply::ReadTime(RiscosTime::from_wire(low, high))
            }
            UnifiedCommand::OwnerInfo => UnifiedReply::OwnerInfo(read_counted_string(&mut cur)?),
        })
    }
}

fn mode_to_byte(mode: AccessMode) -> u8 {
    match mode {
        AccessMode::Read => b'R',
        AccessMode::Write => b'W',
        AccessMode::Update => b'U',
    }
}

fn read_entry_info(cur: &mut Cursor<&[u8]>) -> Result<EntryInfo> {
    let name = read_counted_string(cur)?;
    let object_type = match read_u8(cur)? {
        0 => ObjectType::File,
        1 => ObjectType::Directory,
        _ => return Err(Error::BadHeader),
    };
    let size = read_u64(cur)?;
    let load_addr = read_u32(cur)?;
    let exec_addr = read_u32(cur)?;
    let attr = read_u32(cur)?;
    Ok(EntryInfo { name, object_type, size, load_addr, exec_addr, attr })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnifiedReply {
    Ack,
    DriveInfo(DriveInfoReply),
    Enumerate { entries: Vec<EntryInfo>, next_offset: i32 },
    Info(EntryInfo),
    Open(RemoteHandle),
    Read(Vec<u8>),
    MachineInfo(MachineInfoReply),
    TaskList(Vec<Task>),
    TaskDetail { program: String, args: String },
    Power(PowerReply),
    ReadTime(RiscosTime),
    OwnerInfo(String),
}

/// Maps a device-supplied status code to a local error kind where the
/// code names a condition this layer already has a variant for, falling
/// back to an opaque `RemoteError` otherwise. The exact code assignment
/// is this bridge's own convention, not dictated by either dialect.
pub fn translate_remote_error(code: u16) -> Error {
    match code {
        0x01 => Error::BufferTooSmall,
        0x02 => Error::NotFound,
        0x03 => Error::AlreadyExists,
        0x04 => Error::DirectoryNotEmpty,
        0x05 => Error::ReadOnly,
        0x06 => Error::SeekOutsideExtent,
        0x07 => Error::AccessDenied,
        0x08 => Error::ObjectOpen,
        0x09 => Error::BadHandle,
        _ => Error::RemoteError(code),
    }
}

/// Reads the op byte a reply frame is tagged with, for callers that
/// decode a raw transport payload without already holding the command
/// that produced it (diagnostics, `status()`).
pub fn peek_op_code(payload: &[u8]) -> Result<OpCode> {
    let byte = *payload.first().ok_or(Error::BadHeader)?;
    OpCode::from_wire(byte)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_reserved_characters() {
        assert!(validate("reports/q1?").is_err());
        assert!(validate("reports.ok").is_ok());
    }

    #[test]
    fn validate_rejects_wildcards() {
        assert!(validate("*.txt").is_err());
    }

    #[test]
    fn series3_rejects_task_management() {
        let cmd = UnifiedCommand::TaskList;
        assert!(cmd.encode(DeviceGeneration::Series3).is_err());
        assert!(cmd.encode(DeviceGeneration::Series5).is_ok());
    }

    #[test]
    fn drive_info_round_trips() {
        let cmd = UnifiedCommand::DriveInfo { drive: b'C' };
        let frame = cmd.encode(DeviceGeneration::Series5).unwrap();
        assert_eq!(frame[0], OpCode::DriveInfo as u8);

        let mut reply = Vec::new();
        write_u8(&mut reply, 1).unwrap();
        write_u8(&mut reply, 0).unwrap();
        write_counted_string(&mut reply, "Internal").unwrap();
        write_u64(&mut reply, 1_000_000).unwrap();
        write_u64(&mut reply, 500_000).unwrap();
        write_u32(&mut reply, 42).unwrap();

        let decoded = cmd.decode_reply(&reply).unwrap();
        assert_eq!(
            decoded,
            UnifiedReply::DriveInfo(DriveInfoReply {
                present: true,
                read_only: false,
                name: "Internal".into(),
                size: 1_000_000,
                free: 500_000,
                unique_id: 42,
            })
        );
    }

    #[test]
    fn write_time_rejects_overflowing_high_byte() {
        let time = RiscosTime { centiseconds: (0x100u64) << 32 };
        assert_eq!(time.to_wire(), Err(Error::BadParams));
    }

    #[test]
    fn write_time_round_trips_within_range() {
        let time = RiscosTime { centiseconds: (0xabu64 << 32) | 0x1234_5678 };
        let (low, high) = time.to_wire().unwrap();
        assert_eq!(RiscosTime::from_wire(low, high), time);
    }

    #[test]
    fn enumerate_negative_offset_means_end() {
        let cmd = UnifiedCommand::Enumerate { path: "disc".into(), offset: -1 };
        let mut reply = Vec::new();
        write_u32(&mut reply, 0).unwrap();
        write_u32(&mut reply, (-1i32) as u32).unwrap();
        match cmd.decode_reply(&reply).unwrap() {
            UnifiedReply::Enumerate { entries, next_offset } => {
                assert!(entries.is_empty());
                assert_eq!(next_offset, -1);
            }
            _ => panic!("wrong reply variant"),
        }
    }
}
