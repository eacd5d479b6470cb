//! Error taxonomy shared by every layer of the bridge.
//!
//! Kinds are deliberately closed (no textual codes, no embedded context) so
//! that callers can match on them exhaustively. `RemoteError` carries a
//! device-supplied status code unmodified rather than collapsing it into a
//! generic variant — see `original_source/src/unified.h`'s `os_error`
//! pass-through discipline, which this replaces.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("bad parameters")]
    BadParams,
    #[error("bad name")]
    BadName,
    #[error("bad drive")]
    BadDrive,
    #[error("wildcards forbidden")]
    WildcardsForbidden,

    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("read only")]
    ReadOnly,
    #[error("seek outside extent")]
    SeekOutsideExtent,
    #[error("access denied")]
    AccessDenied,
    #[error("object open")]
    ObjectOpen,
    #[error("bad handle")]
    BadHandle,

    #[error("link broken")]
    LinkBroken,
    #[error("timeout")]
    Timeout,
    #[error("remote error {0}")]
    RemoteError(u16),
    #[error("unsupported operation")]
    Unsupported,

    /// Internal only: always recovered by the queue driver growing the
    /// enumerate buffer and retrying. Never reaches a client callback.
    #[error("buffer too small")]
    BufferTooSmall,

    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("bad header")]
    BadHeader,

    /// Delivered to in-flight callbacks when `Session::end(true)` aborts
    /// the session instead of draining it.
    #[error("link closed")]
    LinkClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
