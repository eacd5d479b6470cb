//! A caching directory-and-file proxy between a host filesystem and a
//! high-latency, single-link remote device (`spec.md` §1): a single
//! cooperative scheduler (`session`) drives a transport, a reconciling
//! directory cache, a pending-op state-machine queue, and a background
//! refresher, plus three thin engines above them for TAR backup, SIS
//! archive reading, clipboard transfer and print spooling.
//!
//! Embedding applications own a `Transport` impl and a clock; everything
//! else is driven through `Session::poll()`.

pub mod arena;
pub mod error;
pub mod wire;
pub mod transport;
pub mod rpc;
pub mod name;
pub mod cache;
pub mod pending_op;
pub mod refresher;
pub mod machine;
pub mod config;
pub mod crc16;
pub mod tar;
pub mod sis;
pub mod clipboard;
pub mod print;
pub mod session;

pub use error::{Error, Result};
pub use session::{Session, SessionStatus};
