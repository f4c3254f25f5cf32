//! The abstract error taxonomy of spec.md §7, shared by every crate in the workspace.
//!
//! Inside the packet handler every variant degrades to "drop this packet" (spec.md §7,
//! "Propagation policy"); only configuration import and startup allocation/hook failures
//! are allowed to actually fail an outer call.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum P3Error {
    /// Packet is neither from a peer nor destined to one. Not actually an error: callers
    /// map this to `Decision::Unmodified`, but it is listed here so the taxonomy is complete.
    #[error("no route matched")]
    NoMatch,

    #[error("peer network is not active")]
    NotActive,

    #[error("session is rekeying")]
    Rekeying,

    #[error("packet exceeds maximum tunnel size")]
    OverSize,

    #[error("decryption failed")]
    DecryptFailure,

    #[error("deobfuscation failed")]
    DeobfuscateFailure,

    #[error("key ring has no key of the requested width available")]
    NoKey,

    #[error("allocation of per-packet work buffer failed")]
    AllocFailure,

    #[error("control message malformed: {0}")]
    BadControl(&'static str),

    #[error("configuration invalid: {0}")]
    ConfigInvalid(&'static str),
}

pub type P3Result<T> = Result<T, P3Error>;
