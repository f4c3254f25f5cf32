//! The point-to-point tunnel data plane itself: the `Engine` context (replacing the
//! original's global route/host tables), C6's packet handler, C7's control dispatch,
//! and the small collaborator traits (`Link`, `NetUtils`, `PacketSource`) the host
//! environment implements.
//!
//! Everything upstream of this crate (C1 crypto, C2 key ring, C3 routing, C4 session,
//! C5 obfuscation, the C7 codec and C9 sender) lives in its own crate; this one is
//! where they're assembled into the decision tree spec.md §4.6 describes.

pub mod control_dispatch;
pub mod engine;
pub mod handler;
pub mod ip;
pub mod link;
pub mod mss;
pub mod role;

pub use engine::{Engine, KEY_RING_CAPACITY};
pub use handler::{Decision, DeliverTarget, PacketHandler};
pub use link::{Hook, Link, NetUtils, PacketSource};
pub use role::{Role, RoleOps};
