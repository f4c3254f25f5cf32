//! C3: Routing Table, plus the Peer/Subnet data model of spec.md §3.
//!
//! Re-architected per the Design Notes (spec.md §9): the original's intrusive
//! singly-linked `ipv4route`/`ipv6route`/`p3hosts` globals become one keyed container
//! (a hash-indexed peer table plus a per-IP-version ordered-prefix list for routes),
//! owned by the `Engine` rather than living at module scope.

pub mod peer;
pub mod subnet;
pub mod table;

pub use peer::{IpVersion, Peer, PeerId};
pub use subnet::Subnet;
pub use table::{ClassifyFlags, RoutingTable};
