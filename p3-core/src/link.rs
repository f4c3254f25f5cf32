//! External interfaces (spec.md §6, SPEC_FULL §6 "[ADD]"): the packet hook and the
//! transmit path are expressed as traits so the real OS netfilter hook and the demo
//! binary's in-memory channel can share one `Engine`.

use p3_utils::error::P3Error;

/// Hook identifier the packet handler was invoked from (spec.md §4.6: "Inputs: a
/// packet buffer and a hook identifier").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    LocalOut,
    PreRouting,
    Forward,
}

/// The host environment's packet interception point (spec.md §6 "Packet hook").
/// A real implementation wraps the OS's NAT/netfilter registration (an explicit
/// Non-goal of the core, spec.md §1); this crate only consumes the trait.
pub trait PacketSource: Send + Sync {
    fn recv(&self) -> Option<(Hook, Vec<u8>)>;
}

/// The transmit path (spec.md §6 "Transmit": `send_packet(tunnel_bytes, peer,
/// forwarded_link) -> Result`). `Engine` holds one `dyn Link` per peer so direct and
/// forwarded delivery (`CFWD`) can be routed independently of the packet handler's
/// own control flow.
pub trait Link: Send + Sync {
    fn send_packet(&self, tunnel_bytes: &[u8], forwarded: bool) -> Result<(), P3Error>;
}

/// The remaining "Net utils" collaborators of spec.md §6 that reach outside the core:
/// interface MTU lookup for the MSS clamp (§4.6 step 4.d) and device-binding capture
/// for the raw bootstrap path (§4.6 step 4.b). `set_tcp_checksum` and
/// `recompute_tcp_checksum_full` are implemented directly in `mss.rs` since they need
/// no OS collaboration.
pub trait NetUtils: Send + Sync {
    fn get_mtu(&self, peer_id: p3_routing::PeerId) -> u16;
}

