//! In-memory stand-ins for the host environment's packet hook and transmit path
//! (SPEC_FULL §6 "[ADD]"): a real deployment wires `p3_core::PacketSource`/`Link`
//! to the OS's NAT/netfilter hook, which is out of scope for this crate (spec.md §1
//! Non-goals). This demo uses a channel and a log line instead.

use std::sync::mpsc::{Receiver, Sender};
use std::time::Duration;

use tracing::info;

use p3_core::{Hook, Link, NetUtils, PacketSource};
use p3_routing::PeerId;
use p3_utils::error::P3Result;

pub struct ChannelPacketSource {
    rx: Receiver<(Hook, Vec<u8>)>,
    poll_timeout: Duration,
}

impl ChannelPacketSource {
    pub fn new(rx: Receiver<(Hook, Vec<u8>)>, poll_timeout: Duration) -> Self {
        Self { rx, poll_timeout }
    }
}

impl PacketSource for ChannelPacketSource {
    fn recv(&self) -> Option<(Hook, Vec<u8>)> {
        self.rx.recv_timeout(self.poll_timeout).ok()
    }
}

/// Hands a would-be wire packet back into the same process's channel rather than an
/// actual socket, so the demo can be driven without root or a real NIC.
pub struct LoopbackLink {
    peer_id: PeerId,
    tx: Sender<Vec<u8>>,
}

impl LoopbackLink {
    pub fn new(peer_id: PeerId, tx: Sender<Vec<u8>>) -> Self {
        Self { peer_id, tx }
    }
}

impl Link for LoopbackLink {
    fn send_packet(&self, tunnel_bytes: &[u8], forwarded: bool) -> P3Result<()> {
        info!(peer_id = self.peer_id.get(), len = tunnel_bytes.len(), forwarded, "transmitting tunnel packet");
        let _ = self.tx.send(tunnel_bytes.to_vec());
        Ok(())
    }
}

/// A fixed per-peer MTU; a real binary would read this from the outbound
/// interface (spec.md §6 "Net utils: get_mtu(peer)").
pub struct StaticMtu(pub u16);

impl NetUtils for StaticMtu {
    fn get_mtu(&self, _peer_id: PeerId) -> u16 {
        self.0
    }
}
