use std::collections::HashMap;
use std::net::IpAddr;

use p3_utils::error::P3Error;

use crate::peer::{IpVersion, Peer, PeerId};
use crate::subnet::{DeviceKind, Subnet};

/// The result of a single classification pass over a packet's source and destination
/// addresses (spec.md §4.3: "classify(ip_packet) -> {Local, FromPeer(...), ToPeer(...)}").
///
/// Expressed as independent flags rather than one enum because the packet handler (C6)
/// needs to reason about source and destination membership separately (e.g. a packet
/// can simultaneously have `source_is_subnet` set for a local route and `dest_is_peer`
/// set for a remote one).
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyFlags {
    pub source_is_peer: Option<PeerId>,
    pub source_is_subnet: Option<PeerId>,
    pub dest_is_peer: Option<PeerId>,
    pub dest_is_subnet: Option<PeerId>,
}

struct RouteEntry {
    network: IpAddr,
    prefix_len: u8,
    owner: PeerId,
}

/// One IPv4 and one IPv6 route table, a peer-address index, and the peer registry
/// itself (spec.md §4.3). At the scale this system targets (tens of peers/subnets) a
/// linear scan with a longest-prefix tie-break is acceptable, per spec.md §4.3.
#[derive(Default)]
pub struct RoutingTable {
    peers: HashMap<PeerId, Peer>,
    peer_by_addr: HashMap<IpAddr, PeerId>,
    routes_v4: Vec<RouteEntry>,
    routes_v6: Vec<RouteEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration-import path only (spec.md §5: "insertions happen only from the
    /// configuration import path ... before packet interception begins or under a
    /// separate writer lock").
    pub fn add_peer(&mut self, peer: Peer) -> Result<(), P3Error> {
        if self.peers.contains_key(&peer.id) {
            return Err(P3Error::ConfigInvalid("duplicate peer id"));
        }
        if self.peer_by_addr.contains_key(&peer.address) {
            return Err(P3Error::ConfigInvalid("duplicate peer address"));
        }
        self.peer_by_addr.insert(peer.address, peer.id);
        self.peers.insert(peer.id, peer);
        Ok(())
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn peer_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    /// Add a route. Fails if a duplicate `(network, prefix_len)` already exists, or if
    /// `network` has nonzero host bits under `prefix_len` (spec.md §3 invariant,
    /// Testable Property 4).
    pub fn add_subnet(&mut self, owner: PeerId, network: IpAddr, prefix_len: u8) -> Result<(), P3Error> {
        if !Subnet::host_bits_are_zero(network, prefix_len) {
            return Err(P3Error::ConfigInvalid("subnet host bits must be zero"));
        }
        let table = match network {
            IpAddr::V4(_) => &mut self.routes_v4,
            IpAddr::V6(_) => &mut self.routes_v6,
        };
        if table.iter().any(|r| r.network == network && r.prefix_len == prefix_len) {
            return Err(P3Error::ConfigInvalid("duplicate route"));
        }
        table.push(RouteEntry { network, prefix_len, owner });

        let peer = self.peers.get_mut(&owner).ok_or(P3Error::ConfigInvalid("unknown peer"))?;
        peer.push_subnet(Subnet { network, prefix_len, owner, devices: Default::default(), active: false })
            .map_err(|_| P3Error::ConfigInvalid("too many subnets for peer"))?;
        Ok(())
    }

    fn longest_prefix_match(&self, addr: &IpAddr) -> Option<PeerId> {
        let table = match addr {
            IpAddr::V4(_) => &self.routes_v4,
            IpAddr::V6(_) => &self.routes_v6,
        };
        let mut best: Option<&RouteEntry> = None;
        for r in table {
            if Self::route_contains(r, addr) {
                if best.map_or(true, |b| r.prefix_len > b.prefix_len) {
                    best = Some(r);
                }
            }
        }
        best.map(|r| r.owner)
    }

    fn route_contains(r: &RouteEntry, addr: &IpAddr) -> bool {
        match (r.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(a)) => {
                let mask = if r.prefix_len == 0 { 0 } else { !0u32 << (32 - r.prefix_len.min(32)) };
                (u32::from(net) & mask) == (u32::from(*a) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(a)) => {
                let mask = if r.prefix_len == 0 { 0 } else { !0u128 << (128 - r.prefix_len.min(128)) };
                (u128::from(net) & mask) == (u128::from(*a) & mask)
            }
            _ => false,
        }
    }

    /// Single lookup pass used by the packet handler (spec.md §4.3, §4.6 step 1).
    pub fn classify(&self, src: IpAddr, dst: IpAddr) -> ClassifyFlags {
        ClassifyFlags {
            source_is_peer: self.peer_by_addr.get(&src).copied(),
            source_is_subnet: self.longest_prefix_match(&src),
            dest_is_peer: self.peer_by_addr.get(&dst).copied(),
            dest_is_subnet: self.longest_prefix_match(&dst),
        }
    }

    /// Mark all of `owner`'s subnets Active and record which device binding was
    /// populated (spec.md §4.6 step 4.b, and S6: bootstrap raw packet activation).
    pub fn activate_peer_subnets(&mut self, owner: PeerId, kind: DeviceKind) {
        if let Some(peer) = self.peers.get_mut(&owner) {
            for s in peer.subnets_mut() {
                s.active = true;
                match kind {
                    DeviceKind::InboundDev => s.devices.inbound_dev = true,
                    DeviceKind::OutboundDev => s.devices.outbound_dev = true,
                    DeviceKind::Raw => s.devices.raw_dev = true,
                    DeviceKind::Forward => {}
                }
            }
        }
    }

    pub fn is_peer_active(&self, id: PeerId) -> bool {
        self.peers.get(&id).map_or(false, |p| p.subnets().iter().any(|s| s.active) || p.subnets().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p3_crypto::KeyType;
    use std::net::Ipv4Addr;

    fn mkpeer(id: u32, addr: Ipv4Addr) -> Peer {
        Peer::new(
            PeerId::new(id).unwrap(),
            IpVersion::V4,
            IpAddr::V4(addr),
            5653,
            25000,
            65000,
            KeyType::Aes256,
            false,
            None,
        )
    }

    #[test]
    fn duplicate_route_rejected() {
        let mut t = RoutingTable::new();
        t.add_peer(mkpeer(1, Ipv4Addr::new(10, 0, 0, 2))).unwrap();
        t.add_subnet(PeerId::new(1).unwrap(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 0)), 24).unwrap();
        let err = t.add_subnet(PeerId::new(1).unwrap(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 0)), 24);
        assert!(err.is_err());
    }

    #[test]
    fn nonzero_host_bits_rejected() {
        let mut t = RoutingTable::new();
        t.add_peer(mkpeer(1, Ipv4Addr::new(10, 0, 0, 2))).unwrap();
        let err = t.add_subnet(PeerId::new(1).unwrap(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)), 24);
        assert!(err.is_err());
    }

    #[test]
    fn longest_prefix_wins() {
        let mut t = RoutingTable::new();
        t.add_peer(mkpeer(1, Ipv4Addr::new(10, 0, 0, 2))).unwrap();
        t.add_peer(mkpeer(2, Ipv4Addr::new(10, 0, 0, 3))).unwrap();
        t.add_subnet(PeerId::new(1).unwrap(), IpAddr::V4(Ipv4Addr::new(192, 168, 0, 0)), 16).unwrap();
        t.add_subnet(PeerId::new(2).unwrap(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 0)), 24).unwrap();
        let flags = t.classify(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)));
        assert_eq!(flags.dest_is_subnet, PeerId::new(2));
    }

    #[test]
    fn source_is_peer_detected_by_address() {
        let mut t = RoutingTable::new();
        t.add_peer(mkpeer(1, Ipv4Addr::new(10, 0, 0, 2))).unwrap();
        let flags = t.classify(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));
        assert_eq!(flags.source_is_peer, PeerId::new(1));
    }
}
