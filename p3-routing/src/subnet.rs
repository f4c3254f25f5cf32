use std::net::IpAddr;

use crate::peer::PeerId;

/// Which OS-dependent device bindings have been populated for a subnet (spec.md §3:
/// "a set of flags recording whether OS-dependent 'inbound device,' 'outbound device,'
/// and 'raw socket device' information has been populated").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFlags {
    pub inbound_dev: bool,
    pub outbound_dev: bool,
    pub raw_dev: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    InboundDev,
    OutboundDev,
    Raw,
    Forward,
}

/// A network reachable through a peer (spec.md §3: "Subnet").
#[derive(Debug, Clone)]
pub struct Subnet {
    pub network: IpAddr,
    pub prefix_len: u8,
    pub owner: PeerId,
    pub devices: DeviceFlags,
    /// Bootstrap activation state: subnets become reachable only once the peer's raw
    /// bootstrap packet has been received (spec.md §4.6, step 4.b, and S6).
    pub active: bool,
}

impl Subnet {
    /// Host bits of `network` must be zero under `prefix_len` (spec.md §3 invariant,
    /// enforced at insertion in `RoutingTable::add`).
    pub fn host_bits_are_zero(network: IpAddr, prefix_len: u8) -> bool {
        match network {
            IpAddr::V4(v4) => {
                let bits = u32::from(v4);
                let mask = if prefix_len == 0 { 0 } else { !0u32 << (32 - prefix_len.min(32)) };
                bits & !mask == 0
            }
            IpAddr::V6(v6) => {
                let bits = u128::from(v6);
                let mask = if prefix_len == 0 { 0 } else { !0u128 << (128 - prefix_len.min(128)) };
                bits & !mask == 0
            }
        }
    }

    /// Does `addr` fall within this subnet?
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(a)) => {
                let mask = if self.prefix_len == 0 { 0 } else { !0u32 << (32 - self.prefix_len.min(32)) };
                (u32::from(net) & mask) == (u32::from(*a) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(a)) => {
                let mask = if self.prefix_len == 0 { 0 } else { !0u128 << (128 - self.prefix_len.min(128)) };
                (u128::from(net) & mask) == (u128::from(*a) & mask)
            }
            _ => false,
        }
    }
}
