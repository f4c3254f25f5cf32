use std::net::IpAddr;

use p3_crypto::KeyType;

use crate::subnet::Subnet;

/// Maximum number of subnets a single peer may own (spec.md §3: "its subnet list (up to 15)").
pub const MAX_SUBNETS_PER_PEER: usize = 15;

/// A 20-bit peer identifier (spec.md §3, "Peer. Identifier space: 20-bit peer ID").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u32);

impl PeerId {
    pub const MAX: u32 = (1 << 20) - 1;

    pub fn new(id: u32) -> Option<Self> {
        if id <= Self::MAX {
            Some(Self(id))
        } else {
            None
        }
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// Per-peer configuration, immutable after creation (spec.md §3: "address and subnet
/// list are immutable after creation").
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub ip_version: IpVersion,
    pub address: IpAddr,
    pub listener_port: u16,
    pub heartbeat_period_ms: u32,
    pub heartbeat_failure_deadline_ms: u32,
    pub key_type: KeyType,
    pub key_arrays_permitted: bool,
    /// [ADD, see SPEC_FULL.md §3] peers sharing a key-array broadcast group, mirroring
    /// `original_source`'s `p3pri_key_server.c` group concept. `None` means "no group".
    pub key_group: Option<u16>,
    subnets: Vec<Subnet>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PeerBuildError {
    #[error("a peer may own at most {} subnets", MAX_SUBNETS_PER_PEER)]
    TooManySubnets,
}

impl Peer {
    pub fn new(
        id: PeerId,
        ip_version: IpVersion,
        address: IpAddr,
        listener_port: u16,
        heartbeat_period_ms: u32,
        heartbeat_failure_deadline_ms: u32,
        key_type: KeyType,
        key_arrays_permitted: bool,
        key_group: Option<u16>,
    ) -> Self {
        Self {
            id,
            ip_version,
            address,
            listener_port,
            heartbeat_period_ms,
            heartbeat_failure_deadline_ms,
            key_type,
            key_arrays_permitted,
            key_group,
            subnets: Vec::new(),
        }
    }

    pub fn subnets(&self) -> &[Subnet] {
        &self.subnets
    }

    pub(crate) fn subnets_mut(&mut self) -> &mut [Subnet] {
        &mut self.subnets
    }

    pub(crate) fn push_subnet(&mut self, s: Subnet) -> Result<(), PeerBuildError> {
        if self.subnets.len() >= MAX_SUBNETS_PER_PEER {
            return Err(PeerBuildError::TooManySubnets);
        }
        self.subnets.push(s);
        Ok(())
    }
}
