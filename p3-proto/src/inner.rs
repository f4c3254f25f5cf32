//! The inner, UDP-shaped control frame carried inside a tunnel packet once decrypted
//! and deobfuscated (spec.md §6, "Inner control frame"). 28 bytes of IP+UDP header
//! wrap the encrypted control body; source and destination ports are both the peer's
//! configured listener port (default 5653).

use std::net::{IpAddr, Ipv4Addr};

use p3_utils::error::P3Error;

pub const DEFAULT_LISTENER_PORT: u16 = 5653;
pub const INNER_IP_HEADER_LEN: usize = 20;
pub const INNER_UDP_HEADER_LEN: usize = 8;
pub const INNER_HEADER_LEN: usize = INNER_IP_HEADER_LEN + INNER_UDP_HEADER_LEN;

/// Build the 28-byte inner IPv4+UDP header for a control frame whose aligned body is
/// `body_len` bytes (spec.md §4.9 step 3, "IPv4 checksum over the inner header").
pub fn build_inner_udp_header(local: IpAddr, peer: IpAddr, port: u16, body_len: usize) -> Result<[u8; INNER_HEADER_LEN], P3Error> {
    let (local, peer) = match (local, peer) {
        (IpAddr::V4(l), IpAddr::V4(p)) => (l, p),
        _ => return Err(P3Error::ConfigInvalid("inner control frame only defined for IPv4 addresses")),
    };
    let udp_len = INNER_UDP_HEADER_LEN + body_len;
    let total_len = INNER_IP_HEADER_LEN + udp_len;
    if total_len > 0xffff {
        return Err(P3Error::OverSize);
    }

    let mut h = [0u8; INNER_HEADER_LEN];
    h[0] = 0x45;
    h[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    h[8] = 64; // ttl
    h[9] = 17; // UDP
    write_v4(&mut h, 12, local);
    write_v4(&mut h, 16, peer);
    let csum = crate::outer::ipv4_checksum(&h[..INNER_IP_HEADER_LEN]);
    h[10..12].copy_from_slice(&csum.to_be_bytes());

    h[20..22].copy_from_slice(&port.to_be_bytes());
    h[22..24].copy_from_slice(&port.to_be_bytes());
    h[24..26].copy_from_slice(&(udp_len as u16).to_be_bytes());
    // UDP checksum left as 0 (optional over IPv4); the control body is already
    // integrity-protected by the outer encryption layer.

    Ok(h)
}

fn write_v4(buf: &mut [u8], offset: usize, addr: Ipv4Addr) {
    buf[offset..offset + 4].copy_from_slice(&addr.octets());
}

/// The declared UDP payload length of a parsed inner header, used to recover the
/// aligned control-body length on receive.
pub fn udp_payload_len(header: &[u8; INNER_HEADER_LEN]) -> usize {
    let udp_len = u16::from_be_bytes([header[24], header[25]]) as usize;
    udp_len.saturating_sub(INNER_UDP_HEADER_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_consistent_header() {
        let h = build_inner_udp_header("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), DEFAULT_LISTENER_PORT, 48).unwrap();
        assert_eq!(udp_payload_len(&h), 48);
        assert_eq!(u16::from_be_bytes([h[20], h[21]]), DEFAULT_LISTENER_PORT);
        assert_eq!(u16::from_be_bytes([h[22], h[23]]), DEFAULT_LISTENER_PORT);
    }
}
