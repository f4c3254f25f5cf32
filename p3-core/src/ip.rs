//! Minimal IPv4/IPv6 + TCP/UDP field access used by the classifier and the MSS clamp.
//! The original (`p3knet.c`) reads these fields directly off `struct iphdr`/`tcphdr`;
//! here they're pulled out as free functions over a byte slice rather than cast
//! through a packed struct, since the packet buffer's origin (host stack vs. our own
//! freshly-built inner packet) isn't uniform enough to assume a fixed layout type.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use p3_utils::error::P3Error;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

pub struct IpInfo {
    pub is_v6: bool,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub header_len: usize,
    pub total_len: usize,
}

/// Parse just enough of an IPv4/IPv6 header to classify and route the packet
/// (spec.md §4.6 step 1's "single lookup pass" over `classify`).
pub fn parse_ip(buf: &[u8]) -> Result<IpInfo, P3Error> {
    if buf.is_empty() {
        return Err(P3Error::OverSize);
    }
    match buf[0] >> 4 {
        4 => {
            if buf.len() < 20 {
                return Err(P3Error::OverSize);
            }
            let ihl = (buf[0] & 0x0f) as usize * 4;
            if buf.len() < ihl {
                return Err(P3Error::OverSize);
            }
            Ok(IpInfo {
                is_v6: false,
                src: IpAddr::V4(Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15])),
                dst: IpAddr::V4(Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19])),
                protocol: buf[9],
                header_len: ihl,
                total_len: u16::from_be_bytes([buf[2], buf[3]]) as usize,
            })
        }
        6 => {
            if buf.len() < 40 {
                return Err(P3Error::OverSize);
            }
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&buf[8..24]);
            dst.copy_from_slice(&buf[24..40]);
            Ok(IpInfo {
                is_v6: true,
                src: IpAddr::V6(Ipv6Addr::from(src)),
                dst: IpAddr::V6(Ipv6Addr::from(dst)),
                protocol: buf[6],
                header_len: 40,
                total_len: 40 + u16::from_be_bytes([buf[4], buf[5]]) as usize,
            })
        }
        _ => Err(P3Error::OverSize),
    }
}

/// Source and destination ports share the same offset (bytes 0..4 after the IP
/// header) in both the TCP and UDP fixed headers.
pub fn ports(buf: &[u8], header_len: usize) -> Option<(u16, u16)> {
    if buf.len() < header_len + 4 {
        return None;
    }
    let src = u16::from_be_bytes([buf[header_len], buf[header_len + 1]]);
    let dst = u16::from_be_bytes([buf[header_len + 2], buf[header_len + 3]]);
    Some((src, dst))
}

/// Is the TCP segment starting at `header_len` a SYN, and does it carry `port` as
/// either its source or destination (spec.md §4.6 steps 3.c / 4.a, "bootstrap
/// session-init")?
pub fn is_syn_on_port(buf: &[u8], header_len: usize, port: u16) -> bool {
    if buf.len() < header_len + 14 {
        return false;
    }
    let syn = buf[header_len + 13] & 0x02 != 0;
    let Some((src, dst)) = ports(buf, header_len) else { return false };
    syn && (src == port || dst == port)
}
