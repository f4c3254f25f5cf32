//! MSS clamp (spec.md §4.6 step 4.d, §6 "MSS clamps"). Scans a TCP SYN's option list
//! and either rewrites an existing MSS option downward or, if none is present, inserts
//! one sized from the local interface MTU.
//!
//! Operates directly on the TCP segment bytes (header + options + payload), starting
//! at `tcp_offset` within a caller-owned buffer; the caller (C6) is responsible for
//! adjusting the enclosing IP header's total-length field by `bytes_inserted` when this
//! clamp grows the segment.

use p3_utils::error::P3Error;

pub const MSS_MAX: u16 = 1440;
/// IPv4 overhead subtracted from `MSS_MAX` (spec.md §6): outer header + trailer +
/// inner IP/TCP fixed headers.
pub const MSS_CLAMP_V4: u16 = MSS_MAX - 52;
pub const MSS_CLAMP_V6: u16 = MSS_MAX - 72;
pub const MIN_MSS: u16 = 536;

const TCP_FIXED_HEADER_LEN: usize = 20;
const TCP_FLAG_SYN: u8 = 0x02;
const OPT_EOL: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_MSS_LEN: u8 = 4;
/// 15 * 4 bytes: the data-offset field is a 4-bit word count, so this is the largest a
/// TCP header (including options) can ever be.
const MAX_TCP_HEADER_LEN: usize = 60;

pub struct MssClampResult {
    pub modified: bool,
    /// Bytes inserted into the segment (0, or 4 when an MSS option had to be added).
    /// The caller must grow the enclosing IP packet's total length by this amount.
    pub bytes_inserted: usize,
}

fn data_offset_bytes(tcp: &[u8], tcp_offset: usize) -> usize {
    ((tcp[tcp_offset + 12] >> 4) as usize) * 4
}

fn set_data_offset_bytes(tcp: &mut [u8], tcp_offset: usize, len: usize) {
    let words = (len / 4) as u8;
    tcp[tcp_offset + 12] = (words << 4) | (tcp[tcp_offset + 12] & 0x0f);
}

/// Is this segment a TCP SYN? (spec.md §4.6 step 4.d applies only to SYN packets.)
pub fn is_tcp_syn(tcp: &[u8], tcp_offset: usize) -> bool {
    tcp.len() > tcp_offset + 13 && tcp[tcp_offset + 13] & TCP_FLAG_SYN != 0
}

/// Clamp (or insert) the MSS option of a TCP SYN in place. `tcp` must contain at least
/// the full TCP header/options region starting at `tcp_offset`; grows in place (via
/// `Vec::splice`) if an MSS option must be inserted. Returns whether anything changed
/// and how many bytes were inserted, so the caller can fix up the IP total length.
pub fn clamp_syn_mss(tcp: &mut Vec<u8>, tcp_offset: usize, is_v6: bool, interface_mtu: u16) -> Result<MssClampResult, P3Error> {
    if !is_tcp_syn(tcp, tcp_offset) {
        return Ok(MssClampResult { modified: false, bytes_inserted: 0 });
    }

    let clamp = if is_v6 { MSS_CLAMP_V6 } else { MSS_CLAMP_V4 };
    let header_len = data_offset_bytes(tcp, tcp_offset);
    let opts_start = tcp_offset + TCP_FIXED_HEADER_LEN;
    let opts_len = header_len.saturating_sub(TCP_FIXED_HEADER_LEN);

    let mut cursor = 0usize;
    while cursor < opts_len {
        let kind = tcp[opts_start + cursor];
        match kind {
            OPT_EOL => {
                // Rewrite as NOP so the scan can keep walking to the end of the
                // options region rather than stopping at the first padding byte.
                tcp[opts_start + cursor] = OPT_NOP;
                cursor += 1;
            }
            OPT_NOP => cursor += 1,
            OPT_MSS => {
                if cursor + 4 > opts_len {
                    return Err(P3Error::BadControl("truncated MSS option"));
                }
                let current = u16::from_be_bytes([tcp[opts_start + cursor + 2], tcp[opts_start + cursor + 3]]);
                if current > clamp {
                    let new_mss = clamp.max(MIN_MSS);
                    tcp[opts_start + cursor + 2..opts_start + cursor + 4].copy_from_slice(&new_mss.to_be_bytes());
                    recompute_tcp_checksum_full(tcp, tcp_offset);
                    return Ok(MssClampResult { modified: true, bytes_inserted: 0 });
                }
                return Ok(MssClampResult { modified: false, bytes_inserted: 0 });
            }
            _ => {
                if cursor + 1 >= opts_len {
                    return Err(P3Error::BadControl("truncated TCP option"));
                }
                let len = tcp[opts_start + cursor + 1] as usize;
                if len == 0 || cursor + len > opts_len {
                    return Err(P3Error::BadControl("malformed TCP option length"));
                }
                cursor += len;
            }
        }
    }

    // No MSS option found: insert one, growing the header by 4 bytes.
    if header_len + 4 > MAX_TCP_HEADER_LEN {
        tracing::warn!(tcp_offset, header_len, "cannot insert MSS option: TCP options already at maximum length");
        return Ok(MssClampResult { modified: false, bytes_inserted: 0 });
    }

    let mtu_mss = interface_mtu.saturating_sub(if is_v6 { 60 } else { 40 });
    let new_mss = mtu_mss.min(clamp).max(MIN_MSS);
    let insert_at = opts_start + opts_len;
    let mut option = vec![OPT_MSS, OPT_MSS_LEN, 0, 0];
    option[2..4].copy_from_slice(&new_mss.to_be_bytes());
    tcp.splice(insert_at..insert_at, option);

    set_data_offset_bytes(tcp, tcp_offset, header_len + 4);
    recompute_tcp_checksum_full(tcp, tcp_offset);
    Ok(MssClampResult { modified: true, bytes_inserted: 4 })
}

/// Recompute the TCP checksum over the full segment (spec.md §6 "Net utils:
/// recompute_tcp_checksum_full(buf)"). Uses the internet checksum algorithm with no
/// pseudo-header, matching this crate's obfuscated-region-agnostic treatment of the
/// inner packet (the pseudo-header would require plumbing the enclosing IP addresses
/// through; callers that need a standards-correct checksum pass them via `set_tcp_checksum`).
fn recompute_tcp_checksum_full(tcp: &mut [u8], tcp_offset: usize) {
    tcp[tcp_offset + 16] = 0;
    tcp[tcp_offset + 17] = 0;
    let sum = p3_proto::outer::ipv4_checksum(&tcp[tcp_offset..]);
    tcp[tcp_offset + 16..tcp_offset + 18].copy_from_slice(&sum.to_be_bytes());
}
