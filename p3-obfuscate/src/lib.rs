//! C5: Obfuscator.
//!
//! A length-preserving permutation of the encrypted region designed to defeat static
//! pattern recognition of the inner IP header (spec.md §4.5). The forward transform
//! splits the plaintext into a handful of blocks, reorders them on the wire behind a
//! 3-byte `[index, len_hi, len_lo]` record header, and pads the result out to one of
//! the fixed outer-packet buckets. The inverse walks the record stream and reassembles
//! the blocks by declared index, which is what makes the transform correct independent
//! of the specific emission order the sender happened to choose.
//!
//! The block-selection and padding steps are keyed off "the current microsecond clock"
//! in the original; here that entropy source is an explicit `usec: u32` argument rather
//! than an internal clock read, matching the rest of this codebase's convention of
//! passing time in from the caller (see `p3_utils::gate`) so the transform stays a pure,
//! testable function.

use p3_utils::error::P3Error;

/// The three fixed outer-packet size buckets (spec.md §6).
pub const SMALL_BUCKET: usize = 176;
pub const MEDIUM_BUCKET: usize = 640;
pub const LARGE_BUCKET: usize = 1440;
pub const MAX_OUTER_LEN: usize = 1500;

const MAX_BLOCKS: usize = 8;
const RECORD_HEADER_LEN: usize = 3;

/// Smallest bucket from {176, 640, 1440} that admits `needed`, else the next 16-byte
/// multiple above 1440, capped at 1500 (spec.md §4.6 step 4.e, §6).
pub fn next_bucket(needed: usize) -> Option<usize> {
    for b in [SMALL_BUCKET, MEDIUM_BUCKET, LARGE_BUCKET] {
        if needed <= b {
            return Some(b);
        }
    }
    let rounded = ((needed + 15) / 16) * 16;
    if rounded <= MAX_OUTER_LEN {
        Some(rounded)
    } else {
        None
    }
}

fn choose_block_count(plaintext_len: usize, target_len: usize, usec: u32) -> Option<usize> {
    let mut b: i64 = if plaintext_len < MEDIUM_BUCKET {
        if usec & 2 != 0 {
            2
        } else {
            3
        }
    } else {
        match usec & 7 {
            0 => 4,
            1 => 6,
            other => other as i64,
        }
    };
    let headroom = target_len as i64 - plaintext_len as i64;
    while b > 0 && 3 * b > headroom {
        b -= 1;
    }
    if b <= 0 {
        None
    } else {
        Some(b as usize)
    }
}

fn split_mask(block_size: usize) -> u8 {
    if block_size < 16 {
        3
    } else if block_size < 32 {
        7
    } else if block_size < 64 {
        15
    } else {
        31
    }
}

/// Locations of the `b` block boundaries within a plaintext of length `l`; `loc[0]` is
/// always 0, and `loc[1..b]` are derived from trailing packet bytes per spec.md §4.5
/// step 2, clamped to stay monotonic and leave at least one byte per remaining block.
fn block_locations(p: &[u8], l: usize, b: usize) -> Vec<usize> {
    let s = l / b;
    let mask = split_mask(s);
    let mut loc = vec![0usize; b];
    for i in 1..b {
        let entropy_byte = p[l - i];
        let delta = (entropy_byte & mask) as usize;
        let base = i * s;
        let raw = if entropy_byte & 2 != 0 {
            base.saturating_sub(delta)
        } else {
            base + delta
        };
        let min_allowed = loc[i - 1] + 1;
        let max_allowed = l.saturating_sub(b - i);
        loc[i] = raw.clamp(min_allowed, max_allowed.max(min_allowed));
    }
    loc
}

/// Emission order over `0..b`: the first entry is never block 0 (spec.md §4.5 step 4).
/// Bits of `usec` are consumed through a rolling, self-resetting multiplier to decide,
/// at each step, whether the next block comes from the front or back of what remains.
fn emission_order(b: usize, usec: u32) -> Vec<usize> {
    let mut remaining: Vec<usize> = (0..b).collect();
    let mut order = Vec::with_capacity(b);
    let mut mult: u32 = 1;
    while !remaining.is_empty() {
        if mult == 0 || mult > usec.max(1) {
            mult = 1;
        }
        let take_from_back = usec & mult != 0;
        let mut idx = if take_from_back { remaining.len() - 1 } else { 0 };
        if order.is_empty() && remaining[idx] == 0 && remaining.len() > 1 {
            idx = if idx == 0 { 1 } else { idx - 1 };
        }
        order.push(remaining.remove(idx));
        mult = mult.wrapping_mul(2);
    }
    order
}

/// Replicate bytes from `payload`, preferring the region after a typical combined
/// IPv4/TCP header when there's enough room, in the stride pattern of spec.md §4.5
/// step 6.
fn build_pad(payload: &[u8], pad_len: usize, usec: u32) -> Vec<u8> {
    if pad_len == 0 || payload.is_empty() {
        return vec![0u8; pad_len];
    }
    const TYPICAL_HEADER_LEN: usize = 40;
    let start = if payload.len() > TYPICAL_HEADER_LEN { TYPICAL_HEADER_LEN } else { 0 };
    let stride = (usec & 7) as usize + 7;
    let per_write = (usec & 3) as usize + 1;
    let mut out = Vec::with_capacity(pad_len);
    let mut cursor = start;
    while out.len() < pad_len {
        for k in 0..per_write {
            if out.len() >= pad_len {
                break;
            }
            out.push(payload[(cursor + k) % payload.len()]);
        }
        cursor = (cursor + stride) % payload.len();
    }
    out
}

/// Forward transform: obfuscate `plaintext` into a buffer of exactly `target_len` bytes.
/// `target_len` must already be a chosen bucket (see `next_bucket`) at least
/// `plaintext.len()`; `usec` supplies the entropy normally drawn from the clock.
pub fn obfuscate(plaintext: &[u8], target_len: usize, usec: u32) -> Result<Vec<u8>, P3Error> {
    let l = plaintext.len();
    if target_len < l {
        return Err(P3Error::OverSize);
    }
    let b = choose_block_count(l, target_len, usec).ok_or(P3Error::OverSize)?;
    if b > MAX_BLOCKS || l < b {
        return Err(P3Error::OverSize);
    }

    let loc = block_locations(plaintext, l, b);
    let mut lengths = vec![0usize; b];
    for i in 0..b - 1 {
        lengths[i] = loc[i + 1] - loc[i];
    }
    lengths[b - 1] = l - loc[b - 1];

    let header_bytes = RECORD_HEADER_LEN * b;
    let pad_len = target_len.saturating_sub(l + header_bytes);
    let pad = build_pad(plaintext, pad_len, usec);

    let order = emission_order(b, usec);
    let last_index = b - 1;

    let mut out = Vec::with_capacity(target_len);
    for &idx in &order {
        let start = loc[idx];
        let end = start + lengths[idx];
        let declared_len = if idx == last_index { lengths[idx] + pad.len() } else { lengths[idx] };
        if declared_len > 0xffff {
            return Err(P3Error::OverSize);
        }
        out.push(idx as u8);
        out.push((declared_len >> 8) as u8);
        out.push((declared_len & 0xff) as u8);
        out.extend_from_slice(&plaintext[start..end]);
        if idx == last_index {
            out.extend_from_slice(&pad);
        }
    }

    debug_assert_eq!(out.len(), target_len);
    Ok(out)
}

/// Inverse transform (spec.md §4.5 "Inverse"). Reads up to 8 `[index, len_hi, len_lo,
/// data...]` records, reassembles them by declared index, then truncates the result to
/// the inner IP header's own total-length field.
pub fn deobfuscate(buf: &[u8]) -> Result<Vec<u8>, P3Error> {
    let mut slots: [Option<(usize, usize)>; MAX_BLOCKS] = [None; MAX_BLOCKS];
    let mut cursor = 0usize;
    let mut records_read = 0;

    while records_read < MAX_BLOCKS && cursor < buf.len() {
        if cursor + RECORD_HEADER_LEN > buf.len() {
            return Err(P3Error::DeobfuscateFailure);
        }
        let idx = buf[cursor] as usize;
        let len = ((buf[cursor + 1] as usize) << 8) | buf[cursor + 2] as usize;
        cursor += RECORD_HEADER_LEN;
        if idx >= MAX_BLOCKS || cursor + len > buf.len() {
            return Err(P3Error::DeobfuscateFailure);
        }
        slots[idx] = Some((cursor, len));
        cursor += len;
        records_read += 1;
    }

    let mut out = Vec::with_capacity(buf.len());
    for slot in slots.iter() {
        if let Some((offset, len)) = *slot {
            out.extend_from_slice(&buf[offset..offset + len]);
        }
    }

    if out.is_empty() {
        return Err(P3Error::DeobfuscateFailure);
    }
    let version = out[0] >> 4;
    let total_len = if version == 4 {
        if out.len() < 4 {
            return Err(P3Error::DeobfuscateFailure);
        }
        u16::from_be_bytes([out[2], out[3]]) as usize
    } else if version == 6 {
        if out.len() < 6 {
            return Err(P3Error::DeobfuscateFailure);
        }
        40 + u16::from_be_bytes([out[4], out[5]]) as usize
    } else {
        return Err(P3Error::DeobfuscateFailure);
    };
    if total_len > out.len() {
        return Err(P3Error::DeobfuscateFailure);
    }
    out.truncate(total_len);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_ipv4_tcp_syn(total_len: u16) -> Vec<u8> {
        let mut pkt = vec![0u8; total_len as usize];
        pkt[0] = 0x45; // version 4, ihl 5
        pkt[2] = (total_len >> 8) as u8;
        pkt[3] = (total_len & 0xff) as u8;
        pkt[9] = 6; // TCP
        for (i, b) in pkt.iter_mut().enumerate().skip(20) {
            *b = (i * 37 + 11) as u8;
        }
        pkt
    }

    #[test]
    fn roundtrip_small_packet() {
        let pkt = fake_ipv4_tcp_syn(200);
        let target = next_bucket(pkt.len() + 6).unwrap();
        let usec = 0x1234u32;
        let obf = obfuscate(&pkt, target, usec).unwrap();
        assert_eq!(obf.len(), target);
        let back = deobfuscate(&obf).unwrap();
        assert_eq!(back, pkt);
    }

    #[test]
    fn roundtrip_medium_packet() {
        let pkt = fake_ipv4_tcp_syn(900);
        let target = next_bucket(pkt.len() + 6).unwrap();
        let usec = 0xabcdef;
        let obf = obfuscate(&pkt, target, usec).unwrap();
        let back = deobfuscate(&obf).unwrap();
        assert_eq!(back, pkt);
    }

    #[test]
    fn roundtrip_large_packet_next_multiple() {
        let pkt = fake_ipv4_tcp_syn(1450);
        let target = next_bucket(pkt.len() + 6).unwrap();
        assert!(target > LARGE_BUCKET);
        let obf = obfuscate(&pkt, target, 0x55).unwrap();
        let back = deobfuscate(&obf).unwrap();
        assert_eq!(back, pkt);
    }

    #[test]
    fn block_count_selection_matches_s4() {
        // S4: L=200 (< MED), usec=0x12345 -> usec & 2 == 0 -> B=3 before clamping.
        let usec = 0x12345u32;
        assert_eq!(usec & 2, 0);
        let b = choose_block_count(200, next_bucket(206).unwrap(), usec).unwrap();
        assert_eq!(b, 3);
    }

    #[test]
    fn first_emitted_block_is_never_index_zero() {
        for usec in [0u32, 1, 2, 7, 0x12345, 0xffffffff] {
            let order = emission_order(4, usec);
            assert_ne!(order[0], 0, "usec={usec:#x}");
            let mut sorted = order.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, vec![0, 1, 2, 3]);
        }
    }

    #[test]
    fn oversized_plaintext_rejected() {
        let pkt = vec![0x45u8; 100];
        assert!(obfuscate(&pkt, 99, 0).is_err());
    }

    #[test]
    fn bucket_selection() {
        assert_eq!(next_bucket(100), Some(SMALL_BUCKET));
        assert_eq!(next_bucket(500), Some(MEDIUM_BUCKET));
        assert_eq!(next_bucket(1400), Some(LARGE_BUCKET));
        assert_eq!(next_bucket(1441), Some(1456));
        assert_eq!(next_bucket(1489), None);
    }
}
