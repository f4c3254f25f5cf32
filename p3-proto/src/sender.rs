//! C9: Control Sender. Builds a transmittable tunnel packet carrying a control
//! message (spec.md §4.9): align the body, pick an outer bucket, wrap it in an
//! inner UDP-shaped header, encrypt it with the control cipher, wrap *that* in
//! the outer tunnel header, then obfuscate and encrypt the whole post-outer
//! region with the data cipher, exactly like a regular data packet.
//!
//! Deliberately decoupled from `p3_session::Session`: this module takes the
//! pieces it needs (the outer template, a crypto context, the already-reserved
//! sequence number) as arguments rather than depending on the session crate,
//! so `p3-proto` stays a pure wire-format layer and `p3-session`/`p3-core`
//! decide when to call it.
//!
//! Bucket semantics (see DESIGN.md "outer length buckets"): `next_bucket` sizes
//! the *encrypted region* that follows the fixed outer envelope, matching
//! `original_source`'s `p3knet.c` (`newlen = p3PKT_SMALL + idx1`, where `idx1`
//! is the header offset added on top of the bucket) — the three bucket
//! constants (176/640/1440) are themselves multiples of 16, so this is the
//! only reading of spec.md §4.6/§4.9 that satisfies both the bucket-discipline
//! and the "encrypted region is a multiple of 16" invariants at once. The
//! literal wire `tot_len` field is therefore `header_len + trailer_len + bucket`.

use std::net::IpAddr;

use p3_crypto::{CryptoContext, Which};
use p3_obfuscate::next_bucket;
use p3_utils::error::P3Error;

use crate::control::{encode, ControlBody};
use crate::inner::build_inner_udp_header;
use crate::outer::OuterTemplate;

/// Added (mod 2^16) to `sseq` to form the outer IP id field of a control packet, so
/// a control packet's id is never mistaken for the data packet carrying the same
/// sequence number. Resolves an Open Question left unspecified by spec.md §4.9 step
/// 6 ("patch outer IP id = sseq + SEQ_DIFF"); see DESIGN.md.
pub const CONTROL_ID_SEQ_DIFF: u16 = 0x4000;

fn align16(len: usize) -> usize {
    (len + 15) & !15
}

/// Build a complete, on-wire tunnel packet carrying `body` (spec.md §4.9 steps 1-7).
/// `sseq` must already have been reserved from the session (step 8, incrementing it,
/// is the caller's responsibility); `forward` mirrors the session's `CFWD` flag and
/// sets the outer "forward to local subnet" bit so the caller can also decide which
/// link to hand the result to.
#[allow(clippy::too_many_arguments)]
pub fn build_control_packet(
    outer: &OuterTemplate,
    crypto: &CryptoContext,
    sseq: u32,
    local: IpAddr,
    peer: IpAddr,
    listener_port: u16,
    body: &ControlBody,
    forward: bool,
    usec: u32,
) -> Result<Vec<u8>, P3Error> {
    let framed = encode(body);
    let aligned_len = align16(framed.len());
    let mut aligned_body = framed;
    aligned_body.resize(aligned_len, 0);

    let inner_header = build_inner_udp_header(local, peer, listener_port, aligned_len)?;
    let inner_region_len = inner_header.len() + aligned_len;

    // The encrypted region must admit the inner header + aligned body (spec.md §4.9
    // step 2); `next_bucket` returns that region's length directly (see module docs).
    let encrypted_region_len = next_bucket(inner_region_len).ok_or(P3Error::OverSize)?;

    let mut body_plus_header = Vec::with_capacity(inner_region_len);
    body_plus_header.extend_from_slice(&inner_header);
    body_plus_header.extend_from_slice(&aligned_body);

    // Encrypt only the control body (spec.md §4.9 step 5: "Encrypt the body using
    // control slot 1 with sseq as IV input"); the inner header stays in the clear
    // until the data-layer obfuscate+encrypt pass below covers the whole region.
    let body_start = inner_header.len();
    crypto.encrypt(&mut body_plus_header[body_start..], sseq, Which::Ctl1)?;

    let mut encrypted = p3_obfuscate::obfuscate(&body_plus_header, encrypted_region_len, usec)?;
    crypto.encrypt(&mut encrypted, sseq, Which::Data1)?;

    let wire_total_len = outer.outer_len() + encrypted_region_len;
    let id = (sseq as u16) ^ CONTROL_ID_SEQ_DIFF;
    let mut out = outer.patch(id, wire_total_len as u16, forward, sseq);
    out.extend_from_slice(&encrypted);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use p3_crypto::Key;

    #[test]
    fn builds_bucketed_packet_with_forward_bit() {
        let outer = OuterTemplate::new("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()).unwrap();
        let crypto = CryptoContext::init(Key::Aes128([1u8; 16]), Key::Aes128([2u8; 16]));
        let body = ControlBody::Shutdown { flags: 0 };
        let pkt = build_control_packet(&outer, &crypto, 7, "10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), 5653, &body, true, 0x42).unwrap();

        let parsed = crate::outer::parse_outer(&pkt).unwrap();
        assert!(parsed.forward);
        assert_eq!(parsed.sequence, 7);
        assert_eq!(parsed.total_len, outer.outer_len() + 176);
        assert_eq!(pkt.len(), outer.outer_len() + 176);
    }

    #[test]
    fn control_id_differs_from_sequence_based_data_id() {
        let outer = OuterTemplate::new("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()).unwrap();
        let crypto = CryptoContext::init(Key::Aes128([1u8; 16]), Key::Aes128([2u8; 16]));
        let body = ControlBody::AckShutdown { flags: 0 };
        let pkt = build_control_packet(&outer, &crypto, 9, "10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), 5653, &body, false, 0x1).unwrap();
        let id = u16::from_be_bytes([pkt[4], pkt[5]]);
        assert_ne!(id, 9);
    }
}
