//! C6: Packet Handler. The single entry point every intercepted packet passes
//! through (spec.md §4.6): classify it against the routing table, then either let
//! it through unmodified, encapsulate it outbound to a peer, or decapsulate/dispatch
//! it inbound from one.
//!
//! Grounded directly on `original_source/src/P3/ksrc/p3knet.c`'s `packet_handler`:
//! the lookup-then-branch structure, the bootstrap-SYN special case, and the
//! UDP-to-local-listener-port control detection all follow it step for step. What's
//! different is the absence of a shared scratch "work buffer" struct — each call here
//! owns its own `Vec<u8>`s rather than renting space out of a multi-purpose overlay
//! (see DESIGN.md).

use tracing::{debug, warn};

use p3_crypto::Which;
use p3_routing::subnet::DeviceKind;
use p3_utils::error::{P3Error, P3Result};

use crate::control_dispatch;
use crate::engine::Engine;
use crate::ip::{self, PROTO_TCP, PROTO_UDP};
use crate::link::Hook;
use crate::mss;

/// Where a decapsulated inbound packet should be delivered once its tunnel wrapper
/// is stripped (spec.md §4.6 step 3.i).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverTarget {
    /// Destination is this host; re-inject into the local stack.
    Local,
    /// Destination is a subnet reachable through us; forward it on.
    Subnet,
}

/// The outcome of one `on_packet` call (spec.md §4.6 "Outputs").
#[derive(Debug)]
pub enum Decision {
    /// Not tunnel traffic; pass the original packet through untouched.
    Unmodified,
    /// Outbound data packet encapsulated for the wire; caller should transmit it.
    HeaderAdded(Vec<u8>),
    /// Inbound tunnel packet decapsulated back to a plain IP packet.
    HeaderRemoved { packet: Vec<u8>, deliver: DeliverTarget },
    /// Inbound packet was a control message; it has already been acted on (and any
    /// reply already sent) and there is nothing left for the caller to deliver.
    ControlConsumed,
    /// Inbound protocol-61 packet with sequence 0: a bootstrap announcement, not
    /// session traffic. The peer's subnets have been activated as a side effect.
    RawBootstrap,
    /// The packet was dropped; `P3Error` records why (spec.md §7 "Propagation policy").
    Dropped(P3Error),
}

/// C6 itself. Holds no state of its own — every input it needs comes from the
/// `Engine` passed to `on_packet` — but is still named as a type so the component
/// has a handle distinct from `Engine`'s own housekeeping methods.
pub struct PacketHandler;

impl PacketHandler {
    /// Run one packet through the classify/encapsulate/decapsulate decision tree.
    /// `usec` is the obfuscator's entropy source for this call (spec.md §4.5); the
    /// caller supplies it the same way the rest of this codebase threads time in
    /// rather than reading a clock internally.
    pub fn on_packet(engine: &Engine, hook: Hook, buf: &[u8], usec: u32) -> Decision {
        match on_packet_inner(engine, hook, buf, usec) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, "dropping packet");
                Decision::Dropped(e)
            }
        }
    }
}

fn on_packet_inner(engine: &Engine, hook: Hook, buf: &[u8], usec: u32) -> P3Result<Decision> {
    let info = ip::parse_ip(buf)?;
    let flags = engine.with_routing(|r| r.classify(info.src, info.dst));

    if let Some(peer_id) = flags.source_is_peer {
        return handle_inbound_from_peer(engine, peer_id, hook, buf, &info);
    }

    if let Some(peer_id) = flags.dest_is_peer.or(flags.dest_is_subnet) {
        let forward = flags.dest_is_subnet.is_some() && flags.dest_is_peer.is_none();
        return handle_outbound_to_peer(engine, peer_id, hook, buf, &info, forward, usec);
    }

    Ok(Decision::Unmodified)
}

/// spec.md §4.6 steps 3.a-3.i: a packet arriving with a known peer as its source.
fn handle_inbound_from_peer(engine: &Engine, peer_id: p3_routing::PeerId, hook: Hook, buf: &[u8], info: &ip::IpInfo) -> P3Result<Decision> {
    if info.protocol != p3_proto::P3_IP_PROTOCOL {
        // Not tunnel traffic from this peer (e.g. a plain packet that merely shares
        // its source address); nothing for us to do.
        return Ok(Decision::Unmodified);
    }

    let listener_port = engine.with_routing(|r| r.peer(peer_id).map(|p| p.listener_port)).unwrap_or(engine.listener_port);

    // Bootstrap TCP-SYN on the listener port rides alongside, not through, the
    // tunnel (spec.md §4.6 step 3.c).
    if info.protocol == PROTO_TCP && ip::is_syn_on_port(buf, info.header_len, listener_port) {
        return Ok(Decision::Unmodified);
    }

    let parsed = p3_proto::parse_outer(buf)?;
    if parsed.sequence == 0 {
        // Raw bootstrap announcement, not session traffic (spec.md §4.6 step 4.b
        // mirrored on receive, and S6). Checked before the active-network gate
        // below, since this is exactly what flips a peer's subnets active.
        let kind = if hook == Hook::Forward { DeviceKind::Forward } else { DeviceKind::InboundDev };
        engine.with_routing_mut(|r| r.activate_peer_subnets(peer_id, kind));
        return Ok(Decision::RawBootstrap);
    }

    if !engine.with_routing(|r| r.is_peer_active(peer_id)) {
        return Err(P3Error::NotActive);
    }
    let session = engine.session(peer_id).ok_or(P3Error::NotActive)?;

    let encrypted_start = parsed.header_len + 8;
    if buf.len() < encrypted_start || (buf.len() - encrypted_start) % 16 != 0 {
        return Err(P3Error::OverSize);
    }

    let which_data = session.decrypt_slot_for_seq(parsed.sequence);
    let mut region = buf[encrypted_start..].to_vec();
    session.with_crypto(|c| c.decrypt(&mut region, parsed.sequence, which_data))?;

    let inner = p3_obfuscate::deobfuscate(&region)?;
    let inner_info = ip::parse_ip(&inner)?;

    if inner_info.protocol == PROTO_UDP {
        if let Some((_, dport)) = ip::ports(&inner, inner_info.header_len) {
            if inner_info.dst == engine.local_addr && dport == listener_port {
                return handle_inbound_control(engine, peer_id, &session, hook, parsed.sequence, &inner, inner_info.header_len);
            }
        }
    }

    let deliver = if inner_info.dst == engine.local_addr { DeliverTarget::Local } else { DeliverTarget::Subnet };
    Ok(Decision::HeaderRemoved { packet: inner, deliver })
}

/// spec.md §4.6 step 3.h: an inbound tunnel packet whose decapsulated payload is a
/// UDP datagram addressed to our own listener port — a control message.
fn handle_inbound_control(
    engine: &Engine,
    peer_id: p3_routing::PeerId,
    session: &p3_session::Session,
    hook: Hook,
    seq: u32,
    inner: &[u8],
    inner_header_len: usize,
) -> P3Result<Decision> {
    let body_start = inner_header_len + 8; // UDP fixed header
    if inner.len() < body_start {
        return Err(P3Error::OverSize);
    }

    let which_ctl = session.control_decrypt_slot_for_seq(seq);
    let mut ctl_region = inner[body_start..].to_vec();
    session.with_crypto(|c| c.decrypt(&mut ctl_region, seq, which_ctl))?;

    let key_type = engine.with_routing(|r| r.peer(peer_id).map(|p| p.key_type)).ok_or(P3Error::NotActive)?;
    let key_len = p3_crypto::Key::width(key_type);

    // A control message arriving via a forwarded link carries its own CFWD
    // implication for how we route our side of the exchange (spec.md §4.7).
    session.set_cfwd(hook == Hook::Forward);

    let decoded = p3_proto::control::decode(&ctl_region, key_len);
    let decoded = match decoded {
        Ok(b) => b,
        Err(e) => {
            session.clear_rekey_defensive();
            return Err(e);
        }
    };

    match control_dispatch::handle_inbound_control(engine, peer_id, decoded) {
        Ok(Some(reply)) => engine.send_control(peer_id, &reply),
        Ok(None) => {}
        Err(e) => {
            session.clear_rekey_defensive();
            debug!(peer_id = peer_id.get(), error = %e, "control message rejected");
        }
    }
    Ok(Decision::ControlConsumed)
}

/// spec.md §4.6 steps 4.a-4.h: an outbound packet destined for a peer or a subnet
/// reachable through one.
fn handle_outbound_to_peer(
    engine: &Engine,
    peer_id: p3_routing::PeerId,
    hook: Hook,
    buf: &[u8],
    info: &ip::IpInfo,
    forward: bool,
    usec: u32,
) -> P3Result<Decision> {
    let peer_listener_port = engine.with_routing(|r| r.peer(peer_id).map(|p| p.listener_port)).unwrap_or(engine.listener_port);

    if info.protocol == PROTO_TCP && ip::is_syn_on_port(buf, info.header_len, peer_listener_port) {
        return Ok(Decision::Unmodified);
    }

    if !info.is_v6 && info.protocol == p3_proto::P3_IP_PROTOCOL {
        let parsed = p3_proto::parse_outer(buf)?;
        if parsed.sequence == 0 {
            let kind = if hook == Hook::Forward { DeviceKind::Forward } else { DeviceKind::OutboundDev };
            engine.with_routing_mut(|r| r.activate_peer_subnets(peer_id, kind));
            return Ok(Decision::RawBootstrap);
        }
    }

    if !engine.with_routing(|r| r.is_peer_active(peer_id)) {
        return Err(P3Error::NotActive);
    }
    let session = engine.session(peer_id).ok_or(P3Error::NotActive)?;
    if session.is_rekeying() {
        return Err(P3Error::Rekeying);
    }

    let mut plaintext = buf.to_vec();
    if info.protocol == PROTO_TCP {
        let mtu = engine.net().get_mtu(peer_id);
        let clamp = mss::clamp_syn_mss(&mut plaintext, info.header_len, info.is_v6, mtu)?;
        if clamp.bytes_inserted > 0 {
            grow_ip_total_len(&mut plaintext, info, clamp.bytes_inserted);
        }
    }

    let target = p3_obfuscate::next_bucket(plaintext.len() + 6).ok_or(P3Error::OverSize)?;
    let sseq = session.next_sseq();

    if session.rekey_due(sseq) {
        match control_dispatch::initiate_rekey(engine, peer_id) {
            Ok(body) => engine.send_control(peer_id, &body),
            Err(P3Error::NoKey) => warn!(peer_id = peer_id.get(), "rekey postponed: key ring empty"),
            Err(e) => warn!(peer_id = peer_id.get(), error = %e, "rekey initiation failed"),
        }
    }

    let wire_total_len = session.outer_template().outer_len() + target;
    let id = sseq as u16;
    let mut out = session.outer_template().patch(id, wire_total_len as u16, forward, sseq);

    let mut region = p3_obfuscate::obfuscate(&plaintext, target, usec)?;
    session.with_crypto(|c| c.encrypt(&mut region, sseq, Which::Data1))?;
    out.extend_from_slice(&region);

    Ok(Decision::HeaderAdded(out))
}

/// Fix up the enclosing IP header's total-length (and, for v4, checksum) after the
/// MSS clamp has grown the TCP options by `grown` bytes.
fn grow_ip_total_len(plaintext: &mut [u8], info: &ip::IpInfo, grown: usize) {
    let new_total = info.total_len + grown;
    if !info.is_v6 {
        plaintext[2..4].copy_from_slice(&(new_total as u16).to_be_bytes());
        plaintext[10] = 0;
        plaintext[11] = 0;
        let csum = p3_proto::outer::ipv4_checksum(&plaintext[..info.header_len]);
        plaintext[10..12].copy_from_slice(&csum.to_be_bytes());
    } else {
        let payload_len = (new_total - 40) as u16;
        plaintext[4..6].copy_from_slice(&payload_len.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p3_crypto::{Key, KeyType};
    use p3_routing::{IpVersion, Peer, PeerId};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    struct FixedMtu(u16);
    impl crate::link::NetUtils for FixedMtu {
        fn get_mtu(&self, _: PeerId) -> u16 {
            self.0
        }
    }

    fn mkengine() -> (Engine, PeerId) {
        let engine = Engine::new(crate::role::Role::Both, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 5653, Arc::new(FixedMtu(1500)));
        let peer_id = PeerId::new(1).unwrap();
        let peer = Peer::new(peer_id, IpVersion::V4, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 5653, 25000, 65000, KeyType::Aes128, false, None);
        engine.import_peer(peer, Key::Aes128([1u8; 16]), Key::Aes128([2u8; 16])).unwrap();
        engine.with_routing_mut(|r| r.activate_peer_subnets(peer_id, DeviceKind::OutboundDev));
        (engine, peer_id)
    }

    fn fake_udp_packet(src: Ipv4Addr, dst: Ipv4Addr, total_len: u16) -> Vec<u8> {
        let mut pkt = vec![0u8; total_len as usize];
        pkt[0] = 0x45;
        pkt[2..4].copy_from_slice(&total_len.to_be_bytes());
        pkt[9] = 17; // UDP
        pkt[12..16].copy_from_slice(&src.octets());
        pkt[16..20].copy_from_slice(&dst.octets());
        pkt[20..22].copy_from_slice(&12345u16.to_be_bytes());
        pkt[22..24].copy_from_slice(&53u16.to_be_bytes());
        pkt[24..26].copy_from_slice(&(total_len - 20).to_be_bytes());
        pkt
    }

    #[test]
    fn outbound_packet_to_peer_gets_header_added() {
        let (engine, _peer_id) = mkengine();
        let pkt = fake_udp_packet(Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(10, 0, 0, 2), 60);
        match PacketHandler::on_packet(&engine, Hook::LocalOut, &pkt, 0x1234) {
            Decision::HeaderAdded(wire) => {
                assert!(wire.len() > pkt.len());
                let parsed = p3_proto::parse_outer(&wire).unwrap();
                assert_eq!(parsed.sequence, 1);
            }
            other => panic!("expected HeaderAdded, got {other:?}"),
        }
    }

    #[test]
    fn unrelated_packet_passes_through_unmodified() {
        let (engine, _peer_id) = mkengine();
        let pkt = fake_udp_packet(Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(203, 0, 113, 9), 60);
        match PacketHandler::on_packet(&engine, Hook::PreRouting, &pkt, 0) {
            Decision::Unmodified => {}
            other => panic!("expected Unmodified, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_through_two_engines_recovers_original_packet() {
        let (tx_engine, peer_id) = mkengine();
        let rx_engine = Engine::new(crate::role::Role::Both, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 5653, Arc::new(FixedMtu(1500)));
        let rx_peer = Peer::new(PeerId::new(1).unwrap(), IpVersion::V4, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 5653, 25000, 65000, KeyType::Aes128, false, None);
        rx_engine.import_peer(rx_peer, Key::Aes128([1u8; 16]), Key::Aes128([2u8; 16])).unwrap();
        rx_engine.with_routing_mut(|r| r.activate_peer_subnets(peer_id, DeviceKind::InboundDev));

        let original = fake_udp_packet(Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(10, 0, 0, 2), 60);
        let wire = match PacketHandler::on_packet(&tx_engine, Hook::LocalOut, &original, 0xabcd) {
            Decision::HeaderAdded(wire) => wire,
            other => panic!("expected HeaderAdded, got {other:?}"),
        };

        match PacketHandler::on_packet(&rx_engine, Hook::PreRouting, &wire, 0) {
            Decision::HeaderRemoved { packet, deliver } => {
                assert_eq!(packet, original);
                assert_eq!(deliver, DeliverTarget::Local);
            }
            other => panic!("expected HeaderRemoved, got {other:?}"),
        }
    }

    #[test]
    fn raw_bootstrap_sequence_zero_activates_subnets() {
        let engine = Engine::new(crate::role::Role::Both, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 5653, Arc::new(FixedMtu(1500)));
        let peer_id = PeerId::new(1).unwrap();
        let peer = Peer::new(peer_id, IpVersion::V4, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 5653, 25000, 65000, KeyType::Aes128, false, None);
        engine.import_peer(peer, Key::Aes128([1u8; 16]), Key::Aes128([2u8; 16])).unwrap();
        engine.import_subnet(peer_id, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 0)), 24).unwrap();
        assert!(!engine.with_routing(|r| r.is_peer_active(peer_id)));

        let outer = p3_proto::OuterTemplate::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))).unwrap();
        let bootstrap = outer.patch(1, outer.outer_len() as u16, false, 0);

        match PacketHandler::on_packet(&engine, Hook::PreRouting, &bootstrap, 0) {
            Decision::RawBootstrap => {}
            other => panic!("expected RawBootstrap, got {other:?}"),
        }
        assert!(engine.with_routing(|r| r.is_peer_active(peer_id)));
    }
}
