//! The redesign of the original's global `ipv4route`/`ipv6route`/`p3hosts` state
//! (spec.md §9 Design Notes): one `Engine` context threaded through every public
//! entry point (SPEC_FULL §4.10).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use p3_crypto::Key;
use p3_keyring::KeyRing;
use p3_routing::{Peer, PeerId, RoutingTable};
use p3_session::{RekeyTicket, Session};
use p3_utils::error::{P3Error, P3Result};

use crate::link::{Link, NetUtils};
use crate::role::{Role, RoleOps};

/// Byte capacity of the key supply ring (spec.md §4.2: "configurable capacity").
/// Sized for a handful of AES-256 key pairs in flight at once.
pub const KEY_RING_CAPACITY: usize = 4096;

/// Owns the routing table (C3), the peer/session index, the key supply ring's
/// consumer handle (C2), and the per-peer transmit links. Every public entry point
/// takes `&self` and is safe to call concurrently (SPEC_FULL §4.10).
pub struct Engine {
    pub role: Role,
    pub local_addr: IpAddr,
    pub listener_port: u16,
    routing: RwLock<RoutingTable>,
    sessions: RwLock<HashMap<PeerId, Arc<Session>>>,
    links: RwLock<HashMap<PeerId, Arc<dyn Link>>>,
    /// Rekey tickets awaiting the ack that will commit or abort them (held here,
    /// not on `Session`, so `p3-session` stays free of control-protocol bookkeeping;
    /// see `sender.rs`'s module docs in `p3-proto` for the same layering choice).
    pending_rekey: Mutex<HashMap<PeerId, RekeyTicket>>,
    key_ring: Arc<KeyRing<KEY_RING_CAPACITY>>,
    net: Arc<dyn NetUtils>,
}

impl Engine {
    pub fn new(role: Role, local_addr: IpAddr, listener_port: u16, net: Arc<dyn NetUtils>) -> Self {
        Self {
            role,
            local_addr,
            listener_port,
            routing: RwLock::new(RoutingTable::new()),
            sessions: RwLock::new(HashMap::new()),
            links: RwLock::new(HashMap::new()),
            pending_rekey: Mutex::new(HashMap::new()),
            key_ring: Arc::new(KeyRing::new()),
            net,
        }
    }

    pub fn role_ops(&self) -> Box<dyn RoleOps> {
        self.role.ops()
    }

    pub fn key_ring(&self) -> &KeyRing<KEY_RING_CAPACITY> {
        &self.key_ring
    }

    pub fn net(&self) -> &dyn NetUtils {
        self.net.as_ref()
    }

    /// Configuration import (spec.md §6: "add_peer(...), new_session(peer, datakey,
    /// ctlkey)"). Must happen before packet interception begins, or be serialized
    /// against it by the caller (spec.md §5, "insertions ... before packet
    /// interception begins or under a separate writer lock").
    pub fn import_peer(&self, peer: Peer, data_key: Key, control_key: Key) -> P3Result<()> {
        let peer_id = peer.id;
        let session = Arc::new(Session::init(&peer, self.local_addr, data_key, control_key)?);
        self.routing.write().add_peer(peer)?;
        self.sessions.write().insert(peer_id, session);
        info!(peer_id = peer_id.get(), "peer imported");
        Ok(())
    }

    pub fn import_subnet(&self, owner: PeerId, network: IpAddr, prefix_len: u8) -> P3Result<()> {
        self.routing.write().add_subnet(owner, network, prefix_len)
    }

    pub fn register_link(&self, peer_id: PeerId, link: Arc<dyn Link>) {
        self.links.write().insert(peer_id, link);
    }

    pub fn session(&self, peer_id: PeerId) -> Option<Arc<Session>> {
        self.sessions.read().get(&peer_id).cloned()
    }

    pub fn link(&self, peer_id: PeerId) -> Option<Arc<dyn Link>> {
        self.links.read().get(&peer_id).cloned()
    }

    pub fn with_routing<R>(&self, f: impl FnOnce(&RoutingTable) -> R) -> R {
        f(&self.routing.read())
    }

    pub fn with_routing_mut<R>(&self, f: impl FnOnce(&mut RoutingTable) -> R) -> R {
        f(&mut self.routing.write())
    }

    pub fn stash_rekey_ticket(&self, peer_id: PeerId, ticket: RekeyTicket) {
        self.pending_rekey.lock().insert(peer_id, ticket);
    }

    pub fn take_rekey_ticket(&self, peer_id: PeerId) -> Option<RekeyTicket> {
        self.pending_rekey.lock().remove(&peer_id)
    }

    /// Periodic housekeeping (SPEC_FULL §4.10, **[ADD]**): walk sessions whose rekey/
    /// dikey/cikey deadlines have passed and emit the control messages those
    /// deadlines call for. Driven by the binary's event loop, not the packet path.
    pub fn tick(&self, now_ticks: i64) {
        let role_ops = self.role_ops();
        if !role_ops.originates_rekey() {
            return;
        }
        let peer_ids: Vec<PeerId> = self.sessions.read().keys().copied().collect();
        for peer_id in peer_ids {
            let Some(session) = self.session(peer_id) else { continue };
            if session.rekey_deadline.lock().due(now_ticks) && !session.is_rekeying() {
                match crate::control_dispatch::initiate_rekey(self, peer_id) {
                    Ok(body) => self.send_control(peer_id, &body),
                    Err(P3Error::NoKey) => warn!(peer_id = peer_id.get(), "rekey postponed: key ring empty"),
                    Err(e) => warn!(peer_id = peer_id.get(), error = %e, "rekey initiation failed"),
                }
            }
            self.rotate_key_array_indices(&session, now_ticks);
        }
    }

    /// Index-rotation path for peers with a precomputed key array installed
    /// (SPEC_FULL §4.10: "an index-rotation REPLACE_KEY referencing the next
    /// precomputed key rather than a fresh one from the ring").
    fn rotate_key_array_indices(&self, session: &Session, now_ticks: i64) {
        let mut rotated_data = false;
        if session.dikey_deadline.lock().due(now_ticks) {
            let mut ka = session.key_array.lock();
            rotated_data = ka.advance_data_index().is_some();
        }
        let mut rotated_control = false;
        if session.cikey_deadline.lock().due(now_ticks) {
            let mut ka = session.key_array.lock();
            rotated_control = ka.advance_control_index().is_some();
        }
        if rotated_data || rotated_control {
            info!(peer_id = session.peer_id.get(), "key-array index rotated");
        }
    }

    /// Visible to `handler.rs` as well: both the periodic tick and the inline
    /// rekey trigger on the outbound packet path (spec.md §4.6 "Rekey trigger")
    /// need to frame and transmit a reply without duplicating C9's plumbing.
    pub(crate) fn send_control(&self, peer_id: PeerId, body: &p3_proto::ControlBody) {
        let Some(session) = self.session(peer_id) else { return };
        let Some(link) = self.link(peer_id) else {
            warn!(peer_id = peer_id.get(), "no link registered, dropping control message");
            return;
        };
        let peer_addr = self.with_routing(|r| r.peer(peer_id).map(|p| p.address));
        let Some(peer_addr) = peer_addr else { return };

        let sseq = session.next_sseq();
        let forward = session.cfwd();
        let built = session.with_crypto(|crypto| {
            p3_proto::build_control_packet(session.outer_template(), crypto, sseq, self.local_addr, peer_addr, self.listener_port, body, forward, sseq)
        });
        match built {
            Ok(pkt) => {
                if let Err(e) = link.send_packet(&pkt, forward) {
                    warn!(peer_id = peer_id.get(), error = %e, "failed to send control packet");
                }
            }
            Err(e) => warn!(peer_id = peer_id.get(), error = %e, "failed to build control packet"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p3_crypto::KeyType;
    use p3_routing::IpVersion;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FixedMtu(u16);
    impl NetUtils for FixedMtu {
        fn get_mtu(&self, _peer_id: PeerId) -> u16 {
            self.0
        }
    }

    struct NullLink(Arc<AtomicBool>);
    impl Link for NullLink {
        fn send_packet(&self, _tunnel_bytes: &[u8], _forwarded: bool) -> P3Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn import_peer_creates_session_and_route_entry() {
        let engine = Engine::new(Role::Primary, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 5653, Arc::new(FixedMtu(1500)));
        let peer = Peer::new(
            PeerId::new(1).unwrap(),
            IpVersion::V4,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            5653,
            25000,
            65000,
            KeyType::Aes128,
            false,
            None,
        );
        engine.import_peer(peer, Key::Aes128([1u8; 16]), Key::Aes128([2u8; 16])).unwrap();
        assert!(engine.session(PeerId::new(1).unwrap()).is_some());
        assert!(engine.with_routing(|r| r.peer(PeerId::new(1).unwrap()).is_some()));
    }

    #[test]
    fn tick_is_a_no_op_for_secondary_role() {
        let engine = Engine::new(Role::Secondary, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 5653, Arc::new(FixedMtu(1500)));
        engine.tick(1_000_000);
    }

    struct RecordingLink(Arc<std::sync::Mutex<Option<(Vec<u8>, bool)>>>);
    impl Link for RecordingLink {
        fn send_packet(&self, tunnel_bytes: &[u8], forwarded: bool) -> P3Result<()> {
            *self.0.lock().unwrap() = Some((tunnel_bytes.to_vec(), forwarded));
            Ok(())
        }
    }

    #[test]
    fn control_sent_after_forwarded_inbound_carries_cfwd_flag() {
        let engine = Engine::new(Role::Primary, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 5653, Arc::new(FixedMtu(1500)));
        let peer_id = PeerId::new(1).unwrap();
        let peer = Peer::new(peer_id, IpVersion::V4, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 5653, 25000, 65000, KeyType::Aes128, false, None);
        engine.import_peer(peer, Key::Aes128([1u8; 16]), Key::Aes128([2u8; 16])).unwrap();

        let sent = Arc::new(std::sync::Mutex::new(None));
        engine.register_link(peer_id, Arc::new(RecordingLink(sent.clone())));

        let session = engine.session(peer_id).unwrap();
        session.set_cfwd(true);

        engine.send_control(peer_id, &p3_proto::ControlBody::AckShutdown { flags: 0 });

        let (pkt, forwarded) = sent.lock().unwrap().take().expect("link should have been called");
        assert!(forwarded);
        let parsed = p3_proto::parse_outer(&pkt).unwrap();
        assert!(parsed.forward);
    }
}
