//! C7 dispatch: ties the decoded `ControlBody` (p3-proto's codec) to role-asymmetric
//! session actions (spec.md §4.7 "Role asymmetry", §4.8 Rekey State Machine).
//!
//! Every function here returns, at most, one reply `ControlBody` for the caller (C6)
//! to frame and send back via C9; none of them send packets themselves, mirroring
//! how `p3-proto::sender` stays a pure wire-format layer one level down.

use p3_crypto::Key;
use p3_proto::{ControlBody, KeyOrIndex, RKERR};
use p3_routing::PeerId;
use p3_session::Session;
use p3_utils::error::{P3Error, P3Result};

use crate::engine::Engine;

enum ArrayField {
    Data,
    Control,
}

fn resolve_key_field(session: &Session, key_type: p3_crypto::KeyType, field: &KeyOrIndex, which: ArrayField) -> P3Result<Key> {
    match field {
        KeyOrIndex::Key(bytes) => Key::from_slice(key_type, bytes),
        KeyOrIndex::Index(idx) => {
            let ka = session.key_array.lock();
            match which {
                ArrayField::Data => ka.resolve_data(*idx),
                ArrayField::Control => ka.resolve_control(*idx),
            }
        }
    }
}

/// Primary-side rekey trigger (spec.md §4.8 "Idle -> Rekeying ... primary-side
/// periodic", and the every-64th-packet trigger of §4.6). Draws fresh key material
/// from the key ring, stages it, and returns the `REPLACE_KEY` body to send.
pub fn initiate_rekey(engine: &Engine, peer_id: PeerId) -> P3Result<ControlBody> {
    let session = engine.session(peer_id).ok_or(P3Error::BadControl("unknown peer"))?;
    let key_type = engine.with_routing(|r| r.peer(peer_id).map(|p| p.key_type)).ok_or(P3Error::BadControl("unknown peer"))?;
    let width = Key::width(key_type);

    let mut data_bytes = vec![0u8; width];
    let mut control_bytes = vec![0u8; width];
    engine.key_ring().take(width, &mut data_bytes).map_err(|_| P3Error::NoKey)?;
    engine.key_ring().take(width, &mut control_bytes).map_err(|_| P3Error::NoKey)?;

    let ticket = session.begin_rekey()?;
    session.stage_new_keys(Key::from_slice(key_type, &data_bytes)?, Key::from_slice(key_type, &control_bytes)?);
    engine.stash_rekey_ticket(peer_id, ticket);

    Ok(ControlBody::ReplaceKey { flags: 0, data: KeyOrIndex::Key(data_bytes), control: KeyOrIndex::Key(control_bytes) })
}

/// Dispatch one decoded inbound control message (spec.md §4.6 step 3.h, §4.7). Returns
/// the reply body the caller should send back, if any. `is_secondary_handled(cmd)`
/// (p3-proto's codec) splits the 13 commands into the "request" half (acted on by
/// whichever side plays Secondary) and the "ack/answer" half (acted on by Primary);
/// `role_ops.should_handle_inbound` guards against a command arriving at a role that
/// has no business processing it (e.g. a `Secondary`-only engine receiving a `REKEY`
/// ack for a rekey it never initiated).
pub fn handle_inbound_control(engine: &Engine, peer_id: PeerId, body: ControlBody) -> P3Result<Option<ControlBody>> {
    let role_ops = engine.role_ops();
    let cmd = body.command();
    if !role_ops.should_handle_inbound(cmd) {
        return Err(P3Error::BadControl("command not valid for this role"));
    }
    if p3_proto::is_secondary_handled(cmd) {
        handle_request(engine, peer_id, body)
    } else {
        handle_ack(engine, peer_id, body)
    }
}

fn handle_request(engine: &Engine, peer_id: PeerId, body: ControlBody) -> P3Result<Option<ControlBody>> {
    let session = engine.session(peer_id).ok_or(P3Error::BadControl("unknown peer"))?;
    let key_type = engine.with_routing(|r| r.peer(peer_id).map(|p| p.key_type)).ok_or(P3Error::BadControl("unknown peer"))?;

    match body {
        ControlBody::SetKeyArray { keys, .. } => {
            let resolved: P3Result<Vec<Key>> = keys.iter().map(|k| Key::from_slice(key_type, k)).collect();
            session.key_array.lock().install(resolved?);
            Ok(Some(ControlBody::AckKeyArray { flags: 0 }))
        }
        ControlBody::ReplaceKey { data, control, .. } => {
            let data_key = resolve_key_field(&session, key_type, &data, ArrayField::Data)?;
            let control_key = resolve_key_field(&session, key_type, &control, ArrayField::Control)?;

            let ticket = session.begin_rekey()?;
            session.stage_new_keys(data_key, control_key);
            // The responder commits immediately using its own next sseq as the
            // boundary (spec.md §4.8: "the ack message carries ... the responder's
            // sseq + 1"). See DESIGN.md for the Open Question this resolves.
            let boundary = session.next_sseq();
            session.commit_rekey(ticket, boundary)?;
            Ok(Some(ControlBody::Rekey { flags: 0, first_seq: boundary }))
        }
        ControlBody::RekeyTest { .. } => Ok(None),
        ControlBody::HeartbeatQuery { timestamp, sequence } => Ok(Some(ControlBody::HeartbeatAnswer { timestamp, sequence })),
        ControlBody::StatusReq { request_no, .. } => Ok(Some(ControlBody::StatusResp { flags: 0, response_no: request_no })),
        ControlBody::UpdateInfo { .. } => Ok(Some(ControlBody::AckUpdate { flags: 0 })),
        ControlBody::Shutdown { .. } => Ok(Some(ControlBody::AckShutdown { flags: 0 })),
        _ => Err(P3Error::BadControl("command not valid for the secondary role")),
    }
}

/// Handle a reply landing back on the side that originated the exchange (acks,
/// answers, and the `REKEY` ack that closes out a rekey this engine initiated).
fn handle_ack(engine: &Engine, peer_id: PeerId, body: ControlBody) -> P3Result<Option<ControlBody>> {
    match body {
        ControlBody::Rekey { flags, first_seq } => {
            let session = engine.session(peer_id).ok_or(P3Error::BadControl("unknown peer"))?;
            let ticket = engine.take_rekey_ticket(peer_id).ok_or(P3Error::BadControl("unexpected REKEY ack"))?;
            if flags & RKERR != 0 {
                // S3: error short-circuit, no key rotation (spec.md §4.8).
                session.abort_rekey(ticket);
            } else {
                // S2: clean rekey round-trip.
                session.commit_rekey(ticket, first_seq)?;
            }
            Ok(None)
        }
        ControlBody::AckKeyArray { .. }
        | ControlBody::HeartbeatAnswer { .. }
        | ControlBody::StatusResp { .. }
        | ControlBody::AckUpdate { .. }
        | ControlBody::AckShutdown { .. } => Ok(None),
        _ => Err(P3Error::BadControl("command not valid for the primary role")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::NetUtils;
    use crate::role::Role;
    use p3_crypto::KeyType;
    use p3_routing::{IpVersion, Peer};
    use std::net::{IpAddr, Ipv4Addr};

    struct FixedMtu;
    impl NetUtils for FixedMtu {
        fn get_mtu(&self, _: PeerId) -> u16 {
            1500
        }
    }

    fn mkengine(role: Role) -> (Engine, PeerId) {
        let engine = Engine::new(role, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 5653, std::sync::Arc::new(FixedMtu));
        let peer_id = PeerId::new(1).unwrap();
        let peer = Peer::new(peer_id, IpVersion::V4, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 5653, 25000, 65000, KeyType::Aes128, false, None);
        engine.import_peer(peer, Key::Aes128([1u8; 16]), Key::Aes128([2u8; 16])).unwrap();
        (engine, peer_id)
    }

    #[test]
    fn s2_replace_key_then_rekey_ack_commits_on_both_sides() {
        let (secondary, peer_id) = mkengine(Role::Secondary);
        let replace_key = ControlBody::ReplaceKey {
            flags: 0,
            data: KeyOrIndex::Key(vec![9u8; 16]),
            control: KeyOrIndex::Key(vec![10u8; 16]),
        };
        let reply = handle_inbound_control(&secondary, peer_id, replace_key).unwrap().unwrap();
        let first_seq = match reply {
            ControlBody::Rekey { flags, first_seq } => {
                assert_eq!(flags, 0);
                first_seq
            }
            _ => panic!("expected REKEY ack"),
        };
        let secondary_session = secondary.session(peer_id).unwrap();
        assert!(!secondary_session.is_rekeying());
        assert_eq!(secondary_session.receive_window().1, first_seq);

        let (primary, peer_id) = mkengine(Role::Primary);
        let primary_session = primary.session(peer_id).unwrap();
        let width = Key::width(KeyType::Aes128);
        primary.key_ring().put(&vec![9u8; width]).unwrap();
        primary.key_ring().put(&vec![10u8; width]).unwrap();
        let replace_key = initiate_rekey(&primary, peer_id).unwrap();
        assert!(primary_session.is_rekeying());

        let ack = ControlBody::Rekey { flags: 0, first_seq };
        let reply = handle_inbound_control(&primary, peer_id, ack).unwrap();
        assert!(reply.is_none());
        assert!(!primary_session.is_rekeying());
        assert_eq!(primary_session.receive_window().1, first_seq);
        let _ = replace_key;
    }

    #[test]
    fn s3_rekey_error_bit_aborts_without_rotating() {
        let (primary, peer_id) = mkengine(Role::Primary);
        let session = primary.session(peer_id).unwrap();
        let width = Key::width(KeyType::Aes128);
        primary.key_ring().put(&vec![9u8; width]).unwrap();
        primary.key_ring().put(&vec![10u8; width]).unwrap();
        initiate_rekey(&primary, peer_id).unwrap();
        let before = session.receive_window();

        let err_ack = ControlBody::Rekey { flags: RKERR, first_seq: 999 };
        let reply = handle_inbound_control(&primary, peer_id, err_ack).unwrap();
        assert!(reply.is_none());
        assert!(!session.is_rekeying());
        assert_eq!(session.receive_window(), before);
    }

    #[test]
    fn heartbeat_query_gets_answer_with_same_fields() {
        let (secondary, peer_id) = mkengine(Role::Secondary);
        let q = ControlBody::HeartbeatQuery { timestamp: 111, sequence: 222 };
        let reply = handle_inbound_control(&secondary, peer_id, q).unwrap().unwrap();
        match reply {
            ControlBody::HeartbeatAnswer { timestamp, sequence } => {
                assert_eq!(timestamp, 111);
                assert_eq!(sequence, 222);
            }
            _ => panic!("wrong reply"),
        }
    }
}
