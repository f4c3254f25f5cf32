//! C4: Session, plus C8's rekey state machine (kept on the same type since every
//! C8 transition is, at bottom, a mutation of the session's own receive window and
//! `REKEY` flag — spec.md §4.4 and §4.8 describe the same lock and the same fields).

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use p3_crypto::{CryptoContext, Key, Which};
use p3_proto::outer::OuterTemplate;
use p3_routing::peer::{IpVersion, Peer, PeerId};
use p3_utils::error::{P3Error, P3Result};
use p3_utils::gate::Deadline;

use crate::keyarray::KeyArray;

/// Sequence numbers skip zero on wrap (spec.md §3, §4.4): this is the only reserved
/// value. `next_sseq` and `commit_rekey`'s ack-boundary arithmetic both honor it.
const RESERVED_SEQ: u32 = 0;

/// Every `REKEY_PERIOD_MASK + 1` outbound data packets, the primary side kicks off
/// a rekey (spec.md §4.6 "Rekey trigger": `sseq & 0x3f == 0`).
pub const REKEY_PERIOD_MASK: u32 = 0x3f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyPhase {
    Idle,
    Rekeying,
}

/// The fields protected by the session's short spin-style lock (spec.md §5:
/// "covering only: sseq bump, REKEY flag test-and-set, and rID0/rID1 rotation at
/// rekey commit... held for at most a few arithmetic operations").
struct RekeyWindow {
    r_id0: u32,
    r_id1: u32,
    phase: RekeyPhase,
}

/// Per-peer mutable state (spec.md §3 "Session", §4.4).
pub struct Session {
    pub peer_id: PeerId,
    pub ip_version: IpVersion,
    pub key_arrays_permitted: bool,

    sseq: AtomicU32,
    window: Mutex<RekeyWindow>,
    crypto: RwLock<CryptoContext>,
    outer: OuterTemplate,
    cfwd: AtomicBool,

    /// Deadlines consulted only by `Engine::tick` (SPEC_FULL §4.10); never touched
    /// by the packet-handling fast path.
    pub rekey_deadline: Mutex<Deadline>,
    pub dikey_deadline: Mutex<Deadline>,
    pub cikey_deadline: Mutex<Deadline>,

    pub key_array: Mutex<KeyArray>,
}

/// Proof that `begin_rekey` succeeded, required by the only two ways out of the
/// `Rekeying` phase. Not `Clone`/`Copy`: a ticket is spent exactly once.
pub struct RekeyTicket(());

impl Session {
    /// Allocate and prebuild the outer tunnel template, install `sseq = 1`, a zero
    /// receive window, and a crypto context sized from the peer's key type
    /// (spec.md §4.4 `init`).
    pub fn init(peer: &Peer, local_addr: IpAddr, data_key: Key, control_key: Key) -> P3Result<Self> {
        let outer = OuterTemplate::new(local_addr, peer.address)?;
        Ok(Self {
            peer_id: peer.id,
            ip_version: peer.ip_version,
            key_arrays_permitted: peer.key_arrays_permitted,
            sseq: AtomicU32::new(1),
            window: Mutex::new(RekeyWindow { r_id0: 0, r_id1: 0, phase: RekeyPhase::Idle }),
            crypto: RwLock::new(CryptoContext::init(data_key, control_key)),
            outer,
            cfwd: AtomicBool::new(false),
            rekey_deadline: Mutex::new(Deadline::default()),
            dikey_deadline: Mutex::new(Deadline::default()),
            cikey_deadline: Mutex::new(Deadline::default()),
            key_array: Mutex::new(KeyArray::default()),
        })
    }

    pub fn outer_template(&self) -> &OuterTemplate {
        &self.outer
    }

    pub fn cfwd(&self) -> bool {
        self.cfwd.load(Ordering::Relaxed)
    }

    pub fn set_cfwd(&self, v: bool) {
        self.cfwd.store(v, Ordering::Relaxed);
    }

    /// Atomically return the current `sseq`, then increment; if the post-increment
    /// value is the reserved zero it is incremented again (spec.md §4.4: "never
    /// fails"; skip-zero-on-wrap is Testable Property 1).
    pub fn next_sseq(&self) -> u32 {
        let issued = self.sseq.fetch_add(1, Ordering::Relaxed);
        // A single fetch_add can only ever land exactly on the reserved value once
        // per wrap; bump it again so no caller is ever handed 0.
        if issued.wrapping_add(1) == RESERVED_SEQ {
            self.sseq.fetch_add(1, Ordering::Relaxed);
        }
        issued
    }

    pub fn peek_sseq(&self) -> u32 {
        self.sseq.load(Ordering::Relaxed)
    }

    /// Every `REKEY_PERIOD_MASK + 1` packets, and only when not already rekeying
    /// (spec.md §4.6 "Rekey trigger", §4.8 "Idle -> Rekeying ... primary-side
    /// periodic").
    pub fn rekey_due(&self, just_issued_sseq: u32) -> bool {
        just_issued_sseq & REKEY_PERIOD_MASK == 0 && !self.is_rekeying()
    }

    pub fn is_rekeying(&self) -> bool {
        self.window.lock().phase == RekeyPhase::Rekeying
    }

    /// C8 `Idle -> Rekeying`. Fails if already rekeying (spec.md §4.4 `begin_rekey`).
    pub fn begin_rekey(&self) -> P3Result<RekeyTicket> {
        let mut w = self.window.lock();
        if w.phase == RekeyPhase::Rekeying {
            return Err(P3Error::Rekeying);
        }
        w.phase = RekeyPhase::Rekeying;
        trace!(peer_id = self.peer_id.get(), "rekey begun");
        Ok(RekeyTicket(()))
    }

    /// Stage the data/control keys that the next `commit_rekey` will install into
    /// crypto slot 1 (spec.md §4.1 `stage_new_keys`, called before the ticket holder
    /// sends or acts on `REPLACE_KEY`).
    pub fn stage_new_keys(&self, data_key: Key, control_key: Key) {
        self.crypto.write().stage_new_keys(data_key, control_key);
    }

    /// C8 `Rekeying -> Idle` on a clean ack: `C1.rekey`, `rID0 <- rID1`,
    /// `rID1 <- new_rid1`, clear `REKEY` (spec.md §4.4 `commit_rekey`, §4.8).
    /// Idempotent (Testable Property 7): calling this twice with the same
    /// `new_rid1` after the first call already landed is a no-op.
    pub fn commit_rekey(&self, ticket: RekeyTicket, new_rid1: u32) -> P3Result<()> {
        let _ = ticket;
        let mut w = self.window.lock();
        if w.phase == RekeyPhase::Idle && w.r_id1 == new_rid1 {
            return Ok(());
        }
        self.crypto.write().rekey()?;
        w.r_id0 = w.r_id1;
        w.r_id1 = new_rid1;
        w.phase = RekeyPhase::Idle;
        debug!(peer_id = self.peer_id.get(), new_rid1, "rekey committed");
        Ok(())
    }

    /// C8 `Rekeying -> Idle` on an errored ack: clear `REKEY` only, no key rotation
    /// (spec.md §4.8, Scenario S3).
    pub fn abort_rekey(&self, ticket: RekeyTicket) {
        let _ = ticket;
        let mut w = self.window.lock();
        w.phase = RekeyPhase::Idle;
        debug!(peer_id = self.peer_id.get(), "rekey aborted, no key rotation");
    }

    /// Clear `REKEY` without a ticket (spec.md §7, `Protocol-BadControl`: "drop,
    /// clear REKEY defensively if it was set"). The only caller that may bypass the
    /// ticket discipline of `begin_rekey`/`commit_rekey`/`abort_rekey`, because a
    /// malformed control message may have arrived mid-rekey with no ticket to
    /// redeem; leaving `REKEY` set would otherwise wedge the session's data path.
    pub fn clear_rekey_defensive(&self) {
        let mut w = self.window.lock();
        if w.phase == RekeyPhase::Rekeying {
            w.phase = RekeyPhase::Idle;
            debug!(peer_id = self.peer_id.get(), "rekey flag cleared defensively after bad control message");
        }
    }

    /// Which crypto slot decrypts a received sequence number (spec.md §4.6 step
    /// 4.e, Testable Property 3): slot 1 iff `rID1 <= s || s < rID0`.
    pub fn decrypt_slot_for_seq(&self, seq: u32) -> Which {
        let w = self.window.lock();
        if w.r_id1 <= seq || seq < w.r_id0 {
            Which::Data1
        } else {
            Which::Data0
        }
    }

    pub fn control_decrypt_slot_for_seq(&self, seq: u32) -> Which {
        match self.decrypt_slot_for_seq(seq) {
            Which::Data1 => Which::Ctl1,
            _ => Which::Ctl0,
        }
    }

    pub fn receive_window(&self) -> (u32, u32) {
        let w = self.window.lock();
        (w.r_id0, w.r_id1)
    }

    pub fn with_crypto<R>(&self, f: impl FnOnce(&CryptoContext) -> R) -> R {
        f(&self.crypto.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p3_crypto::KeyType;
    use std::net::Ipv4Addr;

    fn mkpeer() -> Peer {
        Peer::new(PeerId::new(1).unwrap(), IpVersion::V4, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 5653, 25000, 65000, KeyType::Aes128, false, None)
    }

    fn mksession() -> Session {
        Session::init(&mkpeer(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), Key::Aes128([1u8; 16]), Key::Aes128([2u8; 16])).unwrap()
    }

    #[test]
    fn sseq_starts_at_one_and_never_repeats() {
        let s = mksession();
        let a = s.next_sseq();
        let b = s.next_sseq();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert!(a < b);
    }

    #[test]
    fn sseq_skips_zero_on_wrap() {
        let s = mksession();
        s.sseq.store(u32::MAX, Ordering::Relaxed);
        let issued = s.next_sseq();
        assert_eq!(issued, u32::MAX);
        assert_ne!(s.peek_sseq(), 0);
        assert_eq!(s.peek_sseq(), 1);
    }

    #[test]
    fn begin_rekey_fails_while_already_rekeying() {
        let s = mksession();
        let _ticket = s.begin_rekey().unwrap();
        assert!(s.begin_rekey().is_err());
    }

    #[test]
    fn no_data_may_be_sent_while_rekeying_flag_set() {
        let s = mksession();
        assert!(!s.is_rekeying());
        let _ticket = s.begin_rekey().unwrap();
        assert!(s.is_rekeying());
    }

    #[test]
    fn s2_rekey_round_trip_commits_window_and_slot() {
        let s = mksession();
        for _ in 0..99 {
            s.next_sseq();
        }
        assert_eq!(s.peek_sseq(), 100);

        let ticket = s.begin_rekey().unwrap();
        s.stage_new_keys(Key::Aes128([9u8; 16]), Key::Aes128([10u8; 16]));
        s.commit_rekey(ticket, 101).unwrap();

        let (r0, r1) = s.receive_window();
        assert_eq!((r0, r1), (0, 101));
        assert_eq!(s.decrypt_slot_for_seq(101), Which::Data1);
        assert_eq!(s.decrypt_slot_for_seq(50), Which::Data0);
    }

    #[test]
    fn s3_rekey_error_short_circuit_does_not_rotate() {
        let s = mksession();
        let before = s.receive_window();
        let ticket = s.begin_rekey().unwrap();
        s.abort_rekey(ticket);
        assert_eq!(s.receive_window(), before);
        assert!(!s.is_rekeying());
        assert_eq!(s.decrypt_slot_for_seq(5), Which::Data1);
    }

    #[test]
    fn commit_rekey_is_idempotent() {
        let s = mksession();
        let ticket = s.begin_rekey().unwrap();
        s.stage_new_keys(Key::Aes128([9u8; 16]), Key::Aes128([10u8; 16]));
        s.commit_rekey(ticket, 101).unwrap();
        let after_first = s.receive_window();

        // A second commit_rekey with the same boundary, after the phase already
        // settled back to Idle, must be a no-op (Testable Property 7).
        let w_before = { let w = s.window.lock(); (w.r_id0, w.r_id1, w.phase) };
        assert_eq!(w_before.2, RekeyPhase::Idle);
        let dummy_ticket = RekeyTicket(());
        s.commit_rekey(dummy_ticket, 101).unwrap();
        assert_eq!(s.receive_window(), after_first);
    }

    #[test]
    fn rekey_trigger_fires_every_64_packets() {
        let s = mksession();
        for i in 1..64u32 {
            assert!(!s.rekey_due(i));
        }
        assert!(s.rekey_due(64));
    }
}
