//! Per-peer session state (C4, spec.md §4.4) and the rekey state machine layered
//! on top of it (C8, spec.md §4.8), plus the optional precomputed key array
//! (spec.md §3) that `REPLACE_KEY`/`SET_KEY_ARRAY` control messages can reference.

pub mod keyarray;
pub mod session;

pub use keyarray::KeyArray;
pub use session::{RekeyPhase, RekeyTicket, Session, REKEY_PERIOD_MASK};
