//! Optional precomputed key array (spec.md §3: "Optional key-array of precomputed
//! keys (max configured size) with current data-index and control-index"), installed
//! by `SET_KEY_ARRAY` for peers that permit it (`Peer::key_arrays_permitted`).
//!
//! `REPLACE_KEY` may reference a slot in this shared pool instead of carrying a raw
//! key (`KeyOrIndex::Index`, p3-proto's control codec). Per REDESIGN FLAG 4
//! (SPEC_FULL §4.10), the data-field index and control-field index of a single
//! `REPLACE_KEY` message are validated independently against the pool size — the
//! original conflated them, checking the control field's index against the data
//! index's bookkeeping.

use p3_crypto::Key;
use p3_utils::error::P3Error;

#[derive(Default)]
pub struct KeyArray {
    keys: Vec<Key>,
    data_index: u16,
    control_index: u16,
}

impl KeyArray {
    pub fn install(&mut self, keys: Vec<Key>) {
        self.keys = keys;
        self.data_index = 0;
        self.control_index = 0;
    }

    pub fn max_size(&self) -> usize {
        self.keys.len()
    }

    pub fn is_installed(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Resolve a data-key-array index. Bounds-checked against the pool size using
    /// `idx` itself, never `control_index`'s bookkeeping.
    pub fn resolve_data(&self, idx: u16) -> Result<Key, P3Error> {
        self.keys.get(idx as usize).cloned().ok_or(P3Error::BadControl("data key-array index out of range"))
    }

    /// Resolve a control-key-array index. Bounds-checked against the pool size using
    /// `idx` itself (the fix for REDESIGN FLAG 4: the original checked this against
    /// `didx`'s bookkeeping instead of `cidx`'s).
    pub fn resolve_control(&self, idx: u16) -> Result<Key, P3Error> {
        self.keys.get(idx as usize).cloned().ok_or(P3Error::BadControl("control key-array index out of range"))
    }

    pub fn data_index(&self) -> u16 {
        self.data_index
    }

    pub fn control_index(&self) -> u16 {
        self.control_index
    }

    /// Advance the data-index cursor, wrapping at the pool size. Used by the
    /// periodic index-rotation path (SPEC_FULL §4.10, `Engine::tick`).
    pub fn advance_data_index(&mut self) -> Option<u16> {
        if self.keys.is_empty() {
            return None;
        }
        self.data_index = (self.data_index + 1) % self.keys.len() as u16;
        Some(self.data_index)
    }

    pub fn advance_control_index(&mut self) -> Option<u16> {
        if self.keys.is_empty() {
            return None;
        }
        self.control_index = (self.control_index + 1) % self.keys.len() as u16;
        Some(self.control_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(b: u8) -> Key {
        Key::Aes128([b; 16])
    }

    #[test]
    fn resolves_independent_indices() {
        let mut a = KeyArray::default();
        a.install(vec![k(1), k(2), k(3)]);
        assert!(matches!(a.resolve_data(0), Ok(Key::Aes128(b)) if b == [1u8; 16]));
        assert!(matches!(a.resolve_control(2), Ok(Key::Aes128(b)) if b == [3u8; 16]));
    }

    #[test]
    fn out_of_range_control_index_rejected_independent_of_data_index() {
        let mut a = KeyArray::default();
        a.install(vec![k(1), k(2)]);
        // A correct implementation rejects an out-of-range control index regardless
        // of what the data index happens to be (REDESIGN FLAG 4).
        assert!(a.resolve_data(0).is_ok());
        assert!(a.resolve_control(5).is_err());
    }

    #[test]
    fn advance_wraps_at_pool_size() {
        let mut a = KeyArray::default();
        a.install(vec![k(1), k(2)]);
        assert_eq!(a.advance_data_index(), Some(1));
        assert_eq!(a.advance_data_index(), Some(0));
    }
}
