//! C1: Crypto Context.
//!
//! Holds, per session, the AES cipher state for the data and control channels and
//! performs the sequence-number-keyed symmetric encrypt/decrypt of spec.md §4.1.
//!
//! AES itself is treated as an external primitive (spec.md §1 Non-goals): this crate
//! calls into RustCrypto's `aes` block ciphers and layers its own counter-mode keying
//! on top, with the per-packet sequence number seeding the counter (spec.md: "The
//! sequence number feeds the IV/counter derivation"). Because counter mode's keystream
//! generation is the same operation regardless of direction, a single keyed cipher
//! serves both `encrypt` and `decrypt` for a given slot; see DESIGN.md for why this
//! collapses the eight "opaque AES states" of spec.md §4.1 to four keystream generators.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use p3_utils::error::{P3Error, P3Result};

pub const AES128_KEY_SIZE: usize = 16;
pub const AES256_KEY_SIZE: usize = 32;

/// The two supported key widths, matching the peer attribute "key type" of spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Aes128,
    Aes256,
}

#[derive(Clone)]
pub enum Key {
    Aes128([u8; AES128_KEY_SIZE]),
    Aes256([u8; AES256_KEY_SIZE]),
}

impl Key {
    pub fn key_type(&self) -> KeyType {
        match self {
            Key::Aes128(_) => KeyType::Aes128,
            Key::Aes256(_) => KeyType::Aes256,
        }
    }

    /// Build a `Key` from raw bytes of the width implied by `key_type` (control-channel
    /// key material arrives this way off the wire or the key ring, spec.md §4.2/§4.7).
    pub fn from_slice(key_type: KeyType, bytes: &[u8]) -> P3Result<Self> {
        match key_type {
            KeyType::Aes128 => {
                let arr: [u8; AES128_KEY_SIZE] = bytes.try_into().map_err(|_| P3Error::BadControl("wrong AES-128 key width"))?;
                Ok(Key::Aes128(arr))
            }
            KeyType::Aes256 => {
                let arr: [u8; AES256_KEY_SIZE] = bytes.try_into().map_err(|_| P3Error::BadControl("wrong AES-256 key width"))?;
                Ok(Key::Aes256(arr))
            }
        }
    }

    pub fn width(key_type: KeyType) -> usize {
        match key_type {
            KeyType::Aes128 => AES128_KEY_SIZE,
            KeyType::Aes256 => AES256_KEY_SIZE,
        }
    }
}

enum BlockCipher {
    Aes128(Box<Aes128>),
    Aes256(Box<Aes256>),
}

impl BlockCipher {
    fn new(key: &Key) -> Self {
        match key {
            Key::Aes128(k) => BlockCipher::Aes128(Box::new(Aes128::new_from_slice(k).expect("16-byte key"))),
            Key::Aes256(k) => BlockCipher::Aes256(Box::new(Aes256::new_from_slice(k).expect("32-byte key"))),
        }
    }

    #[inline]
    fn encrypt_block(&self, block: &mut aes::cipher::generic_array::GenericArray<u8, aes::cipher::consts::U16>) {
        match self {
            BlockCipher::Aes128(c) => c.encrypt_block(block),
            BlockCipher::Aes256(c) => c.encrypt_block(block),
        }
    }
}

/// One keyed counter-mode keystream generator: the unit that `which` (spec.md §4.1)
/// selects among the four live ones (data slot0/1, control slot0/1).
pub struct CipherSlot {
    cipher: Option<BlockCipher>,
}

impl CipherSlot {
    fn empty() -> Self {
        Self { cipher: None }
    }

    fn keyed(key: &Key) -> Self {
        Self { cipher: Some(BlockCipher::new(key)) }
    }

    fn is_initialized(&self) -> bool {
        self.cipher.is_some()
    }

    /// XOR `buf` (len must be a multiple of 16) with the AES-CTR keystream derived from
    /// `seq`. This single operation serves as both encrypt and decrypt: CTR mode XORs
    /// the same keystream either way.
    fn apply_keystream(&self, buf: &mut [u8], seq: u32) -> P3Result<()> {
        let cipher = self.cipher.as_ref().ok_or(P3Error::DecryptFailure)?;
        if buf.len() % 16 != 0 {
            return Err(P3Error::DecryptFailure);
        }
        for (block_index, chunk) in buf.chunks_mut(16).enumerate() {
            let counter = seq.wrapping_add(block_index as u32);
            let mut block = aes::cipher::generic_array::GenericArray::<u8, aes::cipher::consts::U16>::default();
            block[12..16].copy_from_slice(&counter.to_be_bytes());
            cipher.encrypt_block(&mut block);
            for (b, k) in chunk.iter_mut().zip(block.iter()) {
                *b ^= *k;
            }
        }
        Ok(())
    }
}

/// Which of the four live keystream generators an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Which {
    Data0,
    Data1,
    Ctl0,
    Ctl1,
}

/// The per-session crypto context: two generations ("slots") for data and control.
///
/// Invariant (spec.md §3): slot 0 always corresponds to a key that was previously in
/// slot 1; `rekey` rotates 1 -> 0 and installs a fresh slot 1.
pub struct CryptoContext {
    data: [CipherSlot; 2],
    control: [CipherSlot; 2],
    pending_data_key: Option<Key>,
    pending_control_key: Option<Key>,
}

impl CryptoContext {
    /// Initialize from the currently-staged data/control keys. Populates slot 1 only;
    /// slot 0 remains uninitialized until the first rekey (spec.md §4.1).
    pub fn init(data_key: Key, control_key: Key) -> Self {
        Self {
            data: [CipherSlot::empty(), CipherSlot::keyed(&data_key)],
            control: [CipherSlot::empty(), CipherSlot::keyed(&control_key)],
            pending_data_key: Some(data_key),
            pending_control_key: Some(control_key),
        }
    }

    /// Stage a new data/control key pair to be installed on the next `rekey` call.
    pub fn stage_new_keys(&mut self, data_key: Key, control_key: Key) {
        self.pending_data_key = Some(data_key);
        self.pending_control_key = Some(control_key);
    }

    /// Atomically move slot 1 -> slot 0 for both data and control, then (re)initialize
    /// slot 1 from the pending new keys (spec.md §4.1). Never invoked concurrently with
    /// `encrypt`/`decrypt`: the session's `REKEY` flag must be set first, which blocks
    /// all data-path traffic (spec.md §4.4).
    pub fn rekey(&mut self) -> P3Result<()> {
        let new_data = self.pending_data_key.take().ok_or(P3Error::NoKey)?;
        let new_control = self.pending_control_key.take().ok_or(P3Error::NoKey)?;
        self.data.swap(0, 1);
        self.control.swap(0, 1);
        self.data[1] = CipherSlot::keyed(&new_data);
        self.control[1] = CipherSlot::keyed(&new_control);
        Ok(())
    }

    fn slot(&self, which: Which) -> &CipherSlot {
        match which {
            Which::Data0 => &self.data[0],
            Which::Data1 => &self.data[1],
            Which::Ctl0 => &self.control[0],
            Which::Ctl1 => &self.control[1],
        }
    }

    pub fn slot_ready(&self, which: Which) -> bool {
        self.slot(which).is_initialized()
    }

    /// Encrypt `buf` in place. `buf.len()` must be a multiple of 16.
    pub fn encrypt(&self, buf: &mut [u8], seq: u32, which: Which) -> P3Result<()> {
        self.slot(which).apply_keystream(buf, seq)
    }

    /// Decrypt `buf` in place. `buf.len()` must be a multiple of 16.
    pub fn decrypt(&self, buf: &mut [u8], seq: u32, which: Which) -> P3Result<()> {
        self.slot(which).apply_keystream(buf, seq)
    }
}
