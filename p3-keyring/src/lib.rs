//! C2: Key Supply Ring.
//!
//! A byte ring of fixed capacity shared between one producer (a true-random key source
//! living outside this crate, spec.md §1 Non-goals) and one consumer (the session layer
//! requesting a new key during rekey). The single-producer/single-consumer discipline
//! (spec.md §4.2, §5 "Sharing discipline") means acquire/release on two plain atomics is
//! sufficient: the head index is advanced only by the producer, the tail only by the
//! consumer, and the ring is empty iff `head == tail`.
//!
//! Modeled on the lock-free bookkeeping style of `zssp::fragged::Fragged` in this
//! workspace's ZeroTier ancestry: a fixed-size buffer behind an `UnsafeCell`, guarded by
//! atomics rather than a mutex, because the two sides never contend for the same memory
//! region at the same time.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// Producer-side: not enough free space for this key. Caller should retry later.
    #[error("key ring has insufficient free space")]
    WouldBlock,
    /// Consumer-side: no key of the requested width is available yet. Caller must treat
    /// this as "retry later" and never block packet handling on it (spec.md §4.2).
    #[error("key ring has no key of the requested width ready")]
    Empty,
}

/// A single-producer/single-consumer byte ring of `CAP` bytes.
pub struct KeyRing<const CAP: usize> {
    buf: UnsafeCell<[u8; CAP]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// SAFETY: `put` touches only `head` and the region between the old and new head, which
// the consumer (bounded by `tail`) never reads concurrently; `take` is the mirror image.
// This is the standard SPSC ring buffer argument.
unsafe impl<const CAP: usize> Sync for KeyRing<CAP> {}
unsafe impl<const CAP: usize> Send for KeyRing<CAP> {}

impl<const CAP: usize> Default for KeyRing<CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAP: usize> KeyRing<CAP> {
    pub fn new() -> Self {
        Self { buf: UnsafeCell::new([0u8; CAP]), head: AtomicUsize::new(0), tail: AtomicUsize::new(0) }
    }

    #[inline]
    fn used(&self, head: usize, tail: usize) -> usize {
        head.wrapping_sub(tail)
    }

    /// Producer side: non-blocking. Fails with `WouldBlock` if there is not enough free
    /// space; the producer is expected to retry (spec.md §4.2).
    pub fn put(&self, key_bytes: &[u8]) -> Result<(), RingError> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let used = self.used(head, tail);
        let free = CAP - used;
        if key_bytes.len() > free {
            return Err(RingError::WouldBlock);
        }
        // SAFETY: only the producer writes through `head`, and it never writes past the
        // region the consumer has already released (bounded by `tail`, read above).
        let buf = unsafe { &mut *self.buf.get() };
        for (i, &b) in key_bytes.iter().enumerate() {
            buf[(head.wrapping_add(i)) % CAP] = b;
        }
        self.head.store(head.wrapping_add(key_bytes.len()), Ordering::Release);
        Ok(())
    }

    /// Consumer side: non-blocking. Fails with `Empty` if no key of `width` bytes is
    /// available. Never blocks packet handling (spec.md §4.2, §5).
    pub fn take(&self, width: usize, out: &mut [u8]) -> Result<(), RingError> {
        debug_assert!(out.len() >= width);
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let used = self.used(head, tail);
        if width > used {
            return Err(RingError::Empty);
        }
        // SAFETY: only the consumer writes through `tail`, and it never reads past what
        // the producer has already published (bounded by `head`, read above).
        let buf = unsafe { &*self.buf.get() };
        for i in 0..width {
            out[i] = buf[(tail.wrapping_add(i)) % CAP];
        }
        self.tail.store(tail.wrapping_add(width), Ordering::Release);
        Ok(())
    }

    /// Bytes currently queued (diagnostic use only; racy w.r.t. the other side by design).
    pub fn len(&self) -> usize {
        self.used(self.head.load(Ordering::Relaxed), self.tail.load(Ordering::Relaxed))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        CAP
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_take_roundtrips() {
        let ring: KeyRing<64> = KeyRing::new();
        ring.put(&[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        ring.take(4, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(ring.is_empty());
    }

    #[test]
    fn take_empty_reports_empty() {
        let ring: KeyRing<32> = KeyRing::new();
        let mut out = [0u8; 16];
        assert_eq!(ring.take(16, &mut out), Err(RingError::Empty));
    }

    #[test]
    fn put_exceeding_capacity_would_block() {
        let ring: KeyRing<8> = KeyRing::new();
        assert_eq!(ring.put(&[0u8; 9]), Err(RingError::WouldBlock));
    }

    #[test]
    fn wraps_around_correctly() {
        let ring: KeyRing<8> = KeyRing::new();
        ring.put(&[1, 2, 3, 4, 5, 6]).unwrap();
        let mut out = [0u8; 6];
        ring.take(6, &mut out).unwrap();
        ring.put(&[7, 8, 9, 10, 11, 12]).unwrap();
        let mut out2 = [0u8; 6];
        ring.take(6, &mut out2).unwrap();
        assert_eq!(out2, [7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn partial_key_not_consumable_until_fully_available() {
        let ring: KeyRing<32> = KeyRing::new();
        ring.put(&[1, 2, 3]).unwrap();
        let mut out = [0u8; 16];
        assert_eq!(ring.take(16, &mut out), Err(RingError::Empty));
    }
}
