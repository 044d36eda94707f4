//! One-sided lock words and the memory medium they live in.
//!
//! Every row carries two 64-bit words ahead of its tuple bytes:
//!
//! ```text
//!   row addr + 0   lock word      63..56 writer | 55..0 reader count
//!   row addr + 8   priority word  timestamp of the oldest holder (0 = none)
//!   row addr + 16  tuple bytes
//! ```
//!
//! One-sided strategies never touch these words directly. They go through a
//! [`LockWordAccess`], which models the read / compare-and-swap / write /
//! fetch-and-add verbs a compute node can issue against remote memory.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dmtxn_error::Result;
use dmtxn_types::{LockMode, RemoteAddr};

/// Bit position of the writer byte.
pub const WRITER_SHIFT: u32 = 56;

/// Mask of the reader-count bits.
pub const READER_MASK: u64 = (1 << WRITER_SHIFT) - 1;

/// Offset of the lock word from the row address.
pub const LOCK_WORD_OFFSET: u64 = 0;

/// Offset of the priority word from the row address.
pub const TS_WORD_OFFSET: u64 = 8;

/// Bytes of lock state in front of every tuple.
pub const ROW_HEADER_BYTES: u64 = 16;

/// Decoded lock word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct LockWord(u64);

impl LockWord {
    pub const FREE: Self = Self(0);
    pub const EXCLUSIVE: Self = Self(1 << WRITER_SHIFT);

    #[inline]
    pub const fn new(readers: u64, writer: u8) -> Self {
        Self(((writer as u64) << WRITER_SHIFT) | (readers & READER_MASK))
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn readers(self) -> u64 {
        self.0 & READER_MASK
    }

    #[inline]
    pub const fn writer(self) -> u8 {
        (self.0 >> WRITER_SHIFT) as u8
    }

    #[inline]
    pub const fn is_free(self) -> bool {
        self.0 == 0
    }

    /// The mode the word is currently held in.
    #[inline]
    pub const fn held_mode(self) -> LockMode {
        if self.writer() != 0 {
            LockMode::Exclusive
        } else if self.readers() != 0 {
            LockMode::Shared
        } else {
            LockMode::None
        }
    }

    /// Whether a request for `requested` must not proceed against this word.
    #[inline]
    pub const fn conflicts(self, requested: LockMode) -> bool {
        match requested {
            LockMode::None => false,
            LockMode::Shared => self.writer() != 0,
            LockMode::Exclusive => self.0 != 0,
        }
    }

    /// The word with one more reader.
    #[inline]
    #[must_use]
    pub const fn with_reader_added(self) -> Self {
        debug_assert!(self.readers() < READER_MASK);
        Self(self.0 + 1)
    }

    /// The word with one reader fewer (saturating at zero readers).
    #[inline]
    #[must_use]
    pub const fn with_reader_removed(self) -> Self {
        if self.readers() == 0 {
            self
        } else {
            Self(self.0 - 1)
        }
    }
}

impl fmt::Display for LockWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock(w={}, r={})", self.writer(), self.readers())
    }
}

/// Remote-memory verbs over 64-bit words.
///
/// `cas` and `faa` return the value the word held before the operation, as
/// the RDMA atomics do; a CAS succeeded iff the returned value equals
/// `expected`.
pub trait LockWordAccess: Send + Sync + fmt::Debug {
    fn read(&self, addr: RemoteAddr) -> Result<u64>;
    fn cas(&self, addr: RemoteAddr, expected: u64, desired: u64) -> Result<u64>;
    fn write(&self, addr: RemoteAddr, value: u64) -> Result<()>;
    fn faa(&self, addr: RemoteAddr, delta: u64) -> Result<u64>;
}

/// The two lock words of one row, as stored on the memory node.
#[derive(Debug, Default)]
pub struct LockWordPair {
    lock: AtomicU64,
    ts: AtomicU64,
}

impl LockWordPair {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lock: AtomicU64::new(0),
            ts: AtomicU64::new(0),
        }
    }

    /// Word at `offset` bytes from the row address, if it is a lock word.
    #[inline]
    pub fn word_at(&self, offset: u64) -> Option<&AtomicU64> {
        match offset {
            LOCK_WORD_OFFSET => Some(&self.lock),
            TS_WORD_OFFSET => Some(&self.ts),
            _ => None,
        }
    }

    pub fn lock_word(&self) -> LockWord {
        LockWord::from_raw(self.lock.load(Ordering::Acquire))
    }

    pub fn ts_word(&self) -> u64 {
        self.ts.load(Ordering::Acquire)
    }

    /// Both words zero: nobody holds or stamps the row.
    pub fn is_quiescent(&self) -> bool {
        self.lock_word().is_free() && self.ts_word() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_rules() {
        let free = LockWord::FREE;
        let shared = LockWord::new(2, 0);
        let exclusive = LockWord::EXCLUSIVE;

        assert!(!free.conflicts(LockMode::Shared));
        assert!(!free.conflicts(LockMode::Exclusive));
        assert!(!shared.conflicts(LockMode::Shared));
        assert!(shared.conflicts(LockMode::Exclusive));
        assert!(exclusive.conflicts(LockMode::Shared));
        assert!(exclusive.conflicts(LockMode::Exclusive));

        assert_eq!(free.held_mode(), LockMode::None);
        assert_eq!(shared.held_mode(), LockMode::Shared);
        assert_eq!(exclusive.held_mode(), LockMode::Exclusive);
    }

    #[test]
    fn reader_arithmetic() {
        let w = LockWord::FREE.with_reader_added().with_reader_added();
        assert_eq!(w.readers(), 2);
        assert_eq!(w.writer(), 0);
        assert_eq!(w.with_reader_removed().readers(), 1);
        assert_eq!(LockWord::FREE.with_reader_removed(), LockWord::FREE);
        assert_eq!(LockWord::EXCLUSIVE.to_string(), "lock(w=1, r=0)");
    }

    #[test]
    fn pair_offsets() {
        let pair = LockWordPair::new();
        assert!(pair.word_at(LOCK_WORD_OFFSET).is_some());
        assert!(pair.word_at(TS_WORD_OFFSET).is_some());
        assert!(pair.word_at(ROW_HEADER_BYTES).is_none());
        pair.word_at(TS_WORD_OFFSET)
            .unwrap()
            .store(9, Ordering::Release);
        assert_eq!(pair.ts_word(), 9);
        assert!(!pair.is_quiescent());
    }

    proptest::proptest! {
        #[test]
        fn prop_lock_word_fields_roundtrip(readers in 0u64..=READER_MASK, writer in 0u8..=u8::MAX) {
            let w = LockWord::new(readers, writer);
            proptest::prop_assert_eq!(w.readers(), readers);
            proptest::prop_assert_eq!(w.writer(), writer);
            proptest::prop_assert_eq!(LockWord::from_raw(w.to_raw()), w);
        }
    }
}
