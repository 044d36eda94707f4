//! Per-(member, node) batch slot word.
//!
//! A slot records whether a member thread has a request parked for one
//! storage node, and who currently owns that request. The four states are
//! packed into one `AtomicU64` so every transition is a single CAS:
//!
//! ```text
//!   bits 63..62  tag     00 Idle, 01 Pending, 10 Claimed, 11 NeedsIndividualRetry
//!   bits 31..0   size    request byte size (Pending only)
//! ```
//!
//! ## Ownership of transitions
//!
//! ```text
//!   member:  Idle ──submit──► Pending(size)
//!   member:  Pending(size) ──reclaim──► Idle                (deadline passed)
//!   leader:  Pending(size) ──claim──► Claimed
//!   leader:  Claimed ──resolve──► Idle | NeedsIndividualRetry
//!   member:  NeedsIndividualRetry ──acknowledge_retry──► Idle
//! ```
//!
//! A reclaim and a claim racing on the same `Pending` word are decided by
//! the CAS: exactly one of them observes `Pending(size)`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const TAG_SHIFT: u32 = 62;
const TAG_MASK: u64 = 0b11 << TAG_SHIFT;
const SIZE_MASK: u64 = u32::MAX as u64;

const TAG_IDLE: u64 = 0b00;
const TAG_PENDING: u64 = 0b01;
const TAG_CLAIMED: u64 = 0b10;
const TAG_RETRY: u64 = 0b11;

/// Decoded slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// No request in flight (or the previous one completed).
    Idle,
    /// A request of this many bytes waits in the member's send buffer.
    Pending(u32),
    /// The leader took the request into a batch.
    Claimed,
    /// The batch could not serve the request: the member receives it itself.
    NeedsIndividualRetry,
}

impl SlotState {
    #[inline]
    pub const fn encode(self) -> u64 {
        match self {
            Self::Idle => TAG_IDLE << TAG_SHIFT,
            Self::Pending(size) => (TAG_PENDING << TAG_SHIFT) | size as u64,
            Self::Claimed => TAG_CLAIMED << TAG_SHIFT,
            Self::NeedsIndividualRetry => TAG_RETRY << TAG_SHIFT,
        }
    }

    #[inline]
    pub const fn decode(word: u64) -> Self {
        match (word & TAG_MASK) >> TAG_SHIFT {
            TAG_IDLE => Self::Idle,
            TAG_PENDING => Self::Pending((word & SIZE_MASK) as u32),
            TAG_CLAIMED => Self::Claimed,
            _ => Self::NeedsIndividualRetry,
        }
    }

    /// "Settled" from the member's point of view: nothing pending and not claimed.
    #[inline]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Idle | Self::NeedsIndividualRetry)
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Pending(size) => write!(f, "pending({size})"),
            Self::Claimed => f.write_str("claimed"),
            Self::NeedsIndividualRetry => f.write_str("needs-individual-retry"),
        }
    }
}

/// A slot transition found the word in an unexpected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTransitionError {
    pub op: &'static str,
    pub found: SlotState,
}

impl fmt::Display for SlotTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {} found the slot {}", self.op, self.found)
    }
}

impl std::error::Error for SlotTransitionError {}

/// One slot word.
#[derive(Debug)]
pub struct AtomicSlot(AtomicU64);

impl Default for AtomicSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicSlot {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(SlotState::Idle.encode()))
    }

    #[inline]
    pub fn load(&self) -> SlotState {
        SlotState::decode(self.0.load(Ordering::Acquire))
    }

    #[inline]
    fn transition(&self, from: SlotState, to: SlotState) -> Result<(), SlotState> {
        self.0
            .compare_exchange(from.encode(), to.encode(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SlotState::decode)
    }

    /// Member: park a request of `size` bytes. The slot must be idle.
    pub fn submit(&self, size: u32) -> Result<(), SlotTransitionError> {
        if size == 0 {
            return Err(SlotTransitionError {
                op: "submit of an empty request",
                found: self.load(),
            });
        }
        self.transition(SlotState::Idle, SlotState::Pending(size))
            .map_err(|found| SlotTransitionError { op: "submit", found })
    }

    /// Leader: take a pending request. Returns its size, or `None` if the slot
    /// holds nothing to claim or the member reclaimed it first.
    pub fn try_claim(&self) -> Option<u32> {
        match self.load() {
            SlotState::Pending(size) => self
                .transition(SlotState::Pending(size), SlotState::Claimed)
                .ok()
                .map(|()| size),
            _ => None,
        }
    }

    /// Member: withdraw a pending request after its deadline.
    ///
    /// `true` means the member owns the request again and must send it
    /// individually; `false` means the leader claimed it first.
    pub fn reclaim(&self) -> bool {
        match self.load() {
            SlotState::Pending(size) => self
                .transition(SlotState::Pending(size), SlotState::Idle)
                .is_ok(),
            _ => false,
        }
    }

    /// Leader: hand a claimed request back, either served or for individual retry.
    pub fn resolve(&self, needs_individual_retry: bool) -> Result<(), SlotTransitionError> {
        let to = if needs_individual_retry {
            SlotState::NeedsIndividualRetry
        } else {
            SlotState::Idle
        };
        self.transition(SlotState::Claimed, to)
            .map_err(|found| SlotTransitionError { op: "resolve", found })
    }

    /// Member: consume a retry signal. `true` if one was pending.
    pub fn acknowledge_retry(&self) -> bool {
        self.transition(SlotState::NeedsIndividualRetry, SlotState::Idle)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn member_and_leader_round() {
        let slot = AtomicSlot::new();
        slot.submit(100).unwrap();
        assert_eq!(slot.load(), SlotState::Pending(100));
        assert_eq!(slot.try_claim(), Some(100));
        assert_eq!(slot.load(), SlotState::Claimed);
        slot.resolve(true).unwrap();
        assert!(slot.acknowledge_retry());
        assert_eq!(slot.load(), SlotState::Idle);
    }

    #[test]
    fn illegal_transitions_are_reported() {
        let slot = AtomicSlot::new();
        assert_eq!(
            slot.resolve(false),
            Err(SlotTransitionError {
                op: "resolve",
                found: SlotState::Idle
            })
        );
        slot.submit(8).unwrap();
        let err = slot.submit(8).unwrap_err();
        assert_eq!(err.found, SlotState::Pending(8));
        assert!(err.to_string().contains("pending(8)"));
        assert!(slot.submit(0).is_err());
        assert!(!slot.acknowledge_retry());
    }

    #[test]
    fn claimed_slot_cannot_be_reclaimed() {
        let slot = AtomicSlot::new();
        slot.submit(64).unwrap();
        assert_eq!(slot.try_claim(), Some(64));
        assert!(!slot.reclaim());
        assert_eq!(slot.try_claim(), None);
    }

    #[test]
    fn claim_and_reclaim_race_has_one_winner() {
        for _ in 0..500 {
            let slot = Arc::new(AtomicSlot::new());
            slot.submit(32).unwrap();
            let barrier = Arc::new(Barrier::new(2));

            let leader = {
                let slot = Arc::clone(&slot);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    slot.try_claim().is_some()
                })
            };
            let member = {
                let slot = Arc::clone(&slot);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    slot.reclaim()
                })
            };
            let claimed = leader.join().unwrap();
            let reclaimed = member.join().unwrap();
            assert!(claimed ^ reclaimed);
            let expected = if claimed { SlotState::Claimed } else { SlotState::Idle };
            assert_eq!(slot.load(), expected);
        }
    }

    fn any_state() -> impl Strategy<Value = SlotState> {
        prop_oneof![
            Just(SlotState::Idle),
            any::<u32>().prop_map(SlotState::Pending),
            Just(SlotState::Claimed),
            Just(SlotState::NeedsIndividualRetry),
        ]
    }

    proptest! {
        #[test]
        fn prop_slot_word_packing(state in any_state()) {
            prop_assert_eq!(SlotState::decode(state.encode()), state);
        }
    }
}
