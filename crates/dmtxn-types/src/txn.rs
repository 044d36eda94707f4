//! Transaction state machine and the shared transaction handle.
//!
//! ## State machine
//!
//! ```text
//!   RUNNING ──► WAITING ──► RUNNING      (lock granted / promoted)
//!      │           │
//!      │           └──────► ABORTING     (wounded while queued)
//!      ├──► COMMITTING                   (prepare succeeded)
//!      └──► ABORTING                     (wounded, died, voted abort)
//! ```
//!
//! Every transition that can race with a remote wound goes through
//! [`AtomicTxnState::update`], a single compare-and-swap: when a wounder and
//! the owner race, exactly one CAS wins and the loser re-reads the state.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::ids::{Timestamp, TxnId};

/// Transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxnState {
    Running = 0,
    Waiting = 1,
    Committing = 2,
    Aborting = 3,
}

impl TxnState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Waiting,
            2 => Self::Committing,
            _ => Self::Aborting,
        }
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Committing => "COMMITTING",
            Self::Aborting => "ABORTING",
        };
        f.write_str(name)
    }
}

/// Atomic cell holding a [`TxnState`].
#[derive(Debug)]
pub struct AtomicTxnState(AtomicU8);

impl AtomicTxnState {
    pub const fn new(state: TxnState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[inline]
    pub fn load(&self) -> TxnState {
        TxnState::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, state: TxnState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// CAS `expected -> desired`; `true` iff this call performed the transition.
    #[inline]
    pub fn update(&self, expected: TxnState, desired: TxnState) -> bool {
        self.0
            .compare_exchange(
                expected as u8,
                desired as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for AtomicTxnState {
    fn default() -> Self {
        Self::new(TxnState::Running)
    }
}

/// The part of a transaction other transactions may observe and wound.
///
/// Shared through `Arc` between the owning worker (or server-side
/// transaction), lock tables holding it as owner or waiter, and the wound
/// registry. Storage nodes learn the timestamp from the first request, so it
/// is settable once.
#[derive(Debug)]
pub struct TxnHandle {
    id: TxnId,
    ts: AtomicU64,
    state: AtomicTxnState,
}

impl TxnHandle {
    pub fn new(id: TxnId, ts: Timestamp) -> Self {
        Self {
            id,
            ts: AtomicU64::new(ts.get()),
            state: AtomicTxnState::new(TxnState::Running),
        }
    }

    #[inline]
    pub const fn id(&self) -> TxnId {
        self.id
    }

    #[inline]
    pub fn ts(&self) -> Timestamp {
        Timestamp::new(self.ts.load(Ordering::Acquire))
    }

    /// Record the timestamp unless one is already set. Returns the effective value.
    pub fn set_ts_if_unset(&self, ts: Timestamp) -> Timestamp {
        match self
            .ts
            .compare_exchange(0, ts.get(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => ts,
            Err(current) => Timestamp::new(current),
        }
    }

    /// Overwrite the timestamp (client side, when a fresh priority is drawn).
    pub fn reset_ts(&self, ts: Timestamp) {
        self.ts.store(ts.get(), Ordering::Release);
    }

    #[inline]
    pub fn state(&self) -> TxnState {
        self.state.load()
    }

    #[inline]
    pub fn set_state(&self, state: TxnState) {
        self.state.store(state);
    }

    #[inline]
    pub fn update_state(&self, expected: TxnState, desired: TxnState) -> bool {
        self.state.update(expected, desired)
    }

    /// Force this transaction into ABORTING unless it already reached COMMITTING.
    ///
    /// Returns `true` if the transaction is ABORTING when the call returns.
    pub fn wound(&self) -> bool {
        loop {
            let current = self.state();
            match current {
                TxnState::Aborting => return true,
                TxnState::Committing => return false,
                TxnState::Running | TxnState::Waiting => {
                    if self.update_state(current, TxnState::Aborting) {
                        return true;
                    }
                }
            }
        }
    }

    /// Total priority order: (timestamp, identity).
    #[inline]
    pub fn priority_key(&self) -> (Timestamp, TxnId) {
        (self.ts(), self.id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;
    use crate::ids::ThreadId;

    fn handle(thread: u32, ts: u64) -> TxnHandle {
        TxnHandle::new(TxnId::new(0, ThreadId::new(thread)), Timestamp::new(ts))
    }

    #[test]
    fn cas_transitions() {
        let txn = handle(1, 10);
        assert_eq!(txn.state(), TxnState::Running);
        assert!(txn.update_state(TxnState::Running, TxnState::Waiting));
        assert!(!txn.update_state(TxnState::Running, TxnState::Committing));
        assert!(txn.update_state(TxnState::Waiting, TxnState::Running));
        assert!(txn.update_state(TxnState::Running, TxnState::Committing));
        assert!(!txn.wound(), "committing transactions cannot be wounded");
        assert_eq!(txn.state(), TxnState::Committing);
    }

    #[test]
    fn timestamp_set_once() {
        let txn = handle(1, 0);
        assert_eq!(txn.set_ts_if_unset(Timestamp::new(7)), Timestamp::new(7));
        assert_eq!(txn.set_ts_if_unset(Timestamp::new(9)), Timestamp::new(7));
        assert_eq!(txn.ts(), Timestamp::new(7));
    }

    #[test]
    fn concurrent_wound_and_advance_have_one_winner() {
        for _ in 0..200 {
            let txn = Arc::new(handle(3, 5));
            let barrier = Arc::new(Barrier::new(2));

            let t_wound = {
                let txn = Arc::clone(&txn);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    txn.wound()
                })
            };
            let t_commit = {
                let txn = Arc::clone(&txn);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    txn.update_state(TxnState::Running, TxnState::Committing)
                })
            };

            let wounded = t_wound.join().unwrap();
            let committed = t_commit.join().unwrap();
            assert!(wounded ^ committed, "exactly one side must win");
            let expected = if wounded {
                TxnState::Aborting
            } else {
                TxnState::Committing
            };
            assert_eq!(txn.state(), expected);
        }
    }
}
