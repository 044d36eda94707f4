//! Row lock protocols.
//!
//! A [`RowLockStrategy`] is picked at runtime from the configured
//! [`LockProtocol`] and transport flavor:
//!
//! | protocol   | two-sided (runs on the memory node)  | one-sided (runs on the compute node) |
//! |------------|--------------------------------------|--------------------------------------|
//! | NO-WAIT    | conflict aborts                      | CAS on the lock word, conflict aborts |
//! | WAIT-DIE   | older queues, younger dies           | older spins (bounded), younger dies  |
//! | WOUND-WAIT | older wounds younger, then queues    | older wounds stamped holder, spins   |
//!
//! Two-sided strategies operate on the row's mutex-guarded [`LockEntry`].
//! One-sided strategies drive the row's lock words through an injected
//! [`LockWordAccess`], so the same code runs against real remote memory or
//! the in-process [`ClusterMemory`](crate::storage::ClusterMemory).

pub mod lock_word;
pub mod one_sided;
pub mod two_sided;

use std::fmt;
use std::sync::Arc;

use dmtxn_error::{AbortReason, DmtxnError, Result};
use dmtxn_types::{LockMode, RemoteAddr, TxnHandle};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use lock_word::{LockWord, LockWordAccess, LockWordPair};
pub use one_sided::{OneSidedMedium, TxnRegistry};
pub use two_sided::LockEntry;

use crate::metrics;

/// Deadlock-handling protocol for row locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockProtocol {
    #[default]
    NoWait,
    WaitDie,
    WoundWait,
}

impl LockProtocol {
    /// Whether requests must carry the transaction timestamp.
    #[inline]
    pub const fn uses_timestamps(self) -> bool {
        matches!(self, Self::WaitDie | Self::WoundWait)
    }
}

impl fmt::Display for LockProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoWait => "NO_WAIT",
            Self::WaitDie => "WAIT_DIE",
            Self::WoundWait => "WOUND_WAIT",
        };
        f.write_str(name)
    }
}

/// Non-error outcome of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    Acquired,
    /// Queued behind conflicting holders; the transaction is WAITING and
    /// becomes RUNNING again when a release promotes it.
    Waiting,
}

/// Where a row's lock state lives.
#[derive(Debug, Clone, Copy)]
pub enum LockTarget<'a> {
    /// Owner/waiter entry on the node executing the request.
    Entry(&'a Mutex<LockEntry>),
    /// Lock word at a row address, reached through one-sided verbs.
    Word(RemoteAddr),
}

impl<'a> LockTarget<'a> {
    pub fn entry(self) -> Result<&'a Mutex<LockEntry>> {
        match self {
            Self::Entry(entry) => Ok(entry),
            Self::Word(addr) => Err(DmtxnError::protocol(format!(
                "two-sided lock strategy given lock word {addr}"
            ))),
        }
    }

    pub fn word(self) -> Result<RemoteAddr> {
        match self {
            Self::Word(addr) => Ok(addr),
            Self::Entry(_) => Err(DmtxnError::protocol(
                "one-sided lock strategy given a lock entry",
            )),
        }
    }
}

/// Acquire and release one row lock on behalf of a transaction.
///
/// `lock_get` either grants, queues (two-sided WAIT-DIE / WOUND-WAIT only),
/// or fails with [`DmtxnError::Aborted`]. Every granted or queued request
/// must be paired with exactly one `lock_release` in the same mode.
pub trait RowLockStrategy: Send + Sync + fmt::Debug {
    fn protocol(&self) -> LockProtocol;

    fn lock_get(
        &self,
        target: LockTarget<'_>,
        txn: &Arc<TxnHandle>,
        mode: LockMode,
    ) -> Result<LockGrant>;

    fn lock_release(&self, target: LockTarget<'_>, txn: &Arc<TxnHandle>, mode: LockMode)
    -> Result<()>;
}

/// Strategy for lock entries on the memory node.
#[must_use]
pub fn two_sided_strategy(protocol: LockProtocol) -> Arc<dyn RowLockStrategy> {
    match protocol {
        LockProtocol::NoWait => Arc::new(two_sided::NoWait),
        LockProtocol::WaitDie => Arc::new(two_sided::WaitDie),
        LockProtocol::WoundWait => Arc::new(two_sided::WoundWait),
    }
}

/// Strategy for lock words reached through `medium`.
#[must_use]
pub fn one_sided_strategy(protocol: LockProtocol, medium: OneSidedMedium) -> Arc<dyn RowLockStrategy> {
    match protocol {
        LockProtocol::NoWait => Arc::new(one_sided::NoWait::new(medium)),
        LockProtocol::WaitDie => Arc::new(one_sided::WaitDie::new(medium)),
        LockProtocol::WoundWait => Arc::new(one_sided::WoundWait::new(medium)),
    }
}

fn abort(txn: &TxnHandle, reason: AbortReason) -> DmtxnError {
    metrics::record_lock_abort();
    debug!(
        target: "dmtxn.lock",
        txn = %txn.id(),
        ts = txn.ts().get(),
        %reason,
        "lock_abort"
    );
    DmtxnError::aborted(txn.id(), reason)
}

/// Reason to report when a state CAS out of RUNNING/WAITING lost.
fn lost_state_reason(txn: &TxnHandle) -> AbortReason {
    match txn.state() {
        dmtxn_types::TxnState::Aborting => AbortReason::Wounded,
        _ => AbortReason::NotRunning,
    }
}
