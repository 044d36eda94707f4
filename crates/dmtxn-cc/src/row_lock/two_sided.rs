//! Two-sided row locks: owner and waiter sets behind a per-row mutex.
//!
//! Both sets are ordered by `(timestamp, txn id)`, oldest first. A queued
//! waiter is promoted by the release that makes it compatible: the releaser
//! CASes the waiter WAITING -> RUNNING and moves it into the owner set. A
//! waiter whose CAS fails was aborted meanwhile and is dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use dmtxn_error::{AbortReason, Result};
use dmtxn_types::{LockMode, Timestamp, TxnHandle, TxnId, TxnState};
use smallvec::SmallVec;
use tracing::debug;

use super::{LockGrant, LockProtocol, LockTarget, RowLockStrategy, abort, lost_state_reason};
use crate::metrics;

type PriorityKey = (Timestamp, TxnId);

#[derive(Debug)]
struct Waiter {
    txn: Arc<TxnHandle>,
    mode: LockMode,
}

/// Lock state of one row.
#[derive(Debug, Default)]
pub struct LockEntry {
    mode: LockMode,
    owners: BTreeMap<PriorityKey, Arc<TxnHandle>>,
    waiters: BTreeMap<PriorityKey, Waiter>,
}

impl LockEntry {
    pub const fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_owner(&self, txn: &TxnHandle) -> bool {
        self.owners.contains_key(&txn.priority_key())
    }

    pub fn is_waiting(&self, txn: &TxnHandle) -> bool {
        self.waiters.contains_key(&txn.priority_key())
    }

    /// No owners and no waiters.
    pub fn is_free(&self) -> bool {
        self.owners.is_empty() && self.waiters.is_empty() && self.mode == LockMode::None
    }

    fn grant(&mut self, txn: &Arc<TxnHandle>, mode: LockMode) {
        self.owners.insert(txn.priority_key(), Arc::clone(txn));
        self.mode = self.mode.max(mode);
        metrics::record_lock_acquired();
    }

    fn enqueue(&mut self, txn: &Arc<TxnHandle>, mode: LockMode) {
        self.waiters.insert(
            txn.priority_key(),
            Waiter {
                txn: Arc::clone(txn),
                mode,
            },
        );
        metrics::record_lock_wait();
    }

    fn settle_mode(&mut self) {
        if self.owners.is_empty() {
            self.mode = LockMode::None;
        }
    }

    /// Remove `txn` from owners, else from waiters. `false` if in neither.
    fn remove(&mut self, txn: &TxnHandle) -> bool {
        let key = txn.priority_key();
        let removed = self.owners.remove(&key).is_some() || self.waiters.remove(&key).is_some();
        self.settle_mode();
        removed
    }

    /// Drop owners and waiters that are already ABORTING.
    fn purge_aborting(&mut self) {
        self.owners
            .retain(|_, owner| owner.state() != TxnState::Aborting);
        self.waiters
            .retain(|_, waiter| waiter.txn.state() != TxnState::Aborting);
        self.settle_mode();
    }

    /// Promote compatible waiters, youngest or oldest first.
    fn promote(&mut self, youngest_first: bool) -> usize {
        let mut promoted = 0;
        loop {
            let next = if youngest_first {
                self.waiters.keys().next_back()
            } else {
                self.waiters.keys().next()
            };
            let Some(&key) = next else { break };
            if self.mode.conflicts(self.waiters[&key].mode) {
                break;
            }
            let Some(waiter) = self.waiters.remove(&key) else {
                break;
            };
            if waiter
                .txn
                .update_state(TxnState::Waiting, TxnState::Running)
            {
                debug!(
                    target: "dmtxn.lock",
                    txn = %waiter.txn.id(),
                    mode = %waiter.mode,
                    "waiter_promoted"
                );
                self.grant(&waiter.txn, waiter.mode);
                promoted += 1;
            }
        }
        promoted
    }

    fn oldest_holder(&self) -> Option<PriorityKey> {
        self.owners
            .keys()
            .next()
            .or_else(|| self.waiters.keys().next())
            .copied()
    }
}

fn require_running(txn: &TxnHandle) -> Result<()> {
    if txn.state() == TxnState::Running {
        Ok(())
    } else {
        Err(abort(txn, lost_state_reason(txn)))
    }
}

// ---------------------------------------------------------------------------
// NO-WAIT
// ---------------------------------------------------------------------------

/// Any conflict aborts the requester.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWait;

impl RowLockStrategy for NoWait {
    fn protocol(&self) -> LockProtocol {
        LockProtocol::NoWait
    }

    fn lock_get(
        &self,
        target: LockTarget<'_>,
        txn: &Arc<TxnHandle>,
        mode: LockMode,
    ) -> Result<LockGrant> {
        let mut entry = target.entry()?.lock();
        if entry.mode.conflicts(mode) {
            return Err(abort(txn, AbortReason::LockConflict));
        }
        entry.grant(txn, mode);
        Ok(LockGrant::Acquired)
    }

    fn lock_release(
        &self,
        target: LockTarget<'_>,
        txn: &Arc<TxnHandle>,
        _mode: LockMode,
    ) -> Result<()> {
        target.entry()?.lock().remove(txn);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WAIT-DIE
// ---------------------------------------------------------------------------

/// An older requester queues, a younger one dies.
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitDie;

impl RowLockStrategy for WaitDie {
    fn protocol(&self) -> LockProtocol {
        LockProtocol::WaitDie
    }

    fn lock_get(
        &self,
        target: LockTarget<'_>,
        txn: &Arc<TxnHandle>,
        mode: LockMode,
    ) -> Result<LockGrant> {
        require_running(txn)?;
        let me = txn.priority_key();
        let mut entry = target.entry()?.lock();
        let conflict = entry.mode.conflicts(mode) || !entry.waiters.is_empty();
        if !conflict {
            entry.grant(txn, mode);
            return Ok(LockGrant::Acquired);
        }
        if entry.oldest_holder().is_some_and(|oldest| oldest < me) {
            return Err(abort(txn, AbortReason::Died));
        }
        if !txn.update_state(TxnState::Running, TxnState::Waiting) {
            return Err(abort(txn, lost_state_reason(txn)));
        }
        entry.enqueue(txn, mode);
        debug!(target: "dmtxn.lock", txn = %txn.id(), ts = me.0.get(), %mode, "lock_wait");
        Ok(LockGrant::Waiting)
    }

    fn lock_release(
        &self,
        target: LockTarget<'_>,
        txn: &Arc<TxnHandle>,
        _mode: LockMode,
    ) -> Result<()> {
        let mut entry = target.entry()?.lock();
        entry.remove(txn);
        // Youngest first keeps every remaining waiter older than the new owners.
        entry.promote(true);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WOUND-WAIT
// ---------------------------------------------------------------------------

/// An older requester wounds conflicting younger owners and waiters.
///
/// Wounded transactions are flipped to ABORTING by CAS and dropped from the
/// entry on the spot; their later release is a no-op. Owners that already
/// reached COMMITTING cannot be wounded and are waited for.
#[derive(Debug, Default, Clone, Copy)]
pub struct WoundWait;

impl RowLockStrategy for WoundWait {
    fn protocol(&self) -> LockProtocol {
        LockProtocol::WoundWait
    }

    fn lock_get(
        &self,
        target: LockTarget<'_>,
        txn: &Arc<TxnHandle>,
        mode: LockMode,
    ) -> Result<LockGrant> {
        require_running(txn)?;
        let me = txn.priority_key();
        let mut entry = target.entry()?.lock();
        entry.purge_aborting();

        if entry.mode.conflicts(mode) {
            let younger: SmallVec<[PriorityKey; 4]> =
                entry.owners.range(me..).map(|(k, _)| *k).collect();
            for key in younger {
                if entry.owners[&key].wound() {
                    let victim = entry.owners.remove(&key);
                    metrics::record_wound();
                    debug!(
                        target: "dmtxn.lock",
                        txn = %txn.id(),
                        victim = ?victim.map(|v| v.id()),
                        "wound_owner"
                    );
                }
            }
            entry.settle_mode();
        }

        let older_waiter = entry.waiters.keys().next().is_some_and(|k| *k < me);
        if !entry.mode.conflicts(mode) && !older_waiter {
            entry.grant(txn, mode);
            return Ok(LockGrant::Acquired);
        }

        let younger_waiters: SmallVec<[PriorityKey; 4]> = entry
            .waiters
            .range(me..)
            .filter(|(_, w)| w.mode.conflicts(mode) || mode.conflicts(w.mode))
            .map(|(k, _)| *k)
            .collect();
        for key in younger_waiters {
            if entry.waiters[&key].txn.wound() {
                entry.waiters.remove(&key);
                metrics::record_wound();
            }
        }

        if !txn.update_state(TxnState::Running, TxnState::Waiting) {
            return Err(abort(txn, lost_state_reason(txn)));
        }
        entry.enqueue(txn, mode);
        debug!(target: "dmtxn.lock", txn = %txn.id(), ts = me.0.get(), %mode, "lock_wait");
        Ok(LockGrant::Waiting)
    }

    fn lock_release(
        &self,
        target: LockTarget<'_>,
        txn: &Arc<TxnHandle>,
        _mode: LockMode,
    ) -> Result<()> {
        let mut entry = target.entry()?.lock();
        if !entry.remove(txn) {
            return Ok(());
        }
        entry.purge_aborting();
        // Oldest first: younger waiters keep waiting on older owners.
        entry.promote(false);
        Ok(())
    }
}
