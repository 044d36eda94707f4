//! One-sided row locks: compute threads CAS the row's lock word directly.
//!
//! There is no queue to park in, so WAIT-DIE and WOUND-WAIT wait by
//! spinning. Every spin is bounded by the medium's `wait_timeout` on the
//! injected clock and by the shutdown flag; running out of either aborts the
//! requester with [`AbortReason::LockWaitTimeout`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dmtxn_error::{AbortReason, Result};
use dmtxn_types::{
    Clock, LockMode, RemoteAddr, ShutdownFlag, SpinWait, Timestamp, TxnHandle, TxnState,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::lock_word::{LockWord, LockWordAccess, TS_WORD_OFFSET};
use super::{LockGrant, LockProtocol, LockTarget, RowLockStrategy, abort, lost_state_reason};
use crate::metrics;

/// Live transactions by timestamp, so a WOUND-WAIT requester can reach the
/// holder stamped in a row's priority word.
#[derive(Debug, Default)]
pub struct TxnRegistry {
    live: Mutex<HashMap<Timestamp, Arc<TxnHandle>>>,
}

impl TxnRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, txn: &Arc<TxnHandle>) {
        self.live.lock().insert(txn.ts(), Arc::clone(txn));
    }

    pub fn unregister(&self, ts: Timestamp) {
        self.live.lock().remove(&ts);
    }

    pub fn get(&self, ts: Timestamp) -> Option<Arc<TxnHandle>> {
        self.live.lock().get(&ts).cloned()
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a one-sided strategy needs besides the row address.
#[derive(Clone)]
pub struct OneSidedMedium {
    pub words: Arc<dyn LockWordAccess>,
    pub registry: Arc<TxnRegistry>,
    pub clock: Arc<dyn Clock>,
    pub shutdown: ShutdownFlag,
    /// Longest a single lock request spins, in clock cycles.
    pub wait_timeout: u64,
}

impl fmt::Debug for OneSidedMedium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneSidedMedium")
            .field("wait_timeout", &self.wait_timeout)
            .field("registered", &self.registry.len())
            .finish_non_exhaustive()
    }
}

#[inline]
fn ts_word(addr: RemoteAddr) -> RemoteAddr {
    addr.add(TS_WORD_OFFSET)
}

// ---------------------------------------------------------------------------
// NO-WAIT
// ---------------------------------------------------------------------------

/// Shared requests retry their CAS; exclusive requests try once.
#[derive(Debug)]
pub struct NoWait {
    medium: OneSidedMedium,
}

impl NoWait {
    #[must_use]
    pub const fn new(medium: OneSidedMedium) -> Self {
        Self { medium }
    }
}

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
        let addr = target.word()?;
        let words = &*self.medium.words;
        let mut spin = SpinWait::new();
        loop {
            let current = LockWord::from_raw(words.read(addr)?);
            if current.conflicts(mode) {
                return Err(abort(txn, AbortReason::LockConflict));
            }
            match mode {
                LockMode::None => return Ok(LockGrant::Acquired),
                LockMode::Shared => {
                    let desired = current.with_reader_added();
                    if words.cas(addr, current.to_raw(), desired.to_raw())? == current.to_raw() {
                        metrics::record_lock_acquired();
                        return Ok(LockGrant::Acquired);
                    }
                }
                LockMode::Exclusive => {
                    return if words.cas(addr, 0, LockWord::EXCLUSIVE.to_raw())? == 0 {
                        metrics::record_lock_acquired();
                        Ok(LockGrant::Acquired)
                    } else {
                        Err(abort(txn, AbortReason::LockConflict))
                    };
                }
            }
            spin.pause();
        }
    }

    fn lock_release(
        &self,
        target: LockTarget<'_>,
        _txn: &Arc<TxnHandle>,
        mode: LockMode,
    ) -> Result<()> {
        let addr = target.word()?;
        let words = &*self.medium.words;
        match mode {
            LockMode::None => Ok(()),
            LockMode::Shared => {
                let mut spin = SpinWait::new();
                loop {
                    let current = LockWord::from_raw(words.read(addr)?);
                    let desired = current.with_reader_removed();
                    if words.cas(addr, current.to_raw(), desired.to_raw())? == current.to_raw() {
                        return Ok(());
                    }
                    spin.pause();
                }
            }
            LockMode::Exclusive => words.write(addr, 0),
        }
    }
}

// ---------------------------------------------------------------------------
// Timestamp-ordered word locks (WAIT-DIE, WOUND-WAIT)
// ---------------------------------------------------------------------------

/// What a requester does about a conflicting holder stamped `holder_ts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnConflict {
    Spin,
    Die,
}

#[derive(Debug)]
struct OrderedWordLock {
    medium: OneSidedMedium,
}

impl OrderedWordLock {
    /// Acquire, deferring conflicts to `policy`.
    fn acquire(
        &self,
        addr: RemoteAddr,
        txn: &Arc<TxnHandle>,
        mode: LockMode,
        mut policy: impl FnMut(&TxnHandle, u64) -> OnConflict,
    ) -> Result<LockGrant> {
        if mode == LockMode::None {
            return Ok(LockGrant::Acquired);
        }
        if txn.state() != TxnState::Running {
            return Err(abort(txn, lost_state_reason(txn)));
        }
        let words = &*self.medium.words;
        let my_ts = txn.ts().get();
        let deadline = self.medium.clock.now().saturating_add(self.medium.wait_timeout);
        let mut spin = SpinWait::new();
        let mut waiting = false;

        loop {
            let current = LockWord::from_raw(words.read(addr)?);
            if current.conflicts(mode) {
                let holder_ts = words.read(ts_word(addr))?;
                if policy(txn, holder_ts) == OnConflict::Die {
                    resume(txn, waiting);
                    return Err(abort(txn, AbortReason::Died));
                }
                if !waiting {
                    if !txn.update_state(TxnState::Running, TxnState::Waiting) {
                        return Err(abort(txn, lost_state_reason(txn)));
                    }
                    waiting = true;
                    metrics::record_lock_wait();
                    trace!(target: "dmtxn.lock", txn = %txn.id(), ts = my_ts, holder_ts, "word_lock_spin");
                }
                if txn.state() == TxnState::Aborting {
                    return Err(abort(txn, AbortReason::Wounded));
                }
                if self.medium.clock.now() >= deadline || self.medium.shutdown.is_requested() {
                    resume(txn, waiting);
                    return Err(abort(txn, AbortReason::LockWaitTimeout));
                }
                spin.pause();
                continue;
            }

            let acquired = match mode {
                LockMode::Shared => {
                    let desired = current.with_reader_added();
                    if words.cas(addr, current.to_raw(), desired.to_raw())? == current.to_raw() {
                        lower_ts(words, ts_word(addr), my_ts)?;
                        true
                    } else {
                        false
                    }
                }
                _ => {
                    if words.cas(addr, 0, LockWord::EXCLUSIVE.to_raw())? == 0 {
                        words.write(ts_word(addr), my_ts)?;
                        true
                    } else {
                        false
                    }
                }
            };
            if acquired {
                if waiting && !txn.update_state(TxnState::Waiting, TxnState::Running) {
                    // Wounded between the last check and the CAS.
                    self.release(addr, txn, mode)?;
                    return Err(abort(txn, AbortReason::Wounded));
                }
                metrics::record_lock_acquired();
                return Ok(LockGrant::Acquired);
            }
            spin.pause();
        }
    }

    fn release(&self, addr: RemoteAddr, txn: &TxnHandle, mode: LockMode) -> Result<()> {
        let words = &*self.medium.words;
        let my_ts = txn.ts().get();
        match mode {
            LockMode::None => Ok(()),
            LockMode::Shared => {
                words.cas(ts_word(addr), my_ts, 0)?;
                words.faa(addr, u64::MAX)?;
                Ok(())
            }
            LockMode::Exclusive => {
                words.write(ts_word(addr), 0)?;
                words.write(addr, 0)
            }
        }
    }
}

/// Leave WAITING after giving up a spin. A failed CAS means the
/// transaction was wounded; it stays ABORTING.
fn resume(txn: &TxnHandle, waiting: bool) {
    if waiting {
        txn.update_state(TxnState::Waiting, TxnState::Running);
    }
}

/// Stamp the priority word with `ts` unless an older stamp is present.
fn lower_ts(words: &dyn LockWordAccess, addr: RemoteAddr, ts: u64) -> Result<()> {
    let mut spin = SpinWait::new();
    loop {
        let stored = words.read(addr)?;
        if stored != 0 && stored <= ts {
            return Ok(());
        }
        if words.cas(addr, stored, ts)? == stored {
            return Ok(());
        }
        spin.pause();
    }
}

/// An older requester spins, a younger one dies.
#[derive(Debug)]
pub struct WaitDie {
    inner: OrderedWordLock,
}

impl WaitDie {
    #[must_use]
    pub const fn new(medium: OneSidedMedium) -> Self {
        Self {
            inner: OrderedWordLock { medium },
        }
    }
}

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
        let addr = target.word()?;
        self.inner.acquire(addr, txn, mode, |me, holder_ts| {
            if me.ts().get() < holder_ts {
                OnConflict::Spin
            } else {
                OnConflict::Die
            }
        })
    }

    fn lock_release(&self, target: LockTarget<'_>, txn: &Arc<TxnHandle>, mode: LockMode) -> Result<()> {
        self.inner.release(target.word()?, txn, mode)
    }
}

/// An older requester wounds the stamped holder, then spins; a younger one
/// spins until the holder releases.
#[derive(Debug)]
pub struct WoundWait {
    inner: OrderedWordLock,
}

impl WoundWait {
    #[must_use]
    pub const fn new(medium: OneSidedMedium) -> Self {
        Self {
            inner: OrderedWordLock { medium },
        }
    }
}

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
        let addr = target.word()?;
        let registry = &self.inner.medium.registry;
        let mut last_wounded = 0u64;
        self.inner.acquire(addr, txn, mode, |me, holder_ts| {
            let mine = me.ts().get();
            if holder_ts != 0 && mine < holder_ts && holder_ts != last_wounded {
                if let Some(holder) = registry.get(Timestamp::new(holder_ts)) {
                    if holder.wound() {
                        metrics::record_wound();
                        debug!(
                            target: "dmtxn.lock",
                            txn = %me.id(),
                            victim = %holder.id(),
                            "wound_holder"
                        );
                    }
                }
                last_wounded = holder_ts;
            }
            OnConflict::Spin
        })
    }

    fn lock_release(&self, target: LockTarget<'_>, txn: &Arc<TxnHandle>, mode: LockMode) -> Result<()> {
        self.inner.release(target.word()?, txn, mode)
    }
}
