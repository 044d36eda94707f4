//! Per-thread batching facade.
//!
//! A [`BatchManager`] binds one worker thread to its slot in its
//! [`BatchGroup`] and to its own [`BatchDecisionEngine`]. One exchange with
//! the storage nodes goes through these states, per node:
//!
//! ```text
//!   IDLE ─submit─► SUBMITTED ─┬─► CLAIMED ─┬─► FULFILLED            (batch reply served it)
//!                             │            └─► RECLAIM_SIGNALED     (member receives itself)
//!                             └─► TIMED_OUT ─► RECLAIMED            (member sends itself)
//! ```
//!
//! The member side is `submit_request`, `examine_status` and
//! `wait_for_completion`; the leader side is `is_leader`,
//! `collect_batch_requests`, `update_status` and `resign_leader`. Every
//! spin exits on its predicate, its deadline or shutdown.

use std::sync::Arc;

use dmtxn_error::{DmtxnError, Result};
use dmtxn_types::{Clock, NodeId, ShutdownFlag, SpinOutcome, SpinWait, ThreadId, spin_until};

use crate::config::BatchingConfig;
use crate::decision::{BatchDecisionEngine, Decision, DecisionCounters};
use crate::group::BatchGroup;
use crate::metrics;
use crate::slot::{AtomicSlot, SlotState};
use crate::table::BatchTable;

/// A request the leader took out of a member's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimedRequest {
    pub member: ThreadId,
    pub size: u32,
}

#[derive(Debug)]
pub struct BatchManager {
    thread: ThreadId,
    slot_index: usize,
    table: Arc<BatchTable>,
    engine: BatchDecisionEngine,
    counters: DecisionCounters,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownFlag,
    enabled: bool,
    leader_threshold: u64,
    leader_wait_time: u64,
    leader_active: bool,
    leader_expiration: u64,
    submitted_at: Vec<u64>,
}

impl BatchManager {
    pub fn new(
        thread: ThreadId,
        table: Arc<BatchTable>,
        cfg: &BatchingConfig,
        clock: Arc<dyn Clock>,
        shutdown: ShutdownFlag,
        seed: u64,
    ) -> Self {
        let num_nodes = table.group_of(thread).entry(0).num_nodes();
        Self {
            thread,
            slot_index: thread.slot(table.group_size()),
            engine: BatchDecisionEngine::new(cfg.decision_config(), seed),
            counters: DecisionCounters::default(),
            table,
            clock,
            shutdown,
            enabled: cfg.enabled,
            leader_threshold: cfg.leader_threshold,
            leader_wait_time: cfg.leader_wait_time,
            leader_active: false,
            leader_expiration: 0,
            submitted_at: vec![0; num_nodes],
        }
    }

    #[inline]
    pub const fn thread(&self) -> ThreadId {
        self.thread
    }

    #[inline]
    pub fn group(&self) -> &BatchGroup {
        self.table.group_of(self.thread)
    }

    #[inline]
    fn own_slot(&self, node: NodeId) -> &AtomicSlot {
        self.group().entry(self.slot_index).slot(node)
    }

    /// Current state of this thread's slot for `node`.
    pub fn slot_state(&self, node: NodeId) -> SlotState {
        self.own_slot(node).load()
    }

    pub const fn counters(&self) -> DecisionCounters {
        self.counters
    }

    pub const fn engine(&self) -> &BatchDecisionEngine {
        &self.engine
    }

    pub fn join(&self) {
        self.group().join();
    }

    pub fn leave(&self) {
        self.group().leave();
    }

    // --- Decision ---------------------------------------------------------

    /// Batch or send for the next outbound exchange.
    ///
    /// The engine is only consulted once enough of the group and enough
    /// groups are active for a batch to fill; otherwise the answer is
    /// always to send immediately.
    pub fn get_decision(&mut self) -> Decision {
        if !self.enabled {
            return Decision::SendImmediately;
        }
        let group_size = self.table.group_size();
        let active = self.group().active_members();
        let groups_ready = self.table.num_groups() > self.table.max_groups() * 2 / 3;
        if active > group_size * 2 / 3 && groups_ready {
            let now = self.clock.now();
            self.engine.should_wait_for_batch(&mut self.counters, now)
        } else {
            Decision::SendImmediately
        }
    }

    /// Leader collection window per node.
    #[inline]
    pub const fn get_wait_time(&self) -> u64 {
        self.leader_wait_time
    }

    // --- Member side ------------------------------------------------------

    /// Park a request of `size` bytes for `node` and return how long the
    /// member should wait for a leader before reclaiming it.
    pub fn submit_request(&mut self, node: NodeId, size: u32) -> Result<u64> {
        let thread = self.thread;
        self.own_slot(node).submit(size).map_err(|err| {
            DmtxnError::protocol(format!("{err} (thread {thread}, node {node})"))
        })?;
        let wait = self.engine.calculate_wait_time(self.counters);
        self.submitted_at[node.index()] = self.clock.now();
        tracing::trace!(
            target: "dmtxn.batch",
            thread = thread.get(),
            node = node.get(),
            size,
            wait,
            "request_submitted"
        );
        Ok(wait)
    }

    /// Wait until the leader either claims the request or the deadline
    /// (`submission + wait_time`) passes.
    ///
    /// Returns `true` if the member took the request back and must send it
    /// itself, `false` if the leader owns it.
    pub fn examine_status(&self, node: NodeId, wait_time: u64) -> bool {
        let deadline = self.submitted_at[node.index()].saturating_add(wait_time);
        let slot = self.own_slot(node);
        let outcome = spin_until(&*self.clock, Some(deadline), &self.shutdown, || {
            !matches!(slot.load(), SlotState::Pending(_))
        });
        if outcome == SpinOutcome::Satisfied {
            return false;
        }
        let reclaimed = slot.reclaim();
        if reclaimed {
            metrics::record_reclaim();
            tracing::debug!(
                target: "dmtxn.batch",
                thread = self.thread.get(),
                node = node.get(),
                "request_reclaimed"
            );
        }
        reclaimed
    }

    /// Wait for the leader to finish with a claimed request.
    ///
    /// Returns `true` if the batch reply did not carry this member's
    /// response, so the member must receive it individually.
    pub fn wait_for_completion(&self, node: NodeId) -> Result<bool> {
        let slot = self.own_slot(node);
        let outcome = spin_until(&*self.clock, None, &self.shutdown, || {
            slot.load() != SlotState::Claimed
        });
        if outcome == SpinOutcome::Shutdown {
            return Err(DmtxnError::Shutdown);
        }
        match slot.load() {
            SlotState::Idle => Ok(false),
            SlotState::NeedsIndividualRetry => {
                slot.acknowledge_retry();
                metrics::record_individual_retry();
                Ok(true)
            }
            other => Err(DmtxnError::protocol(format!(
                "completion wait found slot {other} (thread {}, node {node})",
                self.thread
            ))),
        }
    }

    // --- Leader side ------------------------------------------------------

    /// Take (or keep) group leadership. A new term lasts `leader_threshold`
    /// cycles.
    pub fn is_leader(&mut self) -> bool {
        if self.leader_active {
            return true;
        }
        if self.group().is_leader(self.thread) {
            self.leader_active = true;
            self.leader_expiration = self.clock.now().saturating_add(self.leader_threshold);
            metrics::record_leader_term();
            tracing::debug!(
                target: "dmtxn.batch",
                thread = self.thread.get(),
                group = self.group().id().get(),
                "leader_elected"
            );
        }
        self.leader_active
    }

    #[inline]
    pub const fn is_active_leader(&self) -> bool {
        self.leader_active
    }

    /// Step down once the current term has run out.
    pub fn check_leader_expiration_status(&mut self) {
        if self.leader_active && self.clock.now() >= self.leader_expiration {
            self.resign_leader();
        }
    }

    pub fn resign_leader(&mut self) {
        if self.leader_active {
            self.group().resign_leader();
            self.leader_active = false;
            tracing::debug!(
                target: "dmtxn.batch",
                thread = self.thread.get(),
                group = self.group().id().get(),
                "leader_resigned"
            );
        }
    }

    /// Claim pending requests for `node` from every member slot.
    ///
    /// Scans repeatedly until the collection window closes, as many requests
    /// as there are active members have been claimed, or shutdown. A slot
    /// whose member reclaimed it first is skipped. Returns the number of
    /// requests appended to `out`.
    pub fn collect_batch_requests(&self, node: NodeId, out: &mut Vec<ClaimedRequest>) -> usize {
        let group = self.group();
        let start = out.len();
        let deadline = self.clock.now().saturating_add(self.leader_wait_time);
        let mut spin = SpinWait::new();
        loop {
            for entry in group.entries() {
                if let Some(size) = entry.slot(node).try_claim() {
                    out.push(ClaimedRequest {
                        member: entry.member(),
                        size,
                    });
                }
            }
            let collected = out.len() - start;
            if collected >= group.active_members() as usize
                || self.clock.now() >= deadline
                || self.shutdown.is_requested()
            {
                tracing::trace!(
                    target: "dmtxn.batch",
                    thread = self.thread.get(),
                    node = node.get(),
                    batch_size = collected,
                    "batch_collected"
                );
                return collected;
            }
            spin.pause();
        }
    }

    /// Hand a claimed request back to `member`: served, or to be received
    /// individually when `wait_response` is set.
    pub fn update_status(&self, node: NodeId, member: ThreadId, wait_response: bool) -> Result<()> {
        let group = self.group();
        let index = member.slot(self.table.group_size());
        if group.entry(index).member() != member {
            return Err(DmtxnError::protocol(format!(
                "thread {member} is not a member of {}",
                group.id()
            )));
        }
        group
            .entry(index)
            .slot(node)
            .resolve(wait_response)
            .map_err(|err| DmtxnError::protocol(format!("{err} (member {member}, node {node})")))
    }

    // --- Feedback ---------------------------------------------------------

    /// Outcome of a batch this thread led.
    pub fn report_leader(&mut self, latency: u64, success: bool) {
        self.engine.report_batch_outcome(latency, success);
    }

    /// Outcome of an exchange this thread took part in as a member (or sent
    /// individually when `batched` is false).
    pub fn report_member(&mut self, latency: u64, batched: bool, success: bool) {
        match (batched, success) {
            (true, true) => {
                self.counters.batches = self.counters.batches.saturating_add(1);
                self.engine.report_batch_outcome(latency, true);
            }
            (true, false) => {
                self.report_timeout();
                self.engine.report_individual_outcome(latency);
            }
            (false, _) => self.engine.report_individual_outcome(latency),
        }
    }

    /// A parked request was reclaimed unserved.
    pub fn report_timeout(&mut self) {
        self.counters.timeouts = self.counters.timeouts.saturating_add(1);
        self.engine.report_timeout();
    }

    pub fn report_conflict(&mut self) {
        self.counters.conflicts = self.counters.conflicts.saturating_add(1);
        self.engine.report_conflict();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use dmtxn_types::ManualClock;

    use super::*;

    const NODE0: NodeId = match NodeId::new(0) {
        Some(n) => n,
        None => unreachable!(),
    };

    fn table(threads: u32, group_size: u32) -> Arc<BatchTable> {
        Arc::new(BatchTable::new(threads, group_size, 1, 2))
    }

    fn manager(
        thread: u32,
        table: &Arc<BatchTable>,
        clock: Arc<dyn Clock>,
        shutdown: &ShutdownFlag,
    ) -> BatchManager {
        let cfg = BatchingConfig::default().with_group_size(table.group_size());
        BatchManager::new(
            ThreadId::new(thread),
            Arc::clone(table),
            &cfg,
            clock,
            shutdown.clone(),
            u64::from(thread),
        )
    }

    #[test]
    fn leader_collects_exactly_the_submitted_entries() {
        let table = table(4, 4);
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::auto_advancing(0, 100));
        let shutdown = ShutdownFlag::new();
        let mut members: Vec<_> = (1..4)
            .map(|t| manager(t, &table, Arc::clone(&clock), &shutdown))
            .collect();
        let mut leader = manager(0, &table, Arc::clone(&clock), &shutdown);
        for m in &members {
            m.join();
        }
        leader.join();

        for m in &mut members {
            m.submit_request(NODE0, 100).unwrap();
        }
        assert!(leader.is_leader());

        let mut out = Vec::new();
        let n = leader.collect_batch_requests(NODE0, &mut out);
        assert_eq!(n, 3);
        let mut got: Vec<_> = out.iter().map(|c| (c.member.get(), c.size)).collect();
        got.sort_unstable();
        assert_eq!(got, vec![(1, 100), (2, 100), (3, 100)]);

        // Nothing is claimed twice.
        let mut again = Vec::new();
        assert_eq!(leader.collect_batch_requests(NODE0, &mut again), 0);

        for c in &out {
            leader
                .update_status(NODE0, c.member, c.member.get() == 2)
                .unwrap();
        }
        assert!(!members[0].wait_for_completion(NODE0).unwrap());
        assert!(members[1].wait_for_completion(NODE0).unwrap());
        assert!(!members[2].wait_for_completion(NODE0).unwrap());
        for m in &members {
            assert_eq!(m.slot_state(NODE0), SlotState::Idle);
        }
    }

    #[test]
    fn unclaimed_request_is_reclaimed_after_deadline() {
        let table = table(4, 4);
        let clock = Arc::new(ManualClock::new(1_000));
        let shutdown = ShutdownFlag::new();
        let mut m = manager(1, &table, clock.clone(), &shutdown);
        m.submit_request(NODE0, 64).unwrap();
        clock.advance(1_000_000);
        assert!(m.examine_status(NODE0, 10));
        assert_eq!(m.slot_state(NODE0), SlotState::Idle);
    }

    #[test]
    fn claimed_request_is_not_reclaimed() {
        let table = table(4, 4);
        let clock = Arc::new(ManualClock::new(0));
        let shutdown = ShutdownFlag::new();
        let mut m = manager(1, &table, clock.clone(), &shutdown);
        m.submit_request(NODE0, 64).unwrap();
        assert_eq!(
            table.group(dmtxn_types::GroupId::new(0)).entry(1).slot(NODE0).try_claim(),
            Some(64)
        );
        clock.advance(1_000_000);
        assert!(!m.examine_status(NODE0, 10));
        assert_eq!(m.slot_state(NODE0), SlotState::Claimed);
    }

    #[test]
    fn double_submit_is_a_protocol_violation() {
        let table = table(4, 4);
        let shutdown = ShutdownFlag::new();
        let mut m = manager(0, &table, Arc::new(ManualClock::new(0)), &shutdown);
        m.submit_request(NODE0, 10).unwrap();
        let err = m.submit_request(NODE0, 10).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn update_status_requires_claimed_slot() {
        let table = table(4, 4);
        let shutdown = ShutdownFlag::new();
        let m = manager(0, &table, Arc::new(ManualClock::new(0)), &shutdown);
        assert!(m.update_status(NODE0, ThreadId::new(1), false).is_err());
        assert!(m.update_status(NODE0, ThreadId::new(9), false).is_err());
    }

    #[test]
    fn decision_engages_only_with_enough_members() {
        let table = table(4, 4);
        let shutdown = ShutdownFlag::new();
        let mut m = manager(0, &table, Arc::new(ManualClock::new(0)), &shutdown);
        m.join();
        for _ in 0..50 {
            assert_eq!(m.get_decision(), Decision::SendImmediately);
        }
        assert!((m.engine().state().exploration_rate - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn leader_term_expires() {
        let table = table(4, 4);
        let clock = Arc::new(ManualClock::new(0));
        let shutdown = ShutdownFlag::new();
        let mut a = manager(0, &table, clock.clone(), &shutdown);
        let mut b = manager(1, &table, clock.clone(), &shutdown);
        assert!(a.is_leader());
        assert!(!b.is_leader());
        a.check_leader_expiration_status();
        assert!(a.is_active_leader());
        clock.advance(100_000);
        a.check_leader_expiration_status();
        assert!(!a.is_active_leader());
        assert!(b.is_leader());
    }

    #[test]
    fn member_feedback_moves_counters() {
        let table = table(4, 4);
        let shutdown = ShutdownFlag::new();
        let mut m = manager(0, &table, Arc::new(ManualClock::new(0)), &shutdown);
        m.report_member(100, true, true);
        m.report_member(100, true, false);
        m.report_member(100, false, false);
        m.report_conflict();
        assert_eq!(
            m.counters(),
            DecisionCounters {
                conflicts: 1,
                timeouts: 1,
                batches: 1
            }
        );
        assert!(m.engine().state().timeout_rate > 0.1);
        assert!(m.engine().state().conflict_rate > 0.1);
    }

    #[test]
    fn concurrent_members_and_leader_lose_nothing() {
        const ROUNDS: usize = 200;
        let table = table(4, 4);
        let clock: Arc<dyn Clock> = Arc::new(dmtxn_types::MonotonicClock::new());
        let shutdown = ShutdownFlag::new();
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let mut m = manager(t, &table, Arc::clone(&clock), &shutdown);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    m.join();
                    barrier.wait();
                    let mut self_sent = 0usize;
                    let mut led = 0usize;
                    for _ in 0..ROUNDS {
                        let wait = m.submit_request(NODE0, 16).unwrap();
                        if m.is_leader() {
                            let mut out = Vec::new();
                            m.collect_batch_requests(NODE0, &mut out);
                            led += out.len();
                            for c in &out {
                                m.update_status(NODE0, c.member, false).unwrap();
                            }
                            m.resign_leader();
                            // Own request was either collected above or is still pending.
                            if m.examine_status(NODE0, 0) {
                                self_sent += 1;
                            } else {
                                m.wait_for_completion(NODE0).unwrap();
                            }
                        } else if m.examine_status(NODE0, wait) {
                            self_sent += 1;
                        } else {
                            m.wait_for_completion(NODE0).unwrap();
                        }
                        assert_eq!(m.slot_state(NODE0), SlotState::Idle);
                    }
                    (self_sent, led)
                })
            })
            .collect();

        let (mut self_sent, mut led) = (0, 0);
        for h in handles {
            let (s, l) = h.join().unwrap();
            self_sent += s;
            led += l;
        }
        // Every request was served exactly once: by a leader or by its member.
        assert_eq!(self_sent + led, 4 * ROUNDS);
    }
}
