//! Batch groups: leader election, membership and member slots.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use crossbeam_utils::CachePadded;
use dmtxn_types::{GroupId, NodeId, ThreadId};

use crate::slot::AtomicSlot;

const NO_LEADER: i64 = -1;

/// One member's slots: one word per storage node.
#[derive(Debug)]
pub struct BatchEntry {
    member: ThreadId,
    slots: Box<[CachePadded<AtomicSlot>]>,
}

impl BatchEntry {
    fn new(member: ThreadId, num_nodes: u32) -> Self {
        Self {
            member,
            slots: (0..num_nodes).map(|_| CachePadded::default()).collect(),
        }
    }

    #[inline]
    pub const fn member(&self) -> ThreadId {
        self.member
    }

    /// Slot for requests to `node`.
    ///
    /// # Panics
    /// If `node` is outside the cluster the group was built for.
    #[inline]
    pub fn slot(&self, node: NodeId) -> &AtomicSlot {
        &self.slots[node.index()]
    }

    pub fn num_nodes(&self) -> usize {
        self.slots.len()
    }
}

/// A fixed set of `G` member threads sharing one batch channel.
///
/// Thread `group_id * G + i` owns entry `i`. At most one member leads at any
/// time; leadership is taken by a single CAS from "no leader" and never
/// retried, so a thread that loses the race simply acts as a member.
#[derive(Debug)]
pub struct BatchGroup {
    id: GroupId,
    leader: AtomicI64,
    active_members: AtomicU32,
    entries: Box<[BatchEntry]>,
}

impl BatchGroup {
    pub fn new(id: GroupId, group_size: u32, num_nodes: u32) -> Self {
        let base = id.get() * group_size;
        let entries = (0..group_size)
            .map(|i| BatchEntry::new(ThreadId::new(base + i), num_nodes))
            .collect();
        Self {
            id,
            leader: AtomicI64::new(NO_LEADER),
            active_members: AtomicU32::new(0),
            entries,
        }
    }

    #[inline]
    pub const fn id(&self) -> GroupId {
        self.id
    }

    /// Group capacity `G`.
    #[inline]
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Claim leadership iff the group is currently unclaimed. Wait-free:
    /// one load and at most one CAS.
    ///
    /// A thread that already leads gets `false` like everyone else; the
    /// term itself is tracked by [`BatchManager`](crate::BatchManager).
    pub fn is_leader(&self, thread: ThreadId) -> bool {
        self.leader.load(Ordering::Acquire) == NO_LEADER
            && self
                .leader
                .compare_exchange(
                    NO_LEADER,
                    i64::from(thread.get()),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
    }

    /// Step down. Only the current leader calls this.
    pub fn resign_leader(&self) {
        self.leader.store(NO_LEADER, Ordering::Release);
    }

    /// Current leader, if any.
    pub fn leader(&self) -> Option<ThreadId> {
        u32::try_from(self.leader.load(Ordering::Acquire))
            .ok()
            .map(ThreadId::new)
    }

    pub fn join(&self) {
        self.active_members.fetch_add(1, Ordering::AcqRel);
    }

    pub fn leave(&self) {
        let prev = self.active_members.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "leave without join in {}", self.id);
    }

    #[inline]
    pub fn active_members(&self) -> u32 {
        self.active_members.load(Ordering::Acquire)
    }

    /// Entry `i` in `[0, G)`.
    ///
    /// # Panics
    /// If `i >= G`.
    #[inline]
    pub fn entry(&self, i: usize) -> &BatchEntry {
        &self.entries[i]
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;

    #[test]
    fn entries_map_to_member_threads() {
        let group = BatchGroup::new(GroupId::new(2), 4, 3);
        assert_eq!(group.size(), 4);
        assert_eq!(group.entry(0).member(), ThreadId::new(8));
        assert_eq!(group.entry(3).member(), ThreadId::new(11));
        assert_eq!(group.entry(1).num_nodes(), 3);
    }

    #[test]
    fn member_slots_sit_on_separate_lines() {
        let group = BatchGroup::new(GroupId::new(0), 2, 2);
        let entry = group.entry(0);
        let a = std::ptr::from_ref(entry.slot(NodeId::new(0).unwrap())) as usize;
        let b = std::ptr::from_ref(entry.slot(NodeId::new(1).unwrap())) as usize;
        assert!(b - a >= 64);
    }

    #[test]
    fn claim_succeeds_only_while_unclaimed() {
        let group = BatchGroup::new(GroupId::new(0), 4, 1);
        assert!(group.is_leader(ThreadId::new(1)));
        assert!(!group.is_leader(ThreadId::new(1)), "holder cannot claim again");
        assert!(!group.is_leader(ThreadId::new(2)));
        assert_eq!(group.leader(), Some(ThreadId::new(1)));
        group.resign_leader();
        assert_eq!(group.leader(), None);
        assert!(group.is_leader(ThreadId::new(2)));
    }

    #[test]
    fn single_leader_under_contention() {
        const THREADS: u32 = 8;
        for _ in 0..100 {
            let group = Arc::new(BatchGroup::new(GroupId::new(0), THREADS, 1));
            let barrier = Arc::new(Barrier::new(THREADS as usize));
            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let group = Arc::clone(&group);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        group.is_leader(ThreadId::new(t))
                    })
                })
                .collect();
            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
        }
    }

    #[test]
    fn join_leave_balance() {
        let group = Arc::new(BatchGroup::new(GroupId::new(0), 8, 1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let group = Arc::clone(&group);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        group.join();
                        group.leave();
                    }
                    group.join();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(group.active_members(), 8);
    }
}
