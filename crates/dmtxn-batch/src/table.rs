//! Partition of all worker threads into batch groups.

use dmtxn_types::{GroupId, ThreadId};

use crate::group::BatchGroup;

/// `ceil(num_threads / G)` groups, immutable after construction.
#[derive(Debug)]
pub struct BatchTable {
    groups: Box<[BatchGroup]>,
    group_size: u32,
    max_groups: u32,
}

impl BatchTable {
    /// `max_groups` is the deployment-wide group count the batching
    /// engagement rule compares against; it is at least the built count.
    pub fn new(num_threads: u32, group_size: u32, max_groups: u32, num_nodes: u32) -> Self {
        let count = num_threads.div_ceil(group_size.max(1));
        let groups = (0..count)
            .map(|g| BatchGroup::new(GroupId::new(g), group_size, num_nodes))
            .collect();
        Self {
            groups,
            group_size,
            max_groups: max_groups.max(count),
        }
    }

    /// # Panics
    /// If `id` is out of range.
    #[inline]
    pub fn group(&self, id: GroupId) -> &BatchGroup {
        &self.groups[id.index()]
    }

    /// The group `thread` belongs to.
    #[inline]
    pub fn group_of(&self, thread: ThreadId) -> &BatchGroup {
        self.group(thread.group(self.group_size))
    }

    #[inline]
    pub fn num_groups(&self) -> u32 {
        self.groups.len() as u32
    }

    #[inline]
    pub const fn group_size(&self) -> u32 {
        self.group_size
    }

    #[inline]
    pub const fn max_groups(&self) -> u32 {
        self.max_groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_count_rounds_up() {
        let table = BatchTable::new(10, 4, 1, 2);
        assert_eq!(table.num_groups(), 3);
        assert_eq!(table.max_groups(), 3);
        assert_eq!(table.group_of(ThreadId::new(9)).id(), GroupId::new(2));
        assert_eq!(table.group_of(ThreadId::new(3)).id(), GroupId::new(0));
    }

    #[test]
    fn max_groups_from_config_is_kept_when_larger() {
        let table = BatchTable::new(8, 8, 4, 1);
        assert_eq!(table.num_groups(), 1);
        assert_eq!(table.max_groups(), 4);
    }
}
