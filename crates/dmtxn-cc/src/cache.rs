//! Compute-side index caches.
//!
//! Two flavors share one frequency-sampled table:
//!
//! - [`RowCache`] (non-partitioned): key -> row handle on the owning node.
//!   The handle travels to the node as a hint; the node checks the row's
//!   live key and reports staleness.
//! - [`EntryCache`] (partitioned): key -> index payload, write-back. Writes
//!   that hit stay local and mark the entry dirty. Every entry remembers its
//!   owning node, and an admission only evicts entries owned by the node it
//!   is sent to, so a dirty victim always rides back to its owner.
//!
//! Admission is probabilistic (`admission_rate`). Eviction samples two
//! random residents and drops the one with the lower access frequency;
//! frequencies are bumped on a sampled fraction of hits.

use std::collections::HashMap;

use dmtxn_error::{DmtxnError, Result};
use dmtxn_types::{IndexId, Key, NodeId, RowHandle};
use parking_lot::Mutex;
use rand::Rng;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::metrics;

/// Cache sizing and sampling knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Resident entries; 0 disables the cache.
    pub capacity: usize,
    /// Probability that a miss is admitted.
    pub admission_rate: f64,
    /// Probability that a hit bumps the entry's frequency.
    pub frequency_sample_rate: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            admission_rate: 0.5,
            frequency_sample_rate: 0.1,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            capacity: 0,
            admission_rate: 0.0,
            frequency_sample_rate: 0.1,
        }
    }

    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    #[must_use]
    pub const fn with_admission_rate(mut self, rate: f64) -> Self {
        self.admission_rate = rate;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.admission_rate) {
            return Err(DmtxnError::invalid_config(
                "cache.admission_rate",
                format!("{} is outside [0, 1]", self.admission_rate),
            ));
        }
        if !(0.0..=1.0).contains(&self.frequency_sample_rate) {
            return Err(DmtxnError::invalid_config(
                "cache.frequency_sample_rate",
                format!("{} is outside [0, 1]", self.frequency_sample_rate),
            ));
        }
        Ok(())
    }

    #[inline]
    pub const fn is_enabled(&self) -> bool {
        self.capacity > 0
    }
}

type CacheKey = (IndexId, Key);

// ---------------------------------------------------------------------------
// FrequencyTable
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Resident<V> {
    key: CacheKey,
    value: V,
    frequency: u32,
}

/// Dense residents plus a position map, so random sampling is O(1).
#[derive(Debug)]
struct FrequencyTable<V> {
    residents: Vec<Resident<V>>,
    positions: HashMap<CacheKey, usize>,
}

impl<V> FrequencyTable<V> {
    fn new() -> Self {
        Self {
            residents: Vec::new(),
            positions: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.residents.len()
    }

    fn get_mut(&mut self, key: &CacheKey) -> Option<&mut Resident<V>> {
        let pos = *self.positions.get(key)?;
        self.residents.get_mut(pos)
    }

    fn upsert(&mut self, key: CacheKey, value: V) -> Option<V> {
        if let Some(resident) = self.get_mut(&key) {
            return Some(std::mem::replace(&mut resident.value, value));
        }
        self.positions.insert(key, self.residents.len());
        self.residents.push(Resident {
            key,
            value,
            frequency: 0,
        });
        None
    }

    fn remove(&mut self, key: &CacheKey) -> Option<V> {
        let pos = self.positions.remove(key)?;
        let removed = self.residents.swap_remove(pos);
        if let Some(moved) = self.residents.get(pos) {
            self.positions.insert(moved.key, pos);
        }
        Some(removed.value)
    }

    /// The colder of two uniformly sampled residents.
    fn sample_victim(&self, rng: &mut impl Rng) -> Option<CacheKey> {
        if self.residents.is_empty() {
            return None;
        }
        let a = &self.residents[rng.gen_range(0..self.residents.len())];
        let b = &self.residents[rng.gen_range(0..self.residents.len())];
        Some(if a.frequency <= b.frequency { a.key } else { b.key })
    }

    /// Like [`sample_victim`](Self::sample_victim), restricted to residents
    /// whose value satisfies `eligible`.
    fn sample_victim_where(
        &self,
        rng: &mut impl Rng,
        eligible: impl Fn(&V) -> bool,
    ) -> Option<CacheKey> {
        self.residents
            .iter()
            .filter(|r| eligible(&r.value))
            .choose_multiple(rng, 2)
            .into_iter()
            .min_by_key(|r| r.frequency)
            .map(|r| r.key)
    }
}

#[inline]
fn roll(rng: &mut impl Rng, probability: f64) -> bool {
    rng.r#gen::<f64>() < probability
}

// ---------------------------------------------------------------------------
// RowCache
// ---------------------------------------------------------------------------

/// What a non-partitioned lookup tells the request builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    /// Resident; send the cached handle as hint.
    Hit(RowHandle),
    /// Miss, admitted: ask the node to return the handle.
    Admit,
    /// Miss, not admitted.
    Bypass,
}

/// Per-access cache hint carried in a request.
///
/// Wire form: 0 none, 1 admit, `handle + 2` cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheHint {
    #[default]
    None,
    Admit,
    Cached(RowHandle),
}

impl CacheHint {
    #[inline]
    pub const fn to_wire(self) -> u64 {
        match self {
            Self::None => 0,
            Self::Admit => 1,
            Self::Cached(handle) => handle.get() + 2,
        }
    }

    #[inline]
    pub const fn from_wire(raw: u64) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Admit,
            cached => Self::Cached(RowHandle::new(cached - 2)),
        }
    }
}

impl From<CacheLookup> for CacheHint {
    fn from(lookup: CacheLookup) -> Self {
        match lookup {
            CacheLookup::Hit(handle) => Self::Cached(handle),
            CacheLookup::Admit => Self::Admit,
            CacheLookup::Bypass => Self::None,
        }
    }
}

/// Shared key -> row handle cache of one compute node.
#[derive(Debug)]
pub struct RowCache {
    cfg: CacheConfig,
    table: Mutex<FrequencyTable<RowHandle>>,
}

impl RowCache {
    #[must_use]
    pub fn new(cfg: CacheConfig) -> Self {
        Self {
            cfg,
            table: Mutex::new(FrequencyTable::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn search(&self, index: IndexId, key: Key, rng: &mut impl Rng) -> CacheLookup {
        if !self.cfg.is_enabled() {
            return CacheLookup::Bypass;
        }
        let bump = roll(rng, self.cfg.frequency_sample_rate);
        {
            let mut table = self.table.lock();
            if let Some(resident) = table.get_mut(&(index, key)) {
                if bump {
                    resident.frequency = resident.frequency.saturating_add(1);
                }
                metrics::record_cache_hit();
                return CacheLookup::Hit(resident.value);
            }
        }
        if roll(rng, self.cfg.admission_rate) {
            CacheLookup::Admit
        } else {
            CacheLookup::Bypass
        }
    }

    /// Insert or refresh an entry, evicting a cold resident when full.
    pub fn add(&self, index: IndexId, key: Key, handle: RowHandle, rng: &mut impl Rng) {
        if !self.cfg.is_enabled() {
            return;
        }
        let mut table = self.table.lock();
        if table.get_mut(&(index, key)).is_none() && table.len() >= self.cfg.capacity {
            if let Some(victim) = table.sample_victim(rng) {
                table.remove(&victim);
                trace!(target: "dmtxn.cc", key = victim.1, "row_cache_evict");
            }
        }
        table.upsert((index, key), handle);
    }

    pub fn invalidate(&self, index: IndexId, key: Key) -> bool {
        let removed = self.table.lock().remove(&(index, key)).is_some();
        if removed {
            metrics::record_cache_invalidation();
        }
        removed
    }
}

// ---------------------------------------------------------------------------
// EntryCache
// ---------------------------------------------------------------------------

/// Outcome of a partitioned cache operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    /// Not cached and not admitted: plain remote operation.
    Rpc,
    /// Served locally; `value` is the resident value after the operation.
    Hit { value: u64 },
    /// Admitted after evicting a dirty entry that must be written back. The
    /// victim is owned by the node the admission is sent to.
    AdmitEvict { index: IndexId, key: Key, value: u64 },
    /// Admitted; a slot is reserved for the response.
    Admit,
}

impl CacheOp {
    #[inline]
    pub const fn wire_tag(self) -> u8 {
        match self {
            Self::Rpc => 0,
            Self::Hit { .. } => 1,
            Self::AdmitEvict { .. } => 2,
            Self::Admit => 3,
        }
    }

    #[inline]
    pub const fn is_hit(self) -> bool {
        matches!(self, Self::Hit { .. })
    }

    #[inline]
    pub const fn is_admission(self) -> bool {
        matches!(self, Self::AdmitEvict { .. } | Self::Admit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CachedEntry {
    node: NodeId,
    value: u64,
    dirty: bool,
}

#[derive(Debug)]
struct EntryTable {
    residents: FrequencyTable<CachedEntry>,
    /// Slots promised to admissions whose response is still in flight.
    reserved: usize,
}

/// Shared write-back cache of index payloads (partitioned deployments).
#[derive(Debug)]
pub struct EntryCache {
    cfg: CacheConfig,
    inner: Mutex<EntryTable>,
}

impl EntryCache {
    #[must_use]
    pub fn new(cfg: CacheConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(EntryTable {
                residents: FrequencyTable::new(),
                reserved: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().residents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn hit(inner: &mut EntryTable, key: CacheKey, write: Option<u64>, bump: bool) -> Option<u64> {
        let resident = inner.residents.get_mut(&key)?;
        if bump {
            resident.frequency = resident.frequency.saturating_add(1);
        }
        if let Some(value) = write {
            resident.value.value = value;
            resident.value.dirty = true;
        }
        metrics::record_cache_hit();
        Some(resident.value.value)
    }

    /// Reserve a slot for an admission sent to `node`, evicting one of
    /// `node`'s entries if the cache is full.
    fn reserve(&self, inner: &mut EntryTable, node: NodeId, rng: &mut impl Rng) -> CacheOp {
        let mut op = CacheOp::Admit;
        if inner.residents.len() + inner.reserved >= self.cfg.capacity {
            if let Some(victim) = inner
                .residents
                .sample_victim_where(rng, |entry| entry.node == node)
            {
                if let Some(entry) = inner.residents.remove(&victim) {
                    trace!(
                        target: "dmtxn.cc",
                        node = node.get(),
                        key = victim.1,
                        dirty = entry.dirty,
                        "entry_cache_evict"
                    );
                    if entry.dirty {
                        op = CacheOp::AdmitEvict {
                            index: victim.0,
                            key: victim.1,
                            value: entry.value,
                        };
                    }
                }
            } else {
                // Full of other nodes' entries or in-flight admissions.
                return CacheOp::Rpc;
            }
        }
        inner.reserved += 1;
        op
    }

    fn access(
        &self,
        node: NodeId,
        index: IndexId,
        key: Key,
        write: Option<u64>,
        always_admit: bool,
        rng: &mut impl Rng,
    ) -> CacheOp {
        if !self.cfg.is_enabled() {
            return CacheOp::Rpc;
        }
        let bump = roll(rng, self.cfg.frequency_sample_rate);
        let admit = always_admit || roll(rng, self.cfg.admission_rate);
        let mut inner = self.inner.lock();
        if let Some(value) = Self::hit(&mut inner, (index, key), write, bump) {
            return CacheOp::Hit { value };
        }
        if !admit {
            return CacheOp::Rpc;
        }
        self.reserve(&mut inner, node, rng)
    }

    /// Look up `key`, owned by `node`.
    pub fn lookup(&self, node: NodeId, index: IndexId, key: Key, rng: &mut impl Rng) -> CacheOp {
        self.access(node, index, key, None, false, rng)
    }

    /// A hit is applied locally and marks the entry dirty.
    pub fn update(
        &self,
        node: NodeId,
        index: IndexId,
        key: Key,
        value: u64,
        rng: &mut impl Rng,
    ) -> CacheOp {
        self.access(node, index, key, Some(value), false, rng)
    }

    /// Like [`update`](Self::update), but a miss is always admitted.
    pub fn insert(
        &self,
        node: NodeId,
        index: IndexId,
        key: Key,
        value: u64,
        rng: &mut impl Rng,
    ) -> CacheOp {
        self.access(node, index, key, Some(value), true, rng)
    }

    /// Drop the entry; removals always go to the owning node.
    pub fn remove(&self, index: IndexId, key: Key) -> CacheOp {
        if self.cfg.is_enabled() {
            self.inner.lock().residents.remove(&(index, key));
        }
        CacheOp::Rpc
    }

    /// Fill a reserved slot with the value returned by `node`.
    pub fn add(&self, node: NodeId, index: IndexId, key: Key, value: u64) {
        let mut inner = self.inner.lock();
        inner.reserved = inner.reserved.saturating_sub(1);
        inner.residents.upsert(
            (index, key),
            CachedEntry {
                node,
                value,
                dirty: false,
            },
        );
    }

    /// Give back a reserved slot whose admission did not complete.
    pub fn cancel_reservation(&self) {
        let mut inner = self.inner.lock();
        inner.reserved = inner.reserved.saturating_sub(1);
    }

    pub fn invalidate(&self, index: IndexId, key: Key) -> Option<u64> {
        let removed = self.inner.lock().residents.remove(&(index, key));
        if removed.is_some() {
            metrics::record_cache_invalidation();
        }
        removed.map(|entry| entry.value)
    }

    /// Mark every dirty entry clean and return them, with their owning
    /// node, for write-back.
    pub fn drain_dirty(&self) -> Vec<(NodeId, IndexId, Key, u64)> {
        let mut inner = self.inner.lock();
        let mut dirty = Vec::new();
        for resident in &mut inner.residents.residents {
            if resident.value.dirty {
                resident.value.dirty = false;
                dirty.push((
                    resident.value.node,
                    resident.key.0,
                    resident.key.1,
                    resident.value.value,
                ));
            }
        }
        dirty
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    const IDX: IndexId = IndexId::new(0);

    fn node(raw: u32) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    fn always() -> CacheConfig {
        CacheConfig::default().with_capacity(2).with_admission_rate(1.0)
    }

    #[test]
    fn hint_wire_encoding() {
        for hint in [
            CacheHint::None,
            CacheHint::Admit,
            CacheHint::Cached(RowHandle::new(0)),
            CacheHint::Cached(RowHandle::new(41)),
        ] {
            assert_eq!(CacheHint::from_wire(hint.to_wire()), hint);
        }
        assert_eq!(CacheHint::Cached(RowHandle::new(0)).to_wire(), 2);
    }

    #[test]
    fn row_cache_admit_then_hit() {
        let mut rng = StdRng::seed_from_u64(1);
        let cache = RowCache::new(always());
        assert_eq!(cache.search(IDX, 5, &mut rng), CacheLookup::Admit);
        cache.add(IDX, 5, RowHandle::new(3), &mut rng);
        assert_eq!(
            cache.search(IDX, 5, &mut rng),
            CacheLookup::Hit(RowHandle::new(3))
        );
        assert!(cache.invalidate(IDX, 5));
        assert!(!cache.invalidate(IDX, 5));
    }

    #[test]
    fn row_cache_respects_capacity() {
        let mut rng = StdRng::seed_from_u64(2);
        let cache = RowCache::new(always());
        for key in 0..10 {
            cache.add(IDX, key, RowHandle::new(key), &mut rng);
            assert!(cache.len() <= 2);
        }
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn disabled_cache_always_bypasses() {
        let mut rng = StdRng::seed_from_u64(3);
        let rows = RowCache::new(CacheConfig::disabled());
        rows.add(IDX, 1, RowHandle::new(1), &mut rng);
        assert_eq!(rows.search(IDX, 1, &mut rng), CacheLookup::Bypass);

        let entries = EntryCache::new(CacheConfig::disabled());
        assert_eq!(entries.lookup(node(0), IDX, 1, &mut rng), CacheOp::Rpc);
        assert_eq!(entries.insert(node(0), IDX, 1, 9, &mut rng), CacheOp::Rpc);
    }

    #[test]
    fn zero_admission_rate_never_admits_reads() {
        let mut rng = StdRng::seed_from_u64(4);
        let cache = EntryCache::new(CacheConfig::default().with_admission_rate(0.0));
        for key in 0..50 {
            assert_eq!(cache.lookup(node(0), IDX, key, &mut rng), CacheOp::Rpc);
        }
        assert_eq!(cache.insert(node(0), IDX, 1, 5, &mut rng), CacheOp::Admit);
    }

    #[test]
    fn entry_cache_write_back_of_dirty_victim() {
        let mut rng = StdRng::seed_from_u64(5);
        let cache = EntryCache::new(always());

        assert_eq!(cache.lookup(node(0), IDX, 1, &mut rng), CacheOp::Admit);
        cache.add(node(0), IDX, 1, 100);
        assert_eq!(cache.lookup(node(0), IDX, 2, &mut rng), CacheOp::Admit);
        cache.add(node(0), IDX, 2, 200);

        // Dirty both residents locally.
        assert_eq!(cache.update(node(0), IDX, 1, 101, &mut rng), CacheOp::Hit { value: 101 });
        assert_eq!(cache.update(node(0), IDX, 2, 201, &mut rng), CacheOp::Hit { value: 201 });

        match cache.lookup(node(0), IDX, 3, &mut rng) {
            CacheOp::AdmitEvict { key, value, .. } => {
                assert!(matches!((key, value), (1, 101) | (2, 201)));
            }
            other => panic!("expected dirty eviction, got {other:?}"),
        }
        cache.add(node(0), IDX, 3, 300);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn clean_victims_are_dropped_silently() {
        let mut rng = StdRng::seed_from_u64(6);
        let cache = EntryCache::new(always());
        for key in 0..2 {
            assert_eq!(cache.lookup(node(0), IDX, key, &mut rng), CacheOp::Admit);
            cache.add(node(0), IDX, key, key);
        }
        assert_eq!(cache.lookup(node(0), IDX, 9, &mut rng), CacheOp::Admit);
        cache.cancel_reservation();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn drain_dirty_cleans_entries() {
        let mut rng = StdRng::seed_from_u64(7);
        let cache = EntryCache::new(always());
        assert_eq!(cache.insert(node(0), IDX, 4, 40, &mut rng), CacheOp::Admit);
        cache.add(node(0), IDX, 4, 40);
        assert_eq!(cache.update(node(0), IDX, 4, 41, &mut rng), CacheOp::Hit { value: 41 });
        assert_eq!(cache.drain_dirty(), vec![(node(0), IDX, 4, 41)]);
        assert!(cache.drain_dirty().is_empty());
        assert_eq!(cache.remove(IDX, 4), CacheOp::Rpc);
        assert!(cache.is_empty());
    }

    #[test]
    fn eviction_only_takes_entries_of_the_target_node() {
        let mut rng = StdRng::seed_from_u64(8);
        let cache = EntryCache::new(CacheConfig::default().with_capacity(1).with_admission_rate(1.0));
        assert_eq!(cache.lookup(node(1), IDX, 5, &mut rng), CacheOp::Admit);
        cache.add(node(1), IDX, 5, 100);
        assert_eq!(
            cache.update(node(1), IDX, 5, 555, &mut rng),
            CacheOp::Hit { value: 555 }
        );

        // Node 0 may not evict node 1's dirty entry.
        for _ in 0..20 {
            assert_eq!(cache.lookup(node(0), IDX, 4, &mut rng), CacheOp::Rpc);
        }
        assert_eq!(cache.drain_dirty(), vec![(node(1), IDX, 5, 555)]);
        assert_eq!(
            cache.update(node(1), IDX, 5, 556, &mut rng),
            CacheOp::Hit { value: 556 }
        );

        // A request to the owner carries it home.
        assert_eq!(
            cache.lookup(node(1), IDX, 7, &mut rng),
            CacheOp::AdmitEvict {
                index: IDX,
                key: 5,
                value: 556
            }
        );
    }
}
