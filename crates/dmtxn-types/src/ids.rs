//! Identifier newtypes.
//!
//! Node ids index storage nodes, thread ids index client worker threads
//! (and double as the queue-pair id a node replies to), and a [`TxnId`] is
//! the pair (originating compute node, worker thread). Timestamps carry the
//! WAIT-DIE / WOUND-WAIT priority: smaller is older is higher priority.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Primary key of a row. Keys are opaque 64-bit integers.
pub type Key = u64;

/// Storage (memory) node identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    /// Largest node id that still fits the 16-bit node field of a remote address.
    pub const MAX_RAW: u32 = (1 << 16) - 1;

    /// Construct a node id if `raw` fits the remote-address encoding.
    #[inline]
    pub const fn new(raw: u32) -> Option<Self> {
        if raw > Self::MAX_RAW {
            None
        } else {
            Some(Self(raw))
        }
    }

    #[inline]
    pub(crate) const fn from_u16(raw: u16) -> Self {
        Self(raw as u32)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Position of this node in per-node arrays.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Iterate over the first `count` node ids.
    pub fn all(count: u32) -> impl Iterator<Item = Self> {
        (0..count.min(Self::MAX_RAW + 1)).map(Self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl TryFrom<u32> for NodeId {
    type Error = InvalidNodeId;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidNodeId { raw: value })
    }
}

/// Error returned when a node id does not fit the address encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidNodeId {
    raw: u32,
}

impl fmt::Display for InvalidNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid NodeId {} (must satisfy id <= {})",
            self.raw,
            NodeId::MAX_RAW
        )
    }
}

impl std::error::Error for InvalidNodeId {}

/// Client worker thread identifier, unique across a compute node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct ThreadId(u32);

impl ThreadId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// The batch group this thread belongs to for a given group size.
    #[inline]
    pub const fn group(self, group_size: u32) -> GroupId {
        GroupId(self.0 / group_size)
    }

    /// This thread's slot inside its batch group.
    #[inline]
    pub const fn slot(self, group_size: u32) -> usize {
        (self.0 % group_size) as usize
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Batch group identifier (also the queue id of the group's batch channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct GroupId(u32);

impl GroupId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Table identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct TableId(u32);

impl TableId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Index identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct IndexId(u32);

impl IndexId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Transaction identity: the compute node it runs on and its worker thread.
///
/// A worker runs one transaction at a time, so the pair is unique among live
/// transactions. Retries of the same transaction keep the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId {
    node: u32,
    thread: ThreadId,
}

impl TxnId {
    #[inline]
    pub const fn new(node: u32, thread: ThreadId) -> Self {
        Self { node, thread }
    }

    /// Compute node the transaction originates from.
    #[inline]
    pub const fn node(self) -> u32 {
        self.node
    }

    /// Worker thread running the transaction; storage nodes reply to this queue.
    #[inline]
    pub const fn thread(self) -> ThreadId {
        self.thread
    }

    /// Packed form used in logs and error values.
    #[inline]
    pub const fn to_u64(self) -> u64 {
        ((self.node as u64) << 32) | self.thread.get() as u64
    }

    #[inline]
    pub const fn from_u64(raw: u64) -> Self {
        Self {
            node: (raw >> 32) as u32,
            thread: ThreadId::new(raw as u32),
        }
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn({}.{})", self.node, self.thread)
    }
}

/// Transaction priority stamp. Zero means "not assigned yet".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const UNSET: Self = Self(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_set(self) -> bool {
        self.0 != 0
    }

    /// Whether `self` has strictly higher priority than `other`.
    #[inline]
    pub const fn is_older_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts#{}", self.0)
    }
}
