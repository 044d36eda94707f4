//! Tagged index value.
//!
//! An index entry either names a row on the local node ([`RowHandle`]), a
//! word address in some node's memory region ([`RemoteAddr`]), or carries an
//! opaque integer (partitioned deployments store payloads directly in the
//! index). A `Value` never owns row memory: the storage layer does.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, WireReader, WireWriter};
use crate::ids::NodeId;

/// Byte offset inside a node's memory region.
pub type Offset = u64;

/// Non-owning reference to a row slot in a node's row store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RowHandle(u64);

impl RowHandle {
    #[inline]
    pub const fn new(slot: u64) -> Self {
        Self(slot)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn slot(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row#{}", self.0)
    }
}

const OFFSET_BITS: u32 = 48;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// Global address: (node, offset) packed into one word, 16 | 48 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RemoteAddr(u64);

impl RemoteAddr {
    /// Largest representable offset.
    pub const MAX_OFFSET: Offset = OFFSET_MASK;

    /// Construct an address; `None` if `offset` exceeds 48 bits.
    #[inline]
    pub const fn new(node: NodeId, offset: Offset) -> Option<Self> {
        if offset > OFFSET_MASK {
            return None;
        }
        Some(Self(((node.get() as u64) << OFFSET_BITS) | offset))
    }

    #[inline]
    pub const fn node(self) -> NodeId {
        NodeId::from_u16((self.0 >> OFFSET_BITS) as u16)
    }

    #[inline]
    pub const fn offset(self) -> Offset {
        self.0 & OFFSET_MASK
    }

    /// The address `bytes` further into the same node's region.
    #[inline]
    #[must_use]
    pub const fn add(self, bytes: u64) -> Self {
        Self((self.0 & !OFFSET_MASK) | (self.0.wrapping_add(bytes) & OFFSET_MASK))
    }

    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:#x}", self.node(), self.offset())
    }
}

/// Index payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    /// Row on the node that owns the index.
    Row(RowHandle),
    /// Word address reachable through one-sided primitives.
    RemoteAddr(RemoteAddr),
    /// Opaque integer payload.
    Raw(u64),
}

const TAG_ROW: u8 = 1;
const TAG_REMOTE: u8 = 2;
const TAG_RAW: u8 = 3;

impl Value {
    #[inline]
    pub const fn row(self) -> Option<RowHandle> {
        match self {
            Self::Row(handle) => Some(handle),
            _ => None,
        }
    }

    #[inline]
    pub const fn remote_addr(self) -> Option<RemoteAddr> {
        match self {
            Self::RemoteAddr(addr) => Some(addr),
            _ => None,
        }
    }

    /// The payload word regardless of variant.
    #[inline]
    pub const fn raw(self) -> u64 {
        match self {
            Self::Row(handle) => handle.get(),
            Self::RemoteAddr(addr) => addr.to_raw(),
            Self::Raw(raw) => raw,
        }
    }

    pub fn encode(self, out: &mut WireWriter) {
        let tag = match self {
            Self::Row(_) => TAG_ROW,
            Self::RemoteAddr(_) => TAG_REMOTE,
            Self::Raw(_) => TAG_RAW,
        };
        out.put_u8(tag);
        out.put_u64(self.raw());
    }

    pub fn decode(input: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let tag = input.get_u8()?;
        let raw = input.get_u64()?;
        match tag {
            TAG_ROW => Ok(Self::Row(RowHandle::new(raw))),
            TAG_REMOTE => Ok(Self::RemoteAddr(RemoteAddr::from_raw(raw))),
            TAG_RAW => Ok(Self::Raw(raw)),
            other => Err(CodecError::InvalidTag {
                what: "value",
                tag: other,
            }),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Row(handle) => write!(f, "{handle}"),
            Self::RemoteAddr(addr) => write!(f, "@{addr}"),
            Self::Raw(raw) => write!(f, "{raw}"),
        }
    }
}
