//! Shared vocabulary for the dmtxn engine.
//!
//! Everything here is plain data or a single-word atomic: identifiers, the
//! tagged [`Value`], access and lock modes, the CAS-guarded transaction
//! state, the injectable clock used by every spin loop, and the little-endian
//! wire codec used for per-node request payloads.

pub mod access;
pub mod clock;
pub mod codec;
pub mod ids;
pub mod txn;
pub mod value;

pub use access::{AccessType, LockMode, Outcome};
pub use clock::{
    Clock, ManualClock, MonotonicClock, SPIN_BEFORE_YIELD, ShutdownFlag, SpinOutcome, SpinWait,
    pause_cycles, spin_until,
};
pub use codec::{CodecError, WireReader, WireWriter};
pub use ids::{GroupId, IndexId, InvalidNodeId, Key, NodeId, TableId, ThreadId, Timestamp, TxnId};
pub use txn::{AtomicTxnState, TxnHandle, TxnState};
pub use value::{Offset, RemoteAddr, RowHandle, Value};
