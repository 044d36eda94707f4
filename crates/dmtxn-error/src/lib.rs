use std::fmt;
use std::path::PathBuf;

use dmtxn_types::{CodecError, TxnId};
use thiserror::Error;

/// Why a transaction was told to restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// NO-WAIT conflict, or an exclusive CAS on a lock word lost a race.
    LockConflict,
    /// WAIT-DIE: the requester was younger than the holder.
    Died,
    /// WOUND-WAIT: an older transaction forced this one into ABORTING.
    Wounded,
    /// A storage node voted abort (prepare, commit or request phase).
    RemoteVote,
    /// An operation was attempted while the transaction was not RUNNING.
    NotRunning,
    /// A bounded lock spin ran past its deadline.
    LockWaitTimeout,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LockConflict => "lock conflict",
            Self::Died => "died (younger than holder)",
            Self::Wounded => "wounded by older transaction",
            Self::RemoteVote => "remote node voted abort",
            Self::NotRunning => "transaction not running",
            Self::LockWaitTimeout => "lock wait timed out",
        };
        f.write_str(name)
    }
}

/// Primary error type for the dmtxn engine.
///
/// `Aborted` is the only variant the orchestration layer recovers from (by
/// backing off and restarting the transaction). Protocol violations mark a
/// broken caller contract and are never retried.
#[derive(Error, Debug)]
pub enum DmtxnError {
    // === Transaction Outcomes ===
    /// The transaction must restart from scratch.
    #[error("{txn} aborted: {reason}")]
    Aborted { txn: TxnId, reason: AbortReason },

    // === Protocol Violations ===
    /// A batch slot, transaction state or message sequence broke its contract.
    #[error("protocol violation: {detail}")]
    ProtocolViolation { detail: String },

    /// The same (key, table) was registered twice in one transaction.
    #[error("duplicate access to key {key} in table {table}")]
    DuplicateAccess { key: u64, table: u32 },

    // === Wire Errors ===
    /// A payload could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    // === Topology Errors ===
    /// Node id outside the configured cluster.
    #[error("unknown node {node} (cluster has {num_nodes})")]
    UnknownNode { node: u32, num_nodes: u32 },

    /// Table id not present in the schema.
    #[error("unknown table {table}")]
    UnknownTable { table: u32 },

    /// Index id not present in the catalog.
    #[error("unknown index {index}")]
    UnknownIndex { index: u32 },

    /// Row storage on a node has no free slot.
    #[error("row store on node {node} is full ({capacity} rows)")]
    StorageFull { node: u32, capacity: usize },

    // === Configuration Errors ===
    /// A configuration value is out of range.
    #[error("invalid configuration `{field}`: {detail}")]
    InvalidConfig { field: &'static str, detail: String },

    /// The configuration file could not be read.
    #[error("cannot read configuration '{path}': {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration text is not valid JSON for the expected shape.
    #[error("cannot parse configuration: {0}")]
    ConfigParse(String),

    // === Lifecycle ===
    /// The runtime is shutting down.
    #[error("runtime is shutting down")]
    Shutdown,
}

impl DmtxnError {
    /// Whether the transaction should be retried after backoff.
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// The abort reason, if this is an abort.
    pub const fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Self::Aborted { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Whether this marks a broken caller contract rather than a runtime condition.
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation { .. } | Self::DuplicateAccess { .. } | Self::Codec(_)
        )
    }

    /// Whether the same work may succeed when attempted again.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Aborted { .. } | Self::StorageFull { .. })
    }

    /// Create an abort error.
    pub const fn aborted(txn: TxnId, reason: AbortReason) -> Self {
        Self::Aborted { txn, reason }
    }

    /// Create a protocol-violation error.
    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            detail: detail.into(),
        }
    }

    /// Create an invalid-configuration error.
    pub fn invalid_config(field: &'static str, detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            detail: detail.into(),
        }
    }
}

/// Result type alias using `DmtxnError`.
pub type Result<T> = std::result::Result<T, DmtxnError>;

#[cfg(test)]
mod tests {
    use dmtxn_types::ThreadId;

    use super::*;

    fn txn(thread: u32) -> TxnId {
        TxnId::new(1, ThreadId::new(thread))
    }

    #[test]
    fn abort_display() {
        let err = DmtxnError::aborted(txn(2), AbortReason::Wounded);
        assert_eq!(
            err.to_string(),
            "txn(1.t2) aborted: wounded by older transaction"
        );
    }

    #[test]
    fn duplicate_access_display() {
        let err = DmtxnError::DuplicateAccess { key: 42, table: 3 };
        assert_eq!(err.to_string(), "duplicate access to key 42 in table 3");
    }

    #[test]
    fn classification() {
        let abort = DmtxnError::aborted(txn(1), AbortReason::Died);
        assert!(abort.is_abort());
        assert!(abort.is_transient());
        assert!(!abort.is_protocol_violation());
        assert_eq!(abort.abort_reason(), Some(AbortReason::Died));

        let violation = DmtxnError::protocol("slot not idle");
        assert!(!violation.is_abort());
        assert!(violation.is_protocol_violation());
        assert_eq!(violation.abort_reason(), None);

        let codec: DmtxnError = CodecError::TrailingBytes { remaining: 2 }.into();
        assert!(codec.is_protocol_violation());
        assert_eq!(codec.to_string(), "codec error: 2 trailing bytes after payload");
        assert!(!DmtxnError::Shutdown.is_transient());
    }

    #[test]
    fn config_error_display() {
        let err = DmtxnError::invalid_config("batching.group_size", "must be at least 2");
        assert_eq!(
            err.to_string(),
            "invalid configuration `batching.group_size`: must be at least 2"
        );
    }
}
