//! Transaction orchestration for disaggregated-memory transactions.
//!
//! Compute worker threads run transactions against in-process storage
//! nodes. A [`Runtime`] owns one [`RuntimeContext`] and drives one
//! [`Worker`] per thread; each worker executes [`ClientTxn`]s produced by a
//! [`Workload`].
//!
//! - [`config`]: the JSON-loadable [`EngineConfig`].
//! - [`message`] / [`mailbox`] / [`transport`]: the wire between workers
//!   and nodes, including batch envelopes and leader/member hand-off.
//! - [`server`]: the per-node [`StorageServer`] with its wait buffer.
//! - [`txn`]: request exchange, single-node commit, 2PC and abort fan-out.
//! - [`worker`] / [`runtime`]: retry loop with backoff and the run driver.
//! - [`workload`]: the balance-transfer [`KvWorkload`].

pub mod config;
pub mod context;
pub mod mailbox;
pub mod message;
pub mod runtime;
pub mod server;
pub mod transport;
pub mod txn;
pub mod worker;
pub mod workload;

pub use config::{EngineConfig, KvConfig, TransportKind};
pub use context::{RuntimeContext, WorkerContext};
pub use mailbox::Mailboxes;
pub use message::{Message, MessageKind};
pub use runtime::{RunSummary, Runtime};
pub use server::StorageServer;
pub use transport::{LoopbackTransport, Transport};
pub use txn::ClientTxn;
pub use worker::{Worker, WorkerStats};
pub use workload::{KV_INDEX, KV_TABLE, KvWorkload, Query, Workload};
