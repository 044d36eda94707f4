//! Index-only concurrency control for partitioned deployments.
//!
//! Every access is one atomic index operation on its owning node; there are
//! no row locks. The client fronts the index with a write-back
//! [`EntryCache`](crate::cache::EntryCache): hits are served locally and
//! dirty victims ride along with the next request to their node.
//!
//! Request payload:
//!
//! ```text
//! count:u32  { op:u8 type:u8 key:u64 index:u32 table:u32 value:u64
//!              [evict_index:u32 evict_key:u64 evict_value:u64] }*
//! ```
//!
//! The eviction triple is present when `op` is the admit-with-eviction tag.
//! Response payload: `count:u32 { found:bool value:u64 }*`.

pub mod client;
pub mod server;

pub use client::IndexClient;
pub use server::IndexServer;
