//! Message transport between worker threads and storage nodes.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use dmtxn_error::{DmtxnError, Result};
use dmtxn_types::{GroupId, NodeId, ThreadId};
use parking_lot::Mutex;
use tracing::trace;

use crate::message::Message;
use crate::server::StorageServer;

/// Point-to-point delivery plus one batch channel per (group, node).
///
/// Polling never blocks; callers spin on it with their own exit
/// conditions.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Deliver `msg` to `msg.node`; the reply lands on queue `msg.qp`.
    fn send(&self, msg: Message) -> Result<()>;

    /// Deliver a batch envelope; the reply lands on the group's channel.
    fn send_batch(&self, group: GroupId, envelope: Message) -> Result<()>;

    /// Next reply for worker `qp`, if any.
    fn poll(&self, qp: ThreadId) -> Result<Option<Message>>;

    /// Next batch reply from `node` for `group`, if any.
    fn poll_batch(&self, group: GroupId, node: NodeId) -> Result<Option<Message>>;
}

/// In-process transport: storage servers run on the sending thread.
///
/// Parked requests are driven by pollers: a poll that finds its queue
/// empty revisits every server's wait buffer before giving up.
#[derive(Debug)]
pub struct LoopbackTransport {
    servers: Vec<Arc<StorageServer>>,
    queues: Box<[Mutex<VecDeque<Message>>]>,
    batch_queues: Box<[Mutex<VecDeque<Message>>]>,
}

impl LoopbackTransport {
    pub fn new(servers: Vec<Arc<StorageServer>>, num_threads: u32, num_groups: u32) -> Self {
        let queues = (0..num_threads).map(|_| Mutex::new(VecDeque::new())).collect();
        let batch_queues = (0..num_groups as usize * servers.len())
            .map(|_| Mutex::new(VecDeque::new()))
            .collect();
        Self {
            servers,
            queues,
            batch_queues,
        }
    }

    pub fn servers(&self) -> &[Arc<StorageServer>] {
        &self.servers
    }

    fn server(&self, node: NodeId) -> Result<&StorageServer> {
        self.servers
            .get(node.index())
            .map(AsRef::as_ref)
            .ok_or(DmtxnError::UnknownNode {
                node: node.get(),
                num_nodes: self.servers.len() as u32,
            })
    }

    fn queue(&self, qp: ThreadId) -> Result<&Mutex<VecDeque<Message>>> {
        self.queues
            .get(qp.index())
            .ok_or_else(|| DmtxnError::protocol(format!("no reply queue for thread {qp}")))
    }

    fn batch_queue(&self, group: GroupId, node: NodeId) -> Result<&Mutex<VecDeque<Message>>> {
        self.batch_queues
            .get(group.index() * self.servers.len() + node.index())
            .ok_or_else(|| DmtxnError::protocol(format!("no batch channel for {group}, {node}")))
    }

    fn deliver(&self, reply: Message) -> Result<()> {
        self.queue(reply.qp)?.lock().push_back(reply);
        Ok(())
    }

    fn drive_wait_buffers(&self) -> Result<()> {
        for server in &self.servers {
            for reply in server.check_wait_buffer()? {
                self.deliver(reply)?;
            }
        }
        Ok(())
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, msg: Message) -> Result<()> {
        if let Some(reply) = self.server(msg.node)?.handle(msg)? {
            self.deliver(reply)?;
        }
        Ok(())
    }

    fn send_batch(&self, group: GroupId, envelope: Message) -> Result<()> {
        let node = envelope.node;
        let reply = self.server(node)?.handle_batch(&envelope)?;
        trace!(
            target: "dmtxn.server",
            group = group.get(),
            node = node.get(),
            bytes = reply.payload.len(),
            "batch_reply_queued"
        );
        self.batch_queue(group, node)?.lock().push_back(reply);
        Ok(())
    }

    fn poll(&self, qp: ThreadId) -> Result<Option<Message>> {
        let queue = self.queue(qp)?;
        if let Some(msg) = queue.lock().pop_front() {
            return Ok(Some(msg));
        }
        self.drive_wait_buffers()?;
        Ok(queue.lock().pop_front())
    }

    fn poll_batch(&self, group: GroupId, node: NodeId) -> Result<Option<Message>> {
        Ok(self.batch_queue(group, node)?.lock().pop_front())
    }
}
