//! Per (thread, node) hand-off buffers between batch members and leaders.
//!
//! A member parks its serialized request in its send box before publishing
//! the slot; the leader takes it after claiming the slot. The leader writes
//! the member's reply into the receive box before resolving the slot, so a
//! member that sees its slot served always finds the reply there.

use dmtxn_error::{DmtxnError, Result};
use dmtxn_types::{NodeId, ThreadId};
use parking_lot::Mutex;

use crate::message::Message;

#[derive(Debug)]
pub struct Mailboxes {
    num_nodes: u32,
    send: Box<[Mutex<Option<Message>>]>,
    recv: Box<[Mutex<Option<Message>>]>,
}

impl Mailboxes {
    pub fn new(num_threads: u32, num_nodes: u32) -> Self {
        let boxes = || {
            (0..num_threads as usize * num_nodes as usize)
                .map(|_| Mutex::new(None))
                .collect()
        };
        Self {
            num_nodes,
            send: boxes(),
            recv: boxes(),
        }
    }

    fn position(&self, thread: ThreadId, node: NodeId) -> Result<usize> {
        let pos = thread.index() * self.num_nodes as usize + node.index();
        if node.get() >= self.num_nodes || pos >= self.send.len() {
            return Err(DmtxnError::protocol(format!(
                "no mailbox for thread {thread}, {node}"
            )));
        }
        Ok(pos)
    }

    fn put(boxes: &[Mutex<Option<Message>>], pos: usize, msg: Message, which: &str) -> Result<()> {
        let mut slot = boxes[pos].lock();
        if let Some(old) = slot.as_ref() {
            return Err(DmtxnError::protocol(format!(
                "{which} box of thread {} already holds a {} for {}",
                old.qp, old.kind, old.txn
            )));
        }
        *slot = Some(msg);
        Ok(())
    }

    /// Park `msg` for a leader to pick up.
    pub fn put_send(&self, thread: ThreadId, node: NodeId, msg: Message) -> Result<()> {
        let pos = self.position(thread, node)?;
        Self::put(&self.send, pos, msg, "send")
    }

    pub fn take_send(&self, thread: ThreadId, node: NodeId) -> Result<Option<Message>> {
        let pos = self.position(thread, node)?;
        Ok(self.send[pos].lock().take())
    }

    /// Deliver a batch reply to a member.
    pub fn put_recv(&self, thread: ThreadId, node: NodeId, msg: Message) -> Result<()> {
        let pos = self.position(thread, node)?;
        Self::put(&self.recv, pos, msg, "receive")
    }

    pub fn take_recv(&self, thread: ThreadId, node: NodeId) -> Result<Option<Message>> {
        let pos = self.position(thread, node)?;
        Ok(self.recv[pos].lock().take())
    }
}
