//! Messages exchanged between worker threads and storage nodes.
//!
//! Payloads are opaque to this layer: the concurrency managers frame them.
//! A batch travels as one [`MessageKind::BatchedRequest`] envelope per
//! node whose payload packs the member messages:
//!
//! ```text
//! count:u32  { kind:u8 qp:u32 txn:u64 payload:bytes }*
//! ```
//!
//! The batch reply uses the same framing, one entry per member request.

use std::fmt;

use dmtxn_error::Result;
use dmtxn_types::{CodecError, NodeId, ThreadId, TxnId, WireReader, WireWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    BatchedRequest,
    Prepare,
    Commit,
    Abort,
    Ack,
    ResponsePrepare,
    ResponseCommit,
    ResponseAbort,
    /// Placeholder in a batch reply: the request is parked and its answer
    /// arrives on the member's own queue.
    ResponseWait,
}

impl MessageKind {
    pub const fn to_wire(self) -> u8 {
        self as u8
    }

    pub const fn from_wire(tag: u8) -> std::result::Result<Self, CodecError> {
        Ok(match tag {
            0 => Self::Request,
            1 => Self::BatchedRequest,
            2 => Self::Prepare,
            3 => Self::Commit,
            4 => Self::Abort,
            5 => Self::Ack,
            6 => Self::ResponsePrepare,
            7 => Self::ResponseCommit,
            8 => Self::ResponseAbort,
            9 => Self::ResponseWait,
            other => {
                return Err(CodecError::InvalidTag {
                    what: "message kind",
                    tag: other,
                });
            }
        })
    }

    #[inline]
    pub const fn is_abort(self) -> bool {
        matches!(self, Self::ResponseAbort)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One message on the wire.
///
/// `node` is the storage node the message is addressed to (requests) or
/// comes from (responses). `qp` is the worker queue replies go to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub node: NodeId,
    pub qp: ThreadId,
    pub txn: TxnId,
    pub payload: Vec<u8>,
}

impl Message {
    pub const fn new(
        kind: MessageKind,
        node: NodeId,
        qp: ThreadId,
        txn: TxnId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            node,
            qp,
            txn,
            payload,
        }
    }

    /// Reply to `self` from its node, with the same queue and transaction.
    #[must_use]
    pub const fn reply(&self, kind: MessageKind, payload: Vec<u8>) -> Self {
        Self::new(kind, self.node, self.qp, self.txn, payload)
    }

    /// Pack `messages` (all addressed to `node`) into one envelope sent by `qp`.
    pub fn batch(node: NodeId, qp: ThreadId, txn: TxnId, messages: &[Self]) -> Self {
        let mut out = WireWriter::with_capacity(
            4 + messages
                .iter()
                .map(|m| 17 + 4 + m.payload.len())
                .sum::<usize>(),
        );
        out.put_u32(messages.len() as u32);
        for msg in messages {
            out.put_u8(msg.kind.to_wire());
            out.put_u32(msg.qp.get());
            out.put_u64(msg.txn.to_u64());
            out.put_bytes(&msg.payload);
        }
        Self::new(MessageKind::BatchedRequest, node, qp, txn, out.into_inner())
    }

    /// Unpack a batch envelope; every entry inherits the envelope's node.
    pub fn unbatch(&self) -> Result<Vec<Self>> {
        let mut input = WireReader::new(&self.payload);
        let count = input.get_u32()? as usize;
        let mut messages = Vec::with_capacity(count);
        for _ in 0..count {
            let kind = MessageKind::from_wire(input.get_u8()?)?;
            let qp = ThreadId::new(input.get_u32()?);
            let txn = TxnId::from_u64(input.get_u64()?);
            let payload = input.get_bytes()?.to_vec();
            messages.push(Self::new(kind, self.node, qp, txn, payload));
        }
        input.finish()?;
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(raw: u32) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    fn msg(kind: MessageKind, thread: u32, payload: &[u8]) -> Message {
        let qp = ThreadId::new(thread);
        Message::new(kind, node(1), qp, TxnId::new(0, qp), payload.to_vec())
    }

    #[test]
    fn kind_tags_are_dense() {
        for tag in 0..10u8 {
            assert_eq!(MessageKind::from_wire(tag).unwrap().to_wire(), tag);
        }
        assert!(MessageKind::from_wire(10).is_err());
    }

    #[test]
    fn batch_envelope_carries_every_member() {
        let members = vec![
            msg(MessageKind::Request, 1, &[1, 2, 3]),
            msg(MessageKind::Request, 2, &[]),
            msg(MessageKind::ResponseWait, 3, &[9]),
        ];
        let envelope = Message::batch(node(1), ThreadId::new(0), TxnId::new(0, ThreadId::new(0)), &members);
        assert_eq!(envelope.kind, MessageKind::BatchedRequest);
        assert_eq!(envelope.unbatch().unwrap(), members);
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let members = vec![msg(MessageKind::Request, 1, &[7; 16])];
        let mut envelope =
            Message::batch(node(1), ThreadId::new(0), TxnId::new(0, ThreadId::new(0)), &members);
        envelope.payload.truncate(envelope.payload.len() - 1);
        assert!(envelope.unbatch().is_err());
    }

    #[test]
    fn reply_keeps_routing() {
        let req = msg(MessageKind::Prepare, 5, &[1]);
        let reply = req.reply(MessageKind::ResponsePrepare, Vec::new());
        assert_eq!((reply.node, reply.qp, reply.txn), (req.node, req.qp, req.txn));
    }
}
