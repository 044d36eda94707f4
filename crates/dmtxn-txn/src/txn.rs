//! Client-side transaction orchestration.
//!
//! A [`ClientTxn`] drives one attempt of one transaction from its worker
//! thread: register accesses, fetch rows ([`ClientTxn::process_request`]),
//! commit ([`ClientTxn::process_commit`]) or roll back
//! ([`ClientTxn::process_abort_nodes`]). Two-sided requests go through the
//! batching protocol; prepare, commit and abort messages are always sent
//! individually.

use std::sync::Arc;

use dmtxn_batch::{ClaimedRequest, Decision, record_batch_sent};
use dmtxn_cc::{
    AccessRequest, ClientConcurrency, IndexClient, LockClient, LockProtocol, NodeList,
    OneSidedClient,
};
use dmtxn_error::{AbortReason, DmtxnError, Result};
use dmtxn_types::{
    GroupId, NodeId, Outcome, SpinWait, Timestamp, TxnHandle, TxnId, TxnState, WireReader,
    WireWriter,
};
use tracing::{debug, trace};

use crate::config::TransportKind;
use crate::context::{RuntimeContext, WorkerContext};
use crate::message::{Message, MessageKind};

/// Compute node id stamped into transaction ids; one compute process.
const COMPUTE_NODE: u32 = 0;

#[derive(Debug)]
enum TxnCc {
    /// Requests are shipped to storage servers.
    Shipped(Box<dyn ClientConcurrency>),
    OneSided(OneSidedClient),
}

/// One attempt of a transaction.
#[derive(Debug)]
pub struct ClientTxn<'a> {
    ctx: &'a RuntimeContext,
    worker: &'a mut WorkerContext,
    handle: Arc<TxnHandle>,
    cc: TxnCc,
    registered: bool,
}

impl<'a> ClientTxn<'a> {
    /// Start an attempt with priority `ts`; retries reuse the same `ts`.
    pub fn begin(ctx: &'a RuntimeContext, worker: &'a mut WorkerContext, ts: Timestamp) -> Self {
        let cfg = ctx.config();
        let handle = Arc::new(TxnHandle::new(TxnId::new(COMPUTE_NODE, worker.thread), ts));
        let mut registered = false;
        let cc = match cfg.transport {
            TransportKind::OneSided => {
                if cfg.protocol == LockProtocol::WoundWait {
                    ctx.registry().register(&handle);
                    registered = true;
                }
                TxnCc::OneSided(OneSidedClient::new(
                    Arc::clone(&handle),
                    Arc::clone(ctx.memory()),
                    Arc::clone(ctx.one_sided_strategy()),
                ))
            }
            TransportKind::TwoSided if cfg.partitioned => TxnCc::Shipped(Box::new(
                IndexClient::new(Arc::clone(&handle), ctx.entry_cache().cloned()),
            )),
            TransportKind::TwoSided => TxnCc::Shipped(Box::new(LockClient::new(
                Arc::clone(&handle),
                ctx.row_cache().cloned(),
            ))),
        };
        Self {
            ctx,
            worker,
            handle,
            cc,
            registered,
        }
    }

    #[inline]
    pub fn id(&self) -> TxnId {
        self.handle.id()
    }

    #[inline]
    pub fn ts(&self) -> Timestamp {
        self.handle.ts()
    }

    pub fn handle(&self) -> &Arc<TxnHandle> {
        &self.handle
    }

    pub fn register_access(&mut self, req: AccessRequest) -> Result<usize> {
        match &mut self.cc {
            TxnCc::Shipped(cc) => cc.register_access(req, &mut self.worker.rng),
            TxnCc::OneSided(cc) => cc.register_access(req),
        }
    }

    pub fn access_count(&self) -> usize {
        match &self.cc {
            TxnCc::Shipped(cc) => cc.access_count(),
            TxnCc::OneSided(cc) => cc.access_count(),
        }
    }

    /// Tuple fetched for access `idx`.
    pub fn data(&self, idx: usize) -> Option<&[u8]> {
        match &self.cc {
            TxnCc::Shipped(cc) => cc.data(idx),
            TxnCc::OneSided(cc) => cc.data(idx),
        }
    }

    /// Tuple of a write access, installed on commit.
    pub fn data_mut(&mut self, idx: usize) -> Option<&mut Vec<u8>> {
        match &mut self.cc {
            TxnCc::Shipped(cc) => cc.data_mut(idx),
            TxnCc::OneSided(cc) => cc.data_mut(idx),
        }
    }

    /// Index value returned for access `idx` (partitioned mode).
    pub fn value(&self, idx: usize) -> Option<u64> {
        match &self.cc {
            TxnCc::Shipped(cc) => cc.value(idx),
            TxnCc::OneSided(_) => None,
        }
    }

    fn abort_error(&self, reason: AbortReason) -> DmtxnError {
        DmtxnError::aborted(self.id(), reason)
    }

    // --- Execution --------------------------------------------------------

    /// Fetch (and lock) every registered access not fetched yet.
    pub fn process_request(&mut self) -> Result<()> {
        let id = self.id();
        let mut link = Exchange {
            ctx: self.ctx,
            worker: &mut *self.worker,
            txn: id,
        };
        let cc = match &mut self.cc {
            TxnCc::OneSided(cc) => {
                for idx in 0..cc.access_count() {
                    cc.get_remote_row(idx)?;
                }
                return Ok(());
            }
            TxnCc::Shipped(cc) => cc,
        };

        let mut aborted = NodeList::new();
        for node in cc.nodes_involved() {
            let mut out = WireWriter::new();
            if cc.serialize(node, &mut out)? == 0 {
                continue;
            }
            let request = Message::new(
                MessageKind::Request,
                node,
                link.worker.thread,
                id,
                out.into_inner(),
            );
            let reply = link.send_request(node, request)?;
            match reply.kind {
                MessageKind::Ack => {
                    cc.deserialize(node, &mut WireReader::new(&reply.payload), &mut link.worker.rng)?;
                }
                MessageKind::ResponseAbort => {
                    aborted.push(node);
                    break;
                }
                other => {
                    return Err(DmtxnError::protocol(format!(
                        "{id} got {other} from {node} for a request"
                    )));
                }
            }
        }
        cc.clear_nodes_involved();
        if aborted.is_empty() {
            return Ok(());
        }
        cc.remove_commit_nodes(&aborted);
        debug!(target: "dmtxn.txn", txn = %id, node = aborted[0].get(), "request_voted_abort");
        Err(self.abort_error(AbortReason::RemoteVote))
    }

    /// Commit: local for one-sided and partitioned, a single commit message
    /// for one node, two-phase commit otherwise.
    pub fn process_commit(&mut self) -> Result<()> {
        let id = self.id();
        let partitioned = self.ctx.config().partitioned;
        let link = Exchange {
            ctx: self.ctx,
            worker: &mut *self.worker,
            txn: id,
        };
        match &mut self.cc {
            TxnCc::OneSided(cc) => {
                if !self
                    .handle
                    .update_state(TxnState::Running, TxnState::Committing)
                {
                    let reason = if self.handle.state() == TxnState::Aborting {
                        AbortReason::Wounded
                    } else {
                        AbortReason::NotRunning
                    };
                    return Err(DmtxnError::aborted(id, reason));
                }
                cc.cleanup(Outcome::Commit)?;
            }
            TxnCc::Shipped(cc) if partitioned => cc.cleanup(Outcome::Commit),
            TxnCc::Shipped(cc) => {
                let nodes: NodeList = cc.commit_nodes().iter().copied().collect();
                match nodes.as_slice() {
                    [] => {}
                    [node] => link.commit_single(&mut **cc, *node)?,
                    _ => link.commit_two_phase(&mut **cc, &nodes)?,
                }
                cc.cleanup(Outcome::Commit);
            }
        }
        debug!(target: "dmtxn.txn", txn = %id, ts = self.handle.ts().get(), "txn_committed");
        Ok(())
    }

    /// Roll back on every node still holding state for this attempt.
    pub fn process_abort_nodes(&mut self) -> Result<()> {
        let id = self.id();
        self.handle.set_state(TxnState::Aborting);
        let partitioned = self.ctx.config().partitioned;
        let link = Exchange {
            ctx: self.ctx,
            worker: &mut *self.worker,
            txn: id,
        };
        match &mut self.cc {
            TxnCc::OneSided(cc) => cc.cleanup(Outcome::Abort)?,
            TxnCc::Shipped(cc) => {
                if !partitioned {
                    let nodes: NodeList = cc.commit_nodes().iter().copied().collect();
                    for &node in &nodes {
                        link.send(MessageKind::Abort, node, Vec::new())?;
                    }
                    for ack in link.wait_for_responses(&nodes)? {
                        if ack.kind != MessageKind::Ack {
                            return Err(DmtxnError::protocol(format!(
                                "{id} got {} from {} for an abort",
                                ack.kind, ack.node
                            )));
                        }
                    }
                }
                cc.cleanup(Outcome::Abort);
            }
        }
        debug!(target: "dmtxn.txn", txn = %id, ts = self.handle.ts().get(), "txn_rolled_back");
        Ok(())
    }
}

impl Drop for ClientTxn<'_> {
    fn drop(&mut self) {
        if self.registered {
            self.ctx.registry().unregister(self.handle.ts());
        }
    }
}

// ---------------------------------------------------------------------------
// Message exchange
// ---------------------------------------------------------------------------

/// The worker's side of the wire for one transaction.
struct Exchange<'a> {
    ctx: &'a RuntimeContext,
    worker: &'a mut WorkerContext,
    txn: TxnId,
}

impl Exchange<'_> {
    fn elapsed_since(&self, start: u64) -> u64 {
        self.ctx.clock().now().saturating_sub(start)
    }

    fn send(&self, kind: MessageKind, node: NodeId, payload: Vec<u8>) -> Result<()> {
        self.ctx
            .transport()
            .send(Message::new(kind, node, self.worker.thread, self.txn, payload))
    }

    /// Send one request, batched or not as the decision engine says.
    fn send_request(&mut self, node: NodeId, request: Message) -> Result<Message> {
        match self.worker.batch.get_decision() {
            Decision::SendImmediately => {
                let start = self.ctx.clock().now();
                let reply = self.send_individually(request)?;
                let latency = self.elapsed_since(start);
                self.worker.batch.report_member(latency, false, true);
                Ok(reply)
            }
            Decision::WaitForBatch => {
                if self.worker.batch.is_leader() {
                    self.handle_batching_leader(node, request)
                } else {
                    self.handle_batching_member(node, request)
                }
            }
        }
    }

    fn send_individually(&self, msg: Message) -> Result<Message> {
        let node = msg.node;
        self.ctx.transport().send(msg)?;
        self.wait_for_response(node)
    }

    /// Collect the requests parked by group members for `node`, send them
    /// with our own as one batch, and hand every member its reply.
    fn handle_batching_leader(&mut self, node: NodeId, own: Message) -> Result<Message> {
        let start = self.ctx.clock().now();
        let thread = self.worker.thread;
        let mut claimed: Vec<ClaimedRequest> = Vec::new();
        self.worker.batch.collect_batch_requests(node, &mut claimed);

        let mut batch = Vec::with_capacity(claimed.len() + 1);
        batch.push(own);
        for req in &claimed {
            let msg = self
                .ctx
                .mailboxes()
                .take_send(req.member, node)?
                .ok_or_else(|| {
                    DmtxnError::protocol(format!(
                        "claimed slot of thread {} for {node} has no request",
                        req.member
                    ))
                })?;
            batch.push(msg);
        }
        let batch_size = batch.len();
        record_batch_sent(batch_size);
        self.worker.batches_led += 1;

        let group = self.worker.batch.group().id();
        self.ctx
            .transport()
            .send_batch(group, Message::batch(node, thread, self.txn, &batch))?;
        let envelope = self.wait_for_batch(group, node)?;

        let mut own_reply = None;
        for reply in envelope.unbatch()? {
            if reply.qp == thread {
                own_reply = Some(reply);
                continue;
            }
            let member = reply.qp;
            let parked = reply.kind == MessageKind::ResponseWait;
            if !parked {
                self.ctx.mailboxes().put_recv(member, node, reply)?;
            }
            self.worker.batch.update_status(node, member, parked)?;
        }
        let own_reply = own_reply
            .ok_or_else(|| DmtxnError::protocol(format!("batch reply from {node} lost the leader")))?;
        let own_reply = if own_reply.kind == MessageKind::ResponseWait {
            self.wait_for_response(node)?
        } else {
            own_reply
        };

        let group_size = self.ctx.batch_table().group_size() as usize;
        let latency = self.elapsed_since(start);
        self.worker
            .batch
            .report_leader(latency, batch_size > group_size / 2);
        debug!(
            target: "dmtxn.txn",
            thread = thread.get(),
            node = node.get(),
            batch_size,
            latency,
            "batch_led"
        );
        Ok(own_reply)
    }

    /// Park the request for the group leader; take it back and send it
    /// ourselves if no leader claims it in time.
    fn handle_batching_member(&mut self, node: NodeId, request: Message) -> Result<Message> {
        let thread = self.worker.thread;
        let size = request.payload.len() as u32;
        self.ctx.mailboxes().put_send(thread, node, request)?;
        let start = self.ctx.clock().now();
        let wait = self.worker.batch.submit_request(node, size)?;

        if self.worker.batch.examine_status(node, wait) {
            let request = self.ctx.mailboxes().take_send(thread, node)?.ok_or_else(|| {
                DmtxnError::protocol(format!("reclaimed request of thread {thread} vanished"))
            })?;
            let reply = self.send_individually(request)?;
            let latency = self.elapsed_since(start);
            self.worker.batch.report_member(latency, true, false);
            trace!(target: "dmtxn.txn", thread = thread.get(), node = node.get(), "member_sent_alone");
            return Ok(reply);
        }

        let reply = if self.worker.batch.wait_for_completion(node)? {
            self.wait_for_response(node)?
        } else {
            self.ctx.mailboxes().take_recv(thread, node)?.ok_or_else(|| {
                DmtxnError::protocol(format!("served request of thread {thread} has no reply"))
            })?
        };
        let latency = self.elapsed_since(start);
        self.worker.batch.report_member(latency, true, true);
        Ok(reply)
    }

    fn commit_single(&self, cc: &mut dyn ClientConcurrency, node: NodeId) -> Result<()> {
        let mut out = WireWriter::new();
        cc.serialize_commit(node, &mut out);
        self.send(MessageKind::Commit, node, out.into_inner())?;
        let reply = self.wait_for_response(node)?;
        match reply.kind {
            MessageKind::ResponseCommit => Ok(()),
            MessageKind::ResponseAbort => {
                cc.remove_commit_nodes(&[node]);
                debug!(target: "dmtxn.txn", txn = %self.txn, node = node.get(), "commit_voted_abort");
                Err(DmtxnError::aborted(self.txn, AbortReason::RemoteVote))
            }
            other => Err(DmtxnError::protocol(format!(
                "{} got {other} from {node} for a commit",
                self.txn
            ))),
        }
    }

    fn commit_two_phase(&self, cc: &mut dyn ClientConcurrency, nodes: &[NodeId]) -> Result<()> {
        for &node in nodes {
            let mut out = WireWriter::new();
            cc.serialize_commit(node, &mut out);
            self.send(MessageKind::Prepare, node, out.into_inner())?;
        }
        let mut aborted = NodeList::new();
        for vote in self.wait_for_responses(nodes)? {
            match vote.kind {
                MessageKind::ResponsePrepare => {}
                MessageKind::ResponseAbort => aborted.push(vote.node),
                other => {
                    return Err(DmtxnError::protocol(format!(
                        "{} got {other} from {} for a prepare",
                        self.txn, vote.node
                    )));
                }
            }
        }
        debug!(
            target: "dmtxn.txn",
            txn = %self.txn,
            participants = nodes.len(),
            no_votes = aborted.len(),
            "prepare_collected"
        );
        if !aborted.is_empty() {
            cc.remove_commit_nodes(&aborted);
            return Err(DmtxnError::aborted(self.txn, AbortReason::RemoteVote));
        }

        for &node in nodes {
            self.send(MessageKind::Commit, node, Vec::new())?;
        }
        for ack in self.wait_for_responses(nodes)? {
            if ack.kind != MessageKind::ResponseCommit {
                return Err(DmtxnError::protocol(format!(
                    "{} prepared on {} but got {} for its commit",
                    self.txn, ack.node, ack.kind
                )));
            }
        }
        Ok(())
    }

    // --- Completion polling -----------------------------------------------

    fn wait_for_response(&self, node: NodeId) -> Result<Message> {
        self.wait_for_responses(&[node])?
            .pop()
            .ok_or_else(|| DmtxnError::protocol("response wait returned nothing"))
    }

    /// Poll our queue until every node in `nodes` has answered once.
    fn wait_for_responses(&self, nodes: &[NodeId]) -> Result<Vec<Message>> {
        let thread = self.worker.thread;
        let mut pending: NodeList = nodes.iter().copied().collect();
        let mut replies = Vec::with_capacity(pending.len());
        let mut spin = SpinWait::new();
        while !pending.is_empty() {
            if let Some(reply) = self.ctx.transport().poll(thread)? {
                let Some(pos) = pending.iter().position(|&n| n == reply.node) else {
                    return Err(DmtxnError::protocol(format!(
                        "thread {thread} got an unexpected {} from {}",
                        reply.kind, reply.node
                    )));
                };
                pending.swap_remove(pos);
                replies.push(reply);
                spin.reset();
            } else if self.ctx.shutdown().is_requested() {
                return Err(DmtxnError::Shutdown);
            } else {
                spin.pause();
            }
        }
        Ok(replies)
    }

    fn wait_for_batch(&self, group: GroupId, node: NodeId) -> Result<Message> {
        let mut spin = SpinWait::new();
        loop {
            if let Some(envelope) = self.ctx.transport().poll_batch(group, node)? {
                return Ok(envelope);
            }
            if self.ctx.shutdown().is_requested() {
                return Err(DmtxnError::Shutdown);
            }
            spin.pause();
        }
    }
}
