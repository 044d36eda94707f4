//! Storage-node request handling.
//!
//! A [`StorageServer`] owns the live transactions of one node. Requests
//! create a transaction on first contact and run its concurrency manager;
//! a request that has to queue behind a lock holder is parked in the wait
//! buffer and answered later by [`StorageServer::check_wait_buffer`].
//!
//! Lock order: a transaction's mutex is taken before the wait buffer, and
//! the transaction table is never held while a transaction mutex is.

use std::collections::HashMap;
use std::sync::Arc;

use dmtxn_cc::{IndexServer, LockGrant, LockServer, NodeStorage, RowLockStrategy, ServerConcurrency};
use dmtxn_error::{DmtxnError, Result};
use dmtxn_types::{Clock, NodeId, Outcome, Timestamp, TxnHandle, TxnId, TxnState, WireReader, WireWriter};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::message::{Message, MessageKind};

#[derive(Debug)]
struct ServerTxn {
    cc: Box<dyn ServerConcurrency>,
    /// Template for the deferred reply of a parked request.
    reply_to: Message,
    parked_at: u64,
}

type SharedTxn = Arc<Mutex<ServerTxn>>;

/// Request handler of one storage node.
#[derive(Debug)]
pub struct StorageServer {
    storage: Arc<NodeStorage>,
    strategy: Arc<dyn RowLockStrategy>,
    partitioned: bool,
    clock: Arc<dyn Clock>,
    wait_timeout: u64,
    txns: Mutex<HashMap<TxnId, SharedTxn>>,
    wait_buffer: Mutex<Vec<TxnId>>,
}

impl StorageServer {
    pub fn new(
        storage: Arc<NodeStorage>,
        strategy: Arc<dyn RowLockStrategy>,
        partitioned: bool,
        clock: Arc<dyn Clock>,
        wait_timeout: u64,
    ) -> Self {
        Self {
            storage,
            strategy,
            partitioned,
            clock,
            wait_timeout,
            txns: Mutex::new(HashMap::new()),
            wait_buffer: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn node(&self) -> NodeId {
        self.storage.node()
    }

    pub fn storage(&self) -> &Arc<NodeStorage> {
        &self.storage
    }

    /// Transactions with state on this node.
    pub fn live_txns(&self) -> usize {
        self.txns.lock().len()
    }

    /// Transactions parked behind a lock holder.
    pub fn parked_txns(&self) -> usize {
        self.wait_buffer.lock().len()
    }

    fn get(&self, id: TxnId) -> Option<SharedTxn> {
        self.txns.lock().get(&id).cloned()
    }

    fn remove(&self, id: TxnId) -> Option<SharedTxn> {
        self.txns.lock().remove(&id)
    }

    fn get_or_create(&self, msg: &Message) -> SharedTxn {
        let mut txns = self.txns.lock();
        let entry = txns.entry(msg.txn).or_insert_with(|| {
            let handle = Arc::new(TxnHandle::new(msg.txn, Timestamp::UNSET));
            let cc: Box<dyn ServerConcurrency> = if self.partitioned {
                Box::new(IndexServer::new(handle, Arc::clone(&self.storage)))
            } else {
                Box::new(LockServer::new(
                    handle,
                    Arc::clone(&self.storage),
                    Arc::clone(&self.strategy),
                ))
            };
            Arc::new(Mutex::new(ServerTxn {
                cc,
                reply_to: msg.reply(MessageKind::Ack, Vec::new()),
                parked_at: 0,
            }))
        });
        Arc::clone(entry)
    }

    /// Handle one message. `None` means the request was parked.
    pub fn handle(&self, msg: Message) -> Result<Option<Message>> {
        trace!(
            target: "dmtxn.server",
            node = self.node().get(),
            txn = %msg.txn,
            kind = %msg.kind,
            bytes = msg.payload.len(),
            "message_received"
        );
        match msg.kind {
            MessageKind::Request => self.handle_request(&msg),
            MessageKind::Prepare => self.handle_prepare(&msg).map(Some),
            MessageKind::Commit => self.handle_commit(&msg).map(Some),
            MessageKind::Abort => self.handle_abort(&msg).map(Some),
            other => Err(DmtxnError::protocol(format!(
                "{} cannot handle {other} from thread {}",
                self.node(),
                msg.qp
            ))),
        }
    }

    /// Handle a batch envelope; parked members get a `ResponseWait` entry.
    pub fn handle_batch(&self, envelope: &Message) -> Result<Message> {
        if envelope.kind != MessageKind::BatchedRequest {
            return Err(DmtxnError::protocol(format!(
                "batch channel of {} received {}",
                self.node(),
                envelope.kind
            )));
        }
        let requests = envelope.unbatch()?;
        let mut replies = Vec::with_capacity(requests.len());
        for req in requests {
            let reply = match self.handle(req.clone())? {
                Some(reply) => reply,
                None => req.reply(MessageKind::ResponseWait, Vec::new()),
            };
            replies.push(reply);
        }
        debug!(
            target: "dmtxn.server",
            node = self.node().get(),
            batch_size = replies.len(),
            "batch_handled"
        );
        Ok(Message::batch(self.node(), envelope.qp, envelope.txn, &replies))
    }

    fn handle_request(&self, msg: &Message) -> Result<Option<Message>> {
        let shared = self.get_or_create(msg);
        let mut txn = shared.lock();
        txn.reply_to = msg.reply(MessageKind::Ack, Vec::new());
        let parsed = txn.cc.parse_request(&mut WireReader::new(&msg.payload));
        if let Err(err) = parsed {
            drop(txn);
            self.remove(msg.txn);
            return Err(err);
        }
        match self.advance(&mut txn)? {
            Progress::Parked => {
                self.wait_buffer.lock().push(msg.txn);
                Ok(None)
            }
            Progress::Replied(reply) => {
                if reply.kind.is_abort() || self.partitioned {
                    drop(txn);
                    self.remove(msg.txn);
                }
                Ok(Some(reply))
            }
        }
    }

    /// Run the parsed accesses; on success the reply carries their data.
    fn advance(&self, txn: &mut ServerTxn) -> Result<Progress> {
        let id = txn.cc.txn().id();
        match txn.cc.process_request() {
            Ok(LockGrant::Acquired) => {
                let mut out = WireWriter::new();
                txn.cc.get_resp_data(&mut out)?;
                if self.partitioned {
                    txn.cc.cleanup(Outcome::Commit)?;
                }
                Ok(Progress::Replied(
                    txn.reply_to.reply(MessageKind::Ack, out.into_inner()),
                ))
            }
            Ok(LockGrant::Waiting) => {
                txn.parked_at = self.clock.now();
                trace!(target: "dmtxn.server", node = self.node().get(), txn = %id, "request_parked");
                Ok(Progress::Parked)
            }
            Err(err) if err.is_abort() => {
                debug!(
                    target: "dmtxn.server",
                    node = self.node().get(),
                    txn = %id,
                    reason = ?err.abort_reason(),
                    "request_aborted"
                );
                Ok(Progress::Replied(
                    txn.reply_to.reply(MessageKind::ResponseAbort, Vec::new()),
                ))
            }
            Err(err) => Err(err),
        }
    }

    fn handle_prepare(&self, msg: &Message) -> Result<Message> {
        let Some(shared) = self.get(msg.txn) else {
            warn!(target: "dmtxn.server", node = self.node().get(), txn = %msg.txn, "prepare_for_unknown_txn");
            return Ok(msg.reply(MessageKind::ResponseAbort, Vec::new()));
        };
        let mut txn = shared.lock();
        match txn.cc.process_prepare(&mut WireReader::new(&msg.payload)) {
            Ok(()) => Ok(msg.reply(MessageKind::ResponsePrepare, Vec::new())),
            Err(err) if err.is_abort() => {
                txn.cc.cleanup(Outcome::Abort)?;
                drop(txn);
                self.remove(msg.txn);
                debug!(target: "dmtxn.server", node = self.node().get(), txn = %msg.txn, "prepare_voted_abort");
                Ok(msg.reply(MessageKind::ResponseAbort, Vec::new()))
            }
            Err(err) => Err(err),
        }
    }

    fn handle_commit(&self, msg: &Message) -> Result<Message> {
        let Some(shared) = self.remove(msg.txn) else {
            warn!(target: "dmtxn.server", node = self.node().get(), txn = %msg.txn, "commit_for_unknown_txn");
            return Ok(msg.reply(MessageKind::ResponseAbort, Vec::new()));
        };
        let mut txn = shared.lock();
        match txn.cc.process_commit(&mut WireReader::new(&msg.payload)) {
            Ok(()) => Ok(msg.reply(MessageKind::ResponseCommit, Vec::new())),
            Err(err) if err.is_abort() => {
                txn.cc.cleanup(Outcome::Abort)?;
                debug!(target: "dmtxn.server", node = self.node().get(), txn = %msg.txn, "commit_voted_abort");
                Ok(msg.reply(MessageKind::ResponseAbort, Vec::new()))
            }
            Err(err) => Err(err),
        }
    }

    fn handle_abort(&self, msg: &Message) -> Result<Message> {
        if let Some(shared) = self.remove(msg.txn) {
            let mut txn = shared.lock();
            txn.cc.txn().set_state(TxnState::Aborting);
            txn.cc.cleanup(Outcome::Abort)?;
        }
        Ok(msg.reply(MessageKind::Ack, Vec::new()))
    }

    /// Revisit parked requests: promoted ones continue and reply, wounded or
    /// timed-out ones abort and reply, the rest stay parked.
    pub fn check_wait_buffer(&self) -> Result<Vec<Message>> {
        let parked = std::mem::take(&mut *self.wait_buffer.lock());
        if parked.is_empty() {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let mut replies = Vec::new();
        let mut still_parked = Vec::new();
        for id in parked {
            let Some(shared) = self.get(id) else { continue };
            let mut txn = shared.lock();
            let handle = Arc::clone(txn.cc.txn());
            if handle.state() == TxnState::Waiting
                && now.saturating_sub(txn.parked_at) >= self.wait_timeout
                && handle.update_state(TxnState::Waiting, TxnState::Aborting)
            {
                debug!(target: "dmtxn.server", node = self.node().get(), txn = %id, "parked_request_timed_out");
            }
            let progress = match handle.state() {
                TxnState::Waiting => {
                    still_parked.push(id);
                    continue;
                }
                TxnState::Aborting => {
                    txn.cc.cleanup(Outcome::Abort)?;
                    Progress::Replied(txn.reply_to.reply(MessageKind::ResponseAbort, Vec::new()))
                }
                TxnState::Running | TxnState::Committing => self.advance(&mut txn)?,
            };
            match progress {
                Progress::Parked => still_parked.push(id),
                Progress::Replied(reply) => {
                    trace!(
                        target: "dmtxn.server",
                        node = self.node().get(),
                        txn = %id,
                        kind = %reply.kind,
                        "parked_request_answered"
                    );
                    if reply.kind.is_abort() {
                        drop(txn);
                        self.remove(id);
                    }
                    replies.push(reply);
                }
            }
        }
        if !still_parked.is_empty() {
            self.wait_buffer.lock().extend(still_parked);
        }
        Ok(replies)
    }
}

enum Progress {
    Parked,
    Replied(Message),
}
