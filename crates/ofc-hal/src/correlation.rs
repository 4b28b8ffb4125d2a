//! Reply correlation
//!
//! The waiting set holds every acknowledgement-requesting transaction that
//! has been written (or is about to be written) to the switch, keyed by xid.
//! A plain reply resolves its own xid. A barrier reply resolves everything
//! written before that barrier, in ascending xid order, because the switch
//! has by then finished all earlier requests.
//!
//! Xids are reserved when a transaction is built, so two callers can put
//! them on the wire out of xid order. Each registration therefore takes a
//! write sequence number, and barriers are matched by sequence, not by xid.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use ofc_wire::{Message, MessageKind};
use tracing::debug;

use crate::transaction::{Transaction, TransactionResult};

/// Returns true for message kinds that may answer an outstanding request
pub fn is_correlated(kind: &MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::Error { .. }
            | MessageKind::EchoReply(_)
            | MessageKind::FeaturesReply(_)
            | MessageKind::GetConfigReply(_)
            | MessageKind::StatsReply(_)
            | MessageKind::FlowRemoved(_)
            | MessageKind::BarrierReply
    )
}

#[derive(Debug, Default)]
struct Registry {
    next_seq: u64,
    /// xid -> (write sequence, transaction)
    waiting: BTreeMap<u32, (u64, Arc<Transaction>)>,
    /// barrier xid -> write sequence, for every barrier written
    barriers: BTreeMap<u32, u64>,
}

/// Transactions awaiting a reply, ordered by xid
#[derive(Debug, Default)]
pub struct WaitingSet {
    inner: Mutex<Registry>,
}

impl WaitingSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a transaction about to be written. Must happen before its bytes
    /// hit the socket, in write order.
    ///
    /// Acknowledged transactions start waiting; barriers are remembered either
    /// way so their reply can be placed in the write order.
    pub fn register(&self, transaction: Arc<Transaction>) {
        let is_barrier = matches!(transaction.request().kind, MessageKind::BarrierRequest);
        if !is_barrier && !transaction.needs_ack() {
            return;
        }
        let xid = transaction.xid();
        let replaced = {
            let mut guard = self.lock();
            let registry = &mut *guard;
            let seq = registry.next_seq;
            registry.next_seq += 1;
            if is_barrier {
                registry.barriers.insert(xid, seq);
            }
            if transaction.needs_ack() {
                registry.waiting.insert(xid, (seq, transaction))
            } else {
                None
            }
        };
        if let Some((_, previous)) = replaced {
            // xids are never reused, so this is a caller bug
            debug!(xid, "replacing waiting transaction with duplicate xid");
            previous.fail();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().waiting.is_empty()
    }

    pub fn contains(&self, xid: u32) -> bool {
        self.lock().waiting.contains_key(&xid)
    }

    /// Resolve whatever `reply` answers. Returns the number of transactions resolved.
    pub fn correlate(&self, reply: &Message) -> usize {
        if reply.is_barrier_reply() {
            return self.resolve_through(reply);
        }

        let waiting = self.lock().waiting.remove(&reply.xid);
        match waiting {
            Some((_, transaction)) => {
                transaction.resolve(TransactionResult::replied(reply.clone()));
                1
            }
            None => {
                debug!(xid = reply.xid, msg_type = reply.type_name(), "no transaction waiting for reply");
                0
            }
        }
    }

    fn resolve_through(&self, barrier: &Message) -> usize {
        let resolved: Vec<(u32, Arc<Transaction>)> = {
            let mut guard = self.lock();
            let registry = &mut *guard;
            let Some(through) = registry.barriers.remove(&barrier.xid) else {
                debug!(xid = barrier.xid, "reply to a barrier that was never written");
                return 0;
            };
            // older barriers can no longer be answered out of order
            registry.barriers.retain(|_, seq| *seq > through);
            let done: Vec<u32> = registry
                .waiting
                .iter()
                .filter(|(_, (seq, _))| *seq <= through)
                .map(|(xid, _)| *xid)
                .collect();
            done.into_iter()
                .filter_map(|xid| registry.waiting.remove(&xid).map(|(_, t)| (xid, t)))
                .collect()
        };

        let count = resolved.len();
        for (xid, transaction) in resolved {
            let result = if xid == barrier.xid {
                TransactionResult::replied(barrier.clone())
            } else {
                TransactionResult::acknowledged()
            };
            transaction.resolve(result);
        }
        if count > 0 {
            debug!(barrier_xid = barrier.xid, count, "barrier resolved waiting transactions");
        }
        count
    }

    /// Fail and remove every waiting transaction
    pub fn fail_all(&self) -> usize {
        let drained = {
            let mut registry = self.lock();
            registry.barriers.clear();
            std::mem::take(&mut registry.waiting)
        };
        let count = drained.len();
        for (_, transaction) in drained.into_values() {
            transaction.fail();
        }
        count
    }
}
