//! Outbound transactions and their completion
//!
//! A [`Transaction`] is one request on its way to the switch. It carries the
//! decoded request, the bytes the send loop writes, and at most one pending
//! completion. Completions come in two shapes: a private oneshot channel
//! drained by a [`TransactionWaiter`], or an arbitrary handler closure.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ofc_core::{Error, Result};
use ofc_wire::{Codec, Message, MessageKind};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

/// Outcome handed to whoever waits on a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionResult {
    /// The reply, if the switch sent one for this xid
    pub reply: Option<Message>,
    pub success: bool,
}

impl TransactionResult {
    pub fn replied(reply: Message) -> Self {
        let success = !reply.is_error();
        Self {
            reply: Some(reply),
            success,
        }
    }

    /// Completed implicitly by a later barrier
    pub fn acknowledged() -> Self {
        Self {
            reply: None,
            success: true,
        }
    }

    pub fn failed() -> Self {
        Self {
            reply: None,
            success: false,
        }
    }
}

/// Handler invoked once with the transaction outcome
pub type CompletionHandler = Box<dyn FnOnce(TransactionResult) + Send + 'static>;

enum Completion {
    Blocking(oneshot::Sender<TransactionResult>),
    Handler(CompletionHandler),
}

/// One outbound request
pub struct Transaction {
    xid: u32,
    request: Message,
    bytes: Vec<u8>,
    needs_ack: bool,
    completion: Mutex<Option<Completion>>,
}

impl Transaction {
    fn build(
        xid: u32,
        kind: MessageKind,
        codec: &dyn Codec,
        completion: Option<Completion>,
    ) -> Result<Self> {
        let request = Message::new(xid, kind);
        let bytes = codec.encode(&request)?;
        Ok(Self {
            xid,
            request,
            bytes,
            needs_ack: completion.is_some(),
            completion: Mutex::new(completion),
        })
    }

    /// A request nobody waits for. It never enters the waiting set.
    pub fn fire_and_forget(xid: u32, kind: MessageKind, codec: &dyn Codec) -> Result<Arc<Self>> {
        Ok(Arc::new(Self::build(xid, kind, codec, None)?))
    }

    /// A request whose outcome is received through the returned waiter
    pub fn blocking(
        xid: u32,
        kind: MessageKind,
        codec: &dyn Codec,
    ) -> Result<(Arc<Self>, TransactionWaiter)> {
        let (tx, rx) = oneshot::channel();
        let transaction = Self::build(xid, kind, codec, Some(Completion::Blocking(tx)))?;
        Ok((Arc::new(transaction), TransactionWaiter { xid, rx }))
    }

    /// A request whose outcome is passed to `handler`.
    ///
    /// The handler runs on the task that resolves the transaction, which is
    /// usually the process loop. Keep it short.
    pub fn with_handler<F>(xid: u32, kind: MessageKind, codec: &dyn Codec, handler: F) -> Result<Arc<Self>>
    where
        F: FnOnce(TransactionResult) + Send + 'static,
    {
        let completion = Completion::Handler(Box::new(handler));
        Ok(Arc::new(Self::build(xid, kind, codec, Some(completion))?))
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    /// Encoded request, written verbatim by the send loop
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn needs_ack(&self) -> bool {
        self.needs_ack
    }

    /// True once the transaction has been resolved (or never needed to be)
    pub fn is_resolved(&self) -> bool {
        self.completion
            .lock()
            .map(|c| c.is_none())
            .unwrap_or(true)
    }

    /// Deliver `result`. Returns false if already resolved.
    pub fn resolve(&self, result: TransactionResult) -> bool {
        // take under the lock, deliver after releasing it
        let completion = match self.completion.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match completion {
            Some(Completion::Blocking(tx)) => {
                if tx.send(result).is_err() {
                    debug!(xid = self.xid, "waiter went away before completion");
                }
                true
            }
            Some(Completion::Handler(handler)) => {
                handler(result);
                true
            }
            None => false,
        }
    }

    /// Resolve as failed, e.g. when the session goes away
    pub fn fail(&self) -> bool {
        self.resolve(TransactionResult::failed())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("xid", &self.xid)
            .field("type", &self.request.type_name())
            .field("needs_ack", &self.needs_ack)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Receiving end of a blocking transaction
#[derive(Debug)]
pub struct TransactionWaiter {
    xid: u32,
    rx: oneshot::Receiver<TransactionResult>,
}

impl TransactionWaiter {
    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// Wait for the outcome. A dropped transaction counts as failed.
    pub async fn wait(self) -> TransactionResult {
        self.rx.await.unwrap_or_else(|_| TransactionResult::failed())
    }

    /// Wait at most `timeout`.
    ///
    /// Timing out only stops this wait: the transaction stays registered and
    /// may still resolve, so the waiter can be polled again.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Result<TransactionResult> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Ok(TransactionResult::failed()),
            Err(_) => Err(Error::Timeout(format!(
                "transaction {} not resolved after {:?}",
                self.xid, timeout
            ))),
        }
    }
}
