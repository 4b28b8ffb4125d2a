//! Connection engine
//!
//! Owns the single TCP session to the switch. After the handshake four tasks
//! run for the lifetime of the session:
//!
//! - **send**: drains the pending queue, registers each transaction in the
//!   waiting set in write order, then writes its bytes
//! - **receive**: frames and decodes messages into the async queue
//! - **process**: the single consumer of the async queue; answers echoes,
//!   notifies listeners, correlates replies and feeds the packet-in pipeline
//! - **maintenance**: injects a barrier while replies are outstanding
//!
//! A failure in any loop marks the session disconnected, stops the others and
//! fails every waiting transaction. `shutdown()` joins the loops.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use ofc_core::{ControllerConfig, ControllerContext, Error, Result};
use ofc_wire::header::OFPT_HELLO;
use ofc_wire::message::OFPC_FRAG_NORMAL;
use ofc_wire::{
    Codec, Message, MessageKind, OfpHeader, StatsRequest, SwitchConfig, OFP_VERSION,
};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::correlation::{is_correlated, WaitingSet};
use crate::framing::{read_frame, write_frame};
use crate::pipeline::PacketInPipeline;
use crate::state::{ConnectionState, ConnectionStatus};
use crate::transaction::{Transaction, TransactionResult, TransactionWaiter};

/// Something that wants to see every message the switch sends.
///
/// Called from the process loop in arrival order, so implementations must not
/// block. Packet-ins go to the pipeline instead.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: &Message);
}

/// Item on the pending (outbound) queue
#[derive(Debug)]
enum Outbound {
    Transaction(Arc<Transaction>),
    Stop,
}

/// Item on the async (inbound) queue
#[derive(Debug)]
enum Inbound {
    Message(Message),
    Stop,
}

struct LoopHandles {
    send: JoinHandle<()>,
    receive: JoinHandle<()>,
    process: JoinHandle<()>,
    maintenance: JoinHandle<()>,
}

struct Session {
    peer: SocketAddr,
    pending_tx: mpsc::Sender<Outbound>,
    async_tx: mpsc::Sender<Inbound>,
    loops: LoopHandles,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The control-channel engine for one switch
pub struct ConnectionEngine {
    config: ControllerConfig,
    context: Arc<ControllerContext>,
    codec: Arc<dyn Codec>,
    pipeline: Arc<PacketInPipeline>,
    state: ConnectionState,
    waiting: WaitingSet,
    listeners: RwLock<Vec<Arc<dyn MessageListener>>>,
    status_tx: watch::Sender<ConnectionStatus>,
    stop_tx: watch::Sender<bool>,
    session: Mutex<Option<Session>>,
}

impl ConnectionEngine {
    pub fn new(
        config: ControllerConfig,
        context: Arc<ControllerContext>,
        codec: Arc<dyn Codec>,
        pipeline: Arc<PacketInPipeline>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Idle);
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            context,
            codec,
            pipeline,
            state: ConnectionState::new(),
            waiting: WaitingSet::new(),
            listeners: RwLock::new(Vec::new()),
            status_tx,
            stop_tx,
            session: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<ControllerContext> {
        &self.context
    }

    pub fn codec(&self) -> &dyn Codec {
        self.codec.as_ref()
    }

    /// Subscribe to session status changes
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    /// Started and the session is still up
    pub fn is_ready(&self) -> bool {
        self.state.is_switch_ready() && self.current_status() == ConnectionStatus::Connected
    }

    /// Address of the connected switch
    pub fn peer(&self) -> Option<SocketAddr> {
        lock(&self.session).as_ref().map(|s| s.peer)
    }

    /// Number of transactions waiting for a reply
    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MessageListener>) {
        let target = Arc::as_ptr(listener) as *const ();
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.retain(|l| Arc::as_ptr(l) as *const () != target);
    }

    fn listener_snapshot(&self) -> Vec<Arc<dyn MessageListener>> {
        match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            debug!(?previous, ?status, "connection status changed");
        }
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Listen on `port`, accept the first allowed switch and bring the session up.
    ///
    /// An empty `allowed` list accepts any remote.
    pub async fn start(self: &Arc<Self>, port: u16, allowed: &[IpAddr]) -> Result<()> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::connect(format!("failed to listen on {}: {}", addr, e)))?;
        info!("Listening for switch on {}", addr);
        self.start_with_listener(listener, allowed).await
    }

    /// Like [`start`](Self::start) with an already bound listener
    pub async fn start_with_listener(
        self: &Arc<Self>,
        listener: TcpListener,
        allowed: &[IpAddr],
    ) -> Result<()> {
        if !self.state.begin_initialization() {
            return Err(Error::connect("connection engine is already running"));
        }
        self.set_status(ConnectionStatus::Connecting);

        let connected = match self.accept(&listener, allowed).await {
            Ok((reader, writer, peer)) => self
                .handshake_with_timeout(reader, writer)
                .await
                .map(|(reader, writer, early)| (reader, writer, early, peer)),
            Err(e) => Err(e),
        };
        let (reader, writer, early, peer) = match connected {
            Ok(parts) => parts,
            Err(e) => {
                self.state.abort_initialization();
                self.set_status(ConnectionStatus::Idle);
                return Err(e);
            }
        };

        self.spawn_loops(reader, writer, early, peer);
        if !self.state.mark_ready() {
            return Err(Error::internal("initialization claim lost during start"));
        }
        // a loop may already have reported the session broken
        self.status_tx.send_if_modified(|status| {
            if *status == ConnectionStatus::Connecting {
                *status = ConnectionStatus::Connected;
                true
            } else {
                false
            }
        });
        info!(%peer, "switch session established");

        // bystander state, answered through listeners
        for kind in [
            MessageKind::FeaturesRequest,
            MessageKind::GetConfigRequest,
            MessageKind::StatsRequest(StatsRequest::Desc),
        ] {
            if let Err(e) = self.send_message(kind).await {
                warn!("initial switch query not sent: {}", e);
            }
        }
        Ok(())
    }

    async fn accept(
        &self,
        listener: &TcpListener,
        allowed: &[IpAddr],
    ) -> Result<(OwnedReadHalf, OwnedWriteHalf, SocketAddr)> {
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| Error::connect(format!("accept failed: {}", e)))?;
            if !allowed.is_empty() && !allowed.contains(&peer.ip()) {
                warn!(%peer, "rejecting connection from remote not in allow-list");
                continue;
            }
            if let Err(e) = stream.set_nodelay(true) {
                debug!("could not set TCP_NODELAY: {}", e);
            }
            info!(%peer, "switch connected");
            let (reader, writer) = stream.into_split();
            return Ok((reader, writer, peer));
        }
    }

    async fn handshake_with_timeout(
        &self,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
    ) -> Result<(OwnedReadHalf, OwnedWriteHalf, Vec<Message>)> {
        let timeout = self.config.handshake_timeout;
        match tokio::time::timeout(timeout, self.handshake(reader, writer)).await {
            Ok(result) => result,
            Err(_) => Err(Error::connect(format!(
                "handshake did not complete within {:?}",
                timeout
            ))),
        }
    }

    /// HELLO exchange, SET_CONFIG, then an ECHO round trip.
    ///
    /// Anything else the switch sends meanwhile is returned in arrival order.
    async fn handshake(
        &self,
        mut reader: OwnedReadHalf,
        mut writer: OwnedWriteHalf,
    ) -> Result<(OwnedReadHalf, OwnedWriteHalf, Vec<Message>)> {
        let mut early = Vec::new();

        self.write_direct(&mut writer, MessageKind::Hello).await?;
        loop {
            let frame = self.read_handshake_frame(&mut reader).await?;
            let header = OfpHeader::parse(&frame).map_err(|e| Error::connect(e.to_string()))?;
            if header.msg_type == OFPT_HELLO {
                if header.version < OFP_VERSION {
                    return Err(Error::connect(format!(
                        "switch speaks unsupported OpenFlow version {:#04x}",
                        header.version
                    )));
                }
                debug!(version = header.version, "received HELLO");
                break;
            }
            self.keep_early(&frame, &mut early);
        }

        let config = SwitchConfig {
            flags: OFPC_FRAG_NORMAL,
            miss_send_len: self.config.miss_send_len,
        };
        self.write_direct(&mut writer, MessageKind::SetConfig(config))
            .await?;

        let echo_xid = self
            .write_direct(&mut writer, MessageKind::EchoRequest(Vec::new()))
            .await?;
        loop {
            let frame = self.read_handshake_frame(&mut reader).await?;
            match self.codec.decode(&frame) {
                Ok(msg) if msg.xid == echo_xid && matches!(msg.kind, MessageKind::EchoReply(_)) => {
                    debug!(xid = echo_xid, "handshake echo answered");
                    break;
                }
                Ok(msg) => early.push(msg),
                Err(e) => warn!("dropping undecodable message during handshake: {}", e),
            }
        }

        if !early.is_empty() {
            debug!(count = early.len(), "holding messages received during handshake");
        }
        Ok((reader, writer, early))
    }

    async fn read_handshake_frame(&self, reader: &mut OwnedReadHalf) -> Result<Vec<u8>> {
        match read_frame(reader).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(Error::connect("switch closed the connection during handshake")),
            Err(e) => Err(Error::connect(format!("handshake read failed: {}", e))),
        }
    }

    fn keep_early(&self, frame: &[u8], early: &mut Vec<Message>) {
        match self.codec.decode(frame) {
            Ok(msg) => early.push(msg),
            Err(e) => warn!("dropping undecodable message during handshake: {}", e),
        }
    }

    async fn write_direct(&self, writer: &mut OwnedWriteHalf, kind: MessageKind) -> Result<u32> {
        let xid = self.context.reserve_xid();
        let frame = self.codec.encode(&Message::new(xid, kind))?;
        write_frame(writer, &frame)
            .await
            .map_err(|e| Error::connect(format!("handshake write failed: {}", e)))?;
        Ok(xid)
    }

    fn spawn_loops(
        self: &Arc<Self>,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        early: Vec<Message>,
        peer: SocketAddr,
    ) {
        let (pending_tx, pending_rx) = mpsc::channel(self.config.pending_queue_capacity.max(1));
        let (async_tx, async_rx) = mpsc::channel(
            self.config
                .async_queue_capacity
                .max(early.len() + 1),
        );
        let _ = self.stop_tx.send_replace(false);
        let stop_tx = &self.stop_tx;

        // early messages go in ahead of anything the receive loop reads
        for msg in early {
            let _ = async_tx.try_send(Inbound::Message(msg));
        }

        let process = tokio::spawn(Arc::clone(self).process_loop(
            async_rx,
            pending_tx.clone(),
            stop_tx.subscribe(),
        ));
        let receive = tokio::spawn(Arc::clone(self).receive_loop(
            reader,
            async_tx.clone(),
            stop_tx.subscribe(),
        ));
        let send = tokio::spawn(Arc::clone(self).send_loop(pending_rx, writer, stop_tx.subscribe()));
        let maintenance = tokio::spawn(
            Arc::clone(self).maintenance_loop(pending_tx.clone(), stop_tx.subscribe()),
        );

        *lock(&self.session) = Some(Session {
            peer,
            pending_tx,
            async_tx,
            loops: LoopHandles {
                send,
                receive,
                process,
                maintenance,
            },
        });
    }

    // ========================================================================
    // Outbound API
    // ========================================================================

    /// Put a transaction on the pending queue. Waits while the queue is full.
    ///
    /// Fails with `Disconnected` when there is no session; an acknowledged
    /// transaction is resolved as failed in that case.
    pub async fn send(&self, transaction: Arc<Transaction>) -> Result<()> {
        let pending_tx = lock(&self.session).as_ref().map(|s| s.pending_tx.clone());
        let Some(pending_tx) = pending_tx else {
            transaction.fail();
            return Err(Error::Disconnected);
        };
        if let Err(mpsc::error::SendError(Outbound::Transaction(transaction))) =
            pending_tx.send(Outbound::Transaction(transaction)).await
        {
            transaction.fail();
            return Err(Error::Disconnected);
        }
        Ok(())
    }

    /// Send without waiting for a reply. Returns the xid used.
    pub async fn send_message(&self, kind: MessageKind) -> Result<u32> {
        let transaction =
            Transaction::fire_and_forget(self.context.reserve_xid(), kind, self.codec.as_ref())?;
        let xid = transaction.xid();
        self.send(transaction).await?;
        Ok(xid)
    }

    /// Send and get a waiter for the outcome
    pub async fn request(&self, kind: MessageKind) -> Result<TransactionWaiter> {
        let (transaction, waiter) =
            Transaction::blocking(self.context.reserve_xid(), kind, self.codec.as_ref())?;
        self.send(transaction).await?;
        Ok(waiter)
    }

    /// Send and run `handler` with the outcome. Returns the xid used.
    pub async fn request_with_handler<F>(&self, kind: MessageKind, handler: F) -> Result<u32>
    where
        F: FnOnce(TransactionResult) + Send + 'static,
    {
        let transaction = Transaction::with_handler(
            self.context.reserve_xid(),
            kind,
            self.codec.as_ref(),
            handler,
        )?;
        let xid = transaction.xid();
        self.send(transaction).await?;
        Ok(xid)
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop the session and join the loops.
    ///
    /// A no-op unless `start()` completed, and for all but one concurrent caller.
    pub async fn shutdown(&self) {
        if !self.state.begin_shutdown() {
            debug!("shutdown ignored: engine not running or already stopping");
            return;
        }
        info!("shutting down switch session");

        let session = lock(&self.session).take();
        let _ = self.stop_tx.send_replace(true);
        if let Some(session) = session {
            let _ = session.pending_tx.try_send(Outbound::Stop);
            let _ = session.async_tx.try_send(Inbound::Stop);

            let LoopHandles {
                send,
                receive,
                process,
                maintenance,
            } = session.loops;
            for (name, handle) in [
                ("send", send),
                ("receive", receive),
                ("process", process),
                ("maintenance", maintenance),
            ] {
                if let Err(e) = handle.await {
                    error!("{} loop ended abnormally: {}", name, e);
                }
            }
        }

        let failed = self.waiting.fail_all();
        if failed > 0 {
            info!(failed, "failed transactions still waiting at shutdown");
        }
        self.set_status(ConnectionStatus::Idle);
        self.state.finish_shutdown();
    }

    /// A loop hit an unrecoverable error: tell everyone once.
    fn session_broken(&self, source: &str, reason: &str) {
        if self.state.is_shutting_down() {
            return;
        }
        let previous = self.status_tx.send_replace(ConnectionStatus::Disconnected);
        if previous == ConnectionStatus::Disconnected {
            return;
        }
        error!(source, "switch session broken: {}", reason);
        let _ = self.stop_tx.send_replace(true);
        let failed = self.waiting.fail_all();
        if failed > 0 {
            warn!(failed, "failed transactions waiting on broken session");
        }
    }

    // ========================================================================
    // Loops
    // ========================================================================

    async fn send_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Outbound>,
        mut writer: OwnedWriteHalf,
        mut stop: watch::Receiver<bool>,
    ) {
        debug!("send loop running");
        loop {
            let next = tokio::select! {
                _ = stop.changed() => None,
                item = rx.recv() => item,
            };
            let transaction = match next {
                Some(Outbound::Transaction(transaction)) => transaction,
                Some(Outbound::Stop) | None => break,
            };

            self.waiting.register(transaction.clone());
            // a switch that stopped reading must not hold up shutdown
            let written = tokio::select! {
                _ = stop.changed() => break,
                written = write_frame(&mut writer, transaction.bytes()) => written,
            };
            if let Err(e) = written {
                self.session_broken("send", &e.to_string());
                break;
            }
            debug!(
                xid = transaction.xid(),
                msg_type = transaction.request().type_name(),
                "sent"
            );
        }

        // nobody will write what is still queued
        rx.close();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Transaction(transaction) = item {
                if transaction.needs_ack() {
                    transaction.fail();
                }
            }
        }
        // whatever was registered can no longer be answered
        let failed = self.waiting.fail_all();
        if failed > 0 {
            debug!(failed, "failed transactions left waiting by send loop");
        }
        let _ = writer.shutdown().await;
        debug!("send loop exited");
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        async_tx: mpsc::Sender<Inbound>,
        mut stop: watch::Receiver<bool>,
    ) {
        debug!("receive loop running");
        loop {
            let frame = tokio::select! {
                _ = stop.changed() => break,
                frame = read_frame(&mut reader) => frame,
            };
            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.session_broken("receive", "switch closed the connection");
                    break;
                }
                Err(e) => {
                    self.session_broken("receive", &e.to_string());
                    break;
                }
            };

            let msg = match self.codec.decode(&frame) {
                Ok(msg) => msg,
                Err(e) if e.breaks_framing() => {
                    self.session_broken("receive", &e.to_string());
                    break;
                }
                Err(e) => {
                    warn!("dropping undecodable message: {}", e);
                    continue;
                }
            };

            let queued = tokio::select! {
                _ = stop.changed() => break,
                queued = async_tx.send(Inbound::Message(msg)) => queued,
            };
            if queued.is_err() {
                break;
            }
        }
        debug!("receive loop exited");
    }

    async fn process_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Inbound>,
        pending_tx: mpsc::Sender<Outbound>,
        mut stop: watch::Receiver<bool>,
    ) {
        debug!("process loop running");
        loop {
            let next = tokio::select! {
                _ = stop.changed() => None,
                item = rx.recv() => item,
            };
            let msg = match next {
                Some(Inbound::Message(msg)) => msg,
                Some(Inbound::Stop) | None => break,
            };
            tokio::select! {
                _ = stop.changed() => break,
                _ = self.dispatch(msg, &pending_tx) => {}
            }
        }
        debug!("process loop exited");
    }

    async fn dispatch(&self, msg: Message, pending_tx: &mpsc::Sender<Outbound>) {
        debug!(xid = msg.xid, msg_type = msg.type_name(), "received");
        match &msg.kind {
            MessageKind::EchoRequest(data) => {
                self.answer_echo(msg.xid, data.clone(), pending_tx).await;
                return;
            }
            MessageKind::PacketIn(packet) => {
                if let Err(e) = self.pipeline.enqueue(packet.clone()).await {
                    warn!("packet-in dropped: {}", e);
                }
                return;
            }
            MessageKind::Hello => {
                debug!(xid = msg.xid, "ignoring HELLO after handshake");
                return;
            }
            MessageKind::Error { err_type, code, .. } => {
                warn!(xid = msg.xid, err_type, code, "switch reported an error");
            }
            MessageKind::Unsupported { msg_type, .. } => {
                error!(msg_type, "BUG: no handler for message type, dropping");
                return;
            }
            MessageKind::FeaturesRequest
            | MessageKind::GetConfigRequest
            | MessageKind::SetConfig(_)
            | MessageKind::PacketOut(_)
            | MessageKind::FlowMod(_)
            | MessageKind::StatsRequest(_)
            | MessageKind::BarrierRequest => {
                error!(
                    msg_type = msg.type_name(),
                    "BUG: no handler for switch-sent request, dropping"
                );
                return;
            }
            _ => {}
        }

        for listener in self.listener_snapshot() {
            listener.on_message(&msg);
        }
        if is_correlated(&msg.kind) {
            self.waiting.correlate(&msg);
        }
    }

    async fn answer_echo(&self, xid: u32, data: Vec<u8>, pending_tx: &mpsc::Sender<Outbound>) {
        match Transaction::fire_and_forget(xid, MessageKind::EchoReply(data), self.codec.as_ref()) {
            Ok(reply) => {
                if pending_tx.send(Outbound::Transaction(reply)).await.is_err() {
                    debug!(xid, "echo reply not sent: session closing");
                }
            }
            Err(e) => warn!(xid, "could not encode echo reply: {}", e),
        }
    }

    async fn maintenance_loop(
        self: Arc<Self>,
        pending_tx: mpsc::Sender<Outbound>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.maintenance_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        debug!("maintenance loop running");
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {}
            }
            let outstanding = self.waiting.len();
            if outstanding == 0 {
                continue;
            }
            let barrier = Transaction::fire_and_forget(
                self.context.reserve_xid(),
                MessageKind::BarrierRequest,
                self.codec.as_ref(),
            );
            match barrier {
                Ok(barrier) => {
                    debug!(xid = barrier.xid(), outstanding, "injecting barrier");
                    let queued = tokio::select! {
                        _ = stop.changed() => break,
                        queued = pending_tx.send(Outbound::Transaction(barrier)) => queued,
                    };
                    if queued.is_err() {
                        break;
                    }
                }
                Err(e) => error!("could not encode barrier request: {}", e),
            }
        }
        debug!("maintenance loop exited");
    }
}

impl std::fmt::Debug for ConnectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEngine")
            .field("status", &self.current_status())
            .field("peer", &self.peer())
            .field("waiting", &self.waiting.len())
            .finish()
    }
}
