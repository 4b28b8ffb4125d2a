//! Controller facade
//!
//! [`Controller`] owns the process-scoped pieces: context, engine, pipeline
//! and the service catalog. Services talk to it through a cloneable
//! [`ControllerHandle`] that deliberately leaves the catalog out, so no
//! service ever owns the thing that owns it.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use ofc_core::{ControllerConfig, ControllerContext, Error, Result};
use ofc_wire::{Codec, MessageKind, OpenFlow10Codec, PacketOut};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::connection::{ConnectionEngine, MessageListener};
use crate::pipeline::{FilterPriority, PacketFilter, PacketInPipeline};
use crate::services::{Service, ServiceCatalog, ServiceHandle};
use crate::state::ConnectionStatus;
use crate::switch_state::SwitchState;
use crate::transaction::{Transaction, TransactionResult, TransactionWaiter};

/// The API surface services use
#[derive(Clone)]
pub struct ControllerHandle {
    config: Arc<ControllerConfig>,
    context: Arc<ControllerContext>,
    engine: Arc<ConnectionEngine>,
    pipeline: Arc<PacketInPipeline>,
}

impl ControllerHandle {
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<ControllerContext> {
        &self.context
    }

    pub fn engine(&self) -> &Arc<ConnectionEngine> {
        &self.engine
    }

    pub fn pipeline(&self) -> &Arc<PacketInPipeline> {
        &self.pipeline
    }

    pub fn codec(&self) -> &dyn Codec {
        self.engine.codec()
    }

    pub fn reserve_xid(&self) -> u32 {
        self.context.reserve_xid()
    }

    /// Send raw frame `data` out of every port in `ports`
    pub async fn send_packet(
        &self,
        data: Vec<u8>,
        ports: impl IntoIterator<Item = u16>,
    ) -> Result<()> {
        let ports: BTreeSet<u16> = ports.into_iter().collect();
        if ports.is_empty() {
            return Err(Error::invalid_argument("packet-out needs at least one port"));
        }
        let packet = PacketOut::to_ports(data, ports);
        self.engine.send_message(MessageKind::PacketOut(packet)).await?;
        Ok(())
    }

    pub async fn enqueue_transaction(&self, transaction: Arc<Transaction>) -> Result<()> {
        self.engine.send(transaction).await
    }

    /// Send without waiting for a reply. Returns the xid used.
    pub async fn send_message(&self, kind: MessageKind) -> Result<u32> {
        self.engine.send_message(kind).await
    }

    pub async fn request(&self, kind: MessageKind) -> Result<TransactionWaiter> {
        self.engine.request(kind).await
    }

    pub async fn request_with_handler<F>(&self, kind: MessageKind, handler: F) -> Result<u32>
    where
        F: FnOnce(TransactionResult) + Send + 'static,
    {
        self.engine.request_with_handler(kind, handler).await
    }

    pub fn register_filter(&self, filter: Arc<dyn PacketFilter>, priority: FilterPriority) {
        self.pipeline.register(filter, priority);
    }

    pub fn unregister_filter(&self, filter: &Arc<dyn PacketFilter>) -> bool {
        self.pipeline.unregister(filter)
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) {
        self.engine.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MessageListener>) {
        self.engine.remove_listener(listener);
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.engine.status()
    }
}

impl std::fmt::Debug for ControllerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerHandle")
            .field("engine", &self.engine)
            .finish()
    }
}

/// Top-level owner of one controller instance
#[derive(Debug)]
pub struct Controller {
    handle: ControllerHandle,
    catalog: ServiceCatalog,
    /// Workers and services are running; a failed connect leaves them up for the retry
    services_started: bool,
}

impl Controller {
    /// Controller speaking OpenFlow 1.0
    pub fn new(config: ControllerConfig) -> Result<Self> {
        Self::with_codec(config, Arc::new(OpenFlow10Codec))
    }

    pub fn with_codec(config: ControllerConfig, codec: Arc<dyn Codec>) -> Result<Self> {
        config.validate()?;
        let context = Arc::new(ControllerContext::new());
        let pipeline = Arc::new(PacketInPipeline::new(config.packet_in_queue_capacity));
        let engine = Arc::new(ConnectionEngine::new(
            config.clone(),
            context.clone(),
            codec,
            pipeline.clone(),
        ));

        let mut catalog = ServiceCatalog::new();
        catalog.register(Arc::new(SwitchState::new()))?;

        Ok(Self {
            handle: ControllerHandle {
                config: Arc::new(config),
                context,
                engine,
                pipeline,
            },
            catalog,
            services_started: false,
        })
    }

    pub fn handle(&self) -> ControllerHandle {
        self.handle.clone()
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    pub fn register_service<S: Service>(&mut self, service: Arc<S>) -> Result<ServiceHandle> {
        self.catalog.register(service)
    }

    pub fn get_service<S: Service>(&self) -> Option<Arc<S>> {
        self.catalog.get_service::<S>()
    }

    pub fn service_handle<S: Service>(&self) -> Option<ServiceHandle> {
        self.catalog.handle_of::<S>()
    }

    pub fn switch_state(&self) -> Option<Arc<SwitchState>> {
        self.get_service::<SwitchState>()
    }

    /// Start workers and services, then wait for the switch on the configured port
    pub async fn start(&mut self) -> Result<()> {
        self.start_services().await?;
        let port = self.handle.config.listen_port;
        let allowed: Vec<IpAddr> = self.handle.config.allowed_remotes.clone();
        self.handle.engine.start(port, &allowed).await
    }

    /// Like [`start`](Self::start) with an already bound listener
    pub async fn start_with_listener(&mut self, listener: TcpListener) -> Result<()> {
        self.start_services().await?;
        let allowed: Vec<IpAddr> = self.handle.config.allowed_remotes.clone();
        self.handle
            .engine
            .start_with_listener(listener, &allowed)
            .await
    }

    async fn start_services(&mut self) -> Result<()> {
        if self.services_started {
            return Ok(());
        }
        self.handle
            .pipeline
            .start(self.handle.config.packet_in_workers);
        let handle = self.handle.clone();
        if let Err(e) = self.catalog.start_all(&handle).await {
            self.catalog.stop_all().await;
            self.handle.pipeline.stop().await;
            return Err(e);
        }
        self.services_started = true;
        Ok(())
    }

    pub fn services_started(&self) -> bool {
        self.services_started
    }

    /// Tear everything down: session first, then services, then workers
    pub async fn shutdown(&mut self) {
        info!("controller shutting down");
        self.handle.engine.shutdown().await;
        self.catalog.stop_all().await;
        self.handle.pipeline.stop().await;
        self.services_started = false;
    }
}
