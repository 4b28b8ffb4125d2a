//! Packet-in pipeline
//!
//! Packet-ins are queued on a bounded channel and handled by a pool of worker
//! tasks. Each worker decodes the Ethernet frame, takes a snapshot of the
//! filter chain and offers the packet to each filter in ascending priority
//! until one claims it. Registration never blocks in-flight dispatch because
//! workers only hold the filter lock long enough to clone the list.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::join_all;
use ofc_core::{Error, Result};
use ofc_wire::{EthernetFrame, PacketIn};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Ordering key for filters; lower runs first
pub type FilterPriority = u32;

/// A consumer of packet-ins.
///
/// Filters run concurrently on several workers and must be thread-safe.
#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Return true if the packet was handled and no later filter should see it
    async fn handle(&self, packet: &PacketIn, frame: &EthernetFrame) -> bool;
}

#[derive(Clone)]
struct RegisteredFilter {
    priority: FilterPriority,
    filter: Arc<dyn PacketFilter>,
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub received: u64,
    pub claimed: u64,
    pub unclaimed: u64,
    pub undecodable: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    claimed: AtomicU64,
    unclaimed: AtomicU64,
    undecodable: AtomicU64,
}

/// Priority-ordered filter chain over a worker pool
pub struct PacketInPipeline {
    filters: Mutex<Vec<RegisteredFilter>>,
    tx: mpsc::Sender<PacketIn>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PacketIn>>>,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl PacketInPipeline {
    /// Create a pipeline whose queue holds at most `capacity` packets
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (stop_tx, _) = watch::channel(false);
        Self {
            filters: Mutex::new(Vec::new()),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            stop_tx,
            workers: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    /// Insert `filter` after every filter with priority <= `priority`
    pub fn register(&self, filter: Arc<dyn PacketFilter>, priority: FilterPriority) {
        let mut filters = lock(&self.filters);
        let at = filters.partition_point(|f| f.priority <= priority);
        info!(filter = filter.name(), priority, "registered packet filter");
        filters.insert(at, RegisteredFilter { priority, filter });
    }

    /// Remove `filter`. Returns false if it was not registered.
    pub fn unregister(&self, filter: &Arc<dyn PacketFilter>) -> bool {
        let target = Arc::as_ptr(filter) as *const ();
        let mut filters = lock(&self.filters);
        let before = filters.len();
        filters.retain(|f| Arc::as_ptr(&f.filter) as *const () != target);
        let removed = filters.len() != before;
        if removed {
            info!(filter = filter.name(), "unregistered packet filter");
        }
        removed
    }

    /// Names of the registered filters in dispatch order
    pub fn filter_names(&self) -> Vec<String> {
        lock(&self.filters)
            .iter()
            .map(|f| f.filter.name().to_string())
            .collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn PacketFilter>> {
        lock(&self.filters).iter().map(|f| f.filter.clone()).collect()
    }

    /// Queue a packet-in. Waits while the queue is full.
    pub async fn enqueue(&self, packet: PacketIn) -> Result<()> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(packet)
            .await
            .map_err(|_| Error::internal("packet-in queue closed"))
    }

    /// Spawn `count` workers. Calling it again adds more workers.
    pub fn start(self: &Arc<Self>, count: usize) {
        let _ = self.stop_tx.send_replace(false);
        let mut workers = lock(&self.workers);
        for id in 0..count {
            let pipeline = Arc::clone(self);
            let stop = self.stop_tx.subscribe();
            workers.push(tokio::spawn(async move { pipeline.worker(id, stop).await }));
        }
        info!(workers = workers.len(), "packet-in pipeline started");
    }

    /// Stop and join all workers. Packets still queued stay queued.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send_replace(true);
        let workers = std::mem::take(&mut *lock(&self.workers));
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!("packet-in worker ended abnormally: {}", e);
            }
        }
        debug!("packet-in pipeline stopped");
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            received: self.counters.received.load(Ordering::Relaxed),
            claimed: self.counters.claimed.load(Ordering::Relaxed),
            unclaimed: self.counters.unclaimed.load(Ordering::Relaxed),
            undecodable: self.counters.undecodable.load(Ordering::Relaxed),
        }
    }

    async fn worker(&self, id: usize, mut stop: watch::Receiver<bool>) {
        debug!(worker = id, "packet-in worker running");
        loop {
            if *stop.borrow() {
                break;
            }
            let next = tokio::select! {
                _ = stop.changed() => break,
                packet = async { self.rx.lock().await.recv().await } => packet,
            };
            match next {
                Some(packet) => {
                    self.dispatch(id, packet).await;
                }
                None => break,
            }
        }
        debug!(worker = id, "packet-in worker exiting");
    }

    /// Offer one packet to the filter chain. Returns the name of the claiming filter.
    pub async fn dispatch(&self, worker: usize, packet: PacketIn) -> Option<String> {
        let frame = match EthernetFrame::parse(&packet.data) {
            Ok(frame) => frame,
            Err(e) => {
                self.counters.undecodable.fetch_add(1, Ordering::Relaxed);
                debug!(worker, in_port = packet.in_port, "dropping undecodable packet-in: {}", e);
                return None;
            }
        };

        for filter in self.snapshot() {
            if filter.handle(&packet, &frame).await {
                self.counters.claimed.fetch_add(1, Ordering::Relaxed);
                trace!(worker, filter = filter.name(), "packet-in claimed");
                return Some(filter.name().to_string());
            }
        }

        self.counters.unclaimed.fetch_add(1, Ordering::Relaxed);
        trace!(
            worker,
            in_port = packet.in_port,
            src = %frame.src,
            dst = %frame.dst,
            ethertype = frame.ethertype,
            "no filter claimed packet-in"
        );
        None
    }
}

impl std::fmt::Debug for PacketInPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketInPipeline")
            .field("filters", &self.filter_names())
            .field("stats", &self.stats())
            .finish()
    }
}
