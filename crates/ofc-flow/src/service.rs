//! Flow service
//!
//! Owns the flow tables, installs and removes flows through the controller,
//! and keeps the tables honest by polling flow statistics from the switch.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ofc_core::Error;
use ofc_hal::{
    ControllerHandle, MessageListener, Service, ServiceCatalog, Transaction, TransactionResult,
};
use ofc_wire::{
    FlowAction, FlowMatch, FlowStatsEntry, FlowStatsRequest, Message, MessageKind, StatsBody,
    StatsRequest,
};
use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::entry::{FlowEntry, FlowSpec};
use crate::error::{FlowError, Result};
use crate::table::{FlowTable, TableSnapshot};

/// Outcome of folding one complete flow-stats dump into the tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub reported: usize,
    pub claimed: usize,
    pub unclaimed: usize,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowServiceSnapshot {
    pub tables: Vec<TableSnapshot>,
    pub last_reconcile: Option<ReconcileReport>,
}

/// Parts of a multipart flow-stats reply gathered so far
#[derive(Debug, Default)]
struct StatsCollector {
    xid: Option<u32>,
    parts: Vec<FlowStatsEntry>,
}

pub struct FlowService {
    tables: Vec<Arc<FlowTable>>,
    controller: OnceLock<ControllerHandle>,
    collector: Mutex<StatsCollector>,
    /// Held from xid reservation until the request is queued, and across the
    /// duplicate check and insert of an install
    submit: AsyncMutex<()>,
    last_reconcile: Mutex<Option<ReconcileReport>>,
    stop_tx: watch::Sender<bool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl FlowService {
    /// Tables are tried in order when placing a new flow
    pub fn new(tables: Vec<FlowTable>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            tables: tables.into_iter().map(Arc::new).collect(),
            controller: OnceLock::new(),
            collector: Mutex::new(StatsCollector::default()),
            submit: AsyncMutex::new(()),
            last_reconcile: Mutex::new(None),
            stop_tx,
            poller: Mutex::new(None),
        }
    }

    pub fn tables(&self) -> &[Arc<FlowTable>] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&Arc<FlowTable>> {
        self.tables.iter().find(|t| t.name() == name)
    }

    fn controller(&self) -> Result<&ControllerHandle> {
        self.controller
            .get()
            .ok_or_else(|| FlowError::Controller(Error::internal("flow service is not started")))
    }

    /// Table tracking `cookie`
    pub fn table_for(&self, cookie: u64) -> Option<&Arc<FlowTable>> {
        self.tables.iter().find(|t| t.owns(cookie))
    }

    /// Cookie of an already tracked flow with this match and actions
    pub fn get_cookie_for(&self, criteria: &FlowMatch, actions: &[FlowAction]) -> Option<u64> {
        self.tables
            .iter()
            .filter_map(|t| t.get_cookie_for(criteria, actions))
            .max()
    }

    fn place(&self, spec: &FlowSpec) -> Result<&Arc<FlowTable>> {
        let mut fitting = self
            .tables
            .iter()
            .filter(|t| t.check_table_fit(&spec.criteria, &spec.actions))
            .peekable();
        let first = fitting.peek().cloned().ok_or(FlowError::NoFittingTable)?;
        match fitting.find(|t| t.has_capacity()) {
            Some(table) => Ok(table),
            None => Err(FlowError::Capacity {
                table: first.name().to_string(),
                max: first.max_capacity(),
            }),
        }
    }

    /// Track the flow and send its FLOW_MOD. Returns the cookie and whether
    /// the flow was already tracked.
    async fn install(
        &self,
        spec: FlowSpec,
        notify: Option<oneshot::Sender<TransactionResult>>,
    ) -> Result<(u64, bool)> {
        let controller = self.controller()?;
        let _submit = self.submit.lock().await;
        if let Some(cookie) = self.get_cookie_for(&spec.criteria, &spec.actions) {
            debug!(cookie, "flow already installed");
            return Ok((cookie, true));
        }

        let table = self.place(&spec)?.clone();
        let cookie = controller.context().allocate_cookie();
        let xid = controller.reserve_xid();
        let mut entry = FlowEntry::new(spec, cookie);
        entry.install_xid = Some(xid);

        let tracked = table.clone();
        let transaction = Transaction::with_handler(
            xid,
            MessageKind::FlowMod(entry.install_message()),
            controller.codec(),
            move |result| {
                record_install(&tracked, cookie, &result);
                if let Some(tx) = notify {
                    let _ = tx.send(result);
                }
            },
        )?;
        table.add_entry(entry)?;

        if let Err(e) = controller.enqueue_transaction(transaction).await {
            // never reached the switch
            let _ = table.mark_deleted(cookie);
            return Err(e.into());
        }
        info!(table = table.name(), cookie, xid, "flow install sent");
        Ok((cookie, false))
    }

    /// Install a flow without waiting for the switch. Returns its cookie.
    pub async fn add_flow(&self, spec: FlowSpec) -> Result<u64> {
        self.install(spec, None).await.map(|(cookie, _)| cookie)
    }

    /// Install a flow and wait until the switch confirms or rejects it.
    ///
    /// On timeout the entry stays tracked; its outcome is still recorded
    /// when the switch answers.
    pub async fn add_flow_and_wait(&self, spec: FlowSpec, timeout: Option<Duration>) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        let (cookie, existing) = self.install(spec, Some(tx)).await?;
        if existing {
            return Ok(cookie);
        }
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| {
                FlowError::Controller(Error::Timeout(format!("install of cookie {:#x}", cookie)))
            })?,
            None => rx.await,
        };
        match outcome {
            Ok(result) if result.success => Ok(cookie),
            _ => Err(FlowError::InstallFailed(cookie)),
        }
    }

    /// Send DELETE_STRICT for a tracked flow.
    ///
    /// The entry stays PENDING_DELETION until FLOW_REMOVED or the next stats
    /// dump confirms the removal.
    pub async fn remove_flow(&self, cookie: u64) -> Result<()> {
        let controller = self.controller()?;
        let table = self
            .table_for(cookie)
            .ok_or(FlowError::UnknownCookie(cookie))?;
        let entry = table.get(cookie).ok_or(FlowError::UnknownCookie(cookie))?;
        table.mark_pending_deletion(cookie)?;
        controller
            .send_message(MessageKind::FlowMod(entry.delete_message()))
            .await?;
        info!(table = table.name(), cookie, "flow removal sent");
        Ok(())
    }

    /// Ask the switch for all of its flows
    pub async fn poll_now(&self) -> Result<u32> {
        let controller = self.controller()?;
        let _submit = self.submit.lock().await;
        let xid = controller.reserve_xid();
        {
            let mut collector = lock(&self.collector);
            collector.xid = Some(xid);
            collector.parts.clear();
        }
        let request = Transaction::fire_and_forget(
            xid,
            MessageKind::StatsRequest(StatsRequest::Flow(FlowStatsRequest::all())),
            controller.codec(),
        )?;
        controller.enqueue_transaction(request).await?;
        debug!(xid, "flow stats requested");
        Ok(xid)
    }

    /// Route a complete dump to the tables: flows go to the table tracking
    /// their cookie, untracked ones to the first table they fit.
    pub fn reconcile_all(&self, reported: Vec<FlowStatsEntry>) -> ReconcileReport {
        self.reconcile_routed(reported, None)
    }

    fn reconcile_routed(&self, reported: Vec<FlowStatsEntry>, request_xid: Option<u32>) -> ReconcileReport {
        let total = reported.len();
        let mut routed: Vec<Vec<FlowStatsEntry>> = vec![Vec::new(); self.tables.len()];
        let mut unclaimed = Vec::new();
        for flow in reported {
            let target = self
                .tables
                .iter()
                .position(|t| t.owns(flow.cookie))
                .or_else(|| {
                    self.tables
                        .iter()
                        .position(|t| t.check_table_fit(&flow.criteria, &flow.actions))
                });
            match target {
                Some(index) => routed[index].push(flow),
                None => unclaimed.push(flow),
            }
        }

        let mut claimed = 0;
        for (table, mut flows) in self.tables.iter().zip(routed) {
            claimed += match request_xid {
                Some(xid) => table.reconcile_as_of(&mut flows, xid),
                None => table.reconcile(&mut flows),
            };
            unclaimed.extend(flows);
        }
        if !unclaimed.is_empty() {
            debug!(count = unclaimed.len(), "flows on switch left unclaimed");
        }

        let report = ReconcileReport {
            reported: total,
            claimed,
            unclaimed: unclaimed.len(),
            at: Utc::now(),
        };
        *lock(&self.last_reconcile) = Some(report.clone());
        report
    }

    pub fn last_reconcile(&self) -> Option<ReconcileReport> {
        lock(&self.last_reconcile).clone()
    }

    pub fn snapshot(&self) -> FlowServiceSnapshot {
        FlowServiceSnapshot {
            tables: self.tables.iter().map(|t| t.snapshot()).collect(),
            last_reconcile: self.last_reconcile(),
        }
    }

    fn on_flow_stats(&self, xid: u32, more: bool, flows: &[FlowStatsEntry]) {
        let complete = {
            let mut collector = lock(&self.collector);
            if collector.xid != Some(xid) {
                debug!(xid, "ignoring flow stats we did not ask for");
                return;
            }
            collector.parts.extend_from_slice(flows);
            if more {
                return;
            }
            collector.xid = None;
            std::mem::take(&mut collector.parts)
        };
        let report = self.reconcile_routed(complete, Some(xid));
        debug!(
            reported = report.reported,
            claimed = report.claimed,
            unclaimed = report.unclaimed,
            "reconciled flow tables"
        );
    }

    async fn poll_loop(self: Arc<Self>, period: Duration, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => {
                    let ready = self
                        .controller
                        .get()
                        .map_or(false, |c| c.engine().is_ready());
                    if !ready {
                        continue;
                    }
                    if let Err(e) = self.poll_now().await {
                        debug!("flow stats poll skipped: {}", e);
                    }
                }
            }
        }
        debug!("flow stats poller stopped");
    }
}

fn record_install(table: &FlowTable, cookie: u64, result: &TransactionResult) {
    let outcome = if result.success {
        table.mark_installed(cookie)
    } else if result.reply.is_some() {
        warn!(table = table.name(), cookie, "switch rejected flow");
        table.mark_deleted(cookie)
    } else {
        table.mark_unknown(cookie)
    };
    if let Err(e) = outcome {
        warn!(table = table.name(), cookie, "install result not applied: {}", e);
    }
}

impl MessageListener for FlowService {
    fn on_message(&self, message: &Message) {
        match &message.kind {
            MessageKind::FlowRemoved(removed) => match self.table_for(removed.cookie) {
                Some(table) => {
                    debug!(cookie = removed.cookie, reason = ?removed.reason, "flow removed by switch");
                    if let Err(e) = table.mark_deleted(removed.cookie) {
                        warn!("{}", e);
                    }
                }
                None => debug!(cookie = removed.cookie, "FLOW_REMOVED for untracked cookie"),
            },
            MessageKind::StatsReply(reply) => {
                if let StatsBody::Flow(flows) = &reply.body {
                    self.on_flow_stats(message.xid, reply.has_more(), flows);
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Service for FlowService {
    fn name(&self) -> &str {
        "flow-service"
    }

    async fn start(self: Arc<Self>, controller: &ControllerHandle, _catalog: &ServiceCatalog) -> ofc_core::Result<()> {
        if self.controller.set(controller.clone()).is_err() {
            return Err(Error::internal("flow service started twice"));
        }
        controller.add_listener(self.clone());

        self.stop_tx.send_replace(false);
        let period = controller.config().stats_poll_interval;
        let task = tokio::spawn(self.clone().poll_loop(period, self.stop_tx.subscribe()));
        *lock(&self.poller) = Some(task);
        info!(
            tables = self.tables.len(),
            poll_ms = period.as_millis() as u64,
            "flow service started"
        );
        Ok(())
    }

    async fn stop(&self) -> ofc_core::Result<()> {
        self.stop_tx.send_replace(true);
        let task = lock(&self.poller).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FlowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowService")
            .field("tables", &self.tables)
            .field("started", &self.controller.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{AnyFlow, L2Destination};
    use ofc_wire::MacAddr;

    fn service() -> FlowService {
        FlowService::new(vec![
            FlowTable::new("hw", 1, L2Destination),
            FlowTable::new("sw", 16, AnyFlow),
        ])
    }

    fn stats(cookie: u64, criteria: FlowMatch) -> FlowStatsEntry {
        FlowStatsEntry {
            table_id: 0,
            criteria,
            duration_sec: 0,
            duration_nsec: 0,
            priority: 10,
            idle_timeout: 0,
            hard_timeout: 0,
            cookie,
            packet_count: 0,
            byte_count: 0,
            actions: vec![FlowAction::output(1)],
        }
    }

    #[test]
    fn test_untracked_flows_route_to_first_fitting_table() {
        let service = service();
        let l2 = FlowMatch::dl_dst(MacAddr([0, 0, 0, 0, 0, 1]));
        let mut by_port = FlowMatch::all();
        by_port.in_port = Some(2);

        let report = service.reconcile_all(vec![
            stats(7, l2.clone()),
            stats(8, by_port),
            stats(ofc_core::NO_COOKIE, l2),
        ]);
        assert_eq!(report.reported, 3);
        assert_eq!(report.claimed, 2);
        assert_eq!(report.unclaimed, 1);
        assert!(service.table("hw").unwrap().owns(7));
        assert!(service.table("sw").unwrap().owns(8));
        assert_eq!(service.last_reconcile(), Some(report));
    }

    #[test]
    fn test_multipart_stats_reconcile_once_complete() {
        let service = service();
        lock(&service.collector).xid = Some(40);
        let by_port = |port| {
            let mut criteria = FlowMatch::all();
            criteria.in_port = Some(port);
            criteria
        };

        service.on_flow_stats(40, true, &[stats(1, by_port(1))]);
        assert!(service.last_reconcile().is_none());
        // a stray reply for another xid is ignored
        service.on_flow_stats(41, false, &[stats(9, by_port(9))]);
        service.on_flow_stats(40, false, &[stats(2, by_port(2))]);

        let report = service.last_reconcile().unwrap();
        assert_eq!(report.claimed, 2);
        let sw = service.table("sw").unwrap();
        assert!(sw.owns(1) && sw.owns(2) && !sw.owns(9));
    }

    #[test]
    fn test_placement_reports_capacity_of_first_fitting_table() {
        let service = FlowService::new(vec![FlowTable::new("hw", 0, L2Destination)]);
        let spec = FlowSpec::new(
            FlowMatch::dl_dst(MacAddr([0, 0, 0, 0, 0, 1])),
            vec![FlowAction::output(1)],
            10,
            "test",
        );
        assert!(matches!(
            service.place(&spec),
            Err(FlowError::Capacity { max: 0, .. })
        ));

        let unfit = FlowSpec::new(FlowMatch::all(), Vec::new(), 10, "test");
        assert!(matches!(service.place(&unfit), Err(FlowError::NoFittingTable)));
    }

    #[tokio::test]
    async fn test_operations_need_a_started_service() {
        let service = service();
        assert!(matches!(
            service.remove_flow(1).await,
            Err(FlowError::Controller(Error::Internal(_)))
        ));
    }
}
