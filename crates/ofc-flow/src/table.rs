//! Per-table flow bookkeeping
//!
//! A [`FlowTable`] tracks the flows it believes are on the switch, keyed by
//! cookie, and moves each one through [`FlowState`] as install results,
//! FLOW_REMOVED notifications and flow-stats dumps arrive. Deleted entries
//! stay visible for a grace period and are purged lazily.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use ofc_core::context::is_valid_cookie;
use ofc_wire::{FlowAction, FlowMatch, FlowStatsEntry};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::entry::{FlowEntry, FlowState};
use crate::error::{FlowError, Result};

/// Decides which flows a table can hold
pub trait TableFit: Send + Sync {
    fn describe(&self) -> &str;

    fn fits(&self, criteria: &FlowMatch, actions: &[FlowAction]) -> bool;
}

/// Accepts everything; a software table
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyFlow;

impl TableFit for AnyFlow {
    fn describe(&self) -> &str {
        "any"
    }

    fn fits(&self, _criteria: &FlowMatch, _actions: &[FlowAction]) -> bool {
        true
    }
}

/// Destination MAC (optionally with VLAN) forwarded to one port.
///
/// The shape a hardware L2 table can hold.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2Destination;

impl TableFit for L2Destination {
    fn describe(&self) -> &str {
        "l2-destination"
    }

    fn fits(&self, criteria: &FlowMatch, actions: &[FlowAction]) -> bool {
        let only_dst = FlowMatch {
            dl_dst: criteria.dl_dst,
            dl_vlan: criteria.dl_vlan,
            ..FlowMatch::all()
        };
        criteria.dl_dst.is_some()
            && *criteria == only_dst
            && matches!(actions, [FlowAction::Output { .. }])
    }
}

/// Serializable view of one table
#[derive(Debug, Clone, Serialize)]
pub struct TableSnapshot {
    pub name: String,
    pub fit: String,
    pub max_capacity: usize,
    pub used_capacity: usize,
    pub entries: Vec<FlowEntry>,
}

/// How long DELETED entries stay visible unless configured otherwise
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(5000);

pub struct FlowTable {
    name: String,
    max_capacity: usize,
    grace_period: Duration,
    fit: Box<dyn TableFit>,
    entries: Mutex<BTreeMap<u64, FlowEntry>>,
}

impl FlowTable {
    pub fn new(name: impl Into<String>, max_capacity: usize, fit: impl TableFit + 'static) -> Self {
        Self {
            name: name.into(),
            max_capacity,
            grace_period: DEFAULT_GRACE_PERIOD,
            fit: Box::new(fit),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// How long a deleted entry stays visible
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, FlowEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn expired(&self, entry: &FlowEntry) -> bool {
        let age = Utc::now().signed_duration_since(entry.last_updated);
        age.to_std().map_or(false, |age| age >= self.grace_period)
    }

    fn purge(&self, entries: &mut BTreeMap<u64, FlowEntry>) {
        entries.retain(|cookie, entry| {
            let keep = entry.state != FlowState::Deleted || !self.expired(entry);
            if !keep {
                debug!(table = %self.name, cookie, "purged deleted flow");
            }
            keep
        });
    }

    pub fn check_table_fit(&self, criteria: &FlowMatch, actions: &[FlowAction]) -> bool {
        self.fit.fits(criteria, actions)
    }

    /// Entries that are not DELETED
    pub fn used_capacity(&self) -> usize {
        let mut entries = self.lock();
        self.purge(&mut entries);
        entries.values().filter(|e| e.state.is_live()).count()
    }

    pub fn has_capacity(&self) -> bool {
        self.used_capacity() < self.max_capacity
    }

    /// Start tracking a new flow in PENDING_INSTALLATION.
    ///
    /// # Panics
    ///
    /// If the entry does not carry an allocated cookie.
    pub fn add_entry(&self, mut entry: FlowEntry) -> Result<()> {
        assert!(
            is_valid_cookie(entry.cookie),
            "flow entry added to '{}' without a cookie",
            self.name
        );
        let mut entries = self.lock();
        self.purge(&mut entries);
        if let Some(existing) = entries.get(&entry.cookie) {
            return Err(FlowError::Consistency {
                cookie: entry.cookie,
                state: existing.state,
                op: "added again",
            });
        }
        let used = entries.values().filter(|e| e.state.is_live()).count();
        if used >= self.max_capacity {
            return Err(FlowError::Capacity {
                table: self.name.clone(),
                max: self.max_capacity,
            });
        }

        entry.state = FlowState::PendingInstallation;
        entry.is_updated = false;
        entry.last_updated = Utc::now();
        debug!(table = %self.name, cookie = entry.cookie, reason = %entry.install_reason, "tracking flow");
        entries.insert(entry.cookie, entry);
        Ok(())
    }

    fn transition<F>(&self, cookie: u64, op: &'static str, f: F) -> Result<()>
    where
        F: FnOnce(FlowState) -> std::result::Result<FlowState, FlowState>,
    {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(&cookie)
            .ok_or(FlowError::UnknownCookie(cookie))?;
        let from = entry.state;
        match f(from) {
            Ok(to) => {
                entry.set_state(to);
                Ok(())
            }
            Err(forced) => {
                warn!(table = %self.name, cookie, ?from, ?forced, "flow cannot go {}", op);
                entry.set_state(forced);
                Err(FlowError::Consistency {
                    cookie,
                    state: from,
                    op,
                })
            }
        }
    }

    /// The switch accepted the install
    pub fn mark_installed(&self, cookie: u64) -> Result<()> {
        self.transition(cookie, "installed", |state| match state {
            FlowState::PendingInstallation => Ok(FlowState::Active),
            // already confirmed by a stats dump, or removal under way
            FlowState::Active | FlowState::PendingDeletion => Ok(state),
            FlowState::Unknown | FlowState::Deleted => Err(FlowState::Deleted),
        })
    }

    /// The install outcome will never be learned
    pub fn mark_unknown(&self, cookie: u64) -> Result<()> {
        self.transition(cookie, "unknown", |state| match state {
            FlowState::PendingInstallation => Ok(FlowState::Unknown),
            other => Ok(other),
        })
    }

    /// A DELETE_STRICT is about to be sent
    pub fn mark_pending_deletion(&self, cookie: u64) -> Result<()> {
        self.transition(cookie, "pending deletion", |state| match state {
            FlowState::PendingInstallation
            | FlowState::Active
            | FlowState::Unknown
            | FlowState::PendingDeletion => Ok(FlowState::PendingDeletion),
            FlowState::Deleted => Err(FlowState::Deleted),
        })
    }

    /// The flow is gone from the switch
    pub fn mark_deleted(&self, cookie: u64) -> Result<()> {
        self.transition(cookie, "deleted", |state| match state {
            FlowState::Deleted => Err(FlowState::Deleted),
            _ => Ok(FlowState::Deleted),
        })
    }

    /// Fold a flow-stats dump into the table.
    ///
    /// Reported flows this table tracks are confirmed; reported flows with a
    /// valid cookie it does not track are inherited as ACTIVE when they fit,
    /// even past capacity. Claimed flows are removed from `reported`, so the
    /// caller can pass the rest on. Every tracked flow missing from the dump
    /// ends up DELETED. Returns the number of flows claimed.
    pub fn reconcile(&self, reported: &mut Vec<FlowStatsEntry>) -> usize {
        self.reconcile_with(reported, None)
    }

    /// Like [`reconcile`](Self::reconcile) for the reply to the stats request
    /// with xid `request_xid`.
    ///
    /// A PENDING_INSTALLATION entry whose FLOW_MOD carries a later xid was
    /// queued after that request, so its absence from the dump says nothing
    /// and it is left alone.
    pub fn reconcile_as_of(&self, reported: &mut Vec<FlowStatsEntry>, request_xid: u32) -> usize {
        self.reconcile_with(reported, Some(request_xid))
    }

    fn reconcile_with(&self, reported: &mut Vec<FlowStatsEntry>, request_xid: Option<u32>) -> usize {
        let mut entries = self.lock();
        for entry in entries.values_mut() {
            entry.is_updated = false;
        }

        let mut claimed = 0;
        reported.retain(|flow| {
            if let Some(entry) = entries.get_mut(&flow.cookie) {
                entry.is_updated = true;
                match entry.state {
                    FlowState::PendingInstallation | FlowState::Unknown => {
                        entry.set_state(FlowState::Active)
                    }
                    FlowState::Active | FlowState::PendingDeletion => {}
                    FlowState::Deleted => warn!(
                        table = %self.name,
                        cookie = flow.cookie,
                        "switch still reports a deleted flow"
                    ),
                }
                claimed += 1;
                return false;
            }
            if !is_valid_cookie(flow.cookie) || !self.fit.fits(&flow.criteria, &flow.actions) {
                return true;
            }
            info!(table = %self.name, cookie = flow.cookie, "inheriting flow found on switch");
            entries.insert(flow.cookie, FlowEntry::inherited(flow));
            claimed += 1;
            false
        });

        for (cookie, entry) in entries.iter_mut().filter(|(_, e)| !e.is_updated) {
            match entry.state {
                FlowState::PendingDeletion => entry.set_state(FlowState::Deleted),
                FlowState::Deleted => {}
                FlowState::Unknown => {
                    debug!(table = %self.name, cookie, "unconfirmed flow never appeared");
                    entry.set_state(FlowState::Deleted);
                }
                FlowState::PendingInstallation
                    if queued_after(entry.install_xid, request_xid) => {}
                FlowState::PendingInstallation | FlowState::Active => {
                    warn!(
                        table = %self.name,
                        cookie,
                        state = ?entry.state,
                        "tracked flow missing from switch"
                    );
                    entry.set_state(FlowState::Deleted);
                }
            }
        }
        self.purge(&mut entries);
        claimed
    }

    /// Highest cookie of a live entry with exactly this match and actions
    pub fn get_cookie_for(&self, criteria: &FlowMatch, actions: &[FlowAction]) -> Option<u64> {
        self.lock()
            .values()
            .filter(|e| {
                !matches!(e.state, FlowState::PendingDeletion | FlowState::Deleted)
                    && e.matches(criteria, actions)
            })
            .map(|e| e.cookie)
            .max()
    }

    pub fn owns(&self, cookie: u64) -> bool {
        self.lock().contains_key(&cookie)
    }

    pub fn get(&self, cookie: u64) -> Option<FlowEntry> {
        self.lock().get(&cookie).cloned()
    }

    pub fn state_of(&self, cookie: u64) -> Option<FlowState> {
        self.lock().get(&cookie).map(|e| e.state)
    }

    pub fn entries(&self) -> Vec<FlowEntry> {
        self.lock().values().cloned().collect()
    }

    pub fn snapshot(&self) -> TableSnapshot {
        let used_capacity = self.used_capacity();
        TableSnapshot {
            name: self.name.clone(),
            fit: self.fit.describe().to_string(),
            max_capacity: self.max_capacity,
            used_capacity,
            entries: self.entries(),
        }
    }
}

fn queued_after(install_xid: Option<u32>, request_xid: Option<u32>) -> bool {
    match (install_xid, request_xid) {
        (Some(install), Some(request)) => install > request,
        _ => false,
    }
}

impl std::fmt::Debug for FlowTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowTable")
            .field("name", &self.name)
            .field("fit", &self.fit.describe())
            .field("max_capacity", &self.max_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{FlowSpec, INHERITED};
    use ofc_wire::MacAddr;

    fn mac(last: u8) -> MacAddr {
        MacAddr([0, 0, 0, 0, 0, last])
    }

    fn spec(last: u8) -> FlowSpec {
        FlowSpec::new(
            FlowMatch::dl_dst(mac(last)),
            vec![FlowAction::output(last as u16)],
            100,
            "test",
        )
    }

    fn reported(entry: &FlowEntry) -> FlowStatsEntry {
        FlowStatsEntry {
            table_id: 0,
            criteria: entry.criteria.clone(),
            duration_sec: 1,
            duration_nsec: 0,
            priority: entry.priority,
            idle_timeout: entry.idle_timeout,
            hard_timeout: entry.hard_timeout,
            cookie: entry.cookie,
            packet_count: 0,
            byte_count: 0,
            actions: entry.actions.clone(),
        }
    }

    fn stats(cookie: u64, last: u8) -> FlowStatsEntry {
        reported(&FlowEntry::new(spec(last), cookie))
    }

    #[test]
    fn test_capacity_lifecycle() {
        let table = FlowTable::new("hw", 1, L2Destination);
        let a = FlowEntry::new(spec(1), 1);
        table.add_entry(a.clone()).unwrap();
        assert_eq!(table.state_of(1), Some(FlowState::PendingInstallation));

        let err = table.add_entry(FlowEntry::new(spec(2), 2)).unwrap_err();
        assert!(matches!(err, FlowError::Capacity { max: 1, .. }));

        let mut dump = vec![reported(&a)];
        assert_eq!(table.reconcile(&mut dump), 1);
        assert!(dump.is_empty());
        assert_eq!(table.state_of(1), Some(FlowState::Active));

        table.mark_pending_deletion(1).unwrap();
        assert_eq!(table.reconcile(&mut Vec::new()), 0);
        assert_eq!(table.state_of(1), Some(FlowState::Deleted));
        assert_eq!(table.used_capacity(), 0);

        table.add_entry(FlowEntry::new(spec(2), 2)).unwrap();
        assert_eq!(table.used_capacity(), 1);
    }

    #[test]
    fn test_transitions_only_move_forward() {
        let table = FlowTable::new("sw", 8, AnyFlow);
        table.add_entry(FlowEntry::new(spec(1), 1)).unwrap();

        table.mark_installed(1).unwrap();
        // repeated confirmation is harmless
        table.mark_installed(1).unwrap();
        table.mark_pending_deletion(1).unwrap();
        table.mark_installed(1).unwrap();
        assert_eq!(table.state_of(1), Some(FlowState::PendingDeletion));

        table.mark_deleted(1).unwrap();
        let err = table.mark_deleted(1).unwrap_err();
        assert!(err.is_consistency());
        assert!(table.mark_pending_deletion(1).unwrap_err().is_consistency());
        assert!(table.mark_installed(1).unwrap_err().is_consistency());
        assert_eq!(table.state_of(1), Some(FlowState::Deleted));

        assert!(matches!(
            table.mark_installed(99),
            Err(FlowError::UnknownCookie(99))
        ));
    }

    #[test]
    fn test_unknown_install_is_forced_to_deleted_when_confirmed() {
        let table = FlowTable::new("sw", 8, AnyFlow);
        table.add_entry(FlowEntry::new(spec(1), 1)).unwrap();
        table.mark_unknown(1).unwrap();
        assert_eq!(table.state_of(1), Some(FlowState::Unknown));

        assert!(table.mark_installed(1).unwrap_err().is_consistency());
        assert_eq!(table.state_of(1), Some(FlowState::Deleted));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let table = FlowTable::new("sw", 8, AnyFlow);
        let a = FlowEntry::new(spec(1), 1);
        let b = FlowEntry::new(spec(2), 2);
        table.add_entry(a.clone()).unwrap();
        table.add_entry(b.clone()).unwrap();

        let dump = vec![reported(&a), reported(&b), stats(40, 3)];
        let mut first = dump.clone();
        assert_eq!(table.reconcile(&mut first), 3);
        let after_first = table.entries();

        let mut second = dump;
        assert_eq!(table.reconcile(&mut second), 3);
        assert_eq!(table.entries(), after_first);
        assert!(after_first.iter().all(|e| e.state == FlowState::Active));
    }

    #[test]
    fn test_reconcile_inherits_fitting_flows_past_capacity() {
        let table = FlowTable::new("hw", 1, L2Destination);
        table.add_entry(FlowEntry::new(spec(1), 1)).unwrap();

        let mut software_only = stats(51, 2);
        software_only.criteria.in_port = Some(3);
        let mut dump = vec![
            stats(50, 2),
            software_only.clone(),
            stats(ofc_core::NO_COOKIE, 4),
            stats(ofc_core::COOKIE_NOT_FOUND, 5),
        ];
        assert_eq!(table.reconcile(&mut dump), 1);

        let inherited = table.get(50).unwrap();
        assert_eq!(inherited.state, FlowState::Active);
        assert_eq!(inherited.install_reason, INHERITED);
        assert_eq!(table.used_capacity(), 2);

        // left for other tables or nobody
        assert_eq!(dump.len(), 3);
        assert_eq!(dump[0], software_only);
        assert!(!table.owns(ofc_core::NO_COOKIE));
    }

    #[test]
    fn test_missing_active_flow_is_forced_to_deleted() {
        let table = FlowTable::new("sw", 8, AnyFlow);
        let a = FlowEntry::new(spec(1), 1);
        table.add_entry(a.clone()).unwrap();
        table.reconcile(&mut vec![reported(&a)]);
        assert_eq!(table.state_of(1), Some(FlowState::Active));

        table.reconcile(&mut Vec::new());
        assert_eq!(table.state_of(1), Some(FlowState::Deleted));
    }

    #[test]
    fn test_missing_pending_install_is_forced_to_deleted() {
        let table = FlowTable::new("sw", 8, AnyFlow);
        table.add_entry(FlowEntry::new(spec(1), 1)).unwrap();
        table.reconcile(&mut Vec::new());
        assert_eq!(table.state_of(1), Some(FlowState::Deleted));
        table.reconcile(&mut Vec::new());
        assert_eq!(table.state_of(1), Some(FlowState::Deleted));

        let stale = FlowTable::new("sw", 8, AnyFlow).with_grace_period(Duration::ZERO);
        stale.add_entry(FlowEntry::new(spec(1), 1)).unwrap();
        stale.reconcile(&mut Vec::new());
        // with no grace, purged at once
        assert_eq!(stale.state_of(1), None);
    }

    #[test]
    fn test_install_queued_after_stats_request_is_spared() {
        let table = FlowTable::new("sw", 8, AnyFlow);
        let mut before = FlowEntry::new(spec(1), 1);
        before.install_xid = Some(10);
        let mut after = FlowEntry::new(spec(2), 2);
        after.install_xid = Some(12);
        table.add_entry(before).unwrap();
        table.add_entry(after).unwrap();

        table.reconcile_as_of(&mut Vec::new(), 11);
        assert_eq!(table.state_of(1), Some(FlowState::Deleted));
        assert_eq!(table.state_of(2), Some(FlowState::PendingInstallation));

        // the next dump is authoritative for it
        table.reconcile_as_of(&mut Vec::new(), 13);
        assert_eq!(table.state_of(2), Some(FlowState::Deleted));
    }

    #[test]
    fn test_default_grace_period_drops_deleted_entries() {
        let table = FlowTable::new("sw", 8, AnyFlow);
        assert_eq!(table.grace_period, DEFAULT_GRACE_PERIOD);
        assert_eq!(DEFAULT_GRACE_PERIOD, Duration::from_millis(5000));
        assert_eq!(
            DEFAULT_GRACE_PERIOD,
            ofc_core::ControllerConfig::default().deleted_grace_period
        );
    }

    #[test]
    fn test_get_cookie_for_prefers_highest_live_cookie() {
        let table = FlowTable::new("sw", 8, AnyFlow);
        for cookie in [3, 9, 5] {
            table.add_entry(FlowEntry::new(spec(1), cookie)).unwrap();
        }
        table.add_entry(FlowEntry::new(spec(2), 20)).unwrap();

        let wanted = spec(1);
        assert_eq!(table.get_cookie_for(&wanted.criteria, &wanted.actions), Some(9));

        table.mark_pending_deletion(9).unwrap();
        assert_eq!(table.get_cookie_for(&wanted.criteria, &wanted.actions), Some(5));

        let other = spec(7);
        assert_eq!(table.get_cookie_for(&other.criteria, &other.actions), None);
    }

    #[test]
    fn test_deleted_entries_purged_after_grace() {
        let table = FlowTable::new("sw", 8, AnyFlow).with_grace_period(Duration::from_millis(20));
        table.add_entry(FlowEntry::new(spec(1), 1)).unwrap();
        table.mark_deleted(1).unwrap();
        assert!(table.owns(1));

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(table.used_capacity(), 0);
        assert!(!table.owns(1));
    }

    #[test]
    #[should_panic(expected = "without a cookie")]
    fn test_add_without_cookie_panics() {
        let table = FlowTable::new("sw", 8, AnyFlow);
        let _ = table.add_entry(FlowEntry::new(spec(1), ofc_core::NO_COOKIE));
    }

    #[test]
    fn test_l2_destination_fit() {
        let fit = L2Destination;
        assert!(fit.fits(&FlowMatch::dl_dst(mac(1)), &[FlowAction::output(1)]));

        let mut tagged = FlowMatch::dl_dst(mac(1));
        tagged.dl_vlan = Some(10);
        assert!(fit.fits(&tagged, &[FlowAction::output(2)]));
        assert!(!fit.fits(&tagged, &[FlowAction::output(1), FlowAction::output(2)]));

        let mut with_port = FlowMatch::dl_dst(mac(1));
        with_port.in_port = Some(1);
        assert!(!fit.fits(&with_port, &[FlowAction::output(1)]));
        assert!(!fit.fits(&FlowMatch::all(), &[FlowAction::output(1)]));
        assert!(!fit.fits(&FlowMatch::dl_dst(mac(1)), &[]));
        assert!(AnyFlow.fits(&FlowMatch::all(), &[]));
    }
}
