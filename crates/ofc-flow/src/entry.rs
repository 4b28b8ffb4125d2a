//! Flow entries and their lifecycle states

use chrono::{DateTime, Utc};
use ofc_wire::{FlowAction, FlowMatch, FlowMod, FlowStatsEntry};
use serde::Serialize;

/// Install reason recorded for flows found on the switch but not installed by us
pub const INHERITED: &str = "inherited";

/// Lifecycle of one flow.
///
/// Moves forward only: `PendingInstallation -> Active -> PendingDeletion ->
/// Deleted`. `Unknown` marks an install whose outcome was never learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    PendingInstallation,
    Active,
    PendingDeletion,
    Deleted,
    Unknown,
}

impl FlowState {
    /// Counts against table capacity
    pub fn is_live(self) -> bool {
        self != FlowState::Deleted
    }
}

/// What a caller asks the flow service to install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSpec {
    pub criteria: FlowMatch,
    pub actions: Vec<FlowAction>,
    pub priority: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub reason: String,
}

impl FlowSpec {
    /// A permanent flow
    pub fn new(criteria: FlowMatch, actions: Vec<FlowAction>, priority: u16, reason: impl Into<String>) -> Self {
        Self {
            criteria,
            actions,
            priority,
            idle_timeout: 0,
            hard_timeout: 0,
            reason: reason.into(),
        }
    }

    pub fn with_timeouts(mut self, idle_timeout: u16, hard_timeout: u16) -> Self {
        self.idle_timeout = idle_timeout;
        self.hard_timeout = hard_timeout;
        self
    }
}

/// One tracked forwarding rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowEntry {
    pub criteria: FlowMatch,
    pub actions: Vec<FlowAction>,
    pub cookie: u64,
    pub priority: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub install_reason: String,
    pub state: FlowState,
    /// Xid of the FLOW_MOD that installs this entry, once one is built
    #[serde(skip)]
    pub install_xid: Option<u32>,
    /// Set while reconciling when the switch reported this flow
    #[serde(skip)]
    pub is_updated: bool,
    pub last_updated: DateTime<Utc>,
}

impl FlowEntry {
    pub fn new(spec: FlowSpec, cookie: u64) -> Self {
        Self {
            criteria: spec.criteria,
            actions: spec.actions,
            cookie,
            priority: spec.priority,
            idle_timeout: spec.idle_timeout,
            hard_timeout: spec.hard_timeout,
            install_reason: spec.reason,
            state: FlowState::PendingInstallation,
            install_xid: None,
            is_updated: false,
            last_updated: Utc::now(),
        }
    }

    /// A flow the switch already had
    pub fn inherited(stats: &FlowStatsEntry) -> Self {
        Self {
            criteria: stats.criteria.clone(),
            actions: stats.actions.clone(),
            cookie: stats.cookie,
            priority: stats.priority,
            idle_timeout: stats.idle_timeout,
            hard_timeout: stats.hard_timeout,
            install_reason: INHERITED.to_string(),
            state: FlowState::Active,
            install_xid: None,
            is_updated: true,
            last_updated: Utc::now(),
        }
    }

    /// No timeouts: stays until removed
    pub fn is_static(&self) -> bool {
        self.idle_timeout == 0 && self.hard_timeout == 0
    }

    pub fn matches(&self, criteria: &FlowMatch, actions: &[FlowAction]) -> bool {
        self.criteria == *criteria && self.actions == actions
    }

    pub(crate) fn set_state(&mut self, state: FlowState) {
        if self.state != state {
            self.state = state;
            self.last_updated = Utc::now();
        }
    }

    /// FLOW_MOD that installs this entry
    pub fn install_message(&self) -> FlowMod {
        let mut flow_mod = FlowMod::add(
            self.criteria.clone(),
            self.actions.clone(),
            self.cookie,
            self.priority,
        );
        flow_mod.idle_timeout = self.idle_timeout;
        flow_mod.hard_timeout = self.hard_timeout;
        flow_mod
    }

    /// FLOW_MOD that removes exactly this entry
    pub fn delete_message(&self) -> FlowMod {
        FlowMod::delete_strict(self.criteria.clone(), self.cookie, self.priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofc_wire::message::{OFPFC_ADD, OFPFC_DELETE_STRICT, OFPFF_SEND_FLOW_REM};

    fn spec() -> FlowSpec {
        FlowSpec::new(
            FlowMatch::dl_dst("00:00:00:00:00:05".parse().unwrap()),
            vec![FlowAction::output(5)],
            200,
            "cam",
        )
    }

    #[test]
    fn test_new_entry_is_pending() {
        let entry = FlowEntry::new(spec(), 11);
        assert_eq!(entry.state, FlowState::PendingInstallation);
        assert_eq!(entry.install_reason, "cam");
        assert!(entry.is_static());
    }

    #[test]
    fn test_install_and_delete_messages() {
        let entry = FlowEntry::new(spec().with_timeouts(30, 0), 11);
        let add = entry.install_message();
        assert_eq!(add.command, OFPFC_ADD);
        assert_eq!(add.cookie, 11);
        assert_eq!(add.idle_timeout, 30);
        assert_ne!(add.flags & OFPFF_SEND_FLOW_REM, 0);

        let delete = entry.delete_message();
        assert_eq!(delete.command, OFPFC_DELETE_STRICT);
        assert_eq!(delete.priority, 200);
        assert!(delete.actions.is_empty());
    }

    #[test]
    fn test_state_serializes_in_screaming_case() {
        let json = serde_json::to_string(&FlowState::PendingDeletion).unwrap();
        assert_eq!(json, "\"PENDING_DELETION\"");
    }
}
