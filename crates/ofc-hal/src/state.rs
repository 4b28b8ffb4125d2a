//! Connection lifecycle flags and the observable session status

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

/// Session status as seen by services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Not started, or shut down
    Idle,
    /// Waiting for the switch or running the handshake
    Connecting,
    Connected,
    /// A loop failed; waiting transactions have been failed
    Disconnected,
}

/// The three engine flags.
///
/// All transitions are compare-and-swap, so two concurrent `start()` or
/// `shutdown()` calls cannot both win. `switch_ready` is always cleared
/// before `shutting_down` is raised, keeping the two from being set together.
#[derive(Debug, Default)]
pub struct ConnectionState {
    switch_ready: AtomicBool,
    under_initialization: AtomicBool,
    shutting_down: AtomicBool,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_switch_ready(&self) -> bool {
        self.switch_ready.load(Ordering::Acquire)
    }

    pub fn is_under_initialization(&self) -> bool {
        self.under_initialization.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Claim initialization. Fails if running, initializing or shutting down.
    pub fn begin_initialization(&self) -> bool {
        if self.is_switch_ready() || self.is_shutting_down() {
            return false;
        }
        self.under_initialization
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Handshake failed; release the claim
    pub fn abort_initialization(&self) {
        self.under_initialization.store(false, Ordering::Release);
    }

    /// Initialization finished; the loops are running
    pub fn mark_ready(&self) -> bool {
        if self
            .under_initialization
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.switch_ready.store(true, Ordering::Release);
        true
    }

    /// Claim shutdown. Only one caller wins, and only once `start` completed.
    pub fn begin_shutdown(&self) -> bool {
        if self
            .switch_ready
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.shutting_down.store(true, Ordering::Release);
        true
    }

    /// Shutdown finished; the engine may be started again
    pub fn finish_shutdown(&self) {
        self.shutting_down.store(false, Ordering::Release);
    }
}
