//! Process-scoped controller context
//!
//! Holds the counters that must be unique for the whole process: transaction
//! ids handed to outbound messages and cookies handed to installed flows.
//! One context is created per process and shared by `Arc`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Cookie value meaning "no cookie"
pub const NO_COOKIE: u64 = 0;

/// Cookie value meaning "not found"
pub const COOKIE_NOT_FOUND: u64 = u64::MAX;

/// Returns true if `cookie` may identify an installed flow
pub fn is_valid_cookie(cookie: u64) -> bool {
    cookie != NO_COOKIE && cookie != COOKIE_NOT_FOUND
}

/// Shared counters for one controller process
#[derive(Debug)]
pub struct ControllerContext {
    next_xid: AtomicU32,
    next_cookie: AtomicU64,
}

impl ControllerContext {
    pub fn new() -> Self {
        Self {
            next_xid: AtomicU32::new(1),
            next_cookie: AtomicU64::new(1),
        }
    }

    /// Allocate the next transaction id. Xid 0 is never handed out.
    pub fn reserve_xid(&self) -> u32 {
        loop {
            let xid = self.next_xid.fetch_add(1, Ordering::Relaxed);
            if xid != 0 {
                return xid;
            }
        }
    }

    /// Allocate the next flow cookie, skipping the reserved values
    pub fn allocate_cookie(&self) -> u64 {
        loop {
            let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
            if is_valid_cookie(cookie) {
                return cookie;
            }
        }
    }

    /// Restart cookie allocation at `value`.
    ///
    /// Cookies handed out before the reseed may be handed out again.
    pub fn reseed_cookies(&self, value: u64) {
        self.next_cookie.store(value, Ordering::Relaxed);
    }
}

impl Default for ControllerContext {
    fn default() -> Self {
        Self::new()
    }
}
