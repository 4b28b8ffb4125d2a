//! Core types and utilities for the ofc OpenFlow controller
//!
//! # Modules
//!
//! - `config`: Environment loading and controller configuration
//! - `context`: Process-scoped xid and cookie counters
//! - `error`: Error types and Result alias

pub mod config;
pub mod context;
pub mod error;

// Re-exports
pub use config::ControllerConfig;
pub use context::{is_valid_cookie, ControllerContext, COOKIE_NOT_FOUND, NO_COOKIE};
pub use error::{Error, Result};
