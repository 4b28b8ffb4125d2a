//! Flow tables for the ofc controller
//!
//! # Modules
//!
//! - `entry`: Flow entries and their lifecycle states
//! - `error`: Flow bookkeeping errors
//! - `service`: Installs, removes and reconciles flows through the controller
//! - `table`: Per-table capacity and state tracking

pub mod entry;
pub mod error;
pub mod service;
pub mod table;

pub use entry::{FlowEntry, FlowSpec, FlowState, INHERITED};
pub use error::{FlowError, Result};
pub use service::{FlowService, FlowServiceSnapshot, ReconcileReport};
pub use table::{AnyFlow, FlowTable, L2Destination, TableFit, TableSnapshot};
