//! ofc-hal: the switch-facing half of the controller
//!
//! # Modules
//!
//! - `connection`: TCP session, handshake and the four session loops
//! - `correlation`: waiting set and barrier resolution
//! - `transaction`: outbound requests and their completion
//! - `pipeline`: packet-in filter chain on a worker pool
//! - `services`: dependency-ordered service catalog
//! - `controller`: the facade services are written against

pub mod connection;
pub mod controller;
pub mod correlation;
pub mod framing;
pub mod pipeline;
pub mod services;
pub mod state;
pub mod switch_state;
pub mod transaction;

pub use connection::{ConnectionEngine, MessageListener};
pub use controller::{Controller, ControllerHandle};
pub use correlation::WaitingSet;
pub use pipeline::{FilterPriority, PacketFilter, PacketInPipeline, PipelineStats};
pub use services::{Service, ServiceCatalog, ServiceHandle};
pub use state::{ConnectionState, ConnectionStatus};
pub use switch_state::{SwitchSnapshot, SwitchState};
pub use transaction::{Transaction, TransactionResult, TransactionWaiter};
