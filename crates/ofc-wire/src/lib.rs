//! ofc-wire: OpenFlow 1.0 wire format
//!
//! Header framing, the closed [`Message`] model and the [`Codec`] that turns
//! one into the other. Also decodes the Ethernet frames carried in packet-ins.

mod buf;
pub mod codec;
pub mod error;
pub mod ethernet;
pub mod flow;
pub mod header;
pub mod message;

pub use codec::{Codec, OpenFlow10Codec};
pub use error::WireError;
pub use ethernet::{EthernetFrame, VlanTag};
pub use flow::{FlowAction, FlowMatch, Ipv4Prefix, MacAddr};
pub use header::{OfpHeader, OFP_HEADER_LEN, OFP_VERSION};
pub use message::{
    DescStats, FlowMod, FlowRemoved, FlowRemovedReason, FlowStatsEntry, FlowStatsRequest,
    Message, MessageKind, PacketIn, PacketInReason, PacketOut, PhyPort, PortReason, PortStatus,
    StatsBody, StatsReply, StatsRequest, SwitchConfig, SwitchFeatures,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::codec::{Codec, OpenFlow10Codec};
    pub use crate::error::WireError;
    pub use crate::ethernet::EthernetFrame;
    pub use crate::flow::{FlowAction, FlowMatch, MacAddr};
    pub use crate::message::{Message, MessageKind};
}
