//! OpenFlow 1.0 message model
//!
//! A closed sum type: the codec decodes each frame once into a
//! [`MessageKind`] variant and every consumer dispatches with `match`.

use serde::Serialize;

use crate::flow::{FlowAction, FlowMatch, MacAddr, OFPP_NONE};
use crate::header::*;

// ============================================================================
// Flow mod commands and flags
// ============================================================================
pub const OFPFC_ADD: u16 = 0;
pub const OFPFC_MODIFY: u16 = 1;
pub const OFPFC_MODIFY_STRICT: u16 = 2;
pub const OFPFC_DELETE: u16 = 3;
pub const OFPFC_DELETE_STRICT: u16 = 4;

pub const OFPFF_SEND_FLOW_REM: u16 = 1 << 0;
pub const OFPFF_CHECK_OVERLAP: u16 = 1 << 1;
pub const OFPFF_EMERG: u16 = 1 << 2;

// ============================================================================
// Switch config flags
// ============================================================================
pub const OFPC_FRAG_NORMAL: u16 = 0;
pub const OFPC_FRAG_DROP: u16 = 1;
pub const OFPC_FRAG_REASM: u16 = 2;

// ============================================================================
// Stats types and flags
// ============================================================================
pub const OFPST_DESC: u16 = 0;
pub const OFPST_FLOW: u16 = 1;
pub const OFPST_AGGREGATE: u16 = 2;
pub const OFPST_TABLE: u16 = 3;
pub const OFPST_PORT: u16 = 4;
pub const OFPST_QUEUE: u16 = 5;
pub const OFPST_VENDOR: u16 = 0xffff;

pub const OFPSF_REPLY_MORE: u16 = 1;

/// Table id meaning "all tables" in stats requests
pub const OFPTT_ALL: u8 = 0xff;

/// Buffer id meaning "packet data is carried in the message"
pub const NO_BUFFER: u32 = 0xffff_ffff;

/// Port description (`ofp_phy_port`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhyPort {
    pub port_no: u16,
    pub hw_addr: MacAddr,
    pub name: String,
    pub config: u32,
    pub state: u32,
    pub curr: u32,
    pub advertised: u32,
    pub supported: u32,
    pub peer: u32,
}

/// FEATURES_REPLY body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwitchFeatures {
    pub datapath_id: u64,
    pub n_buffers: u32,
    pub n_tables: u8,
    pub capabilities: u32,
    pub actions: u32,
    pub ports: Vec<PhyPort>,
}

/// SET_CONFIG / GET_CONFIG_REPLY body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SwitchConfig {
    pub flags: u16,
    pub miss_send_len: u16,
}

/// Reason a packet was sent to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PacketInReason {
    NoMatch,
    Action,
    Unknown(u8),
}

impl PacketInReason {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => PacketInReason::NoMatch,
            1 => PacketInReason::Action,
            other => PacketInReason::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            PacketInReason::NoMatch => 0,
            PacketInReason::Action => 1,
            PacketInReason::Unknown(v) => v,
        }
    }
}

/// PACKET_IN body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketIn {
    pub buffer_id: u32,
    pub total_len: u16,
    pub in_port: u16,
    pub reason: PacketInReason,
    #[serde(skip)]
    pub data: Vec<u8>,
}

/// Reason a flow was removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlowRemovedReason {
    IdleTimeout,
    HardTimeout,
    Delete,
    Unknown(u8),
}

impl FlowRemovedReason {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => FlowRemovedReason::IdleTimeout,
            1 => FlowRemovedReason::HardTimeout,
            2 => FlowRemovedReason::Delete,
            other => FlowRemovedReason::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            FlowRemovedReason::IdleTimeout => 0,
            FlowRemovedReason::HardTimeout => 1,
            FlowRemovedReason::Delete => 2,
            FlowRemovedReason::Unknown(v) => v,
        }
    }
}

/// FLOW_REMOVED body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowRemoved {
    pub criteria: FlowMatch,
    pub cookie: u64,
    pub priority: u16,
    pub reason: FlowRemovedReason,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub idle_timeout: u16,
    pub packet_count: u64,
    pub byte_count: u64,
}

/// Reason for a PORT_STATUS message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PortReason {
    Add,
    Delete,
    Modify,
    Unknown(u8),
}

impl PortReason {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => PortReason::Add,
            1 => PortReason::Delete,
            2 => PortReason::Modify,
            other => PortReason::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            PortReason::Add => 0,
            PortReason::Delete => 1,
            PortReason::Modify => 2,
            PortReason::Unknown(v) => v,
        }
    }
}

/// PORT_STATUS body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortStatus {
    pub reason: PortReason,
    pub desc: PhyPort,
}

/// PACKET_OUT body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketOut {
    pub buffer_id: u32,
    pub in_port: u16,
    pub actions: Vec<FlowAction>,
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl PacketOut {
    /// Send raw `data` out of every port in `ports`
    pub fn to_ports(data: Vec<u8>, ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            buffer_id: NO_BUFFER,
            in_port: OFPP_NONE,
            actions: ports.into_iter().map(FlowAction::output).collect(),
            data,
        }
    }
}

/// FLOW_MOD body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowMod {
    pub criteria: FlowMatch,
    pub cookie: u64,
    pub command: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub priority: u16,
    pub buffer_id: u32,
    pub out_port: u16,
    pub flags: u16,
    pub actions: Vec<FlowAction>,
}

impl FlowMod {
    pub fn add(criteria: FlowMatch, actions: Vec<FlowAction>, cookie: u64, priority: u16) -> Self {
        Self {
            criteria,
            cookie,
            command: OFPFC_ADD,
            idle_timeout: 0,
            hard_timeout: 0,
            priority,
            buffer_id: NO_BUFFER,
            out_port: OFPP_NONE,
            flags: OFPFF_SEND_FLOW_REM,
            actions,
        }
    }

    pub fn delete_strict(criteria: FlowMatch, cookie: u64, priority: u16) -> Self {
        Self {
            criteria,
            cookie,
            command: OFPFC_DELETE_STRICT,
            idle_timeout: 0,
            hard_timeout: 0,
            priority,
            buffer_id: NO_BUFFER,
            out_port: OFPP_NONE,
            flags: 0,
            actions: Vec::new(),
        }
    }
}

/// Body of a flow statistics request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowStatsRequest {
    pub criteria: FlowMatch,
    pub table_id: u8,
    pub out_port: u16,
}

impl FlowStatsRequest {
    /// Dump every flow of every table
    pub fn all() -> Self {
        Self {
            criteria: FlowMatch::all(),
            table_id: OFPTT_ALL,
            out_port: OFPP_NONE,
        }
    }
}

/// STATS_REQUEST body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StatsRequest {
    Desc,
    Flow(FlowStatsRequest),
    Other { stats_type: u16, body: Vec<u8> },
}

/// Switch description (`ofp_desc_stats`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DescStats {
    pub mfr_desc: String,
    pub hw_desc: String,
    pub sw_desc: String,
    pub serial_num: String,
    pub dp_desc: String,
}

/// One flow as reported by the switch (`ofp_flow_stats`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowStatsEntry {
    pub table_id: u8,
    pub criteria: FlowMatch,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub priority: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub cookie: u64,
    pub packet_count: u64,
    pub byte_count: u64,
    pub actions: Vec<FlowAction>,
}

/// Payload of a STATS_REPLY
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StatsBody {
    Desc(DescStats),
    Flow(Vec<FlowStatsEntry>),
    Other { stats_type: u16, body: Vec<u8> },
}

/// STATS_REPLY body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsReply {
    pub flags: u16,
    pub body: StatsBody,
}

impl StatsReply {
    /// True if more parts of this reply follow under the same xid
    pub fn has_more(&self) -> bool {
        self.flags & OFPSF_REPLY_MORE != 0
    }
}

/// Decoded message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum MessageKind {
    Hello,
    Error {
        err_type: u16,
        code: u16,
        #[serde(skip)]
        data: Vec<u8>,
    },
    EchoRequest(Vec<u8>),
    EchoReply(Vec<u8>),
    FeaturesRequest,
    FeaturesReply(SwitchFeatures),
    GetConfigRequest,
    GetConfigReply(SwitchConfig),
    SetConfig(SwitchConfig),
    PacketIn(PacketIn),
    FlowRemoved(FlowRemoved),
    PortStatus(PortStatus),
    PacketOut(PacketOut),
    FlowMod(FlowMod),
    StatsRequest(StatsRequest),
    StatsReply(StatsReply),
    BarrierRequest,
    BarrierReply,
    /// A well-framed message of a type this codec does not model
    Unsupported {
        msg_type: u8,
        #[serde(skip)]
        body: Vec<u8>,
    },
}

impl MessageKind {
    pub fn msg_type(&self) -> u8 {
        match self {
            MessageKind::Hello => OFPT_HELLO,
            MessageKind::Error { .. } => OFPT_ERROR,
            MessageKind::EchoRequest(_) => OFPT_ECHO_REQUEST,
            MessageKind::EchoReply(_) => OFPT_ECHO_REPLY,
            MessageKind::FeaturesRequest => OFPT_FEATURES_REQUEST,
            MessageKind::FeaturesReply(_) => OFPT_FEATURES_REPLY,
            MessageKind::GetConfigRequest => OFPT_GET_CONFIG_REQUEST,
            MessageKind::GetConfigReply(_) => OFPT_GET_CONFIG_REPLY,
            MessageKind::SetConfig(_) => OFPT_SET_CONFIG,
            MessageKind::PacketIn(_) => OFPT_PACKET_IN,
            MessageKind::FlowRemoved(_) => OFPT_FLOW_REMOVED,
            MessageKind::PortStatus(_) => OFPT_PORT_STATUS,
            MessageKind::PacketOut(_) => OFPT_PACKET_OUT,
            MessageKind::FlowMod(_) => OFPT_FLOW_MOD,
            MessageKind::StatsRequest(_) => OFPT_STATS_REQUEST,
            MessageKind::StatsReply(_) => OFPT_STATS_REPLY,
            MessageKind::BarrierRequest => OFPT_BARRIER_REQUEST,
            MessageKind::BarrierReply => OFPT_BARRIER_REPLY,
            MessageKind::Unsupported { msg_type, .. } => *msg_type,
        }
    }
}

/// One OpenFlow message: transaction id plus decoded body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub xid: u32,
    pub kind: MessageKind,
}

impl Message {
    pub fn new(xid: u32, kind: MessageKind) -> Self {
        Self { xid, kind }
    }

    pub fn msg_type(&self) -> u8 {
        self.kind.msg_type()
    }

    pub fn type_name(&self) -> &'static str {
        type_name(self.msg_type())
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, MessageKind::Error { .. })
    }

    pub fn is_barrier_reply(&self) -> bool {
        matches!(self.kind, MessageKind::BarrierReply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_type_mapping() {
        assert_eq!(MessageKind::BarrierReply.msg_type(), OFPT_BARRIER_REPLY);
        assert_eq!(
            MessageKind::Unsupported {
                msg_type: OFPT_VENDOR,
                body: vec![]
            }
            .msg_type(),
            OFPT_VENDOR
        );
    }

    #[test]
    fn test_packet_out_to_ports() {
        let out = PacketOut::to_ports(vec![1, 2, 3], [1u16, 2]);
        assert_eq!(out.buffer_id, NO_BUFFER);
        assert_eq!(out.in_port, OFPP_NONE);
        assert_eq!(out.actions.len(), 2);
    }

    #[test]
    fn test_stats_reply_more_flag() {
        let reply = StatsReply {
            flags: OFPSF_REPLY_MORE,
            body: StatsBody::Flow(vec![]),
        };
        assert!(reply.has_more());
    }

    #[test]
    fn test_message_serializes_to_json() {
        let msg = Message::new(7, MessageKind::BarrierReply);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"barrier_reply\""));
        assert!(msg.is_barrier_reply());
    }
}
