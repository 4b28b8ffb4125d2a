//! Flow match criteria and action lists (`ofp_match`, `ofp_action_*`)
//!
//! Fields left as `None` in [`FlowMatch`] are wildcarded on the wire, so two
//! matches compare equal exactly when they select the same traffic.

use serde::{Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::buf::{put_pad, put_u16, put_u32, Reader};
use crate::error::WireError;

// ============================================================================
// Reserved port numbers (ofp_port)
// ============================================================================
pub const OFPP_MAX: u16 = 0xff00;
pub const OFPP_IN_PORT: u16 = 0xfff8;
pub const OFPP_TABLE: u16 = 0xfff9;
pub const OFPP_NORMAL: u16 = 0xfffa;
pub const OFPP_FLOOD: u16 = 0xfffb;
pub const OFPP_ALL: u16 = 0xfffc;
pub const OFPP_CONTROLLER: u16 = 0xfffd;
pub const OFPP_LOCAL: u16 = 0xfffe;
pub const OFPP_NONE: u16 = 0xffff;

// ============================================================================
// Match wildcards (ofp_flow_wildcards)
// ============================================================================
pub const OFPFW_IN_PORT: u32 = 1 << 0;
pub const OFPFW_DL_VLAN: u32 = 1 << 1;
pub const OFPFW_DL_SRC: u32 = 1 << 2;
pub const OFPFW_DL_DST: u32 = 1 << 3;
pub const OFPFW_DL_TYPE: u32 = 1 << 4;
pub const OFPFW_NW_PROTO: u32 = 1 << 5;
pub const OFPFW_TP_SRC: u32 = 1 << 6;
pub const OFPFW_TP_DST: u32 = 1 << 7;
pub const OFPFW_NW_SRC_SHIFT: u32 = 8;
pub const OFPFW_NW_SRC_MASK: u32 = 0x3f << OFPFW_NW_SRC_SHIFT;
pub const OFPFW_NW_DST_SHIFT: u32 = 14;
pub const OFPFW_NW_DST_MASK: u32 = 0x3f << OFPFW_NW_DST_SHIFT;
pub const OFPFW_DL_VLAN_PCP: u32 = 1 << 20;
pub const OFPFW_NW_TOS: u32 = 1 << 21;
pub const OFPFW_ALL: u32 = (1 << 22) - 1;

pub const OFP_MATCH_LEN: usize = 40;

// ============================================================================
// Action types (ofp_action_type)
// ============================================================================
pub const OFPAT_OUTPUT: u16 = 0;
pub const OFPAT_SET_VLAN_VID: u16 = 1;
pub const OFPAT_SET_VLAN_PCP: u16 = 2;
pub const OFPAT_STRIP_VLAN: u16 = 3;
pub const OFPAT_SET_DL_SRC: u16 = 4;
pub const OFPAT_SET_DL_DST: u16 = 5;
pub const OFPAT_SET_NW_SRC: u16 = 6;
pub const OFPAT_SET_NW_DST: u16 = 7;
pub const OFPAT_SET_NW_TOS: u16 = 8;
pub const OFPAT_SET_TP_SRC: u16 = 9;
pub const OFPAT_SET_TP_DST: u16 = 10;
pub const OFPAT_ENQUEUE: u16 = 11;
pub const OFPAT_VENDOR: u16 = 0xffff;

/// Ethernet hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| WireError::malformed("mac address", s))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|e| WireError::malformed("mac address", format!("{}: {}", s, e)))?;
        }
        if parts.next().is_some() {
            return Err(WireError::malformed("mac address", s));
        }
        Ok(MacAddr(out))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// An IPv4 address with a prefix length (1..=32)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Ipv4Prefix {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl Ipv4Prefix {
    pub fn host(addr: Ipv4Addr) -> Self {
        Self {
            addr,
            prefix_len: 32,
        }
    }

    /// Unset addresses emit the full six-bit field, so a match on nothing is `OFPFW_ALL`
    fn wildcard_bits(prefix: Option<Ipv4Prefix>) -> u32 {
        match prefix {
            Some(p) => 32 - u32::from(p.prefix_len.min(32)),
            None => OFPFW_NW_SRC_MASK >> OFPFW_NW_SRC_SHIFT,
        }
    }

    fn from_wire(addr: u32, wildcard_bits: u32) -> Option<Self> {
        if wildcard_bits >= 32 {
            return None;
        }
        let prefix_len = (32 - wildcard_bits) as u8;
        let mask = u32::MAX << wildcard_bits;
        Some(Self {
            addr: Ipv4Addr::from(addr & mask),
            prefix_len,
        })
    }
}

/// Flow match criteria (`ofp_match`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct FlowMatch {
    pub in_port: Option<u16>,
    pub dl_src: Option<MacAddr>,
    pub dl_dst: Option<MacAddr>,
    pub dl_vlan: Option<u16>,
    pub dl_vlan_pcp: Option<u8>,
    pub dl_type: Option<u16>,
    pub nw_tos: Option<u8>,
    pub nw_proto: Option<u8>,
    pub nw_src: Option<Ipv4Prefix>,
    pub nw_dst: Option<Ipv4Prefix>,
    pub tp_src: Option<u16>,
    pub tp_dst: Option<u16>,
}

impl FlowMatch {
    /// Match everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Match on destination MAC only
    pub fn dl_dst(mac: MacAddr) -> Self {
        Self {
            dl_dst: Some(mac),
            ..Self::default()
        }
    }

    /// Number of fields that are not wildcarded
    pub fn field_count(&self) -> usize {
        [
            self.in_port.is_some(),
            self.dl_src.is_some(),
            self.dl_dst.is_some(),
            self.dl_vlan.is_some(),
            self.dl_vlan_pcp.is_some(),
            self.dl_type.is_some(),
            self.nw_tos.is_some(),
            self.nw_proto.is_some(),
            self.nw_src.is_some(),
            self.nw_dst.is_some(),
            self.tp_src.is_some(),
            self.tp_dst.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    pub fn wildcards(&self) -> u32 {
        let mut w = 0;
        if self.in_port.is_none() {
            w |= OFPFW_IN_PORT;
        }
        if self.dl_vlan.is_none() {
            w |= OFPFW_DL_VLAN;
        }
        if self.dl_src.is_none() {
            w |= OFPFW_DL_SRC;
        }
        if self.dl_dst.is_none() {
            w |= OFPFW_DL_DST;
        }
        if self.dl_type.is_none() {
            w |= OFPFW_DL_TYPE;
        }
        if self.nw_proto.is_none() {
            w |= OFPFW_NW_PROTO;
        }
        if self.tp_src.is_none() {
            w |= OFPFW_TP_SRC;
        }
        if self.tp_dst.is_none() {
            w |= OFPFW_TP_DST;
        }
        w |= Ipv4Prefix::wildcard_bits(self.nw_src) << OFPFW_NW_SRC_SHIFT;
        w |= Ipv4Prefix::wildcard_bits(self.nw_dst) << OFPFW_NW_DST_SHIFT;
        if self.dl_vlan_pcp.is_none() {
            w |= OFPFW_DL_VLAN_PCP;
        }
        if self.nw_tos.is_none() {
            w |= OFPFW_NW_TOS;
        }
        w
    }

    pub fn emit(&self, out: &mut Vec<u8>) {
        put_u32(out, self.wildcards());
        put_u16(out, self.in_port.unwrap_or(0));
        out.extend_from_slice(&self.dl_src.unwrap_or_default().0);
        out.extend_from_slice(&self.dl_dst.unwrap_or_default().0);
        put_u16(out, self.dl_vlan.unwrap_or(0));
        out.push(self.dl_vlan_pcp.unwrap_or(0));
        put_pad(out, 1);
        put_u16(out, self.dl_type.unwrap_or(0));
        out.push(self.nw_tos.unwrap_or(0));
        out.push(self.nw_proto.unwrap_or(0));
        put_pad(out, 2);
        put_u32(out, self.nw_src.map(|p| u32::from(p.addr)).unwrap_or(0));
        put_u32(out, self.nw_dst.map(|p| u32::from(p.addr)).unwrap_or(0));
        put_u16(out, self.tp_src.unwrap_or(0));
        put_u16(out, self.tp_dst.unwrap_or(0));
    }

    pub(crate) fn parse(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let w = r.u32()?;
        let in_port = r.u16()?;
        let dl_src = MacAddr(r.mac()?);
        let dl_dst = MacAddr(r.mac()?);
        let dl_vlan = r.u16()?;
        let dl_vlan_pcp = r.u8()?;
        r.skip(1)?;
        let dl_type = r.u16()?;
        let nw_tos = r.u8()?;
        let nw_proto = r.u8()?;
        r.skip(2)?;
        let nw_src = r.u32()?;
        let nw_dst = r.u32()?;
        let tp_src = r.u16()?;
        let tp_dst = r.u16()?;

        let keep = |bit: u32| w & bit == 0;
        Ok(Self {
            in_port: keep(OFPFW_IN_PORT).then_some(in_port),
            dl_src: keep(OFPFW_DL_SRC).then_some(dl_src),
            dl_dst: keep(OFPFW_DL_DST).then_some(dl_dst),
            dl_vlan: keep(OFPFW_DL_VLAN).then_some(dl_vlan),
            dl_vlan_pcp: keep(OFPFW_DL_VLAN_PCP).then_some(dl_vlan_pcp),
            dl_type: keep(OFPFW_DL_TYPE).then_some(dl_type),
            nw_tos: keep(OFPFW_NW_TOS).then_some(nw_tos),
            nw_proto: keep(OFPFW_NW_PROTO).then_some(nw_proto),
            nw_src: Ipv4Prefix::from_wire(
                nw_src,
                (w & OFPFW_NW_SRC_MASK) >> OFPFW_NW_SRC_SHIFT,
            ),
            nw_dst: Ipv4Prefix::from_wire(
                nw_dst,
                (w & OFPFW_NW_DST_MASK) >> OFPFW_NW_DST_SHIFT,
            ),
            tp_src: keep(OFPFW_TP_SRC).then_some(tp_src),
            tp_dst: keep(OFPFW_TP_DST).then_some(tp_dst),
        })
    }
}

/// One entry of an action list
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FlowAction {
    Output { port: u16, max_len: u16 },
    SetVlanVid(u16),
    SetVlanPcp(u8),
    StripVlan,
    SetDlSrc(MacAddr),
    SetDlDst(MacAddr),
    SetNwSrc(Ipv4Addr),
    SetNwDst(Ipv4Addr),
    SetNwTos(u8),
    SetTpSrc(u16),
    SetTpDst(u16),
    Enqueue { port: u16, queue_id: u32 },
    Other { action_type: u16, body: Vec<u8> },
}

impl FlowAction {
    /// Output to `port`, sending whole packets when the port is the controller
    pub fn output(port: u16) -> Self {
        FlowAction::Output {
            port,
            max_len: if port == OFPP_CONTROLLER { u16::MAX } else { 0 },
        }
    }

    pub fn action_type(&self) -> u16 {
        match self {
            FlowAction::Output { .. } => OFPAT_OUTPUT,
            FlowAction::SetVlanVid(_) => OFPAT_SET_VLAN_VID,
            FlowAction::SetVlanPcp(_) => OFPAT_SET_VLAN_PCP,
            FlowAction::StripVlan => OFPAT_STRIP_VLAN,
            FlowAction::SetDlSrc(_) => OFPAT_SET_DL_SRC,
            FlowAction::SetDlDst(_) => OFPAT_SET_DL_DST,
            FlowAction::SetNwSrc(_) => OFPAT_SET_NW_SRC,
            FlowAction::SetNwDst(_) => OFPAT_SET_NW_DST,
            FlowAction::SetNwTos(_) => OFPAT_SET_NW_TOS,
            FlowAction::SetTpSrc(_) => OFPAT_SET_TP_SRC,
            FlowAction::SetTpDst(_) => OFPAT_SET_TP_DST,
            FlowAction::Enqueue { .. } => OFPAT_ENQUEUE,
            FlowAction::Other { action_type, .. } => *action_type,
        }
    }

    /// Encoded length including the 4-byte action header
    pub fn wire_len(&self) -> usize {
        match self {
            FlowAction::SetDlSrc(_) | FlowAction::SetDlDst(_) | FlowAction::Enqueue { .. } => 16,
            FlowAction::Other { body, .. } => 4 + body.len(),
            _ => 8,
        }
    }

    pub fn emit(&self, out: &mut Vec<u8>) {
        put_u16(out, self.action_type());
        put_u16(out, self.wire_len() as u16);
        match self {
            FlowAction::Output { port, max_len } => {
                put_u16(out, *port);
                put_u16(out, *max_len);
            }
            FlowAction::SetVlanVid(vid) => {
                put_u16(out, *vid);
                put_pad(out, 2);
            }
            FlowAction::SetVlanPcp(v) | FlowAction::SetNwTos(v) => {
                out.push(*v);
                put_pad(out, 3);
            }
            FlowAction::StripVlan => put_pad(out, 4),
            FlowAction::SetDlSrc(mac) | FlowAction::SetDlDst(mac) => {
                out.extend_from_slice(&mac.0);
                put_pad(out, 6);
            }
            FlowAction::SetNwSrc(ip) | FlowAction::SetNwDst(ip) => put_u32(out, u32::from(*ip)),
            FlowAction::SetTpSrc(p) | FlowAction::SetTpDst(p) => {
                put_u16(out, *p);
                put_pad(out, 2);
            }
            FlowAction::Enqueue { port, queue_id } => {
                put_u16(out, *port);
                put_pad(out, 6);
                put_u32(out, *queue_id);
            }
            FlowAction::Other { body, .. } => out.extend_from_slice(body),
        }
    }

    fn parse_one(action_type: u16, body: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(body, "action");
        Ok(match action_type {
            OFPAT_OUTPUT => FlowAction::Output {
                port: r.u16()?,
                max_len: r.u16()?,
            },
            OFPAT_SET_VLAN_VID => FlowAction::SetVlanVid(r.u16()?),
            OFPAT_SET_VLAN_PCP => FlowAction::SetVlanPcp(r.u8()?),
            OFPAT_STRIP_VLAN => FlowAction::StripVlan,
            OFPAT_SET_DL_SRC => FlowAction::SetDlSrc(MacAddr(r.mac()?)),
            OFPAT_SET_DL_DST => FlowAction::SetDlDst(MacAddr(r.mac()?)),
            OFPAT_SET_NW_SRC => FlowAction::SetNwSrc(Ipv4Addr::from(r.u32()?)),
            OFPAT_SET_NW_DST => FlowAction::SetNwDst(Ipv4Addr::from(r.u32()?)),
            OFPAT_SET_NW_TOS => FlowAction::SetNwTos(r.u8()?),
            OFPAT_SET_TP_SRC => FlowAction::SetTpSrc(r.u16()?),
            OFPAT_SET_TP_DST => FlowAction::SetTpDst(r.u16()?),
            OFPAT_ENQUEUE => {
                let port = r.u16()?;
                r.skip(6)?;
                FlowAction::Enqueue {
                    port,
                    queue_id: r.u32()?,
                }
            }
            action_type => FlowAction::Other {
                action_type,
                body: body.to_vec(),
            },
        })
    }
}

/// Encode an action list
pub fn emit_actions(actions: &[FlowAction], out: &mut Vec<u8>) {
    for action in actions {
        action.emit(out);
    }
}

/// Total encoded length of an action list
pub fn actions_len(actions: &[FlowAction]) -> usize {
    actions.iter().map(FlowAction::wire_len).sum()
}

/// Decode a packed action list occupying all of `buf`
pub fn parse_actions(buf: &[u8]) -> Result<Vec<FlowAction>, WireError> {
    let mut r = Reader::new(buf, "action list");
    let mut actions = Vec::new();
    while r.remaining() > 0 {
        let action_type = r.u16()?;
        let len = r.u16()? as usize;
        if len < 4 || len % 8 != 0 {
            return Err(WireError::malformed(
                "action list",
                format!("action {} has invalid length {}", action_type, len),
            ));
        }
        let body = r.bytes(len - 4)?;
        actions.push(FlowAction::parse_one(action_type, body)?);
    }
    Ok(actions)
}
