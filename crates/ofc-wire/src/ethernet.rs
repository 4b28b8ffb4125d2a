//! Minimal Ethernet II decoding for packet-in payloads

use serde::Serialize;

use crate::buf::Reader;
use crate::error::WireError;
use crate::flow::MacAddr;

pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;
pub const ETH_TYPE_VLAN: u16 = 0x8100;
pub const ETH_TYPE_IPV6: u16 = 0x86dd;
pub const ETH_TYPE_LLDP: u16 = 0x88cc;

const ETH_HEADER_LEN: usize = 14;

/// 802.1Q tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VlanTag {
    pub pcp: u8,
    pub vid: u16,
}

/// Decoded Ethernet frame. Owns its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EthernetFrame {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub vlan: Option<VlanTag>,
    pub ethertype: u16,
    #[serde(skip)]
    pub payload: Vec<u8>,
}

impl EthernetFrame {
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < ETH_HEADER_LEN {
            return Err(WireError::truncated("ethernet frame", ETH_HEADER_LEN, data.len()));
        }
        let mut r = Reader::new(data, "ethernet frame");
        let dst = MacAddr(r.mac()?);
        let src = MacAddr(r.mac()?);
        let mut ethertype = r.u16()?;
        let mut vlan = None;
        if ethertype == ETH_TYPE_VLAN {
            let tci = r.u16()?;
            vlan = Some(VlanTag {
                pcp: (tci >> 13) as u8,
                vid: tci & 0x0fff,
            });
            ethertype = r.u16()?;
        }
        Ok(Self {
            dst,
            src,
            vlan,
            ethertype,
            payload: r.rest().to_vec(),
        })
    }

    pub fn vlan_id(&self) -> Option<u16> {
        self.vlan.map(|tag| tag.vid)
    }

    pub fn is_arp(&self) -> bool {
        self.ethertype == ETH_TYPE_ARP
    }

    pub fn is_lldp(&self) -> bool {
        self.ethertype == ETH_TYPE_LLDP
    }

    /// Encode back to bytes, used when building packet-outs
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ETH_HEADER_LEN + 4 + self.payload.len());
        out.extend_from_slice(&self.dst.0);
        out.extend_from_slice(&self.src.0);
        if let Some(tag) = self.vlan {
            out.extend_from_slice(&ETH_TYPE_VLAN.to_be_bytes());
            let tci = ((tag.pcp as u16) << 13) | (tag.vid & 0x0fff);
            out.extend_from_slice(&tci.to_be_bytes());
        }
        out.extend_from_slice(&self.ethertype.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}
