//! OpenFlow fixed header and message type numbers
//!
//! Every message starts with `version: u8, type: u8, length: u16, xid: u32`,
//! all big-endian, where `length` counts the header itself.

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;

use crate::error::WireError;

// ============================================================================
// Protocol constants
// ============================================================================
pub const OFP_VERSION: u8 = 0x01;
pub const OFP_HEADER_LEN: usize = 8;
pub const OFP_MAX_MESSAGE_LEN: usize = u16::MAX as usize;

// ============================================================================
// Message types (ofp_type)
// ============================================================================
pub const OFPT_HELLO: u8 = 0;
pub const OFPT_ERROR: u8 = 1;
pub const OFPT_ECHO_REQUEST: u8 = 2;
pub const OFPT_ECHO_REPLY: u8 = 3;
pub const OFPT_VENDOR: u8 = 4;
pub const OFPT_FEATURES_REQUEST: u8 = 5;
pub const OFPT_FEATURES_REPLY: u8 = 6;
pub const OFPT_GET_CONFIG_REQUEST: u8 = 7;
pub const OFPT_GET_CONFIG_REPLY: u8 = 8;
pub const OFPT_SET_CONFIG: u8 = 9;
pub const OFPT_PACKET_IN: u8 = 10;
pub const OFPT_FLOW_REMOVED: u8 = 11;
pub const OFPT_PORT_STATUS: u8 = 12;
pub const OFPT_PACKET_OUT: u8 = 13;
pub const OFPT_FLOW_MOD: u8 = 14;
pub const OFPT_PORT_MOD: u8 = 15;
pub const OFPT_STATS_REQUEST: u8 = 16;
pub const OFPT_STATS_REPLY: u8 = 17;
pub const OFPT_BARRIER_REQUEST: u8 = 18;
pub const OFPT_BARRIER_REPLY: u8 = 19;
pub const OFPT_QUEUE_GET_CONFIG_REQUEST: u8 = 20;
pub const OFPT_QUEUE_GET_CONFIG_REPLY: u8 = 21;

/// Human readable name of a message type, for logs
pub fn type_name(msg_type: u8) -> &'static str {
    match msg_type {
        OFPT_HELLO => "HELLO",
        OFPT_ERROR => "ERROR",
        OFPT_ECHO_REQUEST => "ECHO_REQUEST",
        OFPT_ECHO_REPLY => "ECHO_REPLY",
        OFPT_VENDOR => "VENDOR",
        OFPT_FEATURES_REQUEST => "FEATURES_REQUEST",
        OFPT_FEATURES_REPLY => "FEATURES_REPLY",
        OFPT_GET_CONFIG_REQUEST => "GET_CONFIG_REQUEST",
        OFPT_GET_CONFIG_REPLY => "GET_CONFIG_REPLY",
        OFPT_SET_CONFIG => "SET_CONFIG",
        OFPT_PACKET_IN => "PACKET_IN",
        OFPT_FLOW_REMOVED => "FLOW_REMOVED",
        OFPT_PORT_STATUS => "PORT_STATUS",
        OFPT_PACKET_OUT => "PACKET_OUT",
        OFPT_FLOW_MOD => "FLOW_MOD",
        OFPT_PORT_MOD => "PORT_MOD",
        OFPT_STATS_REQUEST => "STATS_REQUEST",
        OFPT_STATS_REPLY => "STATS_REPLY",
        OFPT_BARRIER_REQUEST => "BARRIER_REQUEST",
        OFPT_BARRIER_REPLY => "BARRIER_REPLY",
        OFPT_QUEUE_GET_CONFIG_REQUEST => "QUEUE_GET_CONFIG_REQUEST",
        OFPT_QUEUE_GET_CONFIG_REPLY => "QUEUE_GET_CONFIG_REPLY",
        _ => "UNKNOWN",
    }
}

/// The fixed OpenFlow header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OfpHeader {
    pub version: u8,
    pub msg_type: u8,
    pub length: u16,
    pub xid: u32,
}

impl OfpHeader {
    pub fn new(msg_type: u8, length: u16, xid: u32) -> Self {
        Self {
            version: OFP_VERSION,
            msg_type,
            length,
            xid,
        }
    }

    /// Parse the first eight bytes of `buf`.
    ///
    /// Only the length is validated here; version checks belong to the codec
    /// so that a HELLO from a newer switch can still be read.
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < OFP_HEADER_LEN {
            return Err(WireError::truncated("header", OFP_HEADER_LEN, buf.len()));
        }
        let header = Self {
            version: buf[0],
            msg_type: buf[1],
            length: BigEndian::read_u16(&buf[2..4]),
            xid: BigEndian::read_u32(&buf[4..8]),
        };
        if (header.length as usize) < OFP_HEADER_LEN {
            return Err(WireError::BadLength(header.length as usize));
        }
        Ok(header)
    }

    pub fn emit(&self, buf: &mut [u8]) {
        buf[0] = self.version;
        buf[1] = self.msg_type;
        BigEndian::write_u16(&mut buf[2..4], self.length);
        BigEndian::write_u32(&mut buf[4..8], self.xid);
    }

    /// Number of bytes that follow the header
    pub fn body_len(&self) -> usize {
        (self.length as usize).saturating_sub(OFP_HEADER_LEN)
    }

    pub fn type_name(&self) -> &'static str {
        type_name(self.msg_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_bit_exact() {
        let header = OfpHeader::new(OFPT_BARRIER_REQUEST, 8, 0x0102_0304);
        let mut buf = [0u8; 8];
        header.emit(&mut buf);
        assert_eq!(buf, [0x01, 18, 0x00, 0x08, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(OfpHeader::parse(&buf).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_short_length() {
        let buf = [0x01, 0, 0x00, 0x04, 0, 0, 0, 1];
        assert_eq!(OfpHeader::parse(&buf), Err(WireError::BadLength(4)));
    }

    #[test]
    fn test_body_len() {
        let header = OfpHeader::new(OFPT_ECHO_REQUEST, 12, 9);
        assert_eq!(header.body_len(), 4);
        assert_eq!(header.type_name(), "ECHO_REQUEST");
    }
}
