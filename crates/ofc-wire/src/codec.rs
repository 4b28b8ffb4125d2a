//! Message codec
//!
//! [`Codec`] is the contract the connection engine depends on: whole framed
//! messages in, [`Message`] out, and back. [`OpenFlow10Codec`] implements it
//! for the OpenFlow 1.0 message set.

use tracing::trace;

use crate::buf::{put_fixed_str, put_pad, put_u16, put_u32, put_u64, Reader};
use crate::error::WireError;
use crate::flow::{actions_len, emit_actions, parse_actions, FlowMatch, MacAddr};
use crate::header::*;
use crate::message::*;

const PHY_PORT_LEN: usize = 48;
const FLOW_STATS_FIXED_LEN: usize = 88;
const DESC_STR_LEN: usize = 256;
const SERIAL_NUM_LEN: usize = 32;
const PORT_NAME_LEN: usize = 16;

/// Encode/decode contract for one OpenFlow version
pub trait Codec: Send + Sync {
    /// Decode one complete frame (header included)
    fn decode(&self, frame: &[u8]) -> Result<Message, WireError>;

    /// Encode a message into a complete frame
    fn encode(&self, message: &Message) -> Result<Vec<u8>, WireError>;
}

/// Codec for OpenFlow 1.0 (wire version 0x01)
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlow10Codec;

impl Codec for OpenFlow10Codec {
    fn decode(&self, frame: &[u8]) -> Result<Message, WireError> {
        let header = OfpHeader::parse(frame)?;
        if header.length as usize != frame.len() {
            return Err(WireError::LengthMismatch {
                header: header.length as usize,
                buffer: frame.len(),
            });
        }
        // HELLO is accepted from any version so negotiation can fail cleanly
        if header.version != OFP_VERSION && header.msg_type != OFPT_HELLO {
            return Err(WireError::BadVersion(header.version));
        }

        let body = &frame[OFP_HEADER_LEN..];
        let kind = decode_body(header.msg_type, body)?;
        trace!(xid = header.xid, msg_type = header.type_name(), "decoded message");
        Ok(Message::new(header.xid, kind))
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, WireError> {
        let mut out = vec![0u8; OFP_HEADER_LEN];
        encode_body(&message.kind, &mut out);

        if out.len() > OFP_MAX_MESSAGE_LEN {
            return Err(WireError::TooLarge(out.len()));
        }
        OfpHeader::new(message.msg_type(), out.len() as u16, message.xid).emit(&mut out);
        Ok(out)
    }
}

// ============================================================================
// Decoding
// ============================================================================

fn decode_body(msg_type: u8, body: &[u8]) -> Result<MessageKind, WireError> {
    let mut r = Reader::new(body, type_name(msg_type));
    Ok(match msg_type {
        // HELLO may carry elements from newer versions; they are ignored
        OFPT_HELLO => MessageKind::Hello,
        OFPT_ERROR => MessageKind::Error {
            err_type: r.u16()?,
            code: r.u16()?,
            data: r.rest().to_vec(),
        },
        OFPT_ECHO_REQUEST => MessageKind::EchoRequest(body.to_vec()),
        OFPT_ECHO_REPLY => MessageKind::EchoReply(body.to_vec()),
        OFPT_FEATURES_REQUEST => MessageKind::FeaturesRequest,
        OFPT_FEATURES_REPLY => MessageKind::FeaturesReply(decode_features(&mut r)?),
        OFPT_GET_CONFIG_REQUEST => MessageKind::GetConfigRequest,
        OFPT_GET_CONFIG_REPLY => MessageKind::GetConfigReply(decode_config(&mut r)?),
        OFPT_SET_CONFIG => MessageKind::SetConfig(decode_config(&mut r)?),
        OFPT_PACKET_IN => MessageKind::PacketIn(PacketIn {
            buffer_id: r.u32()?,
            total_len: r.u16()?,
            in_port: r.u16()?,
            reason: PacketInReason::from_u8(r.u8()?),
            data: {
                r.skip(1)?;
                r.rest().to_vec()
            },
        }),
        OFPT_FLOW_REMOVED => MessageKind::FlowRemoved(decode_flow_removed(&mut r)?),
        OFPT_PORT_STATUS => {
            let reason = PortReason::from_u8(r.u8()?);
            r.skip(7)?;
            MessageKind::PortStatus(PortStatus {
                reason,
                desc: decode_phy_port(&mut r)?,
            })
        }
        OFPT_PACKET_OUT => {
            let buffer_id = r.u32()?;
            let in_port = r.u16()?;
            let actions_len = r.u16()? as usize;
            let actions = parse_actions(r.bytes(actions_len)?)?;
            MessageKind::PacketOut(PacketOut {
                buffer_id,
                in_port,
                actions,
                data: r.rest().to_vec(),
            })
        }
        OFPT_FLOW_MOD => MessageKind::FlowMod(FlowMod {
            criteria: FlowMatch::parse(&mut r)?,
            cookie: r.u64()?,
            command: r.u16()?,
            idle_timeout: r.u16()?,
            hard_timeout: r.u16()?,
            priority: r.u16()?,
            buffer_id: r.u32()?,
            out_port: r.u16()?,
            flags: r.u16()?,
            actions: parse_actions(r.rest())?,
        }),
        OFPT_STATS_REQUEST => {
            let stats_type = r.u16()?;
            let _flags = r.u16()?;
            MessageKind::StatsRequest(match stats_type {
                OFPST_DESC => StatsRequest::Desc,
                OFPST_FLOW => {
                    let criteria = FlowMatch::parse(&mut r)?;
                    let table_id = r.u8()?;
                    r.skip(1)?;
                    StatsRequest::Flow(FlowStatsRequest {
                        criteria,
                        table_id,
                        out_port: r.u16()?,
                    })
                }
                stats_type => StatsRequest::Other {
                    stats_type,
                    body: r.rest().to_vec(),
                },
            })
        }
        OFPT_STATS_REPLY => {
            let stats_type = r.u16()?;
            let flags = r.u16()?;
            let body = match stats_type {
                OFPST_DESC => StatsBody::Desc(DescStats {
                    mfr_desc: r.fixed_str(DESC_STR_LEN)?,
                    hw_desc: r.fixed_str(DESC_STR_LEN)?,
                    sw_desc: r.fixed_str(DESC_STR_LEN)?,
                    serial_num: r.fixed_str(SERIAL_NUM_LEN)?,
                    dp_desc: r.fixed_str(DESC_STR_LEN)?,
                }),
                OFPST_FLOW => StatsBody::Flow(decode_flow_stats(&mut r)?),
                stats_type => StatsBody::Other {
                    stats_type,
                    body: r.rest().to_vec(),
                },
            };
            MessageKind::StatsReply(StatsReply { flags, body })
        }
        OFPT_BARRIER_REQUEST => MessageKind::BarrierRequest,
        OFPT_BARRIER_REPLY => MessageKind::BarrierReply,
        msg_type => MessageKind::Unsupported {
            msg_type,
            body: body.to_vec(),
        },
    })
}

fn decode_config(r: &mut Reader<'_>) -> Result<SwitchConfig, WireError> {
    Ok(SwitchConfig {
        flags: r.u16()?,
        miss_send_len: r.u16()?,
    })
}

fn decode_phy_port(r: &mut Reader<'_>) -> Result<PhyPort, WireError> {
    Ok(PhyPort {
        port_no: r.u16()?,
        hw_addr: MacAddr(r.mac()?),
        name: r.fixed_str(PORT_NAME_LEN)?,
        config: r.u32()?,
        state: r.u32()?,
        curr: r.u32()?,
        advertised: r.u32()?,
        supported: r.u32()?,
        peer: r.u32()?,
    })
}

fn decode_features(r: &mut Reader<'_>) -> Result<SwitchFeatures, WireError> {
    let datapath_id = r.u64()?;
    let n_buffers = r.u32()?;
    let n_tables = r.u8()?;
    r.skip(3)?;
    let capabilities = r.u32()?;
    let actions = r.u32()?;

    if r.remaining() % PHY_PORT_LEN != 0 {
        return Err(WireError::malformed(
            "features reply",
            format!("{} trailing bytes is not a whole port list", r.remaining()),
        ));
    }
    let mut ports = Vec::with_capacity(r.remaining() / PHY_PORT_LEN);
    while r.remaining() > 0 {
        ports.push(decode_phy_port(r)?);
    }

    Ok(SwitchFeatures {
        datapath_id,
        n_buffers,
        n_tables,
        capabilities,
        actions,
        ports,
    })
}

fn decode_flow_removed(r: &mut Reader<'_>) -> Result<FlowRemoved, WireError> {
    let criteria = FlowMatch::parse(r)?;
    let cookie = r.u64()?;
    let priority = r.u16()?;
    let reason = FlowRemovedReason::from_u8(r.u8()?);
    r.skip(1)?;
    let duration_sec = r.u32()?;
    let duration_nsec = r.u32()?;
    let idle_timeout = r.u16()?;
    r.skip(2)?;
    Ok(FlowRemoved {
        criteria,
        cookie,
        priority,
        reason,
        duration_sec,
        duration_nsec,
        idle_timeout,
        packet_count: r.u64()?,
        byte_count: r.u64()?,
    })
}

fn decode_flow_stats(r: &mut Reader<'_>) -> Result<Vec<FlowStatsEntry>, WireError> {
    let mut entries = Vec::new();
    while r.remaining() > 0 {
        let length = r.u16()? as usize;
        if length < FLOW_STATS_FIXED_LEN {
            return Err(WireError::malformed(
                "flow stats",
                format!("entry length {} below minimum {}", length, FLOW_STATS_FIXED_LEN),
            ));
        }
        let table_id = r.u8()?;
        r.skip(1)?;
        let criteria = FlowMatch::parse(r)?;
        let duration_sec = r.u32()?;
        let duration_nsec = r.u32()?;
        let priority = r.u16()?;
        let idle_timeout = r.u16()?;
        let hard_timeout = r.u16()?;
        r.skip(6)?;
        let cookie = r.u64()?;
        let packet_count = r.u64()?;
        let byte_count = r.u64()?;
        let actions = parse_actions(r.bytes(length - FLOW_STATS_FIXED_LEN)?)?;
        entries.push(FlowStatsEntry {
            table_id,
            criteria,
            duration_sec,
            duration_nsec,
            priority,
            idle_timeout,
            hard_timeout,
            cookie,
            packet_count,
            byte_count,
            actions,
        });
    }
    Ok(entries)
}

// ============================================================================
// Encoding
// ============================================================================

fn encode_body(kind: &MessageKind, out: &mut Vec<u8>) {
    match kind {
        MessageKind::Hello
        | MessageKind::FeaturesRequest
        | MessageKind::GetConfigRequest
        | MessageKind::BarrierRequest
        | MessageKind::BarrierReply => {}
        MessageKind::Error {
            err_type,
            code,
            data,
        } => {
            put_u16(out, *err_type);
            put_u16(out, *code);
            out.extend_from_slice(data);
        }
        MessageKind::EchoRequest(data) | MessageKind::EchoReply(data) => {
            out.extend_from_slice(data)
        }
        MessageKind::FeaturesReply(features) => {
            put_u64(out, features.datapath_id);
            put_u32(out, features.n_buffers);
            out.push(features.n_tables);
            put_pad(out, 3);
            put_u32(out, features.capabilities);
            put_u32(out, features.actions);
            for port in &features.ports {
                encode_phy_port(port, out);
            }
        }
        MessageKind::GetConfigReply(config) | MessageKind::SetConfig(config) => {
            put_u16(out, config.flags);
            put_u16(out, config.miss_send_len);
        }
        MessageKind::PacketIn(packet) => {
            put_u32(out, packet.buffer_id);
            put_u16(out, packet.total_len);
            put_u16(out, packet.in_port);
            out.push(packet.reason.to_u8());
            put_pad(out, 1);
            out.extend_from_slice(&packet.data);
        }
        MessageKind::FlowRemoved(removed) => {
            removed.criteria.emit(out);
            put_u64(out, removed.cookie);
            put_u16(out, removed.priority);
            out.push(removed.reason.to_u8());
            put_pad(out, 1);
            put_u32(out, removed.duration_sec);
            put_u32(out, removed.duration_nsec);
            put_u16(out, removed.idle_timeout);
            put_pad(out, 2);
            put_u64(out, removed.packet_count);
            put_u64(out, removed.byte_count);
        }
        MessageKind::PortStatus(status) => {
            out.push(status.reason.to_u8());
            put_pad(out, 7);
            encode_phy_port(&status.desc, out);
        }
        MessageKind::PacketOut(packet) => {
            put_u32(out, packet.buffer_id);
            put_u16(out, packet.in_port);
            put_u16(out, actions_len(&packet.actions) as u16);
            emit_actions(&packet.actions, out);
            out.extend_from_slice(&packet.data);
        }
        MessageKind::FlowMod(flow_mod) => {
            flow_mod.criteria.emit(out);
            put_u64(out, flow_mod.cookie);
            put_u16(out, flow_mod.command);
            put_u16(out, flow_mod.idle_timeout);
            put_u16(out, flow_mod.hard_timeout);
            put_u16(out, flow_mod.priority);
            put_u32(out, flow_mod.buffer_id);
            put_u16(out, flow_mod.out_port);
            put_u16(out, flow_mod.flags);
            emit_actions(&flow_mod.actions, out);
        }
        MessageKind::StatsRequest(request) => match request {
            StatsRequest::Desc => {
                put_u16(out, OFPST_DESC);
                put_u16(out, 0);
            }
            StatsRequest::Flow(flow) => {
                put_u16(out, OFPST_FLOW);
                put_u16(out, 0);
                flow.criteria.emit(out);
                out.push(flow.table_id);
                put_pad(out, 1);
                put_u16(out, flow.out_port);
            }
            StatsRequest::Other { stats_type, body } => {
                put_u16(out, *stats_type);
                put_u16(out, 0);
                out.extend_from_slice(body);
            }
        },
        MessageKind::StatsReply(reply) => match &reply.body {
            StatsBody::Desc(desc) => {
                put_u16(out, OFPST_DESC);
                put_u16(out, reply.flags);
                put_fixed_str(out, &desc.mfr_desc, DESC_STR_LEN);
                put_fixed_str(out, &desc.hw_desc, DESC_STR_LEN);
                put_fixed_str(out, &desc.sw_desc, DESC_STR_LEN);
                put_fixed_str(out, &desc.serial_num, SERIAL_NUM_LEN);
                put_fixed_str(out, &desc.dp_desc, DESC_STR_LEN);
            }
            StatsBody::Flow(entries) => {
                put_u16(out, OFPST_FLOW);
                put_u16(out, reply.flags);
                for entry in entries {
                    encode_flow_stats(entry, out);
                }
            }
            StatsBody::Other { stats_type, body } => {
                put_u16(out, *stats_type);
                put_u16(out, reply.flags);
                out.extend_from_slice(body);
            }
        },
        MessageKind::Unsupported { body, .. } => out.extend_from_slice(body),
    }
}

fn encode_phy_port(port: &PhyPort, out: &mut Vec<u8>) {
    put_u16(out, port.port_no);
    out.extend_from_slice(&port.hw_addr.0);
    put_fixed_str(out, &port.name, PORT_NAME_LEN);
    put_u32(out, port.config);
    put_u32(out, port.state);
    put_u32(out, port.curr);
    put_u32(out, port.advertised);
    put_u32(out, port.supported);
    put_u32(out, port.peer);
}

fn encode_flow_stats(entry: &FlowStatsEntry, out: &mut Vec<u8>) {
    put_u16(out, (FLOW_STATS_FIXED_LEN + actions_len(&entry.actions)) as u16);
    out.push(entry.table_id);
    put_pad(out, 1);
    entry.criteria.emit(out);
    put_u32(out, entry.duration_sec);
    put_u32(out, entry.duration_nsec);
    put_u16(out, entry.priority);
    put_u16(out, entry.idle_timeout);
    put_u16(out, entry.hard_timeout);
    put_pad(out, 6);
    put_u64(out, entry.cookie);
    put_u64(out, entry.packet_count);
    put_u64(out, entry.byte_count);
    emit_actions(&entry.actions, out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowAction, OFPP_NONE};

    fn codec() -> OpenFlow10Codec {
        OpenFlow10Codec
    }

    #[test]
    fn test_barrier_request_frame_is_header_only() {
        let frame = codec()
            .encode(&Message::new(42, MessageKind::BarrierRequest))
            .unwrap();
        assert_eq!(frame, vec![0x01, OFPT_BARRIER_REQUEST, 0, 8, 0, 0, 0, 42]);
    }

    #[test]
    fn test_flow_mod_length() {
        let flow_mod = FlowMod::add(
            FlowMatch::dl_dst("00:00:00:00:00:01".parse().unwrap()),
            vec![FlowAction::output(2)],
            9,
            100,
        );
        let frame = codec()
            .encode(&Message::new(1, MessageKind::FlowMod(flow_mod.clone())))
            .unwrap();
        assert_eq!(frame.len(), 72 + 8);
        let decoded = codec().decode(&frame).unwrap();
        assert_eq!(decoded.kind, MessageKind::FlowMod(flow_mod));
    }

    #[test]
    fn test_packet_in_decoding() {
        let mut frame = vec![0x01, OFPT_PACKET_IN, 0, 22, 0, 0, 0, 5];
        frame.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]); // buffer id
        frame.extend_from_slice(&[0x00, 0x04]); // total len
        frame.extend_from_slice(&[0x00, 0x03]); // in port
        frame.extend_from_slice(&[0x00, 0x00]); // reason + pad
        frame.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        let msg = codec().decode(&frame).unwrap();
        assert_eq!(msg.xid, 5);
        match msg.kind {
            MessageKind::PacketIn(packet) => {
                assert_eq!(packet.buffer_id, NO_BUFFER);
                assert_eq!(packet.in_port, 3);
                assert_eq!(packet.reason, PacketInReason::NoMatch);
                assert_eq!(packet.data, vec![0xde, 0xad, 0xbe, 0xef]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_flow_stats_reply_multiple_entries() {
        let entry = |cookie| FlowStatsEntry {
            table_id: 0,
            criteria: FlowMatch::dl_dst("00:00:00:00:00:02".parse().unwrap()),
            duration_sec: 10,
            duration_nsec: 0,
            priority: 10,
            idle_timeout: 0,
            hard_timeout: 0,
            cookie,
            packet_count: 3,
            byte_count: 180,
            actions: vec![FlowAction::output(1)],
        };
        let reply = StatsReply {
            flags: OFPSF_REPLY_MORE,
            body: StatsBody::Flow(vec![entry(1), entry(2)]),
        };
        let frame = codec()
            .encode(&Message::new(3, MessageKind::StatsReply(reply.clone())))
            .unwrap();
        assert_eq!(frame.len(), 8 + 4 + 2 * (88 + 8));
        assert_eq!(
            codec().decode(&frame).unwrap().kind,
            MessageKind::StatsReply(reply)
        );
    }

    #[test]
    fn test_features_reply_ports() {
        let features = SwitchFeatures {
            datapath_id: 0x0000_0000_0000_00ab,
            n_buffers: 256,
            n_tables: 2,
            capabilities: 0xc7,
            actions: 0xfff,
            ports: vec![PhyPort {
                port_no: 1,
                hw_addr: "02:00:00:00:00:01".parse().unwrap(),
                name: "eth1".to_string(),
                config: 0,
                state: 0,
                curr: 0,
                advertised: 0,
                supported: 0,
                peer: 0,
            }],
        };
        let frame = codec()
            .encode(&Message::new(
                8,
                MessageKind::FeaturesReply(features.clone()),
            ))
            .unwrap();
        assert_eq!(frame.len(), 32 + 48);
        assert_eq!(
            codec().decode(&frame).unwrap().kind,
            MessageKind::FeaturesReply(features)
        );
    }

    #[test]
    fn test_unknown_type_is_unsupported() {
        let frame = vec![0x01, OFPT_VENDOR, 0, 12, 0, 0, 0, 1, 0, 0, 0x23, 0x20];
        let msg = codec().decode(&frame).unwrap();
        assert!(matches!(
            msg.kind,
            MessageKind::Unsupported {
                msg_type: OFPT_VENDOR,
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_wrong_version() {
        let frame = vec![0x04, OFPT_BARRIER_REPLY, 0, 8, 0, 0, 0, 1];
        assert_eq!(codec().decode(&frame), Err(WireError::BadVersion(0x04)));
        // but HELLO from a newer switch still decodes
        let hello = vec![0x04, OFPT_HELLO, 0, 8, 0, 0, 0, 1];
        assert_eq!(codec().decode(&hello).unwrap().kind, MessageKind::Hello);
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let frame = vec![0x01, OFPT_ECHO_REQUEST, 0, 12, 0, 0, 0, 1, 0];
        assert!(matches!(
            codec().decode(&frame),
            Err(WireError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_packet_out_encoding() {
        let out = PacketOut::to_ports(vec![0xaa; 14], [1u16]);
        let frame = codec()
            .encode(&Message::new(2, MessageKind::PacketOut(out)))
            .unwrap();
        assert_eq!(frame.len(), 8 + 8 + 8 + 14);
        // in_port
        assert_eq!(&frame[12..14], &OFPP_NONE.to_be_bytes());
        // actions_len
        assert_eq!(&frame[14..16], &[0, 8]);
    }
}
