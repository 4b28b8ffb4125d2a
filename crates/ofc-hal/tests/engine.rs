//! Connection engine against a fake switch on loopback

mod common;

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{connected, engine, loopback_listener, test_config, FakeSwitch, STEP};
use ofc_core::ControllerConfig;
use ofc_hal::{ConnectionStatus, MessageListener, PacketFilter, Transaction, TransactionWaiter};
use ofc_wire::message::NO_BUFFER;
use ofc_wire::{
    EthernetFrame, FlowAction, FlowMatch, FlowMod, Message, MessageKind, PacketIn,
    PacketInReason, PacketOut, PhyPort, PortReason, PortStatus,
};

struct Recorder(Mutex<Vec<Message>>);

impl MessageListener for Recorder {
    fn on_message(&self, message: &Message) {
        self.0.lock().unwrap().push(message.clone());
    }
}

fn port_status(port_no: u16) -> Message {
    Message::new(
        0,
        MessageKind::PortStatus(PortStatus {
            reason: PortReason::Add,
            desc: PhyPort {
                port_no,
                hw_addr: Default::default(),
                name: format!("eth{}", port_no),
                config: 0,
                state: 0,
                curr: 0,
                advertised: 0,
                supported: 0,
                peer: 0,
            },
        }),
    )
}

fn flow_mod() -> MessageKind {
    MessageKind::FlowMod(FlowMod::add(
        FlowMatch::dl_dst("00:00:00:00:00:01".parse().unwrap()),
        vec![FlowAction::output(1)],
        1,
        100,
    ))
}

fn switch_error(xid: u32) -> Message {
    Message::new(
        xid,
        MessageKind::Error {
            err_type: 3,
            code: 0,
            data: Vec::new(),
        },
    )
}

/// Queue acknowledged PACKET_OUTs until a send has to wait for room
async fn fill_pending_queue(engine: &ofc_hal::ConnectionEngine) -> Vec<TransactionWaiter> {
    let payload = vec![0u8; 60_000];
    let mut waiters = Vec::new();
    for _ in 0..4000 {
        let kind = MessageKind::PacketOut(PacketOut::to_ports(payload.clone(), [1]));
        match tokio::time::timeout(Duration::from_millis(500), engine.request(kind)).await {
            Ok(waiter) => waiters.push(waiter.unwrap()),
            Err(_) => return waiters,
        }
    }
    panic!("send never waited on a full pending queue");
}

async fn wait_for_status(engine: &ofc_hal::ConnectionEngine, want: ConnectionStatus) {
    let mut status = engine.status();
    tokio::time::timeout(STEP, status.wait_for(|s| *s == want))
        .await
        .expect("status change timed out")
        .unwrap();
}

#[tokio::test]
async fn test_handshake_then_initial_queries() {
    let (engine, _pipeline) = engine(test_config());
    let mut switch = connected(&engine).await;

    assert!(engine.is_ready());
    assert_eq!(engine.current_status(), ConnectionStatus::Connected);

    let features = switch.recv().await;
    assert_eq!(features.kind, MessageKind::FeaturesRequest);
    assert_eq!(switch.recv().await.kind, MessageKind::GetConfigRequest);
    assert!(matches!(switch.recv().await.kind, MessageKind::StatsRequest(_)));

    engine.shutdown().await;
    assert!(!engine.is_ready());
    assert_eq!(engine.current_status(), ConnectionStatus::Idle);
}

#[tokio::test]
async fn test_messages_during_handshake_are_kept_in_order() {
    let (engine, _pipeline) = engine(test_config());
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    engine.add_listener(recorder.clone());

    let (listener, addr) = loopback_listener().await;
    let starter = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start_with_listener(listener, &[]).await })
    };
    let mut switch = FakeSwitch::connect(addr).await;
    switch
        .handshake_with(vec![port_status(1), port_status(2)])
        .await;
    starter.await.unwrap().unwrap();

    switch.send(port_status(3)).await;
    for _ in 0..100 {
        if recorder.0.lock().unwrap().len() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let ports: Vec<u16> = recorder
        .0
        .lock()
        .unwrap()
        .iter()
        .filter_map(|m| match &m.kind {
            MessageKind::PortStatus(status) => Some(status.desc.port_no),
            _ => None,
        })
        .collect();
    assert_eq!(ports, vec![1, 2, 3]);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_request_gets_matching_reply() {
    let (engine, _pipeline) = engine(test_config());
    let mut switch = connected(&engine).await;

    let waiter = engine
        .request(MessageKind::EchoRequest(b"ping".to_vec()))
        .await
        .unwrap();
    let request = switch
        .recv_matching(|m| matches!(m.kind, MessageKind::EchoRequest(_)))
        .await;
    assert_eq!(request.xid, waiter.xid());
    switch
        .send(Message::new(request.xid, MessageKind::EchoReply(b"ping".to_vec())))
        .await;

    let result = tokio::time::timeout(STEP, waiter.wait()).await.unwrap();
    assert!(result.success);
    assert_eq!(
        result.reply.map(|m| m.kind),
        Some(MessageKind::EchoReply(b"ping".to_vec()))
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn test_maintenance_barrier_completes_side_effect_requests() {
    let (engine, _pipeline) = engine(test_config());
    let mut switch = connected(&engine).await;

    let first = engine.request(flow_mod()).await.unwrap();
    let second = engine.request(flow_mod()).await.unwrap();

    // a barrier may be injected between the two requests; answer them all
    loop {
        let barrier = switch
            .recv_matching(|m| m.kind == MessageKind::BarrierRequest)
            .await;
        switch
            .send(Message::new(barrier.xid, MessageKind::BarrierReply))
            .await;
        if barrier.xid > second.xid() {
            break;
        }
    }

    for waiter in [first, second] {
        let result = tokio::time::timeout(STEP, waiter.wait()).await.unwrap();
        assert!(result.success);
        assert!(result.reply.is_none());
    }
    assert_eq!(engine.waiting_count(), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_error_reply_fails_transaction() {
    let (engine, _pipeline) = engine(test_config());
    let mut switch = connected(&engine).await;

    let waiter = engine.request(flow_mod()).await.unwrap();
    let sent = switch
        .recv_matching(|m| matches!(m.kind, MessageKind::FlowMod(_)))
        .await;
    switch.send(switch_error(sent.xid)).await;

    let result = tokio::time::timeout(STEP, waiter.wait()).await.unwrap();
    assert!(!result.success);
    assert!(result.reply.unwrap().is_error());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_barrier_does_not_ack_request_written_after_it() {
    let (engine, _pipeline) = engine(test_config());
    let mut switch = connected(&engine).await;

    // xid taken before the barrier's, but queued behind it
    let xid = engine.context().reserve_xid();
    let (flow, waiter) = Transaction::blocking(xid, flow_mod(), engine.codec()).unwrap();
    let fence = engine.request(MessageKind::BarrierRequest).await.unwrap();
    engine.send(flow).await.unwrap();

    let barrier = switch.recv_matching(|m| m.xid == fence.xid()).await;
    let sent = switch
        .recv_matching(|m| matches!(m.kind, MessageKind::FlowMod(_)))
        .await;
    assert!(sent.xid < barrier.xid);

    switch
        .send(Message::new(barrier.xid, MessageKind::BarrierReply))
        .await;
    switch.send(switch_error(sent.xid)).await;

    assert!(tokio::time::timeout(STEP, fence.wait()).await.unwrap().success);
    let result = tokio::time::timeout(STEP, waiter.wait()).await.unwrap();
    assert!(!result.success);
    assert!(result.reply.unwrap().is_error());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_full_pending_queue_blocks_and_shutdown_fails_queued() {
    let config = ControllerConfig {
        pending_queue_capacity: 2,
        ..test_config()
    };
    let (engine, _pipeline) = engine(config);
    // never read from again: the socket fills, then the queue
    let switch = connected(&engine).await;

    let waiters = fill_pending_queue(&engine).await;
    assert_eq!(engine.current_status(), ConnectionStatus::Connected);

    let late = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.request(flow_mod()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!late.is_finished());

    tokio::time::timeout(STEP, engine.shutdown())
        .await
        .expect("shutdown stalled behind a full socket");
    for waiter in waiters {
        let result = tokio::time::timeout(STEP, waiter.wait()).await.unwrap();
        assert!(!result.success);
        assert!(result.reply.is_none());
    }
    let late = tokio::time::timeout(STEP, late).await.unwrap().unwrap();
    assert!(matches!(late, Err(ofc_core::Error::Disconnected)));
    drop(switch);
}

#[tokio::test]
async fn test_broken_session_fails_queued_transactions() {
    let config = ControllerConfig {
        pending_queue_capacity: 2,
        ..test_config()
    };
    let (engine, _pipeline) = engine(config);
    let switch = connected(&engine).await;
    let waiters = fill_pending_queue(&engine).await;

    // unread data on close resets the connection under the blocked write
    drop(switch);
    wait_for_status(&engine, ConnectionStatus::Disconnected).await;
    assert!(!engine.is_ready());
    for waiter in waiters {
        let result = tokio::time::timeout(STEP, waiter.wait()).await.unwrap();
        assert!(!result.success);
        assert!(result.reply.is_none());
    }
    // refused outright, or failed by the drain if it slipped in first
    match tokio::time::timeout(STEP, engine.request(flow_mod())).await.unwrap() {
        Ok(waiter) => {
            let result = tokio::time::timeout(STEP, waiter.wait()).await.unwrap();
            assert!(!result.success);
        }
        Err(e) => assert!(matches!(e, ofc_core::Error::Disconnected)),
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_fails_waiting_transaction() {
    let (engine, _pipeline) = engine(test_config());
    let mut switch = connected(&engine).await;

    let waiter = engine.request(MessageKind::FeaturesRequest).await.unwrap();
    let xid = waiter.xid();
    switch.recv_matching(|m| m.xid == xid).await;

    engine.shutdown().await;
    let result = tokio::time::timeout(STEP, waiter.wait()).await.unwrap();
    assert!(!result.success);
    assert!(result.reply.is_none());

    // idempotent
    engine.shutdown().await;
    assert!(switch.closed().await);
}

#[tokio::test]
async fn test_shutdown_before_start_is_noop() {
    let (engine, _pipeline) = engine(test_config());
    engine.shutdown().await;
    assert_eq!(engine.current_status(), ConnectionStatus::Idle);
    assert!(matches!(
        engine.send_message(MessageKind::BarrierRequest).await,
        Err(ofc_core::Error::Disconnected)
    ));
}

#[tokio::test]
async fn test_switch_echo_is_answered() {
    let (engine, _pipeline) = engine(test_config());
    let mut switch = connected(&engine).await;

    switch
        .send(Message::new(4242, MessageKind::EchoRequest(vec![1, 2, 3])))
        .await;
    let reply = switch
        .recv_matching(|m| matches!(m.kind, MessageKind::EchoReply(_)))
        .await;
    assert_eq!(reply.xid, 4242);
    assert_eq!(reply.kind, MessageKind::EchoReply(vec![1, 2, 3]));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_switch_disconnect_breaks_session() {
    let (engine, _pipeline) = engine(test_config());
    let switch = connected(&engine).await;

    let waiter = engine.request(MessageKind::FeaturesRequest).await.unwrap();
    drop(switch);

    wait_for_status(&engine, ConnectionStatus::Disconnected).await;
    assert!(!engine.is_ready());
    let result = tokio::time::timeout(STEP, waiter.wait()).await.unwrap();
    assert!(!result.success);

    engine.shutdown().await;
    assert_eq!(engine.current_status(), ConnectionStatus::Idle);
}

#[tokio::test]
async fn test_unframeable_header_breaks_session() {
    let (engine, _pipeline) = engine(test_config());
    let mut switch = connected(&engine).await;

    switch.send_raw(&[0x01, 0x02, 0x00, 0x04, 0, 0, 0, 1]).await;
    wait_for_status(&engine, ConnectionStatus::Disconnected).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn test_undecodable_body_is_dropped() {
    let (engine, _pipeline) = engine(test_config());
    let mut switch = connected(&engine).await;

    // FEATURES_REPLY with a truncated body
    switch.send_raw(&[0x01, 6, 0x00, 0x0c, 0, 0, 0, 9, 0, 0, 0, 0]).await;
    switch
        .send(Message::new(77, MessageKind::EchoRequest(Vec::new())))
        .await;
    let reply = switch
        .recv_matching(|m| matches!(m.kind, MessageKind::EchoReply(_)))
        .await;
    assert_eq!(reply.xid, 77);
    assert_eq!(engine.current_status(), ConnectionStatus::Connected);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_remote_outside_allow_list_is_rejected() {
    let (engine, _pipeline) = engine(test_config());
    let (listener, addr) = loopback_listener().await;
    let allowed: Vec<IpAddr> = vec!["192.0.2.1".parse().unwrap()];
    let starter = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start_with_listener(listener, &allowed).await })
    };

    let mut switch = FakeSwitch::connect(addr).await;
    assert!(switch.closed().await);
    assert!(!engine.is_ready());
    starter.abort();
}

struct Claim {
    seen: Mutex<Vec<u16>>,
}

#[async_trait]
impl PacketFilter for Claim {
    fn name(&self) -> &str {
        "claim"
    }

    async fn handle(&self, packet: &PacketIn, frame: &EthernetFrame) -> bool {
        assert!(frame.dst.is_broadcast());
        self.seen.lock().unwrap().push(packet.in_port);
        true
    }
}

#[tokio::test]
async fn test_packet_in_reaches_filter() {
    let (engine, pipeline) = engine(test_config());
    let filter = Arc::new(Claim {
        seen: Mutex::new(Vec::new()),
    });
    pipeline.register(filter.clone(), 1);
    pipeline.start(2);
    let mut switch = connected(&engine).await;

    let mut data = vec![0xff; 6];
    data.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x09]);
    data.extend_from_slice(&[0x08, 0x06]);
    data.extend_from_slice(&[0u8; 28]);
    switch
        .send(Message::new(
            0,
            MessageKind::PacketIn(PacketIn {
                buffer_id: NO_BUFFER,
                total_len: data.len() as u16,
                in_port: 7,
                reason: PacketInReason::NoMatch,
                data,
            }),
        ))
        .await;

    for _ in 0..100 {
        if !filter.seen.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*filter.seen.lock().unwrap(), vec![7]);
    engine.shutdown().await;
    pipeline.stop().await;
}
