//! In-process fake switch speaking just enough OpenFlow 1.0 for the tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ofc_core::{ControllerConfig, ControllerContext};
use ofc_hal::framing::read_frame;
use ofc_hal::{ConnectionEngine, PacketInPipeline};
use ofc_wire::{Codec, Message, MessageKind, OpenFlow10Codec};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

pub const STEP: Duration = Duration::from_secs(5);

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        maintenance_interval: Duration::from_millis(50),
        handshake_timeout: Duration::from_secs(2),
        ..ControllerConfig::default()
    }
}

pub fn engine(config: ControllerConfig) -> (Arc<ConnectionEngine>, Arc<PacketInPipeline>) {
    let pipeline = Arc::new(PacketInPipeline::new(config.packet_in_queue_capacity));
    let engine = Arc::new(ConnectionEngine::new(
        config,
        Arc::new(ControllerContext::new()),
        Arc::new(OpenFlow10Codec),
        pipeline.clone(),
    ));
    (engine, pipeline)
}

pub async fn loopback_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

pub struct FakeSwitch {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    codec: OpenFlow10Codec,
}

impl FakeSwitch {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            reader,
            writer,
            codec: OpenFlow10Codec,
        }
    }

    pub async fn send(&mut self, message: Message) {
        let frame = self.codec.encode(&message).unwrap();
        self.writer.write_all(&frame).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    pub async fn recv(&mut self) -> Message {
        let frame = tokio::time::timeout(STEP, read_frame(&mut self.reader))
            .await
            .expect("switch read timed out")
            .unwrap()
            .expect("controller closed the connection");
        self.codec.decode(&frame).unwrap()
    }

    /// Next message matching `pred`, skipping everything else
    pub async fn recv_matching(&mut self, pred: impl Fn(&Message) -> bool) -> Message {
        loop {
            let msg = self.recv().await;
            if pred(&msg) {
                return msg;
            }
        }
    }

    /// Returns true once the controller has closed its side
    pub async fn closed(&mut self) -> bool {
        loop {
            match tokio::time::timeout(STEP, read_frame(&mut self.reader)).await {
                Ok(Ok(Some(_))) => continue,
                Ok(Ok(None)) | Ok(Err(_)) => return true,
                Err(_) => return false,
            }
        }
    }

    /// Play the switch side of the handshake, sending `early` after our HELLO
    pub async fn handshake_with(&mut self, early: Vec<Message>) {
        let hello = self.recv().await;
        assert_eq!(hello.kind, MessageKind::Hello);
        self.send(Message::new(hello.xid, MessageKind::Hello)).await;
        for msg in early {
            self.send(msg).await;
        }

        let config = self.recv().await;
        assert!(matches!(config.kind, MessageKind::SetConfig(_)));

        let echo = self.recv().await;
        match echo.kind {
            MessageKind::EchoRequest(data) => {
                self.send(Message::new(echo.xid, MessageKind::EchoReply(data)))
                    .await
            }
            other => panic!("expected ECHO_REQUEST, got {:?}", other),
        }
    }

    pub async fn handshake(&mut self) {
        self.handshake_with(Vec::new()).await
    }
}

/// Start `engine` against a freshly connected fake switch
pub async fn connected(engine: &Arc<ConnectionEngine>) -> FakeSwitch {
    let (listener, addr) = loopback_listener().await;
    let starter = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start_with_listener(listener, &[]).await })
    };
    let mut switch = FakeSwitch::connect(addr).await;
    switch.handshake().await;
    starter.await.unwrap().unwrap();
    switch
}
