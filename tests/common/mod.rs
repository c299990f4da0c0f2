// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! An in-process voice server: a websocket listener playing the voice
//! gateway's role and a UDP socket playing the media server's role. Tests
//! drive both ends by hand.

// Not every test binary exercises every helper
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, Once,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    net::{TcpListener, UdpSocket},
    sync::mpsc,
    time::{timeout, Instant},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use descant::adapter::PayloadSenderAdapter;
use descant::connection::{
    ConnectionState, StateChange, VoiceChannelCoordinates, VoiceConnection,
    VoiceConnectionOptions,
};
use descant::types::{Snowflake, VoiceServerUpdate, VoiceStateUpdate};

pub const GUILD: Snowflake = Snowflake(101);
pub const USER: Snowflake = Snowflake(202);
pub const CHANNEL: Snowflake = Snowflake(303);

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

static LOGGER: Once = Once::new();

#[allow(dead_code)]
pub fn init_logging() {
    LOGGER.call_once(|| {
        simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Debug)
            .init()
            .ok();
    });
}

/// What the websocket side of the mock server observed from the client.
#[derive(Debug)]
pub enum MockInbound {
    Payload(Value),
    Closed(Option<u16>),
}

/// One accepted websocket connection, driven by the test.
pub struct MockGatewayConnection {
    inbound: mpsc::Receiver<MockInbound>,
    outbound: mpsc::Sender<Message>,
}

#[allow(dead_code)]
impl MockGatewayConnection {
    pub async fn send_op(&self, op: u8, data: Value) {
        let payload = json!({ "op": op, "d": data }).to_string();
        self.outbound.send(Message::Text(payload)).await.unwrap();
    }

    pub async fn send_hello(&self, heartbeat_interval_ms: f64) {
        self.send_op(8, json!({ "heartbeat_interval": heartbeat_interval_ms }))
            .await;
    }

    pub async fn send_ready(&self, ssrc: u32, ip: &str, port: u16, modes: &[&str]) {
        self.send_op(
            2,
            json!({ "ssrc": ssrc, "ip": ip, "port": port, "modes": modes }),
        )
        .await;
    }

    pub async fn send_session_description(&self, mode: &str, secret_key: [u8; 32]) {
        self.send_op(
            4,
            json!({ "mode": mode, "secret_key": secret_key.to_vec() }),
        )
        .await;
    }

    pub async fn send_resumed(&self) {
        self.send_op(9, Value::Null).await;
    }

    pub async fn close_with(&self, code: u16) {
        use tokio_tungstenite::tungstenite::protocol::{
            frame::coding::CloseCode, CloseFrame,
        };

        self.outbound
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            })))
            .await
            .unwrap();
    }

    /// The next payload with the wanted opcode; heartbeats in between are
    /// skipped (and acked by the reader task if auto-ack is on).
    pub async fn expect_op(&mut self, op: u8) -> Value {
        loop {
            let received = timeout(RECV_TIMEOUT, self.inbound.recv())
                .await
                .expect("timed out waiting for a gateway payload")
                .expect("gateway connection ended while waiting for a payload");

            match received {
                MockInbound::Payload(payload) => {
                    let received_op = payload["op"].as_u64().unwrap() as u8;

                    if received_op == op {
                        return payload;
                    }

                    // Heartbeats tick on their own schedule; everything else
                    // out of order is a test failure
                    assert_eq!(
                        received_op, 3,
                        "expected opcode {}, got payload {}",
                        op, payload
                    );
                }
                MockInbound::Closed(code) => {
                    panic!(
                        "gateway closed with {:?} while waiting for opcode {}",
                        code, op
                    );
                }
            }
        }
    }

    /// Waits for the client to close the websocket, returning the close code.
    pub async fn expect_close(&mut self) -> Option<u16> {
        loop {
            let received = timeout(RECV_TIMEOUT, self.inbound.recv())
                .await
                .expect("timed out waiting for the gateway to close")
                .expect("gateway connection ended without a close frame");

            match received {
                MockInbound::Payload(payload) => {
                    let received_op = payload["op"].as_u64().unwrap() as u8;
                    assert_eq!(
                        received_op, 3,
                        "expected a close, got payload {}",
                        payload
                    );
                }
                MockInbound::Closed(code) => return code,
            }
        }
    }
}

/// The UDP half of the mock voice server.
pub struct MockUdpServer {
    pub addr: SocketAddr,
    /// Datagrams that are neither discovery nor keep-alive, with receive times
    pub packets: mpsc::Receiver<(Instant, Vec<u8>)>,
    respond_discovery: Arc<AtomicBool>,
    echo_keepalive: Arc<AtomicBool>,
    discovery_result: Arc<StdMutex<(String, u16)>>,
}

#[allow(dead_code)]
impl MockUdpServer {
    pub fn set_respond_discovery(&self, respond: bool) {
        self.respond_discovery.store(respond, Ordering::SeqCst);
    }

    pub fn set_echo_keepalive(&self, echo: bool) {
        self.echo_keepalive.store(echo, Ordering::SeqCst);
    }

    /// What the next discovery reply will claim the client's external
    /// address is.
    pub fn set_discovery_result(&self, address: &str, port: u16) {
        *self.discovery_result.lock().unwrap() = (address.to_string(), port);
    }

    pub async fn expect_packet(&mut self) -> (Instant, Vec<u8>) {
        timeout(RECV_TIMEOUT, self.packets.recv())
            .await
            .expect("timed out waiting for a udp packet")
            .expect("udp server task ended")
    }
}

async fn udp_server_task(
    socket: UdpSocket,
    packets: mpsc::Sender<(Instant, Vec<u8>)>,
    respond_discovery: Arc<AtomicBool>,
    echo_keepalive: Arc<AtomicBool>,
    discovery_result: Arc<StdMutex<(String, u16)>>,
) {
    let mut buf = vec![0u8; 2048];

    loop {
        let Ok((size, peer)) = socket.recv_from(&mut buf).await else {
            break;
        };
        let datagram = &buf[0..size];

        // Ip discovery request: type 0x0001, length 70, 74 bytes total
        if size == 74 && datagram[0..2] == [0x00, 0x01] {
            if !respond_discovery.load(Ordering::SeqCst) {
                continue;
            }

            let (address, port) = discovery_result.lock().unwrap().clone();

            let mut reply = vec![0u8; 74];
            reply[0..2].copy_from_slice(&2u16.to_be_bytes());
            reply[2..4].copy_from_slice(&70u16.to_be_bytes());
            // Echo the ssrc back
            reply[4..8].copy_from_slice(&datagram[4..8]);
            reply[8..8 + address.len()].copy_from_slice(address.as_bytes());
            reply[72..74].copy_from_slice(&port.to_be_bytes());

            socket.send_to(&reply, peer).await.ok();
            continue;
        }

        // Keep-alive probe: echo it back verbatim
        if size == 8 {
            if echo_keepalive.load(Ordering::SeqCst) {
                socket.send_to(datagram, peer).await.ok();
            }
            continue;
        }

        if packets.send((Instant::now(), datagram.to_vec())).await.is_err() {
            break;
        }
    }
}

/// The full mock voice server: websocket endpoint plus media socket.
pub struct MockVoiceServer {
    /// Endpoint in the form `ws://127.0.0.1:port`, accepted verbatim by the
    /// voice gateway client
    pub endpoint: String,
    pub udp: MockUdpServer,
    connections: mpsc::Receiver<MockGatewayConnection>,
    auto_ack: Arc<AtomicBool>,
}

#[allow(dead_code)]
impl MockVoiceServer {
    pub async fn spawn() -> MockVoiceServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());

        let auto_ack = Arc::new(AtomicBool::new(true));
        let (connection_send, connections) = mpsc::channel(4);

        let accept_auto_ack = auto_ack.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(websocket) = accept_async(stream).await else {
                    continue;
                };

                let (mut ws_sink, mut ws_stream) = websocket.split();

                let (outbound_send, mut outbound_receive) = mpsc::channel::<Message>(64);
                let (inbound_send, inbound_receive) = mpsc::channel::<MockInbound>(256);

                // Writer: test -> client
                tokio::spawn(async move {
                    while let Some(message) = outbound_receive.recv().await {
                        if ws_sink.send(message).await.is_err() {
                            break;
                        }
                    }
                });

                // Reader: client -> test, acking heartbeats when told to
                let reader_auto_ack = accept_auto_ack.clone();
                let reader_outbound = outbound_send.clone();
                tokio::spawn(async move {
                    while let Some(Ok(message)) = ws_stream.next().await {
                        match message {
                            Message::Text(text) => {
                                let Ok(payload) = serde_json::from_str::<Value>(&text) else {
                                    continue;
                                };

                                if payload["op"] == 3 && reader_auto_ack.load(Ordering::SeqCst) {
                                    let ack =
                                        json!({ "op": 7, "d": payload["d"].clone() }).to_string();
                                    reader_outbound.send(Message::Text(ack)).await.ok();
                                }

                                if inbound_send
                                    .send(MockInbound::Payload(payload))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Message::Close(frame) => {
                                let code = frame.map(|frame| u16::from(frame.code));
                                inbound_send.send(MockInbound::Closed(code)).await.ok();
                                break;
                            }
                            _ => {}
                        }
                    }
                });

                if connection_send
                    .send(MockGatewayConnection {
                        inbound: inbound_receive,
                        outbound: outbound_send,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let udp_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_addr = udp_socket.local_addr().unwrap();

        let respond_discovery = Arc::new(AtomicBool::new(true));
        let echo_keepalive = Arc::new(AtomicBool::new(true));
        let discovery_result = Arc::new(StdMutex::new(("198.51.100.2".to_string(), 49152)));
        let (packet_send, packet_receive) = mpsc::channel(1024);

        tokio::spawn(udp_server_task(
            udp_socket,
            packet_send,
            respond_discovery.clone(),
            echo_keepalive.clone(),
            discovery_result.clone(),
        ));

        MockVoiceServer {
            endpoint,
            udp: MockUdpServer {
                addr: udp_addr,
                packets: packet_receive,
                respond_discovery,
                echo_keepalive,
                discovery_result,
            },
            connections,
            auto_ack,
        }
    }

    pub fn set_auto_ack_heartbeats(&self, auto_ack: bool) {
        self.auto_ack.store(auto_ack, Ordering::SeqCst);
    }

    pub async fn next_connection(&mut self) -> MockGatewayConnection {
        timeout(RECV_TIMEOUT, self.connections.recv())
            .await
            .expect("timed out waiting for a gateway connection")
            .expect("mock server accept loop ended")
    }
}

/// Forwards state changes into a channel, so tests can assert on the exact
/// transition sequence.
#[derive(Debug)]
pub struct StateRecorder {
    send: mpsc::Sender<StateChange>,
}

#[async_trait::async_trait]
impl pubserve::Subscriber<StateChange> for StateRecorder {
    async fn update(&self, data: &StateChange) {
        self.send.send(*data).await.ok();
    }
}

/// Everything a connection test needs in one place.
pub struct TestBundle {
    pub server: MockVoiceServer,
    pub adapter: Arc<PayloadSenderAdapter>,
    pub connection: Arc<VoiceConnection>,
    /// Serialized op 4 payloads the connection pushed at the main gateway
    pub op4_receive: mpsc::Receiver<String>,
    pub states: mpsc::Receiver<StateChange>,
}

#[allow(dead_code)]
impl TestBundle {
    pub async fn expect_op4(&mut self) -> Value {
        let payload = timeout(RECV_TIMEOUT, self.op4_receive.recv())
            .await
            .expect("timed out waiting for an op 4 payload")
            .expect("adapter channel closed");

        serde_json::from_str(&payload).unwrap()
    }

    pub fn no_pending_op4(&mut self) -> bool {
        self.op4_receive.try_recv().is_err()
    }

    /// Waits until the connection reports the wanted state.
    pub async fn await_state(&mut self, wanted: ConnectionState) {
        loop {
            let change = timeout(RECV_TIMEOUT, self.states.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for state {}", wanted))
                .expect("state channel closed");

            if change.new == wanted {
                return;
            }
        }
    }

    /// Feeds the paired voice info events, in the order state -> server.
    pub async fn feed_voice_info(&self, session_id: &str, token: &str) {
        self.adapter
            .feed_state_update(VoiceStateUpdate {
                guild_id: Some(GUILD),
                channel_id: Some(CHANNEL),
                user_id: USER,
                session_id: session_id.to_string(),
                self_mute: false,
                self_deaf: false,
            })
            .await;

        self.adapter
            .feed_server_update(VoiceServerUpdate {
                token: token.to_string(),
                guild_id: GUILD,
                endpoint: Some(self.server.endpoint.clone()),
            })
            .await;
    }
}

/// Builds a connection wired to a fresh mock server, subscribed for state
/// changes, but not yet connected.
#[allow(dead_code)]
pub async fn setup(options: VoiceConnectionOptions) -> TestBundle {
    let server = MockVoiceServer::spawn().await;

    let (payload_send, op4_receive) = mpsc::channel(16);
    let adapter = Arc::new(PayloadSenderAdapter::new(payload_send));

    let coordinates = VoiceChannelCoordinates {
        guild_id: GUILD,
        channel_id: Some(CHANNEL),
        user_id: USER,
        self_mute: false,
        self_deaf: false,
    };

    let connection = VoiceConnection::spawn(coordinates, adapter.clone(), options).await;

    let (state_send, states) = mpsc::channel(64);
    connection
        .events
        .lock()
        .await
        .state_change
        .subscribe(Arc::new(StateRecorder { send: state_send }));

    TestBundle {
        server,
        adapter,
        connection,
        op4_receive,
        states,
    }
}

/// Drives the websocket half of a fresh handshake up to Ready, with the
/// given session parameters.
#[allow(dead_code)]
pub async fn drive_gateway_handshake(
    gateway: &mut MockGatewayConnection,
    ssrc: u32,
    udp_addr: SocketAddr,
    mode: &str,
) -> (Value, Value) {
    gateway.send_hello(41250.0).await;

    let identify = gateway.expect_op(0).await;

    gateway
        .send_ready(
            ssrc,
            &udp_addr.ip().to_string(),
            udp_addr.port(),
            &[mode, "xsalsa20_poly1305"],
        )
        .await;

    let select_protocol = gateway.expect_op(1).await;

    gateway
        .send_session_description(mode, [0xAB; 32])
        .await;

    (identify, select_protocol)
}
