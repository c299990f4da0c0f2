// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Wire-level tests of the UDP transport against a hand-rolled server
//! socket: ip discovery framing, keep-alive framing and rtt measurement.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::timeout;

use descant::metrics::ConnectionMetrics;
use descant::udp::UdpHandler;
use descant::voice_data::VoiceData;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Replies to one discovery request, asserting its framing, and returns the
/// request bytes.
async fn answer_discovery(server: &UdpSocket, address: &str, port: u16) -> Vec<u8> {
    let mut buf = vec![0u8; 2048];
    let (size, peer) = timeout(RECV_TIMEOUT, server.recv_from(&mut buf))
        .await
        .expect("no discovery request arrived")
        .unwrap();

    let request = buf[0..size].to_vec();

    // 74 bytes: type 0x0001, length 70, ssrc, zeroed address and port
    assert_eq!(request.len(), 74);
    assert_eq!(&request[0..2], &[0x00, 0x01]);
    assert_eq!(&request[2..4], &70u16.to_be_bytes());
    assert!(request[8..74].iter().all(|&byte| byte == 0));

    let mut reply = vec![0u8; 74];
    reply[0..2].copy_from_slice(&2u16.to_be_bytes());
    reply[2..4].copy_from_slice(&70u16.to_be_bytes());
    reply[4..8].copy_from_slice(&request[4..8]);
    reply[8..8 + address.len()].copy_from_slice(address.as_bytes());
    reply[72..74].copy_from_slice(&port.to_be_bytes());

    server.send_to(&reply, peer).await.unwrap();

    request
}

#[tokio::test]
async fn ip_discovery_round_trip() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let data = Arc::new(RwLock::new(VoiceData::default()));
    let metrics = Arc::new(ConnectionMetrics::default());

    let server_ip = server_addr.ip().to_string();
    let spawn = UdpHandler::spawn(
        data.clone(),
        metrics,
        &server_ip,
        server_addr.port(),
        0xCAFEBABE,
    );

    let (handle, request) = tokio::join!(spawn, answer_discovery(&server, "203.0.113.99", 61000));
    let handle = handle.expect("transport failed to spawn");

    // The ssrc we passed in went out big endian
    assert_eq!(&request[4..8], &0xCAFEBABEu32.to_be_bytes());

    // The transport exposes exactly the embedded address and port
    let discovery = data.read().await.ip_discovery.clone().expect("no discovery result");
    assert_eq!(discovery.port, 61000);
    assert_eq!(&discovery.address[0..13], b"203.0.113.99\0");

    handle.close();
}

#[tokio::test]
async fn keepalives_measure_round_trip_time() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let data = Arc::new(RwLock::new(VoiceData::default()));
    let metrics = Arc::new(ConnectionMetrics::default());

    let server_ip = server_addr.ip().to_string();
    let spawn = UdpHandler::spawn(
        data.clone(),
        metrics,
        &server_ip,
        server_addr.port(),
        1,
    );

    let (handle, _request) = tokio::join!(spawn, answer_discovery(&server, "198.51.100.2", 50000));
    let handle = handle.expect("transport failed to spawn");

    // The first probe follows immediately: 8 bytes, counter 0 little endian,
    // zero padding
    let mut buf = [0u8; 64];
    let (size, peer) = timeout(RECV_TIMEOUT, server.recv_from(&mut buf))
        .await
        .expect("no keep-alive arrived")
        .unwrap();

    assert_eq!(size, 8);
    assert_eq!(&buf[0..4], &0u32.to_le_bytes());
    assert_eq!(&buf[4..8], &[0, 0, 0, 0]);

    assert!(handle.ping().await.is_none());

    // Echo it back; the transport should now have a ping
    server.send_to(&buf[0..8], peer).await.unwrap();

    let mut ping = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        ping = handle.ping().await;
        if ping.is_some() {
            break;
        }
    }

    let ping = ping.expect("keep-alive reply was not matched");
    assert!(ping < Duration::from_secs(1));

    handle.close();
}

#[tokio::test]
async fn discovery_timeout_is_surfaced() {
    // A server that never answers
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let data = Arc::new(RwLock::new(VoiceData::default()));
    let metrics = Arc::new(ConnectionMetrics::default());

    let started = tokio::time::Instant::now();
    let result = UdpHandler::spawn(
        data,
        metrics,
        &server_addr.ip().to_string(),
        server_addr.port(),
        1,
    )
    .await;

    assert!(matches!(
        result,
        Err(descant::errors::VoiceUdpError::IpDiscoveryTimeout)
    ));
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(8));
}
