// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

mod common;

use descant::errors::VoiceGatewayError;
use descant::gateway::VoiceGateway;

use common::MockVoiceServer;

#[tokio::test]
async fn heartbeats_follow_the_hello_interval() {
    let mut server = MockVoiceServer::spawn().await;

    let endpoint = server.endpoint.clone();
    let gateway_task = VoiceGateway::spawn(&endpoint, 2, 0);
    let accept_task = server.next_connection();

    let (handle, mut connection) = tokio::join!(gateway_task, accept_task);
    let handle = handle.expect("gateway failed to spawn");

    connection.send_hello(100.0).await;

    // Nonces count up from the starting nonce
    let first = connection.expect_op(3).await;
    assert_eq!(first["d"], 0);

    let second = connection.expect_op(3).await;
    assert_eq!(second["d"], 1);

    let third = connection.expect_op(3).await;
    assert_eq!(third["d"], 2);

    handle.close().await;
}

#[tokio::test]
async fn unacknowledged_heartbeats_close_with_session_timeout() {
    let mut server = MockVoiceServer::spawn().await;
    server.set_auto_ack_heartbeats(false);

    let endpoint = server.endpoint.clone();
    let gateway_task = VoiceGateway::spawn(&endpoint, 2, 0);
    let accept_task = server.next_connection();

    let (handle, mut connection) = tokio::join!(gateway_task, accept_task);
    let _handle = handle.expect("gateway failed to spawn");

    connection.send_hello(100.0).await;

    // Heartbeats flow but are never acked; the third miss is fatal
    let close_code = connection.expect_close().await;
    assert_eq!(close_code, Some(4009));
}

#[tokio::test]
async fn resumed_session_continues_the_nonce_sequence() {
    let mut server = MockVoiceServer::spawn().await;

    let endpoint = server.endpoint.clone();
    let gateway_task = VoiceGateway::spawn(&endpoint, 2, 41);
    let accept_task = server.next_connection();

    let (handle, mut connection) = tokio::join!(gateway_task, accept_task);
    let handle = handle.expect("gateway failed to spawn");

    connection.send_hello(100.0).await;

    let first = connection.expect_op(3).await;
    assert_eq!(first["d"], 41);

    handle.close().await;
}

#[tokio::test]
async fn non_hello_on_connect_is_an_error() {
    let mut server = MockVoiceServer::spawn().await;

    let endpoint = server.endpoint.clone();
    let gateway_task = tokio::spawn(async move { VoiceGateway::spawn(&endpoint, 2, 0).await });

    let connection = server.next_connection().await;

    // Feed a READY before any HELLO
    connection
        .send_op(
            2,
            serde_json::json!({ "ssrc": 1, "ip": "127.0.0.1", "port": 1, "modes": [] }),
        )
        .await;

    let result = gateway_task.await.unwrap();
    assert!(matches!(
        result,
        Err(VoiceGatewayError::NonHelloOnInitiate { opcode: 2 })
    ));
}
