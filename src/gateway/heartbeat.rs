// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use futures_util::SinkExt;
use log::*;

use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::{
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message,
};

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::{
    mpsc::{Receiver, Sender},
    Mutex,
};
use tokio::task;

use crate::{
    errors::VoiceGatewayError,
    types::{
        VoiceCloseCode, VoiceGatewaySendPayload, VOICE_HEARTBEAT, VOICE_HEARTBEAT_ACK,
    },
    gateway::VoiceGatewayMessage,
};

use super::{events::VoiceEvents, Sink};

/// Handles sending heartbeats to the voice gateway in another thread
#[allow(dead_code)]
#[derive(Debug)]
pub(super) struct VoiceHeartbeatHandler {
    /// The heartbeat interval in milliseconds
    pub heartbeat_interval: Duration,
    /// The send channel for the heartbeat thread
    pub send: Sender<VoiceHeartbeatThreadCommunication>,
}

impl VoiceHeartbeatHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        heartbeat_interval: Duration,
        starting_nonce: u64,
        next_nonce: Arc<AtomicU64>,
        grace: u8,
        websocket_tx: Arc<Mutex<Sink>>,
        events: Arc<Mutex<VoiceEvents>>,
        kill_send: tokio::sync::broadcast::Sender<()>,
        kill_rc: tokio::sync::broadcast::Receiver<()>,
    ) -> Self {
        let (send, receive) = tokio::sync::mpsc::channel(32);
        let kill_receive = kill_rc.resubscribe();

        task::spawn(async move {
            Self::heartbeat_task(
                websocket_tx,
                events,
                heartbeat_interval,
                starting_nonce,
                next_nonce,
                grace,
                receive,
                kill_send,
                kill_receive,
            )
            .await;
        });

        Self {
            heartbeat_interval,
            send,
        }
    }

    /// The main heartbeat task;
    ///
    /// Sends a heartbeat once per interval and tracks the acknowledgements.
    /// Tolerates `grace` unacknowledged ticks; one more closes the connection
    /// with a session timeout and stops all gateway tasks.
    ///
    /// Can be killed by the kill broadcast;
    /// If the websocket is closed, will die out next time it tries to send a heartbeat;
    #[allow(clippy::too_many_arguments)]
    pub async fn heartbeat_task(
        websocket_tx: Arc<Mutex<Sink>>,
        events: Arc<Mutex<VoiceEvents>>,
        heartbeat_interval: Duration,
        starting_nonce: u64,
        next_nonce: Arc<AtomicU64>,
        grace: u8,
        mut receive: Receiver<VoiceHeartbeatThreadCommunication>,
        kill_send: tokio::sync::broadcast::Sender<()>,
        mut kill_receive: tokio::sync::broadcast::Receiver<()>,
    ) {
        let mut last_heartbeat_timestamp: Instant = Instant::now();
        let mut last_heartbeat_acknowledged = true;
        let mut missed_acks: u8 = 0;
        let mut nonce: u64 = starting_nonce;

        loop {
            let mut should_send = false;

            tokio::select! {
                () = sleep_until(last_heartbeat_timestamp + heartbeat_interval) => {
                    if !last_heartbeat_acknowledged {
                        missed_acks += 1;

                        if missed_acks > grace {
                            warn!(
                                "VGW: {} heartbeats in a row were not acknowledged, closing with session timeout",
                                missed_acks
                            );

                            let close_frame = CloseFrame {
                                code: CloseCode::from(u16::from(VoiceCloseCode::SessionTimeout)),
                                reason: "Heartbeat ACK timeout".into(),
                            };

                            websocket_tx
                                .lock()
                                .await
                                .send(Message::Close(Some(close_frame)))
                                .await
                                .ok();

                            events
                                .lock()
                                .await
                                .error
                                .publish(VoiceGatewayError::SessionTimeout)
                                .await;

                            kill_send.send(()).ok();
                            break;
                        }
                    }

                    should_send = true;
                }
                Some(communication) = receive.recv() => {
                    // If we received a nonce update, use that nonce now
                    if let Some(updated_nonce) = communication.updated_nonce {
                        nonce = updated_nonce;
                    }

                    if let Some(op_code) = communication.op_code {
                        match op_code {
                            VOICE_HEARTBEAT => {
                                // As per the api docs, if the server sends us a Heartbeat, that means we need to respond with a heartbeat immediately
                                should_send = true;
                            }
                            VOICE_HEARTBEAT_ACK => {
                                // The server received our heartbeat
                                last_heartbeat_acknowledged = true;
                                missed_acks = 0;
                            }
                            _ => {}
                        }
                    }
                }
                Ok(_) = kill_receive.recv() => {
                    trace!("VGW: Closing heartbeat task");
                    break;
                }
            }

            if should_send {
                trace!("VGW: Sending Heartbeat..");

                let heartbeat = VoiceGatewaySendPayload {
                    op_code: VOICE_HEARTBEAT,
                    data: nonce.into(),
                };

                let heartbeat_json = serde_json::to_string(&heartbeat).unwrap();

                let msg = VoiceGatewayMessage(heartbeat_json);

                let send_result = websocket_tx.lock().await.send(msg.into()).await;
                if send_result.is_err() {
                    // We couldn't send, the websocket is broken
                    warn!("VGW: Couldnt send heartbeat, websocket seems broken");
                    break;
                }

                nonce = nonce.wrapping_add(1);
                next_nonce.store(nonce, Ordering::Relaxed);

                last_heartbeat_timestamp = Instant::now();
                last_heartbeat_acknowledged = false;
            }
        }
    }
}

/// Used for communications between the voice heartbeat and voice gateway thread.
/// Either signifies a nonce update, a heartbeat ACK or a Heartbeat request by the server
#[derive(Clone, Copy, Debug)]
pub(super) struct VoiceHeartbeatThreadCommunication {
    /// The opcode for the communication we received, if relevant
    pub(super) op_code: Option<u8>,
    /// The new nonce to use, if any
    pub(super) updated_nonce: Option<u64>,
}
