// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    sync::{atomic::AtomicU64, Arc},
    time::Duration,
};

use log::*;

use pubserve::Publisher;
use tokio::sync::Mutex;

use futures_util::SinkExt;
use futures_util::StreamExt;

use crate::{
    errors::VoiceGatewayError,
    types::{
        VoiceGatewayReceivePayload, VoiceHelloData, WebSocketEvent, VOICE_CLIENT_DISCONNECT,
        VOICE_HEARTBEAT, VOICE_HEARTBEAT_ACK, VOICE_HELLO, VOICE_IDENTIFY, VOICE_READY,
        VOICE_RESUME, VOICE_RESUMED, VOICE_SELECT_PROTOCOL, VOICE_SESSION_DESCRIPTION,
        VOICE_SPEAKING,
    },
    gateway::{
        heartbeat::VoiceHeartbeatThreadCommunication, VoiceGatewayCommunication,
        VoiceGatewayMessage,
    },
};

use super::{
    events::VoiceEvents, heartbeat::VoiceHeartbeatHandler, Sink, Stream, VoiceGatewayHandle,
    WebSocketBackend,
};

use crate::types::VoiceCloseCode;

#[derive(Debug)]
pub struct VoiceGateway {
    events: Arc<Mutex<VoiceEvents>>,
    heartbeat_handler: VoiceHeartbeatHandler,
    websocket_send: Arc<Mutex<Sink>>,
    websocket_receive: Stream,
    kill_send: tokio::sync::broadcast::Sender<()>,
    kill_receive: tokio::sync::broadcast::Receiver<()>,
}

impl VoiceGateway {
    /// Opens a websocket to a voice server, waits for Hello and starts the
    /// heartbeat and listener tasks.
    ///
    /// A bare host in `endpoint` is dialed as `wss://{endpoint}/?v=4`; an
    /// endpoint with an explicit `ws://` or `wss://` scheme is dialed as
    /// given.
    ///
    /// `heartbeat_grace` is how many unacknowledged heartbeats we tolerate
    /// before closing with a session timeout. `starting_nonce` seeds the
    /// heartbeat nonce, so a resumed session keeps counting where it left
    /// off.
    #[allow(clippy::new_ret_no_self)]
    pub async fn spawn(
        endpoint: &str,
        heartbeat_grace: u8,
        starting_nonce: u64,
    ) -> Result<VoiceGatewayHandle, VoiceGatewayError> {
        // Append the needed things to the websocket url
        let processed_url = if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
            format!("{}/?v=4", endpoint.trim_end_matches('/'))
        } else {
            format!("wss://{}/?v=4", endpoint)
        };
        trace!("VGW: Connecting to {}", processed_url);

        let (websocket_send, mut websocket_receive) =
            WebSocketBackend::connect(&processed_url).await?;

        let shared_websocket_send = Arc::new(Mutex::new(websocket_send));

        // Create a shared broadcast channel for killing all gateway tasks
        let (kill_send, mut _kill_receive) = tokio::sync::broadcast::channel::<()>(16);

        // Wait for the first hello and then spawn both tasks so we avoid nested tasks
        // This automatically spawns the heartbeat task, but from the main thread
        let msg: VoiceGatewayMessage = {
            let communication: VoiceGatewayCommunication = websocket_receive
                .next()
                .await
                .ok_or(VoiceGatewayError::BrokenConnection)?
                .map_err(|_| VoiceGatewayError::BrokenConnection)?
                .into();

            match communication {
                VoiceGatewayCommunication::Message(message) => message,
                VoiceGatewayCommunication::Error(close_code) => return Err(close_code.into()),
            }
        };

        let gateway_payload: VoiceGatewayReceivePayload = msg
            .payload()
            .map_err(|_| VoiceGatewayError::FailedToDecodePayload)?;

        if gateway_payload.op_code != VOICE_HELLO {
            return Err(VoiceGatewayError::NonHelloOnInitiate {
                opcode: gateway_payload.op_code,
            });
        }

        info!("VGW: Received Hello");

        // The hello data for voice gateways is in float milliseconds, so we convert it to f64 seconds
        let gateway_hello: VoiceHelloData = serde_json::from_str(gateway_payload.data.get())
            .map_err(|_| VoiceGatewayError::FailedToDecodePayload)?;
        let heartbeat_interval_seconds: f64 = gateway_hello.heartbeat_interval / 1000.0;

        let voice_events = VoiceEvents::default();
        let shared_events = Arc::new(Mutex::new(voice_events));

        let next_heartbeat_nonce = Arc::new(AtomicU64::new(starting_nonce));

        let mut gateway = VoiceGateway {
            events: shared_events.clone(),
            heartbeat_handler: VoiceHeartbeatHandler::new(
                Duration::from_secs_f64(heartbeat_interval_seconds),
                starting_nonce,
                next_heartbeat_nonce.clone(),
                heartbeat_grace,
                shared_websocket_send.clone(),
                shared_events.clone(),
                kill_send.clone(),
                kill_send.subscribe(),
            ),
            websocket_send: shared_websocket_send.clone(),
            websocket_receive,
            kill_send: kill_send.clone(),
            kill_receive: kill_send.subscribe(),
        };

        // Now we can continuously check for messages in a different task, since we aren't going to receive another hello
        tokio::task::spawn(async move {
            gateway.gateway_listen_task().await;
        });

        Ok(VoiceGatewayHandle {
            url: endpoint.to_string(),
            events: shared_events,
            websocket_send: shared_websocket_send.clone(),
            kill_send: kill_send.clone(),
            next_heartbeat_nonce,
        })
    }

    /// The main gateway listener task;
    async fn gateway_listen_task(&mut self) {
        loop {
            let msg;

            tokio::select! {
                Ok(_) = self.kill_receive.recv() => {
                    trace!("VGW: Closing listener task");
                    break;
                }
                message = self.websocket_receive.next() => {
                    msg = message;
                }
            }

            // Note: The tungstenite backend handles close codes as messages
            if let Some(Ok(message)) = msg {
                let communication: VoiceGatewayCommunication = message.into();

                match communication {
                    VoiceGatewayCommunication::Message(message) => {
                        self.handle_message(message).await
                    }
                    VoiceGatewayCommunication::Error(close_code) => {
                        self.handle_close_code(close_code).await;
                        break;
                    }
                }

                continue;
            }

            // We couldn't receive the next message or it was an error, something is wrong with the websocket, close
            warn!("VGW: Websocket is broken, stopping gateway");
            self.events
                .lock()
                .await
                .error
                .publish(VoiceGatewayError::BrokenConnection)
                .await;
            self.kill_send.send(()).ok();
            break;
        }
    }

    /// Closes the websocket connection and stops all tasks
    async fn close(&mut self) {
        self.kill_send.send(()).ok();
        self.websocket_send.lock().await.close().await.ok();
    }

    /// Handles receiving a [VoiceCloseCode].
    ///
    /// Closes the connection and publishes an error event.
    async fn handle_close_code(&mut self, code: VoiceCloseCode) {
        let error = VoiceGatewayError::from(code);

        warn!("VGW: Received error {:?}, connection will close..", error);
        self.close().await;
        self.events.lock().await.error.publish(error).await;
    }

    /// Deserializes and updates a dispatched event, when we already know its type;
    /// (Called for every event in handle_message)
    async fn handle_event<'a, T: WebSocketEvent + serde::Deserialize<'a>>(
        data: &'a str,
        event: &mut Publisher<T>,
    ) -> Result<(), serde_json::Error> {
        let data_deserialized: T = serde_json::from_str(data)?;
        event.publish(data_deserialized).await;
        Ok(())
    }

    /// This handles a message as a websocket event and updates its events along with the events' observers
    pub async fn handle_message(&mut self, msg: VoiceGatewayMessage) {
        if msg.0.is_empty() {
            return;
        }

        let Ok(gateway_payload) = msg.payload() else {
            warn!("VGW: Message unrecognised: {:?}", msg.0);
            return;
        };

        // See <https://discord.com/developers/docs/topics/voice-connections>
        match gateway_payload.op_code {
            VOICE_READY => {
                trace!("VGW: Received READY!");

                let event = &mut self.events.lock().await.voice_ready;
                let result = VoiceGateway::handle_event(gateway_payload.data.get(), event).await;
                if let Err(parse_error) = result {
                    warn!("Failed to parse VOICE_READY ({})", parse_error);
                }
            }
            VOICE_SESSION_DESCRIPTION => {
                trace!("VGW: Received Session Description");

                let event = &mut self.events.lock().await.session_description;
                let result = VoiceGateway::handle_event(gateway_payload.data.get(), event).await;
                if let Err(parse_error) = result {
                    warn!("Failed to parse VOICE_SESSION_DESCRIPTION ({})", parse_error);
                }
            }
            VOICE_SPEAKING => {
                trace!("VGW: Received Speaking");

                let event = &mut self.events.lock().await.speaking;
                let result = VoiceGateway::handle_event(gateway_payload.data.get(), event).await;
                if let Err(parse_error) = result {
                    warn!("Failed to parse VOICE_SPEAKING ({})", parse_error);
                }
            }
            VOICE_RESUMED => {
                trace!("VGW: Received Resumed");

                let event = &mut self.events.lock().await.resumed;
                let result = VoiceGateway::handle_event(gateway_payload.data.get(), event).await;
                if let Err(parse_error) = result {
                    warn!("Failed to parse VOICE_RESUMED ({})", parse_error);
                }
            }
            VOICE_CLIENT_DISCONNECT => {
                trace!("VGW: Received Client Disconnect");

                let event = &mut self.events.lock().await.client_disconnect;
                let result = VoiceGateway::handle_event(gateway_payload.data.get(), event).await;
                if let Err(parse_error) = result {
                    warn!("Failed to parse VOICE_CLIENT_DISCONNECT ({})", parse_error);
                }
            }
            // We received a heartbeat from the server
            // "Discord may send the app a Heartbeat (opcode 3) event, in which case the app should send a Heartbeat event immediately."
            VOICE_HEARTBEAT => {
                trace!("VGW: Received Heartbeat // Heartbeat Request");

                // Tell the heartbeat handler it should send a heartbeat right away
                let heartbeat_communication = VoiceHeartbeatThreadCommunication {
                    updated_nonce: None,
                    op_code: Some(VOICE_HEARTBEAT),
                };

                self.heartbeat_handler
                    .send
                    .send(heartbeat_communication)
                    .await
                    .ok();
            }
            VOICE_HEARTBEAT_ACK => {
                trace!("VGW: Received Heartbeat ACK");

                // Tell the heartbeat handler we received an ack
                let heartbeat_communication = VoiceHeartbeatThreadCommunication {
                    updated_nonce: None,
                    op_code: Some(VOICE_HEARTBEAT_ACK),
                };

                self.heartbeat_handler
                    .send
                    .send(heartbeat_communication)
                    .await
                    .ok();
            }
            VOICE_HELLO => {
                warn!("VGW: Received an unexpected second Hello, ignoring");
            }
            VOICE_IDENTIFY | VOICE_SELECT_PROTOCOL | VOICE_RESUME => {
                info!(
                    "VGW: Received unexpected opcode ({}) for current state. This might be due to a faulty server implementation.",
                    gateway_payload.op_code
                );
            }
            _ => {
                warn!(
                    "VGW: Received unrecognized voice gateway op code ({})",
                    gateway_payload.op_code
                );
            }
        }
    }
}
