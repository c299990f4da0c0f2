// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::{atomic::AtomicU64, Arc};

use log::*;

use futures_util::SinkExt;

use tokio::sync::Mutex;

use crate::errors::VoiceGatewayError;
use crate::types::{
    SelectProtocol, Speaking, VoiceGatewaySendPayload, VoiceIdentify, VoiceResume, VOICE_IDENTIFY,
    VOICE_RESUME, VOICE_SELECT_PROTOCOL, VOICE_SPEAKING,
};

use super::{events::VoiceEvents, Sink, VoiceGatewayMessage};

/// Represents a handle to a Voice Gateway connection.
/// Using this handle you can send Gateway Events directly.
#[derive(Debug, Clone)]
pub struct VoiceGatewayHandle {
    pub url: String,
    pub events: Arc<Mutex<VoiceEvents>>,
    pub websocket_send: Arc<Mutex<Sink>>,
    /// Tells gateway tasks to close
    pub(super) kill_send: tokio::sync::broadcast::Sender<()>,
    /// The nonce the heartbeat task will send next; preserved across resumes
    pub next_heartbeat_nonce: Arc<AtomicU64>,
}

impl VoiceGatewayHandle {
    /// Sends json to the gateway with an opcode
    async fn send_json(
        &self,
        op_code: u8,
        to_send: serde_json::Value,
    ) -> Result<(), VoiceGatewayError> {
        let gateway_payload = VoiceGatewaySendPayload {
            op_code,
            data: to_send,
        };

        let payload_json = serde_json::to_string(&gateway_payload)
            .map_err(|_| VoiceGatewayError::FailedToDecodePayload)?;
        let message = VoiceGatewayMessage(payload_json);

        self.websocket_send
            .lock()
            .await
            .send(message.into())
            .await
            .map_err(|_| VoiceGatewayError::BrokenConnection)
    }

    /// Sends a voice identify event to the gateway
    pub async fn send_identify(&self, to_send: VoiceIdentify) -> Result<(), VoiceGatewayError> {
        let to_send_value = serde_json::to_value(&to_send).unwrap();

        trace!("VGW: Sending Identify..");

        self.send_json(VOICE_IDENTIFY, to_send_value).await
    }

    /// Sends a select protocol event to the gateway
    pub async fn send_select_protocol(
        &self,
        to_send: SelectProtocol,
    ) -> Result<(), VoiceGatewayError> {
        let to_send_value = serde_json::to_value(&to_send).unwrap();

        trace!("VGW: Sending Select Protocol");

        self.send_json(VOICE_SELECT_PROTOCOL, to_send_value).await
    }

    /// Sends a speaking event to the gateway
    pub async fn send_speaking(&self, to_send: Speaking) -> Result<(), VoiceGatewayError> {
        let to_send_value = serde_json::to_value(&to_send).unwrap();

        trace!("VGW: Sending Speaking");

        self.send_json(VOICE_SPEAKING, to_send_value).await
    }

    /// Sends a resume event to the gateway, picking a dropped session back up
    pub async fn send_resume(&self, to_send: VoiceResume) -> Result<(), VoiceGatewayError> {
        let to_send_value = serde_json::to_value(&to_send).unwrap();

        trace!("VGW: Sending Resume");

        self.send_json(VOICE_RESUME, to_send_value).await
    }

    /// Closes the websocket connection and stops all gateway tasks;
    ///
    /// Essentially pulls the plug on the voice gateway, leaving it possible to resume;
    pub async fn close(&self) {
        self.kill_send.send(()).ok();
        self.websocket_send.lock().await.close().await.ok();
    }
}
