// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::types::{VoiceCloseCode, VoiceGatewayReceivePayload};

/// Represents a message received from the voice websocket connection.
///
/// This will be either a [VoiceGatewayReceivePayload], containing voice gateway events, or a [VoiceCloseCode].
///
/// This struct is used internally when handling messages.
#[derive(Clone, Debug)]
pub struct VoiceGatewayMessage(pub String);

impl VoiceGatewayMessage {
    /// Parses the message as a payload;
    /// Returns a result of deserializing
    pub fn payload(&self) -> Result<VoiceGatewayReceivePayload, serde_json::Error> {
        serde_json::from_str(&self.0)
    }
}

/// Either a message or a close notification, as the websocket backend hands
/// them to the listener task.
#[derive(Clone, Debug)]
pub enum VoiceGatewayCommunication {
    Message(VoiceGatewayMessage),
    Error(VoiceCloseCode),
}
