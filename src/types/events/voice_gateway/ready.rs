// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::types::WebSocketEvent;
use serde::{Deserialize, Serialize};

use super::VoiceEncryptionMode;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
/// The voice gateway's ready event;
///
/// Gives the user info about the UDP connection IP and port, ssrc to use,
/// available encryption modes and other data.
///
/// Sent in response to an Identify event.
///
/// See <https://discord-userdoccers.vercel.app/topics/voice-connections#ready-structure>
pub struct VoiceReady {
    /// See <https://developer.mozilla.org/en-US/docs/Web/API/RTCRtpStreamStats/ssrc>
    pub ssrc: u32,
    /// The host to connect the UDP socket to.
    ///
    /// Usually a literal address, but the protocol allows a resolvable
    /// hostname here, so we keep it as a string and resolve when binding.
    pub ip: String,
    pub port: u16,
    /// The available encryption modes for the UDP connection
    pub modes: Vec<VoiceEncryptionMode>,
    // A heartbeat_interval is also sent here, but is "an erroneous field and should be ignored.
    // The correct heartbeat_interval value comes from the Hello payload."
}

impl Default for VoiceReady {
    fn default() -> Self {
        VoiceReady {
            ssrc: 1,
            ip: String::from("0.0.0.0"),
            port: 0,
            modes: Vec::new(),
        }
    }
}

impl WebSocketEvent for VoiceReady {}
