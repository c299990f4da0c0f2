// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use discortp::discord::IpDiscovery;

use crate::types::{
    SessionDescription, Snowflake, VoiceReady, VoiceServerUpdate, VoiceStateUpdate,
};

/// The position of our outbound rtp stream.
///
/// Advances per sent audio packet, silence included: sequence by one,
/// timestamp by one frame of samples. The nonce counter advances only when
/// the lite encryption mode is in use.
///
/// Reset only when a whole new session replaces the old one.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RtpCursor {
    /// Sequence number of the next packet, wrapping
    pub sequence: u16,
    /// Rtp timestamp of the next packet, wrapping
    pub timestamp: u32,
    /// Nonce for the next packet in `xsalsa20_poly1305_lite` mode, wrapping
    pub nonce_counter: u32,
}

impl RtpCursor {
    pub fn reset(&mut self) {
        *self = RtpCursor::default();
    }
}

#[derive(Debug, Default)]
/// Saves data shared between parts of the voice architecture;
///
/// Used to give the UDP connection data received from the gateways, and to
/// hold the rtp cursor the send path advances.
pub struct VoiceData {
    pub server_data: Option<VoiceServerUpdate>,
    pub state_data: Option<VoiceStateUpdate>,
    pub ready_data: Option<VoiceReady>,
    pub session_description: Option<SessionDescription>,
    pub user_id: Snowflake,
    pub session_id: String,
    pub ip_discovery: Option<IpDiscovery>,
    pub cursor: RtpCursor,
}

impl VoiceData {
    /// Forgets everything tied to the current voice session.
    ///
    /// The secret key is overwritten before release; the rtp cursor restarts,
    /// since a new session means a new ssrc and key.
    ///
    /// Main gateway data (user id, session id, server data) is kept, so a
    /// resume or fresh handshake can still be attempted.
    pub fn clear_session(&mut self) {
        if let Some(description) = self.session_description.as_mut() {
            description.secret_key = [0; 32];
        }

        self.session_description = None;
        self.ready_data = None;
        self.ip_discovery = None;
        self.cursor.reset();
    }

    /// Whether both halves of the main gateway handshake have been observed.
    pub fn has_voice_info(&self) -> bool {
        self.server_data.is_some() && self.state_data.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_session_resets_cursor_and_key() {
        let mut data = VoiceData {
            session_description: Some(SessionDescription {
                secret_key: [0xAB; 32],
                ..Default::default()
            }),
            ..Default::default()
        };
        data.cursor.sequence = 42;
        data.cursor.timestamp = 42 * 960;
        data.cursor.nonce_counter = 42;

        data.clear_session();

        assert!(data.session_description.is_none());
        assert_eq!(data.cursor, RtpCursor::default());
    }
}
