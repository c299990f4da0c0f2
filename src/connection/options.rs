// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::types::VoiceEncryptionMode;

#[derive(Clone, PartialEq, Eq, Debug)]
/// Options passed when creating a voice connection.
///
/// The defaults match what the protocol expects from a well behaved client;
/// mostly these exist so tests and unusual deployments can tighten or loosen
/// the recovery behavior.
pub struct VoiceConnectionOptions {
    /// Whether the connection repairs itself after heartbeat loss, keep-alive
    /// loss or a recoverable close code.
    ///
    /// When false, any such failure leaves the connection disconnected.
    pub auto_reconnect: bool,
    /// How many reconnect attempts are made before the connection destroys
    /// itself. Values above 32 are treated as 32.
    pub max_reconnect_attempts: u8,
    /// Encryption modes we try to select, most preferred first.
    ///
    /// If the server offers none of these, the first mode it offers is taken.
    pub preferred_modes: Vec<VoiceEncryptionMode>,
    /// How many unacknowledged heartbeats in a row we tolerate; one more
    /// closes the voice gateway with a session timeout.
    pub heartbeat_grace: u8,
}

impl Default for VoiceConnectionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            preferred_modes: VoiceEncryptionMode::preference_order(),
            heartbeat_grace: 2,
        }
    }
}

impl VoiceConnectionOptions {
    /// [Self::max_reconnect_attempts], clamped to the supported range.
    pub(crate) fn effective_max_reconnect_attempts(&self) -> u8 {
        self.max_reconnect_attempts.min(32)
    }
}
