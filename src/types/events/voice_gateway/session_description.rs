// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt;

use super::VoiceEncryptionMode;
use crate::types::WebSocketEvent;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Default)]
/// Event that describes the negotiated encryption mode and the secret key to
/// encrypt with;
///
/// See <https://discord-userdoccers.vercel.app/topics/voice-connections#session-description-structure>
pub struct SessionDescription {
    /// The encryption mode to use
    #[serde(rename = "mode")]
    pub encryption_mode: VoiceEncryptionMode,
    /// The secret key we'll use for encryption
    pub secret_key: [u8; 32],
}

// Hand written so the key never ends up in logs
impl fmt::Debug for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionDescription")
            .field("encryption_mode", &self.encryption_mode)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl WebSocketEvent for SessionDescription {}
