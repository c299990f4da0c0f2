// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use super::WebSocketEvent;
use serde::{Deserialize, Serialize};
use serde_json::{value::RawValue, Value};

pub use client_disconnect::*;
pub use close_code::*;
pub use hello::*;
pub use identify::*;
pub use ready::*;
pub use resume::*;
pub use select_protocol::*;
pub use session_description::*;
pub use speaking::*;

mod client_disconnect;
mod close_code;
mod hello;
mod identify;
mod ready;
mod resume;
mod select_protocol;
mod session_description;
mod speaking;

#[derive(Debug, Default, Serialize, Clone)]
/// The payload used for sending events to the voice gateway.
///
/// Similar to [VoiceGatewayReceivePayload], except we send a [Value] for d whilst we receive a [serde_json::value::RawValue]
pub struct VoiceGatewaySendPayload {
    #[serde(rename = "op")]
    pub op_code: u8,

    #[serde(rename = "d")]
    pub data: Value,
}

impl WebSocketEvent for VoiceGatewaySendPayload {}

#[derive(Debug, Deserialize, Clone)]
/// The payload used for receiving events from the voice gateway.
///
/// Note that this is similar to the regular gateway, except we no longer have s or t
///
/// Similar to [VoiceGatewaySendPayload], except we send a [Value] for d whilst we receive a [serde_json::value::RawValue]
pub struct VoiceGatewayReceivePayload<'a> {
    #[serde(rename = "op")]
    pub op_code: u8,

    #[serde(borrow)]
    #[serde(rename = "d")]
    pub data: &'a RawValue,
}

impl<'a> WebSocketEvent for VoiceGatewayReceivePayload<'a> {}

/// The modes of encryption available in voice UDP connections;
///
/// Fully implemented are [VoiceEncryptionMode::Xsalsa20Poly1305],
/// [VoiceEncryptionMode::Xsalsa20Poly1305Suffix] and
/// [VoiceEncryptionMode::Xsalsa20Poly1305Lite].
///
/// See <https://discord-userdoccers.vercel.app/topics/voice-connections#encryption-mode>
#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VoiceEncryptionMode {
    #[default]
    /// Use XSalsa20Poly1305 encryption, using the rtp header as a nonce.
    Xsalsa20Poly1305,
    /// Use XSalsa20Poly1305 encryption, using a random 24 byte suffix as a nonce.
    Xsalsa20Poly1305Suffix,
    /// Use XSalsa20Poly1305 encryption, using a 4 byte incremental value as a nonce.
    Xsalsa20Poly1305Lite,
    // Officially Undocumented
    /// Not implemented yet, we have no idea what the rtpsize nonces are.
    Xsalsa20Poly1305LiteRtpsize,
    /// Not implemented yet, we have no idea what the nonce is.
    AeadAes256Gcm,
    /// Not implemented yet, we have no idea what the rtpsize nonces are.
    AeadAes256GcmRtpsize,
    /// Not implemented yet, we have no idea what the rtpsize nonces are.
    AeadXchacha20Poly1305Rtpsize,
}

impl VoiceEncryptionMode {
    /// Returns whether this encryption mode uses Xsalsa20Poly1305 encryption.
    pub fn is_xsalsa20_poly1305(&self) -> bool {
        matches!(
            *self,
            VoiceEncryptionMode::Xsalsa20Poly1305
                | VoiceEncryptionMode::Xsalsa20Poly1305Lite
                | VoiceEncryptionMode::Xsalsa20Poly1305Suffix
                | VoiceEncryptionMode::Xsalsa20Poly1305LiteRtpsize
        )
    }

    /// Returns whether this encryption mode uses AeadAes256Gcm encryption.
    pub fn is_aead_aes256_gcm(&self) -> bool {
        matches!(
            *self,
            VoiceEncryptionMode::AeadAes256Gcm | VoiceEncryptionMode::AeadAes256GcmRtpsize
        )
    }

    /// Returns whether we can actually encrypt and decrypt with this mode.
    pub fn is_implemented(&self) -> bool {
        matches!(
            *self,
            VoiceEncryptionMode::Xsalsa20Poly1305
                | VoiceEncryptionMode::Xsalsa20Poly1305Suffix
                | VoiceEncryptionMode::Xsalsa20Poly1305Lite
        )
    }

    /// The default preference order used when selecting a mode from the
    /// server's offer: lite > suffix > xsalsa20_poly1305.
    pub fn preference_order() -> Vec<VoiceEncryptionMode> {
        vec![
            VoiceEncryptionMode::Xsalsa20Poly1305Lite,
            VoiceEncryptionMode::Xsalsa20Poly1305Suffix,
            VoiceEncryptionMode::Xsalsa20Poly1305,
        ]
    }

    /// Picks the first preferred mode the server offers, falling back to the
    /// first offered mode if no preferred mode is present.
    ///
    /// Returns [None] only when the offer itself is empty.
    pub fn negotiate(
        offered: &[VoiceEncryptionMode],
        preferred: &[VoiceEncryptionMode],
    ) -> Option<VoiceEncryptionMode> {
        preferred
            .iter()
            .find(|mode| offered.contains(mode))
            .or_else(|| offered.first())
            .copied()
    }
}

// The various voice opcodes
pub const VOICE_IDENTIFY: u8 = 0;
pub const VOICE_SELECT_PROTOCOL: u8 = 1;
pub const VOICE_READY: u8 = 2;
pub const VOICE_HEARTBEAT: u8 = 3;
pub const VOICE_SESSION_DESCRIPTION: u8 = 4;
pub const VOICE_SPEAKING: u8 = 5;
pub const VOICE_RESUME: u8 = 6;
pub const VOICE_HEARTBEAT_ACK: u8 = 7;
pub const VOICE_HELLO: u8 = 8;
pub const VOICE_RESUMED: u8 = 9;
pub const VOICE_CLIENT_DISCONNECT: u8 = 13;
