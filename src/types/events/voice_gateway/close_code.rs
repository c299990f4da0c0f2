// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt;

use self::VoiceCloseCode::*;

/// The close codes the voice gateway can close a connection with.
///
/// See <https://discord.com/developers/docs/topics/opcodes-and-status-codes#voice-voice-close-event-codes>
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum VoiceCloseCode {
    UnknownOpcode,
    FailedToDecodePayload,
    NotAuthenticated,
    AuthenticationFailed,
    AlreadyAuthenticated,
    SessionNoLongerValid,
    SessionTimeout,
    ServerNotFound,
    UnknownProtocol,
    Disconnected,
    VoiceServerCrashed,
    UnknownEncryptionMode,
    Unknown(u16),
}

impl VoiceCloseCode {
    /// Whether the session behind this close can be picked up again with a
    /// Resume instead of a full re-identify.
    ///
    /// Codes not listed by the protocol documentation get one resume attempt
    /// before falling back to a full restart.
    pub fn can_resume(self) -> bool {
        !matches!(
            self,
            AuthenticationFailed | SessionNoLongerValid | Disconnected | UnknownEncryptionMode
        )
    }

    /// Whether this close ends the connection for good: no resume, no fresh
    /// handshake.
    ///
    /// [SessionNoLongerValid] is deliberately absent: the session is gone, but
    /// a brand new handshake is allowed to succeed.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AuthenticationFailed | Disconnected | UnknownEncryptionMode
        )
    }
}

impl fmt::Display for VoiceCloseCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let code: u16 = (*self).into();
        write!(f, "{}", code)
    }
}

impl From<VoiceCloseCode> for u16 {
    fn from(code: VoiceCloseCode) -> u16 {
        match code {
            UnknownOpcode => 4001,
            FailedToDecodePayload => 4002,
            NotAuthenticated => 4003,
            AuthenticationFailed => 4004,
            AlreadyAuthenticated => 4005,
            SessionNoLongerValid => 4006,
            SessionTimeout => 4009,
            ServerNotFound => 4011,
            UnknownProtocol => 4012,
            Disconnected => 4014,
            VoiceServerCrashed => 4015,
            UnknownEncryptionMode => 4016,
            Unknown(code) => code,
        }
    }
}

impl From<u16> for VoiceCloseCode {
    fn from(code: u16) -> VoiceCloseCode {
        match code {
            4001 => UnknownOpcode,
            4002 => FailedToDecodePayload,
            4003 => NotAuthenticated,
            4004 => AuthenticationFailed,
            4005 => AlreadyAuthenticated,
            4006 => SessionNoLongerValid,
            4009 => SessionTimeout,
            4011 => ServerNotFound,
            4012 => UnknownProtocol,
            4014 => Disconnected,
            4015 => VoiceServerCrashed,
            4016 => UnknownEncryptionMode,
            _ => Unknown(code),
        }
    }
}
