// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Contains all the errors that can be returned by the library.
use std::fmt;

use custom_error::custom_error;

use crate::types::{VoiceCloseCode, WebSocketEvent};

pub type VoiceResult<T> = std::result::Result<T, VoiceError>;

custom_error! {
    /// Voice gateway errors.
    ///
    /// Mostly derived from the close codes the server can end the websocket
    /// connection with, plus errors when initiating a connection and
    /// unexpected opcodes.
    ///
    /// See <https://discord.com/developers/docs/topics/opcodes-and-status-codes#voice-voice-close-event-codes>;
    #[derive(Clone, Default, PartialEq, Eq)]
    pub VoiceGatewayError
    // Errors we receive
    #[default]
    UnknownOpcode = "You sent an invalid opcode",
    FailedToDecodePayload = "You sent an invalid payload in your identifying to the (Voice) Gateway",
    NotAuthenticated = "You sent a payload before identifying with the (Voice) Gateway",
    AuthenticationFailed = "The token you sent in your identify payload is incorrect",
    AlreadyAuthenticated = "You sent more than one identify payload",
    SessionNoLongerValid = "Your session is no longer valid",
    SessionTimeout = "Your session has timed out",
    ServerNotFound = "We can't find the server you're trying to connect to",
    UnknownProtocol = "We didn't recognize the protocol you sent",
    Disconnected = "Channel was deleted, you were kicked, voice server changed, or the main gateway session was dropped. Should not reconnect.",
    VoiceServerCrashed = "The server crashed, try resuming",
    UnknownEncryptionMode = "Server failed to decrypt data",
    UnknownCloseCode{code: u16} = "Voice gateway closed with a close code we don't recognize ({code})",

    // Errors when initiating a gateway connection
    CannotConnect{error: String} = "Cannot connect due to a tungstenite error: {error}",
    NonHelloOnInitiate{opcode: u8} = "Received non hello on initial gateway connection ({opcode}), something is definitely wrong",

    // Other misc errors
    UnexpectedOpcodeReceived{opcode: u8} = "Received an opcode we weren't expecting to receive: {opcode}",
    BrokenConnection = "The websocket connection closed or errored unexpectedly",
}

impl WebSocketEvent for VoiceGatewayError {}

impl From<VoiceCloseCode> for VoiceGatewayError {
    fn from(close_code: VoiceCloseCode) -> Self {
        match close_code {
            VoiceCloseCode::UnknownOpcode => VoiceGatewayError::UnknownOpcode,
            VoiceCloseCode::FailedToDecodePayload => VoiceGatewayError::FailedToDecodePayload,
            VoiceCloseCode::NotAuthenticated => VoiceGatewayError::NotAuthenticated,
            VoiceCloseCode::AuthenticationFailed => VoiceGatewayError::AuthenticationFailed,
            VoiceCloseCode::AlreadyAuthenticated => VoiceGatewayError::AlreadyAuthenticated,
            VoiceCloseCode::SessionNoLongerValid => VoiceGatewayError::SessionNoLongerValid,
            VoiceCloseCode::SessionTimeout => VoiceGatewayError::SessionTimeout,
            VoiceCloseCode::ServerNotFound => VoiceGatewayError::ServerNotFound,
            VoiceCloseCode::UnknownProtocol => VoiceGatewayError::UnknownProtocol,
            VoiceCloseCode::Disconnected => VoiceGatewayError::Disconnected,
            VoiceCloseCode::VoiceServerCrashed => VoiceGatewayError::VoiceServerCrashed,
            VoiceCloseCode::UnknownEncryptionMode => VoiceGatewayError::UnknownEncryptionMode,
            VoiceCloseCode::Unknown(code) => VoiceGatewayError::UnknownCloseCode { code },
        }
    }
}

impl VoiceGatewayError {
    /// The close code behind this error, if it corresponds to one.
    pub fn close_code(&self) -> Option<VoiceCloseCode> {
        match self {
            VoiceGatewayError::UnknownOpcode => Some(VoiceCloseCode::UnknownOpcode),
            VoiceGatewayError::FailedToDecodePayload => Some(VoiceCloseCode::FailedToDecodePayload),
            VoiceGatewayError::NotAuthenticated => Some(VoiceCloseCode::NotAuthenticated),
            VoiceGatewayError::AuthenticationFailed => Some(VoiceCloseCode::AuthenticationFailed),
            VoiceGatewayError::AlreadyAuthenticated => Some(VoiceCloseCode::AlreadyAuthenticated),
            VoiceGatewayError::SessionNoLongerValid => Some(VoiceCloseCode::SessionNoLongerValid),
            VoiceGatewayError::SessionTimeout => Some(VoiceCloseCode::SessionTimeout),
            VoiceGatewayError::ServerNotFound => Some(VoiceCloseCode::ServerNotFound),
            VoiceGatewayError::UnknownProtocol => Some(VoiceCloseCode::UnknownProtocol),
            VoiceGatewayError::Disconnected => Some(VoiceCloseCode::Disconnected),
            VoiceGatewayError::VoiceServerCrashed => Some(VoiceCloseCode::VoiceServerCrashed),
            VoiceGatewayError::UnknownEncryptionMode => Some(VoiceCloseCode::UnknownEncryptionMode),
            VoiceGatewayError::UnknownCloseCode { code } => Some(VoiceCloseCode::Unknown(*code)),
            _ => None,
        }
    }

    /// Whether a Resume may recover the session behind this error.
    ///
    /// Connection setup failures are not resumable; they restart instead.
    pub fn is_resumable(&self) -> bool {
        match self.close_code() {
            Some(code) => code.can_resume(),
            None => matches!(self, VoiceGatewayError::BrokenConnection),
        }
    }

    /// Whether this error forbids any further reconnection attempt.
    pub fn is_terminal(&self) -> bool {
        self.close_code().map(VoiceCloseCode::is_terminal).unwrap_or(false)
    }
}

custom_error! {
    /// Voice UDP errors.
    #[derive(Clone, PartialEq, Eq)]
    pub VoiceUdpError

    // General errors
    BrokenSocket{error: String} = "Could not write / read from UDP socket: {error}",
    NoData = "We have not yet received the necessary data to perform this operation.",
    PacketTooLarge{size: usize, max: usize} = "Opus frame of {size} bytes does not fit into a voice packet (max {max} bytes of payload)",

    // Ip discovery errors
    IpDiscoveryTimeout = "The voice server did not answer our ip discovery request in time",
    MalformedIpDiscoveryReply = "The ip discovery reply could not be parsed",

    // Encryption errors
    EncryptionModeNotImplemented{encryption_mode: String} = "Voice encryption mode {encryption_mode} is not yet implemented.",
    NoKey = "Tried to encrypt / decrypt rtp data, but no key has been received yet",
    FailedEncryption = "Tried to encrypt rtp data, but failed",
    FailedDecryption = "Tried to decrypt rtp data, but failed",
    FailedNonceGeneration{error: String} = "Tried to generate nonce, but failed due to error: {error}.",

    // Errors when initiating a socket connection
    CannotBind{error: String} = "Cannot bind socket due to a UDP error: {error}",
    CannotConnect{error: String} = "Cannot connect due to a UDP error: {error}",
}

impl WebSocketEvent for VoiceUdpError {}

/// The handshake step a [VoiceError::HandshakeTimeout] ran aground on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    /// Waiting for the paired voice server / voice state updates from the main gateway
    VoiceInfo,
    /// Waiting for the voice gateway websocket to open and send Ready
    GatewayReady,
    /// Waiting for the ip discovery reply on the UDP socket
    IpDiscovery,
    /// Waiting for the session description after select protocol
    SessionDescription,
    /// Waiting for the Resumed acknowledgement
    Resume,
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            HandshakeStage::VoiceInfo => "voice info",
            HandshakeStage::GatewayReady => "gateway ready",
            HandshakeStage::IpDiscovery => "ip discovery",
            HandshakeStage::SessionDescription => "session description",
            HandshakeStage::Resume => "resume",
        };
        f.write_str(name)
    }
}

custom_error! {
    /// Errors surfaced by a voice connection as a whole.
    ///
    /// Per-packet problems are counted and dropped instead; only
    /// session-level failures become a [VoiceError].
    #[derive(Clone, PartialEq, Eq)]
    pub VoiceError

    HandshakeTimeout{stage: HandshakeStage} = "Voice connection handshake timed out at the {stage} stage",
    GatewayFatal{error: VoiceGatewayError} = "The voice gateway closed with a non-recoverable error: {error}",
    Gateway{error: VoiceGatewayError} = "Voice gateway error: {error}",
    Transport{error: VoiceUdpError} = "Voice transport error: {error}",
    GatewayStale = "The voice gateway stopped acknowledging our heartbeats",
    TransportStale = "The voice server stopped answering our UDP keep-alives",
    CryptoFailure{details: String} = "Could not establish usable encryption: {details}",
    ProtocolViolation{details: String} = "The voice server violated the protocol: {details}",
    AdapterSend = "The main gateway adapter could not accept our voice state update",
    ReconnectExhausted{attempts: u8} = "Gave up reconnecting after {attempts} attempts",
    Destroyed = "This voice connection has been destroyed and can no longer be used",
    CallerMisuse{details: String} = "Invalid use of the voice connection: {details}",
}

impl WebSocketEvent for VoiceError {}

impl From<VoiceUdpError> for VoiceError {
    fn from(error: VoiceUdpError) -> Self {
        match error {
            VoiceUdpError::IpDiscoveryTimeout => VoiceError::HandshakeTimeout {
                stage: HandshakeStage::IpDiscovery,
            },
            other => VoiceError::Transport { error: other },
        }
    }
}
