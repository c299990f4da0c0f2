// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use discortp::rtp::Rtp;
use pubserve::Publisher;

use crate::errors::VoiceError;
use crate::types::WebSocketEvent;

use super::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Published on every state transition of a voice connection.
pub struct StateChange {
    pub old: ConnectionState,
    pub new: ConnectionState,
}

impl WebSocketEvent for StateChange {}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Published when the handshake completes and audio can flow.
pub struct ConnectionReady {
    pub ssrc: u32,
    /// Our externally visible address, as revealed by ip discovery
    pub address: String,
    pub port: u16,
}

impl WebSocketEvent for ConnectionReady {}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Published when the connection has gone away and no recovery is running.
pub struct ConnectionClosed {
    pub reason: String,
}

impl WebSocketEvent for ConnectionClosed {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Published before each reconnect attempt.
pub struct ReconnectAttempt {
    pub attempt: u8,
}

impl WebSocketEvent for ReconnectAttempt {}

#[derive(Default, Debug)]
/// The observer registry of a voice connection.
///
/// `packet` republishes every decrypted inbound rtp packet; the payload is
/// still Opus encoded, decoding is the subscriber's business.
pub struct ConnectionEvents {
    pub state_change: Publisher<StateChange>,
    pub ready: Publisher<ConnectionReady>,
    pub error: Publisher<VoiceError>,
    pub disconnected: Publisher<ConnectionClosed>,
    pub reconnecting: Publisher<ReconnectAttempt>,
    pub packet: Publisher<Rtp>,
}
