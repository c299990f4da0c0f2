// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The voice-relevant slice of the main gateway's contract: the opcode 4
//! payload we send and the two dispatch events we need to observe.

use crate::types::{events::WebSocketEvent, Snowflake};
use serde::{Deserialize, Serialize};

/// The opcode sent on the main gateway when joining, moving or leaving a voice channel.
pub const GATEWAY_UPDATE_VOICE_STATE: u8 = 4;

#[derive(Debug, Deserialize, Serialize, Default, Clone, Copy, PartialEq, Eq)]
/// Sent to the main gateway (opcode 4) to indicate an update of the voice state
/// (leave voice channel, join voice channel, mute, deafen);
///
/// Not to be confused with [VoiceStateUpdate];
pub struct UpdateVoiceState {
    pub guild_id: Option<Snowflake>,
    pub channel_id: Option<Snowflake>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl WebSocketEvent for UpdateVoiceState {}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
/// See <https://discord.com/developers/docs/topics/gateway-events#voice-state-update>;
///
/// Received from the main gateway to indicate an update in a user's voice state
/// (leave voice channel, join voice channel, mute, deafen, etc);
///
/// Not to be confused with [UpdateVoiceState];
pub struct VoiceStateUpdate {
    pub guild_id: Option<Snowflake>,
    #[serde(default)]
    pub channel_id: Option<Snowflake>,
    pub user_id: Snowflake,
    /// The session id we need for identifying to the voice gateway
    pub session_id: String,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub self_deaf: bool,
}

impl WebSocketEvent for VoiceStateUpdate {}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
/// See <https://discord.com/developers/docs/topics/gateway-events#voice-server-update>;
///
/// Received from the main gateway to indicate which voice endpoint, token and guild_id to use;
pub struct VoiceServerUpdate {
    pub token: String,
    pub guild_id: Snowflake,
    /// The voice server host.
    ///
    /// A null endpoint means the server allocated for us went away and is
    /// trying to be reallocated; we should wait for the next update.
    pub endpoint: Option<String>,
}

impl WebSocketEvent for VoiceServerUpdate {}
