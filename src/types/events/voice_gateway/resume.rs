// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::types::{Snowflake, WebSocketEvent};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
/// Sent after Hello to re-establish a dropped voice gateway session without a
/// full re-identify;
///
/// The server replies with Resumed if the session was still live.
///
/// See <https://discord-userdoccers.vercel.app/topics/voice-connections#resuming-voice-connection>
pub struct VoiceResume {
    /// The ID of the guild or the private channel being connected to
    pub server_id: Snowflake,
    pub session_id: String,
    pub token: String,
}

impl WebSocketEvent for VoiceResume {}

#[derive(Debug, Deserialize, Serialize, Default, Clone, Copy, PartialEq, Eq)]
/// Acknowledges a successful [VoiceResume];
///
/// Carries no data.
pub struct VoiceResumed;

impl WebSocketEvent for VoiceResumed {}
