// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use pubserve::Publisher;

use crate::{
    errors::VoiceGatewayError,
    types::{
        SessionDescription, Speaking, VoiceClientDisconnection, VoiceReady, VoiceResumed,
    },
};

#[derive(Default, Debug)]
pub struct VoiceEvents {
    pub voice_ready: Publisher<VoiceReady>,
    pub session_description: Publisher<SessionDescription>,
    pub speaking: Publisher<Speaking>,
    pub resumed: Publisher<VoiceResumed>,
    pub client_disconnect: Publisher<VoiceClientDisconnection>,
    pub error: Publisher<VoiceGatewayError>,
}
