// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::time::Duration;

use discortp::{rtcp::Rtcp, rtp::Rtp};
use pubserve::Publisher;

use crate::types::WebSocketEvent;

impl WebSocketEvent for Rtp {}
impl WebSocketEvent for Rtcp {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Published when the voice server has stopped answering our keep-alive
/// probes and the transport should be considered dead.
pub struct TransportStale {
    /// How many probes in a row went unanswered
    pub missed: u8,
}

impl WebSocketEvent for TransportStale {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Published whenever a keep-alive reply comes back, carrying the freshly
/// measured round trip time to the voice server.
pub struct KeepaliveMeasurement {
    pub ping: Duration,
}

impl WebSocketEvent for KeepaliveMeasurement {}

#[derive(Debug)]
pub struct VoiceUDPEvents {
    pub rtp: Publisher<Rtp>,
    pub rtcp: Publisher<Rtcp>,
    pub stale: Publisher<TransportStale>,
    pub measurement: Publisher<KeepaliveMeasurement>,
}

impl Default for VoiceUDPEvents {
    fn default() -> Self {
        Self {
            rtp: Publisher::new(),
            rtcp: Publisher::new(),
            stale: Publisher::new(),
            measurement: Publisher::new(),
        }
    }
}
