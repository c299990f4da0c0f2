// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The narrow slice of the main gateway a voice connection needs.
//!
//! descant does not own a main gateway; whatever runs one feeds the two
//! voice dispatch events in here and takes serialized opcode 4 payloads out.

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use log::*;
use pubserve::Publisher;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use crate::types::{
    UpdateVoiceState, VoiceServerUpdate, VoiceStateUpdate, GATEWAY_UPDATE_VOICE_STATE,
};

#[derive(Default, Debug)]
/// The two main gateway dispatches a voice connection is driven by.
///
/// Both may arrive in either order for a single join; the adapter delivers
/// them raw and leaves pairing and scoping to its subscribers.
pub struct VoiceUpdateEvents {
    pub server_update: Publisher<VoiceServerUpdate>,
    pub state_update: Publisher<VoiceStateUpdate>,
}

#[async_trait]
/// Capability set a voice connection needs from a main gateway.
///
/// Implementations exist per main gateway flavor; tests drive a
/// [PayloadSenderAdapter] by hand.
pub trait VoiceUpdateAdapter: Send + Sync + Debug {
    /// Emits an opcode 4 voice state update on the main gateway.
    ///
    /// Returns false if the gateway could not take the payload.
    async fn send_voice_state(&self, update: UpdateVoiceState) -> bool;

    /// The event registry to subscribe for [VoiceServerUpdate] and
    /// [VoiceStateUpdate] dispatches.
    fn events(&self) -> Arc<Mutex<VoiceUpdateEvents>>;

    /// Detaches the adapter from its gateway; subsequent sends fail.
    async fn destroy(&self);
}

#[derive(Debug)]
/// Bridges an arbitrary main gateway implementation into a
/// [VoiceUpdateAdapter].
///
/// Serialized opcode 4 payloads leave through the channel given at
/// construction; the host's dispatch loop calls [Self::feed_server_update]
/// and [Self::feed_state_update] for the two voice events it sees.
pub struct PayloadSenderAdapter {
    payload_send: mpsc::Sender<String>,
    events: Arc<Mutex<VoiceUpdateEvents>>,
    destroyed: AtomicBool,
}

impl PayloadSenderAdapter {
    pub fn new(payload_send: mpsc::Sender<String>) -> Self {
        Self {
            payload_send,
            events: Arc::new(Mutex::new(VoiceUpdateEvents::default())),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Hands a received VOICE_SERVER_UPDATE dispatch to the subscribers.
    pub async fn feed_server_update(&self, update: VoiceServerUpdate) {
        self.events.lock().await.server_update.publish(update).await;
    }

    /// Hands a received VOICE_STATE_UPDATE dispatch to the subscribers.
    pub async fn feed_state_update(&self, update: VoiceStateUpdate) {
        self.events.lock().await.state_update.publish(update).await;
    }
}

#[async_trait]
impl VoiceUpdateAdapter for PayloadSenderAdapter {
    async fn send_voice_state(&self, update: UpdateVoiceState) -> bool {
        if self.destroyed.load(Ordering::Relaxed) {
            return false;
        }

        let payload = json!({
            "op": GATEWAY_UPDATE_VOICE_STATE,
            "d": update,
        })
        .to_string();

        trace!("Sending voice state update: {}", payload);

        self.payload_send.send(payload).await.is_ok()
    }

    fn events(&self) -> Arc<Mutex<VoiceUpdateEvents>> {
        self.events.clone()
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::Relaxed);
    }
}
