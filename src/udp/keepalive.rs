// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Periodic keep-alive probes on the voice socket.
//!
//! Every probe is an 8 byte datagram: a little endian counter and four bytes
//! of zero padding. The server echoes it back; an answered probe yields a
//! round trip measurement, a run of unanswered probes marks the transport
//! stale.

use std::{sync::Arc, time::Duration};

use log::*;
use tokio::{
    sync::Mutex,
    time::{interval, Instant, MissedTickBehavior},
};

use crate::metrics::ConnectionMetrics;

use super::{
    events::{KeepaliveMeasurement, TransportStale, VoiceUDPEvents},
    UdpSocket, KEEPALIVE_INTERVAL, KEEPALIVE_MISS_LIMIT, KEEPALIVE_PACKET_SIZE,
};

#[derive(Debug, Default)]
pub(super) struct KeepaliveState {
    /// Counter of the next probe to send
    counter: u32,
    /// The probe we are still waiting on, if any
    outstanding: Option<(u32, Instant)>,
    /// Unanswered probes in a row
    missed: u8,
    /// The last measured round trip time
    pub(super) ping: Option<Duration>,
}

/// Sends one probe per [KEEPALIVE_INTERVAL] until killed, the socket breaks
/// or the miss limit is reached.
pub(super) async fn keepalive_task(
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<KeepaliveState>>,
    events: Arc<Mutex<VoiceUDPEvents>>,
    metrics: Arc<ConnectionMetrics>,
    mut kill_receive: tokio::sync::broadcast::Receiver<()>,
) {
    let mut ticker = interval(KEEPALIVE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Ok(_) = kill_receive.recv() => {
                trace!("VUDP: Closing keep-alive task");
                break;
            }
            _ = ticker.tick() => {}
        }

        let mut state_lock = state.lock().await;

        if state_lock.outstanding.is_some() {
            state_lock.missed += 1;
            ConnectionMetrics::count(&metrics.keepalives_missed);

            if state_lock.missed >= KEEPALIVE_MISS_LIMIT {
                let missed = state_lock.missed;
                drop(state_lock);

                warn!(
                    "VUDP: {} keep-alives in a row went unanswered, transport is stale",
                    missed
                );
                events.lock().await.stale.publish(TransportStale { missed }).await;
                break;
            }
        }

        let counter = state_lock.counter;
        state_lock.counter = counter.wrapping_add(1);
        state_lock.outstanding = Some((counter, Instant::now()));
        drop(state_lock);

        let mut buf = [0u8; KEEPALIVE_PACKET_SIZE];
        buf[0..4].copy_from_slice(&counter.to_le_bytes());

        if let Err(e) = socket.send(&buf).await {
            warn!("VUDP: Could not send keep-alive, closing: {:?}", e);
            break;
        }

        trace!("VUDP: Sent keep-alive {}", counter);
    }
}

/// Matches an 8 byte reply against the outstanding probe.
pub(super) async fn handle_reply(
    state: &Mutex<KeepaliveState>,
    events: &Mutex<VoiceUDPEvents>,
    buf: &[u8],
) {
    let counter = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);

    let mut state_lock = state.lock().await;

    if let Some((expected, sent_at)) = state_lock.outstanding {
        if expected == counter {
            let ping = sent_at.elapsed();
            state_lock.outstanding = None;
            state_lock.missed = 0;
            state_lock.ping = Some(ping);
            drop(state_lock);

            trace!("VUDP: Keep-alive {} answered in {:?}", counter, ping);
            events
                .lock()
                .await
                .measurement
                .publish(KeepaliveMeasurement { ping })
                .await;
            return;
        }
    }

    trace!("VUDP: Ignoring keep-alive reply with counter {}", counter);
}
