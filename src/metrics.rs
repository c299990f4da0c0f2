// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-connection packet counters.
//!
//! Packet-level problems never kill a voice connection; they end up here
//! instead, where the caller can watch them.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
/// Counters for one voice connection.
///
/// All counters are monotonic for the lifetime of the connection and survive
/// session replacement.
pub struct ConnectionMetrics {
    /// Audio packets that made it onto the socket
    pub packets_sent: AtomicU64,
    /// Audio packets dropped before the socket, for whatever reason
    pub packets_dropped: AtomicU64,
    /// Outbound packets lost to encryption failures
    pub encrypt_failures: AtomicU64,
    /// Inbound packets lost to decryption failures
    pub decrypt_failures: AtomicU64,
    /// Keep-alive probes that were never answered
    pub keepalives_missed: AtomicU64,
}

impl ConnectionMetrics {
    pub(crate) fn count(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
