// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A client library for Discord-compatible voice channels.
//!
//! descant implements the client side of the voice protocol: the opcode 4
//! exchange with a main gateway (through an adapter, descant runs no main
//! gateway itself), the voice gateway websocket, ip discovery and encrypted
//! rtp over UDP, plus a 20 ms scheduler to pace pre-encoded Opus audio into
//! one or more connections.
//!
//! The entry point is [connection::VoiceConnection]; give it channel
//! coordinates and a [adapter::VoiceUpdateAdapter] and call `connect`.

#![allow(clippy::module_inception)]

pub mod adapter;
pub mod connection;
pub mod constants;
mod crypto;
pub mod errors;
pub mod gateway;
pub mod metrics;
pub mod scheduler;
pub mod types;
pub mod udp;
pub mod voice_data;

// Pub use this so users can interact with packet types if they want
pub use discortp;
