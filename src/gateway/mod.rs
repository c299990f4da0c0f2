// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The websocket connection to a voice server: identify / resume, heartbeats
//! and the events the server dispatches to us.

pub mod backends;
pub mod events;
pub mod gateway;
pub mod handle;
pub mod heartbeat;
pub mod message;

pub use backends::*;
pub use gateway::*;
pub use handle::*;
pub use message::*;
