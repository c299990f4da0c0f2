// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt::Debug;

pub use voice::*;
pub use voice_gateway::*;

mod voice;
mod voice_gateway;

/// Marker trait for types which are sent over or received from a websocket connection.
pub trait WebSocketEvent: Send + Sync + Debug {}
