// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub mod tungstenite;
pub use tungstenite::*;

pub type Sink = tungstenite::TungsteniteSink;
pub type Stream = tungstenite::TungsteniteStream;
pub type WebSocketBackend = tungstenite::TungsteniteBackend;
