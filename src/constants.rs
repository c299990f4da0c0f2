// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Timing and framing constants shared by the transport and the scheduler.

use std::time::Duration;

/// Length of one Opus audio frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// How much the rtp timestamp advances per frame: 48 kHz sample rate over
/// 50 frames per second.
pub const TIMESTAMP_STEP: u32 = 960;

/// The canonical Opus payload representing inaudible audio.
pub const OPUS_SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// How many silence frames are transmitted when audio stops, so clients do not
/// interpolate spurious sound from an abruptly ending stream.
pub const SILENCE_FRAME_COUNT: u8 = 5;
