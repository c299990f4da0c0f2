// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Defines cryptography functions used within the voice implementation.
//!
//! All functions in this module return a 24 byte long `Vec<u8>`.

use getrandom::getrandom;

use crate::errors::VoiceUdpError;

/// Gets an `xsalsa20_poly1305` nonce from an rtp packet.
///
/// The first 12 bytes are the rtp header, zero padded to the nonce size.
///
/// See <https://discord-userdoccers.vercel.app/topics/voice-connections#encryption-mode>
pub(crate) fn get_xsalsa20_poly1305_nonce(packet: &[u8]) -> Vec<u8> {
    let mut rtp_header = Vec::with_capacity(24);
    rtp_header.append(&mut packet[0..12].to_vec());

    // The header is only 12 bytes, but the nonce has to be 24
    while rtp_header.len() < 24 {
        rtp_header.push(0);
    }

    rtp_header
}

/// Gets an `xsalsa20_poly1305_suffix` nonce from an rtp packet.
///
/// The nonce is the last 24 bytes of the packet.
///
/// See <https://discord-userdoccers.vercel.app/topics/voice-connections#encryption-mode>
pub(crate) fn get_xsalsa20_poly1305_suffix_nonce(packet: &[u8]) -> Vec<u8> {
    let mut nonce = Vec::with_capacity(24);

    nonce.append(&mut packet[(packet.len() - 24)..packet.len()].to_vec());

    nonce
}

/// Gets an `xsalsa20_poly1305_lite` nonce from an rtp packet.
///
/// The packet ends in a 4 byte counter value, zero padded to the nonce size.
///
/// See <https://discord-userdoccers.vercel.app/topics/voice-connections#encryption-mode>
pub(crate) fn get_xsalsa20_poly1305_lite_nonce(packet: &[u8]) -> Vec<u8> {
    let mut nonce = Vec::with_capacity(24);

    nonce.append(&mut packet[(packet.len() - 4)..packet.len()].to_vec());

    // The suffix is only 4 bytes, but the nonce has to be 24
    while nonce.len() < 24 {
        nonce.push(0);
    }

    nonce
}

/// Builds an `xsalsa20_poly1305_lite` nonce for the send path.
///
/// The counter is encoded big endian and zero padded to the nonce size; its
/// first 4 bytes are also what gets appended to the packet as the trailer.
pub(crate) fn make_xsalsa20_poly1305_lite_nonce(counter: u32) -> Vec<u8> {
    let mut nonce = counter.to_be_bytes().to_vec();

    while nonce.len() < 24 {
        nonce.push(0);
    }

    nonce
}

/// Generates a random `xsalsa20_poly1305_suffix` nonce for the send path.
///
/// The whole 24 bytes are appended to the packet as the trailer.
pub(crate) fn generate_xsalsa20_poly1305_suffix_nonce() -> Result<Vec<u8>, VoiceUdpError> {
    let mut nonce: Vec<u8> = vec![0; 24];

    getrandom(&mut nonce).map_err(|e| VoiceUdpError::FailedNonceGeneration {
        error: format!("{:?}", e),
    })?;

    Ok(nonce)
}
