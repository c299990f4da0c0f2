// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Defines the UDP component of voice communications, sending and receiving raw rtp data.

use std::time::Duration;

use crate::errors::VoiceUdpError;

/// See <https://discord-userdoccers.vercel.app/topics/voice-connections#voice-packet-structure>
/// This always adds up to 12 bytes
const RTP_HEADER_SIZE: u8 = 12;

/// The poly1305 authentication tag appended to every ciphertext
const AEAD_TAG_SIZE: usize = 16;

/// Largest datagram we will build or accept on the voice socket
const MAX_PACKET_SIZE: usize = 1460;

/// Largest Opus frame that still fits into a packet, together with the rtp
/// header, the aead tag and the longest possible nonce trailer
pub const MAX_OPUS_FRAME_SIZE: usize = MAX_PACKET_SIZE - RTP_HEADER_SIZE as usize - AEAD_TAG_SIZE - 24;

/// How often a keep-alive probe is sent to the voice server
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// How many unanswered probes in a row mean the transport has gone stale
const KEEPALIVE_MISS_LIMIT: u8 = 5;

/// A keep-alive datagram is a little endian counter plus four bytes of zero padding
const KEEPALIVE_PACKET_SIZE: usize = 8;

/// How long the voice server gets to answer our ip discovery request
const IP_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

pub mod backends;
pub mod events;
pub mod handle;
pub mod handler;
mod keepalive;

pub use backends::*;
pub use handle::*;
pub use handler::*;

/// Reads the external address an ip discovery reply carries: a null padded
/// ascii address field and a port.
pub(crate) fn parse_discovery_address(
    discovery: &discortp::discord::IpDiscovery,
) -> Result<(String, u16), VoiceUdpError> {
    let terminator = discovery
        .address
        .iter()
        .position(|&byte| byte == 0)
        .unwrap_or(discovery.address.len());

    let address = std::str::from_utf8(&discovery.address[..terminator])
        .map_err(|_| VoiceUdpError::MalformedIpDiscoveryReply)?
        .to_string();

    if address.is_empty() {
        return Err(VoiceUdpError::MalformedIpDiscoveryReply);
    }

    Ok((address, discovery.port))
}

#[cfg(test)]
mod tests {
    use discortp::discord::IpDiscovery;

    use super::parse_discovery_address;

    #[test]
    fn parses_null_padded_address() {
        let mut address = b"198.51.100.2".to_vec();
        address.resize(64, 0);

        let discovery = IpDiscovery {
            pkt_type: discortp::discord::IpDiscoveryType::Response,
            length: 70,
            ssrc: 12345,
            address,
            port: 49152,
            payload: Vec::new(),
        };

        let (parsed_address, port) = parse_discovery_address(&discovery).unwrap();
        assert_eq!(parsed_address, "198.51.100.2");
        assert_eq!(port, 49152);
    }

    #[test]
    fn rejects_empty_address() {
        let discovery = IpDiscovery {
            pkt_type: discortp::discord::IpDiscoveryType::Response,
            length: 70,
            ssrc: 12345,
            address: vec![0; 64],
            port: 49152,
            payload: Vec::new(),
        };

        assert!(parse_discovery_address(&discovery).is_err());
    }
}
