// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;
use std::time::Duration;

use crypto_secretbox::{
    aead::Aead, cipher::generic_array::GenericArray, KeyInit, XSalsa20Poly1305,
};
use discortp::Packet;

use log::*;

use tokio::{sync::Mutex, sync::RwLock};

use super::keepalive::KeepaliveState;
use super::UdpSocket;

use crate::constants::TIMESTAMP_STEP;
use crate::{
    errors::VoiceUdpError,
    metrics::ConnectionMetrics,
    types::{SessionDescription, VoiceEncryptionMode},
    voice_data::VoiceData,
};

use crate::crypto::{
    generate_xsalsa20_poly1305_suffix_nonce, get_xsalsa20_poly1305_nonce,
    make_xsalsa20_poly1305_lite_nonce,
};

use super::{events::VoiceUDPEvents, MAX_OPUS_FRAME_SIZE, RTP_HEADER_SIZE};

/// Handle to a voice UDP connection
///
/// Can be safely cloned and will still correspond to the same connection.
#[derive(Debug, Clone)]
pub struct UdpHandle {
    pub events: Arc<Mutex<VoiceUDPEvents>>,
    pub(super) socket: Arc<UdpSocket>,
    pub data: Arc<RwLock<VoiceData>>,
    pub(crate) metrics: Arc<ConnectionMetrics>,
    pub(super) keepalive_state: Arc<Mutex<KeepaliveState>>,
    /// Tells udp tasks to close
    pub(super) kill_send: tokio::sync::broadcast::Sender<()>,
}

impl UdpHandle {
    /// Constructs and sends one frame of encoded opus rtp data.
    ///
    /// Builds an [RtpPacket](discortp::rtp::RtpPacket) at the current rtp
    /// cursor position, encrypts it and sends it. The cursor advances only
    /// when a packet actually went out.
    ///
    /// # Errors
    /// If the frame does not fit into a single packet, this returns a
    /// [VoiceUdpError::PacketTooLarge] error.
    ///
    /// If we do not have VoiceReady data, which contains our ssrc, this returns a
    /// [VoiceUdpError::NoData] error.
    ///
    /// If we have not received an encryption key, this returns a
    /// [VoiceUdpError::NoKey] error.
    ///
    /// If the UDP socket is broken, this returns a [VoiceUdpError::BrokenSocket] error.
    pub async fn send_opus_data(&self, payload: Vec<u8>) -> Result<(), VoiceUdpError> {
        if payload.len() > MAX_OPUS_FRAME_SIZE {
            return Err(VoiceUdpError::PacketTooLarge {
                size: payload.len(),
                max: MAX_OPUS_FRAME_SIZE,
            });
        }

        let mut data_lock = self.data.write().await;

        let ssrc = data_lock
            .ready_data
            .as_ref()
            .ok_or(VoiceUdpError::NoData)?
            .ssrc;

        let session_description = data_lock
            .session_description
            .clone()
            .ok_or(VoiceUdpError::NoKey)?;

        let cursor = data_lock.cursor;

        let payload_len = payload.len();

        let rtp_data = discortp::rtp::Rtp {
            // Always the same
            version: 2,
            padding: 0,
            extension: 0,
            csrc_count: 0,
            csrc_list: Vec::new(),
            marker: 0,
            payload_type: discortp::rtp::RtpType::Dynamic(120),
            // Actually variable
            sequence: cursor.sequence.into(),
            timestamp: cursor.timestamp.into(),
            ssrc,
            payload,
        };

        let buffer_size = payload_len + RTP_HEADER_SIZE as usize;

        let mut buffer = vec![0; buffer_size];

        let mut rtp_packet = discortp::rtp::MutableRtpPacket::new(&mut buffer)
            .expect("Mangled rtp packet creation buffer, something is very wrong");
        rtp_packet.populate(&rtp_data);

        let encrypted_buffer = UdpHandle::encrypt_rtp_packet_payload(
            &rtp_packet,
            &session_description,
            cursor.nonce_counter,
        )?;

        // The packet exists now, so the cursor moves: sequence and timestamp
        // always, the nonce counter only when lite mode consumed it
        data_lock.cursor.sequence = cursor.sequence.wrapping_add(1);
        data_lock.cursor.timestamp = cursor.timestamp.wrapping_add(TIMESTAMP_STEP);

        if session_description.encryption_mode == VoiceEncryptionMode::Xsalsa20Poly1305Lite {
            data_lock.cursor.nonce_counter = cursor.nonce_counter.wrapping_add(1);
        }

        drop(data_lock);

        let encrypted_packet = discortp::rtp::RtpPacket::new(&encrypted_buffer)
            .expect("Mangled encrypted packet buffer, something is very wrong");

        self.send_encrypted_rtp_packet(encrypted_packet).await
    }

    /// Encrypts an unencrypted rtp packet, returning a copy of the packet's
    /// bytes with an encrypted payload and the mode's nonce trailer appended.
    ///
    /// # Errors
    /// If the session description carries an encryption mode we cannot use,
    /// this returns a [VoiceUdpError::EncryptionModeNotImplemented] error.
    ///
    /// When using voice encryption modes which require nonce generation, and
    /// said generation fails, this returns a
    /// [VoiceUdpError::FailedNonceGeneration] error.
    pub fn encrypt_rtp_packet_payload(
        packet: &discortp::rtp::MutableRtpPacket<'_>,
        session_description: &SessionDescription,
        nonce_counter: u32,
    ) -> Result<Vec<u8>, VoiceUdpError> {
        let payload = packet.payload();

        let (nonce_bytes, trailer_length) = match session_description.encryption_mode {
            // The nonce is the rtp header itself, no trailer needed
            VoiceEncryptionMode::Xsalsa20Poly1305 => {
                (get_xsalsa20_poly1305_nonce(packet.packet()), 0)
            }
            // 24 random bytes, all of which travel as the trailer
            VoiceEncryptionMode::Xsalsa20Poly1305Suffix => {
                (generate_xsalsa20_poly1305_suffix_nonce()?, 24)
            }
            // "Incremental 4 bytes (32bit) int value"; only the counter bytes
            // travel as the trailer
            VoiceEncryptionMode::Xsalsa20Poly1305Lite => {
                (make_xsalsa20_poly1305_lite_nonce(nonce_counter), 4)
            }
            other => {
                error!(
                    "This voice encryption mode ({:?}) is not yet implemented.",
                    other
                );
                return Err(VoiceUdpError::EncryptionModeNotImplemented {
                    encryption_mode: format!("{:?}", other),
                });
            }
        };

        let key = GenericArray::from_slice(&session_description.secret_key);
        let nonce = GenericArray::from_slice(&nonce_bytes);

        let encryptor = XSalsa20Poly1305::new(key);

        let mut encrypted_payload = encryptor
            .encrypt(nonce, payload)
            .map_err(|_| VoiceUdpError::FailedEncryption)?;

        encrypted_payload.extend_from_slice(&nonce_bytes[0..trailer_length]);

        // We need to allocate a new buffer, since the old one is too small for our new encrypted
        // data
        let buffer_size = encrypted_payload.len() + RTP_HEADER_SIZE as usize;

        let mut new_buffer: Vec<u8> = Vec::with_capacity(buffer_size);

        let mut rtp_header = packet.packet().to_vec()[0..RTP_HEADER_SIZE as usize].to_vec();

        new_buffer.append(&mut rtp_header);
        new_buffer.append(&mut encrypted_payload);

        Ok(new_buffer)
    }

    /// Sends an (already encrypted) rtp packet to the connection.
    ///
    /// # Errors
    /// If the Udp socket is broken, this returns a [VoiceUdpError::BrokenSocket] error.
    pub async fn send_encrypted_rtp_packet(
        &self,
        packet: discortp::rtp::RtpPacket<'_>,
    ) -> Result<(), VoiceUdpError> {
        let raw_bytes = packet.packet();

        self.socket
            .send(raw_bytes)
            .await
            .map_err(|e| VoiceUdpError::BrokenSocket {
                error: format!("{:?}", e),
            })?;

        trace!("VUDP: Sent rtp packet!");

        Ok(())
    }

    /// The most recently measured round trip time to the voice server, if a
    /// keep-alive probe has been answered yet.
    pub async fn ping(&self) -> Option<Duration> {
        self.keepalive_state.lock().await.ping
    }

    /// Stops the listen and keep-alive tasks and releases the socket.
    pub fn close(&self) {
        self.kill_send.send(()).ok();
    }
}

#[cfg(test)]
mod tests {
    use discortp::rtp::{MutableRtpPacket, RtpPacket};

    use super::UdpHandle;
    use crate::errors::VoiceUdpError;
    use crate::types::{SessionDescription, VoiceEncryptionMode};
    use crate::udp::handler::UdpHandler;
    use crate::udp::RTP_HEADER_SIZE;

    fn test_packet_buffer(payload: &[u8]) -> Vec<u8> {
        let mut buffer = vec![0; payload.len() + RTP_HEADER_SIZE as usize];
        let mut packet = MutableRtpPacket::new(&mut buffer).unwrap();
        packet.populate(&discortp::rtp::Rtp {
            version: 2,
            padding: 0,
            extension: 0,
            csrc_count: 0,
            csrc_list: Vec::new(),
            marker: 0,
            payload_type: discortp::rtp::RtpType::Dynamic(120),
            sequence: 5.into(),
            timestamp: 960.into(),
            ssrc: 12345,
            payload: payload.to_vec(),
        });
        buffer
    }

    fn description(mode: VoiceEncryptionMode) -> SessionDescription {
        SessionDescription {
            encryption_mode: mode,
            secret_key: [0xAB; 32],
        }
    }

    #[test]
    // Encrypt then decrypt round trips the payload in every implemented mode
    fn encrypt_decrypt_round_trip() {
        let payload = [0xF8, 0xFF, 0xFE];

        for mode in [
            VoiceEncryptionMode::Xsalsa20Poly1305,
            VoiceEncryptionMode::Xsalsa20Poly1305Suffix,
            VoiceEncryptionMode::Xsalsa20Poly1305Lite,
        ] {
            let mut buffer = test_packet_buffer(&payload);
            let packet = MutableRtpPacket::new(&mut buffer).unwrap();

            let encrypted =
                UdpHandle::encrypt_rtp_packet_payload(&packet, &description(mode), 7).unwrap();

            let encrypted_packet = RtpPacket::new(&encrypted).unwrap();
            let decrypted =
                UdpHandler::decrypt_rtp_packet_payload(&encrypted_packet, &description(mode))
                    .unwrap();

            assert_eq!(decrypted, payload, "round trip failed for {:?}", mode);
        }
    }

    #[test]
    // Any single bit flip in the ciphertext must fail authentication
    fn bit_flip_fails_decryption() {
        let payload = [1, 2, 3, 4, 5];
        let mut buffer = test_packet_buffer(&payload);
        let packet = MutableRtpPacket::new(&mut buffer).unwrap();

        let mode = VoiceEncryptionMode::Xsalsa20Poly1305Lite;
        let encrypted =
            UdpHandle::encrypt_rtp_packet_payload(&packet, &description(mode), 7).unwrap();

        for bit in 0..((encrypted.len() - RTP_HEADER_SIZE as usize - 4) * 8) {
            let mut mutated = encrypted.clone();
            let index = RTP_HEADER_SIZE as usize + bit / 8;
            mutated[index] ^= 1 << (bit % 8);

            let mutated_packet = RtpPacket::new(&mutated).unwrap();
            assert_eq!(
                UdpHandler::decrypt_rtp_packet_payload(&mutated_packet, &description(mode)),
                Err(VoiceUdpError::FailedDecryption),
                "bit flip at ciphertext bit {} went unnoticed",
                bit
            );
        }
    }

    #[test]
    // The lite trailer carries the big endian nonce counter used at encryption time
    fn lite_trailer_is_nonce_counter() {
        let payload = [0xF8, 0xFF, 0xFE];
        let mut buffer = test_packet_buffer(&payload);
        let packet = MutableRtpPacket::new(&mut buffer).unwrap();

        let encrypted = UdpHandle::encrypt_rtp_packet_payload(
            &packet,
            &description(VoiceEncryptionMode::Xsalsa20Poly1305Lite),
            0xDEADBEEF,
        )
        .unwrap();

        assert_eq!(&encrypted[encrypted.len() - 4..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    // The suffix trailer is the whole 24 byte nonce
    fn suffix_trailer_is_nonce() {
        let payload = [0xF8, 0xFF, 0xFE];
        let mut buffer = test_packet_buffer(&payload);
        let packet = MutableRtpPacket::new(&mut buffer).unwrap();

        let encrypted = UdpHandle::encrypt_rtp_packet_payload(
            &packet,
            &description(VoiceEncryptionMode::Xsalsa20Poly1305Suffix),
            0,
        )
        .unwrap();

        // header + tag + payload + 24 byte trailer
        assert_eq!(
            encrypted.len(),
            RTP_HEADER_SIZE as usize + 16 + payload.len() + 24
        );
    }

    #[test]
    fn unimplemented_mode_is_rejected() {
        let payload = [0xF8, 0xFF, 0xFE];
        let mut buffer = test_packet_buffer(&payload);
        let packet = MutableRtpPacket::new(&mut buffer).unwrap();

        let result = UdpHandle::encrypt_rtp_packet_payload(
            &packet,
            &description(VoiceEncryptionMode::AeadAes256Gcm),
            0,
        );

        assert!(matches!(
            result,
            Err(VoiceUdpError::EncryptionModeNotImplemented { .. })
        ));
    }
}
