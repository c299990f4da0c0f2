// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use crypto_secretbox::aead::Aead;
use crypto_secretbox::cipher::generic_array::GenericArray;
use crypto_secretbox::KeyInit;
use crypto_secretbox::XSalsa20Poly1305;

use discortp::demux::Demuxed;
use discortp::discord::{
    IpDiscovery, IpDiscoveryPacket, IpDiscoveryType, MutableIpDiscoveryPacket,
};
use discortp::rtcp::report::ReceiverReport;
use discortp::rtcp::report::SenderReport;
use discortp::{demux::demux, Packet};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use super::keepalive::{self, KeepaliveState};
use super::UdpBackend;
use super::UdpSocket;

use super::{AEAD_TAG_SIZE, IP_DISCOVERY_TIMEOUT, KEEPALIVE_PACKET_SIZE, MAX_PACKET_SIZE, RTP_HEADER_SIZE};
use crate::errors::VoiceUdpError;
use crate::metrics::ConnectionMetrics;
use crate::types::{SessionDescription, VoiceEncryptionMode};
use crate::voice_data::VoiceData;

use crate::crypto::{
    get_xsalsa20_poly1305_lite_nonce, get_xsalsa20_poly1305_nonce,
    get_xsalsa20_poly1305_suffix_nonce,
};

use super::{events::VoiceUDPEvents, UdpHandle};

use log::*;

#[derive(Debug)]
/// The main UDP struct, which handles receiving, parsing and decrypting the rtp packets
pub struct UdpHandler {
    events: Arc<Mutex<VoiceUDPEvents>>,
    pub data: Arc<RwLock<VoiceData>>,
    socket: Arc<UdpSocket>,
    metrics: Arc<ConnectionMetrics>,
    keepalive_state: Arc<Mutex<KeepaliveState>>,
    kill_receive: tokio::sync::broadcast::Receiver<()>,
}

impl UdpHandler {
    /// Spawns a new UDP handler, performs ip discovery and starts the
    /// keep-alive probing.
    ///
    /// Mutates the given data_reference with the ip discovery result.
    pub async fn spawn(
        data_reference: Arc<RwLock<VoiceData>>,
        metrics: Arc<ConnectionMetrics>,
        host: &str,
        port: u16,
        ssrc: u32,
    ) -> Result<UdpHandle, VoiceUdpError> {
        let udp_socket = UdpBackend::connect(host, port).await?;

        // First perform ip discovery
        let ip_discovery = IpDiscovery {
            pkt_type: IpDiscoveryType::Request,
            ssrc,
            length: 70,
            address: Vec::new(),
            port: 0,
            payload: Vec::new(),
        };

        // Minimum size with an empty Address value, + 64 bytes for the actual address size
        let size = IpDiscoveryPacket::minimum_packet_size() + 64;

        let mut buf: Vec<u8> = vec![0; size];

        // Safety: expect is justified here, since this is an error which should never happen.
        // If this errors, the code at fault is the buffer size calculation.
        let mut ip_discovery_packet = MutableIpDiscoveryPacket::new(&mut buf)
            .expect("Mangled ip discovery packet creation buffer, something is very wrong");

        ip_discovery_packet.populate(&ip_discovery);

        let data = ip_discovery_packet.packet();

        debug!("VUDP: Sending ip discovery request");

        udp_socket
            .send(data)
            .await
            .map_err(|e| VoiceUdpError::BrokenSocket {
                error: format!("{:?}", e),
            })?;

        // Handle the ip discovery response, which the server owes us within
        // the deadline
        let receive_result = timeout(IP_DISCOVERY_TIMEOUT, udp_socket.recv(&mut buf)).await;

        let received_size = match receive_result {
            Ok(Ok(received_size)) => received_size,
            Ok(Err(e)) => {
                return Err(VoiceUdpError::BrokenSocket {
                    error: format!("{:?}", e),
                });
            }
            Err(_) => {
                warn!("VUDP: Ip discovery was not answered within the deadline");
                return Err(VoiceUdpError::IpDiscoveryTimeout);
            }
        };

        let received_ip_discovery = IpDiscoveryPacket::new(&buf[0..received_size])
            .ok_or(VoiceUdpError::MalformedIpDiscoveryReply)?;

        if received_ip_discovery.get_pkt_type() != IpDiscoveryType::Response {
            return Err(VoiceUdpError::MalformedIpDiscoveryReply);
        }

        debug!("VUDP: Received ip discovery: {:?}", received_ip_discovery);

        let ip_discovery = IpDiscovery {
            pkt_type: received_ip_discovery.get_pkt_type(),
            length: received_ip_discovery.get_length(),
            ssrc: received_ip_discovery.get_ssrc(),
            address: received_ip_discovery.get_address(),
            port: received_ip_discovery.get_port(),
            payload: Vec::new(),
        };

        let mut data_reference_lock = data_reference.write().await;
        data_reference_lock.ip_discovery = Some(ip_discovery);
        drop(data_reference_lock);

        let socket = Arc::new(udp_socket);

        let events = VoiceUDPEvents::default();
        let shared_events = Arc::new(Mutex::new(events));

        let keepalive_state = Arc::new(Mutex::new(KeepaliveState::default()));

        let (kill_send, kill_receive) = tokio::sync::broadcast::channel::<()>(16);

        let mut handler = UdpHandler {
            events: shared_events.clone(),
            data: data_reference.clone(),
            socket: socket.clone(),
            metrics: metrics.clone(),
            keepalive_state: keepalive_state.clone(),
            kill_receive,
        };

        // Now we can continuously check for messages in a different task
        tokio::spawn(async move {
            handler.listen_task().await;
        });

        tokio::spawn(keepalive::keepalive_task(
            socket.clone(),
            keepalive_state.clone(),
            shared_events.clone(),
            metrics.clone(),
            kill_send.subscribe(),
        ));

        Ok(UdpHandle {
            events: shared_events,
            socket,
            data: data_reference,
            metrics,
            keepalive_state,
            kill_send,
        })
    }

    /// The main listen task;
    ///
    /// Receives UDP messages and parses them.
    async fn listen_task(&mut self) {
        loop {
            let mut buf: Vec<u8> = vec![0; MAX_PACKET_SIZE];

            tokio::select! {
                Ok(_) = self.kill_receive.recv() => {
                    trace!("VUDP: Closing listener task");
                    break;
                }
                result = self.socket.recv(&mut buf) => {
                    match result {
                        Ok(size) => self.handle_message(&buf[0..size]).await,
                        Err(e) => {
                            warn!("VUDP: Voice UDP is broken, closing connection: {:?}", e);
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Handles a message buf
    async fn handle_message(&self, buf: &[u8]) {
        // Keep-alive replies mirror our probes and are the only 8 byte
        // datagrams on this socket
        if buf.len() == KEEPALIVE_PACKET_SIZE {
            keepalive::handle_reply(&self.keepalive_state, &self.events, buf).await;
            return;
        }

        let parsed = demux(buf);

        match parsed {
            Demuxed::Rtp(rtp) => {
                trace!("VUDP: Parsed packet as rtp");

                let session_description_result =
                    self.data.read().await.session_description.clone();

                // We are trying to decrypt, but have not received SessionDescription yet,
                // which contains the secret key
                let Some(session_description) = session_description_result else {
                    warn!("VUDP: Received encrypted voice data, but no encryption key, CANNOT DECRYPT!");
                    return;
                };

                let decryption_result =
                    UdpHandler::decrypt_rtp_packet_payload(&rtp, &session_description);

                let decrypted = match decryption_result {
                    Ok(decrypted) => decrypted,
                    Err(err) => {
                        ConnectionMetrics::count(&self.metrics.decrypt_failures);
                        match err {
                            VoiceUdpError::FailedDecryption => {
                                warn!("VUDP: Failed to decrypt voice data!");
                            }
                            other => {
                                error!("VUDP: Failed to decrypt voice data: {}", other);
                            }
                        }
                        return;
                    }
                };

                trace!("VUDP: Successfully decrypted voice data!");

                let rtp_with_decrypted_data = discortp::rtp::Rtp {
                    ssrc: rtp.get_ssrc(),
                    marker: rtp.get_marker(),
                    version: rtp.get_version(),
                    padding: rtp.get_padding(),
                    sequence: rtp.get_sequence(),
                    extension: rtp.get_extension(),
                    timestamp: rtp.get_timestamp(),
                    csrc_list: rtp.get_csrc_list(),
                    csrc_count: rtp.get_csrc_count(),
                    payload_type: rtp.get_payload_type(),
                    payload: decrypted,
                };

                self.events
                    .lock()
                    .await
                    .rtp
                    .publish(rtp_with_decrypted_data)
                    .await;
            }
            Demuxed::Rtcp(rtcp) => {
                trace!("VUDP: Parsed packet as rtcp");

                let rtcp_data = match rtcp {
                    discortp::rtcp::RtcpPacket::KnownType(knowntype) => {
                        discortp::rtcp::Rtcp::KnownType(knowntype)
                    }
                    discortp::rtcp::RtcpPacket::SenderReport(senderreport) => {
                        discortp::rtcp::Rtcp::SenderReport(SenderReport {
                            payload: senderreport.payload().to_vec(),
                            padding: senderreport.get_padding(),
                            version: senderreport.get_version(),
                            ssrc: senderreport.get_ssrc(),
                            pkt_length: senderreport.get_pkt_length(),
                            packet_type: senderreport.get_packet_type(),
                            rx_report_count: senderreport.get_rx_report_count(),
                        })
                    }
                    discortp::rtcp::RtcpPacket::ReceiverReport(receiverreport) => {
                        discortp::rtcp::Rtcp::ReceiverReport(ReceiverReport {
                            payload: receiverreport.payload().to_vec(),
                            padding: receiverreport.get_padding(),
                            version: receiverreport.get_version(),
                            ssrc: receiverreport.get_ssrc(),
                            pkt_length: receiverreport.get_pkt_length(),
                            packet_type: receiverreport.get_packet_type(),
                            rx_report_count: receiverreport.get_rx_report_count(),
                        })
                    }
                    _ => {
                        trace!("VUDP: Received unhandled rtcp packet kind, dropping");
                        return;
                    }
                };

                self.events.lock().await.rtcp.publish(rtcp_data).await;
            }
            Demuxed::FailedParse(e) => {
                trace!("VUDP: Failed to parse packet: {:?}", e);
            }
            Demuxed::TooSmall => {
                trace!("VUDP: Received packet too small to parse, dropping");
            }
        }
    }

    /// Decrypts an encrypted rtp packet, returning a decrypted copy of the packet's payload
    /// bytes.
    ///
    /// # Errors
    /// If the given session description carries an encryption mode we cannot
    /// use, this returns a [VoiceUdpError::EncryptionModeNotImplemented] error.
    ///
    /// If the decryption fails, this returns a [VoiceUdpError::FailedDecryption].
    pub fn decrypt_rtp_packet_payload(
        rtp: &discortp::rtp::RtpPacket<'_>,
        session_description: &SessionDescription,
    ) -> Result<Vec<u8>, VoiceUdpError> {
        let packet_bytes = rtp.packet();

        let mut ciphertext: Vec<u8> =
            packet_bytes[(RTP_HEADER_SIZE as usize)..packet_bytes.len()].to_vec();

        let trailer_length = match session_description.encryption_mode {
            VoiceEncryptionMode::Xsalsa20Poly1305 => 0,
            VoiceEncryptionMode::Xsalsa20Poly1305Suffix => 24,
            VoiceEncryptionMode::Xsalsa20Poly1305Lite => 4,
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

        // A valid packet carries at least the nonce trailer and the aead tag
        if ciphertext.len() < trailer_length + AEAD_TAG_SIZE {
            return Err(VoiceUdpError::FailedDecryption);
        }

        let nonce_bytes = match session_description.encryption_mode {
            VoiceEncryptionMode::Xsalsa20Poly1305 => get_xsalsa20_poly1305_nonce(packet_bytes),
            VoiceEncryptionMode::Xsalsa20Poly1305Suffix => {
                // Remove the suffix from the ciphertext
                ciphertext = ciphertext[0..ciphertext.len() - 24].to_vec();
                get_xsalsa20_poly1305_suffix_nonce(packet_bytes)
            }
            VoiceEncryptionMode::Xsalsa20Poly1305Lite => {
                // Remove the suffix from the ciphertext
                ciphertext = ciphertext[0..ciphertext.len() - 4].to_vec();
                get_xsalsa20_poly1305_lite_nonce(packet_bytes)
            }
            _ => unreachable!("unimplemented modes were rejected above"),
        };

        let key = GenericArray::from_slice(&session_description.secret_key);
        let nonce = GenericArray::from_slice(&nonce_bytes);

        let decryptor = XSalsa20Poly1305::new(key);

        // Note: this may seem like we are throwing away valuable error handling data,
        // but the decryption error provides no extra info.
        decryptor
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| VoiceUdpError::FailedDecryption)
    }
}
