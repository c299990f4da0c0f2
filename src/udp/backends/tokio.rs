// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::errors::VoiceUdpError;

#[derive(Debug, Clone)]
pub struct TokioBackend;

pub type TokioSocket = tokio::net::UdpSocket;

impl TokioBackend {
    /// Binds a fresh local socket and connects it to the voice server.
    ///
    /// The host may be a literal address or a resolvable name; resolution is
    /// left to the runtime.
    pub async fn connect(host: &str, port: u16) -> Result<TokioSocket, VoiceUdpError> {
        // Bind with a port number of 0, so the os assigns this listener a port
        let udp_socket = TokioSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| VoiceUdpError::CannotBind {
                error: format!("{:?}", e),
            })?;

        udp_socket
            .connect((host, port))
            .await
            .map_err(|e| VoiceUdpError::CannotConnect {
                error: format!("{:?}", e),
            })?;

        Ok(udp_socket)
    }
}
