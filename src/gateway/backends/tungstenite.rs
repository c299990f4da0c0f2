// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use futures_util::{
    stream::{SplitSink, SplitStream},
    StreamExt,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

use crate::errors::VoiceGatewayError;
use crate::types::VoiceCloseCode;
use crate::gateway::{VoiceGatewayCommunication, VoiceGatewayMessage};

#[derive(Debug, Clone)]
pub struct TungsteniteBackend;

pub type TungsteniteSink =
    SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>;
pub type TungsteniteStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

impl TungsteniteBackend {
    pub async fn connect(
        websocket_url: &str,
    ) -> Result<(TungsteniteSink, TungsteniteStream), VoiceGatewayError> {
        let (websocket_stream, _) = connect_async(websocket_url).await.map_err(|e| {
            VoiceGatewayError::CannotConnect {
                error: format!("{:?}", e),
            }
        })?;

        Ok(websocket_stream.split())
    }
}

impl From<VoiceGatewayMessage> for tungstenite::Message {
    fn from(message: VoiceGatewayMessage) -> Self {
        Self::Text(message.0)
    }
}

impl From<tungstenite::Message> for VoiceGatewayMessage {
    fn from(value: tungstenite::Message) -> Self {
        Self(value.to_string())
    }
}

impl From<tungstenite::Message> for VoiceGatewayCommunication {
    fn from(value: tungstenite::Message) -> Self {
        match value {
            tungstenite::Message::Text(text) => {
                VoiceGatewayCommunication::Message(VoiceGatewayMessage(text))
            }
            tungstenite::Message::Close(close_frame) => {
                let Some(close_frame) = close_frame else {
                    // A close without a frame gives us nothing to act on;
                    // treat it as an unknown abnormal close
                    return VoiceGatewayCommunication::Error(VoiceCloseCode::Unknown(1005));
                };

                let close_code = u16::from(close_frame.code);

                VoiceGatewayCommunication::Error(VoiceCloseCode::from(close_code))
            }
            _ => VoiceGatewayCommunication::Error(VoiceCloseCode::FailedToDecodePayload),
        }
    }
}
