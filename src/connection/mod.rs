// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The voice connection supervisor: drives the join handshake across the main
//! gateway, the voice gateway and the UDP transport, and keeps the whole
//! stack alive afterwards.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use discortp::rtp::Rtp;
use log::*;
use pubserve::Subscriber;
use tokio::{
    sync::{mpsc, Mutex, Notify, RwLock},
    time::{sleep, timeout},
};

use crate::{
    adapter::VoiceUpdateAdapter,
    constants::{FRAME_DURATION, OPUS_SILENCE_FRAME, SILENCE_FRAME_COUNT},
    errors::{HandshakeStage, VoiceError, VoiceGatewayError, VoiceResult},
    gateway::{VoiceGateway, VoiceGatewayHandle},
    metrics::ConnectionMetrics,
    types::{
        SelectProtocol, SelectProtocolData, SessionDescription, Snowflake, Speaking,
        SpeakingBitflags, UpdateVoiceState, VoiceEncryptionMode, VoiceIdentify, VoiceProtocol,
        VoiceReady, VoiceResume, VoiceResumed, VoiceServerUpdate, VoiceStateUpdate,
    },
    udp::{
        events::TransportStale, parse_discovery_address, UdpHandle, UdpHandler,
    },
    voice_data::VoiceData,
};

pub mod events;
pub mod options;

pub use events::*;
pub use options::*;

/// How long both voice info events from the main gateway may take to arrive
const VOICE_INFO_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the voice gateway gets from opening the websocket to Ready
const GATEWAY_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the session description may take after select protocol
const SESSION_DESCRIPTION_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a Resumed acknowledgement may take
const RESUME_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff before reconnect attempt n is `n * step`, capped
const RECONNECT_BACKOFF_STEP: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where a voice connection currently stands.
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingVoiceInfo,
    Authenticating,
    EstablishingTransport,
    Ready,
    Reconnecting,
    Destroyed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::AwaitingVoiceInfo => "AwaitingVoiceInfo",
            ConnectionState::Authenticating => "Authenticating",
            ConnectionState::EstablishingTransport => "EstablishingTransport",
            ConnectionState::Ready => "Ready",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Destroyed => "Destroyed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Which membership in the voice graph this connection targets.
pub struct VoiceChannelCoordinates {
    pub guild_id: Snowflake,
    pub channel_id: Option<Snowflake>,
    pub user_id: Snowflake,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// What subcomponents drop into the supervisor mailbox.
#[derive(Debug)]
enum ConnectionSignal {
    ServerUpdate(VoiceServerUpdate),
    StateUpdate(VoiceStateUpdate),
    GatewayReady(VoiceReady),
    SessionDescription(SessionDescription),
    Resumed,
    GatewayError(VoiceGatewayError),
    TransportStale(u8),
}

/// Thin subscriber that forwards events from subcomponents into the
/// supervisor mailbox, holding no reference to the supervisor itself.
#[derive(Debug, Clone)]
struct SignalForwarder {
    signal_send: mpsc::Sender<ConnectionSignal>,
}

#[async_trait]
impl Subscriber<VoiceServerUpdate> for SignalForwarder {
    async fn update(&self, data: &VoiceServerUpdate) {
        self.signal_send
            .send(ConnectionSignal::ServerUpdate(data.clone()))
            .await
            .ok();
    }
}

#[async_trait]
impl Subscriber<VoiceStateUpdate> for SignalForwarder {
    async fn update(&self, data: &VoiceStateUpdate) {
        self.signal_send
            .send(ConnectionSignal::StateUpdate(data.clone()))
            .await
            .ok();
    }
}

#[async_trait]
impl Subscriber<VoiceReady> for SignalForwarder {
    async fn update(&self, data: &VoiceReady) {
        self.signal_send
            .send(ConnectionSignal::GatewayReady(data.clone()))
            .await
            .ok();
    }
}

#[async_trait]
impl Subscriber<SessionDescription> for SignalForwarder {
    async fn update(&self, data: &SessionDescription) {
        self.signal_send
            .send(ConnectionSignal::SessionDescription(data.clone()))
            .await
            .ok();
    }
}

#[async_trait]
impl Subscriber<VoiceResumed> for SignalForwarder {
    async fn update(&self, _data: &VoiceResumed) {
        self.signal_send.send(ConnectionSignal::Resumed).await.ok();
    }
}

#[async_trait]
impl Subscriber<VoiceGatewayError> for SignalForwarder {
    async fn update(&self, data: &VoiceGatewayError) {
        self.signal_send
            .send(ConnectionSignal::GatewayError(data.clone()))
            .await
            .ok();
    }
}

#[async_trait]
impl Subscriber<TransportStale> for SignalForwarder {
    async fn update(&self, data: &TransportStale) {
        self.signal_send
            .send(ConnectionSignal::TransportStale(data.missed))
            .await
            .ok();
    }
}

/// Republishes decrypted inbound rtp onto the connection's observer surface.
#[derive(Debug)]
struct PacketForwarder {
    events: Arc<Mutex<ConnectionEvents>>,
}

#[async_trait]
impl Subscriber<Rtp> for PacketForwarder {
    async fn update(&self, data: &Rtp) {
        self.events.lock().await.packet.publish(data.clone()).await;
    }
}

#[derive(Debug)]
/// One voice channel membership and everything needed to stream audio into it.
///
/// Owns at most one voice gateway websocket and one UDP socket at any time.
/// All reactive work (server migrations, heartbeat loss, close codes) funnels
/// through a single mailbox task; the caller-facing operations drive the
/// handshake inline.
pub struct VoiceConnection {
    pub events: Arc<Mutex<ConnectionEvents>>,
    pub metrics: Arc<ConnectionMetrics>,
    options: VoiceConnectionOptions,
    coordinates: RwLock<VoiceChannelCoordinates>,
    adapter: Arc<dyn VoiceUpdateAdapter>,
    data: Arc<RwLock<VoiceData>>,
    state: RwLock<ConnectionState>,
    gateway: Mutex<Option<VoiceGatewayHandle>>,
    udp: Mutex<Option<UdpHandle>>,
    signal_send: mpsc::Sender<ConnectionSignal>,
    /// Wakes whoever is waiting on [VoiceData] to gain a missing piece
    data_notify: Notify,
    /// A gateway error observed while a handshake step was waiting
    handshake_error: Mutex<Option<VoiceGatewayError>>,
    /// The heartbeat nonce to seed a resumed gateway with
    heartbeat_nonce: AtomicU64,
    resume_acknowledged: AtomicBool,
    speaking: AtomicBool,
    destroyed: AtomicBool,
    reconnecting: AtomicBool,
}

impl VoiceConnection {
    /// Creates a supervisor for one voice channel membership and starts its
    /// mailbox task.
    ///
    /// Nothing touches the network until [Self::connect] is called.
    pub async fn spawn(
        coordinates: VoiceChannelCoordinates,
        adapter: Arc<dyn VoiceUpdateAdapter>,
        options: VoiceConnectionOptions,
    ) -> Arc<VoiceConnection> {
        let (signal_send, signal_receive) = mpsc::channel(32);

        let data = VoiceData {
            user_id: coordinates.user_id,
            ..Default::default()
        };

        let connection = Arc::new(VoiceConnection {
            events: Arc::new(Mutex::new(ConnectionEvents::default())),
            metrics: Arc::new(ConnectionMetrics::default()),
            options,
            coordinates: RwLock::new(coordinates),
            adapter: adapter.clone(),
            data: Arc::new(RwLock::new(data)),
            state: RwLock::new(ConnectionState::Disconnected),
            gateway: Mutex::new(None),
            udp: Mutex::new(None),
            signal_send: signal_send.clone(),
            data_notify: Notify::new(),
            handshake_error: Mutex::new(None),
            heartbeat_nonce: AtomicU64::new(0),
            resume_acknowledged: AtomicBool::new(false),
            speaking: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
        });

        let forwarder = Arc::new(SignalForwarder { signal_send });
        {
            let adapter_events = adapter.events();
            let mut adapter_events = adapter_events.lock().await;
            adapter_events.server_update.subscribe(forwarder.clone());
            adapter_events.state_update.subscribe(forwarder);
        }

        let weak = Arc::downgrade(&connection);
        tokio::task::spawn(async move {
            VoiceConnection::signal_task(weak, signal_receive).await;
        });

        connection
    }

    /// The supervisor mailbox; owns every reactive state transition.
    async fn signal_task(
        connection: Weak<VoiceConnection>,
        mut signal_receive: mpsc::Receiver<ConnectionSignal>,
    ) {
        while let Some(signal) = signal_receive.recv().await {
            let Some(connection) = connection.upgrade() else {
                break;
            };

            connection.handle_signal(signal).await;
        }

        trace!("VC: Mailbox task closing");
    }

    async fn handle_signal(self: &Arc<Self>, signal: ConnectionSignal) {
        if self.destroyed.load(Ordering::Relaxed) {
            return;
        }

        match signal {
            ConnectionSignal::ServerUpdate(update) => self.handle_server_update(update).await,
            ConnectionSignal::StateUpdate(update) => self.handle_state_update(update).await,
            ConnectionSignal::GatewayReady(ready) => {
                self.data.write().await.ready_data = Some(ready);
                self.data_notify.notify_one();
            }
            ConnectionSignal::SessionDescription(description) => {
                self.data.write().await.session_description = Some(description);
                self.data_notify.notify_one();
            }
            ConnectionSignal::Resumed => {
                self.resume_acknowledged.store(true, Ordering::SeqCst);
                self.data_notify.notify_one();
            }
            ConnectionSignal::GatewayError(error) => self.handle_gateway_error(error).await,
            ConnectionSignal::TransportStale(missed) => {
                warn!("VC: Transport went stale after {} missed keep-alives", missed);
                self.events
                    .lock()
                    .await
                    .error
                    .publish(VoiceError::TransportStale)
                    .await;

                if *self.state.read().await == ConnectionState::Ready {
                    let connection = self.clone();
                    tokio::task::spawn(async move {
                        connection.reconnect(true).await;
                    });
                }
            }
        }
    }

    async fn handle_server_update(self: &Arc<Self>, update: VoiceServerUpdate) {
        let guild_id = self.coordinates.read().await.guild_id;
        if update.guild_id != guild_id {
            trace!("VC: Ignoring voice server update for another guild");
            return;
        }

        if update.endpoint.is_none() {
            debug!("VC: Voice server went away, waiting for a reallocation");
            self.data.write().await.server_data = Some(update);
            return;
        }

        let migration = {
            let data = self.data.read().await;
            match &data.server_data {
                Some(old) => old.token != update.token || old.endpoint != update.endpoint,
                None => false,
            }
        };

        self.data.write().await.server_data = Some(update);
        self.data_notify.notify_one();

        let state = *self.state.read().await;
        let mid_session = matches!(
            state,
            ConnectionState::Authenticating
                | ConnectionState::EstablishingTransport
                | ConnectionState::Ready
        );

        if migration && mid_session {
            info!("VC: Voice server changed, rebuilding the session");
            let connection = self.clone();
            tokio::task::spawn(async move {
                connection.migrate().await;
            });
        }
    }

    async fn handle_state_update(&self, update: VoiceStateUpdate) {
        let (guild_id, user_id) = {
            let coordinates = self.coordinates.read().await;
            (coordinates.guild_id, coordinates.user_id)
        };

        // Voice state updates arrive for every member of the channel; only
        // our own, in our guild, carries our session id
        if update.user_id != user_id || update.guild_id != Some(guild_id) {
            trace!("VC: Ignoring voice state update for another user or guild");
            return;
        }

        let mut data = self.data.write().await;
        data.session_id = update.session_id.clone();
        data.state_data = Some(update);
        drop(data);

        self.data_notify.notify_one();
    }

    async fn handle_gateway_error(self: &Arc<Self>, error: VoiceGatewayError) {
        let state = *self.state.read().await;

        debug!("VC: Voice gateway reported {} while {}", error, state);

        if state != ConnectionState::Ready {
            // A handshake step or a reconnect attempt is waiting on the
            // gateway; hand the error to it instead of acting here
            *self.handshake_error.lock().await = Some(error);
            self.data_notify.notify_one();
            return;
        }

        if error.is_terminal() || !self.options.auto_reconnect {
            self.events
                .lock()
                .await
                .error
                .publish(VoiceError::GatewayFatal {
                    error: error.clone(),
                })
                .await;
            self.teardown_session().await;
            self.set_state(ConnectionState::Disconnected).await;
            self.publish_disconnected(format!("voice gateway closed: {}", error))
                .await;
            return;
        }

        if error.is_resumable() {
            self.events
                .lock()
                .await
                .error
                .publish(VoiceError::Gateway {
                    error: error.clone(),
                })
                .await;

            let connection = self.clone();
            tokio::task::spawn(async move {
                connection.reconnect(true).await;
            });
            return;
        }

        // Not resumable but not terminal either (the session is invalid);
        // drop to disconnected, then run a brand new handshake
        self.events
            .lock()
            .await
            .error
            .publish(VoiceError::GatewayFatal {
                error: error.clone(),
            })
            .await;
        self.teardown_session().await;
        self.set_state(ConnectionState::Disconnected).await;

        let connection = self.clone();
        tokio::task::spawn(async move {
            connection.reconnect(false).await;
        });
    }

    /// Joins the voice channel and runs the full handshake to Ready.
    ///
    /// Suspends while waiting on the main gateway's voice info, the voice
    /// gateway's Ready, ip discovery and the session description, each under
    /// its own deadline.
    pub async fn connect(self: &Arc<Self>) -> VoiceResult<()> {
        self.ensure_usable()?;

        {
            let state = self.state.read().await;
            if *state != ConnectionState::Disconnected {
                return Err(VoiceError::CallerMisuse {
                    details: format!(
                        "connect() requires a disconnected connection, state is {}",
                        *state
                    ),
                });
            }
        }

        *self.handshake_error.lock().await = None;

        self.set_state(ConnectionState::Connecting).await;

        if !self.send_join().await {
            let error = VoiceError::AdapterSend;
            self.fail(error.clone()).await;
            return Err(error);
        }

        self.set_state(ConnectionState::AwaitingVoiceInfo).await;

        if let Err(error) = self.await_voice_info().await {
            self.fail(error.clone()).await;
            return Err(error);
        }

        match self.establish_session().await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.events.lock().await.error.publish(error.clone()).await;

                if self.options.auto_reconnect && error_allows_reconnect(&error) {
                    let connection = self.clone();
                    tokio::task::spawn(async move {
                        connection.reconnect(false).await;
                    });
                } else {
                    self.teardown_session().await;
                    self.set_state(ConnectionState::Disconnected).await;
                    self.publish_disconnected(format!("handshake failed: {}", error))
                        .await;
                }

                Err(error)
            }
        }
    }

    /// Sends one pre-encoded Opus frame.
    ///
    /// Does nothing but count a drop unless the connection is Ready; packet
    /// level failures are likewise counted and never surface.
    pub async fn send_audio(&self, payload: Vec<u8>) {
        if self.destroyed.load(Ordering::Relaxed)
            || *self.state.read().await != ConnectionState::Ready
        {
            ConnectionMetrics::count(&self.metrics.packets_dropped);
            trace!("VC: Dropping audio frame, connection is not ready");
            return;
        }

        let udp = self.udp.lock().await.clone();

        let Some(udp) = udp else {
            ConnectionMetrics::count(&self.metrics.packets_dropped);
            return;
        };

        match udp.send_opus_data(payload).await {
            Ok(()) => {
                ConnectionMetrics::count(&self.metrics.packets_sent);
            }
            Err(error) => {
                ConnectionMetrics::count(&self.metrics.packets_dropped);
                match error {
                    crate::errors::VoiceUdpError::FailedEncryption
                    | crate::errors::VoiceUdpError::FailedNonceGeneration { .. }
                    | crate::errors::VoiceUdpError::NoKey => {
                        ConnectionMetrics::count(&self.metrics.encrypt_failures);
                        warn!("VC: Dropped audio frame: {}", error);
                    }
                    other => {
                        debug!("VC: Dropped audio frame: {}", other);
                    }
                }
            }
        }
    }

    /// Tells the channel whether we are transmitting.
    ///
    /// A true -> false transition tails off with five silence frames, so
    /// other clients do not interpolate audio that never existed. The
    /// speaking payload is fully sent before this returns, so audio sent
    /// afterwards is ordered behind it.
    pub async fn set_speaking(&self, speaking: bool) {
        if self.destroyed.load(Ordering::Relaxed)
            || *self.state.read().await != ConnectionState::Ready
        {
            return;
        }

        if self.speaking.swap(speaking, Ordering::SeqCst) == speaking {
            return;
        }

        let ssrc = {
            let data = self.data.read().await;
            data.ready_data.as_ref().map(|ready| ready.ssrc).unwrap_or(0)
        };

        let flags = if speaking {
            SpeakingBitflags::default().bits()
        } else {
            SpeakingBitflags::empty().bits()
        };

        let gateway = self.gateway.lock().await.clone();
        if let Some(gateway) = gateway {
            let result = gateway
                .send_speaking(Speaking {
                    speaking: flags,
                    ssrc,
                    user_id: None,
                    delay: 0,
                })
                .await;

            if let Err(error) = result {
                warn!("VC: Could not send speaking update: {}", error);
            }
        }

        if !speaking {
            self.send_silence_tail().await;
        }
    }

    /// Leaves the voice channel.
    ///
    /// The op 4 with a null channel goes out before any socket is touched,
    /// so the server sees a clean leave rather than a vanished client.
    pub async fn disconnect(&self) {
        let update = {
            let mut coordinates = self.coordinates.write().await;
            coordinates.channel_id = None;
            UpdateVoiceState {
                guild_id: Some(coordinates.guild_id),
                channel_id: None,
                self_mute: coordinates.self_mute,
                self_deaf: coordinates.self_deaf,
            }
        };

        if !self.adapter.send_voice_state(update).await {
            debug!("VC: Could not announce the leave on the main gateway");
        }

        self.speaking.store(false, Ordering::SeqCst);
        self.teardown_session().await;
        self.set_state(ConnectionState::Disconnected).await;
        self.publish_disconnected("disconnect requested".to_string())
            .await;
    }

    /// Disconnects and makes every further operation fail.
    ///
    /// Idempotent; the second and later calls do nothing.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let update = {
            let mut coordinates = self.coordinates.write().await;
            coordinates.channel_id = None;
            UpdateVoiceState {
                guild_id: Some(coordinates.guild_id),
                channel_id: None,
                self_mute: coordinates.self_mute,
                self_deaf: coordinates.self_deaf,
            }
        };
        self.adapter.send_voice_state(update).await;

        self.speaking.store(false, Ordering::SeqCst);
        self.teardown_session().await;
        self.set_state(ConnectionState::Destroyed).await;
        self.publish_disconnected("destroyed".to_string()).await;
        self.adapter.destroy().await;
    }

    /// Where the connection currently stands.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Round trip time to the voice server, once a keep-alive was answered.
    pub async fn ping(&self) -> Option<Duration> {
        match self.udp.lock().await.clone() {
            Some(udp) => udp.ping().await,
            None => None,
        }
    }

    fn ensure_usable(&self) -> VoiceResult<()> {
        if self.destroyed.load(Ordering::Relaxed) {
            return Err(VoiceError::Destroyed);
        }
        Ok(())
    }

    async fn send_join(&self) -> bool {
        let coordinates = self.coordinates.read().await.clone();

        self.adapter
            .send_voice_state(UpdateVoiceState {
                guild_id: Some(coordinates.guild_id),
                channel_id: coordinates.channel_id,
                self_mute: coordinates.self_mute,
                self_deaf: coordinates.self_deaf,
            })
            .await
    }

    /// Waits until both voice info events have been observed, retrying the
    /// join once before giving up.
    async fn await_voice_info(&self) -> VoiceResult<()> {
        for attempt in 0..2 {
            let deadline = tokio::time::Instant::now() + VOICE_INFO_TIMEOUT;

            loop {
                if self.data.read().await.has_voice_info() {
                    return Ok(());
                }

                if tokio::time::timeout_at(deadline, self.data_notify.notified())
                    .await
                    .is_err()
                {
                    break;
                }
            }

            if attempt == 0 {
                debug!("VC: Voice info did not arrive in time, re-issuing the join");
                if !self.send_join().await {
                    return Err(VoiceError::AdapterSend);
                }
            }
        }

        Err(VoiceError::HandshakeTimeout {
            stage: HandshakeStage::VoiceInfo,
        })
    }

    /// Opens the voice gateway and the transport for the announced server,
    /// identifies, and negotiates encryption. Requires voice info.
    async fn establish_session(&self) -> VoiceResult<()> {
        self.set_state(ConnectionState::Authenticating).await;

        let (endpoint, token) = {
            let data = self.data.read().await;
            let server = data
                .server_data
                .as_ref()
                .ok_or_else(|| VoiceError::ProtocolViolation {
                    details: "establishing a session without voice server info".to_string(),
                })?;

            let endpoint =
                server
                    .endpoint
                    .clone()
                    .ok_or_else(|| VoiceError::ProtocolViolation {
                        details: "voice server update carried no endpoint".to_string(),
                    })?;

            (endpoint, server.token.clone())
        };

        let (guild_id, user_id) = {
            let coordinates = self.coordinates.read().await;
            (coordinates.guild_id, coordinates.user_id)
        };
        let session_id = self.data.read().await.session_id.clone();

        let ready_await = timeout(GATEWAY_READY_TIMEOUT, async {
            let gateway =
                VoiceGateway::spawn(&endpoint, self.options.heartbeat_grace, 0)
                    .await
                    .map_err(|error| VoiceError::Gateway { error })?;

            self.attach_gateway(gateway.clone()).await;

            gateway
                .send_identify(VoiceIdentify {
                    server_id: guild_id,
                    user_id,
                    session_id,
                    token,
                })
                .await
                .map_err(|error| VoiceError::Gateway { error })?;

            loop {
                if let Some(error) = self.take_handshake_error().await {
                    return Err(classify_gateway_error(error));
                }

                if self.data.read().await.ready_data.is_some() {
                    return Ok(());
                }

                self.data_notify.notified().await;
            }
        })
        .await;

        match ready_await {
            Err(_elapsed) => {
                return Err(VoiceError::HandshakeTimeout {
                    stage: HandshakeStage::GatewayReady,
                })
            }
            Ok(Err(error)) => return Err(error),
            Ok(Ok(())) => {}
        }

        self.set_state(ConnectionState::EstablishingTransport).await;

        let ready = self
            .data
            .read()
            .await
            .ready_data
            .clone()
            .ok_or_else(|| VoiceError::ProtocolViolation {
                details: "ready data vanished mid-handshake".to_string(),
            })?;

        let udp = UdpHandler::spawn(
            self.data.clone(),
            self.metrics.clone(),
            &ready.ip,
            ready.port,
            ready.ssrc,
        )
        .await
        .map_err(VoiceError::from)?;

        self.attach_udp(udp).await;

        let discovery =
            self.data
                .read()
                .await
                .ip_discovery
                .clone()
                .ok_or_else(|| VoiceError::ProtocolViolation {
                    details: "ip discovery result vanished mid-handshake".to_string(),
                })?;

        let (address, port) =
            parse_discovery_address(&discovery).map_err(|_| VoiceError::ProtocolViolation {
                details: "malformed ip discovery reply".to_string(),
            })?;

        let mode = VoiceEncryptionMode::negotiate(&ready.modes, &self.options.preferred_modes)
            .ok_or_else(|| VoiceError::ProtocolViolation {
                details: "server offered no encryption modes".to_string(),
            })?;

        if !mode.is_implemented() {
            return Err(VoiceError::CryptoFailure {
                details: format!("cannot use any of the offered encryption modes {:?}", ready.modes),
            });
        }

        let gateway = self
            .gateway
            .lock()
            .await
            .clone()
            .ok_or_else(|| VoiceError::ProtocolViolation {
                details: "voice gateway vanished mid-handshake".to_string(),
            })?;

        gateway
            .send_select_protocol(SelectProtocol {
                protocol: VoiceProtocol::Udp,
                data: SelectProtocolData {
                    address: address.clone(),
                    port,
                    mode,
                },
            })
            .await
            .map_err(|error| VoiceError::Gateway { error })?;

        let description_await = timeout(SESSION_DESCRIPTION_TIMEOUT, async {
            loop {
                if let Some(error) = self.take_handshake_error().await {
                    return Err(classify_gateway_error(error));
                }

                if let Some(description) = self.data.read().await.session_description.clone() {
                    return Ok(description);
                }

                self.data_notify.notified().await;
            }
        })
        .await;

        let description: SessionDescription = match description_await {
            Err(_elapsed) => {
                return Err(VoiceError::HandshakeTimeout {
                    stage: HandshakeStage::SessionDescription,
                })
            }
            Ok(Err(error)) => return Err(error),
            Ok(Ok(description)) => description,
        };

        if description.encryption_mode != mode {
            return Err(VoiceError::CryptoFailure {
                details: format!(
                    "selected mode {:?} but the session was described with {:?}",
                    mode, description.encryption_mode
                ),
            });
        }

        self.set_state(ConnectionState::Ready).await;

        self.events
            .lock()
            .await
            .ready
            .publish(ConnectionReady {
                ssrc: ready.ssrc,
                address,
                port,
            })
            .await;

        info!("VC: Voice connection is ready");

        Ok(())
    }

    /// Picks a dropped session back up: resume on a fresh websocket, then a
    /// rebound transport. The rtp cursor and secret key carry over.
    async fn resume_session(&self) -> VoiceResult<()> {
        let (endpoint, token) = {
            let data = self.data.read().await;
            let server = data
                .server_data
                .as_ref()
                .ok_or_else(|| VoiceError::ProtocolViolation {
                    details: "resuming without voice server info".to_string(),
                })?;

            let endpoint =
                server
                    .endpoint
                    .clone()
                    .ok_or_else(|| VoiceError::ProtocolViolation {
                        details: "voice server update carried no endpoint".to_string(),
                    })?;

            (endpoint, server.token.clone())
        };

        let guild_id = self.coordinates.read().await.guild_id;
        let session_id = self.data.read().await.session_id.clone();
        let starting_nonce = self.heartbeat_nonce.load(Ordering::Relaxed);

        self.resume_acknowledged.store(false, Ordering::SeqCst);

        let resume_await = timeout(RESUME_TIMEOUT, async {
            let gateway = VoiceGateway::spawn(
                &endpoint,
                self.options.heartbeat_grace,
                starting_nonce,
            )
            .await
            .map_err(|error| VoiceError::Gateway { error })?;

            self.attach_gateway(gateway.clone()).await;

            gateway
                .send_resume(VoiceResume {
                    server_id: guild_id,
                    session_id,
                    token,
                })
                .await
                .map_err(|error| VoiceError::Gateway { error })?;

            loop {
                if let Some(error) = self.take_handshake_error().await {
                    return Err(classify_gateway_error(error));
                }

                if self.resume_acknowledged.load(Ordering::SeqCst) {
                    return Ok(());
                }

                self.data_notify.notified().await;
            }
        })
        .await;

        match resume_await {
            Err(_elapsed) => {
                return Err(VoiceError::HandshakeTimeout {
                    stage: HandshakeStage::Resume,
                })
            }
            Ok(Err(error)) => return Err(error),
            Ok(Ok(())) => {}
        }

        info!("VGW: Resumed the voice gateway session");

        // The session survived; the transport gets a fresh socket to the
        // same server
        let ready = self
            .data
            .read()
            .await
            .ready_data
            .clone()
            .ok_or_else(|| VoiceError::ProtocolViolation {
                details: "resumed a session with no ready data".to_string(),
            })?;

        let udp = UdpHandler::spawn(
            self.data.clone(),
            self.metrics.clone(),
            &ready.ip,
            ready.port,
            ready.ssrc,
        )
        .await
        .map_err(VoiceError::from)?;

        self.attach_udp(udp).await;

        self.set_state(ConnectionState::Ready).await;

        Ok(())
    }

    /// Full rebuild after the old session was invalidated: new op 4, new
    /// voice info, new session.
    async fn fresh_handshake(&self) -> VoiceResult<()> {
        {
            let mut data = self.data.write().await;
            data.clear_session();
            data.server_data = None;
            data.state_data = None;
            data.session_id.clear();
        }

        if !self.send_join().await {
            return Err(VoiceError::AdapterSend);
        }

        self.await_voice_info().await?;
        self.establish_session().await
    }

    /// Rebuild after a server migration: the main gateway session stays, the
    /// voice session starts over against the new endpoint.
    async fn migrate(self: Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        self.teardown_io().await;
        self.data.write().await.clear_session();
        *self.handshake_error.lock().await = None;
        self.speaking.store(false, Ordering::SeqCst);

        let result = self.establish_session().await;
        self.reconnecting.store(false, Ordering::SeqCst);

        if let Err(error) = result {
            warn!("VC: Could not follow the voice server migration: {}", error);
            self.events.lock().await.error.publish(error.clone()).await;

            if self.options.auto_reconnect && error_allows_reconnect(&error) {
                self.reconnect(false).await;
            } else {
                self.teardown_session().await;
                self.set_state(ConnectionState::Disconnected).await;
                self.publish_disconnected(format!("migration failed: {}", error))
                    .await;
            }
        }
    }

    /// The bounded recovery loop: one resume attempt if allowed, full
    /// restarts after, backoff between attempts, destruction at exhaustion.
    async fn reconnect(self: Arc<Self>, resume_first: bool) {
        if self.destroyed.load(Ordering::Relaxed) {
            return;
        }

        if !self.options.auto_reconnect {
            return;
        }

        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        // Both sockets go away before anything reopens
        self.teardown_io().await;
        self.speaking.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Reconnecting).await;

        let max_attempts = self.options.effective_max_reconnect_attempts();
        let mut try_resume = resume_first;

        for attempt in 1..=max_attempts {
            if self.destroyed.load(Ordering::Relaxed) {
                self.reconnecting.store(false, Ordering::SeqCst);
                return;
            }

            self.events
                .lock()
                .await
                .reconnecting
                .publish(ReconnectAttempt { attempt })
                .await;

            let backoff = std::cmp::min(
                RECONNECT_BACKOFF_STEP * u32::from(attempt),
                RECONNECT_BACKOFF_CAP,
            );
            sleep(backoff).await;

            *self.handshake_error.lock().await = None;

            let result = if try_resume {
                self.resume_session().await
            } else {
                self.fresh_handshake().await
            };

            match result {
                Ok(()) => {
                    info!("VC: Recovered after {} reconnect attempt(s)", attempt);
                    self.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                Err(error) => {
                    warn!("VC: Reconnect attempt {} failed: {}", attempt, error);
                    self.events.lock().await.error.publish(error).await;

                    self.teardown_io().await;
                    self.set_state(ConnectionState::Reconnecting).await;

                    // A resume gets one shot; everything after is a restart
                    try_resume = false;
                }
            }
        }

        self.reconnecting.store(false, Ordering::SeqCst);

        warn!(
            "VC: Giving up after {} reconnect attempts, destroying the connection",
            max_attempts
        );
        self.events
            .lock()
            .await
            .error
            .publish(VoiceError::ReconnectExhausted {
                attempts: max_attempts,
            })
            .await;

        self.destroy().await;
    }

    async fn attach_gateway(&self, handle: VoiceGatewayHandle) {
        let forwarder = Arc::new(SignalForwarder {
            signal_send: self.signal_send.clone(),
        });

        {
            let mut gateway_events = handle.events.lock().await;
            gateway_events.voice_ready.subscribe(forwarder.clone());
            gateway_events
                .session_description
                .subscribe(forwarder.clone());
            gateway_events.resumed.subscribe(forwarder.clone());
            gateway_events.error.subscribe(forwarder);
        }

        *self.gateway.lock().await = Some(handle);
    }

    async fn attach_udp(&self, handle: UdpHandle) {
        let forwarder = Arc::new(SignalForwarder {
            signal_send: self.signal_send.clone(),
        });
        let packet_forwarder = Arc::new(PacketForwarder {
            events: self.events.clone(),
        });

        {
            let mut udp_events = handle.events.lock().await;
            udp_events.stale.subscribe(forwarder);
            udp_events.rtp.subscribe(packet_forwarder);
        }

        *self.udp.lock().await = Some(handle);
    }

    /// Closes both sockets and stops their tasks, keeping session data.
    async fn teardown_io(&self) {
        if let Some(gateway) = self.gateway.lock().await.take() {
            self.heartbeat_nonce.store(
                gateway.next_heartbeat_nonce.load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
            gateway.close().await;
        }

        if let Some(udp) = self.udp.lock().await.take() {
            udp.close();
        }
    }

    /// Closes both sockets and forgets the session, key included.
    async fn teardown_session(&self) {
        self.teardown_io().await;
        self.data.write().await.clear_session();
        self.resume_acknowledged.store(false, Ordering::SeqCst);
    }

    async fn fail(&self, error: VoiceError) {
        self.events.lock().await.error.publish(error.clone()).await;
        self.teardown_session().await;
        self.set_state(ConnectionState::Disconnected).await;
        self.publish_disconnected(format!("{}", error)).await;
    }

    async fn publish_disconnected(&self, reason: String) {
        self.events
            .lock()
            .await
            .disconnected
            .publish(ConnectionClosed { reason })
            .await;
    }

    async fn take_handshake_error(&self) -> Option<VoiceGatewayError> {
        self.handshake_error.lock().await.take()
    }

    async fn set_state(&self, new_state: ConnectionState) {
        let old = {
            let mut state = self.state.write().await;

            if *state == new_state || *state == ConnectionState::Destroyed {
                return;
            }

            let old = *state;
            *state = new_state;
            old
        };

        debug!("VC: State {} -> {}", old, new_state);

        self.events
            .lock()
            .await
            .state_change
            .publish(StateChange {
                old,
                new: new_state,
            })
            .await;
    }

    /// Five silence frames at frame cadence; the receiving side needs them to
    /// flush its jitter buffer cleanly.
    pub(crate) async fn send_silence_tail(&self) {
        let mut interval = tokio::time::interval(FRAME_DURATION);

        for _ in 0..SILENCE_FRAME_COUNT {
            interval.tick().await;
            self.send_audio(OPUS_SILENCE_FRAME.to_vec()).await;
        }
    }
}

/// Fatal when it can never be retried; everything else feeds the bounded
/// reconnect loop.
fn classify_gateway_error(error: VoiceGatewayError) -> VoiceError {
    if error.is_resumable() {
        VoiceError::Gateway { error }
    } else {
        VoiceError::GatewayFatal { error }
    }
}

/// Which handshake failures the automatic recovery loop takes on.
///
/// Failures of the main gateway adapter or of the caller's own doing are
/// surfaced instead; retrying them would just repeat the failure.
fn error_allows_reconnect(error: &VoiceError) -> bool {
    match error {
        VoiceError::HandshakeTimeout { stage } => *stage != HandshakeStage::VoiceInfo,
        VoiceError::Gateway { .. }
        | VoiceError::Transport { .. }
        | VoiceError::GatewayStale
        | VoiceError::TransportStale => true,
        _ => false,
    }
}
