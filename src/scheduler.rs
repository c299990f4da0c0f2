// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A cooperative pacer that feeds one Opus frame per 20 ms tick into any
//! number of voice connections.
//!
//! The scheduler owns no encoder; the caller supplies pre-encoded frames
//! through an [OpusSource]. Timing, missed-frame accounting and the silence
//! tail on every stop are handled here.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use log::*;
use tokio::{
    sync::{mpsc, watch},
    time::{interval, MissedTickBehavior},
};

use crate::{connection::VoiceConnection, constants::FRAME_DURATION};

/// Buffering lasts at most this many ticks (100 ms) before playback starts
/// regardless.
const BUFFERING_TICKS: u8 = 5;

/// Anything a scheduler can pace audio into.
///
/// [VoiceConnection] is the real consumer; tests substitute a recorder.
#[async_trait]
pub trait AudioSink: Send + Sync + Debug {
    /// One pre-encoded Opus frame, to be transmitted now.
    async fn play_frame(&self, frame: Vec<u8>);

    /// Speaking transition; clearing it is expected to tail off with silence.
    async fn set_speaking(&self, speaking: bool);
}

#[async_trait]
impl AudioSink for VoiceConnection {
    async fn play_frame(&self, frame: Vec<u8>) {
        self.send_audio(frame).await;
    }

    async fn set_speaking(&self, speaking: bool) {
        VoiceConnection::set_speaking(self, speaking).await;
    }
}

/// Supplies one Opus frame per tick.
///
/// Returning [None] is a missed frame, not the end of the stream; a source
/// that is done should keep returning [None] and let the missed-frame
/// accounting pause playback, or the caller stops the scheduler explicitly.
pub trait OpusSource: Send {
    fn next_frame(&mut self) -> Option<Vec<u8>>;
}

impl<F> OpusSource for F
where
    F: FnMut() -> Option<Vec<u8>> + Send,
{
    fn next_frame(&mut self) -> Option<Vec<u8>> {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Where the scheduler currently stands.
pub enum PlayerState {
    #[default]
    Idle,
    /// A source was supplied; giving it up to 100 ms to warm up
    Buffering,
    Playing,
    /// Paused by the caller or by missed-frame accounting
    Paused,
    /// Paused because no sink is subscribed
    AutoPaused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// What the scheduler does when its subscriber set is empty.
pub enum EmptyBehavior {
    /// Suspend until a sink returns
    #[default]
    Pause,
    /// Keep pulling frames and discard them, useful for multi-consumer mixers
    Play,
    /// Give up on the source entirely
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Tuning knobs for one scheduler.
pub struct SchedulerOptions {
    pub behavior_on_empty: EmptyBehavior,
    /// Consecutive ticks the source may miss before playback pauses
    pub max_missed_frames: u8,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            behavior_on_empty: EmptyBehavior::default(),
            max_missed_frames: 5,
        }
    }
}

enum SchedulerCommand {
    Play(Box<dyn OpusSource>),
    Pause,
    Resume,
    Stop,
    Subscribe(Arc<dyn AudioSink>),
    Unsubscribe(Arc<dyn AudioSink>),
}

#[derive(Debug, Clone)]
/// Handle to a running scheduler task.
///
/// Dropping every handle stops the task; a playing scheduler tails off with
/// silence first.
pub struct AudioScheduler {
    command_send: mpsc::Sender<SchedulerCommand>,
    state_receive: watch::Receiver<PlayerState>,
}

impl AudioScheduler {
    /// Starts a scheduler task with the given options.
    pub fn spawn(options: SchedulerOptions) -> AudioScheduler {
        let (command_send, command_receive) = mpsc::channel(32);
        let (state_send, state_receive) = watch::channel(PlayerState::default());

        let task = SchedulerTask {
            options,
            sinks: Vec::new(),
            source: None,
            state: PlayerState::default(),
            state_send,
            speaking: false,
            missed_frames: 0,
            buffering_ticks: 0,
        };

        tokio::task::spawn(task.run(command_receive));

        AudioScheduler {
            command_send,
            state_receive,
        }
    }

    /// Supplies a source and starts (or restarts) playback through it.
    pub async fn play(&self, source: Box<dyn OpusSource>) {
        self.command_send
            .send(SchedulerCommand::Play(source))
            .await
            .ok();
    }

    pub async fn pause(&self) {
        self.command_send.send(SchedulerCommand::Pause).await.ok();
    }

    pub async fn resume(&self) {
        self.command_send.send(SchedulerCommand::Resume).await.ok();
    }

    pub async fn stop(&self) {
        self.command_send.send(SchedulerCommand::Stop).await.ok();
    }

    /// Adds a sink; every subsequent frame is forwarded to it.
    pub async fn subscribe(&self, sink: Arc<dyn AudioSink>) {
        self.command_send
            .send(SchedulerCommand::Subscribe(sink))
            .await
            .ok();
    }

    /// Removes a sink, by identity.
    pub async fn unsubscribe(&self, sink: Arc<dyn AudioSink>) {
        self.command_send
            .send(SchedulerCommand::Unsubscribe(sink))
            .await
            .ok();
    }

    /// A snapshot of the pacing state.
    pub fn state(&self) -> PlayerState {
        *self.state_receive.borrow()
    }
}

struct SchedulerTask {
    options: SchedulerOptions,
    sinks: Vec<Arc<dyn AudioSink>>,
    source: Option<Box<dyn OpusSource>>,
    state: PlayerState,
    state_send: watch::Sender<PlayerState>,
    speaking: bool,
    missed_frames: u8,
    buffering_ticks: u8,
}

impl SchedulerTask {
    async fn run(mut self, mut command_receive: mpsc::Receiver<SchedulerCommand>) {
        let mut ticker = interval(FRAME_DURATION);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = command_receive.recv() => {
                    let Some(command) = command else {
                        break;
                    };

                    let was_active = self.is_active();
                    self.handle_command(command).await;

                    if !was_active && self.is_active() {
                        ticker.reset();
                    }
                }
                _ = ticker.tick(), if self.is_active() => {
                    self.tick().await;
                }
            }
        }

        // Every handle is gone; leave the channels quiet
        self.stop_speaking().await;
        trace!("Scheduler task closing");
    }

    fn is_active(&self) -> bool {
        matches!(self.state, PlayerState::Buffering | PlayerState::Playing)
    }

    fn set_state(&mut self, new_state: PlayerState) {
        if self.state == new_state {
            return;
        }

        trace!("Scheduler {:?} -> {:?}", self.state, new_state);
        self.state = new_state;
        self.state_send.send(new_state).ok();
    }

    async fn handle_command(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Play(source) => {
                self.source = Some(source);
                self.missed_frames = 0;
                self.buffering_ticks = 0;
                self.set_state(PlayerState::Buffering);
            }
            SchedulerCommand::Pause => {
                if self.is_active() {
                    self.stop_speaking().await;
                    self.set_state(PlayerState::Paused);
                }
            }
            SchedulerCommand::Resume => {
                if matches!(self.state, PlayerState::Paused | PlayerState::AutoPaused)
                    && self.source.is_some()
                {
                    self.missed_frames = 0;
                    self.set_state(PlayerState::Playing);
                }
            }
            SchedulerCommand::Stop => {
                self.stop_speaking().await;
                self.source = None;
                self.missed_frames = 0;
                self.set_state(PlayerState::Idle);
            }
            SchedulerCommand::Subscribe(sink) => {
                self.sinks.push(sink);

                if self.state == PlayerState::AutoPaused {
                    self.set_state(PlayerState::Playing);
                }
            }
            SchedulerCommand::Unsubscribe(sink) => {
                self.sinks.retain(|known| !Arc::ptr_eq(known, &sink));
            }
        }
    }

    async fn tick(&mut self) {
        match self.state {
            PlayerState::Buffering => {
                self.buffering_ticks += 1;

                if let Some(frame) = self.pull_frame() {
                    self.set_state(PlayerState::Playing);
                    self.forward_frame(frame).await;
                } else if self.buffering_ticks >= BUFFERING_TICKS {
                    self.set_state(PlayerState::Playing);
                }
            }
            PlayerState::Playing => {
                if self.sinks.is_empty() {
                    match self.options.behavior_on_empty {
                        EmptyBehavior::Pause => {
                            debug!("Scheduler has no sinks, auto-pausing");
                            self.stop_speaking().await;
                            self.set_state(PlayerState::AutoPaused);
                        }
                        EmptyBehavior::Stop => {
                            debug!("Scheduler has no sinks, stopping");
                            self.stop_speaking().await;
                            self.source = None;
                            self.set_state(PlayerState::Idle);
                        }
                        EmptyBehavior::Play => {
                            // Keep the source ticking; the frames go nowhere
                            let _ = self.pull_frame();
                        }
                    }
                    return;
                }

                match self.pull_frame() {
                    Some(frame) => {
                        self.forward_frame(frame).await;
                        self.missed_frames = 0;
                    }
                    None => {
                        self.missed_frames += 1;

                        if self.missed_frames >= self.options.max_missed_frames {
                            debug!(
                                "Source missed {} frames in a row, pausing",
                                self.missed_frames
                            );
                            self.stop_speaking().await;
                            self.set_state(PlayerState::Paused);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn pull_frame(&mut self) -> Option<Vec<u8>> {
        self.source.as_mut().and_then(|source| source.next_frame())
    }

    async fn forward_frame(&mut self, frame: Vec<u8>) {
        if !self.speaking {
            // The speaking flag has to be visible before the first packet
            for sink in &self.sinks {
                sink.set_speaking(true).await;
            }
            self.speaking = true;
        }

        for sink in &self.sinks {
            sink.play_frame(frame.clone()).await;
        }
    }

    async fn stop_speaking(&mut self) {
        if !self.speaking {
            return;
        }

        self.speaking = false;

        // Clearing speaking makes each sink emit the silence tail
        for sink in &self.sinks {
            sink.set_speaking(false).await;
        }
    }
}
