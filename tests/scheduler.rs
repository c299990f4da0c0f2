// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Pacing tests, driven entirely on virtual time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use descant::scheduler::{
    AudioScheduler, AudioSink, EmptyBehavior, OpusSource, PlayerState, SchedulerOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkEventKind {
    Frame(u8),
    Speaking(bool),
}

#[derive(Debug)]
struct SinkEvent {
    at: Instant,
    kind: SinkEventKind,
}

/// Records everything the scheduler pushes at it, with virtual timestamps.
#[derive(Debug, Default)]
struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<SinkEventKind> {
        self.events.lock().unwrap().iter().map(|event| event.kind).collect()
    }

    fn frame_times(&self) -> Vec<Instant> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| matches!(event.kind, SinkEventKind::Frame(_)))
            .map(|event| event.at)
            .collect()
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play_frame(&self, frame: Vec<u8>) {
        self.events.lock().unwrap().push(SinkEvent {
            at: Instant::now(),
            kind: SinkEventKind::Frame(frame[0]),
        });
    }

    async fn set_speaking(&self, speaking: bool) {
        self.events.lock().unwrap().push(SinkEvent {
            at: Instant::now(),
            kind: SinkEventKind::Speaking(speaking),
        });
    }
}

/// Yields numbered frames from a script; `None` entries are missed frames.
struct ScriptedSource {
    script: Vec<Option<u8>>,
    position: usize,
}

impl ScriptedSource {
    fn new(script: Vec<Option<u8>>) -> Box<Self> {
        Box::new(Self { script, position: 0 })
    }
}

impl OpusSource for ScriptedSource {
    fn next_frame(&mut self) -> Option<Vec<u8>> {
        let frame = self.script.get(self.position).copied().flatten();
        self.position += 1;
        frame.map(|tag| vec![tag])
    }
}

/// An endless source counting up from zero.
fn counting_source() -> Box<dyn OpusSource> {
    let mut next: u8 = 0;
    Box::new(move || {
        let frame = vec![next];
        next = next.wrapping_add(1);
        Some(frame)
    })
}

#[tokio::test(start_paused = true)]
async fn frames_are_paced_at_twenty_millis() {
    let scheduler = AudioScheduler::spawn(SchedulerOptions::default());
    let sink = Arc::new(RecordingSink::default());

    scheduler.subscribe(sink.clone()).await;
    scheduler.play(counting_source()).await;

    tokio::time::sleep(Duration::from_millis(210)).await;
    scheduler.pause().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let times = sink.frame_times();
    assert!(times.len() >= 9, "only {} frames were paced", times.len());

    for pair in times.windows(2) {
        assert_eq!(pair[1] - pair[0], Duration::from_millis(20));
    }

    // Speaking precedes the first frame
    let events = sink.events();
    assert_eq!(events[0], SinkEventKind::Speaking(true));
    assert!(matches!(events[1], SinkEventKind::Frame(0)));
}

#[tokio::test(start_paused = true)]
async fn missed_frames_pause_playback() {
    let scheduler = AudioScheduler::spawn(SchedulerOptions::default());
    let sink = Arc::new(RecordingSink::default());

    scheduler.subscribe(sink.clone()).await;
    scheduler
        .play(ScriptedSource::new(vec![
            Some(1),
            Some(2),
            // Nothing ever again
        ]))
        .await;

    // 2 frames + 5 misses: 140 ms and change
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(scheduler.state(), PlayerState::Paused);

    let events = sink.events();
    assert_eq!(
        events,
        vec![
            SinkEventKind::Speaking(true),
            SinkEventKind::Frame(1),
            SinkEventKind::Frame(2),
            SinkEventKind::Speaking(false),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn buffering_gives_up_after_a_hundred_millis() {
    let scheduler = AudioScheduler::spawn(SchedulerOptions::default());
    let sink = Arc::new(RecordingSink::default());

    scheduler.subscribe(sink.clone()).await;

    // Seven empty ticks, then audio
    scheduler
        .play(ScriptedSource::new(vec![
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            Some(1),
            Some(2),
        ]))
        .await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    // Still buffering, quietly
    assert_eq!(scheduler.state(), PlayerState::Buffering);

    tokio::time::sleep(Duration::from_millis(60)).await;
    // The buffering window (100 ms) has passed
    assert_eq!(scheduler.state(), PlayerState::Playing);

    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = sink.events();
    assert!(events.contains(&SinkEventKind::Frame(1)));
    assert!(events.contains(&SinkEventKind::Frame(2)));
}

#[tokio::test(start_paused = true)]
async fn empty_subscriber_set_pauses_by_default() {
    let scheduler = AudioScheduler::spawn(SchedulerOptions::default());
    let sink = Arc::new(RecordingSink::default());

    scheduler.subscribe(sink.clone()).await;
    scheduler.play(counting_source()).await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    scheduler.unsubscribe(sink.clone()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(scheduler.state(), PlayerState::AutoPaused);
    let frames_while_paused = sink.frame_times().len();

    // A returning subscriber resumes playback
    scheduler.subscribe(sink.clone()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(scheduler.state(), PlayerState::Playing);
    assert!(sink.frame_times().len() > frames_while_paused);
}

#[tokio::test(start_paused = true)]
async fn empty_subscriber_set_can_stop() {
    let scheduler = AudioScheduler::spawn(SchedulerOptions {
        behavior_on_empty: EmptyBehavior::Stop,
        ..Default::default()
    });
    let sink = Arc::new(RecordingSink::default());

    scheduler.subscribe(sink.clone()).await;
    scheduler.play(counting_source()).await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    scheduler.unsubscribe(sink.clone()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(scheduler.state(), PlayerState::Idle);

    // A source that is gone does not come back on resume
    scheduler.resume().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.state(), PlayerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn empty_subscriber_set_can_keep_playing() {
    let scheduler = AudioScheduler::spawn(SchedulerOptions {
        behavior_on_empty: EmptyBehavior::Play,
        ..Default::default()
    });

    // No sink at all; the source still gets drained
    let drained = Arc::new(Mutex::new(0u32));
    let counter = drained.clone();

    scheduler
        .play(Box::new(move || {
            *counter.lock().unwrap() += 1;
            Some(vec![0])
        }))
        .await;

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(scheduler.state(), PlayerState::Playing);
    assert!(*drained.lock().unwrap() > 5);
}

#[tokio::test(start_paused = true)]
async fn pause_and_resume_round_trip() {
    let scheduler = AudioScheduler::spawn(SchedulerOptions::default());
    let sink = Arc::new(RecordingSink::default());

    scheduler.subscribe(sink.clone()).await;
    scheduler.play(counting_source()).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    scheduler.pause().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(scheduler.state(), PlayerState::Paused);
    let frames_at_pause = sink.frame_times().len();

    // Nothing moves while paused
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.frame_times().len(), frames_at_pause);

    // Speaking was cleared on pause, and set again on resume
    scheduler.resume().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(sink.frame_times().len() > frames_at_pause);

    let events = sink.events();
    let speaking_transitions: Vec<_> = events
        .iter()
        .filter(|kind| matches!(kind, SinkEventKind::Speaking(_)))
        .collect();
    assert_eq!(
        speaking_transitions,
        vec![
            &SinkEventKind::Speaking(true),
            &SinkEventKind::Speaking(false),
            &SinkEventKind::Speaking(true),
        ]
    );
}
