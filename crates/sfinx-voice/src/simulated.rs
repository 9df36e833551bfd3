//! In-process media provider.
//!
//! Stands in for the real room provider and microphone when no media stack is
//! available (CI, headless operator machines). Joins still read the token
//! claims the way the provider would, and every acquired resource is counted
//! so callers can assert that nothing leaks.

use crate::error::VoiceError;
use crate::media::{
    AudioDevice, AudioFrame, MicrophoneCapture, RoomEvent, RoomHandle, RoomTransport,
    SpeakerPlayback, DEFAULT_ROOM_EVENT_CAPACITY,
};
use crate::token::RoomTokenClaims;
use async_trait::async_trait;
use sfinx_types::{FailureKind, RoomAccessToken};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::info;

/// Identity the simulated interviewer joins with.
pub const SIMULATED_AGENT_IDENTITY: &str = "agent-interviewer";

const SIMULATED_SAMPLE_RATE: u32 = 48_000;
const SIMULATED_FRAME: Duration = Duration::from_millis(20);

/// Sends a 20 ms silent frame at `sample_rate` into `frames` until the
/// receiver goes away.
fn spawn_silence(frames: mpsc::Sender<AudioFrame>, sample_rate: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let samples_per_frame =
            (u128::from(sample_rate) * SIMULATED_FRAME.as_millis() / 1000) as usize;
        let mut ticker = tokio::time::interval(SIMULATED_FRAME);
        loop {
            ticker.tick().await;
            let frame = AudioFrame {
                sample_rate,
                samples: vec![0.0; samples_per_frame],
            };
            if frames.send(frame).await.is_err() {
                break;
            }
        }
    })
}

/// Decrements a live-resource counter when dropped.
#[derive(Debug)]
struct Lease(Arc<AtomicUsize>);

impl Lease {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn error_for(kind: FailureKind, message: &str) -> VoiceError {
    let message = message.to_string();
    match kind {
        FailureKind::Auth => VoiceError::Auth(message),
        FailureKind::NotFound => VoiceError::NotFound(message),
        FailureKind::Network => VoiceError::Network(message),
        FailureKind::Media => VoiceError::Media(message),
        FailureKind::Backend => VoiceError::Backend {
            status: 500,
            message,
        },
        FailureKind::Config => VoiceError::Config(message),
    }
}

#[derive(Debug, Default)]
struct TransportState {
    live_rooms: Arc<AtomicUsize>,
    joins: AtomicUsize,
    frames_published: Arc<AtomicU64>,
    join_delay: Mutex<Duration>,
    join_failure: Mutex<Option<(FailureKind, String)>>,
    next_room_id: AtomicU64,
    rooms: Mutex<Vec<(u64, broadcast::Sender<RoomEvent>)>>,
}

impl TransportState {
    fn rooms(&self) -> std::sync::MutexGuard<'_, Vec<(u64, broadcast::Sender<RoomEvent>)>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Simulated room provider.
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransport {
    state: Arc<TransportState>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every join, to exercise cancellation while connecting.
    pub fn with_join_delay(self, delay: Duration) -> Self {
        *self
            .state
            .join_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
        self
    }

    /// Makes every subsequent join fail with an error of `kind`.
    pub fn fail_joins(&self, kind: FailureKind, message: impl Into<String>) {
        *self
            .state
            .join_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((kind, message.into()));
    }

    /// Rooms currently joined and not yet closed.
    pub fn live_rooms(&self) -> usize {
        self.state.live_rooms.load(Ordering::SeqCst)
    }

    /// Join attempts that reached the provider.
    pub fn joins(&self) -> usize {
        self.state.joins.load(Ordering::SeqCst)
    }

    pub fn frames_published(&self) -> u64 {
        self.state.frames_published.load(Ordering::SeqCst)
    }

    /// Simulates the provider dropping every live room.
    pub fn drop_all_rooms(&self, reason: &str) {
        for (_, tx) in self.state.rooms().iter() {
            let _ = tx.send(RoomEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }
}

#[async_trait]
impl RoomTransport for SimulatedTransport {
    async fn join(
        &self,
        server_url: &str,
        token: String,
    ) -> Result<Box<dyn RoomHandle>, VoiceError> {
        self.state.joins.fetch_add(1, Ordering::SeqCst);

        // Claims are checked the way the provider would before admitting us.
        let claims = RoomTokenClaims::inspect(&RoomAccessToken::new(token))?;
        let room_name = claims.room().unwrap_or("simulated-room").to_string();

        info!(
            room = %room_name,
            url = server_url,
            identity = %claims.sub,
            "joining simulated room"
        );

        // Held across the delay so an abandoned join still releases it.
        let lease = Lease::acquire(&self.state.live_rooms);

        let delay = *self
            .state
            .join_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .state
            .join_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some((kind, message)) = failure {
            return Err(error_for(kind, &message));
        }

        let (events_tx, _) = broadcast::channel(DEFAULT_ROOM_EVENT_CAPACITY);
        let id = self.state.next_room_id.fetch_add(1, Ordering::SeqCst);
        self.state.rooms().push((id, events_tx.clone()));

        let _ = events_tx.send(RoomEvent::ParticipantJoined {
            identity: SIMULATED_AGENT_IDENTITY.to_string(),
        });

        Ok(Box::new(SimulatedRoom {
            id,
            room_name,
            events_tx,
            transport: Arc::clone(&self.state),
            publisher: None,
            agent_voice: None,
            _lease: lease,
        }))
    }
}

struct SimulatedRoom {
    id: u64,
    room_name: String,
    events_tx: broadcast::Sender<RoomEvent>,
    transport: Arc<TransportState>,
    publisher: Option<JoinHandle<()>>,
    agent_voice: Option<JoinHandle<()>>,
    _lease: Lease,
}

#[async_trait]
impl RoomHandle for SimulatedRoom {
    fn room_name(&self) -> &str {
        &self.room_name
    }

    async fn publish_microphone(
        &mut self,
        mut frames: mpsc::Receiver<AudioFrame>,
    ) -> Result<(), VoiceError> {
        if self.publisher.is_some() {
            return Err(VoiceError::Media(
                "microphone track already published".to_string(),
            ));
        }
        let counter = Arc::clone(&self.transport.frames_published);
        self.publisher = Some(tokio::spawn(async move {
            while frames.recv().await.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        Ok(())
    }

    async fn enable_remote_audio(
        &mut self,
        frames: mpsc::Sender<AudioFrame>,
        sample_rate: u32,
    ) -> Result<(), VoiceError> {
        if self.agent_voice.is_some() {
            return Ok(());
        }
        // The interviewer speaks silence.
        self.agent_voice = Some(spawn_silence(frames, sample_rate));
        let _ = self.events_tx.send(RoomEvent::RemoteAudioStarted {
            identity: SIMULATED_AGENT_IDENTITY.to_string(),
        });
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<RoomEvent> {
        self.events_tx.subscribe()
    }

    async fn close(self: Box<Self>) {
        info!(room = %self.room_name, "leaving simulated room");
    }
}

impl Drop for SimulatedRoom {
    fn drop(&mut self) {
        for task in [self.publisher.take(), self.agent_voice.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        self.transport.rooms().retain(|(id, _)| *id != self.id);
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    live_captures: Arc<AtomicUsize>,
    live_speakers: Arc<AtomicUsize>,
    opened: AtomicUsize,
    frames_rendered: Arc<AtomicU64>,
    deny_permission: AtomicBool,
    unavailable: AtomicBool,
    output_unavailable: AtomicBool,
    open_delay_ms: AtomicU64,
}

/// Simulated microphone producing silence, and a speaker that counts what
/// it is given.
#[derive(Debug, Clone, Default)]
pub struct SimulatedAudioDevice {
    state: Arc<DeviceState>,
}

impl SimulatedAudioDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behaves like a user who declined the microphone permission prompt.
    pub fn deny_permission(&self, deny: bool) {
        self.state.deny_permission.store(deny, Ordering::SeqCst);
    }

    /// Behaves like a machine with no input device.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Behaves like a machine with no output device.
    pub fn set_output_unavailable(&self, unavailable: bool) {
        self.state
            .output_unavailable
            .store(unavailable, Ordering::SeqCst);
    }

    /// Blocks the calling thread for `delay` on every microphone open, like
    /// a permission prompt the user has not answered yet.
    pub fn set_open_delay(&self, delay: Duration) {
        self.state
            .open_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Captures currently open.
    pub fn live_captures(&self) -> usize {
        self.state.live_captures.load(Ordering::SeqCst)
    }

    /// Speakers currently playing.
    pub fn live_speakers(&self) -> usize {
        self.state.live_speakers.load(Ordering::SeqCst)
    }

    /// Remote frames handed to a speaker.
    pub fn frames_rendered(&self) -> u64 {
        self.state.frames_rendered.load(Ordering::SeqCst)
    }

    /// Successful opens over the device's lifetime.
    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }
}

impl AudioDevice for SimulatedAudioDevice {
    fn open_microphone(
        &self,
        frames: mpsc::Sender<AudioFrame>,
    ) -> Result<Box<dyn MicrophoneCapture>, VoiceError> {
        let delay = self.state.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.state.deny_permission.load(Ordering::SeqCst) {
            return Err(VoiceError::Media(
                "microphone permission denied".to_string(),
            ));
        }
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(VoiceError::Media("no input device available".to_string()));
        }

        let lease = Lease::acquire(&self.state.live_captures);
        self.state.opened.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(SimulatedCapture {
            feeder: Some(spawn_silence(frames, SIMULATED_SAMPLE_RATE)),
            lease: Some(lease),
        }))
    }

    fn open_speaker(
        &self,
        mut frames: mpsc::Receiver<AudioFrame>,
    ) -> Result<Box<dyn SpeakerPlayback>, VoiceError> {
        if self.state.output_unavailable.load(Ordering::SeqCst) {
            return Err(VoiceError::Media("no output device available".to_string()));
        }

        let lease = Lease::acquire(&self.state.live_speakers);
        let rendered = Arc::clone(&self.state.frames_rendered);
        let sink = tokio::spawn(async move {
            while frames.recv().await.is_some() {
                rendered.fetch_add(1, Ordering::SeqCst);
            }
        });

        Ok(Box::new(SimulatedSpeaker {
            sink: Some(sink),
            lease: Some(lease),
        }))
    }
}

struct SimulatedCapture {
    feeder: Option<JoinHandle<()>>,
    lease: Option<Lease>,
}

impl MicrophoneCapture for SimulatedCapture {
    fn device_name(&self) -> &str {
        "simulated microphone"
    }

    fn is_active(&self) -> bool {
        self.lease.is_some()
    }

    fn stop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        self.lease = None;
    }
}

impl Drop for SimulatedCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SimulatedSpeaker {
    sink: Option<JoinHandle<()>>,
    lease: Option<Lease>,
}

impl SpeakerPlayback for SimulatedSpeaker {
    fn device_name(&self) -> &str {
        "simulated speaker"
    }

    fn sample_rate(&self) -> u32 {
        SIMULATED_SAMPLE_RATE
    }

    fn is_active(&self) -> bool {
        self.lease.is_some()
    }

    fn stop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.abort();
        }
        self.lease = None;
    }
}

impl Drop for SimulatedSpeaker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livekit_api::access_token::{AccessToken, VideoGrants};

    fn room_token(room: &str) -> String {
        AccessToken::with_api_key("devkey", "devsecret")
            .with_identity("candidate")
            .with_grants(VideoGrants {
                room_join: true,
                room: room.to_string(),
                can_publish: true,
                can_subscribe: true,
                ..Default::default()
            })
            .with_ttl(Duration::from_secs(600))
            .to_jwt()
            .unwrap()
    }

    #[tokio::test]
    async fn closed_rooms_leave_the_registry() {
        let transport = SimulatedTransport::new();
        for _ in 0..5 {
            let room = transport
                .join("ws://simulated", room_token("interview-a"))
                .await
                .unwrap();
            assert_eq!(transport.state.rooms().len(), 1);
            room.close().await;
        }
        assert!(transport.state.rooms().is_empty());
        assert_eq!(transport.live_rooms(), 0);
    }

    #[tokio::test]
    async fn dropped_rooms_leave_the_registry() {
        let transport = SimulatedTransport::new();
        let first = transport
            .join("ws://simulated", room_token("interview-a"))
            .await
            .unwrap();
        let second = transport
            .join("ws://simulated", room_token("interview-b"))
            .await
            .unwrap();
        drop(first);
        assert_eq!(transport.state.rooms().len(), 1);
        assert_eq!(second.room_name(), "interview-b");
        drop(second);
        assert!(transport.state.rooms().is_empty());
    }

    #[tokio::test]
    async fn remote_audio_reaches_the_speaker() {
        let transport = SimulatedTransport::new();
        let device = SimulatedAudioDevice::new();
        let mut room = transport
            .join("ws://simulated", room_token("interview-a"))
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(8);
        let mut speaker = device.open_speaker(rx).unwrap();
        room.enable_remote_audio(tx, speaker.sample_rate())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while device.frames_rendered() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no remote audio rendered");

        assert_eq!(device.live_speakers(), 1);
        speaker.stop();
        assert_eq!(device.live_speakers(), 0);
        room.close().await;
    }

    #[test]
    fn unavailable_output_is_media_error() {
        let device = SimulatedAudioDevice::new();
        device.set_output_unavailable(true);
        let (_tx, rx) = mpsc::channel(1);
        assert!(matches!(device.open_speaker(rx), Err(VoiceError::Media(_))));
        assert_eq!(device.live_speakers(), 0);
    }
}
