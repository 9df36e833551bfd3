//! Seams between the orchestrator and the real-time media provider.
//!
//! The provider's transport runs its own background I/O. The orchestrator
//! drives it only through these traits and listens to the [`RoomEvent`]s a
//! [`RoomHandle`] emits.

use crate::error::VoiceError;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

/// Default capacity for per-room event broadcast channels.
pub const DEFAULT_ROOM_EVENT_CAPACITY: usize = 64;

/// Bounded queue depth between an audio device callback and the room.
pub const DEFAULT_AUDIO_QUEUE_FRAMES: usize = 256;

/// A block of mono PCM samples, captured locally or received from the room.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

/// Notifications emitted by a joined room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// A remote participant (normally the interviewer agent) joined.
    ParticipantJoined { identity: String },
    /// A remote audio track was subscribed and is being rendered.
    RemoteAudioStarted { identity: String },
    /// The connection to the room was lost or closed by the provider.
    Disconnected { reason: String },
}

/// Joins media rooms.
#[async_trait]
pub trait RoomTransport: Send + Sync {
    /// Joins the room granted by `token` on the provider at `server_url`.
    ///
    /// Dropping the returned future before it resolves must release anything
    /// the join had acquired.
    async fn join(&self, server_url: &str, token: String)
        -> Result<Box<dyn RoomHandle>, VoiceError>;
}

/// A live connection to one room.
#[async_trait]
pub trait RoomHandle: Send + Sync {
    fn room_name(&self) -> &str;

    /// Starts publishing microphone frames as the local audio track.
    async fn publish_microphone(
        &mut self,
        frames: mpsc::Receiver<AudioFrame>,
    ) -> Result<(), VoiceError>;

    /// Starts delivering remote participants' audio into `frames`, resampled
    /// to `sample_rate`.
    async fn enable_remote_audio(
        &mut self,
        frames: mpsc::Sender<AudioFrame>,
        sample_rate: u32,
    ) -> Result<(), VoiceError>;

    fn events(&self) -> broadcast::Receiver<RoomEvent>;

    /// Leaves the room and releases the connection.
    async fn close(self: Box<Self>);
}

/// Opens local audio input and output.
///
/// Opening may block on the operating system (device enumeration, a
/// permission prompt), so callers on an async runtime run it on a blocking
/// thread.
pub trait AudioDevice: Send + Sync {
    /// Starts capturing and pushes frames into `frames`.
    ///
    /// Permission denial and missing devices are [`VoiceError::Media`].
    fn open_microphone(
        &self,
        frames: mpsc::Sender<AudioFrame>,
    ) -> Result<Box<dyn MicrophoneCapture>, VoiceError>;

    /// Starts rendering the frames received on `frames`.
    fn open_speaker(
        &self,
        frames: mpsc::Receiver<AudioFrame>,
    ) -> Result<Box<dyn SpeakerPlayback>, VoiceError>;
}

/// An active microphone capture. Dropping it stops capture.
pub trait MicrophoneCapture: Send + Sync {
    fn device_name(&self) -> &str;

    fn is_active(&self) -> bool;

    /// Stops capture. Idempotent; may block until the device is closed.
    fn stop(&mut self);
}

/// An active audio output. Dropping it stops playback.
pub trait SpeakerPlayback: Send + Sync {
    fn device_name(&self) -> &str;

    /// Rate the device renders at; remote audio is requested at this rate.
    fn sample_rate(&self) -> u32;

    fn is_active(&self) -> bool;

    /// Stops playback. Idempotent; may block until the device is closed.
    fn stop(&mut self);
}

/// Media resources the orchestrator currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaResources {
    pub room: bool,
    pub microphone: bool,
    pub speaker: bool,
}

impl MediaResources {
    pub fn is_empty(&self) -> bool {
        !self.room && !self.microphone && !self.speaker
    }
}
