//! Voice-room connection client for sfinx interviews.
//!
//! A candidate joins a voice interview in two steps: the backend trades the
//! operator's bearer token for a short-lived room-access token, and that
//! token is then used to join a real-time audio room where the interviewer
//! agent is waiting. [`ConnectionOrchestrator`] drives both steps and owns the
//! resulting [`ConnectionState`](sfinx_types::ConnectionState).
//!
//! The media transport is a provided capability. The orchestrator only talks
//! to it through the [`RoomTransport`] and [`AudioDevice`] seams in
//! [`media`]. [`simulated`] implements both in-process. With the `webrtc`
//! feature [`livekit`](crate::livekit) joins real rooms through the LiveKit SDK, and with
//! `audio-io` the system microphone and speaker are driven through cpal.

pub mod backend;
pub mod config;
pub mod error;
pub mod livekit;
pub mod media;
#[cfg(feature = "audio-io")]
pub mod microphone;
pub mod orchestrator;
pub mod simulated;
#[cfg(feature = "audio-io")]
mod speaker;
pub mod token;

pub use backend::BackendClient;
pub use config::{BackendConfig, LiveKitConfig, DEFAULT_TOKEN_PATH};
pub use error::VoiceError;
pub use self::livekit::LiveKitTransport;
pub use media::{
    AudioDevice, AudioFrame, MediaResources, MicrophoneCapture, RoomEvent, RoomHandle,
    RoomTransport, SpeakerPlayback,
};
#[cfg(feature = "audio-io")]
pub use microphone::CpalAudioDevice;
pub use orchestrator::ConnectionOrchestrator;
pub use simulated::{SimulatedAudioDevice, SimulatedTransport};
pub use token::RoomTokenClaims;
