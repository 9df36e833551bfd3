//! A room joined through the LiveKit SDK.

use crate::error::VoiceError;
use crate::media::{AudioFrame, RoomEvent, RoomHandle, DEFAULT_ROOM_EVENT_CAPACITY};
use ::livekit::options::TrackPublishOptions;
use ::livekit::prelude::{LocalAudioTrack, LocalTrack, RemoteTrack, TrackSource};
use ::livekit::webrtc::audio_frame::AudioFrame as PcmFrame;
use ::livekit::webrtc::audio_source::native::NativeAudioSource;
use ::livekit::webrtc::audio_source::{AudioSourceOptions, RtcAudioSource};
use ::livekit::webrtc::audio_stream::native::NativeAudioStream;
use ::livekit::webrtc::audio_track::RtcAudioTrack;
use ::livekit::{DisconnectReason, Room, RoomOptions};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Buffering inside the WebRTC audio source, in milliseconds.
const SOURCE_QUEUE_MS: u32 = 100;

/// How long publishing waits for the microphone's first frame, which
/// carries the capture sample rate.
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Where subscribed remote audio is delivered.
#[derive(Clone)]
struct RemoteOutput {
    frames: mpsc::Sender<AudioFrame>,
    sample_rate: u32,
}

pub(super) struct LiveKitRoom {
    room: Option<Room>,
    room_name: String,
    events_tx: broadcast::Sender<RoomEvent>,
    output_tx: watch::Sender<Option<RemoteOutput>>,
    forwarder: JoinHandle<()>,
    publisher: Option<JoinHandle<()>>,
}

impl LiveKitRoom {
    pub(super) async fn connect(
        server_url: &str,
        token: &str,
        auto_subscribe: bool,
    ) -> Result<Self, VoiceError> {
        let mut options = RoomOptions::default();
        options.auto_subscribe = auto_subscribe;

        let (room, sdk_events) = Room::connect(server_url, token, options).await?;
        let room_name = room.name();

        let (events_tx, _) = broadcast::channel(DEFAULT_ROOM_EVENT_CAPACITY);
        let (output_tx, output_rx) = watch::channel(None);
        let forwarder = tokio::spawn(forward_events(sdk_events, events_tx.clone(), output_rx));

        Ok(Self {
            room: Some(room),
            room_name,
            events_tx,
            output_tx,
            forwarder,
            publisher: None,
        })
    }

    pub(super) fn name(&self) -> &str {
        &self.room_name
    }
}

#[async_trait]
impl RoomHandle for LiveKitRoom {
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
        let room = self
            .room
            .as_ref()
            .ok_or_else(|| VoiceError::Network("room already closed".to_string()))?;

        let first = match tokio::time::timeout(FIRST_FRAME_TIMEOUT, frames.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                return Err(VoiceError::Media(
                    "microphone stopped before producing audio".to_string(),
                ))
            }
            Err(_) => {
                return Err(VoiceError::Media(format!(
                    "no audio from microphone after {}s",
                    FIRST_FRAME_TIMEOUT.as_secs()
                )))
            }
        };

        let source = NativeAudioSource::new(
            AudioSourceOptions::default(),
            first.sample_rate,
            1,
            SOURCE_QUEUE_MS,
        );
        let track = LocalAudioTrack::create_audio_track(
            "microphone",
            RtcAudioSource::Native(source.clone()),
        );
        let options = TrackPublishOptions {
            source: TrackSource::Microphone,
            ..TrackPublishOptions::default()
        };
        room.local_participant()
            .publish_track(LocalTrack::Audio(track), options)
            .await?;
        info!(
            room = %self.room_name,
            sample_rate = first.sample_rate,
            "microphone track published"
        );

        self.publisher = Some(tokio::spawn(pump_microphone(source, first, frames)));
        Ok(())
    }

    async fn enable_remote_audio(
        &mut self,
        frames: mpsc::Sender<AudioFrame>,
        sample_rate: u32,
    ) -> Result<(), VoiceError> {
        self.output_tx
            .send_replace(Some(RemoteOutput { frames, sample_rate }));
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<RoomEvent> {
        self.events_tx.subscribe()
    }

    async fn close(mut self: Box<Self>) {
        self.forwarder.abort();
        if let Some(publisher) = self.publisher.take() {
            publisher.abort();
        }
        if let Some(room) = self.room.take() {
            if let Err(e) = room.close().await {
                warn!(error = %e, room = %self.room_name, "failed to leave room cleanly");
            }
        }
        info!(room = %self.room_name, "left room");
    }
}

impl Drop for LiveKitRoom {
    fn drop(&mut self) {
        self.forwarder.abort();
        if let Some(publisher) = self.publisher.take() {
            publisher.abort();
        }
        if let Some(room) = self.room.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let _ = room.close().await;
                    });
                }
                Err(_) => drop(room),
            }
        }
    }
}

/// Maps an SDK room event to the events the orchestrator follows. Track
/// subscriptions are handled by the forwarder, which reports them once
/// rendering starts.
fn room_event(event: &::livekit::RoomEvent) -> Option<RoomEvent> {
    match event {
        ::livekit::RoomEvent::ParticipantConnected(participant) => {
            Some(RoomEvent::ParticipantJoined {
                identity: participant.identity().0,
            })
        }
        ::livekit::RoomEvent::Disconnected { reason } => Some(RoomEvent::Disconnected {
            reason: disconnect_reason(*reason),
        }),
        _ => None,
    }
}

fn disconnect_reason(reason: DisconnectReason) -> String {
    match reason {
        DisconnectReason::ClientInitiated => "left by client".to_string(),
        DisconnectReason::ServerShutdown => "media provider shut down".to_string(),
        DisconnectReason::RoomDeleted | DisconnectReason::RoomClosed => "room closed".to_string(),
        DisconnectReason::ParticipantRemoved => "removed from room".to_string(),
        DisconnectReason::DuplicateIdentity => {
            "another client joined with the same identity".to_string()
        }
        other => format!("{other:?}"),
    }
}

/// Relays SDK events and starts rendering subscribed audio tracks once a
/// speaker is attached. Ends with a [`RoomEvent::Disconnected`].
async fn forward_events(
    mut sdk_events: mpsc::UnboundedReceiver<::livekit::RoomEvent>,
    events_tx: broadcast::Sender<RoomEvent>,
    mut output_rx: watch::Receiver<Option<RemoteOutput>>,
) {
    let mut pending: Vec<(String, RtcAudioTrack)> = Vec::new();
    // Dropping the set aborts every renderer.
    let mut renderers = JoinSet::new();

    let reason = loop {
        tokio::select! {
            event = sdk_events.recv() => {
                let Some(event) = event else {
                    break "room event stream ended".to_string();
                };
                if let ::livekit::RoomEvent::TrackSubscribed {
                    track: RemoteTrack::Audio(track),
                    participant,
                    ..
                } = &event
                {
                    pending.push((participant.identity().0, track.rtc_track()));
                }
                match room_event(&event) {
                    Some(RoomEvent::Disconnected { reason }) => break reason,
                    Some(mapped) => {
                        let _ = events_tx.send(mapped);
                    }
                    None => {}
                }
            }
            changed = output_rx.changed() => {
                if changed.is_err() {
                    break "room handle dropped".to_string();
                }
            }
        }

        let output = output_rx.borrow().clone();
        if let Some(output) = output {
            for (identity, track) in pending.drain(..) {
                debug!(%identity, sample_rate = output.sample_rate, "rendering remote audio track");
                renderers.spawn(render_remote_audio(track, output.clone()));
                let _ = events_tx.send(RoomEvent::RemoteAudioStarted { identity });
            }
        }
    };

    renderers.abort_all();
    let _ = events_tx.send(RoomEvent::Disconnected { reason });
}

/// Feeds microphone frames into the published track until capture stops.
async fn pump_microphone(
    source: NativeAudioSource,
    first: AudioFrame,
    mut frames: mpsc::Receiver<AudioFrame>,
) {
    let mut frame = first;
    loop {
        let pcm: Vec<i16> = frame.samples.iter().copied().map(to_pcm16).collect();
        let captured = PcmFrame {
            samples_per_channel: pcm.len() as u32,
            data: pcm.into(),
            sample_rate: frame.sample_rate,
            num_channels: 1,
        };
        if let Err(e) = source.capture_frame(&captured).await {
            warn!(error = %e, "failed to push microphone audio");
            break;
        }
        match frames.recv().await {
            Some(next) => frame = next,
            None => break,
        }
    }
    debug!("microphone publishing stopped");
}

/// Delivers one remote track to the speaker as mono frames.
async fn render_remote_audio(track: RtcAudioTrack, output: RemoteOutput) {
    let mut stream = NativeAudioStream::new(track, output.sample_rate as i32, 1);
    while let Some(frame) = stream.next().await {
        let samples = frame.data.iter().copied().map(from_pcm16).collect();
        let decoded = AudioFrame {
            sample_rate: frame.sample_rate,
            samples,
        };
        match output.frames.try_send(decoded) {
            // A late frame is worse than a dropped one.
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

fn to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

fn from_pcm16(sample: i16) -> f32 {
    f32::from(sample) / f32::from(i16::MAX)
}
