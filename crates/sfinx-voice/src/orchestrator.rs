//! Token-acquisition-and-connect handshake.
//!
//! One attempt runs `Idle -> RequestingToken -> Connecting -> Connected`, or
//! ends in `Failed` at the step that errored. `disconnect` may interrupt any
//! step: it bumps the attempt generation and wakes every in-flight await,
//! so a step that completes afterwards sees it has been superseded and
//! releases whatever it acquired instead of installing it.

use crate::backend::BackendClient;
use crate::config::LiveKitConfig;
use crate::error::VoiceError;
use crate::media::{
    AudioDevice, MediaResources, MicrophoneCapture, RoomEvent, RoomHandle, RoomTransport,
    SpeakerPlayback, DEFAULT_AUDIO_QUEUE_FRAMES,
};
use crate::token::RoomTokenClaims;
use sfinx_types::{
    ConnectionState, FailureKind, RoomAccessToken, SessionCredentials, StateTransition,
};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tracing::{debug, info, warn};

/// Default capacity for the state transition broadcast channel.
const DEFAULT_TRANSITION_BROADCAST_CAPACITY: usize = 64;

/// Media acquired for one attempt. Any part may be missing while the
/// attempt is still joining or after a partial failure.
#[derive(Default)]
struct Media {
    room: Option<Box<dyn RoomHandle>>,
    microphone: Option<Box<dyn MicrophoneCapture>>,
    speaker: Option<Box<dyn SpeakerPlayback>>,
}

impl Media {
    fn is_empty(&self) -> bool {
        self.room.is_none() && self.microphone.is_none() && self.speaker.is_none()
    }

    /// Stops the devices and leaves the room.
    ///
    /// Device shutdown can block on the audio driver, so it runs on a
    /// blocking thread.
    async fn release(self) {
        let Media {
            room,
            microphone,
            speaker,
        } = self;
        if microphone.is_some() || speaker.is_some() {
            let stopped = tokio::task::spawn_blocking(move || stop_devices(microphone, speaker));
            if let Err(e) = stopped.await {
                warn!(error = %e, "audio device shutdown panicked");
            }
        }
        if let Some(room) = room {
            debug!(room = room.room_name(), "closing room connection");
            room.close().await;
        }
    }
}

fn stop_devices(
    microphone: Option<Box<dyn MicrophoneCapture>>,
    speaker: Option<Box<dyn SpeakerPlayback>>,
) {
    if let Some(mut microphone) = microphone {
        debug!(device = microphone.device_name(), "stopping microphone capture");
        microphone.stop();
    }
    if let Some(mut speaker) = speaker {
        debug!(device = speaker.device_name(), "stopping speaker playback");
        speaker.stop();
    }
}

/// Media held by a connected attempt.
struct Joined {
    media: Media,
    events: broadcast::Receiver<RoomEvent>,
}

#[derive(Default)]
struct Attempt {
    generation: u64,
    media: Media,
}

impl Attempt {
    fn take_media(&mut self) -> Media {
        std::mem::take(&mut self.media)
    }
}

struct Shared {
    attempt: Mutex<Attempt>,
    state_tx: watch::Sender<ConnectionState>,
    transitions_tx: broadcast::Sender<StateTransition>,
    cancel: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Attempt> {
        self.attempt.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn generation(&self) -> u64 {
        self.lock().generation
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Moves to `to`. Callers hold the attempt lock, which keeps the
    /// transition stream consistent with the resources held.
    fn transition(&self, _held: &mut Attempt, to: ConnectionState) {
        let from = self.state_tx.send_replace(to.clone());
        if from == to {
            return;
        }
        info!(from = from.label(), to = to.label(), status = %to, "connection state changed");
        let _ = self.transitions_tx.send(StateTransition { from, to });
    }

    /// Records `err` as the outcome of attempt `generation`, unless a
    /// `disconnect` already superseded it.
    fn fail(&self, generation: u64, err: VoiceError) -> VoiceError {
        let mut attempt = self.lock();
        if attempt.generation == generation {
            warn!(error = %err, kind = err.kind().label(), "connection attempt failed");
            let failed = ConnectionState::failed(err.kind(), err.to_string());
            self.transition(&mut attempt, failed);
        }
        err
    }

    /// Handles the provider dropping a connected room.
    async fn room_lost(&self, generation: u64, reason: String) {
        let media = {
            let mut attempt = self.lock();
            if attempt.generation != generation || self.state() != ConnectionState::Connected {
                return;
            }
            warn!(%reason, "room connection lost");
            attempt.generation += 1;
            let media = attempt.take_media();
            let failed = ConnectionState::failed(
                FailureKind::Network,
                format!("room connection lost: {reason}"),
            );
            self.transition(&mut attempt, failed);
            media
        };
        media.release().await;
    }

    /// Runs `fut` unless attempt `generation` is superseded first.
    async fn guarded<F: Future>(&self, generation: u64, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            let cancelled = self.cancel.notified();
            tokio::pin!(cancelled);
            cancelled.as_mut().enable();
            if self.generation() != generation {
                return None;
            }
            tokio::select! {
                output = &mut fut => return Some(output),
                () = &mut cancelled => {}
            }
        }
    }
}

/// Drives the token request and room join for one interview client.
///
/// The orchestrator exclusively owns the [`ConnectionState`]; callers observe
/// it through [`state`](Self::state), [`watch_state`](Self::watch_state) or
/// [`subscribe_transitions`](Self::subscribe_transitions).
pub struct ConnectionOrchestrator {
    backend: BackendClient,
    livekit: LiveKitConfig,
    transport: Arc<dyn RoomTransport>,
    audio: Arc<dyn AudioDevice>,
    shared: Arc<Shared>,
}

impl ConnectionOrchestrator {
    pub fn new(
        backend: BackendClient,
        livekit: LiveKitConfig,
        transport: Arc<dyn RoomTransport>,
        audio: Arc<dyn AudioDevice>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (transitions_tx, _) = broadcast::channel(DEFAULT_TRANSITION_BROADCAST_CAPACITY);
        Self {
            backend,
            livekit,
            transport,
            audio,
            shared: Arc::new(Shared {
                attempt: Mutex::new(Attempt::default()),
                state_tx,
                transitions_tx,
                cancel: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.shared.transitions_tx.subscribe()
    }

    /// Media currently held on behalf of the caller.
    pub fn active_resources(&self) -> MediaResources {
        let attempt = self.shared.lock();
        let media = &attempt.media;
        MediaResources {
            room: media.room.is_some(),
            microphone: media.microphone.as_ref().is_some_and(|m| m.is_active()),
            speaker: media.speaker.as_ref().is_some_and(|s| s.is_active()),
        }
    }

    /// Name of the joined room while connected.
    pub fn room_name(&self) -> Option<String> {
        self.shared
            .lock()
            .media
            .room
            .as_ref()
            .map(|room| room.room_name().to_string())
    }

    /// Requests a token and joins the room with it.
    ///
    /// Returns `Connected` on success, or `Disconnected` when `disconnect`
    /// interrupted the attempt. On error the state is `Failed` with the
    /// error's category and no media is held.
    pub async fn connect(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<ConnectionState, VoiceError> {
        let (generation, token) = match self.request_token(credentials).await {
            Ok(granted) => granted,
            Err(VoiceError::Cancelled) => return Ok(self.state()),
            Err(err) => return Err(err),
        };
        {
            let mut attempt = self.shared.lock();
            if attempt.generation != generation {
                return Ok(self.shared.state());
            }
            self.shared
                .transition(&mut attempt, ConnectionState::Connecting);
        }
        self.finish_join(generation, token).await
    }

    /// Starts a new attempt and requests a room-access token for it.
    ///
    /// Leaves the state at `RequestingToken` on success so the token can be
    /// handed to [`join`](Self::join).
    pub async fn request_access_token(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<RoomAccessToken, VoiceError> {
        self.request_token(credentials)
            .await
            .map(|(_, token)| token)
    }

    async fn request_token(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<(u64, RoomAccessToken), VoiceError> {
        let generation = self.begin_attempt()?;

        match self
            .shared
            .guarded(generation, self.backend.request_access_token(credentials))
            .await
        {
            None => Err(VoiceError::Cancelled),
            Some(Err(err)) => Err(self.shared.fail(generation, err)),
            Some(Ok(_)) if self.shared.generation() != generation => Err(VoiceError::Cancelled),
            Some(Ok(token)) => {
                info!(room = ?token.room_name(), "room access token obtained");
                Ok((generation, token))
            }
        }
    }

    /// Joins the room granted by `token`, obtained in the current attempt.
    pub async fn join(&self, token: RoomAccessToken) -> Result<ConnectionState, VoiceError> {
        let generation = {
            let mut attempt = self.shared.lock();
            let state = self.shared.state();
            if state != ConnectionState::RequestingToken {
                return Err(VoiceError::InvalidState(state.label()));
            }
            self.shared
                .transition(&mut attempt, ConnectionState::Connecting);
            attempt.generation
        };
        self.finish_join(generation, token).await
    }

    async fn finish_join(
        &self,
        generation: u64,
        token: RoomAccessToken,
    ) -> Result<ConnectionState, VoiceError> {
        let joined = match self.join_room(generation, token).await {
            Ok(Some(joined)) => joined,
            Ok(None) => return Ok(self.state()),
            Err(err) => return Err(self.shared.fail(generation, err)),
        };

        let Joined { media, events } = joined;

        let superseded = {
            let mut attempt = self.shared.lock();
            if attempt.generation == generation {
                attempt.media = media;
                self.shared
                    .transition(&mut attempt, ConnectionState::Connected);
                None
            } else {
                Some(media)
            }
        };

        match superseded {
            None => {
                self.watch_room(generation, events);
                Ok(ConnectionState::Connected)
            }
            Some(media) => {
                debug!("attempt superseded after join, releasing media");
                media.release().await;
                Ok(self.state())
            }
        }
    }

    /// Leaves the room and stops the microphone and speaker. Safe to call in any state,
    /// including while `connect` is in flight; idempotent.
    pub async fn disconnect(&self) -> ConnectionState {
        let media = {
            let mut attempt = self.shared.lock();
            attempt.generation += 1;
            let media = attempt.take_media();
            self.shared
                .transition(&mut attempt, ConnectionState::Disconnected);
            // Notified under the lock so a newly started attempt never
            // observes this wake-up.
            self.shared.cancel.notify_waiters();
            media
        };
        media.release().await;
        ConnectionState::Disconnected
    }

    fn begin_attempt(&self) -> Result<u64, VoiceError> {
        let mut attempt = self.shared.lock();
        let state = self.shared.state();
        if !state.is_settled() {
            return Err(VoiceError::AlreadyActive(state.label()));
        }
        attempt.generation += 1;
        self.shared.transition(&mut attempt, ConnectionState::Idle);
        self.shared
            .transition(&mut attempt, ConnectionState::RequestingToken);
        Ok(attempt.generation)
    }

    /// Joins the room and starts audio both ways. Everything acquired is
    /// released on error; `Ok(None)` means the attempt was superseded.
    async fn join_room(
        &self,
        generation: u64,
        token: RoomAccessToken,
    ) -> Result<Option<Joined>, VoiceError> {
        let claims = RoomTokenClaims::inspect(&token)?;
        if let (Some(expected), Some(granted)) = (token.room_name(), claims.room()) {
            if expected != granted {
                return Err(VoiceError::InvalidToken(format!(
                    "token grants room {granted} but backend announced {expected}"
                )));
            }
        }

        let server_url = token
            .server_url()
            .or_else(|| self.livekit.fallback_url())
            .map(str::to_string)
            .ok_or_else(|| {
                VoiceError::Config(
                    "no media provider URL: backend returned none and livekit.url is unset"
                        .to_string(),
                )
            })?;

        info!(url = %server_url, identity = %claims.sub, "joining room");

        let timeout = self.livekit.connect_timeout();
        let join = tokio::time::timeout(
            timeout,
            self.transport.join(&server_url, token.into_secret()),
        );
        let mut room = match self.shared.guarded(generation, join).await {
            None => return Ok(None),
            Some(Err(_)) => {
                return Err(VoiceError::Network(format!(
                    "timed out joining room after {}s",
                    timeout.as_secs()
                )))
            }
            Some(Ok(joined)) => joined?,
        };
        let events = room.events();

        let mut media = Media::default();
        let started = self.start_audio(generation, room.as_mut(), &mut media).await;
        media.room = Some(room);

        match started {
            Ok(true) => {
                if let (Some(room), Some(microphone), Some(speaker)) =
                    (&media.room, &media.microphone, &media.speaker)
                {
                    info!(
                        room = room.room_name(),
                        microphone = microphone.device_name(),
                        speaker = speaker.device_name(),
                        "joined interview room"
                    );
                }
                Ok(Some(Joined { media, events }))
            }
            Ok(false) => {
                debug!("attempt superseded while starting audio, releasing media");
                media.release().await;
                Ok(None)
            }
            Err(err) => {
                media.release().await;
                Err(err)
            }
        }
    }

    /// Opens the microphone and speaker into `media` and wires them to
    /// `room`. `Ok(false)` means the attempt was superseded first; whatever
    /// was opened is left in `media` for the caller to release.
    async fn start_audio(
        &self,
        generation: u64,
        room: &mut dyn RoomHandle,
        media: &mut Media,
    ) -> Result<bool, VoiceError> {
        let (mic_tx, mic_rx) = mpsc::channel(DEFAULT_AUDIO_QUEUE_FRAMES);
        let audio = Arc::clone(&self.audio);
        match self
            .open_device(generation, move || audio.open_microphone(mic_tx))
            .await?
        {
            Some(microphone) => media.microphone = Some(microphone),
            None => return Ok(false),
        }

        let (speaker_tx, speaker_rx) = mpsc::channel(DEFAULT_AUDIO_QUEUE_FRAMES);
        let audio = Arc::clone(&self.audio);
        let sample_rate = match self
            .open_device(generation, move || audio.open_speaker(speaker_rx))
            .await?
        {
            Some(speaker) => {
                let rate = speaker.sample_rate();
                media.speaker = Some(speaker);
                rate
            }
            None => return Ok(false),
        };

        match self
            .shared
            .guarded(generation, room.publish_microphone(mic_rx))
            .await
        {
            Some(published) => published?,
            None => return Ok(false),
        }
        match self
            .shared
            .guarded(generation, room.enable_remote_audio(speaker_tx, sample_rate))
            .await
        {
            Some(enabled) => enabled?,
            None => return Ok(false),
        }

        if !media.microphone.as_ref().is_some_and(|m| m.is_active()) {
            return Err(VoiceError::Media("microphone capture stopped".to_string()));
        }
        Ok(true)
    }

    /// Runs a blocking device open off the async workers. A device that
    /// finishes opening after the attempt was superseded is dropped, which
    /// stops it.
    async fn open_device<T, F>(&self, generation: u64, open: F) -> Result<Option<T>, VoiceError>
    where
        F: FnOnce() -> Result<T, VoiceError> + Send + 'static,
        T: Send + 'static,
    {
        match self
            .shared
            .guarded(generation, tokio::task::spawn_blocking(open))
            .await
        {
            None => Ok(None),
            Some(Ok(opened)) => opened.map(Some),
            Some(Err(e)) => Err(VoiceError::Media(format!("audio device task failed: {e}"))),
        }
    }

    /// Follows room events until the attempt ends.
    fn watch_room(&self, generation: u64, mut events: broadcast::Receiver<RoomEvent>) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                let event = match shared.guarded(generation, events.recv()).await {
                    None => break,
                    Some(event) => event,
                };
                match event {
                    Ok(RoomEvent::Disconnected { reason }) => {
                        shared.room_lost(generation, reason).await;
                        break;
                    }
                    Ok(RoomEvent::ParticipantJoined { identity }) => {
                        info!(%identity, "participant joined room");
                    }
                    Ok(RoomEvent::RemoteAudioStarted { identity }) => {
                        info!(%identity, "rendering remote audio");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "room event stream lagged");
                    }
                    Err(RecvError::Closed) => {
                        shared
                            .room_lost(generation, "event stream closed".to_string())
                            .await;
                        break;
                    }
                }
            }
        });
    }
}

impl Drop for ConnectionOrchestrator {
    fn drop(&mut self) {
        let media = {
            let mut attempt = self.shared.lock();
            attempt.generation += 1;
            self.shared.cancel.notify_waiters();
            attempt.take_media()
        };
        if media.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(media.release());
            }
            Err(_) => {
                let Media {
                    room,
                    microphone,
                    speaker,
                } = media;
                stop_devices(microphone, speaker);
                drop(room);
            }
        }
    }
}
