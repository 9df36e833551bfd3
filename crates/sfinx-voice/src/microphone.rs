//! System microphone capture through cpal. Playback lives in
//! [`speaker`](crate::speaker).
//!
//! cpal streams are not `Send` on every platform, so each capture owns a
//! dedicated thread that builds the stream, reports readiness, and keeps the
//! stream alive until told to stop.

use crate::error::VoiceError;
use crate::media::{AudioDevice, AudioFrame, MicrophoneCapture, SpeakerPlayback};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// System audio through cpal: the default input and output devices, or
/// named ones.
#[derive(Debug, Clone, Default)]
pub struct CpalAudioDevice {
    input: Option<String>,
    output: Option<String>,
}

impl CpalAudioDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefers the input device whose name contains `name`.
    pub fn with_input_device(mut self, name: impl Into<String>) -> Self {
        self.input = Some(name.into());
        self
    }

    /// Prefers the output device whose name contains `name`.
    pub fn with_output_device(mut self, name: impl Into<String>) -> Self {
        self.output = Some(name.into());
        self
    }
}

fn select_device(preferred: Option<&str>) -> Result<Device, VoiceError> {
    let host = cpal::default_host();
    if let Some(wanted) = preferred {
        let devices = host
            .input_devices()
            .map_err(|e| VoiceError::Media(format!("failed to list input devices: {e}")))?;
        for device in devices {
            if device.name().is_ok_and(|name| name.contains(wanted)) {
                return Ok(device);
            }
        }
        warn!(device = wanted, "preferred input device not found, using default");
    }
    host.default_input_device()
        .ok_or_else(|| VoiceError::Media("no input device available".to_string()))
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    frames: mpsc::Sender<AudioFrame>,
    active: Arc<AtomicBool>,
) -> Result<Stream, VoiceError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    let sample_rate = config.sample_rate.0;
    let err_active = Arc::clone(&active);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !active.load(Ordering::Relaxed) {
                    return;
                }
                // Downmix to mono
                let samples = data
                    .chunks(channels)
                    .map(|frame| {
                        frame.iter().map(|s| f32::from_sample_(*s)).sum::<f32>() / channels as f32
                    })
                    .collect();
                if let Err(e) = frames.try_send(AudioFrame {
                    sample_rate,
                    samples,
                }) {
                    debug!("dropping microphone frame: {}", e);
                }
            },
            move |err| {
                error!("microphone stream error: {}", err);
                err_active.store(false, Ordering::Relaxed);
            },
            None,
        )
        .map_err(|e| VoiceError::Media(format!("failed to open microphone: {e}")))
}

fn start_capture(
    preferred: Option<&str>,
    frames: mpsc::Sender<AudioFrame>,
    active: Arc<AtomicBool>,
) -> Result<(Stream, String), VoiceError> {
    let device = select_device(preferred)?;
    let name = device.name().unwrap_or_else(|_| "unknown input".to_string());
    let supported = device
        .default_input_config()
        .map_err(|e| VoiceError::Media(format!("failed to get input config: {e}")))?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();

    let stream = match format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, frames, active)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, frames, active)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, frames, active)?,
        other => {
            return Err(VoiceError::Media(format!(
                "unsupported microphone sample format {other:?}"
            )))
        }
    };
    stream
        .play()
        .map_err(|e| VoiceError::Media(format!("failed to start microphone: {e}")))?;
    Ok((stream, name))
}

impl AudioDevice for CpalAudioDevice {
    fn open_microphone(
        &self,
        frames: mpsc::Sender<AudioFrame>,
    ) -> Result<Box<dyn MicrophoneCapture>, VoiceError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<String, VoiceError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let active = Arc::new(AtomicBool::new(true));
        let thread_active = Arc::clone(&active);
        let preferred = self.input.clone();

        let thread = std::thread::Builder::new()
            .name("sfinx-microphone".to_string())
            .spawn(move || {
                match start_capture(preferred.as_deref(), frames, Arc::clone(&thread_active)) {
                    Ok((stream, name)) => {
                        let _ = ready_tx.send(Ok(name));
                        // Blocks until stop() or the capture handle is dropped.
                        let _ = stop_rx.recv();
                        thread_active.store(false, Ordering::Relaxed);
                        drop(stream);
                    }
                    Err(e) => {
                        thread_active.store(false, Ordering::Relaxed);
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| VoiceError::Media(format!("failed to spawn capture thread: {e}")))?;

        let name = ready_rx
            .recv()
            .map_err(|_| VoiceError::Media("capture thread exited unexpectedly".to_string()))??;
        info!(device = %name, "microphone capture started");

        Ok(Box::new(CpalCapture {
            name,
            active,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }))
    }

    fn open_speaker(
        &self,
        frames: mpsc::Receiver<AudioFrame>,
    ) -> Result<Box<dyn SpeakerPlayback>, VoiceError> {
        crate::speaker::open_speaker(self.output.as_deref(), frames)
    }
}

struct CpalCapture {
    name: String,
    active: Arc<AtomicBool>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MicrophoneCapture for CpalCapture {
    fn device_name(&self) -> &str {
        &self.name
    }

    fn is_active(&self) -> bool {
        self.stop_tx.is_some() && self.active.load(Ordering::Relaxed)
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
            info!(device = %self.name, "microphone capture stopped");
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
