//! Remote audio playback through cpal.
//!
//! Like capture, each playback owns a thread that holds the output stream.
//! The stream callback pulls mono frames from the room and copies every
//! sample to all output channels, filling gaps with silence.

use crate::error::VoiceError;
use crate::media::{AudioFrame, SpeakerPlayback};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Playback buffer limit, in seconds of audio. Older samples are dropped
/// past it so latency cannot grow without bound.
const MAX_BUFFERED_SECS: usize = 1;

fn select_device(preferred: Option<&str>) -> Result<Device, VoiceError> {
    let host = cpal::default_host();
    if let Some(wanted) = preferred {
        let devices = host
            .output_devices()
            .map_err(|e| VoiceError::Media(format!("failed to list output devices: {e}")))?;
        for device in devices {
            if device.name().is_ok_and(|name| name.contains(wanted)) {
                return Ok(device);
            }
        }
        warn!(device = wanted, "preferred output device not found, using default");
    }
    host.default_output_device()
        .ok_or_else(|| VoiceError::Media("no output device available".to_string()))
}

/// Moves queued samples into `data`, one mono sample per output frame.
fn fill_output<T>(data: &mut [T], channels: usize, buffer: &mut VecDeque<f32>)
where
    T: SizedSample + FromSample<f32>,
{
    for frame in data.chunks_mut(channels) {
        let value = match buffer.pop_front() {
            Some(sample) => T::from_sample_(sample),
            None => T::EQUILIBRIUM,
        };
        frame.fill(value);
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut frames: mpsc::Receiver<AudioFrame>,
    active: Arc<AtomicBool>,
) -> Result<Stream, VoiceError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = usize::from(config.channels.max(1));
    let limit = config.sample_rate.0 as usize * MAX_BUFFERED_SECS;
    let err_active = Arc::clone(&active);
    let mut buffer: VecDeque<f32> = VecDeque::with_capacity(limit);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                while let Ok(frame) = frames.try_recv() {
                    buffer.extend(frame.samples);
                }
                if buffer.len() > limit {
                    let excess = buffer.len() - limit;
                    buffer.drain(..excess);
                }
                if !active.load(Ordering::Relaxed) {
                    buffer.clear();
                }
                fill_output(data, channels, &mut buffer);
            },
            move |err| {
                error!("speaker stream error: {}", err);
                err_active.store(false, Ordering::Relaxed);
            },
            None,
        )
        .map_err(|e| VoiceError::Media(format!("failed to open speaker: {e}")))
}

fn start_playback(
    preferred: Option<&str>,
    frames: mpsc::Receiver<AudioFrame>,
    active: Arc<AtomicBool>,
) -> Result<(Stream, String, u32), VoiceError> {
    let device = select_device(preferred)?;
    let name = device.name().unwrap_or_else(|_| "unknown output".to_string());
    let supported = device
        .default_output_config()
        .map_err(|e| VoiceError::Media(format!("failed to get output config: {e}")))?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let sample_rate = config.sample_rate.0;

    let stream = match format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, frames, active)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, frames, active)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, frames, active)?,
        other => {
            return Err(VoiceError::Media(format!(
                "unsupported speaker sample format {other:?}"
            )))
        }
    };
    stream
        .play()
        .map_err(|e| VoiceError::Media(format!("failed to start speaker: {e}")))?;
    Ok((stream, name, sample_rate))
}

/// Starts playback on the output device whose name contains `preferred`,
/// or the default one. Blocks until the device is open.
pub(crate) fn open_speaker(
    preferred: Option<&str>,
    frames: mpsc::Receiver<AudioFrame>,
) -> Result<Box<dyn SpeakerPlayback>, VoiceError> {
    let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(String, u32), VoiceError>>();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
    let active = Arc::new(AtomicBool::new(true));
    let thread_active = Arc::clone(&active);
    let preferred = preferred.map(str::to_string);

    let thread = std::thread::Builder::new()
        .name("sfinx-speaker".to_string())
        .spawn(move || {
            match start_playback(preferred.as_deref(), frames, Arc::clone(&thread_active)) {
                Ok((stream, name, sample_rate)) => {
                    let _ = ready_tx.send(Ok((name, sample_rate)));
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
        .map_err(|e| VoiceError::Media(format!("failed to spawn playback thread: {e}")))?;

    let (name, sample_rate) = ready_rx
        .recv()
        .map_err(|_| VoiceError::Media("playback thread exited unexpectedly".to_string()))??;
    info!(device = %name, sample_rate, "speaker playback started");

    Ok(Box::new(CpalPlayback {
        name,
        sample_rate,
        active,
        stop_tx: Some(stop_tx),
        thread: Some(thread),
    }))
}

struct CpalPlayback {
    name: String,
    sample_rate: u32,
    active: Arc<AtomicBool>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SpeakerPlayback for CpalPlayback {
    fn device_name(&self) -> &str {
        &self.name
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
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
            info!(device = %self.name, "speaker playback stopped");
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}
