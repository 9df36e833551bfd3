//! Interview voice client: requests a room token for the configured interview,
//! joins the room with the microphone published and the interviewer audible,
//! and stays connected until SIGTERM/SIGINT or the room goes away.

mod config;

use config::{AudioKind, Config, ConfigError, TransportKind};
use sfinx_types::ConnectionState;
use sfinx_voice::{
    AudioDevice, BackendClient, ConnectionOrchestrator, RoomTransport, SimulatedAudioDevice,
    SimulatedTransport, VoiceError,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "sfinx.toml";

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("SFINX_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_audio(config: &Config) -> Result<Arc<dyn AudioDevice>, ConfigError> {
    match config.media.audio {
        AudioKind::Simulated => Ok(Arc::new(SimulatedAudioDevice::new())),
        #[cfg(feature = "audio-io")]
        AudioKind::System => {
            let mut device = sfinx_voice::CpalAudioDevice::new();
            if let Some(name) = &config.media.input_device {
                device = device.with_input_device(name);
            }
            if let Some(name) = &config.media.output_device {
                device = device.with_output_device(name);
            }
            Ok(Arc::new(device))
        }
        #[cfg(not(feature = "audio-io"))]
        AudioKind::System => Err(ConfigError::Invalid {
            name: "media.audio",
            reason: "built without the audio-io feature".to_string(),
        }),
    }
}

fn build_transport(config: &Config) -> Result<Arc<dyn RoomTransport>, VoiceError> {
    match config.media.transport {
        #[cfg(feature = "webrtc")]
        TransportKind::Livekit => Ok(Arc::new(sfinx_voice::LiveKitTransport::new(
            config.livekit.clone(),
        )?)),
        #[cfg(not(feature = "webrtc"))]
        TransportKind::Livekit => Err(VoiceError::Config(
            "media.transport = livekit needs the webrtc feature".to_string(),
        )),
        TransportKind::Simulated => Ok(Arc::new(SimulatedTransport::new())),
    }
}

fn build_orchestrator(config: &Config) -> Result<ConnectionOrchestrator, VoiceError> {
    let backend = BackendClient::new(config.backend.clone())?;
    let transport = build_transport(config)?;
    let audio = build_audio(config).map_err(|e| VoiceError::Config(e.to_string()))?;
    Ok(ConnectionOrchestrator::new(
        backend,
        config.livekit.clone(),
        transport,
        audio,
    ))
}

/// Waits until the state leaves `Connected`.
async fn wait_until_dropped(orchestrator: &ConnectionOrchestrator) -> ConnectionState {
    let mut state = orchestrator.watch_state();
    let result = match state
        .wait_for(|s| !matches!(s, ConnectionState::Connected))
        .await
    {
        Ok(current) => current.clone(),
        Err(_) => orchestrator.state(),
    };
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path
        .as_deref()
        .unwrap_or(DEFAULT_CONFIG_PATH);

    let (config, notices) = match config::load_config(Some(selected_config_path)) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("sfinx-connect: {e}");
            return ExitCode::from(2);
        }
    };

    init_tracing(&config);

    tracing::info!(
        source = config_source,
        path = selected_config_path,
        "resolved startup configuration path"
    );
    for notice in &notices {
        notice.log();
    }

    if let Err(e) = config.validate_media() {
        tracing::error!(error = %e, "unusable media selection");
        return ExitCode::from(2);
    }

    let credentials = match config.session_credentials() {
        Ok(credentials) => credentials,
        Err(e) => {
            tracing::error!(error = %e, "cannot start a session");
            return ExitCode::from(2);
        }
    };

    let orchestrator = match build_orchestrator(&config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize voice client");
            return ExitCode::from(2);
        }
    };

    let mut transitions = orchestrator.subscribe_transitions();
    let status_task = tokio::spawn(async move {
        while let Ok(transition) = transitions.recv().await {
            println!("{}", transition.to.status_message());
        }
    });

    tracing::info!(
        interview_id = %credentials.interview_id(),
        backend = credentials.backend_url(),
        "starting interview session"
    );

    let outcome = {
        let connect = orchestrator.connect(&credentials);
        tokio::pin!(connect);
        let finished = tokio::select! {
            result = &mut connect => Some(result),
            () = shutdown_signal() => None,
        };
        match finished {
            Some(result) => result,
            None => {
                orchestrator.disconnect().await;
                // The attempt observes the cancellation and settles.
                connect.await
            }
        }
    };

    let final_state = match outcome {
        Ok(ConnectionState::Connected) => {
            if let Some(room) = orchestrator.room_name() {
                tracing::info!(room = %room, "connected, press Ctrl+C to leave");
            }
            tokio::select! {
                () = shutdown_signal() => {
                    orchestrator.disconnect().await
                }
                state = wait_until_dropped(&orchestrator) => {
                    // A remote drop already released the media.
                    state
                }
            }
        }
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(error = %e, "connection attempt failed");
            orchestrator.state()
        }
    };

    // The sender lives in the orchestrator; dropping it ends the status task.
    drop(orchestrator);
    let _ = status_task.await;

    match final_state {
        ConnectionState::Failed { .. } => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    }
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal.
///
/// If a handler cannot be installed that signal is never reported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, disconnecting"); }
        () = terminate => { tracing::info!("received SIGTERM, disconnecting"); }
    }
}
