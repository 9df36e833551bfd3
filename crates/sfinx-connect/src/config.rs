//! Client configuration loading from file and environment variables.

use serde::Deserialize;
use sfinx_types::{AuthToken, InterviewId, SessionCredentials};
use sfinx_voice::{BackendConfig, LiveKitConfig};
use thiserror::Error;

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Operator-supplied session inputs.
    #[serde(default)]
    pub session: SessionConfig,

    /// Backend token endpoint settings.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Media provider settings.
    #[serde(default)]
    pub livekit: LiveKitConfig,

    /// Which media implementations to use.
    #[serde(default)]
    pub media: MediaConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The three inputs the operator fills in before connecting.
#[derive(Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    #[serde(default)]
    pub interview_id: String,

    #[serde(default)]
    pub auth_token: String,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("backend_url", &self.backend_url)
            .field("interview_id", &self.interview_id)
            .field("auth_token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// LiveKit provider (requires the `webrtc` feature).
    Livekit,
    /// In-process room, for dry runs.
    Simulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioKind {
    /// System microphone and speaker (requires the `audio-io` feature).
    System,
    /// Generated silence in, counted frames out.
    Simulated,
}

/// Media implementation selection.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    #[serde(default = "default_audio")]
    pub audio: AudioKind,

    /// Substring of the preferred input device name.
    #[serde(default)]
    pub input_device: Option<String>,

    /// Substring of the preferred output device name.
    #[serde(default)]
    pub output_device: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "sfinx_voice=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_backend_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_transport() -> TransportKind {
    if cfg!(feature = "webrtc") {
        TransportKind::Livekit
    } else {
        TransportKind::Simulated
    }
}

fn default_audio() -> AudioKind {
    if cfg!(feature = "audio-io") {
        AudioKind::System
    } else {
        AudioKind::Simulated
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            interview_id: String::new(),
            auth_token: String::new(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            audio: default_audio(),
            input_device: None,
            output_device: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A required setting has no value.
    #[error("missing required setting {0}")]
    Missing(&'static str),

    /// A setting has a value that cannot be used.
    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Something worth reporting about how the configuration was assembled.
/// Returned rather than logged, since loading happens before logging is
/// set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigNotice {
    /// The config file does not exist; defaults were used.
    FileNotFound(String),
    /// An environment override had a value outside its choices and was ignored.
    UnknownValue { var: &'static str, value: String },
}

impl ConfigNotice {
    pub fn log(&self) {
        match self {
            Self::FileNotFound(path) => {
                tracing::info!(path = %path, "config file not found, using defaults");
            }
            Self::UnknownValue { var, value } => {
                tracing::warn!(var, value = %value, "ignoring unknown override value");
            }
        }
    }
}

impl Config {
    /// Checks that the selected transport and audio can work together in
    /// this build.
    pub fn validate_media(&self) -> Result<(), ConfigError> {
        let media = &self.media;
        if media.transport == TransportKind::Livekit && media.audio == AudioKind::Simulated {
            return Err(ConfigError::Invalid {
                name: "media.audio",
                reason: "a livekit room needs system audio; simulated audio only pairs \
                         with the simulated transport"
                    .to_string(),
            });
        }
        if media.transport == TransportKind::Livekit && !cfg!(feature = "webrtc") {
            return Err(ConfigError::Invalid {
                name: "media.transport",
                reason: "built without the webrtc feature".to_string(),
            });
        }
        if media.audio == AudioKind::System && !cfg!(feature = "audio-io") {
            return Err(ConfigError::Invalid {
                name: "media.audio",
                reason: "built without the audio-io feature".to_string(),
            });
        }
        Ok(())
    }

    /// Builds the credentials for one connection attempt.
    pub fn session_credentials(&self) -> Result<SessionCredentials, ConfigError> {
        let backend_url = self.session.backend_url.trim();
        if backend_url.is_empty() {
            return Err(ConfigError::Missing("session.backend_url"));
        }
        if !(backend_url.starts_with("http://") || backend_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                name: "session.backend_url",
                reason: format!("{backend_url:?} is not an http(s) URL"),
            });
        }
        if self.session.interview_id.trim().is_empty() {
            return Err(ConfigError::Missing("session.interview_id"));
        }
        let interview_id =
            InterviewId::parse(self.session.interview_id.clone()).map_err(|e| {
                ConfigError::Invalid {
                    name: "session.interview_id",
                    reason: e.to_string(),
                }
            })?;
        let auth_token = AuthToken::new(self.session.auth_token.trim());
        if auth_token.is_empty() {
            return Err(ConfigError::Missing("session.auth_token"));
        }
        Ok(SessionCredentials::new(backend_url, interview_id, auth_token))
    }
}

/// Applies environment variable overrides, reading variables through `var`.
///
/// - `SFINX_BACKEND_URL` overrides `session.backend_url`
/// - `SFINX_INTERVIEW_ID` overrides `session.interview_id`
/// - `SFINX_AUTH_TOKEN` overrides `session.auth_token`
/// - `SFINX_LIVEKIT_URL` overrides `livekit.url`
/// - `SFINX_MEDIA_TRANSPORT` overrides `media.transport` ("livekit" or "simulated")
/// - `SFINX_MEDIA_AUDIO` overrides `media.audio` ("system" or "simulated")
/// - `SFINX_LOG_LEVEL` overrides `logging.level`
/// - `SFINX_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// Unrecognised choices are left unapplied and reported as notices.
pub fn apply_env_overrides(
    config: &mut Config,
    var: impl Fn(&str) -> Option<String>,
) -> Vec<ConfigNotice> {
    let mut notices = Vec::new();
    if let Some(url) = var("SFINX_BACKEND_URL") {
        config.session.backend_url = url;
    }
    if let Some(id) = var("SFINX_INTERVIEW_ID") {
        config.session.interview_id = id;
    }
    if let Some(token) = var("SFINX_AUTH_TOKEN") {
        config.session.auth_token = token;
    }
    if let Some(url) = var("SFINX_LIVEKIT_URL") {
        config.livekit.url = url;
    }
    if let Some(transport) = var("SFINX_MEDIA_TRANSPORT") {
        match transport.as_str() {
            "livekit" => config.media.transport = TransportKind::Livekit,
            "simulated" => config.media.transport = TransportKind::Simulated,
            _ => notices.push(ConfigNotice::UnknownValue {
                var: "SFINX_MEDIA_TRANSPORT",
                value: transport,
            }),
        }
    }
    if let Some(audio) = var("SFINX_MEDIA_AUDIO") {
        match audio.as_str() {
            "system" => config.media.audio = AudioKind::System,
            "simulated" => config.media.audio = AudioKind::Simulated,
            _ => notices.push(ConfigNotice::UnknownValue {
                var: "SFINX_MEDIA_AUDIO",
                value: audio,
            }),
        }
    }
    if let Some(level) = var("SFINX_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("SFINX_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    notices
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides (see [`apply_env_overrides`]). The notices
/// are for the caller to log once logging is initialised.
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<(Config, Vec<ConfigNotice>), ConfigError> {
    let mut notices = Vec::new();
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                notices.push(ConfigNotice::FileNotFound(p.to_string()));
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    notices.extend(apply_env_overrides(&mut config, |key| std::env::var(key).ok()));
    Ok((config, notices))
}
