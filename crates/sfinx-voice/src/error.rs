use sfinx_types::FailureKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    /// The backend rejected the auth token, or the room-access token was refused.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("interview not found: {0}")]
    NotFound(String),

    #[error("network error: {0}")]
    Network(String),

    /// Microphone permission denied or no usable input device.
    #[error("media error: {0}")]
    Media(String),

    #[error("backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("invalid room access token: {0}")]
    InvalidToken(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("a connection attempt is already active ({0})")]
    AlreadyActive(&'static str),

    #[error("operation not valid in state {0}")]
    InvalidState(&'static str),

    /// The attempt was abandoned by `disconnect` while this step was running.
    #[error("connection attempt cancelled by disconnect")]
    Cancelled,
}

impl VoiceError {
    /// Category recorded on `ConnectionState::Failed`.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Auth(_) | Self::InvalidToken(_) => FailureKind::Auth,
            Self::NotFound(_) => FailureKind::NotFound,
            Self::Network(_) | Self::Cancelled => FailureKind::Network,
            Self::Media(_) => FailureKind::Media,
            Self::Backend { .. } => FailureKind::Backend,
            Self::Config(_) | Self::AlreadyActive(_) | Self::InvalidState(_) => FailureKind::Config,
        }
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Network(format!("request timed out: {err}"))
        } else {
            Self::Network(err.to_string())
        }
    }
}

#[cfg(feature = "webrtc")]
impl From<::livekit::RoomError> for VoiceError {
    fn from(err: ::livekit::RoomError) -> Self {
        Self::Network(format!("media provider: {err}"))
    }
}
