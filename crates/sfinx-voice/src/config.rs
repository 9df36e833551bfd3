use serde::{Deserialize, Serialize};
use sfinx_types::InterviewId;
use std::time::Duration;

/// Token endpoint path; `{interview_id}` is substituted per request.
pub const DEFAULT_TOKEN_PATH: &str = "/ai-interviews/{interview_id}/voice-token";

fn default_token_path() -> String {
    DEFAULT_TOKEN_PATH.to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_token_path")]
    pub token_path: String,
    /// Timeout for backend HTTP requests in seconds. Default: 10.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            token_path: default_token_path(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Resolves the token endpoint path for one interview.
    pub fn token_path_for(&self, interview_id: &InterviewId) -> String {
        let path = self.token_path.replace("{interview_id}", interview_id.as_str());
        if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveKitConfig {
    /// Provider URL used when the backend does not return one with the token.
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Subscribe to remote tracks (the interviewer's voice) on join.
    #[serde(default = "default_true")]
    pub auto_subscribe: bool,
}

impl Default for LiveKitConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            auto_subscribe: true,
        }
    }
}

impl LiveKitConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Returns the fallback provider URL, or `None` when unset.
    pub fn fallback_url(&self) -> Option<&str> {
        let url = self.url.trim();
        (!url.is_empty()).then_some(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_path_substitutes_interview_id() {
        let config = BackendConfig::default();
        let id = InterviewId::parse("abc-123").unwrap();
        assert_eq!(config.token_path_for(&id), "/ai-interviews/abc-123/voice-token");
    }

    #[test]
    fn token_path_gains_leading_slash() {
        let config = BackendConfig {
            token_path: "voice/{interview_id}/token".into(),
            ..BackendConfig::default()
        };
        let id = InterviewId::parse("x").unwrap();
        assert_eq!(config.token_path_for(&id), "/voice/x/token");
    }

    #[test]
    fn livekit_config_defaults_from_toml() {
        let config: LiveKitConfig = toml::from_str(r#"url = "wss://rooms.example.com""#).unwrap();
        assert_eq!(config.fallback_url(), Some("wss://rooms.example.com"));
        assert_eq!(config.connect_timeout_secs, 15);
        assert!(config.auto_subscribe);

        let empty: LiveKitConfig = toml::from_str("").unwrap();
        assert_eq!(empty.fallback_url(), None);
    }
}
