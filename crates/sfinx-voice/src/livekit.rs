//! LiveKit room transport.
//!
//! A token is first checked against the provider's `/rtc/validate` endpoint,
//! which answers with a readable reason on rejection, so an expired or
//! revoked grant surfaces as [`VoiceError::Auth`] instead of a generic
//! signalling failure. With the `webrtc` feature the room itself is joined
//! through the LiveKit SDK: the microphone is published as a local audio
//! track and subscribed remote audio is delivered to the speaker.

#[cfg(feature = "webrtc")]
mod room;

use crate::config::LiveKitConfig;
use crate::error::VoiceError;
use reqwest::StatusCode;
use url::Url;
#[cfg(feature = "webrtc")]
use {
    crate::media::{RoomHandle, RoomTransport},
    crate::token::RoomTokenClaims,
    async_trait::async_trait,
    sfinx_types::RoomAccessToken,
    tracing::info,
};

/// Rewrites a provider URL to the given scheme family (`http`/`ws`), keeping
/// TLS-ness, and appends `path` to it.
fn provider_url(server_url: &str, websocket: bool, path: &str) -> Result<Url, VoiceError> {
    let mut url = Url::parse(server_url).map_err(|e| {
        VoiceError::Config(format!("invalid media provider URL {server_url:?}: {e}"))
    })?;

    let secure = match url.scheme() {
        "https" | "wss" => true,
        "http" | "ws" => false,
        other => {
            return Err(VoiceError::Config(format!(
                "unsupported media provider scheme {other:?}"
            )))
        }
    };
    let scheme = match (websocket, secure) {
        (true, true) => "wss",
        (true, false) => "ws",
        (false, true) => "https",
        (false, false) => "http",
    };
    url.set_scheme(scheme)
        .map_err(|()| VoiceError::Config(format!("cannot use scheme {scheme} for {server_url}")))?;

    let base = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{base}/{path}"));
    url.set_query(None);
    Ok(url)
}

#[derive(Debug, Clone)]
pub struct LiveKitTransport {
    http: reqwest::Client,
    config: LiveKitConfig,
}

impl LiveKitTransport {
    pub fn new(config: LiveKitConfig) -> Result<Self, VoiceError> {
        let http = reqwest::Client::builder()
            .timeout(config.connect_timeout())
            .build()
            .map_err(|e| VoiceError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &LiveKitConfig {
        &self.config
    }

    /// Asks the provider at `server_url` whether it would admit `token`.
    ///
    /// 401/403 are [`VoiceError::Auth`]; any other refusal or an unreachable
    /// provider is [`VoiceError::Network`].
    pub async fn validate(&self, server_url: &str, token: &str) -> Result<(), VoiceError> {
        let url = provider_url(server_url, false, "rtc/validate")?;
        let response = self
            .http
            .get(url)
            .query(&[("access_token", token)])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let reason = body.trim();
        let reason = if reason.is_empty() {
            status.canonical_reason().unwrap_or("rejected")
        } else {
            reason
        };
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                VoiceError::Auth(format!("media provider rejected token: {reason}"))
            }
            _ => VoiceError::Network(format!("media provider returned {status}: {reason}")),
        })
    }
}

#[cfg(feature = "webrtc")]
#[async_trait]
impl RoomTransport for LiveKitTransport {
    async fn join(
        &self,
        server_url: &str,
        token: String,
    ) -> Result<Box<dyn RoomHandle>, VoiceError> {
        let claims = RoomTokenClaims::inspect(&RoomAccessToken::new(token.clone()))?;
        self.validate(server_url, &token).await?;

        let joined =
            room::LiveKitRoom::connect(server_url, &token, self.config.auto_subscribe).await?;
        info!(
            room = joined.name(),
            identity = %claims.sub,
            "connected to media provider"
        );
        Ok(Box::new(joined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_url_maps_schemes() {
        let url = provider_url("wss://rooms.example.com", false, "rtc/validate").unwrap();
        assert_eq!(url.as_str(), "https://rooms.example.com/rtc/validate");

        let url = provider_url("http://localhost:7880/", true, "rtc").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:7880/rtc");

        let url = provider_url("https://example.com/livekit", false, "rtc/validate").unwrap();
        assert_eq!(url.as_str(), "https://example.com/livekit/rtc/validate");
    }

    #[test]
    fn provider_url_rejects_unknown_schemes() {
        assert!(matches!(
            provider_url("ftp://example.com", true, "rtc"),
            Err(VoiceError::Config(_))
        ));
        assert!(matches!(
            provider_url("not a url", true, "rtc"),
            Err(VoiceError::Config(_))
        ));
    }

    #[test]
    fn provider_url_drops_query() {
        let url = provider_url("https://example.com/?region=eu", false, "rtc/validate").unwrap();
        assert_eq!(url.query(), None);
    }
}
