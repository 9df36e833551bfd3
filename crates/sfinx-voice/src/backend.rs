//! Client for the backend's voice-token endpoint.

use crate::config::BackendConfig;
use crate::error::VoiceError;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use sfinx_types::{RoomAccessToken, SessionCredentials};
use tracing::{debug, info, warn};

/// Maximum number of characters of an error body quoted back to the operator.
const MAX_ERROR_BODY_CHARS: usize = 200;

/// Token payload as the backend returns it, after unwrapping `{ "data": ... }`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    #[serde(default, alias = "accessToken")]
    token: String,
    #[serde(default, alias = "url", alias = "livekitUrl")]
    server_url: Option<String>,
    #[serde(default)]
    room_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    config: BackendConfig,
}

impl BackendClient {
    pub fn new(config: BackendConfig) -> Result<Self, VoiceError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| VoiceError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Trades the operator's bearer token for a room-access token.
    ///
    /// `401`/`403` map to [`VoiceError::Auth`], `404` to
    /// [`VoiceError::NotFound`], transport failures to
    /// [`VoiceError::Network`]. Any other non-success status is a
    /// [`VoiceError::Backend`].
    pub async fn request_access_token(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<RoomAccessToken, VoiceError> {
        if credentials.auth_token().is_empty() {
            return Err(VoiceError::Auth("auth token is empty".to_string()));
        }

        let url = format!(
            "{}{}",
            credentials.backend_url(),
            self.config.token_path_for(credentials.interview_id())
        );
        info!(%url, interview_id = %credentials.interview_id(), "requesting room access token");

        let response = self
            .http
            .post(&url)
            .bearer_auth(credentials.auth_token().expose())
            .json(&json!({ "interviewId": credentials.interview_id() }))
            .send()
            .await?;

        let status = response.status();
        debug!(status = status.as_u16(), "token response received");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = error_message(&body, status);
            warn!(status = status.as_u16(), %message, "token request rejected");
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => VoiceError::Auth(message),
                StatusCode::NOT_FOUND => VoiceError::NotFound(format!(
                    "interview {} has no active session: {message}",
                    credentials.interview_id()
                )),
                _ => VoiceError::Backend {
                    status: status.as_u16(),
                    message,
                },
            });
        }

        let raw: Value = response.json().await.map_err(|e| VoiceError::Backend {
            status: status.as_u16(),
            message: format!("token response is not valid JSON: {e}"),
        })?;

        parse_token_response(raw, status)
    }
}

fn parse_token_response(raw: Value, status: StatusCode) -> Result<RoomAccessToken, VoiceError> {
    // Responses may be wrapped as { data: {...} }
    let payload = match raw {
        Value::Object(mut map) if map.get("data").is_some_and(Value::is_object) => {
            map.remove("data").unwrap_or_default()
        }
        other => other,
    };

    let parsed: TokenResponse =
        serde_json::from_value(payload).map_err(|e| VoiceError::Backend {
            status: status.as_u16(),
            message: format!("unexpected token response shape: {e}"),
        })?;

    if parsed.token.trim().is_empty() {
        return Err(VoiceError::Backend {
            status: status.as_u16(),
            message: "token response did not contain a token".to_string(),
        });
    }

    let mut token = RoomAccessToken::new(parsed.token);
    if let Some(url) = parsed.server_url.filter(|u| !u.trim().is_empty()) {
        token = token.with_server_url(url);
    }
    if let Some(room) = parsed.room_name.filter(|r| !r.trim().is_empty()) {
        token = token.with_room_name(room);
    }
    Ok(token)
}

/// Extracts a readable message from an error body.
///
/// Understands `{ "message": "..." }` and `{ "message": ["...", "..."] }`;
/// anything else is quoted verbatim (truncated), or replaced by the status
/// reason when empty.
fn error_message(body: &str, status: StatusCode) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        match value.get("message") {
            Some(Value::String(msg)) if !msg.is_empty() => return msg.clone(),
            Some(Value::Array(parts)) => {
                let joined = parts
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("; ");
                if !joined.is_empty() {
                    return joined;
                }
            }
            _ => {}
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string()
    } else {
        trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_data_envelope() {
        let raw = json!({
            "data": {
                "token": "jwt",
                "serverUrl": "wss://lk.example.com",
                "roomName": "interview-1"
            }
        });
        let token = parse_token_response(raw, StatusCode::CREATED).unwrap();
        assert_eq!(token.expose(), "jwt");
        assert_eq!(token.server_url(), Some("wss://lk.example.com"));
        assert_eq!(token.room_name(), Some("interview-1"));
    }

    #[test]
    fn accepts_bare_payload_with_aliases() {
        let raw = json!({ "accessToken": "jwt", "url": "wss://lk" });
        let token = parse_token_response(raw, StatusCode::OK).unwrap();
        assert_eq!(token.expose(), "jwt");
        assert_eq!(token.server_url(), Some("wss://lk"));
        assert_eq!(token.room_name(), None);
    }

    #[test]
    fn missing_token_is_a_backend_error() {
        let err = parse_token_response(json!({ "data": {} }), StatusCode::OK).unwrap_err();
        assert!(matches!(err, VoiceError::Backend { status: 200, .. }));
    }

    #[test]
    fn error_message_prefers_message_field() {
        let body = r#"{"statusCode":401,"message":"Token expired"}"#;
        assert_eq!(error_message(body, StatusCode::UNAUTHORIZED), "Token expired");

        let body = r#"{"message":["interviewId must be a UUID","bad"]}"#;
        assert_eq!(
            error_message(body, StatusCode::BAD_REQUEST),
            "interviewId must be a UUID; bad"
        );
    }

    #[test]
    fn error_message_falls_back_to_reason_or_body() {
        assert_eq!(error_message("", StatusCode::NOT_FOUND), "Not Found");
        let long = "x".repeat(1000);
        assert_eq!(
            error_message(&long, StatusCode::BAD_GATEWAY).len(),
            MAX_ERROR_BODY_CHARS
        );
    }
}
