//! Inspection of LiveKit room-access tokens before joining.
//!
//! The client cannot verify the token signature (only the provider holds the
//! secret), but it can read the claims to fail fast on an expired token or a
//! token that does not grant room access, before opening any connection.

use crate::error::VoiceError;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::Deserialize;
use sfinx_types::RoomAccessToken;

fn default_true() -> bool {
    true
}

/// Video grant section of a LiveKit token (`video` claim).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoGrantClaims {
    #[serde(default)]
    pub room_join: bool,
    #[serde(default)]
    pub room: String,
    #[serde(default = "default_true")]
    pub can_publish: bool,
    #[serde(default = "default_true")]
    pub can_subscribe: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomTokenClaims {
    /// Participant identity.
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    pub exp: u64,
    #[serde(default)]
    pub video: VideoGrantClaims,
}

impl RoomTokenClaims {
    /// Decodes and checks the claims of `token`.
    ///
    /// Fails with [`VoiceError::Auth`] when the token is expired and with
    /// [`VoiceError::InvalidToken`] when it is malformed, lacks the `roomJoin`
    /// grant, or cannot publish audio.
    pub fn inspect(token: &RoomAccessToken) -> Result<Self, VoiceError> {
        let header = decode_header(token.expose())
            .map_err(|e| VoiceError::InvalidToken(format!("malformed token: {e}")))?;

        let mut validation = Validation::new(header.alg);
        validation.insecure_disable_signature_validation();
        validation.validate_aud = false;
        validation.leeway = 0;

        let data = decode::<RoomTokenClaims>(
            token.expose(),
            &DecodingKey::from_secret(&[]),
            &validation,
        )
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => {
                VoiceError::Auth("room access token has expired".to_string())
            }
            _ => VoiceError::InvalidToken(format!("unreadable claims: {e}")),
        })?;

        let claims = data.claims;
        if !claims.video.room_join {
            return Err(VoiceError::InvalidToken(
                "token does not grant room join".to_string(),
            ));
        }
        if !claims.video.can_publish {
            return Err(VoiceError::InvalidToken(
                "token does not allow publishing microphone audio".to_string(),
            ));
        }
        Ok(claims)
    }

    /// Room named by the grant, if any.
    pub fn room(&self) -> Option<&str> {
        let room = self.video.room.as_str();
        (!room.is_empty()).then_some(room)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, get_current_timestamp, EncodingKey, Header};
    use serde_json::json;

    fn mint(claims: serde_json::Value) -> RoomAccessToken {
        let jwt = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"provider-secret"),
        )
        .unwrap();
        RoomAccessToken::new(jwt)
    }

    #[test]
    fn accepts_a_live_join_grant() {
        let token = mint(json!({
            "sub": "candidate-1",
            "exp": get_current_timestamp() + 600,
            "video": { "roomJoin": true, "room": "interview-42" }
        }));
        let claims = RoomTokenClaims::inspect(&token).unwrap();
        assert_eq!(claims.sub, "candidate-1");
        assert_eq!(claims.room(), Some("interview-42"));
        assert!(claims.video.can_subscribe);
    }

    #[test]
    fn expired_token_is_an_auth_error() {
        let token = mint(json!({
            "sub": "candidate-1",
            "exp": get_current_timestamp() - 10,
            "video": { "roomJoin": true, "room": "interview-42" }
        }));
        let err = RoomTokenClaims::inspect(&token).unwrap_err();
        assert!(matches!(err, VoiceError::Auth(_)), "got {err:?}");
    }

    #[test]
    fn token_without_join_grant_is_rejected() {
        let token = mint(json!({
            "sub": "candidate-1",
            "exp": get_current_timestamp() + 600,
            "video": { "roomList": true }
        }));
        let err = RoomTokenClaims::inspect(&token).unwrap_err();
        assert!(matches!(err, VoiceError::InvalidToken(_)));
    }

    #[test]
    fn listen_only_token_is_rejected() {
        let token = mint(json!({
            "exp": get_current_timestamp() + 600,
            "video": { "roomJoin": true, "canPublish": false }
        }));
        assert!(matches!(
            RoomTokenClaims::inspect(&token),
            Err(VoiceError::InvalidToken(_))
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        let err = RoomTokenClaims::inspect(&RoomAccessToken::new("not-a-jwt")).unwrap_err();
        assert!(matches!(err, VoiceError::InvalidToken(_)));
    }
}
