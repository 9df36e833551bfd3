//! Operator credentials and the tokens derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Room names for interview sessions follow the format `interview-{id}`.
pub const INTERVIEW_ROOM_PREFIX: &str = "interview-";

/// Returned when a string cannot be used as an interview identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid interview id {0:?}: must be non-empty and contain no whitespace or '/'")]
pub struct InvalidInterviewId(pub String);

/// Identifier of a pre-created interview session on the backend.
///
/// Treated as opaque; in practice the backend hands out UUIDs. The only
/// constraints enforced are the ones that keep the id safe to splice into a
/// URL path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InterviewId(String);

impl InterviewId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidInterviewId> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.contains('/') || trimmed.chars().any(char::is_whitespace)
        {
            return Err(InvalidInterviewId(raw));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the media room the agent is dispatched to for this interview.
    pub fn room_name(&self) -> String {
        format!("{INTERVIEW_ROOM_PREFIX}{}", self.0)
    }

    /// Extracts the interview id from a room name of the form `interview-{id}`.
    ///
    /// Returns `None` for rooms that do not follow the interview naming scheme.
    pub fn from_room_name(room_name: &str) -> Option<Self> {
        room_name
            .strip_prefix(INTERVIEW_ROOM_PREFIX)
            .and_then(|id| Self::parse(id).ok())
    }
}

impl TryFrom<String> for InterviewId {
    type Error = InvalidInterviewId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<InterviewId> for String {
    fn from(id: InterviewId) -> Self {
        id.0
    }
}

impl fmt::Display for InterviewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque bearer token identifying the operator to the backend.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken([REDACTED])")
    }
}

/// Everything the operator supplies before connecting.
///
/// Immutable for the lifetime of one connection attempt: the orchestrator
/// borrows it for the token request and never writes back.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    backend_url: String,
    interview_id: InterviewId,
    auth_token: AuthToken,
}

impl SessionCredentials {
    pub fn new(
        backend_url: impl Into<String>,
        interview_id: InterviewId,
        auth_token: AuthToken,
    ) -> Self {
        let backend_url: String = backend_url.into();
        Self {
            backend_url: backend_url.trim_end_matches('/').to_string(),
            interview_id,
            auth_token,
        }
    }

    /// Backend base URL without a trailing slash.
    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    pub fn interview_id(&self) -> &InterviewId {
        &self.interview_id
    }

    pub fn auth_token(&self) -> &AuthToken {
        &self.auth_token
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("backend_url", &self.backend_url)
            .field("interview_id", &self.interview_id)
            .field("auth_token", &"[REDACTED]")
            .finish()
    }
}

/// Short-lived token granting access to one media room.
///
/// Deliberately not `Clone`: a token is consumed by the join that uses it.
pub struct RoomAccessToken {
    token: String,
    server_url: Option<String>,
    room_name: Option<String>,
}

impl RoomAccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            server_url: None,
            room_name: None,
        }
    }

    /// Media provider URL the backend asked the client to join.
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    pub fn with_room_name(mut self, room_name: impl Into<String>) -> Self {
        self.room_name = Some(room_name.into());
        self
    }

    pub fn expose(&self) -> &str {
        &self.token
    }

    pub fn server_url(&self) -> Option<&str> {
        self.server_url.as_deref()
    }

    pub fn room_name(&self) -> Option<&str> {
        self.room_name.as_deref()
    }

    /// Consumes the token, returning the raw JWT.
    pub fn into_secret(self) -> String {
        self.token
    }
}

impl fmt::Debug for RoomAccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomAccessToken")
            .field("token", &"[REDACTED]")
            .field("server_url", &self.server_url)
            .field("room_name", &self.room_name)
            .finish()
    }
}
