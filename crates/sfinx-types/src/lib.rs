//! Shared types for the sfinx voice-interview client.
//!
//! This crate holds the vocabulary every other crate in the workspace speaks:
//! the operator-supplied session credentials, the short-lived room-access
//! token handed out by the backend, and the connection state machine owned by
//! the orchestrator in `sfinx-voice`.
//!
//! Nothing here performs I/O. Types that carry secrets (`AuthToken`,
//! `RoomAccessToken`) redact themselves in `Debug` output so they never end
//! up in logs.

pub mod session;
pub mod state;

pub use session::{
    AuthToken, InterviewId, InvalidInterviewId, RoomAccessToken, SessionCredentials,
    INTERVIEW_ROOM_PREFIX,
};
pub use state::{ConnectionState, FailureKind, StateTransition};
