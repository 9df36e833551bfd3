//! Mock interview backend shared by the integration tests.

#![allow(dead_code)]

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use livekit_api::access_token::{AccessToken, VideoGrants};
use serde_json::{json, Value};
use sfinx_types::{AuthToken, InterviewId, SessionCredentials};
use sfinx_voice::{
    BackendClient, BackendConfig, ConnectionOrchestrator, LiveKitConfig, SimulatedAudioDevice,
    SimulatedTransport,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

pub const VALID_AUTH_TOKEN: &str = "valid-jwt";
pub const EXPIRED_AUTH_TOKEN: &str = "expired-token";
pub const PROVIDER_KEY: &str = "devkey";
pub const PROVIDER_SECRET: &str = "devsecret";
pub const PROVIDER_URL: &str = "ws://127.0.0.1:7880";

#[derive(Default)]
pub struct MockState {
    pub interviews: Mutex<HashSet<String>>,
    pub requests: AtomicUsize,
    pub delay: Mutex<Duration>,
    pub room_token_override: Mutex<Option<String>>,
    pub omit_server_url: Mutex<bool>,
    pub fail_status: Mutex<Option<u16>>,
}

pub struct MockBackend {
    pub url: String,
    pub state: Arc<MockState>,
}

impl MockBackend {
    /// Registers a fresh interview and returns its id.
    pub fn add_interview(&self) -> InterviewId {
        let id = uuid::Uuid::new_v4().to_string();
        self.state.interviews.lock().unwrap().insert(id.clone());
        InterviewId::parse(id).unwrap()
    }

    pub fn credentials(&self, interview_id: &InterviewId, auth_token: &str) -> SessionCredentials {
        SessionCredentials::new(&self.url, interview_id.clone(), AuthToken::new(auth_token))
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }
}

pub fn mint_room_token(room: &str, identity: &str) -> String {
    AccessToken::with_api_key(PROVIDER_KEY, PROVIDER_SECRET)
        .with_identity(identity)
        .with_name("Candidate")
        .with_grants(VideoGrants {
            room_join: true,
            room: room.to_string(),
            can_publish: true,
            can_subscribe: true,
            can_publish_data: true,
            ..Default::default()
        })
        .with_ttl(Duration::from_secs(600))
        .to_jwt()
        .expect("mint room token")
}

pub fn mint_expired_room_token(room: &str) -> String {
    use jsonwebtoken::{encode, get_current_timestamp, EncodingKey, Header};
    encode(
        &Header::default(),
        &json!({
            "sub": "candidate",
            "iss": PROVIDER_KEY,
            "exp": get_current_timestamp() - 60,
            "video": { "roomJoin": true, "room": room }
        }),
        &EncodingKey::from_secret(PROVIDER_SECRET.as_bytes()),
    )
    .expect("mint expired token")
}

async fn issue_token(
    State(state): State<Arc<MockState>>,
    Path(interview_id): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    state.requests.fetch_add(1, Ordering::SeqCst);

    let delay = *state.delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    if let Some(status) = *state.fail_status.lock().unwrap() {
        let status = StatusCode::from_u16(status).unwrap();
        return (
            status,
            Json(json!({ "statusCode": status.as_u16(), "message": "backend exploded" })),
        );
    }

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    match bearer {
        VALID_AUTH_TOKEN => {}
        EXPIRED_AUTH_TOKEN => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "statusCode": 401, "message": "Token expired" })),
            )
        }
        _ => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "statusCode": 401, "message": "Unauthorized" })),
            )
        }
    }

    if !state.interviews.lock().unwrap().contains(&interview_id) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "statusCode": 404, "message": "Interview not found" })),
        );
    }

    let room = format!("interview-{interview_id}");
    let token = state
        .room_token_override
        .lock()
        .unwrap()
        .clone()
        .unwrap_or_else(|| mint_room_token(&room, "candidate"));

    let mut data = json!({ "token": token, "roomName": room });
    if !*state.omit_server_url.lock().unwrap() {
        data["serverUrl"] = json!(PROVIDER_URL);
    }
    (StatusCode::CREATED, Json(json!({ "data": data })))
}

pub async fn spawn_backend() -> MockBackend {
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .route("/ai-interviews/{interview_id}/voice-token", post(issue_token))
        .with_state(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockBackend {
        url: format!("http://{addr}"),
        state,
    }
}

pub struct Harness {
    pub backend: MockBackend,
    pub transport: SimulatedTransport,
    pub audio: SimulatedAudioDevice,
    pub orchestrator: Arc<ConnectionOrchestrator>,
}

pub async fn harness() -> Harness {
    harness_with(SimulatedTransport::new(), LiveKitConfig::default()).await
}

pub async fn harness_with(transport: SimulatedTransport, livekit: LiveKitConfig) -> Harness {
    let backend = spawn_backend().await;
    let audio = SimulatedAudioDevice::new();
    let client = BackendClient::new(BackendConfig::default()).unwrap();
    let orchestrator = Arc::new(ConnectionOrchestrator::new(
        client,
        livekit,
        Arc::new(transport.clone()),
        Arc::new(audio.clone()),
    ));
    Harness {
        backend,
        transport,
        audio,
        orchestrator,
    }
}

/// Media provider stand-in: answers token validation with a configurable
/// status and accepts signalling connections without ever speaking on them.
pub struct ProviderState {
    pub validate_status: AtomicU16,
    pub validations: AtomicUsize,
    pub signal_connections: AtomicUsize,
    pub last_token: Mutex<Option<String>>,
}

impl Default for ProviderState {
    fn default() -> Self {
        Self {
            validate_status: AtomicU16::new(200),
            validations: AtomicUsize::new(0),
            signal_connections: AtomicUsize::new(0),
            last_token: Mutex::new(None),
        }
    }
}

pub struct MockProvider {
    pub url: String,
    pub state: Arc<ProviderState>,
}

impl MockProvider {
    pub fn respond_with(&self, status: u16) {
        self.state.validate_status.store(status, Ordering::SeqCst);
    }

    pub fn validations(&self) -> usize {
        self.state.validations.load(Ordering::SeqCst)
    }

    pub fn last_token(&self) -> Option<String> {
        self.state.last_token.lock().unwrap().clone()
    }
}

async fn validate_token(
    State(state): State<Arc<ProviderState>>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    state.validations.fetch_add(1, Ordering::SeqCst);
    *state.last_token.lock().unwrap() = params.get("access_token").cloned();

    let status = StatusCode::from_u16(state.validate_status.load(Ordering::SeqCst)).unwrap();
    let body = match status {
        StatusCode::OK => "success",
        StatusCode::UNAUTHORIZED => "invalid token: token is expired",
        StatusCode::FORBIDDEN => "permissions denied",
        _ => "",
    };
    (status, body.to_string())
}

async fn silent_signal(State(state): State<Arc<ProviderState>>, ws: WebSocketUpgrade) -> Response {
    state.signal_connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(|socket| async move {
        let _held = socket;
        std::future::pending::<()>().await;
    })
}

pub async fn spawn_provider() -> MockProvider {
    let state = Arc::new(ProviderState::default());
    let app = Router::new()
        .route("/rtc/validate", get(validate_token))
        .route("/rtc", get(silent_signal))
        .with_state(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockProvider {
        url: format!("ws://{addr}"),
        state,
    }
}
