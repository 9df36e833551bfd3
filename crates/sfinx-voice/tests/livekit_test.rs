mod common;

use common::{mint_room_token, spawn_provider};
use sfinx_voice::{LiveKitConfig, LiveKitTransport, VoiceError};
use tokio::net::TcpListener;

fn transport() -> LiveKitTransport {
    let config = LiveKitConfig {
        connect_timeout_secs: 2,
        ..LiveKitConfig::default()
    };
    LiveKitTransport::new(config).expect("build transport")
}

#[tokio::test]
async fn test_validate_accepts_admitted_token() {
    let provider = spawn_provider().await;
    let token = mint_room_token("interview-1", "candidate");

    transport()
        .validate(&provider.url, &token)
        .await
        .expect("token should be admitted");

    assert_eq!(provider.validations(), 1);
    assert_eq!(provider.last_token().as_deref(), Some(token.as_str()));
}

#[tokio::test]
async fn test_validate_unauthorized_is_auth_with_reason() {
    let provider = spawn_provider().await;
    provider.respond_with(401);

    let err = transport()
        .validate(&provider.url, &mint_room_token("interview-1", "candidate"))
        .await
        .unwrap_err();

    match err {
        VoiceError::Auth(message) => assert!(message.contains("token is expired")),
        other => panic!("Expected Auth error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_validate_forbidden_is_auth() {
    let provider = spawn_provider().await;
    provider.respond_with(403);

    let err = transport()
        .validate(&provider.url, &mint_room_token("interview-1", "candidate"))
        .await
        .unwrap_err();

    assert!(matches!(err, VoiceError::Auth(_)), "got {err:?}");
}

#[tokio::test]
async fn test_validate_other_refusals_are_network() {
    let provider = spawn_provider().await;

    for status in [404, 500, 503] {
        provider.respond_with(status);
        let err = transport()
            .validate(&provider.url, &mint_room_token("interview-1", "candidate"))
            .await
            .unwrap_err();
        match err {
            VoiceError::Network(message) => assert!(message.contains(&status.to_string())),
            other => panic!("status {status}: expected Network error, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_validate_unreachable_provider_is_network() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = transport()
        .validate(&format!("ws://{addr}"), "token")
        .await
        .unwrap_err();

    assert!(matches!(err, VoiceError::Network(_)), "got {err:?}");
}

#[tokio::test]
async fn test_validate_rejects_unusable_provider_url() {
    let err = transport()
        .validate("ftp://rooms.example.com", "token")
        .await
        .unwrap_err();

    assert!(matches!(err, VoiceError::Config(_)), "got {err:?}");
}

/// Room joins through the SDK, against a provider that admits the token but
/// never completes the signalling handshake.
#[cfg(feature = "webrtc")]
mod room_join {
    use super::*;
    use super::common::{spawn_backend, MockBackend, VALID_AUTH_TOKEN};
    use sfinx_types::{ConnectionState, FailureKind};
    use sfinx_voice::{
        BackendClient, BackendConfig, ConnectionOrchestrator, MediaResources,
        SimulatedAudioDevice,
    };
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    async fn orchestrator_against(provider_url: &str) -> (MockBackend, ConnectionOrchestrator) {
        let backend = spawn_backend().await;
        *backend.state.omit_server_url.lock().unwrap() = true;
        let livekit = LiveKitConfig {
            url: provider_url.to_string(),
            connect_timeout_secs: 3,
            ..LiveKitConfig::default()
        };
        let orchestrator = ConnectionOrchestrator::new(
            BackendClient::new(BackendConfig::default()).unwrap(),
            livekit.clone(),
            Arc::new(LiveKitTransport::new(livekit).unwrap()),
            Arc::new(SimulatedAudioDevice::new()),
        );
        (backend, orchestrator)
    }

    #[tokio::test]
    async fn test_silent_signalling_never_reaches_connected() {
        let provider = spawn_provider().await;
        let (backend, orchestrator) = orchestrator_against(&provider.url).await;
        let interview = backend.add_interview();

        let result = orchestrator
            .connect(&backend.credentials(&interview, VALID_AUTH_TOKEN))
            .await;

        assert!(matches!(result, Err(VoiceError::Network(_))), "got {result:?}");
        assert_eq!(
            orchestrator.state().failure_kind(),
            Some(FailureKind::Network)
        );
        assert_ne!(orchestrator.state(), ConnectionState::Connected);
        assert_eq!(orchestrator.active_resources(), MediaResources::default());
        assert!(provider.validations() >= 1);
    }

    #[tokio::test]
    async fn test_rejected_token_fails_with_auth_before_signalling() {
        let provider = spawn_provider().await;
        provider.respond_with(401);
        let (backend, orchestrator) = orchestrator_against(&provider.url).await;
        let interview = backend.add_interview();

        let result = orchestrator
            .connect(&backend.credentials(&interview, VALID_AUTH_TOKEN))
            .await;

        assert!(matches!(result, Err(VoiceError::Auth(_))), "got {result:?}");
        assert_eq!(orchestrator.state().failure_kind(), Some(FailureKind::Auth));
        assert_eq!(provider.state.signal_connections.load(Ordering::SeqCst), 0);
    }
}
