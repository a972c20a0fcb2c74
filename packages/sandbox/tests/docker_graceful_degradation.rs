// ABOUTME: Tests for graceful degradation when the Docker daemon is unreachable
// ABOUTME: Verifies starts fail with an engine error and lookups soft-fail instead of panicking

use bollard::Docker;
use sandkeep_sandbox::testing::sample_entry;
use sandkeep_sandbox::{
    DockerEngine, ErrorKind, LanguageConfig, NetworkPolicy, Registry, SandboxService,
    SandboxSettings, TerminalLookup,
};
use std::sync::Arc;

/// Service whose engine points at a port nothing listens on
fn unreachable_service() -> SandboxService {
    let client = Docker::connect_with_http("http://127.0.0.1:9", 2, bollard::API_DEFAULT_VERSION)
        .expect("client construction does not touch the network");
    let engine = Arc::new(DockerEngine::with_client(client, "sandkeep.sandbox.test"));
    SandboxService::with_engine(
        SandboxSettings::default(),
        Registry::from_entries(vec![sample_entry("py", NetworkPolicy::None)]).unwrap(),
        LanguageConfig::builtin().unwrap(),
        engine,
    )
}

#[tokio::test]
async fn test_start_reports_engine_error() {
    let service = unreachable_service();
    let err = service
        .lifecycle()
        .start("py", None, None)
        .await
        .expect_err("start must fail without an engine");
    assert_eq!(err.kind(), ErrorKind::Engine);
    assert!(service.lifecycle().list_sessions().await[0].error.is_some());
}

#[tokio::test]
async fn test_startup_tolerates_missing_engine() {
    let service = unreachable_service();
    assert!(service.startup().await.is_none());
    assert_eq!(service.shutdown().await, 0);
}

#[tokio::test]
async fn test_terminal_lookup_for_unknown_session() {
    let service = unreachable_service();
    assert_eq!(
        service.terminal().get_terminal_url("nope", None).await,
        TerminalLookup::SessionNotRunning
    );
}
