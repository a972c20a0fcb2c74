// ABOUTME: Integration tests for the sandbox lifecycle against a real Docker daemon
// ABOUTME: Each test skips itself when Docker is not reachable

use sandkeep_sandbox::testing::sample_entry;
use sandkeep_sandbox::{
    DockerEngine, Engine, LanguageConfig, NetworkPolicy, Registry, SandboxService,
    SandboxSettings, SessionStatus, StopOutcome,
};
use std::sync::Arc;
use std::time::Duration;

const TEST_LABEL_PREFIX: &str = "sandkeep.sandbox.test";

/// Connect to Docker, or None when the daemon is not reachable
async fn docker_engine() -> Option<Arc<DockerEngine>> {
    let engine = DockerEngine::connect(TEST_LABEL_PREFIX).ok()?;
    engine.ping().await.ok()?;
    Some(Arc::new(engine))
}

fn alpine_entry(name: &str, network_policy: NetworkPolicy) -> sandkeep_sandbox::RegistryEntry {
    let mut entry = sample_entry(name, network_policy);
    entry.image = "alpine:3.20".to_string();
    entry.languages = vec!["sh".to_string()];
    entry
}

fn service(engine: Arc<DockerEngine>) -> SandboxService {
    let settings = SandboxSettings {
        label_prefix: TEST_LABEL_PREFIX.to_string(),
        stop_timeout_secs: 1,
        ..SandboxSettings::default()
    };
    let registry = Registry::from_entries(vec![alpine_entry("alpine", NetworkPolicy::None)])
        .expect("valid registry");
    SandboxService::with_engine(
        settings,
        registry,
        LanguageConfig::builtin().expect("builtin languages"),
        engine,
    )
}

/// Start → execute → stop against a real container
#[tokio::test]
async fn test_complete_sandbox_lifecycle() {
    let Some(engine) = docker_engine().await else {
        println!("Skipping test: Docker not available");
        return;
    };
    let service = service(engine.clone());

    let session = service
        .lifecycle()
        .start("alpine", Some("sh"), None)
        .await
        .expect("sandbox should start");
    assert_eq!(session.status, SessionStatus::Running);
    let container_id = session.instance_id.clone().expect("instance attached");

    let result = service
        .executor()
        .execute(&session.id, "echo hello\necho oops >&2\nexit 4", "sh", None)
        .await
        .expect("execution should succeed");
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.stderr, "oops\n");
    assert_eq!(result.exit_code, Some(4));

    assert_eq!(
        service.lifecycle().stop(&session.id, "test").await.unwrap(),
        StopOutcome::Stopped
    );
    assert!(engine.inspect_container(&container_id).await.is_err());
}

/// A timed-out run is killed but the sandbox keeps working
#[tokio::test]
async fn test_timeout_keeps_sandbox_alive() {
    let Some(engine) = docker_engine().await else {
        println!("Skipping test: Docker not available");
        return;
    };
    let service = service(engine);

    let session = service
        .lifecycle()
        .start("alpine", Some("sh"), None)
        .await
        .expect("sandbox should start");

    let result = service
        .executor()
        .execute(
            &session.id,
            "echo start\nwhile true; do sleep 1; done",
            "sh",
            Some(Duration::from_secs(2)),
        )
        .await
        .expect("timed out execution still returns a result");
    assert!(result.timed_out);
    assert_eq!(result.exit_code, None);
    assert!(result.stdout.starts_with("start"));

    let after = service
        .executor()
        .execute(&session.id, "echo alive", "sh", None)
        .await
        .expect("sandbox should survive the timeout");
    assert_eq!(after.stdout, "alive\n");

    service.lifecycle().stop(&session.id, "test").await.unwrap();
}
