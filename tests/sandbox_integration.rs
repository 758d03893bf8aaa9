//! Integration tests for the sandboxed execution service.
//!
//! These tests require a running Docker daemon and network access to
//! pull base images.
//! Run with: cargo test --test sandbox_integration -- --ignored

use std::sync::Arc;
use std::time::Duration;

use taskpilot::sandbox::docker_client::DockerClient;
use taskpilot::sandbox::files::{FileAction, GeneratedFile, Language};
use taskpilot::sandbox::limits::ResourceLimits;
use taskpilot::sandbox::result::ValidationPhase;
use taskpilot::sandbox::service::{ExecutionService, SandboxRequest, SandboxService, ValidationPlan};
use taskpilot::secrets::CredentialSet;
use uuid::Uuid;

fn service() -> SandboxService {
    let docker = DockerClient::new().expect("Docker daemon must be available");
    SandboxService::new(Arc::new(docker), 2)
}

fn python_request(run_id: Uuid, files: Vec<GeneratedFile>, test: Option<&str>) -> SandboxRequest {
    SandboxRequest {
        run_id,
        files,
        plan: ValidationPlan {
            repo_url: None,
            base_branch: None,
            install: None,
            lint: None,
            typecheck: None,
            test: test.map(String::from),
        },
        limits: ResourceLimits::default(),
        credentials: CredentialSet::new(),
        language: Language::Python,
    }
}

#[tokio::test]
#[ignore] // Run with: cargo test --test sandbox_integration -- --ignored
async fn test_apply_and_run_passes() {
    let files = vec![GeneratedFile::new(
        "check.py",
        "assert 2 + 2 == 4\nprint('ok')\n",
        FileAction::Create,
    )];

    let outcome = service()
        .execute(python_request(Uuid::new_v4(), files, Some("python check.py")))
        .await
        .expect("sandbox run should complete");

    assert!(outcome.result.success, "result: {:?}", outcome.result);
    assert_eq!(outcome.applied_files, 1);
    let test_phase = outcome.result.phase(ValidationPhase::Test).unwrap();
    assert!(test_phase.output.contains("ok"));
}

#[tokio::test]
#[ignore]
async fn test_failing_command_short_circuits_with_failed_phase() {
    let files = vec![GeneratedFile::new(
        "check.py",
        "raise SystemExit(3)\n",
        FileAction::Create,
    )];

    let outcome = service()
        .execute(python_request(Uuid::new_v4(), files, Some("python check.py")))
        .await
        .expect("sandbox run should complete");

    assert!(!outcome.result.success);
    assert_eq!(outcome.result.failed_phase, Some(ValidationPhase::Test));
    assert_eq!(
        outcome.result.phase(ValidationPhase::Test).unwrap().exit_code,
        3
    );
}

#[tokio::test]
#[ignore]
async fn test_traversal_file_is_rejected_but_run_proceeds() {
    let files = vec![
        GeneratedFile::new("ok.py", "print('fine')\n", FileAction::Create),
        GeneratedFile::new("../etc/passwd", "x", FileAction::Create),
    ];

    let outcome = service()
        .execute(python_request(Uuid::new_v4(), files, Some("python ok.py")))
        .await
        .expect("sandbox run should complete");

    assert_eq!(outcome.applied_files, 1);
    assert_eq!(outcome.rejected_files.len(), 1);
    assert!(outcome.result.success);
}

#[tokio::test]
#[ignore]
async fn test_aborted_run_still_removes_container() {
    let run_id = Uuid::new_v4();
    let files = vec![GeneratedFile::new(
        "wait.py",
        "import time\ntime.sleep(600)\n",
        FileAction::Create,
    )];
    let request = python_request(run_id, files, Some("python wait.py"));

    let service = service();
    let handle = tokio::spawn(async move { service.execute(request).await });

    let docker = bollard::Docker::connect_with_local_defaults().unwrap();
    let name = format!("taskpilot-sbx-{run_id}");

    // Wait for the container to come up, then drop the run mid-test.
    let mut up = false;
    for _ in 0..120 {
        if docker.inspect_container(&name, None).await.is_ok() {
            up = true;
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert!(up, "sandbox container never appeared");
    handle.abort();

    let mut gone = false;
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if docker.inspect_container(&name, None).await.is_err() {
            gone = true;
            break;
        }
    }
    assert!(gone, "container leaked after the run future was dropped");
}
