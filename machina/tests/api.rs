//! Integration tests for the REST API surface.
//!
//! These drive the real router over a loopback listener; machines never get
//! far enough to need a registry or a hypervisor, which is exactly what the
//! lifecycle error mapping is about.

use std::time::Duration;

use machina::{
    machine::{GuestSpec, MachineManager, MachineSpec, ManagerConfig},
    server::{create_router, ServerState},
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn test_config(home: &TempDir) -> ManagerConfig {
    let init_image = home.path().join("tmpinit.ext4");
    std::fs::write(&init_image, b"prebuilt init drive").unwrap();

    ManagerConfig::builder()
        .home_dir(home.path())
        .init_image_path(init_image)
        .build()
}

async fn spawn_server(home: &TempDir) -> anyhow::Result<String> {
    let state = ServerState::new(test_config(home));
    let router = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    Ok(format!("http://{}", addr))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[tokio::test]
async fn test_create_returns_id_and_created_state() -> anyhow::Result<()> {
    let home = TempDir::new()?;
    let base = spawn_server(&home).await?;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/create"))
        .json(&json!({
            "config": {
                "init": { "exec": ["/bin/sleep", "inf"] },
                "image": "alpine:latest",
                "guest": { "cpu_kind": "shared", "cpus": 2, "memory_mb": 2048 }
            }
        }))
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await?;
    assert_eq!(body["state"], "created");
    assert!(body["id"].as_str().is_some_and(|id| !id.is_empty()));

    Ok(())
}

#[tokio::test]
async fn test_guest_endpoints_conflict_until_running() -> anyhow::Result<()> {
    let home = TempDir::new()?;
    let base = spawn_server(&home).await?;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{base}/create"))
        .json(&json!({
            "config": { "image": "alpine:latest", "guest": { "cpus": 1, "memory_mb": 128 } }
        }))
        .send()
        .await?
        .json()
        .await?;
    let id = body["id"].as_str().unwrap();

    let status = client.get(format!("{base}/status/{id}")).send().await?;
    assert_eq!(status.status(), 409);

    let exec = client
        .post(format!("{base}/exec/{id}"))
        .json(&json!({ "cmd": ["echo", "hi"] }))
        .send()
        .await?;
    assert_eq!(exec.status(), 409);

    let sys_info = client.get(format!("{base}/sys_info/{id}")).send().await?;
    assert_eq!(sys_info.status(), 409);

    Ok(())
}

#[tokio::test]
async fn test_unknown_machine_is_404_and_bad_spec_is_400() -> anyhow::Result<()> {
    let home = TempDir::new()?;
    let base = spawn_server(&home).await?;
    let client = reqwest::Client::new();

    let unknown = client
        .get(format!("{base}/status/00000000000000"))
        .send()
        .await?;
    assert_eq!(unknown.status(), 404);

    let malformed_image = client
        .post(format!("{base}/create"))
        .json(&json!({
            "config": { "image": "***", "guest": { "cpus": 1, "memory_mb": 128 } }
        }))
        .send()
        .await?;
    assert_eq!(malformed_image.status(), 400);

    let zero_cpus = client
        .post(format!("{base}/create"))
        .json(&json!({
            "config": { "image": "alpine", "guest": { "cpus": 0, "memory_mb": 128 } }
        }))
        .send()
        .await?;
    assert_eq!(zero_cpus.status(), 400);

    Ok(())
}

#[tokio::test]
async fn test_destroy_twice_is_ok_both_times() -> anyhow::Result<()> {
    let home = TempDir::new()?;
    let base = spawn_server(&home).await?;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{base}/create"))
        .json(&json!({
            "config": { "image": "alpine:latest", "guest": { "cpus": 1, "memory_mb": 128 } }
        }))
        .send()
        .await?
        .json()
        .await?;
    let id = body["id"].as_str().unwrap();

    let first = client.post(format!("{base}/destroy/{id}")).send().await?;
    assert_eq!(first.status(), 200);

    let second = client.post(format!("{base}/destroy/{id}")).send().await?;
    assert_eq!(second.status(), 200);
    let body: Value = second.json().await?;
    assert_eq!(body["state"], "destroyed");

    Ok(())
}

#[ignore = "requires network access, KVM, root, a firecracker binary, and kernel/init assets"]
#[tokio::test]
async fn test_end_to_end_alpine_boot() -> anyhow::Result<()> {
    let home = TempDir::new()?;
    let manager = MachineManager::new(test_config(&home));

    let spec = MachineSpec::builder()
        .image("alpine:latest")
        .guest(GuestSpec::builder().cpus(2).memory_mb(2048).build())
        .build();

    let (id, state) = manager.create(spec).await?;
    assert_eq!(state.to_string(), "created");

    // Wait out provisioning and guest boot.
    let mut healthy = false;
    for _ in 0..120 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if let Ok(report) = manager.status(&id).await {
            if *report.ok() {
                healthy = true;
                break;
            }
        }
    }
    assert!(healthy, "guest never became healthy");

    let output = manager
        .exec(&id, &["echo".to_string(), "hi".to_string()])
        .await?;
    assert!(output.contains("hi"));

    manager.destroy(&id).await?;
    Ok(())
}
