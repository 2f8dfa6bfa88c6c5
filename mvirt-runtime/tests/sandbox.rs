//! Tasks of one sandbox share the sandbox's shim.

mod common;

use common::{TestShim, shim_calls, write_shim_script};
use mvirt_runtime::bundle::{CONFIG_FILE, RUNTIME_FILE, SANDBOX_FILE, SHIM_BINARY_FILE};
use mvirt_runtime::{CreateOpts, EventBus, RuntimeConfig, ShimManager, TaskManager};
use std::time::Duration;
use tempfile::TempDir;

fn config(dir: &TempDir, shim_binary: std::path::PathBuf) -> RuntimeConfig {
    RuntimeConfig {
        state_root: dir.path().join("tasks"),
        shim_root: dir.path().join("shim"),
        shim_binary,
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_sandbox_tasks_share_one_shim() {
    let dir = TempDir::new().unwrap();
    let shim = TestShim::serve(&dir.path().join("shim"), "default", "pod1").await;
    let binary = write_shim_script(dir.path(), &shim.address);
    let tasks = TaskManager::new(ShimManager::new(config(&dir, binary), EventBus::default()));

    let pod = tasks
        .create("default", "pod1", CreateOpts {
            spec: b"{}".to_vec(),
            ..Default::default()
        })
        .await
        .unwrap();
    let child = tasks
        .create("default", "c-in-pod1", CreateOpts {
            spec: b"{}".to_vec(),
            sandbox_id: Some("pod1".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(pod.address(), shim.address);
    assert_eq!(child.address(), shim.address);
    assert_eq!(shim_calls(dir.path(), "start"), 1);

    let ids: Vec<_> = tasks
        .tasks("default")
        .iter()
        .map(|task| task.id().to_string())
        .collect();
    assert_eq!(ids, ["c-in-pod1", "pod1"]);
    assert!(tasks.tasks("other").is_empty());

    let child_bundle = dir.path().join("tasks/default/c-in-pod1");
    for file in [CONFIG_FILE, "address", RUNTIME_FILE, "options.json", SANDBOX_FILE] {
        assert!(child_bundle.join(file).exists(), "missing {file}");
    }
    assert!(!child_bundle.join(SHIM_BINARY_FILE).exists());
    assert!(dir.path().join("tasks/default/pod1").join(SHIM_BINARY_FILE).exists());
    assert_eq!(
        std::fs::read_to_string(child_bundle.join("address")).unwrap(),
        shim.address
    );

    tasks.delete("default", "c-in-pod1").await.unwrap();
    assert!(!shim.is_stopped());
    assert!(!child_bundle.exists());
    assert!(tasks.get("default", "c-in-pod1").unwrap_err().is_not_found());
    assert!(pod.connect_info().await.unwrap().task_pid > 0);

    tasks.delete("default", "pod1").await.unwrap();
    assert!(shim.is_stopped());
    assert!(tasks.tasks("default").is_empty());
}

#[tokio::test]
async fn test_unknown_sandbox() {
    let dir = TempDir::new().unwrap();
    let tasks = TaskManager::new(ShimManager::new(
        config(&dir, dir.path().join("no-such-shim")),
        EventBus::default(),
    ));

    let err = tasks
        .create("default", "c1", CreateOpts {
            spec: b"{}".to_vec(),
            sandbox_id: Some("pod1".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(!dir.path().join("tasks/default/c1").exists());
}
