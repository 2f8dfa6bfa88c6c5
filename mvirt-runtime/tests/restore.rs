//! Daemon restart: reconnect to live shims, clean up after dead ones.

mod common;

use common::TestShim;
use mvirt_runtime::bundle::Bundle;
use mvirt_runtime::{EventBus, RuntimeConfig, ShimManager};
use mvirt_shim::proto::envelope::Event;
use std::time::Duration;
use tempfile::TempDir;

fn config(dir: &TempDir) -> RuntimeConfig {
    RuntimeConfig {
        state_root: dir.path().join("tasks"),
        shim_root: dir.path().join("shim"),
        shim_binary: dir.path().join("no-such-shim"),
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_load_existing() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let shim = TestShim::serve(&config.shim_root, "default", "live").await;

    let live = Bundle::create(&config.state_root, "default", "live", b"{}").unwrap();
    live.write_address(&shim.address).unwrap();
    let dead = Bundle::create(&config.state_root, "k8s", "dead", b"{}").unwrap();
    dead.write_address("unix:///nonexistent/shim.sock").unwrap();
    let orphan = Bundle::create(&config.state_root, "k8s", "orphan", b"{}").unwrap();

    let manager = ShimManager::new(config, EventBus::default());
    assert_eq!(manager.load_existing().await.unwrap(), 1);

    assert_eq!(manager.get("default", "live").unwrap().address(), shim.address);
    assert!(manager.get("k8s", "dead").unwrap_err().is_not_found());
    assert!(live.path().exists());
    assert!(!dead.path().exists());
    assert!(!orphan.path().exists());

    // Loading again keeps what is already registered.
    assert_eq!(manager.load_existing().await.unwrap(), 0);
}

#[tokio::test]
async fn test_dead_shim_reports_exit() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let mut shim = TestShim::serve(&config.shim_root, "default", "c1").await;

    let bundle = Bundle::create(&config.state_root, "default", "c1", b"{}").unwrap();
    bundle.write_address(&shim.address).unwrap();

    let events = EventBus::default();
    let mut rx = events.subscribe();
    let manager = ShimManager::new(config, events);
    assert_eq!(manager.load_existing().await.unwrap(), 1);

    shim.kill();

    let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no exit published")
        .unwrap();
    assert_eq!(event.topic, "/tasks/exit");
    match event.event {
        Event::TaskExit(exit) => {
            assert_eq!(exit.container_id, "c1");
            assert_eq!(exit.exit_status, 137);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(manager.get("default", "c1").unwrap_err().is_not_found());
    assert!(!bundle.path().exists());
}
