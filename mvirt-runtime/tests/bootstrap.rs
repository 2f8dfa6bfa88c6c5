//! Shim socket addresses follow the grouping key, not the task ID.

use mvirt_shim::bootstrap::{self, read_address, socket_address, socket_path};
use mvirt_shim::config::Args;
use std::ffi::OsString;
use std::path::Path;
use tempfile::TempDir;

fn bundle(dir: &Path, id: &str, annotations: &str) -> std::path::PathBuf {
    let bundle = dir.join(id);
    std::fs::create_dir_all(&bundle).unwrap();
    std::fs::write(
        bundle.join("config.json"),
        format!(r#"{{"annotations":{{{annotations}}}}}"#),
    )
    .unwrap();
    bundle
}

#[test]
fn test_grouped_tasks_share_address() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("shim");
    let group = r#""io.kubernetes.cri.sandbox-id":"pod1""#;
    let a = bundle(dir.path(), "a", group);
    let b = bundle(dir.path(), "b", group);
    let c = bundle(dir.path(), "c", "");

    let key_a = bootstrap::group_key(&a, "a");
    let key_b = bootstrap::group_key(&b, "b");
    assert_eq!(key_a, "pod1");
    assert_eq!(
        socket_address(&root, "default", &key_a),
        socket_address(&root, "default", &key_b)
    );
    assert_eq!(bootstrap::group_key(&c, "c"), "c");
    assert_ne!(
        socket_address(&root, "default", &key_a),
        socket_address(&root, "default", "c")
    );
}

#[test]
fn test_start_joins_running_shim() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("shim");
    let first = bundle(dir.path(), "a", r#""io.mvirt.shim.v1.group":"g1""#);
    let second = bundle(dir.path(), "b", r#""io.mvirt.shim.v1.group":"g1""#);

    let address = socket_address(&root, "default", "g1");
    let path = socket_path(&address);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let _running = std::os::unix::net::UnixListener::bind(&path).unwrap();
    bootstrap::write_address(&first, &address).unwrap();

    let mut argv: Vec<OsString> = ["mvirt-shim", "-namespace", "default", "-id", "b"]
        .into_iter()
        .map(OsString::from)
        .collect();
    argv.extend(["-bundle".into(), second.clone().into_os_string()]);
    argv.extend(["-state-root".into(), root.clone().into_os_string()]);
    argv.push("start".into());
    let args = Args::parse_normalized(argv);
    let params = bootstrap::start(&args).unwrap();

    assert_eq!(params.address, address);
    assert_eq!(params.protocol, "grpc");
    assert_eq!(read_address(&second).unwrap(), read_address(&first).unwrap());
    // The stale-socket path did not replace the live socket.
    assert!(bootstrap::is_listening(&path));
}
