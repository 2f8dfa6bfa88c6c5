//! Shim bootstrap: the `start` and `delete` subcommands.
//!
//! `start` resolves the task's grouping key, derives the shim socket from
//! it and either joins the shim already listening there or spawns a new
//! one that inherits the listening socket as fd 3. The address is printed
//! on stdout as [`BootstrapParams`].
//!
//! `delete` cleans up after a shim that is gone and prints a length
//! prefixed `DeleteResponse`.

use crate::config::{Args, RuntimeOptions};
use crate::error::{Error, Result};
use crate::oci::Spec;
use crate::proto::DeleteResponse;
use crate::runtime::{CliRuntime, OciRuntime};
use crate::services::events::timestamp;
use crate::utils::reaper::Reaper;
use prost::Message;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const ADDRESS_FILE: &str = "address";
pub const LOG_FILE: &str = "log";
/// PID of a shim spawned by `start`. Not written when `start` joins a
/// running shim.
pub const PID_FILE: &str = "shim.pid";
pub const SOCKET_DIR: &str = "s";
pub const PROTOCOL: &str = "grpc";
pub const BOOTSTRAP_VERSION: u32 = 2;
/// fd number the listening socket is passed on to the serving shim.
pub const LISTENER_FD: RawFd = 3;
/// Exit status reported for a task whose shim is gone: 128 + SIGKILL.
pub const KILLED_EXIT_STATUS: u32 = 137;

/// Printed by `start` on stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapParams {
    pub version: u32,
    pub address: String,
    pub protocol: String,
}

impl BootstrapParams {
    pub fn new(address: &str) -> Self {
        Self {
            version: BOOTSTRAP_VERSION,
            address: address.to_string(),
            protocol: PROTOCOL.to_string(),
        }
    }
}

/// The shim grouping key of a task: a group annotation or the task ID.
pub fn group_key(bundle: &Path, id: &str) -> String {
    match Spec::load(bundle) {
        Ok(spec) => spec.group_key().unwrap_or(id).to_string(),
        Err(e) => {
            debug!(bundle = %bundle.display(), error = %e, "No readable spec, grouping by task id");
            id.to_string()
        }
    }
}

/// Socket address for a grouping key.
///
/// The key is hashed so that arbitrary keys fit into `sun_path`.
pub fn socket_address(state_root: &Path, namespace: &str, key: &str) -> String {
    let digest = Sha256::digest(format!("{namespace}/{key}").as_bytes());
    format!(
        "unix://{}",
        state_root.join(SOCKET_DIR).join(format!("{digest:x}")).display()
    )
}

/// Filesystem path of a `unix://` address.
pub fn socket_path(address: &str) -> PathBuf {
    PathBuf::from(address.strip_prefix("unix://").unwrap_or(address))
}

pub fn write_address(dir: &Path, address: &str) -> io::Result<()> {
    let tmp = dir.join(format!(".{ADDRESS_FILE}.tmp"));
    std::fs::write(&tmp, address)?;
    std::fs::rename(tmp, dir.join(ADDRESS_FILE))
}

fn write_pid(dir: &Path, pid: u32) -> io::Result<()> {
    let tmp = dir.join(format!(".{PID_FILE}.tmp"));
    std::fs::write(&tmp, pid.to_string())?;
    std::fs::rename(tmp, dir.join(PID_FILE))
}

pub fn read_address(dir: &Path) -> io::Result<String> {
    Ok(std::fs::read_to_string(dir.join(ADDRESS_FILE))?
        .trim()
        .to_string())
}

/// Whether a shim is accepting connections on `path`.
pub fn is_listening(path: &Path) -> bool {
    UnixStream::connect(path).is_ok()
}

enum Bound {
    New(UnixListener),
    /// A live shim already listens at the address.
    Existing,
}

/// Bind the shim socket, joining a live shim or replacing a stale socket.
fn bind(path: &Path) -> io::Result<Bound> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut retried = false;
    loop {
        match UnixListener::bind(path) {
            Ok(listener) => return Ok(Bound::New(listener)),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                if is_listening(path) {
                    return Ok(Bound::Existing);
                }
                if retried {
                    return Err(e);
                }
                warn!(path = %path.display(), "Removing stale shim socket");
                std::fs::remove_file(path)?;
                retried = true;
            }
            Err(e) => return Err(e),
        }
    }
}

/// oom_score_adj for the shim: one above its parent, so the kernel picks
/// the shim before the daemon.
pub fn child_oom_score(parent: i32) -> i32 {
    (parent + 1).min(1000)
}

fn adjust_oom_score(pid: u32) -> io::Result<()> {
    let parent: i32 = std::fs::read_to_string("/proc/self/oom_score_adj")?
        .trim()
        .parse()
        .map_err(io::Error::other)?;
    std::fs::write(
        format!("/proc/{pid}/oom_score_adj"),
        child_oom_score(parent).to_string(),
    )
}

/// The `start` subcommand.
pub fn start(args: &Args) -> Result<BootstrapParams> {
    if args.id.is_empty() {
        return Err(Error::InvalidArgument("-id is required".to_string()));
    }
    let bundle = args.bundle()?;
    let key = group_key(&bundle, &args.id);
    let address = socket_address(&args.state_root, &args.namespace, &key);
    let path = socket_path(&address);
    info!(id = %args.id, group = %key, address = %address, "Starting shim");

    let listener = match bind(&path)? {
        Bound::New(listener) => listener,
        Bound::Existing => {
            info!(address = %address, "Joining running shim");
            write_address(&bundle, &address)?;
            return Ok(BootstrapParams::new(&address));
        }
    };

    match spawn_shim(args, &bundle, &address, &listener) {
        Ok(()) => Ok(BootstrapParams::new(&address)),
        Err(e) => {
            let _ = std::fs::remove_file(&path);
            Err(e)
        }
    }
}

fn spawn_shim(args: &Args, bundle: &Path, address: &str, listener: &UnixListener) -> Result<()> {
    write_address(bundle, address)?;

    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(bundle.join(LOG_FILE))?;
    let mut cmd = Command::new(std::env::current_exe()?);
    cmd.args(["-namespace", &args.namespace, "-id", &args.id, "-address", &args.address])
        .arg("-bundle")
        .arg(bundle)
        .arg("-state-root")
        .arg(&args.state_root);
    if args.debug {
        cmd.arg("-debug");
    }
    cmd.current_dir(bundle)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log))
        .process_group(0);
    pass_listener(&mut cmd, listener.as_raw_fd());

    let mut child = cmd.spawn()?;
    let pid = child.id();

    let setup = adjust_oom_score(pid)
        .map_err(|e| io::Error::other(format!("failed to adjust OOM score for shim: {e}")))
        .and_then(|()| write_pid(bundle, pid));
    if let Err(e) = setup {
        let _ = child.kill();
        let _ = child.wait();
        return Err(Error::Io(e));
    }

    std::thread::spawn(move || {
        let _ = child.wait();
    });
    info!(pid, address = %address, "Shim spawned");
    Ok(())
}

/// Install `fd` as [`LISTENER_FD`] in the child.
fn pass_listener(cmd: &mut Command, fd: RawFd) {
    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if fd == LISTENER_FD {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(io::Error::last_os_error());
                }
            } else if libc::dup2(fd, LISTENER_FD) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// The `delete` subcommand: force-delete the container through the runtime
/// and drop the shim socket if nothing listens on it any more.
pub async fn delete(args: &Args, reaper: Arc<Reaper>) -> Result<DeleteResponse> {
    let bundle = args.bundle()?;
    let options = RuntimeOptions::load(&bundle)?;
    let runtime = CliRuntime::new(&options, bundle.join("log.json"), reaper);

    if let Err(e) = runtime.delete(&args.id, true).await {
        warn!(id = %args.id, error = %e, "Failed to delete container");
    }

    if let Ok(address) = read_address(&bundle) {
        let path = socket_path(&address);
        if !is_listening(&path) {
            let _ = std::fs::remove_file(&path);
        }
    }

    Ok(DeleteResponse {
        pid: 0,
        exit_status: KILLED_EXIT_STATUS,
        exited_at: Some(timestamp(chrono::Utc::now())),
    })
}

/// `u32` big-endian length followed by the protobuf message.
pub fn encode_delete_response(response: &DeleteResponse) -> Vec<u8> {
    let body = response.encode_to_vec();
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

pub fn decode_delete_response(bytes: &[u8]) -> Result<DeleteResponse> {
    let invalid = |reason: &str| Error::InvalidArgument(format!("delete response: {reason}"));
    let (len, body) = bytes
        .split_first_chunk::<4>()
        .ok_or_else(|| invalid("missing length prefix"))?;
    let len = u32::from_be_bytes(*len) as usize;
    let body = body.get(..len).ok_or_else(|| invalid("truncated body"))?;
    DeleteResponse::decode(body).map_err(|e| invalid(&e.to_string()))
}

/// Take the listening socket inherited from `start`.
pub fn inherited_listener() -> io::Result<tokio::net::UnixListener> {
    use std::os::fd::FromRawFd;

    // SAFETY: `start` installs the listener as fd 3 and nothing else in
    // this process claims it.
    let listener = unsafe { UnixListener::from_raw_fd(LISTENER_FD) };
    listener.set_nonblocking(true)?;
    tokio::net::UnixListener::from_std(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_address_depends_on_group_only() {
        let root = Path::new("/run/mvirt/shim");
        let a = socket_address(root, "default", "pod1");
        let b = socket_address(root, "default", "pod1");
        assert_eq!(a, b);
        assert!(a.starts_with("unix:///run/mvirt/shim/s/"));
        assert_ne!(a, socket_address(root, "other", "pod1"));
        assert_ne!(a, socket_address(root, "default", "pod2"));
        assert!(socket_path(&a).as_os_str().len() < 108);
    }

    #[test]
    fn test_group_key_falls_back_to_id() {
        let dir = TempDir::new().unwrap();
        assert_eq!(group_key(dir.path(), "c1"), "c1");

        std::fs::write(
            dir.path().join("config.json"),
            r#"{"annotations":{"io.kubernetes.cri.sandbox-id":"pod1"}}"#,
        )
        .unwrap();
        assert_eq!(group_key(dir.path(), "c1"), "pod1");
    }

    #[test]
    fn test_bind_joins_live_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s").join("shim");

        let first = match bind(&path).unwrap() {
            Bound::New(listener) => listener,
            Bound::Existing => panic!("nothing was listening"),
        };
        assert!(matches!(bind(&path).unwrap(), Bound::Existing));
        drop(first);
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shim");
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());
        assert!(!is_listening(&path));

        assert!(matches!(bind(&path).unwrap(), Bound::New(_)));
    }

    #[test]
    fn test_address_file_round_trip() {
        let dir = TempDir::new().unwrap();
        write_address(dir.path(), "unix:///run/x").unwrap();
        assert_eq!(read_address(dir.path()).unwrap(), "unix:///run/x");

        write_pid(dir.path(), 4242).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join(PID_FILE)).unwrap(), "4242");
        assert!(!dir.path().join(format!(".{PID_FILE}.tmp")).exists());
    }

    #[test]
    fn test_delete_response_framing() {
        let response = DeleteResponse {
            pid: 0,
            exit_status: KILLED_EXIT_STATUS,
            exited_at: None,
        };
        let bytes = encode_delete_response(&response);
        assert_eq!(&bytes[..4], &(bytes.len() as u32 - 4).to_be_bytes());
        assert_eq!(decode_delete_response(&bytes).unwrap().exit_status, 137);
        assert!(decode_delete_response(&bytes[..2]).is_err());
    }

    #[test]
    fn test_child_oom_score_clamped() {
        assert_eq!(child_oom_score(-999), -998);
        assert_eq!(child_oom_score(0), 1);
        assert_eq!(child_oom_score(1000), 1000);
    }
}
