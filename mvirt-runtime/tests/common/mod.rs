//! In-process shim for integration tests.
//!
//! Serves the real shim task service on a Unix socket, backed by an OCI
//! runtime that only hands out PIDs. The shim runs on its own tokio
//! runtime so a test can kill it and drop every connection at once.

#![allow(dead_code)]

use async_trait::async_trait;
use mvirt_shim::bootstrap;
use mvirt_shim::config::RuntimeOptions;
use mvirt_shim::error::RuntimeError;
use mvirt_shim::proto::task_service_server::TaskServiceServer;
use mvirt_shim::runtime::{CreateOpts, ExecOpts, OciRuntime, ProcessStdio, RuntimeProvider};
use mvirt_shim::services::events::{self, QUEUE_CAPACITY};
use mvirt_shim::services::task::{CgroupAdapter, TaskApiHandler, TaskService};
use mvirt_shim::utils::reaper::Reaper;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::runtime::Runtime;
use tokio::sync::{oneshot, watch};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

#[derive(Default)]
struct TestRuntime {
    next_pid: AtomicI32,
    fail_create: bool,
}

#[async_trait]
impl OciRuntime for TestRuntime {
    async fn create(
        &self,
        _id: &str,
        _bundle: &Path,
        _opts: &CreateOpts,
        _stdio: ProcessStdio,
    ) -> RuntimeResult<i32> {
        if self.fail_create {
            return Err(RuntimeError::Failed {
                binary: "runc".into(),
                status: 1,
                stderr: "container_linux.go: permission denied".into(),
            });
        }
        Ok(4000 + self.next_pid.fetch_add(1, Ordering::SeqCst))
    }
    async fn start(&self, _id: &str) -> RuntimeResult<()> {
        Ok(())
    }
    async fn exec(
        &self,
        _id: &str,
        _spec: &[u8],
        _opts: &ExecOpts,
        _stdio: ProcessStdio,
    ) -> RuntimeResult<i32> {
        Ok(5000 + self.next_pid.fetch_add(1, Ordering::SeqCst))
    }
    async fn kill(&self, _id: &str, _signal: i32, _all: bool) -> RuntimeResult<()> {
        Ok(())
    }
    async fn delete(&self, _id: &str, _force: bool) -> RuntimeResult<()> {
        Ok(())
    }
    async fn pause(&self, _id: &str) -> RuntimeResult<()> {
        Ok(())
    }
    async fn resume(&self, _id: &str) -> RuntimeResult<()> {
        Ok(())
    }
    async fn ps(&self, _id: &str) -> RuntimeResult<Vec<i32>> {
        Ok(Vec::new())
    }
    async fn update(&self, _id: &str, _resources: &[u8]) -> RuntimeResult<()> {
        Ok(())
    }
    async fn checkpoint(&self, _id: &str, _path: &Path, _leave_running: bool) -> RuntimeResult<()> {
        Ok(())
    }
}

struct TestProvider(Arc<TestRuntime>);

impl RuntimeProvider for TestProvider {
    fn runtime(&self, _options: &RuntimeOptions, _bundle: &Path) -> Arc<dyn OciRuntime> {
        self.0.clone()
    }
}

pub struct TestShim {
    pub address: String,
    stopped: watch::Receiver<bool>,
    runtime: Option<Runtime>,
}

impl TestShim {
    /// Serve a shim for grouping key `key` below `shim_root`.
    pub async fn serve(shim_root: &Path, namespace: &str, key: &str) -> Self {
        Self::serve_with(shim_root, namespace, key, false).await
    }

    /// Like [`TestShim::serve`], but every container create fails.
    pub async fn serve_failing(shim_root: &Path, namespace: &str, key: &str) -> Self {
        Self::serve_with(shim_root, namespace, key, true).await
    }

    async fn serve_with(shim_root: &Path, namespace: &str, key: &str, fail_create: bool) -> Self {
        let address = bootstrap::socket_address(shim_root, namespace, key);
        let path = bootstrap::socket_path(&address);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        listener.set_nonblocking(true).unwrap();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let (tx, rx) = oneshot::channel();
        let namespace = namespace.to_string();
        runtime.spawn(async move {
            let listener = tokio::net::UnixListener::from_std(listener).unwrap();
            let reaper = Reaper::new();
            let (publisher, forwarder) = events::channel(&namespace, QUEUE_CAPACITY);
            let provider = TestProvider(Arc::new(TestRuntime {
                fail_create,
                ..Default::default()
            }));
            let service = TaskService::new(
                &namespace,
                &reaper,
                Arc::new(provider),
                CgroupAdapter::new(Path::new("/nonexistent"), Path::new("/nonexistent")),
                publisher,
            );
            let _ = tx.send(service.shutdown_signal());
            let _ = Server::builder()
                .add_service(TaskServiceServer::new(TaskApiHandler::new(service, forwarder)))
                .serve_with_incoming(UnixListenerStream::new(listener))
                .await;
        });

        let stopped = rx.await.unwrap();
        Self {
            address,
            stopped,
            runtime: Some(runtime),
        }
    }

    /// Whether the shim honoured a `Shutdown`.
    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Kill the shim: all its connections drop.
    pub fn kill(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for TestShim {
    fn drop(&mut self) {
        self.kill();
    }
}

/// A shim binary whose `start` prints `address` and whose `delete` fails.
/// Every invocation is appended to `calls.log` next to it.
pub fn write_shim_script(dir: &Path, address: &str) -> PathBuf {
    let path = dir.join("fake-shim");
    let calls = dir.join("calls.log");
    let script = format!(
        "#!/bin/sh\n\
         echo \"$@\" >> '{calls}'\n\
         for last; do :; done\n\
         if [ \"$last\" = start ]; then\n\
         \x20 printf '{{\"version\":2,\"address\":\"%s\",\"protocol\":\"grpc\"}}' '{address}'\n\
         \x20 exit 0\n\
         fi\n\
         exit 1\n",
        calls = calls.display(),
    );
    write_executable(&path, &script)
}

/// A shim binary whose `start` spawns a stand-in shim process, records its
/// PID in the bundle and prints `address`, where nothing serves gRPC. The
/// PID is also left in `dir` for [`spawned_shim_pid`].
pub fn write_unreachable_shim_script(dir: &Path, address: &str) -> PathBuf {
    let socket = bootstrap::socket_path(address);
    let script = format!(
        "#!/bin/sh\n\
         for last; do :; done\n\
         if [ \"$last\" = start ]; then\n\
         \x20 sleep 300 >/dev/null 2>&1 </dev/null &\n\
         \x20 echo $! | tee '{pid_file}' > '{record}'\n\
         \x20 mkdir -p '{socket_dir}' && : > '{socket}'\n\
         \x20 printf '{{\"version\":2,\"address\":\"%s\",\"protocol\":\"grpc\"}}' '{address}'\n\
         \x20 exit 0\n\
         fi\n\
         exit 1\n",
        pid_file = bootstrap::PID_FILE,
        record = dir.join(bootstrap::PID_FILE).display(),
        socket_dir = socket.parent().unwrap().display(),
        socket = socket.display(),
    );
    write_executable(&dir.join("unreachable-shim"), &script)
}

fn write_executable(path: &Path, contents: &str) -> PathBuf {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o755)
        .open(path)
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.sync_all().unwrap();
    drop(file);
    path.to_path_buf()
}

pub fn spawned_shim_pid(dir: &Path) -> i32 {
    std::fs::read_to_string(dir.join(bootstrap::PID_FILE))
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

/// Whether `pid` is running (zombies count as gone).
pub fn is_alive(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .is_some_and(|state| state != 'Z' && state != 'X'),
        Err(_) => false,
    }
}

/// Invocations of the shim script ending in `subcommand`.
pub fn shim_calls(dir: &Path, subcommand: &str) -> usize {
    std::fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .filter(|line| line.trim_end().ends_with(subcommand))
        .count()
}
