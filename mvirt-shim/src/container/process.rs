//! One OS process inside a container: the init process or an exec.

use super::io::{self, ConsoleSocket, ProcessIo, Stdio};
use crate::config::RuntimeOptions;
use crate::error::{Error, Result};
use crate::runtime::{CreateOpts, ExecOpts, OciRuntime, ProcessStdio};
use chrono::{DateTime, Utc};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Unknown,
    Created,
    Running,
    Stopped,
    Paused,
    Pausing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Init,
    Exec,
}

/// Final exit of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub pid: i32,
    pub status: i32,
    pub exited_at: DateTime<Utc>,
}

/// Point-in-time view of a process, as reported by `State`.
#[derive(Debug, Clone)]
pub struct ProcessState {
    pub id: String,
    pub pid: i32,
    pub status: Status,
    pub stdio: Stdio,
    pub exit_status: i32,
    pub exited_at: Option<DateTime<Utc>>,
}

struct Inner {
    pid: i32,
    status: Status,
    exit: Option<ExitInfo>,
    deleted: bool,
    io: Option<ProcessIo>,
}

pub struct Process {
    id: String,
    container_id: String,
    kind: ProcessKind,
    bundle: PathBuf,
    stdio: Stdio,
    spec: Vec<u8>,
    options: RuntimeOptions,
    runtime: Arc<dyn OciRuntime>,
    /// Serializes runtime operations on this process.
    op_lock: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
    exited: watch::Sender<Option<ExitInfo>>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("container_id", &self.container_id)
            .field("kind", &self.kind)
            .field("pid", &self.pid())
            .field("status", &self.status())
            .finish()
    }
}

impl Process {
    pub fn new_init(
        container_id: &str,
        bundle: &Path,
        stdio: Stdio,
        options: RuntimeOptions,
        runtime: Arc<dyn OciRuntime>,
    ) -> Arc<Self> {
        Self::new(
            container_id.to_string(),
            container_id,
            ProcessKind::Init,
            bundle,
            stdio,
            Vec::new(),
            options,
            runtime,
        )
    }

    /// An exec process; `spec` is the JSON encoded OCI process.
    pub fn new_exec(
        exec_id: &str,
        container_id: &str,
        bundle: &Path,
        stdio: Stdio,
        spec: Vec<u8>,
        options: RuntimeOptions,
        runtime: Arc<dyn OciRuntime>,
    ) -> Arc<Self> {
        Self::new(
            exec_id.to_string(),
            container_id,
            ProcessKind::Exec,
            bundle,
            stdio,
            spec,
            options,
            runtime,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        id: String,
        container_id: &str,
        kind: ProcessKind,
        bundle: &Path,
        stdio: Stdio,
        spec: Vec<u8>,
        options: RuntimeOptions,
        runtime: Arc<dyn OciRuntime>,
    ) -> Arc<Self> {
        let (exited, _) = watch::channel(None);
        Arc::new(Self {
            id,
            container_id: container_id.to_string(),
            kind,
            bundle: bundle.to_path_buf(),
            stdio,
            spec,
            options,
            runtime,
            op_lock: tokio::sync::Mutex::new(()),
            inner: Mutex::new(Inner {
                pid: 0,
                status: Status::Created,
                exit: None,
                deleted: false,
                io: None,
            }),
            exited,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn is_init(&self) -> bool {
        self.kind == ProcessKind::Init
    }

    /// The exec ID as used on the wire: empty for the init process.
    pub fn exec_id(&self) -> &str {
        match self.kind {
            ProcessKind::Init => "",
            ProcessKind::Exec => &self.id,
        }
    }

    pub fn pid(&self) -> i32 {
        self.lock().pid
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    pub fn stdio(&self) -> &Stdio {
        &self.stdio
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_not_deleted(&self) -> Result<()> {
        if self.lock().deleted {
            return Err(Error::NotFound(format!("process {}", self.id)));
        }
        Ok(())
    }

    fn pid_file(&self) -> PathBuf {
        match self.kind {
            ProcessKind::Init => self.bundle.join("init.pid"),
            ProcessKind::Exec => self.bundle.join(format!("{}.pid", self.id)),
        }
    }

    /// Descriptors for the runtime, plus a console socket for terminals.
    fn open_stdio(&self) -> Result<(ProcessStdio, Option<ConsoleSocket>, Option<ProcessIo>)> {
        if self.stdio.terminal {
            let socket = ConsoleSocket::new()?;
            let stdio = ProcessStdio {
                console_socket: Some(socket.path().to_path_buf()),
                ..Default::default()
            };
            return Ok((stdio, Some(socket), None));
        }
        let (stdio, io) = io::prepare(&self.stdio, self.options.io_uid, self.options.io_gid)?;
        Ok((stdio, None, Some(io)))
    }

    async fn finish_stdio(&self, console: Option<ConsoleSocket>, io: Option<ProcessIo>) -> Result<()> {
        let io = match console {
            Some(socket) => {
                let master = socket.receive_master().await?;
                io::attach_console(&self.stdio, master)?
            }
            None => io.unwrap_or_default(),
        };
        self.lock().io = Some(io);
        Ok(())
    }

    /// Create the init process through the runtime without starting it.
    pub async fn create(&self, checkpoint: Option<PathBuf>) -> Result<i32> {
        let _guard = self.op_lock.lock().await;
        let (stdio, console, io) = self.open_stdio()?;
        let opts = CreateOpts {
            pid_file: self.pid_file(),
            no_pivot: self.options.no_pivot_root,
            no_new_keyring: self.options.no_new_keyring,
            checkpoint,
        };

        let pid = self
            .runtime
            .create(&self.container_id, &self.bundle, &opts, stdio)
            .await
            .map_err(|e| Error::runtime("create", &self.container_id, e))?;
        self.finish_stdio(console, io).await?;

        self.lock().pid = pid;
        info!(id = %self.container_id, pid, "Container created");
        Ok(pid)
    }

    /// Created → Running. Returns the PID.
    pub async fn start(&self) -> Result<i32> {
        let _guard = self.op_lock.lock().await;
        {
            let inner = self.lock();
            if inner.deleted {
                return Err(Error::NotFound(format!("process {}", self.id)));
            }
            if inner.status != Status::Created {
                return Err(Error::FailedPrecondition(format!(
                    "process {} is {:?}, cannot start",
                    self.id, inner.status
                )));
            }
        }

        let pid = match self.kind {
            ProcessKind::Init => {
                self.runtime
                    .start(&self.container_id)
                    .await
                    .map_err(|e| Error::runtime("start", &self.container_id, e))?;
                self.pid()
            }
            ProcessKind::Exec => {
                let (stdio, console, io) = self.open_stdio()?;
                let opts = ExecOpts {
                    pid_file: self.pid_file(),
                    process_file: self.bundle.join(format!("{}.json", self.id)),
                };
                let pid = self
                    .runtime
                    .exec(&self.container_id, &self.spec, &opts, stdio)
                    .await
                    .map_err(|e| Error::runtime("exec", &self.container_id, e))?;
                self.finish_stdio(console, io).await?;
                self.lock().pid = pid;
                pid
            }
        };

        let mut inner = self.lock();
        if inner.status == Status::Created {
            inner.status = Status::Running;
        }
        debug!(id = %self.id, pid, "Process started");
        Ok(pid)
    }

    /// Record the exit and release every waiter.
    pub fn set_exited(&self, status: i32, exited_at: DateTime<Utc>) {
        let exit = {
            let mut inner = self.lock();
            if inner.exit.is_some() {
                return;
            }
            let exit = ExitInfo {
                pid: inner.pid,
                status,
                exited_at,
            };
            inner.status = Status::Stopped;
            inner.exit = Some(exit);
            if let Some(io) = &inner.io {
                io.close_stdin();
            }
            exit
        };
        self.exited.send_replace(Some(exit));
    }

    /// Block until the process has exited.
    pub async fn wait(&self) -> Result<ExitInfo> {
        let mut rx = self.exited.subscribe();
        let exit = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Unavailable(format!("process {} went away", self.id)))?;
        exit.ok_or_else(|| Error::Unavailable(format!("process {} went away", self.id)))
    }

    pub fn exit(&self) -> Option<ExitInfo> {
        self.lock().exit
    }

    pub async fn kill(&self, signal: i32, all: bool) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let (pid, status) = {
            let inner = self.lock();
            if inner.deleted {
                return Err(Error::NotFound(format!("process {}", self.id)));
            }
            (inner.pid, inner.status)
        };
        if status == Status::Stopped {
            return Err(Error::NotFound(format!("process {} already finished", self.id)));
        }

        match self.kind {
            ProcessKind::Init => self
                .runtime
                .kill(&self.container_id, signal, all)
                .await
                .map_err(|e| Error::runtime("kill", &self.container_id, e)),
            ProcessKind::Exec => {
                if pid == 0 {
                    return Err(Error::FailedPrecondition(format!(
                        "process {} has not been started",
                        self.id
                    )));
                }
                let signal = Signal::try_from(signal)
                    .map_err(|_| Error::InvalidArgument(format!("invalid signal {signal}")))?;
                kill(Pid::from_raw(pid), signal).map_err(|e| match e {
                    nix::errno::Errno::ESRCH => {
                        Error::NotFound(format!("process {} already finished", self.id))
                    }
                    e => e.into(),
                })
            }
        }
    }

    /// Kill every process left in the container.
    pub async fn kill_all(&self) {
        if let Err(e) = self
            .runtime
            .kill(&self.container_id, libc::SIGKILL, true)
            .await
        {
            warn!(id = %self.container_id, error = %e, "Failed to kill remaining processes");
        }
    }

    pub fn resize(&self, width: u32, height: u32) -> Result<()> {
        let inner = self.lock();
        if inner.deleted {
            return Err(Error::NotFound(format!("process {}", self.id)));
        }
        match &inner.io {
            Some(io) => io.resize(width, height),
            None => Err(Error::FailedPrecondition(format!(
                "process {} has no terminal",
                self.id
            ))),
        }
    }

    pub fn close_io(&self) -> Result<()> {
        let inner = self.lock();
        if inner.deleted {
            return Err(Error::NotFound(format!("process {}", self.id)));
        }
        if let Some(io) = &inner.io {
            io.close_stdin();
        }
        Ok(())
    }

    /// Release the process. A second delete fails with not found.
    pub async fn delete(&self) -> Result<ExitInfo> {
        let _guard = self.op_lock.lock().await;
        let (pid, status, exit) = {
            let inner = self.lock();
            if inner.deleted {
                return Err(Error::NotFound(format!("process {}", self.id)));
            }
            (inner.pid, inner.status, inner.exit)
        };

        match (self.kind, status) {
            (_, Status::Stopped) => {}
            (ProcessKind::Init, Status::Created) => {}
            (ProcessKind::Exec, Status::Created) if pid == 0 => {}
            (_, status) => {
                return Err(Error::FailedPrecondition(format!(
                    "process {} must be stopped before deletion, current state {status:?}",
                    self.id
                )));
            }
        }

        if self.kind == ProcessKind::Init {
            self.runtime
                .delete(&self.container_id, status == Status::Created)
                .await
                .map_err(|e| Error::runtime("delete", &self.container_id, e))?;
        } else {
            let _ = tokio::fs::remove_file(self.bundle.join(format!("{}.json", self.id))).await;
        }
        let _ = tokio::fs::remove_file(self.pid_file()).await;

        let mut inner = self.lock();
        inner.deleted = true;
        inner.io = None;
        Ok(exit.unwrap_or(ExitInfo {
            pid,
            status: 0,
            exited_at: Utc::now(),
        }))
    }

    fn ensure_init(&self, op: &str) -> Result<()> {
        if self.kind != ProcessKind::Init {
            return Err(Error::FailedPrecondition(format!(
                "{op} is only supported for the init process"
            )));
        }
        self.ensure_not_deleted()
    }

    pub async fn pause(&self) -> Result<()> {
        self.ensure_init("pause")?;
        let _guard = self.op_lock.lock().await;
        {
            let mut inner = self.lock();
            if inner.status != Status::Running {
                return Err(Error::FailedPrecondition(format!(
                    "cannot pause container in state {:?}",
                    inner.status
                )));
            }
            inner.status = Status::Pausing;
        }

        let result = self.runtime.pause(&self.container_id).await;
        let mut inner = self.lock();
        match result {
            Ok(()) => {
                if inner.status == Status::Pausing {
                    inner.status = Status::Paused;
                }
                Ok(())
            }
            Err(e) => {
                if inner.status == Status::Pausing {
                    inner.status = Status::Running;
                }
                Err(Error::runtime("pause", &self.container_id, e))
            }
        }
    }

    pub async fn resume(&self) -> Result<()> {
        self.ensure_init("resume")?;
        let _guard = self.op_lock.lock().await;
        if self.status() != Status::Paused {
            return Err(Error::FailedPrecondition(format!(
                "cannot resume container in state {:?}",
                self.status()
            )));
        }
        self.runtime
            .resume(&self.container_id)
            .await
            .map_err(|e| Error::runtime("resume", &self.container_id, e))?;
        let mut inner = self.lock();
        if inner.status == Status::Paused {
            inner.status = Status::Running;
        }
        Ok(())
    }

    pub async fn update(&self, resources: &[u8]) -> Result<()> {
        self.ensure_init("update")?;
        if self.status() == Status::Stopped {
            return Err(Error::FailedPrecondition(format!(
                "container {} is stopped",
                self.container_id
            )));
        }
        self.runtime
            .update(&self.container_id, resources)
            .await
            .map_err(|e| Error::runtime("update", &self.container_id, e))
    }

    pub async fn checkpoint(&self, image_path: &Path, exit: bool) -> Result<()> {
        self.ensure_init("checkpoint")?;
        let _guard = self.op_lock.lock().await;
        match self.status() {
            Status::Running | Status::Paused => {}
            status => {
                return Err(Error::FailedPrecondition(format!(
                    "cannot checkpoint container in state {status:?}"
                )));
            }
        }
        self.runtime
            .checkpoint(&self.container_id, image_path, !exit)
            .await
            .map_err(|e| Error::runtime("checkpoint", &self.container_id, e))
    }

    pub fn snapshot(&self) -> ProcessState {
        let inner = self.lock();
        ProcessState {
            id: self.id.clone(),
            pid: inner.pid,
            status: inner.status,
            stdio: self.stdio.clone(),
            exit_status: inner.exit.map(|e| e.status).unwrap_or_default(),
            exited_at: inner.exit.map(|e| e.exited_at),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI32, Ordering};

    /// Runtime that hands out increasing PIDs and records calls.
    #[derive(Default)]
    pub(crate) struct RecordingRuntime {
        next_pid: AtomicI32,
        pub calls: Mutex<Vec<String>>,
    }

    impl RecordingRuntime {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl OciRuntime for RecordingRuntime {
        async fn create(
            &self,
            id: &str,
            _bundle: &Path,
            _opts: &CreateOpts,
            _stdio: ProcessStdio,
        ) -> std::result::Result<i32, RuntimeError> {
            self.record(format!("create {id}"));
            Ok(100 + self.next_pid.fetch_add(1, Ordering::SeqCst))
        }
        async fn start(&self, id: &str) -> std::result::Result<(), RuntimeError> {
            self.record(format!("start {id}"));
            Ok(())
        }
        async fn exec(
            &self,
            id: &str,
            _spec: &[u8],
            _opts: &ExecOpts,
            _stdio: ProcessStdio,
        ) -> std::result::Result<i32, RuntimeError> {
            self.record(format!("exec {id}"));
            Ok(200 + self.next_pid.fetch_add(1, Ordering::SeqCst))
        }
        async fn kill(&self, id: &str, signal: i32, all: bool) -> std::result::Result<(), RuntimeError> {
            self.record(format!("kill {id} {signal} {all}"));
            Ok(())
        }
        async fn delete(&self, id: &str, force: bool) -> std::result::Result<(), RuntimeError> {
            self.record(format!("delete {id} {force}"));
            Ok(())
        }
        async fn pause(&self, id: &str) -> std::result::Result<(), RuntimeError> {
            self.record(format!("pause {id}"));
            Ok(())
        }
        async fn resume(&self, id: &str) -> std::result::Result<(), RuntimeError> {
            self.record(format!("resume {id}"));
            Ok(())
        }
        async fn ps(&self, _id: &str) -> std::result::Result<Vec<i32>, RuntimeError> {
            Ok(Vec::new())
        }
        async fn update(&self, id: &str, _resources: &[u8]) -> std::result::Result<(), RuntimeError> {
            self.record(format!("update {id}"));
            Ok(())
        }
        async fn checkpoint(
            &self,
            id: &str,
            _image_path: &Path,
            leave_running: bool,
        ) -> std::result::Result<(), RuntimeError> {
            self.record(format!("checkpoint {id} {leave_running}"));
            Ok(())
        }
    }

    fn init(runtime: Arc<RecordingRuntime>) -> Arc<Process> {
        Process::new_init(
            "c1",
            Path::new("/nonexistent/bundle"),
            Stdio::default(),
            RuntimeOptions::default(),
            runtime,
        )
    }

    #[tokio::test]
    async fn test_init_lifecycle() {
        let runtime = Arc::new(RecordingRuntime::default());
        let process = init(Arc::clone(&runtime));

        let pid = process.create(None).await.unwrap();
        assert_eq!(process.status(), Status::Created);
        assert_eq!(process.start().await.unwrap(), pid);
        assert_eq!(process.status(), Status::Running);

        // Second start is an illegal transition.
        assert!(matches!(process.start().await, Err(Error::FailedPrecondition(_))));

        process.set_exited(3, Utc::now());
        assert_eq!(process.status(), Status::Stopped);
        assert_eq!(process.wait().await.unwrap().status, 3);

        let exit = process.delete().await.unwrap();
        assert_eq!(exit.status, 3);
        assert_eq!(exit.pid, pid);
        assert!(matches!(process.delete().await, Err(Error::NotFound(_))));
        assert!(matches!(process.close_io(), Err(Error::NotFound(_))));
        assert!(matches!(process.resize(80, 24), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_running_fails() {
        let process = init(Arc::new(RecordingRuntime::default()));
        process.create(None).await.unwrap();
        process.start().await.unwrap();
        assert!(matches!(process.delete().await, Err(Error::FailedPrecondition(_))));
    }

    #[tokio::test]
    async fn test_waiters_all_released() {
        let process = init(Arc::new(RecordingRuntime::default()));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let process = Arc::clone(&process);
                tokio::spawn(async move { process.wait().await.unwrap().status })
            })
            .collect();
        tokio::task::yield_now().await;

        process.set_exited(9, Utc::now());
        // A second exit report is ignored.
        process.set_exited(1, Utc::now());
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), 9);
        }
    }

    #[tokio::test]
    async fn test_pause_resume_state_machine() {
        let runtime = Arc::new(RecordingRuntime::default());
        let process = init(Arc::clone(&runtime));
        process.create(None).await.unwrap();

        assert!(matches!(process.pause().await, Err(Error::FailedPrecondition(_))));
        process.start().await.unwrap();
        process.pause().await.unwrap();
        assert_eq!(process.status(), Status::Paused);
        assert!(matches!(process.pause().await, Err(Error::FailedPrecondition(_))));
        process.resume().await.unwrap();
        assert_eq!(process.status(), Status::Running);

        let calls = runtime.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["create c1", "start c1", "pause c1", "resume c1"]);
    }

    #[tokio::test]
    async fn test_exec_rejects_init_only_operations() {
        let runtime = Arc::new(RecordingRuntime::default());
        let exec = Process::new_exec(
            "e1",
            "c1",
            Path::new("/nonexistent/bundle"),
            Stdio::default(),
            b"{}".to_vec(),
            RuntimeOptions::default(),
            runtime,
        );
        assert_eq!(exec.exec_id(), "e1");
        assert!(matches!(exec.pause().await, Err(Error::FailedPrecondition(_))));
        assert!(matches!(exec.update(b"{}").await, Err(Error::FailedPrecondition(_))));
        assert!(matches!(exec.kill(15, false).await, Err(Error::FailedPrecondition(_))));
    }

    #[tokio::test]
    async fn test_kill_stopped_process_is_not_found() {
        let process = init(Arc::new(RecordingRuntime::default()));
        process.create(None).await.unwrap();
        process.start().await.unwrap();
        process.set_exited(0, Utc::now());
        assert!(matches!(process.kill(9, false).await, Err(Error::NotFound(_))));
    }
}
