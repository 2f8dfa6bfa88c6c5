//! Task Service - containers and processes hosted by this shim.
//!
//! Every RPC lands here through [`api::TaskApiHandler`]. Create, start and
//! delete run on their own tokio task so that their bookkeeping completes
//! even when the calling RPC is dropped.

pub mod api;
mod lifecycle;

pub use api::TaskApiHandler;

use crate::config::RuntimeOptions;
use crate::container::{Container, ExecConfig, ExitInfo, Process, ProcessState, Stdio};
use crate::error::{Error, Result};
use crate::oci;
use crate::proto::{
    CreateTaskRequest, ExecProcessRequest, TaskCheckpointed, TaskCreate, TaskDelete, TaskExecAdded,
    TaskExecStarted, TaskPaused, TaskResumed, TaskStart, envelope::Event,
};
use crate::runtime::RuntimeProvider;
use crate::services::events::{EventPublisher, timestamp};
use crate::utils::cgroup::{Cgroup, CgroupMode, CgroupOps, DEFAULT_ROOT};
use crate::utils::oom::OomWatcher;
use crate::utils::reaper::{Reaper, Subscription};
use lifecycle::Lifecycle;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Locates container cgroups from their init PID.
#[derive(Debug, Clone)]
pub struct CgroupAdapter {
    root: PathBuf,
    proc_root: PathBuf,
}

impl Default for CgroupAdapter {
    fn default() -> Self {
        Self::new(Path::new(DEFAULT_ROOT), Path::new("/proc"))
    }
}

impl CgroupAdapter {
    pub fn new(root: &Path, proc_root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            proc_root: proc_root.to_path_buf(),
        }
    }

    pub fn load(&self, pid: i32) -> Result<Cgroup> {
        Ok(Cgroup::for_pid_in(&self.root, &self.proc_root, pid as u32)?)
    }

    pub fn mode(&self) -> CgroupMode {
        crate::utils::cgroup::mode(&self.root)
    }
}

/// Response data of `Pids`: a PID and the exec it belongs to, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidInfo {
    pub pid: i32,
    pub exec_id: Option<String>,
}

pub struct TaskService {
    namespace: String,
    provider: Arc<dyn RuntimeProvider>,
    cgroups: CgroupAdapter,
    publisher: EventPublisher,
    oom: OomWatcher,
    containers: Mutex<HashMap<String, Arc<Container>>>,
    /// Held by Create and Shutdown so a shutdown cannot race a new container.
    create_lock: tokio::sync::Mutex<()>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    shutdown: watch::Sender<bool>,
}

impl TaskService {
    /// Build the service and start attributing exits from `reaper`.
    pub fn new(
        namespace: &str,
        reaper: &Arc<Reaper>,
        provider: Arc<dyn RuntimeProvider>,
        cgroups: CgroupAdapter,
        publisher: EventPublisher,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let service = Arc::new(Self {
            namespace: namespace.to_string(),
            provider,
            cgroups,
            oom: OomWatcher::new(publisher.clone()),
            publisher,
            containers: Mutex::new(HashMap::new()),
            create_lock: tokio::sync::Mutex::new(()),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            shutdown,
        });

        let exits = reaper.subscribe();
        tokio::spawn(Self::process_exits(Arc::downgrade(&service), exits));
        service
    }

    async fn process_exits(service: Weak<Self>, mut exits: Subscription) {
        while let Some(exit) = exits.recv().await {
            let Some(service) = service.upgrade() else {
                break;
            };
            service.process_exit(exit).await;
        }
        debug!("Exit processing stopped");
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Resolves once a honoured `Shutdown` has been received.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn containers(&self) -> MutexGuard<'_, HashMap<String, Arc<Container>>> {
        self.containers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn container(&self, id: &str) -> Result<Arc<Container>> {
        self.containers()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("container {id}")))
    }

    pub fn container_count(&self) -> usize {
        self.containers().len()
    }

    async fn publish(&self, event: Event) {
        self.publisher.publish(event).await;
    }

    /// Run `fut` to completion even if the caller goes away.
    async fn detached<T, F>(fut: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        tokio::spawn(fut)
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    /// Create a container and its (not yet started) init process.
    pub async fn create(self: &Arc<Self>, req: CreateTaskRequest) -> Result<i32> {
        let service = Arc::clone(self);
        Self::detached(async move { service.do_create(req).await }).await
    }

    async fn do_create(&self, req: CreateTaskRequest) -> Result<i32> {
        let _guard = self.create_lock.lock().await;
        if req.id.is_empty() {
            return Err(Error::InvalidArgument("container id is empty".to_string()));
        }
        if self.containers().contains_key(&req.id) {
            return Err(Error::AlreadyExists(format!("container {}", req.id)));
        }
        info!(id = %req.id, bundle = %req.bundle, "Creating container");

        let subscriber = self.lifecycle.lock().await.pre_start(None);
        let (container, init) = match self.new_container(&req).await {
            Ok(created) => created,
            Err(e) => {
                self.lifecycle.lock().await.cancel(subscriber);
                return Err(e);
            }
        };

        let pid = init.pid();
        self.containers()
            .insert(req.id.clone(), Arc::clone(&container));
        self.publish(Event::TaskCreate(TaskCreate {
            container_id: req.id.clone(),
            bundle: req.bundle.clone(),
            terminal: req.terminal,
            stdin: req.stdin.clone(),
            stdout: req.stdout.clone(),
            stderr: req.stderr.clone(),
            checkpoint: req.checkpoint.clone(),
            pid: pid as u32,
        }))
        .await;

        self.handle_started(subscriber, &container, Some(&init), false)
            .await;
        Ok(pid)
    }

    async fn new_container(&self, req: &CreateTaskRequest) -> Result<(Arc<Container>, Arc<Process>)> {
        let bundle = PathBuf::from(&req.bundle);
        let options = RuntimeOptions::load(&bundle)?;
        let runtime = self.provider.runtime(&options, &bundle);
        let container = Container::new(
            &req.id,
            &bundle,
            options,
            runtime,
            oci::should_kill_all_on_exit(&bundle),
        );

        let stdio = Stdio {
            stdin: req.stdin.clone(),
            stdout: req.stdout.clone(),
            stderr: req.stderr.clone(),
            terminal: req.terminal,
        };
        let checkpoint = (!req.checkpoint.is_empty()).then(|| PathBuf::from(&req.checkpoint));
        let pid = container.create_init(stdio, checkpoint).await?;

        match self.cgroups.load(pid) {
            Ok(cgroup) => container.set_cgroup(cgroup),
            Err(e) => warn!(id = %req.id, pid, error = %e, "Failed to load container cgroup"),
        }
        let init = container.init()?;
        Ok((container, init))
    }

    /// Start the init process (empty `exec_id`) or an exec process.
    pub async fn start(self: &Arc<Self>, id: &str, exec_id: &str) -> Result<i32> {
        let service = Arc::clone(self);
        let (id, exec_id) = (id.to_string(), exec_id.to_string());
        Self::detached(async move { service.do_start(&id, &exec_id).await }).await
    }

    async fn do_start(&self, id: &str, exec_id: &str) -> Result<i32> {
        let container = self.container(id)?;
        let exec = !exec_id.is_empty();

        let subscriber = {
            let mut lifecycle = self.lifecycle.lock().await;
            if exec {
                lifecycle.add_pending_exec(id);
                lifecycle.pre_start(None)
            } else {
                lifecycle.pre_start(Some(&container))
            }
        };

        let process = match container.process(exec_id) {
            Ok(process) => process,
            Err(e) => {
                self.handle_started(subscriber, &container, None, exec).await;
                return Err(e);
            }
        };

        let pid = match process.start().await {
            Ok(pid) => pid,
            Err(e) => {
                self.handle_started(subscriber, &container, Some(&process), exec)
                    .await;
                return Err(e);
            }
        };

        if exec {
            info!(id = %id, exec_id = %exec_id, pid, "Exec process started");
            self.publish(Event::TaskExecStarted(TaskExecStarted {
                container_id: id.to_string(),
                exec_id: exec_id.to_string(),
                pid: pid as u32,
            }))
            .await;
        } else {
            info!(id = %id, pid, "Container started");
            self.watch_cgroup(&container);
            self.publish(Event::TaskStart(TaskStart {
                container_id: id.to_string(),
                pid: pid as u32,
            }))
            .await;
        }

        self.handle_started(subscriber, &container, Some(&process), exec)
            .await;
        Ok(pid)
    }

    /// Enable all controllers for the container and watch it for OOM kills.
    fn watch_cgroup(&self, container: &Container) {
        let Some(cgroup) = container.cgroup() else {
            return;
        };
        if let Cgroup::V2(cg) = &cgroup {
            match cg.root_controllers() {
                Ok(controllers) => {
                    if let Err(e) = cg.toggle_controllers(&controllers, true) {
                        warn!(id = %container.id(), error = %e, "Failed to enable cgroup controllers");
                    }
                }
                Err(e) => warn!(id = %container.id(), error = %e, "Failed to read root controllers"),
            }
        }
        if let Err(e) = self.oom.add(container.id(), &cgroup) {
            warn!(id = %container.id(), error = %e, "OOM monitoring unavailable");
        }
    }

    /// Delete the init process (and with it the container) or an exec.
    pub async fn delete(self: &Arc<Self>, id: &str, exec_id: &str) -> Result<ExitInfo> {
        let service = Arc::clone(self);
        let (id, exec_id) = (id.to_string(), exec_id.to_string());
        Self::detached(async move { service.do_delete(&id, &exec_id).await }).await
    }

    async fn do_delete(&self, id: &str, exec_id: &str) -> Result<ExitInfo> {
        let container = self.container(id)?;
        if !exec_id.is_empty() {
            return container.delete_process(exec_id).await;
        }

        if let Some(exec) = container
            .processes()
            .into_iter()
            .find(|p| p.status() == crate::container::Status::Running)
        {
            return Err(Error::FailedPrecondition(format!(
                "exec process {} of container {id} is still running",
                exec.id()
            )));
        }

        let exit = container.delete_process("").await?;
        self.containers().remove(id);
        self.oom.remove(id);
        info!(id = %id, status = exit.status, "Container deleted");

        self.publish(Event::TaskDelete(TaskDelete {
            container_id: id.to_string(),
            pid: exit.pid as u32,
            exit_status: exit.status as u32,
            exited_at: Some(timestamp(exit.exited_at)),
            id: id.to_string(),
        }))
        .await;
        Ok(exit)
    }

    /// Delete an exec process.
    pub async fn delete_process(self: &Arc<Self>, id: &str, exec_id: &str) -> Result<ExitInfo> {
        if exec_id.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot delete the init process with DeleteProcess".to_string(),
            ));
        }
        self.delete(id, exec_id).await
    }

    /// Add an exec process to a container. It is started with `start`.
    pub async fn exec(&self, req: ExecProcessRequest) -> Result<()> {
        let container = self.container(&req.id)?;
        if req.exec_id.is_empty() {
            return Err(Error::InvalidArgument("exec id is empty".to_string()));
        }
        let reservation = container
            .reserve_process(&req.exec_id)
            .ok_or_else(|| Error::AlreadyExists(format!("id {}", req.exec_id)))?;

        let config = ExecConfig {
            stdio: Stdio {
                stdin: req.stdin,
                stdout: req.stdout,
                stderr: req.stderr,
                terminal: req.terminal,
            },
            spec: req.spec,
        };
        container.exec(reservation, config)?;
        debug!(id = %req.id, exec_id = %req.exec_id, "Exec process added");

        self.publish(Event::TaskExecAdded(TaskExecAdded {
            container_id: req.id,
            exec_id: req.exec_id,
        }))
        .await;
        Ok(())
    }

    pub async fn state(&self, id: &str, exec_id: &str) -> Result<(ProcessState, PathBuf)> {
        let container = self.container(id)?;
        let process = container.process(exec_id)?;
        Ok((process.snapshot(), container.bundle().to_path_buf()))
    }

    pub async fn kill(&self, id: &str, exec_id: &str, signal: u32, all: bool) -> Result<()> {
        let container = self.container(id)?;
        let process = container.process(exec_id)?;
        info!(id = %id, exec_id = %exec_id, signal, all, "Killing process");
        process.kill(signal as i32, all).await
    }

    pub async fn resize_pty(&self, id: &str, exec_id: &str, width: u32, height: u32) -> Result<()> {
        self.container(id)?.process(exec_id)?.resize(width, height)
    }

    pub async fn close_io(&self, id: &str, exec_id: &str) -> Result<()> {
        self.container(id)?.process(exec_id)?.close_io()
    }

    /// Block until the process has exited.
    pub async fn wait(&self, id: &str, exec_id: &str) -> Result<ExitInfo> {
        let process = self.container(id)?.process(exec_id)?;
        process.wait().await
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        self.container(id)?.init()?.pause().await?;
        self.publish(Event::TaskPaused(TaskPaused {
            container_id: id.to_string(),
        }))
        .await;
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        self.container(id)?.init()?.resume().await?;
        self.publish(Event::TaskResumed(TaskResumed {
            container_id: id.to_string(),
        }))
        .await;
        Ok(())
    }

    pub async fn checkpoint(&self, id: &str, path: &str, exit: bool) -> Result<()> {
        if path.is_empty() {
            return Err(Error::InvalidArgument("checkpoint path is empty".to_string()));
        }
        self.container(id)?
            .init()?
            .checkpoint(Path::new(path), exit)
            .await?;
        self.publish(Event::TaskCheckpointed(TaskCheckpointed {
            container_id: id.to_string(),
            checkpoint: path.to_string(),
        }))
        .await;
        Ok(())
    }

    pub async fn update(&self, id: &str, resources: &[u8]) -> Result<()> {
        self.container(id)?.init()?.update(resources).await
    }

    /// PIDs inside the container, annotated with their exec IDs.
    pub async fn pids(&self, id: &str) -> Result<Vec<PidInfo>> {
        let container = self.container(id)?;
        let pids = container
            .runtime()
            .ps(id)
            .await
            .map_err(|e| Error::runtime("ps", id, e))?;
        Ok(pids
            .into_iter()
            .map(|pid| PidInfo {
                pid,
                exec_id: container.exec_id_of(pid),
            })
            .collect())
    }

    /// Serialized cgroup metrics of the container.
    pub async fn stats(&self, id: &str) -> Result<Vec<u8>> {
        let container = self.container(id)?;
        let cgroup = container.cgroup().ok_or_else(|| {
            Error::FailedPrecondition(format!("container {id} has no cgroup"))
        })?;
        let metrics = cgroup.stat()?;
        Ok(serde_json::to_vec(&metrics)?)
    }

    /// Shim PID and the task's init PID (0 if unknown).
    pub fn connect(&self, id: &str) -> (u32, u32) {
        let task_pid = self.container(id).map(|c| c.pid()).unwrap_or(0);
        (std::process::id(), task_pid as u32)
    }

    /// Stop the shim, unless it still hosts containers.
    pub async fn shutdown(&self) -> bool {
        let _guard = self.create_lock.lock().await;
        if self.container_count() > 0 {
            debug!("Ignoring shutdown, containers remain");
            return false;
        }
        info!("Shutting down shim");
        self.shutdown.send_replace(true);
        true
    }
}
