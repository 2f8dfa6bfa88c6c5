//! Containers hosted by the shim and their processes.

pub mod io;
pub mod process;

pub use io::Stdio;
pub use process::{ExitInfo, Process, ProcessState, Status};

use crate::config::RuntimeOptions;
use crate::error::{Error, Result};
use crate::runtime::OciRuntime;
use crate::utils::cgroup::Cgroup;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Parameters of a new exec process.
#[derive(Debug, Clone, Default)]
pub struct ExecConfig {
    pub stdio: Stdio,
    /// JSON encoded OCI process spec.
    pub spec: Vec<u8>,
}

#[derive(Default)]
struct Table {
    processes: HashMap<String, Arc<Process>>,
    reserved: HashSet<String>,
}

/// One task inside the shim: an init process plus its execs.
pub struct Container {
    id: String,
    bundle: PathBuf,
    options: RuntimeOptions,
    runtime: Arc<dyn OciRuntime>,
    kill_all_on_exit: bool,
    cgroup: Mutex<Option<Cgroup>>,
    init: Mutex<Option<Arc<Process>>>,
    table: Mutex<Table>,
}

/// An exec ID held until the exec is created or the reservation dropped.
pub struct Reservation {
    id: String,
    container: Arc<Container>,
    committed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.container.table().reserved.remove(&self.id);
        }
    }
}

impl Container {
    pub fn new(
        id: &str,
        bundle: &Path,
        options: RuntimeOptions,
        runtime: Arc<dyn OciRuntime>,
        kill_all_on_exit: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            bundle: bundle.to_path_buf(),
            options,
            runtime,
            kill_all_on_exit,
            cgroup: Mutex::new(None),
            init: Mutex::new(None),
            table: Mutex::new(Table::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bundle(&self) -> &Path {
        &self.bundle
    }

    pub fn runtime(&self) -> &Arc<dyn OciRuntime> {
        &self.runtime
    }

    /// Whether the rest of the container is killed when init exits.
    pub fn kill_all_on_exit(&self) -> bool {
        self.kill_all_on_exit
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create the init process. Returns its PID.
    pub async fn create_init(&self, stdio: Stdio, checkpoint: Option<PathBuf>) -> Result<i32> {
        let init = Process::new_init(
            &self.id,
            &self.bundle,
            stdio,
            self.options.clone(),
            Arc::clone(&self.runtime),
        );
        let pid = init.create(checkpoint).await?;
        *self.init.lock().unwrap_or_else(|p| p.into_inner()) = Some(init);
        Ok(pid)
    }

    pub fn init(&self) -> Result<Arc<Process>> {
        self.init
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| {
                Error::FailedPrecondition(format!("container {} has no init process", self.id))
            })
    }

    pub fn pid(&self) -> i32 {
        self.init().map(|p| p.pid()).unwrap_or_default()
    }

    pub fn set_cgroup(&self, cgroup: Cgroup) {
        *self.cgroup.lock().unwrap_or_else(|p| p.into_inner()) = Some(cgroup);
    }

    pub fn cgroup(&self) -> Option<Cgroup> {
        self.cgroup.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Resolve an exec ID; the empty ID is the init process.
    pub fn process(&self, exec_id: &str) -> Result<Arc<Process>> {
        if exec_id.is_empty() {
            return self.init();
        }
        self.table()
            .processes
            .get(exec_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("process {exec_id}")))
    }

    pub fn processes(&self) -> Vec<Arc<Process>> {
        self.table().processes.values().cloned().collect()
    }

    /// Atomically claim an exec ID. `None` if it is taken or reserved.
    pub fn reserve_process(self: &Arc<Self>, exec_id: &str) -> Option<Reservation> {
        let mut table = self.table();
        if table.processes.contains_key(exec_id) || table.reserved.contains(exec_id) {
            return None;
        }
        table.reserved.insert(exec_id.to_string());
        Some(Reservation {
            id: exec_id.to_string(),
            container: Arc::clone(self),
            committed: false,
        })
    }

    /// Turn a reservation into an exec process.
    pub fn exec(&self, mut reservation: Reservation, config: ExecConfig) -> Result<Arc<Process>> {
        let init = self.init()?;
        if init.status() == Status::Stopped {
            return Err(Error::FailedPrecondition(format!(
                "container {} init process is not running",
                self.id
            )));
        }

        let process = Process::new_exec(
            &reservation.id,
            &self.id,
            &self.bundle,
            config.stdio,
            config.spec,
            self.options.clone(),
            Arc::clone(&self.runtime),
        );

        let mut table = self.table();
        table.reserved.remove(&reservation.id);
        table
            .processes
            .insert(reservation.id.clone(), Arc::clone(&process));
        reservation.committed = true;
        Ok(process)
    }

    /// Whether any process of the container has this PID.
    pub fn has_pid(&self, pid: i32) -> bool {
        if self.pid() == pid {
            return true;
        }
        self.table().processes.values().any(|p| p.pid() == pid)
    }

    /// Exec ID of the process with this PID, if it is one of ours.
    pub fn exec_id_of(&self, pid: i32) -> Option<String> {
        self.table()
            .processes
            .values()
            .find(|p| p.pid() == pid)
            .map(|p| p.id().to_string())
    }

    /// Delete a process. Deleting an exec removes it from the container.
    pub async fn delete_process(&self, exec_id: &str) -> Result<ExitInfo> {
        let process = self.process(exec_id)?;
        let exit = process.delete().await?;
        if !exec_id.is_empty() {
            self.table().processes.remove(exec_id);
        }
        Ok(exit)
    }
}
