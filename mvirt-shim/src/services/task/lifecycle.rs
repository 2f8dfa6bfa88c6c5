//! Exit reconciliation.
//!
//! Exits arrive from the reaper keyed only by PID, possibly while the call
//! that starts that PID is still in flight. [`Lifecycle`] holds the three
//! structures that attribute them, all behind the service's lifecycle lock:
//!
//! - `running`: PID → processes that have been started and not yet exited.
//! - `pending_execs`: container → exec starts still in flight. While
//!   non-zero, the container's init exit is held back so that every exec's
//!   start is published before the init's exit.
//! - `exit_subscribers`: per-start buffers that see every exit while the
//!   start is in flight.

use super::TaskService;
use crate::container::{Container, Process};
use crate::proto::{TaskExit, envelope::Event};
use crate::services::events::timestamp;
use crate::utils::reaper::Exit;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A started process and the container it belongs to.
#[derive(Clone)]
pub(crate) struct ContainerProcess {
    pub container: Arc<Container>,
    pub process: Arc<Process>,
}

impl ContainerProcess {
    fn belongs_to(&self, container: &Arc<Container>) -> bool {
        Arc::ptr_eq(&self.container, container)
    }
}

/// Handle to a start registered with [`Lifecycle::pre_start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Subscriber(u64);

/// Exits to resolve once a start has been accounted for.
#[derive(Default)]
pub(crate) struct Started {
    /// Exits of the started process that arrived during the start.
    pub exits: Vec<Exit>,
    /// Init exits held back for this container, replayed after `exits`.
    pub init_exits: Vec<Exit>,
    pub init_processes: Vec<ContainerProcess>,
}

#[derive(Default)]
pub(crate) struct Lifecycle {
    running: HashMap<i32, Vec<ContainerProcess>>,
    pending_execs: HashMap<String, usize>,
    /// Init exits held back per container until its pending execs resolve.
    held_exits: HashMap<String, Vec<Exit>>,
    exit_subscribers: HashMap<u64, HashMap<i32, Vec<Exit>>>,
    next_subscriber: u64,
}

impl Lifecycle {
    /// Register a start. For an init start, forget the container's previous
    /// `running` entry so an exit during the start is buffered instead.
    pub fn pre_start(&mut self, init_of: Option<&Arc<Container>>) -> Subscriber {
        self.next_subscriber += 1;
        let id = self.next_subscriber;
        self.exit_subscribers.insert(id, HashMap::new());

        if let Some(container) = init_of {
            let pid = container.pid();
            if let Some(entries) = self.running.remove(&pid) {
                let others: Vec<_> = entries
                    .into_iter()
                    .filter(|cp| !cp.belongs_to(container))
                    .collect();
                if !others.is_empty() {
                    self.running.insert(pid, others);
                }
            }
        }
        Subscriber(id)
    }

    /// Drop a start that never reached the runtime.
    pub fn cancel(&mut self, subscriber: Subscriber) {
        self.exit_subscribers.remove(&subscriber.0);
    }

    pub fn add_pending_exec(&mut self, container_id: &str) {
        *self.pending_execs.entry(container_id.to_string()).or_default() += 1;
    }

    pub fn pending_execs(&self, container_id: &str) -> usize {
        self.pending_execs.get(container_id).copied().unwrap_or(0)
    }

    /// Account for a finished start (successful or not).
    ///
    /// If the process already exited its exits are returned; otherwise it
    /// is registered as running. When the last pending exec of a container
    /// resolves, held back init exits are returned too.
    pub fn started(
        &mut self,
        subscriber: Subscriber,
        container: &Arc<Container>,
        process: Option<&Arc<Process>>,
        exec: bool,
    ) -> Started {
        let pid = process.map(|p| p.pid()).unwrap_or(0);
        let mut exits = self
            .exit_subscribers
            .remove(&subscriber.0)
            .unwrap_or_default();
        let mut started = Started::default();

        if exec {
            let remaining = match self.pending_execs.get_mut(container.id()) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => 0,
            };
            if remaining == 0 {
                self.pending_execs.remove(container.id());
                if let Some(held) = self.held_exits.remove(container.id()) {
                    started.init_exits = held;
                    started.init_processes = self.take_running_of(container.pid(), container);
                }
            }
        }

        if let Some(process) = process.filter(|_| pid != 0) {
            match exits.remove(&pid) {
                Some(own) => started.exits = own,
                None => self.running.entry(pid).or_default().push(ContainerProcess {
                    container: Arc::clone(container),
                    process: Arc::clone(process),
                }),
            }
        }
        started
    }

    /// Record a reaped exit. Returns the processes to resolve now; init
    /// processes of containers with pending execs stay in `running`.
    pub fn exited(&mut self, exit: Exit) -> Vec<ContainerProcess> {
        for buffer in self.exit_subscribers.values_mut() {
            buffer.entry(exit.pid).or_default().push(exit);
        }

        let Some(entries) = self.running.remove(&exit.pid) else {
            return Vec::new();
        };
        let (skipped, resolved): (Vec<_>, Vec<_>) = entries.into_iter().partition(|cp| {
            cp.process.is_init() && self.pending_execs(cp.container.id()) > 0
        });
        if !skipped.is_empty() {
            debug!(pid = exit.pid, "Holding back init exit until pending execs resolve");
            for cp in &skipped {
                self.held_exits
                    .entry(cp.container.id().to_string())
                    .or_default()
                    .push(exit);
            }
            self.running.insert(exit.pid, skipped);
        }
        resolved
    }

    fn take_running_of(&mut self, pid: i32, container: &Arc<Container>) -> Vec<ContainerProcess> {
        let Some(entries) = self.running.remove(&pid) else {
            return Vec::new();
        };
        let (mine, others): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|cp| cp.belongs_to(container));
        if !others.is_empty() {
            self.running.insert(pid, others);
        }
        mine
    }

    #[cfg(test)]
    pub fn is_running(&self, pid: i32) -> bool {
        self.running.contains_key(&pid)
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.exit_subscribers.len()
    }
}

impl TaskService {
    /// Resolve an exit: kill what is left of the container if init died,
    /// record the exit and publish it.
    ///
    /// The runtime's `kill --all` is reaped through the same exit loop that
    /// calls this, so it runs on its own task and the init exit is recorded
    /// and published once it returns.
    pub(super) async fn handle_process_exit(
        &self,
        exit: Exit,
        container: &Arc<Container>,
        process: &Arc<Process>,
    ) {
        let event = exit_event(container, process, exit);
        if process.is_init() && container.kill_all_on_exit() {
            let publisher = self.publisher.clone();
            let process = Arc::clone(process);
            tokio::spawn(async move {
                process.kill_all().await;
                record_exit(&process, exit);
                publisher.publish(event).await;
            });
            return;
        }
        record_exit(process, exit);
        self.publish(event).await;
    }

    /// Finish a start registered with `pre_start`.
    pub(super) async fn handle_started(
        &self,
        subscriber: Subscriber,
        container: &Arc<Container>,
        process: Option<&Arc<Process>>,
        exec: bool,
    ) {
        let started = self
            .lifecycle
            .lock()
            .await
            .started(subscriber, container, process, exec);

        if let Some(process) = process {
            for exit in started.exits {
                self.handle_process_exit(exit, container, process).await;
            }
        }
        for exit in started.init_exits {
            for cp in &started.init_processes {
                self.handle_process_exit(exit, &cp.container, &cp.process).await;
            }
        }
    }

    pub(super) async fn process_exit(&self, exit: Exit) {
        let resolved = self.lifecycle.lock().await.exited(exit);
        for cp in resolved {
            self.handle_process_exit(exit, &cp.container, &cp.process).await;
        }
    }
}

fn record_exit(process: &Process, exit: Exit) {
    process.set_exited(exit.status, exit.timestamp);
    debug!(
        id = %process.container_id(),
        exec_id = %process.exec_id(),
        pid = exit.pid,
        status = exit.status,
        "Process exited"
    );
}

fn exit_event(container: &Container, process: &Process, exit: Exit) -> Event {
    Event::TaskExit(TaskExit {
        container_id: container.id().to_string(),
        id: process.id().to_string(),
        pid: exit.pid as u32,
        exit_status: exit.status as u32,
        exited_at: Some(timestamp(exit.timestamp)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeOptions;
    use crate::container::process::tests::RecordingRuntime;
    use crate::container::{ExecConfig, Stdio};
    use std::path::Path;

    async fn container_with_init() -> (Arc<Container>, Arc<Process>) {
        let container = Container::new(
            "c1",
            Path::new("/nonexistent/bundle"),
            RuntimeOptions::default(),
            Arc::new(RecordingRuntime::default()),
            false,
        );
        container.create_init(Stdio::default(), None).await.unwrap();
        let init = container.init().unwrap();
        (container, init)
    }

    async fn started_exec(container: &Arc<Container>, id: &str) -> Arc<Process> {
        let reservation = container.reserve_process(id).unwrap();
        let exec = container.exec(reservation, ExecConfig::default()).unwrap();
        exec.start().await.unwrap();
        exec
    }

    #[tokio::test]
    async fn test_exit_during_start_is_buffered() {
        let (container, init) = container_with_init().await;
        let mut lc = Lifecycle::default();

        let create = lc.pre_start(None);
        assert!(lc.started(create, &container, Some(&init), false).exits.is_empty());
        assert!(lc.is_running(init.pid()));

        let start = lc.pre_start(Some(&container));
        assert!(!lc.is_running(init.pid()));
        assert!(lc.exited(Exit::new(init.pid(), 1)).is_empty());

        let started = lc.started(start, &container, Some(&init), false);
        assert_eq!(started.exits.len(), 1);
        assert_eq!(started.exits[0].status, 1);
        assert!(!lc.is_running(init.pid()));
        assert_eq!(lc.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_exit_after_start_resolved_from_running() {
        let (container, init) = container_with_init().await;
        let mut lc = Lifecycle::default();

        let start = lc.pre_start(Some(&container));
        assert!(lc.started(start, &container, Some(&init), false).exits.is_empty());

        let resolved = lc.exited(Exit::new(init.pid(), 0));
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].process.is_init());
        assert!(lc.exited(Exit::new(init.pid(), 0)).is_empty());
    }

    #[tokio::test]
    async fn test_init_exit_held_for_pending_exec() {
        let (container, init) = container_with_init().await;
        let mut lc = Lifecycle::default();
        let create = lc.pre_start(None);
        lc.started(create, &container, Some(&init), false);

        lc.add_pending_exec(container.id());
        let exec_start = lc.pre_start(None);
        let exec = started_exec(&container, "e1").await;

        // Init dies while the exec start is in flight: held back.
        assert!(lc.exited(Exit::new(init.pid(), 137)).is_empty());
        assert!(lc.is_running(init.pid()));

        let started = lc.started(exec_start, &container, Some(&exec), true);
        assert!(started.exits.is_empty());
        assert_eq!(started.init_exits.len(), 1);
        assert_eq!(started.init_exits[0].status, 137);
        assert_eq!(started.init_processes.len(), 1);
        assert!(!lc.is_running(init.pid()));
        assert!(lc.is_running(exec.pid()));
        assert_eq!(lc.pending_execs(container.id()), 0);
    }

    #[tokio::test]
    async fn test_only_last_pending_exec_replays_init_exit() {
        let (container, init) = container_with_init().await;
        let mut lc = Lifecycle::default();
        let create = lc.pre_start(None);
        lc.started(create, &container, Some(&init), false);

        lc.add_pending_exec(container.id());
        let first = lc.pre_start(None);
        lc.add_pending_exec(container.id());
        let second = lc.pre_start(None);
        let e1 = started_exec(&container, "e1").await;
        let e2 = started_exec(&container, "e2").await;

        assert!(lc.exited(Exit::new(init.pid(), 1)).is_empty());
        assert!(lc.started(first, &container, Some(&e1), true).init_exits.is_empty());
        assert_eq!(lc.started(second, &container, Some(&e2), true).init_exits.len(), 1);
    }

    #[tokio::test]
    async fn test_exec_registered_after_init_exit_still_replays() {
        let (container, init) = container_with_init().await;
        let mut lc = Lifecycle::default();
        let create = lc.pre_start(None);
        lc.started(create, &container, Some(&init), false);

        lc.add_pending_exec(container.id());
        let first = lc.pre_start(None);
        assert!(lc.exited(Exit::new(init.pid(), 9)).is_empty());

        // Registered after the init exit was seen, and resolves last.
        lc.add_pending_exec(container.id());
        let second = lc.pre_start(None);
        let e1 = started_exec(&container, "e1").await;

        assert!(lc.started(first, &container, Some(&e1), true).init_exits.is_empty());
        let started = lc.started(second, &container, None, true);
        assert_eq!(started.init_exits.len(), 1);
        assert_eq!(started.init_exits[0].status, 9);
        assert_eq!(started.init_processes.len(), 1);
        assert!(!lc.is_running(init.pid()));
    }

    #[tokio::test]
    async fn test_failed_exec_start_releases_pending() {
        let (container, _init) = container_with_init().await;
        let mut lc = Lifecycle::default();

        lc.add_pending_exec(container.id());
        let start = lc.pre_start(None);
        let started = lc.started(start, &container, None, true);
        assert!(started.exits.is_empty());
        assert_eq!(lc.pending_execs(container.id()), 0);
        assert_eq!(lc.subscriber_count(), 0);
    }
}
