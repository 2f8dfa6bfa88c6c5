//! Child process reaping for the shim.
//!
//! The shim is a child subreaper: every process it launches (the OCI runtime
//! binary, container init and exec processes re-parented to it) is reaped
//! here with `waitpid(-1, WNOHANG)` on each `SIGCHLD`. Reaped exits are
//! fanned out to every live [`Subscription`].
//!
//! Commands the shim runs itself must go through [`Reaper::run`] instead of
//! `wait()`, because the reap loop would otherwise steal their exit status.

use chrono::{DateTime, Utc};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::io::{self, Read};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

const SUBSCRIBER_CAPACITY: usize = 256;

/// A reaped child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    pub pid: i32,
    pub status: i32,
    pub timestamp: DateTime<Utc>,
}

impl Exit {
    pub fn new(pid: i32, status: i32) -> Self {
        Self {
            pid,
            status,
            timestamp: Utc::now(),
        }
    }
}

/// Fan-out of reaped exits.
pub struct Reaper {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Exit>>>,
    next_id: AtomicU64,
}

/// Receiving end of a reaper subscription. Unsubscribes on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Exit>,
    reaper: Arc<Reaper>,
}

/// Output of a command run under the reaper.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

impl Reaper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a new exit subscriber.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, tx);
        Subscription {
            id,
            rx,
            reaper: Arc::clone(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::Sender<Exit>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver an exit to every subscriber.
    ///
    /// A full subscriber queue blocks the caller until it drains.
    pub async fn notify(&self, exit: Exit) {
        let subscribers: Vec<(u64, mpsc::Sender<Exit>)> = self
            .lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        for (id, tx) in subscribers {
            if tx.send(exit).await.is_err() {
                self.unsubscribe(id);
            }
        }
    }

    /// Start the SIGCHLD driven reap loop.
    pub fn spawn_sigchld_loop(self: &Arc<Self>) -> io::Result<JoinHandle<()>> {
        let mut sigchld = signal(SignalKind::child())?;
        let reaper = Arc::clone(self);

        Ok(tokio::spawn(async move {
            loop {
                for exit in reap_children() {
                    reaper.notify(exit).await;
                }
                if sigchld.recv().await.is_none() {
                    warn!("SIGCHLD stream closed, reaper stopping");
                    break;
                }
            }
        }))
    }

    /// Spawn `cmd` and wait for it through the reaper.
    ///
    /// Piped stdout/stderr are collected; other stdio is left as configured.
    pub async fn run(self: &Arc<Self>, mut cmd: Command) -> io::Result<CommandOutput> {
        let mut subscription = self.subscribe();
        let mut child = cmd.spawn()?;
        let pid = child.id() as i32;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::task::spawn_blocking(move || read_all(stdout));
        let stderr_task = tokio::task::spawn_blocking(move || read_all(stderr));

        let status = subscription.wait_for(pid).await.ok_or_else(|| {
            io::Error::other(format!("reaper closed before pid {pid} exited"))
        })?;

        let stdout = stdout_task.await.map_err(io::Error::other)??;
        let stderr = stderr_task.await.map_err(io::Error::other)??;

        Ok(CommandOutput {
            status,
            stdout,
            stderr,
        })
    }
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Exit> {
        self.rx.recv().await
    }

    /// Wait until `pid` is reaped and return its exit status.
    pub async fn wait_for(&mut self, pid: i32) -> Option<i32> {
        while let Some(exit) = self.rx.recv().await {
            if exit.pid == pid {
                return Some(exit.status);
            }
        }
        None
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.reaper.unsubscribe(self.id);
    }
}

fn read_all<R: Read>(source: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut source) = source {
        source.read_to_end(&mut buf)?;
    }
    Ok(buf)
}

/// Exit status as reported to clients: the exit code, or 128 + signal.
pub fn exit_code(status: WaitStatus) -> Option<(i32, i32)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid.as_raw(), code)),
        WaitStatus::Signaled(pid, signal, _) => Some((pid.as_raw(), 128 + signal as i32)),
        _ => None,
    }
}

/// Reap all exited children without blocking.
pub fn reap_children() -> Vec<Exit> {
    let mut exits = Vec::new();
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some((pid, code)) = exit_code(status) {
                    debug!(pid, status = code, "Reaped child");
                    exits.push(Exit::new(pid, code));
                }
            }
            Err(nix::errno::Errno::ECHILD) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                error!(error = %e, "waitpid failed");
                break;
            }
        }
    }
    exits
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let reaper = Reaper::new();
        let mut a = reaper.subscribe();
        let mut b = reaper.subscribe();

        reaper.notify(Exit::new(42, 1)).await;

        assert_eq!(a.recv().await.unwrap().pid, 42);
        assert_eq!(b.recv().await.unwrap().status, 1);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_removed() {
        let reaper = Reaper::new();
        let sub = reaper.subscribe();
        assert_eq!(reaper.lock().len(), 1);
        drop(sub);
        assert!(reaper.lock().is_empty());

        // Nobody listening: must not block.
        reaper.notify(Exit::new(1, 0)).await;
    }

    #[tokio::test]
    async fn test_wait_for_skips_other_pids() {
        let reaper = Reaper::new();
        let mut sub = reaper.subscribe();

        reaper.notify(Exit::new(10, 3)).await;
        reaper.notify(Exit::new(11, 7)).await;

        assert_eq!(sub.wait_for(11).await, Some(7));
    }

    #[test]
    fn test_exit_code_for_signal() {
        let pid = Pid::from_raw(5);
        assert_eq!(
            exit_code(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some((5, 137))
        );
        assert_eq!(exit_code(WaitStatus::Exited(pid, 3)), Some((5, 3)));
        assert_eq!(exit_code(WaitStatus::StillAlive), None);
    }
}
