//! Shim Manager - launches shims and tracks the shim handle of every task.
//!
//! A task either gets its shim through the bootstrap protocol (the shim
//! binary's `start` subcommand, which may join a running shim of the same
//! group) or, when it names a sandbox, attaches to the sandbox's shim
//! directly. Handles are kept per namespace, keyed by task ID.
//!
//! When a shim's event stream ends without the task having been deleted,
//! the shim is considered dead: the `delete` subcommand cleans up after it
//! and a `TaskExit` is published on its behalf.

use crate::bundle::{self, Bundle};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, TaskEvent};
use crate::shim::ShimInstance;
use mvirt_shim::bootstrap::{self, BootstrapParams, KILLED_EXIT_STATUS};
use mvirt_shim::proto::{DeleteResponse, TaskExit, envelope::Event};
use mvirt_shim::services::events::timestamp;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::process::Command;
use tracing::{debug, info, warn};

type ShimMap = HashMap<String, HashMap<String, Arc<ShimInstance>>>;

pub struct ShimManager {
    config: RuntimeConfig,
    events: EventBus,
    shims: Mutex<ShimMap>,
}

impl ShimManager {
    pub fn new(config: RuntimeConfig, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            config,
            events,
            shims: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn shims(&self) -> MutexGuard<'_, ShimMap> {
        self.shims.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get or connect the shim for a task whose bundle is already written.
    pub async fn start(self: &Arc<Self>, bundle: &Bundle) -> Result<Arc<ShimInstance>> {
        let (namespace, id) = (bundle.namespace(), bundle.id());
        if self.get(namespace, id).is_ok() {
            return Err(Error::AlreadyExists(format!("shim for task {id}")));
        }

        let address = match bundle.sandbox()? {
            Some(sandbox_id) => self.sandbox_address(namespace, &sandbox_id)?,
            None => self.bootstrap(bundle).await?,
        };
        bundle.write_address(&address)?;

        let shim = match ShimInstance::connect(bundle.clone(), &address, self.config.connect_timeout)
            .await
        {
            Ok(shim) => Arc::new(shim),
            Err(e) => {
                warn!(id = %id, error = %e, "Shim unreachable after start");
                stop_spawned_shim(bundle, &address);
                self.cleanup_bundle(bundle).await;
                return Err(e);
            }
        };
        self.register(shim.clone());
        Ok(shim)
    }

    /// Address of the shim hosting `sandbox_id`.
    fn sandbox_address(&self, namespace: &str, sandbox_id: &str) -> Result<String> {
        if let Ok(shim) = self.get(namespace, sandbox_id) {
            return Ok(shim.address().to_string());
        }
        Bundle::open(&self.config.state_root, namespace, sandbox_id)?
            .address()?
            .ok_or_else(|| Error::NotFound(format!("shim address of sandbox {sandbox_id}")))
    }

    /// Run the shim's `start` subcommand and parse the address it prints.
    async fn bootstrap(&self, bundle: &Bundle) -> Result<String> {
        let binary = &self.config.shim_binary;
        let output = self
            .shim_command(binary, bundle)
            .arg("start")
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .stdout(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::Bootstrap(format!(
                "{} start: {}: {}",
                binary.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        bundle.write_shim_binary(binary)?;

        let address = parse_bootstrap(&output.stdout)?;
        info!(id = %bundle.id(), address = %address, "Shim started");
        Ok(address)
    }

    fn shim_command(&self, binary: &Path, bundle: &Bundle) -> Command {
        let mut cmd = Command::new(binary);
        cmd.args(["-namespace", bundle.namespace(), "-id", bundle.id()])
            .args(["-address", &self.config.daemon_address])
            .arg("-bundle")
            .arg(bundle.path())
            .arg("-state-root")
            .arg(&self.config.shim_root)
            .current_dir(bundle.path());
        if self.config.debug {
            cmd.arg("-debug");
        }
        cmd
    }

    fn register(self: &Arc<Self>, shim: Arc<ShimInstance>) {
        self.shims()
            .entry(shim.namespace().to_string())
            .or_default()
            .insert(shim.id().to_string(), shim.clone());
        tokio::spawn(Self::watch(Arc::downgrade(self), shim));
    }

    /// Forward a shim's events and detect its death.
    async fn watch(manager: Weak<Self>, shim: Arc<ShimInstance>) {
        let Some(events) = manager.upgrade().map(|m| m.events.clone()) else {
            return;
        };
        shim.forward_events(&events).await;
        if shim.is_closed() {
            debug!(id = %shim.id(), "Shim event stream closed");
            return;
        }
        warn!(id = %shim.id(), address = %shim.address(), "Shim disconnected");
        if let Some(manager) = manager.upgrade() {
            manager.cleanup_dead_shim(&shim).await;
        }
    }

    async fn cleanup_dead_shim(&self, shim: &Arc<ShimInstance>) {
        let removed = {
            let mut shims = self.shims();
            let current = shims
                .get(shim.namespace())
                .and_then(|tasks| tasks.get(shim.id()))
                .is_some_and(|current| Arc::ptr_eq(current, shim));
            if current {
                remove_entry(&mut shims, shim.namespace(), shim.id());
            }
            current
        };
        if !removed {
            return;
        }

        let response = self.delete_subcommand(shim.bundle()).await;
        if let Err(e) = shim.bundle().remove() {
            warn!(id = %shim.id(), error = %e, "Failed to remove bundle");
        }
        self.events.publish(TaskEvent::new(
            shim.namespace(),
            Event::TaskExit(TaskExit {
                container_id: shim.id().to_string(),
                id: shim.id().to_string(),
                pid: response.pid,
                exit_status: response.exit_status,
                exited_at: response.exited_at,
            }),
        ));
    }

    /// Run the shim's `delete` subcommand. Failures are logged and reported
    /// as a killed task.
    async fn delete_subcommand(&self, bundle: &Bundle) -> DeleteResponse {
        let binary = bundle
            .shim_binary()
            .ok()
            .flatten()
            .unwrap_or_else(|| self.config.shim_binary.clone());

        let output = self
            .shim_command(&binary, bundle)
            .arg("delete")
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .stdout(Stdio::piped())
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                match bootstrap::decode_delete_response(&output.stdout) {
                    Ok(response) => return response,
                    Err(e) => warn!(id = %bundle.id(), error = %e, "Bad delete response from shim"),
                }
            }
            Ok(output) => warn!(
                id = %bundle.id(),
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Shim delete failed"
            ),
            Err(e) => warn!(id = %bundle.id(), error = %e, "Failed to run shim delete"),
        }
        DeleteResponse {
            pid: 0,
            exit_status: KILLED_EXIT_STATUS,
            exited_at: Some(timestamp(chrono::Utc::now())),
        }
    }

    async fn cleanup_bundle(&self, bundle: &Bundle) {
        self.delete_subcommand(bundle).await;
        if let Err(e) = bundle.remove() {
            warn!(id = %bundle.id(), error = %e, "Failed to remove bundle");
        }
    }

    pub fn get(&self, namespace: &str, id: &str) -> Result<Arc<ShimInstance>> {
        self.shims()
            .get(namespace)
            .and_then(|tasks| tasks.get(id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    /// All shim handles of a namespace, ordered by task ID.
    pub fn list(&self, namespace: &str) -> Vec<Arc<ShimInstance>> {
        let mut shims: Vec<_> = self
            .shims()
            .get(namespace)
            .map(|tasks| tasks.values().cloned().collect())
            .unwrap_or_default();
        shims.sort_by(|a, b| a.id().cmp(b.id()));
        shims
    }

    /// Drop a task's shim handle and its bundle. The shim itself exits once
    /// it hosts no more containers.
    pub async fn delete(&self, namespace: &str, id: &str) -> Result<()> {
        let shim = remove_entry(&mut self.shims(), namespace, id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        shim.mark_closed();

        if let Err(e) = shim.shutdown().await {
            warn!(id = %id, error = %e, "Shim shutdown failed");
        }
        shim.bundle().remove()?;
        info!(namespace = %namespace, id = %id, "Shim handle removed");
        Ok(())
    }

    /// Reconnect to the shims of bundles left by a previous daemon run.
    ///
    /// Bundles whose shim is gone are cleaned up through the `delete`
    /// subcommand. Returns the number of tasks reconnected.
    pub async fn load_existing(self: &Arc<Self>) -> Result<usize> {
        let mut loaded = 0;
        for (namespace, id) in bundle::list(&self.config.state_root)? {
            if self.get(&namespace, &id).is_ok() {
                continue;
            }
            let bundle = Bundle::open(&self.config.state_root, &namespace, &id)?;
            match self.reconnect(&bundle).await {
                Ok(shim) => {
                    self.register(shim);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(namespace = %namespace, id = %id, error = %e, "Cleaning up dead task");
                    self.cleanup_bundle(&bundle).await;
                }
            }
        }
        info!(loaded, "Loaded existing tasks");
        Ok(loaded)
    }

    async fn reconnect(&self, bundle: &Bundle) -> Result<Arc<ShimInstance>> {
        let address = bundle
            .address()?
            .ok_or_else(|| Error::NotFound(format!("shim address of task {}", bundle.id())))?;
        let shim =
            ShimInstance::connect(bundle.clone(), &address, self.config.connect_timeout).await?;
        shim.connect_info().await?;
        Ok(Arc::new(shim))
    }
}

/// Kill a shim `start` spawned for `bundle` and drop its socket. A shim
/// the task only joined is left alone.
fn stop_spawned_shim(bundle: &Bundle, address: &str) {
    let pid = match bundle.shim_pid() {
        Ok(Some(pid)) if pid > 0 => pid,
        Ok(_) => return,
        Err(e) => {
            warn!(id = %bundle.id(), error = %e, "Cannot read shim pid");
            return;
        }
    };
    match kill(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            warn!(id = %bundle.id(), pid, error = %e, "Failed to kill shim");
            return;
        }
    }
    info!(id = %bundle.id(), pid, "Killed unreachable shim");
    let path = bootstrap::socket_path(address);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove shim socket");
        }
    }
}

fn remove_entry(shims: &mut ShimMap, namespace: &str, id: &str) -> Option<Arc<ShimInstance>> {
    let tasks = shims.get_mut(namespace)?;
    let shim = tasks.remove(id);
    if tasks.is_empty() {
        shims.remove(namespace);
    }
    shim
}

/// Address from the `start` output: bootstrap JSON or a bare address.
pub fn parse_bootstrap(stdout: &[u8]) -> Result<String> {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::Bootstrap("shim printed no address".to_string()));
    }
    if !text.starts_with('{') {
        return Ok(text.to_string());
    }
    let params: BootstrapParams = serde_json::from_str(text)?;
    if params.protocol != bootstrap::PROTOCOL {
        return Err(Error::Bootstrap(format!(
            "unsupported shim protocol {:?}",
            params.protocol
        )));
    }
    Ok(params.address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bootstrap() {
        let json = br#"{"version":2,"address":"unix:///run/s/abc","protocol":"grpc"}"#;
        assert_eq!(parse_bootstrap(json).unwrap(), "unix:///run/s/abc");
        assert_eq!(parse_bootstrap(b"unix:///run/s/abc\n").unwrap(), "unix:///run/s/abc");
        assert!(parse_bootstrap(b"  ").is_err());

        let ttrpc = br#"{"version":2,"address":"unix:///x","protocol":"ttrpc"}"#;
        assert!(parse_bootstrap(ttrpc).is_err());
    }
}
