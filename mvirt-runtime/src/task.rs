//! Task Manager - the entry point the rest of the daemon uses for tasks.

use crate::bundle::Bundle;
use crate::error::{Error, Result};
use crate::manager::ShimManager;
use crate::shim::{ShimInstance, TaskStdio};
use mvirt_shim::config::RuntimeOptions;
use mvirt_shim::proto::DeleteResponse;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything needed to create a task.
#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    /// OCI spec, written as `config.json`.
    pub spec: Vec<u8>,
    pub stdio: TaskStdio,
    /// OCI runtime binary; the configured default when unset.
    pub runtime: Option<String>,
    pub options: Option<RuntimeOptions>,
    /// Join the shim of this sandbox instead of starting one.
    pub sandbox_id: Option<String>,
    /// Restore from this checkpoint image.
    pub checkpoint: Option<String>,
}

/// A task and the shim serving it.
pub type Task = Arc<ShimInstance>;

pub struct TaskManager {
    shims: Arc<ShimManager>,
}

impl TaskManager {
    pub fn new(shims: Arc<ShimManager>) -> Self {
        Self { shims }
    }

    pub fn shims(&self) -> &Arc<ShimManager> {
        &self.shims
    }

    pub async fn create(&self, namespace: &str, id: &str, opts: CreateOpts) -> Result<Task> {
        info!(namespace = %namespace, id = %id, "Creating task");
        let config = self.shims.config();
        let bundle = Bundle::create(&config.state_root, namespace, id, &opts.spec)?;

        if let Err(e) = write_bundle(&bundle, &opts, &config.runtime_binary) {
            let _ = bundle.remove();
            return Err(e);
        }

        let shim = match self.shims.start(&bundle).await {
            Ok(shim) => shim,
            Err(e) => {
                let _ = bundle.remove();
                return Err(e);
            }
        };

        match shim.create(&opts.stdio, opts.checkpoint.as_deref()).await {
            Ok(pid) => {
                info!(namespace = %namespace, id = %id, pid, "Task created");
                Ok(shim)
            }
            Err(e) => {
                warn!(namespace = %namespace, id = %id, error = %e, "Task create failed, cleaning up");
                let cleanup = tokio::spawn(cleanup_failed_create(
                    self.shims.clone(),
                    namespace.to_string(),
                    shim,
                ));
                // A caller that gave up does not wait for the cleanup.
                if !e.is_cancellation() {
                    let _ = cleanup.await;
                }
                Err(e)
            }
        }
    }

    pub fn get(&self, namespace: &str, id: &str) -> Result<Task> {
        self.shims.get(namespace, id)
    }

    pub fn tasks(&self, namespace: &str) -> Vec<Task> {
        self.shims.list(namespace)
    }

    /// Delete the task's init process, then drop the shim handle.
    pub async fn delete(&self, namespace: &str, id: &str) -> Result<DeleteResponse> {
        let shim = self.get(namespace, id)?;
        let response = match shim.delete("").await {
            Ok(response) => response,
            // Already gone on the shim side: only the handle is left.
            Err(e) if e.is_not_found() => DeleteResponse::default(),
            Err(e) => return Err(e),
        };
        self.shims.delete(namespace, id).await?;
        info!(
            namespace = %namespace,
            id = %id,
            exit_status = response.exit_status,
            "Task deleted"
        );
        Ok(response)
    }
}

fn write_bundle(bundle: &Bundle, opts: &CreateOpts, default_runtime: &str) -> Result<()> {
    let mut options = opts.options.clone().unwrap_or_default();
    if let Some(runtime) = &opts.runtime {
        options.binary_name = runtime.clone();
    } else if opts.options.is_none() {
        options.binary_name = default_runtime.to_string();
    }
    bundle.write_runtime(&options.binary_name)?;
    bundle.write_options(&options)?;
    if let Some(sandbox_id) = &opts.sandbox_id {
        if sandbox_id.is_empty() {
            return Err(Error::InvalidArgument("empty sandbox id".to_string()));
        }
        bundle.write_sandbox(sandbox_id)?;
    }
    Ok(())
}

async fn cleanup_failed_create(shims: Arc<ShimManager>, namespace: String, shim: Task) {
    if let Err(e) = shim.delete("").await {
        if !e.is_not_found() {
            warn!(id = %shim.id(), error = %e, "Failed to delete task state in shim");
        }
    }
    if let Err(e) = shims.delete(&namespace, shim.id()).await {
        warn!(id = %shim.id(), error = %e, "Failed to remove shim");
    }
}
