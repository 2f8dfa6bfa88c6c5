//! The subset of the OCI runtime spec (bundle `config.json`) the shim reads.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

pub const CONFIG_FILE: &str = "config.json";

/// Annotations that place a task into a shared shim, in priority order.
pub const GROUP_ANNOTATIONS: &[&str] = &["io.mvirt.shim.v1.group", "io.kubernetes.cri.sandbox-id"];

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    pub process: Option<Process>,
    pub linux: Option<Linux>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Process {
    #[serde(default)]
    pub terminal: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
    pub cgroups_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    pub path: Option<String>,
}

impl Spec {
    pub fn load(bundle: &Path) -> crate::error::Result<Self> {
        let contents = std::fs::read(bundle.join(CONFIG_FILE))?;
        Ok(serde_json::from_slice(&contents)?)
    }

    /// The shim grouping key: the first matching group annotation.
    pub fn group_key(&self) -> Option<&str> {
        GROUP_ANNOTATIONS
            .iter()
            .find_map(|name| self.annotations.get(*name))
            .map(String::as_str)
            .filter(|key| !key.is_empty())
    }

    /// Whether the container gets a fresh PID namespace (no path to join).
    pub fn owns_pid_namespace(&self) -> bool {
        self.linux
            .as_ref()
            .map(|linux| {
                linux
                    .namespaces
                    .iter()
                    .any(|ns| ns.ns_type == "pid" && ns.path.as_deref().unwrap_or("").is_empty())
            })
            .unwrap_or(false)
    }
}

/// Whether the remaining processes of a container are killed when its init
/// process exits.
pub fn should_kill_all_on_exit(bundle: &Path) -> bool {
    match Spec::load(bundle) {
        Ok(spec) => spec.owns_pid_namespace(),
        Err(e) => {
            tracing::warn!(bundle = %bundle.display(), error = %e, "Failed to read bundle spec");
            false
        }
    }
}
