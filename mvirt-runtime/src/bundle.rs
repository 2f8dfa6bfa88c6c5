//! Task bundle directories and the files persisted in them.
//!
//! A bundle lives at `<state_root>/<namespace>/<id>` and holds:
//!
//! - `config.json`: the OCI spec
//! - `address`: socket address of the shim serving the task
//! - `runtime`: OCI runtime binary name
//! - `options.json`: runtime options read by the shim
//! - `shim-binary-path`: shim binary used, for cleanup after a restart
//! - `sandbox`: sandbox ID, if the task joined one
//! - `shim.pid`: PID of the shim, if `start` spawned one for this task

use crate::error::{Error, Result};
use mvirt_shim::bootstrap;
use mvirt_shim::config::{OPTIONS_FILE, RuntimeOptions};
use std::io;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";
pub const RUNTIME_FILE: &str = "runtime";
pub const SHIM_BINARY_FILE: &str = "shim-binary-path";
pub const SANDBOX_FILE: &str = "sandbox";

#[derive(Debug, Clone)]
pub struct Bundle {
    namespace: String,
    id: String,
    path: PathBuf,
}

fn validate(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::InvalidArgument(format!("invalid {kind} {name:?}")));
    }
    Ok(())
}

fn read_text(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text.trim().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl Bundle {
    /// Create the bundle directory and write the OCI spec into it.
    pub fn create(state_root: &Path, namespace: &str, id: &str, spec: &[u8]) -> Result<Self> {
        validate("namespace", namespace)?;
        validate("task id", id)?;
        let parent = state_root.join(namespace);
        std::fs::create_dir_all(&parent)?;

        let path = parent.join(id);
        match std::fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists(format!("task {id}")));
            }
            Err(e) => return Err(e.into()),
        }

        let bundle = Self {
            namespace: namespace.to_string(),
            id: id.to_string(),
            path,
        };
        if let Err(e) = std::fs::write(bundle.path.join(CONFIG_FILE), spec) {
            let _ = bundle.remove();
            return Err(e.into());
        }
        Ok(bundle)
    }

    /// Open an existing bundle.
    pub fn open(state_root: &Path, namespace: &str, id: &str) -> Result<Self> {
        validate("namespace", namespace)?;
        validate("task id", id)?;
        let path = state_root.join(namespace).join(id);
        if !path.is_dir() {
            return Err(Error::NotFound(format!("bundle {}", path.display())));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            id: id.to_string(),
            path,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_address(&self, address: &str) -> Result<()> {
        Ok(bootstrap::write_address(&self.path, address)?)
    }

    pub fn address(&self) -> Result<Option<String>> {
        read_text(&self.path.join(bootstrap::ADDRESS_FILE))
    }

    pub fn write_runtime(&self, runtime: &str) -> Result<()> {
        Ok(std::fs::write(self.path.join(RUNTIME_FILE), runtime)?)
    }

    pub fn runtime(&self) -> Result<Option<String>> {
        read_text(&self.path.join(RUNTIME_FILE))
    }

    pub fn write_options(&self, options: &RuntimeOptions) -> Result<()> {
        let contents = serde_json::to_vec_pretty(options)?;
        Ok(std::fs::write(self.path.join(OPTIONS_FILE), contents)?)
    }

    pub fn options(&self) -> Result<RuntimeOptions> {
        Ok(RuntimeOptions::load(&self.path)?)
    }

    pub fn write_shim_binary(&self, binary: &Path) -> Result<()> {
        Ok(std::fs::write(
            self.path.join(SHIM_BINARY_FILE),
            binary.as_os_str().as_encoded_bytes(),
        )?)
    }

    pub fn shim_binary(&self) -> Result<Option<PathBuf>> {
        Ok(read_text(&self.path.join(SHIM_BINARY_FILE))?.map(PathBuf::from))
    }

    pub fn write_sandbox(&self, sandbox_id: &str) -> Result<()> {
        Ok(std::fs::write(self.path.join(SANDBOX_FILE), sandbox_id)?)
    }

    pub fn sandbox(&self) -> Result<Option<String>> {
        Ok(read_text(&self.path.join(SANDBOX_FILE))?.filter(|s| !s.is_empty()))
    }

    /// PID of the shim spawned for this task.
    pub fn shim_pid(&self) -> Result<Option<i32>> {
        read_text(&self.path.join(bootstrap::PID_FILE))?
            .map(|pid| {
                pid.parse()
                    .map_err(|_| Error::InvalidArgument(format!("bad shim pid {pid:?}")))
            })
            .transpose()
    }

    /// Remove the bundle directory. A bundle that is already gone is fine.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// `(namespace, id)` of every bundle below `state_root`.
pub fn list(state_root: &Path) -> Result<Vec<(String, String)>> {
    let mut bundles = Vec::new();
    let namespaces = match std::fs::read_dir(state_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(bundles),
        Err(e) => return Err(e.into()),
    };
    for ns in namespaces {
        let ns = ns?;
        if !ns.file_type()?.is_dir() {
            continue;
        }
        let Some(namespace) = ns.file_name().to_str().map(str::to_string) else {
            continue;
        };
        for task in std::fs::read_dir(ns.path())? {
            let task = task?;
            if !task.file_type()?.is_dir() {
                continue;
            }
            if let Some(id) = task.file_name().to_str() {
                bundles.push((namespace.clone(), id.to_string()));
            }
        }
    }
    bundles.sort();
    Ok(bundles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_rejects_duplicates_and_bad_ids() {
        let dir = TempDir::new().unwrap();
        Bundle::create(dir.path(), "default", "c1", b"{}").unwrap();

        let err = Bundle::create(dir.path(), "default", "c1", b"{}").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::AlreadyExists);

        for id in ["", "..", "a/b"] {
            let err = Bundle::create(dir.path(), "default", id, b"{}").unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
        }
    }

    #[test]
    fn test_open_missing_bundle() {
        let dir = TempDir::new().unwrap();
        let err = Bundle::open(dir.path(), "default", "nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_optional_files() {
        let dir = TempDir::new().unwrap();
        let bundle = Bundle::create(dir.path(), "default", "c1", b"{}").unwrap();
        assert_eq!(bundle.address().unwrap(), None);
        assert_eq!(bundle.sandbox().unwrap(), None);
        assert_eq!(bundle.shim_pid().unwrap(), None);
        assert_eq!(bundle.options().unwrap(), RuntimeOptions::default());

        bundle.write_sandbox("pod1").unwrap();
        assert_eq!(bundle.sandbox().unwrap().as_deref(), Some("pod1"));

        std::fs::write(bundle.path().join(bootstrap::PID_FILE), "4242\n").unwrap();
        assert_eq!(bundle.shim_pid().unwrap(), Some(4242));
        std::fs::write(bundle.path().join(bootstrap::PID_FILE), "shim").unwrap();
        assert!(bundle.shim_pid().is_err());

        bundle.remove().unwrap();
        bundle.remove().unwrap();
        assert!(list(dir.path()).unwrap().is_empty());
    }
}
