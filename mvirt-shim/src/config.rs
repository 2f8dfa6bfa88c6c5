//! Shim configuration: command line flags and per-task runtime options.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const OPTIONS_FILE: &str = "options.json";
pub const DEFAULT_RUNTIME: &str = "runc";
pub const DEFAULT_STATE_ROOT: &str = "/run/mvirt/shim";

/// Per-task container shim.
#[derive(Debug, Parser)]
#[command(name = "mvirt-shim")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Per-task container shim")]
pub struct Args {
    /// Namespace the task belongs to
    #[arg(long, default_value = "default")]
    pub namespace: String,

    /// Task ID
    #[arg(long, default_value = "")]
    pub id: String,

    /// Address of the daemon that launched the shim
    #[arg(long, default_value = "")]
    pub address: String,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Bundle directory (defaults to the working directory)
    #[arg(long)]
    pub bundle: Option<PathBuf>,

    /// Root directory for shim sockets
    #[arg(long, default_value = DEFAULT_STATE_ROOT)]
    pub state_root: PathBuf,

    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Action {
    /// Start (or join) a shim for the task and print its address
    Start,
    /// Clean up after a shim that is gone
    Delete,
}

impl Args {
    /// Parse arguments, accepting `-flag` as well as `--flag`.
    pub fn parse_normalized<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        Self::parse_from(normalize_flags(args))
    }

    pub fn bundle(&self) -> std::io::Result<PathBuf> {
        match &self.bundle {
            Some(bundle) => Ok(bundle.clone()),
            None => std::env::current_dir(),
        }
    }
}

/// Rewrite single-dash long flags (`-namespace`) into `--namespace`.
pub fn normalize_flags<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .enumerate()
        .map(|(i, arg)| {
            if i == 0 {
                return arg;
            }
            match arg.to_str() {
                Some(s) if s.len() > 2 && s.starts_with('-') && !s.starts_with("--") => {
                    OsString::from(format!("-{s}"))
                }
                _ => arg,
            }
        })
        .collect()
}

/// Runtime options stored as `options.json` in the bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeOptions {
    /// OCI runtime binary (runc, crun, youki, ...).
    pub binary_name: String,
    /// Runtime state root (`--root`).
    pub root: Option<PathBuf>,
    pub systemd_cgroup: bool,
    pub no_pivot_root: bool,
    pub no_new_keyring: bool,
    pub criu_path: Option<PathBuf>,
    pub io_uid: u32,
    pub io_gid: u32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            binary_name: DEFAULT_RUNTIME.to_string(),
            root: None,
            systemd_cgroup: false,
            no_pivot_root: false,
            no_new_keyring: false,
            criu_path: None,
            io_uid: 0,
            io_gid: 0,
        }
    }
}

impl RuntimeOptions {
    /// Read `options.json` from a bundle; a missing file yields defaults.
    pub fn load(bundle: &Path) -> crate::error::Result<Self> {
        match std::fs::read(bundle.join(OPTIONS_FILE)) {
            Ok(contents) => Ok(serde_json::from_slice(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_single_dash_flags() {
        let args = Args::parse_normalized([
            "mvirt-shim",
            "-namespace",
            "k8s",
            "-id",
            "c1",
            "-address",
            "/run/mvirt/daemon.sock",
            "-debug",
            "start",
        ]);
        assert_eq!(args.namespace, "k8s");
        assert_eq!(args.id, "c1");
        assert_eq!(args.address, "/run/mvirt/daemon.sock");
        assert!(args.debug);
        assert_eq!(args.action, Some(Action::Start));
    }

    #[test]
    fn test_serve_mode_has_no_action() {
        let args = Args::parse_normalized(["mvirt-shim", "--id", "c1"]);
        assert_eq!(args.action, None);
        assert_eq!(args.namespace, "default");
    }

    #[test]
    fn test_runtime_options() {
        let dir = TempDir::new().unwrap();
        assert_eq!(RuntimeOptions::load(dir.path()).unwrap(), RuntimeOptions::default());

        std::fs::write(
            dir.path().join(OPTIONS_FILE),
            r#"{"binary_name":"youki","systemd_cgroup":true}"#,
        )
        .unwrap();
        let opts = RuntimeOptions::load(dir.path()).unwrap();
        assert_eq!(opts.binary_name, "youki");
        assert!(opts.systemd_cgroup);
        assert!(!opts.no_pivot_root);
    }
}
