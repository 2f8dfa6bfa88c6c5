//! Task manager configuration.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_STATE_ROOT: &str = "/run/mvirt/tasks";
pub const DEFAULT_SHIM_BINARY: &str = "mvirt-shim";
pub const DEFAULT_DAEMON_ADDRESS: &str = "/run/mvirt/runtime.sock";
/// Overrides [`RuntimeConfig::shim_binary`].
pub const SHIM_BINARY_ENV: &str = "MVIRT_SHIM_BINARY";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Task bundles live in `<state_root>/<namespace>/<id>`.
    pub state_root: PathBuf,
    /// Root for shim sockets, passed to the shim as `-state-root`.
    pub shim_root: PathBuf,
    pub shim_binary: PathBuf,
    /// Address of this daemon, handed to every shim.
    pub daemon_address: String,
    /// OCI runtime used when a task does not name one.
    pub runtime_binary: String,
    pub connect_timeout: Duration,
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_root: PathBuf::from(DEFAULT_STATE_ROOT),
            shim_root: PathBuf::from(mvirt_shim::config::DEFAULT_STATE_ROOT),
            shim_binary: PathBuf::from(DEFAULT_SHIM_BINARY),
            daemon_address: DEFAULT_DAEMON_ADDRESS.to_string(),
            runtime_binary: mvirt_shim::config::DEFAULT_RUNTIME.to_string(),
            connect_timeout: Duration::from_secs(5),
            debug: false,
        }
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(binary) = std::env::var_os(SHIM_BINARY_ENV) {
            config.shim_binary = PathBuf::from(binary);
        }
        config
    }
}
