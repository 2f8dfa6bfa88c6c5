//! OCI runtime interface.
//!
//! [`OciRuntime`] is the seam between the shim and the low-level runtime.
//! [`CliRuntime`] drives any runc-compatible binary (runc, crun, youki);
//! every invocation is waited for through the [`Reaper`] so that the
//! shim's reap loop never steals its exit status.

use crate::config::RuntimeOptions;
use crate::error::RuntimeError;
use crate::utils::reaper::{CommandOutput, Reaper};
use async_trait::async_trait;
use serde::Deserialize;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, error, info};

type Result<T> = std::result::Result<T, RuntimeError>;

/// File descriptors and console socket handed to a new process.
#[derive(Debug, Default)]
pub struct ProcessStdio {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
    pub console_socket: Option<PathBuf>,
}

/// Options for creating a container's init process.
#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    pub pid_file: PathBuf,
    pub no_pivot: bool,
    pub no_new_keyring: bool,
    /// Restore from this checkpoint image instead of creating.
    pub checkpoint: Option<PathBuf>,
}

/// Options for starting an exec process.
#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    pub pid_file: PathBuf,
    /// JSON encoded OCI process spec written to disk for the runtime.
    pub process_file: PathBuf,
}

#[async_trait]
pub trait OciRuntime: Send + Sync {
    /// Create the container without starting the user process. Returns the
    /// init PID.
    async fn create(
        &self,
        id: &str,
        bundle: &Path,
        opts: &CreateOpts,
        stdio: ProcessStdio,
    ) -> Result<i32>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Start an additional process in the container. Returns its PID.
    async fn exec(
        &self,
        id: &str,
        spec: &[u8],
        opts: &ExecOpts,
        stdio: ProcessStdio,
    ) -> Result<i32>;

    async fn kill(&self, id: &str, signal: i32, all: bool) -> Result<()>;

    async fn delete(&self, id: &str, force: bool) -> Result<()>;

    async fn pause(&self, id: &str) -> Result<()>;

    async fn resume(&self, id: &str) -> Result<()>;

    /// PIDs of every process in the container.
    async fn ps(&self, id: &str) -> Result<Vec<i32>>;

    async fn update(&self, id: &str, resources: &[u8]) -> Result<()>;

    async fn checkpoint(&self, id: &str, image_path: &Path, leave_running: bool) -> Result<()>;
}

/// Builds the runtime for a task from its options.
pub trait RuntimeProvider: Send + Sync {
    fn runtime(&self, options: &RuntimeOptions, bundle: &Path) -> Arc<dyn OciRuntime>;
}

/// Provider of [`CliRuntime`] instances.
pub struct CliRuntimeProvider {
    reaper: Arc<Reaper>,
}

impl CliRuntimeProvider {
    pub fn new(reaper: Arc<Reaper>) -> Self {
        Self { reaper }
    }
}

impl RuntimeProvider for CliRuntimeProvider {
    fn runtime(&self, options: &RuntimeOptions, bundle: &Path) -> Arc<dyn OciRuntime> {
        Arc::new(CliRuntime::new(
            options,
            bundle.join("log.json"),
            Arc::clone(&self.reaper),
        ))
    }
}

/// runc-compatible command line runtime.
pub struct CliRuntime {
    binary: PathBuf,
    root: Option<PathBuf>,
    systemd_cgroup: bool,
    criu_path: Option<PathBuf>,
    log: PathBuf,
    reaper: Arc<Reaper>,
}

#[derive(Debug, Deserialize)]
struct LogEntry {
    level: Option<String>,
    msg: Option<String>,
}

impl CliRuntime {
    pub fn new(options: &RuntimeOptions, log: PathBuf, reaper: Arc<Reaper>) -> Self {
        Self {
            binary: PathBuf::from(&options.binary_name),
            root: options.root.clone(),
            systemd_cgroup: options.systemd_cgroup,
            criu_path: options.criu_path.clone(),
            log,
            reaper,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(root) = &self.root {
            cmd.arg("--root").arg(root);
        }
        cmd.arg("--log").arg(&self.log);
        cmd.args(["--log-format", "json"]);
        if self.systemd_cgroup {
            cmd.arg("--systemd-cgroup");
        }
        cmd
    }

    /// Run a short-lived runtime command with captured output.
    async fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = self.command();
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.execute(cmd, args).await
    }

    /// Run a runtime command whose stdio is inherited by the container.
    async fn run_with_stdio(&self, mut cmd: Command, args: &[&str], stdio: ProcessStdio) -> Result<()> {
        cmd.stdin(stdio.stdin.map(Stdio::from).unwrap_or_else(Stdio::null))
            .stdout(stdio.stdout.map(Stdio::from).unwrap_or_else(Stdio::null))
            .stderr(stdio.stderr.map(Stdio::from).unwrap_or_else(Stdio::null));
        self.execute(cmd, args).await.map(|_| ())
    }

    async fn execute(&self, cmd: Command, args: &[&str]) -> Result<CommandOutput> {
        info!(
            runtime = %self.binary.display(),
            args = %args.join(" "),
            "Executing runtime command"
        );

        let output = self
            .reaper
            .run(cmd)
            .await
            .map_err(|source| RuntimeError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;

        if !output.success() {
            let stderr = self
                .last_error()
                .unwrap_or_else(|| String::from_utf8_lossy(&output.stderr).trim().to_string());
            error!(
                runtime = %self.binary.display(),
                status = output.status,
                stderr = %stderr,
                "Runtime command failed"
            );
            return Err(RuntimeError::Failed {
                binary: self.binary.display().to_string(),
                status: output.status,
                stderr,
            });
        }

        debug!("Runtime command successful");
        Ok(output)
    }

    /// The most recent error message from the runtime's JSON log.
    fn last_error(&self) -> Option<String> {
        let contents = std::fs::read_to_string(&self.log).ok()?;
        contents
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str::<LogEntry>(line).ok())
            .find(|entry| entry.level.as_deref() == Some("error"))
            .and_then(|entry| entry.msg)
    }
}

async fn read_pid_file(path: &Path) -> Result<i32> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RuntimeError::Protocol(format!("could not read pid file: {e}")))?;
    contents
        .trim()
        .parse::<i32>()
        .map_err(|e| RuntimeError::Protocol(format!("failed to parse pid: {e}")))
}

#[async_trait]
impl OciRuntime for CliRuntime {
    async fn create(
        &self,
        id: &str,
        bundle: &Path,
        opts: &CreateOpts,
        stdio: ProcessStdio,
    ) -> Result<i32> {
        let bundle_arg = bundle.display().to_string();
        let pid_file = opts.pid_file.display().to_string();
        let console = stdio.console_socket.as_ref().map(|p| p.display().to_string());
        let image = opts.checkpoint.as_ref().map(|p| p.display().to_string());

        let mut args: Vec<&str> = match &image {
            Some(image) => vec!["restore", "--detach", "--image-path", image],
            None => vec!["create"],
        };
        args.extend(["--bundle", &bundle_arg, "--pid-file", &pid_file]);
        if let Some(console) = &console {
            args.extend(["--console-socket", console]);
        }
        if opts.no_pivot {
            args.push("--no-pivot");
        }
        if opts.no_new_keyring {
            args.push("--no-new-keyring");
        }
        args.push(id);

        let mut cmd = self.command();
        cmd.args(&args);
        self.run_with_stdio(cmd, &args, stdio).await?;
        read_pid_file(&opts.pid_file).await
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.run(&["start", id]).await.map(|_| ())
    }

    async fn exec(
        &self,
        id: &str,
        spec: &[u8],
        opts: &ExecOpts,
        stdio: ProcessStdio,
    ) -> Result<i32> {
        tokio::fs::write(&opts.process_file, spec)
            .await
            .map_err(|e| RuntimeError::Protocol(format!("failed to write process spec: {e}")))?;

        let process_file = opts.process_file.display().to_string();
        let pid_file = opts.pid_file.display().to_string();
        let console = stdio.console_socket.as_ref().map(|p| p.display().to_string());

        let mut args = vec!["exec", "--detach", "--process", &process_file, "--pid-file", &pid_file];
        if let Some(console) = &console {
            args.extend(["--console-socket", console]);
        }
        args.push(id);

        let mut cmd = self.command();
        cmd.args(&args);
        self.run_with_stdio(cmd, &args, stdio).await?;
        read_pid_file(&opts.pid_file).await
    }

    async fn kill(&self, id: &str, signal: i32, all: bool) -> Result<()> {
        let signal = signal.to_string();
        let mut args = vec!["kill"];
        if all {
            args.push("--all");
        }
        args.extend([id, &signal]);
        self.run(&args).await.map(|_| ())
    }

    async fn delete(&self, id: &str, force: bool) -> Result<()> {
        let mut args = vec!["delete"];
        if force {
            args.push("--force");
        }
        args.push(id);
        self.run(&args).await.map(|_| ())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.run(&["pause", id]).await.map(|_| ())
    }

    async fn resume(&self, id: &str) -> Result<()> {
        self.run(&["resume", id]).await.map(|_| ())
    }

    async fn ps(&self, id: &str) -> Result<Vec<i32>> {
        let output = self.run(&["ps", "--format", "json", id]).await?;
        serde_json::from_slice::<Option<Vec<i32>>>(&output.stdout)
            .map(Option::unwrap_or_default)
            .map_err(|e| RuntimeError::Protocol(format!("invalid ps output: {e}")))
    }

    async fn update(&self, id: &str, resources: &[u8]) -> Result<()> {
        let file = self.log.with_file_name(format!("{id}-resources.json"));
        tokio::fs::write(&file, resources)
            .await
            .map_err(|e| RuntimeError::Protocol(format!("failed to write resources: {e}")))?;
        let file_arg = file.display().to_string();
        let result = self.run(&["update", "--resources", &file_arg, id]).await;
        let _ = tokio::fs::remove_file(&file).await;
        result.map(|_| ())
    }

    async fn checkpoint(&self, id: &str, image_path: &Path, leave_running: bool) -> Result<()> {
        let image = image_path.display().to_string();
        let criu = self.criu_path.as_ref().map(|p| p.display().to_string());
        let mut args = vec!["checkpoint", "--image-path", &image];
        if leave_running {
            args.push("--leave-running");
        }
        if let Some(criu) = &criu {
            args.extend(["--criu", criu]);
        }
        args.push(id);
        self.run(&args).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_last_error_from_json_log() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("log.json");
        std::fs::write(
            &log,
            concat!(
                r#"{"level":"info","msg":"starting"}"#,
                "\n",
                r#"{"level":"error","msg":"container not running"}"#,
                "\n",
                r#"{"level":"warning","msg":"late"}"#,
                "\n",
            ),
        )
        .unwrap();

        let runtime = CliRuntime::new(&RuntimeOptions::default(), log, Reaper::new());
        assert_eq!(runtime.last_error().as_deref(), Some("container not running"));
    }

    #[test]
    fn test_global_flags() {
        let options = RuntimeOptions {
            binary_name: "youki".to_string(),
            root: Some(PathBuf::from("/run/youki")),
            systemd_cgroup: true,
            ..Default::default()
        };
        let runtime = CliRuntime::new(&options, PathBuf::from("/b/log.json"), Reaper::new());
        let cmd = runtime.command();
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(cmd.get_program(), "youki");
        assert_eq!(
            args,
            vec!["--root", "/run/youki", "--log", "/b/log.json", "--log-format", "json", "--systemd-cgroup"]
        );
    }

    #[tokio::test]
    async fn test_read_pid_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("init.pid");
        std::fs::write(&file, "4242").unwrap();
        assert_eq!(read_pid_file(&file).await.unwrap(), 4242);

        std::fs::write(&file, "garbage").unwrap();
        assert!(matches!(read_pid_file(&file).await, Err(RuntimeError::Protocol(_))));
    }
}
