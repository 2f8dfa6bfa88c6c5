//! Process stdio plumbing.
//!
//! stdout/stderr paths (FIFOs or plain files) are opened by the shim and
//! handed to the runtime. stdin is copied through a pipe the shim owns so
//! that `CloseIO` can deliver EOF. Terminal processes use the console socket
//! protocol: the runtime sends the pty master back over `SCM_RIGHTS`.

use crate::error::{Error, Result};
use crate::runtime::ProcessStdio;
use nix::sys::socket::{ControlMessageOwned, MsgFlags, recvmsg};
use std::fs::{File, OpenOptions};
use std::io::{self, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

static CONSOLE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Stdio configuration of a process as requested by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stdio {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
}

impl Stdio {
    pub fn is_null(&self) -> bool {
        self.stdin.is_empty() && self.stdout.is_empty() && self.stderr.is_empty()
    }
}

type SharedWriter = Arc<Mutex<Option<File>>>;

/// Shim-owned ends of a running process's stdio.
#[derive(Default)]
pub struct ProcessIo {
    stdin: SharedWriter,
    console: Option<File>,
}

/// A console socket waiting for the runtime to send a pty master.
pub struct ConsoleSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl ConsoleSocket {
    pub fn new() -> io::Result<Self> {
        // Kept short: sun_path is limited to 108 bytes.
        let path = std::env::temp_dir().join(format!(
            "mvirt-pty-{}-{}.sock",
            std::process::id(),
            CONSOLE_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept the runtime's connection and receive the pty master.
    pub async fn receive_master(self) -> Result<OwnedFd> {
        tokio::task::spawn_blocking(move || self.receive_blocking())
            .await
            .map_err(|e| Error::Io(io::Error::other(e)))?
    }

    fn receive_blocking(&self) -> Result<OwnedFd> {
        let (stream, _) = self.listener.accept()?;
        let mut buf = [0u8; 4096];
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg = nix::cmsg_space!([RawFd; 1]);
        let msg = recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )?;

        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(fd) = fds.first() {
                    // SAFETY: the kernel installed this descriptor for us.
                    return Ok(unsafe { OwnedFd::from_raw_fd(*fd) });
                }
            }
        }
        Err(Error::InvalidArgument(
            "console socket message carried no file descriptor".to_string(),
        ))
    }
}

impl Drop for ConsoleSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Prepare the descriptors for a non-terminal process.
///
/// Returns what the runtime inherits and the ends the shim keeps.
pub fn prepare(stdio: &Stdio, uid: u32, gid: u32) -> Result<(ProcessStdio, ProcessIo)> {
    let io = ProcessIo::default();
    let mut child = ProcessStdio {
        stdout: open_output(&stdio.stdout)?,
        stderr: open_output(&stdio.stderr)?,
        ..Default::default()
    };

    if !stdio.stdin.is_empty() {
        let (read_end, write_end) = nix::unistd::pipe()?;
        if uid != 0 || gid != 0 {
            std::os::unix::fs::fchown(&read_end, Some(uid), Some(gid))?;
        }
        *lock(&io.stdin) = Some(File::from(write_end));
        spawn_stdin_copier(PathBuf::from(&stdio.stdin), Arc::clone(&io.stdin));
        child.stdin = Some(read_end);
    }

    Ok((child, io))
}

/// Wire a received pty master to the stdio paths.
pub fn attach_console(stdio: &Stdio, master: OwnedFd) -> Result<ProcessIo> {
    let console = File::from(master);

    if !stdio.stdout.is_empty() {
        let reader = console.try_clone()?;
        let output = OpenOptions::new().write(true).open(&stdio.stdout)?;
        std::thread::spawn(move || copy_until_eof(reader, output));
    }

    let stdin: SharedWriter = Arc::new(Mutex::new(None));
    if !stdio.stdin.is_empty() {
        *lock(&stdin) = Some(console.try_clone()?);
        spawn_stdin_copier(PathBuf::from(&stdio.stdin), Arc::clone(&stdin));
    }

    Ok(ProcessIo {
        stdin,
        console: Some(console),
    })
}

impl ProcessIo {
    /// Close the shim's end of stdin so the process reads EOF.
    pub fn close_stdin(&self) {
        lock(&self.stdin).take();
    }

    pub fn resize(&self, width: u32, height: u32) -> Result<()> {
        let console = self
            .console
            .as_ref()
            .ok_or_else(|| Error::FailedPrecondition("process has no terminal".to_string()))?;
        let size = libc::winsize {
            ws_row: height as u16,
            ws_col: width as u16,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCSWINSZ reads a winsize from the pointer we pass.
        let rc = unsafe { libc::ioctl(console.as_raw_fd(), libc::TIOCSWINSZ, &size) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

fn lock(writer: &SharedWriter) -> std::sync::MutexGuard<'_, Option<File>> {
    writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn open_output(path: &str) -> Result<Option<OwnedFd>> {
    if path.is_empty() {
        return Ok(None);
    }
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .append(true)
        .open(path)?;
    Ok(Some(file.into()))
}

fn spawn_stdin_copier(source: PathBuf, sink: SharedWriter) {
    std::thread::spawn(move || {
        let mut input = match File::open(&source) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %source.display(), error = %e, "Failed to open stdin");
                lock(&sink).take();
                return;
            }
        };
        let mut buf = [0u8; 32 * 1024];
        loop {
            let n = match input.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "stdin read failed");
                    break;
                }
            };
            let mut guard = lock(&sink);
            let Some(writer) = guard.as_mut() else {
                return;
            };
            if writer.write_all(&buf[..n]).is_err() {
                break;
            }
        }
        lock(&sink).take();
    });
}

fn copy_until_eof(mut reader: File, mut writer: File) {
    if let Err(e) = io::copy(&mut reader, &mut writer) {
        // EIO is how a pty master reports the slave side closing.
        if e.raw_os_error() != Some(libc::EIO) {
            debug!(error = %e, "console copy stopped");
        }
    }
}
