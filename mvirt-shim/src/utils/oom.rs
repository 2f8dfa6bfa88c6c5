//! OOM notifications per container cgroup.
//!
//! cgroup v2: inotify on `memory.events`, reporting an increase of the
//! `oom_kill` counter. cgroup v1: an eventfd registered through
//! `cgroup.event_control` against `memory.oom_control`.

use crate::error::{CgroupError, Result};
use crate::proto::{TaskOom, envelope::Event};
use crate::services::events::EventPublisher;
use crate::utils::cgroup::{Cgroup, parse_flat_keyed};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct OomWatcher {
    publisher: EventPublisher,
    watches: Mutex<HashMap<String, JoinHandle<()>>>,
}

enum Source {
    /// inotify watching `memory.events`.
    Events {
        fd: AsyncFd<Notify>,
        file: PathBuf,
        seen: u64,
    },
    /// eventfd plus the `memory.oom_control` file it is bound to.
    EventFd {
        fd: AsyncFd<EventFd>,
        dir: PathBuf,
        _control: File,
    },
}

impl OomWatcher {
    pub fn new(publisher: EventPublisher) -> Self {
        Self {
            publisher,
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching a container's cgroup.
    pub fn add(&self, container_id: &str, cgroup: &Cgroup) -> Result<()> {
        let source = match cgroup {
            Cgroup::V2(cg) => {
                let file = cg.dir().join("memory.events");
                if !file.exists() {
                    return Err(CgroupError::ControllerUnavailable("memory".to_string()).into());
                }
                let fd = inotify_on(&file)?;
                Source::Events {
                    fd: readable(fd)?,
                    seen: oom_kills(&file).unwrap_or(0),
                    file,
                }
            }
            Cgroup::V1(cg) => {
                let dir = cg.subsystem_dir("memory");
                let (fd, control) = register_eventfd(&dir)?;
                Source::EventFd {
                    fd: readable(fd)?,
                    dir,
                    _control: control,
                }
            }
        };

        let id = container_id.to_string();
        let publisher = self.publisher.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = watch(&id, source, &publisher).await {
                warn!(id = %id, error = %e, "OOM watch failed");
            }
            debug!(id = %id, "OOM watch stopped");
        });

        if let Some(previous) = self.lock().insert(container_id.to_string(), handle) {
            previous.abort();
        }
        info!(id = %container_id, path = %cgroup.path(), "Watching cgroup for OOM events");
        Ok(())
    }

    pub fn remove(&self, container_id: &str) {
        if let Some(handle) = self.lock().remove(container_id) {
            handle.abort();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.watches.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for OomWatcher {
    fn drop(&mut self) {
        for (_, handle) in self.lock().drain() {
            handle.abort();
        }
    }
}

async fn watch(id: &str, source: Source, publisher: &EventPublisher) -> io::Result<()> {
    match source {
        Source::Events { fd, file, mut seen } => {
            loop {
                read_ready(&fd, |notify| notify.0.read_events()).await?;
                // The file disappears with the cgroup.
                let Some(count) = oom_kills(&file) else {
                    return Ok(());
                };
                if count > seen {
                    seen = count;
                    publish(id, publisher).await;
                }
            }
        }
        Source::EventFd { fd, dir, .. } => loop {
            read_ready(&fd, EventFd::read).await?;
            // The eventfd also fires when the cgroup is removed.
            if !dir.exists() {
                return Ok(());
            }
            publish(id, publisher).await;
        },
    }
}

async fn publish(id: &str, publisher: &EventPublisher) {
    info!(id = %id, "Container OOM");
    publisher
        .publish(Event::TaskOom(TaskOom {
            container_id: id.to_string(),
        }))
        .await;
}

fn oom_kills(file: &Path) -> Option<u64> {
    let contents = std::fs::read_to_string(file).ok()?;
    Some(parse_flat_keyed(&contents).get("oom_kill").copied().unwrap_or(0))
}

/// An inotify instance, pollable by the reactor.
struct Notify(Inotify);

impl AsRawFd for Notify {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }
}

fn readable<T: AsRawFd>(fd: T) -> io::Result<AsyncFd<T>> {
    // SAFETY: `fd` owns its descriptor, which stays open until the AsyncFd
    // drops it.
    unsafe { AsyncFd::register_with_interest(fd, Interest::READABLE) }
        .map_err(|e| e.into_parts().1)
}

async fn read_ready<T, R>(fd: &AsyncFd<T>, read: impl Fn(&T) -> nix::Result<R>) -> io::Result<R>
where
    T: AsRawFd,
{
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|inner| read(inner.get_ref()).map_err(io::Error::from)) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

fn inotify_on(file: &Path) -> io::Result<Notify> {
    let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
    inotify.add_watch(file, AddWatchFlags::IN_MODIFY)?;
    Ok(Notify(inotify))
}

fn register_eventfd(dir: &Path) -> Result<(EventFd, File)> {
    let control = File::open(dir.join("memory.oom_control"))?;
    let efd = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
    std::fs::write(
        dir.join("cgroup.event_control"),
        format!("{} {}", efd.as_raw_fd(), control.as_raw_fd()),
    )?;
    Ok((efd, control))
}
