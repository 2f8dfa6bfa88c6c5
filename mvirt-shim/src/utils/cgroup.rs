//! Cgroup adapter.
//!
//! Containers are attached to either a cgroup v1 hierarchy (one directory per
//! subsystem) or the v2 unified hierarchy. Both are wrapped in [`Cgroup`],
//! which exposes the handful of operations the shim needs through
//! [`CgroupOps`].

use crate::error::CgroupError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_ROOT: &str = "/sys/fs/cgroup";

const V1_SUBSYSTEMS: &[&str] = &[
    "cpu", "cpuacct", "cpuset", "memory", "pids", "blkio", "devices", "freezer",
];

type Result<T> = std::result::Result<T, CgroupError>;

/// Which hierarchy layout the host uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupMode {
    Legacy,
    Hybrid,
    Unified,
}

/// Detect the host cgroup mode below `root`.
pub fn mode(root: &Path) -> CgroupMode {
    if root.join("cgroup.controllers").exists() {
        CgroupMode::Unified
    } else if root.join("unified").join("cgroup.controllers").exists() {
        CgroupMode::Hybrid
    } else {
        CgroupMode::Legacy
    }
}

/// Operations shared by both cgroup versions.
pub trait CgroupOps {
    /// Move `pid` into the cgroup.
    fn add_proc(&self, pid: u32) -> Result<()>;

    /// Read current resource usage.
    fn stat(&self) -> Result<Metrics>;

    /// Controllers available at the hierarchy root.
    fn root_controllers(&self) -> Result<Vec<String>>;

    /// Enable or disable controllers for the cgroup's subtree.
    fn toggle_controllers(&self, controllers: &[String], enable: bool) -> Result<()>;

    /// Remove the cgroup directories.
    fn delete(&self) -> Result<()>;
}

/// A container cgroup, v1 or v2.
#[derive(Debug, Clone)]
pub enum Cgroup {
    V1(CgroupV1),
    V2(CgroupV2),
}

#[derive(Debug, Clone)]
pub struct CgroupV1 {
    root: PathBuf,
    path: String,
}

#[derive(Debug, Clone)]
pub struct CgroupV2 {
    root: PathBuf,
    path: String,
}

/// Resource usage snapshot, serialized as the `Stats` payload.
#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct Metrics {
    pub version: u8,
    pub pids: Option<PidsStat>,
    pub cpu: Option<CpuStat>,
    pub memory: Option<MemoryStat>,
}

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct PidsStat {
    pub current: u64,
    pub limit: Option<u64>,
}

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct CpuStat {
    pub usage_usec: u64,
    pub user_usec: u64,
    pub system_usec: u64,
    pub nr_periods: u64,
    pub nr_throttled: u64,
    pub throttled_usec: u64,
}

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct MemoryStat {
    pub usage: u64,
    pub limit: Option<u64>,
    pub oom_kill: u64,
    pub stat: BTreeMap<String, u64>,
}

impl Cgroup {
    /// Load the cgroup `pid` currently belongs to.
    pub fn for_pid(pid: u32) -> Result<Self> {
        Self::for_pid_in(Path::new(DEFAULT_ROOT), Path::new("/proc"), pid)
    }

    pub fn for_pid_in(root: &Path, proc_root: &Path, pid: u32) -> Result<Self> {
        let file = proc_root.join(pid.to_string()).join("cgroup");
        let contents = fs::read_to_string(&file).map_err(|source| CgroupError::Io {
            path: file.display().to_string(),
            source,
        })?;

        match mode(root) {
            CgroupMode::Unified => {
                let path = contents
                    .lines()
                    .find_map(|l| l.strip_prefix("0::"))
                    .ok_or_else(|| CgroupError::Parse {
                        file: file.display().to_string(),
                        reason: "no unified hierarchy entry".to_string(),
                    })?;
                Ok(Cgroup::V2(CgroupV2::new(root, path)))
            }
            CgroupMode::Legacy | CgroupMode::Hybrid => {
                // All subsystems of a runtime-created container share a path;
                // the memory entry is the one OOM monitoring depends on.
                let path = contents
                    .lines()
                    .filter_map(|l| {
                        let mut parts = l.splitn(3, ':');
                        let _ = parts.next()?;
                        let controllers = parts.next()?;
                        let path = parts.next()?;
                        Some((controllers, path))
                    })
                    .find(|(controllers, _)| controllers.split(',').any(|c| c == "memory"))
                    .map(|(_, path)| path)
                    .ok_or_else(|| CgroupError::Parse {
                        file: file.display().to_string(),
                        reason: "no memory hierarchy entry".to_string(),
                    })?;
                Ok(Cgroup::V1(CgroupV1::new(root, path)))
            }
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Cgroup::V1(cg) => &cg.path,
            Cgroup::V2(cg) => &cg.path,
        }
    }
}

impl CgroupOps for Cgroup {
    fn add_proc(&self, pid: u32) -> Result<()> {
        match self {
            Cgroup::V1(cg) => cg.add_proc(pid),
            Cgroup::V2(cg) => cg.add_proc(pid),
        }
    }

    fn stat(&self) -> Result<Metrics> {
        match self {
            Cgroup::V1(cg) => cg.stat(),
            Cgroup::V2(cg) => cg.stat(),
        }
    }

    fn root_controllers(&self) -> Result<Vec<String>> {
        match self {
            Cgroup::V1(cg) => cg.root_controllers(),
            Cgroup::V2(cg) => cg.root_controllers(),
        }
    }

    fn toggle_controllers(&self, controllers: &[String], enable: bool) -> Result<()> {
        match self {
            Cgroup::V1(cg) => cg.toggle_controllers(controllers, enable),
            Cgroup::V2(cg) => cg.toggle_controllers(controllers, enable),
        }
    }

    fn delete(&self) -> Result<()> {
        match self {
            Cgroup::V1(cg) => cg.delete(),
            Cgroup::V2(cg) => cg.delete(),
        }
    }
}

impl CgroupV1 {
    pub fn new(root: &Path, path: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            path: path.to_string(),
        }
    }

    pub fn subsystem_dir(&self, subsystem: &str) -> PathBuf {
        self.root
            .join(subsystem)
            .join(self.path.trim_start_matches('/'))
    }

    fn subsystems(&self) -> impl Iterator<Item = (&'static str, PathBuf)> + '_ {
        V1_SUBSYSTEMS
            .iter()
            .map(|s| (*s, self.subsystem_dir(s)))
            .filter(|(_, dir)| dir.is_dir())
    }
}

impl CgroupOps for CgroupV1 {
    fn add_proc(&self, pid: u32) -> Result<()> {
        let mut attached = false;
        for (_, dir) in self.subsystems() {
            write_file(&dir.join("cgroup.procs"), &pid.to_string())?;
            attached = true;
        }
        if !attached {
            return Err(CgroupError::Missing(self.path.clone()));
        }
        Ok(())
    }

    fn stat(&self) -> Result<Metrics> {
        let mut metrics = Metrics {
            version: 1,
            ..Default::default()
        };

        let pids = self.subsystem_dir("pids");
        if pids.is_dir() {
            metrics.pids = Some(PidsStat {
                current: read_u64(&pids.join("pids.current"))?.unwrap_or(0),
                limit: read_u64(&pids.join("pids.max"))?,
            });
        }

        let cpuacct = self.subsystem_dir("cpuacct");
        if cpuacct.is_dir() {
            let mut cpu = CpuStat {
                usage_usec: read_u64(&cpuacct.join("cpuacct.usage"))?.unwrap_or(0) / 1000,
                ..Default::default()
            };
            let throttling = read_flat_keyed(&self.subsystem_dir("cpu").join("cpu.stat"))?;
            cpu.nr_periods = throttling.get("nr_periods").copied().unwrap_or(0);
            cpu.nr_throttled = throttling.get("nr_throttled").copied().unwrap_or(0);
            cpu.throttled_usec = throttling.get("throttled_time").copied().unwrap_or(0) / 1000;
            metrics.cpu = Some(cpu);
        }

        let memory = self.subsystem_dir("memory");
        if memory.is_dir() {
            let oom = read_flat_keyed(&memory.join("memory.oom_control"))?;
            metrics.memory = Some(MemoryStat {
                usage: read_u64(&memory.join("memory.usage_in_bytes"))?.unwrap_or(0),
                limit: read_u64(&memory.join("memory.limit_in_bytes"))?,
                oom_kill: oom.get("oom_kill").copied().unwrap_or(0),
                stat: read_flat_keyed(&memory.join("memory.stat"))?,
            });
        }

        Ok(metrics)
    }

    fn root_controllers(&self) -> Result<Vec<String>> {
        Ok(V1_SUBSYSTEMS
            .iter()
            .filter(|s| self.root.join(s).is_dir())
            .map(|s| s.to_string())
            .collect())
    }

    fn toggle_controllers(&self, _controllers: &[String], _enable: bool) -> Result<()> {
        // Every v1 subsystem is its own hierarchy; nothing to toggle.
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        for (_, dir) in self.subsystems() {
            remove_dir(&dir)?;
        }
        Ok(())
    }
}

impl CgroupV2 {
    pub fn new(root: &Path, path: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            path: path.to_string(),
        }
    }

    pub fn dir(&self) -> PathBuf {
        self.root.join(self.path.trim_start_matches('/'))
    }

    /// Ancestors from the root down to (excluding) the cgroup itself.
    fn ancestors(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.root.clone()];
        let components: Vec<&str> = self
            .path
            .trim_matches('/')
            .split('/')
            .filter(|c| !c.is_empty())
            .collect();
        let mut current = self.root.clone();
        for component in components.iter().take(components.len().saturating_sub(1)) {
            current = current.join(component);
            dirs.push(current.clone());
        }
        dirs
    }
}

impl CgroupOps for CgroupV2 {
    fn add_proc(&self, pid: u32) -> Result<()> {
        let dir = self.dir();
        if !dir.is_dir() {
            return Err(CgroupError::Missing(self.path.clone()));
        }
        write_file(&dir.join("cgroup.procs"), &pid.to_string())
    }

    fn stat(&self) -> Result<Metrics> {
        let dir = self.dir();
        if !dir.is_dir() {
            return Err(CgroupError::Missing(self.path.clone()));
        }

        let mut metrics = Metrics {
            version: 2,
            ..Default::default()
        };

        if dir.join("pids.current").exists() {
            metrics.pids = Some(PidsStat {
                current: read_u64(&dir.join("pids.current"))?.unwrap_or(0),
                limit: read_u64(&dir.join("pids.max"))?,
            });
        }

        if dir.join("cpu.stat").exists() {
            let stat = read_flat_keyed(&dir.join("cpu.stat"))?;
            let get = |key: &str| stat.get(key).copied().unwrap_or(0);
            metrics.cpu = Some(CpuStat {
                usage_usec: get("usage_usec"),
                user_usec: get("user_usec"),
                system_usec: get("system_usec"),
                nr_periods: get("nr_periods"),
                nr_throttled: get("nr_throttled"),
                throttled_usec: get("throttled_usec"),
            });
        }

        if dir.join("memory.current").exists() {
            let events = read_flat_keyed(&dir.join("memory.events"))?;
            metrics.memory = Some(MemoryStat {
                usage: read_u64(&dir.join("memory.current"))?.unwrap_or(0),
                limit: read_u64(&dir.join("memory.max"))?,
                oom_kill: events.get("oom_kill").copied().unwrap_or(0),
                stat: read_flat_keyed(&dir.join("memory.stat"))?,
            });
        }

        Ok(metrics)
    }

    fn root_controllers(&self) -> Result<Vec<String>> {
        let file = self.root.join("cgroup.controllers");
        let contents = read_file(&file)?;
        Ok(contents.split_whitespace().map(str::to_string).collect())
    }

    fn toggle_controllers(&self, controllers: &[String], enable: bool) -> Result<()> {
        if controllers.is_empty() {
            return Ok(());
        }
        let sign = if enable { '+' } else { '-' };
        let value = controllers
            .iter()
            .map(|c| format!("{sign}{c}"))
            .collect::<Vec<_>>()
            .join(" ");
        for dir in self.ancestors() {
            write_file(&dir.join("cgroup.subtree_control"), &value)?;
        }
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        remove_dir(&self.dir())
    }
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| CgroupError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn write_file(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).map_err(|source| CgroupError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn remove_dir(path: &Path) -> Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CgroupError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Read a single-value file; `max` (and v1's huge "unlimited") map to `None`.
fn read_u64(path: &Path) -> Result<Option<u64>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = read_file(path)?;
    let value = contents.trim();
    if value == "max" {
        return Ok(None);
    }
    let parsed = value.parse::<u64>().map_err(|e| CgroupError::Parse {
        file: path.display().to_string(),
        reason: e.to_string(),
    })?;
    // v1 reports "no limit" as PAGE_COUNTER_MAX scaled to bytes.
    if parsed >= 0x7FFF_FFFF_FFFF_F000 {
        return Ok(None);
    }
    Ok(Some(parsed))
}

/// Parse "key value" lines, skipping malformed ones.
fn read_flat_keyed(path: &Path) -> Result<BTreeMap<String, u64>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    Ok(parse_flat_keyed(&read_file(path)?))
}

pub(crate) fn parse_flat_keyed(contents: &str) -> BTreeMap<String, u64> {
    contents
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(' ')?;
            Some((key.to_string(), value.trim().parse().ok()?))
        })
        .collect()
}
