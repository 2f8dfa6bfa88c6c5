//! Host-level helpers for the shim: reaping, cgroups and OOM notifications.

pub mod cgroup;
pub mod oom;
pub mod reaper;
