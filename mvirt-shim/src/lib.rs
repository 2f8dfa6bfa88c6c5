//! mvirt-shim - per-task container shim.
//!
//! One shim process hosts the containers of a task group. It drives an
//! OCI runtime binary, reaps every process it spawns and reports exits to
//! the daemon over a gRPC `TaskService` on a Unix socket.
//!
//! ## Modes
//!
//! - **start**: spawn (or join) the shim for a task group and print its address
//! - **delete**: clean up after a shim that died
//! - **serve** (no subcommand): run the task service on the inherited socket

pub mod bootstrap;
pub mod config;
pub mod container;
pub mod error;
pub mod oci;
pub mod runtime;
pub mod services;
pub mod utils;

pub mod proto {
    tonic::include_proto!("mvirt.shim.v1");
}

pub use error::{Error, ErrorKind, Result};
