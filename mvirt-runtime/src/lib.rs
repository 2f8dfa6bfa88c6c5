//! mvirt-runtime - daemon side of the container task runtime.
//!
//! Launches one `mvirt-shim` per task group, persists what is needed to
//! find it again after a restart and bridges task calls to it over gRPC.
//!
//! - **TaskManager**: create/get/list/delete tasks
//! - **ShimManager**: shim bootstrap, sandbox attach, restore, dead shim cleanup
//! - **EventBus**: task events of all shims

pub mod bundle;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod shim;
pub mod task;

pub use config::RuntimeConfig;
pub use error::{Error, ErrorKind, Result};
pub use events::{EventBus, TaskEvent};
pub use manager::ShimManager;
pub use shim::{ShimInstance, TaskStdio};
pub use task::{CreateOpts, Task, TaskManager};
