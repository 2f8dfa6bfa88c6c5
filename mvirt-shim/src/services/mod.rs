//! Services hosted by the shim.
//!
//! - `task`: container and process lifecycle behind the `TaskService` RPC
//! - `events`: the bounded event queue drained by the `Events` stream

pub mod events;
pub mod task;
