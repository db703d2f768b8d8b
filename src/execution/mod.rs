//! Execution layer: task launch across namespaces
//!
//! The supervisor forks an intermediary that joins the container's
//! namespaces and clones the task; every intermediate pid travels back
//! over a private control socket before the task finally execs.
//!
//! # Pieces
//!
//! - **control**: the framed pid/ack/error socket pair
//! - **env**: the per-launch [`TaskEnv`] bundle
//! - **launcher**: supervisor and intermediary choreography
//! - **child**: configuration inside the cloned process

pub mod child;
pub mod control;
pub mod env;
pub mod launcher;

pub use control::ControlSocket;
pub use env::{CapSet, Credentials, Stdio, TaskEnv, TaskSched, Ulimit};
pub use launcher::TaskPids;
