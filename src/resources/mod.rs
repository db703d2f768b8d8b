//! Resource layer: cgroup membership
//!
//! Only membership lives here; controller configuration is owned by the
//! daemon's resource manager outside this core.

pub mod cgroup;

pub use cgroup::Cgroup;
