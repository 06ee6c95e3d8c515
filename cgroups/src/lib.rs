//! Control groups provide a way of controlling groups of processes.
//! This crate discovers the mounted cgroup hierarchies, describes groups and
//! their controller parameters in memory and synchronizes those descriptions
//! with the kernel, on cgroup v1 as well as on the unified v2 hierarchy.
#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod common;
pub mod controller;
pub mod error;
pub mod fs;
pub mod group;
pub mod hierarchy;
pub mod manager;
mod test;
pub mod test_fs;
pub mod walk;

pub use controller::{compare_controllers, Controller, Value};
pub use error::{Error, Result};
pub use group::{compare_cgroup, Cgroup, GroupState};
pub use hierarchy::{ControllerCursor, HierarchyInfo, HierarchyRegistry};
pub use manager::{DeleteFlags, Manager};
pub use walk::{FileInfo, TreeWalk, WalkOrder};
