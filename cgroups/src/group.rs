use crate::common::{normalize_group_name, NO_PERMS, NO_UID_GID};
use crate::controller::{compare_controllers, Controller};
use crate::error::{Error, Result};

/// Where a descriptor stands relative to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupState {
    #[default]
    Uncommitted,
    Creating,
    Committed,
    Deleting,
    Deleted,
}

/// Owners applied to a group. `NO_UID_GID` leaves the kernel default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub tasks_uid: u32,
    pub tasks_gid: u32,
    pub control_uid: u32,
    pub control_gid: u32,
}

impl Default for Ownership {
    fn default() -> Self {
        Self {
            tasks_uid: NO_UID_GID,
            tasks_gid: NO_UID_GID,
            control_uid: NO_UID_GID,
            control_gid: NO_UID_GID,
        }
    }
}

/// Modes applied to a group. `NO_PERMS` leaves the kernel default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub dir_mode: u32,
    pub file_mode: u32,
    pub task_mode: u32,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            dir_mode: NO_PERMS,
            file_mode: NO_PERMS,
            task_mode: NO_PERMS,
        }
    }
}

/// In-memory description of a control group. Nothing reaches the kernel
/// until the descriptor is passed to a [`Manager`](crate::manager::Manager).
#[derive(Debug, Clone, Default)]
pub struct Cgroup {
    name: String,
    controllers: Vec<Controller>,
    ownership: Ownership,
    permissions: Permissions,
    state: GroupState,
}

impl Cgroup {
    pub fn new(name: &str) -> Self {
        Self {
            name: normalize_group_name(name),
            ..Default::default()
        }
    }

    /// Group name relative to the hierarchy root, `/` for the root group.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: GroupState) {
        self.state = state;
    }

    /// Attaches an empty controller. An earlier controller of the same name is
    /// replaced.
    pub fn add_controller(&mut self, name: &str) -> &mut Controller {
        let index = match self.controllers.iter().position(|c| c.name() == name) {
            Some(index) => {
                self.controllers[index] = Controller::new(name);
                index
            }
            None => {
                self.controllers.push(Controller::new(name));
                self.controllers.len() - 1
            }
        };
        &mut self.controllers[index]
    }

    pub fn controller(&self, name: &str) -> Option<&Controller> {
        self.controllers.iter().find(|c| c.name() == name)
    }

    pub fn controller_mut(&mut self, name: &str) -> Option<&mut Controller> {
        self.controllers.iter_mut().find(|c| c.name() == name)
    }

    pub fn controllers(&self) -> &[Controller] {
        &self.controllers
    }

    pub(crate) fn controllers_mut(&mut self) -> &mut [Controller] {
        &mut self.controllers
    }

    pub(crate) fn set_controllers(&mut self, controllers: Vec<Controller>) {
        self.controllers = controllers;
    }

    pub fn remove_controllers(&mut self) {
        self.controllers.clear();
    }

    /// Replaces every controller with a copy of those of `src`. Copied values
    /// are staged for writing.
    pub fn copy_from(&mut self, src: &Cgroup) {
        self.controllers = src.controllers.clone();
        for controller in &mut self.controllers {
            controller.mark_dirty();
        }
    }

    pub fn set_uid_gid(
        &mut self,
        tasks_uid: u32,
        tasks_gid: u32,
        control_uid: u32,
        control_gid: u32,
    ) {
        self.ownership = Ownership {
            tasks_uid,
            tasks_gid,
            control_uid,
            control_gid,
        };
    }

    /// Returns `(tasks_uid, tasks_gid, control_uid, control_gid)`.
    pub fn uid_gid(&self) -> (u32, u32, u32, u32) {
        let o = &self.ownership;
        (o.tasks_uid, o.tasks_gid, o.control_uid, o.control_gid)
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub(crate) fn ownership_mut(&mut self) -> &mut Ownership {
        &mut self.ownership
    }

    pub fn set_permissions(&mut self, dir_mode: u32, file_mode: u32, task_mode: u32) {
        self.permissions = Permissions {
            dir_mode,
            file_mode,
            task_mode,
        };
    }

    /// Returns `(dir_mode, file_mode, task_mode)`.
    pub fn permissions(&self) -> (u32, u32, u32) {
        let p = &self.permissions;
        (p.dir_mode, p.file_mode, p.task_mode)
    }

    pub fn compare(&self, other: &Cgroup) -> Result<()> {
        compare_cgroup(self, other)
    }
}

/// Compares two descriptors: names, owners, the set of attached controllers
/// and every parameter. A mismatch inside a controller of the same name is a
/// `ControllerNotEqual`, anything else a `GroupNotEqual`.
pub fn compare_cgroup(a: &Cgroup, b: &Cgroup) -> Result<()> {
    if a.name != b.name
        || a.ownership != b.ownership
        || a.controllers.len() != b.controllers.len()
    {
        return Err(Error::GroupNotEqual);
    }

    for controller in &a.controllers {
        let other = b.controller(controller.name()).ok_or(Error::GroupNotEqual)?;
        compare_controllers(controller, other)?;
    }

    Ok(())
}
