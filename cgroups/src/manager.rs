//! Synchronizes group descriptors with the kernel.
//!
//! A [`Manager`] creates, modifies, reads back and deletes the directories of
//! a group in every hierarchy its controllers are mounted on. Nothing is
//! cached between calls: every operation works from the registry snapshot it
//! was given and the current content of the cgroup filesystem.
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use nix::{
    errno::Errno,
    unistd::{Gid, Pid, Uid},
};

use crate::common::{
    is_root_group, mask_with_owner, parent_group_name, CgroupVersion, PathBufExt,
    WrappedIoError, CGROUP_CONTROLLERS, CGROUP_PROCS, CGROUP_SUBTREE_CONTROL, CGROUP_TASKS,
    NO_PERMS, NO_UID_GID,
};
use crate::controller::{Controller, Value};
use crate::error::{Error, Result};
use crate::fs::{CgroupFs, FileType, KernelFs};
use crate::group::{Cgroup, GroupState};
use crate::hierarchy::HierarchyRegistry;
use crate::walk::{TreeWalk, WalkOrder};

const CGROUP_THREADS: &str = "cgroup.threads";

bitflags! {
    /// How [`Manager::delete`] treats tasks and subgroups.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeleteFlags: u32 {
        /// Log failures to move tasks to the parent group and remove anyway.
        const IGNORE_MIGRATION = 1;
        /// Remove every subgroup first, deepest first.
        const RECURSIVE = 2;
        /// Refuse to remove a group that still holds tasks or subgroups.
        const EMPTY_ONLY = 4;
    }
}

/// The directory of a group in one mounted hierarchy.
#[derive(Debug)]
struct Target {
    mount_point: PathBuf,
    version: CgroupVersion,
    /// Group directory relative to the mount point, empty for the root group.
    relative: PathBuf,
    path: PathBuf,
    /// Indexes of the group controllers living in this hierarchy.
    controllers: Vec<usize>,
}

impl Target {
    fn tasks_file(&self) -> PathBuf {
        self.path.join(self.version.tasks_file())
    }
}

fn is_tasks_file(name: &str) -> bool {
    matches!(name, CGROUP_TASKS | CGROUP_PROCS | CGROUP_THREADS)
}

fn to_uid(id: u32) -> Option<Uid> {
    (id != NO_UID_GID).then(|| Uid::from_raw(id))
}

fn to_gid(id: u32) -> Option<Gid> {
    (id != NO_UID_GID).then(|| Gid::from_raw(id))
}

fn remove_dir_error(path: &Path, errno: Errno) -> Error {
    WrappedIoError::RemoveDir {
        err: std::io::Error::from_raw_os_error(errno as i32),
        path: path.to_path_buf(),
    }
    .into()
}

pub struct Manager<'a, F: CgroupFs = KernelFs> {
    registry: &'a HierarchyRegistry,
    fs: &'a F,
}

impl<'a, F: CgroupFs> Manager<'a, F> {
    pub fn new(registry: &'a HierarchyRegistry, fs: &'a F) -> Self {
        Self { registry, fs }
    }

    pub fn registry(&self) -> &HierarchyRegistry {
        self.registry
    }

    /// Resolves the hierarchies of every attached controller. Controllers
    /// sharing a mount point share a target.
    fn targets(&self, cg: &Cgroup) -> Result<Vec<Target>> {
        if cg.controllers().is_empty() {
            return Err(Error::NoControllers(cg.name().to_owned()));
        }

        let relative = Path::new("").join_group(cg.name())?;
        let mut targets: Vec<Target> = Vec::new();
        for (index, controller) in cg.controllers().iter().enumerate() {
            let mount_point = self.registry.lookup_mount_point(controller.name())?;
            if let Some(target) = targets.iter_mut().find(|t| t.mount_point == mount_point) {
                target.controllers.push(index);
                continue;
            }

            let version = self
                .registry
                .hierarchy(controller.name())
                .map(|h| h.version)
                .unwrap_or(CgroupVersion::V1);
            targets.push(Target {
                mount_point: mount_point.to_path_buf(),
                version,
                path: mount_point.join_group(cg.name())?,
                relative: relative.clone(),
                controllers: vec![index],
            });
        }

        Ok(targets)
    }

    /// Creates the group in every hierarchy of its controllers, writes the
    /// staged parameters and applies ownership and permissions.
    ///
    /// With `ignore_ownership` failures to change owners or modes are logged
    /// and skipped. A failed parameter write leaves whatever was created so
    /// far in place.
    pub fn create(&self, cg: &mut Cgroup, ignore_ownership: bool) -> Result<()> {
        let targets = self.targets(cg)?;
        cg.set_state(GroupState::Creating);

        for target in &targets {
            self.create_dirs(target, cg)?;
            for &index in &target.controllers {
                for (param, value) in cg.controllers()[index].values() {
                    self.write_value(target, param, value)?;
                }
            }
            self.apply_ownership(target, cg, ignore_ownership)?;
        }

        for controller in cg.controllers_mut() {
            controller.mark_clean();
        }
        cg.set_state(GroupState::Committed);
        log::debug!("created group {}", cg.name());
        Ok(())
    }

    /// Reads the parent of `cg` from the kernel, copies its controllers and
    /// values into `cg` and creates it.
    pub fn create_from_parent(&self, cg: &mut Cgroup, ignore_ownership: bool) -> Result<()> {
        let mut parent = Cgroup::new(&parent_group_name(cg.name()));
        self.get(&mut parent)?;
        log::debug!(
            "creating {} from the parameters of {}",
            cg.name(),
            parent.name()
        );
        cg.copy_from(&parent);
        self.create(cg, ignore_ownership)
    }

    /// Writes the parameters changed since the group was created, read or
    /// last modified.
    pub fn modify(&self, cg: &mut Cgroup) -> Result<()> {
        if cg.state() != GroupState::Committed {
            return Err(Error::NotCommitted(cg.name().to_owned()));
        }

        let targets = self.targets(cg)?;
        for target in &targets {
            for &index in &target.controllers {
                for (param, value) in cg.controllers()[index].dirty_values() {
                    self.write_value(target, param, value)?;
                }
            }
        }

        for controller in cg.controllers_mut() {
            controller.mark_clean();
        }
        Ok(())
    }

    /// Removes the group from every hierarchy of its controllers in which it
    /// exists. Tasks are moved to the parent group first.
    pub fn delete(&self, cg: &mut Cgroup, flags: DeleteFlags) -> Result<()> {
        if flags.contains(DeleteFlags::RECURSIVE | DeleteFlags::EMPTY_ONLY) {
            return Err(Error::InvalidFlagCombination);
        }

        let targets = self.targets(cg)?;
        let existing: Vec<&Target> = targets
            .iter()
            .filter(|t| self.fs.exists(&t.path))
            .collect();
        if existing.is_empty() {
            return Err(Error::GroupNotFound(cg.name().to_owned()));
        }

        cg.set_state(GroupState::Deleting);
        let parent = parent_group_name(cg.name());
        let root = is_root_group(cg.name());
        for target in existing {
            let parent_tasks = target
                .mount_point
                .join_group(&parent)?
                .join(target.version.tasks_file());
            if flags.contains(DeleteFlags::RECURSIVE) {
                self.delete_tree(target, &parent_tasks, root, flags)?;
            } else {
                self.delete_single(target, &parent_tasks, root, flags)?;
            }
        }

        cg.set_state(GroupState::Deleted);
        log::debug!("deleted group {}", cg.name());
        Ok(())
    }

    fn delete_single(
        &self,
        target: &Target,
        parent_tasks: &Path,
        root: bool,
        flags: DeleteFlags,
    ) -> Result<()> {
        if root {
            return Err(remove_dir_error(&target.path, Errno::EBUSY));
        }

        let entries = self.fs.read_dir(&target.path)?;
        if entries.iter().any(|e| e.file_type == FileType::Dir) {
            return Err(remove_dir_error(&target.path, Errno::ENOTEMPTY));
        }
        if flags.contains(DeleteFlags::EMPTY_ONLY)
            && !self.read_tasks(&target.path, target.version)?.is_empty()
        {
            return Err(remove_dir_error(&target.path, Errno::EBUSY));
        }

        self.migrate_tasks(&target.path, parent_tasks, target.version, flags)?;
        self.fs.remove_dir(&target.path)?;
        Ok(())
    }

    fn delete_tree(
        &self,
        target: &Target,
        parent_tasks: &Path,
        root: bool,
        flags: DeleteFlags,
    ) -> Result<()> {
        let walk = TreeWalk::new(self.fs, &target.path, 0, WalkOrder::PostOrder)?;
        for info in walk {
            let info = info?;
            if info.file_type != FileType::Dir || (root && info.depth == 0) {
                continue;
            }
            self.migrate_tasks(&info.full_path, parent_tasks, target.version, flags)?;
            self.fs.remove_dir(&info.full_path)?;
            log::debug!("removed {:?}", info.full_path);
        }
        Ok(())
    }

    fn migrate_tasks(
        &self,
        group: &Path,
        parent_tasks: &Path,
        version: CgroupVersion,
        flags: DeleteFlags,
    ) -> Result<()> {
        let ignore = flags.contains(DeleteFlags::IGNORE_MIGRATION);
        let tasks = match self.read_tasks(group, version) {
            Ok(tasks) => tasks,
            Err(err) if ignore => {
                log::warn!("failed to read the tasks of {group:?}: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        // the kernel accepts a single pid per write
        for pid in tasks {
            match self.fs.write_file(parent_tasks, &pid.to_string()) {
                Ok(()) => {}
                Err(err) if err.errno() == Some(Errno::ESRCH as i32) => {}
                Err(err) if ignore => {
                    log::warn!("failed to move task {pid} out of {group:?}: {err}");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Refreshes `cg` from the kernel. The controllers and values read replace
    /// whatever the descriptor held before.
    pub fn get(&self, cg: &mut Cgroup) -> Result<()> {
        let root = is_root_group(cg.name());
        let mut controllers: Vec<Controller> = Vec::new();
        let mut owners: Option<(u32, u32, u32, u32)> = None;

        for hierarchy in self.registry.hierarchies() {
            let path = hierarchy.mount_point.join_group(cg.name())?;
            if !self.fs.exists(&path) {
                continue;
            }

            let names = if hierarchy.version == CgroupVersion::V2 && !root {
                let enabled = self.fs.read_file(&path.join(CGROUP_CONTROLLERS))?;
                let enabled: Vec<&str> = enabled.split_whitespace().collect();
                hierarchy
                    .controllers
                    .into_iter()
                    .filter(|c| enabled.contains(&c.as_str()))
                    .collect()
            } else {
                hierarchy.controllers
            };

            let entries = self.fs.read_dir(&path)?;
            for name in names {
                let prefix = format!("{name}.");
                let mut values = Vec::new();
                for entry in entries
                    .iter()
                    .filter(|e| e.file_type == FileType::File && e.name.starts_with(&prefix))
                {
                    let file = path.join(&entry.name);
                    match self.fs.metadata(&file) {
                        Ok(metadata) if metadata.mode & 0o200 != 0 => {}
                        _ => continue,
                    }
                    match self.fs.read_file(&file) {
                        Ok(content) => values.push((
                            entry.name.clone(),
                            content.trim_end_matches('\n').to_owned(),
                        )),
                        Err(err) => log::debug!("skipping unreadable {file:?}: {err}"),
                    }
                }

                let mut controller = Controller::new(&name);
                controller.replace_values(values);
                controllers.push(controller);
            }

            if owners.is_none() {
                let dir = self.fs.metadata(&path)?;
                let tasks_file = path.join(hierarchy.version.tasks_file());
                let tasks = self.fs.metadata(&tasks_file)?;
                owners = Some((tasks.uid, tasks.gid, dir.uid, dir.gid));
            }
        }

        let Some((tasks_uid, tasks_gid, control_uid, control_gid)) = owners else {
            return Err(Error::GroupNotFound(cg.name().to_owned()));
        };
        cg.set_controllers(controllers);
        let ownership = cg.ownership_mut();
        ownership.tasks_uid = tasks_uid;
        ownership.tasks_gid = tasks_gid;
        ownership.control_uid = control_uid;
        ownership.control_gid = control_gid;
        cg.set_state(GroupState::Committed);
        Ok(())
    }

    /// Moves a task into the group in every hierarchy of its controllers.
    pub fn attach_task(&self, cg: &Cgroup, pid: Pid) -> Result<()> {
        for target in self.targets(cg)? {
            self.fs.write_file(&target.tasks_file(), &pid.to_string())?;
            log::debug!("attached {pid} to {:?}", target.path);
        }
        Ok(())
    }

    /// Tasks of the group in the hierarchy of `controller`.
    pub fn tasks(&self, cg: &Cgroup, controller: &str) -> Result<Vec<Pid>> {
        let mount_point = self.registry.lookup_mount_point(controller)?;
        let version = self
            .registry
            .hierarchy(controller)
            .map(|h| h.version)
            .unwrap_or(CgroupVersion::V1);
        self.read_tasks(&mount_point.join_group(cg.name())?, version)
    }

    /// Walks the groups and files below `base` in the hierarchy of
    /// `controller`. A `depth` of 0 walks the whole tree.
    pub fn walk_tree(
        &self,
        controller: &str,
        base: &str,
        depth: usize,
        order: WalkOrder,
    ) -> Result<TreeWalk<'a, F>> {
        let mount_point = self.registry.lookup_mount_point(controller)?;
        TreeWalk::new(self.fs, &mount_point.join_group(base)?, depth, order)
    }

    fn read_tasks(&self, group: &Path, version: CgroupVersion) -> Result<Vec<Pid>> {
        let content = self.fs.read_file(&group.join(version.tasks_file()))?;
        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .map(Pid::from_raw)
            .collect())
    }

    /// Creates the group directory and its missing parents. On the unified
    /// hierarchy the controllers are enabled in every ancestor first.
    fn create_dirs(&self, target: &Target, cg: &Cgroup) -> Result<()> {
        let names: Vec<&str> = target
            .controllers
            .iter()
            .map(|&i| cg.controllers()[i].name())
            .collect();

        let mut current = target.mount_point.clone();
        for component in target.relative.components() {
            if target.version == CgroupVersion::V2 {
                self.enable_controllers(&current, &names)?;
            }
            current.push(component);
            match self.fs.create_dir(&current, None) {
                Ok(()) => log::debug!("created {current:?}"),
                Err(err) if err.errno() == Some(Errno::EEXIST as i32) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn enable_controllers(&self, dir: &Path, names: &[&str]) -> Result<()> {
        let subtree_control = dir.join(CGROUP_SUBTREE_CONTROL);
        let enabled = self.fs.read_file(&subtree_control)?;
        let enabled: Vec<&str> = enabled.split_whitespace().collect();
        for name in names.iter().filter(|n| !enabled.contains(*n)) {
            self.fs.write_file(&subtree_control, &format!("+{name}"))?;
            log::debug!("enabled {name} in {subtree_control:?}");
        }
        Ok(())
    }

    fn write_value(&self, target: &Target, param: &str, value: &Value) -> Result<()> {
        let file = target.path.join_group(param)?;
        let data = value.to_string();
        self.fs.write_file(&file, &data)?;
        log::debug!("wrote {data:?} to {file:?}");
        Ok(())
    }

    fn apply_ownership(&self, target: &Target, cg: &Cgroup, ignore: bool) -> Result<()> {
        let ownership = cg.ownership();
        let (dir_mode, file_mode, task_mode) = cg.permissions();
        let control = (to_uid(ownership.control_uid), to_gid(ownership.control_gid));
        let tasks = (to_uid(ownership.tasks_uid), to_gid(ownership.tasks_gid));

        self.chown(&target.path, control, ignore)?;
        self.chmod(&target.path, dir_mode, ignore)?;
        for entry in self.fs.read_dir(&target.path)? {
            if entry.file_type != FileType::File {
                continue;
            }
            let file = target.path.join(&entry.name);
            if is_tasks_file(&entry.name) {
                self.chown(&file, tasks, ignore)?;
                self.chmod(&file, task_mode, ignore)?;
            } else {
                self.chown(&file, control, ignore)?;
                self.chmod(&file, file_mode, ignore)?;
            }
        }
        Ok(())
    }

    fn chown(
        &self,
        path: &Path,
        (uid, gid): (Option<Uid>, Option<Gid>),
        ignore: bool,
    ) -> Result<()> {
        if uid.is_none() && gid.is_none() {
            return Ok(());
        }
        self.tolerate(self.fs.chown(path, uid, gid), ignore)
    }

    fn chmod(&self, path: &Path, mode: u32, ignore: bool) -> Result<()> {
        if mode == NO_PERMS {
            return Ok(());
        }
        let result = self
            .fs
            .metadata(path)
            .and_then(|m| self.fs.chmod(path, mask_with_owner(mode, m.mode)));
        self.tolerate(result, ignore)
    }

    fn tolerate(&self, result: Result<(), WrappedIoError>, ignore: bool) -> Result<()> {
        match result {
            Err(err) if ignore => {
                log::warn!("ignoring ownership failure: {err}");
                Ok(())
            }
            other => Ok(other?),
        }
    }
}
