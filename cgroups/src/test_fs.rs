//! In-memory cgroup filesystem for tests.
//!
//! New directories below a mount point are populated with the interface files
//! of their parent, removing a directory fails while it still holds subgroups
//! or tasks, and writing a pid into a tasks file moves it out of every other
//! group of the same hierarchy.
use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    unistd::{Gid, Uid},
};

use crate::common::{
    CgroupVersion, WrappedIoError, CGROUP_CONTROLLERS, CGROUP_PROCS, CGROUP_SUBTREE_CONTROL,
    CGROUP_TASKS,
};
use crate::fs::{
    CgroupFs, ControllerRecord, DirEntry, FileType, Metadata, MountRecord, ScanError,
};

#[derive(Debug, Clone, Copy)]
struct Attrs {
    mode: u32,
    uid: u32,
    gid: u32,
}

#[derive(Debug, Clone)]
enum Node {
    Dir(Attrs),
    File { content: String, attrs: Attrs },
}

impl Node {
    fn attrs_mut(&mut self) -> &mut Attrs {
        match self {
            Node::Dir(attrs) => attrs,
            Node::File { attrs, .. } => attrs,
        }
    }
}

const DIR_ATTRS: Attrs = Attrs {
    mode: 0o755,
    uid: 0,
    gid: 0,
};

const FILE_ATTRS: Attrs = Attrs {
    mode: 0o644,
    uid: 0,
    gid: 0,
};

fn io_err(errno: Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno as i32)
}

fn is_tasks_file(path: &Path) -> bool {
    matches!(
        path.file_name().and_then(|n| n.to_str()),
        Some(CGROUP_TASKS) | Some(CGROUP_PROCS)
    )
}

#[derive(Debug, Default)]
pub struct FakeCgroupFs {
    nodes: RefCell<BTreeMap<PathBuf, Node>>,
    controllers: RefCell<Vec<ControllerRecord>>,
    mounts: RefCell<Vec<MountRecord>>,
    removed_dirs: RefCell<Vec<PathBuf>>,
    failing_writes: RefCell<HashSet<PathBuf>>,
    fail_ownership: Cell<bool>,
}

impl FakeCgroupFs {
    pub fn new() -> Self {
        let fs = Self::default();
        fs.nodes
            .borrow_mut()
            .insert(PathBuf::from("/"), Node::Dir(DIR_ATTRS));
        fs
    }

    /// Registers a controller in the emulated /proc/cgroups.
    pub fn add_controller(&self, name: &str, hierarchy: u32) {
        let mut controllers = self.controllers.borrow_mut();
        match controllers.iter_mut().find(|c| c.name == name) {
            Some(record) => record.hierarchy = hierarchy,
            None => controllers.push(ControllerRecord {
                name: name.to_owned(),
                hierarchy,
                num_cgroups: 1,
                enabled: true,
            }),
        }
    }

    /// Mounts a cgroup v1 hierarchy with the given controllers.
    pub fn mount_v1<P: AsRef<Path>>(&self, mount_point: P, controllers: &[&str], hierarchy: u32) {
        let mount_point = mount_point.as_ref();
        self.add_dir_all(mount_point);
        for controller in controllers {
            self.add_controller(controller, hierarchy);
        }
        self.set_file(mount_point.join(CGROUP_TASKS), "");
        self.set_file(mount_point.join(CGROUP_PROCS), "");

        let mut options = vec!["rw".to_owned()];
        options.extend(controllers.iter().map(|c| c.to_string()));
        self.mounts.borrow_mut().push(MountRecord {
            version: CgroupVersion::V1,
            mount_point: mount_point.to_path_buf(),
            options,
        });
    }

    /// Mounts the unified hierarchy offering the given controllers.
    pub fn mount_v2<P: AsRef<Path>>(&self, mount_point: P, controllers: &[&str]) {
        let mount_point = mount_point.as_ref();
        self.add_dir_all(mount_point);
        self.set_file(mount_point.join(CGROUP_PROCS), "");
        self.set_file(mount_point.join(CGROUP_CONTROLLERS), &controllers.join(" "));
        self.set_file(mount_point.join(CGROUP_SUBTREE_CONTROL), "");
        self.mounts.borrow_mut().push(MountRecord {
            version: CgroupVersion::V2,
            mount_point: mount_point.to_path_buf(),
            options: vec!["rw".to_owned()],
        });
    }

    /// Creates a directory and its missing parents.
    pub fn add_dir_all<P: AsRef<Path>>(&self, path: P) {
        let mut nodes = self.nodes.borrow_mut();
        for ancestor in path.as_ref().ancestors() {
            nodes
                .entry(ancestor.to_path_buf())
                .or_insert(Node::Dir(DIR_ATTRS));
        }
    }

    /// Creates or replaces a file, creating missing parent directories.
    pub fn set_file<P: AsRef<Path>>(&self, path: P, content: &str) {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            self.add_dir_all(parent);
        }
        let mut nodes = self.nodes.borrow_mut();
        let attrs = match nodes.get(path) {
            Some(Node::File { attrs, .. }) => *attrs,
            _ => FILE_ATTRS,
        };
        nodes.insert(
            path.to_path_buf(),
            Node::File {
                content: content.to_owned(),
                attrs,
            },
        );
    }

    pub fn set_file_mode<P: AsRef<Path>>(&self, path: P, mode: u32) {
        if let Some(node) = self.nodes.borrow_mut().get_mut(path.as_ref()) {
            node.attrs_mut().mode = mode;
        }
    }

    pub fn file<P: AsRef<Path>>(&self, path: P) -> Option<String> {
        match self.nodes.borrow().get(path.as_ref()) {
            Some(Node::File { content, .. }) => Some(content.clone()),
            _ => None,
        }
    }

    pub fn mode<P: AsRef<Path>>(&self, path: P) -> Option<u32> {
        let nodes = self.nodes.borrow();
        nodes.get(path.as_ref()).map(|node| match node {
            Node::Dir(attrs) => attrs.mode,
            Node::File { attrs, .. } => attrs.mode,
        })
    }

    pub fn owner<P: AsRef<Path>>(&self, path: P) -> Option<(u32, u32)> {
        let nodes = self.nodes.borrow();
        nodes.get(path.as_ref()).map(|node| match node {
            Node::Dir(attrs) => (attrs.uid, attrs.gid),
            Node::File { attrs, .. } => (attrs.uid, attrs.gid),
        })
    }

    /// Directories removed so far, in removal order.
    pub fn removed_dirs(&self) -> Vec<PathBuf> {
        self.removed_dirs.borrow().clone()
    }

    pub fn mounted(&self) -> Vec<MountRecord> {
        self.mounts.borrow().clone()
    }

    /// Makes every later write to `path` fail with EACCES.
    pub fn fail_writes_to<P: AsRef<Path>>(&self, path: P) {
        self.failing_writes
            .borrow_mut()
            .insert(path.as_ref().to_path_buf());
    }

    /// Makes chown and chmod fail with EPERM.
    pub fn fail_ownership(&self, fail: bool) {
        self.fail_ownership.set(fail);
    }

    fn mount_of(&self, path: &Path) -> Option<MountRecord> {
        self.mounts
            .borrow()
            .iter()
            .filter(|m| path.starts_with(&m.mount_point))
            .max_by_key(|m| m.mount_point.as_os_str().len())
            .cloned()
    }

    fn children(&self, path: &Path) -> Vec<(PathBuf, Node)> {
        self.nodes
            .borrow()
            .range(path.to_path_buf()..)
            .take_while(|(p, _)| p.starts_with(path))
            .filter(|(p, _)| p.parent() == Some(path))
            .map(|(p, n)| (p.clone(), n.clone()))
            .collect()
    }

    fn count_groups(&self, mount_point: &Path) -> u32 {
        self.nodes
            .borrow()
            .iter()
            .filter(|(p, n)| matches!(n, Node::Dir(_)) && p.starts_with(mount_point))
            .count() as u32
    }

    fn move_task(&self, target: &Path, pid: &str) {
        let root = self
            .mount_of(target)
            .map(|m| m.mount_point)
            .unwrap_or_else(|| PathBuf::from("/"));
        let mut nodes = self.nodes.borrow_mut();
        for (path, node) in nodes.iter_mut() {
            if let Node::File { content, .. } = node {
                if path.starts_with(&root) && is_tasks_file(path) {
                    *content = content
                        .lines()
                        .filter(|line| line.trim() != pid)
                        .map(|line| format!("{line}\n"))
                        .collect();
                }
            }
        }
        if let Some(Node::File { content, .. }) = nodes.get_mut(target) {
            content.push_str(pid);
            content.push('\n');
        }
    }

    fn update_subtree_control(current: &str, data: &str) -> String {
        let mut enabled: Vec<String> = current.split_whitespace().map(str::to_owned).collect();
        for word in data.split_whitespace() {
            if let Some(name) = word.strip_prefix('+') {
                if !enabled.iter().any(|c| c == name) {
                    enabled.push(name.to_owned());
                }
            } else if let Some(name) = word.strip_prefix('-') {
                enabled.retain(|c| c != name);
            }
        }
        enabled.join(" ")
    }
}

impl CgroupFs for FakeCgroupFs {
    fn controllers(&self) -> Result<Vec<ControllerRecord>, ScanError> {
        let mounts = self.mounts.borrow().clone();
        Ok(self
            .controllers
            .borrow()
            .iter()
            .map(|record| {
                let mut record = record.clone();
                let mount = mounts.iter().find(|m| {
                    m.version == CgroupVersion::V1 && m.options.contains(&record.name)
                });
                if let Some(mount) = mount {
                    record.num_cgroups = self.count_groups(&mount.mount_point);
                }
                record
            })
            .collect())
    }

    fn cgroup_mounts(&self) -> Result<Vec<MountRecord>, ScanError> {
        Ok(self.mounts.borrow().clone())
    }

    fn create_dir(&self, path: &Path, mode: Option<u32>) -> Result<(), WrappedIoError> {
        let wrap = |errno| WrappedIoError::CreateDir {
            err: io_err(errno),
            path: path.to_path_buf(),
        };
        let parent = path.parent().ok_or_else(|| wrap(Errno::EEXIST))?;
        match self.nodes.borrow().get(parent) {
            Some(Node::Dir(_)) => {}
            Some(Node::File { .. }) => return Err(wrap(Errno::ENOTDIR)),
            None => return Err(wrap(Errno::ENOENT)),
        }
        if self.nodes.borrow().contains_key(path) {
            return Err(wrap(Errno::EEXIST));
        }

        let attrs = Attrs {
            mode: mode.unwrap_or(DIR_ATTRS.mode),
            ..DIR_ATTRS
        };
        self.nodes
            .borrow_mut()
            .insert(path.to_path_buf(), Node::Dir(attrs));

        // the kernel populates a new group with the interface files of its parent
        if self.mount_of(parent).is_some() {
            let parent_subtree = self
                .file(parent.join(CGROUP_SUBTREE_CONTROL))
                .unwrap_or_default();
            for (file, node) in self.children(parent) {
                if let (Node::File { content, attrs }, Some(name)) = (node, file.file_name()) {
                    let content = if is_tasks_file(&file) || name == CGROUP_SUBTREE_CONTROL {
                        String::new()
                    } else if name == CGROUP_CONTROLLERS {
                        parent_subtree.clone()
                    } else {
                        content
                    };
                    self.nodes.borrow_mut().insert(
                        path.join(name),
                        Node::File {
                            content,
                            attrs: Attrs {
                                uid: 0,
                                gid: 0,
                                ..attrs
                            },
                        },
                    );
                }
            }
        }

        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> Result<(), WrappedIoError> {
        let wrap = |errno| WrappedIoError::RemoveDir {
            err: io_err(errno),
            path: path.to_path_buf(),
        };
        match self.nodes.borrow().get(path) {
            Some(Node::Dir(_)) => {}
            Some(Node::File { .. }) => return Err(wrap(Errno::ENOTDIR)),
            None => return Err(wrap(Errno::ENOENT)),
        }
        if self.mounts.borrow().iter().any(|m| m.mount_point == path) {
            return Err(wrap(Errno::EBUSY));
        }

        let children = self.children(path);
        for (child, node) in &children {
            match node {
                Node::Dir(_) => return Err(wrap(Errno::ENOTEMPTY)),
                Node::File { content, .. }
                    if is_tasks_file(child) && !content.trim().is_empty() =>
                {
                    return Err(wrap(Errno::EBUSY))
                }
                _ => {}
            }
        }

        let mut nodes = self.nodes.borrow_mut();
        for (child, _) in children {
            nodes.remove(&child);
        }
        nodes.remove(path);
        self.removed_dirs.borrow_mut().push(path.to_path_buf());
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>, WrappedIoError> {
        match self.nodes.borrow().get(path) {
            Some(Node::Dir(_)) => {}
            Some(Node::File { .. }) => {
                return Err(WrappedIoError::Read {
                    err: io_err(Errno::ENOTDIR),
                    path: path.to_path_buf(),
                })
            }
            None => {
                return Err(WrappedIoError::Read {
                    err: io_err(Errno::ENOENT),
                    path: path.to_path_buf(),
                })
            }
        }

        Ok(self
            .children(path)
            .into_iter()
            .filter_map(|(child, node)| {
                let name = child.file_name()?.to_string_lossy().into_owned();
                let file_type = match node {
                    Node::Dir(_) => FileType::Dir,
                    Node::File { .. } => FileType::File,
                };
                Some(DirEntry { name, file_type })
            })
            .collect())
    }

    fn read_file(&self, path: &Path) -> Result<String, WrappedIoError> {
        let wrap = |errno| WrappedIoError::Read {
            err: io_err(errno),
            path: path.to_path_buf(),
        };
        match self.nodes.borrow().get(path) {
            Some(Node::File { content, .. }) => Ok(content.clone()),
            Some(Node::Dir(_)) => Err(wrap(Errno::EISDIR)),
            None => Err(wrap(Errno::ENOENT)),
        }
    }

    fn write_file(&self, path: &Path, data: &str) -> Result<(), WrappedIoError> {
        let wrap = |errno| WrappedIoError::Write {
            err: io_err(errno),
            path: path.to_path_buf(),
            data: data.to_owned(),
        };
        let current = match self.nodes.borrow().get(path) {
            Some(Node::File { content, .. }) => content.clone(),
            Some(Node::Dir(_)) => {
                return Err(WrappedIoError::Open {
                    err: io_err(Errno::EISDIR),
                    path: path.to_path_buf(),
                })
            }
            None => {
                return Err(WrappedIoError::Open {
                    err: io_err(Errno::ENOENT),
                    path: path.to_path_buf(),
                })
            }
        };
        if self.failing_writes.borrow().contains(path) {
            return Err(wrap(Errno::EACCES));
        }

        if is_tasks_file(path) {
            let pid = data.trim();
            if pid.parse::<i32>().is_err() {
                return Err(wrap(Errno::EINVAL));
            }
            self.move_task(path, pid);
            return Ok(());
        }

        let content = if path.file_name().and_then(|n| n.to_str()) == Some(CGROUP_SUBTREE_CONTROL)
        {
            Self::update_subtree_control(&current, data)
        } else {
            data.to_owned()
        };
        if let Some(Node::File { content: c, .. }) = self.nodes.borrow_mut().get_mut(path) {
            *c = content;
        }
        Ok(())
    }

    fn metadata(&self, path: &Path) -> Result<Metadata, WrappedIoError> {
        match self.nodes.borrow().get(path) {
            Some(Node::Dir(attrs)) => Ok(Metadata {
                file_type: FileType::Dir,
                mode: attrs.mode,
                uid: attrs.uid,
                gid: attrs.gid,
            }),
            Some(Node::File { attrs, .. }) => Ok(Metadata {
                file_type: FileType::File,
                mode: attrs.mode,
                uid: attrs.uid,
                gid: attrs.gid,
            }),
            None => Err(WrappedIoError::Other {
                err: io_err(Errno::ENOENT),
                path: path.to_path_buf(),
            }),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        self.nodes.borrow().contains_key(path)
    }

    fn chown(&self, path: &Path, uid: Option<Uid>, gid: Option<Gid>) -> Result<(), WrappedIoError> {
        let wrap = |errno| WrappedIoError::Chown {
            err: io_err(errno),
            path: path.to_path_buf(),
        };
        if self.fail_ownership.get() {
            return Err(wrap(Errno::EPERM));
        }
        let mut nodes = self.nodes.borrow_mut();
        let attrs = nodes
            .get_mut(path)
            .ok_or_else(|| wrap(Errno::ENOENT))?
            .attrs_mut();
        if let Some(uid) = uid {
            attrs.uid = uid.as_raw();
        }
        if let Some(gid) = gid {
            attrs.gid = gid.as_raw();
        }
        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<(), WrappedIoError> {
        let wrap = |errno| WrappedIoError::Chmod {
            err: io_err(errno),
            path: path.to_path_buf(),
        };
        if self.fail_ownership.get() {
            return Err(wrap(Errno::EPERM));
        }
        let mut nodes = self.nodes.borrow_mut();
        nodes
            .get_mut(path)
            .ok_or_else(|| wrap(Errno::ENOENT))?
            .attrs_mut()
            .mode = mode;
        Ok(())
    }

    fn mount(&self, target: &Path, fstype: &str, options: &str) -> Result<(), WrappedIoError> {
        let wrap = |errno| WrappedIoError::Mount {
            err: io_err(errno),
            path: target.to_path_buf(),
        };
        if !matches!(self.nodes.borrow().get(target), Some(Node::Dir(_))) {
            return Err(wrap(Errno::ENOENT));
        }
        if self
            .mounts
            .borrow()
            .iter()
            .any(|m| m.mount_point == target)
        {
            return Err(wrap(Errno::EBUSY));
        }

        match fstype {
            "cgroup" => {
                let controllers: Vec<&str> = options
                    .split(',')
                    .filter(|o| !o.is_empty() && *o != "rw" && *o != "ro" && !o.contains('='))
                    .collect();
                let known = self.controllers.borrow().clone();
                if controllers.is_empty()
                    || controllers
                        .iter()
                        .any(|c| !known.iter().any(|k| k.name == *c && k.hierarchy == 0))
                {
                    return Err(wrap(Errno::EBUSY));
                }
                let hierarchy = known.iter().map(|k| k.hierarchy).max().unwrap_or(0) + 1;
                self.mount_v1(target, &controllers, hierarchy);
            }
            "cgroup2" => {
                let known: Vec<String> = self
                    .controllers
                    .borrow()
                    .iter()
                    .filter(|c| c.hierarchy == 0)
                    .map(|c| c.name.clone())
                    .collect();
                let known: Vec<&str> = known.iter().map(String::as_str).collect();
                self.mount_v2(target, &known);
            }
            _ => return Err(wrap(Errno::ENODEV)),
        }
        Ok(())
    }

    fn umount(&self, target: &Path) -> Result<(), WrappedIoError> {
        let wrap = |errno| WrappedIoError::Umount {
            err: io_err(errno),
            path: target.to_path_buf(),
        };
        let mount = self
            .mounts
            .borrow()
            .iter()
            .find(|m| m.mount_point == target)
            .cloned()
            .ok_or_else(|| wrap(Errno::EINVAL))?;
        let children = self.children(target);
        if children
            .iter()
            .any(|(_, node)| matches!(node, Node::Dir(_)))
        {
            return Err(wrap(Errno::EBUSY));
        }

        {
            let mut nodes = self.nodes.borrow_mut();
            for (child, _) in children {
                nodes.remove(&child);
            }
        }
        self.mounts.borrow_mut().retain(|m| m.mount_point != target);
        if mount.version == CgroupVersion::V1 {
            for record in self.controllers.borrow_mut().iter_mut() {
                if mount.options.contains(&record.name) {
                    record.hierarchy = 0;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn errno(err: WrappedIoError) -> Option<i32> {
        err.errno()
    }

    #[test]
    fn test_new_group_inherits_interface_files() {
        let fs = FakeCgroupFs::new();
        fs.add_controller("cpu", 0);
        fs.mount_v1("/cg/cpu", &["cpu"], 1);
        fs.set_file("/cg/cpu/cpu.shares", "1024\n");
        fs.write_file(Path::new("/cg/cpu/tasks"), "42").unwrap();

        fs.create_dir(Path::new("/cg/cpu/a"), None).unwrap();
        assert_eq!(fs.file("/cg/cpu/a/cpu.shares").as_deref(), Some("1024\n"));
        assert_eq!(fs.file("/cg/cpu/a/tasks").as_deref(), Some(""));
    }

    #[test]
    fn test_remove_dir_rules() {
        let fs = FakeCgroupFs::new();
        fs.add_controller("cpu", 0);
        fs.mount_v1("/cg/cpu", &["cpu"], 1);
        fs.create_dir(Path::new("/cg/cpu/a"), None).unwrap();
        fs.create_dir(Path::new("/cg/cpu/a/b"), None).unwrap();

        let err = fs.remove_dir(Path::new("/cg/cpu/a")).unwrap_err();
        assert_eq!(errno(err), Some(Errno::ENOTEMPTY as i32));

        fs.write_file(Path::new("/cg/cpu/a/b/tasks"), "7").unwrap();
        let err = fs.remove_dir(Path::new("/cg/cpu/a/b")).unwrap_err();
        assert_eq!(errno(err), Some(Errno::EBUSY as i32));

        fs.write_file(Path::new("/cg/cpu/tasks"), "7").unwrap();
        assert_eq!(fs.file("/cg/cpu/a/b/tasks").as_deref(), Some(""));
        fs.remove_dir(Path::new("/cg/cpu/a/b")).unwrap();
        fs.remove_dir(Path::new("/cg/cpu/a")).unwrap();
        assert_eq!(
            fs.removed_dirs(),
            vec![PathBuf::from("/cg/cpu/a/b"), PathBuf::from("/cg/cpu/a")]
        );
    }

    #[test]
    fn test_subtree_control_updates() {
        assert_eq!(
            FakeCgroupFs::update_subtree_control("cpu", "+memory +cpu"),
            "cpu memory"
        );
        assert_eq!(
            FakeCgroupFs::update_subtree_control("cpu memory", "-cpu"),
            "memory"
        );
    }

    #[test]
    fn test_mount_and_umount() {
        let fs = FakeCgroupFs::new();
        fs.add_controller("cpu", 0);
        fs.add_controller("cpuacct", 0);
        fs.add_dir_all("/cg/cpu");

        let target = Path::new("/cg/cpu");
        fs.mount(target, "cgroup", "cpu,cpuacct").unwrap();
        let records = fs.controllers().unwrap();
        assert!(records.iter().all(|r| r.hierarchy == 1));
        assert_eq!(fs.cgroup_mounts().unwrap().len(), 1);

        let err = fs.mount(Path::new("/cg/cpu"), "cgroup", "cpu").unwrap_err();
        assert_eq!(errno(err), Some(Errno::EBUSY as i32));

        fs.umount(Path::new("/cg/cpu")).unwrap();
        assert!(fs.cgroup_mounts().unwrap().is_empty());
        assert!(fs.controllers().unwrap().iter().all(|r| r.hierarchy == 0));
    }
}
