use std::{
    cmp::Reverse,
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use cgroups::{
    common::group_depth,
    fs::{CgroupFs, FileType, KernelFs},
    group::{Ownership, Permissions},
    Cgroup, DeleteFlags, Error, HierarchyRegistry, Manager,
};
use nix::{
    errno::Errno,
    unistd::{Group, User},
};

use super::parser::{parse, Config, GroupDef, PermSpec, Principal, UNIFIED_MOUNT_KEY};
use super::{ConfigError, ParseError};

/// Realizes cgconfig.conf files on a cgroup filesystem.
pub struct ConfigLoader<F: CgroupFs = KernelFs> {
    fs: F,
    default_ownership: Ownership,
    default_permissions: Permissions,
}

impl ConfigLoader<KernelFs> {
    pub fn new() -> Self {
        Self::with_fs(KernelFs)
    }
}

impl Default for ConfigLoader<KernelFs> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
enum PrincipalKind {
    User,
    Group,
}

fn resolve(
    principal: Option<&Principal>,
    fallback: u32,
    kind: PrincipalKind,
    line: usize,
) -> Result<u32, ConfigError> {
    let name = match principal {
        None => return Ok(fallback),
        Some(Principal::Id(id)) => return Ok(*id),
        Some(Principal::Name(name)) => name,
    };

    let found = match kind {
        PrincipalKind::User => User::from_name(name).map(|u| u.map(|u| u.uid.as_raw())),
        PrincipalKind::Group => Group::from_name(name).map(|g| g.map(|g| g.gid.as_raw())),
    };
    let field = match kind {
        PrincipalKind::User => "uid",
        PrincipalKind::Group => "gid",
    };
    let message = match found {
        Ok(Some(id)) => return Ok(id),
        Ok(None) => format!("unknown name {name:?}"),
        Err(errno) => format!("failed to look up {name:?}: {errno}"),
    };
    Err(ParseError::new(line, field, message).into())
}

impl<F: CgroupFs> ConfigLoader<F> {
    pub fn with_fs(fs: F) -> Self {
        Self {
            fs,
            default_ownership: Ownership::default(),
            default_permissions: Permissions::default(),
        }
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    /// Owners and modes applied to groups the configuration leaves them
    /// unset for.
    pub fn set_default(&mut self, cg: &Cgroup) {
        let (tasks_uid, tasks_gid, control_uid, control_gid) = cg.uid_gid();
        self.default_ownership = Ownership {
            tasks_uid,
            tasks_gid,
            control_uid,
            control_gid,
        };
        let (dir_mode, file_mode, task_mode) = cg.permissions();
        self.default_permissions = Permissions {
            dir_mode,
            file_mode,
            task_mode,
        };
    }

    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<HierarchyRegistry, ConfigError> {
        let text = read_config(path.as_ref())?;
        self.load(&text)
    }

    pub fn unload_file<P: AsRef<Path>>(
        &self,
        path: P,
        flags: DeleteFlags,
    ) -> Result<(), ConfigError> {
        let text = read_config(path.as_ref())?;
        self.unload(&text, flags)
    }

    /// Mounts the hierarchies the configuration asks for and creates its
    /// groups, parents first. Groups created before a failure are kept.
    pub fn load(&self, text: &str) -> Result<HierarchyRegistry, ConfigError> {
        let config = parse(text)?;
        self.mount_hierarchies(&config)?;

        let registry = HierarchyRegistry::initialize_with(&self.fs)?;
        let manager = Manager::new(&registry, &self.fs);

        let mut groups = config
            .groups
            .iter()
            .map(|group| self.descriptor(group, config.default_perm.as_ref()))
            .collect::<Result<Vec<Cgroup>, ConfigError>>()?;
        groups.sort_by_key(|cg| group_depth(cg.name()));

        for cg in &mut groups {
            manager.create(cg, false)?;
            log::debug!("loaded group {}", cg.name());
        }
        Ok(registry)
    }

    /// Deletes the groups of the configuration, children first, then
    /// unmounts its mount points that hold no group anymore. Every group is
    /// attempted; the first failure is returned.
    pub fn unload(&self, text: &str, flags: DeleteFlags) -> Result<(), ConfigError> {
        let config = parse(text)?;
        let registry = HierarchyRegistry::initialize_with(&self.fs)?;
        let manager = Manager::new(&registry, &self.fs);
        let mut first_error: Option<ConfigError> = None;

        let mut groups: Vec<Cgroup> = config
            .groups
            .iter()
            .map(|group| {
                let mut cg = Cgroup::new(&group.name);
                for controller in &group.controllers {
                    cg.add_controller(&controller.name);
                }
                cg
            })
            .collect();
        groups.sort_by_key(|cg| Reverse(group_depth(cg.name())));

        for cg in &mut groups {
            match manager.delete(cg, flags) {
                Ok(()) => log::debug!("unloaded group {}", cg.name()),
                Err(Error::GroupNotFound(name)) => log::debug!("group {name} is already gone"),
                Err(err) => {
                    log::warn!("failed to delete group {}: {err}", cg.name());
                    first_error.get_or_insert(err.into());
                }
            }
        }

        for mount_point in mount_points(&config).into_keys() {
            if let Err(err) = self.umount_if_empty(&mount_point) {
                log::warn!("failed to unmount {mount_point:?}: {err}");
                first_error.get_or_insert(err);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Deletes every group of every mounted hierarchy and unmounts them.
    pub fn unload_all(&self) -> Result<(), ConfigError> {
        let registry = HierarchyRegistry::initialize_with(&self.fs)?;
        let manager = Manager::new(&registry, &self.fs);
        let mut first_error: Option<ConfigError> = None;

        for hierarchy in registry.hierarchies() {
            let mut root = Cgroup::new("/");
            for controller in &hierarchy.controllers {
                root.add_controller(controller);
            }
            if let Err(err) = manager.delete(&mut root, DeleteFlags::RECURSIVE) {
                log::warn!("failed to empty {:?}: {err}", hierarchy.mount_point);
                first_error.get_or_insert(err.into());
                continue;
            }
            if let Err(err) = self.fs.umount(&hierarchy.mount_point) {
                log::warn!("failed to unmount {:?}: {err}", hierarchy.mount_point);
                first_error.get_or_insert(Error::from(err).into());
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn mount_hierarchies(&self, config: &Config) -> Result<(), ConfigError> {
        let mounted = self.fs.cgroup_mounts().map_err(Error::Initialization)?;
        for (mount_point, (controllers, line)) in mount_points(config) {
            if mounted.iter().any(|m| m.mount_point == mount_point) {
                log::debug!("{mount_point:?} is already mounted");
                continue;
            }

            let unified = controllers.iter().any(|c| c == UNIFIED_MOUNT_KEY);
            if unified && controllers.len() > 1 {
                return Err(ParseError::new(
                    line,
                    UNIFIED_MOUNT_KEY,
                    "the unified hierarchy cannot share its mount point",
                )
                .into());
            }

            self.create_dir_all(&mount_point)?;
            let (fstype, options) = if unified {
                ("cgroup2", String::new())
            } else {
                ("cgroup", controllers.join(","))
            };
            self.fs
                .mount(&mount_point, fstype, &options)
                .map_err(Error::from)?;
            log::debug!("mounted {fstype} ({options}) on {mount_point:?}");
        }
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), ConfigError> {
        let mut missing: Vec<&Path> = path
            .ancestors()
            .take_while(|p| !self.fs.exists(p))
            .collect();
        missing.reverse();
        for dir in missing {
            match self.fs.create_dir(dir, None) {
                Ok(()) => {}
                Err(err) if err.errno() == Some(Errno::EEXIST as i32) => {}
                Err(err) => return Err(Error::from(err).into()),
            }
        }
        Ok(())
    }

    fn umount_if_empty(&self, mount_point: &Path) -> Result<(), ConfigError> {
        let mounted = self.fs.cgroup_mounts().map_err(Error::Initialization)?;
        if !mounted.iter().any(|m| m.mount_point == mount_point) {
            return Ok(());
        }

        let entries = self.fs.read_dir(mount_point).map_err(Error::from)?;
        if entries.iter().any(|e| e.file_type == FileType::Dir) {
            log::debug!("{mount_point:?} still holds groups");
            return Ok(());
        }
        self.fs.umount(mount_point).map_err(Error::from)?;
        Ok(())
    }

    /// Builds the descriptor of a configured group. Owners and modes come
    /// from the group, then the `default` block, then `set_default`.
    fn descriptor(
        &self,
        group: &GroupDef,
        default_perm: Option<&PermSpec>,
    ) -> Result<Cgroup, ConfigError> {
        let mut cg = Cgroup::new(&group.name);
        for def in &group.controllers {
            let controller = cg.add_controller(&def.name);
            for (param, value) in &def.params {
                controller.add_value_string(param, value)?;
            }
        }

        let perm = group.perm.as_ref();
        let pick = |get: fn(&PermSpec) -> Option<&Principal>| {
            perm.and_then(get).or_else(|| default_perm.and_then(get))
        };
        let owners = &self.default_ownership;
        let tasks_uid = resolve(
            pick(|p| p.task.uid.as_ref()),
            owners.tasks_uid,
            PrincipalKind::User,
            group.line,
        )?;
        let tasks_gid = resolve(
            pick(|p| p.task.gid.as_ref()),
            owners.tasks_gid,
            PrincipalKind::Group,
            group.line,
        )?;
        let control_uid = resolve(
            pick(|p| p.admin.uid.as_ref()),
            owners.control_uid,
            PrincipalKind::User,
            group.line,
        )?;
        let control_gid = resolve(
            pick(|p| p.admin.gid.as_ref()),
            owners.control_gid,
            PrincipalKind::Group,
            group.line,
        )?;
        cg.set_uid_gid(tasks_uid, tasks_gid, control_uid, control_gid);

        let mode = |get: fn(&PermSpec) -> Option<u32>, fallback: u32| {
            perm.and_then(get)
                .or_else(|| default_perm.and_then(get))
                .unwrap_or(fallback)
        };
        let modes = &self.default_permissions;
        cg.set_permissions(
            mode(|p| p.admin.dperm, modes.dir_mode),
            mode(|p| p.admin.fperm, modes.file_mode),
            mode(|p| p.task.fperm, modes.task_mode),
        );
        Ok(cg)
    }
}

fn read_config(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
        err,
        path: path.to_path_buf(),
    })
}

/// Controllers of every configured mount point, with the line of its first
/// directive.
fn mount_points(config: &Config) -> BTreeMap<PathBuf, (Vec<String>, usize)> {
    let mut mount_points: BTreeMap<PathBuf, (Vec<String>, usize)> = BTreeMap::new();
    for mount in &config.mounts {
        mount_points
            .entry(mount.path.clone())
            .or_insert_with(|| (Vec::new(), mount.line))
            .0
            .push(mount.controller.clone());
    }
    mount_points
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgroups::{common::NO_PERMS, test_fs::FakeCgroupFs, GroupState};
    use nix::unistd::Pid;

    const CPU: &str = "/sys/fs/cgroup/cpu";
    const MEMORY: &str = "/sys/fs/cgroup/memory";

    /// A system where nothing is mounted yet.
    fn loader() -> ConfigLoader<FakeCgroupFs> {
        let fs = FakeCgroupFs::new();
        for controller in ["cpu", "cpuacct", "memory"] {
            fs.add_controller(controller, 0);
        }
        // interface files the kernel shows once the hierarchies are mounted
        fs.set_file(Path::new(CPU).join("cpu.shares"), "1024\n");
        fs.set_file(Path::new(MEMORY).join("memory.limit_in_bytes"), "9223372036854771712\n");
        ConfigLoader::with_fs(fs)
    }

    const CONFIG: &str = r#"
mount {
    cpu = /sys/fs/cgroup/cpu;
    cpuacct = /sys/fs/cgroup/cpu;
    memory = /sys/fs/cgroup/memory;
}

group a/b {
    cpu {}
}

group a {
    perm {
        task { uid = 1000; gid = 1000; fperm = 660; }
        admin { uid = 1001; gid = 1001; dperm = 775; fperm = 664; }
    }
    cpu {
        cpu.shares = "100";
    }
    memory {
        memory.limit_in_bytes = 1073741824;
    }
}
"#;

    #[test]
    fn test_load_mounts_and_creates() {
        let loader = loader();
        let registry = loader.load(CONFIG).unwrap();
        let fs = loader.fs();

        assert_eq!(registry.lookup_mount_point("cpuacct").unwrap(), Path::new(CPU));
        assert_eq!(registry.lookup_mount_point("memory").unwrap(), Path::new(MEMORY));
        assert_eq!(fs.mounted().len(), 2);

        let a = Path::new(CPU).join("a");
        assert_eq!(fs.file(a.join("cpu.shares")).as_deref(), Some("100"));
        let limit = Path::new(MEMORY).join("a/memory.limit_in_bytes");
        assert_eq!(fs.file(limit).as_deref(), Some("1073741824"));
        assert_eq!(fs.owner(&a), Some((1001, 1001)));
        assert_eq!(fs.owner(a.join("tasks")), Some((1000, 1000)));
        assert_eq!(fs.mode(&a), Some(0o775));
        assert_eq!(fs.mode(a.join("tasks")), Some(0o660));

        // parents are created first, so the child inherits the parent's values
        assert_eq!(fs.file(a.join("b/cpu.shares")).as_deref(), Some("100"));
    }

    #[test]
    fn test_load_keeps_existing_mounts() {
        let loader = loader();
        let fs = loader.fs();
        fs.add_dir_all(CPU);
        fs.mount(Path::new(CPU), "cgroup", "cpu,cpuacct").unwrap();

        loader.load(CONFIG).unwrap();
        assert_eq!(loader.fs().mounted().len(), 2);
    }

    #[test]
    fn test_load_failure_keeps_earlier_groups() {
        let loader = loader();
        let text = r#"
mount { cpu = /sys/fs/cgroup/cpu; }
group good { cpu { cpu.shares = 10; } }
group bad { cpu { cpu.bogus = 1; } }
"#;
        let err = loader.load(text).unwrap_err();
        assert!(matches!(err, ConfigError::Cgroup(Error::KernelOperation(_))));
        assert!(loader.fs().exists(&Path::new(CPU).join("good")));
    }

    #[test]
    fn test_load_rejects_malformed_text() {
        let loader = loader();
        let err = loader.load("group a {\n cpu {\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(ParseError { line: 2, .. })));
        assert!(loader.fs().mounted().is_empty());
    }

    #[test]
    fn test_defaults() {
        let mut loader = loader();
        let mut defaults = Cgroup::new("/");
        defaults.set_uid_gid(10, 11, 12, 13);
        defaults.set_permissions(0o750, NO_PERMS, NO_PERMS);
        loader.set_default(&defaults);

        let text = r#"
mount { memory = /sys/fs/cgroup/memory; }
default { perm { admin { uid = 20; } } }
group plain { memory {} }
group own { perm { admin { uid = 30; } } memory {} }
"#;
        loader.load(text).unwrap();
        let fs = loader.fs();
        let plain = Path::new(MEMORY).join("plain");
        assert_eq!(fs.owner(&plain), Some((20, 13)));
        assert_eq!(fs.owner(plain.join("tasks")), Some((10, 11)));
        assert_eq!(fs.mode(&plain), Some(0o750));
        assert_eq!(fs.mode(plain.join("tasks")), Some(0o644));
        assert_eq!(fs.owner(Path::new(MEMORY).join("own")), Some((30, 13)));
    }

    #[test]
    fn test_user_names_resolve() {
        let loader = loader();
        let text = r#"
mount { memory = /sys/fs/cgroup/memory; }
group a { perm { admin { uid = root; } } memory {} }
"#;
        loader.load(text).unwrap();
        let owner = loader.fs().owner(Path::new(MEMORY).join("a"));
        assert_eq!(owner.map(|(uid, _)| uid), Some(0));

        let text = r#"
mount { memory = /sys/fs/cgroup/memory; }
group b {
    perm { task { gid = no-such-group-for-cgmgr; } }
    memory {}
}
"#;
        let err = loader.load(text).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Parse(ParseError { line: 3, ref field, .. }) if field == "gid"
        ));
    }

    #[test]
    fn test_unified_mount() {
        let loader = loader();
        let weight = "/sys/fs/cgroup/unified/cpu.weight";
        loader.fs().set_file(weight, "100\n");
        let text = r#"
mount { cgroup2 = /sys/fs/cgroup/unified; }
group a { cpu { cpu.weight = 50; } }
"#;
        let registry = loader.load(text).unwrap();
        let fs = loader.fs();
        assert_eq!(
            registry.lookup_mount_point("cpu").unwrap(),
            Path::new("/sys/fs/cgroup/unified")
        );
        let subtree_control = "/sys/fs/cgroup/unified/cgroup.subtree_control";
        assert_eq!(fs.file(subtree_control).as_deref(), Some("cpu"));
        assert_eq!(
            fs.file("/sys/fs/cgroup/unified/a/cpu.weight").as_deref(),
            Some("50")
        );

        let err = loader
            .load("mount {\n cgroup2 = /x;\n cpu = /x;\n}")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(ParseError { line: 2, .. })));
    }

    #[test]
    fn test_unload_removes_children_first_and_unmounts() {
        let loader = loader();
        loader.load(CONFIG).unwrap();
        loader.unload(CONFIG, DeleteFlags::empty()).unwrap();

        let fs = loader.fs();
        let cpu = Path::new(CPU);
        assert_eq!(
            fs.removed_dirs(),
            vec![
                cpu.join("a/b"),
                cpu.join("a"),
                Path::new(MEMORY).join("a")
            ]
        );
        assert!(fs.mounted().is_empty());

        // nothing is left mounted to scan
        assert!(matches!(
            loader.unload(CONFIG, DeleteFlags::empty()),
            Err(ConfigError::Cgroup(Error::Initialization(_)))
        ));
    }

    #[test]
    fn test_unload_continues_after_failure() {
        let loader = loader();
        let text = r#"
mount { memory = /sys/fs/cgroup/memory; }
group busy { memory {} }
group idle { memory {} }
"#;
        let registry = loader.load(text).unwrap();
        let manager = Manager::new(&registry, loader.fs());
        let mut busy = Cgroup::new("busy");
        busy.add_controller("memory");
        manager.attach_task(&busy, Pid::from_raw(42)).unwrap();

        let err = loader.unload(text, DeleteFlags::EMPTY_ONLY).unwrap_err();
        assert!(matches!(err, ConfigError::Cgroup(Error::KernelOperation(_))));

        let fs = loader.fs();
        assert_eq!(fs.removed_dirs(), vec![Path::new(MEMORY).join("idle")]);
        assert!(fs.exists(&Path::new(MEMORY).join("busy")));
        assert_eq!(fs.mounted().len(), 1);
    }

    #[test]
    fn test_unload_all() {
        let loader = loader();
        let registry = loader.load(CONFIG).unwrap();
        let manager = Manager::new(&registry, loader.fs());
        let mut leaf = Cgroup::new("a/b");
        leaf.add_controller("cpu");
        manager.attach_task(&leaf, Pid::from_raw(7)).unwrap();

        loader.unload_all().unwrap();
        let fs = loader.fs();
        assert!(fs.mounted().is_empty());
        assert!(!fs.exists(&Path::new(CPU).join("a")));
        assert!(!fs.exists(&Path::new(MEMORY).join("a")));
    }

    #[test]
    fn test_load_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cgconfig.conf");
        std::fs::write(&path, CONFIG).unwrap();

        let loader = loader();
        loader.load_file(&path).unwrap();
        assert!(loader.fs().exists(&Path::new(CPU).join("a/b")));

        let mut cg = Cgroup::new("a/b");
        cg.add_controller("cpu");
        let registry = HierarchyRegistry::initialize_with(loader.fs()).unwrap();
        Manager::new(&registry, loader.fs()).get(&mut cg).unwrap();
        assert_eq!(cg.state(), GroupState::Committed);

        loader.unload_file(&path, DeleteFlags::RECURSIVE).unwrap();
        assert!(loader.fs().mounted().is_empty());

        assert!(matches!(
            loader.load_file(tmp.path().join("missing.conf")),
            Err(ConfigError::Io { .. })
        ));
    }
}
