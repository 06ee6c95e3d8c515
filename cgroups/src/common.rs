use std::{
    fmt::{Debug, Display},
    path::{Component, Path, PathBuf},
};

use serde::Serialize;

pub const CGROUP_PROCS: &str = "cgroup.procs";
pub const CGROUP_TASKS: &str = "tasks";
pub const CGROUP_CONTROLLERS: &str = "cgroup.controllers";
pub const CGROUP_SUBTREE_CONTROL: &str = "cgroup.subtree_control";
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Uninitialized UID/GID used for task and control files.
pub const NO_UID_GID: u32 = u32::MAX;
/// Uninitialized file/directory permissions used for task and control files.
pub const NO_PERMS: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CgroupVersion {
    V1,
    V2,
}

impl CgroupVersion {
    /// Name of the file listing the tasks of a group.
    pub fn tasks_file(&self) -> &'static str {
        match self {
            CgroupVersion::V1 => CGROUP_TASKS,
            CgroupVersion::V2 => CGROUP_PROCS,
        }
    }
}

impl Display for CgroupVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match *self {
            CgroupVersion::V1 => "v1",
            CgroupVersion::V2 => "v2",
        };

        write!(f, "{print}")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum WrappedIoError {
    #[error("failed to open {path}: {err}")]
    Open { err: std::io::Error, path: PathBuf },
    #[error("failed to write {data} to {path}: {err}")]
    Write {
        err: std::io::Error,
        path: PathBuf,
        data: String,
    },
    #[error("failed to read {path}: {err}")]
    Read { err: std::io::Error, path: PathBuf },
    #[error("failed to create dir {path}: {err}")]
    CreateDir { err: std::io::Error, path: PathBuf },
    #[error("failed to remove dir {path}: {err}")]
    RemoveDir { err: std::io::Error, path: PathBuf },
    #[error("failed to change owner of {path}: {err}")]
    Chown { err: std::io::Error, path: PathBuf },
    #[error("failed to change mode of {path}: {err}")]
    Chmod { err: std::io::Error, path: PathBuf },
    #[error("failed to mount {path}: {err}")]
    Mount { err: std::io::Error, path: PathBuf },
    #[error("failed to unmount {path}: {err}")]
    Umount { err: std::io::Error, path: PathBuf },
    #[error("at {path}: {err}")]
    Other { err: std::io::Error, path: PathBuf },
}

impl WrappedIoError {
    pub fn inner(&self) -> &std::io::Error {
        match self {
            WrappedIoError::Open { err, .. } => err,
            WrappedIoError::Write { err, .. } => err,
            WrappedIoError::Read { err, .. } => err,
            WrappedIoError::CreateDir { err, .. } => err,
            WrappedIoError::RemoveDir { err, .. } => err,
            WrappedIoError::Chown { err, .. } => err,
            WrappedIoError::Chmod { err, .. } => err,
            WrappedIoError::Mount { err, .. } => err,
            WrappedIoError::Umount { err, .. } => err,
            WrappedIoError::Other { err, .. } => err,
        }
    }

    /// The OS error code behind the failure, if there is one.
    pub fn errno(&self) -> Option<i32> {
        self.inner().raw_os_error()
    }

    pub fn path(&self) -> &Path {
        match self {
            WrappedIoError::Open { path, .. } => path,
            WrappedIoError::Write { path, .. } => path,
            WrappedIoError::Read { path, .. } => path,
            WrappedIoError::CreateDir { path, .. } => path,
            WrappedIoError::RemoveDir { path, .. } => path,
            WrappedIoError::Chown { path, .. } => path,
            WrappedIoError::Chmod { path, .. } => path,
            WrappedIoError::Mount { path, .. } => path,
            WrappedIoError::Umount { path, .. } => path,
            WrappedIoError::Other { path, .. } => path,
        }
    }
}

pub(crate) trait WrapIoResult {
    type Target;

    fn wrap_create_dir<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_remove_dir<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_read<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_open<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_write<P: Into<PathBuf>, D: Into<String>>(
        self,
        path: P,
        data: D,
    ) -> Result<Self::Target, WrappedIoError>;
    fn wrap_chown<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_chmod<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_mount<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_umount<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_other<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
}

impl<T> WrapIoResult for Result<T, std::io::Error> {
    type Target = T;

    fn wrap_create_dir<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::CreateDir {
            err,
            path: path.into(),
        })
    }

    fn wrap_remove_dir<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::RemoveDir {
            err,
            path: path.into(),
        })
    }

    fn wrap_read<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Read {
            err,
            path: path.into(),
        })
    }

    fn wrap_open<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Open {
            err,
            path: path.into(),
        })
    }

    fn wrap_write<P: Into<PathBuf>, D: Into<String>>(
        self,
        path: P,
        data: D,
    ) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Write {
            err,
            path: path.into(),
            data: data.into(),
        })
    }

    fn wrap_chown<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Chown {
            err,
            path: path.into(),
        })
    }

    fn wrap_chmod<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Chmod {
            err,
            path: path.into(),
        })
    }

    fn wrap_mount<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Mount {
            err,
            path: path.into(),
        })
    }

    fn wrap_umount<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Umount {
            err,
            path: path.into(),
        })
    }

    fn wrap_other<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Other {
            err,
            path: path.into(),
        })
    }
}

/// Normalizes a group name. The root group can be spelled "", "/" or ".".
pub fn normalize_group_name(name: &str) -> String {
    let parts: Vec<&str> = name
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if parts.is_empty() {
        "/".to_owned()
    } else {
        parts.join("/")
    }
}

pub fn is_root_group(name: &str) -> bool {
    normalize_group_name(name) == "/"
}

/// Name of the parent group. The root group is its own parent.
pub fn parent_group_name(name: &str) -> String {
    let name = normalize_group_name(name);
    match name.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent.to_owned(),
        _ => "/".to_owned(),
    }
}

/// Number of path components below the root group.
pub fn group_depth(name: &str) -> usize {
    let name = normalize_group_name(name);
    if name == "/" {
        0
    } else {
        name.split('/').count()
    }
}

pub trait PathBufExt {
    /// Joins a group name below a hierarchy mount point, refusing to escape it.
    fn join_group(&self, group: &str) -> Result<PathBuf, InvalidGroupPath>;
}

#[derive(thiserror::Error, Debug)]
#[error("group path {0:?} escapes its hierarchy")]
pub struct InvalidGroupPath(pub String);

impl PathBufExt for Path {
    fn join_group(&self, group: &str) -> Result<PathBuf, InvalidGroupPath> {
        let name = normalize_group_name(group);
        if name == "/" {
            return Ok(self.to_path_buf());
        }

        let relative = Path::new(&name);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(InvalidGroupPath(group.to_owned()));
        }

        Ok(self.join(relative))
    }
}

/// Restricts `requested` to the owner bits of `current`, replicated into the
/// group and other bits. SUID, SGID and sticky bits are kept.
pub fn mask_with_owner(requested: u32, current: u32) -> u32 {
    let owner = current & 0o700;
    let mask = owner | (owner >> 3) | (owner >> 6) | 0o7000;
    requested & mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_group_name() {
        assert_eq!(normalize_group_name("/"), "/");
        assert_eq!(normalize_group_name("."), "/");
        assert_eq!(normalize_group_name(""), "/");
        assert_eq!(normalize_group_name("/a//b/"), "a/b");
        assert_eq!(normalize_group_name("./daemons/www"), "daemons/www");
    }

    #[test]
    fn test_parent_group_name() {
        assert_eq!(parent_group_name("a/b/c"), "a/b");
        assert_eq!(parent_group_name("a"), "/");
        assert_eq!(parent_group_name("/"), "/");
        assert_eq!(parent_group_name("."), "/");
        assert_eq!(parent_group_name("/a/"), "/");
    }

    #[test]
    fn test_group_depth() {
        assert_eq!(group_depth("/"), 0);
        assert_eq!(group_depth("a"), 1);
        assert_eq!(group_depth("/a/b/"), 2);
    }

    #[test]
    fn test_join_group() {
        let mount = Path::new("/sys/fs/cgroup/cpu");
        assert_eq!(mount.join_group("/").unwrap(), mount);
        assert_eq!(
            mount.join_group("a/b").unwrap(),
            PathBuf::from("/sys/fs/cgroup/cpu/a/b")
        );
        assert!(mount.join_group("a/../../etc").is_err());
    }

    #[test]
    fn test_mask_with_owner() {
        // owner rw- on the file allows rw for every class
        assert_eq!(mask_with_owner(0o471, 0o640), 0o460);
        assert_eq!(mask_with_owner(0o777, 0o755), 0o777);
        assert_eq!(mask_with_owner(0o4775, 0o500), 0o4555);
    }

    #[test]
    fn test_tasks_file() {
        assert_eq!(CgroupVersion::V1.tasks_file(), "tasks");
        assert_eq!(CgroupVersion::V2.tasks_file(), "cgroup.procs");
        assert_eq!(CgroupVersion::V2.to_string(), "v2");
    }
}
