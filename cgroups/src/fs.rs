//! An interface trait so that the rest of the crate can reach the
//! cgroup filesystem without having to worry about how it is backed.
use std::{
    fs,
    io::Write,
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};

use nix::{
    mount::MsFlags,
    sys::stat::Mode,
    unistd::{self, Gid, Uid},
};
use procfs::{process::Process, ProcError};
use serde::Serialize;

use crate::common::{CgroupVersion, WrapIoResult, WrappedIoError};

#[derive(thiserror::Error, Debug)]
pub enum ScanError {
    #[error("failed to read process info from /proc: {0}")]
    Proc(#[from] ProcError),
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("no cgroup filesystem is mounted")]
    NoCgroupMounts,
}

/// One line of /proc/cgroups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerRecord {
    pub name: String,
    pub hierarchy: u32,
    pub num_cgroups: u32,
    pub enabled: bool,
}

/// A mounted cgroup or cgroup2 filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub version: CgroupVersion,
    pub mount_point: PathBuf,
    /// Super block options, e.g. `rw`, `cpu`, `cpuacct` or `name=systemd`.
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FileType {
    File,
    Dir,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub file_type: FileType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub file_type: FileType,
    /// Permission bits, including SUID, SGID and sticky.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Filesystem and mount operations the cgroup engine needs from the kernel.
pub trait CgroupFs {
    /// Controllers known to the kernel, in /proc/cgroups order.
    fn controllers(&self) -> Result<Vec<ControllerRecord>, ScanError>;
    /// Mounted cgroup filesystems, in mount table order.
    fn cgroup_mounts(&self) -> Result<Vec<MountRecord>, ScanError>;
    /// Creates a single directory. `mode` of `None` leaves it to the umask.
    fn create_dir(&self, path: &Path, mode: Option<u32>) -> Result<(), WrappedIoError>;
    fn remove_dir(&self, path: &Path) -> Result<(), WrappedIoError>;
    /// Entries of a directory, sorted by name.
    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>, WrappedIoError>;
    fn read_file(&self, path: &Path) -> Result<String, WrappedIoError>;
    /// Writes into an existing file. Control files are never created.
    fn write_file(&self, path: &Path, data: &str) -> Result<(), WrappedIoError>;
    fn metadata(&self, path: &Path) -> Result<Metadata, WrappedIoError>;
    fn exists(&self, path: &Path) -> bool;
    fn chown(&self, path: &Path, uid: Option<Uid>, gid: Option<Gid>) -> Result<(), WrappedIoError>;
    fn chmod(&self, path: &Path, mode: u32) -> Result<(), WrappedIoError>;
    /// Mounts a cgroup (`options` lists the controllers) or cgroup2 filesystem.
    fn mount(&self, target: &Path, fstype: &str, options: &str) -> Result<(), WrappedIoError>;
    fn umount(&self, target: &Path) -> Result<(), WrappedIoError>;
}

/// The real cgroup filesystem of the running kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelFs;

fn to_file_type(file_type: fs::FileType) -> FileType {
    if file_type.is_dir() {
        FileType::Dir
    } else if file_type.is_file() {
        FileType::File
    } else {
        FileType::Other
    }
}

impl CgroupFs for KernelFs {
    fn controllers(&self) -> Result<Vec<ControllerRecord>, ScanError> {
        Ok(procfs::cgroups()?
            .0
            .into_iter()
            .map(|c| ControllerRecord {
                name: c.name,
                hierarchy: c.hierarchy,
                num_cgroups: c.num_cgroups,
                enabled: c.enabled,
            })
            .collect())
    }

    fn cgroup_mounts(&self) -> Result<Vec<MountRecord>, ScanError> {
        Ok(Process::myself()?
            .mountinfo()?
            .into_iter()
            .filter_map(|m| {
                let version = match m.fs_type.as_str() {
                    "cgroup" => CgroupVersion::V1,
                    "cgroup2" => CgroupVersion::V2,
                    _ => return None,
                };
                let mut options: Vec<String> = m
                    .super_options
                    .into_iter()
                    .map(|(key, value)| match value {
                        Some(value) => format!("{key}={value}"),
                        None => key,
                    })
                    .collect();
                options.sort();
                Some(MountRecord {
                    version,
                    mount_point: m.mount_point,
                    options,
                })
            })
            .collect())
    }

    fn create_dir(&self, path: &Path, mode: Option<u32>) -> Result<(), WrappedIoError> {
        match mode {
            Some(mode) => unistd::mkdir(path, Mode::from_bits_truncate(mode))
                .map_err(std::io::Error::from)
                .wrap_create_dir(path),
            None => fs::create_dir(path).wrap_create_dir(path),
        }
    }

    fn remove_dir(&self, path: &Path) -> Result<(), WrappedIoError> {
        fs::remove_dir(path).wrap_remove_dir(path)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>, WrappedIoError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).wrap_read(path)? {
            let entry = entry.wrap_read(path)?;
            let file_type = entry.file_type().wrap_other(entry.path())?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                file_type: to_file_type(file_type),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn read_file(&self, path: &Path) -> Result<String, WrappedIoError> {
        fs::read_to_string(path).wrap_read(path)
    }

    fn write_file(&self, path: &Path, data: &str) -> Result<(), WrappedIoError> {
        fs::OpenOptions::new()
            .create(false)
            .write(true)
            .truncate(false)
            .open(path)
            .wrap_open(path)?
            .write_all(data.as_bytes())
            .wrap_write(path, data)
    }

    fn metadata(&self, path: &Path) -> Result<Metadata, WrappedIoError> {
        let metadata = fs::metadata(path).wrap_other(path)?;
        Ok(Metadata {
            file_type: to_file_type(metadata.file_type()),
            mode: metadata.mode() & 0o7777,
            uid: metadata.uid(),
            gid: metadata.gid(),
        })
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn chown(&self, path: &Path, uid: Option<Uid>, gid: Option<Gid>) -> Result<(), WrappedIoError> {
        unistd::chown(path, uid, gid)
            .map_err(std::io::Error::from)
            .wrap_chown(path)
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<(), WrappedIoError> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).wrap_chmod(path)
    }

    fn mount(&self, target: &Path, fstype: &str, options: &str) -> Result<(), WrappedIoError> {
        let data = if options.is_empty() {
            None
        } else {
            Some(options)
        };
        nix::mount::mount(Some(fstype), target, Some(fstype), MsFlags::empty(), data)
            .map_err(std::io::Error::from)
            .wrap_mount(target)
    }

    fn umount(&self, target: &Path) -> Result<(), WrappedIoError> {
        nix::mount::umount(target)
            .map_err(std::io::Error::from)
            .wrap_umount(target)
    }
}
