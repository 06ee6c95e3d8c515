#![cfg(test)]

use anyhow::{Context, Result};
use std::{
    io::Write,
    path::{Path, PathBuf},
};

use crate::common::CgroupVersion;
use crate::fs::FileType;
use crate::hierarchy::HierarchyRegistry;
use crate::test_fs::FakeCgroupFs;

pub fn set_fixture(temp_dir: &Path, filename: &str, val: &str) -> Result<PathBuf> {
    let full_path = temp_dir.join(filename);

    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&full_path)
        .with_context(|| format!("failed to open {full_path:?}"))?
        .write_all(val.as_bytes())
        .with_context(|| format!("failed to write to {full_path:?}"))?;

    Ok(full_path)
}

pub const CPU_MOUNT: &str = "/sys/fs/cgroup/cpu,cpuacct";
pub const MEMORY_MOUNT: &str = "/sys/fs/cgroup/memory";

/// A cgroup v1 system with cpu and cpuacct co-mounted and memory on its own.
pub fn setup_v1() -> (FakeCgroupFs, HierarchyRegistry) {
    let fs = FakeCgroupFs::new();
    fs.add_controller("cpuset", 0);
    fs.mount_v1(CPU_MOUNT, &["cpu", "cpuacct"], 2);
    fs.mount_v1(MEMORY_MOUNT, &["memory"], 3);

    let cpu = Path::new(CPU_MOUNT);
    fs.set_file(cpu.join("cpu.shares"), "1024\n");
    fs.set_file(cpu.join("cpu.cfs_quota_us"), "-1\n");
    fs.set_file(cpu.join("cpuacct.usage"), "0\n");
    fs.set_file_mode(cpu.join("cpuacct.usage"), 0o444);
    fs.set_file(Path::new(MEMORY_MOUNT).join("memory.limit_in_bytes"), "9223372036854771712\n");
    fs.set_file(Path::new(MEMORY_MOUNT).join("memory.swappiness"), "60\n");

    let registry = HierarchyRegistry::initialize_with(&fs).expect("scan fake hierarchies");
    (fs, registry)
}

/// A pure cgroup v2 system.
pub fn setup_v2() -> (FakeCgroupFs, HierarchyRegistry) {
    let fs = FakeCgroupFs::new();
    fs.add_controller("cpu", 0);
    fs.add_controller("memory", 0);
    fs.add_controller("pids", 0);
    fs.mount_v2("/sys/fs/cgroup", &["cpu", "memory", "pids"]);

    let root = Path::new("/sys/fs/cgroup");
    fs.set_file(root.join("cpu.weight"), "100\n");
    fs.set_file(root.join("memory.max"), "max\n");
    fs.set_file(root.join("pids.max"), "max\n");

    let registry = HierarchyRegistry::initialize_with(&fs).expect("scan fake hierarchies");
    assert_eq!(
        registry.hierarchy("cpu").map(|h| h.version),
        Some(CgroupVersion::V2)
    );
    (fs, registry)
}

pub fn is_dir(fs: &FakeCgroupFs, path: &Path) -> bool {
    use crate::fs::CgroupFs;
    fs.metadata(path)
        .map(|m| m.file_type == FileType::Dir)
        .unwrap_or(false)
}
