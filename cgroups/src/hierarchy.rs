use std::{
    iter::FusedIterator,
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::common::{CgroupVersion, CGROUP_CONTROLLERS};
use crate::error::{Error, Result};
use crate::fs::{CgroupFs, KernelFs, MountRecord, ScanError};

/// What the kernel reports about one controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HierarchyInfo {
    pub controller_name: String,
    pub hierarchy_id: u32,
    /// `None` if the controller is not mounted anywhere.
    pub mount_point: Option<PathBuf>,
    pub group_count: u32,
    pub enabled: bool,
    pub version: CgroupVersion,
}

/// A mounted hierarchy together with every controller co-mounted on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hierarchy {
    pub mount_point: PathBuf,
    pub version: CgroupVersion,
    pub controllers: Vec<String>,
}

/// Snapshot of the mounted cgroup hierarchies, taken once at initialization.
#[derive(Debug, Clone)]
pub struct HierarchyRegistry {
    entries: Vec<HierarchyInfo>,
}

impl HierarchyRegistry {
    /// Scans the hierarchies mounted on this system.
    pub fn initialize() -> Result<Self> {
        Self::initialize_with(&KernelFs)
    }

    pub fn initialize_with<F: CgroupFs>(fs: &F) -> Result<Self> {
        let records = fs.controllers()?;
        let mounts = fs.cgroup_mounts()?;
        if mounts.is_empty() {
            return Err(Error::Initialization(ScanError::NoCgroupMounts));
        }

        let unified = match mounts.iter().find(|m| m.version == CgroupVersion::V2) {
            Some(mount) => Some(Self::unified_controllers(fs, mount)?),
            None => None,
        };

        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let legacy = mounts.iter().find(|m| {
                m.version == CgroupVersion::V1 && m.options.iter().any(|o| o == &record.name)
            });

            let (mount_point, version) = match (legacy, &unified) {
                (Some(mount), _) => (Some(mount.mount_point.clone()), CgroupVersion::V1),
                (None, Some((mount_point, controllers)))
                    if record.hierarchy == 0 && controllers.contains(&record.name) =>
                {
                    (Some(mount_point.clone()), CgroupVersion::V2)
                }
                (None, _) if record.hierarchy == 0 && unified.is_some() => {
                    (None, CgroupVersion::V2)
                }
                (None, _) => (None, CgroupVersion::V1),
            };

            entries.push(HierarchyInfo {
                controller_name: record.name,
                hierarchy_id: record.hierarchy,
                mount_point,
                group_count: record.num_cgroups,
                enabled: record.enabled,
                version,
            });
        }

        // the unified hierarchy offers controllers /proc/cgroups does not list, e.g. io
        if let Some((mount_point, controllers)) = unified {
            let group_count = entries
                .iter()
                .find(|e| e.version == CgroupVersion::V2 && e.mount_point.is_some())
                .map(|e| e.group_count)
                .unwrap_or(1);
            for controller in controllers {
                if entries.iter().any(|e| e.controller_name == controller) {
                    continue;
                }
                entries.push(HierarchyInfo {
                    controller_name: controller,
                    hierarchy_id: 0,
                    mount_point: Some(mount_point.clone()),
                    group_count,
                    enabled: true,
                    version: CgroupVersion::V2,
                });
            }
        }

        log::debug!(
            "found {} controllers, {} mounted",
            entries.len(),
            entries.iter().filter(|e| e.mount_point.is_some()).count()
        );
        Ok(Self { entries })
    }

    fn unified_controllers<F: CgroupFs>(
        fs: &F,
        mount: &MountRecord,
    ) -> Result<(PathBuf, Vec<String>)> {
        let content = fs
            .read_file(&mount.mount_point.join(CGROUP_CONTROLLERS))
            .map_err(ScanError::from)?;
        Ok((
            mount.mount_point.clone(),
            content.split_whitespace().map(str::to_owned).collect(),
        ))
    }

    /// Mount point of the hierarchy the controller is attached to.
    pub fn lookup_mount_point(&self, controller: &str) -> Result<&Path> {
        self.hierarchy(controller)
            .and_then(|h| h.mount_point.as_deref())
            .ok_or_else(|| Error::NotMounted(controller.to_owned()))
    }

    pub fn hierarchy(&self, controller: &str) -> Option<&HierarchyInfo> {
        self.entries
            .iter()
            .find(|e| e.controller_name == controller)
    }

    pub fn is_mounted(&self, controller: &str) -> bool {
        self.lookup_mount_point(controller).is_ok()
    }

    /// Mounted hierarchies in scan order, co-mounted controllers grouped together.
    pub fn hierarchies(&self) -> Vec<Hierarchy> {
        let mut hierarchies: Vec<Hierarchy> = Vec::new();
        for entry in &self.entries {
            let Some(mount_point) = &entry.mount_point else {
                continue;
            };
            match hierarchies.iter_mut().find(|h| &h.mount_point == mount_point) {
                Some(hierarchy) => hierarchy.controllers.push(entry.controller_name.clone()),
                None => hierarchies.push(Hierarchy {
                    mount_point: mount_point.clone(),
                    version: entry.version,
                    controllers: vec![entry.controller_name.clone()],
                }),
            }
        }
        hierarchies
    }

    /// Cursor over every controller known to the kernel.
    pub fn list_controllers(&self) -> ControllerCursor {
        ControllerCursor {
            entries: self.entries.clone(),
            position: 0,
        }
    }
}

/// Restartable cursor over a controller snapshot. Once the last entry has been
/// returned every further fetch yields nothing.
#[derive(Debug, Clone)]
pub struct ControllerCursor {
    entries: Vec<HierarchyInfo>,
    position: usize,
}

impl ControllerCursor {
    /// Fetches the next entry, reporting the end with `Error::EndOfSequence`
    /// for callers that drive the cursor begin/next/end style.
    pub fn fetch(&mut self) -> Result<HierarchyInfo> {
        self.next().ok_or(Error::EndOfSequence)
    }
}

impl Iterator for ControllerCursor {
    type Item = HierarchyInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.get(self.position)?.clone();
        self.position += 1;
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.entries.len().saturating_sub(self.position);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ControllerCursor {}

impl FusedIterator for ControllerCursor {}
