//! Free-space checks for the staging area.

use parking_lot::Mutex;
use std::path::Path;
use sysinfo::Disks;
use tracing::{debug, warn};

/// Result of a disk space check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSpaceStatus {
    Ok {
        available_bytes: u64,
    },
    InsufficientSpace {
        available_bytes: u64,
        required_bytes: u64,
    },
    /// No mounted disk contains the path.
    Unknown,
}

impl DiskSpaceStatus {
    pub fn is_insufficient(&self) -> bool {
        matches!(self, DiskSpaceStatus::InsufficientSpace { .. })
    }
}

/// Refuses work when the disk holding a path runs low.
#[derive(Debug, Default)]
pub struct DiskGuard {
    disks: Mutex<Disks>,
}

impl DiskGuard {
    pub fn new() -> Self {
        Self {
            disks: Mutex::new(Disks::new_with_refreshed_list()),
        }
    }

    /// Check that `path` has at least `required_bytes` free. Zero skips the
    /// check.
    pub fn check(&self, path: &Path, required_bytes: u64) -> DiskSpaceStatus {
        if required_bytes == 0 {
            return DiskSpaceStatus::Ok { available_bytes: 0 };
        }

        let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let available = {
            let mut disks = self.disks.lock();
            disks.refresh(true);
            available_space_for(&disks, &path)
        };

        match available {
            Some(available_bytes) if available_bytes >= required_bytes => {
                debug!(available_bytes, required_bytes, "Disk space OK");
                DiskSpaceStatus::Ok { available_bytes }
            }
            Some(available_bytes) => {
                warn!(
                    path = %path.display(),
                    available_bytes,
                    required_bytes,
                    "Insufficient disk space"
                );
                DiskSpaceStatus::InsufficientSpace {
                    available_bytes,
                    required_bytes,
                }
            }
            None => {
                warn!(path = %path.display(), "Could not determine disk space");
                DiskSpaceStatus::Unknown
            }
        }
    }
}

/// Available space on the disk with the longest mount point containing `path`.
fn available_space_for(disks: &Disks, path: &Path) -> Option<u64> {
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
