use std::path::{Path, PathBuf};

use crate::error::Result;

const NETWORK_FS_TYPES: &[&str] = &[
    "nfs", "nfs4", "cifs", "smbfs", "smb3", "afpfs", "9p", "davfs", "fuse.sshfs", "ceph",
    "glusterfs", "fuse.rclone",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeInfo {
    pub mount_point: Option<PathBuf>,
    pub fs_type: Option<String>,
    pub source: Option<String>,
}

impl VolumeInfo {
    pub fn is_network(&self) -> bool {
        self.fs_type
            .as_deref()
            .map(is_network_fs_type)
            .unwrap_or(false)
    }
}

pub fn is_network_fs_type(fs_type: &str) -> bool {
    NETWORK_FS_TYPES.contains(&fs_type)
}

/// Volume that holds `path`. Platforms without mount introspection get an
/// empty [`VolumeInfo`].
pub fn probe_volume(path: &Path) -> Result<VolumeInfo> {
    #[cfg(target_os = "linux")]
    {
        linux::probe_volume(path)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = path;
        Ok(VolumeInfo::default())
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs;
    use std::path::{Path, PathBuf};

    use crate::error::Result;

    use super::VolumeInfo;

    pub fn probe_volume(path: &Path) -> Result<VolumeInfo> {
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let mountinfo = fs::read_to_string("/proc/self/mountinfo")?;
        Ok(best_mount_for_path(&mountinfo, &canonical).unwrap_or_default())
    }

    pub(super) fn best_mount_for_path(mountinfo: &str, path: &Path) -> Option<VolumeInfo> {
        let mut best: Option<VolumeInfo> = None;

        for line in mountinfo.lines() {
            let Some(mi) = parse_mountinfo_line(line) else {
                continue;
            };
            let Some(mount_point) = mi.mount_point.as_deref() else {
                continue;
            };
            if !path.starts_with(mount_point) {
                continue;
            }

            let replace = match best.as_ref().and_then(|b| b.mount_point.as_deref()) {
                None => true,
                Some(cur) => mount_point.as_os_str().len() >= cur.as_os_str().len(),
            };
            if replace {
                best = Some(mi);
            }
        }

        best
    }

    fn parse_mountinfo_line(line: &str) -> Option<VolumeInfo> {
        let (left, right) = line.split_once(" - ")?;
        let left_fields: Vec<&str> = left.split_whitespace().collect();
        if left_fields.len() < 5 {
            return None;
        }

        let mount_point = unescape_mountinfo(left_fields[4]);
        let right_fields: Vec<&str> = right.split_whitespace().collect();

        Some(VolumeInfo {
            mount_point: Some(PathBuf::from(mount_point)),
            fs_type: right_fields.first().map(|s| s.to_string()),
            source: right_fields.get(1).map(|s| s.to_string()),
        })
    }

    fn unescape_mountinfo(s: &str) -> String {
        s.replace(r"\040", " ")
            .replace(r"\011", "\t")
            .replace(r"\012", "\n")
            .replace(r"\134", r"\")
    }
}
