use crate::backup::DriveKind;
use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use sysinfo::Disks;

/// What the engine learned about the drive backing a destination root.
#[derive(Debug, Clone, Serialize)]
pub struct DriveProfile {
    pub kind: DriveKind,
    pub mount_point: PathBuf,
    pub file_system: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl Default for DriveProfile {
    fn default() -> Self {
        Self {
            kind: DriveKind::Unknown,
            mount_point: PathBuf::from("/"),
            file_system: String::new(),
            total_bytes: 0,
            available_bytes: 0,
        }
    }
}

const NETWORK_FILESYSTEMS: &[&str] = &[
    "nfs", "nfs4", "cifs", "smb", "smbfs", "smb2", "sshfs", "fuse.sshfs", "afpfs", "webdav",
    "davfs", "9p",
];

/// Classify the drive backing `path` by the mounted filesystem that owns it.
///
/// Longest matching mount point wins so nested mounts resolve correctly.
pub fn profile_path(path: &Path) -> DriveProfile {
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<DriveProfile> = None;
    let mut best_len = 0usize;

    for disk in disks.list() {
        let mount = disk.mount_point();
        if !path.starts_with(mount) {
            continue;
        }
        let mount_len = mount.as_os_str().len();
        if mount_len < best_len {
            continue;
        }

        let file_system = disk.file_system().to_string_lossy().to_string();
        let kind = classify(&file_system, disk.is_removable(), disk.kind());

        best_len = mount_len;
        best = Some(DriveProfile {
            kind,
            mount_point: mount.to_path_buf(),
            file_system,
            total_bytes: disk.total_space(),
            available_bytes: disk.available_space(),
        });
    }

    best.unwrap_or_default()
}

fn classify(file_system: &str, removable: bool, kind: sysinfo::DiskKind) -> DriveKind {
    let fs = file_system.to_ascii_lowercase();
    if NETWORK_FILESYSTEMS.iter().any(|n| fs.starts_with(n)) {
        return DriveKind::Network;
    }
    if removable {
        return DriveKind::Removable;
    }
    match kind {
        sysinfo::DiskKind::SSD => DriveKind::Ssd,
        sysinfo::DiskKind::HDD => DriveKind::Hdd,
        sysinfo::DiskKind::Unknown(_) => DriveKind::Unknown,
    }
}

/// Verify a destination root is actually writable before the run starts.
///
/// Creates the directory if missing, then round-trips a marker file. A failure
/// here is a configuration error, not a per-file one.
pub async fn probe_writable(root: &Path) -> Result<bool> {
    if let Err(e) = tokio::fs::create_dir_all(root).await {
        tracing::warn!("Cannot create destination root {}: {}", root.display(), e);
        return Ok(false);
    }

    let marker = root.join(format!(".shuttervault-probe-{}", std::process::id()));
    match tokio::fs::write(&marker, b"probe").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&marker).await;
            Ok(true)
        }
        Err(e) => {
            tracing::warn!("Destination root {} is not writable: {}", root.display(), e);
            Ok(false)
        }
    }
}
