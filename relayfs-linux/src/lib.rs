//! # RelayFS Linux
//!
//! FUSE bridge for RelayFS. [`RelayFuse`] implements `fuser::Filesystem` on
//! top of the core dispatcher and [`mount`] runs its request loop.

use std::io;
use std::path::{Path, PathBuf};

use fuser::MountOption;
use relayfs_core::{MountOptions, RelayFs};
use thiserror::Error;
use tracing::info;

pub mod fuse;
pub mod inode;

pub use fuse::RelayFuse;
pub use inode::{InodeTable, ROOT_INO};

/// Why a mount could not be set up or ended abnormally.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("mount point {0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("FUSE session failed: {0}")]
    Session(#[from] io::Error),
}

/// Translates relay mount options into FUSE mount options.
pub fn mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut out = vec![
        MountOption::FSName(options.fs_name().to_string()),
        MountOption::Subtype("relayfs".to_string()),
    ];
    out.push(if options.read_only { MountOption::RO } else { MountOption::RW });
    if options.allow_other {
        out.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        out.push(MountOption::AutoUnmount);
    }
    if options.default_permissions {
        out.push(MountOption::DefaultPermissions);
    }
    out.extend(options.passthrough.iter().cloned().map(MountOption::CUSTOM));
    out
}

/// Mounts `relay` at `mountpoint` and serves requests until unmounted.
///
/// Blocks the calling thread for the lifetime of the mount.
pub fn mount(relay: RelayFs, mountpoint: &Path, options: &MountOptions) -> Result<(), MountError> {
    if !mountpoint.is_dir() {
        return Err(MountError::NotADirectory(mountpoint.to_path_buf()));
    }
    let fuse_options = mount_options(options);
    info!(
        "mounting {} at {} ({} options)",
        relay.context().root().display(),
        mountpoint.display(),
        fuse_options.len()
    );
    fuser::mount2(RelayFuse::new(relay), mountpoint, &fuse_options)?;
    info!("{} unmounted", mountpoint.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayfs_core::MountContext;

    #[test]
    fn test_mount_options_mapping() {
        let options = MountOptions::builder()
            .read_only(true)
            .allow_other(true)
            .fs_name("backup")
            .passthrough("max_read=65536")
            .build();
        let mapped = mount_options(&options);
        assert!(mapped.contains(&MountOption::FSName("backup".to_string())));
        assert!(mapped.contains(&MountOption::RO));
        assert!(mapped.contains(&MountOption::AllowOther));
        assert!(mapped.contains(&MountOption::CUSTOM("max_read=65536".to_string())));
        assert!(!mapped.contains(&MountOption::AutoUnmount));
    }

    #[test]
    fn test_mount_rejects_missing_mountpoint() {
        let dir = tempfile::tempdir().unwrap();
        let relay = RelayFs::new(MountContext::new(dir.path()));
        let err = mount(relay, &dir.path().join("absent"), &MountOptions::default()).unwrap_err();
        assert!(matches!(err, MountError::NotADirectory(_)));
    }
}
