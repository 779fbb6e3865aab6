//! The operation dispatcher: one entry point per filesystem operation.
//!
//! Path-addressed entries resolve their virtual path(s) against the mount
//! root; handle-addressed entries look up the bound handle. Either way each
//! entry makes exactly one backing call and reports that call's error as is.

use std::ffi::{OsStr, OsString};
use std::fs::{self, DirBuilder, Permissions};
use std::io::IoSlice;
use std::ops::ControlFlow;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::PathBuf;

use tracing::{debug, trace, warn};

use crate::dir_stream::DirectoryStreamManager;
use crate::error::{RelayError, Result};
use crate::file_handle::FileHandleManager;
#[cfg(all(feature = "posix-locks", target_os = "linux"))]
use crate::lock::LockManager;
use crate::sys;
use crate::types::{
    ByteRangeLock, Capabilities, DirHandle, DirectoryEntry, FileAttributes, FileHandle, FileType,
    FlockOperation, FsStats, LockCommand, MountContext, OpenFlags, RelayConfig, SetTime,
    VirtualPath, XattrFlags, XattrReply,
};
use crate::xattr;

/// Logs a failed backing call at debug level and hands the result back.
fn logged<T>(op: &str, subject: impl std::fmt::Display, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        debug!("{} {} failed: {}", op, subject, err);
    }
    result
}

fn unsupported<T>(family: &str) -> Result<T> {
    Err(RelayError::NotSupported(family.to_string()))
}

/// A relay of one backing directory.
///
/// Holds the mount context and every open handle. All entries take `&self`
/// and may be called from several threads; calls on one directory handle
/// must be serialized by the caller.
pub struct RelayFs {
    ctx: MountContext,
    capabilities: Capabilities,
    dirs: DirectoryStreamManager,
    files: FileHandleManager,
    #[cfg(all(feature = "posix-locks", target_os = "linux"))]
    locks: LockManager,
}

impl RelayFs {
    /// A relay with every capability this build supports.
    pub fn new(ctx: MountContext) -> Self {
        Self::with_capabilities(ctx, Capabilities::supported())
    }

    /// A relay serving only the `requested` families this build supports.
    pub fn with_capabilities(ctx: MountContext, requested: Capabilities) -> Self {
        Self {
            ctx,
            capabilities: Capabilities::supported().intersect(requested),
            dirs: DirectoryStreamManager::new(),
            files: FileHandleManager::new(),
            #[cfg(all(feature = "posix-locks", target_os = "linux"))]
            locks: LockManager::new(),
        }
    }

    /// Builds the relay for `root` as `config` describes.
    pub fn from_config(root: impl Into<PathBuf>, config: &RelayConfig) -> Self {
        let ctx = match config.max_path_length {
            Some(max) => MountContext::with_max_path(root, max),
            None => MountContext::new(root),
        };
        Self::with_capabilities(ctx, config.capabilities)
    }

    pub fn context(&self) -> &MountContext {
        &self.ctx
    }

    /// The families this relay actually answers.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn resolve(&self, path: &VirtualPath) -> Result<PathBuf> {
        logged("resolve", path, self.ctx.resolve(path))
    }

    // Metadata

    /// `lstat` on the backing path.
    pub fn getattr(&self, path: &VirtualPath) -> Result<FileAttributes> {
        trace!("getattr {}", path);
        let real = self.resolve(path)?;
        let result = fs::symlink_metadata(&real)
            .map(|meta| FileAttributes::from(&meta))
            .map_err(RelayError::from);
        logged("getattr", path, result)
    }

    /// `fstat` on an open file.
    pub fn fgetattr(&self, fh: FileHandle) -> Result<FileAttributes> {
        trace!("fgetattr {}", fh);
        logged("fgetattr", fh, self.files.getattr(fh))
    }

    /// Checks `mask` (`R_OK`, `W_OK`, `X_OK`, `F_OK`) against the backing path.
    pub fn access(&self, path: &VirtualPath, mask: i32) -> Result<()> {
        trace!("access {} {:#o}", path, mask);
        let real = self.resolve(path)?;
        let result = sys::cstring(&real).and_then(|c_path| {
            sys::cvt(unsafe { libc::access(c_path.as_ptr(), mask) })?;
            Ok(())
        });
        logged("access", path, result)
    }

    /// The stored target of a symlink.
    pub fn readlink(&self, path: &VirtualPath) -> Result<OsString> {
        trace!("readlink {}", path);
        let real = self.resolve(path)?;
        let result = fs::read_link(&real)
            .map(PathBuf::into_os_string)
            .map_err(RelayError::from);
        logged("readlink", path, result)
    }

    pub fn statfs(&self, path: &VirtualPath) -> Result<FsStats> {
        trace!("statfs {}", path);
        let real = self.resolve(path)?;
        let result = sys::cstring(&real).and_then(|c_path| {
            // SAFETY: statvfs is plain data, filled in by the call below.
            let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
            sys::cvt(unsafe { libc::statvfs(c_path.as_ptr(), &mut st) })?;
            Ok(FsStats::from(&st))
        });
        logged("statfs", path, result)
    }

    // Directories

    pub fn opendir(&self, path: &VirtualPath) -> Result<DirHandle> {
        trace!("opendir {}", path);
        let real = self.resolve(path)?;
        logged("opendir", path, self.dirs.open(&real))
    }

    /// Offers entries from `offset` on to `sink` until it breaks or the
    /// directory ends. See [`DirectoryStreamManager::read`].
    pub fn readdir<F>(&self, dh: DirHandle, offset: i64, sink: F) -> Result<()>
    where
        F: FnMut(&DirectoryEntry) -> ControlFlow<()>,
    {
        trace!("readdir {} at {}", dh, offset);
        logged("readdir", dh, self.dirs.read(dh, offset, sink))
    }

    pub fn releasedir(&self, dh: DirHandle) -> Result<()> {
        trace!("releasedir {}", dh);
        let result = self.dirs.close(dh);
        if let Err(err) = &result {
            warn!("releasedir {} failed: {}", dh, err);
        }
        result
    }

    // Namespace

    /// Creates a node; FIFOs go through `mkfifo`, everything else `mknod`.
    pub fn mknod(&self, path: &VirtualPath, mode: u32, rdev: u64) -> Result<()> {
        trace!("mknod {} {:#o}", path, mode);
        let real = self.resolve(path)?;
        let result = sys::cstring(&real).and_then(|c_path| {
            let ret = if FileType::is_fifo_mode(mode) {
                unsafe { libc::mkfifo(c_path.as_ptr(), mode as libc::mode_t) }
            } else {
                unsafe { libc::mknod(c_path.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) }
            };
            sys::cvt(ret)?;
            Ok(())
        });
        logged("mknod", path, result)
    }

    pub fn mkdir(&self, path: &VirtualPath, mode: u32) -> Result<()> {
        trace!("mkdir {} {:#o}", path, mode);
        let real = self.resolve(path)?;
        let result = DirBuilder::new().mode(mode).create(&real).map_err(RelayError::from);
        logged("mkdir", path, result)
    }

    pub fn unlink(&self, path: &VirtualPath) -> Result<()> {
        trace!("unlink {}", path);
        let real = self.resolve(path)?;
        logged("unlink", path, fs::remove_file(&real).map_err(RelayError::from))
    }

    pub fn rmdir(&self, path: &VirtualPath) -> Result<()> {
        trace!("rmdir {}", path);
        let real = self.resolve(path)?;
        logged("rmdir", path, fs::remove_dir(&real).map_err(RelayError::from))
    }

    /// Creates `link` pointing at `target`.
    ///
    /// An absolute target names a virtual path and is stored resolved against
    /// the backing root. A relative target is stored verbatim.
    pub fn symlink(&self, target: &OsStr, link: &VirtualPath) -> Result<()> {
        trace!("symlink {} -> {:?}", link, target);
        let stored = if target.as_bytes().first() == Some(&b'/') {
            self.resolve(&VirtualPath::new(target)?)?
        } else {
            PathBuf::from(target)
        };
        let real = self.resolve(link)?;
        let result = std::os::unix::fs::symlink(&stored, &real).map_err(RelayError::from);
        logged("symlink", link, result)
    }

    pub fn rename(&self, from: &VirtualPath, to: &VirtualPath) -> Result<()> {
        trace!("rename {} -> {}", from, to);
        let real_from = self.resolve(from)?;
        let real_to = self.resolve(to)?;
        logged("rename", from, fs::rename(&real_from, &real_to).map_err(RelayError::from))
    }

    /// Hard link `to` naming the same node as `from`.
    pub fn link(&self, from: &VirtualPath, to: &VirtualPath) -> Result<()> {
        trace!("link {} -> {}", from, to);
        let real_from = self.resolve(from)?;
        let real_to = self.resolve(to)?;
        logged("link", from, fs::hard_link(&real_from, &real_to).map_err(RelayError::from))
    }

    // Attributes

    pub fn chmod(&self, path: &VirtualPath, mode: u32) -> Result<()> {
        trace!("chmod {} {:#o}", path, mode);
        let real = self.resolve(path)?;
        let result = fs::set_permissions(&real, Permissions::from_mode(mode)).map_err(RelayError::from);
        logged("chmod", path, result)
    }

    /// `lchown`; a `None` id is left unchanged.
    pub fn chown(&self, path: &VirtualPath, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        trace!("chown {} {:?}:{:?}", path, uid, gid);
        let real = self.resolve(path)?;
        let result = std::os::unix::fs::lchown(&real, uid, gid).map_err(RelayError::from);
        logged("chown", path, result)
    }

    /// Truncates through `fh` when given, else by path.
    pub fn truncate(&self, path: &VirtualPath, size: u64, fh: Option<FileHandle>) -> Result<()> {
        trace!("truncate {} to {}", path, size);
        if let Some(fh) = fh {
            return logged("ftruncate", fh, self.files.truncate(fh, size));
        }
        let real = self.resolve(path)?;
        let result = sys::cstring(&real).and_then(|c_path| {
            let size = libc::off_t::try_from(size)
                .map_err(|_| RelayError::InvalidArgument(format!("size {} out of range", size)))?;
            sys::cvt(unsafe { libc::truncate(c_path.as_ptr(), size) })?;
            Ok(())
        });
        logged("truncate", path, result)
    }

    /// Sets access and modification times, through `fh` when given, else on
    /// the backing path without following a final symlink.
    pub fn utimens(
        &self,
        path: &VirtualPath,
        atime: SetTime,
        mtime: SetTime,
        fh: Option<FileHandle>,
    ) -> Result<()> {
        trace!("utimens {}", path);
        if let Some(fh) = fh {
            return logged("futimens", fh, self.files.set_times(fh, atime, mtime));
        }
        let real = self.resolve(path)?;
        let result = sys::cstring(&real).and_then(|c_path| {
            let times = [atime.to_timespec(), mtime.to_timespec()];
            sys::cvt(unsafe {
                libc::utimensat(
                    libc::AT_FDCWD,
                    c_path.as_ptr(),
                    times.as_ptr(),
                    libc::AT_SYMLINK_NOFOLLOW,
                )
            })?;
            Ok(())
        });
        logged("utimens", path, result)
    }

    // Files

    /// Creates (or opens) the backing file and binds a handle to it.
    pub fn create(&self, path: &VirtualPath, mode: u32, flags: OpenFlags) -> Result<FileHandle> {
        trace!("create {} {:#o}", path, mode);
        let real = self.resolve(path)?;
        logged("create", path, self.files.create(&real, mode, flags))
    }

    pub fn open(&self, path: &VirtualPath, flags: OpenFlags) -> Result<FileHandle> {
        trace!("open {} {:#x}", path, flags.bits());
        let real = self.resolve(path)?;
        logged("open", path, self.files.open(&real, flags))
    }

    pub fn read(&self, fh: FileHandle, size: usize, offset: u64) -> Result<Vec<u8>> {
        trace!("read {} {}@{}", fh, size, offset);
        logged("read", fh, self.files.read(fh, size, offset))
    }

    /// Reads into `buf`; returns the byte count.
    pub fn read_buf(&self, fh: FileHandle, buf: &mut [u8], offset: u64) -> Result<usize> {
        trace!("read_buf {} {}@{}", fh, buf.len(), offset);
        logged("read_buf", fh, self.files.read_buf(fh, buf, offset))
    }

    pub fn write(&self, fh: FileHandle, data: &[u8], offset: u64) -> Result<usize> {
        trace!("write {} {}@{}", fh, data.len(), offset);
        logged("write", fh, self.files.write(fh, data, offset))
    }

    /// Writes the gathered `bufs` at `offset` in one call.
    pub fn write_buf(&self, fh: FileHandle, bufs: &[IoSlice<'_>], offset: u64) -> Result<usize> {
        trace!("write_buf {} {} slices@{}", fh, bufs.len(), offset);
        logged("write_buf", fh, self.files.write_buf(fh, bufs, offset))
    }

    /// Called on every close of a file descriptor referring to `fh`.
    ///
    /// Drops the byte-range locks held by `owner`, then surfaces deferred
    /// write errors. The handle stays open.
    pub fn flush(&self, fh: FileHandle, owner: Option<u64>) -> Result<()> {
        trace!("flush {}", fh);
        #[cfg(all(feature = "posix-locks", target_os = "linux"))]
        if let Some(owner) = owner {
            self.locks.release_owner(fh, owner);
        }
        #[cfg(not(all(feature = "posix-locks", target_os = "linux")))]
        let _ = owner;
        logged("flush", fh, self.files.flush(fh))
    }

    /// Closes the file and invalidates `fh`, even if the close fails.
    pub fn release(&self, fh: FileHandle) -> Result<()> {
        trace!("release {}", fh);
        #[cfg(all(feature = "posix-locks", target_os = "linux"))]
        self.locks.release_handle(fh);
        let result = self.files.release(fh);
        if let Err(err) = &result {
            warn!("release {} failed: {}", fh, err);
        }
        result
    }

    pub fn fsync(&self, fh: FileHandle, data_only: bool) -> Result<()> {
        trace!("fsync {} data_only={}", fh, data_only);
        logged("fsync", fh, self.files.fsync(fh, data_only))
    }

    /// Preallocates space. Only mode 0 is relayed.
    pub fn fallocate(&self, fh: FileHandle, mode: i32, offset: u64, length: u64) -> Result<()> {
        trace!("fallocate {} mode={} {}@{}", fh, mode, length, offset);
        if !self.capabilities.fallocate {
            return unsupported("fallocate");
        }
        if mode != 0 {
            return unsupported("fallocate mode");
        }
        logged("fallocate", fh, self.files.allocate(fh, offset, length))
    }

    // Locks

    /// Byte-range lock request on behalf of `owner`.
    pub fn lock(
        &self,
        fh: FileHandle,
        owner: u64,
        command: LockCommand,
        lock: &mut ByteRangeLock,
    ) -> Result<()> {
        trace!("lock {} owner {:#x} {:?} {:?}", fh, owner, command, lock);
        if !self.capabilities.posix_locks {
            return unsupported("byte-range locks");
        }
        #[cfg(all(feature = "posix-locks", target_os = "linux"))]
        let result = self
            .files
            .get(fh)
            .and_then(|open| self.locks.lock(fh, open.file(), owner, command, lock));
        #[cfg(not(all(feature = "posix-locks", target_os = "linux")))]
        let result = {
            let _ = (owner, command, lock);
            unsupported("byte-range locks")
        };
        logged("lock", fh, result)
    }

    /// Whole-file advisory lock, always available.
    pub fn flock(&self, fh: FileHandle, op: FlockOperation) -> Result<()> {
        trace!("flock {} {:?}", fh, op);
        logged("flock", fh, self.files.flock(fh, op))
    }

    // Extended attributes

    pub fn getxattr(&self, path: &VirtualPath, name: &OsStr, size: usize) -> Result<XattrReply> {
        trace!("getxattr {} {:?}", path, name);
        if !self.capabilities.xattr {
            return unsupported("extended attributes");
        }
        let real = self.resolve(path)?;
        logged("getxattr", path, xattr::get_xattr(&real, name, size))
    }

    pub fn setxattr(&self, path: &VirtualPath, name: &OsStr, value: &[u8], flags: XattrFlags) -> Result<()> {
        trace!("setxattr {} {:?}", path, name);
        if !self.capabilities.xattr {
            return unsupported("extended attributes");
        }
        let real = self.resolve(path)?;
        logged("setxattr", path, xattr::set_xattr(&real, name, value, flags))
    }

    pub fn listxattr(&self, path: &VirtualPath, size: usize) -> Result<XattrReply> {
        trace!("listxattr {}", path);
        if !self.capabilities.xattr {
            return unsupported("extended attributes");
        }
        let real = self.resolve(path)?;
        logged("listxattr", path, xattr::list_xattr(&real, size))
    }

    pub fn removexattr(&self, path: &VirtualPath, name: &OsStr) -> Result<()> {
        trace!("removexattr {} {:?}", path, name);
        if !self.capabilities.xattr {
            return unsupported("extended attributes");
        }
        let real = self.resolve(path)?;
        logged("removexattr", path, xattr::remove_xattr(&real, name))
    }

    /// Closes every handle still open, e.g. when the mount goes away.
    pub fn shutdown(&self) {
        debug!(
            "shutting down with {} open files and {} open directories",
            self.files.len(),
            self.dirs.len()
        );
        #[cfg(all(feature = "posix-locks", target_os = "linux"))]
        self.locks.clear();
        self.files.release_all();
        self.dirs.close_all();
    }
}
