//! Open regular files: one backing descriptor per file handle.
//!
//! All I/O is positioned (`pread`/`pwrite`), so calls on one handle never
//! share a cursor and may run concurrently.

use std::fs::File;
use std::io::IoSlice;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::sys;
use crate::types::{FileAttributes, FileHandle, FlockOperation, HandleTable, OpenFlags, SetTime};

/// An open backing file.
#[derive(Debug)]
pub struct OpenFile {
    file: File,
}

impl OpenFile {
    pub fn file(&self) -> &File {
        &self.file
    }
}

/// Owns every open file descriptor.
pub struct FileHandleManager {
    files: HandleTable<FileHandle, OpenFile>,
}

impl FileHandleManager {
    pub fn new() -> Self {
        Self {
            files: HandleTable::new(),
        }
    }

    /// Opens an existing backing file with `flags`.
    pub fn open(&self, path: &Path, flags: OpenFlags) -> Result<FileHandle> {
        let file = sys::open(path, flags.bits(), 0)?;
        self.files.insert(OpenFile { file })
    }

    /// Creates (or opens, unless `flags` carries `O_EXCL`) the backing file.
    pub fn create(&self, path: &Path, mode: u32, flags: OpenFlags) -> Result<FileHandle> {
        let file = sys::open(path, (flags | OpenFlags::CREATE).bits(), mode)?;
        self.files.insert(OpenFile { file })
    }

    /// Borrows the open file behind `handle`.
    pub fn get(&self, handle: FileHandle) -> Result<Arc<OpenFile>> {
        self.files.get(handle)
    }

    /// Positioned read of up to `size` bytes.
    pub fn read(&self, handle: FileHandle, size: usize, offset: u64) -> Result<Vec<u8>> {
        let open = self.files.get(handle)?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).map_err(|_| RelayError::OutOfMemory)?;
        buf.resize(size, 0);
        let n = open.file.read_at(&mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Positioned read into a caller-owned buffer.
    pub fn read_buf(&self, handle: FileHandle, buf: &mut [u8], offset: u64) -> Result<usize> {
        let open = self.files.get(handle)?;
        Ok(open.file.read_at(buf, offset)?)
    }

    /// Positioned write; returns the count the backing call accepted.
    pub fn write(&self, handle: FileHandle, data: &[u8], offset: u64) -> Result<usize> {
        let open = self.files.get(handle)?;
        Ok(open.file.write_at(data, offset)?)
    }

    /// Positioned gather-write of `bufs` in a single backing call.
    pub fn write_buf(&self, handle: FileHandle, bufs: &[IoSlice<'_>], offset: u64) -> Result<usize> {
        let open = self.files.get(handle)?;
        pwritev(&open.file, bufs, offset)
    }

    /// `fdatasync` when `data_only`, else `fsync`.
    pub fn fsync(&self, handle: FileHandle, data_only: bool) -> Result<()> {
        let open = self.files.get(handle)?;
        if data_only {
            open.file.sync_data()?;
        } else {
            open.file.sync_all()?;
        }
        Ok(())
    }

    pub fn truncate(&self, handle: FileHandle, size: u64) -> Result<()> {
        let open = self.files.get(handle)?;
        open.file.set_len(size)?;
        Ok(())
    }

    /// `fstat` on the descriptor.
    pub fn getattr(&self, handle: FileHandle) -> Result<FileAttributes> {
        let open = self.files.get(handle)?;
        let meta = open.file.metadata()?;
        Ok(FileAttributes::from(&meta))
    }

    /// `futimens` on the descriptor.
    pub fn set_times(&self, handle: FileHandle, atime: SetTime, mtime: SetTime) -> Result<()> {
        let open = self.files.get(handle)?;
        let times = [atime.to_timespec(), mtime.to_timespec()];
        sys::cvt(unsafe { libc::futimens(open.file.as_raw_fd(), times.as_ptr()) })?;
        Ok(())
    }

    /// Surfaces deferred write errors by closing a duplicate of the
    /// descriptor. The real descriptor stays open until `release`.
    pub fn flush(&self, handle: FileHandle) -> Result<()> {
        let open = self.files.get(handle)?;
        let dup = sys::cvt(unsafe { libc::dup(open.file.as_raw_fd()) })?;
        sys::close(dup)?;
        Ok(())
    }

    /// Preallocates `length` bytes at `offset`.
    #[cfg(target_os = "linux")]
    pub fn allocate(&self, handle: FileHandle, offset: u64, length: u64) -> Result<()> {
        let open = self.files.get(handle)?;
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| RelayError::InvalidArgument(format!("offset {} out of range", offset)))?;
        let length = libc::off_t::try_from(length)
            .map_err(|_| RelayError::InvalidArgument(format!("length {} out of range", length)))?;
        // posix_fallocate returns the error number instead of setting errno.
        match unsafe { libc::posix_fallocate(open.file.as_raw_fd(), offset, length) } {
            0 => Ok(()),
            code => Err(RelayError::from_errno(code)),
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn allocate(&self, _handle: FileHandle, _offset: u64, _length: u64) -> Result<()> {
        Err(RelayError::NotSupported("fallocate".to_string()))
    }

    /// Whole-file advisory lock on the descriptor.
    pub fn flock(&self, handle: FileHandle, op: FlockOperation) -> Result<()> {
        let open = self.files.get(handle)?;
        sys::cvt(unsafe { libc::flock(open.file.as_raw_fd(), op.raw()) })?;
        Ok(())
    }

    /// Invalidates `handle` and closes its descriptor exactly once.
    ///
    /// The handle is gone even when the close itself fails.
    pub fn release(&self, handle: FileHandle) -> Result<()> {
        let open = self.files.remove(handle)?;
        match Arc::try_unwrap(open) {
            Ok(open) => {
                sys::close(open.file.into_raw_fd())?;
                Ok(())
            }
            // Still borrowed by an in-flight call; it closes when that call drops it.
            Err(_) => {
                debug!("close of {} deferred to an in-flight call", handle);
                Ok(())
            }
        }
    }

    /// Closes every open descriptor.
    pub fn release_all(&self) {
        for open in self.files.drain() {
            if let Ok(open) = Arc::try_unwrap(open) {
                if let Err(err) = sys::close(open.file.into_raw_fd()) {
                    warn!("close failed during shutdown: {}", err);
                }
            }
        }
    }

    /// Number of open files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Default for FileHandleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn pwritev(file: &File, bufs: &[IoSlice<'_>], offset: u64) -> Result<usize> {
    let offset = libc::off_t::try_from(offset)
        .map_err(|_| RelayError::InvalidArgument(format!("offset {} out of range", offset)))?;
    let count = libc::c_int::try_from(bufs.len())
        .map_err(|_| RelayError::InvalidArgument("too many buffers".to_string()))?;
    // IoSlice is ABI compatible with iovec on unix.
    let written = unsafe {
        libc::pwritev(file.as_raw_fd(), bufs.as_ptr() as *const libc::iovec, count, offset)
    };
    Ok(sys::cvt_size(written)?)
}

#[cfg(not(target_os = "linux"))]
fn pwritev(file: &File, bufs: &[IoSlice<'_>], offset: u64) -> Result<usize> {
    let gathered: Vec<u8> = bufs.iter().flat_map(|buf| buf.iter().copied()).collect();
    Ok(file.write_at(&gathered, offset)?)
}
