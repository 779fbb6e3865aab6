//! Directory streams: one backing `DIR*` per open directory handle, with
//! offset-based seek and resume.
//!
//! Iteration is consumer-paced. The sink returns `ControlFlow::Break` when it
//! cannot take the offered entry; that entry stays cached and the stored
//! offset stays at the last accepted position, so the next call with that
//! offset picks up exactly where the sink stopped. A call with any other offset
//! (one captured from an earlier entry) seeks the stream there first.

use std::ffi::{CStr, OsStr};
use std::io;
use std::ops::ControlFlow;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::NonNull;

use errno::{set_errno, Errno};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::sys;
use crate::types::{DirHandle, DirectoryEntry, FileType, HandleTable};

/// Owned `DIR*`. Closed on drop unless closed explicitly.
struct BackingDir {
    ptr: NonNull<libc::DIR>,
}

// SAFETY: a DIR* may move between threads; every use goes through the
// stream's mutex.
unsafe impl Send for BackingDir {}

impl BackingDir {
    fn open(path: &Path) -> Result<Self> {
        let c_path = sys::cstring(path)?;
        let ptr = unsafe { libc::opendir(c_path.as_ptr()) };
        match NonNull::new(ptr) {
            Some(ptr) => Ok(Self { ptr }),
            None => Err(io::Error::last_os_error().into()),
        }
    }

    fn seek(&mut self, offset: i64) {
        unsafe { libc::seekdir(self.ptr.as_ptr(), offset as libc::c_long) }
    }

    fn tell(&mut self) -> i64 {
        unsafe { libc::telldir(self.ptr.as_ptr()) as i64 }
    }

    /// Reads the next raw entry; `None` at end of stream.
    fn next_entry(&mut self) -> io::Result<Option<DirectoryEntry>> {
        // readdir(3) signals errors only through errno.
        set_errno(Errno(0));
        let raw = unsafe { libc::readdir(self.ptr.as_ptr()) };
        if raw.is_null() {
            return match errno::errno().0 {
                0 => Ok(None),
                code => Err(io::Error::from_raw_os_error(code)),
            };
        }
        // SAFETY: non-null readdir results stay valid until the next call on
        // this stream, and we copy everything out before returning.
        let raw = unsafe { &*raw };
        let name = unsafe { CStr::from_ptr(raw.d_name.as_ptr()) };
        let entry = DirectoryEntry {
            name: OsStr::from_bytes(name.to_bytes()).to_os_string(),
            ino: raw.d_ino as u64,
            kind: FileType::from_dirent(raw.d_type),
            next_offset: self.tell(),
        };
        Ok(Some(entry))
    }

    fn close(self) -> io::Result<()> {
        let ptr = self.ptr;
        std::mem::forget(self);
        sys::cvt(unsafe { libc::closedir(ptr.as_ptr()) }).map(|_| ())
    }
}

impl Drop for BackingDir {
    fn drop(&mut self) {
        unsafe {
            libc::closedir(self.ptr.as_ptr());
        }
    }
}

/// Iteration state of one open directory.
struct DirStream {
    dir: BackingDir,
    /// Fetched but not yet accepted by a sink
    entry: Option<DirectoryEntry>,
    /// Position after the last accepted entry
    offset: i64,
}

/// Owns every open directory stream.
///
/// Calls on one directory handle must be serialized by the caller; the
/// per-stream mutex only keeps the state memory-safe if they are not.
pub struct DirectoryStreamManager {
    streams: HandleTable<DirHandle, Mutex<DirStream>>,
}

impl DirectoryStreamManager {
    pub fn new() -> Self {
        Self {
            streams: HandleTable::new(),
        }
    }

    /// Opens the backing directory at `path`.
    pub fn open(&self, path: &Path) -> Result<DirHandle> {
        let dir = BackingDir::open(path)?;
        self.streams.insert(Mutex::new(DirStream {
            dir,
            entry: None,
            offset: 0,
        }))
    }

    /// Offers entries to `sink` starting at `offset` until the stream ends or
    /// the sink breaks.
    pub fn read<F>(&self, handle: DirHandle, offset: i64, mut sink: F) -> Result<()>
    where
        F: FnMut(&DirectoryEntry) -> ControlFlow<()>,
    {
        let stream = self.streams.get(handle)?;
        let mut stream = stream.lock();

        if offset != stream.offset {
            stream.dir.seek(offset);
            stream.entry = None;
            stream.offset = offset;
        }

        loop {
            let entry = match stream.entry.take() {
                Some(entry) => entry,
                None => match stream.dir.next_entry()? {
                    Some(entry) => entry,
                    None => break,
                },
            };

            if sink(&entry).is_break() {
                stream.entry = Some(entry);
                break;
            }
            stream.offset = entry.next_offset;
        }

        Ok(())
    }

    /// Closes the stream and invalidates `handle`.
    pub fn close(&self, handle: DirHandle) -> Result<()> {
        let stream = self.streams.remove(handle)?;
        match std::sync::Arc::try_unwrap(stream) {
            Ok(stream) => stream.into_inner().dir.close().map_err(Into::into),
            // An in-flight read still holds it; the stream closes when that read drops it.
            Err(_) => {
                debug!("closedir of {} deferred to an in-flight read", handle);
                Ok(())
            }
        }
    }

    /// Closes every open stream.
    pub fn close_all(&self) {
        for stream in self.streams.drain() {
            if let Ok(stream) = std::sync::Arc::try_unwrap(stream) {
                if let Err(err) = stream.into_inner().dir.close() {
                    warn!("closedir failed during shutdown: {}", err);
                }
            }
        }
    }

    /// Number of open streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Default for DirectoryStreamManager {
    fn default() -> Self {
        Self::new()
    }
}
