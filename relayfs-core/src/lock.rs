//! Byte-range (POSIX) locks delegated to the backing store.
//!
//! The relay holds every backing descriptor itself, so classic `F_SETLK`
//! locks would all belong to the relay process and never conflict with each
//! other. Instead each (file handle, owner token) pair gets its own open file
//! description of the backing file and locks are taken as open-file-description
//! locks on it. Conflicts between owners are then decided by the backing store.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::sys;
use crate::types::{ByteRangeLock, FileHandle, LockCommand, LockKind, RawHandle};

/// Lock descriptions keyed by (file handle, owner token).
pub struct LockManager {
    owners: DashMap<(u64, u64), Arc<File>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            owners: DashMap::new(),
        }
    }

    /// Runs one lock request for `owner` against the file open as `handle`.
    ///
    /// `Get` overwrites `lock` with the first conflicting lock, or sets its
    /// kind to `Unlock` if the range is free.
    pub fn lock(
        &self,
        handle: FileHandle,
        backing: &File,
        owner: u64,
        command: LockCommand,
        lock: &mut ByteRangeLock,
    ) -> Result<()> {
        let mut raw = to_flock(lock)?;
        let key = (handle.raw(), owner);
        let existing = self.owners.get(&key).map(|entry| Arc::clone(entry.value()));

        let description = match (existing, command, lock.kind) {
            (Some(description), _, _) => description,
            // Nothing held, nothing to release.
            (None, LockCommand::Set | LockCommand::SetWait, LockKind::Unlock) => return Ok(()),
            (None, LockCommand::Get, _) => Arc::new(reopen(backing)?),
            (None, _, _) => {
                let description = Arc::new(reopen(backing)?);
                Arc::clone(self.owners.entry(key).or_insert(description).value())
            }
        };

        let cmd = match command {
            LockCommand::Get => libc::F_OFD_GETLK,
            LockCommand::Set => libc::F_OFD_SETLK,
            LockCommand::SetWait => libc::F_OFD_SETLKW,
        };
        if let Err(err) = sys::cvt(unsafe { libc::fcntl(description.as_raw_fd(), cmd, &mut raw) }) {
            debug!("byte-range lock on {} owner {:#x} failed: {}", handle, owner, err);
            return Err(err.into());
        }

        if command == LockCommand::Get {
            *lock = from_flock(&raw);
        }
        Ok(())
    }

    /// Drops `owner`'s description on `handle`, releasing its locks.
    pub fn release_owner(&self, handle: FileHandle, owner: u64) {
        self.owners.remove(&(handle.raw(), owner));
    }

    /// Drops every owner's description on `handle`.
    pub fn release_handle(&self, handle: FileHandle) {
        let raw = handle.raw();
        self.owners.retain(|(fh, _), _| *fh != raw);
    }

    /// Drops every description, releasing all locks.
    pub fn clear(&self) {
        self.owners.clear();
    }

    /// Number of live lock descriptions.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens a second description of `backing` with the same access mode.
fn reopen(backing: &File) -> Result<File> {
    let fd = backing.as_raw_fd();
    let flags = sys::cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    let proc_path = format!("/proc/self/fd/{}", fd);
    sys::open(Path::new(&proc_path), flags & libc::O_ACCMODE, 0)
}

fn to_flock(lock: &ByteRangeLock) -> Result<libc::flock> {
    let start = libc::off_t::try_from(lock.start)
        .map_err(|_| RelayError::InvalidArgument(format!("lock start {} out of range", lock.start)))?;
    // Anything reaching past the largest file offset means "to end of file".
    let len = if lock.end >= i64::MAX as u64 {
        0
    } else if lock.end < lock.start {
        return Err(RelayError::InvalidArgument(format!(
            "lock range {}..={} is empty",
            lock.start, lock.end
        )));
    } else {
        libc::off_t::try_from(lock.end - lock.start + 1)
            .map_err(|_| RelayError::InvalidArgument(format!("lock end {} out of range", lock.end)))?
    };

    // SAFETY: flock is plain data; all-zero is a valid value.
    let mut raw: libc::flock = unsafe { std::mem::zeroed() };
    raw.l_type = lock.kind.raw() as libc::c_short;
    raw.l_whence = libc::SEEK_SET as libc::c_short;
    raw.l_start = start;
    raw.l_len = len;
    // OFD requests must carry l_pid 0.
    raw.l_pid = 0;
    Ok(raw)
}

fn from_flock(raw: &libc::flock) -> ByteRangeLock {
    let kind = LockKind::from_raw(raw.l_type as i32).unwrap_or(LockKind::Unlock);
    let start = raw.l_start.max(0) as u64;
    let end = if raw.l_len == 0 {
        u64::MAX
    } else {
        start.saturating_add(raw.l_len as u64 - 1)
    };
    ByteRangeLock {
        kind,
        start,
        end,
        // OFD holders report -1; there is no process to name.
        pid: raw.l_pid.max(0) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_handle::FileHandleManager;
    use crate::types::OpenFlags;

    struct Fixture {
        _dir: tempfile::TempDir,
        files: FileHandleManager,
        handle: FileHandle,
        locks: LockManager,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let files = FileHandleManager::new();
            let handle = files
                .create(&dir.path().join("locked"), 0o644, OpenFlags::READ_WRITE)
                .unwrap();
            Self {
                _dir: dir,
                files,
                handle,
                locks: LockManager::new(),
            }
        }

        fn set(&self, owner: u64, kind: LockKind, start: u64, end: u64) -> Result<()> {
            let open = self.files.get(self.handle).unwrap();
            let mut lock = ByteRangeLock::new(kind, start, end);
            self.locks.lock(self.handle, open.file(), owner, LockCommand::Set, &mut lock)
        }

        fn query(&self, owner: u64, kind: LockKind, start: u64, end: u64) -> ByteRangeLock {
            let open = self.files.get(self.handle).unwrap();
            let mut lock = ByteRangeLock::new(kind, start, end);
            self.locks
                .lock(self.handle, open.file(), owner, LockCommand::Get, &mut lock)
                .unwrap();
            lock
        }
    }

    #[test]
    fn test_owners_conflict_on_overlapping_ranges() {
        let fx = Fixture::new();
        fx.set(1, LockKind::Write, 0, 99).unwrap();

        let err = fx.set(2, LockKind::Write, 50, 150).unwrap_err();
        assert!(err.errno() == libc::EAGAIN || err.errno() == libc::EACCES);

        // Disjoint ranges and the holder itself are fine.
        fx.set(2, LockKind::Write, 100, 199).unwrap();
        fx.set(1, LockKind::Read, 0, 49).unwrap();
    }

    #[test]
    fn test_get_reports_conflicting_lock() {
        let fx = Fixture::new();
        fx.set(1, LockKind::Write, 10, 19).unwrap();

        let conflict = fx.query(2, LockKind::Read, 0, u64::MAX);
        assert_eq!(conflict.kind, LockKind::Write);
        assert_eq!((conflict.start, conflict.end), (10, 19));

        let free = fx.query(2, LockKind::Write, 20, 29);
        assert_eq!(free.kind, LockKind::Unlock);
        // Queries by an owner that never locked leave no description behind.
        assert_eq!(fx.locks.len(), 1);
    }

    #[test]
    fn test_shared_locks_coexist() {
        let fx = Fixture::new();
        fx.set(1, LockKind::Read, 0, u64::MAX).unwrap();
        fx.set(2, LockKind::Read, 0, u64::MAX).unwrap();
        assert!(fx.set(3, LockKind::Write, 0, 0).is_err());
    }

    #[test]
    fn test_release_owner_frees_its_ranges() {
        let fx = Fixture::new();
        fx.set(1, LockKind::Write, 0, u64::MAX).unwrap();
        assert!(fx.set(2, LockKind::Write, 0, 0).is_err());

        fx.locks.release_owner(fx.handle, 1);
        fx.set(2, LockKind::Write, 0, 0).unwrap();
    }

    #[test]
    fn test_release_handle_drops_every_owner() {
        let fx = Fixture::new();
        fx.set(1, LockKind::Read, 0, 9).unwrap();
        fx.set(2, LockKind::Read, 10, 19).unwrap();
        assert_eq!(fx.locks.len(), 2);

        fx.locks.release_handle(fx.handle);
        assert!(fx.locks.is_empty());
        fx.set(3, LockKind::Write, 0, u64::MAX).unwrap();
    }

    #[test]
    fn test_unlock_without_description_is_noop() {
        let fx = Fixture::new();
        fx.set(7, LockKind::Unlock, 0, u64::MAX).unwrap();
        assert!(fx.locks.is_empty());
    }

    #[test]
    fn test_kernel_offset_max_reaches_end_of_file() {
        let fx = Fixture::new();
        fx.set(1, LockKind::Write, 4096, i64::MAX as u64).unwrap();
        let conflict = fx.query(2, LockKind::Write, 1 << 40, 1 << 40);
        assert_eq!(conflict.kind, LockKind::Write);
        assert_eq!((conflict.start, conflict.end), (4096, u64::MAX));
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let fx = Fixture::new();
        let err = fx.set(1, LockKind::Read, 10, 5).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        assert!(fx.locks.is_empty());
    }
}
