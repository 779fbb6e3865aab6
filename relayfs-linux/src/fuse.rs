//! `fuser::Filesystem` on top of [`RelayFs`].
//!
//! Every request is turned into one dispatcher call. Entry-creating requests
//! additionally stat the new node, since the protocol answers them with its
//! attributes. Nothing is cached: all TTLs are zero.

use std::ffi::OsStr;
use std::io;
use std::ops::ControlFlow;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyLock, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::c_int;
use tracing::{debug, info, warn};

use relayfs_core::{
    ByteRangeLock, DirHandle, FileAttributes, FileHandle, FileType, LockCommand,
    LockKind, OpenFlags, RawHandle, RelayError, RelayFs, SetTime, VirtualPath, XattrFlags,
    XattrReply,
};

use crate::inode::InodeTable;

const TTL: Duration = Duration::ZERO;

/// Largest offset the kernel accepts in a lock reply.
const OFFSET_MAX: u64 = i64::MAX as u64;

/// Replies with the error's host code and leaves the handler.
macro_rules! try_reply {
    ($reply:expr, $result:expr) => {
        match $result {
            Ok(value) => value,
            Err(err) => {
                let err: RelayError = err;
                $reply.error(err.errno());
                return;
            }
        }
    };
}

fn offset(value: i64) -> Result<u64, RelayError> {
    u64::try_from(value).map_err(|_| RelayError::InvalidArgument(format!("negative offset {}", value)))
}

fn set_time(time: Option<TimeOrNow>) -> SetTime {
    match time {
        None => SetTime::Omit,
        Some(TimeOrNow::Now) => SetTime::Now,
        Some(TimeOrNow::SpecificTime(at)) => SetTime::At(at),
    }
}

fn fuse_kind(kind: FileType) -> fuser::FileType {
    match kind {
        FileType::Directory => fuser::FileType::Directory,
        FileType::Symlink => fuser::FileType::Symlink,
        FileType::BlockDevice => fuser::FileType::BlockDevice,
        FileType::CharDevice => fuser::FileType::CharDevice,
        FileType::Fifo => fuser::FileType::NamedPipe,
        FileType::Socket => fuser::FileType::Socket,
        FileType::File | FileType::Unknown => fuser::FileType::RegularFile,
    }
}

/// Protocol attributes for node `ino`.
pub(crate) fn file_attr(ino: u64, attrs: &FileAttributes) -> FileAttr {
    FileAttr {
        ino,
        size: attrs.size,
        blocks: attrs.blocks,
        atime: attrs.atime,
        mtime: attrs.mtime,
        ctime: attrs.ctime,
        crtime: UNIX_EPOCH,
        kind: fuse_kind(attrs.kind),
        perm: attrs.permissions() as u16,
        nlink: attrs.nlink as u32,
        uid: attrs.uid,
        gid: attrs.gid,
        rdev: attrs.rdev as u32,
        blksize: attrs.blksize as u32,
        flags: 0,
    }
}

/// Runs a blocking lock request for `owner` on its own thread and hands the
/// outcome to `done`.
///
/// The session thread serves requests one at a time, and the unlock that
/// grants a contended lock arrives through it, so the wait must not run there.
pub(crate) fn wait_for_lock<F>(
    relay: Arc<RelayFs>,
    fh: FileHandle,
    owner: u64,
    mut lock: ByteRangeLock,
    done: F,
) -> io::Result<()>
where
    F: FnOnce(Result<(), RelayError>) + Send + 'static,
{
    thread::Builder::new()
        .name("relayfs-lock-wait".to_string())
        .spawn(move || {
            let result = relay.lock(fh, owner, LockCommand::SetWait, &mut lock);
            done(result);
        })
        .map(drop)
}

/// The FUSE session state: the relay plus the inode table.
pub struct RelayFuse {
    relay: Arc<RelayFs>,
    inodes: InodeTable,
}

impl RelayFuse {
    pub fn new(relay: RelayFs) -> Self {
        Self {
            relay: Arc::new(relay),
            inodes: InodeTable::new(),
        }
    }

    pub fn relay(&self) -> &RelayFs {
        &self.relay
    }

    fn path(&self, ino: u64) -> Result<VirtualPath, RelayError> {
        self.inodes.path(ino).cloned()
    }

    /// Stats a freshly created `path` and counts the lookup the reply implies.
    fn new_entry(&mut self, path: &VirtualPath) -> Result<FileAttr, RelayError> {
        let attrs = self.relay.getattr(path)?;
        let ino = self.inodes.lookup(path);
        Ok(file_attr(ino, &attrs))
    }
}

impl fuser::Filesystem for RelayFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("relay of {} ready", self.relay.context().root().display());
        Ok(())
    }

    fn destroy(&mut self) {
        info!("relay of {} shutting down", self.relay.context().root().display());
        self.relay.shutdown();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = try_reply!(reply, self.inodes.child(parent, name));
        let attr = try_reply!(reply, self.new_entry(&path));
        reply.entry(&TTL, &attr, 0);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let path = try_reply!(reply, self.path(ino));
        let attrs = try_reply!(reply, self.relay.getattr(&path));
        reply.attr(&TTL, &file_attr(ino, &attrs));
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = try_reply!(reply, self.path(ino));
        let fh = fh.map(FileHandle::from_raw);

        if let Some(mode) = mode {
            try_reply!(reply, self.relay.chmod(&path, mode));
        }
        if uid.is_some() || gid.is_some() {
            try_reply!(reply, self.relay.chown(&path, uid, gid));
        }
        if let Some(size) = size {
            try_reply!(reply, self.relay.truncate(&path, size, fh));
        }
        if atime.is_some() || mtime.is_some() {
            try_reply!(reply, self.relay.utimens(&path, set_time(atime), set_time(mtime), fh));
        }

        let attrs = match fh {
            Some(fh) => self.relay.fgetattr(fh),
            None => self.relay.getattr(&path),
        };
        let attrs = try_reply!(reply, attrs);
        reply.attr(&TTL, &file_attr(ino, &attrs));
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = try_reply!(reply, self.path(ino));
        let target = try_reply!(reply, self.relay.readlink(&path));
        reply.data(target.as_bytes());
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let path = try_reply!(reply, self.inodes.child(parent, name));
        try_reply!(reply, self.relay.mknod(&path, mode, u64::from(rdev)));
        let attr = try_reply!(reply, self.new_entry(&path));
        reply.entry(&TTL, &attr, 0);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = try_reply!(reply, self.inodes.child(parent, name));
        try_reply!(reply, self.relay.mkdir(&path, mode));
        let attr = try_reply!(reply, self.new_entry(&path));
        reply.entry(&TTL, &attr, 0);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = try_reply!(reply, self.inodes.child(parent, name));
        try_reply!(reply, self.relay.unlink(&path));
        self.inodes.unlink(&path);
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = try_reply!(reply, self.inodes.child(parent, name));
        try_reply!(reply, self.relay.rmdir(&path));
        self.inodes.unlink(&path);
        reply.ok();
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        let path = try_reply!(reply, self.inodes.child(parent, name));
        try_reply!(reply, self.relay.symlink(link.as_os_str(), &path));
        let attr = try_reply!(reply, self.new_entry(&path));
        reply.entry(&TTL, &attr, 0);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            // RENAME_NOREPLACE / RENAME_EXCHANGE are not relayed.
            reply.error(libc::EINVAL);
            return;
        }
        let from = try_reply!(reply, self.inodes.child(parent, name));
        let to = try_reply!(reply, self.inodes.child(newparent, newname));
        try_reply!(reply, self.relay.rename(&from, &to));
        self.inodes.rename(&from, &to);
        reply.ok();
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let from = try_reply!(reply, self.path(ino));
        let to = try_reply!(reply, self.inodes.child(newparent, newname));
        try_reply!(reply, self.relay.link(&from, &to));
        let attr = try_reply!(reply, self.new_entry(&to));
        reply.entry(&TTL, &attr, 0);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = try_reply!(reply, self.path(ino));
        let fh = try_reply!(reply, self.relay.open(&path, OpenFlags::from_raw(flags)));
        reply.opened(fh.raw(), 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let offset = try_reply!(reply, self::offset(offset));
        let data = try_reply!(reply, self.relay.read(FileHandle::from_raw(fh), size as usize, offset));
        reply.data(&data);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let offset = try_reply!(reply, self::offset(offset));
        let written = try_reply!(reply, self.relay.write(FileHandle::from_raw(fh), data, offset));
        reply.written(written as u32);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, lock_owner: u64, reply: ReplyEmpty) {
        try_reply!(reply, self.relay.flush(FileHandle::from_raw(fh), Some(lock_owner)));
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        try_reply!(reply, self.relay.release(FileHandle::from_raw(fh)));
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        try_reply!(reply, self.relay.fsync(FileHandle::from_raw(fh), datasync));
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = try_reply!(reply, self.path(ino));
        let dh = try_reply!(reply, self.relay.opendir(&path));
        reply.opened(dh.raw(), 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let result = self.relay.readdir(DirHandle::from_raw(fh), offset, |entry| {
            // `add` reports a full buffer; the entry is then retried next call.
            if reply.add(entry.ino, entry.next_offset, fuse_kind(entry.kind), &entry.name) {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        try_reply!(reply, result);
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        try_reply!(reply, self.relay.releasedir(DirHandle::from_raw(fh)));
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = try_reply!(reply, self.path(ino));
        let st = try_reply!(reply, self.relay.statfs(&path));
        reply.statfs(
            st.blocks,
            st.blocks_free,
            st.blocks_available,
            st.files,
            st.files_free,
            st.block_size as u32,
            st.name_max as u32,
            st.fragment_size as u32,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = try_reply!(reply, self.path(ino));
        try_reply!(reply, self.relay.setxattr(&path, name, value, XattrFlags::from_raw(flags)));
        reply.ok();
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let path = try_reply!(reply, self.path(ino));
        match try_reply!(reply, self.relay.getxattr(&path, name, size as usize)) {
            XattrReply::Size(needed) => reply.size(needed as u32),
            XattrReply::Data(data) => reply.data(&data),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let path = try_reply!(reply, self.path(ino));
        match try_reply!(reply, self.relay.listxattr(&path, size as usize)) {
            XattrReply::Size(needed) => reply.size(needed as u32),
            XattrReply::Data(data) => reply.data(&data),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = try_reply!(reply, self.path(ino));
        try_reply!(reply, self.relay.removexattr(&path, name));
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let path = try_reply!(reply, self.path(ino));
        try_reply!(reply, self.relay.access(&path, mask));
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = try_reply!(reply, self.inodes.child(parent, name));
        let fh = try_reply!(reply, self.relay.create(&path, mode, OpenFlags::from_raw(flags)));
        let attrs = match self.relay.fgetattr(fh) {
            Ok(attrs) => attrs,
            Err(err) => {
                // The kernel never learns about fh, so close it here.
                if let Err(close_err) = self.relay.release(fh) {
                    debug!("dropping unreported {} failed: {}", fh, close_err);
                }
                reply.error(err.errno());
                return;
            }
        };
        let ino = self.inodes.lookup(&path);
        reply.created(&TTL, &file_attr(ino, &attrs), 0, fh.raw(), 0);
    }

    fn getlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        let kind = try_reply!(reply, lock_kind(typ));
        let mut lock = ByteRangeLock { kind, start, end, pid };
        try_reply!(
            reply,
            self.relay.lock(FileHandle::from_raw(fh), lock_owner, LockCommand::Get, &mut lock)
        );
        reply.locked(lock.start, lock.end.min(OFFSET_MAX), lock.kind.raw(), lock.pid);
    }

    fn setlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        let kind = try_reply!(reply, lock_kind(typ));
        let fh = FileHandle::from_raw(fh);
        let mut lock = ByteRangeLock { kind, start, end, pid };
        if !sleep || kind == LockKind::Unlock {
            try_reply!(reply, self.relay.lock(fh, lock_owner, LockCommand::Set, &mut lock));
            reply.ok();
            return;
        }
        let waiting = wait_for_lock(Arc::clone(&self.relay), fh, lock_owner, lock, move |result| {
            match result {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.errno()),
            }
        });
        if let Err(err) = waiting {
            // The reply went down with the closure and answers EIO on drop.
            warn!("cannot wait for lock on {}: {}", fh, err);
        }
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let offset = try_reply!(reply, self::offset(offset));
        let length = try_reply!(reply, self::offset(length));
        try_reply!(
            reply,
            self.relay.fallocate(FileHandle::from_raw(fh), mode, offset, length)
        );
        reply.ok();
    }
}

fn lock_kind(typ: i32) -> Result<LockKind, RelayError> {
    LockKind::from_raw(typ).ok_or_else(|| RelayError::InvalidArgument(format!("lock type {}", typ)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayfs_core::MountContext;

    #[test]
    fn test_file_attr_keeps_bridge_inode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"hello").unwrap();
        let relay = RelayFs::new(MountContext::new(dir.path()));
        let attrs = relay.getattr(&VirtualPath::new("/f").unwrap()).unwrap();

        let attr = file_attr(42, &attrs);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 5);
        assert_eq!(attr.kind, fuser::FileType::RegularFile);
        assert_eq!(u32::from(attr.perm), attrs.permissions());
        assert_eq!(attr.mtime, attrs.mtime);
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(fuse_kind(FileType::Fifo), fuser::FileType::NamedPipe);
        assert_eq!(fuse_kind(FileType::Directory), fuser::FileType::Directory);
        assert_eq!(fuse_kind(FileType::Unknown), fuser::FileType::RegularFile);
    }

    #[test]
    fn test_time_and_offset_conversion() {
        assert_eq!(set_time(None), SetTime::Omit);
        assert_eq!(set_time(Some(TimeOrNow::Now)), SetTime::Now);
        assert_eq!(offset(7).unwrap(), 7);
        assert_eq!(offset(-1).unwrap_err().errno(), libc::EINVAL);
        assert_eq!(lock_kind(libc::F_WRLCK as i32).unwrap(), LockKind::Write);
        assert!(lock_kind(99).is_err());
    }

    #[test]
    fn test_blocking_lock_waits_off_the_calling_thread() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Arc::new(RelayFs::new(MountContext::new(dir.path())));
        if !relay.capabilities().posix_locks {
            return;
        }
        let path = VirtualPath::new("/contended").unwrap();
        let fh = relay.create(&path, 0o644, OpenFlags::READ_WRITE).unwrap();

        let mut held = ByteRangeLock::new(LockKind::Write, 0, 99);
        relay.lock(fh, 1, LockCommand::Set, &mut held).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let wanted = ByteRangeLock::new(LockKind::Write, 50, 149);
        wait_for_lock(Arc::clone(&relay), fh, 2, wanted, move |result| {
            tx.send(result).unwrap();
        })
        .unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        // The holder is still served while owner 2 waits.
        let mut release = ByteRangeLock::new(LockKind::Unlock, 0, 99);
        relay.lock(fh, 1, LockCommand::Set, &mut release).unwrap();

        let granted = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(granted.is_ok());

        let mut query = ByteRangeLock::new(LockKind::Write, 60, 60);
        relay.lock(fh, 3, LockCommand::Get, &mut query).unwrap();
        assert_eq!(query.kind, LockKind::Write);
        assert_eq!((query.start, query.end), (50, 149));
        relay.release(fh).unwrap();
    }
}
