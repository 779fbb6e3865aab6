use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const S_IFMT: u32 = libc::S_IFMT as u32;
const S_IFREG: u32 = libc::S_IFREG as u32;
const S_IFDIR: u32 = libc::S_IFDIR as u32;
const S_IFLNK: u32 = libc::S_IFLNK as u32;
const S_IFBLK: u32 = libc::S_IFBLK as u32;
const S_IFCHR: u32 = libc::S_IFCHR as u32;
const S_IFIFO: u32 = libc::S_IFIFO as u32;
const S_IFSOCK: u32 = libc::S_IFSOCK as u32;

/// Represents the type of a file system entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    BlockDevice,
    CharDevice,
    /// Named pipe
    Fifo,
    Socket,
    /// The backing store did not say (`DT_UNKNOWN`)
    Unknown,
}

impl FileType {
    /// Decodes the `S_IFMT` bits of a mode.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFREG => FileType::File,
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::Symlink,
            S_IFBLK => FileType::BlockDevice,
            S_IFCHR => FileType::CharDevice,
            S_IFIFO => FileType::Fifo,
            S_IFSOCK => FileType::Socket,
            _ => FileType::Unknown,
        }
    }

    /// Decodes the `d_type` of a raw directory entry.
    pub fn from_dirent(d_type: u8) -> Self {
        // d_type is the S_IFMT nibble shifted down by 12.
        Self::from_mode(u32::from(d_type) << 12)
    }

    pub fn is_fifo_mode(mode: u32) -> bool {
        mode & S_IFMT == S_IFIFO
    }
}

/// Full attributes of a backing entry, as returned by `lstat`/`fstat`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileAttributes {
    pub ino: u64,
    pub kind: FileType,
    /// Type and permission bits, verbatim.
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    /// Size in bytes
    pub size: u64,
    /// Allocated 512-byte blocks
    pub blocks: u64,
    pub blksize: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl FileAttributes {
    /// Permission bits only (`0o7777`).
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

impl From<&Metadata> for FileAttributes {
    fn from(meta: &Metadata) -> Self {
        Self {
            ino: meta.ino(),
            kind: FileType::from_mode(meta.mode()),
            mode: meta.mode(),
            nlink: meta.nlink(),
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev(),
            size: meta.size(),
            blocks: meta.blocks(),
            blksize: meta.blksize(),
            atime: system_time(meta.atime(), meta.atime_nsec()),
            mtime: system_time(meta.mtime(), meta.mtime_nsec()),
            ctime: system_time(meta.ctime(), meta.ctime_nsec()),
        }
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    let nanos = Duration::from_nanos(nsecs.clamp(0, 999_999_999) as u64);
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64) + nanos
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nanos
    }
}

/// Backing filesystem statistics, as returned by `statvfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub block_size: u64,
    pub fragment_size: u64,
    pub name_max: u64,
}

impl From<&libc::statvfs> for FsStats {
    fn from(st: &libc::statvfs) -> Self {
        Self {
            blocks: st.f_blocks as u64,
            blocks_free: st.f_bfree as u64,
            blocks_available: st.f_bavail as u64,
            files: st.f_files as u64,
            files_free: st.f_ffree as u64,
            block_size: st.f_bsize as u64,
            fragment_size: st.f_frsize as u64,
            name_max: st.f_namemax as u64,
        }
    }
}
