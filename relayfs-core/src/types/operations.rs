use std::time::{SystemTime, UNIX_EPOCH};

/// `open(2)` flags, relayed verbatim to the backing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenFlags(i32);

impl OpenFlags {
    pub const READ_ONLY: Self = Self(libc::O_RDONLY);
    pub const WRITE_ONLY: Self = Self(libc::O_WRONLY);
    pub const READ_WRITE: Self = Self(libc::O_RDWR);
    /// Append mode flag
    pub const APPEND: Self = Self(libc::O_APPEND);
    /// Create file if it doesn't exist
    pub const CREATE: Self = Self(libc::O_CREAT);
    /// Truncate file to zero length
    pub const TRUNCATE: Self = Self(libc::O_TRUNC);
    /// Exclusive creation (fail if file exists)
    pub const EXCLUSIVE: Self = Self(libc::O_EXCL);

    /// Wraps raw flags as received from the bridge.
    pub const fn from_raw(bits: i32) -> Self {
        Self(bits)
    }

    /// Returns the raw value of the flags.
    pub const fn bits(&self) -> i32 {
        self.0
    }

    /// The `O_ACCMODE` part.
    pub const fn access_mode(&self) -> i32 {
        self.0 & libc::O_ACCMODE
    }

    /// Returns true if all flags in `other` are set. Access modes compare exactly.
    pub const fn contains(&self, other: Self) -> bool {
        let other_access = other.0 & libc::O_ACCMODE;
        let other_rest = other.0 & !libc::O_ACCMODE;
        (other_access == 0 || self.access_mode() == other_access) && self.0 & other_rest == other_rest
    }

    /// Returns the union of the flags.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self::READ_ONLY
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// One timestamp argument of a set-times request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    /// Leave the timestamp unchanged
    Omit,
    /// Use the backing store's current time
    Now,
    At(SystemTime),
}

impl SetTime {
    pub fn to_timespec(self) -> libc::timespec {
        match self {
            SetTime::Omit => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
            SetTime::Now => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_NOW,
            },
            SetTime::At(time) => {
                let (secs, nanos) = match time.duration_since(UNIX_EPOCH) {
                    Ok(after) => (after.as_secs() as i64, after.subsec_nanos() as i64),
                    Err(before) => {
                        let before = before.duration();
                        let mut secs = -(before.as_secs() as i64);
                        let mut nanos = before.subsec_nanos() as i64;
                        if nanos > 0 {
                            secs -= 1;
                            nanos = 1_000_000_000 - nanos;
                        }
                        (secs, nanos)
                    }
                };
                libc::timespec {
                    tv_sec: secs as libc::time_t,
                    tv_nsec: nanos as _,
                }
            }
        }
    }
}

/// Lock type of a byte-range lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Shared/read lock - multiple readers allowed
    Read,
    /// Exclusive/write lock - single writer only
    Write,
    Unlock,
}

impl LockKind {
    /// Decodes an `l_type` value (`F_RDLCK`, `F_WRLCK`, `F_UNLCK`).
    pub fn from_raw(l_type: i32) -> Option<Self> {
        match l_type {
            t if t == libc::F_RDLCK as i32 => Some(LockKind::Read),
            t if t == libc::F_WRLCK as i32 => Some(LockKind::Write),
            t if t == libc::F_UNLCK as i32 => Some(LockKind::Unlock),
            _ => None,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            LockKind::Read => libc::F_RDLCK as i32,
            LockKind::Write => libc::F_WRLCK as i32,
            LockKind::Unlock => libc::F_UNLCK as i32,
        }
    }
}

/// A POSIX byte-range lock description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRangeLock {
    pub kind: LockKind,
    pub start: u64,
    /// Last byte covered, inclusive. `i64::MAX` or above extends to end of file.
    pub end: u64,
    /// Holder reported by a query; informational on set.
    pub pid: u32,
}

impl ByteRangeLock {
    pub fn new(kind: LockKind, start: u64, end: u64) -> Self {
        Self { kind, start, end, pid: 0 }
    }

    /// Covers the whole file.
    pub fn whole_file(kind: LockKind) -> Self {
        Self::new(kind, 0, u64::MAX)
    }
}

/// What a byte-range lock request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCommand {
    /// Report a conflicting lock, or `Unlock` if the range is free
    Get,
    /// Acquire or release without waiting
    Set,
    /// Acquire, waiting for conflicting holders
    SetWait,
}

/// A whole-file advisory lock request (`flock(2)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlockOperation {
    pub kind: LockKind,
    pub nonblocking: bool,
}

impl FlockOperation {
    /// Decodes `LOCK_SH`/`LOCK_EX`/`LOCK_UN`, optionally with `LOCK_NB`.
    pub fn from_raw(op: i32) -> Option<Self> {
        let nonblocking = op & libc::LOCK_NB != 0;
        let kind = match op & !libc::LOCK_NB {
            libc::LOCK_SH => LockKind::Read,
            libc::LOCK_EX => LockKind::Write,
            libc::LOCK_UN => LockKind::Unlock,
            _ => return None,
        };
        Some(Self { kind, nonblocking })
    }

    pub fn raw(self) -> i32 {
        let op = match self.kind {
            LockKind::Read => libc::LOCK_SH,
            LockKind::Write => libc::LOCK_EX,
            LockKind::Unlock => libc::LOCK_UN,
        };
        if self.nonblocking {
            op | libc::LOCK_NB
        } else {
            op
        }
    }
}

/// Creation semantics of a set-xattr request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XattrFlags {
    /// Create or replace
    Either,
    /// Fail if the attribute exists
    CreateOnly,
    /// Fail if the attribute is missing
    ReplaceOnly,
}

impl XattrFlags {
    pub fn from_raw(flags: i32) -> Self {
        if flags & XATTR_CREATE != 0 {
            XattrFlags::CreateOnly
        } else if flags & XATTR_REPLACE != 0 {
            XattrFlags::ReplaceOnly
        } else {
            XattrFlags::Either
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            XattrFlags::Either => 0,
            XattrFlags::CreateOnly => XATTR_CREATE,
            XattrFlags::ReplaceOnly => XATTR_REPLACE,
        }
    }
}

const XATTR_CREATE: i32 = 1;
const XATTR_REPLACE: i32 = 2;

/// Answer to a get/list extended-attribute request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XattrReply {
    /// Size the caller must provide; answered when it asked with size 0
    Size(usize),
    Data(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags::from_raw(libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC);
        assert!(flags.contains(OpenFlags::READ_WRITE));
        assert!(flags.contains(OpenFlags::CREATE | OpenFlags::TRUNCATE));
        assert!(!flags.contains(OpenFlags::WRITE_ONLY));
        assert!(!flags.contains(OpenFlags::APPEND));
        assert_eq!(flags.access_mode(), libc::O_RDWR);
        assert_eq!((OpenFlags::WRITE_ONLY | OpenFlags::CREATE).bits(), libc::O_WRONLY | libc::O_CREAT);
    }

    #[test]
    fn test_set_time_timespec() {
        assert_eq!(SetTime::Omit.to_timespec().tv_nsec, libc::UTIME_OMIT);
        assert_eq!(SetTime::Now.to_timespec().tv_nsec, libc::UTIME_NOW);

        let ts = SetTime::At(UNIX_EPOCH + Duration::new(1_700_000_000, 250)).to_timespec();
        assert_eq!(ts.tv_sec, 1_700_000_000);
        assert_eq!(ts.tv_nsec, 250);

        let ts = SetTime::At(UNIX_EPOCH - Duration::new(1, 500_000_000)).to_timespec();
        assert_eq!(ts.tv_sec, -2);
        assert_eq!(ts.tv_nsec, 500_000_000);
    }

    #[test]
    fn test_lock_kind_raw() {
        for kind in [LockKind::Read, LockKind::Write, LockKind::Unlock] {
            assert_eq!(LockKind::from_raw(kind.raw()), Some(kind));
        }
        assert_eq!(LockKind::from_raw(-1), None);
    }

    #[test]
    fn test_flock_operation() {
        let op = FlockOperation::from_raw(libc::LOCK_EX | libc::LOCK_NB).unwrap();
        assert_eq!(op.kind, LockKind::Write);
        assert!(op.nonblocking);
        assert_eq!(op.raw(), libc::LOCK_EX | libc::LOCK_NB);
        assert_eq!(FlockOperation::from_raw(libc::LOCK_UN).unwrap().kind, LockKind::Unlock);
        assert!(FlockOperation::from_raw(0).is_none());
    }

    #[test]
    fn test_xattr_flags() {
        assert_eq!(XattrFlags::from_raw(0), XattrFlags::Either);
        assert_eq!(XattrFlags::from_raw(1), XattrFlags::CreateOnly);
        assert_eq!(XattrFlags::from_raw(2), XattrFlags::ReplaceOnly);
        assert_eq!(XattrFlags::ReplaceOnly.raw(), 2);
    }
}
