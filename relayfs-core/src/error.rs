//! Error types for relayfs and the translation between host error numbers and
//! the operation return contract.

use std::io;
use thiserror::Error;

/// Every failure a relayed operation can report.
///
/// Failures coming from a backing call keep the host error number they were
/// built from, so `RelayError::from_errno(code).errno() == code` for every code.
/// Nothing is retried or merged: an operation reports the one error its backing
/// call produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// File or directory not found.
    #[error("No such file or directory")]
    NotFound,

    /// The backing store refused access.
    #[error("Permission denied")]
    PermissionDenied,

    /// Expected a directory but found something else.
    #[error("Not a directory")]
    NotADirectory,

    /// Expected a non-directory but found a directory.
    #[error("Is a directory")]
    IsADirectory,

    /// File or directory already exists.
    #[error("File exists")]
    AlreadyExists,

    /// Directory still has entries.
    #[error("Directory not empty")]
    NotEmpty,

    /// Backing store is full.
    #[error("No space left on device")]
    NoSpace,

    /// Malformed argument, either rejected locally or by the backing call.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A path exceeds the host limit.
    #[error("Name too long: {0}")]
    NameTooLong(String),

    /// Optional capability absent from this build or configuration.
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Allocation failed, including handle-slot allocation.
    #[error("Out of memory")]
    OutOfMemory,

    /// A handle that was never issued or has already been released.
    #[error("Invalid handle: {0:#x}")]
    InvalidHandle(u64),

    /// Any host error number without a dedicated variant.
    #[error("Host error {0}")]
    Unknown(i32),
}

impl RelayError {
    /// Classifies a host error number.
    pub fn from_errno(code: i32) -> Self {
        match code {
            libc::ENOENT => RelayError::NotFound,
            libc::EACCES => RelayError::PermissionDenied,
            libc::ENOTDIR => RelayError::NotADirectory,
            libc::EISDIR => RelayError::IsADirectory,
            libc::EEXIST => RelayError::AlreadyExists,
            libc::ENOTEMPTY => RelayError::NotEmpty,
            libc::ENOSPC => RelayError::NoSpace,
            libc::EINVAL => RelayError::InvalidArgument("rejected by backing store".to_string()),
            libc::ENAMETOOLONG => RelayError::NameTooLong("rejected by backing store".to_string()),
            libc::EOPNOTSUPP => RelayError::NotSupported("backing store".to_string()),
            libc::ENOMEM => RelayError::OutOfMemory,
            other => RelayError::Unknown(other),
        }
    }

    /// Reads the calling thread's `errno` right after a failed host call.
    pub fn last_os_error() -> Self {
        Self::from_errno(errno::errno().0)
    }

    /// The positive host error number for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            RelayError::NotFound => libc::ENOENT,
            RelayError::PermissionDenied => libc::EACCES,
            RelayError::NotADirectory => libc::ENOTDIR,
            RelayError::IsADirectory => libc::EISDIR,
            RelayError::AlreadyExists => libc::EEXIST,
            RelayError::NotEmpty => libc::ENOTEMPTY,
            RelayError::NoSpace => libc::ENOSPC,
            RelayError::InvalidArgument(_) => libc::EINVAL,
            RelayError::NameTooLong(_) => libc::ENAMETOOLONG,
            RelayError::NotSupported(_) => libc::EOPNOTSUPP,
            RelayError::OutOfMemory => libc::ENOMEM,
            RelayError::InvalidHandle(_) => libc::EBADF,
            RelayError::Unknown(code) => *code,
        }
    }

    /// The `-errno` status returned by path-style operation tables.
    pub fn negated(&self) -> i32 {
        -self.errno()
    }
}

impl From<io::Error> for RelayError {
    fn from(err: io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            return RelayError::from_errno(code);
        }
        match err.kind() {
            io::ErrorKind::NotFound => RelayError::NotFound,
            io::ErrorKind::PermissionDenied => RelayError::PermissionDenied,
            io::ErrorKind::AlreadyExists => RelayError::AlreadyExists,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
                RelayError::InvalidArgument(err.to_string())
            }
            io::ErrorKind::OutOfMemory => RelayError::OutOfMemory,
            io::ErrorKind::Unsupported => RelayError::NotSupported(err.to_string()),
            _ => RelayError::Unknown(libc::EIO),
        }
    }
}

/// Result type alias for relayfs operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Collapses an operation result into the integer status contract: `0` on
/// success, `-errno` on failure.
pub fn status(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.negated(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(RelayError::NotFound.to_string(), "No such file or directory");
        assert_eq!(
            RelayError::NotSupported("xattr".to_string()).to_string(),
            "Operation not supported: xattr"
        );
        assert_eq!(RelayError::InvalidHandle(0x1_0000_0003).to_string(), "Invalid handle: 0x100000003");
        assert_eq!(RelayError::Unknown(libc::EIO).to_string(), format!("Host error {}", libc::EIO));
    }

    #[test]
    fn test_errno_is_preserved_for_every_code() {
        for code in 1..=133 {
            assert_eq!(RelayError::from_errno(code).errno(), code, "errno {code} changed");
        }
    }

    #[test]
    fn test_named_classification() {
        assert_eq!(RelayError::from_errno(libc::ENOENT), RelayError::NotFound);
        assert_eq!(RelayError::from_errno(libc::ENOTEMPTY), RelayError::NotEmpty);
        assert_eq!(RelayError::from_errno(libc::ENOMEM), RelayError::OutOfMemory);
        assert!(matches!(RelayError::from_errno(libc::EINVAL), RelayError::InvalidArgument(_)));
        assert!(matches!(RelayError::from_errno(libc::EOPNOTSUPP), RelayError::NotSupported(_)));
        assert_eq!(RelayError::from_errno(libc::EPERM), RelayError::Unknown(libc::EPERM));
    }

    #[test]
    fn test_io_error_conversion() {
        let err: RelayError = io::Error::from_raw_os_error(libc::EEXIST).into();
        assert_eq!(err, RelayError::AlreadyExists);

        let err: RelayError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err, RelayError::NotFound);

        let err: RelayError = io::Error::new(io::ErrorKind::Other, "odd").into();
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn test_out_of_memory_is_its_own_kind() {
        assert_eq!(RelayError::OutOfMemory.errno(), libc::ENOMEM);
        assert_ne!(RelayError::OutOfMemory.errno(), RelayError::InvalidHandle(1).errno());
        assert_ne!(RelayError::OutOfMemory, RelayError::Unknown(libc::ENOMEM));
        assert_eq!(RelayError::from_errno(libc::ENOMEM), RelayError::OutOfMemory);
        // A backing EBADF is not mistaken for a stale relay handle.
        assert_eq!(RelayError::from_errno(libc::EBADF), RelayError::Unknown(libc::EBADF));
    }

    #[test]
    fn test_status_contract() {
        assert_eq!(status(Ok(())), 0);
        assert_eq!(status(Err(RelayError::NotFound)), -libc::ENOENT);
        assert_eq!(RelayError::InvalidHandle(7).negated(), -libc::EBADF);
    }
}
