//! Thin wrappers around the host calls that std does not expose.

use std::ffi::{CString, OsStr};
use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::{RelayError, Result};

pub(crate) fn cstring(path: &Path) -> Result<CString> {
    cstring_os(path.as_os_str())
}

pub(crate) fn cstring_os(s: &OsStr) -> Result<CString> {
    CString::new(s.as_bytes())
        .map_err(|_| RelayError::InvalidArgument(format!("interior NUL byte in {:?}", s)))
}

/// Turns a `-1` return into the thread's `errno`.
pub(crate) fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

pub(crate) fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// `open(2)` with the caller's flags passed through unchanged, plus `O_CLOEXEC`.
pub(crate) fn open(path: &Path, flags: libc::c_int, mode: u32) -> Result<File> {
    let c_path = cstring(path)?;
    let fd = cvt(unsafe { libc::open(c_path.as_ptr(), flags | libc::O_CLOEXEC, mode as libc::c_uint) })?;
    // SAFETY: `fd` was just returned by open(2) and nothing else owns it.
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Closes `fd`, reporting the close error instead of swallowing it.
pub(crate) fn close(fd: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::close(fd) }).map(|_| ())
}
