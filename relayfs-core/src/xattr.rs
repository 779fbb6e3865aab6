//! Extended attributes on backing paths.
//!
//! All calls use the no-follow variants, so a symlink's own attributes are
//! addressed rather than its target's. A zero `size` on get/list asks for the
//! buffer size the caller needs.

use std::ffi::OsStr;
use std::path::Path;

use crate::error::Result;
use crate::types::{XattrFlags, XattrReply};

#[cfg(all(feature = "xattr", target_os = "linux"))]
mod backing {
    use super::*;
    use crate::sys;
    use libc::c_void;

    pub fn get(path: &Path, name: &OsStr, size: usize) -> Result<XattrReply> {
        let c_path = sys::cstring(path)?;
        let c_name = sys::cstring_os(name)?;
        if size == 0 {
            let needed = unsafe {
                libc::lgetxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0)
            };
            return Ok(XattrReply::Size(sys::cvt_size(needed)?));
        }

        let mut buf = vec![0u8; size];
        let read = unsafe {
            libc::lgetxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
            )
        };
        buf.truncate(sys::cvt_size(read)?);
        Ok(XattrReply::Data(buf))
    }

    pub fn set(path: &Path, name: &OsStr, value: &[u8], flags: XattrFlags) -> Result<()> {
        let c_path = sys::cstring(path)?;
        let c_name = sys::cstring_os(name)?;
        sys::cvt(unsafe {
            libc::lsetxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                value.as_ptr() as *const c_void,
                value.len(),
                flags.raw(),
            )
        })?;
        Ok(())
    }

    pub fn list(path: &Path, size: usize) -> Result<XattrReply> {
        let c_path = sys::cstring(path)?;
        if size == 0 {
            let needed = unsafe { libc::llistxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) };
            return Ok(XattrReply::Size(sys::cvt_size(needed)?));
        }

        let mut buf = vec![0u8; size];
        let read = unsafe {
            libc::llistxattr(c_path.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
        };
        buf.truncate(sys::cvt_size(read)?);
        Ok(XattrReply::Data(buf))
    }

    pub fn remove(path: &Path, name: &OsStr) -> Result<()> {
        let c_path = sys::cstring(path)?;
        let c_name = sys::cstring_os(name)?;
        sys::cvt(unsafe { libc::lremovexattr(c_path.as_ptr(), c_name.as_ptr()) })?;
        Ok(())
    }
}

#[cfg(not(all(feature = "xattr", target_os = "linux")))]
mod backing {
    use super::*;
    use crate::error::RelayError;

    fn unsupported<T>() -> Result<T> {
        Err(RelayError::NotSupported("extended attributes".to_string()))
    }

    pub fn get(_path: &Path, _name: &OsStr, _size: usize) -> Result<XattrReply> {
        unsupported()
    }

    pub fn set(_path: &Path, _name: &OsStr, _value: &[u8], _flags: XattrFlags) -> Result<()> {
        unsupported()
    }

    pub fn list(_path: &Path, _size: usize) -> Result<XattrReply> {
        unsupported()
    }

    pub fn remove(_path: &Path, _name: &OsStr) -> Result<()> {
        unsupported()
    }
}

/// Reads attribute `name`, or its size when `size` is 0.
pub fn get_xattr(path: &Path, name: &OsStr, size: usize) -> Result<XattrReply> {
    backing::get(path, name, size)
}

pub fn set_xattr(path: &Path, name: &OsStr, value: &[u8], flags: XattrFlags) -> Result<()> {
    backing::set(path, name, value, flags)
}

/// Lists attribute names as a NUL-separated byte string, or its size when
/// `size` is 0.
pub fn list_xattr(path: &Path, size: usize) -> Result<XattrReply> {
    backing::list(path, size)
}

pub fn remove_xattr(path: &Path, name: &OsStr) -> Result<()> {
    backing::remove(path, name)
}

/// Splits a list reply into attribute names.
pub fn split_names<'a>(list: &'a [u8]) -> impl Iterator<Item = &'a OsStr> + 'a {
    use std::os::unix::ffi::OsStrExt;
    list.split(|b| *b == 0)
        .filter(|name| !name.is_empty())
        .map(OsStr::from_bytes)
}

#[cfg(all(test, feature = "xattr", target_os = "linux"))]
mod tests {
    use super::*;
    use crate::error::RelayError;

    /// Sets a first attribute, or returns false when the backing filesystem
    /// has no user xattrs.
    fn try_seed(path: &Path) -> bool {
        match set_xattr(path, OsStr::new("user.relay.seed"), b"1", XattrFlags::Either) {
            Ok(()) => true,
            Err(RelayError::NotSupported(_)) => false,
            Err(err) => panic!("unexpected xattr error: {:?}", err),
        }
    }

    #[test]
    fn test_set_get_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attrs");
        std::fs::write(&path, b"").unwrap();
        if !try_seed(&path) {
            return;
        }

        let name = OsStr::new("user.relay.color");
        set_xattr(&path, name, b"blue", XattrFlags::CreateOnly).unwrap();

        assert_eq!(get_xattr(&path, name, 0).unwrap(), XattrReply::Size(4));
        assert_eq!(get_xattr(&path, name, 16).unwrap(), XattrReply::Data(b"blue".to_vec()));

        let needed = match list_xattr(&path, 0).unwrap() {
            XattrReply::Size(n) => n,
            other => panic!("expected size, got {:?}", other),
        };
        let names = match list_xattr(&path, needed).unwrap() {
            XattrReply::Data(data) => data,
            other => panic!("expected data, got {:?}", other),
        };
        let names: Vec<&OsStr> = split_names(&names).collect();
        assert!(names.contains(&name));
        assert!(names.contains(&OsStr::new("user.relay.seed")));

        remove_xattr(&path, name).unwrap();
        assert_eq!(get_xattr(&path, name, 16).unwrap_err().errno(), libc::ENODATA);
    }

    #[test]
    fn test_create_and_replace_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flags");
        std::fs::write(&path, b"").unwrap();
        if !try_seed(&path) {
            return;
        }

        let name = OsStr::new("user.relay.seed");
        let err = set_xattr(&path, name, b"2", XattrFlags::CreateOnly).unwrap_err();
        assert_eq!(err, RelayError::AlreadyExists);
        set_xattr(&path, name, b"2", XattrFlags::ReplaceOnly).unwrap();

        let missing = OsStr::new("user.relay.missing");
        let err = set_xattr(&path, missing, b"x", XattrFlags::ReplaceOnly).unwrap_err();
        assert_eq!(err.errno(), libc::ENODATA);
    }

    #[test]
    fn test_small_buffer_reports_range_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small");
        std::fs::write(&path, b"").unwrap();
        if !try_seed(&path) {
            return;
        }
        set_xattr(&path, OsStr::new("user.relay.long"), b"0123456789", XattrFlags::Either).unwrap();
        let err = get_xattr(&path, OsStr::new("user.relay.long"), 3).unwrap_err();
        assert_eq!(err.errno(), libc::ERANGE);
    }

    #[test]
    fn test_split_names() {
        let names: Vec<&OsStr> = split_names(b"user.a\0user.b\0").collect();
        assert_eq!(names, vec![OsStr::new("user.a"), OsStr::new("user.b")]);
    }
}
