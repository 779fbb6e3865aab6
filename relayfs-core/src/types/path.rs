//! Virtual paths and their resolution onto the backing root.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use crate::error::{RelayError, Result};

/// Host limit on a resolved path, counting the terminating NUL added when the
/// path is handed to a backing call.
pub const DEFAULT_MAX_PATH: usize = libc::PATH_MAX as usize;

/// A slash-separated path as seen through the mount, always starting with `/`.
///
/// The path is relayed byte for byte, except that `.` and `..` components are
/// refused so that no virtual path names anything above the mount root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualPath {
    inner: OsString,
}

impl VirtualPath {
    /// The mount root, `/`.
    pub fn root() -> Self {
        Self {
            inner: OsString::from("/"),
        }
    }

    /// Validates and wraps a path received from the bridge.
    pub fn new(path: impl Into<OsString>) -> Result<Self> {
        let inner = path.into();
        let bytes = inner.as_bytes();
        if bytes.first() != Some(&b'/') {
            return Err(RelayError::InvalidArgument(format!(
                "virtual path must start with '/': {:?}",
                inner
            )));
        }
        if bytes.contains(&0) {
            return Err(RelayError::InvalidArgument(format!(
                "virtual path contains a NUL byte: {:?}",
                inner
            )));
        }
        if bytes.split(|&b| b == b'/').any(is_dot_component) {
            return Err(RelayError::InvalidArgument(format!(
                "virtual path contains a '.' or '..' component: {:?}",
                inner
            )));
        }
        Ok(Self { inner })
    }

    pub fn as_os_str(&self) -> &OsStr {
        &self.inner
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.as_bytes() == b"/"
    }

    /// Appends a single component.
    pub fn join(&self, name: &OsStr) -> Result<Self> {
        let component = name.as_bytes();
        if component.is_empty()
            || is_dot_component(component)
            || component.contains(&b'/')
            || component.contains(&0)
        {
            return Err(RelayError::InvalidArgument(format!(
                "invalid path component: {:?}",
                name
            )));
        }
        let mut bytes = Vec::with_capacity(self.len() + component.len() + 1);
        bytes.extend_from_slice(self.as_bytes());
        if !self.is_root() {
            bytes.push(b'/');
        }
        bytes.extend_from_slice(component);
        Ok(Self {
            inner: OsString::from_vec(bytes),
        })
    }

    /// The containing directory, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let bytes = self.as_bytes();
        let cut = bytes.iter().rposition(|&b| b == b'/')?;
        let parent = if cut == 0 { &bytes[..1] } else { &bytes[..cut] };
        Some(Self {
            inner: OsStr::from_bytes(parent).to_os_string(),
        })
    }

    /// The last component, or `None` for the root.
    pub fn file_name(&self) -> Option<&OsStr> {
        if self.is_root() {
            return None;
        }
        let bytes = self.as_bytes();
        let cut = bytes.iter().rposition(|&b| b == b'/')?;
        Some(OsStr::from_bytes(&bytes[cut + 1..]))
    }

    /// True when `self` is `ancestor` or lies beneath it.
    pub fn starts_with(&self, ancestor: &VirtualPath) -> bool {
        if ancestor.is_root() {
            return true;
        }
        let bytes = self.as_bytes();
        let prefix = ancestor.as_bytes();
        bytes.starts_with(prefix) && (bytes.len() == prefix.len() || bytes[prefix.len()] == b'/')
    }

    /// Moves `self` from beneath `from` to beneath `to`.
    pub fn rebase(&self, from: &VirtualPath, to: &VirtualPath) -> Option<Self> {
        if !self.starts_with(from) {
            return None;
        }
        let rest = if from.is_root() {
            &self.as_bytes()[1..]
        } else {
            &self.as_bytes()[from.len()..]
        };
        let rest = rest.strip_prefix(b"/").unwrap_or(rest);
        if rest.is_empty() {
            return Some(to.clone());
        }
        let mut bytes = to.as_bytes().to_vec();
        if !to.is_root() {
            bytes.push(b'/');
        }
        bytes.extend_from_slice(rest);
        Some(Self {
            inner: OsString::from_vec(bytes),
        })
    }
}

fn is_dot_component(component: &[u8]) -> bool {
    component == b"." || component == b".."
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.to_string_lossy())
    }
}

impl TryFrom<&str> for VirtualPath {
    type Error = RelayError;

    fn try_from(s: &str) -> Result<Self> {
        VirtualPath::new(s)
    }
}

impl TryFrom<&Path> for VirtualPath {
    type Error = RelayError;

    fn try_from(path: &Path) -> Result<Self> {
        VirtualPath::new(path.as_os_str())
    }
}

/// The backing root that every virtual path of one mount resolves against.
///
/// Built once at startup and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountContext {
    root: PathBuf,
    max_path: usize,
}

impl MountContext {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_max_path(root, DEFAULT_MAX_PATH)
    }

    pub fn with_max_path(root: impl Into<PathBuf>, max_path: usize) -> Self {
        Self {
            root: root.into(),
            max_path,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_path(&self) -> usize {
        self.max_path
    }

    /// Concatenates the backing root and `path`.
    ///
    /// Fails with `NameTooLong` when the result would not fit the host limit
    /// instead of cutting it short. Symlinks are left to the backing store.
    pub fn resolve(&self, path: &VirtualPath) -> Result<PathBuf> {
        let root = self.root.as_os_str().as_bytes();
        let len = root.len() + path.len();
        if len >= self.max_path {
            return Err(RelayError::NameTooLong(format!(
                "resolved path is {} bytes, limit is {}",
                len,
                self.max_path.saturating_sub(1)
            )));
        }
        let mut bytes = Vec::with_capacity(len);
        bytes.extend_from_slice(root);
        bytes.extend_from_slice(path.as_bytes());
        Ok(PathBuf::from(OsString::from_vec(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vpath(s: &str) -> VirtualPath {
        VirtualPath::new(s).unwrap()
    }

    #[test]
    fn test_rejects_malformed_virtual_paths() {
        assert!(matches!(VirtualPath::new("relative"), Err(RelayError::InvalidArgument(_))));
        assert!(matches!(VirtualPath::new(""), Err(RelayError::InvalidArgument(_))));
        assert!(matches!(VirtualPath::new("/a\0b"), Err(RelayError::InvalidArgument(_))));
        assert!(matches!(VirtualPath::new("/../etc"), Err(RelayError::InvalidArgument(_))));
        assert!(matches!(VirtualPath::new("/a/./b"), Err(RelayError::InvalidArgument(_))));
        assert!(matches!(VirtualPath::new("/a/.."), Err(RelayError::InvalidArgument(_))));
        // Dots inside a name are ordinary bytes.
        assert!(VirtualPath::new("/.hidden/..twice/a..b").is_ok());
    }

    #[test]
    fn test_join_refuses_dot_components() {
        let root = VirtualPath::root();
        for name in [".", ".."] {
            let err = root.join(OsStr::new(name)).unwrap_err();
            assert!(matches!(err, RelayError::InvalidArgument(_)));
            assert_eq!(err.errno(), libc::EINVAL);
        }
        assert!(vpath("/a").join(OsStr::new("..")).is_err());
        assert_eq!(root.join(OsStr::new("...")).unwrap(), vpath("/..."));
    }

    #[test]
    fn test_tiny_path_limits_fail_cleanly() {
        for max in [0, 1] {
            let ctx = MountContext::with_max_path("/r", max);
            let err = ctx.resolve(&VirtualPath::root()).unwrap_err();
            assert_eq!(err.errno(), libc::ENAMETOOLONG);
        }
    }

    #[test]
    fn test_resolve_concatenates() {
        let ctx = MountContext::new("/srv/backing");
        assert_eq!(ctx.resolve(&vpath("/a/b.txt")).unwrap(), PathBuf::from("/srv/backing/a/b.txt"));
        assert_eq!(ctx.resolve(&VirtualPath::root()).unwrap(), PathBuf::from("/srv/backing/"));
    }

    #[test]
    fn test_resolve_length_bound() {
        let ctx = MountContext::with_max_path("/root", 32);
        for tail in 1..40 {
            let path = vpath(&format!("/{}", "x".repeat(tail - 1)));
            let total = ctx.root().as_os_str().len() + path.len();
            match ctx.resolve(&path) {
                Ok(resolved) => {
                    assert!(total < 32);
                    assert_eq!(resolved.as_os_str().len(), total);
                    assert!(resolved.as_os_str().as_bytes().ends_with(path.as_bytes()));
                }
                Err(err) => {
                    assert!(total >= 32);
                    assert_eq!(err.errno(), libc::ENAMETOOLONG);
                }
            }
        }
    }

    #[test]
    fn test_join_and_parent() {
        let dir = vpath("/docs");
        let file = dir.join(OsStr::new("notes.md")).unwrap();
        assert_eq!(file, vpath("/docs/notes.md"));
        assert_eq!(file.parent(), Some(dir));
        assert_eq!(file.file_name(), Some(OsStr::new("notes.md")));
        assert_eq!(VirtualPath::root().join(OsStr::new("a")).unwrap(), vpath("/a"));
        assert_eq!(vpath("/a").parent(), Some(VirtualPath::root()));
        assert_eq!(VirtualPath::root().parent(), None);
        assert!(VirtualPath::root().join(OsStr::new("a/b")).is_err());
    }

    #[test]
    fn test_starts_with_respects_component_boundaries() {
        assert!(vpath("/a/b").starts_with(&vpath("/a")));
        assert!(vpath("/a").starts_with(&vpath("/a")));
        assert!(!vpath("/ab").starts_with(&vpath("/a")));
        assert!(vpath("/ab").starts_with(&VirtualPath::root()));
    }

    #[test]
    fn test_rebase() {
        let moved = vpath("/a/b/c").rebase(&vpath("/a"), &vpath("/z")).unwrap();
        assert_eq!(moved, vpath("/z/b/c"));
        assert_eq!(vpath("/a").rebase(&vpath("/a"), &vpath("/q/r")), Some(vpath("/q/r")));
        assert_eq!(vpath("/other").rebase(&vpath("/a"), &vpath("/z")), None);
    }
}
