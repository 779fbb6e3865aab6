use std::ffi::{OsStr, OsString};

use crate::types::FileType;

/// One entry produced while iterating an open directory stream.
///
/// Only the inode and entry type are carried; full metadata is never fetched
/// per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// The name of the file or directory
    pub name: OsString,
    /// Inode number reported by the backing store
    pub ino: u64,
    /// Entry type from `d_type`
    pub kind: FileType,
    /// Stream position just past this entry, to resume after it
    pub next_offset: i64,
}

impl DirectoryEntry {
    /// Returns the name of the entry.
    pub fn name(&self) -> &OsStr {
        &self.name
    }

    /// Mode stub carrying only the type bits.
    pub fn mode(&self) -> u32 {
        match self.kind {
            FileType::File => libc::S_IFREG as u32,
            FileType::Directory => libc::S_IFDIR as u32,
            FileType::Symlink => libc::S_IFLNK as u32,
            FileType::BlockDevice => libc::S_IFBLK as u32,
            FileType::CharDevice => libc::S_IFCHR as u32,
            FileType::Fifo => libc::S_IFIFO as u32,
            FileType::Socket => libc::S_IFSOCK as u32,
            FileType::Unknown => 0,
        }
    }

    /// Returns true if this entry is a directory.
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, FileType::Directory)
    }

    /// Returns true if this entry is the `.` or `..` link.
    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, kind: FileType) -> DirectoryEntry {
        DirectoryEntry {
            name: OsString::from(name),
            ino: 7,
            kind,
            next_offset: 1,
        }
    }

    #[test]
    fn test_mode_stub() {
        assert_eq!(entry("a", FileType::File).mode(), libc::S_IFREG as u32);
        assert_eq!(entry("d", FileType::Directory).mode(), libc::S_IFDIR as u32);
        assert_eq!(entry("u", FileType::Unknown).mode(), 0);
        assert_eq!(FileType::from_mode(entry("p", FileType::Fifo).mode()), FileType::Fifo);
    }

    #[test]
    fn test_dot_entries() {
        assert!(entry(".", FileType::Directory).is_dot());
        assert!(entry("..", FileType::Directory).is_dot());
        assert!(!entry("...", FileType::File).is_dot());
        assert!(entry("..", FileType::Directory).is_directory());
    }
}
