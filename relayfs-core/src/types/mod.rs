// Module declarations
pub mod path;
pub mod handle;
pub mod metadata;
pub mod operations;
pub mod directory;
pub mod mount;
pub mod config;

// Re-export all types from submodules
pub use path::{MountContext, VirtualPath, DEFAULT_MAX_PATH};
pub use handle::{DirHandle, FileHandle, HandleTable, RawHandle};
pub use metadata::{FileAttributes, FileType, FsStats};
pub use operations::{
    ByteRangeLock, FlockOperation, LockCommand, LockKind, OpenFlags, SetTime, XattrFlags, XattrReply,
};
pub use directory::DirectoryEntry;
pub use mount::{MountOptions, MountOptionsBuilder};
pub use config::{Capabilities, LogLevel, RelayConfig};
