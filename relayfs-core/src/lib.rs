//! # RelayFS Core
//!
//! The core library for RelayFS - a passthrough filesystem that relays every
//! operation issued against a mount onto an existing backing directory.
//!
//! ## Overview
//!
//! The core is a plain synchronous call surface. A bridge (FUSE on Linux, see
//! `relayfs-linux`) turns kernel requests into calls on [`RelayFs`], which
//! resolves virtual paths against the backing root, makes the one matching
//! backing call, and reports its result.
//!
//! ## Basic Usage
//!
//! ```rust,ignore
//! use relayfs_core::{MountContext, OpenFlags, RelayFs, VirtualPath};
//!
//! let relay = RelayFs::new(MountContext::new("/srv/data"));
//! let path = VirtualPath::new("/notes.txt")?;
//! let fh = relay.create(&path, 0o644, OpenFlags::READ_WRITE)?;
//! relay.write(fh, b"hello", 0)?;
//! relay.release(fh)?;
//! ```
//!
//! ## Architecture
//!
//! - [`types`]: virtual paths, the mount context, handles and configuration
//! - [`error`]: the error type and host error number translation
//! - [`dir_stream`]: open directory streams with offset-based resume
//! - [`file_handle`]: open files with positioned I/O
//! - [`xattr`]: extended attributes (optional)
//! - [`dispatcher`]: the operation entry points
//!
//! ## Optional operation families
//!
//! Extended attributes, byte-range locks and preallocation are behind the
//! `xattr`, `posix-locks` and `fallocate` features (all on by default) and can
//! also be switched off at runtime through [`Capabilities`]. A family that is
//! off answers every request with `EOPNOTSUPP`.

pub mod types;
pub mod error;
mod sys;
pub mod dir_stream;
pub mod file_handle;
#[cfg(all(feature = "posix-locks", target_os = "linux"))]
pub mod lock;
pub mod xattr;
pub mod dispatcher;

pub use dispatcher::RelayFs;
pub use error::{RelayError, Result};
pub use types::*;
