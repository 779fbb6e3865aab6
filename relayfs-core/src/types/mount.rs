//! Mount-related options handed to the bridge.

use serde::{Deserialize, Serialize};

/// Configuration options for mounting a relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Whether the mount should be read-only
    pub read_only: bool,

    /// Let users other than the mounting user access the mount
    pub allow_other: bool,

    /// Unmount automatically when the relay process exits
    pub auto_unmount: bool,

    /// Let the kernel check permissions against the relayed mode bits
    pub default_permissions: bool,

    /// Name shown as the mount source (None = "relayfs")
    pub fs_name: Option<String>,

    /// Unrecognised options, forwarded verbatim
    pub passthrough: Vec<String>,
}

impl MountOptions {
    /// Creates a new MountOptions with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new builder for MountOptions.
    pub fn builder() -> MountOptionsBuilder {
        MountOptionsBuilder::new()
    }

    /// Applies one `-o` style option, e.g. `ro` or `fsname=backup`.
    ///
    /// Options relayfs does not know are kept for the bridge unchanged.
    pub fn apply(&mut self, option: &str) {
        let option = option.trim();
        match option {
            "" => {}
            "ro" => self.read_only = true,
            "rw" => self.read_only = false,
            "allow_other" => self.allow_other = true,
            "auto_unmount" => self.auto_unmount = true,
            "default_permissions" => self.default_permissions = true,
            _ => match option.strip_prefix("fsname=") {
                Some(name) => self.fs_name = Some(name.to_string()),
                None => self.passthrough.push(option.to_string()),
            },
        }
    }

    /// Applies a comma-separated option list.
    pub fn apply_all<'a>(&mut self, options: impl IntoIterator<Item = &'a str>) {
        for list in options {
            for option in list.split(',') {
                self.apply(option);
            }
        }
    }

    /// Name shown as the mount source.
    pub fn fs_name(&self) -> &str {
        self.fs_name.as_deref().unwrap_or("relayfs")
    }
}

/// Builder for MountOptions with a fluent interface.
#[derive(Debug, Default)]
pub struct MountOptionsBuilder {
    options: MountOptions,
}

impl MountOptionsBuilder {
    /// Creates a new builder with default options.
    pub fn new() -> Self {
        Self {
            options: MountOptions::default(),
        }
    }

    /// Sets the mount as read-only.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.options.read_only = read_only;
        self
    }

    pub fn allow_other(mut self, allow: bool) -> Self {
        self.options.allow_other = allow;
        self
    }

    pub fn auto_unmount(mut self, enabled: bool) -> Self {
        self.options.auto_unmount = enabled;
        self
    }

    pub fn default_permissions(mut self, enabled: bool) -> Self {
        self.options.default_permissions = enabled;
        self
    }

    pub fn fs_name(mut self, name: impl Into<String>) -> Self {
        self.options.fs_name = Some(name.into());
        self
    }

    /// Adds an option forwarded to the bridge unmodified.
    pub fn passthrough(mut self, option: impl Into<String>) -> Self {
        self.options.passthrough.push(option.into());
        self
    }

    /// Builds the final MountOptions.
    pub fn build(self) -> MountOptions {
        self.options
    }
}
