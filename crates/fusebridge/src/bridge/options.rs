use crate::{mount::MountOptions, session::KernelConfig};
use std::{ffi::OsStr, time::Duration};

const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(10);

/// Settings of a bridged mount.
#[derive(Debug, Clone)]
pub struct Options {
    pub(crate) debug: bool,
    pub(crate) mount: MountOptions,
    pub(crate) attr_ttl: Duration,
    pub(crate) entry_ttl: Duration,
    pub(crate) config: KernelConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            debug: false,
            mount: MountOptions::default(),
            attr_ttl: DEFAULT_ATTR_TTL,
            entry_ttl: Duration::ZERO,
            config: KernelConfig::default(),
        }
    }
}

impl Options {
    /// Log every request and reply on the `fusebridge::wire` target.
    pub fn debug(&mut self, enabled: bool) -> &mut Self {
        self.debug = enabled;
        self
    }

    /// Forward mount options to `fusermount -o`, as a comma-separated list.
    pub fn mount_option(&mut self, option: &str) -> &mut Self {
        self.mount.mount_option(option);
        self
    }

    pub fn auto_unmount(&mut self, enabled: bool) -> &mut Self {
        self.mount.auto_unmount(enabled);
        self
    }

    pub fn fusermount_path(&mut self, program: impl AsRef<OsStr>) -> &mut Self {
        self.mount.fusermount_path(program);
        self
    }

    /// How long the kernel may cache attributes from `getattr`/`setattr`.
    pub fn attr_ttl(&mut self, ttl: Duration) -> &mut Self {
        self.attr_ttl = ttl;
        self
    }

    /// How long the kernel may cache name lookups. Zero sends every lookup
    /// to the handler.
    pub fn entry_ttl(&mut self, ttl: Duration) -> &mut Self {
        self.entry_ttl = ttl;
        self
    }

    /// The parameters negotiated with the kernel during `FUSE_INIT`.
    pub fn config(&mut self) -> &mut KernelConfig {
        &mut self.config
    }

    pub(crate) fn ttl(&self) -> Ttl {
        Ttl {
            attr: self.attr_ttl,
            entry: self.entry_ttl,
        }
    }
}

/// Cache lifetimes put into attribute and entry replies.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ttl {
    pub(crate) attr: Duration,
    pub(crate) entry: Duration,
}
