//! Decoding of kernel requests.

use crate::decoder::{DecodeError, Decoder};
use fusebridge_kernel::{self as kernel, fuse_opcode};
use std::ffi::OsStr;

/// A kernel request decoded from its header and argument bytes.
///
/// Fixed-size arguments are copied out of the request buffer, names and
/// payloads borrow from it.
#[derive(Debug)]
pub(crate) enum Operation<'a> {
    Init {
        arg: kernel::fuse_init_in,
    },
    Destroy,
    Forget {
        arg: kernel::fuse_forget_in,
    },
    BatchForget {
        forgets: Vec<kernel::fuse_forget_one>,
    },
    Interrupt {
        arg: kernel::fuse_interrupt_in,
    },
    Lookup {
        name: &'a OsStr,
    },
    Getattr {
        arg: kernel::fuse_getattr_in,
    },
    Setattr {
        arg: kernel::fuse_setattr_in,
    },
    Readlink,
    Symlink {
        name: &'a OsStr,
        link: &'a OsStr,
    },
    Mknod {
        arg: kernel::fuse_mknod_in,
        name: &'a OsStr,
    },
    Mkdir {
        arg: kernel::fuse_mkdir_in,
        name: &'a OsStr,
    },
    Unlink {
        name: &'a OsStr,
    },
    Rmdir {
        name: &'a OsStr,
    },
    Rename {
        arg: kernel::fuse_rename_in,
        name: &'a OsStr,
        newname: &'a OsStr,
    },
    Link {
        arg: kernel::fuse_link_in,
        newname: &'a OsStr,
    },
    Open {
        arg: kernel::fuse_open_in,
    },
    Read {
        arg: kernel::fuse_read_in,
    },
    Write {
        arg: kernel::fuse_write_in,
        data: &'a [u8],
    },
    Release {
        arg: kernel::fuse_release_in,
    },
    Statfs,
    Fsync {
        arg: kernel::fuse_fsync_in,
    },
    Setxattr {
        arg: kernel::fuse_setxattr_in,
        name: &'a OsStr,
        value: &'a [u8],
    },
    Getxattr {
        arg: kernel::fuse_getxattr_in,
        name: &'a OsStr,
    },
    Listxattr {
        arg: kernel::fuse_getxattr_in,
    },
    Removexattr {
        name: &'a OsStr,
    },
    Flush {
        arg: kernel::fuse_flush_in,
    },
    Opendir {
        arg: kernel::fuse_open_in,
    },
    Readdir {
        arg: kernel::fuse_read_in,
    },
    Releasedir {
        arg: kernel::fuse_release_in,
    },
    Fsyncdir {
        arg: kernel::fuse_fsync_in,
    },
    Access {
        arg: kernel::fuse_access_in,
    },
    Create {
        arg: kernel::fuse_create_in,
        name: &'a OsStr,
    },

    /// An opcode outside of the supported vocabulary.
    Unknown,
}

impl<'a> Operation<'a> {
    pub(crate) fn decode(
        header: &kernel::fuse_in_header,
        arg: &'a [u8],
    ) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(arg);
        let decoder = &mut decoder;

        let Ok(opcode) = fuse_opcode::try_from(header.opcode) else {
            return Ok(Self::Unknown);
        };

        match opcode {
            fuse_opcode::FUSE_INIT => Ok(Self::Init {
                arg: decoder.fetch()?,
            }),
            fuse_opcode::FUSE_DESTROY => Ok(Self::Destroy),
            fuse_opcode::FUSE_FORGET => Ok(Self::Forget {
                arg: decoder.fetch()?,
            }),
            fuse_opcode::FUSE_BATCH_FORGET => {
                let arg: kernel::fuse_batch_forget_in = decoder.fetch()?;
                let forgets = (0..arg.count)
                    .map(|_| decoder.fetch::<kernel::fuse_forget_one>())
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::BatchForget { forgets })
            }
            fuse_opcode::FUSE_INTERRUPT => Ok(Self::Interrupt {
                arg: decoder.fetch()?,
            }),

            fuse_opcode::FUSE_LOOKUP => Ok(Self::Lookup {
                name: decoder.fetch_str()?,
            }),
            fuse_opcode::FUSE_GETATTR => Ok(Self::Getattr {
                arg: decoder.fetch()?,
            }),
            fuse_opcode::FUSE_SETATTR => Ok(Self::Setattr {
                arg: decoder.fetch()?,
            }),
            fuse_opcode::FUSE_READLINK => Ok(Self::Readlink),
            fuse_opcode::FUSE_SYMLINK => {
                let name = decoder.fetch_str()?;
                let link = decoder.fetch_str()?;
                Ok(Self::Symlink { name, link })
            }
            fuse_opcode::FUSE_MKNOD => {
                let arg = decoder.fetch()?;
                let name = decoder.fetch_str()?;
                Ok(Self::Mknod { arg, name })
            }
            fuse_opcode::FUSE_MKDIR => {
                let arg = decoder.fetch()?;
                let name = decoder.fetch_str()?;
                Ok(Self::Mkdir { arg, name })
            }
            fuse_opcode::FUSE_UNLINK => Ok(Self::Unlink {
                name: decoder.fetch_str()?,
            }),
            fuse_opcode::FUSE_RMDIR => Ok(Self::Rmdir {
                name: decoder.fetch_str()?,
            }),
            fuse_opcode::FUSE_RENAME => {
                let arg = decoder.fetch()?;
                let name = decoder.fetch_str()?;
                let newname = decoder.fetch_str()?;
                Ok(Self::Rename { arg, name, newname })
            }
            fuse_opcode::FUSE_LINK => {
                let arg = decoder.fetch()?;
                let newname = decoder.fetch_str()?;
                Ok(Self::Link { arg, newname })
            }
            fuse_opcode::FUSE_OPEN => Ok(Self::Open {
                arg: decoder.fetch()?,
            }),
            fuse_opcode::FUSE_READ => Ok(Self::Read {
                arg: decoder.fetch()?,
            }),
            fuse_opcode::FUSE_WRITE => {
                let arg: kernel::fuse_write_in = decoder.fetch()?;
                let data = decoder.fetch_bytes(arg.size as usize)?;
                Ok(Self::Write { arg, data })
            }
            fuse_opcode::FUSE_RELEASE => Ok(Self::Release {
                arg: decoder.fetch()?,
            }),
            fuse_opcode::FUSE_STATFS => Ok(Self::Statfs),
            fuse_opcode::FUSE_FSYNC => Ok(Self::Fsync {
                arg: decoder.fetch()?,
            }),
            fuse_opcode::FUSE_SETXATTR => {
                let arg: kernel::fuse_setxattr_in = decoder.fetch()?;
                let name = decoder.fetch_str()?;
                let value = decoder.fetch_bytes(arg.size as usize)?;
                Ok(Self::Setxattr { arg, name, value })
            }
            fuse_opcode::FUSE_GETXATTR => {
                let arg = decoder.fetch()?;
                let name = decoder.fetch_str()?;
                Ok(Self::Getxattr { arg, name })
            }
            fuse_opcode::FUSE_LISTXATTR => Ok(Self::Listxattr {
                arg: decoder.fetch()?,
            }),
            fuse_opcode::FUSE_REMOVEXATTR => Ok(Self::Removexattr {
                name: decoder.fetch_str()?,
            }),
            fuse_opcode::FUSE_FLUSH => Ok(Self::Flush {
                arg: decoder.fetch()?,
            }),
            fuse_opcode::FUSE_OPENDIR => Ok(Self::Opendir {
                arg: decoder.fetch()?,
            }),
            fuse_opcode::FUSE_READDIR => Ok(Self::Readdir {
                arg: decoder.fetch()?,
            }),
            fuse_opcode::FUSE_RELEASEDIR => Ok(Self::Releasedir {
                arg: decoder.fetch()?,
            }),
            fuse_opcode::FUSE_FSYNCDIR => Ok(Self::Fsyncdir {
                arg: decoder.fetch()?,
            }),
            fuse_opcode::FUSE_ACCESS => Ok(Self::Access {
                arg: decoder.fetch()?,
            }),
            fuse_opcode::FUSE_CREATE => {
                let arg = decoder.fetch()?;
                let name = decoder.fetch_str()?;
                Ok(Self::Create { arg, name })
            }

            _ => Ok(Self::Unknown),
        }
    }
}
