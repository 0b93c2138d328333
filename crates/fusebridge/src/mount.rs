//! Mounting through the `fusermount` helper.

use libc::{c_int, c_void};
use std::{
    ffi::OsStr,
    fmt, io,
    mem::{self, MaybeUninit},
    os::{
        fd::{AsRawFd, OwnedFd},
        unix::{net::UnixStream, prelude::*},
    },
    path::{Path, PathBuf},
    process::{Child, Command},
    ptr,
};

const FUSERMOUNT_PROG: &str = "/usr/bin/fusermount";
const FUSE_COMMFD_ENV: &str = "_FUSE_COMMFD";

/// The options passed to `fusermount -o`.
#[derive(Debug, Clone)]
pub struct MountOptions {
    options: Vec<String>,
    auto_unmount: bool,
    fusermount_path: Option<PathBuf>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            options: vec![],
            auto_unmount: true,
            fusermount_path: None,
        }
    }
}

impl MountOptions {
    /// Let `fusermount` unmount the filesystem when the process goes away.
    pub fn auto_unmount(&mut self, enabled: bool) -> &mut Self {
        self.auto_unmount = enabled;
        self
    }

    /// Append mount options, given as a comma-separated list.
    pub fn mount_option(&mut self, option: &str) -> &mut Self {
        for option in option.split(',').map(str::trim) {
            match option {
                "" => (),
                "auto_unmount" => {
                    self.auto_unmount(true);
                }
                option => self.options.push(option.to_owned()),
            }
        }
        self
    }

    /// Use another `fusermount` binary.
    pub fn fusermount_path(&mut self, program: impl AsRef<OsStr>) -> &mut Self {
        self.fusermount_path = Some(PathBuf::from(program.as_ref()));
        self
    }

    fn program(&self) -> &Path {
        self.fusermount_path
            .as_deref()
            .unwrap_or_else(|| Path::new(FUSERMOUNT_PROG))
    }
}

impl fmt::Display for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use std::fmt::Write as _;

        let opts = self
            .options
            .iter()
            .map(String::as_str)
            .chain(self.auto_unmount.then_some("auto_unmount"));

        for (i, opt) in opts.enumerate() {
            if i > 0 {
                f.write_char(',')?;
            }
            f.write_str(opt)?;
        }
        Ok(())
    }
}

/// A live mount. Dropping it unmounts the filesystem.
#[derive(Debug)]
pub(crate) struct Mounted {
    helper: Option<Helper>,
    mountpoint: PathBuf,
    opts: MountOptions,
}

impl Mounted {
    pub(crate) fn unmount(mut self) -> io::Result<()> {
        self.unmount_()
    }

    fn unmount_(&mut self) -> io::Result<()> {
        match self.helper.take() {
            // The helper is still around for auto_unmount and performs
            // umount(2) itself once its socket is closed.
            Some(helper) => helper.wait(),
            None => unmount(&self.mountpoint, &self.opts),
        }
    }
}

impl Drop for Mounted {
    fn drop(&mut self) {
        if let Err(err) = self.unmount_() {
            tracing::warn!(mountpoint = %self.mountpoint.display(), "unmount failed: {}", err);
        }
    }
}

#[derive(Debug)]
struct Helper {
    child: Child,
    socket: UnixStream,
}

impl Helper {
    fn wait(mut self) -> io::Result<()> {
        drop(self.socket);
        let _st = self.child.wait()?;
        Ok(())
    }
}

/// Mount a FUSE filesystem on `mountpoint` and return the device fd.
pub(crate) fn mount(mountpoint: &Path, opts: &MountOptions) -> io::Result<(OwnedFd, Mounted)> {
    let mut fusermount = Command::new(opts.program());

    let encoded = opts.to_string();
    if !encoded.is_empty() {
        fusermount.arg("-o").arg(encoded);
    }

    fusermount.arg("--").arg(mountpoint);

    let (socket, remote) = UnixStream::pair()?;
    let remote = remote.into_raw_fd();

    fusermount.env(FUSE_COMMFD_ENV, remote.to_string());

    unsafe {
        fusermount.pre_exec(move || {
            syscall! { fcntl(remote, libc::F_SETFD, 0) };
            Ok(())
        });
    }

    let child = fusermount.spawn();
    // The child owns its copy of the socket now.
    unsafe { libc::close(remote) };
    let child = child?;

    let fd = receive_fd(&socket)?;

    let helper = Helper { child, socket };
    let helper = if opts.auto_unmount {
        Some(helper)
    } else {
        // Without auto_unmount the helper exits right after handing over
        // the fd, so reap it here.
        helper.wait()?;
        None
    };

    Ok((
        fd,
        Mounted {
            helper,
            mountpoint: mountpoint.to_owned(),
            opts: opts.clone(),
        },
    ))
}

fn receive_fd(reader: &UnixStream) -> io::Result<OwnedFd> {
    let mut buf = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: 1,
    };

    #[repr(C)]
    struct Cmsg {
        header: libc::cmsghdr,
        fd: c_int,
    }
    let mut cmsg = MaybeUninit::<Cmsg>::zeroed();

    let mut msg = libc::msghdr {
        msg_name: ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg.as_mut_ptr() as *mut c_void,
        msg_controllen: mem::size_of_val(&cmsg),
        msg_flags: 0,
    };

    let received = syscall! { recvmsg(reader.as_raw_fd(), &mut msg, 0) };
    if received == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "fusermount exited without sending the device fd",
        ));
    }

    if msg.msg_controllen < mem::size_of_val(&cmsg) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "too short control message length",
        ));
    }
    let cmsg = unsafe { cmsg.assume_init() };

    if cmsg.header.cmsg_type != libc::SCM_RIGHTS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "got control message with unknown type",
        ));
    }

    let fd = cmsg.fd;
    syscall! { fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Lazily detach the filesystem mounted at `mountpoint`.
pub(crate) fn unmount(mountpoint: &Path, opts: &MountOptions) -> io::Result<()> {
    let st = Command::new(opts.program())
        .args(["-u", "-q", "-z", "--"])
        .arg(mountpoint)
        .status()?;
    tracing::debug!(mountpoint = %mountpoint.display(), "fusermount -u exited with {}", st);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_opts_encode() {
        let opts = MountOptions::default();
        assert_eq!(opts.to_string(), "auto_unmount");

        let mut opts = MountOptions::default();
        opts.auto_unmount(false);
        assert_eq!(opts.to_string(), "");

        let mut opts = MountOptions::default();
        opts.auto_unmount(false);
        opts.mount_option("fsname=bridge, ro,,auto_unmount");
        opts.mount_option("default_permissions");
        assert_eq!(
            opts.to_string(),
            "fsname=bridge,ro,default_permissions,auto_unmount"
        );
    }

    #[test]
    fn custom_helper_path() {
        let mut opts = MountOptions::default();
        assert_eq!(opts.program(), Path::new(FUSERMOUNT_PROG));
        opts.fusermount_path("/opt/fuse/bin/fusermount3");
        assert_eq!(opts.program(), Path::new("/opt/fuse/bin/fusermount3"));
    }
}
