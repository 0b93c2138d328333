use crate::bytes::{Bytes, FillBytes, POD};
use fusebridge_kernel::{fuse_in_header, fuse_out_header};
use std::{
    io::{self, IoSlice},
    mem::{self, MaybeUninit},
    os::unix::prelude::*,
};
use zerocopy::IntoBytes;

/// The channel between the kernel driver and the session.
///
/// Requests are read on the worker thread, while low-level replies are
/// written from the event loop thread, so both directions go through `&self`.
pub trait Transport: Send + Sync {
    /// Read an incoming request from the kernel to the specified buffer.
    ///
    /// The returned value is the number of received bytes excluding the header part.
    fn read_request(&self, header: &mut fuse_in_header, arg: &mut [u8]) -> io::Result<usize>;

    /// Send a reply message to the kernel.
    ///
    /// `header.len` is filled in by the implementation.
    fn write_reply(&self, header: fuse_out_header, arg: &dyn Bytes) -> io::Result<()>;
}

/// A connection with the FUSE kernel driver.
#[derive(Debug)]
pub struct Connection {
    fd: OwnedFd,
}

impl From<OwnedFd> for Connection {
    fn from(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl Connection {
    fn write_bytes(&self, bytes: &dyn Bytes) -> io::Result<()> {
        let size = bytes.size();
        let count = bytes.count();

        let written;

        macro_rules! small_write {
            ($n:expr) => {{
                let mut vec: [MaybeUninit<IoSlice<'_>>; $n] = [MaybeUninit::uninit(); $n];
                let mut fill = FillWriteBytes {
                    vec: &mut vec[..],
                    offset: 0,
                };
                bytes.fill_bytes(&mut fill);
                debug_assert_eq!(fill.offset, $n);
                let vec = unsafe { slice_assume_init_ref(&vec[..]) };

                written = crate::nix::writev(self.fd.as_fd(), vec)?;
            }};
        }

        match count {
            0 => return Ok(()),

            // Stay on the stack for the usual header + one or two chunks.
            1 => small_write!(1),
            2 => small_write!(2),
            3 => small_write!(3),
            4 => small_write!(4),

            count => {
                let mut vec: Vec<IoSlice<'_>> = Vec::with_capacity(count);
                bytes.fill_bytes(&mut FillIoVec { vec: &mut vec });
                written = crate::nix::writev(self.fd.as_fd(), &vec[..])?;
            }
        }

        if written < size {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "written data is too short",
            ));
        }

        Ok(())
    }
}

impl Transport for Connection {
    fn read_request(&self, header: &mut fuse_in_header, arg: &mut [u8]) -> io::Result<usize> {
        let len = crate::nix::readv(
            self.fd.as_fd(),
            &mut [
                io::IoSliceMut::new(header.as_mut_bytes()),
                io::IoSliceMut::new(arg),
            ],
        )?;

        if len < mem::size_of::<fuse_in_header>() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "dequeued request message is too short",
            ));
        }

        Ok(len - mem::size_of::<fuse_in_header>())
    }

    fn write_reply(&self, mut header: fuse_out_header, arg: &dyn Bytes) -> io::Result<()> {
        header.len = (mem::size_of::<fuse_out_header>() + arg.size())
            .try_into()
            .map_err(|_e| io::Error::from_raw_os_error(libc::EINVAL))?;
        self.write_bytes(&(POD(header), arg))
    }
}

struct FillWriteBytes<'a, 'vec> {
    vec: &'vec mut [MaybeUninit<IoSlice<'a>>],
    offset: usize,
}

impl<'a> FillBytes<'a> for FillWriteBytes<'a, '_> {
    fn put(&mut self, chunk: &'a [u8]) {
        self.vec[self.offset] = MaybeUninit::new(IoSlice::new(chunk));
        self.offset += 1;
    }
}

struct FillIoVec<'a, 'vec> {
    vec: &'vec mut Vec<IoSlice<'a>>,
}

impl<'a> FillBytes<'a> for FillIoVec<'a, '_> {
    fn put(&mut self, chunk: &'a [u8]) {
        self.vec.push(IoSlice::new(chunk));
    }
}

// FIXME: replace with MaybeUninit::slice_assume_init_ref once it is stable.
#[inline(always)]
unsafe fn slice_assume_init_ref<T>(slice: &[MaybeUninit<T>]) -> &[T] {
    &*(slice as *const [MaybeUninit<T>] as *const [T])
}
