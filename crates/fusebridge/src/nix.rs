//! Thin wrappers around the few syscalls the transport needs.

use libc::{c_int, iovec};
use std::{
    cmp, io,
    os::fd::{AsRawFd, BorrowedFd},
};

macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* ) ) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg),*) };
        if res == -1 {
            return Err(std::io::Error::last_os_error());
        }
        res
    }};
}

fn iov_count(len: usize) -> c_int {
    cmp::min(len, c_int::MAX as usize) as c_int
}

pub(crate) fn readv(fd: BorrowedFd<'_>, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
    let len = syscall! {
        readv(
            fd.as_raw_fd(), //
            bufs.as_mut_ptr() as *mut iovec,
            iov_count(bufs.len()),
        )
    };
    Ok(len as usize)
}

pub(crate) fn writev(fd: BorrowedFd<'_>, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
    let res = syscall! {
        writev(
            fd.as_raw_fd(), //
            bufs.as_ptr() as *const iovec,
            iov_count(bufs.len()),
        )
    };
    Ok(res as usize)
}
