//! An in-memory transport replaying canned kernel messages.

use crate::{
    bytes::{to_vec, Bytes},
    conn::Transport,
};
use fusebridge_kernel::{fuse_in_header, fuse_out_header, FUSE_INIT, FUSE_KERNEL_MINOR_VERSION};
use std::{collections::VecDeque, io, mem, sync::Arc, sync::Mutex};
use zerocopy::{FromBytes, IntoBytes};

#[derive(Debug, Clone)]
pub(crate) struct Recorded {
    pub(crate) unique: u64,
    pub(crate) error: i32,
    pub(crate) payload: Vec<u8>,
}

/// Serves queued requests in order, then reports `ENODEV` as an unmounted
/// device does.
#[derive(Debug, Default)]
pub(crate) struct FakeTransport {
    requests: Mutex<VecDeque<Vec<u8>>>,
    replies: Mutex<Vec<Recorded>>,
}

impl FakeTransport {
    pub(crate) fn new(requests: impl IntoIterator<Item = Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(requests.into_iter().collect()),
            replies: Mutex::default(),
        })
    }

    pub(crate) fn replies(&self) -> Vec<Recorded> {
        self.replies.lock().unwrap().clone()
    }

    pub(crate) fn reply_to(&self, unique: u64) -> Option<Recorded> {
        let replies = self.replies.lock().unwrap();
        let mut found = replies.iter().filter(|r| r.unique == unique);
        let reply = found.next().cloned();
        assert!(found.next().is_none(), "request {} was answered twice", unique);
        reply
    }
}

impl Transport for FakeTransport {
    fn read_request(&self, header: &mut fuse_in_header, arg: &mut [u8]) -> io::Result<usize> {
        let msg = self
            .requests
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))?;
        let (head, rest) = msg.split_at(mem::size_of::<fuse_in_header>());
        header.as_mut_bytes().copy_from_slice(head);
        arg[..rest.len()].copy_from_slice(rest);
        Ok(rest.len())
    }

    fn write_reply(&self, header: fuse_out_header, arg: &dyn Bytes) -> io::Result<()> {
        self.replies.lock().unwrap().push(Recorded {
            unique: header.unique,
            error: header.error,
            payload: to_vec(arg),
        });
        Ok(())
    }
}

pub(crate) fn encode_request(opcode: u32, unique: u64, nodeid: u64, arg: &[u8]) -> Vec<u8> {
    let header = fuse_in_header {
        len: (mem::size_of::<fuse_in_header>() + arg.len()) as u32,
        opcode,
        unique,
        nodeid,
        uid: 1000,
        gid: 1000,
        pid: 4242,
        padding: 0,
    };
    let mut msg = header.as_bytes().to_vec();
    msg.extend_from_slice(arg);
    msg
}

pub(crate) fn init_request() -> Vec<u8> {
    let init_in = fusebridge_kernel::fuse_init_in {
        major: 7,
        minor: FUSE_KERNEL_MINOR_VERSION,
        max_readahead: 0x20000,
        flags: 0,
    };
    encode_request(FUSE_INIT, 1, 0, init_in.as_bytes())
}

/// Concatenate an argument struct with trailing NUL-terminated names.
pub(crate) fn with_names(arg: &[u8], names: &[&str]) -> Vec<u8> {
    let mut buf = arg.to_vec();
    for name in names {
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
    }
    buf
}

/// Read a reply payload back as a kernel struct.
pub(crate) fn decode<T: FromBytes>(payload: &[u8]) -> T {
    T::read_from_prefix(payload)
        .map(|(value, _)| value)
        .unwrap_or_else(|_| panic!("reply payload is too short"))
}

/// Split a dirent buffer into `(ino, off, name)` triples.
pub(crate) fn parse_dirents(mut buf: &[u8]) -> Vec<(u64, u64, String)> {
    let mut entries = vec![];
    while !buf.is_empty() {
        let dirent: fusebridge_kernel::fuse_dirent = decode(buf);
        let start = mem::size_of::<fusebridge_kernel::fuse_dirent>();
        let name = &buf[start..start + dirent.namelen as usize];
        entries.push((
            dirent.ino,
            dirent.off,
            String::from_utf8_lossy(name).into_owned(),
        ));
        let entsize = (start + dirent.namelen as usize + 7) & !7;
        buf = &buf[entsize..];
    }
    entries
}
