//! Establish a FUSE session.

use crate::{
    bytes::{Bytes, POD},
    conn::Transport,
    decoder::{DecodeError, Decoder},
    op::Operation,
};
use bitflags::bitflags;
use fusebridge_kernel::*;
use std::{cmp, fmt, io, mem, sync::Arc};

// The minimum supported ABI minor version.
const MINIMUM_SUPPORTED_MINOR_VERSION: u32 = 23;

const DEFAULT_MAX_WRITE: u32 = 16 * 1024 * 1024;

// copied from fuse_i.h
const MAX_MAX_PAGES: usize = 256;
const BUFFER_HEADER_SIZE: usize = 0x1000;

// The kernel keeps re-sending INIT until it gets an acceptable answer.
const INIT_ATTEMPTS: usize = 10;

#[inline]
fn pagesize() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

bitflags! {
    /// Capability flags to control the behavior of the kernel driver.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct CapabilityFlags: u32 {
        /// The filesystem supports asynchronous read requests.
        ///
        /// Enabled by default.
        const ASYNC_READ = FUSE_ASYNC_READ;

        /// The filesystem supports the `O_TRUNC` open flag.
        ///
        /// Enabled by default.
        const ATOMIC_O_TRUNC = FUSE_ATOMIC_O_TRUNC;

        /// The kernel check the validity of attributes on every read.
        ///
        /// Enabled by default.
        const AUTO_INVAL_DATA = FUSE_AUTO_INVAL_DATA;

        /// The filesystem supports asynchronous direct I/O submission.
        ///
        /// Enabled by default.
        const ASYNC_DIO = FUSE_ASYNC_DIO;

        /// The kernel supports parallel directory operations.
        ///
        /// Enabled by default.
        const PARALLEL_DIROPS = FUSE_PARALLEL_DIROPS;

        /// The filesystem is responsible for unsetting setuid and setgid bits
        /// when a file is written, truncated, or its owner is changed.
        const HANDLE_KILLPRIV = FUSE_HANDLE_KILLPRIV;

        /// The filesystem supports lookups of `"."` and `".."`.
        const EXPORT_SUPPORT = FUSE_EXPORT_SUPPORT;

        /// The kernel should not apply the umask to the file mode on create
        /// operations.
        const DONT_MASK = FUSE_DONT_MASK;

        /// The writeback caching should be enabled.
        const WRITEBACK_CACHE = FUSE_WRITEBACK_CACHE;

        /// The filesystem supports POSIX access control lists.
        const POSIX_ACL = FUSE_POSIX_ACL;

        /// The kernel may cache the targets of symbolic links.
        const CACHE_SYMLINKS = FUSE_CACHE_SYMLINKS;
    }
}

impl Default for CapabilityFlags {
    fn default() -> Self {
        Self::ASYNC_READ
            | Self::PARALLEL_DIROPS
            | Self::AUTO_INVAL_DATA
            | Self::ASYNC_DIO
            | Self::ATOMIC_O_TRUNC
    }
}

/// The parameters sent to the kernel in the reply to `FUSE_INIT`.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    max_readahead: u32,
    flags: CapabilityFlags,
    max_background: u16,
    congestion_threshold: u16,
    max_write: u32,
    time_gran: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_readahead: u32::MAX,
            flags: CapabilityFlags::default(),
            max_background: 0,
            congestion_threshold: 0,
            max_write: DEFAULT_MAX_WRITE,
            time_gran: 1,
        }
    }
}

impl KernelConfig {
    /// Return a reference to the capability flags.
    pub fn flags(&mut self) -> &mut CapabilityFlags {
        &mut self.flags
    }

    /// Set the maximum readahead.
    pub fn max_readahead(&mut self, value: u32) -> &mut Self {
        self.max_readahead = value;
        self
    }

    /// Set the maximum size of the write buffer.
    pub fn max_write(&mut self, value: u32) -> &mut Self {
        self.max_write = value;
        self
    }

    /// Set the maximum number of pending *background* requests.
    pub fn max_background(&mut self, max_background: u16) -> &mut Self {
        self.max_background = max_background;
        self
    }

    /// Set the threshold number of pending background requests
    /// that the kernel marks the filesystem as *congested*.
    ///
    /// Zero derives the value from `max_background`. Values above
    /// `max_background` are clamped to it.
    pub fn congestion_threshold(&mut self, threshold: u16) -> &mut Self {
        let threshold = match threshold {
            0 => self.max_background / 4 * 3,
            n => cmp::min(n, self.max_background),
        };
        tracing::debug!(congestion_threshold = threshold);
        self.congestion_threshold = threshold;
        self
    }

    /// Set the timestamp resolution supported by the filesystem.
    ///
    /// The setting value has the nanosecond unit and should be a power of 10.
    ///
    /// The default value is 1.
    pub fn time_gran(&mut self, time_gran: u32) -> &mut Self {
        self.time_gran = time_gran;
        self
    }
}

/// An initialized session on top of a transport.
pub(crate) struct Session {
    conn: Arc<dyn Transport>,
    init_out: fuse_init_out,
    bufsize: usize,
    debug: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("proto_minor", &self.init_out.minor)
            .field("flags", &CapabilityFlags::from_bits_truncate(self.init_out.flags))
            .field("max_write", &self.init_out.max_write)
            .field("bufsize", &self.bufsize)
            .finish()
    }
}

impl Session {
    /// Perform the `FUSE_INIT` handshake.
    pub(crate) fn init(
        conn: Arc<dyn Transport>,
        config: &KernelConfig,
        debug: bool,
    ) -> io::Result<Self> {
        let init_out = init_session(&*conn, config, debug)?;
        let bufsize = BUFFER_HEADER_SIZE + init_out.max_write as usize;
        Ok(Self {
            conn,
            init_out,
            bufsize,
            debug,
        })
    }

    #[cfg(test)]
    pub(crate) fn proto_minor(&self) -> u32 {
        self.init_out.minor
    }

    /// Receive the next request.
    ///
    /// `None` means that the filesystem has been unmounted.
    pub(crate) fn next_request(&self) -> io::Result<Option<Request>> {
        let mut header = fuse_in_header::default();
        let mut arg = vec![0u8; self.bufsize - mem::size_of::<fuse_in_header>()];

        loop {
            match self.conn.read_request(&mut header, &mut arg[..]) {
                Ok(len) => {
                    arg.truncate(len);
                    break;
                }
                Err(err) => match err.raw_os_error() {
                    Some(libc::ENODEV) => {
                        tracing::debug!("ENODEV");
                        return Ok(None);
                    }
                    Some(libc::ENOENT) => {
                        tracing::debug!("ENOENT");
                        continue;
                    }
                    _ => return Err(err),
                },
            }
        }

        if self.debug {
            tracing::info!(
                target: "fusebridge::wire",
                unique = header.unique,
                opcode = header.opcode,
                nodeid = header.nodeid,
                len = header.len,
                "request",
            );
        }

        Ok(Some(Request { header, arg }))
    }

    /// Create the handle answering the request `unique`.
    pub(crate) fn replier(&self, unique: u64) -> Replier {
        Replier {
            conn: Arc::clone(&self.conn),
            unique,
            debug: self.debug,
        }
    }
}

/// A request read from the kernel.
pub(crate) struct Request {
    header: fuse_in_header,
    arg: Vec<u8>,
}

impl Request {
    pub(crate) fn header(&self) -> &fuse_in_header {
        &self.header
    }

    pub(crate) fn operation(&self) -> Result<Operation<'_>, DecodeError> {
        Operation::decode(&self.header, &self.arg[..])
    }
}

/// The single-use right to answer one request.
pub struct Replier {
    conn: Arc<dyn Transport>,
    unique: u64,
    debug: bool,
}

impl fmt::Debug for Replier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replier")
            .field("unique", &self.unique)
            .finish()
    }
}

impl Replier {
    /// Reply with a payload.
    pub(crate) fn reply(self, arg: &dyn Bytes) {
        send_reply(&*self.conn, self.unique, 0, arg, self.debug);
    }

    /// Reply with an error code, or with an empty success when `code` is zero.
    pub(crate) fn error(self, code: i32) {
        send_reply(&*self.conn, self.unique, code, &(), self.debug);
    }
}

fn send_reply(conn: &dyn Transport, unique: u64, code: i32, arg: &dyn Bytes, debug: bool) {
    let header = fuse_out_header {
        len: 0,
        error: -code,
        unique,
    };
    if debug {
        tracing::info!(
            target: "fusebridge::wire",
            unique,
            error = -code,
            len = mem::size_of::<fuse_out_header>() + arg.size(),
            "reply",
        );
    }
    if let Err(err) = conn.write_reply(header, arg) {
        match err.raw_os_error() {
            // The request was interrupted and has already gone away.
            Some(libc::ENOENT) => tracing::debug!(unique, "reply to an interrupted request"),
            _ => tracing::warn!(unique, "failed to send a reply: {}", err),
        }
    }
}

fn init_session(
    conn: &dyn Transport,
    config: &KernelConfig,
    debug: bool,
) -> io::Result<fuse_init_out> {
    let mut header = fuse_in_header::default();
    let mut arg = vec![0u8; pagesize() * MAX_MAX_PAGES];

    for _ in 0..INIT_ATTEMPTS {
        let len = conn.read_request(&mut header, &mut arg[..])?;
        let mut decoder = Decoder::new(&arg[..len]);

        match fuse_opcode::try_from(header.opcode) {
            Ok(fuse_opcode::FUSE_INIT) => {
                let init_in = decoder.fetch::<fuse_init_in>().map_err(|err| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("failed to decode fuse_init_in: {}", err),
                    )
                })?;

                let capable = CapabilityFlags::from_bits_truncate(init_in.flags);
                tracing::debug!("INIT request:");
                tracing::debug!("  proto = {}.{}:", init_in.major, init_in.minor);
                tracing::debug!("  flags = 0x{:08x} ({:?})", init_in.flags, capable);
                tracing::debug!("  max_readahead = 0x{:08X}", init_in.max_readahead);
                tracing::debug!("  max_pages = {}", init_in.flags & FUSE_MAX_PAGES != 0);

                let mut init_out = fuse_init_out {
                    major: FUSE_KERNEL_VERSION,
                    minor: FUSE_KERNEL_MINOR_VERSION,
                    ..Default::default()
                };

                if init_in.major > 7 {
                    tracing::debug!("wait for a second INIT request with an older version.");
                    send_reply(conn, header.unique, 0, &POD(init_out), debug);
                    continue;
                }

                if init_in.major < 7 || init_in.minor < MINIMUM_SUPPORTED_MINOR_VERSION {
                    tracing::warn!(
                        "only ABI 7.{} or later is supported. {}.{} is rejected",
                        MINIMUM_SUPPORTED_MINOR_VERSION,
                        init_in.major,
                        init_in.minor
                    );
                    send_reply(conn, header.unique, libc::EPROTO, &(), debug);
                    continue;
                }

                init_out.minor = cmp::min(init_out.minor, init_in.minor);

                init_out.flags = (config.flags & capable).bits();
                init_out.flags |= FUSE_BIG_WRITES; // superseded by `max_write`.

                init_out.max_readahead = cmp::min(config.max_readahead, init_in.max_readahead);
                init_out.max_write = config.max_write;
                init_out.max_background = config.max_background;
                init_out.congestion_threshold = config.congestion_threshold;
                init_out.time_gran = config.time_gran;

                if init_in.flags & FUSE_MAX_PAGES != 0 {
                    init_out.flags |= FUSE_MAX_PAGES;
                    init_out.max_pages = cmp::min(
                        (init_out.max_write - 1) / (pagesize() as u32) + 1,
                        u32::from(u16::MAX),
                    ) as u16;
                }

                tracing::debug!("Reply to INIT:");
                tracing::debug!("  proto = {}.{}:", init_out.major, init_out.minor);
                tracing::debug!(
                    "  flags = 0x{:08x} ({:?})",
                    init_out.flags,
                    CapabilityFlags::from_bits_truncate(init_out.flags)
                );
                tracing::debug!("  max_readahead = 0x{:08X}", init_out.max_readahead);
                tracing::debug!("  max_write = 0x{:08X}", init_out.max_write);
                tracing::debug!("  max_background = 0x{:04X}", init_out.max_background);
                tracing::debug!(
                    "  congestion_threshold = 0x{:04X}",
                    init_out.congestion_threshold
                );
                tracing::debug!("  time_gran = {}", init_out.time_gran);
                send_reply(conn, header.unique, 0, &POD(init_out), debug);

                return Ok(init_out);
            }

            _ => {
                tracing::warn!(
                    "ignoring an operation before init (opcode={:?})",
                    header.opcode
                );
                send_reply(conn, header.unique, libc::EIO, &(), debug);
                continue;
            }
        }
    }

    Err(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        "session initialization is aborted",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{encode_request, FakeTransport};
    use zerocopy::IntoBytes;

    fn init_in(major: u32, minor: u32) -> fuse_init_in {
        fuse_init_in {
            major,
            minor,
            max_readahead: 40,
            flags: CapabilityFlags::all().bits()
                | FUSE_MAX_PAGES
                | FUSE_NO_OPEN_SUPPORT
                | FUSE_NO_OPENDIR_SUPPORT,
        }
    }

    #[test]
    fn init_default() {
        let conn = FakeTransport::new([encode_request(
            FUSE_INIT,
            2,
            0,
            init_in(7, 23).as_bytes(),
        )]);

        let session = Session::init(conn.clone(), &KernelConfig::default(), false) //
            .expect("initialization failed");
        assert_eq!(session.proto_minor(), 23);
        assert_eq!(session.bufsize, BUFFER_HEADER_SIZE + DEFAULT_MAX_WRITE as usize);

        let expected_max_pages = (DEFAULT_MAX_WRITE / (pagesize() as u32)) as u16;
        let init_out = fuse_init_out {
            major: 7,
            minor: 23,
            max_readahead: 40,
            flags: CapabilityFlags::default().bits() | FUSE_MAX_PAGES | FUSE_BIG_WRITES,
            max_background: 0,
            congestion_threshold: 0,
            max_write: DEFAULT_MAX_WRITE,
            time_gran: 1,
            max_pages: expected_max_pages,
            map_alignment: 0,
            unused: [0; 8],
        };

        let replies = conn.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].unique, 2);
        assert_eq!(replies[0].error, 0);
        assert_eq!(replies[0].payload, init_out.as_bytes());
    }

    #[test]
    fn init_negotiates_down_and_rejects_old_kernels() {
        let conn = FakeTransport::new([
            encode_request(FUSE_GETATTR, 1, 1, &[0; 16]),
            encode_request(FUSE_INIT, 2, 0, init_in(8, 0).as_bytes()),
            encode_request(FUSE_INIT, 3, 0, init_in(7, 19).as_bytes()),
            encode_request(FUSE_INIT, 4, 0, init_in(7, 40).as_bytes()),
        ]);

        let session = Session::init(conn.clone(), &KernelConfig::default(), false).unwrap();
        assert_eq!(session.proto_minor(), FUSE_KERNEL_MINOR_VERSION);

        let errors: Vec<_> = conn.replies().iter().map(|r| (r.unique, r.error)).collect();
        assert_eq!(
            errors,
            [(1, -libc::EIO), (2, 0), (3, -libc::EPROTO), (4, 0)]
        );
    }

    #[test]
    fn next_request_ends_on_enodev() {
        let conn = FakeTransport::new([
            encode_request(FUSE_INIT, 1, 0, init_in(7, 31).as_bytes()),
            encode_request(FUSE_STATFS, 2, 1, &[]),
        ]);
        let session = Session::init(conn.clone(), &KernelConfig::default(), true).unwrap();

        let req = session.next_request().unwrap().expect("a request");
        assert_eq!(req.header().unique, 2);
        assert!(matches!(req.operation(), Ok(Operation::Statfs)));
        session.replier(req.header().unique).error(libc::ENOSYS);

        assert!(session.next_request().unwrap().is_none());
        let last = conn.replies().pop().unwrap();
        assert_eq!((last.unique, last.error), (2, -libc::ENOSYS));
        assert!(last.payload.is_empty());
    }

    #[test]
    fn congestion_threshold_is_clamped() {
        let mut config = KernelConfig::default();
        config.max_background(16).congestion_threshold(0);
        assert_eq!(config.congestion_threshold, 12);
        config.congestion_threshold(100);
        assert_eq!(config.congestion_threshold, 16);
    }
}
