#![deny(clippy::unimplemented, clippy::todo)]

// A read-only filesystem with a single file, served by path handlers.

use fusebridge::{path, Options, Stat};

use anyhow::{ensure, Context as _, Result};
use std::{path::Path, path::PathBuf, rc::Rc};
use tokio::task::LocalSet;
use tracing_subscriber::EnvFilter;

const HELLO_PATH: &str = "/hello.txt";
const HELLO_CONTENT: &[u8] = b"Hello, world!\n";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = pico_args::Arguments::from_env();
    let debug = args.contains(["-d", "--debug"]);
    let mount_opts: Option<String> = args.opt_value_from_str("-o")?;
    let mountpoint: PathBuf = args.opt_free_from_str()?.context("missing mountpoint")?;
    ensure!(mountpoint.is_dir(), "mountpoint must be a directory");

    let mut options = Options::default();
    options.debug(debug).mount_option("fsname=hello,ro");
    if let Some(opts) = &mount_opts {
        options.mount_option(opts);
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    LocalSet::new().block_on(&rt, async move {
        let mount = path::start(&mountpoint, handlers(), &options)?;
        tracing::info!("mounted at {}", mount.mountpoint().display());
        mount.closed().await?;
        Ok(())
    })
}

struct Hello {
    uid: u32,
    gid: u32,
}

impl Hello {
    fn stat(&self, path: &Path) -> Option<Stat> {
        let (mode, nlink, size) = if path == Path::new("/") {
            (libc::S_IFDIR | 0o555, 2, 0)
        } else if path == Path::new(HELLO_PATH) {
            (libc::S_IFREG | 0o444, 1, HELLO_CONTENT.len() as u64)
        } else {
            return None;
        };
        Some(Stat {
            mode: Some(mode),
            nlink: Some(nlink),
            size: Some(size),
            uid: Some(self.uid),
            gid: Some(self.gid),
            ..Stat::default()
        })
    }
}

fn handlers() -> path::Handlers {
    let fs = Rc::new(Hello {
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
    });

    let mut handlers = path::Handlers::default();
    handlers
        .init(|done| {
            tracing::info!("hello is ready");
            done.complete(0);
        })
        .getattr({
            let fs = fs.clone();
            move |path, done| match fs.stat(path) {
                Some(stat) => done.complete(0, stat),
                None => done.complete(-libc::ENOENT, Stat::default()),
            }
        })
        .readdir(|path, done| {
            if path == Path::new("/") {
                done.complete(0, [".", "..", &HELLO_PATH[1..]]);
            } else {
                done.complete(-libc::ENOTDIR, Vec::<&str>::new());
            }
        })
        .open(|path, flags, done| {
            if path != Path::new(HELLO_PATH) {
                done.complete(-libc::ENOENT, 0);
            } else if flags as i32 & libc::O_ACCMODE != libc::O_RDONLY {
                done.complete(-libc::EACCES, 0);
            } else {
                done.complete(0, 0);
            }
        })
        .read(|path, offset, len, buf, _fh, done| {
            if path != Path::new(HELLO_PATH) {
                return done.complete(-libc::ENOENT);
            }
            let offset = offset as usize;
            let data = HELLO_CONTENT.get(offset..).unwrap_or_default();
            let n = buf.fill(&data[..data.len().min(len)]);
            done.complete(n as i32);
        })
        .release(|_, _, done| done.complete(0))
        .destroy(|done| {
            tracing::info!("hello is unmounted");
            done.complete(0);
        });
    handlers
}
