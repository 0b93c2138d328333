#![deny(clippy::unimplemented, clippy::todo)]

// Mirrors a host directory through path handlers. Every handler returns
// right away and completes from a task on the event loop, with the blocking
// calls moved to tokio's blocking pool.

use fusebridge::{
    path::{self, StatusCompletion},
    Options, Stat, StatFs,
};

use anyhow::{ensure, Context as _, Result};
use slab::Slab;
use std::{
    cell::RefCell,
    ffi::{CString, OsStr},
    fs::{File, FileTimes, OpenOptions},
    future::Future,
    io,
    os::unix::prelude::*,
    path::{Path, PathBuf},
    rc::Rc,
    sync::Arc,
};
use tokio::task::{self, LocalSet};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = pico_args::Arguments::from_env();
    let debug = args.contains(["-d", "--debug"]);
    let mount_opts: Option<String> = args.opt_value_from_str("-o")?;
    let source: PathBuf = match args.opt_value_from_str(["-s", "--source"])? {
        Some(source) => source,
        None => std::env::current_dir()?,
    };
    ensure!(source.is_dir(), "the source path must be a directory");

    let mountpoint: PathBuf = args.opt_free_from_str()?.context("missing mountpoint")?;
    ensure!(mountpoint.is_dir(), "the mountpoint must be a directory");

    let mut options = Options::default();
    options.debug(debug).mount_option("fsname=path-through");
    if let Some(opts) = &mount_opts {
        options.mount_option(opts);
    }

    let fs = Rc::new(PathThrough {
        source: source.canonicalize()?,
        files: RefCell::default(),
    });

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    LocalSet::new().block_on(&rt, async move {
        let mount = path::start(&mountpoint, fs.handlers(), &options)?;
        mount.closed().await?;
        Ok(())
    })
}

struct PathThrough {
    source: PathBuf,
    files: RefCell<Slab<Arc<File>>>,
}

fn errno(err: &io::Error) -> i32 {
    -err.raw_os_error().unwrap_or(libc::EIO)
}

fn nix_to_io_error(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

fn bad_handle() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .unwrap_or_else(|err| Err(io::Error::new(io::ErrorKind::Other, err)))
}

/// Complete `done` with the outcome of `fut` once it resolves.
fn spawn_status<F>(done: StatusCompletion, fut: F)
where
    F: Future<Output = io::Result<()>> + 'static,
{
    task::spawn_local(async move {
        done.complete(match fut.await {
            Ok(()) => 0,
            Err(err) => errno(&err),
        })
    });
}

fn open_options(flags: u32) -> OpenOptions {
    let flags = flags as i32;
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => {
            options.write(true);
        }
        libc::O_RDWR => {
            options.read(true).write(true);
        }
        _ => {
            options.read(true);
        }
    }
    options.custom_flags(flags & !(libc::O_NOFOLLOW | libc::O_CREAT | libc::O_EXCL));
    options
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

impl PathThrough {
    fn real(&self, path: &Path) -> PathBuf {
        self.source.join(path.strip_prefix("/").unwrap_or(path))
    }

    fn file(&self, fh: u64) -> io::Result<Arc<File>> {
        self.files
            .borrow()
            .get(fh as usize)
            .cloned()
            .ok_or_else(bad_handle)
    }

    fn insert_file(&self, file: File) -> u64 {
        self.files.borrow_mut().insert(Arc::new(file)) as u64
    }

    fn handlers(self: &Rc<Self>) -> path::Handlers {
        let mut handlers = path::Handlers::default();

        handlers.getattr({
            let fs = self.clone();
            move |path, done| {
                let real = fs.real(path);
                task::spawn_local(async move {
                    match tokio::fs::symlink_metadata(real).await {
                        Ok(metadata) => done.complete(0, Stat::from_metadata(&metadata)),
                        Err(err) => done.complete(errno(&err), Stat::default()),
                    }
                });
            }
        });

        handlers.readdir({
            let fs = self.clone();
            move |path, done| {
                let real = fs.real(path);
                task::spawn_local(async move {
                    let list = async {
                        let mut names = vec![".".into(), "..".into()];
                        let mut entries = tokio::fs::read_dir(real).await?;
                        while let Some(entry) = entries.next_entry().await? {
                            names.push(entry.file_name());
                        }
                        Ok::<_, io::Error>(names)
                    };
                    match list.await {
                        Ok(names) => done.complete(0, names),
                        Err(err) => done.complete(errno(&err), Vec::<&OsStr>::new()),
                    }
                });
            }
        });

        handlers.readlink({
            let fs = self.clone();
            move |path, done| {
                let real = fs.real(path);
                task::spawn_local(async move {
                    match tokio::fs::read_link(real).await {
                        Ok(target) => done.complete(0, target),
                        Err(err) => done.complete(errno(&err), ""),
                    }
                });
            }
        });

        handlers.open({
            let fs = self.clone();
            move |path, flags, done| {
                let real = fs.real(path);
                let fs = fs.clone();
                task::spawn_local(async move {
                    match blocking(move || open_options(flags).open(real)).await {
                        Ok(file) => done.complete(0, fs.insert_file(file)),
                        Err(err) => done.complete(errno(&err), 0),
                    }
                });
            }
        });

        handlers.create({
            let fs = self.clone();
            move |path, mode, flags, done| {
                let real = fs.real(path);
                let fs = fs.clone();
                task::spawn_local(async move {
                    let open = move || {
                        let mut options = open_options(flags);
                        options.create(true).mode(mode & 0o7777);
                        if flags as i32 & libc::O_EXCL != 0 {
                            options.create_new(true);
                        }
                        options.open(real)
                    };
                    match blocking(open).await {
                        Ok(file) => done.complete(0, fs.insert_file(file)),
                        Err(err) => done.complete(errno(&err), 0),
                    }
                });
            }
        });

        handlers.read({
            let fs = self.clone();
            move |_, offset, len, buf, fh, done| {
                let file = match fs.file(fh) {
                    Ok(file) => file,
                    Err(err) => return done.complete(errno(&err)),
                };
                task::spawn_local(async move {
                    let read = blocking(move || {
                        let mut data = vec![0u8; len];
                        let n = file.read_at(&mut data, offset)?;
                        data.truncate(n);
                        Ok(data)
                    });
                    match read.await {
                        Ok(data) => done.complete(buf.fill(&data) as i32),
                        Err(err) => done.complete(errno(&err)),
                    }
                });
            }
        });

        handlers.write({
            let fs = self.clone();
            move |_, offset, _, buf, fh, done| {
                let file = match fs.file(fh) {
                    Ok(file) => file,
                    Err(err) => return done.complete(errno(&err)),
                };
                let data = buf.to_vec();
                task::spawn_local(async move {
                    match blocking(move || file.write_at(&data, offset)).await {
                        Ok(n) => done.complete(n as i32),
                        Err(err) => done.complete(errno(&err)),
                    }
                });
            }
        });

        handlers.release({
            let fs = self.clone();
            move |_, fh, done| {
                let mut files = fs.files.borrow_mut();
                if files.contains(fh as usize) {
                    drop(files.remove(fh as usize));
                    done.complete(0);
                } else {
                    done.complete(-libc::EBADF);
                }
            }
        });

        handlers.mkdir({
            let fs = self.clone();
            move |path, mode, done| {
                let real = fs.real(path);
                spawn_status(done, async move {
                    tokio::fs::DirBuilder::new()
                        .mode(mode & 0o7777)
                        .create(real)
                        .await
                });
            }
        });

        handlers.unlink({
            let fs = self.clone();
            move |path, done| spawn_status(done, tokio::fs::remove_file(fs.real(path)))
        });

        handlers.rmdir({
            let fs = self.clone();
            move |path, done| spawn_status(done, tokio::fs::remove_dir(fs.real(path)))
        });

        handlers.rename({
            let fs = self.clone();
            move |from, to, done| {
                spawn_status(done, tokio::fs::rename(fs.real(from), fs.real(to)))
            }
        });

        handlers.truncate({
            let fs = self.clone();
            move |path, size, done| {
                let real = fs.real(path);
                spawn_status(done, async move {
                    let file = tokio::fs::OpenOptions::new().write(true).open(real).await?;
                    file.set_len(size).await
                });
            }
        });

        handlers.chmod({
            let fs = self.clone();
            move |path, mode, done| {
                let perm = std::fs::Permissions::from_mode(mode);
                spawn_status(done, tokio::fs::set_permissions(fs.real(path), perm));
            }
        });

        handlers.chown({
            let fs = self.clone();
            move |path, uid, gid, done| {
                let real = fs.real(path);
                let uid = uid.map(nix::unistd::Uid::from_raw);
                let gid = gid.map(nix::unistd::Gid::from_raw);
                spawn_status(
                    done,
                    blocking(move || nix::unistd::chown(&real, uid, gid).map_err(nix_to_io_error)),
                );
            }
        });

        handlers.utimens({
            let fs = self.clone();
            move |path, atime, mtime, done| {
                let real = fs.real(path);
                spawn_status(
                    done,
                    blocking(move || {
                        let mut times = FileTimes::new();
                        if let Some(atime) = atime {
                            times = times.set_accessed(atime);
                        }
                        if let Some(mtime) = mtime {
                            times = times.set_modified(mtime);
                        }
                        File::open(real)?.set_times(times)
                    }),
                );
            }
        });

        handlers.statfs({
            let fs = self.clone();
            move |path, done| {
                let real = fs.real(path);
                task::spawn_local(async move {
                    let stat = blocking(move || {
                        nix::sys::statvfs::statvfs(&real).map_err(nix_to_io_error)
                    });
                    match stat.await {
                        Ok(st) => done.complete(
                            0,
                            StatFs {
                                blocks: Some(st.blocks() as u64),
                                bfree: Some(st.blocks_free() as u64),
                                bavail: Some(st.blocks_available() as u64),
                                files: Some(st.files() as u64),
                                ffree: Some(st.files_free() as u64),
                                bsize: Some(st.block_size() as u32),
                                namelen: Some(st.name_max() as u32),
                                frsize: Some(st.fragment_size() as u32),
                            },
                        ),
                        Err(err) => done.complete(errno(&err), StatFs::default()),
                    }
                });
            }
        });

        handlers.setxattr({
            let fs = self.clone();
            move |path, name, value, flags, done| {
                let real = fs.real(path);
                let name = name.to_owned();
                let value = value.to_vec();
                spawn_status(
                    done,
                    blocking(move || {
                        let path = c_path(&real)?;
                        let name = c_path(Path::new(&name))?;
                        let res = unsafe {
                            libc::lsetxattr(
                                path.as_ptr(),
                                name.as_ptr(),
                                value.as_ptr().cast(),
                                value.len(),
                                flags as libc::c_int,
                            )
                        };
                        if res == -1 {
                            return Err(io::Error::last_os_error());
                        }
                        Ok(())
                    }),
                );
            }
        });

        handlers.destroy({
            let fs = self.clone();
            move |done| {
                let open = fs.files.borrow().len();
                if open > 0 {
                    tracing::warn!("{} files were still open", open);
                }
                fs.files.borrow_mut().clear();
                done.complete(0);
            }
        });

        handlers
    }
}
