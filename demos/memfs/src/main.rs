#![deny(clippy::unimplemented, clippy::todo)]

// An in-memory filesystem served by inode handlers. Every callback completes
// right away on the event loop.

use fusebridge::{inode, Options, SharedBuffer, Stat, StatFs};

use anyhow::{ensure, Context as _, Result};
use dashmap::DashMap;
use std::{
    cell::Cell,
    collections::{btree_map::Entry, BTreeMap, HashMap},
    ffi::{OsStr, OsString},
    path::PathBuf,
    rc::Rc,
    time::SystemTime,
};
use tokio::task::LocalSet;
use tracing_subscriber::EnvFilter;

const ROOT_INO: u64 = 1;
const BLOCK_SIZE: u64 = 512;

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
    options
        .debug(debug)
        .mount_option("fsname=memfs")
        .mount_option("default_permissions");
    if let Some(opts) = &mount_opts {
        options.mount_option(opts);
    }

    let fs = Rc::new(MemFs::new());

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    LocalSet::new().block_on(&rt, async move {
        let mount = inode::start(&mountpoint, fs.handlers(), &options)?;
        mount.closed().await?;
        Ok(())
    })
}

/// Failures carry a positive errno.
type FsResult<T> = std::result::Result<T, i32>;

fn status<T>(res: FsResult<T>) -> i32 {
    match res {
        Ok(_) => 0,
        Err(errno) => -errno,
    }
}

enum Kind {
    File(Vec<u8>),
    Dir {
        children: BTreeMap<OsString, u64>,
        parent: u64,
    },
    Symlink(OsString),
}

struct INode {
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
    xattrs: HashMap<OsString, Vec<u8>>,
    kind: Kind,
}

impl INode {
    fn new(mode: u32, kind: Kind) -> Self {
        let now = SystemTime::now();
        Self {
            mode,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            nlink: if matches!(kind, Kind::Dir { .. }) { 2 } else { 1 },
            atime: now,
            mtime: now,
            ctime: now,
            xattrs: HashMap::new(),
            kind,
        }
    }

    fn size(&self) -> u64 {
        match &self.kind {
            Kind::File(data) => data.len() as u64,
            Kind::Dir { children, .. } => children.len() as u64,
            Kind::Symlink(target) => target.len() as u64,
        }
    }

    fn stat(&self, ino: u64) -> Stat {
        let size = self.size();
        Stat {
            ino: Some(ino),
            size: Some(size),
            blocks: Some(size.div_ceil(BLOCK_SIZE)),
            atime: Some(self.atime),
            mtime: Some(self.mtime),
            ctime: Some(self.ctime),
            mode: Some(self.mode),
            nlink: Some(self.nlink),
            uid: Some(self.uid),
            gid: Some(self.gid),
            blksize: Some(BLOCK_SIZE as u32),
            ..Stat::default()
        }
    }

    fn children(&self) -> FsResult<&BTreeMap<OsString, u64>> {
        match &self.kind {
            Kind::Dir { children, .. } => Ok(children),
            _ => Err(libc::ENOTDIR),
        }
    }

    fn children_mut(&mut self) -> FsResult<&mut BTreeMap<OsString, u64>> {
        match &mut self.kind {
            Kind::Dir { children, .. } => Ok(children),
            _ => Err(libc::ENOTDIR),
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self.kind, Kind::Dir { .. })
    }
}

// Guards into `inodes` are never held across another access to the map.
struct MemFs {
    inodes: DashMap<u64, INode>,
    next_ino: Cell<u64>,
}

impl MemFs {
    fn new() -> Self {
        let inodes = DashMap::new();
        inodes.insert(
            ROOT_INO,
            INode::new(
                libc::S_IFDIR | 0o755,
                Kind::Dir {
                    children: BTreeMap::new(),
                    parent: ROOT_INO,
                },
            ),
        );
        Self {
            inodes,
            next_ino: Cell::new(ROOT_INO + 1),
        }
    }

    fn stat(&self, ino: u64) -> FsResult<Stat> {
        let inode = self.inodes.get(&ino).ok_or(libc::ENOENT)?;
        Ok(inode.stat(ino))
    }

    fn child(&self, parent: u64, name: &OsStr) -> FsResult<u64> {
        let parent = self.inodes.get(&parent).ok_or(libc::ENOENT)?;
        parent.children()?.get(name).copied().ok_or(libc::ENOENT)
    }

    fn lookup(&self, parent: u64, name: &OsStr) -> FsResult<(u64, Stat)> {
        let ino = self.child(parent, name)?;
        Ok((ino, self.stat(ino)?))
    }

    fn make_node(&self, parent: u64, name: &OsStr, inode: INode) -> FsResult<(u64, Stat)> {
        let is_dir = inode.is_dir();
        let ino = self.next_ino.get();
        {
            let mut parent = self.inodes.get_mut(&parent).ok_or(libc::ENOENT)?;
            match parent.children_mut()?.entry(name.to_owned()) {
                Entry::Occupied(..) => return Err(libc::EEXIST),
                Entry::Vacant(entry) => {
                    entry.insert(ino);
                }
            }
            if is_dir {
                parent.nlink += 1;
            }
            parent.mtime = SystemTime::now();
        }
        self.next_ino.set(ino + 1);
        let stat = inode.stat(ino);
        self.inodes.insert(ino, inode);
        Ok((ino, stat))
    }

    fn mkdir(&self, parent: u64, name: &OsStr, mode: u32) -> FsResult<(u64, Stat)> {
        let inode = INode::new(
            libc::S_IFDIR | (mode & 0o7777),
            Kind::Dir {
                children: BTreeMap::new(),
                parent,
            },
        );
        self.make_node(parent, name, inode)
    }

    fn link(&self, ino: u64, newparent: u64, newname: &OsStr) -> FsResult<(u64, Stat)> {
        if self.inodes.get(&ino).ok_or(libc::ENOENT)?.is_dir() {
            return Err(libc::EPERM);
        }
        {
            let mut parent = self.inodes.get_mut(&newparent).ok_or(libc::ENOENT)?;
            match parent.children_mut()?.entry(newname.to_owned()) {
                Entry::Occupied(..) => return Err(libc::EEXIST),
                Entry::Vacant(entry) => {
                    entry.insert(ino);
                }
            }
        }
        let mut inode = self.inodes.get_mut(&ino).ok_or(libc::ENOENT)?;
        inode.nlink += 1;
        inode.ctime = SystemTime::now();
        Ok((ino, inode.stat(ino)))
    }

    /// Check that `ino` may be removed as a directory (`dir`) or as anything else.
    fn removable(&self, ino: u64, dir: bool) -> FsResult<()> {
        let inode = self.inodes.get(&ino).ok_or(libc::ENOENT)?;
        match (&inode.kind, dir) {
            (Kind::Dir { children, .. }, true) if !children.is_empty() => Err(libc::ENOTEMPTY),
            (Kind::Dir { .. }, true) => Ok(()),
            (Kind::Dir { .. }, false) => Err(libc::EISDIR),
            (_, true) => Err(libc::ENOTDIR),
            (_, false) => Ok(()),
        }
    }

    /// Drop one link of `ino`, which has already left its parent.
    fn drop_link(&self, ino: u64) {
        let gone = match self.inodes.get_mut(&ino) {
            Some(mut inode) if inode.is_dir() => {
                inode.nlink = 0;
                true
            }
            Some(mut inode) => {
                inode.nlink = inode.nlink.saturating_sub(1);
                inode.ctime = SystemTime::now();
                inode.nlink == 0
            }
            None => false,
        };
        if gone {
            self.inodes.remove(&ino);
        }
    }

    fn remove(&self, parent: u64, name: &OsStr, dir: bool) -> FsResult<()> {
        let ino = self.child(parent, name)?;
        self.removable(ino, dir)?;
        {
            let mut parent = self.inodes.get_mut(&parent).ok_or(libc::ENOENT)?;
            parent.children_mut()?.remove(name);
            if dir {
                parent.nlink -= 1;
            }
            parent.mtime = SystemTime::now();
        }
        self.drop_link(ino);
        Ok(())
    }

    fn rename(&self, parent: u64, name: &OsStr, newparent: u64, newname: &OsStr) -> FsResult<()> {
        let ino = self.child(parent, name)?;
        let is_dir = self.inodes.get(&ino).ok_or(libc::ENOENT)?.is_dir();
        match self.child(newparent, newname) {
            Ok(target) if target == ino => return Ok(()),
            Ok(..) => self.remove(newparent, newname, is_dir)?,
            Err(libc::ENOENT) => (),
            Err(errno) => return Err(errno),
        }

        {
            let mut parent = self.inodes.get_mut(&parent).ok_or(libc::ENOENT)?;
            parent.children_mut()?.remove(name);
            if is_dir {
                parent.nlink -= 1;
            }
        }
        {
            let mut parent = self.inodes.get_mut(&newparent).ok_or(libc::ENOENT)?;
            parent.children_mut()?.insert(newname.to_owned(), ino);
            if is_dir {
                parent.nlink += 1;
            }
        }
        if let Some(mut inode) = self.inodes.get_mut(&ino) {
            if let Kind::Dir { parent, .. } = &mut inode.kind {
                *parent = newparent;
            }
            inode.ctime = SystemTime::now();
        }
        Ok(())
    }

    fn setattr(&self, ino: u64, req: &Stat) -> FsResult<Stat> {
        let mut inode = self.inodes.get_mut(&ino).ok_or(libc::ENOENT)?;
        if let Some(mode) = req.mode {
            inode.mode = (inode.mode & libc::S_IFMT) | (mode & 0o7777);
        }
        if let Some(uid) = req.uid {
            inode.uid = uid;
        }
        if let Some(gid) = req.gid {
            inode.gid = gid;
        }
        if let Some(size) = req.size {
            match &mut inode.kind {
                Kind::File(data) => data.resize(size as usize, 0),
                Kind::Dir { .. } => return Err(libc::EISDIR),
                Kind::Symlink(..) => return Err(libc::EINVAL),
            }
            inode.mtime = SystemTime::now();
        }
        if let Some(atime) = req.atime {
            inode.atime = atime;
        }
        if let Some(mtime) = req.mtime {
            inode.mtime = mtime;
        }
        inode.ctime = SystemTime::now();
        Ok(inode.stat(ino))
    }

    fn readlink(&self, ino: u64) -> FsResult<OsString> {
        let inode = self.inodes.get(&ino).ok_or(libc::ENOENT)?;
        match &inode.kind {
            Kind::Symlink(target) => Ok(target.clone()),
            _ => Err(libc::EINVAL),
        }
    }

    fn read(&self, ino: u64, offset: u64, buf: &SharedBuffer) -> FsResult<usize> {
        let mut inode = self.inodes.get_mut(&ino).ok_or(libc::ENOENT)?;
        let n = match &inode.kind {
            Kind::File(data) => {
                let data = data.get(offset as usize..).unwrap_or_default();
                buf.fill(data)
            }
            Kind::Dir { .. } => return Err(libc::EISDIR),
            Kind::Symlink(..) => return Err(libc::EINVAL),
        };
        inode.atime = SystemTime::now();
        Ok(n)
    }

    fn write(&self, ino: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        let mut inode = self.inodes.get_mut(&ino).ok_or(libc::ENOENT)?;
        match &mut inode.kind {
            Kind::File(content) => {
                let offset = offset as usize;
                let end = offset + data.len();
                if content.len() < end {
                    content.resize(end, 0);
                }
                content[offset..end].copy_from_slice(data);
            }
            Kind::Dir { .. } => return Err(libc::EISDIR),
            Kind::Symlink(..) => return Err(libc::EINVAL),
        }
        let now = SystemTime::now();
        inode.mtime = now;
        inode.ctime = now;
        Ok(data.len())
    }

    fn entries(&self, ino: u64) -> FsResult<Vec<(OsString, u64)>> {
        let inode = self.inodes.get(&ino).ok_or(libc::ENOENT)?;
        let parent = match &inode.kind {
            Kind::Dir { parent, .. } => *parent,
            _ => return Err(libc::ENOTDIR),
        };
        let mut entries = vec![(".".into(), ino), ("..".into(), parent)];
        entries.extend(
            inode
                .children()?
                .iter()
                .map(|(name, &ino)| (name.clone(), ino)),
        );
        Ok(entries)
    }

    fn statfs(&self) -> StatFs {
        let used: u64 = self
            .inodes
            .iter()
            .map(|inode| inode.size().div_ceil(BLOCK_SIZE))
            .sum();
        StatFs {
            blocks: Some(used),
            files: Some(self.inodes.len() as u64),
            bsize: Some(BLOCK_SIZE as u32),
            frsize: Some(BLOCK_SIZE as u32),
            namelen: Some(255),
            ..StatFs::default()
        }
    }

    fn getxattr(&self, ino: u64, name: &OsStr) -> FsResult<Vec<u8>> {
        let inode = self.inodes.get(&ino).ok_or(libc::ENOENT)?;
        inode.xattrs.get(name).cloned().ok_or(libc::ENODATA)
    }

    fn listxattr(&self, ino: u64) -> FsResult<Vec<OsString>> {
        let inode = self.inodes.get(&ino).ok_or(libc::ENOENT)?;
        Ok(inode.xattrs.keys().cloned().collect())
    }

    fn setxattr(&self, ino: u64, name: &OsStr, value: &[u8], flags: u32) -> FsResult<()> {
        let mut inode = self.inodes.get_mut(&ino).ok_or(libc::ENOENT)?;
        let flags = flags as i32;
        let exists = inode.xattrs.contains_key(name);
        if flags & libc::XATTR_CREATE != 0 && exists {
            return Err(libc::EEXIST);
        }
        if flags & libc::XATTR_REPLACE != 0 && !exists {
            return Err(libc::ENODATA);
        }
        inode.xattrs.insert(name.to_owned(), value.to_vec());
        inode.ctime = SystemTime::now();
        Ok(())
    }

    fn removexattr(&self, ino: u64, name: &OsStr) -> FsResult<()> {
        let mut inode = self.inodes.get_mut(&ino).ok_or(libc::ENOENT)?;
        inode.xattrs.remove(name).ok_or(libc::ENODATA)?;
        inode.ctime = SystemTime::now();
        Ok(())
    }

    fn handlers(self: &Rc<Self>) -> inode::Handlers {
        let mut handlers = inode::Handlers::default();

        macro_rules! entry {
            ($done:expr, $res:expr) => {
                match $res {
                    Ok((ino, stat)) => $done.complete(0, ino, stat),
                    Err(errno) => $done.complete(-errno, 0, Stat::default()),
                }
            };
        }

        handlers
            .init(|done| {
                tracing::info!("memfs is ready");
                done.complete(0);
            })
            .lookup({
                let fs = self.clone();
                move |parent, name, done| entry!(done, fs.lookup(parent, name))
            })
            .getattr({
                let fs = self.clone();
                move |ino, done| match fs.stat(ino) {
                    Ok(stat) => done.complete(0, stat),
                    Err(errno) => done.complete(-errno, Stat::default()),
                }
            })
            .setattr({
                let fs = self.clone();
                move |ino, req, done| match fs.setattr(ino, req) {
                    Ok(stat) => done.complete(0, stat),
                    Err(errno) => done.complete(-errno, Stat::default()),
                }
            })
            .readlink({
                let fs = self.clone();
                move |ino, done| match fs.readlink(ino) {
                    Ok(target) => done.complete(0, target),
                    Err(errno) => done.complete(-errno, ""),
                }
            })
            .mknod({
                let fs = self.clone();
                move |parent, name, mode, _rdev, done| {
                    if mode & libc::S_IFMT != libc::S_IFREG {
                        return done.complete(-libc::ENOTSUP, 0, Stat::default());
                    }
                    entry!(done, fs.make_node(parent, name, INode::new(mode, Kind::File(vec![]))))
                }
            })
            .mkdir({
                let fs = self.clone();
                move |parent, name, mode, done| entry!(done, fs.mkdir(parent, name, mode))
            })
            .symlink({
                let fs = self.clone();
                move |parent, target, name, done| {
                    let inode = INode::new(libc::S_IFLNK | 0o777, Kind::Symlink(target.to_owned()));
                    entry!(done, fs.make_node(parent, name, inode))
                }
            })
            .link({
                let fs = self.clone();
                move |ino, newparent, newname, done| entry!(done, fs.link(ino, newparent, newname))
            })
            .unlink({
                let fs = self.clone();
                move |parent, name, done| done.complete(status(fs.remove(parent, name, false)))
            })
            .rmdir({
                let fs = self.clone();
                move |parent, name, done| done.complete(status(fs.remove(parent, name, true)))
            })
            .rename({
                let fs = self.clone();
                move |parent, name, newparent, newname, done| {
                    done.complete(status(fs.rename(parent, name, newparent, newname)))
                }
            })
            .create({
                let fs = self.clone();
                move |parent, name, mode, _flags, done| {
                    let inode = INode::new(libc::S_IFREG | (mode & 0o7777), Kind::File(vec![]));
                    match fs.make_node(parent, name, inode) {
                        Ok((ino, stat)) => done.complete(0, ino, stat, 0),
                        Err(errno) => done.complete(-errno, 0, Stat::default(), 0),
                    }
                }
            })
            .open({
                let fs = self.clone();
                move |ino, _flags, done| match fs.stat(ino) {
                    Ok(..) => done.complete(0, 0),
                    Err(errno) => done.complete(-errno, 0),
                }
            })
            .read({
                let fs = self.clone();
                move |ino, offset, _len, buf, _fh, done| match fs.read(ino, offset, &buf) {
                    Ok(n) => done.complete(n as i32),
                    Err(errno) => done.complete(-errno),
                }
            })
            .write({
                let fs = self.clone();
                move |ino, offset, _len, buf, _fh, done| {
                    let res = fs.write(ino, offset, &buf.borrow());
                    match res {
                        Ok(n) => done.complete(n as i32),
                        Err(errno) => done.complete(-errno),
                    }
                }
            })
            .flush(|_, _, done| done.complete(0))
            .release(|_, _, done| done.complete(0))
            .fsync(|_, _, _, done| done.complete(0))
            .opendir({
                let fs = self.clone();
                move |ino, _flags, done| match fs.inodes.get(&ino).map(|inode| inode.is_dir()) {
                    Some(true) => done.complete(0, 0),
                    Some(false) => done.complete(-libc::ENOTDIR, 0),
                    None => done.complete(-libc::ENOENT, 0),
                }
            })
            .readdir({
                let fs = self.clone();
                move |ino, _size, _offset, _fh, done| match fs.entries(ino) {
                    Ok(entries) => done.complete(0, entries),
                    Err(errno) => done.complete(-errno, Vec::<(OsString, u64)>::new()),
                }
            })
            .releasedir(|_, _, done| done.complete(0))
            .fsyncdir(|_, _, _, done| done.complete(0))
            .statfs({
                let fs = self.clone();
                move |_, done| done.complete(0, fs.statfs())
            })
            .getxattr({
                let fs = self.clone();
                move |ino, name, _size, done| match fs.getxattr(ino, name) {
                    Ok(value) => done.complete(0, value),
                    Err(errno) => done.complete(-errno, b""),
                }
            })
            .listxattr({
                let fs = self.clone();
                move |ino, _size, done| match fs.listxattr(ino) {
                    Ok(names) => done.complete_names(0, names),
                    Err(errno) => done.complete(-errno, b""),
                }
            })
            .setxattr({
                let fs = self.clone();
                move |ino, name, value, flags, done| {
                    done.complete(status(fs.setxattr(ino, name, value, flags)))
                }
            })
            .removexattr({
                let fs = self.clone();
                move |ino, name, done| done.complete(status(fs.removexattr(ino, name)))
            })
            .access({
                let fs = self.clone();
                move |ino, _mask, done| done.complete(status(fs.stat(ino)))
            })
            .destroy({
                let fs = self.clone();
                move |done| {
                    tracing::info!("memfs is unmounted with {} inodes", fs.inodes.len());
                    done.complete(0);
                }
            });

        handlers
    }
}
