use fusebridge_kernel::FUSE_ROOT_ID;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

#[derive(Debug)]
struct Node {
    path: PathBuf,
    nlookup: u64,
}

/// The inode numbers handed to the kernel and the paths behind them.
#[derive(Debug)]
pub(crate) struct PathTable {
    nodes: HashMap<u64, Node>,
    inos: HashMap<PathBuf, u64>,
    next_ino: u64,
}

impl Default for PathTable {
    fn default() -> Self {
        let root = PathBuf::from("/");
        let mut nodes = HashMap::new();
        nodes.insert(
            FUSE_ROOT_ID,
            Node {
                path: root.clone(),
                nlookup: 1,
            },
        );
        let mut inos = HashMap::new();
        inos.insert(root, FUSE_ROOT_ID);
        Self {
            nodes,
            inos,
            next_ino: FUSE_ROOT_ID + 1,
        }
    }
}

impl PathTable {
    pub(crate) fn path(&self, ino: u64) -> Option<&Path> {
        self.nodes.get(&ino).map(|node| node.path.as_path())
    }

    /// Look `path` up on behalf of the kernel, adding one reference.
    pub(crate) fn intern(&mut self, path: &Path) -> u64 {
        if let Some(&ino) = self.inos.get(path) {
            if let Some(node) = self.nodes.get_mut(&ino) {
                node.nlookup += 1;
            }
            return ino;
        }

        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(
            ino,
            Node {
                path: path.to_owned(),
                nlookup: 1,
            },
        );
        self.inos.insert(path.to_owned(), ino);
        ino
    }

    /// Drop `nlookup` references. The root is never forgotten.
    pub(crate) fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == FUSE_ROOT_ID {
            return;
        }
        let Some(node) = self.nodes.get_mut(&ino) else {
            return;
        };
        node.nlookup = node.nlookup.saturating_sub(nlookup);
        if node.nlookup == 0 {
            if let Some(node) = self.nodes.remove(&ino) {
                if self.inos.get(&node.path) == Some(&ino) {
                    self.inos.remove(&node.path);
                }
            }
        }
    }

    /// Forget the name `path` and everything below it after a removal.
    ///
    /// The nodes stay until the kernel forgets them, so open handles keep
    /// resolving. A later lookup of the same name gets a fresh number.
    pub(crate) fn unlink(&mut self, path: &Path) {
        self.inos.retain(|p, _| !p.starts_with(path));
    }

    /// Move `from` and everything below it to `to`.
    pub(crate) fn rename(&mut self, from: &Path, to: &Path) {
        // Whatever was at the target is replaced and no longer reachable by name.
        self.inos.retain(|path, _| !path.starts_with(to));

        let moved: Vec<(PathBuf, u64)> = self
            .inos
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, &ino)| (path.clone(), ino))
            .collect();

        for (old, ino) in moved {
            self.inos.remove(&old);
            let new = match old.strip_prefix(from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.to_owned(),
                Ok(rest) => to.join(rest),
                Err(_) => continue,
            };
            if let Some(node) = self.nodes.get_mut(&ino) {
                node.path = new.clone();
            }
            self.inos.insert(new, ino);
        }
    }
}
