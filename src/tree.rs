//! In-memory file tree mirroring the served directory.
//!
//! Nodes live in an arena and are addressed by stable [`NodeId`] handles;
//! fids hold handles, never references. The tree is built once at startup by
//! walking the backing root; after that, every mutation goes through the
//! dispatcher and updates the live tree in place. Removal detaches the node
//! from its parent and marks it dead, so stale fids stay safe to follow.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};

use crate::fcall::{dm, Qid, QidType, Stat};

/// Suffix of ownership sidecar files: `P.vufs` holds `uid:gid` for `P`.
pub const SIDECAR_SUFFIX: &str = ".vufs";

/// Stable handle to a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[cfg(test)]
impl NodeId {
    pub(crate) fn from_raw(i: usize) -> NodeId {
        NodeId(i)
    }
}

#[derive(Debug)]
pub struct Node {
    pub stat: Stat,
    /// The root's parent is itself.
    pub parent: NodeId,
    /// Present (and meaningful) only for directories.
    pub children: HashMap<String, NodeId>,
    /// Set when the node was removed; it stays in the arena for any fids
    /// that still reference it.
    pub dead: bool,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        self.stat.qid.typ.contains(QidType::DIR)
    }

    /// Bump the qid version after a mutation.
    pub fn touch(&mut self) {
        self.stat.qid.version = self.stat.qid.version.wrapping_add(1);
    }
}

pub struct Tree {
    nodes: Vec<Node>,
    root: NodeId,
}

/// Parse a `P.vufs` sidecar: ASCII `uid:gid` plus a trailing newline.
pub fn parse_sidecar(data: &str) -> Option<(String, String)> {
    let line = data.lines().next()?;
    let (uid, gid) = line.split_once(':')?;
    if uid.is_empty() || gid.is_empty() {
        return None;
    }
    Some((uid.to_string(), gid.to_string()))
}

fn sidecar_owner(path: &Path, default_user: &str) -> (String, String) {
    let sidecar = sidecar_path(path);
    match fs::read_to_string(&sidecar) {
        Ok(data) => match parse_sidecar(&data) {
            Some(owner) => owner,
            None => {
                warn!("ignoring malformed sidecar {}", sidecar.display());
                (default_user.to_string(), default_user.to_string())
            }
        },
        Err(_) => (default_user.to_string(), default_user.to_string()),
    }
}

/// Modification time in milliseconds, truncated the way qid versions are.
fn mtime_millis(meta: &fs::Metadata) -> u32 {
    (meta.mtime() as u64 * 1000 + meta.mtime_nsec() as u64 / 1_000_000) as u32
}

/// The sidecar path for a backing file.
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(SIDECAR_SUFFIX);
    PathBuf::from(os)
}

impl Tree {
    /// Walk the backing root and build the mirror. Runs exactly once, before
    /// the server starts accepting connections.
    pub fn build(backing_root: &Path, default_user: &str) -> Result<Tree> {
        let t0 = Instant::now();
        let meta = fs::metadata(backing_root)
            .with_context(|| format!("stat root {}", backing_root.display()))?;
        if !meta.is_dir() {
            return Err(anyhow!("{} is not a directory", backing_root.display()));
        }

        let mut tree = Tree { nodes: Vec::new(), root: NodeId(0) };
        let root_stat = Stat {
            qid: Qid {
                typ: QidType::DIR,
                version: mtime_millis(&meta),
                path: meta.ino(),
            },
            // Per-file authorization is the sole control; host permissions
            // on the root must not get in the way.
            mode: dm::DIR | 0o777,
            atime: meta.atime() as u32,
            mtime: meta.mtime() as u32,
            length: 0,
            name: "/".to_string(),
            uid: default_user.to_string(),
            gid: default_user.to_string(),
            muid: default_user.to_string(),
            ..Stat::default()
        };
        tree.nodes.push(Node {
            stat: root_stat,
            parent: NodeId(0),
            children: HashMap::new(),
            dead: false,
        });

        tree.load_dir(backing_root, NodeId(0), default_user)?;

        let n = tree.nodes.len();
        if n == 1 {
            info!("loaded 1 file in {:?}", t0.elapsed());
        } else {
            info!("loaded {} files in {:?}", n, t0.elapsed());
        }
        Ok(tree)
    }

    fn load_dir(&mut self, dir_path: &Path, dir: NodeId, default_user: &str) -> Result<()> {
        let entries = fs::read_dir(dir_path)
            .with_context(|| format!("read dir {}", dir_path.display()))?;
        for entry in entries {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(name) => {
                    warn!("skipping non-UTF-8 name {:?}", name);
                    continue;
                }
            };
            // Sidecars are ownership bookkeeping, not content.
            if name.ends_with(SIDECAR_SUFFIX) {
                continue;
            }
            let path = entry.path();
            let meta = entry.metadata()?;
            if !meta.is_dir() && !meta.is_file() {
                warn!("skipping special file {}", path.display());
                continue;
            }

            let (uid, gid) = sidecar_owner(&path, default_user);
            let is_dir = meta.is_dir();
            let stat = Stat {
                qid: Qid {
                    typ: if is_dir { QidType::DIR } else { QidType::FILE },
                    version: mtime_millis(&meta),
                    path: meta.ino(),
                },
                mode: (meta.mode() & 0o777) | if is_dir { dm::DIR } else { 0 },
                atime: meta.atime() as u32,
                mtime: meta.mtime() as u32,
                length: if is_dir { 0 } else { meta.len() },
                muid: uid.clone(),
                uid,
                gid,
                name: name.clone(),
                ..Stat::default()
            };
            let child = self.attach(dir, stat);
            if is_dir {
                self.load_dir(&path, child, default_user)?;
            }
        }
        Ok(())
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn child(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        self.node(dir).children.get(name).copied()
    }

    /// Children of a directory in name order, the order directory reads use.
    pub fn children_sorted(&self, dir: NodeId) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.node(dir).children.values().copied().collect();
        ids.sort_by(|a, b| self.node(*a).stat.name.cmp(&self.node(*b).stat.name));
        ids
    }

    /// Add a new node under `parent`. The caller has already checked that
    /// the name is free.
    pub fn attach(&mut self, parent: NodeId, stat: Stat) -> NodeId {
        let id = NodeId(self.nodes.len());
        let name = stat.name.clone();
        self.nodes.push(Node { stat, parent, children: HashMap::new(), dead: false });
        self.nodes[parent.0].children.insert(name, id);
        id
    }

    /// Detach a node from its parent and mark it dead.
    pub fn detach(&mut self, id: NodeId) {
        let parent = self.node(id).parent;
        let name = self.node(id).stat.name.clone();
        self.nodes[parent.0].children.remove(&name);
        self.nodes[id.0].dead = true;
    }

    /// Rename a node within its directory. The caller has already checked
    /// that `new_name` is free.
    pub fn rename(&mut self, id: NodeId, new_name: &str) {
        let parent = self.node(id).parent;
        let old = self.node(id).stat.name.clone();
        self.nodes[parent.0].children.remove(&old);
        self.nodes[parent.0].children.insert(new_name.to_string(), id);
        self.nodes[id.0].stat.name = new_name.to_string();
    }

    /// The 9P-visible path of a node, used in error messages.
    pub fn fs_path(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cur = id;
        while cur != self.root {
            parts.push(self.node(cur).stat.name.clone());
            cur = self.node(cur).parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// The backing path of a node under the served root.
    pub fn host_path(&self, backing_root: &Path, id: NodeId) -> PathBuf {
        let mut parts = Vec::new();
        let mut cur = id;
        while cur != self.root {
            parts.push(self.node(cur).stat.name.clone());
            cur = self.node(cur).parent;
        }
        let mut path = backing_root.to_path_buf();
        for part in parts.iter().rev() {
            path.push(part);
        }
        path
    }

    /// Number of live nodes, root included.
    pub fn live_count(&self) -> usize {
        self.nodes.iter().filter(|n| !n.dead).count()
    }
}
