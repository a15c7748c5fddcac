// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Synthetic, read-only file tree whose leaves compute content on read.
// Author: Lukas Bower

//! Synthetic file tree.
//!
//! Nodes live in a single append-only arena owned by [`SynthTree`]; parent
//! links are arena indices and children are index lists, so the structure
//! has no reference cycles and [`NodeId`]s stay valid for the life of the
//! tree. The tree is built once, single-threaded, and then shared read-only
//! behind an `Arc` by any number of concurrent readers.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;
use thiserror::Error;
use timefs_9p::{Group, Qid, QidType, Stat, User, DMDIR};

/// Clock leaf behaviours.
pub mod leaf;
mod serve;

pub use leaf::LeafBehavior;

static NEXT_TREE: AtomicU32 = AtomicU32::new(1);

/// Errors raised while building or resolving the tree.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FsError {
    /// A sibling with the same name already exists.
    #[error("{parent}: '{name}' already exists")]
    DuplicateName {
        /// Path of the directory that already holds `name`.
        parent: String,
        /// Rejected name.
        name: String,
    },
    /// The node id was not issued by this tree.
    #[error("node {0} does not belong to this tree")]
    InvalidParent(NodeId),
    /// A path element does not exist.
    #[error("{0}: file does not exist")]
    NotFound(String),
    /// A leaf was used where a directory is required.
    #[error("{0}: not a directory")]
    NotADirectory(String),
    /// A directory was used where a leaf is required.
    #[error("{0}: not a regular file")]
    NotALeaf(String),
    /// Names must be non-empty, free of `/`, and not `.` or `..`.
    #[error("invalid file name '{0}'")]
    InvalidName(String),
    /// The arena has handed out every index a [`NodeId`] can hold.
    #[error("tree is full")]
    TreeFull,
}

/// Handle to a node, scoped to the tree that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    tree: u32,
    index: u32,
}

impl NodeId {
    /// Position of the node in its tree's arena; the root is zero.
    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tree, self.index)
    }
}

/// Directory or leaf payload of a node.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// A directory and the arena indices of its children, in insertion order.
    Directory {
        /// Child indices.
        children: Vec<u32>,
    },
    /// A file; `None` reads as empty.
    Leaf(Option<LeafBehavior>),
}

/// A tree entry.
#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    parent: u32,
    kind: NodeKind,
    perm: u32,
    owner: Arc<dyn User>,
    group: Option<Arc<dyn Group>>,
    created: u32,
}

impl Node {
    /// Name of the node within its parent.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Permission bits, including [`DMDIR`] for directories.
    #[must_use]
    pub fn perm(&self) -> u32 {
        self.perm
    }

    /// Directory or leaf payload.
    #[must_use]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Whether the node is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    /// Owning user.
    #[must_use]
    pub fn owner(&self) -> &Arc<dyn User> {
        &self.owner
    }

    /// Name of the owning group, falling back to the owner's first group.
    #[must_use]
    pub fn group_name(&self) -> String {
        match &self.group {
            Some(group) => group.name().to_owned(),
            None => self
                .owner
                .groups()
                .first()
                .map(|group| group.name().to_owned())
                .unwrap_or_else(|| self.owner.name().to_owned()),
        }
    }
}

/// Arena-backed synthetic tree.
#[derive(Debug)]
pub struct SynthTree {
    id: u32,
    nodes: Vec<Node>,
}

impl SynthTree {
    /// Create a tree holding only its root directory.
    ///
    /// The directory flag is added to `perm` if the caller left it out.
    pub fn new(
        name: &str,
        owner: Arc<dyn User>,
        group: Option<Arc<dyn Group>>,
        perm: u32,
    ) -> Self {
        let root = Node {
            name: name.to_owned(),
            parent: 0,
            kind: NodeKind::Directory {
                children: Vec::new(),
            },
            perm: perm | DMDIR,
            owner,
            group,
            created: now_secs(),
        };
        Self {
            id: NEXT_TREE.fetch_add(1, Ordering::Relaxed),
            nodes: vec![root],
        }
    }

    /// Handle of the root directory.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.id_at(0)
    }

    /// Number of nodes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// A tree always holds its root, so it is never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Attach a new node named `name` under the directory `parent`.
    ///
    /// Permission bits carrying [`DMDIR`] create a directory, anything else
    /// a leaf reading through `read`. On error the tree is left unchanged.
    pub fn add(
        &mut self,
        parent: NodeId,
        name: &str,
        owner: Arc<dyn User>,
        group: Option<Arc<dyn Group>>,
        perm: u32,
        read: Option<LeafBehavior>,
    ) -> Result<NodeId, FsError> {
        let parent_index = self.index_of(parent)?;
        if !self.nodes[parent_index as usize].is_dir() {
            return Err(FsError::NotADirectory(self.path_of(parent_index)));
        }
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(FsError::InvalidName(name.to_owned()));
        }
        let kind = if perm & DMDIR != 0 {
            if read.is_some() {
                return Err(FsError::NotALeaf(self.join(parent_index, name)));
            }
            NodeKind::Directory {
                children: Vec::new(),
            }
        } else {
            NodeKind::Leaf(read)
        };
        if self.child_named(parent_index, name)?.is_some() {
            return Err(FsError::DuplicateName {
                parent: self.path_of(parent_index),
                name: name.to_owned(),
            });
        }
        let index = next_index(self.nodes.len())?;
        self.nodes.push(Node {
            name: name.to_owned(),
            parent: parent_index,
            kind,
            perm,
            owner,
            group,
            created: now_secs(),
        });
        if let NodeKind::Directory { children } = &mut self.nodes[parent_index as usize].kind {
            children.push(index);
        }
        debug!("added {} mode {:#o}", self.path_of(index), perm);
        Ok(self.id_at(index))
    }

    /// Borrow a node.
    pub fn node(&self, id: NodeId) -> Result<&Node, FsError> {
        let index = self.index_of(id)?;
        Ok(&self.nodes[index as usize])
    }

    /// Parent of `id`; the root is its own parent.
    pub fn parent(&self, id: NodeId) -> Result<NodeId, FsError> {
        let index = self.index_of(id)?;
        Ok(self.id_at(self.nodes[index as usize].parent))
    }

    /// Children of the directory `dir` in insertion order.
    pub fn children(&self, dir: NodeId) -> Result<Vec<NodeId>, FsError> {
        let index = self.index_of(dir)?;
        match &self.nodes[index as usize].kind {
            NodeKind::Directory { children } => {
                Ok(children.iter().map(|&child| self.id_at(child)).collect())
            }
            NodeKind::Leaf(_) => Err(FsError::NotADirectory(self.path_of(index))),
        }
    }

    /// Resolve one path element below `dir`; `..` climbs to the parent.
    pub fn walk(&self, dir: NodeId, name: &str) -> Result<NodeId, FsError> {
        let index = self.index_of(dir)?;
        if name == ".." {
            return Ok(self.id_at(self.nodes[index as usize].parent));
        }
        match self.child_named(index, name)? {
            Some(child) => Ok(self.id_at(child)),
            None => Err(FsError::NotFound(self.join(index, name))),
        }
    }

    /// Resolve a slash-separated path from the root.
    ///
    /// Empty segments are ignored, so `"/time"`, `"time"` and `"//time"` are
    /// the same file and `"/"` is the root.
    pub fn lookup(&self, path: &str) -> Result<NodeId, FsError> {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(self.root(), |node, segment| self.walk(node, segment))
    }

    /// Absolute path of a node.
    pub fn path(&self, id: NodeId) -> Result<String, FsError> {
        let index = self.index_of(id)?;
        Ok(self.path_of(index))
    }

    /// Read at most `count` bytes of the leaf `id` at `offset`.
    pub fn read(&self, id: NodeId, offset: u64, count: usize) -> Result<Vec<u8>, FsError> {
        let index = self.index_of(id)?;
        match &self.nodes[index as usize].kind {
            NodeKind::Leaf(Some(behavior)) => Ok(behavior.read(offset, count)),
            NodeKind::Leaf(None) => Ok(Vec::new()),
            NodeKind::Directory { .. } => Err(FsError::NotALeaf(self.path_of(index))),
        }
    }

    /// Qid identifying `id` on the wire.
    pub fn qid(&self, id: NodeId) -> Result<Qid, FsError> {
        let index = self.index_of(id)?;
        Ok(self.qid_at(index))
    }

    /// Map a qid handed out by [`SynthTree::qid`] back to its node.
    pub fn node_for_qid(&self, qid: &Qid) -> Result<NodeId, FsError> {
        u32::try_from(qid.path())
            .ok()
            .filter(|&index| (index as usize) < self.nodes.len())
            .map(|index| self.id_at(index))
            .ok_or_else(|| FsError::NotFound(format!("qid {:#x}", qid.path())))
    }

    /// Directory entry describing `id`.
    pub fn stat(&self, id: NodeId) -> Result<Stat, FsError> {
        let index = self.index_of(id)?;
        let node = &self.nodes[index as usize];
        Ok(Stat {
            ty: 0,
            dev: 0,
            qid: self.qid_at(index),
            mode: node.perm,
            atime: node.created,
            mtime: node.created,
            length: 0,
            name: node.name.clone(),
            uid: node.owner.name().to_owned(),
            gid: node.group_name(),
            muid: node.owner.name().to_owned(),
        })
    }

    fn id_at(&self, index: u32) -> NodeId {
        NodeId {
            tree: self.id,
            index,
        }
    }

    fn index_of(&self, id: NodeId) -> Result<u32, FsError> {
        if id.tree != self.id || id.index as usize >= self.nodes.len() {
            return Err(FsError::InvalidParent(id));
        }
        Ok(id.index)
    }

    fn qid_at(&self, index: u32) -> Qid {
        let node = &self.nodes[index as usize];
        let ty = if node.is_dir() {
            QidType::DIRECTORY
        } else {
            QidType::FILE
        };
        Qid::new(ty, 0, u64::from(index))
    }

    fn child_named(&self, dir: u32, name: &str) -> Result<Option<u32>, FsError> {
        match &self.nodes[dir as usize].kind {
            NodeKind::Directory { children } => Ok(children
                .iter()
                .copied()
                .find(|&child| self.nodes[child as usize].name == name)),
            NodeKind::Leaf(_) => Err(FsError::NotADirectory(self.path_of(dir))),
        }
    }

    fn path_of(&self, index: u32) -> String {
        let mut parts = Vec::new();
        let mut current = index;
        while current != 0 {
            let node = &self.nodes[current as usize];
            parts.push(node.name.as_str());
            current = node.parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    fn join(&self, dir: u32, name: &str) -> String {
        let base = self.path_of(dir);
        if base == "/" {
            format!("/{name}")
        } else {
            format!("{base}/{name}")
        }
    }
}

fn next_index(len: usize) -> Result<u32, FsError> {
    u32::try_from(len).map_err(|_| FsError::TreeFull)
}

fn now_secs() -> u32 {
    u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(u32::MAX)
}
