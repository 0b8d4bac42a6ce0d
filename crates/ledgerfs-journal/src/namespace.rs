//! In-memory namespace tree
//!
//! The tree and its `max_tx_id` watermark live behind one reader/writer lock
//! so a reader never sees content that disagrees with the watermark.
//! Snapshots serialize the whole tree as JSON.

use ledgerfs_common::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

const ROOT_NAME: &str = "/";

/// A directory and its ordered children
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub name: String,
    pub children: Vec<Node>,
}

impl Directory {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
        }
    }

    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name() == name)
    }
}

/// A namespace entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Node {
    Directory(Directory),
    File { name: String },
}

impl Node {
    /// Entry name (one path segment)
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Directory(dir) => &dir.name,
            Self::File { name } => name,
        }
    }

    #[must_use]
    pub const fn is_directory(&self) -> bool {
        matches!(self, Self::Directory(_))
    }
}

/// Result of [`NamespaceTree::create_file`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Some directory on the way to the file does not exist
    ParentMissing,
    /// The parent already holds an entry with this name
    AlreadyExists,
    /// The path names no file (empty or only separators)
    InvalidPath,
}

impl CreateOutcome {
    #[must_use]
    pub const fn is_created(self) -> bool {
        matches!(self, Self::Created)
    }
}

/// Namespace image at a transaction id
///
/// `timestamp` only disambiguates file names. Two snapshots are equal when
/// their `max_tx_id` and serialized tree match.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub max_tx_id: u64,
    pub timestamp: u64,
    pub tree: Vec<u8>,
}

impl Snapshot {
    pub const fn new(max_tx_id: u64, timestamp: u64, tree: Vec<u8>) -> Self {
        Self {
            max_tx_id,
            timestamp,
            tree,
        }
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.max_tx_id == other.max_tx_id && self.tree == other.tree
    }
}

impl Eq for Snapshot {}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Walk `segments` from `children`, creating missing directories.
/// Returns false if an existing file blocks the path.
fn make_path(children: &mut Vec<Node>, segments: &[&str]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return true;
    };

    let idx = if let Some(idx) = children.iter().position(|c| c.name() == *first) {
        idx
    } else {
        children.push(Node::Directory(Directory::new(*first)));
        children.len() - 1
    };

    match &mut children[idx] {
        Node::Directory(dir) => make_path(&mut dir.children, rest),
        Node::File { .. } => false,
    }
}

fn find_dir_mut<'a>(dir: &'a mut Directory, segments: &[&str]) -> Option<&'a mut Directory> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(dir);
    };
    match dir.children.iter_mut().find(|c| c.name() == *first)? {
        Node::Directory(child) => find_dir_mut(child, rest),
        Node::File { .. } => None,
    }
}

struct TreeState {
    root: Directory,
    max_tx_id: u64,
}

/// The namespace hierarchy and the id of the last applied transaction
pub struct NamespaceTree {
    state: RwLock<TreeState>,
}

impl Default for NamespaceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceTree {
    /// Create an empty tree rooted at `/`
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TreeState {
                root: Directory::new(ROOT_NAME),
                max_tx_id: 0,
            }),
        }
    }

    /// Build a tree from a snapshot
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self> {
        let tree = Self::new();
        tree.restore(snapshot)?;
        Ok(tree)
    }

    /// Replace the whole tree with the snapshot's content
    pub fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        let root = if snapshot.tree.is_empty() {
            Directory::new(ROOT_NAME)
        } else {
            serde_json::from_slice(&snapshot.tree)
                .map_err(|e| Error::Deserialization(format!("namespace image: {e}")))?
        };

        let mut state = self.state.write();
        state.root = root;
        state.max_tx_id = snapshot.max_tx_id;
        Ok(())
    }

    /// Create every missing directory along `path`.
    ///
    /// Existing segments are reused. Returns false only when a file sits
    /// where a directory is needed. The watermark advances either way.
    pub fn make_directory(&self, tx_id: u64, path: &str) -> bool {
        let segs = segments(path);
        let mut state = self.state.write();
        let ok = make_path(&mut state.root.children, &segs);
        state.max_tx_id = state.max_tx_id.max(tx_id);
        ok
    }

    /// Add a file under its existing parent directory
    pub fn create_file(&self, tx_id: u64, file_name: &str) -> CreateOutcome {
        let segs = segments(file_name);
        let mut state = self.state.write();
        state.max_tx_id = state.max_tx_id.max(tx_id);

        let Some((leaf, parents)) = segs.split_last() else {
            return CreateOutcome::InvalidPath;
        };
        let Some(parent) = find_dir_mut(&mut state.root, parents) else {
            debug!("create {}: parent missing", file_name);
            return CreateOutcome::ParentMissing;
        };
        if parent.child(leaf).is_some() {
            return CreateOutcome::AlreadyExists;
        }

        parent.children.push(Node::File {
            name: (*leaf).to_string(),
        });
        CreateOutcome::Created
    }

    /// Serialize the tree unless nothing changed since `last_checkpoint_tx_id`
    pub fn snapshot(&self, last_checkpoint_tx_id: u64) -> Result<Option<Snapshot>> {
        let state = self.state.read();
        if state.max_tx_id == last_checkpoint_tx_id {
            return Ok(None);
        }

        let tree = serde_json::to_vec(&state.root)
            .map_err(|e| Error::Serialization(format!("namespace image: {e}")))?;
        Ok(Some(Snapshot::new(state.max_tx_id, now_millis(), tree)))
    }

    /// Serialized form of the current tree
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.state.read().root)
            .map_err(|e| Error::Serialization(format!("namespace image: {e}")))
    }

    /// Id of the last applied transaction
    pub fn max_tx_id(&self) -> u64 {
        self.state.read().max_tx_id
    }

    /// Whether `path` names an existing entry
    pub fn exists(&self, path: &str) -> bool {
        self.lookup(path, |_| ()).is_some()
    }

    /// Whether `path` names an existing directory
    pub fn is_directory(&self, path: &str) -> bool {
        self.lookup(path, Node::is_directory).unwrap_or(false)
    }

    /// Child names of the directory at `path`
    pub fn list(&self, path: &str) -> Option<Vec<String>> {
        self.lookup(path, |node| match node {
            Node::Directory(dir) => Some(dir.children.iter().map(|c| c.name().to_string()).collect()),
            Node::File { .. } => None,
        })
        .flatten()
    }

    fn lookup<T>(&self, path: &str, f: impl FnOnce(&Node) -> T) -> Option<T> {
        let state = self.state.read();
        let segs = segments(path);
        let Some((leaf, parents)) = segs.split_last() else {
            // Root: wrap it so callers see a directory node
            let root = Node::Directory(state.root.clone());
            return Some(f(&root));
        };

        let mut dir = &state.root;
        for seg in parents {
            match dir.child(seg)? {
                Node::Directory(child) => dir = child,
                Node::File { .. } => return None,
            }
        }
        dir.child(leaf).map(f)
    }
}
