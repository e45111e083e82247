//! Node identifiers and node payloads.
//!
//! Node variants form a closed set: a `TreeNode` is either a plain `Node` or a
//! `DecoratedNode` that wraps a shared delegate with overrides.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::identity::TreeKind;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("Identifier for uid {uid} has {count} paths; a path must be chosen")]
    AmbiguousIdentifier { uid: u64, count: usize },

    #[error("Path {path} is not linked to uid {uid}")]
    PathNotFound { uid: u64, path: String },

    #[error("Node {0} is already decorated")]
    AlreadyDecorated(String),
}

pub type Result<T> = std::result::Result<T, NodeError>;

/// Uid of loading placeholder rows.
pub const LOADING_UID: u64 = 1;
/// Uid of inline error rows.
pub const ERROR_UID: u64 = 2;

/// Reference to a node reachable by exactly one path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinglePathIdentifier {
    pub tree_kind: TreeKind,
    pub uid: u64,
    pub path: String,
}

impl SinglePathIdentifier {
    pub fn new(tree_kind: TreeKind, uid: u64, path: impl Into<String>) -> Self {
        Self {
            tree_kind,
            uid,
            path: path.into(),
        }
    }
}

/// Remote-node reference as the backend reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeIdentifier {
    SinglePath(SinglePathIdentifier),
    #[serde(rename_all = "camelCase")]
    MultiPath {
        tree_kind: TreeKind,
        uid: u64,
        paths: Vec<String>,
    },
}

impl NodeIdentifier {
    pub fn uid(&self) -> u64 {
        match self {
            NodeIdentifier::SinglePath(spid) => spid.uid,
            NodeIdentifier::MultiPath { uid, .. } => *uid,
        }
    }

    pub fn tree_kind(&self) -> TreeKind {
        match self {
            NodeIdentifier::SinglePath(spid) => spid.tree_kind,
            NodeIdentifier::MultiPath { tree_kind, .. } => *tree_kind,
        }
    }

    pub fn paths(&self) -> Vec<&str> {
        match self {
            NodeIdentifier::SinglePath(spid) => vec![spid.path.as_str()],
            NodeIdentifier::MultiPath { paths, .. } => paths.iter().map(String::as_str).collect(),
        }
    }

    /// Narrows to a single path.
    ///
    /// `path` may be omitted only when the identifier has exactly one path.
    pub fn to_single_path(&self, path: Option<&str>) -> Result<SinglePathIdentifier> {
        match self {
            NodeIdentifier::SinglePath(spid) => match path {
                Some(p) if p != spid.path => Err(NodeError::PathNotFound {
                    uid: spid.uid,
                    path: p.to_string(),
                }),
                _ => Ok(spid.clone()),
            },
            NodeIdentifier::MultiPath {
                tree_kind,
                uid,
                paths,
            } => {
                let chosen = match path {
                    Some(p) => paths.iter().find(|candidate| candidate.as_str() == p).ok_or_else(
                        || NodeError::PathNotFound {
                            uid: *uid,
                            path: p.to_string(),
                        },
                    )?,
                    None if paths.len() == 1 => &paths[0],
                    None => {
                        return Err(NodeError::AmbiguousIdentifier {
                            uid: *uid,
                            count: paths.len(),
                        });
                    }
                };
                Ok(SinglePathIdentifier::new(*tree_kind, *uid, chosen.clone()))
            }
        }
    }
}

impl From<SinglePathIdentifier> for NodeIdentifier {
    fn from(spid: SinglePathIdentifier) -> Self {
        NodeIdentifier::SinglePath(spid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    File,
    Directory,
    Container,
    /// Placeholder and error rows; never backed by a remote object.
    Ephemeral,
}

/// Aggregate statistics for a directory, computed by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirStats {
    pub file_count: u64,
    pub dir_count: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub identifier: NodeIdentifier,
    pub name: String,
    pub kind: NodeKind,
    /// Whether the underlying object currently exists.
    #[serde(default = "default_live")]
    pub is_live: bool,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub modify_ts: Option<i64>,
    #[serde(default)]
    pub stats: Option<DirStats>,
}

fn default_live() -> bool {
    true
}

impl Node {
    pub fn new(identifier: impl Into<NodeIdentifier>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            identifier: identifier.into(),
            name: name.into(),
            kind,
            is_live: true,
            size_bytes: None,
            modify_ts: None,
            stats: None,
        }
    }

    pub fn file(identifier: impl Into<NodeIdentifier>, name: impl Into<String>, size_bytes: u64) -> Self {
        let mut node = Self::new(identifier, name, NodeKind::File);
        node.size_bytes = Some(size_bytes);
        node
    }

    pub fn dir(identifier: impl Into<NodeIdentifier>, name: impl Into<String>) -> Self {
        Self::new(identifier, name, NodeKind::Directory)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory | NodeKind::Container)
    }
}

/// A node shown under a different identity than its delegate's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecoratedNode {
    pub delegate: Arc<Node>,
    pub identifier: NodeIdentifier,
    #[serde(default)]
    pub name_override: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "camelCase")]
pub enum TreeNode {
    Plain(Node),
    Decorated(DecoratedNode),
}

impl TreeNode {
    /// Wraps this node under a new identifier.
    pub fn decorate(self, identifier: NodeIdentifier, name_override: Option<String>) -> Result<TreeNode> {
        match self {
            TreeNode::Plain(node) => Ok(TreeNode::Decorated(DecoratedNode {
                delegate: Arc::new(node),
                identifier,
                name_override,
            })),
            TreeNode::Decorated(deco) => Err(NodeError::AlreadyDecorated(deco.delegate.name.clone())),
        }
    }

    fn base(&self) -> &Node {
        match self {
            TreeNode::Plain(node) => node,
            TreeNode::Decorated(deco) => &deco.delegate,
        }
    }

    pub fn identifier(&self) -> &NodeIdentifier {
        match self {
            TreeNode::Plain(node) => &node.identifier,
            TreeNode::Decorated(deco) => &deco.identifier,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TreeNode::Plain(node) => &node.name,
            TreeNode::Decorated(deco) => deco.name_override.as_deref().unwrap_or(&deco.delegate.name),
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.base().kind
    }

    pub fn is_dir(&self) -> bool {
        self.base().is_dir()
    }

    pub fn is_live(&self) -> bool {
        self.base().is_live
    }

    pub fn is_ephemeral(&self) -> bool {
        self.base().kind == NodeKind::Ephemeral
    }

    /// Directories carry stats once the backend has computed them.
    pub fn has_stats(&self) -> bool {
        self.is_dir() && self.base().stats.is_some()
    }

    pub fn stats(&self) -> Option<&DirStats> {
        self.base().stats.as_ref()
    }

    pub fn size_bytes(&self) -> Option<u64> {
        match self.base().stats {
            Some(stats) => Some(stats.size_bytes),
            None => self.base().size_bytes,
        }
    }

    /// Replaces the directory stats. Returns false for non-directories.
    pub fn set_stats(&mut self, stats: DirStats) -> bool {
        if !self.is_dir() {
            return false;
        }
        match self {
            TreeNode::Plain(node) => node.stats = Some(stats),
            TreeNode::Decorated(deco) => Arc::make_mut(&mut deco.delegate).stats = Some(stats),
        }
        true
    }
}

impl From<Node> for TreeNode {
    fn from(node: Node) -> Self {
        TreeNode::Plain(node)
    }
}

/// A node as it sits in the display cache: the path it is shown under plus its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedNode {
    pub spid: SinglePathIdentifier,
    pub node: TreeNode,
}

impl CachedNode {
    pub fn new(spid: SinglePathIdentifier, node: impl Into<TreeNode>) -> Self {
        Self {
            spid,
            node: node.into(),
        }
    }

    /// Builds a cached node from a plain node reachable by one path.
    pub fn from_node(node: Node) -> Result<Self> {
        let spid = node.identifier.to_single_path(None)?;
        Ok(Self::new(spid, node))
    }

    /// Placeholder row shown under `parent` while its children load.
    pub fn loading_placeholder(parent: &SinglePathIdentifier) -> Self {
        Self::ephemeral(parent, LOADING_UID, "Loading...")
    }

    /// Inline error row shown under `parent` in place of its children.
    pub fn error_marker(parent: &SinglePathIdentifier, message: impl Into<String>) -> Self {
        Self::ephemeral(parent, ERROR_UID, message)
    }

    fn ephemeral(parent: &SinglePathIdentifier, uid: u64, name: impl Into<String>) -> Self {
        let path = format!("{:?}:{}:{}#{}", parent.tree_kind, parent.uid, parent.path, uid);
        let spid = SinglePathIdentifier::new(TreeKind::None, uid, path);
        let node = Node::new(spid.clone(), name, NodeKind::Ephemeral);
        Self::new(spid, node)
    }

    pub fn is_dir(&self) -> bool {
        self.node.is_dir()
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }
}
