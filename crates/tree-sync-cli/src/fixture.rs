//! JSON tree fixtures for the in-memory backend.
//!
//! ```json
//! {
//!   "treeId": "review",
//!   "treeKind": "localDisk",
//!   "hasCheckboxes": true,
//!   "config": { "maxDisplayableChildren": 100 },
//!   "root": {
//!     "name": "repo",
//!     "children": [
//!       { "name": "src", "children": [ { "name": "main.rs", "size": 120 } ] },
//!       { "name": "README.md", "size": 10 }
//!     ]
//!   }
//! }
//! ```
//!
//! A node with a `children` array is a directory. UIDs are assigned
//! sequentially starting at 1 for the root.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tree_sync::{
    CachedNode, ControllerConfig, InMemoryBackend, Node, SinglePathIdentifier, TreeBinding, TreeKind,
};

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("Failed to read fixture {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid fixture JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Duplicate path in fixture: {0}")]
    DuplicatePath(String),

    #[error("Path not in fixture: {0}")]
    UnknownPath(String),

    #[error("Invalid node name {0:?}")]
    InvalidName(String),
}

pub type Result<T> = std::result::Result<T, FixtureError>;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureNode {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub children: Option<Vec<FixtureNode>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fixture {
    #[serde(default = "default_tree_id")]
    pub tree_id: String,
    #[serde(default = "default_tree_kind")]
    pub tree_kind: TreeKind,
    #[serde(default)]
    pub has_checkboxes: bool,
    #[serde(default)]
    pub config: Option<ControllerConfig>,
    pub root: FixtureNode,
}

fn default_tree_id() -> String {
    "fixture".to_string()
}

fn default_tree_kind() -> TreeKind {
    TreeKind::LocalDisk
}

/// A fixture after it has been loaded into a backend.
pub struct InstalledFixture {
    pub binding: TreeBinding,
    paths: HashMap<String, SinglePathIdentifier>,
}

impl InstalledFixture {
    pub fn root_path(&self) -> &str {
        &self.binding.root.spid.path
    }

    /// Resolves an absolute fixture path, or one relative to the root.
    pub fn resolve(&self, path: &str) -> Result<&SinglePathIdentifier> {
        let trimmed = path.trim_end_matches('/');
        let full = if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("{}/{}", self.root_path(), trimmed)
        };
        self.paths
            .get(&full)
            .ok_or_else(|| FixtureError::UnknownPath(path.to_string()))
    }

    /// `path` and the directories above it, top-down, excluding the root.
    pub fn lineage(&self, path: &str) -> Result<Vec<&SinglePathIdentifier>> {
        let target = self.resolve(path)?;
        let root = self.root_path();
        let relative = target.path.strip_prefix(root).unwrap_or(&target.path);

        let mut current = root.to_string();
        let mut out = Vec::new();
        for segment in relative.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            out.push(self.resolve(&current)?);
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl Fixture {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| FixtureError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Registers the tree with `backend` and returns the binding to show it.
    pub fn install(&self, backend: &InMemoryBackend) -> Result<InstalledFixture> {
        validate_name(&self.root.name)?;
        let mut next_uid = 1;
        let root_spid = SinglePathIdentifier::new(self.tree_kind, next_uid, format!("/{}", self.root.name));
        let root = CachedNode::new(root_spid.clone(), Node::dir(root_spid.clone(), &self.root.name));
        backend.add_tree(&self.tree_id, root.clone());

        let mut paths = HashMap::from([(root_spid.path.clone(), root_spid.clone())]);
        let mut stack = vec![(root_spid, &self.root)];
        while let Some((parent, node)) = stack.pop() {
            let Some(children) = &node.children else {
                continue;
            };
            let mut rows = Vec::with_capacity(children.len());
            for child in children {
                validate_name(&child.name)?;
                next_uid += 1;
                let spid = SinglePathIdentifier::new(
                    self.tree_kind,
                    next_uid,
                    format!("{}/{}", parent.path, child.name),
                );
                if paths.insert(spid.path.clone(), spid.clone()).is_some() {
                    return Err(FixtureError::DuplicatePath(spid.path));
                }
                let payload = match child.children {
                    Some(_) => Node::dir(spid.clone(), &child.name),
                    None => Node::file(spid.clone(), &child.name, child.size.unwrap_or(0)),
                };
                rows.push(CachedNode::new(spid.clone(), payload));
                stack.push((spid, child));
            }
            backend.set_children(&self.tree_id, &parent, rows);
        }

        Ok(InstalledFixture {
            binding: TreeBinding::new(self.tree_id.clone(), root, self.has_checkboxes),
            paths,
        })
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(FixtureError::InvalidName(name.to_string()));
    }
    Ok(())
}
