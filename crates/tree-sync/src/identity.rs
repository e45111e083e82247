//! Process-local node identity.
//!
//! Every `(tree kind, path, uid)` triple seen from the backend maps to a `Guid`.
//! Local-disk trees are 1:1 between paths and uids, so their GUID is just the
//! uid. Everything else gets a negative GUID minted from a shared counter; the
//! mapping lives for the rest of the process. Local-disk uids that cannot be
//! used directly (0, or above `i64::MAX`) are minted too.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Mutex;
use tracing::debug;

use crate::node::SinglePathIdentifier;

/// Which backend tree a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TreeKind {
    /// Synthetic rows (loading placeholders, error markers).
    None,
    /// Containers that aggregate nodes from several trees.
    Mixed,
    /// Local filesystem. Exactly one path per uid.
    LocalDisk,
    /// Remote storage where the same uid may be linked under several paths.
    RemoteStorage,
}

impl TreeKind {
    /// True when a uid can never appear under more than one path.
    pub fn is_one_to_one(&self) -> bool {
        matches!(self, TreeKind::LocalDisk)
    }
}

/// Process-local stable identity for a node.
///
/// Positive values are local-disk uids, negative values are minted,
/// zero is reserved for the virtual root's parent key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Guid(i64);

impl Guid {
    /// Parent key of the top-level rows.
    pub const NULL: Guid = Guid(0);

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<i64> for Guid {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct MapperState {
    next: i64,
    ids: HashMap<(TreeKind, u64, String), Guid>,
}

/// Assigns GUIDs. Shared between controllers behind an `Arc`.
pub struct IdentityMapper {
    state: Mutex<MapperState>,
}

impl Default for IdentityMapper {
    fn default() -> Self {
        Self {
            state: Mutex::new(MapperState {
                next: -1,
                ids: HashMap::new(),
            }),
        }
    }
}

impl IdentityMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the GUID for a node, minting one on first sight.
    pub fn guid_for(&self, tree_kind: TreeKind, path: &str, uid: u64) -> Guid {
        if tree_kind.is_one_to_one() {
            match i64::try_from(uid) {
                Ok(value) if value > 0 => return Guid(value),
                _ => debug!(uid, path, "Local uid outside the direct GUID range"),
            }
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let key = (tree_kind, uid, path.to_string());
        if let Some(guid) = state.ids.get(&key) {
            return *guid;
        }

        let guid = Guid(state.next);
        state.next -= 1;
        state.ids.insert(key, guid);
        guid
    }

    pub fn guid_for_spid(&self, spid: &SinglePathIdentifier) -> Guid {
        self.guid_for(spid.tree_kind, &spid.path, spid.uid)
    }

    /// Number of GUIDs minted so far.
    pub fn minted_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ids
            .len()
    }
}
