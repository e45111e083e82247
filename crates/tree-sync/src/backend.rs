//! Backend trait abstraction: the process that owns the real tree.
//!
//! Implementations:
//! - `InMemoryBackend` - For testing and the fixture inspector
//! - RPC clients live outside this crate

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::identity::Guid;
use crate::node::{CachedNode, SinglePathIdentifier};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// More children than the caller is willing to display. Not a fault.
    #[error("Too many results: {actual}")]
    TooManyResults { actual: u32 },

    #[error("Tree not found: {0}")]
    TreeNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Rows the backend remembers as expanded or selected for a tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowsOfInterest {
    pub expanded: HashSet<Guid>,
    pub selected: HashSet<Guid>,
}

/// What the sync engine needs from the backend.
///
/// Calls may block on I/O for as long as the backend likes; the engine
/// applies no timeouts of its own.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Begins an asynchronous load of the tree. Progress arrives as
    /// `TreeLoadStateUpdated` signals.
    async fn start_subtree_load(&self, tree_id: &str) -> Result<()>;

    /// Children of `parent`, or `TooManyResults` when there are more than `max_results`.
    async fn get_children(
        &self,
        parent: &SinglePathIdentifier,
        tree_id: &str,
        max_results: Option<u32>,
    ) -> Result<Vec<CachedNode>>;

    async fn get_rows_of_interest(&self, tree_id: &str) -> Result<RowsOfInterest>;

    async fn set_selected_rows(&self, selected: &HashSet<Guid>, tree_id: &str) -> Result<()>;

    async fn add_expanded_row(&self, row: Guid, tree_id: &str) -> Result<()>;

    async fn remove_expanded_row(&self, row: Guid, tree_id: &str) -> Result<()>;
}

// Allows a backend to be shared between controllers and the test driving it.
#[async_trait]
impl<T: Backend + ?Sized> Backend for Arc<T> {
    async fn start_subtree_load(&self, tree_id: &str) -> Result<()> {
        (**self).start_subtree_load(tree_id).await
    }

    async fn get_children(
        &self,
        parent: &SinglePathIdentifier,
        tree_id: &str,
        max_results: Option<u32>,
    ) -> Result<Vec<CachedNode>> {
        (**self).get_children(parent, tree_id, max_results).await
    }

    async fn get_rows_of_interest(&self, tree_id: &str) -> Result<RowsOfInterest> {
        (**self).get_rows_of_interest(tree_id).await
    }

    async fn set_selected_rows(&self, selected: &HashSet<Guid>, tree_id: &str) -> Result<()> {
        (**self).set_selected_rows(selected, tree_id).await
    }

    async fn add_expanded_row(&self, row: Guid, tree_id: &str) -> Result<()> {
        (**self).add_expanded_row(row, tree_id).await
    }

    async fn remove_expanded_row(&self, row: Guid, tree_id: &str) -> Result<()> {
        (**self).remove_expanded_row(row, tree_id).await
    }
}
