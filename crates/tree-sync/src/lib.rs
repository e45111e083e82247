//! tree-sync: client-side synchronization of a lazily loaded remote tree.
//!
//! This crate provides:
//! - Stable process-local GUIDs for backend nodes
//! - A display cache of the materialized part of a tree
//! - Tri-state checkbox tracking for change-review trees
//! - A signal bus for backend push notifications
//! - `TreeController`, which ties these together for one displayed tree
//! - The `Backend` trait plus an in-memory implementation

pub mod backend;
pub mod cache;
pub mod checkbox;
pub mod config;
pub mod controller;
pub mod events;
pub mod identity;
pub mod memory_backend;
pub mod node;

pub use backend::{Backend, BackendError, RowsOfInterest};
pub use cache::NodeCache;
pub use checkbox::{CheckState, CheckboxStateTracker};
pub use config::{ConfigError, ControllerConfig};
pub use controller::{
    ControllerError, LoadState, NullSurface, RenderSurface, TreeBinding, TreeController,
};
pub use events::{NodeChange, SenderFilter, Signal, SignalDispatcher, SignalKind, Subscription};
pub use identity::{Guid, IdentityMapper, TreeKind};
pub use memory_backend::InMemoryBackend;
pub use node::{
    CachedNode, DirStats, Node, NodeError, NodeIdentifier, NodeKind, SinglePathIdentifier, TreeNode,
};
