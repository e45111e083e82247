//! tree-sync-cli library: the fixture loader and inspector behind `treesync`.
//!
//! Kept separate from `main.rs` so tests can drive the inspector directly.

pub mod fixture;
pub mod inspect;

pub use fixture::{Fixture, FixtureError, FixtureNode, InstalledFixture};
pub use inspect::{InspectError, Inspector, Report};
