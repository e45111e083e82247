//! Drives a controller over an installed fixture and renders what it shows.

use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;
use tree_sync::{
    CheckState, ControllerConfig, ControllerError, Guid, IdentityMapper, InMemoryBackend,
    NullSurface, SignalDispatcher, TreeController,
};

use crate::fixture::{Fixture, FixtureError, InstalledFixture};

#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error(transparent)]
    Fixture(#[from] FixtureError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("Not a directory: {0}")]
    NotADirectory(String),
}

pub type Result<T> = std::result::Result<T, InspectError>;

/// What the inspector saw after the requested actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Indented outline of the cached rows.
    pub view: String,
    /// Paths of the checked change set; empty when the tree has no checkboxes.
    pub checked: Vec<String>,
}

pub struct Inspector {
    fixture: InstalledFixture,
    mapper: Arc<IdentityMapper>,
    controller: TreeController<Arc<InMemoryBackend>>,
}

impl Inspector {
    /// Installs `fixture` into a fresh backend and loads it.
    pub async fn load(fixture: &Fixture, config: ControllerConfig) -> Result<Self> {
        let bus = Arc::new(SignalDispatcher::new());
        let backend = Arc::new(InMemoryBackend::new(Arc::clone(&bus)));
        let installed = fixture.install(&backend)?;
        let mapper = Arc::new(IdentityMapper::new());

        let controller = TreeController::new(
            installed.binding.clone(),
            backend,
            bus,
            Arc::clone(&mapper),
            Arc::new(NullSurface),
            config,
        );
        controller.request_load().await;
        controller.process_pending_signals().await;
        info!(tree_id = %installed.binding.tree_id, rows = controller.child_count(Guid::NULL), "Loaded fixture");

        Ok(Self {
            fixture: installed,
            mapper,
            controller,
        })
    }

    /// Expands `path` and every directory above it.
    pub async fn expand(&self, path: &str) -> Result<()> {
        for spid in self.fixture.lineage(path)? {
            let guid = self.mapper.guid_for_spid(spid);
            if !self.controller.is_expandable(guid) {
                return Err(InspectError::NotADirectory(spid.path.clone()));
            }
            if !self.controller.is_expanded(guid) {
                self.controller.expand(guid).await;
            }
        }
        self.controller.process_pending_signals().await;
        Ok(())
    }

    /// Checks `path`, expanding its parents so the row is visible.
    pub async fn check(&self, path: &str) -> Result<()> {
        let lineage = self.fixture.lineage(path)?;
        let Some((target, parents)) = lineage.split_last() else {
            return Err(FixtureError::UnknownPath(path.to_string()).into());
        };
        for spid in parents {
            let guid = self.mapper.guid_for_spid(spid);
            if !self.controller.is_expanded(guid) {
                self.controller.expand(guid).await;
            }
        }
        let guid = self.mapper.guid_for_spid(target);
        self.controller.toggle_checkbox(guid, true).await?;
        self.controller.process_pending_signals().await;
        Ok(())
    }

    pub async fn report(&self) -> Result<Report> {
        let mut view = String::new();
        let _ = writeln!(view, "{}", self.fixture.root_path());
        self.render(Guid::NULL, 1, &mut view);

        let checked = if self.fixture.binding.has_checkboxes {
            self.controller
                .collect_checked_subset()
                .await?
                .into_iter()
                .map(|spid| spid.path)
                .collect()
        } else {
            Vec::new()
        };
        Ok(Report { view, checked })
    }

    fn render(&self, parent: Guid, depth: usize, out: &mut String) {
        for row in self.controller.children(parent) {
            let guid = self.controller.guid_of(&row);
            let marker = match self.controller.checkbox_state(guid) {
                Some(CheckState::Checked) => "[x] ",
                Some(CheckState::Mixed) => "[-] ",
                Some(CheckState::Unchecked) => "[ ] ",
                None => "",
            };
            let suffix = if row.is_dir() { "/" } else { "" };
            let _ = writeln!(out, "{}{}{}{}", "  ".repeat(depth), marker, row.name(), suffix);
            self.render(guid, depth + 1, out);
        }
    }
}
