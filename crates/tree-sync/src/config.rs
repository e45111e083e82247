use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_DISPLAYABLE_CHILDREN: u32 = 2000;
pub const DEFAULT_LISTENER_PREFIX: &str = "tree-controller";

/// Tunables for a `TreeController`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Directories with more children than this show a single marker row instead.
    #[serde(default = "default_max_displayable_children")]
    pub max_displayable_children: u32,
    /// Listener ids on the bus are `{prefix}:{tree_id}`.
    #[serde(default = "default_listener_prefix")]
    pub listener_prefix: String,
}

fn default_max_displayable_children() -> u32 {
    DEFAULT_MAX_DISPLAYABLE_CHILDREN
}

fn default_listener_prefix() -> String {
    DEFAULT_LISTENER_PREFIX.to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_displayable_children: default_max_displayable_children(),
            listener_prefix: default_listener_prefix(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional environment variables:
    /// - `TREESYNC_MAX_CHILDREN`: display cap per directory (positive integer)
    /// - `TREESYNC_LISTENER_PREFIX`: prefix for bus listener ids
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup("TREESYNC_MAX_CHILDREN") {
            let value = raw.trim().parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                key: "TREESYNC_MAX_CHILDREN",
                value: raw.clone(),
            })?;
            if value == 0 {
                return Err(ConfigError::ZeroLimit);
            }
            config.max_displayable_children = value;
        }

        if let Some(prefix) = lookup("TREESYNC_LISTENER_PREFIX") {
            if !prefix.is_empty() {
                config.listener_prefix = prefix;
            }
        }

        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Maximum displayable children must be at least 1")]
    ZeroLimit,
}
