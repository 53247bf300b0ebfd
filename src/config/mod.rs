//! Configuration module for the explorer engine
//!
//! An [`ExplorerConfig`] describes one explorer instance: which sequence type
//! it works on, whether it persists its state into the URL and local storage,
//! pipeline cache policy, grouping slots, visualizations and custom states.
//!
//! Configs are loaded from TOML (`.toml`) or JSON (anything else) files.
//!
//! # App Data Location
//!
//! Local storage and other engine files live in the platform-appropriate
//! location:
//! - **Linux**: `~/.local/share/dev.explorer-engine/`
//! - **macOS**: `~/Library/Application Support/dev.explorer-engine/`
//! - **Windows**: `%APPDATA%\dev.explorer-engine\`
//!
//! # Example
//!
//! ```toml
//! name = "metrics"
//! sequence_type = "metric"
//! base_path = "/metrics"
//! persist = true
//!
//! [stage_cache]
//! custom = false
//!
//! [groupings.color]
//! default_fields = ["run.hash"]
//!
//! [visualizations.main.controls]
//! smoothing = 0.6
//!
//! [states.sidebar]
//! initial_state = { open = true }
//! persist = true
//! ```

use crate::engine::explorer::QuerySpec;
use crate::error::{EngineError, Result};
use crate::pipeline::{
    AdapterOptions, GroupingSpec, PipelineOptions, StageOptions, DEFAULT_OBJECT_DEPTH,
};
use crate::types::SequenceType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Application identifier for data directories
pub const APP_ID: &str = "dev.explorer-engine";

/// Engine name used when the config does not set one
pub const DEFAULT_ENGINE_NAME: &str = "ExplorerEngine";

/// URL parameter names owned by the query and grouping engines
pub const RESERVED_PARAMS: [&str; 2] = ["query", "groupings"];

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir().ok_or_else(|| {
        EngineError::Configuration("Could not determine app data directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            EngineError::Configuration(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

// ==================== Sections ====================

/// Per-stage cache overrides; unset stages follow `enable_pipeline_cache`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageCacheOverrides {
    pub adapter: Option<bool>,
    pub grouping: Option<bool>,
    pub query: Option<bool>,
    pub custom: Option<bool>,
}

/// Adapter stage settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub object_depth: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            object_depth: DEFAULT_OBJECT_DEPTH,
        }
    }
}

/// One grouping slot offered by the explorer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingSlotConfig {
    /// Fields the slot groups by before the user changes anything
    pub default_fields: Vec<String>,
}

/// One visualization rendered by the explorer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizationConfig {
    /// Initial display controls
    pub controls: Map<String, Value>,
}

/// One custom state slice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomStateConfig {
    pub initial_state: Value,
    /// Mirror the state into a URL parameter named after it
    pub persist: bool,
}

/// Initial query/grouping specs used when nothing is persisted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialStateConfig {
    pub query: Option<QuerySpec>,
    pub groupings: Option<GroupingSpec>,
}

// ==================== Explorer Config ====================

/// Configuration of one explorer engine instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorerConfig {
    /// Engine name (store name, devtools key)
    pub name: String,
    pub sequence_type: SequenceType,
    /// Route of the explorer; prefix of the persisted navigation key
    pub base_path: Option<String>,
    /// Persist query/grouping/custom state into the URL and local storage
    pub persist: bool,
    pub enable_pipeline_cache: bool,
    pub stage_cache: StageCacheOverrides,
    pub adapter: AdapterConfig,
    pub groupings: BTreeMap<String, GroupingSlotConfig>,
    pub visualizations: BTreeMap<String, VisualizationConfig>,
    pub states: BTreeMap<String, CustomStateConfig>,
    pub initial_state: InitialStateConfig,
    /// Register the store with the devtools registry (debug builds only)
    pub devtool: bool,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_ENGINE_NAME.to_string(),
            sequence_type: SequenceType::Metric,
            base_path: None,
            persist: false,
            enable_pipeline_cache: true,
            stage_cache: StageCacheOverrides::default(),
            adapter: AdapterConfig::default(),
            groupings: BTreeMap::new(),
            visualizations: BTreeMap::new(),
            states: BTreeMap::new(),
            initial_state: InitialStateConfig::default(),
            devtool: false,
        }
    }
}

impl ExplorerConfig {
    /// Load a config file (TOML when the extension is `.toml`, JSON otherwise)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        if is_toml(path) {
            toml::from_str(&content).map_err(|e| {
                EngineError::Configuration(format!("Failed to parse config file {:?}: {}", path, e))
            })
        } else {
            serde_json::from_str(&content).map_err(|e| {
                EngineError::Configuration(format!("Failed to parse config file {:?}: {}", path, e))
            })
        }
    }

    /// Load a config file, returning defaults if any error occurs
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load explorer config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config (format chosen by extension like [`ExplorerConfig::load`])
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Configuration(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = if is_toml(path) {
            toml::to_string_pretty(self).map_err(|e| {
                EngineError::Configuration(format!("Failed to serialize config: {}", e))
            })?
        } else {
            serde_json::to_string_pretty(self)?
        };

        std::fs::write(path, content).map_err(|e| {
            EngineError::Configuration(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Builder method to enable persistence under `base_path`
    pub fn with_persistence(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = Some(base_path.into());
        self.persist = true;
        self
    }

    /// Check the config for errors that make initialization impossible
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Configuration(
                "engine name must not be empty".to_string(),
            ));
        }

        if self.persist && self.base_path.is_none() {
            return Err(EngineError::Configuration(
                "persistence is enabled but no base path is configured".to_string(),
            ));
        }

        if let Some(reserved) = self
            .states
            .keys()
            .find(|name| RESERVED_PARAMS.contains(&name.as_str()))
        {
            return Err(EngineError::Configuration(format!(
                "custom state name '{}' is reserved",
                reserved
            )));
        }

        if let Some(initial) = &self.initial_state.groupings {
            if !self.groupings.is_empty() {
                if let Some(unknown) = initial
                    .slots
                    .keys()
                    .find(|slot| !self.groupings.contains_key(*slot))
                {
                    return Err(EngineError::Configuration(format!(
                        "initial grouping uses unknown slot '{}'",
                        unknown
                    )));
                }
            }
        }

        Ok(())
    }

    /// Stage descriptor derived from the cache settings
    pub fn pipeline_options(&self) -> PipelineOptions {
        let global = self.enable_pipeline_cache;
        PipelineOptions {
            adapter: AdapterOptions {
                object_depth: self.adapter.object_depth,
                use_cache: self.stage_cache.adapter.unwrap_or(global),
            },
            grouping: StageOptions {
                use_cache: self.stage_cache.grouping.unwrap_or(global),
            },
            query: StageOptions {
                use_cache: self.stage_cache.query.unwrap_or(global),
            },
            custom: StageOptions {
                use_cache: self.stage_cache.custom.unwrap_or(global),
            },
        }
    }

    /// Grouping spec used before anything is persisted or changed
    pub fn default_grouping_spec(&self) -> GroupingSpec {
        if let Some(initial) = &self.initial_state.groupings {
            return initial.clone();
        }
        self.groupings
            .iter()
            .fold(GroupingSpec::default(), |spec, (slot, config)| {
                spec.with_slot(slot.clone(), config.default_fields.iter().cloned())
            })
    }

    /// Query spec used before anything is persisted or changed
    pub fn default_query_spec(&self) -> QuerySpec {
        self.initial_state.query.clone().unwrap_or_default()
    }

    /// Local storage key holding the last visited URL of this explorer
    pub fn url_storage_key(&self) -> Option<String> {
        self.base_path.as_ref().map(|base| format!("{}Url", base))
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "toml")
}
