//! Visualizations engine: per-visualization view state.
//!
//! Each configured visualization has display `controls` (seeded from config,
//! optionally restored from local storage) and a `summary` derived from the
//! output of the last successful search.

use crate::config::VisualizationConfig;
use crate::engine::events::{EngineEvent, EventKind, EventsEngine};
use crate::engine::lifecycle::Teardown;
use crate::error::{EngineError, Result};
use crate::persistence::KeyValueStorage;
use crate::store::Store;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Counts derived from the last successful search
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualizationSummary {
    pub record_count: usize,
    pub group_count: usize,
}

/// State of one visualization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisualizationState {
    pub controls: Map<String, Value>,
    pub summary: VisualizationSummary,
}

/// Handle to the `visualizations` slice
#[derive(Clone)]
pub struct VisualizationsEngine {
    store: Store,
    events: EventsEngine,
    definitions: Arc<BTreeMap<String, VisualizationConfig>>,
    /// Set when persistence is enabled
    storage: Option<Arc<dyn KeyValueStorage>>,
}

impl VisualizationsEngine {
    pub fn new(
        store: Store,
        events: EventsEngine,
        definitions: BTreeMap<String, VisualizationConfig>,
        storage: Option<Arc<dyn KeyValueStorage>>,
    ) -> Self {
        store.set_state("visualizations/@@INIT", |state| {
            state.visualizations = definitions
                .iter()
                .map(|(name, def)| {
                    (
                        name.clone(),
                        VisualizationState {
                            controls: def.controls.clone(),
                            summary: VisualizationSummary::default(),
                        },
                    )
                })
                .collect();
        });
        Self {
            store,
            events,
            definitions: Arc::new(definitions),
            storage,
        }
    }

    fn definition(&self, visualization: &str) -> Result<&VisualizationConfig> {
        self.definitions
            .get(visualization)
            .ok_or_else(|| EngineError::Unknown {
                kind: "visualization",
                name: visualization.to_string(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.definitions.keys().cloned().collect()
    }

    pub fn get(&self, visualization: &str) -> Result<VisualizationState> {
        self.definition(visualization)?;
        Ok(self
            .store
            .with_state(|state| state.visualizations.get(visualization).cloned())
            .unwrap_or_default())
    }

    /// Set one display control
    pub fn update_control(&self, visualization: &str, key: &str, value: Value) -> Result<()> {
        self.definition(visualization)?;
        let action = format!("visualizations/{}/update_control", visualization);
        self.store.set_state(&action, |state| {
            state
                .visualizations
                .entry(visualization.to_string())
                .or_default()
                .controls
                .insert(key.to_string(), value);
        });
        Ok(())
    }

    /// Restore the configured controls of `visualization`
    pub fn reset(&self, visualization: &str) -> Result<()> {
        let controls = self.definition(visualization)?.controls.clone();
        let action = format!("visualizations/{}/reset", visualization);
        self.store.set_state(&action, |state| {
            state
                .visualizations
                .entry(visualization.to_string())
                .or_default()
                .controls = controls;
        });
        Ok(())
    }

    fn storage_key(namespace: &str, visualization: &str) -> String {
        format!("{}.visualizations.{}", namespace, visualization)
    }

    fn restore(&self, storage: &dyn KeyValueStorage, namespace: &str) {
        let mut restored = Vec::new();
        for name in self.definitions.keys() {
            let key = Self::storage_key(namespace, name);
            match storage.get(&key) {
                Ok(Some(raw)) => match serde_json::from_str::<Map<String, Value>>(&raw) {
                    Ok(controls) => restored.push((name.clone(), controls)),
                    Err(e) => tracing::warn!("Ignoring malformed controls for '{}': {}", name, e),
                },
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to read controls for '{}': {}", name, e),
            }
        }

        if !restored.is_empty() {
            self.store.set_state("visualizations/restore", |state| {
                for (name, controls) in restored {
                    state.visualizations.entry(name).or_default().controls.extend(controls);
                }
            });
        }
    }

    fn flush(store: &Store, storage: &dyn KeyValueStorage, namespace: &str) {
        let visualizations = store.with_state(|state| state.visualizations.clone());
        for (name, vis) in visualizations {
            let key = Self::storage_key(namespace, &name);
            let result = serde_json::to_string(&vis.controls)
                .map_err(EngineError::from)
                .and_then(|raw| storage.set(&key, &raw));
            if let Err(e) = result {
                tracing::warn!("Failed to persist controls for '{}': {}", name, e);
            }
        }
    }

    /// Restore persisted controls under the `namespace` storage prefix, keep
    /// summaries in sync with search results and reset controls on request.
    /// The teardown flushes the final controls back to storage.
    pub fn initialize(&self, namespace: &str) -> Teardown {
        if let Some(storage) = &self.storage {
            self.restore(storage.as_ref(), namespace);
        }

        let store = self.store.clone();
        let finished = self.events.subscribe(EventKind::PipelineFinished, move |event| {
            if let EngineEvent::PipelineFinished {
                record_count,
                group_count,
                ..
            } = event
            {
                let summary = VisualizationSummary {
                    record_count: *record_count,
                    group_count: *group_count,
                };
                store.set_state("visualizations/summary", |state| {
                    for vis in state.visualizations.values_mut() {
                        vis.summary = summary;
                    }
                });
            }
        });

        let engine = self.clone();
        let reset = self.events.subscribe(EventKind::ResetRequested, move |_| {
            for name in engine.names() {
                let _ = engine.reset(&name);
            }
        });

        let events = self.events.clone();
        let store = self.store.clone();
        let storage = self.storage.clone();
        let namespace = namespace.to_string();
        Teardown::new("visualizations", move || {
            events.unsubscribe(finished);
            events.unsubscribe(reset);
            if let Some(storage) = storage {
                Self::flush(&store, storage.as_ref(), &namespace);
            }
        })
    }
}

impl std::fmt::Debug for VisualizationsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisualizationsEngine")
            .field("visualizations", &self.names())
            .field("persistent", &self.storage.is_some())
            .finish()
    }
}
