//! Custom states engine: named, application-defined state slices.
//!
//! The set of names is fixed by configuration. States marked `persist` are
//! mirrored into a URL parameter of the same name and restored from it on
//! `initialize()`.

use crate::config::CustomStateConfig;
use crate::engine::lifecycle::Teardown;
use crate::error::{EngineError, Result};
use crate::navigation::{decode_state, encode_state, History};
use crate::store::Store;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Handle to the `custom_states` slice
#[derive(Debug, Clone)]
pub struct CustomStatesEngine {
    store: Store,
    definitions: Arc<BTreeMap<String, CustomStateConfig>>,
    /// Set when URL persistence is enabled
    history: Option<History>,
}

impl CustomStatesEngine {
    pub fn new(
        store: Store,
        definitions: BTreeMap<String, CustomStateConfig>,
        history: Option<History>,
    ) -> Self {
        store.set_state("custom_states/@@INIT", |state| {
            state.custom_states = definitions
                .iter()
                .map(|(name, def)| (name.clone(), def.initial_state.clone()))
                .collect();
        });
        Self {
            store,
            definitions: Arc::new(definitions),
            history,
        }
    }

    fn definition(&self, name: &str) -> Result<&CustomStateConfig> {
        self.definitions.get(name).ok_or_else(|| EngineError::Unknown {
            kind: "custom state",
            name: name.to_string(),
        })
    }

    /// Names of every configured state
    pub fn names(&self) -> Vec<String> {
        self.definitions.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Result<Value> {
        self.definition(name)?;
        Ok(self
            .store
            .with_state(|state| state.custom_states.get(name).cloned())
            .unwrap_or(Value::Null))
    }

    /// Replace the value of `name`
    pub fn update(&self, name: &str, value: Value) -> Result<()> {
        let definition = self.definition(name)?;
        let action = format!("custom_states/{}/update", name);
        self.store.set_state(&action, |state| {
            state.custom_states.insert(name.to_string(), value.clone());
        });

        if definition.persist {
            self.persist(name, &value);
        }
        Ok(())
    }

    /// Shallow-merge `partial` into an object state; non-objects are replaced
    pub fn merge(&self, name: &str, partial: Value) -> Result<()> {
        let merged = match (self.get(name)?, partial) {
            (Value::Object(mut current), Value::Object(partial)) => {
                current.extend(partial);
                Value::Object(current)
            }
            (_, partial) => partial,
        };
        self.update(name, merged)
    }

    /// Restore `name` to its configured initial value
    pub fn reset(&self, name: &str) -> Result<()> {
        let initial = self.definition(name)?.initial_state.clone();
        self.update(name, initial)
    }

    pub fn reset_all(&self) {
        for (name, definition) in self.definitions.iter() {
            if let Err(e) = self.update(name, definition.initial_state.clone()) {
                tracing::warn!("Failed to reset custom state '{}': {}", name, e);
            }
        }
    }

    fn persist(&self, name: &str, value: &Value) {
        let Some(history) = &self.history else {
            return;
        };
        match encode_state(value) {
            Ok(encoded) => {
                let location = history.location().with_search_param(name, &encoded);
                history.replace(location);
            }
            Err(e) => tracing::warn!("Failed to encode custom state '{}': {}", name, e),
        }
    }

    /// Restore persisted states from the URL. Malformed values keep the
    /// initial state.
    pub fn initialize(&self) -> Teardown {
        let Some(history) = &self.history else {
            return Teardown::noop("custom_states");
        };
        let location = history.location();

        let restored: Vec<(String, Value)> = self
            .definitions
            .iter()
            .filter(|(_, def)| def.persist)
            .filter_map(|(name, _)| {
                let raw = location.search_param(name)?;
                match decode_state::<Value>(&raw) {
                    Ok(value) => Some((name.clone(), value)),
                    Err(e) => {
                        tracing::warn!("Ignoring malformed persisted state '{}': {}", name, e);
                        None
                    }
                }
            })
            .collect();

        if !restored.is_empty() {
            self.store.set_state("custom_states/restore", |state| {
                state.custom_states.extend(restored);
            });
        }
        Teardown::noop("custom_states")
    }
}
