//! Grouping sub-engine: grouping slot state and its URL persistence.

use crate::engine::events::{EngineEvent, EventsEngine};
use crate::engine::lifecycle::Teardown;
use crate::error::{EngineError, Result};
use crate::navigation::{decode_state, encode_state, History, NavigationAction};
use crate::pipeline::{GroupingSlot, GroupingSpec};
use crate::store::Store;
use std::collections::BTreeSet;
use std::sync::Arc;

/// URL parameter holding the grouping spec
pub const GROUPINGS_PARAM: &str = "groupings";

/// `groupings` slice
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupingsState {
    pub spec: GroupingSpec,
}

pub fn encode_grouping_spec(spec: &GroupingSpec) -> Result<String> {
    encode_state(spec)
}

pub fn decode_grouping_spec(raw: &str) -> Result<GroupingSpec> {
    decode_state(raw)
}

/// Handle to the `groupings` slice
#[derive(Debug, Clone)]
pub struct GroupingsEngine {
    store: Store,
    events: EventsEngine,
    history: Option<History>,
    /// Configured slots; empty accepts any slot name
    known_slots: Arc<BTreeSet<String>>,
    default_spec: GroupingSpec,
}

impl GroupingsEngine {
    pub fn new(
        store: Store,
        events: EventsEngine,
        history: Option<History>,
        known_slots: BTreeSet<String>,
        default_spec: GroupingSpec,
    ) -> Self {
        let initial = default_spec.clone();
        store.set_state("groupings/@@INIT", |state| {
            state.groupings = GroupingsState { spec: initial };
        });
        Self {
            store,
            events,
            history,
            known_slots: Arc::new(known_slots),
            default_spec,
        }
    }

    pub fn spec(&self) -> GroupingSpec {
        self.store.with_state(|state| state.groupings.spec.clone())
    }

    fn check_slot(&self, slot: &str) -> Result<()> {
        if self.known_slots.is_empty() || self.known_slots.contains(slot) {
            Ok(())
        } else {
            Err(EngineError::Unknown {
                kind: "grouping slot",
                name: slot.to_string(),
            })
        }
    }

    fn write_spec(&self, action: &str, spec: GroupingSpec, persist: bool) {
        if persist {
            self.persist(&spec);
        }
        self.store
            .set_state(action, |state| state.groupings.spec = spec);
        self.events.fire(EngineEvent::GroupingsChanged);
    }

    fn persist(&self, spec: &GroupingSpec) {
        let Some(history) = &self.history else {
            return;
        };
        match encode_grouping_spec(spec) {
            Ok(encoded) => {
                let location = history
                    .location()
                    .with_search_param(GROUPINGS_PARAM, &encoded);
                history.replace(location);
            }
            Err(e) => tracing::warn!("Failed to encode grouping spec: {}", e),
        }
    }

    /// Set the fields grouped by in `slot`
    pub fn update_slot<I, S>(&self, slot: &str, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.check_slot(slot)?;
        let mut spec = self.spec();
        spec.slots
            .insert(slot.to_string(), GroupingSlot::new(fields));
        self.write_spec("groupings/update_slot", spec, true);
        Ok(())
    }

    /// Replace the whole spec; every slot must be known
    pub fn set_spec(&self, spec: GroupingSpec) -> Result<()> {
        for slot in spec.slots.keys() {
            self.check_slot(slot)?;
        }
        self.write_spec("groupings/set_spec", spec, true);
        Ok(())
    }

    pub fn reset(&self) {
        self.write_spec("groupings/reset", self.default_spec.clone(), true);
    }

    fn spec_from_url(history: &History) -> Option<GroupingSpec> {
        let raw = history.location().search_param(GROUPINGS_PARAM)?;
        match decode_grouping_spec(&raw) {
            Ok(spec) => Some(spec),
            Err(e) => {
                tracing::warn!("Ignoring malformed persisted groupings: {}", e);
                None
            }
        }
    }

    /// Replay the persisted spec and follow back/forward navigation.
    pub fn initialize(&self) -> Teardown {
        let Some(history) = self.history.clone() else {
            return Teardown::noop("groupings");
        };

        if let Some(spec) = Self::spec_from_url(&history) {
            if spec.slots.keys().all(|slot| self.check_slot(slot).is_ok()) {
                self.store
                    .set_state("groupings/restore", |state| state.groupings.spec = spec);
            } else {
                tracing::warn!("Ignoring persisted groupings with unknown slots");
            }
        }

        let engine = self.clone();
        let listener = history.listen(move |update| {
            if update.action != NavigationAction::Pop {
                return;
            }
            let Some(history) = &engine.history else {
                return;
            };
            let spec = Self::spec_from_url(history).unwrap_or_else(|| engine.default_spec.clone());
            if spec != engine.spec() {
                engine.write_spec("groupings/pop", spec, false);
            }
        });

        Teardown::new("groupings", move || history.unlisten(listener))
    }
}
