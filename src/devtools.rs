//! Debug registry of live engine stores.
//!
//! Engines configured with `devtool = true` register their store here under
//! the engine name so tooling can inspect state without holding the engine.
//! Registration only happens in debug builds; entries are weak and vanish
//! with the engine.

use crate::store::{Store, WeakStore};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};

fn registry() -> &'static Mutex<HashMap<String, WeakStore>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, WeakStore>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Whether registration is compiled in
pub fn enabled() -> bool {
    cfg!(debug_assertions)
}

/// Register `store` under its name, replacing any previous entry
pub fn register(store: &Store) {
    if !enabled() {
        return;
    }
    tracing::debug!("devtools: registered store '{}'", store.name());
    registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(store.name().to_string(), store.downgrade());
}

/// Remove the entry for `store`. An entry under the same name that belongs
/// to another store is left alone.
pub fn unregister(store: &Store) -> bool {
    let mut registry = registry().lock().unwrap_or_else(PoisonError::into_inner);
    match registry.get(store.name()) {
        Some(entry) if entry.is(store) => registry.remove(store.name()).is_some(),
        _ => false,
    }
}

/// The live store registered under `name`
pub fn inspect(name: &str) -> Option<Store> {
    let mut registry = registry().lock().unwrap_or_else(PoisonError::into_inner);
    let store = registry.get(name)?.upgrade();
    if store.is_none() {
        registry.remove(name);
    }
    store
}

/// Names of every registered store, sorted
pub fn registered() -> Vec<String> {
    let mut names: Vec<String> = registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .cloned()
        .collect();
    names.sort();
    names
}
