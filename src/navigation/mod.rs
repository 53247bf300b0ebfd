//! In-memory browser-history model.
//!
//! The explorer persists its query, grouping and custom state into the URL's
//! query string. [`History`] is the seam through which that happens: a stack
//! of [`Location`]s with push / replace / back and listeners that are told
//! about every navigation.

use crate::id::SubscriptionId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use url::form_urlencoded;

/// Path plus query string (`search` keeps its leading `?` when non-empty)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Location {
    pub pathname: String,
    pub search: String,
}

impl Location {
    /// Parse `"/path?query"`
    pub fn parse(href: &str) -> Self {
        match href.split_once('?') {
            Some((path, query)) if !query.is_empty() => Self {
                pathname: path.to_string(),
                search: format!("?{}", query),
            },
            Some((path, _)) => Self {
                pathname: path.to_string(),
                search: String::new(),
            },
            None => Self {
                pathname: href.to_string(),
                search: String::new(),
            },
        }
    }

    /// Path and query string joined
    pub fn href(&self) -> String {
        format!("{}{}", self.pathname, self.search)
    }

    fn pairs(&self) -> Vec<(String, String)> {
        form_urlencoded::parse(self.search.trim_start_matches('?').as_bytes())
            .into_owned()
            .collect()
    }

    /// Decoded value of query parameter `name`
    pub fn search_param(&self, name: &str) -> Option<String> {
        self.pairs()
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Copy of this location with `name` set to `value` (other params kept in order)
    pub fn with_search_param(&self, name: &str, value: &str) -> Self {
        let mut pairs = self.pairs();
        match pairs.iter_mut().find(|(key, _)| key == name) {
            Some(pair) => pair.1 = value.to_string(),
            None => pairs.push((name.to_string(), value.to_string())),
        }

        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        Self {
            pathname: self.pathname.clone(),
            search: if query.is_empty() {
                String::new()
            } else {
                format!("?{}", query)
            },
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.href())
    }
}

/// How a location was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationAction {
    Push,
    Replace,
    Pop,
}

/// Delivered to history listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationUpdate {
    pub location: Location,
    pub action: NavigationAction,
}

type HistoryListener = Arc<dyn Fn(&NavigationUpdate) + Send + Sync>;

struct HistoryInner {
    entries: Vec<Location>,
    index: usize,
    listeners: Vec<(SubscriptionId, HistoryListener)>,
}

/// Shared navigation stack. Cloning shares the same history.
#[derive(Clone)]
pub struct History {
    inner: Arc<Mutex<HistoryInner>>,
    next_listener: Arc<AtomicU64>,
}

impl Default for History {
    fn default() -> Self {
        Self::new(Location::parse("/"))
    }
}

impl History {
    pub fn new(initial: Location) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HistoryInner {
                entries: vec![initial],
                index: 0,
                listeners: Vec::new(),
            })),
            next_listener: Arc::new(AtomicU64::new(1)),
        }
    }

    /// History starting at `href` (e.g. `"/metrics?query=..."`)
    pub fn at(href: &str) -> Self {
        Self::new(Location::parse(href))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HistoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn location(&self) -> Location {
        let inner = self.lock();
        inner.entries[inner.index].clone()
    }

    /// Number of entries on the stack
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Add an entry, discarding any forward entries
    pub fn push(&self, location: Location) {
        self.navigate(NavigationAction::Push, |inner| {
            inner.entries.truncate(inner.index + 1);
            inner.entries.push(location);
            inner.index = inner.entries.len() - 1;
            true
        });
    }

    /// Overwrite the current entry
    pub fn replace(&self, location: Location) {
        self.navigate(NavigationAction::Replace, |inner| {
            let index = inner.index;
            inner.entries[index] = location;
            true
        });
    }

    /// Step back one entry; returns `false` at the start of the stack
    pub fn back(&self) -> bool {
        self.navigate(NavigationAction::Pop, |inner| {
            if inner.index == 0 {
                return false;
            }
            inner.index -= 1;
            true
        })
    }

    /// Step forward one entry; returns `false` at the end of the stack
    pub fn forward(&self) -> bool {
        self.navigate(NavigationAction::Pop, |inner| {
            if inner.index + 1 >= inner.entries.len() {
                return false;
            }
            inner.index += 1;
            true
        })
    }

    /// Push or replace depending on `replace`
    pub fn update(&self, location: Location, replace: bool) {
        if replace {
            self.replace(location);
        } else {
            self.push(location);
        }
    }

    fn navigate(&self, action: NavigationAction, f: impl FnOnce(&mut HistoryInner) -> bool) -> bool {
        let (update, listeners) = {
            let mut inner = self.lock();
            if !f(&mut inner) {
                return false;
            }
            let update = NavigationUpdate {
                location: inner.entries[inner.index].clone(),
                action,
            };
            let listeners: Vec<HistoryListener> =
                inner.listeners.iter().map(|(_, l)| l.clone()).collect();
            (update, listeners)
        };

        tracing::trace!("navigation {:?} → {}", update.action, update.location);
        for listener in listeners {
            listener(&update);
        }
        true
    }

    /// Register a navigation listener
    pub fn listen<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&NavigationUpdate) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.lock().listeners.push((id, Arc::new(listener)));
        id
    }

    pub fn unlisten(&self, id: SubscriptionId) {
        self.lock().listeners.retain(|(existing, _)| *existing != id);
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }
}

impl fmt::Debug for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("History")
            .field("entries", &inner.entries)
            .field("index", &inner.index)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

/// Serialize a value for a URL parameter (JSON; percent-encoding happens when
/// the parameter is written)
pub fn encode_state<T: Serialize>(value: &T) -> crate::error::Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Inverse of [`encode_state`]
pub fn decode_state<T: DeserializeOwned>(raw: &str) -> crate::error::Result<T> {
    Ok(serde_json::from_str(raw)?)
}
