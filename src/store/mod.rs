//! Shared observable state container.
//!
//! A [`Store`] owns one [`ExplorerState`] and the listeners observing it.
//! State is kept as an immutable snapshot behind an `Arc`: readers get a
//! cheap clone of the current snapshot, writers go through
//! [`Store::set_state`], which applies the change, bumps the version and then
//! notifies listeners with the new snapshot after every lock is released.
//! Listeners may therefore read or write the store themselves.
//!
//! ```ignore
//! let id = store.subscribe_selector(
//!     |s| s.pipeline.status,
//!     |status| println!("pipeline is now {:?}", status),
//! );
//! store.set_state("pipeline/status", |s| s.pipeline.status = PipelineStatus::Loading);
//! store.unsubscribe(id);
//! ```

mod state;

pub use state::ExplorerState;

use crate::id::SubscriptionId;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

/// Callback invoked after every state change with the new snapshot and the
/// action label of the change.
pub type Listener = Arc<dyn Fn(&ExplorerState, &str) + Send + Sync>;

struct StoreInner {
    name: String,
    state: RwLock<Arc<ExplorerState>>,
    initial: RwLock<Option<Arc<ExplorerState>>>,
    version: AtomicU64,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_subscription: AtomicU64,
}

/// Handle to the shared state container. Cloning shares the same state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

/// Non-owning store handle
#[derive(Clone)]
pub struct WeakStore {
    inner: Weak<StoreInner>,
}

impl WeakStore {
    pub fn upgrade(&self) -> Option<Store> {
        self.inner.upgrade().map(|inner| Store { inner })
    }

    /// Whether this handle points at `store`
    pub fn is(&self, store: &Store) -> bool {
        Weak::ptr_eq(&self.inner, &Arc::downgrade(&store.inner))
    }
}

impl Store {
    pub fn new(name: impl Into<String>, state: ExplorerState) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                name: name.into(),
                state: RwLock::new(Arc::new(state)),
                initial: RwLock::new(None),
                version: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of state changes applied so far
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    /// Current snapshot
    pub fn get_state(&self) -> Arc<ExplorerState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Read from the current snapshot without cloning the `Arc`
    pub fn with_state<R>(&self, f: impl FnOnce(&ExplorerState) -> R) -> R {
        let guard = self.inner.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Apply a change and notify listeners.
    ///
    /// `action` labels the change in traces and is passed to listeners.
    pub fn set_state<R>(&self, action: &str, f: impl FnOnce(&mut ExplorerState) -> R) -> R {
        let (result, snapshot) = {
            let mut guard = self
                .inner
                .state
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let result = f(Arc::make_mut(&mut guard));
            (result, guard.clone())
        };
        let version = self.inner.version.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(store = %self.inner.name, action, version, "state updated");

        self.notify(&snapshot, action);
        result
    }

    fn notify(&self, snapshot: &ExplorerState, action: &str) {
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener(snapshot, action);
        }
    }

    /// Register a listener called after every change
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ExplorerState, &str) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Register a listener called only when the selected value changes
    pub fn subscribe_selector<T, S, F>(&self, selector: S, listener: F) -> SubscriptionId
    where
        T: PartialEq + Send + Sync + 'static,
        S: Fn(&ExplorerState) -> T + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let last = Mutex::new(Arc::new(self.with_state(&selector)));
        self.subscribe(move |state, _| {
            let next = Arc::new(selector(state));
            {
                let mut last = last.lock().unwrap_or_else(PoisonError::into_inner);
                if **last == *next {
                    return;
                }
                *last = next.clone();
            }
            // Lock released: the listener may write to the store
            listener(&next);
        })
    }

    /// Remove a listener; unknown ids are ignored
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Remember the current snapshot as the state [`Store::reset`] returns to
    pub fn seal_initial(&self) {
        let snapshot = self.get_state();
        *self
            .inner
            .initial
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }

    /// Restore the sealed initial snapshot (no-op when never sealed)
    pub fn reset(&self) {
        let initial = self
            .inner
            .initial
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(initial) = initial {
            self.set_state("@@RESET", |state| *state = (*initial).clone());
        }
    }

    pub fn downgrade(&self) -> WeakStore {
        WeakStore {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.name)
            .field("version", &self.version())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
