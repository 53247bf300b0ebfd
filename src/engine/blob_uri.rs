//! Blob URI engine: short-lived handles for blob-backed payloads.
//!
//! A handle only refers to a payload, it never owns the bytes. Handles are
//! reconciled with every successful search output and all of them are
//! revoked when the engine is finalized.

use crate::engine::events::{EngineEvent, EventKind, EventsEngine};
use crate::engine::lifecycle::Teardown;
use crate::error::Result;
use crate::store::Store;
use crate::types::{BlobRef, SequenceType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// URI-like handle to a blob payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobHandle(pub String);

impl BlobHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Creates and revokes handles
pub trait BlobBackend: Send + Sync {
    fn create(&self, blob: &BlobRef) -> Result<BlobHandle>;

    /// Revoking an unknown handle is a no-op
    fn revoke(&self, handle: &BlobHandle);
}

/// Issues `blob:<sequence>/<uuid>` handles
#[derive(Debug, Clone)]
pub struct ObjectUrlBackend {
    sequence_type: SequenceType,
}

impl ObjectUrlBackend {
    pub fn new(sequence_type: SequenceType) -> Self {
        Self { sequence_type }
    }
}

impl BlobBackend for ObjectUrlBackend {
    fn create(&self, _blob: &BlobRef) -> Result<BlobHandle> {
        Ok(BlobHandle(format!(
            "blob:{}/{}",
            self.sequence_type,
            uuid::Uuid::new_v4()
        )))
    }

    fn revoke(&self, handle: &BlobHandle) {
        tracing::trace!("Revoked {}", handle);
    }
}

/// `blob_uri` slice
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobUriState {
    /// Live handles and the payload each refers to
    pub handles: BTreeMap<BlobHandle, BlobRef>,
    pub acquired_total: u64,
    pub released_total: u64,
}

impl BlobUriState {
    fn handle_for(&self, blob: &BlobRef) -> Option<BlobHandle> {
        self.handles
            .iter()
            .find(|(_, b)| *b == blob)
            .map(|(h, _)| h.clone())
    }
}

/// Handle to the `blob_uri` slice
#[derive(Clone)]
pub struct BlobUriEngine {
    store: Store,
    events: EventsEngine,
    backend: Arc<dyn BlobBackend>,
    /// Serializes acquire/release so a payload never gets two live handles
    ops: Arc<Mutex<()>>,
}

impl BlobUriEngine {
    pub fn new(store: Store, events: EventsEngine, backend: Arc<dyn BlobBackend>) -> Self {
        store.set_state("blob_uri/@@INIT", |state| {
            state.blob_uri = BlobUriState::default();
        });
        Self {
            store,
            events,
            backend,
            ops: Arc::new(Mutex::new(())),
        }
    }

    /// Get a handle for `blob`, reusing the live one if any
    pub fn acquire(&self, blob: &BlobRef) -> Result<BlobHandle> {
        let _guard = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = self.handle_for(blob) {
            return Ok(handle);
        }

        let handle = self.backend.create(blob)?;
        self.store.set_state("blob_uri/acquire", |state| {
            state.blob_uri.handles.insert(handle.clone(), blob.clone());
            state.blob_uri.acquired_total += 1;
        });
        tracing::trace!("Acquired {} for {}", handle, blob);
        Ok(handle)
    }

    /// Revoke `handle`; returns false if it was not live
    pub fn release(&self, handle: &BlobHandle) -> bool {
        let _guard = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        self.release_locked(handle)
    }

    fn release_locked(&self, handle: &BlobHandle) -> bool {
        if !self.store.with_state(|state| state.blob_uri.handles.contains_key(handle)) {
            return false;
        }
        self.backend.revoke(handle);
        self.store.set_state("blob_uri/release", |state| {
            state.blob_uri.handles.remove(handle);
            state.blob_uri.released_total += 1;
        });
        true
    }

    /// Revoke every live handle; returns how many were released
    pub fn release_all(&self) -> usize {
        let _guard = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        let handles: Vec<BlobHandle> = self
            .store
            .with_state(|state| state.blob_uri.handles.keys().cloned().collect());
        let released = handles.iter().filter(|h| self.release_locked(h)).count();
        if released > 0 {
            tracing::debug!("Released {} blob handles", released);
        }
        released
    }

    /// Release handles whose payload is not in `blobs`, acquire handles for
    /// the new ones.
    pub fn sync(&self, blobs: &[BlobRef]) {
        let wanted: BTreeSet<&BlobRef> = blobs.iter().collect();
        let stale: Vec<BlobHandle> = self.store.with_state(|state| {
            state
                .blob_uri
                .handles
                .iter()
                .filter(|(_, blob)| !wanted.contains(blob))
                .map(|(handle, _)| handle.clone())
                .collect()
        });
        for handle in &stale {
            self.release(handle);
        }
        for blob in wanted {
            if let Err(e) = self.acquire(blob) {
                tracing::warn!("Failed to acquire handle for {}: {}", blob, e);
            }
        }
    }

    pub fn handle_for(&self, blob: &BlobRef) -> Option<BlobHandle> {
        self.store.with_state(|state| state.blob_uri.handle_for(blob))
    }

    pub fn outstanding(&self) -> usize {
        self.store.with_state(|state| state.blob_uri.handles.len())
    }

    /// Follow search results. The teardown releases every handle.
    pub fn initialize(&self) -> Teardown {
        let engine = self.clone();
        let subscription = self.events.subscribe(EventKind::PipelineFinished, move |event| {
            if let EngineEvent::PipelineFinished { blobs, .. } = event {
                engine.sync(blobs);
            }
        });

        let engine = self.clone();
        Teardown::new("blob_uri", move || {
            engine.events.unsubscribe(subscription);
            engine.release_all();
        })
    }
}

impl fmt::Debug for BlobUriEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobUriEngine")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::RunId;
    use crate::store::ExplorerState;

    fn engine() -> BlobUriEngine {
        let store = Store::new("test", ExplorerState::default());
        let events = EventsEngine::new(store.clone());
        BlobUriEngine::new(
            store,
            events,
            Arc::new(ObjectUrlBackend::new(SequenceType::Images)),
        )
    }

    #[test]
    fn test_acquire_reuses_live_handle() {
        let blobs = engine();
        let blob = BlobRef::new("run1/images/0");
        let first = blobs.acquire(&blob).unwrap();
        let second = blobs.acquire(&blob).unwrap();

        assert_eq!(first, second);
        assert!(first.as_str().starts_with("blob:images/"));
        assert_eq!(blobs.outstanding(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let blobs = engine();
        let handle = blobs.acquire(&BlobRef::new("a")).unwrap();
        assert!(blobs.release(&handle));
        assert!(!blobs.release(&handle));
        assert_eq!(blobs.outstanding(), 0);

        let reacquired = blobs.acquire(&BlobRef::new("a")).unwrap();
        assert_ne!(reacquired, handle);
    }

    #[test]
    fn test_sync_releases_superseded() {
        let blobs = engine();
        blobs.sync(&[BlobRef::new("a"), BlobRef::new("b")]);
        let kept = blobs.handle_for(&BlobRef::new("b")).unwrap();

        blobs.sync(&[BlobRef::new("b"), BlobRef::new("c")]);
        assert_eq!(blobs.outstanding(), 2);
        assert!(blobs.handle_for(&BlobRef::new("a")).is_none());
        assert_eq!(blobs.handle_for(&BlobRef::new("b")), Some(kept));
    }

    #[test]
    fn test_teardown_releases_everything() {
        let blobs = engine();
        let teardown = blobs.initialize();
        blobs.events.fire(EngineEvent::PipelineFinished {
            run: RunId(1),
            record_count: 2,
            group_count: 1,
            blobs: vec![BlobRef::new("x"), BlobRef::new("y")],
        });
        assert_eq!(blobs.outstanding(), 2);

        teardown.run();
        assert_eq!(blobs.outstanding(), 0);
        assert_eq!(blobs.events.subscriber_count(), 0);
        let state = blobs.store.get_state();
        assert_eq!(state.blob_uri.acquired_total, 2);
        assert_eq!(state.blob_uri.released_total, 2);
    }
}
