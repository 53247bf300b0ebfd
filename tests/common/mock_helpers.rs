//! Mock construction helpers

use async_trait::async_trait;
use explorer_engine::engine::{BlobBackend, BlobHandle, InstructionsSource};
use explorer_engine::persistence::KeyValueStorage;
use explorer_engine::pipeline::{CustomProcessor, PipelineResult};
use explorer_engine::types::BlobRef;
use explorer_engine::{EngineError, Instruction, RecordSet, Result, SequenceType};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Passthrough processor that counts its invocations
#[derive(Debug, Default)]
pub struct CountingProcessor {
    calls: AtomicUsize,
}

impl CountingProcessor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CustomProcessor for CountingProcessor {
    fn name(&self) -> &str {
        "counting"
    }

    async fn process(&self, input: Arc<RecordSet>) -> PipelineResult<Arc<RecordSet>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(input)
    }
}

/// Passthrough processor that sleeps before returning. Each call takes the
/// next queued delay; once the queue is empty calls return immediately.
#[derive(Debug, Default)]
pub struct DelayedProcessor {
    delays: Mutex<VecDeque<Duration>>,
}

impl DelayedProcessor {
    pub fn new(delays: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            delays: Mutex::new(delays.into_iter().collect()),
        }
    }
}

#[async_trait]
impl CustomProcessor for DelayedProcessor {
    fn name(&self) -> &str {
        "delayed"
    }

    async fn process(&self, input: Arc<RecordSet>) -> PipelineResult<Arc<RecordSet>> {
        let delay = self.delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(input)
    }
}

/// Instructions source that always fails
#[derive(Debug, Clone)]
pub struct FailingSource {
    pub message: String,
}

impl FailingSource {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl InstructionsSource for FailingSource {
    async fn fetch(&self, _sequence_type: SequenceType) -> Result<Vec<Instruction>> {
        Err(EngineError::Instructions(self.message.clone()))
    }
}

/// Instructions source that answers after a delay
#[derive(Debug, Clone)]
pub struct SlowSource {
    pub delay: Duration,
    pub items: Vec<Instruction>,
}

impl SlowSource {
    pub fn new(delay: Duration, items: Vec<Instruction>) -> Self {
        Self { delay, items }
    }
}

#[async_trait]
impl InstructionsSource for SlowSource {
    async fn fetch(&self, _sequence_type: SequenceType) -> Result<Vec<Instruction>> {
        tokio::time::sleep(self.delay).await;
        Ok(self.items.clone())
    }
}

/// Blob backend that records what is live and how often it was called
#[derive(Debug, Default)]
pub struct CountingBlobBackend {
    next: AtomicUsize,
    live: Mutex<BTreeSet<BlobHandle>>,
    revoked: AtomicUsize,
}

impl CountingBlobBackend {
    pub fn created(&self) -> usize {
        self.next.load(Ordering::SeqCst)
    }

    pub fn revoked(&self) -> usize {
        self.revoked.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl BlobBackend for CountingBlobBackend {
    fn create(&self, blob: &BlobRef) -> Result<BlobHandle> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let handle = BlobHandle(format!("test:{}#{}", blob, n));
        self.live.lock().unwrap().insert(handle.clone());
        Ok(handle)
    }

    fn revoke(&self, handle: &BlobHandle) {
        if self.live.lock().unwrap().remove(handle) {
            self.revoked.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Storage whose writes always fail (reads find nothing)
#[derive(Debug, Default)]
pub struct FailingStorage;

impl KeyValueStorage for FailingStorage {
    fn get(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn set(&self, key: &str, _value: &str) -> Result<()> {
        Err(EngineError::Storage(format!("quota exceeded writing {}", key)))
    }

    fn remove(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}
