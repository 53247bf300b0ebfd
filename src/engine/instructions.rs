//! Instructions engine: loads the set of series the pipeline can work on.
//!
//! Loading goes through an [`InstructionsSource`]. Failures never reach the
//! caller as errors: they become an error notification and a
//! [`InstructionsLoad::Failed`] result.

use crate::engine::notifications::NotificationsEngine;
use crate::error::{EngineError, Result};
use crate::store::Store;
use crate::types::{Instruction, SequenceType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Where instructions come from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstructionsSource: Send + Sync {
    async fn fetch(&self, sequence_type: SequenceType) -> Result<Vec<Instruction>>;
}

/// Fixed in-memory instructions
#[derive(Debug, Clone, Default)]
pub struct StaticInstructions {
    items: Vec<Instruction>,
}

impl StaticInstructions {
    pub fn new(items: Vec<Instruction>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl InstructionsSource for StaticInstructions {
    async fn fetch(&self, _sequence_type: SequenceType) -> Result<Vec<Instruction>> {
        Ok(self.items.clone())
    }
}

/// Instructions read from a JSON file (an array of instructions)
#[derive(Debug, Clone)]
pub struct FileInstructions {
    path: PathBuf,
}

impl FileInstructions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl InstructionsSource for FileInstructions {
    async fn fetch(&self, sequence_type: SequenceType) -> Result<Vec<Instruction>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            EngineError::Instructions(format!("Failed to read {:?}: {}", self.path, e))
        })?;
        let items: Vec<Instruction> = serde_json::from_str(&content).map_err(|e| {
            EngineError::Instructions(format!("Failed to parse {:?}: {}", self.path, e))
        })?;
        tracing::debug!(
            "Loaded {} {} instructions from {:?}",
            items.len(),
            sequence_type,
            self.path
        );
        Ok(items)
    }
}

/// Load status of the instructions slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionsStatus {
    #[default]
    Idle,
    Loading,
    Ready,
    Failed,
}

/// `instructions` slice
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstructionsState {
    pub status: InstructionsStatus,
    pub items: Arc<Vec<Instruction>>,
    /// Incremented on every successful load
    pub version: u64,
    pub error: Option<String>,
}

/// Result of [`InstructionsEngine::get_instructions`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructionsLoad {
    /// Loaded this many instructions
    Ready(usize),
    /// Loaded successfully but nothing is available
    Empty,
    /// Loading failed (already surfaced as a notification)
    Failed(String),
}

impl InstructionsLoad {
    pub fn is_empty(&self) -> bool {
        matches!(self, InstructionsLoad::Empty)
    }
}

/// Handle to the `instructions` slice
#[derive(Clone)]
pub struct InstructionsEngine {
    store: Store,
    source: Arc<dyn InstructionsSource>,
    notifications: NotificationsEngine,
    sequence_type: SequenceType,
}

impl InstructionsEngine {
    pub fn new(
        store: Store,
        source: Arc<dyn InstructionsSource>,
        notifications: NotificationsEngine,
        sequence_type: SequenceType,
    ) -> Self {
        store.set_state("instructions/@@INIT", |state| {
            state.instructions = InstructionsState::default();
        });
        Self {
            store,
            source,
            notifications,
            sequence_type,
        }
    }

    /// Fetch the instructions and write them into the slice.
    pub async fn get_instructions(&self) -> InstructionsLoad {
        let fetched = self.fetch().await;
        self.apply(fetched)
    }

    /// Mark the slice as loading and fetch from the source. Nothing else
    /// is written until the result goes through [`Self::apply`].
    pub async fn fetch(&self) -> Result<Vec<Instruction>> {
        self.store.set_state("instructions/loading", |state| {
            state.instructions.status = InstructionsStatus::Loading;
        });
        self.source.fetch(self.sequence_type).await
    }

    /// Write a fetch result into the slice
    pub fn apply(&self, fetched: Result<Vec<Instruction>>) -> InstructionsLoad {
        match fetched {
            Ok(items) => {
                let count = items.len();
                let version = self.store.set_state("instructions/loaded", |state| {
                    let slice = &mut state.instructions;
                    slice.items = Arc::new(items);
                    slice.version += 1;
                    slice.status = InstructionsStatus::Ready;
                    slice.error = None;
                    slice.version
                });
                tracing::info!(
                    "Instructions loaded: {} {} series (version {})",
                    count,
                    self.sequence_type,
                    version
                );

                if count == 0 {
                    InstructionsLoad::Empty
                } else {
                    InstructionsLoad::Ready(count)
                }
            }
            Err(e) => {
                let message = e.to_string();
                self.store.set_state("instructions/failed", |state| {
                    state.instructions.status = InstructionsStatus::Failed;
                    state.instructions.error = Some(message.clone());
                });
                self.notifications
                    .error(format!("Failed to load instructions: {}", message));
                InstructionsLoad::Failed(message)
            }
        }
    }

    pub fn items(&self) -> Arc<Vec<Instruction>> {
        self.store.with_state(|state| state.instructions.items.clone())
    }

    pub fn version(&self) -> u64 {
        self.store.with_state(|state| state.instructions.version)
    }

    pub fn status(&self) -> InstructionsStatus {
        self.store.with_state(|state| state.instructions.status)
    }
}

impl std::fmt::Debug for InstructionsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstructionsEngine")
            .field("sequence_type", &self.sequence_type)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ExplorerState;
    use tempfile::tempdir;

    fn engine(source: Arc<dyn InstructionsSource>) -> (InstructionsEngine, NotificationsEngine) {
        let store = Store::new("test", ExplorerState::default());
        let notifications = NotificationsEngine::new(store.clone());
        (
            InstructionsEngine::new(store, source, notifications.clone(), SequenceType::Metric),
            notifications,
        )
    }

    #[tokio::test]
    async fn test_ready_load_bumps_version() {
        let (instructions, _) = engine(Arc::new(StaticInstructions::new(vec![
            Instruction::new("r1", "loss"),
        ])));

        assert_eq!(instructions.get_instructions().await, InstructionsLoad::Ready(1));
        assert_eq!(instructions.get_instructions().await, InstructionsLoad::Ready(1));
        assert_eq!(instructions.version(), 2);
        assert_eq!(instructions.status(), InstructionsStatus::Ready);
    }

    #[tokio::test]
    async fn test_empty_load() {
        let (instructions, notifications) = engine(Arc::new(StaticInstructions::default()));
        let load = instructions.get_instructions().await;
        assert!(load.is_empty());
        assert!(notifications.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_becomes_notification() {
        let mut source = MockInstructionsSource::new();
        source
            .expect_fetch()
            .times(1)
            .returning(|_| Err(EngineError::Instructions("connection refused".into())));

        let (instructions, notifications) = engine(Arc::new(source));
        let load = instructions.get_instructions().await;

        assert!(matches!(load, InstructionsLoad::Failed(_)));
        assert!(!load.is_empty());
        assert_eq!(instructions.status(), InstructionsStatus::Failed);
        let items = notifications.list();
        assert_eq!(items.len(), 1);
        assert!(items[0].message.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_source_receives_sequence_type() {
        let mut source = MockInstructionsSource::new();
        source
            .expect_fetch()
            .withf(|seq| *seq == SequenceType::Metric)
            .returning(|_| Ok(vec![Instruction::new("r", "loss")]));

        let (instructions, _) = engine(Arc::new(source));
        assert_eq!(instructions.get_instructions().await, InstructionsLoad::Ready(1));
    }

    #[tokio::test]
    async fn test_fetch_writes_nothing_until_applied() {
        let (instructions, _) = engine(Arc::new(StaticInstructions::new(vec![
            Instruction::new("r1", "loss"),
        ])));

        let fetched = instructions.fetch().await;
        assert_eq!(instructions.status(), InstructionsStatus::Loading);
        assert!(instructions.items().is_empty());
        assert_eq!(instructions.version(), 0);

        assert_eq!(instructions.apply(fetched), InstructionsLoad::Ready(1));
        assert_eq!(instructions.items().len(), 1);
        assert_eq!(instructions.status(), InstructionsStatus::Ready);
    }

    #[tokio::test]
    async fn test_file_instructions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("instructions.json");
        let items = vec![
            Instruction::new("r1", "loss").with_steps(0, 10),
            Instruction::new("r2", "loss").with_context("subset", "val"),
        ];
        std::fs::write(&path, serde_json::to_string(&items).unwrap()).unwrap();

        let loaded = FileInstructions::new(&path)
            .fetch(SequenceType::Metric)
            .await
            .unwrap();
        assert_eq!(loaded, items);

        let missing = FileInstructions::new(dir.path().join("missing.json"))
            .fetch(SequenceType::Metric)
            .await;
        assert!(matches!(missing, Err(EngineError::Instructions(_))));
    }
}
