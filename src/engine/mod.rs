//! Engine composer
//!
//! [`ExplorerEngine`] owns one [`Store`] and one instance of every sub-engine,
//! each writing only its own slice of the shared state:
//!
//! | Sub-engine | Slice |
//! |------------|-------|
//! | [`NotificationsEngine`] | `notifications` |
//! | [`CustomStatesEngine`] | `custom_states` |
//! | [`QueryEngine`] / [`GroupingsEngine`] | `query` / `groupings` |
//! | [`InstructionsEngine`] | `instructions` |
//! | [`PipelineEngine`] | `pipeline` |
//! | [`VisualizationsEngine`] | `visualizations` |
//! | [`EventsEngine`] | `events` |
//! | [`BlobUriEngine`] | `blob_uri` |
//!
//! Construction is synchronous and performs no I/O. [`ExplorerEngine::initialize`]
//! replays persisted state, wires listeners, loads the instructions and runs
//! the first search. [`ExplorerEngine::finalize`] undoes all of it and puts
//! the store back to its initial snapshot.

pub mod blob_uri;
pub mod custom_states;
pub mod events;
pub mod explorer;
pub mod instructions;
pub mod lifecycle;
pub mod notifications;
pub mod pipeline;
pub mod visualizations;

pub use blob_uri::{BlobBackend, BlobHandle, BlobUriEngine, BlobUriState, ObjectUrlBackend};
pub use custom_states::CustomStatesEngine;
pub use events::{EngineEvent, EventKind, EventsEngine, EventsState};
pub use explorer::{
    GroupingsEngine, GroupingsState, QueryEngine, QueryForm, QuerySpec, QueryState,
    GROUPINGS_PARAM, QUERY_PARAM,
};
pub use instructions::{
    FileInstructions, InstructionsEngine, InstructionsLoad, InstructionsSource, InstructionsState,
    InstructionsStatus, StaticInstructions,
};
pub use lifecycle::Teardown;
pub use notifications::{Notification, NotificationKind, NotificationsEngine, NotificationsState};
pub use pipeline::{PipelineEngine, PipelinePhase, PipelineState, PipelineStatus, SearchOutcome};
pub use visualizations::{VisualizationState, VisualizationSummary, VisualizationsEngine};

use crate::config::ExplorerConfig;
use crate::devtools;
use crate::error::{EngineError, Result};
use crate::navigation::History;
use crate::persistence::{KeyValueStorage, MemoryStorage};
use crate::pipeline::{CustomProcessor, StagedPipeline};
use crate::store::{ExplorerState, Store};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Builder for [`ExplorerEngine`]
pub struct ExplorerEngineBuilder {
    config: ExplorerConfig,
    source: Option<Arc<dyn InstructionsSource>>,
    history: Option<History>,
    storage: Option<Arc<dyn KeyValueStorage>>,
    blob_backend: Option<Arc<dyn BlobBackend>>,
    processor: Option<Arc<dyn CustomProcessor>>,
}

impl ExplorerEngineBuilder {
    pub fn new(config: ExplorerConfig) -> Self {
        Self {
            config,
            source: None,
            history: None,
            storage: None,
            blob_backend: None,
            processor: None,
        }
    }

    /// Where instructions are loaded from (default: an empty static set)
    pub fn source(mut self, source: Arc<dyn InstructionsSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Navigation history to persist into (default: a fresh history at the base path)
    pub fn history(mut self, history: History) -> Self {
        self.history = Some(history);
        self
    }

    /// Durable storage used when persistence is enabled (default: in-memory)
    pub fn storage(mut self, storage: Arc<dyn KeyValueStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn blob_backend(mut self, backend: Arc<dyn BlobBackend>) -> Self {
        self.blob_backend = Some(backend);
        self
    }

    /// Custom stage processor (default: passthrough)
    pub fn processor(mut self, processor: Arc<dyn CustomProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Construct every sub-engine and seal the initial store snapshot.
    pub fn build(self) -> ExplorerEngine {
        let config = self.config;
        let sequence_type = config.sequence_type;

        let store = Store::new(config.name.clone(), ExplorerState::default());
        let history = self
            .history
            .unwrap_or_else(|| History::at(config.base_path.as_deref().unwrap_or("/")));
        let url_history = config.persist.then(|| history.clone());
        let storage: Option<Arc<dyn KeyValueStorage>> = if config.persist {
            Some(
                self.storage
                    .unwrap_or_else(|| Arc::new(MemoryStorage::new())),
            )
        } else {
            None
        };

        // The bus is needed by most constructors, so it comes first
        let events = EventsEngine::new(store.clone());
        let notifications = NotificationsEngine::new(store.clone());
        let custom_states =
            CustomStatesEngine::new(store.clone(), config.states.clone(), url_history.clone());
        let query = QueryEngine::new(
            store.clone(),
            events.clone(),
            url_history.clone(),
            sequence_type,
            config.default_query_spec(),
        );
        let groupings = GroupingsEngine::new(
            store.clone(),
            events.clone(),
            url_history,
            config.groupings.keys().cloned().collect(),
            config.default_grouping_spec(),
        );
        let instructions = InstructionsEngine::new(
            store.clone(),
            self.source
                .unwrap_or_else(|| Arc::new(StaticInstructions::default())),
            notifications.clone(),
            sequence_type,
        );

        let mut staged = StagedPipeline::new(sequence_type, config.pipeline_options());
        if let Some(processor) = self.processor {
            staged = staged.with_processor(processor);
        }
        let pipeline = PipelineEngine::new(
            store.clone(),
            staged,
            query.clone(),
            groupings.clone(),
            notifications.clone(),
            events.clone(),
        );
        let visualizations = VisualizationsEngine::new(
            store.clone(),
            events.clone(),
            config.visualizations.clone(),
            storage.clone(),
        );
        let blob_uri = BlobUriEngine::new(
            store.clone(),
            events.clone(),
            self.blob_backend
                .unwrap_or_else(|| Arc::new(ObjectUrlBackend::new(sequence_type))),
        );

        store.seal_initial();
        tracing::debug!("Engine '{}' constructed", config.name);

        ExplorerEngine {
            inner: Arc::new(EngineInner {
                config,
                store,
                history,
                storage,
                notifications,
                events,
                custom_states,
                query,
                groupings,
                instructions,
                pipeline,
                visualizations,
                blob_uri,
                teardowns: Mutex::new(Vec::new()),
                initialized: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
            }),
        }
    }
}

struct EngineInner {
    config: ExplorerConfig,
    store: Store,
    history: History,
    storage: Option<Arc<dyn KeyValueStorage>>,
    notifications: NotificationsEngine,
    events: EventsEngine,
    custom_states: CustomStatesEngine,
    query: QueryEngine,
    groupings: GroupingsEngine,
    instructions: InstructionsEngine,
    pipeline: PipelineEngine,
    visualizations: VisualizationsEngine,
    blob_uri: BlobUriEngine,
    /// Collected in registration order
    teardowns: Mutex<Vec<Teardown>>,
    initialized: AtomicBool,
    /// Bumped by every finalize
    epoch: AtomicU64,
}

/// One explorer: a store and the sub-engines that share it.
/// Cloning shares the same engine.
#[derive(Clone)]
pub struct ExplorerEngine {
    inner: Arc<EngineInner>,
}

impl ExplorerEngine {
    pub fn builder(config: ExplorerConfig) -> ExplorerEngineBuilder {
        ExplorerEngineBuilder::new(config)
    }

    /// Engine with default collaborators and `source` as instructions source
    pub fn new(config: ExplorerConfig, source: Arc<dyn InstructionsSource>) -> Self {
        Self::builder(config).source(source).build()
    }

    /// Bring the engine up.
    ///
    /// Fails with a configuration error before touching any state when the
    /// config is invalid, and with a lifecycle error when already
    /// initialized. Instruction loading problems are not errors: they end
    /// up as notifications and a pipeline status.
    ///
    /// A `finalize` that lands while this is waiting on the instructions
    /// source or the bootstrap search wins: nothing further is written and
    /// a lifecycle error is returned.
    pub async fn initialize(&self) -> Result<EngineTeardown> {
        let inner = &self.inner;
        inner.config.validate()?;
        // Read before the swap so a finalize racing the setup is observed
        let epoch = inner.epoch.load(Ordering::SeqCst);
        if inner.initialized.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Lifecycle(format!(
                "engine '{}' is already initialized",
                inner.config.name
            )));
        }
        tracing::info!("Initializing engine '{}'", inner.config.name);

        if inner.config.devtool {
            devtools::register(&inner.store);
        }

        let namespace = inner
            .config
            .base_path
            .clone()
            .unwrap_or_else(|| inner.config.name.clone());
        let mut teardowns = vec![
            inner.custom_states.initialize(),
            inner.query.initialize(),
            inner.groupings.initialize(),
            inner.pipeline.initialize(),
            inner.visualizations.initialize(&namespace),
            inner.blob_uri.initialize(),
        ];
        if let Some(teardown) = self.persist_navigation() {
            teardowns.push(teardown);
        }
        inner
            .teardowns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(teardowns);

        let fetched = inner.instructions.fetch().await;
        self.ensure_current(epoch)?;

        match inner.instructions.apply(fetched) {
            InstructionsLoad::Failed(message) => {
                tracing::warn!("Engine '{}' has no instructions: {}", inner.config.name, message);
                inner
                    .pipeline
                    .change_current_phase_or_status(PipelineStatus::Error);
            }
            load => {
                tracing::debug!("Instructions bootstrap: {:?}", load);
                inner.pipeline.search(inner.query.params(), true).await;
                self.ensure_current(epoch)?;
            }
        }

        Ok(EngineTeardown {
            engine: self.clone(),
        })
    }

    /// Fail when the engine was finalized since `epoch` was read
    fn ensure_current(&self, epoch: u64) -> Result<()> {
        if self.inner.epoch.load(Ordering::SeqCst) == epoch {
            return Ok(());
        }
        tracing::debug!(
            "Engine '{}' was finalized during initialization",
            self.inner.config.name
        );
        Err(EngineError::Lifecycle(format!(
            "engine '{}' was finalized during initialization",
            self.inner.config.name
        )))
    }

    /// Write the current href under `{base_path}Url` on every navigation
    fn persist_navigation(&self) -> Option<Teardown> {
        let inner = &self.inner;
        let storage = inner.storage.clone()?;
        let key = inner.config.url_storage_key()?;

        let history = inner.history.clone();
        let listener = history.listen(move |update| {
            if let Err(e) = storage.set(&key, &update.location.href()) {
                tracing::warn!("Failed to persist navigation state: {}", e);
            }
        });
        Some(Teardown::new("navigation", move || history.unlisten(listener)))
    }

    /// Tear the engine down. Safe to call any number of times.
    pub fn finalize(&self) {
        let inner = &self.inner;
        if !inner.initialized.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Finalizing engine '{}'", inner.config.name);
        inner.epoch.fetch_add(1, Ordering::SeqCst);

        // Stale runs must not publish results into a torn-down engine
        inner.pipeline.invalidate_in_flight();

        let teardowns = std::mem::take(
            &mut *inner
                .teardowns
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for teardown in teardowns.into_iter().rev() {
            teardown.run();
        }

        inner.blob_uri.release_all();
        inner.pipeline.clear_cache();
        if inner.config.devtool {
            devtools::unregister(&inner.store);
        }
        inner.store.reset();
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Search with the current query spec, pushing a history entry
    pub async fn search(&self) -> SearchOutcome {
        let params = self.inner.query.params();
        self.inner.pipeline.search(params, false).await
    }

    pub fn config(&self) -> &ExplorerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn history(&self) -> &History {
        &self.inner.history
    }

    pub fn storage(&self) -> Option<&Arc<dyn KeyValueStorage>> {
        self.inner.storage.as_ref()
    }

    pub fn notifications(&self) -> &NotificationsEngine {
        &self.inner.notifications
    }

    pub fn events(&self) -> &EventsEngine {
        &self.inner.events
    }

    pub fn custom_states(&self) -> &CustomStatesEngine {
        &self.inner.custom_states
    }

    pub fn query(&self) -> &QueryEngine {
        &self.inner.query
    }

    pub fn groupings(&self) -> &GroupingsEngine {
        &self.inner.groupings
    }

    pub fn instructions(&self) -> &InstructionsEngine {
        &self.inner.instructions
    }

    pub fn pipeline(&self) -> &PipelineEngine {
        &self.inner.pipeline
    }

    pub fn visualizations(&self) -> &VisualizationsEngine {
        &self.inner.visualizations
    }

    pub fn blob_uri(&self) -> &BlobUriEngine {
        &self.inner.blob_uri
    }
}

impl std::fmt::Debug for ExplorerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExplorerEngine")
            .field("name", &self.inner.config.name)
            .field("initialized", &self.is_initialized())
            .field("store", &self.inner.store)
            .finish()
    }
}

/// Returned by [`ExplorerEngine::initialize`]; running it finalizes the engine
#[derive(Debug)]
#[must_use = "dropping the teardown leaves the engine initialized"]
pub struct EngineTeardown {
    engine: ExplorerEngine,
}

impl EngineTeardown {
    pub fn run(self) {
        self.engine.finalize();
    }
}
