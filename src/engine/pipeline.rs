//! Pipeline engine: runs searches and owns the pipeline status machine.
//!
//! ```text
//! Idle ──search──► Loading ──► Succeeded
//!                     │   └──► Error
//!                     └──────► InsufficientResources (no instructions)
//! ```
//!
//! Every `search()` takes a fresh [`RunId`]; only the most recently issued
//! run may write status or output. Older runs stop at the next stage
//! boundary and resolve to [`SearchOutcome::Superseded`].

use crate::engine::events::{EngineEvent, EventKind, EventsEngine};
use crate::engine::explorer::{GroupingsEngine, QueryEngine};
use crate::engine::lifecycle::Teardown;
use crate::engine::notifications::NotificationsEngine;
use crate::id::RunId;
use crate::pipeline::{
    PipelineStats, QueryParams, StageKind, StageOutcome, StageRequest, StagedPipeline,
};
use crate::store::Store;
use crate::types::RecordSet;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Coarse pipeline status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    #[default]
    Idle,
    Loading,
    Succeeded,
    /// Nothing to search: the instructions set is empty
    InsufficientResources,
    Error,
}

/// Stage currently executing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    #[default]
    Idle,
    Adapting,
    Grouping,
    Querying,
    CustomProcessing,
    Done,
}

impl From<StageKind> for PipelinePhase {
    fn from(stage: StageKind) -> Self {
        match stage {
            StageKind::Adapter => PipelinePhase::Adapting,
            StageKind::Grouping => PipelinePhase::Grouping,
            StageKind::Query => PipelinePhase::Querying,
            StageKind::Custom => PipelinePhase::CustomProcessing,
        }
    }
}

/// `pipeline` slice
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineState {
    pub status: PipelineStatus,
    pub phase: PipelinePhase,
    /// Output of the last successful run
    pub output: Arc<RecordSet>,
    /// Params of the last started run
    pub last_params: Option<QueryParams>,
    pub last_run: RunId,
    /// Stage counters as of the last successful run
    pub stats: PipelineStats,
    pub error: Option<String>,
}

/// How a `search()` call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Succeeded { run: RunId, record_count: usize },
    InsufficientResources,
    Failed(String),
    /// A newer search was issued before this one finished
    Superseded,
}

struct PipelineInner {
    store: Store,
    staged: StagedPipeline,
    query: QueryEngine,
    groupings: GroupingsEngine,
    notifications: NotificationsEngine,
    events: EventsEngine,
    /// Highest issued run id
    latest_run: AtomicU64,
}

/// Handle to the pipeline engine
#[derive(Clone)]
pub struct PipelineEngine {
    inner: Arc<PipelineInner>,
}

impl PipelineEngine {
    pub fn new(
        store: Store,
        staged: StagedPipeline,
        query: QueryEngine,
        groupings: GroupingsEngine,
        notifications: NotificationsEngine,
        events: EventsEngine,
    ) -> Self {
        store.set_state("pipeline/@@INIT", |state| {
            state.pipeline = PipelineState::default();
        });
        Self {
            inner: Arc::new(PipelineInner {
                store,
                staged,
                query,
                groupings,
                notifications,
                events,
                latest_run: AtomicU64::new(0),
            }),
        }
    }

    fn is_current(&self, run: RunId) -> bool {
        self.inner.latest_run.load(Ordering::SeqCst) == run.0
    }

    /// Write to the slice only if `run` is still the latest
    fn write_if_current(
        &self,
        run: RunId,
        action: &str,
        f: impl FnOnce(&mut PipelineState),
    ) -> bool {
        let latest = &self.inner.latest_run;
        self.inner.store.set_state(action, |state| {
            if latest.load(Ordering::SeqCst) != run.0 {
                return false;
            }
            f(&mut state.pipeline);
            true
        })
    }

    fn fail(&self, run: RunId, message: String) -> SearchOutcome {
        let error = message.clone();
        let wrote = self.write_if_current(run, "pipeline/error", |slice| {
            slice.status = PipelineStatus::Error;
            slice.phase = PipelinePhase::Idle;
            slice.error = Some(error);
        });
        if !wrote {
            return SearchOutcome::Superseded;
        }

        tracing::warn!("Search {} failed: {}", run, message);
        self.inner.notifications.error(message.clone());
        self.inner.events.fire(EngineEvent::PipelineFailed {
            run,
            message: message.clone(),
        });
        SearchOutcome::Failed(message)
    }

    /// Run a search with `params`, persisting the query with a replaced or
    /// pushed history entry.
    pub async fn search(&self, params: QueryParams, replace_history: bool) -> SearchOutcome {
        let run = RunId(self.inner.latest_run.fetch_add(1, Ordering::SeqCst) + 1);
        tracing::debug!("Search {} started: {:?}", run, params.predicate);

        let compiled = match params.compile() {
            Ok(compiled) => compiled,
            Err(e) => return self.fail(run, e.to_string()),
        };

        let (instructions, instructions_version) = self
            .inner
            .store
            .with_state(|state| (state.instructions.items.clone(), state.instructions.version));

        if instructions.is_empty() {
            let wrote = self.write_if_current(run, "pipeline/insufficient_resources", |slice| {
                slice.status = PipelineStatus::InsufficientResources;
                slice.phase = PipelinePhase::Idle;
                slice.last_run = run;
                slice.output = Arc::new(RecordSet::default());
                slice.error = None;
            });
            return if wrote {
                tracing::info!("Search {}: no instructions available", run);
                SearchOutcome::InsufficientResources
            } else {
                SearchOutcome::Superseded
            };
        }

        self.inner.query.apply(&params, replace_history);
        let started = params.clone();
        self.write_if_current(run, "pipeline/loading", |slice| {
            slice.status = PipelineStatus::Loading;
            slice.phase = PipelinePhase::Idle;
            slice.last_params = Some(started);
            slice.last_run = run;
            slice.error = None;
        });

        let grouping = self.inner.groupings.spec();
        let request = StageRequest {
            instructions: &instructions,
            instructions_version,
            grouping: &grouping,
            params: &params,
            query: &compiled,
        };
        let is_current = || self.is_current(run);
        let on_phase = |stage: StageKind| {
            self.write_if_current(run, "pipeline/phase", |slice| {
                slice.phase = PipelinePhase::from(stage);
            });
        };

        match self.inner.staged.run(request, &is_current, &on_phase).await {
            Ok(Some(outcome)) => self.finish(run, outcome),
            Ok(None) => {
                tracing::debug!("Search {} superseded", run);
                SearchOutcome::Superseded
            }
            Err(e) => self.fail(run, e.to_string()),
        }
    }

    fn finish(&self, run: RunId, outcome: StageOutcome) -> SearchOutcome {
        let record_count = outcome.output.len();
        let group_count = outcome.output.group_count();
        let blobs = outcome.output.blob_refs();

        let output = outcome.output.clone();
        let wrote = self.write_if_current(run, "pipeline/succeeded", |slice| {
            slice.status = PipelineStatus::Succeeded;
            slice.phase = PipelinePhase::Done;
            slice.output = output;
            slice.stats = outcome.stats;
            slice.error = None;
        });
        if !wrote {
            tracing::debug!("Search {} finished after being superseded", run);
            return SearchOutcome::Superseded;
        }

        tracing::info!(
            "Search {} succeeded: {} records in {} groups",
            run,
            record_count,
            group_count
        );
        self.inner.events.fire(EngineEvent::PipelineFinished {
            run,
            record_count,
            group_count,
            blobs,
        });
        SearchOutcome::Succeeded { run, record_count }
    }

    /// Re-run the last search (or the current query when nothing ran yet)
    pub async fn rerun(&self) -> SearchOutcome {
        let params = self
            .inner
            .store
            .with_state(|state| state.pipeline.last_params.clone())
            .unwrap_or_else(|| self.inner.query.params());
        self.search(params, true).await
    }

    /// Explicitly override the status
    pub fn change_current_phase_or_status(&self, status: PipelineStatus) {
        self.inner
            .store
            .set_state("pipeline/change_status", |state| {
                state.pipeline.status = status;
                if status != PipelineStatus::Loading {
                    state.pipeline.phase = PipelinePhase::Idle;
                }
            });
    }

    /// Make every in-flight search stale
    pub fn invalidate_in_flight(&self) {
        self.inner.latest_run.fetch_add(1, Ordering::SeqCst);
    }

    pub fn clear_cache(&self) {
        self.inner.staged.clear_cache();
    }

    pub fn status(&self) -> PipelineStatus {
        self.inner.store.with_state(|state| state.pipeline.status)
    }

    pub fn phase(&self) -> PipelinePhase {
        self.inner.store.with_state(|state| state.pipeline.phase)
    }

    pub fn output(&self) -> Arc<RecordSet> {
        self.inner
            .store
            .with_state(|state| state.pipeline.output.clone())
    }

    /// Live stage counters, including runs that were later superseded
    pub fn stats(&self) -> PipelineStats {
        self.inner.staged.stats()
    }

    pub fn staged(&self) -> &StagedPipeline {
        &self.inner.staged
    }

    /// Re-run the current query whenever the query or grouping spec changes.
    ///
    /// Change signals are queued to a driver task on the current tokio
    /// runtime; bursts are coalesced into one search. Without a runtime the
    /// engine only searches on explicit calls.
    pub fn initialize(&self) -> Teardown {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No tokio runtime: automatic re-search disabled");
            return Teardown::noop("pipeline");
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<EventKind>();
        let events = self.inner.events.clone();
        let subscriptions: Vec<_> = [EventKind::QueryChanged, EventKind::GroupingsChanged]
            .into_iter()
            .map(|kind| {
                let tx = tx.clone();
                events.subscribe(kind, move |event| {
                    let _ = tx.send(event.kind());
                })
            })
            .collect();

        let engine = self.clone();
        let driver = runtime.spawn(async move {
            while let Some(kind) = rx.recv().await {
                while rx.try_recv().is_ok() {}
                tracing::debug!("{} → re-running search", kind);
                let params = engine.inner.query.params();
                engine.search(params, true).await;
            }
        });

        Teardown::new("pipeline", move || {
            for id in subscriptions {
                events.unsubscribe(id);
            }
            driver.abort();
        })
    }
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("status", &self.status())
            .field("latest_run", &self.inner.latest_run.load(Ordering::SeqCst))
            .field("staged", &self.inner.staged)
            .finish()
    }
}
