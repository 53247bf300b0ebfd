//! Staged pipeline executor.
//!
//! Each run walks the fixed stage order adapter → grouping → query → custom.
//! Every stage derives its cache key from its own options and the key of the
//! stage before it, so a change anywhere upstream misses every downstream
//! cache while untouched prefixes are reused.
//!
//! Between stages the executor yields to the runtime and checks whether the
//! run is still current; a superseded run stops early and reports `None`.

use crate::id::CacheKey;
use crate::pipeline::adapter::adapt;
use crate::pipeline::custom::{CustomProcessor, PassthroughProcessor};
use crate::pipeline::error::PipelineResult;
use crate::pipeline::grouping::{apply_grouping, GroupingSpec};
use crate::pipeline::query::{apply_query, CompiledQuery, QueryParams};
use crate::pipeline::stage::{PipelineOptions, PipelineStats, StageCaches, StageKind};
use crate::types::{Instruction, RecordSet, SequenceType};
use std::sync::{Arc, Mutex, PoisonError};

/// Everything one run needs
#[derive(Debug, Clone)]
pub struct StageRequest<'a> {
    pub instructions: &'a [Instruction],
    /// Load counter of `instructions`; identifies the pipeline input
    pub instructions_version: u64,
    pub grouping: &'a GroupingSpec,
    pub params: &'a QueryParams,
    pub query: &'a CompiledQuery,
}

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub output: Arc<RecordSet>,
    /// Cache keys of every stage, in stage order
    pub keys: [CacheKey; 4],
    /// Cumulative counters after this run
    pub stats: PipelineStats,
}

/// The four-stage pipeline with its per-stage caches
pub struct StagedPipeline {
    sequence_type: SequenceType,
    options: PipelineOptions,
    processor: Arc<dyn CustomProcessor>,
    caches: Mutex<StageCaches>,
}

impl StagedPipeline {
    pub fn new(sequence_type: SequenceType, options: PipelineOptions) -> Self {
        Self {
            sequence_type,
            options,
            processor: Arc::new(PassthroughProcessor),
            caches: Mutex::new(StageCaches::new()),
        }
    }

    /// Builder method to install a custom stage processor
    pub fn with_processor(mut self, processor: Arc<dyn CustomProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn sequence_type(&self) -> SequenceType {
        self.sequence_type
    }

    pub fn stats(&self) -> PipelineStats {
        self.caches().stats()
    }

    /// Number of cached results held for `stage`
    pub fn cached_entries(&self, stage: StageKind) -> usize {
        self.caches().len(stage)
    }

    pub fn clear_cache(&self) {
        self.caches().clear();
    }

    fn caches(&self) -> std::sync::MutexGuard<'_, StageCaches> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cache keys for `request`, in stage order
    pub fn stage_keys(&self, request: &StageRequest<'_>) -> [CacheKey; 4] {
        let root = CacheKey::root(request.instructions_version);
        let adapter = CacheKey::derive(
            StageKind::Adapter.name(),
            &format!(
                "{}:{}",
                self.sequence_type, self.options.adapter.object_depth
            ),
            &root,
        );
        let grouping = CacheKey::derive(
            StageKind::Grouping.name(),
            &serde_json::to_string(request.grouping).unwrap_or_default(),
            &adapter,
        );
        let query = CacheKey::derive(
            StageKind::Query.name(),
            &serde_json::to_string(request.params).unwrap_or_default(),
            &grouping,
        );
        let custom = CacheKey::derive(
            StageKind::Custom.name(),
            &format!("{}:{}", self.processor.name(), self.processor.options_key()),
            &query,
        );
        [adapter, grouping, query, custom]
    }

    /// Run all stages.
    ///
    /// `is_current` is polled after every stage; once it returns `false` the
    /// run stops and resolves to `Ok(None)`. `on_phase` is called before each
    /// stage starts.
    pub async fn run(
        &self,
        request: StageRequest<'_>,
        is_current: &(dyn Fn() -> bool + Send + Sync),
        on_phase: &(dyn Fn(StageKind) + Send + Sync),
    ) -> PipelineResult<Option<StageOutcome>> {
        let keys = self.stage_keys(&request);

        on_phase(StageKind::Adapter);
        let adapted = self.run_sync_stage(StageKind::Adapter, &keys[0], || {
            Ok(adapt(
                request.instructions,
                self.sequence_type,
                self.options.adapter.object_depth,
            ))
        })?;
        if !self.still_current(is_current).await {
            return Ok(None);
        }

        on_phase(StageKind::Grouping);
        let grouped = self.run_sync_stage(StageKind::Grouping, &keys[1], || {
            Ok(apply_grouping(&adapted, request.grouping))
        })?;
        if !self.still_current(is_current).await {
            return Ok(None);
        }

        on_phase(StageKind::Query);
        let queried = self.run_sync_stage(StageKind::Query, &keys[2], || {
            apply_query(&grouped, request.query)
        })?;
        if !self.still_current(is_current).await {
            return Ok(None);
        }

        on_phase(StageKind::Custom);
        let output = match self.cached(StageKind::Custom, &keys[3]) {
            Some(hit) => hit,
            None => {
                let output = self.processor.process(queried).await?;
                self.store(StageKind::Custom, &keys[3], &output);
                output
            }
        };
        if !self.still_current(is_current).await {
            return Ok(None);
        }

        Ok(Some(StageOutcome {
            output,
            keys,
            stats: self.stats(),
        }))
    }

    fn run_sync_stage<F>(
        &self,
        stage: StageKind,
        key: &CacheKey,
        compute: F,
    ) -> PipelineResult<Arc<RecordSet>>
    where
        F: FnOnce() -> PipelineResult<RecordSet>,
    {
        if let Some(hit) = self.cached(stage, key) {
            return Ok(hit);
        }
        let output = Arc::new(compute()?);
        self.store(stage, key, &output);
        Ok(output)
    }

    fn cached(&self, stage: StageKind, key: &CacheKey) -> Option<Arc<RecordSet>> {
        if !self.options.use_cache(stage) {
            return None;
        }
        let hit = self.caches().lookup(stage, key);
        if hit.is_some() {
            tracing::debug!("{} stage cache hit ({})", stage, key);
        }
        hit
    }

    fn store(&self, stage: StageKind, key: &CacheKey, output: &Arc<RecordSet>) {
        let use_cache = self.options.use_cache(stage);
        tracing::debug!(
            "{} stage computed {} records ({}, cached: {})",
            stage,
            output.len(),
            key,
            use_cache
        );
        self.caches().record_run(stage, key, output, use_cache);
    }

    async fn still_current(&self, is_current: &(dyn Fn() -> bool + Send + Sync)) -> bool {
        tokio::task::yield_now().await;
        is_current()
    }
}

impl std::fmt::Debug for StagedPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedPipeline")
            .field("sequence_type", &self.sequence_type)
            .field("options", &self.options)
            .field("processor", &self.processor.name())
            .finish()
    }
}
