//! Stage descriptors, per-stage caches and run statistics.

use crate::id::CacheKey;
use crate::types::RecordSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Default depth to which nested run params and contexts are flattened
pub const DEFAULT_OBJECT_DEPTH: usize = 2;

/// The four pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Adapter,
    Grouping,
    Query,
    Custom,
}

impl StageKind {
    /// All stages in their fixed execution order
    pub const ORDER: [StageKind; 4] = [
        StageKind::Adapter,
        StageKind::Grouping,
        StageKind::Query,
        StageKind::Custom,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Adapter => "adapter",
            StageKind::Grouping => "grouping",
            StageKind::Query => "query",
            StageKind::Custom => "custom",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Options shared by every stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOptions {
    pub use_cache: bool,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self { use_cache: true }
    }
}

/// Adapter stage options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterOptions {
    /// How many object levels of run params / context get flattened into fields
    pub object_depth: usize,
    pub use_cache: bool,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            object_depth: DEFAULT_OBJECT_DEPTH,
            use_cache: true,
        }
    }
}

/// Ordered stage descriptor: adapter → grouping → query → custom
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipelineOptions {
    pub adapter: AdapterOptions,
    pub grouping: StageOptions,
    pub query: StageOptions,
    pub custom: StageOptions,
}

impl PipelineOptions {
    /// Options with every stage cache enabled or disabled
    pub fn with_cache(use_cache: bool) -> Self {
        Self {
            adapter: AdapterOptions {
                use_cache,
                ..AdapterOptions::default()
            },
            grouping: StageOptions { use_cache },
            query: StageOptions { use_cache },
            custom: StageOptions { use_cache },
        }
    }

    pub fn use_cache(&self, stage: StageKind) -> bool {
        match stage {
            StageKind::Adapter => self.adapter.use_cache,
            StageKind::Grouping => self.grouping.use_cache,
            StageKind::Query => self.query.use_cache,
            StageKind::Custom => self.custom.use_cache,
        }
    }
}

/// Execution counters for one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageStats {
    /// Times the stage computation actually ran
    pub runs: u64,
    /// Times a cached result was reused
    pub hits: u64,
}

/// Execution counters for the whole pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineStats {
    pub adapter: StageStats,
    pub grouping: StageStats,
    pub query: StageStats,
    pub custom: StageStats,
}

impl PipelineStats {
    pub fn get(&self, stage: StageKind) -> StageStats {
        match stage {
            StageKind::Adapter => self.adapter,
            StageKind::Grouping => self.grouping,
            StageKind::Query => self.query,
            StageKind::Custom => self.custom,
        }
    }

    fn get_mut(&mut self, stage: StageKind) -> &mut StageStats {
        match stage {
            StageKind::Adapter => &mut self.adapter,
            StageKind::Grouping => &mut self.grouping,
            StageKind::Query => &mut self.query,
            StageKind::Custom => &mut self.custom,
        }
    }

    /// Total stage computations across all stages
    pub fn total_runs(&self) -> u64 {
        StageKind::ORDER.iter().map(|s| self.get(*s).runs).sum()
    }
}

/// Per-stage result caches.
///
/// Entries are never evicted automatically; they live until [`StageCaches::clear`]
/// (called on engine finalize).
#[derive(Debug, Default)]
pub struct StageCaches {
    entries: HashMap<(StageKind, CacheKey), Arc<RecordSet>>,
    stats: PipelineStats,
}

impl StageCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached result, counting a hit when found
    pub fn lookup(&mut self, stage: StageKind, key: &CacheKey) -> Option<Arc<RecordSet>> {
        let hit = self.entries.get(&(stage, key.clone())).cloned();
        if hit.is_some() {
            self.stats.get_mut(stage).hits += 1;
        }
        hit
    }

    /// Record that a stage computation ran, storing its result when `cache` is set
    pub fn record_run(
        &mut self,
        stage: StageKind,
        key: &CacheKey,
        output: &Arc<RecordSet>,
        cache: bool,
    ) {
        self.stats.get_mut(stage).runs += 1;
        if cache {
            self.entries.insert((stage, key.clone()), output.clone());
        }
    }

    pub fn len(&self, stage: StageKind) -> usize {
        self.entries.keys().filter(|(s, _)| *s == stage).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Drop every cached entry (statistics are kept)
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
