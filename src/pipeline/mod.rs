//! Staged search pipeline.
//!
//! Raw instructions flow through four fixed stages:
//!
//! ```text
//! [Instructions] ──► [Adapter] ──► [Grouping] ──► [Query] ──► [Custom] ──► RecordSet
//!                     flatten      assign          filter +     user
//!                     fields       groups          prune        processor
//! ```
//!
//! # Design
//!
//! - **Chained cache keys**: a stage key hashes its own options with the
//!   upstream key, so invalidation propagates downstream only.
//! - **Shared outputs**: stage results are `Arc<RecordSet>`; cache hits and
//!   passthrough stages never copy records.
//! - **Cooperative**: the executor yields between stages and stops as soon
//!   as its run has been superseded.

pub mod adapter;
pub mod custom;
pub mod error;
pub mod executor;
pub mod grouping;
pub mod predicate;
pub mod query;
pub mod stage;

pub use adapter::adapt;
pub use custom::{CustomProcessor, PassthroughProcessor, ScriptProcessor};
pub use error::{PipelineError, PipelineResult};
pub use executor::{StageOutcome, StageRequest, StagedPipeline};
pub use grouping::{apply_grouping, prune_groups, GroupingSlot, GroupingSpec};
pub use predicate::{Predicate, MAX_QUERY_DEPTH};
pub use query::{apply_query, CompiledQuery, QueryParams, QueryRanges};
pub use stage::{
    AdapterOptions, PipelineOptions, PipelineStats, StageCaches, StageKind, StageOptions,
    StageStats, DEFAULT_OBJECT_DEPTH,
};
