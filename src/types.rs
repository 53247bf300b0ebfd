//! Core data types for the explorer engine
//!
//! This module contains the data structures that flow through the pipeline:
//! the raw [`Instruction`]s loaded before any run, the flattened
//! [`FlatRecord`]s the adapter stage produces, and the [`RecordSet`] that
//! later stages refine and the view layer finally renders.
//!
//! # Field paths
//!
//! Records expose their data through dotted field paths, which is what the
//! grouping specs and the query predicate refer to:
//!
//! - `run.hash` and `run.<param>` for run attributes
//! - `<sequence>.name` for the series name (e.g. `metric.name`)
//! - `<sequence>.context.<key>` for the series context (e.g. `metric.context.subset`)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of sequence an explorer works on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SequenceType {
    /// Scalar metric series
    #[default]
    Metric,
    /// Image sequences
    Images,
    /// Audio sequences
    Audios,
    /// Text sequences
    Texts,
    /// Figure sequences
    Figures,
    /// Distribution sequences
    Distributions,
}

impl SequenceType {
    /// Prefix used for the sequence's fields in flattened records
    pub fn field_prefix(&self) -> &'static str {
        match self {
            SequenceType::Metric => "metric",
            SequenceType::Images => "images",
            SequenceType::Audios => "audios",
            SequenceType::Texts => "texts",
            SequenceType::Figures => "figures",
            SequenceType::Distributions => "distributions",
        }
    }

    /// Whether records of this sequence type carry blob-backed payloads
    pub fn is_blob_backed(&self) -> bool {
        matches!(
            self,
            SequenceType::Images | SequenceType::Audios | SequenceType::Figures
        )
    }
}

impl fmt::Display for SequenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_prefix())
    }
}

/// Inclusive step range `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepRange {
    pub start: u64,
    pub end: u64,
}

impl StepRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// A range is valid when `start <= end`
    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    /// Whether the two ranges share at least one step
    pub fn overlaps(&self, other: &StepRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Reference to a binary payload (never the payload itself)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(pub String);

impl BlobRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Run a series belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunInfo {
    /// Unique run hash
    pub hash: String,
    /// Free-form run parameters (hyperparameters, tags, ...)
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// One loadable data series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Run owning the series
    pub run: RunInfo,
    /// Series name (e.g. `loss`)
    pub name: String,
    /// Series context (e.g. `{"subset": "train"}`)
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Steps available for this series
    #[serde(default)]
    pub steps: Option<StepRange>,
    /// Binary payload backing the series, if any
    #[serde(default)]
    pub blob: Option<BlobRef>,
}

impl Instruction {
    /// Create a new instruction for `name` on run `run_hash`
    pub fn new(run_hash: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            run: RunInfo {
                hash: run_hash.into(),
                params: Map::new(),
            },
            name: name.into(),
            context: Map::new(),
            steps: None,
            blob: None,
        }
    }

    /// Builder method to add a context entry
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Builder method to add a run parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.run.params.insert(key.into(), value.into());
        self
    }

    /// Builder method to set the available step range
    pub fn with_steps(mut self, start: u64, end: u64) -> Self {
        self.steps = Some(StepRange::new(start, end));
        self
    }

    /// Builder method to attach a blob payload reference
    pub fn with_blob(mut self, blob: impl Into<String>) -> Self {
        self.blob = Some(BlobRef::new(blob));
        self
    }

    /// Stable identity key of the series
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.run.hash,
            self.name,
            Value::Object(self.context.clone())
        )
    }
}

/// A typed, flattened record produced by the adapter stage
#[derive(Debug, Clone, PartialEq)]
pub struct FlatRecord {
    /// Stable identity key (see [`Instruction::key`])
    pub key: String,
    /// Position of the source instruction
    pub index: usize,
    /// Flattened field map keyed by dotted path
    pub fields: BTreeMap<String, Value>,
    /// Steps available for this record
    pub steps: Option<StepRange>,
    /// Binary payload backing the record
    pub blob: Option<BlobRef>,
    /// Group index per grouping slot (filled by the grouping stage)
    pub groups: BTreeMap<String, usize>,
    /// Value attached by the custom stage
    pub meta: Option<Value>,
}

impl FlatRecord {
    /// Resolve a dotted field path.
    ///
    /// Paths deeper than the adapter's object depth are resolved by walking
    /// into the JSON value stored at the longest flattened prefix.
    pub fn get(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.fields.get(path) {
            return Some(value);
        }

        let mut prefix_end = path.len();
        while let Some(dot) = path[..prefix_end].rfind('.') {
            prefix_end = dot;
            if let Some(value) = self.fields.get(&path[..prefix_end]) {
                return path[prefix_end + 1..]
                    .split('.')
                    .try_fold(value, |current, segment| current.get(segment));
            }
        }
        None
    }
}

/// One group within a grouping slot
#[derive(Debug, Clone, PartialEq)]
pub struct GroupInfo {
    /// Canonical key of the group (JSON of its field values)
    pub key: String,
    /// Values of the grouping fields shared by every member
    pub values: BTreeMap<String, Value>,
    /// Number of member records
    pub size: usize,
}

/// Records plus the groups they were assigned to
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordSet {
    pub records: Vec<FlatRecord>,
    /// Groups per slot, indexed by `FlatRecord::groups`
    pub groups: BTreeMap<String, Vec<GroupInfo>>,
}

impl RecordSet {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total number of groups across all slots
    pub fn group_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    /// Distinct blob payloads referenced by the records, in record order
    pub fn blob_refs(&self) -> Vec<BlobRef> {
        let mut seen = std::collections::BTreeSet::new();
        self.records
            .iter()
            .filter_map(|r| r.blob.clone())
            .filter(|b| seen.insert(b.clone()))
            .collect()
    }
}
