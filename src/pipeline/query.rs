//! Query stage: filters records by predicate and step ranges.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::grouping::prune_groups;
use crate::pipeline::predicate::Predicate;
use crate::types::{RecordSet, StepRange};
use serde::{Deserialize, Serialize};

/// Step window restrictions applied by the query stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryRanges {
    /// Keep only records whose available steps overlap this range
    #[serde(default)]
    pub record_range: Option<StepRange>,
    /// Keep only records whose source index lies in this range
    #[serde(default)]
    pub index_range: Option<StepRange>,
}

impl QueryRanges {
    pub fn validate(&self) -> PipelineResult<()> {
        for (name, range) in [
            ("record_range", self.record_range),
            ("index_range", self.index_range),
        ] {
            if let Some(range) = range {
                if !range.is_valid() {
                    return Err(PipelineError::InvalidRanges(format!(
                        "{} start {} exceeds end {}",
                        name, range.start, range.end
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Executable search request
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryParams {
    /// Predicate source text; empty matches everything
    #[serde(default)]
    pub predicate: String,
    #[serde(default)]
    pub ranges: QueryRanges,
}

impl QueryParams {
    pub fn new(predicate: impl Into<String>) -> Self {
        Self {
            predicate: predicate.into(),
            ranges: QueryRanges::default(),
        }
    }

    /// Builder method to set the ranges
    pub fn with_ranges(mut self, ranges: QueryRanges) -> Self {
        self.ranges = ranges;
        self
    }

    /// Parse the predicate and validate the ranges
    pub fn compile(&self) -> PipelineResult<CompiledQuery> {
        self.ranges.validate()?;
        Ok(CompiledQuery {
            predicate: Predicate::parse(&self.predicate)?,
            ranges: self.ranges,
        })
    }
}

/// A validated query ready to run
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub predicate: Predicate,
    pub ranges: QueryRanges,
}

/// Filter `input` by `query`, recounting groups afterwards.
///
/// Fails when the predicate cannot be evaluated for a record (for example
/// when it does not produce a boolean).
pub fn apply_query(input: &RecordSet, query: &CompiledQuery) -> PipelineResult<RecordSet> {
    let mut records = Vec::new();
    for record in &input.records {
        let in_steps = match (query.ranges.record_range, record.steps) {
            (Some(range), Some(steps)) => range.overlaps(&steps),
            (Some(_), None) => false,
            (None, _) => true,
        };
        let in_index = query.ranges.index_range.map_or(true, |range| {
            (range.start..=range.end).contains(&(record.index as u64))
        });
        if in_steps && in_index && query.predicate.matches(record)? {
            records.push(record.clone());
        }
    }

    let mut output = RecordSet {
        records,
        groups: input.groups.clone(),
    };
    prune_groups(&mut output);
    Ok(output)
}
