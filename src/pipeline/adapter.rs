//! Adapter stage: turns raw instructions into typed, flattened records.
//!
//! Run params land under `run.*`, the series under `<sequence>.*`. Nested
//! objects are expanded up to `object_depth` levels; anything deeper stays a
//! JSON value at the last expanded path and is still reachable through
//! [`FlatRecord::get`].

use crate::types::{FlatRecord, Instruction, RecordSet, SequenceType};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Adapt `instructions` into a record set (no groups assigned yet).
pub fn adapt(
    instructions: &[Instruction],
    sequence_type: SequenceType,
    object_depth: usize,
) -> RecordSet {
    let prefix = sequence_type.field_prefix();

    let records = instructions
        .iter()
        .enumerate()
        .map(|(index, instruction)| {
            let mut fields = BTreeMap::new();

            flatten_into("run", &instruction.run.params, object_depth, &mut fields);
            fields.insert(
                "run.hash".to_string(),
                Value::String(instruction.run.hash.clone()),
            );

            let context_prefix = format!("{}.context", prefix);
            flatten_into(&context_prefix, &instruction.context, object_depth, &mut fields);
            fields.insert(
                format!("{}.name", prefix),
                Value::String(instruction.name.clone()),
            );

            FlatRecord {
                key: instruction.key(),
                index,
                fields,
                steps: instruction.steps,
                blob: instruction.blob.clone(),
                groups: BTreeMap::new(),
                meta: None,
            }
        })
        .collect();

    RecordSet {
        records,
        groups: BTreeMap::new(),
    }
}

fn flatten_into(
    prefix: &str,
    map: &Map<String, Value>,
    depth: usize,
    out: &mut BTreeMap<String, Value>,
) {
    if depth == 0 {
        out.insert(prefix.to_string(), Value::Object(map.clone()));
        return;
    }

    for (key, value) in map {
        let path = format!("{}.{}", prefix, key);
        match value {
            Value::Object(inner) if depth > 1 => flatten_into(&path, inner, depth - 1, out),
            _ => {
                out.insert(path, value.clone());
            }
        }
    }
}
