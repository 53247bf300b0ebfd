//! Custom stage: user-supplied post-processing of the filtered records.
//!
//! Anything implementing [`CustomProcessor`] can be plugged into the pipeline.
//! Two processors ship with the crate: [`PassthroughProcessor`] (the default)
//! and [`ScriptProcessor`], which runs a Rhai script over the records.
//!
//! ## Script Interface
//!
//! The script receives `records`, an array of maps with `.key`, `.index`,
//! `.fields` (dotted path → value), `.groups` (slot → group index) and
//! `.meta`. It must return an array of such maps; records may be dropped,
//! reordered or have their `.meta` replaced. Other changes are ignored.
//!
//! Tag every record with its run hash length:
//! ```rhai
//! let len = records.len();
//! for i in 0..len {
//!     records[i].meta = records[i].fields["run.hash"].len();
//! }
//! records
//! ```
//!
//! Keep only the first record of every color group:
//! ```rhai
//! let seen = #{};
//! records.filter(|r| {
//!     let g = `${r.groups.color}`;
//!     if g in seen { false } else { seen[g] = true; true }
//! })
//! ```

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::grouping::prune_groups;
use crate::types::RecordSet;
use async_trait::async_trait;
use rhai::{Array, Dynamic, Engine, Scope, AST};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A custom post-processing step
#[async_trait]
pub trait CustomProcessor: Send + Sync {
    /// Human-readable name used in logs
    fn name(&self) -> &str;

    /// Identity of the processor's options, folded into the stage cache key.
    /// Return something different whenever the processor would produce a
    /// different output for the same input.
    fn options_key(&self) -> String {
        String::new()
    }

    async fn process(&self, input: Arc<RecordSet>) -> PipelineResult<Arc<RecordSet>>;
}

/// Returns its input unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughProcessor;

#[async_trait]
impl CustomProcessor for PassthroughProcessor {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn process(&self, input: Arc<RecordSet>) -> PipelineResult<Arc<RecordSet>> {
        Ok(input)
    }
}

/// Runs a Rhai script over the records
pub struct ScriptProcessor {
    name: String,
    source: String,
    ast: AST,
    engine: Engine,
}

impl ScriptProcessor {
    /// Compile `source`; fails with [`PipelineError::Script`] on syntax errors.
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> PipelineResult<Self> {
        let source = source.into();
        let engine = Self::create_engine();
        let ast = engine
            .compile(&source)
            .map_err(|e| PipelineError::Script(format!("Compile error: {}", e)))?;

        Ok(Self {
            name: name.into(),
            source,
            ast,
            engine,
        })
    }

    /// Load and compile a script file
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let source = std::fs::read_to_string(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "script".to_string());
        Ok(Self::new(name, source)?)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn create_engine() -> Engine {
        let mut engine = Engine::new();

        // Bound runaway scripts
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.set_max_operations(5_000_000);
        engine.set_max_string_size(100_000);

        engine
    }

    fn run(&self, input: &RecordSet) -> PipelineResult<RecordSet> {
        let records: Array = input
            .records
            .iter()
            .map(|record| {
                let mut map = rhai::Map::new();
                map.insert("key".into(), Dynamic::from(record.key.clone()));
                map.insert("index".into(), Dynamic::from_int(record.index as i64));
                map.insert(
                    "fields".into(),
                    Dynamic::from_map(
                        record
                            .fields
                            .iter()
                            .map(|(k, v)| (k.as_str().into(), json_to_dynamic(v)))
                            .collect(),
                    ),
                );
                map.insert(
                    "groups".into(),
                    Dynamic::from_map(
                        record
                            .groups
                            .iter()
                            .map(|(k, v)| (k.as_str().into(), Dynamic::from_int(*v as i64)))
                            .collect(),
                    ),
                );
                map.insert(
                    "meta".into(),
                    record.meta.as_ref().map_or(Dynamic::UNIT, json_to_dynamic),
                );
                Dynamic::from_map(map)
            })
            .collect();

        let mut scope = Scope::new();
        scope.push("records", records);

        let result = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
            .map_err(PipelineError::from_rhai_error)?
            .into_array()
            .map_err(|_| PipelineError::Script("Script must return an array of records".into()))?;

        let by_key: HashMap<&str, usize> = input
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.key.as_str(), i))
            .collect();

        let mut records = Vec::with_capacity(result.len());
        for item in result {
            let map = item
                .try_cast::<rhai::Map>()
                .ok_or_else(|| PipelineError::Script("Script returned a non-map record".into()))?;
            let key = map
                .get("key")
                .and_then(|k| k.clone().into_string().ok())
                .ok_or_else(|| PipelineError::Script("Returned record has no key".into()))?;
            let source = by_key
                .get(key.as_str())
                .map(|&i| &input.records[i])
                .ok_or_else(|| PipelineError::Script(format!("Unknown record key '{}'", key)))?;

            let mut record = source.clone();
            record.meta = match map.get("meta") {
                Some(meta) if !meta.is_unit() => Some(dynamic_to_json(meta)),
                _ => None,
            };
            records.push(record);
        }

        let mut output = RecordSet {
            records,
            groups: input.groups.clone(),
        };
        prune_groups(&mut output);
        Ok(output)
    }
}

impl std::fmt::Debug for ScriptProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptProcessor")
            .field("name", &self.name)
            .field("source", &self.source)
            .finish()
    }
}

#[async_trait]
impl CustomProcessor for ScriptProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn options_key(&self) -> String {
        self.source.clone()
    }

    async fn process(&self, input: Arc<RecordSet>) -> PipelineResult<Arc<RecordSet>> {
        let output = self.run(&input)?;
        tracing::debug!(
            "ScriptProcessor '{}': {} → {} records",
            self.name,
            input.len(),
            output.len()
        );
        Ok(Arc::new(output))
    }
}

pub(crate) fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from_bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from_int(i),
            None => Dynamic::from_float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => Dynamic::from_array(items.iter().map(json_to_dynamic).collect()),
        Value::Object(map) => Dynamic::from_map(
            map.iter()
                .map(|(k, v)| (k.as_str().into(), json_to_dynamic(v)))
                .collect(),
        ),
    }
}

fn dynamic_to_json(value: &Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return Value::from(i);
    }
    if let Ok(f) = value.as_float() {
        return serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if value.is_string() {
        return Value::String(value.clone().into_string().unwrap_or_default());
    }
    if value.is_array() {
        let items = value.clone().into_array().unwrap_or_default();
        return Value::Array(items.iter().map(dynamic_to_json).collect());
    }
    if value.is_map() {
        let map = value.clone().try_cast::<rhai::Map>().unwrap_or_default();
        return Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                .collect::<Map<String, Value>>(),
        );
    }
    Value::String(value.to_string())
}
