//! Query predicate language.
//!
//! A predicate compares dotted field paths with literals (or other fields)
//! and combines the comparisons with boolean operators:
//!
//! ```text
//! metric.name == "loss" and (run.hparams.lr < 0.01 or not run.archived == true)
//! metric.context.subset startswith "tr"
//! ```
//!
//! Predicates are compiled to a Rhai expression. The query dialect is
//! rewritten first: every field path becomes a lookup into a per-record map,
//! `and`/`or` become `&&`/`||`, `not` wraps its operand up to the next
//! `and`/`or`/`)` so it binds looser than comparisons, `None`/`null` become
//! `()`, and `contains`/`startswith` are custom operators. Missing fields
//! read as `()`, which compares unequal (and unordered) to every literal.
//!
//! Precedence from loosest to tightest: `or`, `and`, `not`, comparison.
//! An empty (or whitespace-only) predicate matches every record.

use crate::pipeline::custom::json_to_dynamic;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::stage::StageKind;
use crate::types::FlatRecord;
use rhai::{Dynamic, Engine, Position, Scope, AST};
use std::fmt;
use std::sync::Arc;

/// Name of the per-record field map inside the compiled expression
const FIELDS_VAR: &str = "fields";

/// Expression depth limit for compiled predicates (Rhai's own defaults)
pub const MAX_QUERY_DEPTH: usize = if cfg!(debug_assertions) { 32 } else { 64 };

/// Compiled query predicate
#[derive(Clone)]
pub struct Predicate {
    source: String,
    compiled: Option<Compiled>,
}

#[derive(Clone)]
struct Compiled {
    engine: Arc<Engine>,
    ast: Arc<AST>,
    /// Field paths referenced by the predicate, in first-use order
    paths: Arc<[String]>,
}

impl Predicate {
    /// Predicate matching every record
    pub fn always() -> Self {
        Self {
            source: String::new(),
            compiled: None,
        }
    }

    /// Parse predicate source text
    pub fn parse(source: &str) -> PipelineResult<Self> {
        let rewrite = rewrite(source)?;
        if rewrite.is_empty() {
            return Ok(Self::always());
        }

        let engine = create_engine()?;
        let ast = engine
            .compile_expression(&rewrite.script)
            .map_err(|err| invalid(rewrite.source_offset(err.1), err.0.to_string()))?;

        Ok(Self {
            source: source.to_string(),
            compiled: Some(Compiled {
                engine: Arc::new(engine),
                ast: Arc::new(ast),
                paths: rewrite.paths.into(),
            }),
        })
    }

    /// Whether this predicate matches every record
    pub fn is_always(&self) -> bool {
        self.compiled.is_none()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against one record
    pub fn matches(&self, record: &FlatRecord) -> PipelineResult<bool> {
        let Some(compiled) = &self.compiled else {
            return Ok(true);
        };

        let fields: rhai::Map = compiled
            .paths
            .iter()
            .map(|path| {
                let value = record.get(path).map_or(Dynamic::UNIT, json_to_dynamic);
                (path.as_str().into(), value)
            })
            .collect();

        let mut scope = Scope::new();
        scope.push_constant(FIELDS_VAR, fields);

        compiled
            .engine
            .eval_ast_with_scope::<bool>(&mut scope, &compiled.ast)
            .map_err(|err| PipelineError::stage(StageKind::Query, err.to_string()))
    }
}

impl Default for Predicate {
    fn default() -> Self {
        Self::always()
    }
}

impl PartialEq for Predicate {
    fn eq(&self, other: &Self) -> bool {
        self.source.trim() == other.source.trim()
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predicate")
            .field("source", &self.source)
            .field("always", &self.is_always())
            .finish()
    }
}

fn create_engine() -> PipelineResult<Engine> {
    let mut engine = Engine::new();

    // Deep nesting fails to compile with ExprTooDeep
    engine.set_max_expr_depths(MAX_QUERY_DEPTH, MAX_QUERY_DEPTH);
    engine.set_max_call_levels(8);
    engine.set_max_operations(10_000);
    engine.set_max_string_size(100_000);

    for operator in ["contains", "startswith"] {
        engine
            .register_custom_operator(operator, 110)
            .map_err(|message| invalid(0, message))?;
    }
    engine.register_fn("contains", contains);
    engine.register_fn("startswith", starts_with);

    Ok(engine)
}

fn contains(haystack: Dynamic, needle: Dynamic) -> bool {
    if haystack.is_string() && needle.is_string() {
        let (Ok(haystack), Ok(needle)) = (haystack.into_string(), needle.into_string()) else {
            return false;
        };
        return haystack.contains(needle.as_str());
    }
    match haystack.into_array() {
        Ok(items) => items.iter().any(|item| same_value(item, &needle)),
        Err(_) => false,
    }
}

fn starts_with(text: Dynamic, prefix: Dynamic) -> bool {
    match (text.into_string(), prefix.into_string()) {
        (Ok(text), Ok(prefix)) => text.starts_with(prefix.as_str()),
        _ => false,
    }
}

fn as_number(value: &Dynamic) -> Option<f64> {
    value
        .as_int()
        .map(|i| i as f64)
        .ok()
        .or_else(|| value.as_float().ok())
}

fn same_value(a: &Dynamic, b: &Dynamic) -> bool {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x == y;
    }
    a.type_name() == b.type_name() && a.to_string() == b.to_string()
}

fn invalid(offset: usize, message: impl Into<String>) -> PipelineError {
    PipelineError::InvalidQuery {
        offset,
        message: message.into(),
    }
}

// ─── Rewrite ────────────────────────────────────────────────────────────────

/// Predicate source rewritten into a Rhai expression
#[derive(Debug, Default)]
struct Rewrite {
    script: String,
    /// (script byte offset, source byte offset) at the start of every piece
    spans: Vec<(usize, usize)>,
    paths: Vec<String>,
    source_len: usize,
}

impl Rewrite {
    fn is_empty(&self) -> bool {
        self.script.trim().is_empty()
    }

    fn emit(&mut self, source_offset: usize, text: &str) {
        self.spans.push((self.script.len(), source_offset));
        self.script.push_str(text);
    }

    fn emit_field(&mut self, source_offset: usize, path: String) {
        self.emit(source_offset, &format!("{}[\"{}\"]", FIELDS_VAR, path));
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    /// Map a Rhai error position back into the predicate source
    fn source_offset(&self, position: Position) -> usize {
        let (Some(line), Some(column)) = (position.line(), position.position()) else {
            return self.source_len;
        };

        let mut offset = 0;
        for (index, text) in self.script.split_inclusive('\n').enumerate() {
            if index + 1 == line {
                offset += text
                    .char_indices()
                    .nth(column.saturating_sub(1))
                    .map_or(text.len(), |(i, _)| i);
                break;
            }
            offset += text.len();
        }

        match self.spans.iter().rev().find(|(script, _)| *script <= offset) {
            Some(_) if offset >= self.script.len() => self.source_len,
            Some((_, source)) => *source,
            None => 0,
        }
    }
}

fn rewrite(source: &str) -> PipelineResult<Rewrite> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut out = Rewrite {
        source_len: source.len(),
        ..Rewrite::default()
    };
    // Paren depth of every `not` still waiting for its closing paren
    let mut open_nots: Vec<usize> = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        match c {
            c if c.is_whitespace() => {
                out.emit(offset, " ");
                i += 1;
            }
            '(' => {
                out.emit(offset, "(");
                depth += 1;
                i += 1;
            }
            ')' => {
                close_nots(&mut out, &mut open_nots, depth, offset);
                out.emit(offset, ")");
                depth = depth.saturating_sub(1);
                i += 1;
            }
            '=' | '!' if next == Some('=') => {
                out.emit(offset, if c == '=' { "==" } else { "!=" });
                i += 2;
            }
            '>' | '<' => {
                let with_eq = next == Some('=');
                out.emit(
                    offset,
                    match (c, with_eq) {
                        ('>', true) => ">=",
                        ('>', false) => ">",
                        ('<', true) => "<=",
                        _ => "<",
                    },
                );
                i += if with_eq { 2 } else { 1 };
            }
            '"' | '\'' => {
                let (text, consumed) = read_string(&chars[i..], offset)?;
                out.emit(offset, &quote(&text));
                i += consumed;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].1.is_ascii_digit() || matches!(chars[i].1, '.' | 'e' | 'E'))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
                out.emit(offset, &text);
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].1.is_alphanumeric() || matches!(chars[i].1, '_' | '.'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, c)| c).collect();
                match word.as_str() {
                    "and" | "or" => {
                        close_nots(&mut out, &mut open_nots, depth, offset);
                        out.emit(offset, if word == "and" { "&&" } else { "||" });
                    }
                    "not" => {
                        out.emit(offset, "!(");
                        open_nots.push(depth);
                    }
                    "contains" | "startswith" => out.emit(offset, &word),
                    "true" | "True" => out.emit(offset, "true"),
                    "false" | "False" => out.emit(offset, "false"),
                    "null" | "None" => out.emit(offset, "()"),
                    _ => out.emit_field(offset, word),
                }
            }
            other => return Err(invalid(offset, format!("unexpected character '{}'", other))),
        }
    }
    close_nots(&mut out, &mut open_nots, depth, source.len());

    Ok(out)
}

/// Close every `not` opened at paren depth `depth`
fn close_nots(out: &mut Rewrite, open_nots: &mut Vec<usize>, depth: usize, at: usize) {
    while open_nots.last() == Some(&depth) {
        open_nots.pop();
        out.emit(at, ")");
    }
}

/// Quote `text` as a Rhai string literal
fn quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for c in text.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// Read a quoted string starting at `chars[0]`; returns the text and the
/// number of chars consumed including both quotes.
fn read_string(chars: &[(usize, char)], offset: usize) -> PipelineResult<(String, usize)> {
    let quote = chars[0].1;
    let mut text = String::new();
    let mut i = 1;

    while i < chars.len() {
        match chars[i].1 {
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .map(|(_, c)| *c)
                    .ok_or_else(|| invalid(chars[i].0, "dangling escape"))?;
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
                i += 2;
            }
            c if c == quote => return Ok((text, i + 1)),
            c => {
                text.push(c);
                i += 1;
            }
        }
    }

    Err(invalid(offset, "unterminated string literal"))
}
