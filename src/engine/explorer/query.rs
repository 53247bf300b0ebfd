//! Query sub-engine: search form state and its URL persistence.

use crate::engine::events::{EngineEvent, EventsEngine};
use crate::engine::lifecycle::Teardown;
use crate::error::Result;
use crate::navigation::{decode_state, encode_state, History, NavigationAction};
use crate::pipeline::{QueryParams, QueryRanges};
use crate::store::Store;
use crate::types::SequenceType;
use serde::{Deserialize, Serialize};

/// URL parameter holding the query spec
pub const QUERY_PARAM: &str = "query";

/// What the user typed or picked in the search bar
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryForm {
    /// Use `advanced_input` verbatim instead of the simple form
    pub advanced_mode: bool,
    pub advanced_input: String,
    /// Free predicate ANDed with the selections
    pub simple_input: String,
    /// Selected sequence names, ORed together
    pub selections: Vec<String>,
}

/// Persisted query state. Both fields are required when decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub form: QueryForm,
    pub ranges: QueryRanges,
}

impl QuerySpec {
    /// Executable params for this spec
    pub fn to_params(&self, sequence_type: SequenceType) -> QueryParams {
        let predicate = if self.form.advanced_mode {
            self.form.advanced_input.trim().to_string()
        } else {
            let selections = self
                .form
                .selections
                .iter()
                .map(|name| {
                    format!(
                        "{}.name == \"{}\"",
                        sequence_type.field_prefix(),
                        name.replace('\\', "\\\\").replace('"', "\\\"")
                    )
                })
                .collect::<Vec<_>>();
            let selections = any_of(&selections);
            let simple = self.form.simple_input.trim();

            match (selections.is_empty(), simple.is_empty()) {
                (true, true) => String::new(),
                (false, true) => selections,
                (true, false) => simple.to_string(),
                (false, false) => format!("({}) and ({})", selections, simple),
            }
        };

        QueryParams {
            predicate,
            ranges: self.ranges,
        }
    }
}

/// Join `terms` with `or`, nested as a balanced tree so long selection lists
/// stay within the predicate depth limit.
fn any_of(terms: &[String]) -> String {
    const FLAT: usize = 4;
    if terms.len() <= FLAT {
        return terms.join(" or ");
    }
    let (left, right) = terms.split_at(terms.len() / 2);
    format!("({}) or ({})", any_of(left), any_of(right))
}

/// `query` slice
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
    pub spec: QuerySpec,
    /// Params of the last search that was started
    pub applied: Option<QueryParams>,
}

/// Encode a spec for the `query` URL parameter
pub fn encode_query_spec(spec: &QuerySpec) -> Result<String> {
    encode_state(spec)
}

/// Decode the `query` URL parameter
pub fn decode_query_spec(raw: &str) -> Result<QuerySpec> {
    decode_state(raw)
}

/// Handle to the `query` slice
#[derive(Debug, Clone)]
pub struct QueryEngine {
    store: Store,
    events: EventsEngine,
    history: Option<History>,
    sequence_type: SequenceType,
    default_spec: QuerySpec,
}

impl QueryEngine {
    pub fn new(
        store: Store,
        events: EventsEngine,
        history: Option<History>,
        sequence_type: SequenceType,
        default_spec: QuerySpec,
    ) -> Self {
        let initial = default_spec.clone();
        store.set_state("query/@@INIT", |state| {
            state.query = QueryState {
                spec: initial,
                applied: None,
            };
        });
        Self {
            store,
            events,
            history,
            sequence_type,
            default_spec,
        }
    }

    pub fn spec(&self) -> QuerySpec {
        self.store.with_state(|state| state.query.spec.clone())
    }

    /// Params of the current spec
    pub fn params(&self) -> QueryParams {
        self.spec().to_params(self.sequence_type)
    }

    /// Params of the last started search
    pub fn applied(&self) -> Option<QueryParams> {
        self.store.with_state(|state| state.query.applied.clone())
    }

    fn write_spec(&self, action: &str, spec: QuerySpec) {
        self.store.set_state(action, |state| state.query.spec = spec);
        self.events.fire(EngineEvent::QueryChanged);
    }

    pub fn change_form(&self, form: QueryForm) {
        let ranges = self.spec().ranges;
        self.write_spec("query/change_form", QuerySpec { form, ranges });
    }

    pub fn change_ranges(&self, ranges: QueryRanges) {
        let form = self.spec().form;
        self.write_spec("query/change_ranges", QuerySpec { form, ranges });
    }

    pub fn set_spec(&self, spec: QuerySpec) {
        self.write_spec("query/set_spec", spec);
    }

    /// Back to the configured default spec
    pub fn reset(&self) {
        self.write_spec("query/reset", self.default_spec.clone());
    }

    /// Record `params` as applied and persist the current spec to the URL,
    /// replacing or pushing the history entry.
    pub fn apply(&self, params: &QueryParams, replace_history: bool) {
        let applied = params.clone();
        self.store
            .set_state("query/apply", |state| state.query.applied = Some(applied));

        let Some(history) = &self.history else {
            return;
        };
        match encode_query_spec(&self.spec()) {
            Ok(encoded) => {
                let location = history.location().with_search_param(QUERY_PARAM, &encoded);
                if location != history.location() {
                    history.update(location, replace_history);
                }
            }
            Err(e) => tracing::warn!("Failed to encode query spec: {}", e),
        }
    }

    /// Spec stored in the current URL, if present and well-formed
    fn spec_from_url(history: &History) -> Option<QuerySpec> {
        let raw = history.location().search_param(QUERY_PARAM)?;
        match decode_query_spec(&raw) {
            Ok(spec) => Some(spec),
            Err(e) => {
                tracing::warn!("Ignoring malformed persisted query: {}", e);
                None
            }
        }
    }

    /// Replay the persisted spec and follow back/forward navigation.
    pub fn initialize(&self) -> Teardown {
        let Some(history) = self.history.clone() else {
            return Teardown::noop("query");
        };

        if let Some(spec) = Self::spec_from_url(&history) {
            self.store
                .set_state("query/restore", |state| state.query.spec = spec);
        }

        let engine = self.clone();
        let listener = history.listen(move |update| {
            if update.action != NavigationAction::Pop {
                return;
            }
            let Some(history) = &engine.history else {
                return;
            };
            let spec = Self::spec_from_url(history).unwrap_or_else(|| engine.default_spec.clone());
            if spec != engine.spec() {
                engine.write_spec("query/pop", spec);
            }
        });

        Teardown::new("query", move || history.unlisten(listener))
    }
}
