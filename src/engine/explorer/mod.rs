//! Explorer-specific sub-engines: search query and grouping.
//!
//! Both own a spec that is serializable into the URL (`query` and
//! `groupings` parameters) and change it only through their mutators, which
//! announce the change on the event bus.

pub mod groupings;
pub mod query;

pub use groupings::{
    decode_grouping_spec, encode_grouping_spec, GroupingsEngine, GroupingsState, GROUPINGS_PARAM,
};
pub use query::{
    decode_query_spec, encode_query_spec, QueryEngine, QueryForm, QuerySpec, QueryState,
    QUERY_PARAM,
};
