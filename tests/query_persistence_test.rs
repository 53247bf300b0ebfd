//! URL persistence of query and grouping specs
//!
//! Property tests for the encode/decode round trip through a URL parameter,
//! plus engine-level tests for replay and back/forward navigation.

mod common;

use common::builders::{explorer_config, metric_grid, static_source};
use common::wait_for;
use explorer_engine::engine::explorer::{
    decode_grouping_spec, decode_query_spec, encode_grouping_spec, encode_query_spec,
};
use explorer_engine::engine::{QueryForm, QuerySpec, GROUPINGS_PARAM, QUERY_PARAM};
use explorer_engine::pipeline::{GroupingSlot, GroupingSpec, QueryRanges};
use explorer_engine::types::StepRange;
use explorer_engine::{ExplorerEngine, History, Location};
use proptest::collection::{btree_map, vec};
use proptest::prelude::*;

fn step_range() -> impl Strategy<Value = Option<StepRange>> {
    proptest::option::of((any::<u64>(), any::<u64>()).prop_map(|(a, b)| StepRange::new(a, b)))
}

fn query_spec() -> impl Strategy<Value = QuerySpec> {
    (
        any::<bool>(),
        ".*",
        ".*",
        vec("[a-z_]{1,12}", 0..4),
        step_range(),
        step_range(),
    )
        .prop_map(
            |(advanced_mode, advanced_input, simple_input, selections, record_range, index_range)| {
                QuerySpec {
                    form: QueryForm {
                        advanced_mode,
                        advanced_input,
                        simple_input,
                        selections,
                    },
                    ranges: QueryRanges {
                        record_range,
                        index_range,
                    },
                }
            },
        )
}

fn grouping_spec() -> impl Strategy<Value = GroupingSpec> {
    btree_map("[a-z]{1,8}", vec("[a-z.]{1,16}", 0..3), 0..4).prop_map(|slots| GroupingSpec {
        slots: slots
            .into_iter()
            .map(|(slot, fields)| (slot, GroupingSlot::new(fields)))
            .collect(),
    })
}

proptest! {
    #[test]
    fn query_spec_round_trips_through_url(spec in query_spec()) {
        let encoded = encode_query_spec(&spec).unwrap();
        let location = Location::parse("/metrics").with_search_param(QUERY_PARAM, &encoded);
        let href = location.href();

        let raw = Location::parse(&href).search_param(QUERY_PARAM).unwrap();
        prop_assert_eq!(decode_query_spec(&raw).unwrap(), spec);
    }

    #[test]
    fn grouping_spec_round_trips_through_url(spec in grouping_spec()) {
        let encoded = encode_grouping_spec(&spec).unwrap();
        let location = Location::parse("/metrics")
            .with_search_param(GROUPINGS_PARAM, &encoded)
            .with_search_param(QUERY_PARAM, "{}");

        let raw = location.search_param(GROUPINGS_PARAM).unwrap();
        prop_assert_eq!(decode_grouping_spec(&raw).unwrap(), spec);
    }

    #[test]
    fn decoding_never_panics(raw in ".*") {
        let _ = decode_query_spec(&raw);
        let _ = decode_grouping_spec(&raw);
    }
}

#[test]
fn test_incomplete_query_spec_is_rejected() {
    assert!(decode_query_spec("{").is_err());
    assert!(decode_query_spec(r#"{"form":{}}"#).is_err());
    assert!(decode_query_spec(r#"{"ranges":{}}"#).is_err());
    assert!(decode_query_spec(r#"{"form":{},"ranges":{}}"#).is_ok());
}

fn persistent_engine(history: History) -> ExplorerEngine {
    ExplorerEngine::builder(explorer_config("metrics").with_persistence("/metrics"))
        .source(static_source(metric_grid(2)))
        .history(history)
        .build()
}

fn loss_spec() -> QuerySpec {
    QuerySpec {
        form: QueryForm {
            selections: vec!["loss".to_string()],
            ..QueryForm::default()
        },
        ..QuerySpec::default()
    }
}

#[tokio::test]
async fn test_back_and_forward_resync_query() {
    let history = History::at("/metrics");
    let engine = persistent_engine(history.clone());
    let _teardown = engine.initialize().await.unwrap();
    assert_eq!(engine.pipeline().output().len(), 8);

    let next = history
        .location()
        .with_search_param(QUERY_PARAM, &encode_query_spec(&loss_spec()).unwrap());
    history.push(next);
    // Plain pushes are not replayed
    assert_eq!(engine.query().spec(), QuerySpec::default());

    assert!(history.back());
    assert!(history.forward());
    assert_eq!(engine.query().spec(), loss_spec());
    assert!(wait_for(|| engine.pipeline().output().len() == 4).await);

    assert!(history.back());
    assert_eq!(engine.query().spec(), QuerySpec::default());
    assert!(wait_for(|| engine.pipeline().output().len() == 8).await);
}

#[tokio::test]
async fn test_groupings_restored_by_next_engine() {
    let history = History::at("/metrics");
    let first = persistent_engine(history.clone());
    let teardown = first.initialize().await.unwrap();
    first
        .groupings()
        .update_slot("row", ["metric.context.subset"])
        .unwrap();
    let spec = first.groupings().spec();
    teardown.run();

    let second = persistent_engine(history);
    let _teardown = second.initialize().await.unwrap();
    assert_eq!(second.groupings().spec(), spec);
    assert_eq!(second.pipeline().output().group_count(), 2);
}

#[tokio::test]
async fn test_search_pushes_history_entry() {
    let history = History::at("/metrics");
    let engine = persistent_engine(history.clone());
    let _teardown = engine.initialize().await.unwrap();
    assert_eq!(history.len(), 1);

    engine.query().set_spec(loss_spec());
    engine.search().await;

    assert_eq!(history.len(), 2);
    let raw = history.location().search_param(QUERY_PARAM).unwrap();
    assert_eq!(decode_query_spec(&raw).unwrap(), loss_spec());
}
