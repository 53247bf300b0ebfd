//! The composed state shape.

use crate::engine::blob_uri::BlobUriState;
use crate::engine::events::EventsState;
use crate::engine::explorer::{GroupingsState, QueryState};
use crate::engine::instructions::InstructionsState;
use crate::engine::notifications::NotificationsState;
use crate::engine::pipeline::PipelineState;
use crate::engine::visualizations::VisualizationState;
use serde_json::Value;
use std::collections::BTreeMap;

/// All state of one explorer engine, one slice per sub-engine.
///
/// The slice set is fixed; sub-engines write only their own slice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExplorerState {
    pub pipeline: PipelineState,
    pub instructions: InstructionsState,
    pub query: QueryState,
    pub groupings: GroupingsState,
    /// Per-visualization state keyed by visualization name
    pub visualizations: BTreeMap<String, VisualizationState>,
    pub events: EventsState,
    pub blob_uri: BlobUriState,
    pub notifications: NotificationsState,
    /// Named custom states; the key set is fixed by configuration
    pub custom_states: BTreeMap<String, Value>,
}
