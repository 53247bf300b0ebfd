//! Grouping stage: assigns every record to one group per grouping slot.
//!
//! A slot (e.g. `color`, `stroke`, `row`) lists the field paths whose values
//! define its groups. Groups are numbered in order of first appearance.

use crate::types::{GroupInfo, RecordSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Fields one grouping slot groups by
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupingSlot {
    #[serde(default)]
    pub fields: Vec<String>,
}

impl GroupingSlot {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

/// Grouping specification: slot name → grouping fields
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupingSpec {
    #[serde(default)]
    pub slots: BTreeMap<String, GroupingSlot>,
}

impl GroupingSpec {
    /// Builder method to set a slot
    pub fn with_slot<I, S>(mut self, slot: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.slots.insert(slot.into(), GroupingSlot::new(fields));
        self
    }

    /// Slots that actually group by something
    pub fn active_slots(&self) -> impl Iterator<Item = (&String, &GroupingSlot)> {
        self.slots.iter().filter(|(_, slot)| !slot.fields.is_empty())
    }
}

/// Apply `spec` to `input`, replacing any previous group assignment.
pub fn apply_grouping(input: &RecordSet, spec: &GroupingSpec) -> RecordSet {
    let mut records = input.records.clone();
    let mut groups = BTreeMap::new();

    for record in &mut records {
        record.groups.clear();
    }

    for (slot_name, slot) in spec.active_slots() {
        let mut slot_groups: Vec<GroupInfo> = Vec::new();
        let mut index_by_key: HashMap<String, usize> = HashMap::new();

        for record in &mut records {
            let values: BTreeMap<String, Value> = slot
                .fields
                .iter()
                .map(|field| (field.clone(), record.get(field).cloned().unwrap_or(Value::Null)))
                .collect();
            let key = group_key(&slot.fields, &values);

            let group_index = *index_by_key.entry(key.clone()).or_insert_with(|| {
                slot_groups.push(GroupInfo {
                    key,
                    values,
                    size: 0,
                });
                slot_groups.len() - 1
            });
            slot_groups[group_index].size += 1;
            record.groups.insert(slot_name.clone(), group_index);
        }

        groups.insert(slot_name.clone(), slot_groups);
    }

    RecordSet { records, groups }
}

/// Recount group sizes after records were removed, dropping empty groups and
/// renumbering the survivors in their original order.
pub fn prune_groups(set: &mut RecordSet) {
    for (slot_name, slot_groups) in set.groups.iter_mut() {
        let mut sizes = vec![0usize; slot_groups.len()];
        for record in &set.records {
            if let Some(&index) = record.groups.get(slot_name) {
                if let Some(size) = sizes.get_mut(index) {
                    *size += 1;
                }
            }
        }

        let mut remap = vec![None; slot_groups.len()];
        let mut kept = Vec::new();
        for (old_index, group) in slot_groups.drain(..).enumerate() {
            if sizes[old_index] > 0 {
                remap[old_index] = Some(kept.len());
                kept.push(GroupInfo {
                    size: sizes[old_index],
                    ..group
                });
            }
        }
        *slot_groups = kept;

        for record in &mut set.records {
            if let Some(index) = record.groups.get_mut(slot_name) {
                if let Some(Some(new_index)) = remap.get(*index) {
                    *index = *new_index;
                }
            }
        }
    }
}

fn group_key(fields: &[String], values: &BTreeMap<String, Value>) -> String {
    let ordered: Vec<&Value> = fields
        .iter()
        .map(|f| values.get(f).unwrap_or(&Value::Null))
        .collect();
    serde_json::to_string(&ordered).unwrap_or_default()
}
