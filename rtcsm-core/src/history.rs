//! History records.
//!
//! When a state is exited, every one of its regions that declares a history
//! pseudostate records the subtree it held. Records are overwritten on each
//! exit and live as long as the execution.

use crate::configuration::ConfigNode;
use rtcsm_model::{RegionId, StateMachine};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryStore {
    records: HashMap<RegionId, ConfigNode>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the regions of an exited subtree that declare history.
    pub fn record_exit<C>(&mut self, model: &StateMachine<C>, exited: &ConfigNode) {
        for node in exited.pre_order() {
            for slot in node.slots() {
                let Some(child) = slot.active().filter(|c| !c.is_parked()) else {
                    continue;
                };
                if model.region(slot.region()).has_history() {
                    tracing::trace!(
                        "Recording history of region '{}': '{}'",
                        model.region(slot.region()).key,
                        model.vertex(child.vertex()).key
                    );
                    self.records.insert(slot.region(), child.without_parked());
                }
            }
        }
    }

    /// Full saved subtree, for deep history.
    pub fn deep(&self, region: RegionId) -> Option<&ConfigNode> {
        self.records.get(&region)
    }

    /// Saved immediate child only, for shallow history.
    pub fn shallow(&self, region: RegionId) -> Option<ConfigNode> {
        self.records.get(&region).map(ConfigNode::trimmed)
    }

    pub fn insert(&mut self, region: RegionId, node: ConfigNode) {
        self.records.insert(region, node);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RegionId, &ConfigNode)> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
