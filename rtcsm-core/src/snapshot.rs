//! Snapshots.
//!
//! A [`Snapshot`] is the portable form of an execution: the configuration
//! tree and history records as string keys, the lifecycle flags and the
//! context. Restoring validates every key against the model before anything
//! is rebuilt.

use crate::configuration::{ConfigNode, Configuration};
use crate::error::EngineError;
use crate::history::HistoryStore;
use crate::runtime::ExecutionId;
use rtcsm_model::{Event, PseudoKind, RegionId, StateMachine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One node of a snapshot tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNode {
    /// Vertex key, or the machine name at the root.
    pub id: String,

    /// Region key. Only set for joins waiting on other regions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SnapshotNode>,
}

impl SnapshotNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            region: None,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: SnapshotNode) -> Self {
        self.children.push(child);
        self
    }

    /// Every id in this subtree, parents first.
    pub fn ids(&self) -> Vec<&str> {
        let mut out = vec![self.id.as_str()];
        for child in &self.children {
            out.extend(child.ids());
        }
        out
    }
}

/// Immutable picture of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<C> {
    pub execution_id: ExecutionId,
    pub state_configuration: SnapshotNode,
    #[serde(default)]
    pub history: BTreeMap<String, SnapshotNode>,
    pub started: bool,
    pub terminated: bool,
    pub context: C,

    /// Deferred events still waiting, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deferred: Vec<Event>,
}

impl<C> Snapshot<C> {
    /// Keys of the active vertices, root excluded.
    pub fn active_ids(&self) -> Vec<&str> {
        self.state_configuration
            .children
            .iter()
            .flat_map(|c| c.ids())
            .collect()
    }
}

/// Builds the snapshot tree of a configuration.
pub(crate) fn capture_configuration<C>(
    model: &StateMachine<C>,
    configuration: &Configuration,
) -> SnapshotNode {
    let mut root = SnapshotNode::new(model.name());
    for slot in configuration.root_slots() {
        if let Some(node) = slot.active() {
            root.children.push(capture_node(model, node, slot.region()));
        }
    }
    root
}

pub(crate) fn capture_history<C>(
    model: &StateMachine<C>,
    history: &HistoryStore,
) -> BTreeMap<String, SnapshotNode> {
    history
        .iter()
        .map(|(region, node)| {
            (
                model.region(*region).key.clone(),
                capture_node(model, node, *region),
            )
        })
        .collect()
}

fn capture_node<C>(model: &StateMachine<C>, node: &ConfigNode, region: RegionId) -> SnapshotNode {
    SnapshotNode {
        id: model.vertex(node.vertex()).key.clone(),
        region: node
            .is_parked()
            .then(|| model.region(region).key.clone()),
        children: node
            .slots()
            .iter()
            .filter_map(|slot| slot.active().map(|n| capture_node(model, n, slot.region())))
            .collect(),
    }
}

/// Validates a snapshot and rebuilds the configuration and history it
/// describes.
pub(crate) fn restore<C, X>(
    model: &StateMachine<C>,
    snapshot: &Snapshot<X>,
) -> Result<(Configuration, HistoryStore), EngineError> {
    let root = &snapshot.state_configuration;
    if root.id != model.name() {
        return Err(EngineError::InvalidSnapshot {
            reason: format!(
                "snapshot is for machine '{}', not '{}'",
                root.id,
                model.name()
            ),
        });
    }

    // Ids first, so the reported error names the missing key rather than
    // a structural symptom of it.
    for child in &root.children {
        check_ids(model, child)?;
    }
    for (region_key, node) in &snapshot.history {
        if model.find_region(region_key).is_none() {
            return Err(EngineError::RegionNotFound {
                id: region_key.clone(),
            });
        }
        check_ids(model, node)?;
    }

    let mut roots: Vec<(RegionId, ConfigNode)> = Vec::new();
    for child in &root.children {
        let (region, node) = build_node(model, child)?;
        if !model.is_root_region(region) {
            return Err(EngineError::InvalidSnapshot {
                reason: format!("'{}' is not a top-level vertex", child.id),
            });
        }
        if roots.iter().any(|(r, _)| *r == region) {
            return Err(EngineError::InvalidSnapshot {
                reason: format!("region '{}' holds two vertices", model.region(region).key),
            });
        }
        roots.push((region, node));
    }
    let configuration = Configuration::from_roots(model, roots);

    let mut history = HistoryStore::new();
    for (region_key, node) in &snapshot.history {
        let region = model
            .find_region(region_key)
            .ok_or_else(|| EngineError::RegionNotFound {
                id: region_key.clone(),
            })?;
        let (home, record) = build_node(model, node)?;
        if home != region {
            return Err(EngineError::InvalidSnapshot {
                reason: format!("history of '{}' holds '{}'", region_key, node.id),
            });
        }
        history.insert(region, record);
    }

    Ok((configuration, history))
}

fn check_ids<C>(model: &StateMachine<C>, node: &SnapshotNode) -> Result<(), EngineError> {
    let vertex = model
        .find_vertex(&node.id)
        .map(|v| model.vertex(v))
        .ok_or_else(|| EngineError::StateNotFound {
            id: node.id.clone(),
        })?;
    match &node.region {
        Some(region) => {
            if vertex.pseudo_kind() != Some(PseudoKind::Join) {
                return Err(EngineError::StateNotFound {
                    id: node.id.clone(),
                });
            }
            if model.find_region(region).is_none() {
                return Err(EngineError::RegionNotFound { id: region.clone() });
            }
        }
        None => {
            if !vertex.is_resumable() {
                return Err(EngineError::StateNotFound {
                    id: node.id.clone(),
                });
            }
        }
    }
    for child in &node.children {
        check_ids(model, child)?;
    }
    Ok(())
}

/// Converts a validated node, returning the region it lives in.
fn build_node<C>(
    model: &StateMachine<C>,
    node: &SnapshotNode,
) -> Result<(RegionId, ConfigNode), EngineError> {
    let not_found = || EngineError::StateNotFound {
        id: node.id.clone(),
    };
    let v = model.find_vertex(&node.id).ok_or_else(not_found)?;

    if let Some(region_key) = &node.region {
        let region = model
            .find_region(region_key)
            .ok_or_else(|| EngineError::RegionNotFound {
                id: region_key.clone(),
            })?;
        return Ok((region, ConfigNode::parked(v)));
    }

    let region = model
        .container_region(v)
        .ok_or_else(|| EngineError::InvalidSnapshot {
            reason: format!("'{}' is not placed in a region", node.id),
        })?;
    let mut config = ConfigNode::new(v, &model.vertex(v).regions);
    for child in &node.children {
        let (child_region, child_node) = build_node(model, child)?;
        let occupied = config
            .slots()
            .iter()
            .any(|s| s.region() == child_region && s.active().is_some());
        if occupied || !config.set_child(child_region, child_node) {
            return Err(EngineError::InvalidSnapshot {
                reason: format!("'{}' cannot hold '{}'", node.id, child.id),
            });
        }
    }
    Ok((region, config))
}
