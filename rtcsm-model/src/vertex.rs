//! Vertices and regions.

use crate::behavior::{ActionFn, ActivityFn};
use crate::ids::{RegionId, TransitionId, VertexId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Pseudostate kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PseudoKind {
    Initial,
    Choice,
    Junction,
    Fork,
    Join,
    ShallowHistory,
    DeepHistory,
    EntryPoint,
    ExitPoint,
    Terminate,
}

impl PseudoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PseudoKind::Initial => "initial",
            PseudoKind::Choice => "choice",
            PseudoKind::Junction => "junction",
            PseudoKind::Fork => "fork",
            PseudoKind::Join => "join",
            PseudoKind::ShallowHistory => "shallow_history",
            PseudoKind::DeepHistory => "deep_history",
            PseudoKind::EntryPoint => "entry_point",
            PseudoKind::ExitPoint => "exit_point",
            PseudoKind::Terminate => "terminate",
        }
    }

    /// Entry and exit points belong to a state (or a machine), not a region.
    pub fn is_connection_point(&self) -> bool {
        matches!(self, PseudoKind::EntryPoint | PseudoKind::ExitPoint)
    }

    pub fn is_history(&self) -> bool {
        matches!(self, PseudoKind::ShallowHistory | PseudoKind::DeepHistory)
    }
}

impl fmt::Display for PseudoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a vertex is placed in the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Regular member of a region.
    Region(RegionId),
    /// Connection point of a (submachine) state.
    State(VertexId),
    /// Connection point of the machine itself. Only meaningful for
    /// templates that are later inlined as submachines.
    Machine,
}

/// Owner of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionOwner {
    Machine,
    State(VertexId),
}

/// Behaviour attached to a state.
pub struct StateBehavior<C> {
    /// Entry actions, run in declaration order.
    pub entry: Vec<ActionFn<C>>,
    /// Exit actions, run in declaration order.
    pub exit: Vec<ActionFn<C>>,
    /// Do-activity started after entry.
    pub activity: Option<ActivityFn<C>>,
    /// Triggers this state defers while active.
    pub deferred: Vec<String>,
}

impl<C> StateBehavior<C> {
    pub fn defers(&self, name: &str) -> bool {
        self.deferred.iter().any(|d| d == name)
    }
}

impl<C> Default for StateBehavior<C> {
    fn default() -> Self {
        Self {
            entry: Vec::new(),
            exit: Vec::new(),
            activity: None,
            deferred: Vec::new(),
        }
    }
}

impl<C> Clone for StateBehavior<C> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.iter().map(Arc::clone).collect(),
            exit: self.exit.iter().map(Arc::clone).collect(),
            activity: self.activity.as_ref().map(Arc::clone),
            deferred: self.deferred.clone(),
        }
    }
}

impl<C> fmt::Debug for StateBehavior<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateBehavior")
            .field("entry", &self.entry.len())
            .field("exit", &self.exit.len())
            .field("activity", &self.activity.is_some())
            .field("deferred", &self.deferred)
            .finish()
    }
}

/// Closed set of vertex variants.
pub enum VertexKind<C> {
    State(StateBehavior<C>),
    Pseudo(PseudoKind),
    Final,
}

impl<C> Clone for VertexKind<C> {
    fn clone(&self) -> Self {
        match self {
            VertexKind::State(b) => VertexKind::State(b.clone()),
            VertexKind::Pseudo(k) => VertexKind::Pseudo(*k),
            VertexKind::Final => VertexKind::Final,
        }
    }
}

impl<C> fmt::Debug for VertexKind<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VertexKind::State(b) => f.debug_tuple("State").field(b).finish(),
            VertexKind::Pseudo(k) => f.debug_tuple("Pseudo").field(k).finish(),
            VertexKind::Final => f.write_str("Final"),
        }
    }
}

/// Shape of a state, derived from its region count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateShape {
    Simple,
    Composite,
    Orthogonal,
}

/// A vertex of the model.
pub struct Vertex<C> {
    pub id: VertexId,
    /// Unique key across the whole model, including inlined submachines.
    pub key: String,
    /// Optional display name.
    pub name: Option<String>,
    pub owner: Owner,
    pub kind: VertexKind<C>,
    /// Name of the template this state was inlined from, if any.
    pub submachine: Option<String>,

    // Derived by the builder.
    pub regions: Vec<RegionId>,
    pub connection_points: Vec<VertexId>,
    pub outgoing: Vec<TransitionId>,
    pub incoming: Vec<TransitionId>,
    /// Number of ancestor states.
    pub depth: usize,
}

impl<C> Vertex<C> {
    pub fn is_state(&self) -> bool {
        matches!(self.kind, VertexKind::State(_))
    }

    pub fn is_final(&self) -> bool {
        matches!(self.kind, VertexKind::Final)
    }

    pub fn is_pseudo(&self) -> bool {
        matches!(self.kind, VertexKind::Pseudo(_))
    }

    pub fn pseudo_kind(&self) -> Option<PseudoKind> {
        match self.kind {
            VertexKind::Pseudo(k) => Some(k),
            _ => None,
        }
    }

    pub fn behavior(&self) -> Option<&StateBehavior<C>> {
        match &self.kind {
            VertexKind::State(b) => Some(b),
            _ => None,
        }
    }

    /// States own regions; nothing else does.
    pub fn is_region_owner(&self) -> bool {
        self.is_state()
    }

    /// States and final states appear in a state configuration.
    pub fn is_resumable(&self) -> bool {
        self.is_state() || self.is_final()
    }

    pub fn shape(&self) -> Option<StateShape> {
        if !self.is_state() {
            return None;
        }
        Some(match self.regions.len() {
            0 => StateShape::Simple,
            1 => StateShape::Composite,
            _ => StateShape::Orthogonal,
        })
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.key)
    }

    pub fn defers(&self, trigger: &str) -> bool {
        self.behavior().map(|b| b.defers(trigger)).unwrap_or(false)
    }
}

impl<C> fmt::Debug for Vertex<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vertex")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .field("regions", &self.regions)
            .field("depth", &self.depth)
            .finish()
    }
}

/// A region: an ordered set of vertices.
#[derive(Debug, Clone)]
pub struct Region {
    pub id: RegionId,
    pub key: String,
    pub name: Option<String>,
    pub owner: RegionOwner,
    pub vertices: Vec<VertexId>,
    pub initial: Option<VertexId>,
    pub shallow_history: Option<VertexId>,
    pub deep_history: Option<VertexId>,
    /// Triggers of every transition sourced anywhere inside this region.
    pub triggers: BTreeSet<String>,
    /// Number of ancestor states.
    pub depth: usize,
}

impl Region {
    pub fn has_history(&self) -> bool {
        self.shallow_history.is_some() || self.deep_history.is_some()
    }

    pub fn owner_state(&self) -> Option<VertexId> {
        match self.owner {
            RegionOwner::State(s) => Some(s),
            RegionOwner::Machine => None,
        }
    }
}
