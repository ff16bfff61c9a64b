//! The immutable static model.

use crate::ids::{RegionId, TransitionId, VertexId};
use crate::transition::Transition;
use crate::vertex::{Owner, PseudoKind, Region, RegionOwner, Vertex};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// An immutable state machine model.
///
/// Produced by [`ModelBuilder::build`](crate::ModelBuilder::build) and never
/// mutated afterwards, so one `Arc<StateMachine<C>>` can back any number of
/// concurrent executions.
pub struct StateMachine<C> {
    pub(crate) name: String,
    pub(crate) vertices: Vec<Vertex<C>>,
    pub(crate) regions: Vec<Region>,
    pub(crate) transitions: Vec<Transition<C>>,
    pub(crate) roots: Vec<RegionId>,
    pub(crate) connection_points: Vec<VertexId>,
    pub(crate) vertex_keys: HashMap<String, VertexId>,
    pub(crate) region_keys: HashMap<String, RegionId>,
}

impl<C> StateMachine<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up a vertex.
    ///
    /// Ids are only valid for the model that created them; a foreign id
    /// panics.
    pub fn vertex(&self, id: VertexId) -> &Vertex<C> {
        &self.vertices[id.index()]
    }

    pub fn region(&self, id: RegionId) -> &Region {
        &self.regions[id.index()]
    }

    pub fn transition(&self, id: TransitionId) -> &Transition<C> {
        &self.transitions[id.index()]
    }

    pub fn vertices(&self) -> impl Iterator<Item = &Vertex<C>> {
        self.vertices.iter()
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn transitions(&self) -> impl Iterator<Item = &Transition<C>> {
        self.transitions.iter()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    /// Regions owned directly by the machine.
    pub fn root_regions(&self) -> &[RegionId] {
        &self.roots
    }

    /// Connection points owned by the machine itself.
    pub fn connection_points(&self) -> &[VertexId] {
        &self.connection_points
    }

    pub fn find_vertex(&self, key: &str) -> Option<VertexId> {
        self.vertex_keys.get(key).copied()
    }

    pub fn find_region(&self, key: &str) -> Option<RegionId> {
        self.region_keys.get(key).copied()
    }

    pub fn find_connection_point(&self, state: VertexId, name: &str) -> Option<VertexId> {
        self.vertex(state)
            .connection_points
            .iter()
            .copied()
            .find(|cp| {
                let v = self.vertex(*cp);
                v.name.as_deref() == Some(name) || v.key.ends_with(&format!("/{}", name))
            })
    }

    /// Returns the vertex that stands in for `v` in the region tree.
    ///
    /// Connection points sit at the position of their owning state.
    pub fn position(&self, v: VertexId) -> VertexId {
        match self.vertex(v).owner {
            Owner::State(s) => s,
            _ => v,
        }
    }

    /// Returns the region containing `v`, or `None` at machine level.
    pub fn container_region(&self, v: VertexId) -> Option<RegionId> {
        match self.vertex(v).owner {
            Owner::Region(r) => Some(r),
            Owner::State(s) => self.container_region(s),
            Owner::Machine => None,
        }
    }

    /// Returns the state owning the region that contains `v`.
    pub fn parent_state(&self, v: VertexId) -> Option<VertexId> {
        self.container_region(v)
            .and_then(|r| self.region(r).owner_state())
    }

    /// Returns the ancestor states of `v`, innermost first.
    pub fn ancestors(&self, v: VertexId) -> Vec<VertexId> {
        let mut out = Vec::new();
        let mut current = self.parent_state(v);
        while let Some(s) = current {
            out.push(s);
            current = self.parent_state(s);
        }
        out
    }

    /// Returns true if state `a` strictly contains `b`.
    pub fn is_ancestor(&self, a: VertexId, b: VertexId) -> bool {
        let mut current = self.parent_state(b);
        while let Some(s) = current {
            if s == a {
                return true;
            }
            current = self.parent_state(s);
        }
        false
    }

    pub fn depth(&self, v: VertexId) -> usize {
        self.vertex(v).depth
    }

    /// Returns the chain of regions from a root region down to `region`.
    pub fn region_chain(&self, region: RegionId) -> Vec<RegionId> {
        let mut chain = vec![region];
        let mut current = self.region(region).owner_state();
        while let Some(s) = current {
            match self.container_region(s) {
                Some(r) => {
                    chain.push(r);
                    current = self.region(r).owner_state();
                }
                None => break,
            }
        }
        chain.reverse();
        chain
    }

    /// Returns the chain of regions from a root region down to the region
    /// containing `v`.
    pub fn vertex_chain(&self, v: VertexId) -> Vec<RegionId> {
        self.container_region(v)
            .map(|r| self.region_chain(r))
            .unwrap_or_default()
    }

    /// Least common ancestor region of two vertices.
    ///
    /// `None` means the vertices only share the machine itself.
    pub fn lca_region(&self, a: VertexId, b: VertexId) -> Option<RegionId> {
        self.lca(&[a, b])
    }

    /// Least common ancestor region of a set of vertices.
    pub fn lca(&self, vertices: &[VertexId]) -> Option<RegionId> {
        let (first, rest) = vertices.split_first()?;
        let mut common = self.vertex_chain(*first);
        for v in rest {
            let chain = self.vertex_chain(*v);
            let shared = common
                .iter()
                .zip(chain.iter())
                .take_while(|(x, y)| x == y)
                .count();
            common.truncate(shared);
        }
        common.last().copied()
    }

    /// Returns the ancestor-or-self of `v` placed directly in `region`.
    pub fn ancestor_in(&self, region: RegionId, v: VertexId) -> Option<VertexId> {
        let mut current = Some(self.position(v));
        while let Some(u) = current {
            if self.container_region(u) == Some(region) {
                return Some(u);
            }
            current = self.parent_state(u);
        }
        None
    }

    /// Returns the region of `state` that contains `v`.
    pub fn region_toward(&self, state: VertexId, v: VertexId) -> Option<RegionId> {
        let regions = &self.vertex(state).regions;
        self.vertex_chain(v)
            .into_iter()
            .find(|r| regions.contains(r))
    }

    /// Triggers declared by transitions sourced inside `region`.
    pub fn region_triggers(&self, region: RegionId) -> &BTreeSet<String> {
        &self.region(region).triggers
    }

    /// Returns true if some transition inside `region` is triggered by `name`.
    pub fn reacts_to(&self, region: RegionId, name: &str) -> bool {
        self.region(region).triggers.contains(name)
    }

    /// Outgoing transitions of `v` that fire on completion.
    pub fn completion_transitions(&self, v: VertexId) -> impl Iterator<Item = TransitionId> + '_ {
        self.vertex(v)
            .outgoing
            .iter()
            .copied()
            .filter(move |t| self.transition(*t).is_completion())
    }

    pub fn has_completion_transitions(&self, v: VertexId) -> bool {
        self.completion_transitions(v).next().is_some()
    }

    /// Outgoing transitions of `v` that carry a timer.
    pub fn timed_transitions(&self, v: VertexId) -> impl Iterator<Item = TransitionId> + '_ {
        self.vertex(v)
            .outgoing
            .iter()
            .copied()
            .filter(move |t| self.transition(*t).is_timed())
    }

    /// Human readable label of a transition.
    pub fn transition_label(&self, t: TransitionId) -> String {
        let tr = self.transition(t);
        match &tr.name {
            Some(name) => name.clone(),
            None => format!(
                "{}->{}",
                self.vertex(tr.source).key,
                self.vertex(tr.target).key
            ),
        }
    }

    /// Returns the pseudostate of `kind` declared in `region`.
    pub fn region_pseudostate(&self, region: RegionId, kind: PseudoKind) -> Option<VertexId> {
        let r = self.region(region);
        match kind {
            PseudoKind::Initial => r.initial,
            PseudoKind::ShallowHistory => r.shallow_history,
            PseudoKind::DeepHistory => r.deep_history,
            _ => r
                .vertices
                .iter()
                .copied()
                .find(|v| self.vertex(*v).pseudo_kind() == Some(kind)),
        }
    }

    /// Returns true if the region belongs to the machine.
    pub fn is_root_region(&self, region: RegionId) -> bool {
        self.region(region).owner == RegionOwner::Machine
    }
}

impl<C> fmt::Debug for StateMachine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("vertices", &self.vertices.len())
            .field("regions", &self.regions.len())
            .field("transitions", &self.transitions.len())
            .finish()
    }
}
