//! Arena builder for static models.
//!
//! The builder only inserts and indexes. It rejects identity problems
//! (duplicate keys, a second initial or history pseudostate in a region)
//! but does not check well-formedness; a malformed model is the caller's
//! responsibility.

use crate::behavior::{ActionFn, ActivityFn, BehaviorError, Delay, Event, Guard, GuardFn};
use crate::error::ModelError;
use crate::ids::{RegionId, TransitionId, VertexId};
use crate::machine::StateMachine;
use crate::transition::{Transition, TransitionKind};
use crate::vertex::{Owner, PseudoKind, Region, RegionOwner, StateBehavior, Vertex, VertexKind};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Description of a transition to add.
pub struct TransitionSpec<C> {
    source: VertexId,
    target: VertexId,
    kind: TransitionKind,
    triggers: Vec<String>,
    guard: Option<Guard<C>>,
    effect: Option<ActionFn<C>>,
    timer: Option<Delay<C>>,
    name: Option<String>,
}

impl<C> TransitionSpec<C> {
    pub fn new(source: VertexId, target: VertexId) -> Self {
        Self {
            source,
            target,
            kind: TransitionKind::External,
            triggers: Vec::new(),
            guard: None,
            effect: None,
            timer: None,
            name: None,
        }
    }

    /// Adds a trigger.
    pub fn on(mut self, trigger: impl Into<String>) -> Self {
        self.triggers.push(trigger.into());
        self
    }

    pub fn kind(mut self, kind: TransitionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn guard<F>(mut self, f: F) -> Self
    where
        F: Fn(&C, &Event) -> Result<bool, BehaviorError> + Send + Sync + 'static,
    {
        self.guard = Some(Guard::When(Arc::new(f)));
        self
    }

    /// Uses a guard function that is already shared.
    pub fn guard_fn(mut self, f: GuardFn<C>) -> Self {
        self.guard = Some(Guard::When(f));
        self
    }

    /// Marks this transition as the `else` branch of the preceding one.
    pub fn else_guard(mut self) -> Self {
        self.guard = Some(Guard::Else);
        self
    }

    pub fn effect<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut C, &Event) -> Result<(), BehaviorError> + Send + Sync + 'static,
    {
        self.effect = Some(Arc::new(f));
        self
    }

    pub fn effect_fn(mut self, f: ActionFn<C>) -> Self {
        self.effect = Some(f);
        self
    }

    /// Fires after a fixed delay once the source state is entered.
    pub fn after(mut self, delay: Duration) -> Self {
        self.timer = Some(Delay::Fixed(delay));
        self
    }

    /// Fires after a delay computed from the context when the timer is armed.
    pub fn after_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&C) -> Duration + Send + Sync + 'static,
    {
        self.timer = Some(Delay::Computed(Arc::new(f)));
        self
    }

    pub fn delay(mut self, delay: Delay<C>) -> Self {
        self.timer = Some(delay);
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Builds a [`StateMachine`].
pub struct ModelBuilder<C> {
    name: String,
    vertices: Vec<Vertex<C>>,
    regions: Vec<Region>,
    transitions: Vec<Transition<C>>,
    vertex_keys: HashMap<String, VertexId>,
    region_keys: HashMap<String, RegionId>,
}

impl<C> ModelBuilder<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vertices: Vec::new(),
            regions: Vec::new(),
            transitions: Vec::new(),
            vertex_keys: HashMap::new(),
            region_keys: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a region owned by the machine.
    pub fn add_region(&mut self, key: impl Into<String>) -> Result<RegionId, ModelError> {
        self.push_region(key.into(), RegionOwner::Machine)
    }

    /// Adds a region owned by a state.
    pub fn add_state_region(
        &mut self,
        state: VertexId,
        key: impl Into<String>,
    ) -> Result<RegionId, ModelError> {
        let key = key.into();
        if !self.vertex_ref(state)?.is_state() {
            return Err(ModelError::InvalidOwner {
                key: self.vertices[state.index()].key.clone(),
                what: "regions",
            });
        }
        self.push_region(key, RegionOwner::State(state))
    }

    pub fn add_state(
        &mut self,
        region: RegionId,
        key: impl Into<String>,
    ) -> Result<VertexId, ModelError> {
        self.push_in_region(region, key.into(), VertexKind::State(StateBehavior::default()))
    }

    pub fn add_final(
        &mut self,
        region: RegionId,
        key: impl Into<String>,
    ) -> Result<VertexId, ModelError> {
        self.push_in_region(region, key.into(), VertexKind::Final)
    }

    /// Adds a pseudostate to a region. Entry and exit points go through
    /// [`add_connection_point`](Self::add_connection_point).
    pub fn add_pseudostate(
        &mut self,
        region: RegionId,
        key: impl Into<String>,
        kind: PseudoKind,
    ) -> Result<VertexId, ModelError> {
        let key = key.into();
        if kind.is_connection_point() {
            return Err(ModelError::InvalidDefinition {
                reason: format!("{} '{}' must be a connection point", kind, key),
            });
        }
        self.push_in_region(region, key, VertexKind::Pseudo(kind))
    }

    /// Adds an entry or exit point to a state.
    pub fn add_connection_point(
        &mut self,
        state: VertexId,
        key: impl Into<String>,
        kind: PseudoKind,
    ) -> Result<VertexId, ModelError> {
        let key = key.into();
        if !self.vertex_ref(state)?.is_state() {
            return Err(ModelError::InvalidOwner {
                key: self.vertices[state.index()].key.clone(),
                what: "connection points",
            });
        }
        self.push_connection_point(Owner::State(state), key, kind)
    }

    /// Adds an entry or exit point to the machine itself, for use as a
    /// submachine template.
    pub fn add_machine_connection_point(
        &mut self,
        key: impl Into<String>,
        kind: PseudoKind,
    ) -> Result<VertexId, ModelError> {
        self.push_connection_point(Owner::Machine, key.into(), kind)
    }

    pub fn set_name(&mut self, vertex: VertexId, name: impl Into<String>) -> Result<(), ModelError> {
        self.vertex_mut(vertex)?.name = Some(name.into());
        Ok(())
    }

    pub fn set_region_name(
        &mut self,
        region: RegionId,
        name: impl Into<String>,
    ) -> Result<(), ModelError> {
        let r = self
            .regions
            .get_mut(region.index())
            .ok_or_else(|| ModelError::UnknownVertex {
                key: region.to_string(),
            })?;
        r.name = Some(name.into());
        Ok(())
    }

    pub fn on_entry<F>(&mut self, state: VertexId, f: F) -> Result<(), ModelError>
    where
        F: Fn(&mut C, &Event) -> Result<(), BehaviorError> + Send + Sync + 'static,
    {
        self.behavior_mut(state)?.entry.push(Arc::new(f));
        Ok(())
    }

    pub fn on_exit<F>(&mut self, state: VertexId, f: F) -> Result<(), ModelError>
    where
        F: Fn(&mut C, &Event) -> Result<(), BehaviorError> + Send + Sync + 'static,
    {
        self.behavior_mut(state)?.exit.push(Arc::new(f));
        Ok(())
    }

    pub fn on_entry_fn(&mut self, state: VertexId, f: ActionFn<C>) -> Result<(), ModelError> {
        self.behavior_mut(state)?.entry.push(f);
        Ok(())
    }

    pub fn on_exit_fn(&mut self, state: VertexId, f: ActionFn<C>) -> Result<(), ModelError> {
        self.behavior_mut(state)?.exit.push(f);
        Ok(())
    }

    /// Sets the do-activity of a state.
    ///
    /// The activity gets its own copy of the context. Writes to that copy are
    /// discarded; only the activity's result reaches the execution.
    pub fn set_activity<F>(&mut self, state: VertexId, f: F) -> Result<(), ModelError>
    where
        F: Fn(C, CancellationToken) -> Result<(), BehaviorError> + Send + Sync + 'static,
    {
        let activity: ActivityFn<C> = Arc::new(f);
        self.behavior_mut(state)?.activity = Some(activity);
        Ok(())
    }

    /// Declares a deferrable trigger on a state.
    pub fn defer(&mut self, state: VertexId, trigger: impl Into<String>) -> Result<(), ModelError> {
        self.behavior_mut(state)?.deferred.push(trigger.into());
        Ok(())
    }

    pub fn add_transition(&mut self, spec: TransitionSpec<C>) -> Result<TransitionId, ModelError> {
        self.vertex_ref(spec.source)?;
        self.vertex_ref(spec.target)?;
        let id = TransitionId::new(self.transitions.len());
        self.transitions.push(Transition {
            id,
            source: spec.source,
            target: spec.target,
            kind: spec.kind,
            triggers: spec.triggers,
            guard: spec.guard,
            effect: spec.effect,
            timer: spec.timer,
            name: spec.name,
        });
        Ok(id)
    }

    /// Adds a state whose contents are a copy of `template`.
    ///
    /// Template keys are prefixed with `"{key}/"`. Root regions of the
    /// template become regions of the new state, and machine connection
    /// points become connection points of the new state.
    pub fn add_submachine_state(
        &mut self,
        region: RegionId,
        key: impl Into<String>,
        template: &ModelBuilder<C>,
    ) -> Result<VertexId, ModelError> {
        let key = key.into();
        let state = self.add_state(region, key.clone())?;
        self.vertices[state.index()].submachine = Some(template.name.clone());

        let vertex_base = self.vertices.len();
        let region_base = self.regions.len();
        let transition_base = self.transitions.len();
        let map_vertex = |v: VertexId| VertexId::new(vertex_base + v.index());
        let map_region = |r: RegionId| RegionId::new(region_base + r.index());

        for r in &template.regions {
            let owner = match r.owner {
                RegionOwner::Machine => RegionOwner::State(state),
                RegionOwner::State(s) => RegionOwner::State(map_vertex(s)),
            };
            let new_key = format!("{}/{}", key, r.key);
            if self.region_keys.contains_key(&new_key) {
                return Err(ModelError::DuplicateRegion { key: new_key });
            }
            let id = map_region(r.id);
            self.region_keys.insert(new_key.clone(), id);
            self.regions.push(blank_region(id, new_key, r.name.clone(), owner));
        }

        for v in &template.vertices {
            let owner = match v.owner {
                Owner::Region(r) => Owner::Region(map_region(r)),
                Owner::State(s) => Owner::State(map_vertex(s)),
                Owner::Machine => Owner::State(state),
            };
            let new_key = format!("{}/{}", key, v.key);
            if self.vertex_keys.contains_key(&new_key) {
                return Err(ModelError::DuplicateVertex { key: new_key });
            }
            let id = map_vertex(v.id);
            let name = match (&v.name, v.owner) {
                (None, Owner::Machine) => Some(v.key.clone()),
                (name, _) => name.clone(),
            };
            self.vertex_keys.insert(new_key.clone(), id);
            let mut copy = blank_vertex(id, new_key, owner, v.kind.clone());
            copy.name = name;
            copy.submachine = v.submachine.clone();
            self.vertices.push(copy);
        }

        for t in &template.transitions {
            let mut copy = t.clone();
            copy.id = TransitionId::new(transition_base + t.id.index());
            copy.source = map_vertex(t.source);
            copy.target = map_vertex(t.target);
            self.transitions.push(copy);
        }

        tracing::debug!(
            "Inlined submachine '{}' as '{}' ({} vertices, {} regions)",
            template.name,
            key,
            template.vertices.len(),
            template.regions.len()
        );

        Ok(state)
    }

    /// Looks up a vertex added earlier.
    pub fn find_vertex(&self, key: &str) -> Option<VertexId> {
        self.vertex_keys.get(key).copied()
    }

    pub fn find_region(&self, key: &str) -> Option<RegionId> {
        self.region_keys.get(key).copied()
    }

    /// Indexes the arena and produces the immutable model.
    pub fn build(self) -> Result<StateMachine<C>, ModelError> {
        let mut vertices = self.vertices;
        let mut regions = self.regions;
        let transitions = self.transitions;

        let mut vertex_keys = HashMap::with_capacity(vertices.len());
        for v in &vertices {
            if vertex_keys.insert(v.key.clone(), v.id).is_some() {
                return Err(ModelError::DuplicateVertex { key: v.key.clone() });
            }
        }
        let mut region_keys = HashMap::with_capacity(regions.len());
        for r in &regions {
            if region_keys.insert(r.key.clone(), r.id).is_some() {
                return Err(ModelError::DuplicateRegion { key: r.key.clone() });
            }
        }

        let mut roots = Vec::new();
        for r in &regions {
            match r.owner {
                RegionOwner::Machine => roots.push(r.id),
                RegionOwner::State(s) => vertices[s.index()].regions.push(r.id),
            }
        }

        let mut connection_points = Vec::new();
        for i in 0..vertices.len() {
            let id = vertices[i].id;
            match vertices[i].owner {
                Owner::Region(r) => {
                    let region = &mut regions[r.index()];
                    region.vertices.push(id);
                    let slot = match vertices[i].pseudo_kind() {
                        Some(PseudoKind::Initial) => Some((&mut region.initial, "initial")),
                        Some(PseudoKind::ShallowHistory) => {
                            Some((&mut region.shallow_history, "shallow history"))
                        }
                        Some(PseudoKind::DeepHistory) => {
                            Some((&mut region.deep_history, "deep history"))
                        }
                        _ => None,
                    };
                    if let Some((slot, kind)) = slot {
                        if slot.is_some() {
                            return Err(ModelError::DuplicatePseudostate {
                                region: region.key.clone(),
                                kind,
                            });
                        }
                        *slot = Some(id);
                    }
                }
                Owner::State(s) => vertices[s.index()].connection_points.push(id),
                Owner::Machine => connection_points.push(id),
            }
        }

        for t in &transitions {
            vertices[t.source.index()].outgoing.push(t.id);
            vertices[t.target.index()].incoming.push(t.id);
        }

        let mut machine = StateMachine {
            name: self.name,
            vertices,
            regions,
            transitions,
            roots,
            connection_points,
            vertex_keys,
            region_keys,
        };

        let vertex_depths: Vec<usize> = (0..machine.vertices.len())
            .map(|i| machine.ancestors(VertexId::new(i)).len())
            .collect();
        let region_depths: Vec<usize> = machine
            .regions
            .iter()
            .map(|r| match r.owner {
                RegionOwner::Machine => 0,
                RegionOwner::State(s) => vertex_depths[s.index()] + 1,
            })
            .collect();
        let mut region_triggers: Vec<BTreeSet<String>> = vec![BTreeSet::new(); machine.regions.len()];
        for t in &machine.transitions {
            if t.triggers.is_empty() {
                continue;
            }
            for r in machine.vertex_chain(machine.position(t.source)) {
                region_triggers[r.index()].extend(t.triggers.iter().cloned());
            }
        }

        for (v, depth) in machine.vertices.iter_mut().zip(vertex_depths) {
            v.depth = depth;
        }
        for ((r, depth), triggers) in machine
            .regions
            .iter_mut()
            .zip(region_depths)
            .zip(region_triggers)
        {
            r.depth = depth;
            r.triggers = triggers;
        }

        tracing::debug!(
            "Built model '{}': {} vertices, {} regions, {} transitions",
            machine.name,
            machine.vertices.len(),
            machine.regions.len(),
            machine.transitions.len()
        );

        Ok(machine)
    }

    fn push_region(&mut self, key: String, owner: RegionOwner) -> Result<RegionId, ModelError> {
        if self.region_keys.contains_key(&key) {
            return Err(ModelError::DuplicateRegion { key });
        }
        let id = RegionId::new(self.regions.len());
        self.region_keys.insert(key.clone(), id);
        self.regions.push(blank_region(id, key, None, owner));
        Ok(id)
    }

    fn push_in_region(
        &mut self,
        region: RegionId,
        key: String,
        kind: VertexKind<C>,
    ) -> Result<VertexId, ModelError> {
        if region.index() >= self.regions.len() {
            return Err(ModelError::UnknownVertex {
                key: region.to_string(),
            });
        }
        self.push_vertex(key, Owner::Region(region), kind)
    }

    fn push_connection_point(
        &mut self,
        owner: Owner,
        key: String,
        kind: PseudoKind,
    ) -> Result<VertexId, ModelError> {
        if !kind.is_connection_point() {
            return Err(ModelError::InvalidDefinition {
                reason: format!("{} '{}' cannot be a connection point", kind, key),
            });
        }
        self.push_vertex(key, owner, VertexKind::Pseudo(kind))
    }

    fn push_vertex(
        &mut self,
        key: String,
        owner: Owner,
        kind: VertexKind<C>,
    ) -> Result<VertexId, ModelError> {
        if self.vertex_keys.contains_key(&key) {
            return Err(ModelError::DuplicateVertex { key });
        }
        let id = VertexId::new(self.vertices.len());
        self.vertex_keys.insert(key.clone(), id);
        self.vertices.push(blank_vertex(id, key, owner, kind));
        Ok(id)
    }

    fn vertex_ref(&self, id: VertexId) -> Result<&Vertex<C>, ModelError> {
        self.vertices
            .get(id.index())
            .ok_or_else(|| ModelError::UnknownVertex { key: id.to_string() })
    }

    fn vertex_mut(&mut self, id: VertexId) -> Result<&mut Vertex<C>, ModelError> {
        self.vertices
            .get_mut(id.index())
            .ok_or_else(|| ModelError::UnknownVertex { key: id.to_string() })
    }

    fn behavior_mut(&mut self, state: VertexId) -> Result<&mut StateBehavior<C>, ModelError> {
        let vertex = self.vertex_mut(state)?;
        match &mut vertex.kind {
            VertexKind::State(b) => Ok(b),
            _ => Err(ModelError::InvalidOwner {
                key: vertex.key.clone(),
                what: "behaviours",
            }),
        }
    }
}

fn blank_vertex<C>(id: VertexId, key: String, owner: Owner, kind: VertexKind<C>) -> Vertex<C> {
    Vertex {
        id,
        key,
        name: None,
        owner,
        kind,
        submachine: None,
        regions: Vec::new(),
        connection_points: Vec::new(),
        outgoing: Vec::new(),
        incoming: Vec::new(),
        depth: 0,
    }
}

fn blank_region(id: RegionId, key: String, name: Option<String>, owner: RegionOwner) -> Region {
    Region {
        id,
        key,
        name,
        owner,
        vertices: Vec::new(),
        initial: None,
        shallow_history: None,
        deep_history: None,
        triggers: BTreeSet::new(),
        depth: 0,
    }
}
