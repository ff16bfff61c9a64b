//! The live state configuration.
//!
//! A tree mirroring the active part of the model. Each node wraps one
//! active vertex and holds one slot per region of that vertex; a slot holds
//! at most one child. The root is the list of machine regions.
//!
//! A join pseudostate waiting for the remaining arrivals is kept in the
//! slot of the region it arrived from, marked as parked. Parked nodes are
//! not active vertices: they are excluded from [`Configuration::contains`]
//! and from the leaf walk.

use crate::error::EngineError;
use rtcsm_model::{RegionId, StateMachine, VertexId};
use std::collections::HashSet;

/// One region of an active state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    region: RegionId,
    active: Option<Box<ConfigNode>>,
}

impl Slot {
    fn empty(region: RegionId) -> Self {
        Self {
            region,
            active: None,
        }
    }

    pub fn region(&self) -> RegionId {
        self.region
    }

    pub fn active(&self) -> Option<&ConfigNode> {
        self.active.as_deref()
    }
}

/// An active vertex and its regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigNode {
    vertex: VertexId,
    parked: bool,
    slots: Vec<Slot>,
}

impl ConfigNode {
    pub(crate) fn new(vertex: VertexId, regions: &[RegionId]) -> Self {
        Self {
            vertex,
            parked: false,
            slots: regions.iter().copied().map(Slot::empty).collect(),
        }
    }

    pub(crate) fn parked(join: VertexId) -> Self {
        Self {
            vertex: join,
            parked: true,
            slots: Vec::new(),
        }
    }

    pub fn vertex(&self) -> VertexId {
        self.vertex
    }

    pub fn is_parked(&self) -> bool {
        self.parked
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn children(&self) -> impl Iterator<Item = &ConfigNode> {
        self.slots.iter().filter_map(Slot::active)
    }

    /// Copy of this node with every region emptied.
    pub fn trimmed(&self) -> Self {
        Self {
            vertex: self.vertex,
            parked: self.parked,
            slots: self.slots.iter().map(|s| Slot::empty(s.region)).collect(),
        }
    }

    /// Copy of this subtree without parked joins.
    pub fn without_parked(&self) -> Self {
        Self {
            vertex: self.vertex,
            parked: self.parked,
            slots: self
                .slots
                .iter()
                .map(|s| Slot {
                    region: s.region,
                    active: s
                        .active
                        .as_ref()
                        .filter(|n| !n.parked)
                        .map(|n| Box::new(n.without_parked())),
                })
                .collect(),
        }
    }

    /// Vertices of this subtree, parents before children.
    pub fn pre_order(&self) -> Vec<&ConfigNode> {
        let mut out = Vec::new();
        self.collect_pre(&mut out);
        out
    }

    /// Vertices of this subtree, children before parents.
    pub fn post_order(&self) -> Vec<&ConfigNode> {
        let mut out = Vec::new();
        self.collect_post(&mut out);
        out
    }

    fn collect_pre<'a>(&'a self, out: &mut Vec<&'a ConfigNode>) {
        out.push(self);
        for child in self.children() {
            child.collect_pre(out);
        }
    }

    fn collect_post<'a>(&'a self, out: &mut Vec<&'a ConfigNode>) {
        for child in self.children() {
            child.collect_post(out);
        }
        out.push(self);
    }

    pub(crate) fn set_child(&mut self, region: RegionId, child: ConfigNode) -> bool {
        match self.slots.iter_mut().find(|s| s.region == region) {
            Some(slot) => {
                slot.active = Some(Box::new(child));
                true
            }
            None => false,
        }
    }

    fn index_into(&self, index: &mut HashSet<VertexId>) {
        if !self.parked {
            index.insert(self.vertex);
        }
        for child in self.children() {
            child.index_into(index);
        }
    }

    fn unindex(&self, index: &mut HashSet<VertexId>) {
        index.remove(&self.vertex);
        for child in self.children() {
            child.unindex(index);
        }
    }
}

/// The configuration of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    root: Vec<Slot>,
    index: HashSet<VertexId>,
}

impl Configuration {
    /// Creates an empty configuration over the machine's root regions.
    pub fn new<C>(model: &StateMachine<C>) -> Self {
        Self {
            root: model.root_regions().iter().copied().map(Slot::empty).collect(),
            index: HashSet::new(),
        }
    }

    /// Rebuilds a configuration from root slot contents, keyed by region.
    pub(crate) fn from_roots<C>(
        model: &StateMachine<C>,
        roots: Vec<(RegionId, ConfigNode)>,
    ) -> Self {
        let mut config = Self::new(model);
        for (region, node) in roots {
            if let Some(slot) = config.root.iter_mut().find(|s| s.region == region) {
                node.index_into(&mut config.index);
                slot.active = Some(Box::new(node));
            }
        }
        config
    }

    pub fn root_slots(&self) -> &[Slot] {
        &self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.iter().all(|s| s.active.is_none())
    }

    pub fn contains(&self, v: VertexId) -> bool {
        self.index.contains(&v)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Removes everything.
    pub fn clear(&mut self) {
        for slot in &mut self.root {
            slot.active = None;
        }
        self.index.clear();
    }

    /// Marks `v` active inside its container region.
    ///
    /// The container's owner must already be active. Entering a vertex that
    /// is already active is a no-op; entering a region that holds another
    /// vertex is a conflict.
    pub fn enter<C>(&mut self, model: &StateMachine<C>, v: VertexId) -> Result<(), EngineError> {
        let chain = model.vertex_chain(v);
        let slot = slot_mut(&mut self.root, &chain).ok_or_else(|| EngineError::DetachedVertex {
            vertex: model.vertex(v).key.clone(),
        })?;
        if let Some(current) = &slot.active {
            if current.vertex == v && !current.parked {
                return Ok(());
            }
            return Err(EngineError::ConfigurationConflict {
                region: model.region(slot.region).key.clone(),
                active: model.vertex(current.vertex).key.clone(),
                entering: model.vertex(v).key.clone(),
            });
        }
        slot.active = Some(Box::new(ConfigNode::new(v, &model.vertex(v).regions)));
        self.index.insert(v);
        Ok(())
    }

    /// Parks a join in `region` while it waits for other arrivals.
    pub fn park<C>(
        &mut self,
        model: &StateMachine<C>,
        join: VertexId,
        region: RegionId,
    ) -> Result<(), EngineError> {
        let chain = model.region_chain(region);
        let slot = slot_mut(&mut self.root, &chain).ok_or_else(|| EngineError::DetachedVertex {
            vertex: model.vertex(join).key.clone(),
        })?;
        if let Some(current) = &slot.active {
            return Err(EngineError::ConfigurationConflict {
                region: model.region(region).key.clone(),
                active: model.vertex(current.vertex).key.clone(),
                entering: model.vertex(join).key.clone(),
            });
        }
        slot.active = Some(Box::new(ConfigNode::parked(join)));
        Ok(())
    }

    /// Removes `v` and everything below it.
    pub fn exit<C>(&mut self, model: &StateMachine<C>, v: VertexId) -> Option<ConfigNode> {
        if !self.index.contains(&v) {
            return None;
        }
        let chain = model.vertex_chain(v);
        let slot = slot_mut(&mut self.root, &chain)?;
        if slot.active.as_ref().map(|n| n.vertex) != Some(v) {
            return None;
        }
        let node = slot.active.take()?;
        node.unindex(&mut self.index);
        Some(*node)
    }

    /// Removes whatever is parked in `region`.
    pub fn unpark<C>(&mut self, model: &StateMachine<C>, region: RegionId) -> Option<VertexId> {
        let chain = model.region_chain(region);
        let slot = slot_mut(&mut self.root, &chain)?;
        if !slot.active.as_ref().map(|n| n.parked).unwrap_or(false) {
            return None;
        }
        slot.active.take().map(|n| n.vertex)
    }

    /// Returns the active subtree rooted at `v`.
    pub fn subtree<C>(&self, model: &StateMachine<C>, v: VertexId) -> Option<&ConfigNode> {
        if !self.index.contains(&v) {
            return None;
        }
        let chain = model.vertex_chain(v);
        slot_ref(&self.root, &chain)?
            .active()
            .filter(|n| n.vertex == v)
    }

    /// Returns the node held by `region`, parked joins included.
    pub fn region_active<C>(&self, model: &StateMachine<C>, region: RegionId) -> Option<&ConfigNode> {
        slot_ref(&self.root, &model.region_chain(region))?.active()
    }

    /// Returns true if `region` belongs to an active state (or the machine).
    pub fn region_open<C>(&self, model: &StateMachine<C>, region: RegionId) -> bool {
        slot_ref(&self.root, &model.region_chain(region)).is_some()
    }

    /// Active vertices with nothing active below them, in document order.
    pub fn active_leaves(&self) -> Vec<VertexId> {
        self.nodes()
            .into_iter()
            .filter(|n| !n.parked && n.children().all(|c| c.parked))
            .map(|n| n.vertex)
            .collect()
    }

    /// Active vertices, parents first, in document order.
    pub fn active_vertices(&self) -> Vec<VertexId> {
        self.nodes()
            .into_iter()
            .filter(|n| !n.parked)
            .map(|n| n.vertex)
            .collect()
    }

    /// Regions in which `join` is parked.
    pub fn parked_regions(&self, join: VertexId) -> Vec<RegionId> {
        let mut out = Vec::new();
        collect_parked(&self.root, join, &mut out);
        out
    }

    fn nodes(&self) -> Vec<&ConfigNode> {
        let mut out = Vec::new();
        for node in self.root.iter().filter_map(Slot::active) {
            node.collect_pre(&mut out);
        }
        out
    }
}

fn collect_parked(slots: &[Slot], join: VertexId, out: &mut Vec<RegionId>) {
    for slot in slots {
        if let Some(node) = slot.active() {
            if node.parked && node.vertex == join {
                out.push(slot.region);
            }
            collect_parked(&node.slots, join, out);
        }
    }
}

fn slot_mut<'a>(slots: &'a mut [Slot], chain: &[RegionId]) -> Option<&'a mut Slot> {
    let (first, rest) = chain.split_first()?;
    let slot = slots.iter_mut().find(|s| s.region == *first)?;
    if rest.is_empty() {
        return Some(slot);
    }
    let node = slot.active.as_deref_mut()?;
    slot_mut(&mut node.slots, rest)
}

fn slot_ref<'a>(slots: &'a [Slot], chain: &[RegionId]) -> Option<&'a Slot> {
    let (first, rest) = chain.split_first()?;
    let slot = slots.iter().find(|s| s.region == *first)?;
    if rest.is_empty() {
        return Some(slot);
    }
    slot_ref(&slot.active()?.slots, rest)
}
