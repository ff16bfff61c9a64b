//! The run-to-completion step.
//!
//! One call into the engine (start, event, wakeup) runs a full step:
//! transition selection, exits, effects, entries, pseudostate chaining,
//! default entries, completion transitions and deferred-event recall. The
//! configuration is only observable again once the step returns.

use crate::error::EngineError;
use crate::execution::{EnginePhase, Execution, ExecutionStatus, TakeOutcome, START_EVENT};
use crate::listener::LifecycleEvent;
use crate::runtime::Wakeup;
use crate::snapshot::{self, Snapshot};
use rtcsm_model::{
    BehaviorError, Event, EventKind, Guard, PseudoKind, RegionId, TransitionId, TransitionKind,
    VertexId, VertexKind,
};
use std::cmp::Reverse;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Scratch state of the step in progress.
#[derive(Debug, Default)]
pub(crate) struct Step {
    /// States whose completion event is pending.
    completions: VecDeque<VertexId>,
    /// Entered states that may still have empty regions.
    fill: VecDeque<VertexId>,
    /// Completion transitions fired so far.
    chain: usize,
    /// Set when the execution terminated mid-step.
    halted: bool,
    /// Transition being fired, for failure reports.
    firing: Option<TransitionId>,
}

/// A selected transition, plus the junction branches it was selected
/// with.
#[derive(Debug, Clone)]
struct Plan {
    transition: TransitionId,
    route: Vec<TransitionId>,
}

impl<C> Execution<C>
where
    C: Clone + Send + 'static,
{
    // ---------------------------------------------------------------
    // Entry points
    // ---------------------------------------------------------------

    pub(crate) fn start(&mut self) -> Result<(), EngineError> {
        self.step = Step::default();
        self.phase = EnginePhase::Entering;
        let model = Arc::clone(&self.model);
        let event = Event::new(START_EVENT);

        for region in model.root_regions() {
            let initial =
                model
                    .region(*region)
                    .initial
                    .ok_or_else(|| EngineError::NoDefaultEntry {
                        region: model.region(*region).key.clone(),
                    })?;
            self.arrive(initial, None, &event, &mut VecDeque::new())?;
            self.fill(&event)?;
        }
        self.after_step()
    }

    pub(crate) fn dispatch(&mut self, event: Event) -> Result<TakeOutcome, EngineError> {
        self.step = Step::default();
        self.phase = EnginePhase::Dispatching;

        let plans = self.select(&event)?;
        if plans.is_empty() {
            if event.is_synthetic() {
                return Ok(TakeOutcome::Denied);
            }
            if self.deferred_by_active(&event.name) {
                tracing::debug!("Deferring '{}' in '{}'", event.name, self.id);
                self.notify(|| LifecycleEvent::EventDeferred {
                    event: event.name.clone(),
                });
                self.deferred.push_back(event);
                return Ok(TakeOutcome::Deferred);
            }
            tracing::debug!("Denied '{}' in '{}'", event.name, self.id);
            self.notify(|| LifecycleEvent::EventDenied {
                event: event.name.clone(),
            });
            return Ok(TakeOutcome::Denied);
        }

        self.notify(|| LifecycleEvent::EventAccepted {
            event: event.name.clone(),
        });
        self.execute(plans, &event)?;
        self.after_step()?;
        Ok(TakeOutcome::Accepted)
    }

    pub(crate) fn wake(&mut self, wakeup: Wakeup) -> Result<(), EngineError> {
        self.step = Step::default();
        match wakeup {
            Wakeup::Timer {
                transition,
                generation,
                elapsed,
                ..
            } => self.on_timer(transition, generation, elapsed),
            Wakeup::ActivityFinished {
                state,
                generation,
                outcome,
                ..
            } => self.on_activity_finished(state, generation, outcome),
        }
    }

    fn on_timer(
        &mut self,
        transition: TransitionId,
        generation: u64,
        elapsed: Duration,
    ) -> Result<(), EngineError> {
        if !self.timers.accept(transition, generation) {
            return Ok(());
        }
        let model = Arc::clone(&self.model);
        let source = model.transition(transition).source;
        if !self.configuration.contains(source) {
            return Ok(());
        }

        self.phase = EnginePhase::Dispatching;
        let event = Event::time(elapsed);
        let Some(plan) = self.try_candidates(&[transition], &event)? else {
            tracing::trace!("Timer {} disabled by its guard", model.transition_label(transition));
            return Ok(());
        };
        self.notify(|| LifecycleEvent::EventAccepted {
            event: event.name.clone(),
        });
        self.execute(vec![plan], &event)?;
        self.after_step()
    }

    fn on_activity_finished(
        &mut self,
        state: VertexId,
        generation: u64,
        outcome: Result<(), BehaviorError>,
    ) -> Result<(), EngineError> {
        if !self.activities.accept(state, generation) {
            return Ok(());
        }
        let key = self.model.vertex(state).key.clone();
        if let Err(source) = outcome {
            self.notify(|| LifecycleEvent::ActivityFailed {
                state: key.clone(),
                error: source.to_string(),
            });
            return Err(EngineError::Activity { state: key, source });
        }

        tracing::trace!("Activity of '{}' finished", key);
        self.notify(|| LifecycleEvent::ActivityFinished { state: key.clone() });
        self.activities.mark_finished(state);
        if self.configuration.contains(state) {
            self.maybe_complete(state);
        }
        self.after_step()
    }

    pub(crate) fn reinstall(&mut self, snapshot: Snapshot<C>) -> Result<(), EngineError> {
        let (configuration, history) = snapshot::restore(&self.model, &snapshot)?;

        self.timers.cancel_all();
        self.activities.cancel_all();
        self.configuration = configuration;
        self.history = history;
        self.context = snapshot.context;
        self.deferred = snapshot.deferred.into_iter().collect();
        self.step = Step::default();

        if !snapshot.started {
            self.started = false;
            self.status = ExecutionStatus::Idle;
            return Ok(());
        }

        self.started = true;
        self.status = ExecutionStatus::Running;
        for v in self.configuration.active_vertices() {
            self.start_services(v)?;
        }
        tracing::info!(
            "Resumed execution '{}' with {} active vertices",
            self.id,
            self.configuration.len()
        );
        Ok(())
    }

    /// Applies the outcome of a step to the lifecycle status.
    pub(crate) fn settle<T>(&mut self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.fault_with(e);
            }
        }
        if self.phase != EnginePhase::Terminated {
            self.phase = EnginePhase::Idle;
        }
        result
    }

    fn fault_with(&mut self, error: &EngineError) {
        tracing::warn!("Execution '{}' faulted: {}", self.id, error);
        self.status = ExecutionStatus::Faulted;
        self.fault = Some(error.to_string());
        self.timers.cancel_all();
        self.activities.cancel_all();
        self.step = Step::default();
    }

    // ---------------------------------------------------------------
    // Selection
    // ---------------------------------------------------------------

    /// Finds the transitions enabled by `event`, innermost first, with
    /// conflicting outer transitions dropped.
    fn select(&mut self, event: &Event) -> Result<Vec<Plan>, EngineError> {
        let model = Arc::clone(&self.model);
        if event.kind == EventKind::Signal
            && !model
                .root_regions()
                .iter()
                .any(|r| model.reacts_to(*r, &event.name))
        {
            return Ok(Vec::new());
        }

        let mut visited: HashSet<VertexId> = HashSet::new();
        let mut claimed: HashSet<VertexId> = HashSet::new();
        let mut plans = Vec::new();

        for leaf in self.configuration.active_leaves() {
            let mut path = vec![leaf];
            path.extend(model.ancestors(leaf));
            for v in path {
                if claimed.contains(&v) {
                    break;
                }
                if !visited.insert(v) {
                    continue;
                }
                let candidates: Vec<TransitionId> = model
                    .vertex(v)
                    .outgoing
                    .iter()
                    .copied()
                    .filter(|t| model.transition(*t).matches(event))
                    .collect();
                if candidates.is_empty() {
                    continue;
                }
                if let Some(plan) = self.try_candidates(&candidates, event)? {
                    claimed.insert(v);
                    plans.push(plan);
                    break;
                }
            }
        }

        plans.sort_by_key(|p| {
            Reverse(model.depth(model.position(model.transition(p.transition).source)))
        });

        let mut footprints: Vec<VertexId> = Vec::new();
        let mut chosen = Vec::new();
        for plan in plans {
            let footprint = self.footprint(plan.transition);
            let conflict = footprints.iter().any(|f| {
                *f == footprint || model.is_ancestor(*f, footprint) || model.is_ancestor(footprint, *f)
            });
            if conflict {
                tracing::trace!(
                    "Dropping {}: overridden by an inner transition",
                    model.transition_label(plan.transition)
                );
                continue;
            }
            footprints.push(footprint);
            chosen.push(plan);
        }
        Ok(chosen)
    }

    /// Returns the first enabled candidate, in declaration order with
    /// `else` branches last.
    fn try_candidates(
        &mut self,
        candidates: &[TransitionId],
        event: &Event,
    ) -> Result<Option<Plan>, EngineError> {
        let model = Arc::clone(&self.model);
        let mut results = vec![false; candidates.len()];

        for (i, t) in candidates.iter().enumerate() {
            if model.transition(*t).is_else() {
                continue;
            }
            results[i] = self.guard_passes(*t, event)?;
            if results[i] {
                if let Some(plan) = self.plan_for(*t, event)? {
                    return Ok(Some(plan));
                }
            }
        }
        for (i, t) in candidates.iter().enumerate() {
            if !model.transition(*t).is_else() {
                continue;
            }
            results[i] = i == 0 || !results[i - 1];
            if results[i] {
                if let Some(plan) = self.plan_for(*t, event)? {
                    return Ok(Some(plan));
                }
            }
        }
        Ok(None)
    }

    /// Every enabled candidate, in the order they should be tried.
    fn enabled_in_order(
        &mut self,
        candidates: &[TransitionId],
        event: &Event,
    ) -> Result<Vec<TransitionId>, EngineError> {
        let model = Arc::clone(&self.model);
        let mut results = vec![false; candidates.len()];
        let mut enabled = Vec::new();

        for (i, t) in candidates.iter().enumerate() {
            if !model.transition(*t).is_else() {
                results[i] = self.guard_passes(*t, event)?;
                if results[i] {
                    enabled.push(*t);
                }
            }
        }
        for (i, t) in candidates.iter().enumerate() {
            if model.transition(*t).is_else() {
                results[i] = i == 0 || !results[i - 1];
                if results[i] {
                    enabled.push(*t);
                }
            }
        }
        Ok(enabled)
    }

    fn plan_for(&mut self, t: TransitionId, event: &Event) -> Result<Option<Plan>, EngineError> {
        let target = self.model.transition(t).target;
        if self.model.vertex(target).pseudo_kind() != Some(PseudoKind::Junction) {
            return Ok(Some(Plan {
                transition: t,
                route: Vec::new(),
            }));
        }
        Ok(self
            .junction_route(target, event, 0)?
            .map(|route| Plan { transition: t, route }))
    }

    /// Depth-first search for a complete path through chained junctions.
    ///
    /// Branches are tried in declaration order, `else` last; the first
    /// path that reaches a non-junction vertex wins.
    fn junction_route(
        &mut self,
        junction: VertexId,
        event: &Event,
        depth: usize,
    ) -> Result<Option<Vec<TransitionId>>, EngineError> {
        let model = Arc::clone(&self.model);
        if depth > model.vertex_count() {
            return Ok(None);
        }
        let outgoing = model.vertex(junction).outgoing.clone();
        for t in self.enabled_in_order(&outgoing, event)? {
            let target = model.transition(t).target;
            if model.vertex(target).pseudo_kind() != Some(PseudoKind::Junction) {
                return Ok(Some(vec![t]));
            }
            if let Some(rest) = self.junction_route(target, event, depth + 1)? {
                let mut route = vec![t];
                route.extend(rest);
                return Ok(Some(route));
            }
        }
        Ok(None)
    }

    fn guard_passes(&mut self, t: TransitionId, event: &Event) -> Result<bool, EngineError> {
        let model = Arc::clone(&self.model);
        let guard = match &model.transition(t).guard {
            Some(Guard::When(f)) => f,
            Some(Guard::Else) | None => return Ok(true),
        };

        self.notify(|| LifecycleEvent::GuardBefore {
            transition: model.transition_label(t),
        });
        match guard(&self.context, event) {
            Ok(enabled) => {
                self.notify(|| LifecycleEvent::GuardAfter {
                    transition: model.transition_label(t),
                    enabled,
                });
                Ok(enabled)
            }
            Err(source) => {
                let transition = model.transition_label(t);
                self.notify(|| LifecycleEvent::GuardFailed {
                    transition: transition.clone(),
                    event: event.name.clone(),
                    error: source.to_string(),
                });
                Err(EngineError::Guard { transition, source })
            }
        }
    }

    /// The part of the configuration a transition touches.
    fn footprint(&self, t: TransitionId) -> VertexId {
        let tr = self.model.transition(t);
        if tr.kind == TransitionKind::Internal {
            return self.model.position(tr.source);
        }
        self.exit_root(t)
            .unwrap_or_else(|| self.model.position(tr.source))
    }

    /// Returns the active vertex a transition exits, if any.
    fn exit_root(&self, t: TransitionId) -> Option<VertexId> {
        let model = &self.model;
        let tr = model.transition(t);
        let source = tr.source;
        if model.vertex(source).pseudo_kind() == Some(PseudoKind::EntryPoint) {
            return None;
        }
        let pos_source = model.position(source);
        let pos_target = model.position(tr.target);

        if model.vertex(tr.target).pseudo_kind() == Some(PseudoKind::Join) {
            let sources: Vec<VertexId> = model
                .vertex(tr.target)
                .incoming
                .iter()
                .map(|i| model.position(model.transition(*i).source))
                .collect();
            if sources.len() > 1 {
                let region = match model.lca(&sources) {
                    Some(scope) => model
                        .ancestor_in(scope, pos_source)
                        .and_then(|owner| model.region_toward(owner, pos_source)),
                    None => model.vertex_chain(pos_source).first().copied(),
                };
                if let Some(region) = region {
                    return self.active_in(region);
                }
            }
        }

        if tr.kind == TransitionKind::Local && model.is_ancestor(pos_source, pos_target) {
            return model
                .region_toward(pos_source, pos_target)
                .and_then(|r| self.active_in(r));
        }

        let scope = model
            .lca_region(pos_source, pos_target)
            .or_else(|| model.vertex_chain(pos_source).first().copied())?;
        let active = self.active_in(scope)?;
        if active == pos_source || model.is_ancestor(active, pos_source) {
            Some(active)
        } else {
            None
        }
    }

    fn active_in(&self, region: RegionId) -> Option<VertexId> {
        self.configuration
            .region_active(&self.model, region)
            .filter(|n| !n.is_parked())
            .map(|n| n.vertex())
    }

    fn deferred_by_active(&self, name: &str) -> bool {
        self.configuration
            .active_vertices()
            .into_iter()
            .any(|v| self.model.vertex(v).defers(name))
    }

    // ---------------------------------------------------------------
    // Firing
    // ---------------------------------------------------------------

    fn execute(&mut self, plans: Vec<Plan>, event: &Event) -> Result<(), EngineError> {
        let model = Arc::clone(&self.model);
        for plan in plans {
            if self.step.halted {
                break;
            }
            // An earlier plan of this step may have exited the source.
            let source = model.position(model.transition(plan.transition).source);
            if !model.vertex(source).is_pseudo() && !self.configuration.contains(source) {
                continue;
            }
            let mut route = VecDeque::from(plan.route);
            self.fire(plan.transition, event, &mut route)?;
            self.fill(event)?;
        }
        Ok(())
    }

    fn fire(
        &mut self,
        t: TransitionId,
        event: &Event,
        route: &mut VecDeque<TransitionId>,
    ) -> Result<(), EngineError> {
        if self.step.halted {
            return Ok(());
        }
        let model = Arc::clone(&self.model);
        let tr = model.transition(t);
        self.step.firing = Some(t);
        tracing::debug!(
            "Execution '{}' firing {} on '{}'",
            self.id,
            model.transition_label(t),
            event.name
        );
        self.notify(|| LifecycleEvent::TransitionStarted {
            transition: model.transition_label(t),
            event: event.name.clone(),
        });

        if tr.kind == TransitionKind::Internal {
            self.phase = EnginePhase::Firing;
            self.run_effect(t, event)?;
        } else {
            self.phase = EnginePhase::Exiting;
            if let Some(root) = self.exit_root(t) {
                self.exit_subtree(root, event)?;
            }
            self.phase = EnginePhase::Firing;
            self.run_effect(t, event)?;
            self.phase = EnginePhase::Entering;
            self.arrive(tr.target, Some(t), event, route)?;
        }

        self.notify(|| LifecycleEvent::TransitionEnded {
            transition: model.transition_label(t),
            event: event.name.clone(),
        });
        Ok(())
    }

    /// Fires a fork or entry-point branch: no exits.
    fn fire_branch(&mut self, t: TransitionId, event: &Event) -> Result<(), EngineError> {
        let model = Arc::clone(&self.model);
        self.step.firing = Some(t);
        self.notify(|| LifecycleEvent::TransitionStarted {
            transition: model.transition_label(t),
            event: event.name.clone(),
        });
        self.run_effect(t, event)?;
        self.arrive(model.transition(t).target, Some(t), event, &mut VecDeque::new())?;
        self.notify(|| LifecycleEvent::TransitionEnded {
            transition: model.transition_label(t),
            event: event.name.clone(),
        });
        Ok(())
    }

    fn firing_label(&self) -> Option<String> {
        self.step.firing.map(|t| self.model.transition_label(t))
    }

    fn run_effect(&mut self, t: TransitionId, event: &Event) -> Result<(), EngineError> {
        let model = Arc::clone(&self.model);
        let Some(effect) = &model.transition(t).effect else {
            return Ok(());
        };
        self.notify(|| LifecycleEvent::EffectBefore {
            transition: model.transition_label(t),
        });
        if let Err(source) = effect(&mut self.context, event) {
            let transition = model.transition_label(t);
            self.notify(|| LifecycleEvent::EffectFailed {
                transition: transition.clone(),
                event: event.name.clone(),
                error: source.to_string(),
            });
            return Err(EngineError::Effect { transition, source });
        }
        self.notify(|| LifecycleEvent::EffectAfter {
            transition: model.transition_label(t),
        });
        Ok(())
    }

    // ---------------------------------------------------------------
    // Exiting
    // ---------------------------------------------------------------

    /// Exits `v` and everything below it, children first.
    fn exit_subtree(&mut self, v: VertexId, event: &Event) -> Result<(), EngineError> {
        let model = Arc::clone(&self.model);
        let Some(subtree) = self.configuration.subtree(&model, v).cloned() else {
            return Ok(());
        };
        self.history.record_exit(&model, &subtree);

        for node in subtree.post_order() {
            // Parked joins leave with their owner.
            if node.is_parked() {
                continue;
            }
            let u = node.vertex();
            let vertex = model.vertex(u);
            tracing::trace!("Exiting '{}'", vertex.key);
            self.notify(|| LifecycleEvent::StateExiting {
                state: vertex.key.clone(),
            });

            self.timers.cancel_state(u);
            if self.activities.cancel(u) {
                self.notify(|| LifecycleEvent::ActivityCancelled {
                    state: vertex.key.clone(),
                });
            }
            if let Some(behavior) = vertex.behavior() {
                for action in &behavior.exit {
                    if let Err(source) = action(&mut self.context, event) {
                        let transition = self.firing_label();
                        self.notify(|| LifecycleEvent::StateExitFailed {
                            state: vertex.key.clone(),
                            event: event.name.clone(),
                            transition,
                            error: source.to_string(),
                        });
                        return Err(EngineError::Exit {
                            state: vertex.key.clone(),
                            source,
                        });
                    }
                }
            }

            self.configuration.exit(&model, u);
            self.step.completions.retain(|s| *s != u);
            self.notify(|| LifecycleEvent::StateExited {
                state: vertex.key.clone(),
            });
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Entering
    // ---------------------------------------------------------------

    /// Lands on `v`, resolving pseudostates until stable states are
    /// reached.
    fn arrive(
        &mut self,
        v: VertexId,
        via: Option<TransitionId>,
        event: &Event,
        route: &mut VecDeque<TransitionId>,
    ) -> Result<(), EngineError> {
        if self.step.halted {
            return Ok(());
        }
        let model = Arc::clone(&self.model);
        let vertex = model.vertex(v);
        let no_branch = || EngineError::NoEnabledBranch {
            vertex: vertex.key.clone(),
        };

        let kind = match &vertex.kind {
            VertexKind::State(_) | VertexKind::Final => {
                self.enter_ancestors(v, event)?;
                if self.configuration.contains(v) {
                    if !vertex.regions.is_empty() {
                        self.step.fill.push_back(v);
                    }
                    return Ok(());
                }
                return self.enter_vertex(v, event);
            }
            VertexKind::Pseudo(kind) => *kind,
        };

        match kind {
            PseudoKind::Initial => {
                let t = vertex.outgoing.first().copied().ok_or_else(no_branch)?;
                self.fire(t, event, route)
            }
            PseudoKind::Choice => {
                let outgoing = vertex.outgoing.clone();
                let plan = self.try_candidates(&outgoing, event)?.ok_or_else(no_branch)?;
                let mut inner = VecDeque::from(plan.route);
                self.fire(plan.transition, event, &mut inner)
            }
            PseudoKind::Junction => {
                let precomputed = route
                    .front()
                    .map(|t| model.transition(*t).source == v)
                    .unwrap_or(false);
                if !precomputed {
                    let path = self.junction_route(v, event, 0)?.ok_or_else(no_branch)?;
                    *route = VecDeque::from(path);
                }
                let t = route.pop_front().ok_or_else(no_branch)?;
                self.fire(t, event, route)
            }
            PseudoKind::Fork => {
                for t in vertex.outgoing.clone() {
                    self.fire_branch(t, event)?;
                }
                Ok(())
            }
            PseudoKind::Join => {
                let t = via.ok_or_else(no_branch)?;
                self.arrive_join(v, t, event, route)
            }
            PseudoKind::ShallowHistory | PseudoKind::DeepHistory => {
                self.arrive_history(v, kind, event, route)
            }
            PseudoKind::Terminate => {
                self.terminate();
                Ok(())
            }
            PseudoKind::EntryPoint => {
                let owner = model.position(v);
                if owner != v {
                    self.enter_ancestors(owner, event)?;
                    if !self.configuration.contains(owner) {
                        self.enter_vertex(owner, event)?;
                    }
                }
                for t in vertex.outgoing.clone() {
                    self.fire_branch(t, event)?;
                }
                Ok(())
            }
            PseudoKind::ExitPoint => {
                let owner = model.position(v);
                if owner != v {
                    self.exit_subtree(owner, event)?;
                }
                let outgoing = vertex.outgoing.clone();
                let plan = self.try_candidates(&outgoing, event)?.ok_or_else(no_branch)?;
                let mut inner = VecDeque::from(plan.route);
                self.fire(plan.transition, event, &mut inner)
            }
        }
    }

    fn arrive_join(
        &mut self,
        join: VertexId,
        via: TransitionId,
        event: &Event,
        route: &mut VecDeque<TransitionId>,
    ) -> Result<(), EngineError> {
        let model = Arc::clone(&self.model);
        let vertex = model.vertex(join);
        let source = model.position(model.transition(via).source);
        let sources: Vec<VertexId> = vertex
            .incoming
            .iter()
            .map(|i| model.position(model.transition(*i).source))
            .collect();

        let owner = model.lca(&sources).and_then(|r| model.ancestor_in(r, source));
        let toward = |s: VertexId| match owner {
            Some(o) => model.region_toward(o, s),
            None => model.vertex_chain(s).first().copied(),
        };

        if let Some(region) = toward(source) {
            self.configuration.park(&model, join, region)?;
        }
        let expected: HashSet<RegionId> = sources.iter().filter_map(|s| toward(*s)).collect();
        let arrived: HashSet<RegionId> = self.configuration.parked_regions(join).into_iter().collect();
        if !expected.is_subset(&arrived) {
            tracing::trace!(
                "Join '{}' waiting: {}/{} regions arrived",
                vertex.key,
                arrived.len(),
                expected.len()
            );
            return Ok(());
        }

        for region in arrived {
            self.configuration.unpark(&model, region);
        }
        if let Some(o) = owner {
            self.exit_subtree(o, event)?;
        }
        let t = vertex
            .outgoing
            .first()
            .copied()
            .ok_or_else(|| EngineError::NoEnabledBranch {
                vertex: vertex.key.clone(),
            })?;
        self.fire(t, event, route)
    }

    fn arrive_history(
        &mut self,
        v: VertexId,
        kind: PseudoKind,
        event: &Event,
        route: &mut VecDeque<TransitionId>,
    ) -> Result<(), EngineError> {
        let model = Arc::clone(&self.model);
        let region = model
            .container_region(v)
            .ok_or_else(|| EngineError::DetachedVertex {
                vertex: model.vertex(v).key.clone(),
            })?;
        self.enter_ancestors(v, event)?;
        if self.active_in(region).is_some() {
            return Ok(());
        }

        if kind == PseudoKind::DeepHistory {
            if let Some(record) = self.history.deep(region).cloned() {
                tracing::trace!("Restoring deep history of '{}'", model.region(region).key);
                for node in record.pre_order() {
                    self.enter_vertex(node.vertex(), event)?;
                }
                return Ok(());
            }
        } else if let Some(record) = self.history.shallow(region) {
            tracing::trace!("Restoring shallow history of '{}'", model.region(region).key);
            return self.arrive(record.vertex(), None, event, route);
        }

        match model.vertex(v).outgoing.first() {
            Some(t) => self.fire(*t, event, route),
            None => self.default_entry(region, event),
        }
    }

    /// Enters the inactive ancestors of `v`, outermost first.
    fn enter_ancestors(&mut self, v: VertexId, event: &Event) -> Result<(), EngineError> {
        let model = Arc::clone(&self.model);
        let mut chain = model.ancestors(model.position(v));
        chain.reverse();
        for a in chain {
            if !self.configuration.contains(a) {
                self.enter_vertex(a, event)?;
            }
        }
        Ok(())
    }

    fn enter_vertex(&mut self, v: VertexId, event: &Event) -> Result<(), EngineError> {
        let model = Arc::clone(&self.model);
        let vertex = model.vertex(v);
        tracing::trace!("Entering '{}'", vertex.key);
        self.notify(|| LifecycleEvent::StateEntering {
            state: vertex.key.clone(),
        });

        self.configuration.enter(&model, v)?;
        if let Some(behavior) = vertex.behavior() {
            for action in &behavior.entry {
                if let Err(source) = action(&mut self.context, event) {
                    let transition = self.firing_label();
                    self.notify(|| LifecycleEvent::StateEntryFailed {
                        state: vertex.key.clone(),
                        event: event.name.clone(),
                        transition,
                        error: source.to_string(),
                    });
                    return Err(EngineError::Entry {
                        state: vertex.key.clone(),
                        source,
                    });
                }
            }
        }
        self.start_services(v)?;
        self.notify(|| LifecycleEvent::StateEntered {
            state: vertex.key.clone(),
        });

        if vertex.is_final() {
            if let Some(parent) = model.parent_state(v) {
                self.maybe_complete(parent);
            }
        } else {
            self.maybe_complete(v);
        }
        if !vertex.regions.is_empty() {
            self.step.fill.push_back(v);
        }
        Ok(())
    }

    /// Arms the timers and starts the activity of an active state.
    fn start_services(&mut self, v: VertexId) -> Result<(), EngineError> {
        let model = Arc::clone(&self.model);
        for t in model.timed_transitions(v) {
            let Some(delay) = &model.transition(t).timer else {
                continue;
            };
            let link = self
                .runtime
                .as_ref()
                .ok_or(EngineError::RuntimeUnavailable { what: "a timer" })?;
            let delay = delay.resolve(&self.context);
            self.timers.arm(link, &self.id, t, v, delay);
        }

        if let Some(activity) = model.vertex(v).behavior().and_then(|b| b.activity.as_ref()) {
            let link = self
                .runtime
                .as_ref()
                .ok_or(EngineError::RuntimeUnavailable { what: "an activity" })?;
            self.activities
                .start(link, &self.id, v, Arc::clone(activity), self.context.clone());
            self.notify(|| LifecycleEvent::ActivityStarted {
                state: model.vertex(v).key.clone(),
            });
        }
        Ok(())
    }

    /// Applies default entry to the empty regions of entered states.
    fn fill(&mut self, event: &Event) -> Result<(), EngineError> {
        let model = Arc::clone(&self.model);
        while let Some(s) = self.step.fill.pop_front() {
            if self.step.halted {
                return Ok(());
            }
            if !self.configuration.contains(s) {
                continue;
            }
            for region in &model.vertex(s).regions {
                if self.configuration.region_active(&model, *region).is_none() {
                    self.default_entry(*region, event)?;
                }
            }
        }
        Ok(())
    }

    fn default_entry(&mut self, region: RegionId, event: &Event) -> Result<(), EngineError> {
        let model = Arc::clone(&self.model);
        let missing = || EngineError::NoDefaultEntry {
            region: model.region(region).key.clone(),
        };
        if self.options.default_entry == crate::options::DefaultEntryPolicy::None {
            return Err(missing());
        }
        let initial = model.region(region).initial.ok_or_else(missing)?;
        self.arrive(initial, None, event, &mut VecDeque::new())
    }

    // ---------------------------------------------------------------
    // Completion, termination, deferral
    // ---------------------------------------------------------------

    /// Queues the completion event of `s` if it has completed.
    fn maybe_complete(&mut self, s: VertexId) {
        let model = Arc::clone(&self.model);
        let vertex = model.vertex(s);
        if !vertex.is_state() || !model.has_completion_transitions(s) {
            return;
        }
        if self.activities.is_running(s) {
            return;
        }
        let regions_final = vertex.regions.iter().all(|r| {
            self.configuration
                .region_active(&model, *r)
                .map(|n| !n.is_parked() && model.vertex(n.vertex()).is_final())
                .unwrap_or(false)
        });
        if regions_final && !self.step.completions.contains(&s) {
            self.step.completions.push_back(s);
        }
    }

    /// Runs completion transitions, machine completion and deferred
    /// events until nothing else is enabled.
    fn after_step(&mut self) -> Result<(), EngineError> {
        loop {
            self.run_completions()?;
            if self.step.halted {
                return Ok(());
            }
            if self.machine_completed() {
                self.complete_machine();
                return Ok(());
            }
            if !self.recall_deferred()? {
                return Ok(());
            }
        }
    }

    fn run_completions(&mut self) -> Result<(), EngineError> {
        let model = Arc::clone(&self.model);
        while let Some(s) = self.step.completions.pop_front() {
            if self.step.halted {
                return Ok(());
            }
            if !self.configuration.contains(s) {
                continue;
            }
            let event = Event::completion(&model.vertex(s).key);
            let candidates: Vec<TransitionId> = model.completion_transitions(s).collect();
            let Some(plan) = self.try_candidates(&candidates, &event)? else {
                continue;
            };
            self.step.chain += 1;
            if self.step.chain > self.options.max_completion_chain {
                return Err(EngineError::CompletionLoop {
                    limit: self.options.max_completion_chain,
                });
            }
            self.execute(vec![plan], &event)?;
        }
        Ok(())
    }

    fn machine_completed(&self) -> bool {
        let roots = self.model.root_regions();
        !roots.is_empty()
            && roots.iter().all(|r| {
                self.configuration
                    .region_active(&self.model, *r)
                    .map(|n| !n.is_parked() && self.model.vertex(n.vertex()).is_final())
                    .unwrap_or(false)
            })
    }

    fn complete_machine(&mut self) {
        tracing::info!("Execution '{}' completed", self.id);
        self.timers.cancel_all();
        self.activities.cancel_all();
        self.halt();
        self.notify(|| LifecycleEvent::MachineTerminated { completed: true });
    }

    fn terminate(&mut self) {
        tracing::info!("Execution '{}' reached a terminate pseudostate", self.id);
        self.timers.cancel_all();
        self.activities.cancel_all();
        self.configuration.clear();
        self.halt();
        self.notify(|| LifecycleEvent::MachineTerminated { completed: false });
    }

    fn halt(&mut self) {
        self.step.halted = true;
        self.step.completions.clear();
        self.step.fill.clear();
        self.status = ExecutionStatus::Terminated;
        self.terminated = true;
        self.phase = EnginePhase::Terminated;
    }

    /// Re-dispatches the oldest deferred event that is no longer held.
    ///
    /// Returns true if one fired. Events that are neither enabled nor
    /// deferred any more are dropped as denied.
    fn recall_deferred(&mut self) -> Result<bool, EngineError> {
        let mut index = 0;
        while index < self.deferred.len() {
            let event = self.deferred[index].clone();
            let plans = self.select(&event)?;
            if !plans.is_empty() {
                self.deferred.remove(index);
                tracing::debug!("Recalled deferred '{}' in '{}'", event.name, self.id);
                self.notify(|| LifecycleEvent::EventAccepted {
                    event: event.name.clone(),
                });
                self.execute(plans, &event)?;
                return Ok(true);
            }
            if self.deferred_by_active(&event.name) {
                index += 1;
                continue;
            }
            self.deferred.remove(index);
            self.notify(|| LifecycleEvent::EventDenied {
                event: event.name.clone(),
            });
        }
        Ok(false)
    }
}
