//! End-to-end engine behaviour over small models.

use crate::broadcast::LifecycleBroadcaster;
use crate::error::EngineError;
use crate::execution::{Execution, ExecutionBuilder, ExecutionStatus, TakeOutcome};
use crate::listener::{LifecycleEvent, Listener, ListenerError};
use crate::options::{DefaultEntryPolicy, ExecutionOptions};
use crate::runtime::{ExecutionId, RuntimeLink, Wakeup};
use crate::snapshot::{Snapshot, SnapshotNode};
use rtcsm_model::{
    BehaviorError, Event, ModelBuilder, PseudoKind, StateMachine, TransitionKind, TransitionSpec,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Ctx {
    n: i64,
    log: Vec<String>,
}

type Model = Arc<StateMachine<Ctx>>;
type Seen = Arc<Mutex<Vec<LifecycleEvent>>>;

fn recorder() -> (Seen, Arc<dyn Listener>) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener: Arc<dyn Listener> = Arc::new(
        move |_: &ExecutionId, e: &LifecycleEvent| -> Result<(), ListenerError> {
            sink.lock().unwrap().push(e.clone());
            Ok(())
        },
    );
    (seen, listener)
}

fn kinds(seen: &Seen) -> Vec<String> {
    seen.lock()
        .unwrap()
        .iter()
        .map(|e| match e.state() {
            Some(s) => format!("{}:{}", e.kind(), s),
            None => e.kind().to_string(),
        })
        .collect()
}

fn started(model: Model) -> Execution<Ctx> {
    let mut exec = Execution::new(model, Ctx::default());
    exec.go().unwrap();
    exec
}

fn with_runtime(model: Model) -> (Execution<Ctx>, mpsc::UnboundedReceiver<Wakeup>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let exec = ExecutionBuilder::new()
        .model(model)
        .context(Ctx::default())
        .runtime(RuntimeLink::current(tx).unwrap())
        .build()
        .unwrap();
    (exec, rx)
}

async fn next_wakeup(rx: &mut mpsc::UnboundedReceiver<Wakeup>) -> Wakeup {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

/// Initial -> OFF, OFF -on-> ON, OFF -end-> FINAL, ON -off-> OFF
fn switch() -> Model {
    let mut b = ModelBuilder::new("switch");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let off = b.add_state(root, "OFF").unwrap();
    let on = b.add_state(root, "ON").unwrap();
    let fin = b.add_final(root, "FINAL").unwrap();
    b.add_transition(TransitionSpec::new(init, off)).unwrap();
    b.add_transition(TransitionSpec::new(off, on).on("on")).unwrap();
    b.add_transition(TransitionSpec::new(off, fin).on("end")).unwrap();
    b.add_transition(TransitionSpec::new(on, off).on("off")).unwrap();
    Arc::new(b.build().unwrap())
}

#[test]
fn test_switch_reaches_final_and_denies() {
    let (seen, listener) = recorder();
    let mut exec = ExecutionBuilder::new()
        .model(switch())
        .context(Ctx::default())
        .listener(listener)
        .build()
        .unwrap();
    exec.go().unwrap();
    assert_eq!(exec.active_states(), vec!["OFF"]);

    for event in ["on", "off", "end"] {
        assert_eq!(exec.take(event).unwrap(), TakeOutcome::Accepted);
    }
    assert!(exec.is_active("FINAL"));
    assert!(exec.is_terminated());
    assert_eq!(exec.status(), ExecutionStatus::Terminated);

    assert_eq!(exec.take("on").unwrap(), TakeOutcome::Denied);
    assert_eq!(exec.take("end").unwrap(), TakeOutcome::Denied);
    assert_eq!(exec.active_states(), vec!["FINAL"]);

    let seen = seen.lock().unwrap();
    assert!(seen.contains(&LifecycleEvent::MachineTerminated { completed: true }));
    assert_eq!(
        seen.last(),
        Some(&LifecycleEvent::EventDenied {
            event: "end".to_string()
        })
    );
}

#[test]
fn test_hook_order_for_one_transition() {
    let (seen, listener) = recorder();
    let mut exec = ExecutionBuilder::new()
        .model(switch())
        .context(Ctx::default())
        .listener(listener)
        .build()
        .unwrap();
    exec.go().unwrap();
    seen.lock().unwrap().clear();

    exec.take("on").unwrap();
    assert_eq!(
        kinds(&seen),
        vec![
            "event_accepted",
            "transition_started",
            "state_exiting:OFF",
            "state_exited:OFF",
            "state_entering:ON",
            "state_entered:ON",
            "transition_ended",
        ]
    );
}

#[test]
fn test_unknown_event_is_denied() {
    let mut exec = started(switch());
    assert_eq!(exec.take("nope").unwrap(), TakeOutcome::Denied);
    assert_eq!(exec.take("off").unwrap(), TakeOutcome::Denied);
    assert_eq!(exec.status(), ExecutionStatus::Running);
    assert_eq!(exec.active_states(), vec!["OFF"]);
}

/// root: A(ra: history, B(rb: C1 -next-> C2)), Z
/// A -leave-> Z, Z -back-> history
fn history_model(kind: PseudoKind, start_in_z: bool) -> Model {
    let mut b = ModelBuilder::new("history");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let a = b.add_state(root, "A").unwrap();
    let z = b.add_state(root, "Z").unwrap();

    let ra = b.add_state_region(a, "ra").unwrap();
    let a_init = b.add_pseudostate(ra, "a_init", PseudoKind::Initial).unwrap();
    let h = b.add_pseudostate(ra, "H", kind).unwrap();
    let bs = b.add_state(ra, "B").unwrap();

    let rb = b.add_state_region(bs, "rb").unwrap();
    let b_init = b.add_pseudostate(rb, "b_init", PseudoKind::Initial).unwrap();
    let c1 = b.add_state(rb, "C1").unwrap();
    let c2 = b.add_state(rb, "C2").unwrap();

    b.add_transition(TransitionSpec::new(init, if start_in_z { z } else { a }))
        .unwrap();
    b.add_transition(TransitionSpec::new(a_init, bs)).unwrap();
    b.add_transition(TransitionSpec::new(b_init, c1)).unwrap();
    b.add_transition(TransitionSpec::new(c1, c2).on("next")).unwrap();
    b.add_transition(TransitionSpec::new(a, z).on("leave")).unwrap();
    b.add_transition(TransitionSpec::new(z, h).on("back")).unwrap();
    Arc::new(b.build().unwrap())
}

#[test]
fn test_deep_history_restores_nested_states() {
    let mut exec = started(history_model(PseudoKind::DeepHistory, false));
    assert_eq!(exec.active_states(), vec!["A", "B", "C1"]);
    exec.take("next").unwrap();
    exec.take("leave").unwrap();
    assert_eq!(exec.active_states(), vec!["Z"]);

    exec.take("back").unwrap();
    assert_eq!(exec.active_states(), vec!["A", "B", "C2"]);
}

/// root: A(ra: H, B(r1: P1 -p-> P2, r2: Q1 -q-> Q2)), Z
/// A -leave-> Z, Z -back-> H
fn orthogonal_history_model() -> Model {
    let mut b = ModelBuilder::new("orthogonal-history");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let a = b.add_state(root, "A").unwrap();
    let z = b.add_state(root, "Z").unwrap();

    let ra = b.add_state_region(a, "ra").unwrap();
    let a_init = b.add_pseudostate(ra, "a_init", PseudoKind::Initial).unwrap();
    let h = b.add_pseudostate(ra, "H", PseudoKind::DeepHistory).unwrap();
    let bs = b.add_state(ra, "B").unwrap();

    let r1 = b.add_state_region(bs, "r1").unwrap();
    let i1 = b.add_pseudostate(r1, "i1", PseudoKind::Initial).unwrap();
    let p1 = b.add_state(r1, "P1").unwrap();
    let p2 = b.add_state(r1, "P2").unwrap();
    let r2 = b.add_state_region(bs, "r2").unwrap();
    let i2 = b.add_pseudostate(r2, "i2", PseudoKind::Initial).unwrap();
    let q1 = b.add_state(r2, "Q1").unwrap();
    let q2 = b.add_state(r2, "Q2").unwrap();

    b.add_transition(TransitionSpec::new(init, a)).unwrap();
    b.add_transition(TransitionSpec::new(a_init, bs)).unwrap();
    b.add_transition(TransitionSpec::new(i1, p1)).unwrap();
    b.add_transition(TransitionSpec::new(i2, q1)).unwrap();
    b.add_transition(TransitionSpec::new(p1, p2).on("p")).unwrap();
    b.add_transition(TransitionSpec::new(q1, q2).on("q")).unwrap();
    b.add_transition(TransitionSpec::new(a, z).on("leave")).unwrap();
    b.add_transition(TransitionSpec::new(z, h).on("back")).unwrap();
    Arc::new(b.build().unwrap())
}

fn assert_active(exec: &Execution<Ctx>, expected: &[&str]) {
    let mut active = exec.active_states();
    active.sort();
    let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
    expected.sort();
    assert_eq!(active, expected);
}

#[test]
fn test_deep_history_restores_orthogonal_regions() {
    let mut exec = started(orthogonal_history_model());
    assert_active(&exec, &["A", "B", "P1", "Q1"]);
    exec.take("p").unwrap();
    exec.take("q").unwrap();
    exec.take("leave").unwrap();
    assert_active(&exec, &["Z"]);

    exec.take("back").unwrap();
    assert_active(&exec, &["A", "B", "P2", "Q2"]);
}

#[test]
fn test_deep_history_of_orthogonal_regions_survives_resume() {
    let model = orthogonal_history_model();
    let mut exec = started(Arc::clone(&model));
    exec.take("q").unwrap();
    exec.take("leave").unwrap();
    let snap = exec.pause().unwrap();

    let mut fresh = Execution::new(model, Ctx::default());
    fresh.resume(snap).unwrap();
    fresh.take("back").unwrap();
    assert_active(&fresh, &["A", "B", "P1", "Q2"]);
}

#[test]
fn test_shallow_history_restores_one_level() {
    let mut exec = started(history_model(PseudoKind::ShallowHistory, false));
    exec.take("next").unwrap();
    exec.take("leave").unwrap();

    exec.take("back").unwrap();
    assert_eq!(exec.active_states(), vec!["A", "B", "C1"]);
}

#[test]
fn test_history_without_record_uses_default_entry() {
    for kind in [PseudoKind::ShallowHistory, PseudoKind::DeepHistory] {
        let mut exec = started(history_model(kind, true));
        assert_eq!(exec.active_states(), vec!["Z"]);
        exec.take("back").unwrap();
        assert_eq!(exec.active_states(), vec!["A", "B", "C1"]);
        assert!(exec.history().is_empty());
    }
}

/// root: O(r1: P1, r2: Q1), join J, T
/// P1 -a-> J, Q1 -b-> J, J -> T
fn join_model() -> Model {
    let mut b = ModelBuilder::new("join");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let o = b.add_state(root, "O").unwrap();
    let j = b.add_pseudostate(root, "J", PseudoKind::Join).unwrap();
    let t = b.add_state(root, "T").unwrap();
    b.on_entry(t, |c: &mut Ctx, _| {
        c.n += 1;
        Ok(())
    })
    .unwrap();

    let r1 = b.add_state_region(o, "r1").unwrap();
    let i1 = b.add_pseudostate(r1, "i1", PseudoKind::Initial).unwrap();
    let p1 = b.add_state(r1, "P1").unwrap();
    let r2 = b.add_state_region(o, "r2").unwrap();
    let i2 = b.add_pseudostate(r2, "i2", PseudoKind::Initial).unwrap();
    let q1 = b.add_state(r2, "Q1").unwrap();

    b.add_transition(TransitionSpec::new(init, o)).unwrap();
    b.add_transition(TransitionSpec::new(i1, p1)).unwrap();
    b.add_transition(TransitionSpec::new(i2, q1)).unwrap();
    b.add_transition(TransitionSpec::new(p1, j).on("a")).unwrap();
    b.add_transition(TransitionSpec::new(q1, j).on("b")).unwrap();
    b.add_transition(TransitionSpec::new(j, t)).unwrap();
    Arc::new(b.build().unwrap())
}

#[test]
fn test_join_is_order_invariant() {
    for order in [["a", "b"], ["b", "a"]] {
        let mut exec = started(join_model());
        assert_eq!(exec.active_states(), vec!["O", "P1", "Q1"]);

        exec.take(order[0]).unwrap();
        assert!(exec.is_active("O"));
        assert!(!exec.is_active("J"));
        assert_eq!(exec.configuration().len(), 2);

        exec.take(order[1]).unwrap();
        assert_eq!(exec.active_states(), vec!["T"], "order {:?}", order);
        assert_eq!(exec.context().n, 1);
    }
}

#[test]
fn test_parked_join_survives_snapshot() {
    let model = join_model();
    let mut exec = started(Arc::clone(&model));
    exec.take("a").unwrap();

    let snap = exec.pause().unwrap();
    let o = &snap.state_configuration.children[0];
    assert_eq!(o.id, "O");
    assert_eq!(o.children[0].id, "J");
    assert_eq!(o.children[0].region.as_deref(), Some("r1"));

    let json = serde_json::to_string(&snap).unwrap();
    let restored: Snapshot<Ctx> = serde_json::from_str(&json).unwrap();
    let mut fresh = Execution::new(model, Ctx::default());
    fresh.resume(restored).unwrap();
    assert_eq!(fresh.status(), ExecutionStatus::Running);

    fresh.take("b").unwrap();
    assert_eq!(fresh.active_states(), vec!["T"]);
}

/// root: A -split-> fork F -> { P2 in O/r1, Q2 in O/r2 }
fn fork_model() -> Model {
    let mut b = ModelBuilder::new("fork");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let a = b.add_state(root, "A").unwrap();
    let f = b.add_pseudostate(root, "F", PseudoKind::Fork).unwrap();
    let o = b.add_state(root, "O").unwrap();

    let r1 = b.add_state_region(o, "r1").unwrap();
    let i1 = b.add_pseudostate(r1, "i1", PseudoKind::Initial).unwrap();
    let p1 = b.add_state(r1, "P1").unwrap();
    let p2 = b.add_state(r1, "P2").unwrap();
    let r2 = b.add_state_region(o, "r2").unwrap();
    let i2 = b.add_pseudostate(r2, "i2", PseudoKind::Initial).unwrap();
    let q1 = b.add_state(r2, "Q1").unwrap();
    let q2 = b.add_state(r2, "Q2").unwrap();

    b.add_transition(TransitionSpec::new(init, a)).unwrap();
    b.add_transition(TransitionSpec::new(i1, p1)).unwrap();
    b.add_transition(TransitionSpec::new(i2, q1)).unwrap();
    b.add_transition(TransitionSpec::new(a, f).on("split")).unwrap();
    b.add_transition(TransitionSpec::new(f, p2)).unwrap();
    b.add_transition(TransitionSpec::new(f, q2)).unwrap();
    Arc::new(b.build().unwrap())
}

#[test]
fn test_fork_enters_every_branch() {
    let mut exec = started(fork_model());
    assert_eq!(exec.take("split").unwrap(), TakeOutcome::Accepted);
    assert_eq!(exec.active_states(), vec!["O", "P2", "Q2"]);
}

/// S -choose-> choice, S -junction-> junction, both with effect n += 20
/// and branches Big [n > 10] / Small [else].
fn branch_model() -> Model {
    let mut b = ModelBuilder::new("branch");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let s = b.add_state(root, "S").unwrap();
    let big = b.add_state(root, "Big").unwrap();
    let small = b.add_state(root, "Small").unwrap();
    let choice = b.add_pseudostate(root, "C", PseudoKind::Choice).unwrap();
    let junction = b.add_pseudostate(root, "J", PseudoKind::Junction).unwrap();
    let stuck = b.add_pseudostate(root, "Stuck", PseudoKind::Choice).unwrap();

    b.add_transition(TransitionSpec::new(init, s)).unwrap();
    for (trigger, target) in [("choose", choice), ("junction", junction)] {
        b.add_transition(TransitionSpec::new(s, target).on(trigger).effect(
            |c: &mut Ctx, _| {
                c.n += 20;
                Ok(())
            },
        ))
        .unwrap();
        b.add_transition(
            TransitionSpec::new(target, big).guard(|c: &Ctx, _| Ok(c.n > 10)),
        )
        .unwrap();
        b.add_transition(TransitionSpec::new(target, small).else_guard())
            .unwrap();
    }
    b.add_transition(TransitionSpec::new(s, stuck).on("stuck")).unwrap();
    b.add_transition(TransitionSpec::new(stuck, big).guard(|_: &Ctx, _| Ok(false)))
        .unwrap();
    Arc::new(b.build().unwrap())
}

#[test]
fn test_choice_sees_effect_junction_does_not() {
    let mut exec = started(branch_model());
    exec.take("choose").unwrap();
    assert_eq!(exec.active_states(), vec!["Big"]);
    assert_eq!(exec.context().n, 20);

    let mut exec = started(branch_model());
    exec.take("junction").unwrap();
    assert_eq!(exec.active_states(), vec!["Small"]);
    assert_eq!(exec.context().n, 20);
}

#[test]
fn test_choice_without_branch_faults() {
    let mut exec = started(branch_model());
    let err = exec.take("stuck").unwrap_err();
    assert!(matches!(err, EngineError::NoEnabledBranch { vertex } if vertex == "Stuck"));
    assert_eq!(exec.status(), ExecutionStatus::Faulted);
    assert!(matches!(exec.take("choose"), Err(EngineError::Faulted { .. })));
}

#[test]
fn test_junction_backtracks_to_sibling() {
    // J1 -> J2 -> Y is declared first but Y's guard fails.
    let mut b = ModelBuilder::new("junctions");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let s = b.add_state(root, "S").unwrap();
    let x = b.add_state(root, "X").unwrap();
    let y = b.add_state(root, "Y").unwrap();
    let j1 = b.add_pseudostate(root, "J1", PseudoKind::Junction).unwrap();
    let j2 = b.add_pseudostate(root, "J2", PseudoKind::Junction).unwrap();
    b.add_transition(TransitionSpec::new(init, s)).unwrap();
    b.add_transition(TransitionSpec::new(s, j1).on("go")).unwrap();
    b.add_transition(TransitionSpec::new(j1, j2).guard(|_: &Ctx, _| Ok(true)))
        .unwrap();
    b.add_transition(TransitionSpec::new(j1, x).guard(|_: &Ctx, _| Ok(true)))
        .unwrap();
    b.add_transition(TransitionSpec::new(j2, y).guard(|_: &Ctx, _| Ok(false)))
        .unwrap();

    let mut exec = started(Arc::new(b.build().unwrap()));
    assert_eq!(exec.take("go").unwrap(), TakeOutcome::Accepted);
    assert_eq!(exec.active_states(), vec!["X"]);
}

#[test]
fn test_junction_dead_end_is_denied() {
    let mut b = ModelBuilder::new("dead");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let s = b.add_state(root, "S").unwrap();
    let x = b.add_state(root, "X").unwrap();
    let j = b.add_pseudostate(root, "J", PseudoKind::Junction).unwrap();
    b.add_transition(TransitionSpec::new(init, s)).unwrap();
    b.add_transition(TransitionSpec::new(s, j).on("go")).unwrap();
    b.add_transition(TransitionSpec::new(j, x).guard(|_: &Ctx, _| Ok(false)))
        .unwrap();

    let mut exec = started(Arc::new(b.build().unwrap()));
    assert_eq!(exec.take("go").unwrap(), TakeOutcome::Denied);
    assert_eq!(exec.active_states(), vec!["S"]);
}

/// X -> Y after 30ms, X -tick-> X internal, X -leave-> Z
fn timer_model() -> Model {
    let mut b = ModelBuilder::new("timer");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let x = b.add_state(root, "X").unwrap();
    let y = b.add_state(root, "Y").unwrap();
    let z = b.add_state(root, "Z").unwrap();
    b.add_transition(TransitionSpec::new(init, x)).unwrap();
    b.add_transition(
        TransitionSpec::new(x, y)
            .after(Duration::from_millis(30))
            .effect(|c: &mut Ctx, e: &Event| {
                c.n = e.elapsed().map(|d| d.as_millis() as i64).unwrap_or(-1);
                Ok(())
            }),
    )
    .unwrap();
    b.add_transition(
        TransitionSpec::new(x, x)
            .on("tick")
            .kind(TransitionKind::Internal)
            .effect(|c: &mut Ctx, _| {
                c.log.push("tick".to_string());
                Ok(())
            }),
    )
    .unwrap();
    b.add_transition(TransitionSpec::new(x, z).on("leave")).unwrap();
    Arc::new(b.build().unwrap())
}

#[tokio::test]
async fn test_timer_survives_internal_transition() {
    let (mut exec, mut rx) = with_runtime(timer_model());
    exec.go().unwrap();
    assert_eq!(exec.take("tick").unwrap(), TakeOutcome::Accepted);

    let wakeup = next_wakeup(&mut rx).await;
    exec.handle_wakeup(wakeup).unwrap();
    assert_eq!(exec.active_states(), vec!["Y"]);
    assert_eq!(exec.context().n, 30);
    assert_eq!(exec.context().log, vec!["tick"]);
}

#[tokio::test]
async fn test_timer_cancelled_by_exit() {
    let (mut exec, mut rx) = with_runtime(timer_model());
    exec.go().unwrap();
    exec.take("leave").unwrap();

    let waited = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(waited.is_err());
    assert_eq!(exec.active_states(), vec!["Z"]);
}

/// X -> Y after 200ms, X -again-> X external
fn rearm_model() -> Model {
    let mut b = ModelBuilder::new("rearm");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let x = b.add_state(root, "X").unwrap();
    let y = b.add_state(root, "Y").unwrap();
    b.add_transition(TransitionSpec::new(init, x)).unwrap();
    b.add_transition(TransitionSpec::new(x, y).after(Duration::from_millis(200)))
        .unwrap();
    b.add_transition(TransitionSpec::new(x, x).on("again")).unwrap();
    Arc::new(b.build().unwrap())
}

#[tokio::test]
async fn test_self_transition_restarts_timer() {
    let (seen, listener) = recorder();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut exec = ExecutionBuilder::new()
        .model(rearm_model())
        .context(Ctx::default())
        .listener(listener)
        .runtime(RuntimeLink::current(tx).unwrap())
        .build()
        .unwrap();
    exec.go().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(exec.take("again").unwrap(), TakeOutcome::Accepted);
    let kinds = kinds(&seen);
    let exited = kinds.iter().rposition(|k| k == "state_exited:X");
    let entered = kinds.iter().rposition(|k| k == "state_entered:X");
    assert!(exited.is_some());
    assert!(exited < entered);

    // The first arming would have fired 100ms after the self-transition.
    let early = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
    assert!(early.is_err());
    assert_eq!(exec.active_states(), vec!["X"]);

    let wakeup = next_wakeup(&mut rx).await;
    exec.handle_wakeup(wakeup).unwrap();
    assert_eq!(exec.active_states(), vec!["Y"]);
}

#[tokio::test]
async fn test_pause_drops_timer_and_resume_rearms() {
    let (mut exec, mut rx) = with_runtime(timer_model());
    exec.go().unwrap();
    let snap = exec.pause().unwrap();

    let stale = next_wakeup(&mut rx).await;
    exec.handle_wakeup(stale).unwrap();
    assert_eq!(exec.active_states(), vec!["X"]);

    exec.resume(snap).unwrap();
    let wakeup = next_wakeup(&mut rx).await;
    exec.handle_wakeup(wakeup).unwrap();
    assert_eq!(exec.active_states(), vec!["Y"]);
}

#[test]
fn test_timer_requires_runtime() {
    let mut exec = Execution::new(timer_model(), Ctx::default());
    let err = exec.go().unwrap_err();
    assert!(matches!(err, EngineError::RuntimeUnavailable { .. }));
    assert_eq!(exec.status(), ExecutionStatus::Faulted);
}

#[tokio::test]
async fn test_wakeup_for_other_execution_is_rejected() {
    let (mut exec, _rx) = with_runtime(timer_model());
    exec.go().unwrap();
    let model = Arc::clone(exec.model());
    let x = model.find_vertex("X").unwrap();
    let transition = model.timed_transitions(x).next().unwrap();
    let wakeup = Wakeup::Timer {
        execution: ExecutionId::new("someone-else"),
        transition,
        generation: 1,
        elapsed: Duration::ZERO,
    };
    assert!(matches!(
        exec.handle_wakeup(wakeup),
        Err(EngineError::ExecutionMismatch { .. })
    ));
    assert_eq!(exec.status(), ExecutionStatus::Running);
}

/// W runs an activity, then completes into Done.
fn activity_model(fail: bool) -> Model {
    let mut b = ModelBuilder::new("activity");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let w = b.add_state(root, "W").unwrap();
    let done = b.add_state(root, "Done").unwrap();
    b.set_activity(w, move |ctx: Ctx, _| {
        if fail {
            Err(BehaviorError::new(format!("broken at {}", ctx.n)))
        } else {
            Ok(())
        }
    })
    .unwrap();
    b.add_transition(TransitionSpec::new(init, w)).unwrap();
    b.add_transition(TransitionSpec::new(w, done)).unwrap();
    Arc::new(b.build().unwrap())
}

#[tokio::test]
async fn test_activity_completion_fires_completion_transition() {
    let (mut exec, mut rx) = with_runtime(activity_model(false));
    exec.go().unwrap();
    assert_eq!(exec.active_states(), vec!["W"]);

    let wakeup = next_wakeup(&mut rx).await;
    exec.handle_wakeup(wakeup).unwrap();
    assert_eq!(exec.active_states(), vec!["Done"]);
}

/// W runs until cancelled and flags that it saw the cancellation.
/// W -stop-> Done
fn long_activity_model(stopped: Arc<AtomicBool>) -> Model {
    let mut b = ModelBuilder::new("long-activity");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let w = b.add_state(root, "W").unwrap();
    let done = b.add_state(root, "Done").unwrap();
    b.set_activity(w, move |_: Ctx, token: CancellationToken| {
        while !token.is_cancelled() {
            std::thread::sleep(Duration::from_millis(5));
        }
        stopped.store(true, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();
    b.add_transition(TransitionSpec::new(init, w)).unwrap();
    b.add_transition(TransitionSpec::new(w, done).on("stop")).unwrap();
    Arc::new(b.build().unwrap())
}

#[tokio::test]
async fn test_exit_cancels_running_activity() {
    let stopped = Arc::new(AtomicBool::new(false));
    let (seen, listener) = recorder();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut exec = ExecutionBuilder::new()
        .model(long_activity_model(Arc::clone(&stopped)))
        .context(Ctx::default())
        .listener(listener)
        .runtime(RuntimeLink::current(tx).unwrap())
        .build()
        .unwrap();
    exec.go().unwrap();
    assert!(kinds(&seen).contains(&"activity_started:W".to_string()));

    exec.take("stop").unwrap();
    assert_eq!(exec.active_states(), vec!["Done"]);
    let kinds = kinds(&seen);
    let cancelled = kinds.iter().position(|k| k == "activity_cancelled:W");
    let exited = kinds.iter().position(|k| k == "state_exited:W");
    assert!(cancelled.is_some());
    assert!(cancelled < exited);

    for _ in 0..500 {
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stopped.load(Ordering::SeqCst));
    let late = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(late.is_err());
}

#[tokio::test]
async fn test_activity_works_on_a_copy_of_the_context() {
    let mut b = ModelBuilder::new("copy");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let w = b.add_state(root, "W").unwrap();
    let done = b.add_state(root, "Done").unwrap();
    b.set_activity(w, |mut ctx: Ctx, _| {
        ctx.n = 99;
        ctx.log.push("activity".to_string());
        Ok(())
    })
    .unwrap();
    b.add_transition(TransitionSpec::new(init, w)).unwrap();
    b.add_transition(TransitionSpec::new(w, done)).unwrap();

    let (mut exec, mut rx) = with_runtime(Arc::new(b.build().unwrap()));
    exec.context_mut().n = 1;
    exec.go().unwrap();
    let wakeup = next_wakeup(&mut rx).await;
    exec.handle_wakeup(wakeup).unwrap();

    assert_eq!(exec.active_states(), vec!["Done"]);
    assert_eq!(exec.context().n, 1);
    assert!(exec.context().log.is_empty());
}

#[tokio::test]
async fn test_activity_failure_faults() {
    let (mut exec, mut rx) = with_runtime(activity_model(true));
    exec.go().unwrap();

    let wakeup = next_wakeup(&mut rx).await;
    let err = exec.handle_wakeup(wakeup).unwrap_err();
    assert!(matches!(err, EngineError::Activity { ref state, .. } if state == "W"));
    assert_eq!(err.to_string(), "activity of 'W' failed: broken at 0");
    assert_eq!(exec.status(), ExecutionStatus::Faulted);
}

#[test]
fn test_resume_rejects_unknown_state() {
    let mut exec = started(switch());
    exec.take("on").unwrap();
    let mut snap = exec.pause().unwrap();
    snap.state_configuration.children[0] = SnapshotNode::new("GHOST");

    let err = exec.resume(snap).unwrap_err();
    assert!(matches!(err, EngineError::StateNotFound { ref id } if id == "GHOST"));
    assert_eq!(exec.status(), ExecutionStatus::Faulted);
}

#[test]
fn test_resume_rejects_unknown_region() {
    let mut exec = started(switch());
    let mut snap = exec.pause().unwrap();
    snap.history
        .insert("nowhere".to_string(), SnapshotNode::new("OFF"));

    let err = exec.resume(snap).unwrap_err();
    assert!(matches!(err, EngineError::RegionNotFound { ref id } if id == "nowhere"));
}

#[test]
fn test_resume_on_fresh_execution() {
    let model = switch();
    let mut exec = started(Arc::clone(&model));
    exec.context_mut().n = 7;
    exec.take("on").unwrap();
    let snap = exec.pause().unwrap();

    let value = serde_json::to_value(&snap).unwrap();
    assert_eq!(value["state_configuration"]["children"][0]["id"], "ON");
    let restored: Snapshot<Ctx> = serde_json::from_value(value).unwrap();

    let mut fresh = Execution::new(model, Ctx::default());
    fresh.resume(restored).unwrap();
    assert_eq!(fresh.context().n, 7);
    assert!(fresh.is_active("ON"));
    assert_eq!(fresh.take("off").unwrap(), TakeOutcome::Accepted);
    assert!(fresh.is_active("OFF"));
}

#[test]
fn test_terminated_cannot_resume() {
    let mut exec = started(switch());
    exec.take("end").unwrap();
    let snap = exec.snapshot();
    assert!(snap.terminated);
    assert!(matches!(exec.pause(), Err(EngineError::Terminated)));
    assert!(matches!(
        exec.resume(snap.clone()),
        Err(EngineError::CannotResumeTerminated)
    ));

    let mut fresh = Execution::new(switch(), Ctx::default());
    assert!(matches!(
        fresh.resume(snap),
        Err(EngineError::CannotResumeTerminated)
    ));
}

/// S -check-> T with a failing guard, S -boom-> T with a failing effect.
fn faulty_model() -> Model {
    let mut b = ModelBuilder::new("faulty");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let s = b.add_state(root, "S").unwrap();
    let t = b.add_state(root, "T").unwrap();
    b.add_transition(TransitionSpec::new(init, s)).unwrap();
    b.add_transition(
        TransitionSpec::new(s, t)
            .on("check")
            .named("check")
            .guard(|_: &Ctx, _| Err(BehaviorError::new("bad guard"))),
    )
    .unwrap();
    b.add_transition(
        TransitionSpec::new(s, t)
            .on("boom")
            .effect(|_: &mut Ctx, _| Err(BehaviorError::new("bad effect"))),
    )
    .unwrap();
    Arc::new(b.build().unwrap())
}

#[test]
fn test_guard_failure_is_reported_and_fatal() {
    let (seen, listener) = recorder();
    let mut exec = ExecutionBuilder::new()
        .model(faulty_model())
        .context(Ctx::default())
        .listener(listener)
        .build()
        .unwrap();
    exec.go().unwrap();

    let err = exec.take("check").unwrap_err();
    assert!(matches!(err, EngineError::Guard { ref transition, .. } if transition == "check"));
    assert!(seen.lock().unwrap().contains(&LifecycleEvent::GuardFailed {
        transition: "check".to_string(),
        event: "check".to_string(),
        error: "bad guard".to_string(),
    }));
    assert_eq!(exec.status(), ExecutionStatus::Faulted);
    assert!(exec.is_active("S"));
    assert!(matches!(exec.take("boom"), Err(EngineError::Faulted { .. })));
}

#[test]
fn test_effect_failure_names_the_event() {
    let (seen, listener) = recorder();
    let mut exec = ExecutionBuilder::new()
        .model(faulty_model())
        .context(Ctx::default())
        .listener(listener)
        .build()
        .unwrap();
    exec.go().unwrap();

    exec.take("boom").unwrap_err();
    assert!(seen.lock().unwrap().contains(&LifecycleEvent::EffectFailed {
        transition: "S->T".to_string(),
        event: "boom".to_string(),
        error: "bad effect".to_string(),
    }));
}

#[test]
fn test_entry_and_exit_failures_name_event_and_transition() {
    let mut b = ModelBuilder::new("hooks");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let s = b.add_state(root, "S").unwrap();
    let t = b.add_state(root, "T").unwrap();
    let u = b.add_state(root, "U").unwrap();
    b.on_entry(t, |_: &mut Ctx, _| Err(BehaviorError::new("no entry")))
        .unwrap();
    b.on_exit(u, |_: &mut Ctx, _| Err(BehaviorError::new("no exit")))
        .unwrap();
    b.add_transition(TransitionSpec::new(init, s)).unwrap();
    b.add_transition(TransitionSpec::new(s, t).on("enter")).unwrap();
    b.add_transition(TransitionSpec::new(s, u).on("visit")).unwrap();
    b.add_transition(TransitionSpec::new(u, s).on("leave").named("back"))
        .unwrap();
    let model: Model = Arc::new(b.build().unwrap());

    let (seen, listener) = recorder();
    let mut exec = ExecutionBuilder::new()
        .model(Arc::clone(&model))
        .context(Ctx::default())
        .listener(listener)
        .build()
        .unwrap();
    exec.go().unwrap();
    assert_eq!(exec.take("enter").unwrap_err().error_code(), "ACTION_FAILED");
    assert!(seen.lock().unwrap().contains(&LifecycleEvent::StateEntryFailed {
        state: "T".to_string(),
        event: "enter".to_string(),
        transition: Some("S->T".to_string()),
        error: "no entry".to_string(),
    }));

    let (seen, listener) = recorder();
    let mut exec = ExecutionBuilder::new()
        .model(model)
        .context(Ctx::default())
        .listener(listener)
        .build()
        .unwrap();
    exec.go().unwrap();
    exec.take("visit").unwrap();
    assert_eq!(exec.take("leave").unwrap_err().error_code(), "ACTION_FAILED");
    assert!(seen.lock().unwrap().contains(&LifecycleEvent::StateExitFailed {
        state: "U".to_string(),
        event: "leave".to_string(),
        transition: Some("back".to_string()),
        error: "no exit".to_string(),
    }));
}

#[test]
fn test_effect_failure_leaves_partial_configuration() {
    let mut exec = started(faulty_model());
    let err = exec.take("boom").unwrap_err();
    assert_eq!(err.error_code(), "EFFECT_FAILED");
    assert!(!exec.is_active("S"));
    assert!(!exec.is_active("T"));
    assert!(exec.fault().unwrap_or_default().contains("bad effect"));
}

/// A defers x; A -y-> B, A -z-> D, B -x-> C
fn deferral_model() -> Model {
    let mut b = ModelBuilder::new("defer");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let a = b.add_state(root, "A").unwrap();
    let bs = b.add_state(root, "B").unwrap();
    let c = b.add_state(root, "C").unwrap();
    let d = b.add_state(root, "D").unwrap();
    b.defer(a, "x").unwrap();
    b.add_transition(TransitionSpec::new(init, a)).unwrap();
    b.add_transition(TransitionSpec::new(a, bs).on("y")).unwrap();
    b.add_transition(TransitionSpec::new(a, d).on("z")).unwrap();
    b.add_transition(TransitionSpec::new(bs, c).on("x")).unwrap();
    Arc::new(b.build().unwrap())
}

#[test]
fn test_deferred_event_is_recalled() {
    let mut exec = started(deferral_model());
    assert_eq!(exec.take("x").unwrap(), TakeOutcome::Deferred);
    assert_eq!(exec.deferred_len(), 1);
    assert_eq!(exec.active_states(), vec!["A"]);

    assert_eq!(exec.take("y").unwrap(), TakeOutcome::Accepted);
    assert_eq!(exec.active_states(), vec!["C"]);
    assert_eq!(exec.deferred_len(), 0);
}

#[test]
fn test_deferred_event_dropped_when_unhandled() {
    let mut exec = started(deferral_model());
    exec.take("x").unwrap();
    exec.take("z").unwrap();
    assert_eq!(exec.active_states(), vec!["D"]);
    assert_eq!(exec.deferred_len(), 0);
}

#[test]
fn test_deferred_events_travel_with_snapshot() {
    let model = deferral_model();
    let mut exec = started(Arc::clone(&model));
    assert_eq!(exec.take("x").unwrap(), TakeOutcome::Deferred);
    let snap = exec.pause().unwrap();
    assert_eq!(snap.deferred, vec![Event::new("x")]);

    let text = serde_json::to_string(&snap).unwrap();
    let restored: Snapshot<Ctx> = serde_json::from_str(&text).unwrap();
    let mut fresh = Execution::new(model, Ctx::default());
    fresh.resume(restored).unwrap();
    assert_eq!(fresh.deferred_len(), 1);

    fresh.take("y").unwrap();
    assert_eq!(fresh.active_states(), vec!["C"]);
}

#[test]
fn test_resume_replaces_deferred_queue() {
    let mut exec = started(deferral_model());
    let before = exec.snapshot();
    assert!(before.deferred.is_empty());

    exec.take("x").unwrap();
    exec.pause().unwrap();
    exec.resume(before).unwrap();
    assert_eq!(exec.deferred_len(), 0);

    exec.take("y").unwrap();
    assert_eq!(exec.active_states(), vec!["B"]);
}

#[test]
fn test_terminate_stops_everything() {
    let (seen, listener) = recorder();
    let mut b = ModelBuilder::new("kill");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let a = b.add_state(root, "A").unwrap();
    let k = b.add_pseudostate(root, "K", PseudoKind::Terminate).unwrap();
    b.on_exit(a, |c: &mut Ctx, _| {
        c.log.push("exit A".to_string());
        Ok(())
    })
    .unwrap();
    b.add_transition(TransitionSpec::new(init, a)).unwrap();
    b.add_transition(TransitionSpec::new(a, k).on("kill")).unwrap();

    let mut exec = ExecutionBuilder::new()
        .model(Arc::new(b.build().unwrap()))
        .context(Ctx::default())
        .listener(listener)
        .build()
        .unwrap();
    exec.go().unwrap();
    assert_eq!(exec.take("kill").unwrap(), TakeOutcome::Accepted);

    assert_eq!(exec.status(), ExecutionStatus::Terminated);
    assert!(exec.active_states().is_empty());
    assert_eq!(exec.take("kill").unwrap(), TakeOutcome::Denied);
    let snap = exec.snapshot();
    assert!(matches!(
        exec.resume(snap),
        Err(EngineError::CannotResumeTerminated)
    ));
    assert!(seen
        .lock()
        .unwrap()
        .contains(&LifecycleEvent::MachineTerminated { completed: false }));
}

/// root: C(rc: C1); the initial either targets C or C1 directly.
fn nested_model(explicit: bool) -> Model {
    let mut b = ModelBuilder::new("nested");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let c = b.add_state(root, "C").unwrap();
    let rc = b.add_state_region(c, "rc").unwrap();
    let ci = b.add_pseudostate(rc, "ci", PseudoKind::Initial).unwrap();
    let c1 = b.add_state(rc, "C1").unwrap();
    b.add_transition(TransitionSpec::new(init, if explicit { c1 } else { c }))
        .unwrap();
    b.add_transition(TransitionSpec::new(ci, c1)).unwrap();
    Arc::new(b.build().unwrap())
}

#[test]
fn test_none_policy_refuses_default_entry() {
    let options = ExecutionOptions::default().with_default_entry(DefaultEntryPolicy::None);

    let mut exec = ExecutionBuilder::new()
        .model(nested_model(false))
        .context(Ctx::default())
        .options(options.clone())
        .build()
        .unwrap();
    let err = exec.go().unwrap_err();
    assert!(matches!(err, EngineError::NoDefaultEntry { ref region } if region == "rc"));
    assert_eq!(exec.status(), ExecutionStatus::Faulted);

    let mut exec = ExecutionBuilder::new()
        .model(nested_model(true))
        .context(Ctx::default())
        .options(options)
        .build()
        .unwrap();
    exec.go().unwrap();
    assert_eq!(exec.active_states(), vec!["C", "C1"]);
}

#[test]
fn test_completion_loop_is_bounded() {
    let mut b = ModelBuilder::new("loop");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let a = b.add_state(root, "A").unwrap();
    let bs = b.add_state(root, "B").unwrap();
    b.add_transition(TransitionSpec::new(init, a)).unwrap();
    b.add_transition(TransitionSpec::new(a, bs)).unwrap();
    b.add_transition(TransitionSpec::new(bs, a)).unwrap();

    let mut exec = ExecutionBuilder::new()
        .model(Arc::new(b.build().unwrap()))
        .context(Ctx::default())
        .options(ExecutionOptions::default().with_max_completion_chain(10))
        .build()
        .unwrap();
    let err = exec.go().unwrap_err();
    assert!(matches!(err, EngineError::CompletionLoop { limit: 10 }));
}

#[test]
fn test_composite_completes_when_region_final() {
    let mut b = ModelBuilder::new("complete");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let p = b.add_state(root, "P").unwrap();
    let done = b.add_state(root, "Done").unwrap();
    let rp = b.add_state_region(p, "rp").unwrap();
    let pi = b.add_pseudostate(rp, "pi", PseudoKind::Initial).unwrap();
    let p1 = b.add_state(rp, "P1").unwrap();
    let pf = b.add_final(rp, "PF").unwrap();
    b.add_transition(TransitionSpec::new(init, p)).unwrap();
    b.add_transition(TransitionSpec::new(pi, p1)).unwrap();
    b.add_transition(TransitionSpec::new(p1, pf).on("fin")).unwrap();
    b.add_transition(TransitionSpec::new(p, done)).unwrap();

    let mut exec = started(Arc::new(b.build().unwrap()));
    assert_eq!(exec.active_states(), vec!["P", "P1"]);
    exec.take("fin").unwrap();
    assert_eq!(exec.active_states(), vec!["Done"]);
    assert_eq!(exec.status(), ExecutionStatus::Running);
}

#[test]
fn test_simple_state_completes_after_entry() {
    let mut b = ModelBuilder::new("pass");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let s1 = b.add_state(root, "S1").unwrap();
    let s2 = b.add_state(root, "S2").unwrap();
    b.add_transition(TransitionSpec::new(init, s1)).unwrap();
    b.add_transition(TransitionSpec::new(s1, s2)).unwrap();

    let exec = started(Arc::new(b.build().unwrap()));
    assert_eq!(exec.active_states(), vec!["S2"]);
}

/// root: P(rp: P1, P2), Out; P1 -e-> P2, P -e-> Out, P -f-> Out,
/// P -local-> P2 (local), P -ext-> P2 (external). P's entry counts.
fn scope_model() -> Model {
    let mut b = ModelBuilder::new("scope");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let p = b.add_state(root, "P").unwrap();
    let out = b.add_state(root, "Out").unwrap();
    let rp = b.add_state_region(p, "rp").unwrap();
    let pi = b.add_pseudostate(rp, "pi", PseudoKind::Initial).unwrap();
    let p1 = b.add_state(rp, "P1").unwrap();
    let p2 = b.add_state(rp, "P2").unwrap();
    b.on_entry(p, |c: &mut Ctx, _| {
        c.n += 1;
        Ok(())
    })
    .unwrap();
    b.add_transition(TransitionSpec::new(init, p)).unwrap();
    b.add_transition(TransitionSpec::new(pi, p1)).unwrap();
    b.add_transition(TransitionSpec::new(p1, p2).on("e")).unwrap();
    b.add_transition(TransitionSpec::new(p, out).on("e")).unwrap();
    b.add_transition(TransitionSpec::new(p, out).on("f")).unwrap();
    b.add_transition(
        TransitionSpec::new(p, p2)
            .on("local")
            .kind(TransitionKind::Local),
    )
    .unwrap();
    b.add_transition(TransitionSpec::new(p, p2).on("ext")).unwrap();
    Arc::new(b.build().unwrap())
}

#[test]
fn test_innermost_transition_wins() {
    let mut exec = started(scope_model());
    exec.take("e").unwrap();
    assert_eq!(exec.active_states(), vec!["P", "P2"]);
    // P2 has no transition on e, so the outer one applies now.
    exec.take("e").unwrap();
    assert_eq!(exec.active_states(), vec!["Out"]);
}

#[test]
fn test_local_transition_keeps_source() {
    let mut exec = started(scope_model());
    assert_eq!(exec.context().n, 1);
    exec.take("local").unwrap();
    assert_eq!(exec.active_states(), vec!["P", "P2"]);
    assert_eq!(exec.context().n, 1);

    exec.take("ext").unwrap();
    assert_eq!(exec.active_states(), vec!["P", "P2"]);
    assert_eq!(exec.context().n, 2);
}

#[test]
fn test_orthogonal_regions_fire_together() {
    let mut b = ModelBuilder::new("ortho");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let o = b.add_state(root, "O").unwrap();
    let r1 = b.add_state_region(o, "r1").unwrap();
    let i1 = b.add_pseudostate(r1, "i1", PseudoKind::Initial).unwrap();
    let p1 = b.add_state(r1, "P1").unwrap();
    let p2 = b.add_state(r1, "P2").unwrap();
    let r2 = b.add_state_region(o, "r2").unwrap();
    let i2 = b.add_pseudostate(r2, "i2", PseudoKind::Initial).unwrap();
    let q1 = b.add_state(r2, "Q1").unwrap();
    let q2 = b.add_state(r2, "Q2").unwrap();
    b.add_transition(TransitionSpec::new(init, o)).unwrap();
    b.add_transition(TransitionSpec::new(i1, p1)).unwrap();
    b.add_transition(TransitionSpec::new(i2, q1)).unwrap();
    b.add_transition(TransitionSpec::new(p1, p2).on("e")).unwrap();
    b.add_transition(TransitionSpec::new(q1, q2).on("e")).unwrap();

    let mut exec = started(Arc::new(b.build().unwrap()));
    exec.take("e").unwrap();
    assert_eq!(exec.active_states(), vec!["O", "P2", "Q2"]);
}

/// Template "worker": init -> Inner1, entry point "in" -> Inner2,
/// Inner1/Inner2 -done-> exit point "out". Host: Idle -enter-> S/in,
/// Idle -plain-> S, S/out -> After.
fn submachine_model() -> Model {
    let mut t = ModelBuilder::new("worker");
    let r = t.add_region("r").unwrap();
    let ti = t.add_pseudostate(r, "init", PseudoKind::Initial).unwrap();
    let inner1 = t.add_state(r, "Inner1").unwrap();
    let inner2 = t.add_state(r, "Inner2").unwrap();
    let ep = t
        .add_machine_connection_point("in", PseudoKind::EntryPoint)
        .unwrap();
    let xp = t
        .add_machine_connection_point("out", PseudoKind::ExitPoint)
        .unwrap();
    t.add_transition(TransitionSpec::new(ti, inner1)).unwrap();
    t.add_transition(TransitionSpec::new(ep, inner2)).unwrap();
    t.add_transition(TransitionSpec::new(inner1, xp).on("done")).unwrap();
    t.add_transition(TransitionSpec::new(inner2, xp).on("done")).unwrap();

    let mut b = ModelBuilder::new("host");
    let root = b.add_region("root").unwrap();
    let init = b.add_pseudostate(root, "init", PseudoKind::Initial).unwrap();
    let idle = b.add_state(root, "Idle").unwrap();
    let s = b.add_submachine_state(root, "S", &t).unwrap();
    let after = b.add_state(root, "After").unwrap();
    let entry = b.find_vertex("S/in").unwrap();
    let exit = b.find_vertex("S/out").unwrap();
    b.add_transition(TransitionSpec::new(init, idle)).unwrap();
    b.add_transition(TransitionSpec::new(idle, entry).on("enter")).unwrap();
    b.add_transition(TransitionSpec::new(idle, s).on("plain")).unwrap();
    b.add_transition(TransitionSpec::new(exit, after)).unwrap();
    Arc::new(b.build().unwrap())
}

#[test]
fn test_entry_point_enters_submachine() {
    let mut exec = started(submachine_model());
    exec.take("enter").unwrap();
    assert_eq!(exec.active_states(), vec!["S", "S/Inner2"]);

    exec.take("done").unwrap();
    assert_eq!(exec.active_states(), vec!["After"]);
}

#[test]
fn test_plain_entry_uses_submachine_initial() {
    let mut exec = started(submachine_model());
    exec.take("plain").unwrap();
    assert_eq!(exec.active_states(), vec!["S", "S/Inner1"]);
    exec.take("done").unwrap();
    assert_eq!(exec.active_states(), vec!["After"]);
}

#[tokio::test]
async fn test_broadcaster_receives_execution_events() {
    let broadcaster = Arc::new(LifecycleBroadcaster::new(64));
    let mut exec = ExecutionBuilder::new()
        .id("bcast")
        .model(switch())
        .context(Ctx::default())
        .listener(broadcaster.clone())
        .build()
        .unwrap();
    let (_, mut rx) = broadcaster.subscribe_execution(exec.id());

    exec.go().unwrap();
    let first = rx.recv().await.unwrap();
    assert_eq!(first.execution.as_str(), "bcast");
    assert_eq!(first.event, LifecycleEvent::MachineStarted);
}
