//! Time event scheduler.
//!
//! A timed transition is armed when its source state is entered and
//! disarmed when that state exits. Each arming gets a fresh generation;
//! a wakeup whose generation no longer matches the armed entry is stale
//! and ignored.

use crate::runtime::{ExecutionId, RuntimeLink, Wakeup};
use rtcsm_model::{TransitionId, VertexId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct ArmedTimer {
    state: VertexId,
    generation: u64,
    handle: JoinHandle<()>,
}

/// Timers armed for one execution, keyed by transition.
#[derive(Debug, Default)]
pub struct TimerScheduler {
    armed: HashMap<TransitionId, ArmedTimer>,
    next_generation: u64,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `transition` to fire after `delay`. Re-arming replaces the
    /// previous timer.
    pub fn arm(
        &mut self,
        link: &RuntimeLink,
        execution: &ExecutionId,
        transition: TransitionId,
        state: VertexId,
        delay: Duration,
    ) -> u64 {
        self.disarm(transition);
        self.next_generation += 1;
        let generation = self.next_generation;

        let wakeups = link.sender();
        let execution = execution.clone();
        let handle = link.handle().spawn(async move {
            tokio::time::sleep(delay).await;
            // The execution may be gone.
            let _ = wakeups.send(Wakeup::Timer {
                execution,
                transition,
                generation,
                elapsed: delay,
            });
        });

        tracing::trace!("Armed timer {} for {:?} (gen {})", transition, delay, generation);
        self.armed.insert(
            transition,
            ArmedTimer {
                state,
                generation,
                handle,
            },
        );
        generation
    }

    /// Cancels one timer.
    pub fn disarm(&mut self, transition: TransitionId) -> bool {
        match self.armed.remove(&transition) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels every timer owned by `state`. Returns how many were armed.
    pub fn cancel_state(&mut self, state: VertexId) -> usize {
        let owned: Vec<TransitionId> = self
            .armed
            .iter()
            .filter(|(_, t)| t.state == state)
            .map(|(id, _)| *id)
            .collect();
        for id in &owned {
            self.disarm(*id);
        }
        owned.len()
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.armed.drain() {
            timer.handle.abort();
        }
    }

    /// Consumes an armed timer if the wakeup is current.
    pub fn accept(&mut self, transition: TransitionId, generation: u64) -> bool {
        match self.armed.get(&transition) {
            Some(timer) if timer.generation == generation => {
                self.armed.remove(&transition);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, transition: TransitionId) -> bool {
        self.armed.contains_key(&transition)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
