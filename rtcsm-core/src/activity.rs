//! Do-activity supervision.
//!
//! Activities run on the blocking pool with a copy of the context and a
//! cancellation token. Exiting the owning state cancels the token; the
//! activity is expected to notice and return. Its result is posted back as
//! a [`Wakeup::ActivityFinished`]; the context copy is dropped with it. A
//! cancelled activity posts nothing.

use crate::runtime::{ExecutionId, RuntimeLink, Wakeup};
use rtcsm_model::{ActivityFn, VertexId};
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct RunningActivity {
    token: CancellationToken,
    generation: u64,
}

/// Activities of one execution.
#[derive(Debug, Default)]
pub struct ActivityTable {
    running: HashMap<VertexId, RunningActivity>,
    finished: HashSet<VertexId>,
    next_generation: u64,
}

impl ActivityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the activity of `state`.
    pub fn start<C>(
        &mut self,
        link: &RuntimeLink,
        execution: &ExecutionId,
        state: VertexId,
        activity: ActivityFn<C>,
        ctx: C,
    ) -> u64
    where
        C: Send + 'static,
    {
        self.cancel(state);
        self.finished.remove(&state);
        self.next_generation += 1;
        let generation = self.next_generation;

        let token = CancellationToken::new();
        let child = token.clone();
        let wakeups = link.sender();
        let execution = execution.clone();
        link.handle().spawn_blocking(move || {
            let outcome = activity(ctx, child.clone());
            if child.is_cancelled() {
                return;
            }
            let _ = wakeups.send(Wakeup::ActivityFinished {
                execution,
                state,
                generation,
                outcome,
            });
        });

        self.running.insert(state, RunningActivity { token, generation });
        generation
    }

    /// Signals the activity of `state` to stop. Returns true if one was
    /// running.
    pub fn cancel(&mut self, state: VertexId) -> bool {
        self.finished.remove(&state);
        match self.running.remove(&state) {
            Some(activity) => {
                activity.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, activity) in self.running.drain() {
            activity.token.cancel();
        }
        self.finished.clear();
    }

    /// Consumes a running activity if the wakeup is current.
    pub fn accept(&mut self, state: VertexId, generation: u64) -> bool {
        match self.running.get(&state) {
            Some(a) if a.generation == generation => {
                self.running.remove(&state);
                true
            }
            _ => false,
        }
    }

    pub fn mark_finished(&mut self, state: VertexId) {
        self.finished.insert(state);
    }

    pub fn is_running(&self, state: VertexId) -> bool {
        self.running.contains_key(&state)
    }

    pub fn has_finished(&self, state: VertexId) -> bool {
        self.finished.contains(&state)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

impl Drop for ActivityTable {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
