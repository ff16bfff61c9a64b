//! Lifecycle broadcasting.
//!
//! [`LifecycleBroadcaster`] is a [`Listener`] that republishes lifecycle
//! events on tokio broadcast channels, so observers can follow executions
//! from other tasks without slowing the engine down.

use crate::listener::{LifecycleEvent, Listener, ListenerError};
use crate::runtime::ExecutionId;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A lifecycle event tagged with its execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleNotice {
    pub execution: ExecutionId,
    pub event: LifecycleEvent,
}

/// Filter for global subscriptions.
#[derive(Debug, Clone, Default)]
pub struct LifecycleFilter {
    /// Only these executions (empty = all).
    pub executions: Vec<ExecutionId>,
    /// Only these hook kinds, e.g. `"state_entered"` (empty = all).
    pub kinds: Vec<String>,
    /// Only events about these states (empty = all).
    pub states: Vec<String>,
}

impl LifecycleFilter {
    /// Returns true if the notice matches this filter.
    pub fn matches(&self, notice: &LifecycleNotice) -> bool {
        (self.executions.is_empty() || self.executions.contains(&notice.execution))
            && (self.kinds.is_empty() || self.kinds.iter().any(|k| k == notice.event.kind()))
            && (self.states.is_empty()
                || notice
                    .event
                    .state()
                    .map(|s| self.states.iter().any(|f| f == s))
                    .unwrap_or(false))
    }
}

/// Subscription scope.
#[derive(Debug, Clone)]
pub enum SubscriptionScope {
    Execution(ExecutionId),
    All(LifecycleFilter),
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub subscription_id: String,
    pub scope: SubscriptionScope,
}

/// Fans lifecycle events out to subscribers.
pub struct LifecycleBroadcaster {
    /// Per-execution channels.
    channels: DashMap<ExecutionId, broadcast::Sender<LifecycleNotice>>,

    /// Channel for global subscribers.
    global_sender: broadcast::Sender<LifecycleNotice>,

    subscriptions: DashMap<String, Subscription>,

    channel_capacity: usize,
}

impl LifecycleBroadcaster {
    pub fn new(channel_capacity: usize) -> Self {
        let (global_sender, _) = broadcast::channel(channel_capacity);
        Self {
            channels: DashMap::new(),
            global_sender,
            subscriptions: DashMap::new(),
            channel_capacity,
        }
    }

    /// Subscribes to one execution.
    ///
    /// Returns (subscription_id, receiver).
    pub fn subscribe_execution(
        &self,
        execution: &ExecutionId,
    ) -> (String, broadcast::Receiver<LifecycleNotice>) {
        let subscription_id = format!("sub-{}", uuid::Uuid::new_v4());
        let receiver = self
            .channels
            .entry(execution.clone())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe();

        self.subscriptions.insert(
            subscription_id.clone(),
            Subscription {
                subscription_id: subscription_id.clone(),
                scope: SubscriptionScope::Execution(execution.clone()),
            },
        );
        (subscription_id, receiver)
    }

    /// Subscribes to every execution. Receivers apply the filter through
    /// [`LifecycleBroadcaster::filter_for`].
    pub fn subscribe_all(
        &self,
        filter: LifecycleFilter,
    ) -> (String, broadcast::Receiver<LifecycleNotice>) {
        let subscription_id = format!("sub-{}", uuid::Uuid::new_v4());
        let receiver = self.global_sender.subscribe();
        self.subscriptions.insert(
            subscription_id.clone(),
            Subscription {
                subscription_id: subscription_id.clone(),
                scope: SubscriptionScope::All(filter),
            },
        );
        (subscription_id, receiver)
    }

    /// Returns true if the subscription was found and removed.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        self.subscriptions.remove(subscription_id).is_some()
    }

    pub fn get_subscription(&self, subscription_id: &str) -> Option<Subscription> {
        self.subscriptions.get(subscription_id).map(|r| r.clone())
    }

    /// Returns the filter of a global subscription.
    pub fn filter_for(&self, subscription_id: &str) -> Option<LifecycleFilter> {
        match self.get_subscription(subscription_id)?.scope {
            SubscriptionScope::All(filter) => Some(filter),
            SubscriptionScope::Execution(_) => None,
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Publishes to the execution channel and the global channel.
    pub fn publish(&self, notice: LifecycleNotice) {
        if let Some(sender) = self.channels.get(&notice.execution) {
            // No receivers is fine.
            let _ = sender.send(notice.clone());
        }
        let _ = self.global_sender.send(notice);
    }

    /// Drops the channel of a finished execution.
    pub fn forget(&self, execution: &ExecutionId) {
        self.channels.remove(execution);
    }
}

impl Default for LifecycleBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Listener for LifecycleBroadcaster {
    fn on_event(&self, execution: &ExecutionId, event: &LifecycleEvent) -> Result<(), ListenerError> {
        self.publish(LifecycleNotice {
            execution: execution.clone(),
            event: event.clone(),
        });
        Ok(())
    }
}

/// Creates a shared broadcaster.
pub fn create_broadcaster(channel_capacity: usize) -> Arc<LifecycleBroadcaster> {
    Arc::new(LifecycleBroadcaster::new(channel_capacity))
}
