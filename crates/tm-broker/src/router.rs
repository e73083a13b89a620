//! Topic router
//!
//! Tracks which topics each host instance has declared interest in.
//! A subscription set only ever grows while its instance lives; it is
//! dropped together with the instance.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use tm_protocol::topic::ALL_TOPICS;

use crate::instance::InstanceId;

/// Subscription sets keyed by instance
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    subscriptions: HashMap<InstanceId, HashSet<Uuid>>,
}

impl SubscriptionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `topics` to the instance's subscription set
    ///
    /// Returns the number of topics that were not already present.
    pub fn extend(&mut self, instance: InstanceId, topics: impl IntoIterator<Item = Uuid>) -> usize {
        let set = self.subscriptions.entry(instance).or_default();
        let before = set.len();
        set.extend(topics);
        set.len() - before
    }

    /// Whether the instance receives messages on `topic`
    pub fn is_subscribed(&self, instance: InstanceId, topic: &Uuid) -> bool {
        self.subscriptions
            .get(&instance)
            .map(|set| set.contains(topic) || set.contains(&ALL_TOPICS))
            .unwrap_or(false)
    }

    /// Drop the subscription set of a destroyed instance
    pub fn remove(&mut self, instance: InstanceId) {
        self.subscriptions.remove(&instance);
    }

    /// Instances, among `candidates`, that receive messages on `topic`
    pub fn subscribers<'a, I>(
        &'a self,
        candidates: I,
        topic: &'a Uuid,
    ) -> impl Iterator<Item = InstanceId> + 'a
    where
        I: IntoIterator<Item = InstanceId>,
        I::IntoIter: 'a,
    {
        candidates
            .into_iter()
            .filter(move |id| self.is_subscribed(*id, topic))
    }
}
