use std::collections::{HashMap, HashSet};

use shared::domain::GroupId;
use tracing::{debug, info};

use crate::transport::{SubscriptionHandle, TransportSession};

pub fn topic_for_group(group_id: GroupId) -> String {
    format!("group:{}", group_id.0)
}

pub fn group_for_topic(topic: &str) -> Option<GroupId> {
    topic.strip_prefix("group:")?.parse().ok().map(GroupId)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    Pending,
}

#[derive(Debug, Clone, Copy)]
struct SubscriptionRecord {
    handle: SubscriptionHandle,
    state: SubscriptionState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub to_add: Vec<GroupId>,
    pub to_remove: Vec<GroupId>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Pure diff between the desired membership set and the currently recorded
/// subscriptions. Order-independent; re-running it with the same inputs
/// yields an empty plan.
pub fn reconcile(desired: &HashSet<GroupId>, current: &HashSet<GroupId>) -> ReconcilePlan {
    let mut to_add: Vec<GroupId> = desired.difference(current).copied().collect();
    let mut to_remove: Vec<GroupId> = current.difference(desired).copied().collect();
    to_add.sort_by_key(|id| id.0);
    to_remove.sort_by_key(|id| id.0);
    ReconcilePlan { to_add, to_remove }
}

/// Keeps the set of live subscriptions equal to the user's current group
/// membership, with at most one subscription per group. All mutation happens
/// through [`SubscriptionRegistry::reconcile_now`], which always diffs
/// against recorded state so concurrent triggers (membership change racing a
/// reconnect restore) converge instead of double-subscribing.
pub struct SubscriptionRegistry {
    desired: HashSet<GroupId>,
    records: HashMap<GroupId, SubscriptionRecord>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            desired: HashSet::new(),
            records: HashMap::new(),
        }
    }

    pub fn desired(&self) -> &HashSet<GroupId> {
        &self.desired
    }

    pub fn set_desired(&mut self, groups: impl IntoIterator<Item = GroupId>) {
        self.desired = groups.into_iter().collect();
    }

    pub fn subscription_state(&self, group_id: GroupId) -> Option<SubscriptionState> {
        self.records.get(&group_id).map(|record| record.state)
    }

    /// Demotes a rejected subscription so the next reconciliation pass
    /// retries it. Other groups are unaffected.
    pub fn mark_rejected(&mut self, group_id: GroupId) {
        if let Some(record) = self.records.get_mut(&group_id) {
            record.state = SubscriptionState::Pending;
        }
    }

    pub async fn reconcile_now(&mut self, transport: &TransportSession) {
        let current: HashSet<GroupId> = self.records.keys().copied().collect();
        let plan = reconcile(&self.desired, &current);
        if !plan.is_empty() {
            info!(
                add = plan.to_add.len(),
                remove = plan.to_remove.len(),
                "reconciling subscriptions"
            );
        }

        for group_id in plan.to_remove {
            if let Some(record) = self.records.remove(&group_id) {
                transport.unsubscribe(record.handle).await;
            }
        }
        for group_id in plan.to_add {
            let handle = transport.subscribe(topic_for_group(group_id)).await;
            self.records.insert(
                group_id,
                SubscriptionRecord {
                    handle,
                    state: SubscriptionState::Active,
                },
            );
        }

        // Pending entries were rejected upstream; drop the stale handle and
        // subscribe again.
        let pending: Vec<GroupId> = self
            .records
            .iter()
            .filter(|(_, record)| record.state == SubscriptionState::Pending)
            .map(|(group_id, _)| *group_id)
            .collect();
        for group_id in pending {
            debug!(group_id = group_id.0, "retrying rejected subscription");
            if let Some(record) = self.records.remove(&group_id) {
                transport.unsubscribe(record.handle).await;
            }
            let handle = transport.subscribe(topic_for_group(group_id)).await;
            self.records.insert(
                group_id,
                SubscriptionRecord {
                    handle,
                    state: SubscriptionState::Active,
                },
            );
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
