// Membership reconciler
//
// Diffs each desired-state snapshot from the control server against what was
// last applied and dispatches joins, leaves and parameter changes to the
// per-network supervisors. The reconciler never waits for a join to finish;
// slow networks do not hold up the others.

use std::collections::{BTreeMap, HashMap};
use tokio::task::JoinHandle;

use super::types::{MembershipUpdate, NetworkMembership};
use crate::error::Result;
use crate::overlay::{NetworkCommand, NetworkHandle, SessionManager};

/// Work needed to move from one desired set to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Networks not currently applied
    pub join: Vec<NetworkMembership>,
    /// Networks whose join parameters changed (leave, then join)
    pub rejoin: Vec<NetworkMembership>,
    /// Networks no longer desired
    pub leave: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.join.is_empty() && self.rejoin.is_empty() && self.leave.is_empty()
    }
}

/// Compute the plan for moving from `current` to `desired`.
pub fn plan(
    current: &BTreeMap<String, NetworkMembership>,
    desired: &[NetworkMembership],
) -> ReconcilePlan {
    let mut out = ReconcilePlan::default();
    for m in desired {
        match current.get(&m.network_name) {
            None => out.join.push(m.clone()),
            Some(existing) if existing != m => out.rejoin.push(m.clone()),
            Some(_) => {}
        }
    }
    out.leave = current
        .keys()
        .filter(|name| !desired.iter().any(|m| &m.network_name == *name))
        .cloned()
        .collect();
    out.join.sort_by(|a, b| a.network_name.cmp(&b.network_name));
    out.rejoin.sort_by(|a, b| a.network_name.cmp(&b.network_name));
    out
}

pub struct MembershipReconciler {
    manager: SessionManager,
    applied: BTreeMap<String, NetworkMembership>,
    networks: HashMap<String, NetworkHandle>,
    /// Supervisors told to leave that may not have finished yet
    retiring: HashMap<String, JoinHandle<()>>,
    revision: Option<u64>,
}

impl MembershipReconciler {
    pub fn new(manager: SessionManager) -> Self {
        Self {
            manager,
            applied: BTreeMap::new(),
            networks: HashMap::new(),
            retiring: HashMap::new(),
            revision: None,
        }
    }

    /// Revision of the last applied snapshot.
    pub fn revision(&self) -> Option<u64> {
        self.revision
    }

    /// Networks currently in the applied desired set, sorted.
    pub fn desired_networks(&self) -> Vec<String> {
        self.applied.keys().cloned().collect()
    }

    /// Apply a full desired-state snapshot.
    ///
    /// Invalid snapshots are rejected as a whole and change nothing.
    /// Re-applying the current snapshot is a no-op.
    pub async fn apply(&mut self, update: MembershipUpdate) -> Result<ReconcilePlan> {
        update.validate()?;
        self.prune_retired();

        let plan = plan(&self.applied, &update.memberships);
        self.revision = Some(update.revision);
        if plan.is_empty() {
            tracing::debug!(revision = update.revision, "Membership unchanged");
            return Ok(plan);
        }

        for name in &plan.leave {
            self.applied.remove(name);
            if let Some(handle) = self.networks.remove(name) {
                handle.send(NetworkCommand::Leave).await;
                self.retiring.insert(name.clone(), handle.retire());
            }
        }

        for membership in &plan.rejoin {
            let name = membership.network_name.clone();
            self.applied.insert(name.clone(), membership.clone());
            let delivered = match self.networks.get(&name) {
                Some(handle) => {
                    handle.send(NetworkCommand::Leave).await
                        && handle.send(NetworkCommand::Join(membership.clone())).await
                }
                None => false,
            };
            if !delivered {
                self.spawn(membership).await;
            }
        }

        for membership in &plan.join {
            self.applied
                .insert(membership.network_name.clone(), membership.clone());
            self.spawn(membership).await;
        }

        tracing::info!(
            revision = update.revision,
            joining = plan.join.len(),
            changed = plan.rejoin.len(),
            leaving = plan.leave.len(),
            "Applied membership update"
        );
        Ok(plan)
    }

    async fn spawn(&mut self, membership: &NetworkMembership) {
        let name = membership.network_name.clone();
        let predecessor = match self.networks.remove(&name) {
            Some(old) => Some(old.retire()),
            None => self.retiring.remove(&name),
        };
        let handle = self.manager.spawn_network(&name, predecessor);
        handle.send(NetworkCommand::Join(membership.clone())).await;
        self.networks.insert(name, handle);
    }

    fn prune_retired(&mut self) {
        self.retiring.retain(|_, task| !task.is_finished());
    }

    /// Leave every network and wait for all supervisors to exit.
    pub async fn shutdown(mut self) {
        let mut tasks: Vec<JoinHandle<()>> = self.retiring.drain().map(|(_, t)| t).collect();
        tasks.extend(self.networks.drain().map(|(_, h)| h.retire()));
        self.applied.clear();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Network supervisor ended abnormally");
            }
        }
    }
}
