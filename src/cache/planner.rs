//! Refresh plan generation.
//!
//! Merges a drained batch of change events into one action per node.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::domain::types::{ChangeKind, NodeId};

use super::events::{ChangeEvent, ChangeTarget, Epoch};

/// What the engine does for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshAction {
    /// Re-fetch the node alone.
    Node,
    /// Re-fetch the node and all of its descendants.
    Branch,
    /// Tombstone the node and all of its descendants.
    Remove,
}

impl RefreshAction {
    fn for_change(change: ChangeKind, branch: bool) -> Self {
        if change.is_removal() {
            RefreshAction::Remove
        } else if branch || change.affects_branch() {
            RefreshAction::Branch
        } else {
            RefreshAction::Node
        }
    }

    /// Folds a later action into an earlier one for the same node.
    fn merge(self, later: RefreshAction) -> RefreshAction {
        match (self, later) {
            (_, RefreshAction::Remove) => RefreshAction::Remove,
            (RefreshAction::Branch, RefreshAction::Node) => RefreshAction::Branch,
            (_, later) => later,
        }
    }
}

/// One planned step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRefresh {
    pub node_id: NodeId,
    pub action: RefreshAction,
    /// Epoch of the first event merged into this step.
    pub epoch: Epoch,
}

/// Actions to execute for one consumption round.
///
/// Steps are ordered by the epoch of their first event, so a node created
/// before its children is applied before them. Each step re-reads current
/// data, so later events for the node are still reflected.
#[derive(Debug, Default)]
pub struct RefreshPlan {
    pub rebuild_all: bool,
    pub steps: Vec<PlannedRefresh>,
    pub event_count: usize,
}

impl fmt::Display for RefreshPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = |action| self.steps.iter().filter(|s| s.action == action).count();
        write!(
            f,
            "RefreshPlan {{ events: {}, rebuild_all: {}, nodes: {}, branches: {}, removals: {} }}",
            self.event_count,
            self.rebuild_all,
            count(RefreshAction::Node),
            count(RefreshAction::Branch),
            count(RefreshAction::Remove),
        )
    }
}

impl RefreshPlan {
    /// Merge a batch of events into a plan.
    ///
    /// - Deduplicates by event id
    /// - Applies events in epoch order and folds them per node
    /// - A whole-store event turns the plan into a rebuild
    pub fn from_events(events: Vec<ChangeEvent>) -> Self {
        let mut seen_ids = HashSet::new();
        let mut events: Vec<_> = events
            .into_iter()
            .filter(|event| seen_ids.insert(event.id))
            .collect();
        events.sort_by_key(|event| event.epoch);

        let mut plan = Self {
            event_count: events.len(),
            ..Self::default()
        };
        let mut merged: HashMap<NodeId, PlannedRefresh> = HashMap::new();

        for event in events {
            let (node_id, action) = match event.target {
                ChangeTarget::All => {
                    plan.rebuild_all = true;
                    continue;
                }
                ChangeTarget::Node { node_id, change } => {
                    (node_id, RefreshAction::for_change(change, false))
                }
                ChangeTarget::Branch { root_id, change } => {
                    (root_id, RefreshAction::for_change(change, true))
                }
            };

            merged
                .entry(node_id)
                .and_modify(|step| step.action = step.action.merge(action))
                .or_insert(PlannedRefresh {
                    node_id,
                    action,
                    epoch: event.epoch,
                });
        }

        if plan.rebuild_all {
            return plan;
        }

        plan.steps = merged.into_values().collect();
        plan.steps.sort_by_key(|step| step.epoch);
        plan
    }

    pub fn is_empty(&self) -> bool {
        !self.rebuild_all && self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;

    fn event(target: ChangeTarget, epoch: Epoch) -> ChangeEvent {
        ChangeEvent::new(target, epoch, OffsetDateTime::now_utc())
    }

    #[test]
    fn empty_events_produce_empty_plan() {
        let plan = RefreshPlan::from_events(vec![]);
        assert!(plan.is_empty());
        assert_eq!(plan.event_count, 0);
    }

    #[test]
    fn dedupes_by_event_id() {
        let first = event(ChangeTarget::node(1, ChangeKind::Saved), 0);
        let duplicate = first.clone();

        let plan = RefreshPlan::from_events(vec![first, duplicate]);
        assert_eq!(plan.event_count, 1);
        assert_eq!(plan.steps.len(), 1);
    }

    #[test]
    fn rename_then_publish_is_one_fetch() {
        let plan = RefreshPlan::from_events(vec![
            event(ChangeTarget::node(5, ChangeKind::Saved), 0),
            event(ChangeTarget::node(5, ChangeKind::Published), 1),
        ]);

        assert_eq!(
            plan.steps,
            vec![PlannedRefresh {
                node_id: 5,
                action: RefreshAction::Node,
                epoch: 0,
            }]
        );
    }

    #[test]
    fn branch_change_is_not_downgraded() {
        let plan = RefreshPlan::from_events(vec![
            event(ChangeTarget::node(5, ChangeKind::Moved), 0),
            event(ChangeTarget::node(5, ChangeKind::Saved), 1),
        ]);
        assert_eq!(plan.steps[0].action, RefreshAction::Branch);
    }

    #[test]
    fn delete_wins_over_earlier_changes() {
        let plan = RefreshPlan::from_events(vec![
            event(ChangeTarget::node(5, ChangeKind::Moved), 0),
            event(ChangeTarget::node(5, ChangeKind::Deleted), 1),
        ]);
        assert_eq!(plan.steps[0].action, RefreshAction::Remove);
    }

    #[test]
    fn branch_target_with_save_refreshes_branch() {
        let plan =
            RefreshPlan::from_events(vec![event(ChangeTarget::branch(9, ChangeKind::Saved), 0)]);
        assert_eq!(plan.steps[0].action, RefreshAction::Branch);
    }

    #[test]
    fn steps_follow_first_epoch() {
        // Parent 1, child 2, then another edit to the parent.
        let plan = RefreshPlan::from_events(vec![
            event(ChangeTarget::node(1, ChangeKind::Saved), 0),
            event(ChangeTarget::node(2, ChangeKind::Saved), 1),
            event(ChangeTarget::node(1, ChangeKind::Published), 2),
        ]);

        let order: Vec<NodeId> = plan.steps.iter().map(|step| step.node_id).collect();
        assert_eq!(order, vec![1, 2]);
        assert_eq!(plan.steps[0].epoch, 0);
    }

    #[test]
    fn later_removal_keeps_first_position() {
        let plan = RefreshPlan::from_events(vec![
            event(ChangeTarget::node(1, ChangeKind::Saved), 0),
            event(ChangeTarget::node(2, ChangeKind::Saved), 1),
            event(ChangeTarget::node(1, ChangeKind::Deleted), 2),
        ]);

        let steps: Vec<_> = plan.steps.iter().map(|step| (step.node_id, step.action)).collect();
        assert_eq!(
            steps,
            vec![(1, RefreshAction::Remove), (2, RefreshAction::Node)]
        );
    }

    #[test]
    fn refresh_all_supersedes_node_steps() {
        let plan = RefreshPlan::from_events(vec![
            event(ChangeTarget::node(1, ChangeKind::Saved), 0),
            event(ChangeTarget::All, 1),
        ]);
        assert!(plan.rebuild_all);
        assert!(plan.steps.is_empty());
        assert!(plan.to_string().contains("rebuild_all: true"));
    }
}
