//! Hierarchical state chart.
//!
//! States form a tree rooted at the agent's default state. A node may
//! declare an initial substate, a history mode, enter/exit hooks and a time
//! limit. The chart structure is built during agent definition and frozen
//! afterwards; activation only moves the owning agent's current-leaf index.

use crate::agent::AgentContext;
use crate::error::{Error, Result};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

pub type StateId = usize;

/// Pseudo-state key under which deadletter handlers are stored.
pub(crate) const DEADLETTER_STATE: StateId = usize::MAX;

/// Maximum depth of state nesting.
pub(crate) const MAX_NESTING: usize = 16;

/// Cheap handle to a state in its owning agent's chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct State {
    pub(crate) id: StateId,
}

impl State {
    /// The default (root) state every agent starts in.
    pub fn default_state() -> Self {
        Self { id: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum History {
    None,
    /// Remember the last active direct substate.
    Shallow,
    /// Remember the whole last active configuration.
    Deep,
}

pub(crate) type StateHook = Arc<dyn Fn(&mut dyn Any, &AgentContext) + Send + Sync>;

pub(crate) struct StateNode {
    pub name: String,
    pub parent: Option<StateId>,
    pub children: Vec<StateId>,
    pub initial: Option<StateId>,
    pub history: History,
    /// Shallow: last active direct child. Deep: last active leaf.
    pub last_active: Option<StateId>,
    pub on_enter: Option<StateHook>,
    pub on_exit: Option<StateHook>,
    pub time_limit: Option<(Duration, StateId)>,
    /// Bumped on every activation; stale time-limit fires compare against it.
    pub activation_epoch: u64,
    pub depth: usize,
}

pub(crate) struct TransitionPlan {
    /// States being left, innermost first.
    pub exited: Vec<StateId>,
    /// States being entered, outermost first.
    pub entered: Vec<StateId>,
    pub new_leaf: StateId,
}

impl TransitionPlan {
    pub fn is_noop(&self) -> bool {
        self.exited.is_empty() && self.entered.is_empty()
    }
}

pub(crate) struct StateChart {
    nodes: Vec<StateNode>,
}

impl StateChart {
    pub fn new() -> Self {
        Self {
            nodes: vec![StateNode {
                name: "<default>".to_string(),
                parent: None,
                children: Vec::new(),
                initial: None,
                history: History::None,
                last_active: None,
                on_enter: None,
                on_exit: None,
                time_limit: None,
                activation_epoch: 1,
                depth: 0,
            }],
        }
    }

    pub fn is_valid(&self, id: StateId) -> bool {
        id < self.nodes.len()
    }

    pub fn node(&self, id: StateId) -> &StateNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: StateId) -> &mut StateNode {
        &mut self.nodes[id]
    }

    pub fn add_state(
        &mut self,
        name: String,
        parent: Option<StateId>,
        history: History,
    ) -> Result<StateId> {
        let parent = parent.unwrap_or(0);
        if !self.is_valid(parent) {
            return Err(Error::UnknownState);
        }
        let depth = self.nodes[parent].depth + 1;
        if depth >= MAX_NESTING {
            return Err(Error::StateNestingTooDeep);
        }
        let id = self.nodes.len();
        self.nodes.push(StateNode {
            name,
            parent: Some(parent),
            children: Vec::new(),
            initial: None,
            history,
            last_active: None,
            on_enter: None,
            on_exit: None,
            time_limit: None,
            activation_epoch: 0,
            depth,
        });
        self.nodes[parent].children.push(id);
        Ok(id)
    }

    pub fn set_initial(&mut self, parent: StateId, child: StateId) -> Result<()> {
        if !self.is_valid(parent) || !self.is_valid(child) {
            return Err(Error::UnknownState);
        }
        if self.nodes[child].parent != Some(parent) {
            return Err(Error::UnknownState);
        }
        self.nodes[parent].initial = Some(child);
        Ok(())
    }

    /// Dotted full name, e.g. `dialog.user_code_selection.secret_code`.
    pub fn full_name(&self, id: StateId) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(s) = cur {
            if s == 0 {
                break;
            }
            parts.push(self.nodes[s].name.clone());
            cur = self.nodes[s].parent;
        }
        parts.reverse();
        if parts.is_empty() {
            self.nodes[0].name.clone()
        } else {
            parts.join(".")
        }
    }

    /// Chain from `id` up to the root, inclusive.
    pub fn path_to_root(&self, id: StateId) -> Vec<StateId> {
        let mut path = Vec::with_capacity(self.nodes[id].depth + 1);
        let mut cur = Some(id);
        while let Some(s) = cur {
            path.push(s);
            cur = self.nodes[s].parent;
        }
        path
    }

    /// Descends from `target` to the leaf that activation actually reaches,
    /// honoring history and initial substates.
    pub fn resolve_activation_leaf(&self, target: StateId) -> Result<StateId> {
        let mut cur = target;
        loop {
            let node = &self.nodes[cur];
            if node.children.is_empty() {
                return Ok(cur);
            }
            let next = match node.history {
                History::Deep | History::Shallow => node.last_active.or(node.initial),
                History::None => node.initial,
            };
            match next {
                Some(n) => cur = n,
                None => return Err(Error::NoInitialSubstate(self.full_name(cur))),
            }
        }
    }

    /// Computes exit and enter chains for a transition.
    pub fn plan_transition(&self, from_leaf: StateId, target: StateId) -> Result<TransitionPlan> {
        if !self.is_valid(target) {
            return Err(Error::UnknownState);
        }
        let new_leaf = self.resolve_activation_leaf(target)?;
        if new_leaf == from_leaf {
            return Ok(TransitionPlan {
                exited: Vec::new(),
                entered: Vec::new(),
                new_leaf,
            });
        }

        let from_path = self.path_to_root(from_leaf);
        let to_path = self.path_to_root(new_leaf);

        // Longest common suffix (towards the root) stays active.
        let mut common = 0;
        while common < from_path.len()
            && common < to_path.len()
            && from_path[from_path.len() - 1 - common] == to_path[to_path.len() - 1 - common]
        {
            common += 1;
        }

        let exited: Vec<StateId> = from_path[..from_path.len() - common].to_vec();
        let mut entered: Vec<StateId> = to_path[..to_path.len() - common].to_vec();
        entered.reverse();

        Ok(TransitionPlan {
            exited,
            entered,
            new_leaf,
        })
    }

    /// Records the configuration being left into every history-bearing
    /// ancestor of `old_leaf`.
    ///
    /// Runs on the old chain, not just on exited states: a transition
    /// between two substates updates the history of a composite that stays
    /// active, so a later switch to the composite itself restores the
    /// substate that was active before this transition.
    pub fn record_history(&mut self, old_leaf: StateId) {
        let old_path = self.path_to_root(old_leaf);
        for window in old_path.windows(2) {
            let (child, ancestor) = (window[0], window[1]);
            match self.nodes[ancestor].history {
                History::None => {}
                History::Shallow => {
                    self.nodes[ancestor].last_active = Some(child);
                }
                History::Deep => {
                    self.nodes[ancestor].last_active = Some(old_leaf);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chart() -> (StateChart, StateId, StateId, StateId, StateId) {
        // dialog{deep} -> { wait, selection -> { digits, codes } }
        let mut chart = StateChart::new();
        let dialog = chart
            .add_state("dialog".into(), None, History::Deep)
            .unwrap();
        let wait = chart
            .add_state("wait".into(), Some(dialog), History::None)
            .unwrap();
        let selection = chart
            .add_state("selection".into(), Some(dialog), History::None)
            .unwrap();
        let digits = chart
            .add_state("digits".into(), Some(selection), History::None)
            .unwrap();
        chart.set_initial(dialog, wait).unwrap();
        chart.set_initial(selection, digits).unwrap();
        (chart, dialog, wait, selection, digits)
    }

    #[test]
    fn initial_substates_descend_to_leaf() {
        let (chart, dialog, wait, _, _) = chart();
        assert_eq!(chart.resolve_activation_leaf(dialog).unwrap(), wait);
    }

    #[test]
    fn composite_without_initial_fails() {
        let mut chart = StateChart::new();
        let parent = chart.add_state("p".into(), None, History::None).unwrap();
        chart
            .add_state("c".into(), Some(parent), History::None)
            .unwrap();
        assert!(matches!(
            chart.resolve_activation_leaf(parent),
            Err(Error::NoInitialSubstate(_))
        ));
    }

    #[test]
    fn deep_history_restores_the_exact_leaf() {
        let (mut chart, dialog, wait, _selection, digits) = chart();

        // Active at digits, leave the whole dialog subtree.
        let plan = chart.plan_transition(digits, 0).unwrap();
        chart.record_history(digits);
        assert_eq!(plan.new_leaf, 0);

        // Re-entering dialog lands back on digits, not the initial wait.
        let restored = chart.resolve_activation_leaf(dialog).unwrap();
        assert_eq!(restored, digits);
        let _ = wait;
    }

    #[test]
    fn history_tracks_transitions_inside_the_composite() {
        let (mut chart, dialog, wait, _selection, digits) = chart();

        // digits -> wait stays inside dialog, yet the configuration being
        // left is recorded: a later switch to dialog itself restores it.
        let plan = chart.plan_transition(digits, wait).unwrap();
        assert!(!plan.exited.contains(&dialog));
        chart.record_history(digits);
        assert_eq!(plan.new_leaf, wait);
        assert_eq!(chart.resolve_activation_leaf(dialog).unwrap(), digits);
    }

    #[test]
    fn leaf_target_bypasses_stale_history() {
        let (mut chart, dialog, wait, _selection, digits) = chart();

        // dialog's history points at digits.
        chart.record_history(digits);
        assert_eq!(chart.resolve_activation_leaf(dialog).unwrap(), digits);

        // A transition aimed at the substate directly is never redirected
        // by the composite's history.
        let plan = chart.plan_transition(digits, wait).unwrap();
        assert_eq!(plan.new_leaf, wait);
    }

    #[test]
    fn transition_plan_orders_exit_and_enter_chains() {
        let (chart, dialog, wait, selection, digits) = chart();
        let plan = chart.plan_transition(wait, selection).unwrap();
        assert_eq!(plan.exited, vec![wait]);
        assert_eq!(plan.entered, vec![selection, digits]);
        assert_eq!(plan.new_leaf, digits);
        let _ = dialog;
    }

    #[test]
    fn noop_transition_for_current_leaf() {
        let (chart, _, wait, _, _) = chart();
        let plan = chart.plan_transition(wait, wait).unwrap();
        assert!(plan.is_noop());
    }

    #[test]
    fn nesting_is_bounded() {
        let mut chart = StateChart::new();
        let mut parent = None;
        for i in 0..(MAX_NESTING - 1) {
            parent = Some(
                chart
                    .add_state(format!("s{i}"), parent, History::None)
                    .unwrap(),
            );
        }
        assert!(matches!(
            chart.add_state("too_deep".into(), parent, History::None),
            Err(Error::StateNestingTooDeep)
        ));
    }
}
