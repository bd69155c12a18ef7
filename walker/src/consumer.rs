// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::cmp;

use data_model::{NodeBackup, NodeCriteria, NodeGraph, NodeId, SemanticsCriteria};
use regex::Regex;

///
/// The knobs shared by every mutation strategy: run-count policy, ordering,
/// constraint repair, the interest gate, and the generic save/recover slot.
///
#[derive(Clone, Debug)]
pub struct ConsumerPolicy {
    pub need_reset_when_structure_change: bool,
    pub fuzz_magnitude: f64,
    pub fix_constraints: bool,
    /// `-1` means unbounded.
    pub max_runs_per_node: i64,
    /// `-1` means unbounded.
    pub min_runs_per_node: i64,
    pub respect_order: bool,

    internals_criteria: Option<NodeCriteria>,
    semantics_criteria: Option<SemanticsCriteria>,
    owned_confs: Option<Vec<String>>,
    path_regexp: Option<Regex>,
    conf: Option<String>,

    node_backup: Option<NodeBackup>,
}

impl ConsumerPolicy {
    pub fn new() -> ConsumerPolicy {
        ConsumerPolicy {
            need_reset_when_structure_change: false,
            fuzz_magnitude: 1.0,
            fix_constraints: false,
            max_runs_per_node: -1,
            min_runs_per_node: -1,
            respect_order: true,
            internals_criteria: None,
            semantics_criteria: None,
            owned_confs: None,
            path_regexp: None,
            conf: None,
            node_backup: None,
        }
    }

    pub fn max_runs_per_node(mut self, runs: i64) -> ConsumerPolicy {
        assert!(runs > 0 || runs == -1, "invalid run bound: {runs}");
        self.max_runs_per_node = runs;
        self
    }

    pub fn min_runs_per_node(mut self, runs: i64) -> ConsumerPolicy {
        assert!(runs > 0 || runs == -1, "invalid run bound: {runs}");
        self.min_runs_per_node = runs;
        self
    }

    ///
    /// Narrows the interest gate. Criteria arguments extend (logical AND) any
    /// criteria already present; the other clauses replace theirs. When
    /// nothing is set, the consumer is interested in every node.
    ///
    pub fn set_node_interest(
        &mut self,
        internals_criteria: Option<NodeCriteria>,
        semantics_criteria: Option<SemanticsCriteria>,
        owned_confs: Option<Vec<String>>,
        path_regexp: Option<Regex>,
        conf: Option<String>,
    ) {
        if let Some(criteria) = internals_criteria {
            match &mut self.internals_criteria {
                Some(existing) => existing.extend(&criteria),
                none => *none = Some(criteria),
            }
        }
        if let Some(criteria) = semantics_criteria {
            match &mut self.semantics_criteria {
                Some(existing) => existing.extend(&criteria),
                none => *none = Some(criteria),
            }
        }
        if owned_confs.is_some() {
            self.owned_confs = owned_confs;
        }
        if path_regexp.is_some() {
            self.path_regexp = path_regexp;
        }
        if conf.is_some() {
            self.conf = conf;
        }
    }

    pub(crate) fn owned_confs(&self) -> Option<&[String]> {
        self.owned_confs.as_deref()
    }

    pub(crate) fn store_backup(&mut self, backup: NodeBackup) {
        self.node_backup = Some(backup);
    }

    pub(crate) fn take_backup(&mut self) -> Option<NodeBackup> {
        self.node_backup.take()
    }
}

///
/// A mutation strategy plugged into the walker.
///
/// The walker drives the negotiation protocol: it asks `interested_by`, then
/// `save_node` and `consume_node`; a successful consumption is stepped
/// through its variants until exhaustion or until the `wait_for_exhaustion`
/// budget runs out, after which `recover_node` must restore the node's
/// pre-mutation state. Consumers never error: they answer with booleans.
///
pub trait Consumer {
    fn policy(&self) -> &ConsumerPolicy;
    fn policy_mut(&mut self) -> &mut ConsumerPolicy;

    ///
    /// Mutate the node in place, returning whether the mutation succeeded.
    /// Returning false means "not interested after all".
    ///
    fn consume_node(&mut self, graph: &mut NodeGraph, node: NodeId) -> bool {
        !graph.is_exhausted(node)
    }

    /// Generic save; strategies with cheaper snapshots override this.
    fn save_node(&mut self, graph: &mut NodeGraph, node: NodeId) {
        let backup = graph.get_internals_backup(node);
        self.policy_mut().store_backup(backup);
    }

    /// Generic recover, undoing `save_node`.
    fn recover_node(&mut self, graph: &mut NodeGraph, node: NodeId) {
        if let Some(backup) = self.policy_mut().take_backup() {
            graph.set_internals(node, backup);
        }
    }

    /// After an emission, whether to consume the same node again.
    fn still_interested_by(&mut self, _graph: &NodeGraph, _node: NodeId) -> bool {
        false
    }

    /// Whether changing this node requires re-walking subtrees.
    fn need_reset(&mut self, graph: &NodeGraph, node: NodeId) -> bool {
        graph.is_nonterm(node)
    }

    fn do_after_reset(&mut self, _graph: &mut NodeGraph, _node: NodeId) {}

    ///
    /// The emission budget for the node: `-1` waits for exhaustion, `0` stops
    /// after one emission, `N-1` stops after at most `N` emissions (or
    /// earlier on exhaustion).
    ///
    fn wait_for_exhaustion(&mut self, graph: &NodeGraph, node: NodeId) -> i64 {
        cmp::max(self.max_nb_runs_for(graph, node) - 1, -1)
    }

    fn max_nb_runs_for(&mut self, graph: &NodeGraph, node: NodeId) -> i64 {
        if graph.get_fuzz_weight(node) > 1 {
            self.policy().max_runs_per_node
        } else {
            self.policy().min_runs_per_node
        }
    }

    ///
    /// The interest gate: configuration pin, owned configurations, internals
    /// criteria, semantics criteria and path clause must all agree. When none
    /// are set, interest is universal.
    ///
    fn interested_by(&mut self, graph: &NodeGraph, root: NodeId, node: NodeId) -> bool {
        let policy = self.policy();

        let conf: Option<&str> = match &policy.conf {
            None => None,
            Some(conf) if graph.is_conf_existing(node, conf) => Some(conf.as_str()),
            Some(_) => return false,
        };

        if let Some(owned) = &policy.owned_confs {
            if !owned.iter().any(|c| graph.is_conf_existing(node, c)) {
                return false;
            }
        }

        let matches_internals = match &policy.internals_criteria {
            Some(criteria) => graph
                .internals(node, conf)
                .map(|internals| criteria.matches(internals))
                .unwrap_or(false),
            None => true,
        };

        let matches_semantics = match &policy.semantics_criteria {
            Some(criteria) => criteria.matches(graph.semantics(node)),
            None => true,
        };

        let matches_path = match &policy.path_regexp {
            Some(re) => graph
                .get_all_paths_from(node, root)
                .iter()
                .any(|p| re.is_match(p)),
            None => true,
        };

        matches_internals && matches_semantics && matches_path
    }
}
