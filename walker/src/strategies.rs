// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::cmp;
use std::collections::VecDeque;

use data_model::{
    NodeAttrs, NodeBackup, NodeCriteria, NodeGraph, NodeId, NodeKindSet, ReachOpts, Str,
    UnfreezeOpts, ValueType,
};
use itertools::Itertools;
use regex::Regex;

use crate::consumer::{Consumer, ConsumerPolicy};

///
/// Emits each reachable terminal once per intrinsic variant: the first call
/// emits the node as-is, subsequent calls step it until exhaustion.
///
pub struct BasicVisitor {
    policy: ConsumerPolicy,
    firstcall: bool,
}

impl BasicVisitor {
    pub fn new() -> BasicVisitor {
        let mut policy = ConsumerPolicy::new();
        policy.set_node_interest(
            Some(NodeCriteria::new().negative_node_kinds(NodeKindSet::NON_TERM)),
            None,
            None,
            None,
            None,
        );
        BasicVisitor {
            policy,
            firstcall: true,
        }
    }
}

impl Consumer for BasicVisitor {
    fn policy(&self) -> &ConsumerPolicy {
        &self.policy
    }

    fn policy_mut(&mut self) -> &mut ConsumerPolicy {
        &mut self.policy
    }

    fn consume_node(&mut self, graph: &mut NodeGraph, node: NodeId) -> bool {
        // The first consumption emits the node (and therefore the whole seed)
        // as-is; later ones pre-step their node, whose as-is value already
        // appeared in every previous emission.
        if self.firstcall {
            self.firstcall = false;
            return true;
        }
        if !graph.is_exhausted(node) {
            graph.freeze(node);
            graph.unfreeze(node, UnfreezeOpts::shallow().ignore_entanglement());
            graph.freeze(node);
        }
        true
    }

    fn save_node(&mut self, _graph: &mut NodeGraph, _node: NodeId) {}

    fn recover_node(&mut self, graph: &mut NodeGraph, node: NodeId) {
        graph.reset_state(node, false);
        graph.freeze(node);
    }

    fn need_reset(&mut self, graph: &NodeGraph, node: NodeId) -> bool {
        if graph.is_nonterm(node) {
            if !graph.is_exhausted(node) {
                self.firstcall = true;
            }
            true
        } else {
            false
        }
    }

    fn wait_for_exhaustion(&mut self, _graph: &NodeGraph, _node: NodeId) -> i64 {
        -1
    }
}

///
/// Emits each structural (non-terminal) shape once. Moving from one
/// non-terminal to a different, non-exhausted one triggers a reset; an
/// exhausted non-terminal arriving while a previous one exists is rejected.
///
pub struct NonTermVisitor {
    policy: ConsumerPolicy,
    last: Option<NodeId>,
    current: Option<NodeId>,
}

impl NonTermVisitor {
    pub fn new() -> NonTermVisitor {
        let mut policy = ConsumerPolicy::new();
        policy.need_reset_when_structure_change = true;
        policy.set_node_interest(
            Some(NodeCriteria::new().node_kinds(NodeKindSet::NON_TERM)),
            None,
            None,
            None,
            None,
        );
        NonTermVisitor {
            policy,
            last: None,
            current: None,
        }
    }
}

impl Consumer for NonTermVisitor {
    fn policy(&self) -> &ConsumerPolicy {
        &self.policy
    }

    fn policy_mut(&mut self) -> &mut ConsumerPolicy {
        &mut self.policy
    }

    fn need_reset(&mut self, graph: &NodeGraph, node: NodeId) -> bool {
        if graph.is_nonterm(node)
            && self.last.is_some()
            && self.last != Some(node)
            && !graph.is_exhausted(node)
        {
            self.last = None;
            self.current = None;
            true
        } else {
            false
        }
    }

    fn consume_node(&mut self, graph: &mut NodeGraph, node: NodeId) -> bool {
        self.last = self.current;
        self.current = Some(node);
        !(graph.is_exhausted(node) && self.last.is_some())
    }

    fn save_node(&mut self, _graph: &mut NodeGraph, _node: NodeId) {}

    fn recover_node(&mut self, graph: &mut NodeGraph, node: NodeId) {
        graph.reset_state(node, false);
        graph.freeze(node);
    }

    fn wait_for_exhaustion(&mut self, _graph: &NodeGraph, _node: NodeId) -> i64 {
        -1
    }
}

///
/// Cycles a node through a caller-supplied set of alternate configurations,
/// one chained emission per owned configuration the node actually exposes.
///
/// The generic save/recover pair is not used here: recovering re-derives the
/// subtree and restores the original configuration instead, because alternate
/// configurations of a non-terminal reuse the same subnodes.
///
pub struct AltConfConsumer {
    policy: ConsumerPolicy,
    current_consumed: Option<NodeId>,
    orig_conf: Option<String>,
    confs_list: Option<Vec<String>>,
    recover: bool,
}

impl AltConfConsumer {
    pub fn new(owned_confs: &[&str]) -> AltConfConsumer {
        let mut policy = ConsumerPolicy::new();
        policy.need_reset_when_structure_change = true;
        policy.set_node_interest(
            Some(NodeCriteria::new().mandatory_attrs(NodeAttrs::MUTABLE)),
            None,
            Some(owned_confs.iter().map(|c| (*c).to_owned()).collect()),
            None,
            None,
        );
        AltConfConsumer {
            policy,
            current_consumed: None,
            orig_conf: None,
            confs_list: None,
            recover: false,
        }
    }
}

impl Consumer for AltConfConsumer {
    fn policy(&self) -> &ConsumerPolicy {
        &self.policy
    }

    fn policy_mut(&mut self) -> &mut ConsumerPolicy {
        &mut self.policy
    }

    fn need_reset(&mut self, graph: &NodeGraph, node: NodeId) -> bool {
        graph.is_nonterm(node) && Some(node) != self.current_consumed
    }

    fn consume_node(&mut self, graph: &mut NodeGraph, node: NodeId) -> bool {
        let list_empty = self.confs_list.as_ref().map(|l| l.is_empty()).unwrap_or(true);
        if Some(node) == self.current_consumed && list_empty {
            return false;
        }

        if list_empty {
            let candidates: Vec<String> = self
                .policy
                .owned_confs()
                .map(|confs| confs.to_vec())
                .unwrap_or_default();
            if !candidates.iter().any(|c| graph.is_conf_existing(node, c)) {
                return false;
            }
            self.confs_list = Some(
                candidates
                    .into_iter()
                    .filter(|c| graph.is_conf_existing(node, c))
                    .collect(),
            );
        }

        let new_conf = self
            .confs_list
            .as_mut()
            .expect("the candidate list was just rebuilt")
            .remove(0);

        if graph.is_conf_existing(node, &new_conf) {
            self.orig_conf = Some(graph.get_current_conf(node).to_owned());
            self.current_consumed = Some(node);
            graph.set_current_conf(node, &new_conf, false);
            self.recover = true;
        } else {
            self.recover = false;
        }
        true
    }

    fn still_interested_by(&mut self, _graph: &NodeGraph, _node: NodeId) -> bool {
        self.confs_list
            .as_ref()
            .map(|l| !l.is_empty())
            .unwrap_or(false)
    }

    fn save_node(&mut self, _graph: &mut NodeGraph, _node: NodeId) {}

    fn recover_node(&mut self, graph: &mut NodeGraph, node: NodeId) {
        if Some(node) == self.current_consumed && self.recover {
            graph.reset_state(node, true);
            graph.get_value(node);
            if let Some(orig) = self.orig_conf.take() {
                graph.set_current_conf(node, &orig, false);
            }
            graph.get_value(node);
            self.current_consumed = None;
        }
        // Otherwise the consumption did not switch anything: nothing to undo.
    }

    fn wait_for_exhaustion(&mut self, graph: &NodeGraph, node: NodeId) -> i64 {
        match self.current_consumed {
            Some(current) if current == node => {
                if graph.get_fuzz_weight(node) > 1 {
                    cmp::max(self.policy.max_runs_per_node - 1, -1)
                } else {
                    cmp::max(self.policy.min_runs_per_node - 1, -1)
                }
            }
            _ => 0,
        }
    }
}

///
/// Fuzzes typed values: for each candidate node, an ordered list of fuzzy
/// value types is derived from the current one (boundary catalogues,
/// neighbors of the current raw value, type-declared fuzzy values), and the
/// node is stepped through each of them in chained emissions.
///
pub struct TypedNodeDisruption {
    policy: ConsumerPolicy,
    current_node: Option<NodeId>,
    fuzz_vt_list: VecDeque<Box<dyn ValueType>>,
    orig_backup: Option<NodeBackup>,
    enforce_determinism: bool,
}

impl TypedNodeDisruption {
    pub fn new() -> TypedNodeDisruption {
        TypedNodeDisruption::with_options(false, true)
    }

    ///
    /// `ignore_separators` excludes separator nodes from disruption;
    /// `enforce_determinism` makes each fuzzed node deterministic so the
    /// emission order is reproducible.
    ///
    pub fn with_options(ignore_separators: bool, enforce_determinism: bool) -> TypedNodeDisruption {
        let mut criteria = NodeCriteria::new()
            .mandatory_attrs(NodeAttrs::MUTABLE)
            .node_kinds(NodeKindSet::TYPED_VALUE | NodeKindSet::GEN_FUNC);
        if ignore_separators {
            criteria = criteria.negative_attrs(NodeAttrs::SEPARATOR);
        }
        let mut policy = ConsumerPolicy::new();
        policy.need_reset_when_structure_change = true;
        policy.set_node_interest(Some(criteria), None, None, None, None);
        TypedNodeDisruption {
            policy,
            current_node: None,
            fuzz_vt_list: VecDeque::new(),
            orig_backup: None,
            enforce_determinism,
        }
    }

    ///
    /// The ordered fuzzy value-type list for a node's current type: the
    /// alternating-type fuzz clone alone when the type is alternating,
    /// otherwise the boundary-catalogue siblings extended with neighbors of
    /// the current raw value; a type-advertised companion is tried first.
    ///
    fn build_fuzz_vt_list(&self, vt: &dyn ValueType) -> VecDeque<Box<dyn ValueType>> {
        let mut list: VecDeque<Box<dyn ValueType>> =
            match vt.fuzz_mode_clone(self.policy.fuzz_magnitude) {
                Some(alt_clone) => VecDeque::from([alt_clone]),
                None => {
                    let mut siblings: VecDeque<Box<dyn ValueType>> =
                        vt.fuzzy_siblings().into();
                    Self::extend_fuzz_vt_list(&mut siblings, vt);
                    siblings
                }
            };
        if let Some(companion) = vt.fuzzed_companion() {
            list.push_front(companion);
        }
        list
    }

    ///
    /// Extends the first compatible fuzzy type with the neighbors of the
    /// current raw value: the ±1 neighbors of every enumerated member
    /// (filtered against the set), the complement extremes, the set bounds
    /// ±1, the constrained-range bounds ±1, and any type-declared specific
    /// fuzzy values; the current value itself is removed.
    ///
    fn extend_fuzz_vt_list(list: &mut VecDeque<Box<dyn ValueType>>, vt: &dyn ValueType) {
        let Some(val) = vt.current_raw() else {
            return;
        };

        let enumerated = vt.enumerated();
        let in_set = |v: i64| {
            enumerated
                .as_ref()
                .map(|values| values.contains(&v))
                .unwrap_or(false)
        };

        // An ordered list rather than a set, to preserve determinism.
        let mut supp: Vec<i64> = [val + 1, val - 1]
            .into_iter()
            .filter(|&v| !in_set(v))
            .collect();

        if let Some(values) = &enumerated {
            let min = *values.iter().min().expect("enumerated sets are non-empty");
            let max = *values.iter().max().expect("enumerated sets are non-empty");
            if min != max {
                for neighbor in values.iter().flat_map(|&v| [v + 1, v - 1]) {
                    if !in_set(neighbor) && !supp.contains(&neighbor) {
                        supp.push(neighbor);
                    }
                }
                let complement: Vec<i64> =
                    (min..=max).filter(|v| !values.contains(v)).collect();
                for extreme in complement.first().into_iter().chain(complement.last()) {
                    if !supp.contains(extreme) {
                        supp.push(*extreme);
                    }
                }
                for bound in [max + 1, min - 1] {
                    if !supp.contains(&bound) {
                        supp.push(bound);
                    }
                }
            }
        }

        if let Some((mini_gen, maxi_gen)) = vt.int_bounds() {
            for bound in [mini_gen - 1, maxi_gen + 1] {
                if !supp.contains(&bound) {
                    supp.push(bound);
                }
            }
        }

        for specific in vt.specific_fuzzy_values() {
            if !supp.contains(&specific) {
                supp.push(specific);
            }
        }

        let supp: Vec<i64> = supp.into_iter().unique().collect();

        // The first compliant choice is also compliant for every previous
        // value; the rest is filtered by extend_value_list itself.
        if let Some(target) = list
            .iter_mut()
            .find(|o| o.is_compatible(val + 1) || o.is_compatible(val - 1))
        {
            target.extend_value_list(&supp);
            target.remove_value_list(&[val]);
        }
    }
}

impl Consumer for TypedNodeDisruption {
    fn policy(&self) -> &ConsumerPolicy {
        &self.policy
    }

    fn policy_mut(&mut self) -> &mut ConsumerPolicy {
        &mut self.policy
    }

    fn consume_node(&mut self, graph: &mut NodeGraph, node: NodeId) -> bool {
        if graph.is_genfunc(node)
            && (graph.is_attr_set(node, NodeAttrs::FREEZABLE)
                || graph.generated_value_type(node).is_none())
        {
            return false;
        }

        if Some(node) != self.current_node {
            self.current_node = Some(node);
            self.fuzz_vt_list.clear();
        }

        if self.fuzz_vt_list.is_empty() {
            self.orig_backup = Some(graph.get_internals_backup(node));
            let vt = if graph.is_genfunc(node) {
                graph
                    .generated_value_type(node)
                    .expect("genfunc candidates were filtered above")
            } else {
                graph
                    .value_type(node)
                    .expect("non-genfunc candidates are typed values")
            };
            self.fuzz_vt_list = self.build_fuzz_vt_list(vt);
        }

        match self.fuzz_vt_list.pop_front() {
            Some(vt_obj) => {
                graph.set_values(node, vt_obj);
                graph.make_finite(node, false);
                if self.enforce_determinism {
                    graph.make_determinist(node, false);
                }
                graph.unfreeze(
                    node,
                    UnfreezeOpts::default()
                        .dont_change_state()
                        .ignore_entanglement(),
                );
                // The disrupted node must stay freezable and pinned.
                graph.set_attr(node, NodeAttrs::FREEZABLE);
                graph.set_attr(node, NodeAttrs::LOCKED);
                true
            }
            None => unreachable!("the fuzzy value-type list cannot be empty after a rebuild"),
        }
    }

    fn save_node(&mut self, _graph: &mut NodeGraph, _node: NodeId) {}

    fn recover_node(&mut self, graph: &mut NodeGraph, node: NodeId) {
        if let Some(backup) = self.orig_backup.take() {
            graph.set_internals(node, backup);
        }
    }

    fn still_interested_by(&mut self, _graph: &NodeGraph, _node: NodeId) -> bool {
        !self.fuzz_vt_list.is_empty()
    }
}

///
/// Substitutes separator nodes with the empty separator and the other
/// user-supplied ones, preserving the node's attributes (notably the
/// separator flag itself).
///
pub struct SeparatorDisruption {
    policy: ConsumerPolicy,
    values: Vec<Vec<u8>>,
}

impl SeparatorDisruption {
    pub fn new(separators: &[&[u8]]) -> SeparatorDisruption {
        let mut policy = ConsumerPolicy::new();
        policy.set_node_interest(
            Some(
                NodeCriteria::new()
                    .mandatory_attrs(NodeAttrs::MUTABLE | NodeAttrs::SEPARATOR)
                    .node_kinds(NodeKindSet::TYPED_VALUE),
            ),
            None,
            None,
            None,
            None,
        );
        let mut values: Vec<Vec<u8>> = vec![Vec::new()];
        values.extend(separators.iter().map(|s| s.to_vec()));
        SeparatorDisruption { policy, values }
    }
}

impl Consumer for SeparatorDisruption {
    fn policy(&self) -> &ConsumerPolicy {
        &self.policy
    }

    fn policy_mut(&mut self) -> &mut ConsumerPolicy {
        &mut self.policy
    }

    fn consume_node(&mut self, graph: &mut NodeGraph, node: NodeId) -> bool {
        let orig = graph.to_bytes(node);
        let mut candidates = self.values.clone();
        candidates.retain(|v| *v != orig);

        // Node attributes are not altered by the replacement, which matters
        // here: the separator flag must survive.
        graph.set_values(node, Box::new(Str::new(candidates)));
        graph.unfreeze(node, UnfreezeOpts::default().dont_change_state());
        graph.make_finite(node, false);
        graph.make_determinist(node, false);
        true
    }
}

///
/// One-shot relaxation of the children-ordering constraints of every mutable
/// non-terminal reachable from `top` (optionally restricted by a path
/// regexp). This is not an iterative walker: it rewrites the constraints in
/// place and returns.
///
pub fn fuzz_data_tree(graph: &mut NodeGraph, top: NodeId, path_regexp: Option<&Regex>) {
    let criteria = NodeCriteria::new()
        .mandatory_attrs(NodeAttrs::MUTABLE)
        .node_kinds(NodeKindSet::NON_TERM);

    let node_list = match path_regexp {
        Some(re) => graph.get_reachable_nodes(
            top,
            ReachOpts {
                path_regexp: Some(re),
                ..ReachOpts::default()
            },
        ),
        None => vec![top],
    };

    for node in node_list {
        let matching = graph.get_reachable_nodes(
            node,
            ReachOpts {
                internals_criteria: Some(&criteria),
                ..ReachOpts::default()
            },
        );
        for nonterm in matching {
            graph.change_subnodes_csts(nonterm);
        }
    }
}
