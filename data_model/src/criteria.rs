// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use regex::Regex;

use crate::internals::{GenCusto, NodeAttrs, NodeInternals, NodeKindSet};

///
/// A conjunctive predicate over node internals: mandatory and negative
/// attributes, allowed and negative node kinds, mandatory customizations, and
/// an optional path clause (evaluated by reachability queries, which know the
/// paths).
///
/// An empty criteria matches every node.
///
#[derive(Clone, Debug)]
pub struct NodeCriteria {
    mandatory_attrs: NodeAttrs,
    negative_attrs: NodeAttrs,
    node_kinds: Option<NodeKindSet>,
    negative_node_kinds: Option<NodeKindSet>,
    mandatory_custo: GenCusto,
    path_regexp: Option<Regex>,
}

impl Default for NodeCriteria {
    fn default() -> NodeCriteria {
        NodeCriteria::new()
    }
}

impl NodeCriteria {
    pub fn new() -> NodeCriteria {
        NodeCriteria {
            mandatory_attrs: NodeAttrs::empty(),
            negative_attrs: NodeAttrs::empty(),
            node_kinds: None,
            negative_node_kinds: None,
            mandatory_custo: GenCusto::empty(),
            path_regexp: None,
        }
    }

    pub fn mandatory_attrs(mut self, attrs: NodeAttrs) -> NodeCriteria {
        self.mandatory_attrs |= attrs;
        self
    }

    pub fn negative_attrs(mut self, attrs: NodeAttrs) -> NodeCriteria {
        self.negative_attrs |= attrs;
        self
    }

    pub fn node_kinds(mut self, kinds: NodeKindSet) -> NodeCriteria {
        *self.node_kinds.get_or_insert(NodeKindSet::empty()) |= kinds;
        self
    }

    pub fn negative_node_kinds(mut self, kinds: NodeKindSet) -> NodeCriteria {
        *self.negative_node_kinds.get_or_insert(NodeKindSet::empty()) |= kinds;
        self
    }

    pub fn mandatory_custo(mut self, custo: GenCusto) -> NodeCriteria {
        self.mandatory_custo |= custo;
        self
    }

    pub fn path_regexp(mut self, re: Regex) -> NodeCriteria {
        self.path_regexp = Some(re);
        self
    }

    ///
    /// Logical AND with another criteria: every clause of `other` is merged
    /// into this one, de-duplicated. A path clause of `other` replaces an
    /// absent one here.
    ///
    pub fn extend(&mut self, other: &NodeCriteria) {
        self.mandatory_attrs |= other.mandatory_attrs;
        self.negative_attrs |= other.negative_attrs;
        if let Some(kinds) = other.node_kinds {
            *self.node_kinds.get_or_insert(NodeKindSet::empty()) |= kinds;
        }
        if let Some(kinds) = other.negative_node_kinds {
            *self.negative_node_kinds.get_or_insert(NodeKindSet::empty()) |= kinds;
        }
        self.mandatory_custo |= other.mandatory_custo;
        if self.path_regexp.is_none() {
            self.path_regexp = other.path_regexp.clone();
        }
    }

    pub fn path_clause(&self) -> Option<&Regex> {
        self.path_regexp.as_ref()
    }

    pub fn matches(&self, internals: &NodeInternals) -> bool {
        if !internals.attrs.contains(self.mandatory_attrs) {
            return false;
        }
        if internals.attrs.intersects(self.negative_attrs) {
            return false;
        }
        if let Some(kinds) = self.node_kinds {
            if !kinds.contains_kind(internals.kind()) {
                return false;
            }
        }
        if let Some(kinds) = self.negative_node_kinds {
            if kinds.contains_kind(internals.kind()) {
                return false;
            }
        }
        internals.custo.contains(self.mandatory_custo)
    }
}

///
/// A predicate over a node's semantic tags.
///
#[derive(Clone, Debug, Default)]
pub struct SemanticsCriteria {
    mandatory: Vec<String>,
    negative: Vec<String>,
}

impl SemanticsCriteria {
    pub fn new() -> SemanticsCriteria {
        SemanticsCriteria::default()
    }

    pub fn mandatory(mut self, tag: &str) -> SemanticsCriteria {
        if !self.mandatory.iter().any(|t| t == tag) {
            self.mandatory.push(tag.to_owned());
        }
        self
    }

    pub fn negative(mut self, tag: &str) -> SemanticsCriteria {
        if !self.negative.iter().any(|t| t == tag) {
            self.negative.push(tag.to_owned());
        }
        self
    }

    pub fn extend(&mut self, other: &SemanticsCriteria) {
        for tag in &other.mandatory {
            if !self.mandatory.contains(tag) {
                self.mandatory.push(tag.clone());
            }
        }
        for tag in &other.negative {
            if !self.negative.contains(tag) {
                self.negative.push(tag.clone());
            }
        }
    }

    pub fn matches(&self, tags: &[String]) -> bool {
        self.mandatory.iter().all(|t| tags.contains(t))
            && !self.negative.iter().any(|t| tags.contains(t))
    }
}
