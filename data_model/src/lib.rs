// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

mod criteria;
mod internals;
mod value_types;

pub use crate::criteria::{NodeCriteria, SemanticsCriteria};
pub use crate::internals::{
    arrangements, Arrangement, GenCusto, GenFuncContent, Generator, NodeAttrs, NodeContent,
    NodeInternals, NodeKind, NodeKindSet, NonTermContent, Shape, SubnodeSpec, TypedContent,
};
pub use crate::value_types::{Endian, Int, Str, ValueType};

use std::sync::Arc;

use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use regex::Regex;
use smallvec::SmallVec;

/// The default configuration every node starts with.
pub const MAIN_CONF: &str = "MAIN";

// 2^32 nodes ought to be more than enough for anyone!
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

///
/// One node of the graph: a name, the named configuration set (insertion
/// order is deterministic; the first entry is the default), semantic tags,
/// and a fuzz weight.
///
#[derive(Clone, Debug)]
struct NodeEntry {
    name: String,
    confs: IndexMap<String, NodeInternals>,
    current_conf: String,
    semantics: Vec<String>,
    fuzz_weight: u8,
}

///
/// A snapshot of one node's current configuration, for generic save/recover.
///
#[derive(Clone, Debug)]
pub struct NodeBackup {
    conf: String,
    internals: NodeInternals,
}

///
/// How to unfreeze a node. The defaults mirror a plain state-changing
/// recursive unfreeze; `shallow` restricts the operation to the node itself,
/// and `dont_change_state` releases the frozen value without advancing the
/// enumeration cursor, so the next freeze re-derives the same variant.
///
#[derive(Clone, Copy, Debug)]
pub struct UnfreezeOpts {
    pub recursive: bool,
    pub dont_change_state: bool,
    pub ignore_entanglement: bool,
}

impl Default for UnfreezeOpts {
    fn default() -> UnfreezeOpts {
        UnfreezeOpts {
            recursive: true,
            dont_change_state: false,
            ignore_entanglement: false,
        }
    }
}

impl UnfreezeOpts {
    pub fn shallow() -> UnfreezeOpts {
        UnfreezeOpts {
            recursive: false,
            ..UnfreezeOpts::default()
        }
    }

    pub fn dont_change_state(mut self) -> UnfreezeOpts {
        self.dont_change_state = true;
        self
    }

    pub fn ignore_entanglement(mut self) -> UnfreezeOpts {
        self.ignore_entanglement = true;
        self
    }
}

///
/// Options for a reachability query rooted at some node. The query walks the
/// frozen structure only (the root of the query is frozen on demand).
///
#[derive(Clone, Copy, Debug, Default)]
pub struct ReachOpts<'a> {
    pub internals_criteria: Option<&'a NodeCriteria>,
    pub semantics_criteria: Option<&'a SemanticsCriteria>,
    pub exclude_self: bool,
    /// Results are always in stable document order; `false` merely releases
    /// the guarantee for callers that do not care.
    pub respect_order: bool,
    pub relative_depth: Option<usize>,
    pub path_regexp: Option<&'a Regex>,
}

///
/// An arena of nodes indexed by handle. The graph is a tree with possible
/// shared subnodes; entanglement is a separate relation over handles. All
/// node state lives here, and all mutation goes through the graph: the
/// structure is single-threaded by design.
///
pub struct NodeGraph {
    entries: Vec<NodeEntry>,
    entangled: HashMap<NodeId, SmallVec<[NodeId; 2]>>,
    rng: StdRng,
}

impl NodeGraph {
    pub fn new() -> NodeGraph {
        NodeGraph::with_seed(0x5eed)
    }

    pub fn with_seed(seed: u64) -> NodeGraph {
        NodeGraph {
            entries: Vec::new(),
            entangled: HashMap::default(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn add_entry(&mut self, name: &str, internals: NodeInternals) -> NodeId {
        let id = NodeId(self.entries.len() as u32);
        let mut confs = IndexMap::new();
        confs.insert(MAIN_CONF.to_owned(), internals);
        self.entries.push(NodeEntry {
            name: name.to_owned(),
            confs,
            current_conf: MAIN_CONF.to_owned(),
            semantics: Vec::new(),
            fuzz_weight: 1,
        });
        id
    }

    pub fn add_typed(&mut self, name: &str, vt: Box<dyn ValueType>) -> NodeId {
        self.add_entry(
            name,
            NodeInternals::new(NodeContent::Typed(TypedContent::new(vt))),
        )
    }

    pub fn add_genfunc(
        &mut self,
        name: &str,
        generator: Arc<dyn Generator>,
        args: Vec<NodeId>,
    ) -> NodeId {
        self.add_entry(
            name,
            NodeInternals::new(NodeContent::GenFunc(GenFuncContent {
                generator,
                args,
                generated: None,
            })),
        )
    }

    pub fn add_nonterm(&mut self, name: &str, shapes: Vec<Shape>) -> NodeId {
        self.add_entry(
            name,
            NodeInternals::new(NodeContent::NonTerm(NonTermContent::new(shapes))),
        )
    }

    fn entry(&self, id: NodeId) -> &NodeEntry {
        &self.entries[id.index()]
    }

    fn entry_mut(&mut self, id: NodeId) -> &mut NodeEntry {
        &mut self.entries[id.index()]
    }

    pub fn node_name(&self, id: NodeId) -> &str {
        &self.entry(id).name
    }

    ///
    /// The internals of the given configuration, or of the current one.
    ///
    pub fn internals(&self, id: NodeId, conf: Option<&str>) -> Option<&NodeInternals> {
        let entry = self.entry(id);
        let conf = conf.unwrap_or(&entry.current_conf);
        entry.confs.get(conf)
    }

    fn current(&self, id: NodeId) -> &NodeInternals {
        let entry = self.entry(id);
        &entry.confs[&entry.current_conf]
    }

    fn current_mut(&mut self, id: NodeId) -> &mut NodeInternals {
        let entry = self.entry_mut(id);
        let conf = entry.current_conf.clone();
        entry
            .confs
            .get_mut(&conf)
            .expect("the current configuration always exists")
    }

    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.current(id).kind()
    }

    pub fn is_nonterm(&self, id: NodeId) -> bool {
        self.kind(id) == NodeKind::NonTerm
    }

    pub fn is_genfunc(&self, id: NodeId) -> bool {
        self.kind(id) == NodeKind::GenFunc
    }

    pub fn is_typed_value(&self, id: NodeId) -> bool {
        self.kind(id) == NodeKind::TypedValue
    }

    pub fn is_attr_set(&self, id: NodeId, attr: NodeAttrs) -> bool {
        self.current(id).attrs.contains(attr)
    }

    pub fn set_attr(&mut self, id: NodeId, attr: NodeAttrs) {
        self.current_mut(id).attrs |= attr;
    }

    pub fn clear_attr(&mut self, id: NodeId, attr: NodeAttrs) {
        self.current_mut(id).attrs &= !attr;
    }

    pub fn set_custo(&mut self, id: NodeId, custo: GenCusto) {
        self.current_mut(id).custo |= custo;
    }

    pub fn is_custo_set(&self, id: NodeId, custo: GenCusto) -> bool {
        self.current(id).custo.contains(custo)
    }

    pub fn set_semantics(&mut self, id: NodeId, tags: &[&str]) {
        self.entry_mut(id).semantics = tags.iter().map(|t| (*t).to_owned()).collect();
    }

    pub fn semantics(&self, id: NodeId) -> &[String] {
        &self.entry(id).semantics
    }

    pub fn set_fuzz_weight(&mut self, id: NodeId, weight: u8) {
        self.entry_mut(id).fuzz_weight = weight;
    }

    pub fn get_fuzz_weight(&self, id: NodeId) -> u8 {
        self.entry(id).fuzz_weight
    }

    ///
    /// Marks two or more nodes as entangled: a state-changing unfreeze of one
    /// propagates shallowly to the others, unless the unfreeze asks for
    /// entanglement to be ignored.
    ///
    pub fn entangle(&mut self, group: &[NodeId]) {
        for &id in group {
            let peers: SmallVec<[NodeId; 2]> =
                group.iter().copied().filter(|&p| p != id).collect();
            self.entangled.insert(id, peers);
        }
    }

    // === configurations ===

    pub fn add_conf(&mut self, id: NodeId, name: &str, internals: NodeInternals) {
        self.entry_mut(id).confs.insert(name.to_owned(), internals);
    }

    pub fn is_conf_existing(&self, id: NodeId, name: &str) -> bool {
        self.entry(id).confs.contains_key(name)
    }

    pub fn get_current_conf(&self, id: NodeId) -> &str {
        &self.entry(id).current_conf
    }

    ///
    /// Switches the node (and, recursively, its materialized subtree) to the
    /// named configuration. Nodes that do not expose the configuration keep
    /// their current one.
    ///
    pub fn set_current_conf(&mut self, id: NodeId, conf: &str, recursive: bool) {
        if self.is_conf_existing(id, conf) {
            self.entry_mut(id).current_conf = conf.to_owned();
        }
        if recursive {
            for child in self.subnode_children(id) {
                self.set_current_conf(child, conf, true);
            }
        }
    }

    // === freeze / unfreeze lifecycle ===

    ///
    /// Binds the node's current variant (and, for non-terminals, its current
    /// arrangement, materializing repeated-subnode instances on first use).
    /// Freezing an already-frozen node is a no-op.
    ///
    pub fn freeze(&mut self, id: NodeId) {
        match &self.current(id).content {
            NodeContent::Typed(c) => {
                if c.frozen.is_none() {
                    let bytes = c.vt.current_bytes();
                    if let NodeContent::Typed(c) = &mut self.current_mut(id).content {
                        c.frozen = Some(bytes);
                    }
                }
            }
            NodeContent::GenFunc(c) => {
                if c.generated.is_none() {
                    let generator = c.generator.clone();
                    let args = c.args.clone();
                    let arg_bytes: Vec<Vec<u8>> =
                        args.iter().map(|&a| self.get_value(a)).collect();
                    let vt = generator.generate(&arg_bytes);
                    let frozen = vt.current_bytes();
                    if let NodeContent::GenFunc(c) = &mut self.current_mut(id).content {
                        c.generated = Some(TypedContent {
                            vt,
                            frozen: Some(frozen),
                        });
                    }
                }
            }
            NodeContent::NonTerm(c) => {
                if c.frozen {
                    // Already bound, but parts of the subtree may have been
                    // released (re-armed generators, unfrozen leaves).
                    let children = c.active.clone();
                    for child in children {
                        self.freeze(child);
                    }
                    return;
                }
                let arrangement = arrangements(&c.shapes)[c.current_arrangement_index()];
                let arrangement_index = c.current_arrangement_index();
                let shape = &c.shapes[arrangement.shape];
                // The slot plan for this arrangement, in serialization order.
                let mut plan: Vec<(usize, NodeId, usize)> = Vec::new();
                let slot_count = shape.subnodes.len();
                for offset in 0..slot_count {
                    let pi = (offset + arrangement.rotation) % slot_count;
                    let spec = &shape.subnodes[pi];
                    let qty = match arrangement.qty_override {
                        Some((opi, qty)) if opi == pi => qty,
                        _ => spec.default_qty,
                    };
                    plan.push((pi, spec.node, qty));
                }
                let shape_index = arrangement.shape;

                let mut active: Vec<NodeId> = Vec::new();
                for (pi, template, qty) in plan {
                    loop {
                        let existing = {
                            let c = self.nonterm(id);
                            c.instances
                                .get(&(shape_index, pi))
                                .map(|v| v.len())
                                .unwrap_or(1)
                        };
                        if existing >= qty {
                            break;
                        }
                        let instance = self.clone_subtree(template);
                        let c = self.nonterm_mut(id);
                        c.instances
                            .entry((shape_index, pi))
                            .or_insert_with(|| vec![template])
                            .push(instance);
                    }
                    let c = self.nonterm(id);
                    match c.instances.get(&(shape_index, pi)) {
                        Some(instances) => active.extend(&instances[..qty]),
                        None => {
                            if qty >= 1 {
                                active.push(template);
                            }
                        }
                    }
                }

                let c = self.nonterm_mut(id);
                c.active = active.clone();
                c.frozen = true;
                c.last_frozen = Some(arrangement_index);
                for child in active {
                    self.freeze(child);
                }
            }
        }
    }

    fn nonterm(&self, id: NodeId) -> &NonTermContent {
        match &self.current(id).content {
            NodeContent::NonTerm(c) => c,
            content => unreachable!("expected a non-terminal, found {:?}", content.kind()),
        }
    }

    fn nonterm_mut(&mut self, id: NodeId) -> &mut NonTermContent {
        match &mut self.current_mut(id).content {
            NodeContent::NonTerm(c) => c,
            content => unreachable!("expected a non-terminal, found {:?}", content.kind()),
        }
    }

    ///
    /// Releases the node's frozen value. Without `dont_change_state` the
    /// enumeration cursor advances, so the next freeze derives the next
    /// variant; entangled peers are unfrozen shallowly unless the caller
    /// suppresses propagation.
    ///
    pub fn unfreeze(&mut self, id: NodeId, opts: UnfreezeOpts) {
        if !opts.ignore_entanglement {
            let peers: Vec<NodeId> = self
                .entangled
                .get(&id)
                .map(|peers| peers.iter().copied().collect())
                .unwrap_or_default();
            for peer in peers {
                self.unfreeze(
                    peer,
                    UnfreezeOpts {
                        recursive: false,
                        dont_change_state: opts.dont_change_state,
                        ignore_entanglement: true,
                    },
                );
            }
        }
        match &mut self.current_mut(id).content {
            NodeContent::Typed(c) => {
                c.frozen = None;
                if !opts.dont_change_state {
                    c.vt.advance();
                }
            }
            NodeContent::GenFunc(c) => {
                c.generated = None;
            }
            NodeContent::NonTerm(c) => {
                let children = c.active.clone();
                c.frozen = false;
                if !opts.dont_change_state {
                    c.advance();
                }
                if opts.recursive {
                    for child in children {
                        self.unfreeze(
                            child,
                            UnfreezeOpts {
                                ignore_entanglement: true,
                                ..opts
                            },
                        );
                    }
                }
            }
        }
    }

    ///
    /// Rewinds the node's enumeration and releases its frozen value, without
    /// touching attributes.
    ///
    pub fn reset_state(&mut self, id: NodeId, recursive: bool) {
        match &mut self.current_mut(id).content {
            NodeContent::Typed(c) => {
                c.frozen = None;
                c.vt.rewind();
            }
            NodeContent::GenFunc(c) => {
                c.generated = None;
            }
            NodeContent::NonTerm(c) => {
                let children = c.active.clone();
                c.frozen = false;
                c.rewind();
                c.last_frozen = None;
                if recursive {
                    for child in children {
                        self.reset_state(child, true);
                    }
                }
            }
        }
    }

    pub fn is_exhausted(&self, id: NodeId) -> bool {
        match &self.current(id).content {
            NodeContent::Typed(c) => c.vt.is_exhausted(),
            NodeContent::GenFunc(c) => c
                .generated
                .as_ref()
                .map(|g| g.vt.is_exhausted())
                .unwrap_or(true),
            NodeContent::NonTerm(c) => c.is_exhausted(),
        }
    }

    ///
    /// Whether the next freeze of this non-terminal will materialize a
    /// different arrangement than the last frozen one. Always false for
    /// frozen nodes and for other kinds.
    ///
    pub fn structure_will_change(&self, id: NodeId) -> bool {
        match &self.current(id).content {
            NodeContent::NonTerm(c) => {
                !c.frozen
                    && c.last_frozen.is_some()
                    && c.last_frozen != Some(c.current_arrangement_index())
            }
            _ => false,
        }
    }

    // === determinism / finiteness ===

    fn for_subtree(&mut self, id: NodeId, recursive: bool, f: &mut dyn FnMut(&mut NodeInternals)) {
        let mut visited = HashSet::default();
        let mut stack = vec![id];
        while let Some(nid) = stack.pop() {
            if !visited.insert(nid) {
                continue;
            }
            let entry = self.entry_mut(nid);
            for internals in entry.confs.values_mut() {
                f(internals);
            }
            if recursive {
                stack.extend(self.subnode_children(nid));
            }
        }
    }

    /// The shape templates of a node, across all configurations.
    fn template_children(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        for internals in self.entry(id).confs.values() {
            if let NodeContent::NonTerm(c) = &internals.content {
                for shape in &c.shapes {
                    out.extend(shape.subnodes.iter().map(|s| s.node));
                }
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    ///
    /// All subnodes a node can ever materialize: shape templates and
    /// already-materialized instances, across all configurations.
    ///
    fn subnode_children(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        for internals in self.entry(id).confs.values() {
            if let NodeContent::NonTerm(c) = &internals.content {
                for shape in &c.shapes {
                    out.extend(shape.subnodes.iter().map(|s| s.node));
                }
                for instances in c.instances.values() {
                    out.extend(instances.iter().copied());
                }
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// The frozen (or last materialized) children of a node, in order.
    pub fn frozen_children(&self, id: NodeId) -> Vec<NodeId> {
        match &self.current(id).content {
            NodeContent::NonTerm(c) => c.active.clone(),
            _ => Vec::new(),
        }
    }

    pub fn make_finite(&mut self, id: NodeId, recursive: bool) {
        self.for_subtree(id, recursive, &mut |internals| {
            internals.attrs |= NodeAttrs::FINITE;
        });
    }

    pub fn make_determinist(&mut self, id: NodeId, recursive: bool) {
        self.for_subtree(id, recursive, &mut |internals| {
            internals.attrs |= NodeAttrs::DETERMINIST;
            match &mut internals.content {
                NodeContent::Typed(c) => c.vt.unshuffle(),
                NodeContent::GenFunc(c) => {
                    if let Some(g) = &mut c.generated {
                        g.vt.unshuffle();
                    }
                }
                NodeContent::NonTerm(c) => c.order = None,
            }
        });
    }

    pub fn make_random(&mut self, id: NodeId, recursive: bool) {
        // Split-borrow the rng away from the entries.
        let NodeGraph {
            entries,
            rng,
            ..
        } = self;
        let mut visited: HashSet<NodeId> = HashSet::default();
        let mut stack = vec![id];
        while let Some(nid) = stack.pop() {
            if !visited.insert(nid) {
                continue;
            }
            let entry = &mut entries[nid.index()];
            let mut children: Vec<NodeId> = Vec::new();
            for internals in entry.confs.values_mut() {
                internals.attrs &= !NodeAttrs::DETERMINIST;
                match &mut internals.content {
                    NodeContent::Typed(c) => c.vt.shuffle(rng),
                    NodeContent::GenFunc(_) => {}
                    NodeContent::NonTerm(c) => {
                        let count = c.arrangement_count();
                        let mut order: Vec<usize> = (0..count).collect();
                        use rand::seq::SliceRandom;
                        order.shuffle(rng);
                        c.order = Some(order);
                        c.cursor = 0;
                        for shape in &c.shapes {
                            children.extend(shape.subnodes.iter().map(|s| s.node));
                        }
                        for instances in c.instances.values() {
                            children.extend(instances.iter().copied());
                        }
                    }
                }
            }
            if recursive {
                stack.extend(children);
            }
        }
    }

    // === serialization ===

    ///
    /// The byte image of a frozen node; `None` while any part of it is
    /// unfrozen.
    ///
    pub fn frozen_bytes(&self, id: NodeId) -> Option<Vec<u8>> {
        match &self.current(id).content {
            NodeContent::Typed(c) => c.frozen.clone(),
            NodeContent::GenFunc(c) => c.generated.as_ref().and_then(|g| g.frozen.clone()),
            NodeContent::NonTerm(c) => {
                if !c.frozen {
                    return None;
                }
                let mut out = Vec::new();
                for &child in &c.active {
                    out.extend(self.frozen_bytes(child)?);
                }
                Some(out)
            }
        }
    }

    /// Freeze-on-demand serialization.
    pub fn to_bytes(&mut self, id: NodeId) -> Vec<u8> {
        self.freeze(id);
        self.frozen_bytes(id)
            .expect("a just-frozen node must serialize")
    }

    /// Forces freezing, then reads the byte image.
    pub fn get_value(&mut self, id: NodeId) -> Vec<u8> {
        self.to_bytes(id)
    }

    /// The value type of a terminal typed node.
    pub fn value_type(&self, id: NodeId) -> Option<&dyn ValueType> {
        match &self.current(id).content {
            NodeContent::Typed(c) => Some(c.vt.as_ref()),
            _ => None,
        }
    }

    /// The value type of a generator's generated content, once frozen.
    pub fn generated_value_type(&self, id: NodeId) -> Option<&dyn ValueType> {
        match &self.current(id).content {
            NodeContent::GenFunc(c) => c.generated.as_ref().map(|g| g.vt.as_ref()),
            _ => None,
        }
    }

    // === internals replacement / backup ===

    ///
    /// Replaces the node's current-configuration content with a typed value,
    /// preserving identity, attributes and customizations.
    ///
    pub fn set_values(&mut self, id: NodeId, vt: Box<dyn ValueType>) {
        self.current_mut(id).content = NodeContent::Typed(TypedContent::new(vt));
    }

    pub fn get_internals_backup(&self, id: NodeId) -> NodeBackup {
        let entry = self.entry(id);
        NodeBackup {
            conf: entry.current_conf.clone(),
            internals: entry.confs[&entry.current_conf].clone(),
        }
    }

    pub fn set_internals(&mut self, id: NodeId, backup: NodeBackup) {
        let entry = self.entry_mut(id);
        entry.confs.insert(backup.conf.clone(), backup.internals);
        entry.current_conf = backup.conf;
    }

    // === constraint repair ===

    ///
    /// Re-arms every generator whose arguments intersect the subtree of
    /// `id`, so the next freeze regenerates it from current argument bytes.
    ///
    pub fn fix_synchronized_nodes(&mut self, id: NodeId) {
        let mut subtree: HashSet<NodeId> = HashSet::default();
        let mut stack = vec![id];
        while let Some(nid) = stack.pop() {
            if !subtree.insert(nid) {
                continue;
            }
            stack.extend(self.frozen_children(nid));
        }
        for index in 0..self.entries.len() {
            let nid = NodeId(index as u32);
            let touches = match &self.current(nid).content {
                NodeContent::GenFunc(c) => {
                    c.generated.is_some() && c.args.iter().any(|a| subtree.contains(a))
                }
                _ => false,
            };
            if !touches {
                continue;
            }
            if let NodeContent::GenFunc(c) = &mut self.current_mut(nid).content {
                c.generated = None;
            }
        }
    }

    ///
    /// Rewrites the children-ordering constraint of a non-terminal to an
    /// unordered wildcard, across all configurations, and rewinds its
    /// enumeration (the arrangement list changed under the cursor).
    ///
    pub fn change_subnodes_csts(&mut self, id: NodeId) {
        for internals in self.entry_mut(id).confs.values_mut() {
            if let NodeContent::NonTerm(c) = &mut internals.content {
                for shape in &mut c.shapes {
                    shape.ordered = false;
                }
                c.cursor = 0;
                c.frozen = false;
                c.last_frozen = None;
                c.order = None;
            }
        }
    }

    // === reachability and paths ===

    ///
    /// The nodes reachable from `from` over the frozen structure, in
    /// depth-first document order, filtered by the query's criteria. With
    /// `relative_depth: Some(1)` this is the direct-subnode frontier.
    ///
    pub fn get_reachable_nodes(&mut self, from: NodeId, opts: ReachOpts<'_>) -> Vec<NodeId> {
        self.freeze(from);
        let root_path = self.node_name(from).to_owned();
        let mut out = Vec::new();
        let mut visited: HashSet<NodeId> = HashSet::default();
        // (id, depth, path)
        let mut stack: Vec<(NodeId, usize, String)> = vec![(from, 0, root_path)];
        while let Some((id, depth, path)) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            if depth > 0 || !opts.exclude_self {
                let internals = self.current(id);
                let matches_internals = opts
                    .internals_criteria
                    .map(|c| c.matches(internals))
                    .unwrap_or(true);
                let matches_semantics = opts
                    .semantics_criteria
                    .map(|c| c.matches(self.semantics(id)))
                    .unwrap_or(true);
                let matches_path = opts
                    .path_regexp
                    .or_else(|| opts.internals_criteria.and_then(|c| c.path_clause()))
                    .map(|re| re.is_match(&path))
                    .unwrap_or(true);
                if matches_internals && matches_semantics && matches_path {
                    out.push(id);
                }
            }
            if let Some(max_depth) = opts.relative_depth {
                if depth >= max_depth {
                    continue;
                }
            }
            let children = self.frozen_children(id);
            for &child in children.iter().rev() {
                let child_path = format!("{}/{}", path, self.node_name(child));
                stack.push((child, depth + 1, child_path));
            }
        }
        out
    }

    ///
    /// The path of `node` from `root` over the frozen structure, or `None`
    /// when the node is not reachable from the frozen root (it may still
    /// exist in the unfrozen graph).
    ///
    pub fn get_path_from(&self, node: NodeId, root: NodeId) -> Option<String> {
        self.get_all_paths_from(node, root).into_iter().next()
    }

    pub fn get_all_paths_from(&self, node: NodeId, root: NodeId) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack: Vec<(NodeId, String)> = vec![(root, self.node_name(root).to_owned())];
        while let Some((id, path)) = stack.pop() {
            if id == node {
                out.push(path.clone());
            }
            let children = match &self.current(id).content {
                NodeContent::NonTerm(c) if c.frozen => c.active.clone(),
                _ => Vec::new(),
            };
            for &child in children.iter().rev() {
                stack.push((child, format!("{}/{}", path, self.node_name(child))));
            }
        }
        out
    }

    // === subtree cloning ===

    ///
    /// Deep-clones a subtree, producing fresh handles with rewound state.
    /// Generator arguments that point inside the cloned subtree are remapped
    /// to their clones; arguments pointing outside are preserved.
    ///
    pub fn clone_subtree(&mut self, id: NodeId) -> NodeId {
        log::trace!("cloning the subtree of {}", self.node_name(id));
        let mut map: HashMap<NodeId, NodeId> = HashMap::default();
        let new = self.clone_rec(id, &mut map);
        let clones: Vec<NodeId> = map.values().copied().collect();
        for nid in clones {
            if let NodeContent::GenFunc(c) = &mut self.current_mut(nid).content {
                for arg in &mut c.args {
                    if let Some(&mapped) = map.get(arg) {
                        *arg = mapped;
                    }
                }
            }
        }
        new
    }

    fn clone_rec(&mut self, id: NodeId, map: &mut HashMap<NodeId, NodeId>) -> NodeId {
        if let Some(&done) = map.get(&id) {
            return done;
        }
        let mut entry = self.entry(id).clone();
        for internals in entry.confs.values_mut() {
            match &mut internals.content {
                NodeContent::Typed(c) => {
                    c.frozen = None;
                    c.vt.rewind();
                }
                NodeContent::GenFunc(c) => {
                    c.generated = None;
                }
                NodeContent::NonTerm(c) => {
                    c.frozen = false;
                    c.cursor = 0;
                    c.last_frozen = None;
                    c.active.clear();
                    c.instances.clear();
                    c.order = None;
                }
            }
        }
        let new = NodeId(self.entries.len() as u32);
        self.entries.push(entry);
        map.insert(id, new);

        // Recurse into shape templates only (materialized instances of the
        // original are not part of the clone), rewriting the clone's specs.
        let templates: Vec<NodeId> = self.template_children(id);
        let mut template_map: HashMap<NodeId, NodeId> = HashMap::default();
        for template in templates {
            let cloned = self.clone_rec(template, map);
            template_map.insert(template, cloned);
        }
        for internals in self.entry_mut(new).confs.values_mut() {
            if let NodeContent::NonTerm(c) = &mut internals.content {
                for shape in &mut c.shapes {
                    for spec in &mut shape.subnodes {
                        if let Some(&mapped) = template_map.get(&spec.node) {
                            spec.node = mapped;
                        }
                    }
                }
            }
        }
        new
    }
}

#[cfg(test)]
mod tests;
