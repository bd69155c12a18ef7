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

mod consumer;
mod strategies;

pub use crate::consumer::{Consumer, ConsumerPolicy};
pub use crate::strategies::{
    fuzz_data_tree, AltConfConsumer, BasicVisitor, NonTermVisitor, SeparatorDisruption,
    TypedNodeDisruption,
};

use std::cell::RefCell;
use std::rc::Rc;

use data_model::{
    GenCusto, NodeAttrs, NodeCriteria, NodeGraph, NodeId, ReachOpts, UnfreezeOpts,
};
use fnv::FnvHashSet as HashSet;

///
/// Logs at trace level, but only in `cfg(test)`.
///
#[macro_export]
macro_rules! test_trace_log {
    ($($arg:tt)+) => {
      #[cfg(test)]
      {
        log::trace!($($arg)+)
      }
    };
}

///
/// Options for a walk over a data-model tree.
///
/// `max_steps` caps the number of emissions (`-1` = unbounded), and
/// `initial_step` fast-forwards to the given 1-based step, discarding the
/// emissions before it.
///
#[derive(Clone, Copy, Debug)]
pub struct WalkOptions {
    pub make_determinist: bool,
    pub make_random: bool,
    pub max_steps: i64,
    pub initial_step: usize,
}

impl Default for WalkOptions {
    fn default() -> WalkOptions {
        WalkOptions {
            make_determinist: false,
            make_random: false,
            max_steps: -1,
            initial_step: 1,
        }
    }
}

///
/// One mutated state of the walked tree. The root is freshly frozen when an
/// emission is produced, and the consumed node is guaranteed reachable from
/// it; its byte image before the mutation is `orig`.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Emission {
    pub consumed: NodeId,
    pub orig: Vec<u8>,
    pub step: usize,
}

///
/// A directive produced by the consumer negotiation loop: either an emission
/// to surface, a request to reset the current node and re-descend, an
/// instruction to move on (`ignore`), or a combination.
///
#[derive(Clone, Debug)]
struct Directive {
    consumed: Option<(NodeId, Vec<u8>)>,
    reset: bool,
    ignore: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum HelperState {
    Start,
    LoopTop,
    AfterLoopYield,
    AfterExhaustedYield,
    AfterFinalYield,
    Done,
    // A terminal directive was produced; resuming from here is a protocol
    // violation by the driver.
    Poisoned,
}

enum Next {
    Continue,
    Yield(Directive),
    Finish,
}

type ConsumedSet = Rc<RefCell<HashSet<NodeId>>>;

///
/// The negotiation loop for one node, as an explicitly resumable state
/// machine. One helper exists per Step-2 entry; the driver discards it
/// whenever a directive carries `reset` or `ignore`, and only resumes it
/// after surfacing a plain emission.
///
struct ConsumerHelper {
    node: NodeId,
    orig: Vec<u8>,
    budget: i64,
    not_recovered: bool,
    consume_called_again: bool,
    state: HelperState,
}

impl ConsumerHelper {
    fn new(graph: &mut NodeGraph, node: NodeId) -> ConsumerHelper {
        let orig = graph.to_bytes(node);
        ConsumerHelper {
            node,
            orig,
            budget: 0,
            not_recovered: false,
            consume_called_again: false,
            state: HelperState::Start,
        }
    }

    fn emission(&self) -> Option<(NodeId, Vec<u8>)> {
        Some((self.node, self.orig.clone()))
    }

    ///
    /// The outcome for a node the consumer is not (or no longer) interested
    /// in: a reset is requested iff the consumer wants one and the node is
    /// not exhausted; the node is always ignored afterwards.
    ///
    fn not_interested<C: Consumer>(
        &self,
        graph: &mut NodeGraph,
        consumer: &mut C,
    ) -> Directive {
        let reset = consumer.need_reset(graph, self.node);
        let exhausted = graph.is_exhausted(self.node);
        if reset && !exhausted {
            Directive {
                consumed: self.emission(),
                reset: true,
                ignore: true,
            }
        } else if reset && exhausted {
            Directive {
                consumed: None,
                reset: false,
                ignore: true,
            }
        } else {
            Directive {
                consumed: self.emission(),
                reset: false,
                ignore: true,
            }
        }
    }

    fn next<C: Consumer>(
        &mut self,
        graph: &mut NodeGraph,
        consumer: &mut C,
        consumed: &ConsumedSet,
        root: NodeId,
    ) -> Option<Directive> {
        loop {
            match self.state {
                HelperState::Poisoned => {
                    unreachable!(
                        "the consumer negotiation loop was resumed past a terminal directive: \
                         this is a protocol bug in the driver or the consumer"
                    );
                }
                HelperState::Done => return None,
                HelperState::AfterFinalYield => {
                    self.state = HelperState::Done;
                    return None;
                }
                HelperState::Start => {
                    let go_on = if consumer.interested_by(graph, root, self.node) {
                        if consumed.borrow().contains(&self.node) {
                            false
                        } else {
                            consumer.save_node(graph, self.node);
                            consumer.consume_node(graph, self.node)
                        }
                    } else {
                        false
                    };
                    if !go_on {
                        self.state = HelperState::Poisoned;
                        return Some(self.not_interested(graph, consumer));
                    }
                    consumed.borrow_mut().insert(self.node);
                    graph.freeze(self.node);
                    self.not_recovered = true;
                    self.budget = consumer.wait_for_exhaustion(graph, self.node);
                    self.state = HelperState::LoopTop;
                }
                HelperState::LoopTop => {
                    let reset = consumer.need_reset(graph, self.node);
                    let exhausted = graph.is_exhausted(self.node);
                    if reset && !exhausted {
                        self.state = HelperState::AfterLoopYield;
                        return Some(Directive {
                            consumed: self.emission(),
                            reset: true,
                            ignore: false,
                        });
                    } else if reset && exhausted {
                        self.state = HelperState::Poisoned;
                        return Some(Directive {
                            consumed: None,
                            reset: false,
                            ignore: true,
                        });
                    } else if exhausted {
                        self.state = HelperState::AfterExhaustedYield;
                        return Some(Directive {
                            consumed: self.emission(),
                            reset: false,
                            ignore: false,
                        });
                    } else {
                        self.state = HelperState::AfterLoopYield;
                        return Some(Directive {
                            consumed: self.emission(),
                            reset: false,
                            ignore: false,
                        });
                    }
                }
                HelperState::AfterExhaustedYield => {
                    if consumer.interested_by(graph, root, self.node) {
                        if consumer.still_interested_by(graph, self.node) {
                            // Chained variants: consume the same node again.
                            consumer.consume_node(graph, self.node);
                        } else {
                            consumer.recover_node(graph, self.node);
                            if consumer.policy().fix_constraints {
                                graph.fix_synchronized_nodes(self.node);
                            }
                            self.state = HelperState::Poisoned;
                            return Some(self.not_interested(graph, consumer));
                        }
                        self.consume_called_again = true;
                        graph.get_value(self.node);
                        self.not_recovered = true;
                    } else {
                        if consumed.borrow().contains(&self.node) {
                            consumer.recover_node(graph, self.node);
                            if consumer.policy().fix_constraints {
                                graph.fix_synchronized_nodes(self.node);
                            }
                            self.not_recovered = false;
                        }
                        self.state = HelperState::Done;
                        return None;
                    }
                    match self.bookkeeping(graph, consumer, consumed, root) {
                        Next::Continue => {}
                        Next::Yield(d) => return Some(d),
                        Next::Finish => return None,
                    }
                }
                HelperState::AfterLoopYield => {
                    match self.bookkeeping(graph, consumer, consumed, root) {
                        Next::Continue => {}
                        Next::Yield(d) => return Some(d),
                        Next::Finish => return None,
                    }
                }
            }
        }
    }

    ///
    /// The per-emission bookkeeping: spend the budget by stepping the node's
    /// own variant, or recover and (maybe) ask for one final reset.
    ///
    fn bookkeeping<C: Consumer>(
        &mut self,
        graph: &mut NodeGraph,
        consumer: &mut C,
        consumed: &ConsumedSet,
        root: NodeId,
    ) -> Next {
        if self.consume_called_again {
            self.consume_called_again = false;
            self.state = HelperState::LoopTop;
            return Next::Continue;
        }
        if self.budget != 0 {
            self.budget -= 1;
            // Iterate only on the current node.
            graph.unfreeze(self.node, UnfreezeOpts::shallow().ignore_entanglement());
            graph.freeze(self.node);
            if consumer.policy().fix_constraints {
                graph.fix_synchronized_nodes(self.node);
            }
            self.state = HelperState::LoopTop;
            return Next::Continue;
        }
        if self.not_recovered
            && (consumer.interested_by(graph, root, self.node)
                || consumed.borrow().contains(&self.node))
        {
            consumer.recover_node(graph, self.node);
            if consumer.policy().fix_constraints {
                graph.fix_synchronized_nodes(self.node);
            }
            if !graph.is_exhausted(self.node) && consumer.need_reset(graph, self.node) {
                self.state = HelperState::AfterFinalYield;
                return Next::Yield(Directive {
                    consumed: None,
                    reset: true,
                    ignore: true,
                });
            }
        }
        self.state = HelperState::Done;
        Next::Finish
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Stage {
    NodeStart,
    WhileTop,
    Step1Descend,
    Step2,
    Step2Poll,
    Step3,
    AfterStep3Child,
    WhileCheck,
}

///
/// One level of the depth-first traversal: a sibling list under a frozen
/// parent, the per-level negotiation flags, and this level's view of the
/// consumed-set (a structure change rebinds the local view without touching
/// outer levels).
///
struct Frame {
    nodes: Vec<NodeId>,
    idx: usize,
    parent: NodeId,
    structure_has_changed: bool,
    consumed: ConsumedSet,
    perform_second_step: bool,
    again: bool,
    helper: Option<ConsumerHelper>,
    pending_consumed: Option<ConsumedSet>,
    stage: Stage,
}

impl Frame {
    fn new(
        nodes: Vec<NodeId>,
        structure_has_changed: bool,
        consumed: ConsumedSet,
        parent: NodeId,
    ) -> Frame {
        Frame {
            nodes,
            idx: 0,
            parent,
            structure_has_changed,
            consumed,
            perform_second_step: true,
            again: true,
            helper: None,
            pending_consumed: None,
            stage: Stage::NodeStart,
        }
    }

    fn node(&self) -> NodeId {
        self.nodes[self.idx]
    }
}

///
/// Walks every state of a data-model tree, offering each node to the
/// consumer and surfacing one `Emission` per distinct serializable state of
/// the root.
///
/// The walk steps each node up to exhaustion before moving on, and the
/// change of a non-terminal only resets its direct surroundings, never the
/// indirect parents: resetting those too would be a combinatorial explosion
/// with limited interest.
///
pub struct ModelWalker<'a, C: Consumer> {
    graph: &'a mut NodeGraph,
    root: NodeId,
    consumer: C,
    max_steps: i64,
    initial_step: usize,
    cpt: usize,
    stack: Vec<Frame>,
    finished: bool,
    last_valid: Option<(NodeId, Vec<u8>)>,
    internals_criteria: NodeCriteria,
    triglast_criteria: NodeCriteria,
}

///
/// Binds a consumer to a root node and returns the lazy emission sequence.
///
pub fn walk<C: Consumer>(
    graph: &mut NodeGraph,
    root: NodeId,
    consumer: C,
    options: WalkOptions,
) -> ModelWalker<'_, C> {
    ModelWalker::new(graph, root, consumer, options)
}

impl<'a, C: Consumer> ModelWalker<'a, C> {
    pub fn new(
        graph: &'a mut NodeGraph,
        root: NodeId,
        consumer: C,
        options: WalkOptions,
    ) -> ModelWalker<'a, C> {
        assert!(
            options.max_steps > 0 || options.max_steps == -1,
            "invalid max_steps: {}",
            options.max_steps
        );
        assert!(
            options.initial_step >= 1,
            "initial_step is 1-based: {}",
            options.initial_step
        );

        graph.make_finite(root, true);
        if options.make_determinist {
            assert!(!options.make_random);
            graph.make_determinist(root, true);
        } else if options.make_random {
            graph.make_random(root, true);
        }
        graph.freeze(root);

        let consumed: ConsumedSet = Rc::new(RefCell::new(HashSet::default()));
        ModelWalker {
            graph,
            root,
            consumer,
            max_steps: options.max_steps,
            initial_step: options.initial_step,
            cpt: 1,
            stack: vec![Frame::new(vec![root], false, consumed, root)],
            finished: false,
            last_valid: None,
            internals_criteria: NodeCriteria::new()
                .mandatory_attrs(NodeAttrs::MUTABLE | NodeAttrs::FINITE),
            triglast_criteria: NodeCriteria::new().mandatory_custo(GenCusto::TRIGGER_LAST),
        }
    }

    pub fn model(&self) -> &NodeGraph {
        self.graph
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    pub fn consumer_mut(&mut self) -> &mut C {
        &mut self.consumer
    }

    ///
    /// Unfreezes the trigger-last generators (so they re-execute last), the
    /// node itself shallowly, and then its subtree without changing state.
    ///
    fn do_reset(&mut self, node: NodeId) {
        test_trace_log!("resetting {}", self.graph.node_name(node));
        let last_gen = self.graph.get_reachable_nodes(
            self.root,
            ReachOpts {
                internals_criteria: Some(&self.triglast_criteria),
                ..ReachOpts::default()
            },
        );
        for n in last_gen {
            self.graph
                .unfreeze(n, UnfreezeOpts::default().ignore_entanglement());
        }
        self.graph.unfreeze(node, UnfreezeOpts::shallow());
        self.graph.unfreeze(
            node,
            UnfreezeOpts::default()
                .dont_change_state()
                .ignore_entanglement(),
        );
        self.consumer.do_after_reset(self.graph, node);
    }

    /// Pops a completed frame and resumes its parent.
    fn pop_frame(&mut self) {
        self.stack.pop();
        if let Some(parent) = self.stack.last_mut() {
            match parent.stage {
                Stage::Step1Descend => parent.stage = Stage::Step2,
                Stage::AfterStep3Child => {
                    parent.consumed = parent
                        .pending_consumed
                        .take()
                        .expect("a pending consumed-set accompanies a sibling re-walk");
                    parent.stage = Stage::WhileCheck;
                }
                stage => unreachable!("a child frame returned to stage {stage:?}"),
            }
        }
    }

    ///
    /// Drives the frame stack until an emission bubbles up or the walk ends.
    /// Returns the raw `(consumed, orig)` pair, before global stepping.
    ///
    fn advance(&mut self) -> Option<(NodeId, Vec<u8>)> {
        loop {
            let Some(frame) = self.stack.last() else {
                return None;
            };
            match frame.stage {
                Stage::NodeStart => {
                    if frame.idx >= frame.nodes.len() {
                        self.pop_frame();
                        continue;
                    }
                    let frame = self.stack.last_mut().expect("frame was just observed");
                    frame.perform_second_step = true;
                    frame.again = true;
                    frame.stage = Stage::WhileTop;
                }
                Stage::WhileTop => {
                    let node = frame.node();
                    let structure_has_changed = frame.structure_has_changed;
                    let consumed = frame.consumed.clone();
                    {
                        let frame = self.stack.last_mut().expect("frame was just observed");
                        frame.again = false;
                    }
                    // Step 1: freeze before searching, otherwise we could
                    // catch nodes that won't exist in the output.
                    self.graph.freeze(node);
                    let fnodes = self.graph.get_reachable_nodes(
                        node,
                        ReachOpts {
                            internals_criteria: Some(&self.internals_criteria),
                            exclude_self: true,
                            respect_order: self.consumer.policy().respect_order,
                            relative_depth: Some(1),
                            ..ReachOpts::default()
                        },
                    );
                    let frame = self.stack.last_mut().expect("frame was just observed");
                    if fnodes.is_empty() {
                        frame.stage = Stage::Step2;
                    } else {
                        frame.stage = Stage::Step1Descend;
                        self.stack
                            .push(Frame::new(fnodes, structure_has_changed, consumed, node));
                    }
                }
                Stage::Step1Descend => {
                    unreachable!("Step1Descend is only reachable through pop_frame")
                }
                Stage::Step2 => {
                    let node = frame.node();
                    if frame.perform_second_step {
                        let helper = ConsumerHelper::new(self.graph, node);
                        let frame = self.stack.last_mut().expect("frame was just observed");
                        frame.helper = Some(helper);
                        frame.stage = Stage::Step2Poll;
                    } else if self.consumer.need_reset(self.graph, node) {
                        let again = !self.graph.is_exhausted(node);
                        self.do_reset(node);
                        let frame = self.stack.last_mut().expect("frame was just observed");
                        frame.again = again;
                        frame.stage = Stage::Step3;
                    } else {
                        let frame = self.stack.last_mut().expect("frame was just observed");
                        frame.again = false;
                        frame.stage = Stage::Step3;
                    }
                }
                Stage::Step2Poll => {
                    let node = frame.node();
                    let consumed = frame.consumed.clone();
                    let frame = self.stack.last_mut().expect("frame was just observed");
                    let directive = frame
                        .helper
                        .as_mut()
                        .expect("Step2Poll requires a live helper")
                        .next(self.graph, &mut self.consumer, &consumed, self.root);
                    match directive {
                        None => {
                            frame.helper = None;
                            frame.stage = Stage::Step3;
                        }
                        Some(d) if d.ignore && d.reset => {
                            frame.helper = None;
                            frame.perform_second_step = false;
                            frame.again = true;
                            frame.stage = Stage::Step3;
                            self.do_reset(node);
                        }
                        Some(d) if d.ignore => {
                            frame.helper = None;
                            frame.perform_second_step = false;
                            frame.again = false;
                            frame.stage = Stage::Step3;
                        }
                        Some(d) if d.reset => {
                            frame.helper = None;
                            frame.perform_second_step = true;
                            frame.again = true;
                            frame.stage = Stage::Step3;
                            self.do_reset(node);
                        }
                        Some(d) => {
                            // A plain emission: surface it and resume the
                            // helper on the next call.
                            frame.perform_second_step = true;
                            frame.again = false;
                            let (consumed_node, orig) =
                                d.consumed.expect("a plain emission carries its node");
                            return Some((consumed_node, orig));
                        }
                    }
                }
                Stage::Step3 => {
                    let node = frame.node();
                    let mut structure_has_changed = frame.structure_has_changed;
                    if self.graph.is_nonterm(node) {
                        structure_has_changed = self.graph.structure_will_change(node);
                    }
                    let reset_on_change = self.consumer.policy().need_reset_when_structure_change;
                    let frame = self.stack.last_mut().expect("frame was just observed");
                    if structure_has_changed && reset_on_change {
                        frame.structure_has_changed = false;
                        // Re-walk the earlier siblings with a cleared
                        // consumed-set: the context preceding the mutated
                        // structure must be reassessed.
                        let fresh: ConsumedSet = Rc::new(RefCell::new(HashSet::default()));
                        let prior: Vec<NodeId> = frame.nodes[..frame.idx].to_vec();
                        let parent = frame.parent;
                        frame.pending_consumed = Some(fresh.clone());
                        frame.stage = Stage::AfterStep3Child;
                        self.stack.push(Frame::new(prior, false, fresh, parent));
                    } else if structure_has_changed {
                        // Without a reset, simply allow previously consumed
                        // nodes to be offered again under the new structure.
                        frame.structure_has_changed = false;
                        frame.consumed = Rc::new(RefCell::new(HashSet::default()));
                        frame.stage = Stage::WhileCheck;
                    } else {
                        frame.structure_has_changed = structure_has_changed;
                        frame.stage = Stage::WhileCheck;
                    }
                }
                Stage::AfterStep3Child => {
                    unreachable!("AfterStep3Child is only reachable through pop_frame")
                }
                Stage::WhileCheck => {
                    let frame = self.stack.last_mut().expect("frame was just observed");
                    if frame.again {
                        frame.stage = Stage::WhileTop;
                    } else {
                        frame.idx += 1;
                        frame.stage = Stage::NodeStart;
                    }
                }
            }
        }
    }
}

impl<'a, C: Consumer> Iterator for ModelWalker<'a, C> {
    type Item = Emission;

    fn next(&mut self) -> Option<Emission> {
        loop {
            if self.finished {
                return None;
            }
            match self.advance() {
                Some((consumed_node, orig)) => {
                    self.graph.freeze(self.root);
                    if self.cpt < self.initial_step {
                        // Fast-forward: discard, but remember for the
                        // overshoot fallback.
                        self.last_valid = Some((consumed_node, orig));
                        self.cpt += 1;
                        continue;
                    }
                    if self.graph.get_path_from(consumed_node, self.root).is_none() {
                        // The consumed node is not part of the frozen root
                        // (existence conditions can hide it): nothing of this
                        // case is visible, so skip it silently.
                        test_trace_log!(
                            "skipping emission: {} is unreachable from the frozen root",
                            self.graph.node_name(consumed_node)
                        );
                        continue;
                    }
                    self.last_valid = Some((consumed_node, orig.clone()));
                    let step = self.cpt;
                    if self.max_steps != -1
                        && self.cpt >= (self.max_steps as usize + self.initial_step - 1)
                    {
                        self.finished = true;
                    }
                    self.cpt += 1;
                    return Some(Emission {
                        consumed: consumed_node,
                        orig,
                        step,
                    });
                }
                None => {
                    self.finished = true;
                    if self.cpt <= self.initial_step && self.cpt > 1 {
                        log::warn!(
                            "initial step index ({}) is after the last index ({})",
                            self.initial_step,
                            self.cpt - 1
                        );
                        self.initial_step = 1;
                        if let Some((consumed_node, orig)) = self.last_valid.take() {
                            if self.graph.get_path_from(consumed_node, self.root).is_some() {
                                return Some(Emission {
                                    consumed: consumed_node,
                                    orig,
                                    step: self.cpt - 1,
                                });
                            }
                        }
                    }
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
