// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use fnv::FnvHashMap as HashMap;

use crate::value_types::ValueType;
use crate::NodeId;

bitflags! {
    ///
    /// Per-configuration node attributes. A fresh node is `MUTABLE | FREEZABLE`.
    ///
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct NodeAttrs: u16 {
        const MUTABLE = 1 << 0;
        const FINITE = 1 << 1;
        const DETERMINIST = 1 << 2;
        const SEPARATOR = 1 << 3;
        const FREEZABLE = 1 << 4;
        const LOCKED = 1 << 5;
    }
}

impl Default for NodeAttrs {
    fn default() -> NodeAttrs {
        NodeAttrs::MUTABLE | NodeAttrs::FREEZABLE
    }
}

bitflags! {
    ///
    /// Generator-function customizations.
    ///
    /// `TRIGGER_LAST` marks a generator whose freeze must be re-triggered after
    /// every other node in its scope has settled (checksums, lengths).
    ///
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct GenCusto: u8 {
        const TRIGGER_LAST = 1 << 0;
    }
}

///
/// The three content kinds a node can have. Criteria select over sets of these.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NodeKind {
    TypedValue,
    GenFunc,
    NonTerm,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct NodeKindSet: u8 {
        const TYPED_VALUE = 1 << 0;
        const GEN_FUNC = 1 << 1;
        const NON_TERM = 1 << 2;
    }
}

impl NodeKindSet {
    pub fn contains_kind(self, kind: NodeKind) -> bool {
        match kind {
            NodeKind::TypedValue => self.contains(NodeKindSet::TYPED_VALUE),
            NodeKind::GenFunc => self.contains(NodeKindSet::GEN_FUNC),
            NodeKind::NonTerm => self.contains(NodeKindSet::NON_TERM),
        }
    }
}

///
/// A terminal typed value: a value type plus its frozen byte image, if any.
///
#[derive(Clone, Debug)]
pub struct TypedContent {
    pub vt: Box<dyn ValueType>,
    pub frozen: Option<Vec<u8>>,
}

impl TypedContent {
    pub fn new(vt: Box<dyn ValueType>) -> TypedContent {
        TypedContent { vt, frozen: None }
    }
}

///
/// Produces the value type of a generated node from the frozen bytes of the
/// generator's argument nodes.
///
pub trait Generator: fmt::Debug {
    fn generate(&self, args: &[Vec<u8>]) -> Box<dyn ValueType>;
}

///
/// A generator-function node. The generated content is an inline typed value,
/// re-derived at freeze time; reachability queries do not descend into it.
///
#[derive(Clone, Debug)]
pub struct GenFuncContent {
    pub generator: Arc<dyn Generator>,
    pub args: Vec<NodeId>,
    pub generated: Option<TypedContent>,
}

///
/// One subnode slot of a non-terminal shape. `qty` bounds how many instances
/// of the subnode a frozen arrangement may hold; `default_qty` is the count
/// used when no quantity variant is being explored.
///
#[derive(Clone, Debug)]
pub struct SubnodeSpec {
    pub node: NodeId,
    pub qty: (usize, usize),
    pub default_qty: usize,
}

impl SubnodeSpec {
    pub fn one(node: NodeId) -> SubnodeSpec {
        SubnodeSpec {
            node,
            qty: (1, 1),
            default_qty: 1,
        }
    }

    pub fn repeated(node: NodeId, min: usize, max: usize, default: usize) -> SubnodeSpec {
        debug_assert!(min <= default && default <= max);
        SubnodeSpec {
            node,
            qty: (min, max),
            default_qty: default,
        }
    }
}

///
/// A weighted alternative for a non-terminal's children. Shapes are explored
/// in descending weight order; `ordered` releases the children-ordering
/// constraint, adding the rotations of the subnode order to the enumeration.
///
#[derive(Clone, Debug)]
pub struct Shape {
    pub weight: u32,
    pub ordered: bool,
    pub subnodes: Vec<SubnodeSpec>,
}

impl Shape {
    pub fn new(weight: u32, subnodes: Vec<SubnodeSpec>) -> Shape {
        Shape {
            weight,
            ordered: true,
            subnodes,
        }
    }
}

///
/// One concrete structural choice of a non-terminal: a shape, at most one
/// quantity override, and a rotation of the subnode order (unordered shapes
/// only).
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Arrangement {
    pub shape: usize,
    pub qty_override: Option<(usize, usize)>,
    pub rotation: usize,
}

///
/// Enumerates the finite arrangement list for a shape set: for each shape, the
/// default quantities first, then one variant per ranged spec at its `min` and
/// `max` bounds (de-duplicated against the default), then the rotations when
/// the shape is unordered. The walk over a finite root terminates because this
/// list does.
///
pub fn arrangements(shapes: &[Shape]) -> Vec<Arrangement> {
    let mut out = Vec::new();
    for (si, shape) in shapes.iter().enumerate() {
        out.push(Arrangement {
            shape: si,
            qty_override: None,
            rotation: 0,
        });
        for (pi, spec) in shape.subnodes.iter().enumerate() {
            for qty in [spec.qty.0, spec.qty.1] {
                if qty != spec.default_qty
                    && !out.contains(&Arrangement {
                        shape: si,
                        qty_override: Some((pi, qty)),
                        rotation: 0,
                    })
                {
                    out.push(Arrangement {
                        shape: si,
                        qty_override: Some((pi, qty)),
                        rotation: 0,
                    });
                }
            }
        }
        if !shape.ordered && shape.subnodes.len() > 1 {
            for rotation in 1..shape.subnodes.len() {
                out.push(Arrangement {
                    shape: si,
                    qty_override: None,
                    rotation,
                });
            }
        }
    }
    out
}

///
/// A structural (non-terminal) node: weighted shapes, an enumeration cursor
/// over the arrangement list, and the materialized child instances.
///
/// Instance materialization is stable: the template subnode is instance 0, and
/// extra instances are cloned once on first use and reused across freezes, so
/// node identity survives re-freezing (the consumed-set depends on that).
///
#[derive(Clone, Debug, Default)]
pub struct NonTermContent {
    pub shapes: Vec<Shape>,
    pub cursor: usize,
    pub last_frozen: Option<usize>,
    pub frozen: bool,
    pub active: Vec<NodeId>,
    pub instances: HashMap<(usize, usize), Vec<NodeId>>,
    pub order: Option<Vec<usize>>,
}

impl NonTermContent {
    ///
    /// Shapes are stored in descending weight order (stable), which is also
    /// their exploration order.
    ///
    pub fn new(mut shapes: Vec<Shape>) -> NonTermContent {
        shapes.sort_by_key(|s| std::cmp::Reverse(s.weight));
        NonTermContent {
            shapes,
            ..NonTermContent::default()
        }
    }

    pub fn arrangement_count(&self) -> usize {
        arrangements(&self.shapes).len()
    }

    /// The arrangement the next freeze will materialize.
    pub fn current_arrangement_index(&self) -> usize {
        match &self.order {
            Some(order) => order[self.cursor],
            None => self.cursor,
        }
    }

    pub fn advance(&mut self) {
        let count = self.arrangement_count();
        if count > 1 {
            self.cursor = (self.cursor + 1) % count;
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor + 1 >= self.arrangement_count()
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }
}

///
/// The tagged variant of node contents.
///
#[derive(Clone, Debug)]
pub enum NodeContent {
    Typed(TypedContent),
    GenFunc(GenFuncContent),
    NonTerm(NonTermContent),
}

impl NodeContent {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeContent::Typed(_) => NodeKind::TypedValue,
            NodeContent::GenFunc(_) => NodeKind::GenFunc,
            NodeContent::NonTerm(_) => NodeKind::NonTerm,
        }
    }
}

///
/// One named configuration of a node: attributes, customizations, content.
///
#[derive(Clone, Debug)]
pub struct NodeInternals {
    pub attrs: NodeAttrs,
    pub custo: GenCusto,
    pub content: NodeContent,
}

impl NodeInternals {
    pub fn new(content: NodeContent) -> NodeInternals {
        NodeInternals {
            attrs: NodeAttrs::default(),
            custo: GenCusto::default(),
            content,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.content.kind()
    }
}
