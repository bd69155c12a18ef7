// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use crate::{
    Generator, Int, NodeAttrs, NodeCriteria, NodeGraph, NodeId, NodeKindSet, ReachOpts, Shape,
    Str, SubnodeSpec, UnfreezeOpts, ValueType,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn leaf(graph: &mut NodeGraph, name: &str, values: &[i64]) -> NodeId {
    graph.add_typed(name, Box::new(Int::uint8().with_values(values)))
}

///
/// A row of three one-byte leaves under a single shape.
///
fn small_tree(graph: &mut NodeGraph) -> (NodeId, NodeId, NodeId, NodeId) {
    let a = leaf(graph, "a", &[1, 2]);
    let b = leaf(graph, "b", &[3]);
    let c = leaf(graph, "c", &[4, 5, 6]);
    let root = graph.add_nonterm(
        "root",
        vec![Shape::new(
            1,
            vec![
                SubnodeSpec::one(a),
                SubnodeSpec::one(b),
                SubnodeSpec::one(c),
            ],
        )],
    );
    (root, a, b, c)
}

#[test]
fn freeze_serializes_first_variants() {
    init_logging();
    let mut graph = NodeGraph::new();
    let (root, ..) = small_tree(&mut graph);
    assert_eq!(graph.to_bytes(root), vec![1, 3, 4]);
    // Freezing again does not re-derive.
    assert_eq!(graph.to_bytes(root), vec![1, 3, 4]);
}

#[test]
fn shallow_unfreeze_advances_one_node_only() {
    let mut graph = NodeGraph::new();
    let (root, a, ..) = small_tree(&mut graph);
    graph.freeze(root);
    graph.unfreeze(a, UnfreezeOpts::shallow().ignore_entanglement());
    assert_eq!(graph.to_bytes(root), vec![2, 3, 4]);
}

#[test]
fn state_preserving_unfreeze_re_derives_the_same_variant() {
    let mut graph = NodeGraph::new();
    let (root, a, ..) = small_tree(&mut graph);
    graph.freeze(root);
    graph.unfreeze(a, UnfreezeOpts::shallow().ignore_entanglement());
    graph.freeze(a);
    graph.unfreeze(
        a,
        UnfreezeOpts::shallow().dont_change_state().ignore_entanglement(),
    );
    assert_eq!(graph.to_bytes(root), vec![2, 3, 4]);
}

#[test]
fn exhaustion_tracks_the_last_variant() {
    let mut graph = NodeGraph::new();
    let (root, a, b, _) = small_tree(&mut graph);
    graph.freeze(root);
    // A single-variant node is exhausted from its first freeze.
    assert!(graph.is_exhausted(b));
    assert!(!graph.is_exhausted(a));
    graph.unfreeze(a, UnfreezeOpts::shallow().ignore_entanglement());
    graph.freeze(a);
    assert!(graph.is_exhausted(a));
}

#[test]
fn reset_state_rewinds() {
    let mut graph = NodeGraph::new();
    let (root, a, ..) = small_tree(&mut graph);
    graph.freeze(root);
    graph.unfreeze(a, UnfreezeOpts::shallow().ignore_entanglement());
    graph.freeze(a);
    graph.reset_state(a, false);
    assert_eq!(graph.to_bytes(root), vec![1, 3, 4]);
}

#[test]
fn entangled_peers_unfreeze_together_unless_suppressed() {
    let mut graph = NodeGraph::new();
    let (root, a, _, c) = small_tree(&mut graph);
    graph.entangle(&[a, c]);
    graph.freeze(root);

    graph.unfreeze(a, UnfreezeOpts::shallow());
    assert_eq!(graph.to_bytes(root), vec![2, 3, 5]);

    graph.unfreeze(a, UnfreezeOpts::shallow().ignore_entanglement());
    assert_eq!(graph.to_bytes(root), vec![1, 3, 5]);
}

#[test]
fn arrangement_enumeration_covers_shapes_and_quantity_bounds() {
    init_logging();
    let mut graph = NodeGraph::new();
    let x = leaf(&mut graph, "x", &[7]);
    let y = leaf(&mut graph, "y", &[9]);
    let root = graph.add_nonterm(
        "root",
        vec![
            Shape::new(10, vec![SubnodeSpec::repeated(x, 2, 4, 2)]),
            Shape::new(5, vec![SubnodeSpec::one(y)]),
        ],
    );

    // Shape 0 default, shape 0 at qty 4, then shape 1.
    assert_eq!(graph.to_bytes(root), vec![7, 7]);
    assert!(!graph.is_exhausted(root));

    graph.unfreeze(root, UnfreezeOpts::shallow());
    assert_eq!(graph.to_bytes(root), vec![7, 7, 7, 7]);

    graph.unfreeze(root, UnfreezeOpts::shallow());
    assert_eq!(graph.to_bytes(root), vec![9]);
    assert!(graph.is_exhausted(root));
}

#[test]
fn repeated_instances_keep_stable_identity() {
    let mut graph = NodeGraph::new();
    let x = leaf(&mut graph, "x", &[7]);
    let root = graph.add_nonterm("root", vec![Shape::new(1, vec![SubnodeSpec::repeated(x, 1, 3, 3)])]);
    graph.freeze(root);
    let first = graph.frozen_children(root);
    assert_eq!(first.len(), 3);
    graph.unfreeze(root, UnfreezeOpts::shallow().dont_change_state());
    graph.freeze(root);
    assert_eq!(graph.frozen_children(root), first);
}

#[test]
fn structure_will_change_signals_pending_arrangement_moves() {
    let mut graph = NodeGraph::new();
    let x = leaf(&mut graph, "x", &[7]);
    let y = leaf(&mut graph, "y", &[9]);
    let root = graph.add_nonterm(
        "root",
        vec![
            Shape::new(2, vec![SubnodeSpec::one(x)]),
            Shape::new(1, vec![SubnodeSpec::one(y)]),
        ],
    );
    graph.freeze(root);
    assert!(!graph.structure_will_change(root));
    graph.unfreeze(root, UnfreezeOpts::shallow());
    assert!(graph.structure_will_change(root));
    graph.freeze(root);
    assert!(!graph.structure_will_change(root));
}

#[test]
fn reachable_nodes_at_depth_one_are_the_direct_frontier() {
    let mut graph = NodeGraph::new();
    let (root, a, b, c) = small_tree(&mut graph);
    let criteria =
        NodeCriteria::new().mandatory_attrs(NodeAttrs::MUTABLE);
    let frontier = graph.get_reachable_nodes(
        root,
        ReachOpts {
            internals_criteria: Some(&criteria),
            exclude_self: true,
            respect_order: true,
            relative_depth: Some(1),
            ..ReachOpts::default()
        },
    );
    assert_eq!(frontier, vec![a, b, c]);
}

#[test]
fn criteria_filter_by_kind_and_attrs() {
    let mut graph = NodeGraph::new();
    let (root, a, ..) = small_tree(&mut graph);
    graph.clear_attr(a, NodeAttrs::MUTABLE);
    let criteria = NodeCriteria::new()
        .mandatory_attrs(NodeAttrs::MUTABLE)
        .node_kinds(NodeKindSet::TYPED_VALUE);
    let found = graph.get_reachable_nodes(
        root,
        ReachOpts {
            internals_criteria: Some(&criteria),
            exclude_self: true,
            respect_order: true,
            relative_depth: None,
            ..ReachOpts::default()
        },
    );
    assert_eq!(found.len(), 2);
    assert!(!found.contains(&a));
}

#[test]
fn paths_resolve_only_through_the_frozen_structure() {
    let mut graph = NodeGraph::new();
    let x = leaf(&mut graph, "x", &[7]);
    let y = leaf(&mut graph, "y", &[9]);
    let root = graph.add_nonterm(
        "root",
        vec![
            Shape::new(2, vec![SubnodeSpec::one(x)]),
            Shape::new(1, vec![SubnodeSpec::one(y)]),
        ],
    );
    graph.freeze(root);
    assert_eq!(graph.get_path_from(x, root), Some("root/x".to_owned()));
    // y is hidden by the current structural choice.
    assert_eq!(graph.get_path_from(y, root), None);
}

#[test]
fn backup_restores_internals_and_configuration() {
    let mut graph = NodeGraph::new();
    let (root, a, ..) = small_tree(&mut graph);
    graph.freeze(root);
    let backup = graph.get_internals_backup(a);
    graph.set_values(a, Box::new(Int::uint8().with_values(&[0xAA])));
    graph.unfreeze(a, UnfreezeOpts::shallow().ignore_entanglement());
    assert_eq!(graph.to_bytes(a), vec![0xAA]);
    graph.set_internals(a, backup);
    assert_eq!(graph.to_bytes(a), vec![1]);
}

#[test]
fn ordering_relaxation_adds_rotations() {
    let mut graph = NodeGraph::new();
    let (root, ..) = small_tree(&mut graph);
    assert_eq!(graph.to_bytes(root), vec![1, 3, 4]);
    graph.change_subnodes_csts(root);
    assert_eq!(graph.to_bytes(root), vec![1, 3, 4]);
    graph.unfreeze(root, UnfreezeOpts::shallow());
    assert_eq!(graph.to_bytes(root), vec![3, 4, 1]);
}

#[test]
fn generators_rerun_after_synchronized_fix() {
    #[derive(Debug)]
    struct SumGen;
    impl Generator for SumGen {
        fn generate(&self, args: &[Vec<u8>]) -> Box<dyn ValueType> {
            let sum: i64 = args
                .iter()
                .flat_map(|bytes| bytes.iter())
                .map(|&b| i64::from(b))
                .sum();
            Box::new(Int::uint8().with_values(&[sum]))
        }
    }

    let mut graph = NodeGraph::new();
    let a = leaf(&mut graph, "a", &[1, 2]);
    let sum = graph.add_genfunc("sum", Arc::new(SumGen), vec![a]);
    let root = graph.add_nonterm(
        "root",
        vec![Shape::new(1, vec![SubnodeSpec::one(a), SubnodeSpec::one(sum)])],
    );
    assert_eq!(graph.to_bytes(root), vec![1, 1]);

    graph.unfreeze(a, UnfreezeOpts::shallow().ignore_entanglement());
    graph.freeze(a);
    // The generator still holds the stale image until it is re-armed.
    graph.fix_synchronized_nodes(a);
    assert_eq!(graph.to_bytes(root), vec![2, 2]);
}

#[test]
fn int_encoding_wraps_two_complement() {
    let vt = Int::uint8();
    assert_eq!(vt.encode(-1), vec![0xFF]);
    assert_eq!(vt.encode(255), vec![0xFF]);
    assert_eq!(Int::uint32_be().encode(13), vec![0, 0, 0, 13]);
    assert_eq!(Int::uint32_le().encode(13), vec![13, 0, 0, 0]);
    assert!(vt.is_compatible(-1));
    assert!(vt.is_compatible(255));
    assert!(!vt.is_compatible(256));
}

#[test]
fn str_fuzz_mode_clone_seeds_from_the_current_value() {
    let vt = Str::new(["sep"]);
    let mut fuzzed = vt.fuzz_mode_clone(1.0).unwrap();
    let mut seen = Vec::new();
    loop {
        seen.push(fuzzed.current_bytes());
        if fuzzed.is_exhausted() {
            break;
        }
        fuzzed.advance();
    }
    assert!(seen.contains(&Vec::new()));
    assert!(seen.contains(&b"sep\x00".to_vec()));
    assert!(seen.iter().any(|v| v.len() > 64));
}
