// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use data_model::{
    Int, NodeAttrs, NodeContent, NodeGraph, NodeId, NodeInternals, Shape, Str, SubnodeSpec,
    TypedContent,
};
use testutil::{png_model, png_seed_bytes, PNG_SIG};

use crate::{
    fuzz_data_tree, walk, AltConfConsumer, BasicVisitor, Consumer, Emission, NonTermVisitor,
    SeparatorDisruption, TypedNodeDisruption, WalkOptions,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

///
/// Runs a walk to completion, pairing each emission with the frozen root
/// image at yield time.
///
fn collect<C: Consumer>(
    graph: &mut NodeGraph,
    root: NodeId,
    consumer: C,
    options: WalkOptions,
) -> Vec<(Emission, Vec<u8>)> {
    let mut walker = walk(graph, root, consumer, options);
    let mut out = Vec::new();
    // A `for` loop would hold the walker borrowed for the whole iteration,
    // but the model must be readable between yields.
    #[allow(clippy::while_let_on_iterator)]
    while let Some(emission) = walker.next() {
        let image = walker
            .model()
            .frozen_bytes(walker.root())
            .expect("the root is freshly frozen at every yield");
        out.push((emission, image));
    }
    out
}

fn leaf(graph: &mut NodeGraph, name: &str, values: &[i64]) -> NodeId {
    graph.add_typed(name, Box::new(Int::uint8().with_values(values)))
}

/// `root = [a: {1,2}, b: {3}, c: {4,5,6}]`.
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
fn basic_visitor_emits_the_seed_first_and_every_leaf_variant() {
    init_logging();
    let mut graph = NodeGraph::new();
    let (root, a, b, c) = small_tree(&mut graph);

    let emissions = collect(&mut graph, root, BasicVisitor::new(), WalkOptions::default());

    let images: Vec<Vec<u8>> = emissions.iter().map(|(_, image)| image.clone()).collect();
    assert_eq!(
        images,
        vec![
            // a as-is, then stepped.
            vec![1, 3, 4],
            vec![2, 3, 4],
            // b has a single variant.
            vec![1, 3, 4],
            // c is pre-stepped: its as-is value appeared above.
            vec![1, 3, 5],
            vec![1, 3, 6],
        ]
    );
    let consumed: Vec<NodeId> = emissions.iter().map(|(e, _)| e.consumed).collect();
    assert_eq!(consumed, vec![a, a, b, c, c]);
    // Steps are 1-based and contiguous.
    let steps: Vec<usize> = emissions.iter().map(|(e, _)| e.step).collect();
    assert_eq!(steps, vec![1, 2, 3, 4, 5]);

    // All mutations were rolled back.
    assert_eq!(graph.to_bytes(root), vec![1, 3, 4]);
}

#[test]
fn walk_is_deterministic_across_runs() {
    let run = || {
        let mut graph = NodeGraph::new();
        let (root, ..) = small_tree(&mut graph);
        collect(
            &mut graph,
            root,
            BasicVisitor::new(),
            WalkOptions {
                make_determinist: true,
                ..WalkOptions::default()
            },
        )
    };
    let first: Vec<Vec<u8>> = run().into_iter().map(|(_, image)| image).collect();
    let second: Vec<Vec<u8>> = run().into_iter().map(|(_, image)| image).collect();
    assert_eq!(first, second);
}

#[test]
fn max_steps_caps_the_emission_count() {
    let mut graph = NodeGraph::new();
    let (root, ..) = small_tree(&mut graph);
    let emissions = collect(
        &mut graph,
        root,
        BasicVisitor::new(),
        WalkOptions {
            max_steps: 2,
            ..WalkOptions::default()
        },
    );
    assert_eq!(emissions.len(), 2);
    assert_eq!(emissions[1].0.step, 2);
}

#[test]
fn fast_forward_discards_but_preserves_the_sequence() {
    let full = {
        let mut graph = NodeGraph::new();
        let (root, ..) = small_tree(&mut graph);
        collect(&mut graph, root, BasicVisitor::new(), WalkOptions::default())
    };
    let resumed = {
        let mut graph = NodeGraph::new();
        let (root, ..) = small_tree(&mut graph);
        collect(
            &mut graph,
            root,
            BasicVisitor::new(),
            WalkOptions {
                initial_step: 3,
                ..WalkOptions::default()
            },
        )
    };
    assert_eq!(resumed.len(), full.len() - 2);
    for (skipped, kept) in full[2..].iter().zip(resumed.iter()) {
        assert_eq!(skipped.0.step, kept.0.step);
        assert_eq!(skipped.1, kept.1);
    }
}

#[test]
fn initial_step_overshoot_replays_the_last_valid_emission() {
    init_logging();
    let mut graph = NodeGraph::new();
    let (root, _, _, c) = small_tree(&mut graph);
    let emissions = collect(
        &mut graph,
        root,
        BasicVisitor::new(),
        WalkOptions {
            initial_step: 100,
            ..WalkOptions::default()
        },
    );
    assert_eq!(emissions.len(), 1);
    assert_eq!(emissions[0].0.consumed, c);
    assert_eq!(emissions[0].0.orig, vec![4]);
    assert_eq!(emissions[0].0.step, 5);
}

#[test]
fn png_basic_visitor_emits_the_seed_then_each_leaf() {
    init_logging();
    let mut graph = NodeGraph::new();
    let model = png_model(&mut graph);
    let seed = png_seed_bytes();
    assert_eq!(graph.to_bytes(model.root), seed);

    let emissions = collect(&mut graph, model.root, BasicVisitor::new(), WalkOptions::default());

    // Termination, and the seed comes out first.
    assert!(!emissions.is_empty() && emissions.len() < 10_000);
    assert_eq!(emissions[0].1, seed);
    assert_eq!(emissions[0].0.consumed, model.sig);

    // Each IHDR leaf is consumed at least once; the single-variant ones emit
    // with every other leaf still matching the seed.
    for &leaf in &model.ihdr_leaves {
        let first = emissions
            .iter()
            .find(|(e, _)| e.consumed == leaf)
            .unwrap_or_else(|| panic!("leaf {} was never consumed", graph.node_name(leaf)));
        if graph.node_name(leaf) == "interlace_method" {
            // Pre-stepped to its second variant: one byte moved.
            assert_eq!(first.1.len(), seed.len());
        } else {
            assert_eq!(first.1, seed);
        }
    }

    // Round-trip of recovery.
    assert_eq!(graph.to_bytes(model.root), seed);
}

#[test]
fn png_nonterm_visitor_covers_the_structural_shapes() {
    init_logging();
    let mut graph = NodeGraph::new();
    let model = png_model(&mut graph);
    let seed_len = png_seed_bytes().len();

    let emissions = collect(&mut graph, model.root, NonTermVisitor::new(), WalkOptions::default());

    assert!(!emissions.is_empty());
    // Every structural emission still re-encodes the signature prefix.
    for (_, image) in &emissions {
        assert_eq!(&image[..8], PNG_SIG);
    }
    // Both quantity bounds of the chunks collection appear: the seed-sized
    // two-chunk form and the 200-chunk form.
    assert!(emissions.iter().any(|(_, image)| image.len() == seed_len));
    assert!(emissions
        .iter()
        .any(|(_, image)| image.len() > seed_len * 50));
}

#[test]
fn typed_disruption_enumerates_the_neighbor_catalogue() {
    init_logging();
    let mut graph = NodeGraph::new();
    let val = leaf(&mut graph, "val", &[1, 2, 4, 8, 16]);
    let root = graph.add_nonterm("root", vec![Shape::new(1, vec![SubnodeSpec::one(val)])]);

    let emissions = collect(
        &mut graph,
        root,
        TypedNodeDisruption::new(),
        WalkOptions::default(),
    );

    let images: Vec<u8> = emissions.iter().map(|(_, image)| image[0]).collect();
    // The boundary catalogue of the width, then the neighbors of the
    // enumerated set, with the current value removed.
    assert_eq!(images, vec![255, 0, 128, 127, 3, 5, 9, 7, 17, 15]);
    for (emission, image) in &emissions {
        assert_eq!(emission.orig, vec![1]);
        // Everything decodes outside the enumerated set.
        assert!(![1_u8, 2, 4, 8, 16].contains(&image[0]));
    }

    // The original internals were restored.
    assert_eq!(graph.to_bytes(root), vec![1]);
}

#[test]
fn typed_disruption_covers_constrained_range_bounds_and_specifics() {
    init_logging();
    let mut graph = NodeGraph::new();
    let val = graph.add_typed(
        "val",
        Box::new(Int::uint8().with_range(10, 20).with_specifics(&[77])),
    );
    let root = graph.add_nonterm("root", vec![Shape::new(1, vec![SubnodeSpec::one(val)])]);

    let emissions = collect(
        &mut graph,
        root,
        TypedNodeDisruption::new(),
        WalkOptions::default(),
    );

    let images: Vec<u8> = emissions.iter().map(|(_, image)| image[0]).collect();
    // Boundary catalogue, the current value's neighbors, the constrained
    // range's outside neighbors, then the type-declared fuzzy value.
    assert_eq!(images, vec![255, 0, 1, 128, 127, 11, 9, 21, 77]);
}

#[test]
fn separator_disruption_substitutes_in_insertion_order() {
    init_logging();
    let mut graph = NodeGraph::new();
    let left = graph.add_typed("left", Box::new(Str::new(["x"])));
    let sep = graph.add_typed("sep", Box::new(Str::new(["\n"])));
    graph.set_attr(sep, NodeAttrs::SEPARATOR);
    let right = graph.add_typed("right", Box::new(Str::new(["y"])));
    let root = graph.add_nonterm(
        "root",
        vec![Shape::new(
            1,
            vec![
                SubnodeSpec::one(left),
                SubnodeSpec::one(sep),
                SubnodeSpec::one(right),
            ],
        )],
    );

    let emissions = collect(
        &mut graph,
        root,
        SeparatorDisruption::new(&[b"\n", b" "]),
        WalkOptions::default(),
    );

    let images: Vec<Vec<u8>> = emissions.iter().map(|(_, image)| image.clone()).collect();
    assert_eq!(images, vec![b"xy".to_vec(), b"x y".to_vec()]);
    for (emission, _) in &emissions {
        assert_eq!(emission.consumed, sep);
        assert_eq!(emission.orig, b"\n".to_vec());
    }
    // The separator attribute and value survived recovery.
    assert!(graph.is_attr_set(sep, NodeAttrs::SEPARATOR));
    assert_eq!(graph.to_bytes(root), b"x\ny".to_vec());
}

#[test]
fn alt_conf_consumer_cycles_the_owned_configurations() {
    init_logging();
    let mut graph = NodeGraph::new();
    let node = graph.add_typed("node", Box::new(Str::new(["main-value"])));
    graph.add_conf(
        node,
        "ALT2",
        NodeInternals::new(NodeContent::Typed(TypedContent::new(Box::new(Str::new([
            "alt2-value",
        ]))))),
    );
    let root = graph.add_nonterm("top", vec![Shape::new(1, vec![SubnodeSpec::one(node)])]);

    let emissions = collect(
        &mut graph,
        root,
        AltConfConsumer::new(&["MAIN", "ALT1", "ALT2"]),
        WalkOptions::default(),
    );

    // Two chained emissions for the node: MAIN then ALT2 (ALT1 is not
    // exposed and is skipped).
    let node_emissions: Vec<&[u8]> = emissions
        .iter()
        .filter(|(e, _)| e.consumed == node)
        .map(|(_, image)| image.as_slice())
        .collect();
    assert_eq!(
        node_emissions,
        vec![b"main-value".as_slice(), b"alt2-value".as_slice()]
    );
    // After recovery the configuration equals the original.
    assert_eq!(graph.get_current_conf(node), "MAIN");
    assert_eq!(graph.to_bytes(root), b"main-value".to_vec());
}

#[test]
fn structure_change_re_walks_earlier_siblings_with_a_cleared_set() {
    init_logging();
    let mut graph = NodeGraph::new();
    let a1 = graph.add_typed("a1", Box::new(Str::new(["a"])));
    let sibling_a = graph.add_nonterm("A", vec![Shape::new(1, vec![SubnodeSpec::one(a1)])]);
    let b1 = graph.add_typed("b1", Box::new(Str::new(["b1"])));
    let b2 = graph.add_typed("b2", Box::new(Str::new(["b2"])));
    let sibling_b = graph.add_nonterm(
        "B",
        vec![
            Shape::new(2, vec![SubnodeSpec::one(b1)]),
            Shape::new(1, vec![SubnodeSpec::one(b2)]),
        ],
    );
    let root = graph.add_nonterm(
        "root",
        vec![Shape::new(
            1,
            vec![SubnodeSpec::one(sibling_a), SubnodeSpec::one(sibling_b)],
        )],
    );

    let emissions = collect(&mut graph, root, NonTermVisitor::new(), WalkOptions::default());

    // Mutating B's structure re-walks A with a cleared consumed-set: A is
    // consumed a second time, and that emission already shows B's alternate
    // shape in the re-frozen root.
    let consumed: Vec<NodeId> = emissions.iter().map(|(e, _)| e.consumed).collect();
    assert_eq!(consumed, vec![sibling_a, sibling_a]);
    assert_eq!(emissions[0].1, b"ab1".to_vec());
    assert_eq!(emissions[1].1, b"ab2".to_vec());
}

#[test]
fn fuzz_data_tree_relaxes_ordering_constraints() {
    init_logging();
    let mut graph = NodeGraph::new();
    let (root, ..) = small_tree(&mut graph);
    fuzz_data_tree(&mut graph, root, None);

    let emissions = collect(&mut graph, root, NonTermVisitor::new(), WalkOptions::default());

    let images: Vec<Vec<u8>> = emissions.iter().map(|(_, image)| image.clone()).collect();
    assert_eq!(
        images,
        vec![
            vec![1, 3, 4],
            // The relaxed ordering exposes the rotations.
            vec![3, 4, 1],
            vec![4, 1, 3],
        ]
    );
}
