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

use std::sync::Arc;

use data_model::{
    GenCusto, Generator, Int, NodeAttrs, NodeGraph, NodeId, Shape, Str, SubnodeSpec,
    UnfreezeOpts, ValueType,
};

/// The 8-byte PNG signature.
pub const PNG_SIG: &[u8] = b"\x89PNG\r\n\x1a\n";

///
/// IEEE CRC-32 over the concatenated bytes of the argument nodes, emitted
/// big-endian, as PNG chunks use it.
///
#[derive(Debug)]
pub struct Crc32;

impl Generator for Crc32 {
    fn generate(&self, args: &[Vec<u8>]) -> Box<dyn ValueType> {
        let mut hasher = crc32fast::Hasher::new();
        for bytes in args {
            hasher.update(bytes);
        }
        let crc = hasher.finalize();
        Box::new(Int::uint32_be().with_values(&[i64::from(crc)]))
    }
}

///
/// A zero-filled payload whose length is read from a big-endian u32 argument.
/// The length is capped so that disrupted length fields stay harmless.
///
#[derive(Debug)]
pub struct BytesOfLen;

const MAX_GENERATED_PAYLOAD: usize = 1 << 16;

impl Generator for BytesOfLen {
    fn generate(&self, args: &[Vec<u8>]) -> Box<dyn ValueType> {
        let len = args
            .first()
            .map(|bytes| {
                bytes
                    .iter()
                    .fold(0_usize, |acc, &b| (acc << 8) | usize::from(b))
            })
            .unwrap_or(0);
        Box::new(Str::new([vec![0_u8; len.min(MAX_GENERATED_PAYLOAD)]]))
    }
}

///
/// The handles of the PNG model's interesting nodes.
///
pub struct PngModel {
    pub root: NodeId,
    pub sig: NodeId,
    pub chunks: NodeId,
    pub chunk: NodeId,
    pub len: NodeId,
    pub chk: NodeId,
    pub type1: NodeId,
    pub ihdr_leaves: Vec<NodeId>,
    pub type2: NodeId,
    pub data_gen: NodeId,
    pub crc: NodeId,
}

///
/// Builds the PNG grammar: signature, a `chunks` collection bounded to
/// `(2, 200)`, and per chunk a length, a weighted `chk` alternation (weight
/// 10: the IHDR layout; weight 5: the other chunk types with a length-driven
/// payload) and a non-mutable, trigger-last CRC-32 generator.
///
/// The tree is then seeded so its initial frozen image is the canonical
/// sample: the signature, a zeroed 13-byte IHDR chunk and an empty IEND
/// chunk, with the CRC fields produced by the real generator.
///
pub fn png_model(graph: &mut NodeGraph) -> PngModel {
    let sig = graph.add_typed("sig", Box::new(Str::new([PNG_SIG]).with_size(8)));

    let len = graph.add_typed("len", Box::new(Int::uint32_be().with_values(&[13])));

    let type1 = graph.add_typed("type1", Box::new(Str::new(["IHDR"]).with_size(4)));
    let width = graph.add_typed("width", Box::new(Int::uint32_be().with_values(&[0])));
    let height = graph.add_typed("height", Box::new(Int::uint32_be().with_values(&[0])));
    let bit_depth = graph.add_typed("bit_depth", Box::new(Int::uint8().with_values(&[0])));
    let color_type = graph.add_typed("color_type", Box::new(Int::uint8().with_values(&[0])));
    let compression_method =
        graph.add_typed("compression_method", Box::new(Int::uint8().with_values(&[0])));
    let filter_method =
        graph.add_typed("filter_method", Box::new(Int::uint8().with_values(&[0])));
    let interlace_method =
        graph.add_typed("interlace_method", Box::new(Int::uint8().with_values(&[0, 1])));

    let type2 = graph.add_typed(
        "type2",
        Box::new(Str::new(["IEND", "IDAT", "PLTE"]).with_size(4)),
    );
    let data_gen = graph.add_genfunc("data_gen", Arc::new(BytesOfLen), vec![len]);

    let ihdr_leaves = vec![
        width,
        height,
        bit_depth,
        color_type,
        compression_method,
        filter_method,
        interlace_method,
    ];
    let mut ihdr_shape = vec![SubnodeSpec::one(type1)];
    ihdr_shape.extend(ihdr_leaves.iter().map(|&leaf| SubnodeSpec::one(leaf)));

    let chk = graph.add_nonterm(
        "chk",
        vec![
            Shape::new(10, ihdr_shape),
            Shape::new(5, vec![SubnodeSpec::one(type2), SubnodeSpec::one(data_gen)]),
        ],
    );

    let crc = graph.add_genfunc("crc32_gen", Arc::new(Crc32), vec![chk]);
    graph.clear_attr(crc, NodeAttrs::MUTABLE);
    graph.set_custo(crc, GenCusto::TRIGGER_LAST);

    let chunk = graph.add_nonterm(
        "chunk",
        vec![Shape::new(
            1,
            vec![
                SubnodeSpec::one(len),
                SubnodeSpec::one(chk),
                SubnodeSpec::one(crc),
            ],
        )],
    );

    let chunks = graph.add_nonterm(
        "chunks",
        vec![Shape::new(1, vec![SubnodeSpec::repeated(chunk, 2, 200, 2)])],
    );

    let root = graph.add_nonterm(
        "PNG_model",
        vec![Shape::new(
            1,
            vec![SubnodeSpec::one(sig), SubnodeSpec::one(chunks)],
        )],
    );

    // Materialize the second chunk instance, then steer it to the canonical
    // sample: the weight-5 shape with an IEND type and a zero length.
    graph.freeze(root);
    let instances = graph.frozen_children(chunks);
    assert_eq!(instances.len(), 2);
    let second = instances[1];
    let second_children = graph.frozen_children(second);
    let (second_len, second_chk, second_crc) = (
        second_children[0],
        second_children[1],
        second_children[2],
    );
    graph.set_values(second_len, Box::new(Int::uint32_be().with_values(&[0])));
    graph.unfreeze(second_len, UnfreezeOpts::shallow().dont_change_state());
    graph.unfreeze(second_chk, UnfreezeOpts::shallow().ignore_entanglement());
    graph.unfreeze(second_crc, UnfreezeOpts::shallow().dont_change_state());
    graph.freeze(root);

    PngModel {
        root,
        sig,
        chunks,
        chunk,
        len,
        chk,
        type1,
        ihdr_leaves,
        type2,
        data_gen,
        crc,
    }
}

///
/// The byte image the seeded PNG model freezes to.
///
pub fn png_seed_bytes() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(PNG_SIG);

    let ihdr_payload = [0_u8; 13];
    out.extend_from_slice(&13_u32.to_be_bytes());
    out.extend_from_slice(b"IHDR");
    out.extend_from_slice(&ihdr_payload);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(b"IHDR");
    hasher.update(&ihdr_payload);
    out.extend_from_slice(&hasher.finalize().to_be_bytes());

    out.extend_from_slice(&0_u32.to_be_bytes());
    out.extend_from_slice(b"IEND");
    out.extend_from_slice(&crc32fast::hash(b"IEND").to_be_bytes());

    out
}
