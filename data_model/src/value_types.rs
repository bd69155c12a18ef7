// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

///
/// The value domain of a terminal typed node.
///
/// A value type owns a finite enumeration of variants and a cursor over them:
/// `current_bytes` reads the variant under the cursor, `advance` steps it
/// (wrapping past the end), and `is_exhausted` reports whether the cursor sits
/// on the last variant. `shuffle`/`unshuffle` switch between a random and the
/// declared enumeration order without changing the variant set.
///
/// The remaining methods form the fuzzing surface consumed by typed-value
/// disruption: raw integer access, enumerated sets and bounds, compatibility
/// tests, value-list edition, and the derived fuzzy types.
///
pub trait ValueType: fmt::Debug {
    fn type_name(&self) -> &'static str;

    fn current_bytes(&self) -> Vec<u8>;
    fn advance(&mut self);
    fn rewind(&mut self);
    fn is_exhausted(&self) -> bool;
    fn count(&self) -> usize;
    fn shuffle(&mut self, rng: &mut StdRng);
    fn unshuffle(&mut self);

    /// The raw integer under the cursor, for types that have one.
    fn current_raw(&self) -> Option<i64> {
        None
    }

    /// The enumerated integer set, when the type was built from one.
    fn enumerated(&self) -> Option<Vec<i64>> {
        None
    }

    ///
    /// The effective generation bounds, but only when they are narrower than
    /// the trivial full range of the type's bit width.
    ///
    fn int_bounds(&self) -> Option<(i64, i64)> {
        None
    }

    fn is_compatible(&self, _v: i64) -> bool {
        false
    }

    fn extend_value_list(&mut self, _vals: &[i64]) {}

    fn remove_value_list(&mut self, _vals: &[i64]) {}

    /// Sibling types engineered to emit boundary values of the same width.
    fn fuzzy_siblings(&self) -> Vec<Box<dyn ValueType>> {
        Vec::new()
    }

    ///
    /// For alternating types only: a private clone with its fuzz mode enabled,
    /// scaled by `magnitude`. When this returns a clone, it is the whole fuzzy
    /// catalogue for the type.
    ///
    fn fuzz_mode_clone(&self, _magnitude: f64) -> Option<Box<dyn ValueType>> {
        None
    }

    /// A type-advertised companion to try first, if any.
    fn fuzzed_companion(&self) -> Option<Box<dyn ValueType>> {
        None
    }

    fn specific_fuzzy_values(&self) -> Vec<i64> {
        Vec::new()
    }

    fn clone_vt(&self) -> Box<dyn ValueType>;
}

impl Clone for Box<dyn ValueType> {
    fn clone(&self) -> Box<dyn ValueType> {
        self.clone_vt()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Endian {
    Big,
    Little,
}

///
/// An integer value type: width, signedness, endianness, an optional
/// enumerated value set, an optional constrained range, and optional
/// type-declared fuzzy values.
///
/// The enumeration space is the enumerated set when present, otherwise the
/// single default value: boundary exploration of un-enumerated ranges is the
/// typed-disruption consumer's job, not the intrinsic enumeration's.
///
#[derive(Clone, Debug)]
pub struct Int {
    bit_size: u32,
    signed: bool,
    endian: Endian,
    values: Vec<i64>,
    enumerated: bool,
    range: Option<(i64, i64)>,
    specifics: Vec<i64>,
    cursor: usize,
    order: Option<Vec<usize>>,
}

impl Int {
    pub fn new(bit_size: u32, signed: bool, endian: Endian) -> Int {
        debug_assert!(matches!(bit_size, 8 | 16 | 32 | 64));
        Int {
            bit_size,
            signed,
            endian,
            values: vec![0],
            enumerated: false,
            range: None,
            specifics: Vec::new(),
            cursor: 0,
            order: None,
        }
    }

    pub fn uint8() -> Int {
        Int::new(8, false, Endian::Big)
    }

    pub fn uint16_be() -> Int {
        Int::new(16, false, Endian::Big)
    }

    pub fn uint32_be() -> Int {
        Int::new(32, false, Endian::Big)
    }

    pub fn uint32_le() -> Int {
        Int::new(32, false, Endian::Little)
    }

    pub fn int8() -> Int {
        Int::new(8, true, Endian::Big)
    }

    pub fn with_values(mut self, values: &[i64]) -> Int {
        debug_assert!(!values.is_empty());
        self.values = values.to_vec();
        self.enumerated = true;
        self
    }

    pub fn with_range(mut self, mini: i64, maxi: i64) -> Int {
        debug_assert!(mini <= maxi);
        self.range = Some((mini, maxi));
        if !self.enumerated {
            self.values = vec![mini];
        }
        self
    }

    pub fn with_specifics(mut self, vals: &[i64]) -> Int {
        self.specifics = vals.to_vec();
        self
    }

    fn full_range(&self) -> (i64, i64) {
        match (self.signed, self.bit_size) {
            (true, 64) => (i64::MIN, i64::MAX),
            (true, n) => (-(1_i64 << (n - 1)), (1_i64 << (n - 1)) - 1),
            (false, 64) => (0, i64::MAX),
            (false, n) => (0, (1_i64 << n) - 1),
        }
    }

    fn value_at(&self, pos: usize) -> i64 {
        let idx = match &self.order {
            Some(order) => order[pos],
            None => pos,
        };
        self.values[idx]
    }

    pub fn encode(&self, v: i64) -> Vec<u8> {
        let nbytes = (self.bit_size / 8) as usize;
        let raw = (v as u64).to_be_bytes();
        let mut bytes = raw[8 - nbytes..].to_vec();
        if self.endian == Endian::Little {
            bytes.reverse();
        }
        bytes
    }
}

impl ValueType for Int {
    fn type_name(&self) -> &'static str {
        "int"
    }

    fn current_bytes(&self) -> Vec<u8> {
        self.encode(self.value_at(self.cursor))
    }

    fn advance(&mut self) {
        if self.values.len() > 1 {
            self.cursor = (self.cursor + 1) % self.values.len();
        }
    }

    fn rewind(&mut self) {
        self.cursor = 0;
    }

    fn is_exhausted(&self) -> bool {
        self.cursor + 1 >= self.values.len()
    }

    fn count(&self) -> usize {
        self.values.len()
    }

    fn shuffle(&mut self, rng: &mut StdRng) {
        let mut order: Vec<usize> = (0..self.values.len()).collect();
        order.shuffle(rng);
        self.order = Some(order);
        self.cursor = 0;
    }

    fn unshuffle(&mut self) {
        self.order = None;
    }

    fn current_raw(&self) -> Option<i64> {
        Some(self.value_at(self.cursor))
    }

    fn enumerated(&self) -> Option<Vec<i64>> {
        if self.enumerated {
            Some(self.values.clone())
        } else {
            None
        }
    }

    fn int_bounds(&self) -> Option<(i64, i64)> {
        match self.range {
            Some(bounds) if bounds != self.full_range() => Some(bounds),
            _ => None,
        }
    }

    fn is_compatible(&self, v: i64) -> bool {
        // Anything encodable in the width under two's complement wrapping, so
        // -1 stays compatible with unsigned widths.
        if self.bit_size == 64 {
            return true;
        }
        let lo = -(1_i64 << (self.bit_size - 1));
        let hi = (1_i64 << self.bit_size) - 1;
        lo <= v && v <= hi
    }

    fn extend_value_list(&mut self, vals: &[i64]) {
        for &v in vals {
            if self.is_compatible(v) && !self.values.contains(&v) {
                self.values.push(v);
            }
        }
    }

    fn remove_value_list(&mut self, vals: &[i64]) {
        self.values.retain(|v| !vals.contains(v));
        if self.values.is_empty() {
            self.values.push(0);
        }
        if self.cursor >= self.values.len() {
            self.cursor = 0;
        }
        self.order = None;
    }

    fn fuzzy_siblings(&self) -> Vec<Box<dyn ValueType>> {
        let (mini, maxi) = self.full_range();
        let half = if self.bit_size == 64 {
            i64::MAX / 2 + 1
        } else {
            1_i64 << (self.bit_size - 1)
        };
        let catalogue: Vec<i64> = if self.signed {
            vec![-1, 0, 1, mini, maxi]
        } else {
            vec![maxi, 0, 1, half, half - 1]
        };
        let mut sibling = Int::new(self.bit_size, self.signed, self.endian);
        sibling.values = Vec::new();
        sibling.enumerated = true;
        sibling.extend_value_list(&catalogue);
        vec![Box::new(sibling)]
    }

    fn specific_fuzzy_values(&self) -> Vec<i64> {
        self.specifics.clone()
    }

    fn clone_vt(&self) -> Box<dyn ValueType> {
        Box::new(self.clone())
    }
}

///
/// A byte-string value type with an optional fixed size.
///
/// `Str` is the alternating type of this catalogue: `fuzz_mode_clone` derives
/// a private clone whose variants are classic malformed strings seeded from
/// the current value, scaled by the fuzz magnitude.
///
#[derive(Clone, Debug)]
pub struct Str {
    values: Vec<Vec<u8>>,
    size: Option<usize>,
    cursor: usize,
    order: Option<Vec<usize>>,
}

impl Str {
    pub fn new<I, V>(values: I) -> Str
    where
        I: IntoIterator<Item = V>,
        V: Into<Vec<u8>>,
    {
        let values: Vec<Vec<u8>> = values.into_iter().map(Into::into).collect();
        debug_assert!(!values.is_empty());
        Str {
            values,
            size: None,
            cursor: 0,
            order: None,
        }
    }

    pub fn with_size(mut self, size: usize) -> Str {
        self.size = Some(size);
        self
    }

    pub fn filler(byte: u8, len: usize) -> Str {
        Str::new([vec![byte; len]])
    }

    fn value_at(&self, pos: usize) -> &[u8] {
        let idx = match &self.order {
            Some(order) => order[pos],
            None => pos,
        };
        &self.values[idx]
    }
}

impl ValueType for Str {
    fn type_name(&self) -> &'static str {
        "string"
    }

    fn current_bytes(&self) -> Vec<u8> {
        self.value_at(self.cursor).to_vec()
    }

    fn advance(&mut self) {
        if self.values.len() > 1 {
            self.cursor = (self.cursor + 1) % self.values.len();
        }
    }

    fn rewind(&mut self) {
        self.cursor = 0;
    }

    fn is_exhausted(&self) -> bool {
        self.cursor + 1 >= self.values.len()
    }

    fn count(&self) -> usize {
        self.values.len()
    }

    fn shuffle(&mut self, rng: &mut StdRng) {
        let mut order: Vec<usize> = (0..self.values.len()).collect();
        order.shuffle(rng);
        self.order = Some(order);
        self.cursor = 0;
    }

    fn unshuffle(&mut self) {
        self.order = None;
    }

    fn fuzz_mode_clone(&self, magnitude: f64) -> Option<Box<dyn ValueType>> {
        let current = self.current_bytes();
        let base_len = self.size.unwrap_or(current.len()).max(1);
        let fill_len = ((base_len * 64) as f64 * magnitude).ceil() as usize;

        let mut nul_injected = current.clone();
        nul_injected.push(0);

        let catalogue: Vec<Vec<u8>> = vec![
            vec![b'A'; fill_len.max(1)],
            Vec::new(),
            nul_injected,
            b"%n%n%n%n".to_vec(),
            b"\"'&|;`<>".to_vec(),
        ];
        Some(Box::new(Str {
            values: catalogue,
            size: None,
            cursor: 0,
            order: None,
        }))
    }

    fn clone_vt(&self) -> Box<dyn ValueType> {
        Box::new(self.clone())
    }
}
