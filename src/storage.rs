// Copyright 2025 The Tensile Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Concrete tensor storage for the evaluator and tests: one container per
//! level plus a flat values array.  The lowering engine itself never sees
//! these; it only names their components through the IR.

use std::collections::BTreeMap;

use crate::common::Result;
use crate::format::{Format, LevelKind};
use crate::lower_err;

#[derive(Clone, Debug, PartialEq)]
pub enum LevelStorage {
    Dense { size: usize },
    Compressed { pos: Vec<i64>, idx: Vec<i64> },
    Fixed { fanout: usize, idx: Vec<i64> },
}

#[derive(Clone, Debug, PartialEq)]
pub struct TensorStorage {
    pub dims: Vec<usize>,
    pub format: Format,
    pub levels: Vec<LevelStorage>,
    pub vals: Vec<f64>,
}

impl TensorStorage {
    /// A 0-order tensor holding one value.
    pub fn scalar(value: f64) -> Self {
        TensorStorage {
            dims: vec![],
            format: Format::scalar(),
            levels: vec![],
            vals: vec![value],
        }
    }

    /// A dense tensor from row-major values.
    pub fn dense(dims: &[usize], vals: Vec<f64>) -> Self {
        assert_eq!(dims.iter().product::<usize>(), vals.len());
        let levels = dims
            .iter()
            .map(|&size| LevelStorage::Dense { size })
            .collect();
        TensorStorage {
            dims: dims.to_vec(),
            format: Format::dense(dims.len()),
            levels,
            vals,
        }
    }

    /// An unassembled result tensor.  Dense-only results are sized and
    /// zeroed up front; levels that are assembled start empty.
    pub fn empty(dims: &[usize], format: Format) -> Self {
        let all_dense = format.levels().iter().all(|l| *l == LevelKind::Dense);
        let levels = format
            .levels()
            .iter()
            .enumerate()
            .map(|(l, kind)| match kind {
                LevelKind::Dense => LevelStorage::Dense {
                    size: dims[format.dimension_of(l)],
                },
                LevelKind::Compressed { .. } => LevelStorage::Compressed {
                    pos: vec![],
                    idx: vec![],
                },
                LevelKind::Fixed { fanout } => LevelStorage::Fixed {
                    fanout: *fanout,
                    idx: vec![],
                },
                LevelKind::Offset | LevelKind::Replicated => {
                    unreachable!("unsupported level kinds are rejected before storage is built")
                }
            })
            .collect();
        let vals = if all_dense {
            vec![0.0; dims.iter().product()]
        } else {
            vec![]
        };
        TensorStorage {
            dims: dims.to_vec(),
            format,
            levels,
            vals,
        }
    }

    /// Pack coordinate/value entries into the given format.  Duplicate
    /// coordinates are summed.
    pub fn from_entries(
        dims: &[usize],
        format: Format,
        entries: &[(Vec<usize>, f64)],
    ) -> Result<Self> {
        let order = format.order();
        for (coords, _) in entries {
            if coords.len() != order {
                return lower_err!(OrderMismatch, format!("{:?}", coords));
            }
            for (d, &c) in coords.iter().enumerate() {
                if c >= dims[d] {
                    return lower_err!(
                        Generic,
                        format!("coordinate {:?} outside dimensions {:?}", coords, dims)
                    );
                }
            }
        }

        // sort into storage order and combine duplicates
        let mut sorted: BTreeMap<Vec<usize>, f64> = BTreeMap::new();
        for (coords, value) in entries {
            let key: Vec<usize> = (0..order)
                .map(|l| coords[format.dimension_of(l)])
                .collect();
            *sorted.entry(key).or_insert(0.0) += value;
        }
        let packed: Vec<(Vec<usize>, f64)> = sorted.into_iter().collect();

        let mut levels: Vec<LevelStorage> = vec![];
        // ranges into `packed` for each position of the level above
        let mut segments: Vec<(usize, usize)> = vec![(0, packed.len())];
        for l in 0..order {
            let mut next_segments: Vec<(usize, usize)> = vec![];
            match format.level(l) {
                LevelKind::Dense => {
                    let size = dims[format.dimension_of(l)];
                    for &(start, end) in &segments {
                        let mut at = start;
                        for coord in 0..size {
                            let sub_start = at;
                            while at < end && packed[at].0[l] == coord {
                                at += 1;
                            }
                            next_segments.push((sub_start, at));
                        }
                    }
                    levels.push(LevelStorage::Dense { size });
                }
                LevelKind::Compressed { .. } => {
                    let mut pos: Vec<i64> = vec![0];
                    let mut idx: Vec<i64> = vec![];
                    for &(start, end) in &segments {
                        let mut at = start;
                        while at < end {
                            let coord = packed[at].0[l];
                            let sub_start = at;
                            while at < end && packed[at].0[l] == coord {
                                at += 1;
                            }
                            idx.push(coord as i64);
                            next_segments.push((sub_start, at));
                        }
                        pos.push(idx.len() as i64);
                    }
                    levels.push(LevelStorage::Compressed { pos, idx });
                }
                LevelKind::Fixed { fanout } => {
                    let mut idx: Vec<i64> = vec![];
                    for &(start, end) in &segments {
                        let mut at = start;
                        let mut used = 0;
                        let mut last = 0i64;
                        while at < end {
                            let coord = packed[at].0[l];
                            let sub_start = at;
                            while at < end && packed[at].0[l] == coord {
                                at += 1;
                            }
                            if used == fanout {
                                return lower_err!(
                                    Generic,
                                    format!("more than {} entries in a fixed segment", fanout)
                                );
                            }
                            idx.push(coord as i64);
                            next_segments.push((sub_start, at));
                            last = coord as i64;
                            used += 1;
                        }
                        // pad by repeating the last coordinate
                        for _ in used..fanout {
                            idx.push(last);
                            next_segments.push((at, at));
                        }
                    }
                    levels.push(LevelStorage::Fixed { fanout, idx });
                }
                LevelKind::Offset | LevelKind::Replicated => {
                    return lower_err!(NotYetImplemented, format!("{}", format.level(l)));
                }
            }
            segments = next_segments;
        }

        let vals: Vec<f64> = segments
            .iter()
            .map(|&(start, end)| (start..end).map(|n| packed[n].1).sum())
            .collect();

        Ok(TensorStorage {
            dims: dims.to_vec(),
            format,
            levels,
            vals,
        })
    }

    /// Read the tensor back as a row-major dense array, accumulating
    /// duplicate coordinates.
    pub fn to_dense(&self) -> Vec<f64> {
        let size: usize = self.dims.iter().product();
        let mut out = vec![0.0; size];
        if self.dims.is_empty() {
            out = vec![self.vals.first().copied().unwrap_or(0.0)];
            return out;
        }
        self.walk(0, 0, &mut vec![0; self.format.order()], &mut out);
        out
    }

    fn walk(&self, level: usize, pos: usize, coords: &mut Vec<usize>, out: &mut [f64]) {
        if level == self.levels.len() {
            // storage coordinates back to logical coordinates
            let mut flat = 0;
            for d in 0..self.dims.len() {
                let l = self
                    .format
                    .permutation()
                    .iter()
                    .position(|&dim| dim == d)
                    .unwrap();
                flat = flat * self.dims[d] + coords[l];
            }
            if pos < self.vals.len() {
                out[flat] += self.vals[pos];
            }
            return;
        }
        match &self.levels[level] {
            LevelStorage::Dense { size } => {
                for c in 0..*size {
                    coords[level] = c;
                    self.walk(level + 1, pos * size + c, coords, out);
                }
            }
            LevelStorage::Compressed { pos: seg, idx } => {
                if pos + 1 >= seg.len() {
                    return;
                }
                let (start, end) = (seg[pos] as usize, seg[pos + 1] as usize);
                for p in start..end.min(idx.len()) {
                    coords[level] = idx[p] as usize;
                    self.walk(level + 1, p, coords, out);
                }
            }
            LevelStorage::Fixed { fanout, idx } => {
                // padding repeats a coordinate; only the first of a run
                // carries the value
                let start = pos * fanout;
                let mut prev: Option<i64> = None;
                for slot in 0..*fanout {
                    let p = start + slot;
                    if p >= idx.len() {
                        break;
                    }
                    if prev == Some(idx[p]) {
                        continue;
                    }
                    prev = Some(idx[p]);
                    coords[level] = idx[p] as usize;
                    self.walk(level + 1, p, coords, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_csr() {
        // [[1, 0, 2], [0, 3, 0], [0, 0, 4]]
        let entries = vec![
            (vec![0, 0], 1.0),
            (vec![0, 2], 2.0),
            (vec![1, 1], 3.0),
            (vec![2, 2], 4.0),
        ];
        let b = TensorStorage::from_entries(&[3, 3], Format::csr(), &entries).unwrap();
        match &b.levels[1] {
            LevelStorage::Compressed { pos, idx } => {
                assert_eq!(pos, &vec![0, 2, 3, 4]);
                assert_eq!(idx, &vec![0, 2, 1, 2]);
            }
            other => panic!("expected compressed level, got {:?}", other),
        }
        assert_eq!(b.vals, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(
            b.to_dense(),
            vec![1.0, 0.0, 2.0, 0.0, 3.0, 0.0, 0.0, 0.0, 4.0]
        );
    }

    #[test]
    fn test_pack_column_major() {
        let csc = Format::with_permutation(
            vec![LevelKind::Dense, LevelKind::compressed()],
            vec![1, 0],
        );
        let entries = vec![(vec![0, 1], 5.0), (vec![2, 1], 6.0)];
        let b = TensorStorage::from_entries(&[3, 2], csc, &entries).unwrap();
        match &b.levels[1] {
            LevelStorage::Compressed { pos, idx } => {
                // column 0 empty, column 1 holds rows 0 and 2
                assert_eq!(pos, &vec![0, 0, 2]);
                assert_eq!(idx, &vec![0, 2]);
            }
            other => panic!("expected compressed level, got {:?}", other),
        }
        let dense = b.to_dense();
        assert_eq!(dense[1], 5.0);
        assert_eq!(dense[5], 6.0);
    }

    #[test]
    fn test_pack_duplicates_sum() {
        let entries = vec![(vec![1], 2.0), (vec![1], 3.0)];
        let v =
            TensorStorage::from_entries(&[4], Format::sparse_vector(), &entries).unwrap();
        assert_eq!(v.vals, vec![5.0]);
        assert_eq!(v.to_dense(), vec![0.0, 5.0, 0.0, 0.0]);
    }

    #[test]
    fn test_pack_fixed_pads() {
        let entries = vec![(vec![0, 1], 1.0), (vec![1, 0], 2.0), (vec![1, 2], 3.0)];
        let fmt = Format::new(vec![LevelKind::Dense, LevelKind::Fixed { fanout: 2 }]);
        let b = TensorStorage::from_entries(&[2, 3], fmt, &entries).unwrap();
        match &b.levels[1] {
            LevelStorage::Fixed { idx, .. } => {
                assert_eq!(idx, &vec![1, 1, 0, 2]);
            }
            other => panic!("expected fixed level, got {:?}", other),
        }
        assert_eq!(
            b.to_dense(),
            vec![0.0, 1.0, 0.0, 2.0, 0.0, 3.0]
        );
    }

    #[test]
    fn test_entry_outside_dimensions() {
        let entries = vec![(vec![5], 1.0)];
        assert!(
            TensorStorage::from_entries(&[3], Format::sparse_vector(), &entries).is_err()
        );
    }
}
