// Copyright 2025 The Tensile Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::fmt;

/// The storage scheme of one tensor level.
///
/// `Dense` stores every coordinate implicitly; `Compressed` stores a
/// `pos`/`idx` array pair; `Fixed` stores a fixed number of coordinates per
/// parent position, padding short segments by repeating the last entry (so
/// fixed levels are never unique).  `Offset` and `Replicated` are reserved
/// kinds whose iterator semantics are not yet defined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LevelKind {
    Dense,
    Compressed { unique: bool },
    Fixed { fanout: usize },
    Offset,
    Replicated,
}

impl LevelKind {
    pub fn compressed() -> Self {
        LevelKind::Compressed { unique: true }
    }
}

impl fmt::Display for LevelKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LevelKind::Dense => write!(f, "d"),
            LevelKind::Compressed { unique: true } => write!(f, "s"),
            LevelKind::Compressed { unique: false } => write!(f, "s!"),
            LevelKind::Fixed { fanout } => write!(f, "f{}", fanout),
            LevelKind::Offset => write!(f, "o"),
            LevelKind::Replicated => write!(f, "r"),
        }
    }
}

/// A per-tensor storage format: an ordered list of levels and a permutation
/// mapping each storage level to the logical dimension it stores.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Format {
    levels: Vec<LevelKind>,
    /// `permutation[l]` is the logical dimension stored at level `l`.
    permutation: Vec<usize>,
}

impl Format {
    pub fn new(levels: Vec<LevelKind>) -> Self {
        let permutation = (0..levels.len()).collect();
        Format {
            levels,
            permutation,
        }
    }

    pub fn with_permutation(levels: Vec<LevelKind>, permutation: Vec<usize>) -> Self {
        assert_eq!(levels.len(), permutation.len());
        let mut seen = vec![false; permutation.len()];
        for &d in &permutation {
            assert!(d < seen.len() && !seen[d], "not a permutation");
            seen[d] = true;
        }
        Format {
            levels,
            permutation,
        }
    }

    /// The format of a 0-order tensor.
    pub fn scalar() -> Self {
        Format::new(vec![])
    }

    /// All-dense format of the given order.
    pub fn dense(order: usize) -> Self {
        Format::new(vec![LevelKind::Dense; order])
    }

    /// A sparse vector: one compressed level.
    pub fn sparse_vector() -> Self {
        Format::new(vec![LevelKind::compressed()])
    }

    /// Compressed sparse row: dense rows over compressed columns.
    pub fn csr() -> Self {
        Format::new(vec![LevelKind::Dense, LevelKind::compressed()])
    }

    /// Doubly compressed sparse row: both levels compressed.
    pub fn dcsr() -> Self {
        Format::new(vec![LevelKind::compressed(), LevelKind::compressed()])
    }

    pub fn order(&self) -> usize {
        self.levels.len()
    }

    pub fn levels(&self) -> &[LevelKind] {
        &self.levels
    }

    pub fn level(&self, l: usize) -> LevelKind {
        self.levels[l]
    }

    /// The logical dimension stored at level `l`.
    pub fn dimension_of(&self, l: usize) -> usize {
        self.permutation[l]
    }

    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let parts: Vec<String> = self.levels.iter().map(|l| l.to_string()).collect();
        write!(f, "({})", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csr_shape() {
        let csr = Format::csr();
        assert_eq!(csr.order(), 2);
        assert_eq!(csr.level(0), LevelKind::Dense);
        assert_eq!(csr.level(1), LevelKind::Compressed { unique: true });
        assert_eq!(csr.dimension_of(0), 0);
        assert_eq!(csr.dimension_of(1), 1);
    }

    #[test]
    fn test_column_major_permutation() {
        // CSC stores the column dimension at level 0
        let csc = Format::with_permutation(
            vec![LevelKind::Dense, LevelKind::compressed()],
            vec![1, 0],
        );
        assert_eq!(csc.dimension_of(0), 1);
        assert_eq!(csc.dimension_of(1), 0);
    }

    #[test]
    #[should_panic(expected = "not a permutation")]
    fn test_bad_permutation() {
        Format::with_permutation(vec![LevelKind::Dense, LevelKind::Dense], vec![0, 0]);
    }

    #[test]
    fn test_display() {
        assert_eq!(Format::csr().to_string(), "(d,s)");
        assert_eq!(Format::scalar().to_string(), "()");
    }
}
