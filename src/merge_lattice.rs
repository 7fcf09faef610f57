// Copyright 2025 The Tensile Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Merge lattices: the co-iteration cases at one index variable.
//!
//! A lattice point is a set of iterators that are simultaneously at the
//! merged coordinate, together with the index expression specialized to
//! that case (operands whose iterators are absent produce the identity of
//! the operator combining them).  Exactly one case fires per iteration.

use std::collections::HashSet;

use smallvec::{smallvec, SmallVec};

use crate::ast::{Access, IndexExpr, IndexVar};
use crate::common::Result;
use crate::internal_err;
use crate::iteration_graph::{IterationGraph, TensorPathStep};
use crate::iterators::Iterators;

/// The iterators of one point; co-iterating more than a few operands at
/// one level is rare.
type Steps = SmallVec<[TensorPathStep; 3]>;

/// One co-iteration case.  `range` iterators advance sequentially;
/// `locate` iterators are dereferenced from the merged coordinate.
#[derive(Clone, Debug, PartialEq)]
pub struct MergeLatticePoint {
    range: Steps,
    locate: Steps,
    expr: IndexExpr,
}

impl MergeLatticePoint {
    fn new(range: Steps, locate: Steps, expr: IndexExpr) -> Self {
        MergeLatticePoint {
            range,
            locate,
            expr,
        }
    }

    /// All iterators contributing values at this point.
    pub fn iterators(&self) -> Vec<TensorPathStep> {
        let mut out: Vec<TensorPathStep> = self.range.to_vec();
        out.extend(self.locate.iter().copied());
        out
    }

    pub fn range_iterators(&self) -> &[TensorPathStep] {
        &self.range
    }

    pub fn locate_iterators(&self) -> &[TensorPathStep] {
        &self.locate
    }

    pub fn expr(&self) -> &IndexExpr {
        &self.expr
    }

    /// True iff this point's sequential iterators cover the dimension.
    pub fn is_full(&self, iterators: &Iterators) -> bool {
        self.range.iter().any(|s| iterators.get(*s).is_full())
    }
}

#[derive(Clone, Debug)]
pub struct MergeLattice {
    points: Vec<MergeLatticePoint>,
}

/// Intermediate result of the structural recursion: a sub-expression
/// either contributes iterators at this variable, or is carried whole into
/// the expression of every point, or was exhausted by an enclosing case.
enum Built {
    Lattice(Vec<MergeLatticePoint>),
    Scalar(IndexExpr),
    Absent,
}

impl MergeLattice {
    /// Build the lattice for `expr` at `ivar`.
    pub fn make(
        expr: &IndexExpr,
        ivar: &IndexVar,
        graph: &IterationGraph,
        iterators: &Iterators,
        exhausted: &HashSet<Access>,
    ) -> Result<MergeLattice> {
        let built = build(expr, ivar, graph, iterators, exhausted);
        match built {
            Built::Lattice(points) => {
                log::trace!(
                    "merge lattice for {} at {}: {} point(s)",
                    expr,
                    ivar,
                    points.len()
                );
                Ok(MergeLattice { points })
            }
            Built::Scalar(_) | Built::Absent => {
                internal_err!(format!("no iterator ranges over {} in {}", ivar, expr))
            }
        }
    }

    pub fn points(&self) -> &[MergeLatticePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The sequential iterators of the whole lattice, in point order,
    /// without duplicates.
    pub fn range_iterators(&self) -> Vec<TensorPathStep> {
        let mut out: Vec<TensorPathStep> = vec![];
        for p in &self.points {
            for s in &p.range {
                if !out.contains(s) {
                    out.push(*s);
                }
            }
        }
        out
    }

    /// All accesses with an iterator anywhere in the lattice.
    pub fn accesses<'a>(&self, graph: &'a IterationGraph) -> Vec<&'a Access> {
        let mut out: Vec<&Access> = vec![];
        for p in &self.points {
            for s in p.iterators() {
                let access = &graph.path(s.path).access;
                if !out.contains(&access) {
                    out.push(access);
                }
            }
        }
        out
    }

    /// The cases still reachable once `lp`'s iterators are the ones
    /// advancing: points whose iterators are a subset of `lp`'s.
    pub fn sub_lattice(&self, lp: &MergeLatticePoint) -> MergeLattice {
        let in_lp: HashSet<TensorPathStep> = lp.iterators().into_iter().collect();
        let range_in_lp: HashSet<TensorPathStep> = lp.range.iter().copied().collect();
        let points = self
            .points
            .iter()
            .filter(|q| {
                q.range.iter().all(|s| range_in_lp.contains(s))
                    && q.locate.iter().all(|s| in_lp.contains(s))
            })
            .cloned()
            .collect();
        MergeLattice { points }
    }

    /// True iff the first (dominating) point covers the whole dimension.
    pub fn is_full(&self, iterators: &Iterators) -> bool {
        self.points
            .first()
            .map(|p| p.is_full(iterators))
            .unwrap_or(false)
    }
}

fn build(
    expr: &IndexExpr,
    ivar: &IndexVar,
    graph: &IterationGraph,
    iterators: &Iterators,
    exhausted: &HashSet<Access>,
) -> Built {
    match expr {
        IndexExpr::Access(access) => {
            if exhausted.contains(access) {
                return Built::Absent;
            }
            let step = graph
                .path_of(access)
                .and_then(|(path_ref, path)| {
                    path.level_of(ivar).map(|level| TensorPathStep {
                        path: path_ref,
                        level,
                    })
                });
            match step {
                Some(step) => Built::Lattice(vec![MergeLatticePoint::new(
                    smallvec![step],
                    smallvec![],
                    expr.clone(),
                )]),
                None => Built::Scalar(expr.clone()),
            }
        }
        IndexExpr::Literal(_) => Built::Scalar(expr.clone()),
        IndexExpr::Neg(a) => map_exprs(build(a, ivar, graph, iterators, exhausted), |e| {
            IndexExpr::neg(e)
        }),
        IndexExpr::Sqrt(a) => map_exprs(build(a, ivar, graph, iterators, exhausted), |e| {
            IndexExpr::sqrt(e)
        }),
        IndexExpr::Mul(a, b) => conjoin(
            build(a, ivar, graph, iterators, exhausted),
            build(b, ivar, graph, iterators, exhausted),
            IndexExpr::mul,
            iterators,
        ),
        IndexExpr::Div(a, b) => conjoin(
            build(a, ivar, graph, iterators, exhausted),
            build(b, ivar, graph, iterators, exhausted),
            IndexExpr::div,
            iterators,
        ),
        IndexExpr::Add(a, b) => disjoin(
            build(a, ivar, graph, iterators, exhausted),
            build(b, ivar, graph, iterators, exhausted),
            IndexExpr::add,
            false,
            iterators,
        ),
        IndexExpr::Sub(a, b) => disjoin(
            build(a, ivar, graph, iterators, exhausted),
            build(b, ivar, graph, iterators, exhausted),
            IndexExpr::sub,
            true,
            iterators,
        ),
        // rejected by is_lowerable before lowering starts
        IndexExpr::Reduction(..) => Built::Scalar(expr.clone()),
    }
}

fn map_exprs<F: Fn(IndexExpr) -> IndexExpr>(built: Built, f: F) -> Built {
    match built {
        Built::Lattice(points) => Built::Lattice(
            points
                .into_iter()
                .map(|p| MergeLatticePoint::new(p.range, p.locate, f(p.expr)))
                .collect(),
        ),
        Built::Scalar(e) => Built::Scalar(f(e)),
        Built::Absent => Built::Absent,
    }
}

/// Multiplicative combination: iterators of both sides must be present, so
/// points are pairwise unions.  An absent side annihilates the product.
fn conjoin(
    a: Built,
    b: Built,
    op: fn(IndexExpr, IndexExpr) -> IndexExpr,
    iterators: &Iterators,
) -> Built {
    match (a, b) {
        (Built::Absent, _) | (_, Built::Absent) => Built::Absent,
        (Built::Scalar(x), Built::Scalar(y)) => Built::Scalar(op(x, y)),
        (Built::Scalar(x), Built::Lattice(points)) => Built::Lattice(
            points
                .into_iter()
                .map(|p| MergeLatticePoint::new(p.range, p.locate, op(x.clone(), p.expr)))
                .collect(),
        ),
        (Built::Lattice(points), Built::Scalar(y)) => Built::Lattice(
            points
                .into_iter()
                .map(|p| MergeLatticePoint::new(p.range, p.locate, op(p.expr, y.clone())))
                .collect(),
        ),
        (Built::Lattice(pa), Built::Lattice(pb)) => {
            let mut points = vec![];
            for a in &pa {
                for b in &pb {
                    let mut range = union(&a.range, &b.range);
                    let mut locate = union(&a.locate, &b.locate);
                    split_locatable(&mut range, &mut locate, iterators, false);
                    points.push(MergeLatticePoint::new(
                        range,
                        locate,
                        op(a.expr.clone(), b.expr.clone()),
                    ));
                }
            }
            Built::Lattice(canonicalize(points, iterators))
        }
    }
}

/// Additive combination: a coordinate is produced when either side has it,
/// so the lattice is pair points followed by the one-sided points.  An
/// absent side contributes the identity.
fn disjoin(
    a: Built,
    b: Built,
    op: fn(IndexExpr, IndexExpr) -> IndexExpr,
    negate_right_only: bool,
    iterators: &Iterators,
) -> Built {
    match (a, b) {
        (Built::Absent, Built::Absent) => Built::Absent,
        (Built::Absent, b) => {
            if negate_right_only {
                map_exprs(b, IndexExpr::neg)
            } else {
                b
            }
        }
        (a, Built::Absent) => a,
        (Built::Scalar(x), Built::Scalar(y)) => Built::Scalar(op(x, y)),
        // A side with no iterator at this variable is added into every case
        // of the other side.
        (Built::Scalar(x), Built::Lattice(points)) => Built::Lattice(
            points
                .into_iter()
                .map(|p| MergeLatticePoint::new(p.range, p.locate, op(x.clone(), p.expr)))
                .collect(),
        ),
        (Built::Lattice(points), Built::Scalar(y)) => Built::Lattice(
            points
                .into_iter()
                .map(|p| MergeLatticePoint::new(p.range, p.locate, op(p.expr, y.clone())))
                .collect(),
        ),
        (Built::Lattice(pa), Built::Lattice(pb)) => {
            let mut points = vec![];
            for a in &pa {
                for b in &pb {
                    let mut range = union(&a.range, &b.range);
                    let mut locate = union(&a.locate, &b.locate);
                    split_locatable(&mut range, &mut locate, iterators, true);
                    points.push(MergeLatticePoint::new(
                        range,
                        locate,
                        op(a.expr.clone(), b.expr.clone()),
                    ));
                }
            }
            points.extend(pa.iter().cloned());
            for b in &pb {
                let expr = if negate_right_only {
                    IndexExpr::neg(b.expr.clone())
                } else {
                    b.expr.clone()
                };
                points.push(MergeLatticePoint::new(
                    b.range.clone(),
                    b.locate.clone(),
                    expr,
                ));
            }
            Built::Lattice(canonicalize(points, iterators))
        }
    }
}

fn union(a: &[TensorPathStep], b: &[TensorPathStep]) -> Steps {
    let mut out = Steps::from_slice(a);
    for s in b {
        if !out.contains(s) {
            out.push(*s);
        }
    }
    out
}

/// Move locate-capable iterators out of the range set.  In a product any
/// iterator may be located as long as one keeps ranging; in a sum an
/// iterator may only be located if a full iterator remains to range over
/// the whole dimension.
fn split_locatable(
    range: &mut Steps,
    locate: &mut Steps,
    iterators: &Iterators,
    disjunction: bool,
) {
    if disjunction {
        let full_count = range
            .iter()
            .filter(|s| iterators.get(**s).is_full())
            .count();
        if full_count == 0 {
            return;
        }
        let mut kept_full = false;
        let mut n = 0;
        while n < range.len() {
            let it = iterators.get(range[n]);
            if it.is_full() && it.has_locate() {
                if !kept_full {
                    kept_full = true;
                    n += 1;
                } else {
                    locate.push(range.remove(n));
                }
            } else {
                if it.is_full() {
                    kept_full = true;
                }
                n += 1;
            }
        }
    } else {
        let movable: Vec<usize> = range
            .iter()
            .enumerate()
            .filter(|(_, s)| iterators.get(**s).has_locate())
            .map(|(n, _)| n)
            .collect();
        let keep_from = if movable.len() == range.len() { 1 } else { 0 };
        for n in movable.into_iter().skip(keep_from).rev() {
            locate.push(range.remove(n));
        }
    }
}

/// Drop dominated duplicates, and everything after the first point all of
/// whose sequential iterators are full: that point's loop runs the whole
/// dimension, so later (subset) points are unreachable.  A point that
/// merges a sparse iterator with a full one ends when the sparse side
/// exhausts, so its one-sided tails stay.
fn canonicalize(
    points: Vec<MergeLatticePoint>,
    iterators: &Iterators,
) -> Vec<MergeLatticePoint> {
    let mut out: Vec<MergeLatticePoint> = vec![];
    for p in points {
        if out
            .iter()
            .any(|q| q.range == p.range && q.locate == p.locate)
        {
            continue;
        }
        let terminal = !p.range.is_empty()
            && p.range.iter().all(|s| iterators.get(*s).is_full());
        out.push(p);
        if terminal {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Assignment, TensorVar};
    use crate::format::Format;

    fn ivar(name: &str) -> IndexVar {
        IndexVar::new(name)
    }

    fn make_lattice(assign: &Assignment, at: &str) -> (IterationGraph, Iterators, MergeLattice) {
        let graph = IterationGraph::make(assign).unwrap();
        let iterators = Iterators::make(&graph).unwrap();
        let lattice = MergeLattice::make(
            &assign.rhs,
            &ivar(at),
            &graph,
            &iterators,
            &HashSet::new(),
        )
        .unwrap();
        (graph, iterators, lattice)
    }

    #[test]
    fn test_spmv_inner_point_locates_dense_vector() {
        let a = TensorVar::new("a", Format::dense(1)).unwrap();
        let b = TensorVar::new("B", Format::csr()).unwrap();
        let c = TensorVar::new("c", Format::dense(1)).unwrap();
        let (i, j) = (ivar("i"), ivar("j"));
        let assign = Assignment::new(
            crate::ast::Access::new(a, vec![i.clone()]),
            IndexExpr::mul(
                IndexExpr::access(&b, &[i, j.clone()]),
                IndexExpr::access(&c, &[j]),
            ),
        );
        let (_, iterators, lattice) = make_lattice(&assign, "j");

        assert_eq!(lattice.len(), 1);
        let point = &lattice.points()[0];
        assert_eq!(point.range_iterators().len(), 1);
        assert_eq!(point.locate_iterators().len(), 1);
        assert!(!lattice.is_full(&iterators));
    }

    #[test]
    fn test_sparse_add_has_three_points() {
        let a = TensorVar::new("A", Format::csr()).unwrap();
        let b = TensorVar::new("B", Format::csr()).unwrap();
        let c = TensorVar::new("C", Format::csr()).unwrap();
        let (i, j) = (ivar("i"), ivar("j"));
        let assign = Assignment::new(
            crate::ast::Access::new(a, vec![i.clone(), j.clone()]),
            IndexExpr::add(
                IndexExpr::access(&b, &[i.clone(), j.clone()]),
                IndexExpr::access(&c, &[i, j]),
            ),
        );
        let (_, iterators, lattice) = make_lattice(&assign, "j");

        assert_eq!(lattice.len(), 3);
        assert_eq!(lattice.points()[0].range_iterators().len(), 2);
        assert_eq!(lattice.points()[1].range_iterators().len(), 1);
        assert_eq!(lattice.points()[2].range_iterators().len(), 1);
        assert!(!lattice.is_full(&iterators));

        // the pair point's sub-lattice is the whole lattice; a one-sided
        // point's sub-lattice is just itself
        assert_eq!(lattice.sub_lattice(&lattice.points()[0]).len(), 3);
        assert_eq!(lattice.sub_lattice(&lattice.points()[1]).len(), 1);
    }

    #[test]
    fn test_dense_add_collapses_to_one_for_loop() {
        let a = TensorVar::new("a", Format::dense(1)).unwrap();
        let b = TensorVar::new("b", Format::dense(1)).unwrap();
        let c = TensorVar::new("c", Format::dense(1)).unwrap();
        let i = ivar("i");
        let assign = Assignment::new(
            crate::ast::Access::new(a, vec![i.clone()]),
            IndexExpr::add(
                IndexExpr::access(&b, &[i.clone()]),
                IndexExpr::access(&c, &[i]),
            ),
        );
        let (_, iterators, lattice) = make_lattice(&assign, "i");

        // the pair point is full, so the one-sided cases are unreachable
        assert_eq!(lattice.len(), 1);
        assert_eq!(lattice.points()[0].range_iterators().len(), 1);
        assert_eq!(lattice.points()[0].locate_iterators().len(), 1);
        assert!(lattice.is_full(&iterators));
    }

    #[test]
    fn test_sparse_plus_dense_keeps_dense_ranging() {
        let a = TensorVar::new("a", Format::dense(1)).unwrap();
        let b = TensorVar::new("b", Format::sparse_vector()).unwrap();
        let c = TensorVar::new("c", Format::dense(1)).unwrap();
        let i = ivar("i");
        let assign = Assignment::new(
            crate::ast::Access::new(a, vec![i.clone()]),
            IndexExpr::add(
                IndexExpr::access(&b, &[i.clone()]),
                IndexExpr::access(&c, &[i]),
            ),
        );
        let (_, iterators, lattice) = make_lattice(&assign, "i");

        // pair point must range over both: the sparse operand cannot be
        // located, and the dense operand is the only full one.  The pair
        // loop ends when b exhausts, so the tail points stay reachable.
        assert_eq!(lattice.len(), 3);
        assert_eq!(lattice.points()[0].range_iterators().len(), 2);
        assert!(lattice.points()[0].locate_iterators().is_empty());
        assert!(lattice.is_full(&iterators));
    }

    #[test]
    fn test_three_way_sparse_add_is_complete() {
        let a = TensorVar::new("a", Format::sparse_vector()).unwrap();
        let b = TensorVar::new("b", Format::sparse_vector()).unwrap();
        let c = TensorVar::new("c", Format::sparse_vector()).unwrap();
        let d = TensorVar::new("d", Format::sparse_vector()).unwrap();
        let i = ivar("i");
        let assign = Assignment::new(
            crate::ast::Access::new(a, vec![i.clone()]),
            IndexExpr::add(
                IndexExpr::add(
                    IndexExpr::access(&b, &[i.clone()]),
                    IndexExpr::access(&c, &[i.clone()]),
                ),
                IndexExpr::access(&d, &[i]),
            ),
        );
        let (_, _, lattice) = make_lattice(&assign, "i");

        // all non-empty subsets of {b, c, d}
        assert_eq!(lattice.len(), 7);
        assert_eq!(lattice.points()[0].range_iterators().len(), 3);
    }

    #[test]
    fn test_exhausted_access_contributes_identity() {
        let a = TensorVar::new("a", Format::sparse_vector()).unwrap();
        let b = TensorVar::new("b", Format::sparse_vector()).unwrap();
        let c = TensorVar::new("c", Format::sparse_vector()).unwrap();
        let i = ivar("i");
        let b_access = crate::ast::Access::new(b.clone(), vec![i.clone()]);
        let assign = Assignment::new(
            crate::ast::Access::new(a, vec![i.clone()]),
            IndexExpr::add(
                IndexExpr::access(&b, &[i.clone()]),
                IndexExpr::access(&c, &[i]),
            ),
        );
        let graph = IterationGraph::make(&assign).unwrap();
        let iterators = Iterators::make(&graph).unwrap();
        let exhausted: HashSet<Access> = [b_access].into_iter().collect();
        let lattice = MergeLattice::make(
            &assign.rhs,
            &ivar("i"),
            &graph,
            &iterators,
            &exhausted,
        )
        .unwrap();

        // only c remains
        assert_eq!(lattice.len(), 1);
        assert_eq!(lattice.points()[0].range_iterators().len(), 1);
    }
}
