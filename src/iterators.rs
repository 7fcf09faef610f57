// Copyright 2025 The Tensile Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Per-level storage cursors.
//!
//! A `StepIterator` names the IR variables of one tensor path step and
//! knows how to emit the IR fragments that advance, dereference, locate
//! and assemble that level.  It never owns storage.  Methods return
//! `None` when the step contributes no code at that phase.

use std::collections::HashMap;

use crate::ast::IndexVar;
use crate::common::Result;
use crate::format::LevelKind;
use crate::ir::{simplify, CmpOp, Component, Expr, LoopKind, Stmt, Var};
use crate::iteration_graph::{IterationGraph, PathRef, TensorPathStep};
use crate::lower_err;

/// A cursor for one tensor path step.  Which of the capability set
/// `{coord-pos iteration, coord-val iteration, locate, append, insert,
/// unique, full, branchless}` holds is fixed by the level kind.
#[derive(Clone, Debug)]
pub struct StepIterator {
    pub step: TensorPathStep,
    kind: LevelKind,
    tensor: String,
    level: usize,
    ivar: IndexVar,
}

impl StepIterator {
    fn new(step: TensorPathStep, kind: LevelKind, tensor: &str, ivar: &IndexVar) -> Self {
        StepIterator {
            step,
            kind,
            tensor: tensor.to_owned(),
            level: step.level,
            ivar: ivar.clone(),
        }
    }

    pub fn kind(&self) -> LevelKind {
        self.kind
    }

    pub fn tensor(&self) -> &str {
        &self.tensor
    }

    pub fn index_var(&self) -> &IndexVar {
        &self.ivar
    }

    // ------------------------------------------------------------------
    // Capabilities
    // ------------------------------------------------------------------

    pub fn has_coord_pos_iter(&self) -> bool {
        matches!(
            self.kind,
            LevelKind::Compressed { .. } | LevelKind::Fixed { .. }
        )
    }

    pub fn has_coord_val_iter(&self) -> bool {
        self.kind == LevelKind::Dense
    }

    pub fn has_locate(&self) -> bool {
        self.kind == LevelKind::Dense
    }

    pub fn has_append(&self) -> bool {
        matches!(self.kind, LevelKind::Compressed { .. })
    }

    pub fn has_insert(&self) -> bool {
        self.kind == LevelKind::Dense
    }

    pub fn is_unique(&self) -> bool {
        match self.kind {
            LevelKind::Dense => true,
            LevelKind::Compressed { unique } => unique,
            LevelKind::Fixed { .. } => false,
            LevelKind::Offset | LevelKind::Replicated => false,
        }
    }

    pub fn is_full(&self) -> bool {
        self.kind == LevelKind::Dense
    }

    pub fn is_branchless(&self) -> bool {
        matches!(self.kind, LevelKind::Fixed { .. })
    }

    // ------------------------------------------------------------------
    // IR variable bindings
    // ------------------------------------------------------------------

    fn name(&self, suffix: &str) -> String {
        format!("{}{}_{}", self.tensor, self.level + 1, suffix)
    }

    /// The sequential counter: positions for position-iterable levels,
    /// coordinates for dense levels.
    pub fn iterator_var(&self) -> Var {
        if self.has_coord_val_iter() {
            Var::new(format!("{}{}", self.ivar.name(), self.tensor))
        } else {
            Var::new(self.name("pos"))
        }
    }

    /// This step's position variable.
    pub fn pos_var(&self) -> Var {
        Var::new(self.name("pos"))
    }

    /// This step's coordinate variable.
    pub fn idx_var(&self) -> Var {
        Var::new(format!("{}{}", self.ivar.name(), self.tensor))
    }

    /// The variable assigned from a dereference: the coordinate for
    /// position-iterable levels, the position for dense levels.
    pub fn derived_var(&self) -> Var {
        if self.has_coord_val_iter() {
            self.pos_var()
        } else {
            self.idx_var()
        }
    }

    pub fn begin_var(&self) -> Var {
        Var::new(self.name("begin"))
    }

    pub fn end_var(&self) -> Var {
        Var::new(self.name("end"))
    }

    pub fn segend_var(&self) -> Var {
        Var::new(self.name("segend"))
    }

    pub fn valid_var(&self) -> Var {
        Var::new(self.name("valid"))
    }

    fn pos_capacity_var(&self) -> Var {
        Var::new(self.name("pos_capacity"))
    }

    fn idx_capacity_var(&self) -> Var {
        Var::new(self.name("idx_capacity"))
    }

    fn pos_arr(&self) -> Expr {
        Expr::prop(&self.tensor, Component::Pos(self.level))
    }

    fn idx_arr(&self) -> Expr {
        Expr::prop(&self.tensor, Component::Idx(self.level))
    }

    /// The size of the dimension this level stores.
    pub fn size(&self) -> Expr {
        Expr::prop(&self.tensor, Component::Dim(self.level))
    }

    // ------------------------------------------------------------------
    // Advancement
    // ------------------------------------------------------------------

    /// Iteration bounds over this level's positions below `parent_pos`.
    pub fn get_pos_iter(&self, parent_pos: Expr) -> Option<(Option<Stmt>, Expr, Expr)> {
        match self.kind {
            LevelKind::Compressed { .. } => {
                let begin = Expr::load(self.pos_arr(), parent_pos.clone());
                let end = Expr::load(self.pos_arr(), simplify(Expr::add(parent_pos, Expr::Int(1))));
                Some((None, begin, end))
            }
            LevelKind::Fixed { fanout } => {
                let begin = simplify(Expr::mul(parent_pos, Expr::Int(fanout as i64)));
                let end = simplify(Expr::add(begin.clone(), Expr::Int(fanout as i64)));
                Some((None, begin, end))
            }
            _ => None,
        }
    }

    /// Iteration bounds over this level's coordinates.
    pub fn get_coord_iter(&self) -> Option<(Option<Stmt>, Expr, Expr)> {
        match self.kind {
            LevelKind::Dense => Some((None, Expr::Int(0), self.size())),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Dereference
    // ------------------------------------------------------------------

    /// The coordinate stored at `pos`, with a validity predicate.
    pub fn get_pos_access(&self, pos: Expr) -> Option<(Option<Stmt>, Expr, Expr)> {
        match self.kind {
            LevelKind::Compressed { .. } | LevelKind::Fixed { .. } => {
                Some((None, Expr::load(self.idx_arr(), pos), Expr::Bool(true)))
            }
            _ => None,
        }
    }

    /// The position of coordinate `idx` below `parent_pos`, for levels
    /// whose positions are a pure function of the coordinate.
    pub fn get_coord_access(&self, parent_pos: Expr, idx: Expr) -> Option<(Option<Stmt>, Expr, Expr)> {
        match self.kind {
            LevelKind::Dense => {
                let pos = Expr::add(simplify(Expr::mul(parent_pos, self.size())), idx);
                Some((None, simplify(pos), Expr::Bool(true)))
            }
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Random access
    // ------------------------------------------------------------------

    /// Directly compute the position of `idx` below `parent_pos`.  Dense
    /// levels compute it; compressed levels search the sorted segment
    /// (only meaningful once the level's structure exists).
    pub fn get_locate(&self, parent_pos: Expr, idx: Expr) -> Option<(Option<Stmt>, Expr, Expr)> {
        match self.kind {
            LevelKind::Dense => self.get_coord_access(parent_pos, idx),
            LevelKind::Compressed { .. } => {
                let lo = Expr::load(self.pos_arr(), parent_pos.clone());
                let hi = Expr::load(self.pos_arr(), simplify(Expr::add(parent_pos, Expr::Int(1))));
                Some((None, Expr::search(self.idx_arr(), lo, hi, idx), Expr::Bool(true)))
            }
            _ => None,
        }
    }

    /// Advance `segend` past the run of entries equal to `idx`, so a
    /// non-unique level consumes duplicate coordinates as one merged
    /// coordinate.
    pub fn get_dedup_scan(&self, idx: Expr) -> Option<Stmt> {
        if self.is_unique() || !self.has_coord_pos_iter() {
            return None;
        }
        let cond = Expr::and(
            Expr::cmp(
                CmpOp::Lt,
                Expr::Var(self.segend_var()),
                Expr::Var(self.end_var()),
            ),
            Expr::cmp(
                CmpOp::Eq,
                Expr::load(self.idx_arr(), Expr::Var(self.segend_var())),
                idx,
            ),
        );
        Some(Stmt::While {
            cond,
            body: Box::new(Stmt::Assign {
                var: self.segend_var(),
                rhs: Expr::Int(1),
                compound: true,
            }),
        })
    }

    // ------------------------------------------------------------------
    // Assembly hooks
    // ------------------------------------------------------------------

    pub fn get_insert_init_level(&self, _prev_size: Expr, _size: Expr) -> Option<Stmt> {
        None
    }

    pub fn get_insert_init_coords(&self, _begin: Expr, _end: Expr) -> Option<Stmt> {
        None
    }

    /// Dense coordinates are implicit; inserting writes no index data.
    pub fn get_insert_coord(&self, _pos: Expr, _idx: Expr) -> Option<Stmt> {
        None
    }

    pub fn get_insert_finalize_level(&self, _prev_size: Expr, _size: Expr) -> Option<Stmt> {
        None
    }

    pub fn get_append_init_level(&self, prev_size: Expr, _size: Expr, alloc: Expr) -> Option<Stmt> {
        if !self.has_append() {
            return None;
        }
        let pos_cap = self.pos_capacity_var();
        let idx_cap = self.idx_capacity_var();
        Some(Stmt::Block(vec![
            Stmt::decl(pos_cap.clone(), simplify(Expr::add(prev_size, Expr::Int(1)))),
            Stmt::Allocate {
                arr: self.pos_arr(),
                capacity: Expr::Var(pos_cap),
                resize: false,
                zero: true,
            },
            Stmt::decl(idx_cap.clone(), alloc),
            Stmt::Allocate {
                arr: self.idx_arr(),
                capacity: Expr::Var(idx_cap),
                resize: false,
                zero: false,
            },
        ]))
    }

    /// Make room for the `pos` entries of parents in `[begin, end)` and
    /// clear them, so parents the loop nest never visits delimit empty
    /// segments.
    pub fn get_append_init_edges(&self, begin: Expr, end: Expr) -> Option<Stmt> {
        if !self.has_append() {
            return None;
        }
        let pos_cap = self.pos_capacity_var();
        let new_cap = simplify(Expr::mul(
            Expr::Int(2),
            Expr::add(end.clone(), Expr::Int(1)),
        ));
        let grow = Stmt::If {
            cases: vec![(
                Expr::cmp(CmpOp::Lte, Expr::Var(pos_cap.clone()), end.clone()),
                Stmt::Block(vec![
                    Stmt::Allocate {
                        arr: self.pos_arr(),
                        capacity: new_cap.clone(),
                        resize: true,
                        zero: true,
                    },
                    Stmt::assign(pos_cap, new_cap),
                ]),
            )],
            covered: false,
        };
        let p = Var::new(format!("p{}{}", self.tensor, self.level + 1));
        let clear = Stmt::For {
            var: p.clone(),
            begin,
            end,
            kind: LoopKind::Serial,
            body: Box::new(Stmt::store(
                self.pos_arr(),
                Expr::add(Expr::Var(p), Expr::Int(1)),
                Expr::Int(0),
            )),
        };
        Some(Stmt::Block(vec![grow, clear]))
    }

    /// Record coordinate `idx` at position `pos`, growing the coordinate
    /// array by doubling.
    pub fn get_append_coord(&self, pos: Expr, idx: Expr) -> Option<Stmt> {
        if !self.has_append() {
            return None;
        }
        let idx_cap = self.idx_capacity_var();
        let new_cap = simplify(Expr::mul(
            Expr::Int(2),
            Expr::add(pos.clone(), Expr::Int(1)),
        ));
        let grow = Stmt::If {
            cases: vec![(
                Expr::cmp(CmpOp::Lte, Expr::Var(idx_cap.clone()), pos.clone()),
                Stmt::Block(vec![
                    Stmt::Allocate {
                        arr: self.idx_arr(),
                        capacity: new_cap.clone(),
                        resize: true,
                        zero: false,
                    },
                    Stmt::assign(idx_cap, new_cap),
                ]),
            )],
            covered: false,
        };
        Some(Stmt::Block(vec![grow, Stmt::store(self.idx_arr(), pos, idx)]))
    }

    /// Record that the segment below `parent_pos` ends at `end`.
    pub fn get_append_edges(&self, parent_pos: Expr, _begin: Expr, end: Expr) -> Option<Stmt> {
        if !self.has_append() {
            return None;
        }
        Some(Stmt::store(
            self.pos_arr(),
            simplify(Expr::add(parent_pos, Expr::Int(1))),
            end,
        ))
    }

    /// Canonicalize the level.  `coalesce` sorts each segment and combines
    /// duplicate coordinates; it is required at the innermost level, where
    /// the loop nest may emit coordinates out of order.
    pub fn get_append_finalize_level(
        &self,
        prev_size: Expr,
        vals: Option<Expr>,
        coalesce: bool,
    ) -> Option<Stmt> {
        if !self.has_append() {
            return None;
        }
        Some(Stmt::AppendFinalize {
            pos: self.pos_arr(),
            idx: self.idx_arr(),
            vals,
            segments: prev_size,
            coalesce,
        })
    }
}


/// The iterator table: one `StepIterator` per tensor path step, owned here
/// and borrowed by step lookup.
#[derive(Clone, Debug)]
pub struct Iterators {
    map: HashMap<TensorPathStep, StepIterator>,
}

impl Iterators {
    pub fn make(graph: &IterationGraph) -> Result<Iterators> {
        let mut map = HashMap::new();

        let result = graph.result_tensor_path();
        let mut all: Vec<(PathRef, &crate::iteration_graph::TensorPath)> = graph
            .tensor_paths()
            .iter()
            .enumerate()
            .map(|(n, p)| (PathRef::Input(n), p))
            .collect();
        all.push((PathRef::Result, result));

        for (path_ref, path) in all {
            let format = path.access.tensor.format();
            for level in 0..path.len() {
                let kind = format.level(level);
                if matches!(kind, LevelKind::Offset | LevelKind::Replicated) {
                    return lower_err!(
                        NotYetImplemented,
                        format!("level kind {} of tensor {}", kind, path.access.tensor.name())
                    );
                }
                let step = TensorPathStep {
                    path: path_ref,
                    level,
                };
                map.insert(
                    step,
                    StepIterator::new(
                        step,
                        kind,
                        path.access.tensor.name(),
                        &path.variables[level],
                    ),
                );
            }
        }

        Ok(Iterators { map })
    }

    pub fn get(&self, step: TensorPathStep) -> &StepIterator {
        &self.map[&step]
    }

    /// The position expression of a step's parent: the previous step's
    /// position variable, or literal 0 at the path root.
    pub fn parent_pos(&self, iter: &StepIterator) -> Expr {
        if iter.step.level == 0 {
            Expr::Int(0)
        } else {
            let parent = TensorPathStep {
                path: iter.step.path,
                level: iter.step.level - 1,
            };
            Expr::Var(self.get(parent).pos_var())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Access, Assignment, IndexExpr, IndexVar, TensorVar};
    use crate::format::Format;

    fn spmv_iterators() -> (IterationGraph, Iterators) {
        let a = TensorVar::new("a", Format::dense(1)).unwrap();
        let b = TensorVar::new("B", Format::csr()).unwrap();
        let c = TensorVar::new("c", Format::dense(1)).unwrap();
        let (i, j) = (IndexVar::new("i"), IndexVar::new("j"));
        let assign = Assignment::new(
            Access::new(a, vec![i.clone()]),
            IndexExpr::mul(
                IndexExpr::access(&b, &[i, j.clone()]),
                IndexExpr::access(&c, &[j]),
            ),
        );
        let graph = IterationGraph::make(&assign).unwrap();
        let iterators = Iterators::make(&graph).unwrap();
        (graph, iterators)
    }

    #[test]
    fn test_variable_names() {
        let (_, iterators) = spmv_iterators();
        let b1 = iterators.get(TensorPathStep {
            path: PathRef::Input(0),
            level: 1,
        });
        assert_eq!(b1.pos_var().name, "B2_pos");
        assert_eq!(b1.idx_var().name, "jB");
        assert_eq!(b1.iterator_var().name, "B2_pos");
        assert_eq!(b1.derived_var().name, "jB");

        let c0 = iterators.get(TensorPathStep {
            path: PathRef::Input(1),
            level: 0,
        });
        assert_eq!(c0.iterator_var().name, "jc");
        assert_eq!(c0.derived_var().name, "c1_pos");
    }

    #[test]
    fn test_compressed_pos_iter_bounds() {
        let (_, iterators) = spmv_iterators();
        let b1 = iterators.get(TensorPathStep {
            path: PathRef::Input(0),
            level: 1,
        });
        let (prologue, begin, end) = b1.get_pos_iter(Expr::var("B1_pos")).unwrap();
        assert!(prologue.is_none());
        assert_eq!(begin.to_string(), "B2_pos_arr[B1_pos]");
        assert_eq!(end.to_string(), "B2_pos_arr[(B1_pos + 1)]");
    }

    #[test]
    fn test_dense_locate_is_affine() {
        let (_, iterators) = spmv_iterators();
        let a0 = iterators.get(TensorPathStep {
            path: PathRef::Result,
            level: 0,
        });
        let (_, pos, valid) = a0.get_locate(Expr::Int(0), Expr::var("i")).unwrap();
        assert_eq!(pos.to_string(), "i");
        assert!(valid.is_true_literal());
    }

    #[test]
    fn test_capability_matrix() {
        let (_, iterators) = spmv_iterators();
        let b0 = iterators.get(TensorPathStep {
            path: PathRef::Input(0),
            level: 0,
        });
        let b1 = iterators.get(TensorPathStep {
            path: PathRef::Input(0),
            level: 1,
        });
        assert!(b0.is_full() && b0.has_locate() && b0.has_insert());
        assert!(!b1.is_full() && !b1.has_locate() && b1.has_append());
        assert!(b1.is_unique() && !b1.is_branchless());
    }

    #[test]
    fn test_offset_level_is_rejected() {
        let a = TensorVar::new("a", Format::dense(1)).unwrap();
        let b = TensorVar::new("b", Format::new(vec![crate::format::LevelKind::Offset])).unwrap();
        let i = IndexVar::new("i");
        let assign = Assignment::new(
            Access::new(a, vec![i.clone()]),
            IndexExpr::access(&b, &[i]),
        );
        let graph = IterationGraph::make(&assign).unwrap();
        let err = Iterators::make(&graph).unwrap_err();
        assert_eq!(err.code, crate::common::ErrorCode::NotYetImplemented);
    }
}
