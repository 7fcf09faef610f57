// Copyright 2025 The Tensile Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The lowering engine: a recursive descent over the iteration graph that
//! emits one loop nest fragment per index variable, co-iterating sparse
//! operands through merge lattices and assembling the result's index
//! structure as it goes.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::ast::{Access, AssignOp, Assignment, IndexExpr, IndexVar, TensorVar};
use crate::common::Result;
use crate::expr_tools::{
    get_available_expressions, get_sub_expr, lower_to_scalar_expression, replace,
};
use crate::ir::{self, conjunction, simplify, CmpOp, Component, Expr, LoopKind, Stmt};
use crate::iteration_graph::{IterationGraph, PathRef, TensorPathStep};
use crate::iterators::{Iterators, StepIterator};
use crate::merge_lattice::{MergeLattice, MergeLatticePoint};
use crate::{internal_err, lower_err};

/// Initial values-array capacity when assembling and computing in one pass.
pub const DEFAULT_ALLOC_SIZE: i64 = 32;

/// What kind of code to emit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Property {
    /// Emit code that assembles the result's index structure.
    Assemble,
    /// Emit code that computes the result's values.
    Compute,
    /// Force `+=` at the innermost store.
    Accumulate,
    /// Print the emitted function.
    Print,
}

struct Ctx<'a> {
    properties: BTreeSet<Property>,
    graph: &'a IterationGraph,
    iterators: Iterators,
    /// Scalar temporaries introduced by the recursion, by tensor variable.
    temporaries: HashMap<TensorVar, ir::Var>,
    /// The merged coordinate currently bound for each iterator.
    idx_vars: HashMap<TensorPathStep, Expr>,
    vals_capacity: Option<ir::Var>,
}

impl Ctx<'_> {
    fn has(&self, p: Property) -> bool {
        self.properties.contains(&p)
    }

    fn iter(&self, step: TensorPathStep) -> StepIterator {
        self.iterators.get(step).clone()
    }
}

#[derive(Clone)]
struct Target {
    tensor: Expr,
    pos: Option<Expr>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ComputeCase {
    /// The last free variable: recurse for the reductions below, then
    /// compute and store.
    LastFree,
    /// Above the last free variable: hoist available sub-expressions, then
    /// recurse.
    AboveLastFree,
    /// A reduction variable below all free variables: reduce into a scalar
    /// accumulator.
    BelowLastFree,
}

fn get_compute_case(ivar: &IndexVar, graph: &IterationGraph) -> ComputeCase {
    if graph.is_last_free_variable(ivar) {
        ComputeCase::LastFree
    } else if graph.has_free_variable_descendant(ivar) {
        ComputeCase::AboveLastFree
    } else {
        ComputeCase::BelowLastFree
    }
}

/// Dense output positions at the given result variables that some input
/// path can skip must be pre-zeroed.
fn needs_zero_vars(ctx: &Ctx, result_idx_vars: &[IndexVar]) -> bool {
    let result_path = ctx.graph.result_tensor_path();
    for iv in result_idx_vars {
        let level = match result_path.level_of(iv) {
            Some(l) => l,
            None => continue,
        };
        let step = TensorPathStep {
            path: PathRef::Result,
            level,
        };
        if !ctx.iterators.get(step).has_insert() {
            continue;
        }
        for (n, path) in ctx.graph.tensor_paths().iter().enumerate() {
            if let Some(l) = path.level_of(iv) {
                let input = TensorPathStep {
                    path: PathRef::Input(n),
                    level: l,
                };
                if !ctx.iterators.get(input).is_full() {
                    return true;
                }
            }
        }
    }
    false
}

fn needs_zero(ctx: &Ctx) -> bool {
    let vars = &ctx.graph.result_tensor_path().variables;
    match vars.last() {
        None => false,
        Some(innermost) => {
            ctx.graph.has_reduction_variable_ancestor(innermost) || needs_zero_vars(ctx, vars)
        }
    }
}

/// Hoist the sub-expressions of `expr` that only depend on already-visited
/// variables into scalar temporaries, and rewrite `expr` to use them.
fn emit_available_exprs(
    ivar: &IndexVar,
    expr: &IndexExpr,
    ctx: &mut Ctx,
    stmts: &mut Vec<Stmt>,
) -> Result<IndexExpr> {
    let visited = ctx.graph.ancestors(ivar);
    let mut substitutions: HashMap<IndexExpr, IndexExpr> = HashMap::new();
    for (n, avail) in get_available_expressions(expr, &visited).into_iter().enumerate() {
        let name = if n == 0 {
            format!("t{}", ivar.name())
        } else {
            format!("t{}{}", ivar.name(), n + 1)
        };
        let t = TensorVar::scalar(&name);
        let t_var = ir::Var::new(name);
        let value =
            lower_to_scalar_expression(&avail, &ctx.iterators, ctx.graph, &ctx.temporaries)?;
        ctx.temporaries.insert(t.clone(), t_var.clone());
        substitutions.insert(avail, IndexExpr::access(&t, &[]));
        stmts.push(Stmt::decl(t_var, value));
    }
    Ok(replace(expr, &substitutions))
}

/// Emit the store or assignment of the computed value.
fn emit_compute_expr(
    target: &Target,
    ivar: &IndexVar,
    expr: &IndexExpr,
    ctx: &Ctx,
    stmts: &mut Vec<Stmt>,
    accumulate: bool,
    fresh_append: bool,
) -> Result<()> {
    let value = lower_to_scalar_expression(expr, &ctx.iterators, ctx.graph, &ctx.temporaries)?;
    // A freshly appended slot is written exactly once per case fire;
    // duplicate coordinates are combined when the level is finalized.
    let compound =
        (ctx.graph.has_reduction_variable_ancestor(ivar) || accumulate) && !fresh_append;
    match &target.pos {
        Some(pos) => stmts.push(Stmt::Store {
            arr: target.tensor.clone(),
            index: pos.clone(),
            value,
            compound,
        }),
        None => match &target.tensor {
            Expr::Var(var) => stmts.push(Stmt::Assign {
                var: var.clone(),
                rhs: value,
                compound,
            }),
            other => {
                return internal_err!(format!("cannot assign to target {}", other));
            }
        },
    }
    Ok(())
}

/// Decide how the outermost for loop may be scheduled.
fn do_parallelize(ivar: &IndexVar, tensor: &str, ctx: &Ctx) -> LoopKind {
    if !ctx.graph.is_root(ivar)
        || ctx.graph.is_reduction(ivar)
        || ctx.has(Property::Assemble)
    {
        return LoopKind::Serial;
    }

    // every result step must support direct insert, so distinct iterations
    // write disjoint positions
    let result_path = ctx.graph.result_tensor_path();
    for level in 0..result_path.len() {
        let step = TensorPathStep {
            path: PathRef::Result,
            level,
        };
        if !ctx.iterators.get(step).has_insert() {
            return LoopKind::Serial;
        }
    }

    let parallelized = ctx
        .graph
        .tensor_paths()
        .iter()
        .enumerate()
        .find(|(_, p)| p.access.tensor.name() == tensor);
    let (n, path) = match parallelized {
        Some(found) => found,
        None => return LoopKind::Serial,
    };

    if path.len() <= 2 {
        return LoopKind::Static;
    }
    let trailing_full = (1..path.len()).all(|level| {
        let step = TensorPathStep {
            path: PathRef::Input(n),
            level,
        };
        ctx.iterators.get(step).is_full()
    });
    if trailing_full {
        LoopKind::Static
    } else {
        LoopKind::Dynamic
    }
}

/// True iff none of the merged iterators are exhausted.  Full iterators
/// cannot exhaust early; if all are full the first bounds the loop.
fn none_exhausted(range: &[StepIterator]) -> Expr {
    let conds: Vec<Expr> = range
        .iter()
        .filter(|it| !it.is_full())
        .map(|it| {
            Expr::cmp(
                CmpOp::Lt,
                Expr::Var(it.iterator_var()),
                Expr::Var(it.end_var()),
            )
        })
        .collect();
    if conds.is_empty() {
        Expr::cmp(
            CmpOp::Lt,
            Expr::Var(range[0].iterator_var()),
            Expr::Var(range[0].end_var()),
        )
    } else {
        conjunction(conds)
    }
}

fn all_equal_to(iters: &[StepIterator], idx: &Expr) -> Expr {
    conjunction(
        iters
            .iter()
            .map(|it| Expr::cmp(CmpOp::Eq, Expr::Var(it.idx_var()), idx.clone()))
            .collect(),
    )
}

fn all_valid_derefs(iters: &[StepIterator], guarded: &HashSet<TensorPathStep>) -> Expr {
    conjunction(
        iters
            .iter()
            .filter(|it| guarded.contains(&it.step))
            .map(|it| Expr::Var(it.valid_var()))
            .collect(),
    )
}

/// The mask whose i-th bit is set iff the i-th merged iterator is in
/// `selected`.
fn indicator_mask(range: &[StepIterator], selected: &[StepIterator]) -> Expr {
    let mut mask: i64 = 0;
    for (n, it) in range.iter().enumerate() {
        if selected.iter().any(|s| s.step == it.step) {
            mask |= 1 << n;
        }
    }
    Expr::Int(mask)
}

/// `idx := min(iter.idx, ...)`.  With a single iterator its coordinate is
/// the merged coordinate and no variable is introduced.
fn emit_min(ivar: &IndexVar, range: &[StepIterator], stmts: &mut Vec<Stmt>) -> Expr {
    if range.len() == 1 {
        return Expr::Var(range[0].idx_var());
    }
    let k = ir::Var::new(ivar.name());
    stmts.push(Stmt::decl(
        k.clone(),
        Expr::Min(range.iter().map(|it| Expr::Var(it.idx_var())).collect()),
    ));
    Expr::Var(k)
}

/// `(idx, indicator)` where bit i of the indicator is set iff the i-th
/// iterator's coordinate equals the minimum.
fn emit_min_with_indicator(
    ivar: &IndexVar,
    range: &[StepIterator],
    stmts: &mut Vec<Stmt>,
) -> (Expr, Expr) {
    let idx = emit_min(ivar, range, stmts);
    let ind = ir::Var::new(format!("{}_ind", ivar.name()));
    let mut bits: Option<Expr> = None;
    for (n, it) in range.iter().enumerate() {
        let hit = Expr::cast(Expr::cmp(
            CmpOp::Eq,
            Expr::Var(it.idx_var()),
            idx.clone(),
        ));
        let weighted = if n == 0 {
            hit
        } else {
            Expr::mul(hit, Expr::Int(1 << n))
        };
        bits = Some(match bits {
            None => weighted,
            Some(acc) => Expr::add(acc, weighted),
        });
    }
    stmts.push(Stmt::decl(ind.clone(), bits.unwrap()));
    (idx, Expr::Var(ind))
}

/// The accesses whose iterators are exhausted in case `lq` of `lattice`.
fn exhausted_accesses(
    lq: &MergeLatticePoint,
    lattice: &MergeLattice,
    graph: &IterationGraph,
    inherited: &HashSet<Access>,
) -> HashSet<Access> {
    let live: HashSet<&Access> = lq
        .iterators()
        .into_iter()
        .map(|s| &graph.path(s.path).access)
        .collect();
    let mut out = inherited.clone();
    for access in lattice.accesses(graph) {
        if !live.contains(access) {
            out.insert(access.clone());
        }
    }
    out
}

/// Assemble the case chain: a lone literal-true case is emitted bare, a
/// literal-true case becomes the else branch, and otherwise a switch is
/// used when an indicator is available.
fn create_if_statements(
    cases: Vec<(Expr, Stmt)>,
    lattice: &MergeLattice,
    switch_control: Option<Expr>,
    iterators: &Iterators,
) -> Result<Stmt> {
    if cases.len() == 1 && cases[0].0.is_true_literal() {
        return Ok(cases.into_iter().next().unwrap().1);
    }

    let mut if_cases: Vec<(Expr, Stmt)> = vec![];
    let mut else_case: Option<(Expr, Stmt)> = None;
    for case in cases {
        if case.0.is_true_literal() {
            if else_case.is_some() {
                return internal_err!("there should only be one true case");
            }
            else_case = Some(case);
        } else {
            if_cases.push(case);
        }
    }

    if let Some(e) = else_case {
        if_cases.push(e);
        return Ok(Stmt::If {
            cases: if_cases,
            covered: true,
        });
    }

    match switch_control {
        Some(control) => Ok(Stmt::Switch {
            control,
            cases: if_cases,
        }),
        None => Ok(Stmt::If {
            cases: if_cases,
            covered: lattice.is_full(iterators),
        }),
    }
}

/// Lower one index variable: build its merge lattice, then emit one loop
/// per lattice point with one guarded case per sub-lattice point.
fn lower_index_var(
    target: &Target,
    ivar: &IndexVar,
    index_expr: &IndexExpr,
    exhausted: &HashSet<Access>,
    ctx: &mut Ctx,
) -> Result<Vec<Stmt>> {
    let lattice = MergeLattice::make(index_expr, ivar, ctx.graph, &ctx.iterators, exhausted)?;
    let lattice_range: Vec<StepIterator> = lattice
        .range_iterators()
        .into_iter()
        .map(|s| ctx.iter(s))
        .collect();
    if lattice_range.is_empty() {
        return internal_err!(format!("no range iterators for {}", ivar));
    }

    let result_path = ctx.graph.result_tensor_path();
    let result_iterator: Option<StepIterator> = result_path.level_of(ivar).map(|level| {
        ctx.iter(TensorPathStep {
            path: PathRef::Result,
            level,
        })
    });

    let accumulate = ctx.has(Property::Accumulate);
    let emit_compute = ctx.has(Property::Compute);
    let emit_assemble = ctx.has(Property::Assemble);

    // When computing against an already-assembled structure, appended
    // result levels are positioned by segment search instead of sequential
    // increment, so revisited coordinates land on their assembled slot.
    let result_located = emit_compute
        && !emit_assemble
        && result_iterator
            .as_ref()
            .map(|r| r.has_append())
            .unwrap_or(false);

    // Merge loops are needed to co-iterate two or more operands and to
    // deduplicate non-unique levels.
    let emit_merge = lattice_range.len() > 1 || !lattice_range[0].is_unique();

    let mut code: Vec<Stmt> = vec![];

    // Initialize iteration bounds, e.g. `B2_pos = B2_pos_arr[B1_pos]`.
    let mut iter_begin = Expr::Int(0);
    let mut iter_end = Expr::Int(0);
    for it in &lattice_range {
        let (prologue, begin, end) = if it.has_coord_pos_iter() {
            match it.get_pos_iter(ctx.iterators.parent_pos(it)) {
                Some(parts) => parts,
                None => return internal_err!("position-iterable level without bounds"),
            }
        } else {
            match it.get_coord_iter() {
                Some(parts) => parts,
                None => return internal_err!("iterator is neither pos nor coord iterable"),
            }
        };
        if let Some(p) = prologue {
            code.push(p);
        }
        if emit_merge {
            code.push(Stmt::decl(it.iterator_var(), begin.clone()));
            code.push(Stmt::decl(it.end_var(), end.clone()));
        }
        iter_begin = begin;
        iter_end = end;
    }

    // Result initialization at this level.
    if emit_assemble {
        if let Some(res) = &result_iterator {
            if res.has_append() && !res.is_branchless() {
                code.push(Stmt::decl(res.begin_var(), Expr::Var(res.pos_var())));
            }

            let parent_appends = res.step.level > 0
                && ctx
                    .iter(TensorPathStep {
                        path: PathRef::Result,
                        level: res.step.level - 1,
                    })
                    .has_append();
            if parent_appends || res.step.level == 0 {
                let mut init_begin = ctx.iterators.parent_pos(res);
                let mut init_end = simplify(Expr::add(init_begin.clone(), Expr::Int(1)));

                // Walk down through directly-addressed levels; they only
                // scale the position range.
                let mut level = res.step.level;
                let mut cursor: Option<StepIterator> = Some(res.clone());
                while cursor.as_ref().map(|c| c.has_insert()).unwrap_or(false) {
                    let it = cursor.take().unwrap();
                    init_begin = simplify(Expr::mul(init_begin, it.size()));
                    init_end = simplify(Expr::mul(init_end, it.size()));
                    if let Some(s) = it.get_insert_init_coords(init_begin.clone(), init_end.clone())
                    {
                        code.push(s);
                    }
                    if level + 1 < result_path.len() {
                        level += 1;
                        cursor = Some(ctx.iter(TensorPathStep {
                            path: PathRef::Result,
                            level,
                        }));
                    }
                }

                match cursor {
                    Some(next) => {
                        if let Some(s) =
                            next.get_append_init_edges(init_begin.clone(), init_end.clone())
                        {
                            code.push(s);
                        }
                    }
                    None if emit_compute && res.step.level != 0 => {
                        // A dense suffix hanging off an appended level:
                        // size the values array for the new block and zero
                        // it if the loop nest can skip positions.
                        if let Some(cap) = ctx.vals_capacity.clone() {
                            let new_capacity =
                                simplify(Expr::mul(Expr::Int(2), init_end.clone()));
                            code.push(Stmt::If {
                                cases: vec![(
                                    Expr::cmp(
                                        CmpOp::Lte,
                                        Expr::Var(cap.clone()),
                                        init_end.clone(),
                                    ),
                                    Stmt::Block(vec![
                                        Stmt::Allocate {
                                            arr: target.tensor.clone(),
                                            capacity: new_capacity.clone(),
                                            resize: true,
                                            zero: false,
                                        },
                                        Stmt::assign(cap, new_capacity),
                                    ]),
                                )],
                                covered: false,
                            });
                        }
                        let next_vars = &result_path.variables[res.step.level..];
                        if needs_zero_vars(ctx, next_vars) {
                            let p = ir::Var::new(format!(
                                "p{}",
                                result_path.access.tensor.name()
                            ));
                            code.push(Stmt::For {
                                var: p.clone(),
                                begin: init_begin.clone(),
                                end: init_end.clone(),
                                kind: LoopKind::Serial,
                                body: Box::new(Stmt::store(
                                    target.tensor.clone(),
                                    Expr::Var(p),
                                    Expr::Float(0.0),
                                )),
                            });
                        }
                    }
                    None => {}
                }
            }
        }
    }

    // One loop per lattice point.
    let mut loops: Vec<Stmt> = vec![];
    for lp in lattice.points() {
        let lp_lattice = lattice.sub_lattice(lp);
        let lp_range: Vec<StepIterator> = lp
            .range_iterators()
            .iter()
            .map(|s| ctx.iter(*s))
            .collect();
        let lp_locate: Vec<StepIterator> = lp
            .locate_iterators()
            .iter()
            .map(|s| ctx.iter(*s))
            .collect();

        let mut loop_body: Vec<Stmt> = vec![];
        let mut guarded: HashSet<TensorPathStep> = HashSet::new();

        // Sequential coordinate initialization, e.g. `kB = B2_idx_arr[B2_pos]`.
        for it in &lp_range {
            let (prologue, deref, valid) = if it.has_coord_pos_iter() {
                match it.get_pos_access(Expr::Var(it.pos_var())) {
                    Some(parts) => parts,
                    None => return internal_err!("missing position access"),
                }
            } else {
                match it.get_coord_access(ctx.iterators.parent_pos(it), Expr::Var(it.idx_var()))
                {
                    Some(parts) => parts,
                    None => return internal_err!("missing coordinate access"),
                }
            };
            if let Some(p) = prologue {
                loop_body.push(p);
            }
            loop_body.push(Stmt::decl(it.derived_var(), simplify(deref)));
            if !valid.is_true_literal() {
                loop_body.push(Stmt::decl(it.valid_var(), valid));
                guarded.insert(it.step);
            }
        }

        let mut merge_code: Vec<Stmt> = vec![];

        // With more than two merged operands and a complete sub-lattice a
        // single indicator drives a switch instead of nested conditionals.
        let merge_with_switch = lp_range.len() > 2
            && lp_range.len() <= 63
            && lp_lattice.len() == (1usize << lp_range.len()) - 1;

        let (idx, indicator) = if merge_with_switch {
            let (idx, ind) = emit_min_with_indicator(ivar, &lp_range, &mut merge_code);
            (idx, Some(ind))
        } else {
            (emit_min(ivar, &lp_range, &mut merge_code), None)
        };

        // Associate the merged coordinate with every participating
        // iterator, including the result's.
        for step in lp.iterators() {
            ctx.idx_vars.insert(step, idx.clone());
        }
        if let Some(res) = &result_iterator {
            ctx.idx_vars.insert(res.step, idx.clone());
        }

        // Random-access positions, e.g. `c1_pos = k`.
        let mut located: Vec<(StepIterator, bool)> =
            lp_locate.iter().map(|it| (it.clone(), false)).collect();
        if let Some(res) = &result_iterator {
            if res.has_insert() || result_located {
                located.push((res.clone(), true));
            }
        }
        for (it, is_result) in located {
            let (prologue, deref, valid) =
                match it.get_locate(ctx.iterators.parent_pos(&it), idx.clone()) {
                    Some(parts) => parts,
                    None => return internal_err!("iterator does not support locate"),
                };
            if let Some(p) = prologue {
                merge_code.push(p);
            }
            merge_code.push(Stmt::decl(it.pos_var(), simplify(deref)));
            if !valid.is_true_literal() && !is_result {
                merge_code.push(Stmt::decl(it.valid_var(), valid));
                guarded.insert(it.step);
            }
        }

        // Duplicate scanning for non-unique levels.
        for it in &lp_range {
            if it.has_coord_pos_iter() && !it.is_unique() {
                merge_code.push(Stmt::decl(
                    it.segend_var(),
                    Expr::add(Expr::Var(it.pos_var()), Expr::Int(1)),
                ));
                if let Some(scan) = it.get_dedup_scan(idx.clone()) {
                    merge_code.push(scan);
                }
            }
        }

        // Values-array growth when assembling and computing in one pass
        // and the innermost result level appends.
        let maybe_resize: Option<Stmt> = match (&result_iterator, &ctx.vals_capacity) {
            (Some(res), Some(cap))
                if emit_compute
                    && emit_assemble
                    && res.has_append()
                    && res.step.level + 1 == result_path.len() =>
            {
                let new_end = Expr::add(Expr::Var(res.pos_var()), Expr::Int(1));
                let new_capacity = Expr::mul(Expr::Int(2), new_end.clone());
                Some(Stmt::If {
                    cases: vec![(
                        Expr::cmp(CmpOp::Lte, Expr::Var(cap.clone()), new_end),
                        Stmt::Block(vec![
                            Stmt::Allocate {
                                arr: target.tensor.clone(),
                                capacity: new_capacity.clone(),
                                resize: true,
                                zero: false,
                            },
                            Stmt::assign(cap.clone(), new_capacity),
                        ]),
                    )],
                    covered: false,
                })
            }
            _ => None,
        };
        if let Some(resize) = &maybe_resize {
            if lp_lattice.len() > 1 {
                merge_code.push(resize.clone());
            }
        }

        // One case per point of the sub-lattice rooted at lp.
        let mut cases: Vec<(Expr, Stmt)> = vec![];
        for lq in lp_lattice.points() {
            let lq_range: Vec<StepIterator> = lq
                .range_iterators()
                .iter()
                .map(|s| ctx.iter(*s))
                .collect();
            let lq_locate: Vec<StepIterator> = lq
                .locate_iterators()
                .iter()
                .map(|s| ctx.iter(*s))
                .collect();

            let mut lq_expr = lq.expr().clone();
            let case_exhausted = exhausted_accesses(lq, &lattice, ctx.graph, exhausted);

            let mut case_body: Vec<Stmt> = vec![];
            if let Some(resize) = &maybe_resize {
                if lp_lattice.len() == 1 {
                    case_body.push(resize.clone());
                }
            }

            let ivar_case = get_compute_case(ivar, ctx.graph);

            if emit_compute && ivar_case == ComputeCase::AboveLastFree {
                lq_expr = emit_available_exprs(ivar, &lq_expr, ctx, &mut case_body)?;
            }

            // Recurse on the iteration graph children.  At or below the
            // last free variable each child's sub-expression reduces into
            // a scalar temporary that replaces it in this level's
            // expression.
            for child in ctx.graph.children(ivar).to_vec() {
                let mut child_expr = lq_expr.clone();
                let mut child_target = target.clone();
                if ivar_case != ComputeCase::AboveLastFree {
                    match get_sub_expr(&lq_expr, &ctx.graph.descendants(&child)) {
                        None => continue,
                        Some(sub) => {
                            let t = TensorVar::scalar(&format!("t{}", child.name()));
                            let t_var = ir::Var::new(t.name().to_string());
                            ctx.temporaries.insert(t.clone(), t_var.clone());
                            child_target = Target {
                                tensor: Expr::Var(t_var.clone()),
                                pos: None,
                            };
                            if emit_compute {
                                case_body.push(Stmt::decl(t_var, Expr::Float(0.0)));
                            }
                            let substitutions: HashMap<IndexExpr, IndexExpr> =
                                [(sub.clone(), IndexExpr::access(&t, &[]))]
                                    .into_iter()
                                    .collect();
                            lq_expr = replace(&lq_expr, &substitutions);
                            child_expr = sub;
                        }
                    }
                }
                let child_code =
                    lower_index_var(&child_target, &child, &child_expr, &case_exhausted, ctx)?;
                case_body.extend(child_code);
            }

            // Compute and store the result value.
            if emit_compute && ivar_case != ComputeCase::AboveLastFree {
                let fresh_append = emit_assemble
                    && ivar_case == ComputeCase::LastFree
                    && result_iterator
                        .as_ref()
                        .map(|r| r.has_append() && r.step.level + 1 == result_path.len())
                        .unwrap_or(false);
                emit_compute_expr(
                    target,
                    ivar,
                    &lq_expr,
                    ctx,
                    &mut case_body,
                    accumulate,
                    fresh_append,
                )?;
            }

            // Assembly: record the result coordinate and advance its
            // position, fusing any branchless ancestors.
            if let Some(res) = &result_iterator {
                let next_result_iterator: Option<StepIterator> =
                    if ivar_case == ComputeCase::LastFree
                        || res.step.level + 1 >= result_path.len()
                    {
                        None
                    } else {
                        Some(ctx.iter(TensorPathStep {
                            path: PathRef::Result,
                            level: res.step.level + 1,
                        }))
                    };

                let emit_here = next_result_iterator
                    .as_ref()
                    .map(|next| !next.is_branchless())
                    .unwrap_or(true);
                if emit_here {
                    let res_pos = Expr::Var(res.pos_var());
                    let mut assembly: Vec<Stmt> = vec![];

                    if emit_assemble {
                        if res.has_append() {
                            if let Some(s) = res.get_append_coord(res_pos.clone(), idx.clone())
                            {
                                assembly.push(s);
                            }
                        } else if let Some(s) =
                            res.get_insert_coord(res_pos.clone(), idx.clone())
                        {
                            assembly.push(s);
                        }
                    }

                    if res.has_append()
                        && (emit_assemble
                            || (ivar_case == ComputeCase::LastFree && !result_located))
                    {
                        assembly.push(Stmt::assign(
                            res.pos_var(),
                            Expr::add(res_pos.clone(), Expr::Int(1)),
                        ));
                    }

                    // Walk up through branchless ancestors, appending
                    // their coordinate and delimiting the child segment.
                    let mut walker = res.clone();
                    while walker.is_branchless() && walker.step.level > 0 {
                        if emit_assemble && walker.has_append() {
                            let pos = Expr::Var(walker.pos_var());
                            let parent_pos = ctx.iterators.parent_pos(&walker);
                            if let Some(s) = walker.get_append_edges(
                                parent_pos,
                                Expr::sub(pos.clone(), Expr::Int(1)),
                                pos,
                            ) {
                                assembly.push(s);
                            }
                        }
                        walker = ctx.iter(TensorPathStep {
                            path: PathRef::Result,
                            level: walker.step.level - 1,
                        });
                        if emit_assemble && walker.has_append() {
                            let pos = Expr::Var(walker.pos_var());
                            let bound = match ctx.idx_vars.get(&walker.step) {
                                Some(e) => e.clone(),
                                None => idx.clone(),
                            };
                            if let Some(s) = walker.get_append_coord(pos, bound) {
                                assembly.push(s);
                            }
                        }
                        if walker.has_append() {
                            let pos = Expr::Var(walker.pos_var());
                            assembly.push(Stmt::assign(
                                walker.pos_var(),
                                Expr::add(pos.clone(), Expr::Int(1)),
                            ));
                        }
                    }

                    if !assembly.is_empty() {
                        let mut assembled = Stmt::Block(assembly);
                        if let Some(next) = &next_result_iterator {
                            if next.has_append() {
                                // skip empty segments
                                assembled = Stmt::If {
                                    cases: vec![(
                                        Expr::cmp(
                                            CmpOp::Lt,
                                            Expr::Var(next.begin_var()),
                                            Expr::Var(next.pos_var()),
                                        ),
                                        assembled,
                                    )],
                                    covered: false,
                                };
                            }
                        }
                        case_body.push(assembled);
                    }
                }
            }

            // The case fires when every sequential iterator not already
            // the minimum matches the merged coordinate and every guarded
            // dereference is valid.
            let case_iters: Vec<StepIterator> = lq_range
                .iter()
                .filter(|it| Expr::Var(it.idx_var()) != idx)
                .cloned()
                .collect();
            let cond = if merge_with_switch {
                indicator_mask(&lp_range, &case_iters)
            } else {
                simplify(Expr::and(
                    all_equal_to(&case_iters, &idx),
                    all_valid_derefs(&lq_locate, &guarded),
                ))
            };
            cases.push((cond, Stmt::Block(case_body)));
        }
        merge_code.push(create_if_statements(
            cases,
            &lp_lattice,
            indicator.clone(),
            &ctx.iterators,
        )?);

        // Sequential advancement.
        if emit_merge {
            if let Some(ind) = &indicator {
                for (n, it) in lp_range.iter().enumerate() {
                    let hit = Expr::cast(Expr::cmp(
                        CmpOp::Neq,
                        Expr::bit_and(ind.clone(), Expr::Int(1 << n)),
                        Expr::Int(0),
                    ));
                    merge_code.push(Stmt::Assign {
                        var: it.iterator_var(),
                        rhs: hit,
                        compound: true,
                    });
                }
            } else {
                for it in &lp_range {
                    if !it.is_unique() {
                        // consume the whole duplicate run
                        merge_code.push(Stmt::If {
                            cases: vec![(
                                Expr::cmp(CmpOp::Eq, Expr::Var(it.idx_var()), idx.clone()),
                                Stmt::assign(it.iterator_var(), Expr::Var(it.segend_var())),
                            )],
                            covered: false,
                        });
                    } else {
                        let inc = if Expr::Var(it.idx_var()) == idx || it.is_full() {
                            Expr::Int(1)
                        } else {
                            Expr::cast(Expr::cmp(
                                CmpOp::Eq,
                                Expr::Var(it.idx_var()),
                                idx.clone(),
                            ))
                        };
                        merge_code.push(Stmt::Assign {
                            var: it.iterator_var(),
                            rhs: inc,
                            compound: true,
                        });
                    }
                }
            }
        }

        loop_body.extend(merge_code);
        let body = Stmt::Block(loop_body);
        let loop_stmt = if emit_merge {
            Stmt::While {
                cond: none_exhausted(&lp_range),
                body: Box::new(body),
            }
        } else {
            let it = &lp_range[0];
            Stmt::For {
                var: it.iterator_var(),
                begin: iter_begin.clone(),
                end: iter_end.clone(),
                kind: do_parallelize(ivar, it.tensor(), ctx),
                body: Box::new(body),
            }
        };
        loops.push(loop_stmt);
    }
    code.extend(loops);

    // Record the segment boundary, e.g. `A2_pos_arr[A1_pos + 1] = A2_pos`.
    if emit_assemble {
        if let Some(res) = &result_iterator {
            if res.has_append() && !res.is_branchless() {
                let parent_pos = ctx.iterators.parent_pos(res);
                if let Some(s) = res.get_append_edges(
                    parent_pos,
                    Expr::Var(res.begin_var()),
                    Expr::Var(res.pos_var()),
                ) {
                    code.push(s);
                }
            }
        }
    }

    Ok(code)
}

/// Contract checks performed before lowering starts.  A failed check
/// reports why the statement cannot be lowered; lowering itself does not
/// attempt recovery.
pub fn is_lowerable(assignment: &Assignment) -> Result<()> {
    let lhs = &assignment.lhs;
    if lhs.indices.len() != lhs.tensor.order() {
        return lower_err!(OrderMismatch, lhs.tensor.name());
    }
    for (n, iv) in lhs.indices.iter().enumerate() {
        if lhs.indices[..n].contains(iv) {
            return lower_err!(RepeatedResultVariable, iv.name());
        }
    }

    if assignment.rhs.contains_reduction() {
        return lower_err!(
            NonConcreteNotation,
            "reduction nodes must be rewritten away before lowering"
        );
    }

    let rhs_vars = assignment.rhs.index_vars();
    for iv in &lhs.indices {
        if !rhs_vars.contains(iv) {
            return lower_err!(ResultVariableNotInExpression, iv.name());
        }
    }

    for access in assignment.rhs.accesses() {
        if access.indices.len() != access.tensor.order() {
            return lower_err!(OrderMismatch, access.tensor.name());
        }
        for (n, iv) in access.indices.iter().enumerate() {
            if access.indices[..n].contains(iv) {
                return lower_err!(
                    NotYetImplemented,
                    format!("repeated index variable in {}", access)
                );
            }
        }
        if access.tensor.name() == lhs.tensor.name() {
            return lower_err!(
                NotYetImplemented,
                "the result tensor cannot appear on the right-hand side"
            );
        }
    }

    for kind in lhs.tensor.format().levels() {
        match kind {
            crate::format::LevelKind::Dense | crate::format::LevelKind::Compressed { .. } => {}
            other => {
                return lower_err!(UnsupportedResultLevel, format!("{}", other));
            }
        }
    }

    // the loop order must exist
    IterationGraph::make(assignment)?;
    Ok(())
}

/// Lower an assignment to a single IR function.
pub fn lower(
    assignment: &Assignment,
    name: &str,
    properties: &BTreeSet<Property>,
    alloc_size: i64,
) -> Result<ir::Function> {
    is_lowerable(assignment)?;

    let mut properties = properties.clone();
    if assignment.op == AssignOp::AddAssign {
        properties.insert(Property::Accumulate);
    }
    let emit_assemble = properties.contains(&Property::Assemble);
    let emit_compute = properties.contains(&Property::Compute);
    let accumulate = properties.contains(&Property::Accumulate);
    if !emit_assemble && !emit_compute {
        return lower_err!(Generic, "nothing to emit: set Assemble and/or Compute");
    }

    let graph = IterationGraph::make(assignment)?;
    let iterators = Iterators::make(&graph)?;
    let print = properties.contains(&Property::Print);
    let mut ctx = Ctx {
        properties,
        graph: &graph,
        iterators,
        temporaries: HashMap::new(),
        idx_vars: HashMap::new(),
        vals_capacity: None,
    };

    let result_name = assignment.lhs.tensor.name().to_string();
    let mut params: Vec<String> = vec![];
    for access in assignment.rhs.accesses() {
        let tensor_name = access.tensor.name().to_string();
        if !params.contains(&tensor_name) {
            params.push(tensor_name);
        }
    }

    let result_path = graph.result_tensor_path().clone();
    let roots = graph.roots().to_vec();
    let vals = Expr::prop(&result_name, Component::Vals);

    let mut init: Vec<Stmt> = vec![];
    let mut body: Vec<Stmt> = vec![];
    let mut finalize: Vec<Stmt> = vec![];

    if !roots.is_empty() {
        let result_steps: Vec<StepIterator> = (0..result_path.len())
            .map(|level| {
                ctx.iter(TensorPathStep {
                    path: PathRef::Result,
                    level,
                })
            })
            .collect();

        let target = Target {
            tensor: vals.clone(),
            pos: Some(match result_steps.last() {
                Some(last) => Expr::Var(last.pos_var()),
                None => Expr::Int(0),
            }),
        };

        // Initialize result levels.
        let mut prev_sz = Expr::Int(1);
        for it in &result_steps {
            let sz = if it.has_append() {
                Expr::Int(0)
            } else {
                simplify(Expr::mul(prev_sz.clone(), it.size()))
            };
            if emit_assemble {
                let init_level = if it.has_append() {
                    it.get_append_init_level(prev_sz.clone(), sz.clone(), Expr::Int(alloc_size))
                } else {
                    it.get_insert_init_level(prev_sz.clone(), sz.clone())
                };
                if let Some(s) = init_level {
                    init.push(s);
                }
                if it.has_append() {
                    body.push(Stmt::decl(it.pos_var(), Expr::Int(0)));
                }
            }
            prev_sz = sz;
        }

        if emit_compute {
            let sz = if prev_sz == Expr::Int(0) {
                if emit_assemble {
                    Expr::Int(alloc_size)
                } else {
                    Expr::prop(&result_name, Component::ValsSize)
                }
            } else {
                prev_sz.clone()
            };

            if emit_assemble {
                let cap = ir::Var::new(format!("{}_vals_capacity", result_name));
                ctx.vals_capacity = Some(cap.clone());
                init.push(Stmt::decl(cap, sz.clone()));
                init.push(Stmt::Allocate {
                    arr: vals.clone(),
                    capacity: sz.clone(),
                    resize: false,
                    zero: false,
                });
            }

            // A scalar output accumulates reductions directly into
            // vals[0], which therefore starts at zero.
            if !accumulate && result_path.is_empty() {
                body.push(Stmt::store(vals.clone(), Expr::Int(0), Expr::Float(0.0)));
            }

            // Zero the output region the loop nest does not fully cover.
            if !accumulate && needs_zero(&ctx) {
                let topmost_inserts = result_steps
                    .first()
                    .map(|it| it.has_insert())
                    .unwrap_or(false);
                let innermost_appends = result_steps
                    .last()
                    .map(|it| it.has_append())
                    .unwrap_or(false);
                let extent = if innermost_appends {
                    if emit_assemble {
                        // values are written as they are appended
                        None
                    } else {
                        Some(Expr::prop(&result_name, Component::ValsSize))
                    }
                } else {
                    Some(sz)
                };
                if topmost_inserts {
                    if let Some(extent) = extent {
                        let p = ir::Var::new(format!("p{}", result_name));
                        body.push(Stmt::For {
                            var: p.clone(),
                            begin: Expr::Int(0),
                            end: extent,
                            kind: LoopKind::Serial,
                            body: Box::new(Stmt::store(
                                vals.clone(),
                                Expr::Var(p),
                                Expr::Float(0.0),
                            )),
                        });
                    }
                }
            }
        }

        // Lower the loop nest for each iteration graph root.
        for root in &roots {
            let nest = lower_index_var(&target, root, &assignment.rhs, &HashSet::new(), &mut ctx)?;
            body.extend(nest);
        }

        // Finalize result levels.
        if emit_assemble {
            let mut prev_sz = Expr::Int(1);
            for (n, it) in result_steps.iter().enumerate() {
                let innermost = n + 1 == result_steps.len();
                // the canonical count of an appended level is its last
                // position entry, valid once the level is finalized
                let sz = if it.has_append() {
                    Expr::load(
                        Expr::prop(&result_name, Component::Pos(it.step.level)),
                        prev_sz.clone(),
                    )
                } else {
                    simplify(Expr::mul(prev_sz.clone(), it.size()))
                };
                let fin = if it.has_append() {
                    let carried_vals = if emit_compute && innermost {
                        Some(vals.clone())
                    } else {
                        None
                    };
                    it.get_append_finalize_level(prev_sz.clone(), carried_vals, innermost)
                } else {
                    it.get_insert_finalize_level(prev_sz.clone(), sz.clone())
                };
                if let Some(s) = fin {
                    finalize.push(s);
                }
                prev_sz = sz;
            }

            // Size the values array now that the non-zero count is known.
            if !emit_compute {
                finalize.push(Stmt::Allocate {
                    arr: vals.clone(),
                    capacity: prev_sz,
                    resize: false,
                    zero: true,
                });
            }
        }
    } else {
        // Scalar shortcut: no loops, just a store into vals[0].
        if emit_assemble {
            init.push(Stmt::Allocate {
                arr: vals.clone(),
                capacity: Expr::Int(1),
                resize: false,
                zero: true,
            });
        }
        if emit_compute {
            let value = lower_to_scalar_expression(
                &assignment.rhs,
                &ctx.iterators,
                &graph,
                &HashMap::new(),
            )?;
            body.push(Stmt::Store {
                arr: vals.clone(),
                index: Expr::Int(0),
                value,
                compound: accumulate,
            });
        }
    }

    let mut stmts = init;
    stmts.extend(body);
    stmts.extend(finalize);
    let func = ir::Function {
        name: name.to_string(),
        params,
        results: vec![result_name],
        body: Stmt::Block(stmts),
    };
    log::debug!("lowered `{}` into {}", assignment, func.name);
    if print {
        println!("{}", func);
    }
    Ok(func)
}
