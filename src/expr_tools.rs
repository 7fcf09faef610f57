// Copyright 2025 The Tensile Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Index expression analyses used by the lowering recursion: hoisting
//! candidates, per-child sub-expressions, structural substitution, and the
//! terminal step that turns an index expression into a scalar IR
//! expression.

use std::collections::HashMap;

use crate::ast::{IndexExpr, IndexVar, TensorVar};
use crate::common::Result;
use crate::internal_err;
use crate::ir;
use crate::iteration_graph::IterationGraph;
use crate::iterators::Iterators;

/// The maximal sub-expressions of `expr` whose index variables are all in
/// `visited`: they are loop-invariant below the current level and can be
/// hoisted into scalar temporaries.  Pure literals are not worth hoisting.
pub fn get_available_expressions(expr: &IndexExpr, visited: &[IndexVar]) -> Vec<IndexExpr> {
    fn available(expr: &IndexExpr, visited: &[IndexVar]) -> bool {
        expr.index_vars().iter().all(|iv| visited.contains(iv))
    }

    if available(expr, visited) {
        if expr.accesses().is_empty() {
            return vec![];
        }
        return vec![expr.clone()];
    }
    match expr {
        IndexExpr::Access(_) | IndexExpr::Literal(_) => vec![],
        IndexExpr::Neg(a) | IndexExpr::Sqrt(a) | IndexExpr::Reduction(_, a) => {
            get_available_expressions(a, visited)
        }
        IndexExpr::Add(a, b)
        | IndexExpr::Sub(a, b)
        | IndexExpr::Mul(a, b)
        | IndexExpr::Div(a, b) => {
            let mut out = get_available_expressions(a, visited);
            out.extend(get_available_expressions(b, visited));
            out
        }
    }
}

/// The sub-expression to compute in a child recursion: the maximal subtree
/// of `expr` whose accesses involve the child's variables.  A node both of
/// whose operands are involved is taken whole, so the result is always a
/// structural subtree of `expr` and can be substituted back.  Returns
/// `None` when the child contributes nothing to this case.
pub fn get_sub_expr(expr: &IndexExpr, descendants: &[IndexVar]) -> Option<IndexExpr> {
    fn touched(expr: &IndexExpr, descendants: &[IndexVar]) -> bool {
        expr.accesses()
            .iter()
            .any(|a| a.indices.iter().any(|iv| descendants.contains(iv)))
    }

    match expr {
        IndexExpr::Access(_) => {
            if touched(expr, descendants) {
                Some(expr.clone())
            } else {
                None
            }
        }
        IndexExpr::Literal(_) => None,
        IndexExpr::Neg(a) | IndexExpr::Sqrt(a) | IndexExpr::Reduction(_, a) => {
            get_sub_expr(a, descendants)
        }
        IndexExpr::Add(a, b)
        | IndexExpr::Sub(a, b)
        | IndexExpr::Mul(a, b)
        | IndexExpr::Div(a, b) => {
            match (touched(a, descendants), touched(b, descendants)) {
                (true, true) => Some(expr.clone()),
                (true, false) => get_sub_expr(a, descendants),
                (false, true) => get_sub_expr(b, descendants),
                (false, false) => None,
            }
        }
    }
}

/// Structural substitution: every node equal to a key of `substitutions`
/// is replaced by the corresponding value, outermost first.
pub fn replace(expr: &IndexExpr, substitutions: &HashMap<IndexExpr, IndexExpr>) -> IndexExpr {
    if let Some(replacement) = substitutions.get(expr) {
        return replacement.clone();
    }
    match expr {
        IndexExpr::Access(_) | IndexExpr::Literal(_) => expr.clone(),
        IndexExpr::Neg(a) => IndexExpr::neg(replace(a, substitutions)),
        IndexExpr::Sqrt(a) => IndexExpr::sqrt(replace(a, substitutions)),
        IndexExpr::Add(a, b) => {
            IndexExpr::add(replace(a, substitutions), replace(b, substitutions))
        }
        IndexExpr::Sub(a, b) => {
            IndexExpr::sub(replace(a, substitutions), replace(b, substitutions))
        }
        IndexExpr::Mul(a, b) => {
            IndexExpr::mul(replace(a, substitutions), replace(b, substitutions))
        }
        IndexExpr::Div(a, b) => {
            IndexExpr::div(replace(a, substitutions), replace(b, substitutions))
        }
        IndexExpr::Reduction(iv, a) => {
            IndexExpr::Reduction(iv.clone(), Box::new(replace(a, substitutions)))
        }
    }
}

/// Turn an index expression whose accesses are all resolvable at the
/// current loop level into a scalar IR expression: temporaries become
/// their variables, scalar operands read `vals[0]`, and every other access
/// loads its values array at the position of its innermost iterator.
pub fn lower_to_scalar_expression(
    expr: &IndexExpr,
    iterators: &Iterators,
    graph: &IterationGraph,
    temporaries: &HashMap<TensorVar, ir::Var>,
) -> Result<ir::Expr> {
    match expr {
        IndexExpr::Access(access) => {
            if let Some(var) = temporaries.get(&access.tensor) {
                return Ok(ir::Expr::Var(var.clone()));
            }
            let vals = ir::Expr::prop(access.tensor.name(), ir::Component::Vals);
            if access.tensor.is_scalar() {
                return Ok(ir::Expr::load(vals, ir::Expr::Int(0)));
            }
            match graph.path_of(access) {
                Some((path_ref, path)) => {
                    let last = crate::iteration_graph::TensorPathStep {
                        path: path_ref,
                        level: path.len() - 1,
                    };
                    let pos = iterators.get(last).pos_var();
                    Ok(ir::Expr::load(vals, ir::Expr::Var(pos)))
                }
                None => internal_err!(format!("no tensor path for access {}", access)),
            }
        }
        IndexExpr::Literal(v) => Ok(ir::Expr::Float(v.into_inner())),
        IndexExpr::Neg(a) => Ok(ir::Expr::Neg(Box::new(lower_to_scalar_expression(
            a,
            iterators,
            graph,
            temporaries,
        )?))),
        IndexExpr::Sqrt(a) => Ok(ir::Expr::Sqrt(Box::new(lower_to_scalar_expression(
            a,
            iterators,
            graph,
            temporaries,
        )?))),
        IndexExpr::Add(a, b) => Ok(ir::Expr::add(
            lower_to_scalar_expression(a, iterators, graph, temporaries)?,
            lower_to_scalar_expression(b, iterators, graph, temporaries)?,
        )),
        IndexExpr::Sub(a, b) => Ok(ir::Expr::sub(
            lower_to_scalar_expression(a, iterators, graph, temporaries)?,
            lower_to_scalar_expression(b, iterators, graph, temporaries)?,
        )),
        IndexExpr::Mul(a, b) => Ok(ir::Expr::mul(
            lower_to_scalar_expression(a, iterators, graph, temporaries)?,
            lower_to_scalar_expression(b, iterators, graph, temporaries)?,
        )),
        IndexExpr::Div(a, b) => Ok(ir::Expr::div(
            lower_to_scalar_expression(a, iterators, graph, temporaries)?,
            lower_to_scalar_expression(b, iterators, graph, temporaries)?,
        )),
        IndexExpr::Reduction(..) => {
            internal_err!("reduction nodes cannot be lowered to a scalar expression")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Access, Assignment};
    use crate::format::Format;

    fn ivar(name: &str) -> IndexVar {
        IndexVar::new(name)
    }

    fn spgemm_rhs() -> (IndexExpr, IndexExpr, IndexExpr) {
        let b = TensorVar::new("B", Format::csr()).unwrap();
        let c = TensorVar::new("C", Format::csr()).unwrap();
        let (i, j, k) = (ivar("i"), ivar("j"), ivar("k"));
        let b_ik = IndexExpr::access(&b, &[i, k.clone()]);
        let c_kj = IndexExpr::access(&c, &[k, j]);
        (
            IndexExpr::mul(b_ik.clone(), c_kj.clone()),
            b_ik,
            c_kj,
        )
    }

    #[test]
    fn test_available_expressions_at_reduction_level() {
        let (rhs, b_ik, _) = spgemm_rhs();
        // at k, with i and k visited, B(i,k) is available but C(k,j) is not
        let avail = get_available_expressions(&rhs, &[ivar("i"), ivar("k")]);
        assert_eq!(avail, vec![b_ik]);
    }

    #[test]
    fn test_whole_expression_available() {
        let (rhs, _, _) = spgemm_rhs();
        let avail =
            get_available_expressions(&rhs, &[ivar("i"), ivar("j"), ivar("k")]);
        assert_eq!(avail, vec![rhs]);
    }

    #[test]
    fn test_literals_are_not_hoisted() {
        let avail = get_available_expressions(&IndexExpr::literal(2.0), &[ivar("i")]);
        assert!(avail.is_empty());
    }

    #[test]
    fn test_sub_expr_takes_touched_factor() {
        let (rhs, _, c_kj) = spgemm_rhs();
        // only C involves j, so the j-child computes just that factor
        assert_eq!(get_sub_expr(&rhs, &[ivar("j")]), Some(c_kj));
        // both involve k, so the k-child computes the whole product
        assert_eq!(get_sub_expr(&rhs, &[ivar("k"), ivar("j")]), Some(rhs));
    }

    #[test]
    fn test_sub_expr_none_when_untouched() {
        let (rhs, _, _) = spgemm_rhs();
        assert_eq!(get_sub_expr(&rhs, &[ivar("z")]), None);
    }

    #[test]
    fn test_replace_substitutes_subtree() {
        let (rhs, b_ik, c_kj) = spgemm_rhs();
        let t = TensorVar::scalar("tk");
        let t_access = IndexExpr::access(&t, &[]);
        let subs: HashMap<IndexExpr, IndexExpr> =
            [(c_kj, t_access.clone())].into_iter().collect();
        assert_eq!(replace(&rhs, &subs), IndexExpr::mul(b_ik, t_access));
    }

    #[test]
    fn test_scalarize_loads_through_iterators() {
        let a = TensorVar::new("a", Format::dense(1)).unwrap();
        let b = TensorVar::new("B", Format::csr()).unwrap();
        let c = TensorVar::new("c", Format::dense(1)).unwrap();
        let (i, j) = (ivar("i"), ivar("j"));
        let assign = Assignment::new(
            Access::new(a, vec![i.clone()]),
            IndexExpr::mul(
                IndexExpr::access(&b, &[i, j.clone()]),
                IndexExpr::access(&c, &[j]),
            ),
        );
        let graph = IterationGraph::make(&assign).unwrap();
        let iterators = Iterators::make(&graph).unwrap();
        let scalar = lower_to_scalar_expression(
            &assign.rhs,
            &iterators,
            &graph,
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(scalar.to_string(), "(B_vals[B2_pos] * c_vals[c1_pos])");
    }

    #[test]
    fn test_scalarize_prefers_temporaries() {
        let t = TensorVar::scalar("tj");
        let temporaries: HashMap<TensorVar, ir::Var> =
            [(t.clone(), ir::Var::new("tj"))].into_iter().collect();
        let assign_dummy = {
            let a = TensorVar::scalar("a");
            Assignment::new(Access::new(a, vec![]), IndexExpr::access(&t, &[]))
        };
        let graph = IterationGraph::make(&assign_dummy).unwrap();
        let iterators = Iterators::make(&graph).unwrap();
        let scalar = lower_to_scalar_expression(
            &IndexExpr::access(&t, &[]),
            &iterators,
            &graph,
            &temporaries,
        )
        .unwrap();
        assert_eq!(scalar.to_string(), "tj");
    }
}
